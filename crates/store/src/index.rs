//! Writer-side index. Owned by the producer task; readers only see frozen snapshots.

use std::sync::Arc;

use kwatch_core::{
    ChangeEvent, DeltaKind, RawDelta, RecordError, ResourceIdentity, ResourceKind, ResourceRecord,
    Revision,
};
use rustc_hash::FxHashMap;

use crate::CacheSnapshot;

/// Outcome of applying one delta.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Changed(ChangeEvent),
    /// Revision not newer than what the index already holds (or a known deletion).
    Stale,
    /// Delete for an identity the index never held.
    Absent,
}

/// Tombstones kept between re-lists; past this the oldest half is dropped.
pub const MAX_TOMBSTONES: usize = 4096;

/// Identity -> latest record, with last-write-wins on revision.
pub struct Index {
    kind: ResourceKind,
    epoch: u64,
    items: FxHashMap<ResourceIdentity, Arc<ResourceRecord>>,
    /// Deletion revisions; cleared by every full re-list.
    tombstones: FxHashMap<ResourceIdentity, Revision>,
}

impl Index {
    pub fn new(kind: ResourceKind) -> Self {
        Self { kind, epoch: 0, items: FxHashMap::default(), tombstones: FxHashMap::default() }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &ResourceIdentity) -> Option<&Arc<ResourceRecord>> {
        self.items.get(id)
    }

    /// Resolve and apply a raw delta.
    pub fn apply(&mut self, delta: &RawDelta) -> Result<Applied, RecordError> {
        let rec = ResourceRecord::from_raw(self.kind, &delta.raw)?;
        Ok(match delta.kind {
            DeltaKind::Upserted => self.upsert(rec),
            DeltaKind::Deleted => self.remove(rec),
        })
    }

    pub fn upsert(&mut self, rec: ResourceRecord) -> Applied {
        if let Some(dead) = self.tombstones.get(&rec.identity) {
            if rec.revision <= *dead {
                return Applied::Stale;
            }
        }
        let new = Arc::new(rec);
        match self.items.get(&new.identity) {
            Some(cur) if new.revision <= cur.revision => Applied::Stale,
            Some(cur) => {
                let old = Arc::clone(cur);
                self.items.insert(new.identity.clone(), Arc::clone(&new));
                self.bump();
                Applied::Changed(ChangeEvent::Modified { old, new })
            }
            None => {
                self.tombstones.remove(&new.identity);
                self.items.insert(new.identity.clone(), Arc::clone(&new));
                self.bump();
                Applied::Changed(ChangeEvent::Added(new))
            }
        }
    }

    /// Remove by a delete notification carrying the object's final state.
    pub fn remove(&mut self, rec: ResourceRecord) -> Applied {
        match self.items.get(&rec.identity) {
            Some(cur) if rec.revision < cur.revision => Applied::Stale,
            Some(_) => {
                self.items.remove(&rec.identity);
                self.bury(rec.identity.clone(), rec.revision);
                self.bump();
                Applied::Changed(ChangeEvent::Deleted(Arc::new(rec)))
            }
            None => {
                self.bury(rec.identity, rec.revision);
                Applied::Absent
            }
        }
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Forget deletions at or below `revision`. A watch opened from there
    /// can no longer redeliver anything older.
    pub fn prune_tombstones(&mut self, revision: Revision) {
        self.tombstones.retain(|_, dead| *dead > revision);
    }

    fn bury(&mut self, id: ResourceIdentity, revision: Revision) {
        let dead = self.tombstones.entry(id).or_insert(revision);
        if revision > *dead {
            *dead = revision;
        }
        if self.tombstones.len() > MAX_TOMBSTONES {
            let mut revs: Vec<Revision> = self.tombstones.values().copied().collect();
            let mid = revs.len() / 2;
            let (_, cutoff, _) = revs.select_nth_unstable(mid);
            let cutoff = *cutoff;
            self.tombstones.retain(|_, dead| *dead > cutoff);
        }
    }

    /// Make the index match a full listing taken at `revision`.
    ///
    /// Listed records go through [`Index::upsert`]; cached identities missing
    /// from the listing are removed and reported with their last known record,
    /// unless the cached record is newer than the listing itself. A listing
    /// without a revision (`0`) is taken as complete.
    pub fn reconcile(&mut self, records: Vec<ResourceRecord>, revision: Revision) -> Vec<ChangeEvent> {
        self.tombstones.clear();
        let mut events = Vec::new();
        let mut listed = rustc_hash::FxHashSet::default();
        for rec in records {
            listed.insert(rec.identity.clone());
            if let Applied::Changed(ev) = self.upsert(rec) {
                events.push(ev);
            }
        }
        let unknown = revision == Revision::default();
        let mut gone: Vec<ResourceIdentity> = self
            .items
            .iter()
            .filter(|(id, rec)| !listed.contains(*id) && (unknown || rec.revision <= revision))
            .map(|(id, _)| id.clone())
            .collect();
        gone.sort_unstable();
        for id in gone {
            if let Some(last) = self.items.remove(&id) {
                self.bury(id, revision.max(last.revision));
                events.push(ChangeEvent::Deleted(last));
            }
        }
        if !events.is_empty() {
            self.bump();
        }
        events
    }

    pub fn freeze(&self) -> Arc<CacheSnapshot> {
        Arc::new(CacheSnapshot { kind: self.kind, epoch: self.epoch, items: self.items.clone() })
    }

    fn bump(&mut self) {
        self.epoch = self.epoch.saturating_add(1);
    }
}
