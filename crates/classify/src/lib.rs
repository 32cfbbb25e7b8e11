//! kwatch classify: decide whether a change is worth telling anyone about.
//!
//! Added and Deleted always pass. A Modified passes only when the two records
//! still differ after the kind's volatility mask is applied.

#![forbid(unsafe_code)]

use kwatch_core::{ChangeEvent, ResourceKind, ResourceRecord, VolatilityMask, WatchConfig};
use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::trace;

/// Notification policy for one kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifierPolicy {
    /// Forward changes that survive the mask.
    Notify(VolatilityMask),
    /// Keep the kind cached but never notify.
    Silent,
}

impl Default for ClassifierPolicy {
    fn default() -> Self {
        ClassifierPolicy::Notify(VolatilityMask::status_only())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Forward(ChangeEvent),
    Suppressed,
}

impl Verdict {
    pub fn into_event(self) -> Option<ChangeEvent> {
        match self {
            Verdict::Forward(ev) => Some(ev),
            Verdict::Suppressed => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Classifier {
    policies: FxHashMap<ResourceKind, ClassifierPolicy>,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(cfg: &WatchConfig) -> Self {
        let mut c = Self::new();
        for kind in ResourceKind::ALL {
            let policy = if cfg.is_silent(kind) {
                ClassifierPolicy::Silent
            } else {
                ClassifierPolicy::Notify(cfg.mask_for(kind))
            };
            c.register(kind, policy);
        }
        c
    }

    /// Install `policy` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: ResourceKind, policy: ClassifierPolicy) -> &mut Self {
        self.policies.insert(kind, policy);
        self
    }

    pub fn policy(&self, kind: ResourceKind) -> ClassifierPolicy {
        self.policies.get(&kind).cloned().unwrap_or_default()
    }

    /// Whether `old -> new` differs outside the kind's mask.
    pub fn is_significant(&self, old: &ResourceRecord, new: &ResourceRecord) -> bool {
        match self.policies.get(&new.kind()) {
            Some(ClassifierPolicy::Silent) => false,
            Some(ClassifierPolicy::Notify(mask)) => differs(old, new, mask),
            None => differs(old, new, &VolatilityMask::status_only()),
        }
    }

    pub fn classify(&self, event: ChangeEvent) -> Verdict {
        let kind = event.kind();
        if matches!(self.policies.get(&kind), Some(ClassifierPolicy::Silent)) {
            return Verdict::Suppressed;
        }
        match &event {
            ChangeEvent::Added(_) | ChangeEvent::Deleted(_) => Verdict::Forward(event),
            ChangeEvent::Modified { old, new } => {
                if self.is_significant(old, new) {
                    Verdict::Forward(event)
                } else {
                    counter!("classifier_suppressed", 1u64, "kind" => kind.as_str());
                    trace!(%kind, id = %new.identity, revision = %new.revision, "suppressing volatile-only update");
                    Verdict::Suppressed
                }
            }
        }
    }
}

fn differs(old: &ResourceRecord, new: &ResourceRecord, mask: &VolatilityMask) -> bool {
    old.comparison_key(mask) != new.comparison_key(mask)
}
