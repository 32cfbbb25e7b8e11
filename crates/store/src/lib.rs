//! kwatch store: the synchronized cache.
//!
//! One producer task per kind owns an [`Index`], consumes the source's
//! list+watch stream, and publishes immutable [`CacheSnapshot`]s through an
//! `ArcSwap`. Readers never touch the live index.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use kwatch_core::{ChangeEvent, ResourceIdentity, ResourceKind, ResourceRecord, SyncState, WatchConfig};
use kwatch_kubehub::{RemoteSource, SourceError};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

mod index;
mod producer;

pub use index::{Applied, Index, MAX_TOMBSTONES};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("initial list of {kind} failed")]
    InitialList {
        kind: ResourceKind,
        #[source]
        source: SourceError,
    },
    #[error("{kind} cache not synced within {timeout:?}")]
    SyncTimeout { kind: ResourceKind, timeout: Duration },
    #[error("{kind} cache stopped before it synced")]
    Stopped { kind: ResourceKind },
}

/// Receives every change the cache applies, in apply order.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: ChangeEvent);
}

/// Sink that discards everything; for caches used only as read models.
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn deliver(&self, _event: ChangeEvent) {}
}

/// Immutable view of the index at one epoch.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    pub kind: ResourceKind,
    pub epoch: u64,
    items: FxHashMap<ResourceIdentity, Arc<ResourceRecord>>,
}

impl CacheSnapshot {
    pub fn empty(kind: ResourceKind) -> Self {
        Self { kind, epoch: 0, items: FxHashMap::default() }
    }

    pub fn get(&self, id: &ResourceIdentity) -> Option<Arc<ResourceRecord>> {
        self.items.get(id).cloned()
    }

    /// All records ordered by identity.
    pub fn list(&self) -> Vec<Arc<ResourceRecord>> {
        let mut out: Vec<_> = self.items.values().cloned().collect();
        out.sort_unstable_by(|a, b| a.identity.cmp(&b.identity));
        out
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Producer tuning. Built from [`WatchConfig`] by the binary.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub resync: Option<Duration>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub emit_initial: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self::from(&WatchConfig::default())
    }
}

impl From<&WatchConfig> for CacheOptions {
    fn from(cfg: &WatchConfig) -> Self {
        Self {
            resync: cfg.resync_interval(),
            initial_backoff: cfg.initial_backoff(),
            max_backoff: cfg.max_backoff(),
            emit_initial: cfg.emit_initial,
        }
    }
}

/// Read handle for one kind's cache. Cheap to clone.
#[derive(Clone)]
pub struct CacheHandle {
    kind: ResourceKind,
    snap: Arc<ArcSwap<CacheSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
    sync_rx: watch::Receiver<SyncState>,
}

impl CacheHandle {
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn current(&self) -> Arc<CacheSnapshot> {
        self.snap.load_full()
    }

    pub fn get(&self, id: &ResourceIdentity) -> Option<Arc<ResourceRecord>> {
        self.snap.load().get(id)
    }

    pub fn list(&self) -> Vec<Arc<ResourceRecord>> {
        self.snap.load().list()
    }

    pub fn sync_state(&self) -> SyncState {
        *self.sync_rx.borrow()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_rx.clone()
    }

    /// Block the caller until the cache reports [`SyncState::Synced`].
    pub async fn wait_synced(&self, timeout: Duration) -> Result<(), CacheError> {
        let mut rx = self.sync_rx.clone();
        let res = match tokio::time::timeout(timeout, rx.wait_for(|s| *s == SyncState::Synced)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(CacheError::Stopped { kind: self.kind }),
            Err(_) => Err(CacheError::SyncTimeout { kind: self.kind, timeout }),
        };
        res
    }
}

/// A started cache: read handle plus the producer task.
pub struct RunningCache {
    pub handle: CacheHandle,
    pub task: JoinHandle<()>,
}

/// Perform the initial list, publish it, and spawn the producer task.
///
/// Only a failing initial list is reported; every later source failure is
/// retried inside the producer while the last known state keeps being served.
pub async fn start(
    source: Arc<dyn RemoteSource>,
    opts: CacheOptions,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
) -> Result<RunningCache, CacheError> {
    let kind = source.kind();
    let snap = Arc::new(ArcSwap::from_pointee(CacheSnapshot::empty(kind)));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let (sync_tx, sync_rx) = watch::channel(SyncState::NotSynced);

    let mut producer = producer::Producer {
        source,
        index: Index::new(kind),
        snap: Arc::clone(&snap),
        epoch_tx,
        sync_tx,
        sink,
        backoff: producer::reconnect_backoff(&opts),
        opts,
        cancel,
    };
    let revision = producer.initial_list().await?;
    let task = tokio::spawn(producer.run(revision));

    Ok(RunningCache { handle: CacheHandle { kind, snap, epoch_rx, sync_rx }, task })
}
