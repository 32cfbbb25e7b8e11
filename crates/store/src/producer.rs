//! The single writer of a kind's index: initial list, watch loop, resync, recovery.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::StreamExt;
use kwatch_core::{RawDelta, ResourceRecord, Revision, SyncState};
use kwatch_kubehub::{Listing, RemoteSource, SourceError};
use metrics::counter;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Applied, CacheError, CacheOptions, CacheSnapshot, EventSink, Index};

/// A watch that closes sooner than this without delivering anything counts as broken.
const QUICK_END: Duration = Duration::from_secs(1);

/// Spread of each reconnect delay around its nominal value.
const JITTER: f64 = 0.2;

/// Reconnect schedule: doubling from `initial_backoff` up to `max_backoff`, never giving up.
pub(crate) fn reconnect_backoff(opts: &CacheOptions) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(opts.initial_backoff)
        .with_max_interval(opts.max_backoff.max(opts.initial_backoff))
        .with_multiplier(2.0)
        .with_randomization_factor(JITTER)
        .with_max_elapsed_time(None)
        .build()
}

pub(crate) struct Producer {
    pub(crate) source: Arc<dyn RemoteSource>,
    pub(crate) index: Index,
    pub(crate) snap: Arc<ArcSwap<CacheSnapshot>>,
    pub(crate) epoch_tx: watch::Sender<u64>,
    pub(crate) sync_tx: watch::Sender<SyncState>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) backoff: ExponentialBackoff,
    pub(crate) opts: CacheOptions,
    pub(crate) cancel: CancellationToken,
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl Producer {
    pub(crate) async fn initial_list(&mut self) -> Result<Revision, CacheError> {
        let kind = self.index.kind();
        let listing = self
            .source
            .list()
            .await
            .map_err(|source| CacheError::InitialList { kind, source })?;
        let emit = self.opts.emit_initial;
        let revision = self.reconcile(listing, emit).await;
        self.sync_tx.send_replace(SyncState::Syncing);
        info!(%kind, %revision, items = self.index.len(), "initial list applied");
        Ok(revision)
    }

    pub(crate) async fn run(mut self, mut revision: Revision) {
        let kind = self.index.kind();
        let mut resync = self.opts.resync.map(|every| {
            let mut t = interval_at(Instant::now() + every, every);
            t.set_missed_tick_behavior(MissedTickBehavior::Delay);
            t
        });

        'watch: loop {
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => break 'watch,
                res = self.source.watch(revision) => res,
            };
            let mut stream = match opened {
                Ok(s) => s,
                Err(e) => match self.recover(e).await {
                    Some(rev) => {
                        revision = rev;
                        continue 'watch;
                    }
                    None => break 'watch,
                },
            };
            self.index.prune_tombstones(revision);
            self.mark_synced();
            debug!(%kind, %revision, "watching");

            let opened_at = Instant::now();
            let mut delivered = false;
            let failure = loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break 'watch,
                    _ = next_tick(&mut resync) => {
                        counter!("cache_resyncs", 1u64, "kind" => kind.as_str());
                        let listed = tokio::select! {
                            _ = self.cancel.cancelled() => break 'watch,
                            res = self.source.list() => res,
                        };
                        match listed {
                            Ok(listing) => {
                                revision = self.reconcile(listing, true).await;
                                continue 'watch;
                            }
                            Err(e) => warn!(%kind, error = %e, "periodic resync failed; keeping current watch"),
                        }
                    }
                    next = stream.next() => match next {
                        Some(Ok(delta)) => {
                            delivered = true;
                            self.backoff.reset();
                            if let Some(rev) = self.apply(delta).await {
                                revision = revision.max(rev);
                            }
                        }
                        Some(Err(e)) => break e,
                        None if delivered || opened_at.elapsed() >= QUICK_END => {
                            debug!(%kind, %revision, "watch ended; reopening");
                            continue 'watch;
                        }
                        None => break SourceError::Unavailable("watch closed immediately".into()),
                    },
                }
            };
            drop(stream);
            match self.recover(failure).await {
                Some(rev) => revision = rev,
                None => break,
            }
        }

        self.sync_tx.send_replace(SyncState::NotSynced);
        info!(%kind, "cache producer stopped");
    }

    /// Resolve, apply and forward one delta. Returns the applied revision.
    async fn apply(&mut self, delta: RawDelta) -> Option<Revision> {
        let kind = self.index.kind();
        match self.index.apply(&delta) {
            Ok(Applied::Changed(event)) => {
                counter!("cache_applied", 1u64, "kind" => kind.as_str());
                let rev = event.revision();
                self.publish();
                self.sink.deliver(event).await;
                Some(rev)
            }
            Ok(Applied::Stale) => {
                counter!("cache_stale_dropped", 1u64, "kind" => kind.as_str());
                debug!(%kind, "dropping stale delta");
                None
            }
            Ok(Applied::Absent) => None,
            Err(e) => {
                counter!("cache_malformed_deltas", 1u64, "kind" => kind.as_str());
                warn!(%kind, error = %e, "dropping malformed delta");
                None
            }
        }
    }

    /// Apply a full listing and forward the resulting events.
    async fn reconcile(&mut self, listing: Listing, deliver: bool) -> Revision {
        let kind = self.index.kind();
        let mut records = Vec::with_capacity(listing.items.len());
        for raw in &listing.items {
            match ResourceRecord::from_raw(kind, raw) {
                Ok(rec) => records.push(rec),
                Err(e) => {
                    counter!("cache_malformed_deltas", 1u64, "kind" => kind.as_str());
                    warn!(%kind, error = %e, "dropping malformed list item");
                }
            }
        }
        let newest = records.iter().map(|r| r.revision).max().unwrap_or_default();
        let events = self.index.reconcile(records, listing.revision);
        self.publish();
        debug!(%kind, revision = %listing.revision, changes = events.len(), "listing reconciled");
        if deliver {
            for event in events {
                self.sink.deliver(event).await;
            }
        }
        listing.revision.max(newest)
    }

    /// Back off, then re-list until it succeeds. `None` once cancelled.
    async fn recover(&mut self, err: SourceError) -> Option<Revision> {
        let kind = self.index.kind();
        counter!("cache_watch_restarts", 1u64, "kind" => kind.as_str());
        warn!(%kind, error = %err, "watch failed; re-listing");
        if !matches!(err, SourceError::Expired(_)) {
            let delay = self.next_delay();
            if !self.sleep(delay).await {
                return None;
            }
        }
        loop {
            let listed = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                res = self.source.list() => res,
            };
            match listed {
                Ok(listing) => {
                    counter!("cache_resyncs", 1u64, "kind" => kind.as_str());
                    return Some(self.reconcile(listing, true).await);
                }
                Err(e) => {
                    warn!(%kind, error = %e, "re-list failed; serving last known state");
                    let delay = self.next_delay();
                    if !self.sleep(delay).await {
                        return None;
                    }
                }
            }
        }
    }

    fn next_delay(&mut self) -> Duration {
        self.backoff.next_backoff().unwrap_or(self.opts.max_backoff)
    }

    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn publish(&self) {
        let next = self.index.freeze();
        let epoch = next.epoch;
        self.snap.store(next);
        self.epoch_tx.send_replace(epoch);
    }

    fn mark_synced(&self) {
        if *self.sync_tx.borrow() != SyncState::Synced {
            self.sync_tx.send_replace(SyncState::Synced);
            info!(kind = %self.index.kind(), "cache synced");
        }
    }
}
