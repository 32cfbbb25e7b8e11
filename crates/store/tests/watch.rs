#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kwatch_core::{ChangeEvent, RawDelta, ResourceIdentity, ResourceKind, Revision, SyncState};
use kwatch_kubehub::{DeltaStream, Listing, RemoteSource, ScriptedSource, SourceError};
use kwatch_store::{start, CacheError, CacheOptions, EventSink};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn deploy(name: &str, rv: u64, replicas: u64, ready: u64) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": name, "namespace": "default", "resourceVersion": rv.to_string() },
        "spec": { "replicas": replicas },
        "status": { "readyReplicas": ready }
    })
}

fn web() -> ResourceIdentity {
    ResourceIdentity::namespaced(ResourceKind::Deployment, "default", "web")
}

fn fast_opts() -> CacheOptions {
    CacheOptions {
        resync: None,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        emit_initial: true,
    }
}

struct Recorder(mpsc::UnboundedSender<ChangeEvent>);

#[async_trait]
impl EventSink for Recorder {
    async fn deliver(&self, event: ChangeEvent) {
        let _ = self.0.send(event);
    }
}

fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<ChangeEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Recorder(tx)), rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<ChangeEvent>) -> ChangeEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("sink closed")
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<ChangeEvent>) {
    if let Ok(Some(ev)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
        panic!("unexpected event {ev:?}");
    }
}

#[tokio::test]
async fn initial_list_is_readable_once_synced() {
    let src = ScriptedSource::new(ResourceKind::Deployment);
    src.push_listing(vec![deploy("web", 5, 3, 3), deploy("api", 4, 1, 1)], 5).await;
    let (sink, mut rx) = recorder();
    let cache = start(Arc::new(src.clone()), fast_opts(), sink, CancellationToken::new()).await.unwrap();

    cache.handle.wait_synced(Duration::from_secs(2)).await.unwrap();
    assert_eq!(cache.handle.sync_state(), SyncState::Synced);
    assert_eq!(cache.handle.get(&web()).unwrap().revision, Revision(5));
    assert_eq!(cache.handle.list().len(), 2);

    let first = next_event(&mut rx).await;
    let second = next_event(&mut rx).await;
    assert!(matches!(first, ChangeEvent::Added(_)));
    assert!(matches!(second, ChangeEvent::Added(_)));
    assert_eq!(src.watch_calls().await, vec![Revision(5)]);
}

#[tokio::test]
async fn updates_apply_in_revision_order_and_redeliveries_are_dropped() {
    let src = ScriptedSource::new(ResourceKind::Deployment);
    src.push_listing(vec![deploy("web", 5, 3, 3)], 5).await;
    src.push_session(vec![
        RawDelta::upserted(deploy("web", 6, 3, 2)),
        RawDelta::upserted(deploy("web", 6, 3, 2)),
        RawDelta::upserted(deploy("web", 5, 3, 3)),
        RawDelta::upserted(deploy("web", 7, 5, 2)),
    ])
    .await;
    let (sink, mut rx) = recorder();
    let cache = start(Arc::new(src), fast_opts(), sink, CancellationToken::new()).await.unwrap();

    assert!(matches!(next_event(&mut rx).await, ChangeEvent::Added(_)));
    let revs = [next_event(&mut rx).await.revision(), next_event(&mut rx).await.revision()];
    assert_eq!(revs, [Revision(6), Revision(7)]);
    assert_quiet(&mut rx).await;
    assert_eq!(cache.handle.get(&web()).unwrap().spec["replicas"], 5);
}

#[tokio::test]
async fn dropped_watch_falls_back_to_relist() {
    let src = ScriptedSource::new(ResourceKind::Deployment);
    src.push_listing(vec![deploy("web", 5, 3, 3)], 5).await;
    src.push_broken_session(
        vec![RawDelta::upserted(deploy("web", 7, 5, 3))],
        SourceError::unavailable("connection reset"),
    )
    .await;
    src.push_listing(Vec::new(), 9).await;
    let (sink, mut rx) = recorder();
    let cache = start(Arc::new(src.clone()), fast_opts(), sink, CancellationToken::new()).await.unwrap();

    assert!(matches!(next_event(&mut rx).await, ChangeEvent::Added(_)));
    assert!(matches!(next_event(&mut rx).await, ChangeEvent::Modified { .. }));
    match next_event(&mut rx).await {
        ChangeEvent::Deleted(last) => {
            assert_eq!(last.identity, web());
            assert_eq!(last.revision, Revision(7));
        }
        other => panic!("expected delete, got {other:?}"),
    }
    assert_quiet(&mut rx).await;
    assert!(cache.handle.get(&web()).is_none());
    assert_eq!(src.watch_calls().await, vec![Revision(5), Revision(9)]);
    assert_eq!(src.list_calls().await, 2);
}

#[tokio::test]
async fn expired_watch_relists_without_backoff() {
    let src = ScriptedSource::new(ResourceKind::Deployment);
    src.push_listing(vec![deploy("web", 5, 3, 3)], 5).await;
    src.push_broken_session(Vec::new(), SourceError::Expired(Revision(5))).await;
    src.push_listing(vec![deploy("web", 12, 4, 3)], 12).await;
    let (sink, mut rx) = recorder();
    let opts = CacheOptions { initial_backoff: Duration::from_secs(30), max_backoff: Duration::from_secs(60), ..fast_opts() };
    let _cache = start(Arc::new(src.clone()), opts, sink, CancellationToken::new()).await.unwrap();

    assert!(matches!(next_event(&mut rx).await, ChangeEvent::Added(_)));
    assert_eq!(next_event(&mut rx).await.revision(), Revision(12));
    assert_eq!(src.watch_calls().await, vec![Revision(5), Revision(12)]);
}

#[tokio::test]
async fn malformed_deltas_do_not_stop_the_watch() {
    let src = ScriptedSource::new(ResourceKind::Deployment);
    src.push_listing(Vec::new(), 1).await;
    src.push_session(vec![
        RawDelta::upserted(serde_json::json!({ "metadata": { "name": "x" } })),
        RawDelta::upserted(serde_json::json!([1, 2, 3])),
        RawDelta::upserted(deploy("web", 2, 1, 0)),
    ])
    .await;
    let (sink, mut rx) = recorder();
    let cache = start(Arc::new(src), fast_opts(), sink, CancellationToken::new()).await.unwrap();

    let ev = next_event(&mut rx).await;
    assert_eq!(ev.identity(), &web());
    assert_quiet(&mut rx).await;
    assert_eq!(cache.handle.list().len(), 1);
}

#[tokio::test]
async fn periodic_resync_heals_missed_changes() {
    let src = ScriptedSource::new(ResourceKind::Deployment);
    src.push_listing(vec![deploy("web", 5, 3, 3)], 5).await;
    src.push_listing(vec![deploy("web", 5, 3, 3), deploy("api", 8, 1, 0)], 8).await;
    let (sink, mut rx) = recorder();
    let opts = CacheOptions { resync: Some(Duration::from_millis(50)), ..fast_opts() };
    let cache = start(Arc::new(src.clone()), opts, sink, CancellationToken::new()).await.unwrap();

    assert!(matches!(next_event(&mut rx).await, ChangeEvent::Added(_)));
    match next_event(&mut rx).await {
        ChangeEvent::Added(r) => assert_eq!(r.identity.name, "api"),
        other => panic!("expected add from resync, got {other:?}"),
    }
    // Later resyncs serve the same listing and change nothing.
    assert_quiet(&mut rx).await;
    assert_eq!(cache.handle.list().len(), 2);
    assert!(src.watch_calls().await.contains(&Revision(8)));
}

#[tokio::test]
async fn emit_initial_can_be_disabled() {
    let src = ScriptedSource::new(ResourceKind::Deployment);
    src.push_listing(vec![deploy("web", 5, 3, 3)], 5).await;
    let (sink, mut rx) = recorder();
    let opts = CacheOptions { emit_initial: false, ..fast_opts() };
    let cache = start(Arc::new(src), opts, sink, CancellationToken::new()).await.unwrap();
    cache.handle.wait_synced(Duration::from_secs(2)).await.unwrap();
    assert_quiet(&mut rx).await;
    assert!(cache.handle.get(&web()).is_some());
}

#[tokio::test]
async fn failing_initial_list_is_fatal() {
    let src = ScriptedSource::new(ResourceKind::Deployment);
    src.push_list_error(SourceError::unavailable("no route to host")).await;
    let (sink, _rx) = recorder();
    let err = start(Arc::new(src), fast_opts(), sink, CancellationToken::new()).await.err().unwrap();
    assert!(matches!(err, CacheError::InitialList { kind: ResourceKind::Deployment, .. }));
}

/// Lists fine but never lets a watch open.
struct NoWatch;

#[async_trait]
impl RemoteSource for NoWatch {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Deployment
    }

    async fn list(&self) -> Result<Listing, SourceError> {
        Ok(Listing { items: vec![deploy("web", 5, 3, 3)], revision: Revision(5) })
    }

    async fn watch(&self, _from: Revision) -> Result<DeltaStream, SourceError> {
        Err(SourceError::unavailable("watch refused"))
    }
}

#[tokio::test]
async fn wait_synced_times_out_and_last_state_is_served() {
    let (sink, _rx) = recorder();
    let cache = start(Arc::new(NoWatch), fast_opts(), sink, CancellationToken::new()).await.unwrap();
    let err = cache.handle.wait_synced(Duration::from_millis(80)).await.unwrap_err();
    assert!(matches!(err, CacheError::SyncTimeout { .. }));
    assert_eq!(cache.handle.sync_state(), SyncState::Syncing);
    assert!(cache.handle.get(&web()).is_some());
}

#[tokio::test]
async fn cancellation_stops_the_producer() {
    let src = ScriptedSource::new(ResourceKind::Deployment);
    src.push_listing(vec![deploy("web", 5, 3, 3)], 5).await;
    let live = src.push_live_session().await;
    let (sink, mut rx) = recorder();
    let cancel = CancellationToken::new();
    let cache = start(Arc::new(src), fast_opts(), sink, cancel.clone()).await.unwrap();
    cache.handle.wait_synced(Duration::from_secs(2)).await.unwrap();
    assert!(matches!(next_event(&mut rx).await, ChangeEvent::Added(_)));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), cache.task).await.unwrap().unwrap();
    assert_eq!(cache.handle.sync_state(), SyncState::NotSynced);
    // The watch stream was released with the producer.
    assert!(!live.send(RawDelta::upserted(deploy("web", 6, 3, 3))));
    assert!(cache.handle.get(&web()).is_some());
}

/// Serves one listing at revision 5; each watch yields at most one delta and
/// then ends cleanly, the way a server-side watch timeout does.
#[derive(Default)]
struct TimeoutWatch {
    lists: std::sync::Mutex<usize>,
    watches: std::sync::Mutex<Vec<Revision>>,
}

#[async_trait]
impl RemoteSource for TimeoutWatch {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Deployment
    }

    async fn list(&self) -> Result<Listing, SourceError> {
        *self.lists.lock().unwrap() += 1;
        Ok(Listing { items: vec![deploy("web", 5, 3, 3)], revision: Revision(5) })
    }

    async fn watch(&self, from: Revision) -> Result<DeltaStream, SourceError> {
        self.watches.lock().unwrap().push(from);
        let s = async_stream::stream! {
            if from == Revision(5) {
                yield Ok::<_, SourceError>(RawDelta::upserted(deploy("web", 6, 4, 3)));
            } else {
                futures::future::pending::<()>().await;
            }
        };
        Ok(Box::pin(s))
    }
}

#[tokio::test]
async fn clean_stream_end_reopens_from_last_revision() {
    let src = Arc::new(TimeoutWatch::default());
    let (sink, mut rx) = recorder();
    let _cache = start(src.clone(), fast_opts(), sink, CancellationToken::new()).await.unwrap();

    assert!(matches!(next_event(&mut rx).await, ChangeEvent::Added(_)));
    assert_eq!(next_event(&mut rx).await.revision(), Revision(6));
    tokio::time::timeout(Duration::from_secs(2), async {
        while src.watches.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(*src.watches.lock().unwrap(), [Revision(5), Revision(6)]);
    assert_eq!(*src.lists.lock().unwrap(), 1);
}

/// First list answers; every later list hangs like a stuck API server.
#[derive(Default)]
struct HangingRelist {
    lists: std::sync::Mutex<usize>,
}

#[async_trait]
impl RemoteSource for HangingRelist {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Deployment
    }

    async fn list(&self) -> Result<Listing, SourceError> {
        let n = {
            let mut lists = self.lists.lock().unwrap();
            *lists += 1;
            *lists
        };
        if n > 1 {
            futures::future::pending::<()>().await;
        }
        Ok(Listing { items: vec![deploy("web", 5, 3, 3)], revision: Revision(5) })
    }

    async fn watch(&self, _from: Revision) -> Result<DeltaStream, SourceError> {
        Ok(Box::pin(futures::stream::pending::<Result<RawDelta, SourceError>>()))
    }
}

#[tokio::test]
async fn cancellation_interrupts_a_hanging_resync() {
    let src = Arc::new(HangingRelist::default());
    let (sink, _rx) = recorder();
    let cancel = CancellationToken::new();
    let opts = CacheOptions { resync: Some(Duration::from_millis(20)), ..fast_opts() };
    let cache = start(src.clone(), opts, sink, cancel.clone()).await.unwrap();
    cache.handle.wait_synced(Duration::from_secs(2)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while *src.lists.lock().unwrap() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), cache.task)
        .await
        .expect("producer kept waiting on the resync list")
        .unwrap();
    assert_eq!(cache.handle.sync_state(), SyncState::NotSynced);
}
