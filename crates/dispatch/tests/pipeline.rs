//! End to end: scripted source -> cache -> classifier -> dispatcher -> report.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kwatch_classify::Classifier;
use kwatch_core::{RawDelta, ResourceIdentity, ResourceKind, Revision, VolatilityMask, WatchConfig};
use kwatch_dispatch::{ClassifyingSink, KindDispatcher, MemorySink, ReportHandler};
use kwatch_kubehub::{ScriptedSource, SourceError};
use kwatch_store::{start, CacheOptions};
use tokio_util::sync::CancellationToken;

fn deploy(rv: u64, replicas: u64, ready: u64) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": "web", "namespace": "default", "resourceVersion": rv.to_string() },
        "spec": { "replicas": replicas },
        "status": { "readyReplicas": ready }
    })
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn watch_session_produces_expected_report() {
    let src = ScriptedSource::new(ResourceKind::Deployment);
    src.push_listing(vec![deploy(5, 3, 3)], 5).await;
    let live = src.push_live_session().await;
    src.push_listing(Vec::new(), 9).await;

    let classifier = Arc::new(Classifier::from_config(&WatchConfig::default()));
    let dispatcher = Arc::new(KindDispatcher::inline(ResourceKind::Deployment));
    let report = Arc::new(
        ReportHandler::new(MemorySink::new()).with_mask(ResourceKind::Deployment, VolatilityMask::status_only()),
    );
    dispatcher.register(report.clone());

    let opts = CacheOptions {
        resync: None,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        emit_initial: true,
    };
    let sink = Arc::new(ClassifyingSink::new(classifier, dispatcher));
    let cancel = CancellationToken::new();
    let cache = start(Arc::new(src), opts, sink, cancel.clone()).await.unwrap();
    let web = ResourceIdentity::namespaced(ResourceKind::Deployment, "default", "web");
    let revision = || cache.handle.get(&web).map(|r| r.revision);

    cache.handle.wait_synced(Duration::from_secs(2)).await.unwrap();
    assert_eq!(report.sink().lines(), ["DEPLOYMENT CREATED: default/web"]);

    // status only: the cache moves on, nothing is reported
    assert!(live.send(RawDelta::upserted(deploy(6, 3, 2))));
    wait_until("revision 6 in cache", || revision() == Some(Revision(6))).await;
    assert_eq!(report.sink().lines(), ["DEPLOYMENT CREATED: default/web"]);

    assert!(live.send(RawDelta::upserted(deploy(7, 5, 2))));
    wait_until("MODIFIED report", || report.sink().lines().iter().any(|l| l.contains("MODIFIED"))).await;
    assert_eq!(revision(), Some(Revision(7)));

    assert!(live.fail(SourceError::unavailable("connection reset")));
    wait_until("DELETED report", || report.sink().lines().iter().any(|l| l.contains("DELETED"))).await;

    let lines = report.sink().lines();
    let headers: Vec<&String> = lines.iter().filter(|l| l.starts_with("DEPLOYMENT ")).collect();
    assert_eq!(
        headers,
        [
            "DEPLOYMENT CREATED: default/web",
            "DEPLOYMENT MODIFIED: default/web",
            "DEPLOYMENT DELETED: default/web",
        ]
    );
    assert!(lines.contains(&"-  replicas: 3".to_string()), "{lines:#?}");
    assert!(lines.contains(&"+  replicas: 5".to_string()), "{lines:#?}");
    assert!(!lines.iter().any(|l| l.contains("readyReplicas")), "{lines:#?}");
    assert_eq!(revision(), None);
    assert!(cache.handle.list().is_empty());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), cache.task).await.unwrap().unwrap();
}
