use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, WatchEvent, WatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use kwatch_core::{RawDelta, ResourceKind, Revision};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::{DeltaStream, Listing, RemoteSource, SourceError};

/// Server-side watch timeout; the stream ends cleanly after this and gets reopened.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// List+watch against a Kubernetes API server for one kind.
#[derive(Clone)]
pub struct KubeSource {
    api: Api<DynamicObject>,
    kind: ResourceKind,
}

impl KubeSource {
    /// Build a source from the ambient kubeconfig / in-cluster environment.
    pub async fn connect(kind: ResourceKind, namespace: Option<&str>) -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self::with_client(client, kind, namespace))
    }

    pub fn with_client(client: Client, kind: ResourceKind, namespace: Option<&str>) -> Self {
        let gvk = GroupVersionKind::gvk(kind.group(), kind.version(), kind.as_str());
        let ar = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(client, ns, &ar),
            None => Api::all_with(client, &ar),
        };
        Self { api, kind }
    }
}

fn to_raw(kind: ResourceKind, obj: DynamicObject) -> Result<serde_json::Value, SourceError> {
    let mut raw = serde_json::to_value(&obj).map_err(SourceError::unavailable)?;
    // List items come back without type metadata.
    if let Some(map) = raw.as_object_mut() {
        map.entry("apiVersion").or_insert_with(|| kind.api_version().into());
        map.entry("kind").or_insert_with(|| kind.as_str().into());
    }
    Ok(raw)
}

#[async_trait]
impl RemoteSource for KubeSource {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn list(&self) -> Result<Listing, SourceError> {
        let list = self.api.list(&ListParams::default()).await.map_err(|e| {
            counter!("kube_list_errors", 1u64);
            SourceError::unavailable(e)
        })?;
        let revision = list
            .metadata
            .resource_version
            .as_deref()
            .and_then(Revision::parse)
            .unwrap_or_default();
        let mut items = Vec::with_capacity(list.items.len());
        for obj in list.items {
            match to_raw(self.kind, obj) {
                Ok(raw) => items.push(raw),
                Err(e) => warn!(kind = %self.kind, error = %e, "skipping unserializable list item"),
            }
        }
        info!(kind = %self.kind, count = items.len(), %revision, "listed");
        Ok(Listing { items, revision })
    }

    async fn watch(&self, from: Revision) -> Result<DeltaStream, SourceError> {
        let wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let stream = self
            .api
            .watch(&wp, &from.to_string())
            .await
            .map_err(SourceError::unavailable)?;
        let kind = self.kind;
        debug!(%kind, %from, "watch opened");
        let mapped = stream.filter_map(move |ev| async move {
            match ev {
                Ok(WatchEvent::Added(o)) | Ok(WatchEvent::Modified(o)) => {
                    Some(to_raw(kind, o).map(RawDelta::upserted))
                }
                Ok(WatchEvent::Deleted(o)) => Some(to_raw(kind, o).map(RawDelta::deleted)),
                Ok(WatchEvent::Bookmark(_)) => None,
                Ok(WatchEvent::Error(e)) if e.code == 410 => Some(Err(SourceError::Expired(from))),
                Ok(WatchEvent::Error(e)) => Some(Err(SourceError::Unavailable(e.message))),
                Err(e) => Some(Err(SourceError::unavailable(e))),
            }
        });
        Ok(mapped.boxed())
    }
}
