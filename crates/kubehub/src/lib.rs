//! kwatch kubehub: the list+watch boundary the cache pulls from.
//!
//! A [`RemoteSource`] hands out raw JSON objects; resolving them into typed
//! records is the cache's job, so a bad payload never poisons the adapter.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use futures::stream::BoxStream;
use kwatch_core::{RawDelta, ResourceKind, Revision};
use thiserror::Error;

mod kube_source;
mod scripted;

pub use kube_source::KubeSource;
pub use scripted::{LiveSession, ScriptedSource};

/// Failures reported by a remote source. Both are recoverable by re-listing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
    /// The watch start revision is too old to resume from (HTTP 410 Gone).
    #[error("watch from revision {0} expired; full re-list required")]
    Expired(Revision),
}

impl SourceError {
    pub fn unavailable(e: impl std::fmt::Display) -> Self {
        SourceError::Unavailable(e.to_string())
    }
}

/// Result of a one-shot full list.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub items: Vec<serde_json::Value>,
    /// Revision of the collection at list time; watches resume from here.
    pub revision: Revision,
}

/// Lazy stream of deltas. It ends or yields an error when the connection breaks.
pub type DeltaStream = BoxStream<'static, Result<RawDelta, SourceError>>;

/// Abstract list+watch capability for a single resource kind.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    fn kind(&self) -> ResourceKind;

    async fn list(&self) -> Result<Listing, SourceError>;

    /// Open a watch delivering every change after `from`.
    async fn watch(&self, from: Revision) -> Result<DeltaStream, SourceError>;
}
