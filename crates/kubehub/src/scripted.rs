//! In-memory source driven by a script of listings and watch sessions.
//!
//! Used by tests and local dry runs; behaves like a server whose responses
//! are queued ahead of time or fed live through a [`LiveSession`].

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use kwatch_core::{RawDelta, ResourceKind, Revision};
use tokio::sync::{mpsc, Mutex};

use crate::{DeltaStream, Listing, RemoteSource, SourceError};

enum Session {
    /// Fixed events; the stream stays open afterwards when `hold` is set.
    Fixed { events: Vec<Result<RawDelta, SourceError>>, hold: bool },
    Live(mpsc::UnboundedReceiver<Result<RawDelta, SourceError>>),
    Refuse(SourceError),
}

#[derive(Default)]
struct Script {
    listings: VecDeque<Result<Listing, SourceError>>,
    last_listing: Option<Listing>,
    sessions: VecDeque<Session>,
    list_calls: usize,
    watch_calls: Vec<Revision>,
}

/// Sender side of a live watch session. Dropping it ends the stream,
/// which the cache sees as a dropped connection.
pub struct LiveSession {
    tx: mpsc::UnboundedSender<Result<RawDelta, SourceError>>,
}

impl LiveSession {
    pub fn send(&self, delta: RawDelta) -> bool {
        self.tx.send(Ok(delta)).is_ok()
    }

    pub fn fail(&self, err: SourceError) -> bool {
        self.tx.send(Err(err)).is_ok()
    }
}

#[derive(Clone)]
pub struct ScriptedSource {
    kind: ResourceKind,
    script: Arc<Mutex<Script>>,
}

impl ScriptedSource {
    pub fn new(kind: ResourceKind) -> Self {
        Self { kind, script: Arc::new(Mutex::new(Script::default())) }
    }

    /// Queue the response for the next `list()` call. Once the queue is
    /// drained, the last successful listing keeps being served.
    pub async fn push_listing(&self, items: Vec<serde_json::Value>, revision: u64) {
        self.script.lock().await.listings.push_back(Ok(Listing { items, revision: Revision(revision) }));
    }

    pub async fn push_list_error(&self, err: SourceError) {
        self.script.lock().await.listings.push_back(Err(err));
    }

    /// Queue a watch session that yields `events` and then stays idle.
    pub async fn push_session(&self, events: Vec<RawDelta>) {
        let events = events.into_iter().map(Ok).collect();
        self.script.lock().await.sessions.push_back(Session::Fixed { events, hold: true });
    }

    /// Queue a watch session that yields `events` and then breaks with `err`.
    pub async fn push_broken_session(&self, events: Vec<RawDelta>, err: SourceError) {
        let mut events: Vec<_> = events.into_iter().map(Ok).collect();
        events.push(Err(err));
        self.script.lock().await.sessions.push_back(Session::Fixed { events, hold: false });
    }

    /// Queue a watch session whose events are fed through the returned handle.
    pub async fn push_live_session(&self) -> LiveSession {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script.lock().await.sessions.push_back(Session::Live(rx));
        LiveSession { tx }
    }

    /// Make the next `watch()` call fail to open.
    pub async fn push_watch_refusal(&self, err: SourceError) {
        self.script.lock().await.sessions.push_back(Session::Refuse(err));
    }

    pub async fn list_calls(&self) -> usize {
        self.script.lock().await.list_calls
    }

    /// Start revisions of every watch opened so far.
    pub async fn watch_calls(&self) -> Vec<Revision> {
        self.script.lock().await.watch_calls.clone()
    }
}

#[async_trait]
impl RemoteSource for ScriptedSource {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn list(&self) -> Result<Listing, SourceError> {
        let mut script = self.script.lock().await;
        script.list_calls += 1;
        match script.listings.pop_front() {
            Some(Ok(listing)) => {
                script.last_listing = Some(listing.clone());
                Ok(listing)
            }
            Some(Err(e)) => Err(e),
            None => script
                .last_listing
                .clone()
                .ok_or_else(|| SourceError::Unavailable("no listing scripted".into())),
        }
    }

    async fn watch(&self, from: Revision) -> Result<DeltaStream, SourceError> {
        let mut script = self.script.lock().await;
        script.watch_calls.push(from);
        match script.sessions.pop_front() {
            Some(Session::Fixed { events, hold: true }) => {
                Ok(stream::iter(events).chain(stream::pending()).boxed())
            }
            Some(Session::Fixed { events, hold: false }) => Ok(stream::iter(events).boxed()),
            Some(Session::Live(rx)) => Ok(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed()),
            Some(Session::Refuse(e)) => Err(e),
            None => Ok(stream::pending().boxed()),
        }
    }
}
