//! kwatch dispatch: fan classified events out to handlers.
//!
//! Each kind gets its own [`KindDispatcher`]; handlers of one kind see events
//! in cache apply order, kinds are independent of each other. A failing or
//! panicking handler is logged and skipped, never propagated.

#![forbid(unsafe_code)]

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::FutureExt;
use kwatch_classify::{Classifier, Verdict};
use kwatch_core::{ChangeEvent, ResourceKind};
use kwatch_diff::DiffError;
use kwatch_store::EventSink;
use metrics::counter;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

mod queue;
mod report;

pub use queue::EventQueue;
pub use report::{LineSink, MemorySink, ReportHandler, WriterSink};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("computing diff")]
    Diff(#[from] DiffError),
    #[error("writing output")]
    Output(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs when the handler fails.
    fn name(&self) -> &str;

    async fn handle(&self, event: &ChangeEvent) -> Result<(), HandlerError>;
}

/// How events reach handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// On the producer task; handler latency throttles ingestion.
    Inline,
    /// Through a bounded drop-oldest queue drained by a dedicated task.
    Queued { capacity: usize },
}

impl DispatchMode {
    /// Capacity 0 means inline delivery.
    pub fn from_capacity(capacity: usize) -> Self {
        if capacity == 0 {
            DispatchMode::Inline
        } else {
            DispatchMode::Queued { capacity }
        }
    }
}

type HandlerList = Arc<ArcSwap<Vec<Arc<dyn EventHandler>>>>;

async fn deliver_all(kind: ResourceKind, handlers: &[Arc<dyn EventHandler>], event: &ChangeEvent) {
    for h in handlers {
        match AssertUnwindSafe(h.handle(event)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                counter!("handler_errors", 1u64, "kind" => kind.as_str());
                warn!(%kind, handler = h.name(), id = %event.identity(), error = ?e, "handler failed");
            }
            Err(_) => {
                counter!("handler_panics", 1u64, "kind" => kind.as_str());
                error!(%kind, handler = h.name(), id = %event.identity(), "handler panicked");
            }
        }
    }
}

/// Delivery for a single kind.
pub struct KindDispatcher {
    kind: ResourceKind,
    handlers: HandlerList,
    queue: Option<Arc<EventQueue>>,
}

impl KindDispatcher {
    pub fn inline(kind: ResourceKind) -> Self {
        Self { kind, handlers: Arc::new(ArcSwap::from_pointee(Vec::new())), queue: None }
    }

    /// Spawn the dispatch task feeding from a bounded queue. The task exits on
    /// `cancel` after finishing the event in flight.
    pub fn queued(kind: ResourceKind, capacity: usize, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let queue = Arc::new(EventQueue::with_capacity(capacity));
        let handlers: HandlerList = Arc::new(ArcSwap::from_pointee(Vec::new()));
        let task = tokio::spawn({
            let queue = Arc::clone(&queue);
            let handlers = Arc::clone(&handlers);
            async move {
                loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => break,
                        ev = queue.next() => ev,
                    };
                    deliver_all(kind, &handlers.load_full(), &event).await;
                }
                debug!(%kind, pending = queue.len(), "dispatch task stopped");
            }
        });
        (Self { kind, handlers, queue: Some(queue) }, task)
    }

    pub fn new(kind: ResourceKind, mode: DispatchMode, cancel: CancellationToken) -> (Self, Option<JoinHandle<()>>) {
        match mode {
            DispatchMode::Inline => (Self::inline(kind), None),
            DispatchMode::Queued { capacity } => {
                let (d, task) = Self::queued(kind, capacity, cancel);
                (d, Some(task))
            }
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Add a handler; it sees every event dispatched from now on.
    pub fn register(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.rcu(|cur| {
            let mut next = Vec::clone(cur);
            next.push(Arc::clone(&handler));
            next
        });
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.load().len()
    }

    /// Events evicted by queue overflow so far.
    pub fn dropped(&self) -> u64 {
        self.queue.as_ref().map(|q| q.dropped()).unwrap_or(0)
    }

    pub async fn dispatch(&self, event: ChangeEvent) {
        match &self.queue {
            None => deliver_all(self.kind, &self.handlers.load_full(), &event).await,
            Some(q) => {
                if let Some(old) = q.push(event) {
                    counter!("dispatch_dropped", 1u64, "kind" => self.kind.as_str());
                    warn!(
                        kind = %self.kind,
                        id = %old.identity(),
                        revision = %old.revision(),
                        capacity = q.capacity(),
                        "dispatch queue full; dropped oldest event"
                    );
                }
            }
        }
    }
}

/// Per-kind dispatchers for every watched kind.
pub struct Dispatcher {
    kinds: FxHashMap<ResourceKind, Arc<KindDispatcher>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new(kinds: &[ResourceKind], mode: DispatchMode, cancel: &CancellationToken) -> Self {
        let mut map = FxHashMap::default();
        let mut tasks = Vec::new();
        for &kind in kinds {
            let (d, task) = KindDispatcher::new(kind, mode, cancel.child_token());
            map.insert(kind, Arc::new(d));
            tasks.extend(task);
        }
        Self { kinds: map, tasks }
    }

    pub fn for_kind(&self, kind: ResourceKind) -> Option<&Arc<KindDispatcher>> {
        self.kinds.get(&kind)
    }

    /// Register `handler` for `kind`. Returns false when the kind is not dispatched.
    pub fn register(&self, kind: ResourceKind, handler: Arc<dyn EventHandler>) -> bool {
        match self.kinds.get(&kind) {
            Some(d) => {
                d.register(handler);
                true
            }
            None => false,
        }
    }

    pub async fn dispatch(&self, event: ChangeEvent) {
        match self.kinds.get(&event.kind()) {
            Some(d) => d.dispatch(event).await,
            None => debug!(kind = %event.kind(), "no dispatcher for kind; event discarded"),
        }
    }

    /// Wait for queued dispatch tasks to finish after cancellation.
    pub async fn join(self) {
        for t in self.tasks {
            if let Err(e) = t.await {
                error!(error = %e, "dispatch task failed");
            }
        }
    }
}

/// Cache sink that classifies each change and dispatches what survives.
pub struct ClassifyingSink {
    classifier: Arc<Classifier>,
    dispatcher: Arc<KindDispatcher>,
}

impl ClassifyingSink {
    pub fn new(classifier: Arc<Classifier>, dispatcher: Arc<KindDispatcher>) -> Self {
        Self { classifier, dispatcher }
    }
}

#[async_trait]
impl EventSink for ClassifyingSink {
    async fn deliver(&self, event: ChangeEvent) {
        if let Verdict::Forward(ev) = self.classifier.classify(event) {
            self.dispatcher.dispatch(ev).await;
        }
    }
}
