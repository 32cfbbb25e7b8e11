//! kwatch core types: resource identity, versioned records, change events.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub mod config;
pub mod mask;

pub use config::WatchConfig;
pub use mask::{FieldPath, VolatilityMask};

pub mod prelude {
    pub use super::{
        ChangeEvent, DeltaKind, RawDelta, RecordError, ResourceIdentity, ResourceKind,
        ResourceRecord, Revision, SyncState,
    };
    pub use super::mask::{FieldPath, VolatilityMask};
}

/// The closed set of resource kinds that can be watched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Deployment,
    Pod,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Deployment, ResourceKind::Pod];

    pub fn group(self) -> &'static str {
        match self {
            ResourceKind::Deployment => "apps",
            ResourceKind::Pod => "",
        }
    }

    pub fn version(self) -> &'static str {
        "v1"
    }

    pub fn api_version(self) -> &'static str {
        match self {
            ResourceKind::Deployment => "apps/v1",
            ResourceKind::Pod => "v1",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Deployment => "Deployment",
            ResourceKind::Pod => "Pod",
        }
    }

    /// Upper-case label used on output lines (`DEPLOYMENT CREATED: ...`).
    pub fn label(self) -> &'static str {
        match self {
            ResourceKind::Deployment => "DEPLOYMENT",
            ResourceKind::Pod => "POD",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown resource kind: {0} (expected Deployment or Pod)")]
pub struct UnknownKind(pub String);

impl FromStr for ResourceKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deployment" | "deployments" | "deploy" => Ok(ResourceKind::Deployment),
            "pod" | "pods" | "po" => Ok(ResourceKind::Pod),
            _ => Err(UnknownKind(s.to_string())),
        }
    }
}

/// Stable identity of a watched object. Used as the cache index key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceIdentity {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceIdentity {
    pub fn new(kind: ResourceKind, namespace: Option<&str>, name: &str) -> Self {
        Self { kind, namespace: namespace.map(str::to_string), name: name.to_string() }
    }

    pub fn namespaced(kind: ResourceKind, namespace: &str, name: &str) -> Self {
        Self::new(kind, Some(namespace), name)
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Monotonic revision marker taken from `metadata.resourceVersion`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision(pub u64);

impl Revision {
    pub fn parse(s: &str) -> Option<Self> {
        s.trim().parse::<u64>().ok().map(Revision)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a raw payload could not be turned into a [`ResourceRecord`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("object missing metadata")]
    MissingMetadata,
    #[error("object missing metadata.name")]
    MissingName,
    #[error("object {0} missing metadata.resourceVersion")]
    MissingRevision(String),
    #[error("object {name} has unparseable resourceVersion {value:?}")]
    BadRevision { name: String, value: String },
    #[error("object kind {found} does not match watched kind {expected}")]
    KindMismatch { expected: ResourceKind, found: String },
}

/// One immutable, versioned snapshot of a watched object.
///
/// Records are never mutated once built; the cache replaces them wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub identity: ResourceIdentity,
    pub revision: Revision,
    /// Remaining metadata (labels, annotations, uid, ...) without name/namespace/resourceVersion.
    pub metadata: Map<String, Value>,
    /// Desired state.
    pub spec: Value,
    /// Observed state.
    pub status: Value,
    /// Any other top-level fields (`data`, `binaryData`, ...).
    pub extra: Map<String, Value>,
}

impl ResourceRecord {
    /// Resolve a raw object of the given kind into a typed record.
    pub fn from_raw(kind: ResourceKind, raw: &Value) -> Result<Self, RecordError> {
        let obj = raw.as_object().ok_or(RecordError::NotAnObject)?;
        if let Some(found) = obj.get("kind").and_then(Value::as_str) {
            if found != kind.as_str() {
                return Err(RecordError::KindMismatch { expected: kind, found: found.to_string() });
            }
        }
        let mut metadata = obj
            .get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .ok_or(RecordError::MissingMetadata)?;
        let name = match metadata.remove("name") {
            Some(Value::String(s)) if !s.is_empty() => s,
            _ => return Err(RecordError::MissingName),
        };
        let namespace = match metadata.remove("namespace") {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            _ => None,
        };
        let revision = match metadata.remove("resourceVersion") {
            Some(Value::String(s)) => Revision::parse(&s)
                .ok_or_else(|| RecordError::BadRevision { name: name.clone(), value: s })?,
            Some(other) => {
                return Err(RecordError::BadRevision { name, value: other.to_string() })
            }
            None => return Err(RecordError::MissingRevision(name)),
        };
        #[cfg(feature = "strip-managed-fields")]
        metadata.remove("managedFields");

        let mut extra = Map::new();
        for (k, v) in obj {
            match k.as_str() {
                "apiVersion" | "kind" | "metadata" | "spec" | "status" => {}
                _ => {
                    extra.insert(k.clone(), v.clone());
                }
            }
        }

        Ok(Self {
            identity: ResourceIdentity { kind, namespace, name },
            revision,
            metadata,
            spec: obj.get("spec").cloned().unwrap_or(Value::Null),
            status: obj.get("status").cloned().unwrap_or(Value::Null),
            extra,
        })
    }

    pub fn kind(&self) -> ResourceKind {
        self.identity.kind
    }

    /// Reassemble the full object as it would be served by the source.
    pub fn document(&self) -> Value {
        let mut meta = Map::new();
        meta.insert("name".into(), Value::String(self.identity.name.clone()));
        if let Some(ns) = &self.identity.namespace {
            meta.insert("namespace".into(), Value::String(ns.clone()));
        }
        meta.insert("resourceVersion".into(), Value::String(self.revision.to_string()));
        for (k, v) in &self.metadata {
            meta.insert(k.clone(), v.clone());
        }

        let mut doc = Map::new();
        doc.insert("apiVersion".into(), Value::String(self.kind().api_version().into()));
        doc.insert("kind".into(), Value::String(self.kind().as_str().into()));
        doc.insert("metadata".into(), Value::Object(meta));
        if !self.spec.is_null() {
            doc.insert("spec".into(), self.spec.clone());
        }
        if !self.status.is_null() {
            doc.insert("status".into(), self.status.clone());
        }
        for (k, v) in &self.extra {
            doc.insert(k.clone(), v.clone());
        }
        Value::Object(doc)
    }

    /// The document with `mask` applied. The revision marker is never part of it.
    pub fn comparison_key(&self, mask: &VolatilityMask) -> Value {
        let mut doc = self.document();
        if let Some(meta) = doc.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.remove("resourceVersion");
        }
        mask.apply(&mut doc);
        doc
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Upserted,
    Deleted,
}

/// Untyped change as delivered by a remote source; resolved into a record by the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDelta {
    pub kind: DeltaKind,
    pub raw: Value,
}

impl RawDelta {
    pub fn upserted(raw: Value) -> Self {
        Self { kind: DeltaKind::Upserted, raw }
    }

    pub fn deleted(raw: Value) -> Self {
        Self { kind: DeltaKind::Deleted, raw }
    }
}

/// Classified change produced by the cache for every successful apply.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Added(Arc<ResourceRecord>),
    Modified { old: Arc<ResourceRecord>, new: Arc<ResourceRecord> },
    Deleted(Arc<ResourceRecord>),
}

impl ChangeEvent {
    /// The most recent record carried by the event.
    pub fn record(&self) -> &Arc<ResourceRecord> {
        match self {
            ChangeEvent::Added(r) | ChangeEvent::Deleted(r) => r,
            ChangeEvent::Modified { new, .. } => new,
        }
    }

    pub fn identity(&self) -> &ResourceIdentity {
        &self.record().identity
    }

    pub fn kind(&self) -> ResourceKind {
        self.identity().kind
    }

    pub fn revision(&self) -> Revision {
        self.record().revision
    }

    pub fn verb(&self) -> &'static str {
        match self {
            ChangeEvent::Added(_) => "CREATED",
            ChangeEvent::Modified { .. } => "MODIFIED",
            ChangeEvent::Deleted(_) => "DELETED",
        }
    }
}

/// Whether a watched collection can be trusted yet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    NotSynced,
    Syncing,
    Synced,
}
