//! Opaque startup configuration handed to the pipeline.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ResourceKind, VolatilityMask};

fn default_namespace() -> Option<String> {
    Some("default".to_string())
}
fn default_kinds() -> Vec<ResourceKind> {
    vec![ResourceKind::Deployment]
}
fn default_resync_secs() -> u64 {
    10
}
fn default_sync_timeout_secs() -> u64 {
    30
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_true() -> bool {
    true
}

/// Settings for one watch pipeline. Every field has a default so a partial
/// YAML file only overrides what it names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WatchConfig {
    /// Namespace filter; `None` watches all namespaces.
    #[serde(default = "default_namespace")]
    pub namespace: Option<String>,
    #[serde(default = "default_kinds")]
    pub kinds: Vec<ResourceKind>,
    /// Forced full re-list period; 0 disables it.
    #[serde(default = "default_resync_secs")]
    pub resync_secs: u64,
    #[serde(default = "default_sync_timeout_secs")]
    pub sync_timeout_secs: u64,
    /// Bounded dispatch queue per kind; 0 delivers inline on the producer task.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Emit CREATED for every object found by the initial list.
    #[serde(default = "default_true")]
    pub emit_initial: bool,
    /// Per-kind mask replacing the default `status` mask.
    #[serde(default)]
    pub masks: BTreeMap<ResourceKind, VolatilityMask>,
    /// Kinds that are cached but never notified.
    #[serde(default)]
    pub silent: Vec<ResourceKind>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            kinds: default_kinds(),
            resync_secs: default_resync_secs(),
            sync_timeout_secs: default_sync_timeout_secs(),
            queue_capacity: default_queue_capacity(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            emit_initial: true,
            masks: BTreeMap::new(),
            silent: Vec::new(),
        }
    }
}

impl WatchConfig {
    pub fn resync_interval(&self) -> Option<Duration> {
        (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs))
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms.max(1))
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms).max(1))
    }

    /// Mask in force for `kind`: the configured override or the `status` default.
    pub fn mask_for(&self, kind: ResourceKind) -> VolatilityMask {
        self.masks.get(&kind).cloned().unwrap_or_else(VolatilityMask::status_only)
    }

    pub fn is_silent(&self, kind: ResourceKind) -> bool {
        self.silent.contains(&kind)
    }
}
