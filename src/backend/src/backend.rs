use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::event_log::EventLog;

/// The pluggable substrate a topic runtime runs on.
///
/// A backend provides the local node identity, one event log per topic, the
/// cluster-wide membership log, and a snapshot store. Submissions to any of
/// the logs are observed by every backend sharing the substrate, in the same
/// total order.
pub trait Backend: Send + Sync {
    /// The id of the node this backend instance represents.
    fn node_id(&self) -> Uuid;

    /// Open (or create) the event log with the given id.
    fn open_event_log(&self, log_id: &str) -> Arc<dyn EventLog>;

    /// The cluster-wide log of membership join/leave records.
    fn membership_log(&self) -> Arc<dyn EventLog>;

    /// Load the latest snapshot stored for the given topic.
    ///
    /// Resolves to `None` when no snapshot exists. The receiver end is a
    /// future; the backend never blocks the caller on snapshot reads.
    fn load_latest_snapshot(&self, name: &str) -> oneshot::Receiver<Option<Value>>;

    /// Store the latest snapshot for the given topic.
    fn submit_snapshot(&self, name: &str, snapshot: Value) -> oneshot::Receiver<()>;

    /// Whether this backend spans multiple processes.
    ///
    /// Drives deterministic (hash-based) instead of sequential user-color
    /// assignment, since counters cannot be shared across processes.
    fn is_clustered(&self) -> bool {
        false
    }
}

/// Backend configuration
pub struct BackendConfig {
    /// Directory for persisted snapshots (None = in-memory only)
    pub data_dir: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig { data_dir: None }
    }
}

impl BackendConfig {
    /// Create config for in-memory only operation
    pub fn in_memory() -> Self {
        BackendConfig::default()
    }

    /// Create config with snapshot persistence under the given directory
    pub fn with_data_dir<P: AsRef<Path>>(path: P) -> Self {
        BackendConfig {
            data_dir: Some(path.as_ref().to_string_lossy().to_string()),
        }
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("LOOM_DATA_DIR") {
            let persist = std::env::var("LOOM_PERSIST")
                .map(|v| v == "1" || v.to_lowercase() == "true")
                .unwrap_or(true);
            if persist {
                config.data_dir = Some(path);
            }
        }
        config
    }
}
