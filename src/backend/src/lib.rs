//! Substrate for the coordination fabric: event logs, cluster membership,
//! and snapshot storage, plus the in-process [`LocalBackend`] /
//! [`LocalCluster`] implementations.

mod backend;
mod error;
mod event_log;
mod local;
mod membership;
mod registration;
mod snapshot_store;

pub use backend::{Backend, BackendConfig};
pub use error::{BackendError, EventIdNotFound};
pub use event_log::{EventHandler, EventLog};
pub use local::{LocalBackend, LocalCluster, LocalEventLog};
pub use membership::{add_membership_listener, MembershipEvent, MembershipKind};
pub use registration::Registration;
pub use snapshot_store::SnapshotStore;
