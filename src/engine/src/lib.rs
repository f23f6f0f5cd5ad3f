//! Coordination fabric facade: open connections against named topics,
//! observe and mutate their shared maps and lists, and let the engine
//! handle membership, cleanup, and snapshots underneath.

mod connection;
mod context;
mod engine;
mod executor;
mod registration;
mod user;

pub use backend::Registration;
pub use connection::{
    EntryScope, ListChangeEvent, ListChangeKind, ListInsertResult, ListKey, ListOperation,
    MapChangeEvent, NamedList, NamedMap, TopicConnection,
};
pub use context::{
    ActionDispatcher, ActivationHandler, Completer, ComponentConnectionContext, ComponentRef,
    ConnectionContext, SessionBeacon, SystemConnectionContext,
};
pub use engine::{Engine, EngineConfig, USER_COLOR_COUNT};
pub use executor::Executor;
pub use registration::TopicConnectionRegistration;
pub use user::UserInfo;
