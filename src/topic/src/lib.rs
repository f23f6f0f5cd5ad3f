//! The topic runtime: change records, the event-log-backed state machine
//! with membership/leadership and scoped-entry cleanup, and snapshots.

mod change;
mod entry_list;
pub mod json;
mod snapshot;
mod topic;

pub use change::{
    AdjacencyCondition, Change, ChangeDetails, ChangeResult, ListChange, MapChange,
};
pub use entry_list::{EntryList, ListEntry, MoveOutcome};
pub use snapshot::{ListEntrySnapshot, MapEntrySnapshot, TopicSnapshot};
pub use topic::{ChangeSubscriber, MapEntry, Topic};
