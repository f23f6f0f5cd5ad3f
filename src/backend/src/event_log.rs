use serde_json::Value;
use uuid::Uuid;

use crate::error::EventIdNotFound;
use crate::registration::Registration;

/// Callback receiving each event in log order.
///
/// Handlers are shared so the log can deliver without holding its state
/// lock; any mutable state belongs behind the handler's own synchronization.
pub type EventHandler = std::sync::Arc<dyn Fn(Uuid, &Value) + Send + Sync>;

/// An append-only, totally-ordered log of change records keyed by 128-bit
/// ids.
///
/// Every subscriber observes the same sequence of events in the same order.
/// Subscribing replays history first (all events strictly after the given
/// id, or everything when no id is given) and then streams new submissions.
pub trait EventLog: Send + Sync {
    /// Append a record and deliver it to all current subscribers in order.
    fn submit_event(&self, id: Uuid, payload: Value);

    /// Register a subscriber.
    ///
    /// When `since` is `Some(id)`, events strictly after `id` are replayed
    /// before the call returns; an id that is not present in the log raises
    /// [`EventIdNotFound`]. When `since` is `None`, the whole retained log
    /// is replayed.
    fn subscribe(
        &self,
        since: Option<Uuid>,
        handler: EventHandler,
    ) -> Result<Registration, EventIdNotFound>;

    /// Discard events up to and including the given id.
    ///
    /// Truncation is advisory: if the id is no longer (or never was) in the
    /// log, nothing happens.
    fn truncate(&self, older_than: Uuid);
}
