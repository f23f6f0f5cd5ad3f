use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::event_log::EventLog;
use crate::registration::Registration;

/// What happened to a backend node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipKind {
    Join,
    Leave,
}

/// A node joining or leaving the cluster, carried on the membership log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    #[serde(rename = "type")]
    pub kind: MembershipKind,
    pub node_id: Uuid,
}

impl MembershipEvent {
    pub fn join(node_id: Uuid) -> Self {
        MembershipEvent {
            kind: MembershipKind::Join,
            node_id,
        }
    }

    pub fn leave(node_id: Uuid) -> Self {
        MembershipEvent {
            kind: MembershipKind::Leave,
            node_id,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Subscribe a listener to the membership log, decoding the raw records.
///
/// Replays the retained membership history first, so a late-joining node
/// still learns which nodes are present.
pub fn add_membership_listener(
    membership_log: &Arc<dyn EventLog>,
    listener: impl Fn(MembershipEvent) + Send + Sync + 'static,
) -> Registration {
    let handler: crate::event_log::EventHandler = Arc::new(move |_id, payload| {
        match MembershipEvent::from_value(payload) {
            Some(event) => listener(event),
            None => log::warn!("Ignoring malformed membership record: {}", payload),
        }
    });
    // The membership log is never truncated, so subscribing from the
    // beginning cannot fail.
    membership_log
        .subscribe(None, handler)
        .unwrap_or_else(|_| Registration::noop())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let node = Uuid::new_v4();
        let event = MembershipEvent::leave(node);
        let value = event.to_value();

        assert_eq!(value["type"], "leave");
        assert_eq!(MembershipEvent::from_value(&value), Some(event));
    }

    #[test]
    fn malformed_record_is_none() {
        let value = serde_json::json!({ "type": "explode" });
        assert_eq!(MembershipEvent::from_value(&value), None);
    }
}
