//! Change records: the tagged union of every mutation a topic understands,
//! plus the result and detail types the state machine produces when a
//! record is applied.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Asserts that `right` is the immediate successor of `left`.
///
/// `None` stands for the list boundary: `left == None` means "the head
/// position", `right == None` means "the tail position", and both `None`
/// means "the list is empty".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjacencyCondition {
    pub left: Option<Uuid>,
    pub right: Option<Uuid>,
}

/// One intended mutation, serialized as a `type`-tagged document onto the
/// event log and applied deterministically on every node.
///
/// A `Value::Null` in a `value`/`item` position is the removal sentinel.
/// Conditional fields (`expected_id`, `expected_value`) are compare-and-set
/// preconditions on the prior entry; an absent field means unconditional,
/// while an explicit `null` expected value means "expect the key absent".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Change {
    Put {
        name: String,
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_id: Option<Uuid>,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "present_value"
        )]
        expected_value: Option<Value>,
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope_owner: Option<Uuid>,
    },
    Replace {
        name: String,
        key: String,
        expected_value: Value,
        value: Value,
    },
    Insert {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reference_key: Option<Uuid>,
        before: bool,
        item: Value,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        conditions: Vec<AdjacencyCondition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope_owner: Option<Uuid>,
    },
    MoveBefore {
        name: String,
        reference_key: Uuid,
        key_to_move: Uuid,
    },
    MoveAfter {
        name: String,
        reference_key: Uuid,
        key_to_move: Uuid,
    },
    ListSet {
        name: String,
        key: Uuid,
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope_owner: Option<Uuid>,
    },
    /// Sets (ISO-8601 string) or clears (null) the idle-expiration timeout
    /// of a named map.
    MapTimeout { name: String, value: Option<String> },
    /// Sets or clears the idle-expiration timeout of a named list.
    ListTimeout { name: String, value: Option<String> },
    NodeJoin { node_id: Uuid },
    NodeActivate { node_id: Uuid },
    NodeDeactivate { node_id: Uuid },
}

/// Distinguishes a present-but-null JSON field from an absent one, so an
/// explicit `"expected_value": null` deserializes to `Some(Value::Null)`.
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Change {
    /// Whether this record can modify map or list data.
    ///
    /// Timeout and node records always apply; they never count against
    /// compare-and-set semantics or the snapshot cadence.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Change::Put { .. }
                | Change::Replace { .. }
                | Change::Insert { .. }
                | Change::MoveBefore { .. }
                | Change::MoveAfter { .. }
                | Change::ListSet { .. }
        )
    }
}

/// Outcome of applying one change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeResult {
    Accepted,
    Rejected,
}

/// What actually happened to the data, fed to topic subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeDetails {
    Map(MapChange),
    List(ListChange),
}

/// A map entry transition. `None` values mean "absent".
#[derive(Debug, Clone, PartialEq)]
pub struct MapChange {
    pub name: String,
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    /// The compare-and-set id the originating change carried, if any.
    pub expected_id: Option<Uuid>,
}

impl MapChange {
    /// Whether the visible value changed; equal-value rewrites are applied
    /// silently.
    pub fn has_changes(&self) -> bool {
        self.old_value != self.new_value
    }
}

/// A list entry transition: insert, rewrite, move, or removal, with the
/// neighbor pointers before and after.
#[derive(Debug, Clone, PartialEq)]
pub struct ListChange {
    pub name: String,
    pub key: Uuid,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub old_prev: Option<Uuid>,
    pub old_next: Option<Uuid>,
    pub new_prev: Option<Uuid>,
    pub new_next: Option<Uuid>,
    /// The compare-and-set id the originating change carried, if any.
    pub expected_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn put_round_trip_with_tag() {
        let change = Change::Put {
            name: "m".into(),
            key: "k".into(),
            expected_id: None,
            expected_value: None,
            value: json!({ "x": 1 }),
            scope_owner: Some(Uuid::new_v4()),
        };
        let value = serde_json::to_value(&change).unwrap();
        assert_eq!(value["type"], "put");
        assert!(value.get("expected_value").is_none());

        let back: Change = serde_json::from_value(value).unwrap();
        assert_eq!(back, change);
    }

    #[test]
    fn present_null_expected_value_survives() {
        let change = Change::Put {
            name: "m".into(),
            key: "k".into(),
            expected_id: None,
            expected_value: Some(Value::Null),
            value: json!("v"),
            scope_owner: None,
        };
        let value = serde_json::to_value(&change).unwrap();
        assert_eq!(value["expected_value"], Value::Null);

        match serde_json::from_value::<Change>(value).unwrap() {
            Change::Put { expected_value, .. } => {
                assert_eq!(expected_value, Some(Value::Null));
            }
            other => panic!("unexpected change: {:?}", other),
        }
    }

    #[test]
    fn kebab_case_tags() {
        let change = Change::ListSet {
            name: "l".into(),
            key: Uuid::new_v4(),
            value: Value::Null,
            expected_id: None,
            scope_owner: None,
        };
        let value = serde_json::to_value(&change).unwrap();
        assert_eq!(value["type"], "list-set");

        let join = Change::NodeJoin { node_id: Uuid::new_v4() };
        assert_eq!(serde_json::to_value(&join).unwrap()["type"], "node-join");
    }

    #[test]
    fn timeout_null_clears() {
        let change = Change::MapTimeout { name: "m".into(), value: None };
        let value = serde_json::to_value(&change).unwrap();
        assert_eq!(value["value"], Value::Null);

        let back: Change = serde_json::from_value(value).unwrap();
        assert_eq!(back, change);
    }

    #[test]
    fn mutating_classification() {
        let put = Change::Put {
            name: "m".into(),
            key: "k".into(),
            expected_id: None,
            expected_value: None,
            value: json!(1),
            scope_owner: None,
        };
        assert!(put.is_mutating());
        assert!(!Change::NodeJoin { node_id: Uuid::new_v4() }.is_mutating());
        assert!(!Change::MapTimeout { name: "m".into(), value: None }.is_mutating());
    }
}
