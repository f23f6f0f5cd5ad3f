//! Serialized form of a topic's full state.
//!
//! The blob is a structured document handed to the backend's snapshot
//! store; ids are canonical UUID strings and durations ISO-8601 strings.
//! Entries are stored as ordered arrays (maps in key insertion order,
//! lists head to tail) so a restore rebuilds the exact same iteration
//! order on every node.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapEntrySnapshot {
    pub key: String,
    pub revision: Uuid,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_owner: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListEntrySnapshot {
    pub id: Uuid,
    pub revision: Uuid,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_owner: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicSnapshot {
    /// Id of the last change folded into this snapshot; subscribing from it
    /// resumes the stream without loss or duplication.
    pub latest: Uuid,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub lists: HashMap<String, Vec<ListEntrySnapshot>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub maps: HashMap<String, Vec<MapEntrySnapshot>>,
    #[serde(
        rename = "list-timeouts",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub list_timeouts: HashMap<String, String>,
    #[serde(
        rename = "map-timeouts",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub map_timeouts: HashMap<String, String>,
    #[serde(rename = "active-nodes", default)]
    pub active_nodes: Vec<Uuid>,
    #[serde(rename = "backend-nodes", default)]
    pub backend_nodes: Vec<Uuid>,
}

impl TopicSnapshot {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn value_round_trip() {
        let snapshot = TopicSnapshot {
            latest: Uuid::new_v4(),
            lists: HashMap::from([(
                "l".to_string(),
                vec![ListEntrySnapshot {
                    id: Uuid::new_v4(),
                    revision: Uuid::new_v4(),
                    value: json!("item"),
                    scope_owner: Some(Uuid::new_v4()),
                }],
            )]),
            maps: HashMap::from([(
                "m".to_string(),
                vec![MapEntrySnapshot {
                    key: "k".to_string(),
                    revision: Uuid::new_v4(),
                    value: json!({ "x": 1 }),
                    scope_owner: None,
                }],
            )]),
            list_timeouts: HashMap::from([("l".to_string(), "PT1M".to_string())]),
            map_timeouts: HashMap::new(),
            active_nodes: vec![Uuid::new_v4()],
            backend_nodes: vec![Uuid::new_v4(), Uuid::new_v4()],
        };

        let value = snapshot.to_value();
        assert!(value["latest"].is_string());
        assert_eq!(value["list-timeouts"]["l"], "PT1M");

        let back = TopicSnapshot::from_value(value).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn empty_collections_are_omitted() {
        let snapshot = TopicSnapshot {
            latest: Uuid::new_v4(),
            lists: HashMap::new(),
            maps: HashMap::new(),
            list_timeouts: HashMap::new(),
            map_timeouts: HashMap::new(),
            active_nodes: Vec::new(),
            backend_nodes: Vec::new(),
        };
        let value = snapshot.to_value();
        assert!(value.get("maps").is_none());
        assert!(value.get("lists").is_none());

        let back = TopicSnapshot::from_value(value).unwrap();
        assert_eq!(back, snapshot);
    }
}
