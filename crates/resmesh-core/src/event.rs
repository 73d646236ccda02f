//! Resource events and protocol value helpers.
//!
//! Events are published on `event.<rid>.<name>`. The payload shapes are:
//!
//! | Event      | Payload                        |
//! |------------|--------------------------------|
//! | `change`   | `{"values": {prop: value}}`    |
//! | `add`      | `{"value": v, "idx": n}`       |
//! | `remove`   | `{"idx": n}`                   |
//! | `create`   | `{"data": v}`                  |
//! | `delete`   | `{}`                           |
//! | `reaccess` | empty                          |
//! | custom     | any JSON value                 |

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::event_subject;

/// Event names that custom events may not use.
pub const RESERVED_EVENT_NAMES: &[&str] = &[
    "change",
    "delete",
    "add",
    "remove",
    "patch",
    "reaccess",
    "unsubscribe",
    "query",
    "create",
];

/// Returns the change-event tombstone, `{"action":"delete"}`.
///
/// A property set to this value in a change event is removed from the model.
pub fn delete_action() -> Value {
    json!({ "action": "delete" })
}

/// Returns `true` if `value` is the change-event tombstone.
pub fn is_delete_action(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.len() == 1 && map.get("action") == Some(&Value::from("delete")),
        _ => false,
    }
}

/// Checks that `name` can be used for a custom event.
pub fn validate_event_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("event name is empty".to_string());
    }
    if name.contains(['.', '*', '>', ' ']) {
        return Err(format!("event name '{name}' contains a reserved character"));
    }
    if RESERVED_EVENT_NAMES.contains(&name) {
        return Err(format!("event name '{name}' is reserved"));
    }
    Ok(())
}

// =============================================================================
// ResourceEvent
// =============================================================================

/// An event about to be published for a resource.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent {
    /// Properties of a model changed; tombstoned properties were removed.
    Change {
        /// New values by property name.
        values: Map<String, Value>,
    },
    /// A value was inserted into a collection.
    Add {
        /// The inserted value.
        value: Value,
        /// Position of the new value.
        idx: usize,
    },
    /// A value was removed from a collection.
    Remove {
        /// Position of the removed value.
        idx: usize,
    },
    /// The resource was created.
    Create {
        /// The initial data of the resource.
        data: Value,
    },
    /// The resource was deleted.
    Delete,
    /// Access to the resource must be re-evaluated.
    Reaccess,
    /// A custom event.
    Custom {
        /// The event name.
        name: String,
        /// Arbitrary payload.
        payload: Value,
    },
}

impl ResourceEvent {
    /// The event name as it appears in the subject.
    pub fn name(&self) -> &str {
        match self {
            Self::Change { .. } => "change",
            Self::Add { .. } => "add",
            Self::Remove { .. } => "remove",
            Self::Create { .. } => "create",
            Self::Delete => "delete",
            Self::Reaccess => "reaccess",
            Self::Custom { name, .. } => name,
        }
    }

    /// The subject this event is published on for `resource_name`.
    pub fn subject(&self, resource_name: &str) -> String {
        event_subject(resource_name, self.name())
    }

    /// Encodes the event payload.
    pub fn payload(&self) -> ProtocolResult<Vec<u8>> {
        let value = match self {
            Self::Change { values } => json!({ "values": values }),
            Self::Add { value, idx } => json!({ "value": value, "idx": idx }),
            Self::Remove { idx } => json!({ "idx": idx }),
            Self::Create { data } => json!({ "data": data }),
            Self::Delete => json!({}),
            Self::Reaccess => return Ok(Vec::new()),
            Self::Custom { payload, .. } => payload.clone(),
        };
        serde_json::to_vec(&value).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

// =============================================================================
// Value helpers
// =============================================================================

/// A reference to another resource, `{"rid": "..."}`.
///
/// Soft references serialize as `{"rid": "...", "soft": true}` and are not
/// followed by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ref {
    /// Resource ID being referenced.
    pub rid: String,
    /// Whether the reference is soft.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub soft: bool,
}

impl Ref {
    /// A hard reference.
    pub fn new(rid: impl Into<String>) -> Self {
        Self {
            rid: rid.into(),
            soft: false,
        }
    }

    /// A soft reference.
    pub fn soft(rid: impl Into<String>) -> Self {
        Self {
            rid: rid.into(),
            soft: true,
        }
    }
}

/// A data value, `{"data": ...}`, used to embed arbitrary JSON in a model or
/// collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataValue<T> {
    /// The wrapped value.
    pub data: T,
}

impl<T> DataValue<T> {
    /// Wraps a value.
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

/// Payload of a `system.reset` event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetEvent {
    /// Resource patterns whose cached values must be discarded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
    /// Resource patterns whose access must be re-evaluated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access: Vec<String>,
}

impl ResetEvent {
    /// Returns `true` if the event would reset nothing.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.access.is_empty()
    }
}

/// Payload of a `conn.<cid>.token` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenEvent {
    /// The new token; `null` clears it.
    pub token: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_action() {
        assert!(is_delete_action(&delete_action()));
        assert!(!is_delete_action(&json!({"action": "delete", "x": 1})));
        assert!(!is_delete_action(&json!("delete")));
    }

    #[test]
    fn test_event_names() {
        assert!(validate_event_name("borrowed").is_ok());
        assert!(validate_event_name("").is_err());
        assert!(validate_event_name("a.b").is_err());
        assert!(validate_event_name("change").is_err());
        assert!(validate_event_name("create").is_err());
    }

    #[test]
    fn test_event_payloads() {
        let mut values = Map::new();
        values.insert("title".into(), json!("Dune"));
        let change = ResourceEvent::Change { values };
        assert_eq!(change.subject("library.book.1"), "event.library.book.1.change");
        assert_eq!(change.payload().unwrap(), br#"{"values":{"title":"Dune"}}"#);

        let add = ResourceEvent::Add {
            value: json!("x"),
            idx: 2,
        };
        assert_eq!(add.payload().unwrap(), br#"{"idx":2,"value":"x"}"#);
        assert_eq!(ResourceEvent::Delete.payload().unwrap(), b"{}");
        assert!(ResourceEvent::Reaccess.payload().unwrap().is_empty());
    }

    #[test]
    fn test_value_helpers() {
        assert_eq!(
            serde_json::to_value(Ref::new("library.book.1")).unwrap(),
            json!({"rid": "library.book.1"})
        );
        assert_eq!(
            serde_json::to_value(Ref::soft("library.book.1")).unwrap(),
            json!({"rid": "library.book.1", "soft": true})
        );
        assert_eq!(
            serde_json::to_value(DataValue::new(json!([1, 2]))).unwrap(),
            json!({"data": [1, 2]})
        );
        let reset = ResetEvent {
            resources: vec!["library.>".into()],
            access: vec![],
        };
        assert_eq!(
            serde_json::to_value(&reset).unwrap(),
            json!({"resources": ["library.>"]})
        );
    }
}
