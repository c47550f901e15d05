//! Actions - the typed messages dispatched into the scheduler.
//!
//! An action is a plain value: a non-empty `type`, an optional payload and an
//! optional status. Actions have no identity beyond their contents; the same
//! logical action may be constructed many times.
//!
//! # Wire Shape
//!
//! ```json
//! { "type": "auth/LOGIN", "payload": { "user": "ada" }, "status": "pending" }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MissileError;

/// A typed message with optional payload and status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// The action type, e.g. `"auth/LOGIN"`. Must be non-empty.
    #[serde(rename = "type")]
    pub action_type: String,
    /// Arbitrary payload carried by the action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Optional status tag (`"pending"`, `"success"`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl Action {
    /// Create an action with the given type and no payload.
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            payload: None,
            status: None,
        }
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Attach a status.
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// The action type.
    pub fn action_type(&self) -> &str {
        &self.action_type
    }

    /// The payload, or `Value::Null` when absent.
    pub fn payload_or_null(&self) -> Value {
        self.payload.clone().unwrap_or(Value::Null)
    }

    /// Check the action can be dispatched.
    ///
    /// A missing or blank `type` is a programming error; the dispatcher
    /// rejects it instead of silently dropping the action.
    pub fn validate(&self) -> Result<(), MissileError> {
        if self.action_type.trim().is_empty() {
            return Err(MissileError::InvalidAction {
                reason: "action type must be a non-empty string",
            });
        }
        Ok(())
    }
}

impl From<&str> for Action {
    fn from(action_type: &str) -> Self {
        Action::new(action_type)
    }
}

impl From<String> for Action {
    fn from(action_type: String) -> Self {
        Action::new(action_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder() {
        let action = Action::new("auth/LOGIN")
            .with_payload(json!({ "user": "ada" }))
            .with_status("pending");

        assert_eq!(action.action_type(), "auth/LOGIN");
        assert_eq!(action.payload, Some(json!({ "user": "ada" })));
        assert_eq!(action.status.as_deref(), Some("pending"));
    }

    #[test]
    fn test_validate_rejects_blank_type() {
        assert!(Action::new("").validate().is_err());
        assert!(Action::new("   ").validate().is_err());
        assert!(Action::new("x").validate().is_ok());
    }

    #[test]
    fn test_serializes_type_field() {
        let action = Action::new("cart/ADD").with_payload(3);
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value, json!({ "type": "cart/ADD", "payload": 3 }));
    }

    #[test]
    fn test_deserializes_without_optional_fields() {
        let action: Action = serde_json::from_value(json!({ "type": "ping" })).unwrap();
        assert_eq!(action, Action::new("ping"));
        assert_eq!(action.payload_or_null(), Value::Null);
    }
}
