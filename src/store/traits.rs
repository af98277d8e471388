//! `StateStore`, the persistence contract the relay depends on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::sequencer::SenderKey;

/// A registered user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub key: SenderKey,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-sender conversation state. Opaque to the relay; the answering
/// collaborator decides what goes in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationState(serde_json::Value);

impl ConversationState {
    pub fn new() -> Self {
        Self(serde_json::Value::Object(serde_json::Map::new()))
    }

    pub fn from_value(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::new(),
            other => Self(other),
        }
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Read a string field, if the state is an object carrying one.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(|v| v.as_str())
    }

    /// Set a field, turning non-object state into an object first.
    pub fn set(&mut self, field: &str, value: impl Into<serde_json::Value>) {
        if !self.0.is_object() {
            self.0 = serde_json::Value::Object(serde_json::Map::new());
        }
        if let Some(map) = self.0.as_object_mut() {
            map.insert(field.to_string(), value.into());
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.0 {
            serde_json::Value::Object(map) => map.is_empty(),
            serde_json::Value::Null => true,
            _ => false,
        }
    }
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::new()
    }
}

/// Backend-agnostic store for profiles and conversation state.
///
/// Implementations initialise lazily (a store that is down at startup must
/// not stop the process) and upsert rather than duplicate rows.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Look up a profile. `Ok(None)` means the user never registered.
    async fn get_profile(&self, key: &SenderKey) -> Result<Option<UserProfile>, StoreError>;

    /// Create or rename a profile. Re-registering keeps `created_at`.
    async fn save_profile(&self, key: &SenderKey, name: &str)
    -> Result<UserProfile, StoreError>;

    /// Load conversation state; unknown keys yield an empty state.
    async fn get_state(&self, key: &SenderKey) -> Result<ConversationState, StoreError>;

    /// Replace conversation state.
    async fn set_state(&self, key: &SenderKey, state: &ConversationState)
    -> Result<(), StoreError>;

    /// Forget conversation state. Returns whether anything was removed.
    async fn clear_state(&self, key: &SenderKey) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_state_is_object() {
        let state = ConversationState::new();
        assert!(state.is_empty());
        assert_eq!(state.as_value(), &serde_json::json!({}));
    }

    #[test]
    fn null_becomes_empty_object() {
        let state = ConversationState::from_value(serde_json::Value::Null);
        assert!(state.is_empty());
        assert!(state.as_value().is_object());
    }

    #[test]
    fn set_and_get_field() {
        let mut state = ConversationState::new();
        state.set("thread_id", "thread_abc");
        assert_eq!(state.get_str("thread_id"), Some("thread_abc"));
        assert!(!state.is_empty());
    }

    #[test]
    fn set_on_scalar_state_replaces_it() {
        let mut state = ConversationState::from_value(serde_json::json!(42));
        assert!(!state.is_empty());
        state.set("k", true);
        assert_eq!(state.as_value(), &serde_json::json!({"k": true}));
    }
}
