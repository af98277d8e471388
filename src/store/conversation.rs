//! Session-scoped handle to a sender's conversation state.

use std::sync::Arc;

use tracing::warn;

use super::traits::{ConversationState, StateStore};
use crate::sequencer::SenderKey;

/// Handle given to the answering collaborator with each task.
///
/// Store failures are logged and treated as "no data": `load` falls back to
/// an empty state and `save` reports `false`.
#[derive(Clone)]
pub struct ConversationHandle {
    key: SenderKey,
    store: Arc<dyn StateStore>,
}

impl ConversationHandle {
    pub fn new(key: SenderKey, store: Arc<dyn StateStore>) -> Self {
        Self { key, store }
    }

    pub fn key(&self) -> &SenderKey {
        &self.key
    }

    pub async fn load(&self) -> ConversationState {
        match self.store.get_state(&self.key).await {
            Ok(state) => state,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Failed to load conversation state");
                ConversationState::new()
            }
        }
    }

    pub async fn save(&self, state: &ConversationState) -> bool {
        match self.store.set_state(&self.key, state).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Failed to save conversation state");
                false
            }
        }
    }

    /// Drop the stored state. Returns whether the store call succeeded.
    pub async fn clear(&self) -> bool {
        match self.store.clear_state(&self.key).await {
            Ok(_) => true,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Failed to clear conversation state");
                false
            }
        }
    }
}

impl std::fmt::Debug for ConversationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationHandle")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
