//! Answering collaborators that turn a message body into reply text.
//!
//! Supports:
//! - **OpenAI Assistants**: thread-per-sender via the Assistants v2 API
//! - **Echo**: offline fallback for local runs without an API key

pub mod openai;

pub use openai::OpenAiAssistant;

use async_trait::async_trait;

use crate::error::AskError;
use crate::store::ConversationHandle;

/// Identifies the assistant that should answer (for OpenAI, the
/// `asst_...` id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantRef(String);

impl AssistantRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AssistantRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Produces a reply for one message. May read and update the sender's
/// conversation state through `state`.
#[async_trait]
pub trait Answerer: Send + Sync {
    fn name(&self) -> &str;

    /// Free-form reply text; may contain several paragraphs and citation
    /// markers.
    async fn ask(
        &self,
        assistant: &AssistantRef,
        body: &str,
        state: &ConversationHandle,
    ) -> Result<String, AskError>;
}

/// Replies with the message body. Used when no assistant is configured.
pub struct EchoAnswerer;

#[async_trait]
impl Answerer for EchoAnswerer {
    fn name(&self) -> &str {
        "echo"
    }

    async fn ask(
        &self,
        _assistant: &AssistantRef,
        body: &str,
        _state: &ConversationHandle,
    ) -> Result<String, AskError> {
        Ok(format!("You said: {}", body.trim()))
    }
}
