//! The task processor: turns one queued message into delivered replies.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::Task;
use super::chunking::split_reply;
use super::profiles::ProfileCache;
use super::submission::{Submission, SubmissionParser};
use crate::answer::{Answerer, AssistantRef};
use crate::channels::ReplySink;
use crate::error::{AskError, TaskError};
use crate::sequencer::{SenderKey, TaskProcessor};
use crate::store::StateStore;

pub const REGISTER_FAILED_REPLY: &str =
    "Sorry, I couldn't save your name right now. Please try again in a moment.";

const REGISTER_USAGE_REPLY: &str = "Tell me what to call you with /register <name>.";

const UNKNOWN_USER_REPLY: &str =
    "I don't know your name yet. Send /register <name> to introduce yourself.";

const RESET_REPLY: &str = "Done. I've forgotten our conversation, so we're starting fresh.";

const RESET_FAILED_REPLY: &str =
    "Sorry, I couldn't reset our conversation right now. Please try again in a moment.";

const HELP_REPLY: &str = "Just send a message and I'll answer.\n\
    /register <name> - tell me what to call you\n\
    /whoami - show the name I have for you\n\
    /reset - start a fresh conversation\n\
    /help - show this list";

/// Default [`TaskProcessor`]: runs commands itself and hands everything
/// else to the answering assistant.
pub struct ReplyProcessor {
    answerer: Arc<dyn Answerer>,
    assistant: AssistantRef,
    store: Arc<dyn StateStore>,
    profiles: Arc<ProfileCache>,
    ask_timeout: Duration,
}

impl ReplyProcessor {
    pub fn new(
        answerer: Arc<dyn Answerer>,
        assistant: AssistantRef,
        store: Arc<dyn StateStore>,
        profiles: Arc<ProfileCache>,
        ask_timeout: Duration,
    ) -> Self {
        Self {
            answerer,
            assistant,
            store,
            profiles,
            ask_timeout,
        }
    }

    async fn answer(&self, key: &SenderKey, task: &Task, body: &str) -> Result<(), TaskError> {
        if let Err(e) = task.reply().typing().await {
            debug!(key = %key, error = %e, "Typing indicator not delivered");
        }

        let asked = self
            .answerer
            .ask(&self.assistant, body, task.conversation());
        let reply = tokio::time::timeout(self.ask_timeout, asked)
            .await
            .map_err(|_| AskError::Timeout(self.ask_timeout))??;

        let chunks = split_reply(&reply);
        if chunks.is_empty() {
            return Err(AskError::EmptyReply.into());
        }

        deliver_all(key, task.reply(), &chunks).await
    }

    async fn register(&self, key: &SenderKey, task: &Task, name: &str) -> Result<(), TaskError> {
        let name = name.trim();
        if name.is_empty() {
            return deliver_all(key, task.reply(), &[REGISTER_USAGE_REPLY]).await;
        }

        let reply = match self.store.save_profile(key, name).await {
            Ok(profile) => {
                info!(key = %key, name = %profile.display_name, "User registered");
                self.profiles.insert(profile).await;
                format!("Nice to meet you, {name}!")
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Could not save profile");
                REGISTER_FAILED_REPLY.to_string()
            }
        };
        deliver_all(key, task.reply(), &[reply]).await
    }

    async fn whoami(&self, key: &SenderKey, task: &Task) -> Result<(), TaskError> {
        let known = match self.profiles.get(key).await {
            Some(profile) => Some(profile),
            None => self.profiles.refresh(self.store.as_ref(), key).await,
        };
        let reply = match known {
            Some(profile) => format!("You're registered as {}.", profile.display_name),
            None => UNKNOWN_USER_REPLY.to_string(),
        };
        deliver_all(key, task.reply(), &[reply]).await
    }

    async fn reset(&self, key: &SenderKey, task: &Task) -> Result<(), TaskError> {
        let reply = if task.conversation().clear().await {
            RESET_REPLY
        } else {
            RESET_FAILED_REPLY
        };
        deliver_all(key, task.reply(), &[reply]).await
    }
}

#[async_trait]
impl TaskProcessor<Task> for ReplyProcessor {
    async fn process(&self, key: &SenderKey, task: Task) -> Result<(), TaskError> {
        match SubmissionParser::parse(&task.message().content) {
            Submission::UserInput { content } => self.answer(key, &task, &content).await,
            Submission::Register { name } => self.register(key, &task, &name).await,
            Submission::WhoAmI => self.whoami(key, &task).await,
            Submission::Reset => self.reset(key, &task).await,
            Submission::Help => deliver_all(key, task.reply(), &[HELP_REPLY]).await,
        }
    }
}

/// Deliver every chunk in order, awaiting each. A failed chunk is logged and
/// the rest are still attempted.
async fn deliver_all<S: AsRef<str>>(
    key: &SenderKey,
    sink: &dyn ReplySink,
    chunks: &[S],
) -> Result<(), TaskError> {
    let mut failed = 0;
    for (index, chunk) in chunks.iter().enumerate() {
        if let Err(e) = sink.deliver(chunk.as_ref()).await {
            failed += 1;
            warn!(key = %key, chunk = index, error = %e, "Reply chunk not delivered");
        }
    }

    if failed == 0 {
        Ok(())
    } else {
        Err(TaskError::Delivery {
            failed,
            total: chunks.len(),
        })
    }
}
