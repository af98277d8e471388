//! Inbound message dispatch.
//!
//! Every message becomes a [`Task`] queued under its sender's key. The first
//! message for an idle key spawns a worker that drains the key's queue;
//! later messages for the same key join the queue and are picked up by that
//! worker in arrival order.

pub mod chunking;
pub mod processor;
pub mod profiles;
pub mod submission;

pub use processor::ReplyProcessor;
pub use profiles::ProfileCache;
pub use submission::{Submission, SubmissionParser};

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channels::{IncomingMessage, ReplySink};
use crate::sequencer::{
    Admission, DrainReport, KeySnapshot, SenderKey, Sequencer, SequencerStats, TaskProcessor,
};
use crate::store::{ConversationHandle, StateStore};

/// One inbound message with everything needed to answer it. Built at
/// dispatch time and consumed exactly once by the processor.
pub struct Task {
    message: IncomingMessage,
    reply: Arc<dyn ReplySink>,
    conversation: ConversationHandle,
}

impl Task {
    pub fn new(
        message: IncomingMessage,
        reply: Arc<dyn ReplySink>,
        conversation: ConversationHandle,
    ) -> Self {
        Self {
            message,
            reply,
            conversation,
        }
    }

    pub fn message(&self) -> &IncomingMessage {
        &self.message
    }

    /// Delivery capability bound to the message's session.
    pub fn reply(&self) -> &dyn ReplySink {
        self.reply.as_ref()
    }

    pub fn conversation(&self) -> &ConversationHandle {
        &self.conversation
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("message", &self.message.id)
            .field("key", self.conversation.key())
            .finish_non_exhaustive()
    }
}

/// What `dispatch` did with a message.
#[derive(Debug)]
pub enum Dispatch {
    /// The key was idle; a worker was spawned to drain it.
    Started(JoinHandle<DrainReport>),
    /// A worker already owns the key; the task waits behind `pending - 1`
    /// others.
    Queued { pending: usize },
}

/// Upper bound on the profile lookup a worker runs before draining.
pub const PROFILE_REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Dispatcher {
    sequencer: Arc<Sequencer<Task>>,
    processor: Arc<dyn TaskProcessor<Task>>,
    store: Arc<dyn StateStore>,
    profiles: Arc<ProfileCache>,
    refresh_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        sequencer: Arc<Sequencer<Task>>,
        processor: Arc<dyn TaskProcessor<Task>>,
        store: Arc<dyn StateStore>,
        profiles: Arc<ProfileCache>,
    ) -> Self {
        Self {
            sequencer,
            processor,
            store,
            profiles,
            refresh_timeout: PROFILE_REFRESH_TIMEOUT,
        }
    }

    /// Override the profile lookup bound (default [`PROFILE_REFRESH_TIMEOUT`]).
    pub fn with_refresh_timeout(mut self, limit: Duration) -> Self {
        self.refresh_timeout = limit;
        self
    }

    /// Queue `message` under its sender key and start a worker if the key
    /// was idle. Never blocks: the queue position is fixed before this
    /// returns, and all I/O happens on the worker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn dispatch(&self, message: IncomingMessage, reply: Arc<dyn ReplySink>) -> Dispatch {
        let key = message.sender_key();
        let conversation = ConversationHandle::new(key.clone(), Arc::clone(&self.store));
        let task = Task::new(message, reply, conversation);

        match self.sequencer.submit(&key, task) {
            Admission::Drain => {
                debug!(key = %key, "Starting drain worker");
                let sequencer = Arc::clone(&self.sequencer);
                let processor = Arc::clone(&self.processor);
                let store = Arc::clone(&self.store);
                let profiles = Arc::clone(&self.profiles);
                let limit = self.refresh_timeout;

                Dispatch::Started(tokio::spawn(async move {
                    refresh_profile(&profiles, store.as_ref(), &key, limit).await;
                    sequencer.drain(&key, processor.as_ref()).await
                }))
            }
            Admission::Queued { pending } => {
                debug!(key = %key, pending, "Queued behind running worker");
                let store = Arc::clone(&self.store);
                let profiles = Arc::clone(&self.profiles);
                let limit = self.refresh_timeout;
                tokio::spawn(async move {
                    refresh_profile(&profiles, store.as_ref(), &key, limit).await;
                });
                Dispatch::Queued { pending }
            }
        }
    }

    pub fn sequencer(&self) -> &Arc<Sequencer<Task>> {
        &self.sequencer
    }

    pub fn profiles(&self) -> &Arc<ProfileCache> {
        &self.profiles
    }

    pub fn stats(&self) -> SequencerStats {
        self.sequencer.stats()
    }

    pub fn snapshot(&self) -> Vec<KeySnapshot> {
        self.sequencer.snapshot()
    }
}

/// Mirror the sender's profile, giving up after `limit`. A hung or
/// panicking store must not keep the worker from draining.
async fn refresh_profile(
    profiles: &ProfileCache,
    store: &dyn StateStore,
    key: &SenderKey,
    limit: Duration,
) {
    let lookup = AssertUnwindSafe(profiles.refresh(store, key)).catch_unwind();
    match tokio::time::timeout(limit, lookup).await {
        Ok(Ok(_)) => {}
        Ok(Err(_)) => warn!(key = %key, "Profile lookup panicked; continuing without it"),
        Err(_) => warn!(
            key = %key,
            timeout_ms = limit.as_millis() as u64,
            "Profile lookup timed out; continuing without it"
        ),
    }
}
