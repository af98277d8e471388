//! Main run loop: pulls messages from every channel and dispatches them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;

use crate::channels::{ChannelManager, ChannelReply};
use crate::dispatch::{Dispatch, Dispatcher};
use crate::error::Error;
use crate::sequencer::DrainReport;

/// Ties channels to the dispatcher.
pub struct Agent {
    dispatcher: Arc<Dispatcher>,
    channels: Arc<ChannelManager>,
    shutdown_grace: Duration,
}

impl Agent {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        channels: Arc<ChannelManager>,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            dispatcher,
            channels,
            shutdown_grace,
        }
    }

    /// Run until Ctrl+C or until every channel stream ends.
    pub async fn run(self) -> Result<(), Error> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Could not listen for Ctrl+C: {e}");
                std::future::pending::<()>().await;
            }
            tracing::info!("Ctrl+C received, shutting down...");
        })
        .await
    }

    /// Run until `shutdown` resolves or every channel stream ends, then wait
    /// up to the grace period for running drain workers.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send,
    {
        let mut message_stream = self.channels.start_all().await?;
        let mut workers: Vec<JoinHandle<DrainReport>> = Vec::new();
        tokio::pin!(shutdown);

        tracing::info!(channels = ?self.channels.names(), "Relay ready and listening");

        loop {
            let message = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                msg = message_stream.next() => {
                    match msg {
                        Some(m) => m,
                        None => {
                            tracing::info!("All channel streams ended, shutting down...");
                            break;
                        }
                    }
                }
            };

            tracing::debug!(
                channel = %message.channel,
                user_id = %message.user_id,
                message_id = %message.id,
                "Inbound message"
            );

            let reply = Arc::new(ChannelReply::new(
                Arc::clone(&self.channels),
                message.clone(),
            ));
            if let Dispatch::Started(handle) = self.dispatcher.dispatch(message, reply) {
                workers.retain(|w| !w.is_finished());
                workers.push(handle);
            }
        }

        self.wait_for_workers(workers).await;
        self.channels.shutdown_all().await?;
        tracing::info!("Relay stopped");
        Ok(())
    }

    async fn wait_for_workers(&self, workers: Vec<JoinHandle<DrainReport>>) {
        let running: Vec<_> = workers.into_iter().filter(|w| !w.is_finished()).collect();
        if running.is_empty() {
            return;
        }

        tracing::info!(
            workers = running.len(),
            grace_secs = self.shutdown_grace.as_secs(),
            "Waiting for in-flight conversations"
        );
        let drained = tokio::time::timeout(
            self.shutdown_grace,
            futures::future::join_all(running),
        )
        .await;

        if drained.is_err() {
            let stats = self.dispatcher.stats();
            tracing::warn!(
                active_keys = stats.active_keys,
                pending_tasks = stats.pending_tasks,
                "Grace period elapsed with work still queued"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use futures::stream;

    use super::*;
    use crate::answer::{AssistantRef, EchoAnswerer};
    use crate::channels::{Channel, IncomingMessage, MessageStream, OutgoingResponse, StatusUpdate};
    use crate::dispatch::{ProfileCache, ReplyProcessor};
    use crate::error::ChannelError;
    use crate::sequencer::Sequencer;
    use crate::store::{LibSqlStateStore, StateStore};

    /// Yields a fixed inbox, optionally staying open afterwards.
    struct ScriptedChannel {
        inbox: Vec<(&'static str, &'static str)>,
        hold_open: bool,
        sent: Arc<Mutex<Vec<(String, String)>>>,
        shut_down: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Channel for ScriptedChannel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn start(&self) -> Result<MessageStream, ChannelError> {
            let msgs: Vec<IncomingMessage> = self
                .inbox
                .iter()
                .map(|(user, body)| IncomingMessage::new("scripted", user, body))
                .collect();
            let stream: MessageStream = if self.hold_open {
                Box::pin(stream::iter(msgs).chain(stream::pending()))
            } else {
                Box::pin(stream::iter(msgs))
            };
            Ok(stream)
        }

        async fn respond(
            &self,
            msg: &IncomingMessage,
            response: OutgoingResponse,
        ) -> Result<(), ChannelError> {
            self.sent
                .lock()
                .unwrap()
                .push((msg.user_id.clone(), response.content));
            Ok(())
        }

        async fn send_status(
            &self,
            _msg: &IncomingMessage,
            _status: StatusUpdate,
        ) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn health_check(&self) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn shutdown(&self) -> Result<(), ChannelError> {
            self.shut_down.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        agent: Agent,
        sent: Arc<Mutex<Vec<(String, String)>>>,
        shut_down: Arc<AtomicBool>,
    }

    fn harness(inbox: Vec<(&'static str, &'static str)>, hold_open: bool) -> Harness {
        let store: Arc<dyn StateStore> = Arc::new(LibSqlStateStore::new_memory());
        let profiles = Arc::new(ProfileCache::new());
        let processor = Arc::new(ReplyProcessor::new(
            Arc::new(EchoAnswerer),
            AssistantRef::new("echo"),
            Arc::clone(&store),
            Arc::clone(&profiles),
            Duration::from_secs(2),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(Sequencer::new()),
            processor,
            store,
            profiles,
        ));

        let sent = Arc::new(Mutex::new(Vec::new()));
        let shut_down = Arc::new(AtomicBool::new(false));
        let mut channels = ChannelManager::new();
        channels.add(Box::new(ScriptedChannel {
            inbox,
            hold_open,
            sent: Arc::clone(&sent),
            shut_down: Arc::clone(&shut_down),
        }));

        Harness {
            agent: Agent::new(dispatcher, Arc::new(channels), Duration::from_secs(5)),
            sent,
            shut_down,
        }
    }

    fn replies_for(sent: &Mutex<Vec<(String, String)>>, user: &str) -> Vec<String> {
        sent.lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == user)
            .map(|(_, body)| body.clone())
            .collect()
    }

    #[tokio::test]
    async fn drains_everything_before_returning_when_streams_end() {
        let h = harness(
            vec![("u1", "A"), ("u2", "X"), ("u1", "B"), ("u1", "C"), ("u2", "Y")],
            false,
        );

        tokio::time::timeout(Duration::from_secs(5), h.agent.run_until(std::future::pending()))
            .await
            .expect("run loop hung")
            .unwrap();

        assert_eq!(
            replies_for(&h.sent, "u1"),
            vec!["You said: A", "You said: B", "You said: C"]
        );
        assert_eq!(replies_for(&h.sent, "u2"), vec!["You said: X", "You said: Y"]);
        assert!(h.shut_down.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_signal_stops_an_open_stream() {
        let h = harness(vec![("u1", "hello")], true);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let sent = Arc::clone(&h.sent);

        let run = tokio::spawn(h.agent.run_until(async {
            let _ = stop_rx.await;
        }));

        tokio::time::timeout(Duration::from_secs(5), async {
            while replies_for(&sent, "u1").is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no reply delivered");

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("run loop ignored shutdown")
            .unwrap()
            .unwrap();

        assert_eq!(replies_for(&sent, "u1"), vec!["You said: hello"]);
        assert!(h.shut_down.load(Ordering::SeqCst));
    }
}
