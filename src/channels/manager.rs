//! ChannelManager: owns every channel and routes replies by channel name.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use tracing::{error, info, warn};

use crate::channels::{
    Channel, IncomingMessage, MessageStream, OutgoingResponse, ReplySink, StatusUpdate,
};
use crate::error::{ChannelError, DeliveryError};

/// Registry of active channels.
#[derive(Default)]
pub struct ChannelManager {
    channels: Vec<Box<dyn Channel>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, channel: Box<dyn Channel>) {
        info!(channel = channel.name(), "Channel registered");
        self.channels.push(channel);
    }

    pub fn names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name().to_string()).collect()
    }

    fn get(&self, name: &str) -> Result<&dyn Channel, ChannelError> {
        self.channels
            .iter()
            .find(|c| c.name() == name)
            .map(|c| c.as_ref())
            .ok_or_else(|| ChannelError::UnknownChannel(name.to_string()))
    }

    /// Start every channel and merge their streams. Channels that fail to
    /// start are logged and skipped; fails only if none start.
    pub async fn start_all(&self) -> Result<MessageStream, ChannelError> {
        let mut streams = Vec::new();
        for channel in &self.channels {
            match channel.start().await {
                Ok(s) => {
                    info!(channel = channel.name(), "Channel started");
                    streams.push(s);
                }
                Err(e) => error!(channel = channel.name(), error = %e, "Channel failed to start"),
            }
        }

        if streams.is_empty() {
            return Err(ChannelError::StartupFailed {
                name: "all".to_string(),
                reason: "no channel could be started".to_string(),
            });
        }

        Ok(Box::pin(stream::select_all(streams)))
    }

    /// Route a reply to the channel `msg` arrived on.
    pub async fn respond(
        &self,
        msg: &IncomingMessage,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError> {
        self.get(&msg.channel)?.respond(msg, response).await
    }

    pub async fn send_status(
        &self,
        msg: &IncomingMessage,
        status: StatusUpdate,
    ) -> Result<(), ChannelError> {
        self.get(&msg.channel)?.send_status(msg, status).await
    }

    /// Health of every channel as `(name, healthy)`.
    pub async fn health_check_all(&self) -> Vec<(String, bool)> {
        let checks = self.channels.iter().map(|c| async move {
            let ok = match c.health_check().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(channel = c.name(), error = %e, "Channel health check failed");
                    false
                }
            };
            (c.name().to_string(), ok)
        });
        futures::future::join_all(checks).await
    }

    pub async fn shutdown_all(&self) -> Result<(), ChannelError> {
        for channel in &self.channels {
            if let Err(e) = channel.shutdown().await {
                warn!(channel = channel.name(), error = %e, "Channel shutdown failed");
            }
        }
        Ok(())
    }
}

/// [`ReplySink`] bound to one message, delivering through the manager.
pub struct ChannelReply {
    channels: Arc<ChannelManager>,
    message: IncomingMessage,
}

impl ChannelReply {
    pub fn new(channels: Arc<ChannelManager>, message: IncomingMessage) -> Self {
        Self { channels, message }
    }
}

#[async_trait]
impl ReplySink for ChannelReply {
    async fn typing(&self) -> Result<(), DeliveryError> {
        self.channels
            .send_status(&self.message, StatusUpdate::Typing)
            .await
    }

    async fn deliver(&self, chunk: &str) -> Result<(), DeliveryError> {
        self.channels
            .respond(&self.message, OutgoingResponse::text(chunk))
            .await
    }
}
