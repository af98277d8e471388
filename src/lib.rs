//! Assist Relay: per-sender sequential dispatch of chat messages to an
//! answering assistant.

pub mod agent;
pub mod answer;
pub mod channels;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod sequencer;
pub mod server;
pub mod store;
