//! Persistence layer for profiles and conversation state.

pub mod conversation;
pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use conversation::ConversationHandle;
pub use libsql_backend::{DbTarget, LibSqlStateStore};
pub use traits::{ConversationState, StateStore, UserProfile};
