//! OpenAI Assistants (v2) answerer.
//!
//! Each sender gets one assistant thread. Its id is kept in the sender's
//! conversation state under `thread_id`, created on first use and replaced
//! if the API no longer knows it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::{Answerer, AssistantRef};
use crate::error::AskError;
use crate::store::ConversationHandle;

/// Default API base URL.
pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// Conversation state field holding the assistant thread id.
pub const THREAD_ID_FIELD: &str = "thread_id";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

// ── Wire types ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ThreadObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RunObject {
    id: String,
    status: String,
    #[serde(default)]
    last_error: Option<RunError>,
}

#[derive(Debug, Deserialize)]
struct RunError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    data: Vec<MessageObject>,
}

#[derive(Debug, Deserialize)]
struct MessageObject {
    role: String,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: TextContent },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct TextContent {
    value: String,
}

/// Where a run ended up after polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunPhase {
    Pending,
    Completed,
    Failed,
}

fn run_phase(status: &str) -> RunPhase {
    match status {
        "queued" | "in_progress" | "cancelling" => RunPhase::Pending,
        "completed" => RunPhase::Completed,
        // requires_action means tool calls, which this relay does not serve.
        _ => RunPhase::Failed,
    }
}

/// Text of the newest assistant message produced by `run_id` (messages are
/// listed newest first).
fn extract_reply(list: MessageList, run_id: &str) -> Option<String> {
    let message = list.data.into_iter().find(|m| {
        m.role == "assistant" && m.run_id.as_deref().is_none_or(|id| id == run_id)
    })?;

    let parts: Vec<String> = message
        .content
        .into_iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(text.value),
            ContentPart::Other => None,
        })
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// HTTP-level failure, kept separate from `AskError` so a stale thread (404)
/// can be told apart from other failures.
#[derive(Debug)]
struct ApiFailure {
    status: Option<StatusCode>,
    reason: String,
}

/// Cancels a run upstream when dropped while still armed, so an ask
/// abandoned mid-poll (caller timeout, transport error) does not leave the
/// thread locked by an active run.
struct PendingRun {
    run_id: String,
    cancel: Option<reqwest::RequestBuilder>,
}

impl PendingRun {
    /// The run reached a terminal status; nothing to cancel.
    fn settle(&mut self) {
        self.cancel = None;
    }
}

impl Drop for PendingRun {
    fn drop(&mut self) {
        let Some(cancel) = self.cancel.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let run_id = std::mem::take(&mut self.run_id);
        runtime.spawn(async move {
            match cancel.send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(run_id = %run_id, "Cancelled abandoned run");
                }
                Ok(resp) => warn!(run_id = %run_id, status = %resp.status(), "Run cancel rejected"),
                Err(e) => warn!(run_id = %run_id, error = %e, "Run cancel failed"),
            }
        });
    }
}

// ── OpenAiAssistant ─────────────────────────────────────────────────────

/// Answers through the OpenAI Assistants API.
pub struct OpenAiAssistant {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    poll_interval: Duration,
}

impl OpenAiAssistant {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: OPENAI_API_BASE.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Point at a different API host (proxies, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .bearer_auth(self.api_key.expose_secret())
            .header("OpenAI-Beta", "assistants=v2")
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ApiFailure> {
        let resp = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| ApiFailure {
                status: None,
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiFailure {
                status: Some(status),
                reason: format!("{status}: {body}"),
            });
        }

        resp.json::<T>().await.map_err(|e| ApiFailure {
            status: Some(status),
            reason: format!("malformed body: {e}"),
        })
    }

    async fn create_thread(&self) -> Result<String, ApiFailure> {
        let thread: ThreadObject = self
            .send(
                self.client
                    .post(self.api_url("threads"))
                    .json(&serde_json::json!({})),
            )
            .await?;
        Ok(thread.id)
    }

    async fn add_message(&self, thread_id: &str, body: &str) -> Result<(), ApiFailure> {
        let _: serde_json::Value = self
            .send(
                self.client
                    .post(self.api_url(&format!("threads/{thread_id}/messages")))
                    .json(&serde_json::json!({ "role": "user", "content": body })),
            )
            .await?;
        Ok(())
    }

    async fn create_run(
        &self,
        thread_id: &str,
        assistant: &AssistantRef,
    ) -> Result<RunObject, ApiFailure> {
        self.send(
            self.client
                .post(self.api_url(&format!("threads/{thread_id}/runs")))
                .json(&serde_json::json!({ "assistant_id": assistant.as_str() })),
        )
        .await
    }

    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<RunObject, ApiFailure> {
        self.send(
            self.client
                .get(self.api_url(&format!("threads/{thread_id}/runs/{run_id}"))),
        )
        .await
    }

    fn pending_run(&self, thread_id: &str, run_id: &str) -> PendingRun {
        let url = self.api_url(&format!("threads/{thread_id}/runs/{run_id}/cancel"));
        PendingRun {
            run_id: run_id.to_string(),
            cancel: Some(self.authorize(self.client.post(url))),
        }
    }

    async fn list_messages(&self, thread_id: &str) -> Result<MessageList, ApiFailure> {
        self.send(
            self.client
                .get(self.api_url(&format!("threads/{thread_id}/messages")))
                .query(&[("order", "desc"), ("limit", "10")]),
        )
        .await
    }

    /// Post `body` to the sender's thread, creating a fresh thread when none
    /// is stored or the stored one has been deleted upstream. Returns the
    /// thread id used.
    async fn post_to_thread(
        &self,
        assistant: &AssistantRef,
        body: &str,
        state: &ConversationHandle,
    ) -> Result<String, AskError> {
        let mut conversation = state.load().await;
        let fail = |f: ApiFailure| AskError::RequestFailed {
            assistant: assistant.to_string(),
            reason: f.reason,
        };

        if let Some(thread_id) = conversation.get_str(THREAD_ID_FIELD).map(String::from) {
            match self.add_message(&thread_id, body).await {
                Ok(()) => return Ok(thread_id),
                Err(f) if f.status == Some(StatusCode::NOT_FOUND) => {
                    info!(key = %state.key(), thread_id = %thread_id, "Stored thread is gone; starting a new one");
                }
                Err(f) => return Err(fail(f)),
            }
        }

        let thread_id = self.create_thread().await.map_err(fail)?;
        conversation.set(THREAD_ID_FIELD, thread_id.clone());
        state.save(&conversation).await;
        debug!(key = %state.key(), thread_id = %thread_id, "Created assistant thread");

        self.add_message(&thread_id, body).await.map_err(fail)?;
        Ok(thread_id)
    }
}

#[async_trait]
impl Answerer for OpenAiAssistant {
    fn name(&self) -> &str {
        "openai-assistants"
    }

    async fn ask(
        &self,
        assistant: &AssistantRef,
        body: &str,
        state: &ConversationHandle,
    ) -> Result<String, AskError> {
        let fail = |f: ApiFailure| AskError::RequestFailed {
            assistant: assistant.to_string(),
            reason: f.reason,
        };

        let thread_id = self.post_to_thread(assistant, body, state).await?;
        let mut run = self.create_run(&thread_id, assistant).await.map_err(fail)?;
        let mut pending = self.pending_run(&thread_id, &run.id);

        loop {
            match run_phase(&run.status) {
                RunPhase::Completed => {
                    pending.settle();
                    break;
                }
                RunPhase::Failed => {
                    pending.settle();
                    let detail = run
                        .last_error
                        .as_ref()
                        .map(|e| format!("{} ({}: {})", run.status, e.code, e.message))
                        .unwrap_or_else(|| run.status.clone());
                    return Err(AskError::RunFailed {
                        run_id: run.id,
                        status: detail,
                    });
                }
                RunPhase::Pending => {
                    tokio::time::sleep(self.poll_interval).await;
                    run = self.get_run(&thread_id, &run.id).await.map_err(fail)?;
                }
            }
        }

        let messages = self.list_messages(&thread_id).await.map_err(fail)?;
        extract_reply(messages, &run.id).ok_or(AskError::EmptyReply)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::{Path, State};
    use axum::http::StatusCode as HttpStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    use super::*;
    use crate::sequencer::SenderKey;
    use crate::store::{ConversationState, LibSqlStateStore, StateStore};

    #[test]
    fn run_phases() {
        assert_eq!(run_phase("queued"), RunPhase::Pending);
        assert_eq!(run_phase("in_progress"), RunPhase::Pending);
        assert_eq!(run_phase("completed"), RunPhase::Completed);
        assert_eq!(run_phase("failed"), RunPhase::Failed);
        assert_eq!(run_phase("expired"), RunPhase::Failed);
        assert_eq!(run_phase("requires_action"), RunPhase::Failed);
    }

    #[test]
    fn extract_reply_picks_assistant_message_for_run() {
        let list: MessageList = serde_json::from_value(json!({
            "data": [
                {"role": "assistant", "run_id": "run_2", "content": [
                    {"type": "text", "text": {"value": "first part", "annotations": []}},
                    {"type": "image_file", "image_file": {"file_id": "f"}},
                    {"type": "text", "text": {"value": "second part"}}
                ]},
                {"role": "user", "run_id": null, "content": [
                    {"type": "text", "text": {"value": "question"}}
                ]}
            ]
        }))
        .unwrap();

        let reply = extract_reply(list, "run_2").unwrap();
        assert_eq!(reply, "first part\n\nsecond part");
    }

    #[test]
    fn extract_reply_ignores_other_runs() {
        let list: MessageList = serde_json::from_value(json!({
            "data": [
                {"role": "assistant", "run_id": "run_old", "content": [
                    {"type": "text", "text": {"value": "stale"}}
                ]}
            ]
        }))
        .unwrap();
        assert!(extract_reply(list, "run_new").is_none());
    }

    #[test]
    fn api_url_joins_cleanly() {
        let a = OpenAiAssistant::new(SecretString::from("k")).with_base_url("http://x/v1/");
        assert_eq!(a.api_url("threads"), "http://x/v1/threads");
        assert_eq!(a.api_url("/threads/t/runs"), "http://x/v1/threads/t/runs");
    }

    // ── Mock API server ─────────────────────────────────────────────

    #[derive(Clone, Default)]
    struct Mock {
        threads_created: Arc<AtomicUsize>,
        polls: Arc<AtomicUsize>,
        cancels: Arc<AtomicUsize>,
    }

    async fn create_thread(State(m): State<Mock>) -> Json<Value> {
        let n = m.threads_created.fetch_add(1, Ordering::SeqCst);
        Json(json!({"id": format!("thread_{n}")}))
    }

    async fn add_message(Path(thread): Path<String>) -> Result<Json<Value>, HttpStatus> {
        if thread == "thread_gone" {
            return Err(HttpStatus::NOT_FOUND);
        }
        Ok(Json(json!({"id": "msg_1"})))
    }

    async fn create_run() -> Json<Value> {
        Json(json!({"id": "run_1", "status": "queued"}))
    }

    /// Runs on `thread_stuck` never finish.
    async fn get_run(
        State(m): State<Mock>,
        Path((thread, _run)): Path<(String, String)>,
    ) -> Json<Value> {
        let n = m.polls.fetch_add(1, Ordering::SeqCst);
        let status = if thread == "thread_stuck" || n == 0 {
            "in_progress"
        } else {
            "completed"
        };
        Json(json!({"id": "run_1", "status": status}))
    }

    async fn cancel_run(State(m): State<Mock>) -> Json<Value> {
        m.cancels.fetch_add(1, Ordering::SeqCst);
        Json(json!({"id": "run_1", "status": "cancelling"}))
    }

    async fn list_messages(Path(thread): Path<String>) -> Json<Value> {
        Json(json!({"data": [
            {"role": "assistant", "run_id": "run_1", "content": [
                {"type": "text", "text": {"value": format!("answer on {thread}")}}
            ]}
        ]}))
    }

    async fn start_mock() -> (String, Mock) {
        let mock = Mock::default();
        let app = Router::new()
            .route("/v1/threads", post(create_thread))
            .route(
                "/v1/threads/{thread}/messages",
                post(add_message).get(list_messages),
            )
            .route("/v1/threads/{thread}/runs", post(create_run))
            .route("/v1/threads/{thread}/runs/{run}", get(get_run))
            .route("/v1/threads/{thread}/runs/{run}/cancel", post(cancel_run))
            .with_state(mock.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://127.0.0.1:{port}/v1"), mock)
    }

    fn assistant(base: &str) -> OpenAiAssistant {
        OpenAiAssistant::new(SecretString::from("sk-test"))
            .with_base_url(base)
            .with_poll_interval(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn ask_creates_thread_once_and_reuses_it() {
        let (base, mock) = start_mock().await;
        let store: Arc<dyn StateStore> = Arc::new(LibSqlStateStore::new_memory());
        let handle = ConversationHandle::new(SenderKey::new("web:u"), Arc::clone(&store));
        let openai = assistant(&base);
        let asst = AssistantRef::new("asst_1");

        let first = openai.ask(&asst, "hi", &handle).await.unwrap();
        assert_eq!(first, "answer on thread_0");
        assert_eq!(handle.load().await.get_str(THREAD_ID_FIELD), Some("thread_0"));

        let second = openai.ask(&asst, "again", &handle).await.unwrap();
        assert_eq!(second, "answer on thread_0");
        assert_eq!(mock.threads_created.load(Ordering::SeqCst), 1);
        assert_eq!(mock.cancels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn abandoned_ask_cancels_its_run() {
        let (base, mock) = start_mock().await;
        let store: Arc<dyn StateStore> = Arc::new(LibSqlStateStore::new_memory());
        let handle = ConversationHandle::new(SenderKey::new("web:u"), Arc::clone(&store));
        let mut state = ConversationState::new();
        state.set(THREAD_ID_FIELD, "thread_stuck");
        handle.save(&state).await;

        let openai = assistant(&base);
        let asst = AssistantRef::new("asst_1");
        let outcome =
            tokio::time::timeout(Duration::from_millis(100), openai.ask(&asst, "hi", &handle)).await;
        assert!(outcome.is_err(), "run on thread_stuck should never complete");

        tokio::time::timeout(Duration::from_secs(5), async {
            while mock.cancels.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("abandoned run was not cancelled");
        assert_eq!(mock.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ask_replaces_deleted_thread() {
        let (base, _mock) = start_mock().await;
        let store: Arc<dyn StateStore> = Arc::new(LibSqlStateStore::new_memory());
        let handle = ConversationHandle::new(SenderKey::new("web:u"), Arc::clone(&store));
        let mut stale = ConversationState::new();
        stale.set(THREAD_ID_FIELD, "thread_gone");
        handle.save(&stale).await;

        let reply = assistant(&base)
            .ask(&AssistantRef::new("asst_1"), "hi", &handle)
            .await
            .unwrap();

        assert_eq!(reply, "answer on thread_0");
        assert_eq!(handle.load().await.get_str(THREAD_ID_FIELD), Some("thread_0"));
    }

    #[tokio::test]
    async fn unreachable_api_is_request_failure() {
        let store: Arc<dyn StateStore> = Arc::new(LibSqlStateStore::new_memory());
        let handle = ConversationHandle::new(SenderKey::new("web:u"), store);
        // Port 9 (discard) on localhost is essentially never listening.
        let err = assistant("http://127.0.0.1:9/v1")
            .ask(&AssistantRef::new("asst_1"), "hi", &handle)
            .await
            .unwrap_err();
        assert!(matches!(err, AskError::RequestFailed { .. }));
    }
}
