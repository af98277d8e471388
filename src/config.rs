//! Runtime configuration, read once from the environment at startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::answer::AssistantRef;
use crate::error::ConfigError;
use crate::store::DbTarget;

const DEFAULT_DB_PATH: &str = "./data/assist-relay.db";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_ASK_TIMEOUT_SECS: u64 = 60;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;

/// Assistant id used with the echo answerer, which ignores it.
const OFFLINE_ASSISTANT: &str = "echo";

/// Telegram bot settings. Present only when `TELEGRAM_BOT_TOKEN` is set.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    /// Usernames or numeric ids; `*` allows everyone.
    pub allowed_users: Vec<String>,
}

/// OpenAI Assistants settings. Present only when `OPENAI_API_KEY` is set.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: SecretString,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db: DbTarget,
    pub openai: Option<OpenAiConfig>,
    pub assistant: AssistantRef,
    pub telegram: Option<TelegramConfig>,
    /// Read chat lines from stdin.
    pub enable_cli: bool,
    /// HTTP / WebSocket port.
    pub port: u16,
    /// Upper bound on one answering call.
    pub ask_timeout: Duration,
    /// How long shutdown waits for in-flight drain workers.
    pub shutdown_grace: Duration,
    /// Directory for daily-rolling log files; stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let db = match var("ASSIST_RELAY_DB_URL") {
            Some(url) => {
                let token = var("ASSIST_RELAY_DB_TOKEN")
                    .ok_or_else(|| ConfigError::MissingEnvVar("ASSIST_RELAY_DB_TOKEN".into()))?;
                DbTarget::Remote {
                    url,
                    token: SecretString::from(token),
                }
            }
            None => DbTarget::Local(PathBuf::from(
                var("ASSIST_RELAY_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            )),
        };

        let openai = var("OPENAI_API_KEY").map(|key| OpenAiConfig {
            api_key: SecretString::from(key),
            base_url: var("OPENAI_BASE_URL"),
        });

        let assistant = match (var("ASSIST_RELAY_ASSISTANT_ID"), &openai) {
            (Some(id), _) => AssistantRef::new(id),
            (None, Some(_)) => {
                return Err(ConfigError::MissingEnvVar(
                    "ASSIST_RELAY_ASSISTANT_ID".into(),
                ));
            }
            (None, None) => AssistantRef::new(OFFLINE_ASSISTANT),
        };

        let telegram = var("TELEGRAM_BOT_TOKEN").map(|token| TelegramConfig {
            bot_token: SecretString::from(token),
            allowed_users: parse_list(&var("TELEGRAM_ALLOWED_USERS").unwrap_or_else(|| "*".into())),
        });

        let enable_cli = parse_or("ASSIST_RELAY_CLI", var("ASSIST_RELAY_CLI"), true)?;
        let port = parse_or("PORT", var("PORT"), DEFAULT_PORT)?;
        let ask_timeout_secs = parse_or(
            "ASSIST_RELAY_ASK_TIMEOUT_SECS",
            var("ASSIST_RELAY_ASK_TIMEOUT_SECS"),
            DEFAULT_ASK_TIMEOUT_SECS,
        )?;
        if ask_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ASSIST_RELAY_ASK_TIMEOUT_SECS".into(),
                message: "must be at least 1".into(),
            });
        }
        let shutdown_grace_secs = parse_or(
            "ASSIST_RELAY_SHUTDOWN_GRACE_SECS",
            var("ASSIST_RELAY_SHUTDOWN_GRACE_SECS"),
            DEFAULT_SHUTDOWN_GRACE_SECS,
        )?;

        Ok(Self {
            db,
            openai,
            assistant,
            telegram,
            enable_cli,
            port,
            ask_timeout: Duration::from_secs(ask_timeout_secs),
            shutdown_grace: Duration::from_secs(shutdown_grace_secs),
            log_dir: var("ASSIST_RELAY_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
