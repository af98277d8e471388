use std::sync::Arc;

use anyhow::Context;

use assist_relay::agent::Agent;
use assist_relay::answer::{Answerer, EchoAnswerer, OpenAiAssistant};
use assist_relay::channels::{ChannelManager, CliChannel, TelegramChannel, WebChannel};
use assist_relay::config::AppConfig;
use assist_relay::dispatch::{Dispatcher, ProfileCache, ReplyProcessor};
use assist_relay::sequencer::Sequencer;
use assist_relay::store::{LibSqlStateStore, StateStore};
use assist_relay::{logging, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    let _log_guard =
        logging::init(config.log_dir.as_deref()).context("failed to set up logging")?;

    eprintln!("🤖 Assist Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db);
    eprintln!("   Chat WS: ws://0.0.0.0:{}/ws/chat?user=<id>", config.port);
    eprintln!("   Health: http://0.0.0.0:{}/health", config.port);

    // ── State store (opened lazily on first use) ────────────────────────
    let store: Arc<dyn StateStore> = Arc::new(LibSqlStateStore::new(config.db.clone()));

    // ── Answering assistant ─────────────────────────────────────────────
    let answerer: Arc<dyn Answerer> = match &config.openai {
        Some(openai) => {
            let mut assistant = OpenAiAssistant::new(openai.api_key.clone());
            if let Some(base) = &openai.base_url {
                assistant = assistant.with_base_url(base.clone());
            }
            Arc::new(assistant)
        }
        None => {
            eprintln!("   Warning: OPENAI_API_KEY not set, replies are echoed back");
            Arc::new(EchoAnswerer)
        }
    };
    eprintln!("   Assistant: {} ({})", config.assistant, answerer.name());

    // ── Dispatch ────────────────────────────────────────────────────────
    let profiles = Arc::new(ProfileCache::new());
    let processor = Arc::new(ReplyProcessor::new(
        answerer,
        config.assistant.clone(),
        Arc::clone(&store),
        Arc::clone(&profiles),
        config.ask_timeout,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(Sequencer::new()),
        processor,
        store,
        profiles,
    ));

    // ── Channels ────────────────────────────────────────────────────────
    let mut channels = ChannelManager::new();

    let web_channel = WebChannel::new();
    let web_router = web_channel.router();
    channels.add(Box::new(web_channel));

    if config.enable_cli {
        channels.add(Box::new(CliChannel::new()));
    }

    if let Some(telegram) = &config.telegram {
        eprintln!(
            "   Telegram: enabled (allowed: {})",
            if telegram.allowed_users.iter().any(|u| u == "*") {
                "everyone".to_string()
            } else {
                telegram.allowed_users.join(", ")
            }
        );
        channels.add(Box::new(TelegramChannel::new(
            telegram.bot_token.clone(),
            telegram.allowed_users.clone(),
        )));
    }

    eprintln!("   Channels: {}\n", channels.names().join(", "));
    let channels = Arc::new(channels);

    // ── HTTP server ─────────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    let app = server::routes(Arc::clone(&dispatcher), Arc::clone(&channels)).merge(web_router);
    tokio::spawn(async move {
        if let Err(e) = server::serve(listener, app).await {
            tracing::error!(error = %e, "HTTP server stopped");
        }
    });

    // ── Run ─────────────────────────────────────────────────────────────
    let agent = Agent::new(dispatcher, channels, config.shutdown_grace);
    agent.run().await?;

    Ok(())
}
