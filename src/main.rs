use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use tokio::sync::Semaphore;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use chat_router::channels::TelegramChannel;
use chat_router::config::RouterConfig;
use chat_router::dispatch::{ActionDispatcher, AnswerAssembler};
use chat_router::llm::{
    LlmAnswerGenerator, LlmBackend, LlmConfig, LlmLanguageGate, LlmMatchJudge, create_provider,
};
use chat_router::memory::InMemoryConversationMemory;
use chat_router::pipeline::MessageProcessor;
use chat_router::pipeline::types::ConversationMemory;
use chat_router::prompts::PromptLibrary;
use chat_router::router::DecisionResolver;
use chat_router::rules::{ConditionMatcher, MatchJudge, RuleStore};

/// Stderr logging, plus a daily rolling file when `log_dir` is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_target(false).with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "chat-router.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RouterConfig::from_env().context("failed to read configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("📨 Chat Router v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.model);
    eprintln!("   Rules: {}", config.rules_path.display());
    eprintln!("   Prompts: {}", config.prompts_path.display());
    eprintln!(
        "   No-match policy: {}",
        if config.reply_on_no_match { "default reply" } else { "suppress" }
    );
    eprintln!(
        "   Language gate: {}\n",
        if config.language_gate { "on" } else { "off" }
    );

    // ── LLM ─────────────────────────────────────────────────────────
    let llm = create_provider(&LlmConfig {
        backend: LlmBackend::for_model(&config.model),
        api_key: config.llm_api_key.clone(),
        model: config.model.clone(),
    })?;

    // ── Rules and prompts ───────────────────────────────────────────
    let store = Arc::new(
        RuleStore::open(&config.rules_path)
            .with_context(|| format!("failed to load rules from {}", config.rules_path.display()))?,
    );
    let prompts = Arc::new(PromptLibrary::load(&config.prompts_path));

    // ── Telegram ────────────────────────────────────────────────────
    let telegram = Arc::new(TelegramChannel::new(config.telegram_token.clone()));
    telegram.health_check().await?;

    // ── Pipeline ────────────────────────────────────────────────────
    let memory: Arc<dyn ConversationMemory> =
        Arc::new(InMemoryConversationMemory::new(config.history_length));

    let judge: Arc<dyn MatchJudge> = Arc::new(LlmMatchJudge::new(Arc::clone(&llm)));
    let resolver = DecisionResolver::new(
        store,
        ConditionMatcher::new(Some(judge), config.judge_timeout),
        config.no_match_policy(),
    );

    let answers = AnswerAssembler::new(prompts, Arc::new(LlmAnswerGenerator::new(Arc::clone(&llm))))
        .with_memory(Arc::clone(&memory))
        .with_timeouts(config.retrieval_timeout, config.generation_timeout);
    let dispatcher = ActionDispatcher::new(telegram.clone(), telegram.clone(), answers)
        .with_memory(Arc::clone(&memory))
        .with_forward_timeout(config.forward_timeout);

    let mut processor = MessageProcessor::new(resolver, dispatcher, telegram.clone())
        .with_memory(memory)
        .with_admins(config.admin_user_ids.clone());
    if config.language_gate {
        processor = processor.with_language_gate(Arc::new(LlmLanguageGate::new(llm)));
    }
    let processor = Arc::new(processor);

    // ── Message loop ────────────────────────────────────────────────
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
    let mut messages = telegram.listen();

    loop {
        tokio::select! {
            next = messages.next() => {
                let Some(message) = next else {
                    tracing::warn!("Telegram message stream ended");
                    break;
                };
                let permit = Arc::clone(&semaphore).acquire_owned().await?;
                let processor = Arc::clone(&processor);
                tokio::spawn(async move {
                    processor.handle_message(&message).await;
                    drop(permit);
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
                break;
            }
        }
    }

    Ok(())
}
