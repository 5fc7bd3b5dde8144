//! Agent feed CLI.
//!
//! Replays recorded feeds, watches live tasks and answers approval requests.

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use dotenvy::dotenv;
use serde_json::Value;
use tracing::info;

use agent_feed::approval::ApprovalDecision;
use agent_feed::backend::{HttpBackend, TaskSnapshot, TaskSource, TraceSource};
use agent_feed::config::{AppConfig, Cli, Command};
use agent_feed::feed::PersistedItem;
use agent_feed::session::ConversationContext;
use agent_feed::telemetry;

/// Task id used for offline replays.
const REPLAY_TASK_ID: &str = "replay";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env (if present)
    let _ = dotenv();

    let cli = Cli::parse();
    let config = AppConfig::from_cli(&cli).context("Failed to load configuration")?;
    telemetry::init(&config.logging).context("Failed to initialize logging")?;

    match cli.command {
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
        Some(Command::Replay { events, persisted }) => replay(&config, &events, persisted.as_deref()),
        Some(Command::Watch { task }) => watch(&config, &task).await,
        Some(Command::Approve { task, approval }) => {
            decide(&config, &task, &approval, ApprovalDecision::Approve).await
        }
        Some(Command::Deny { task, approval }) => {
            decide(&config, &task, &approval, ApprovalDecision::Deny).await
        }
    }
}

fn replay(config: &AppConfig, events: &Path, persisted: Option<&Path>) -> Result<()> {
    let raws = read_event_lines(events)?;
    let items = match persisted {
        Some(path) => read_persisted(path)?,
        None => Vec::new(),
    };
    info!(events = raws.len(), persisted = items.len(), "Replaying feed");

    let mut ctx = ConversationContext::new(config.polling.interval());
    let generation = ctx.load(TaskSnapshot {
        task_id: REPLAY_TASK_ID.to_string(),
        agent_correlation_id: REPLAY_TASK_ID.to_string(),
        items,
    });
    let applied = ctx.ingest(generation, &raws)?;
    info!(applied, "Replay folded");

    println!("{}", serde_json::to_string_pretty(&ctx.conversation())?);
    Ok(())
}

/// One JSON record per line; blank and malformed lines are skipped.
fn read_event_lines(path: &Path) -> Result<Vec<Value>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read events from {}", path.display()))?;
    let mut raws = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(raw) => raws.push(raw),
            Err(err) => tracing::warn!(line = line_no + 1, error = %err, "Skipping malformed event line"),
        }
    }
    Ok(raws)
}

/// Either a bare item array or a full task snapshot.
fn read_persisted(path: &Path) -> Result<Vec<PersistedItem>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read persisted items from {}", path.display()))?;
    let value: Value = serde_json::from_str(&text).context("Persisted file is not JSON")?;
    if value.is_array() {
        return serde_json::from_value(value).context("Invalid persisted item list");
    }
    let snapshot: TaskSnapshot =
        serde_json::from_value(value).context("Invalid persisted task snapshot")?;
    Ok(snapshot.items)
}

async fn watch(config: &AppConfig, task_id: &str) -> Result<()> {
    let backend = Arc::new(HttpBackend::from_config(&config.backend)?);
    let mut ctx = ConversationContext::new(config.polling.interval());
    ctx.open(backend.as_ref(), task_id).await?;
    print_conversation(&mut ctx)?;

    if !config.polling.enabled {
        return Ok(());
    }

    let source: Arc<dyn TraceSource> = Arc::<HttpBackend>::clone(&backend);
    let mut updates = ctx.start_trace_polling(source)?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping watch");
                break;
            }
            update = updates.recv() => {
                let Some(update) = update else { break };
                if !ctx.accept_traces(update) {
                    continue;
                }
                match backend.load_task(task_id).await {
                    Ok(snapshot) => ctx.replace_persisted(snapshot.items),
                    Err(err) => tracing::warn!(error = %err, "Failed to refresh persisted items"),
                }
                print_conversation(&mut ctx)?;
            }
        }
    }
    ctx.reset();
    Ok(())
}

async fn decide(
    config: &AppConfig,
    task_id: &str,
    approval_id: &str,
    decision: ApprovalDecision,
) -> Result<()> {
    let backend = HttpBackend::from_config(&config.backend)?;
    let mut ctx = ConversationContext::new(config.polling.interval());
    ctx.open(&backend, task_id).await?;
    let status = ctx
        .decide_approval(approval_id, decision, &backend)
        .await
        .with_context(|| format!("Approval {approval_id} was not applied"))?;
    println!("{}", serde_json::to_string(&status)?);
    Ok(())
}

fn print_conversation(ctx: &mut ConversationContext) -> Result<()> {
    println!("{}", serde_json::to_string(&ctx.conversation())?);
    Ok(())
}
