//! Sentinel daemon CLI: spawns the downstream tool-execution server behind
//! the interceptor, and exposes operator subcommands for rules, mode,
//! quarantine, and audit verification against the same store.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use toolsentinel::config::Config;
use toolsentinel::store::quarantine::QuarantineEntry;
use toolsentinel::store::rules::Rule;
use toolsentinel::types::{Action, Mode, QuarantineScope};
use toolsentinel::{Interceptor, Store};
use tracing::{info, Level};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "toolsentineld")]
#[command(about = "Policy-aware security sentinel for AI agent tool calls")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Spawn the downstream server and start intercepting tool calls.
    Run,
    /// Set the process-wide policy mode.
    SetMode {
        /// One of silent-allow, alert, silent-deny, lockdown.
        mode: String,
    },
    /// Show the current policy mode.
    ShowMode,
    /// List all configured rules.
    ListRules,
    /// Add an allow/deny/ask rule.
    AddRule {
        #[arg(long)]
        name: String,
        #[arg(long, default_value_t = 100)]
        priority: i64,
        #[arg(long)]
        action: String,
        #[arg(long)]
        tool_pattern: Option<String>,
        #[arg(long)]
        host_pattern: Option<String>,
        #[arg(long)]
        agent_pattern: Option<String>,
    },
    /// Quarantine a host, tool, or agent.
    Quarantine {
        scope: String,
        target: String,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        ttl_seconds: Option<i64>,
    },
    /// Verify the audit log's hash chain.
    VerifyAudit,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config_path = cli.config.unwrap_or_else(Config::default_config_path);
    let config = Config::load(&config_path)?;

    let store = std::sync::Arc::new(Store::open(&config.store_path)?);

    match cli.command {
        Commands::Run => run(store, &config).await,
        Commands::SetMode { mode } => set_mode(store, &mode).await,
        Commands::ShowMode => show_mode(store).await,
        Commands::ListRules => list_rules(store).await,
        Commands::AddRule {
            name,
            priority,
            action,
            tool_pattern,
            host_pattern,
            agent_pattern,
        } => add_rule(store, name, priority, action, tool_pattern, host_pattern, agent_pattern).await,
        Commands::Quarantine {
            scope,
            target,
            reason,
            ttl_seconds,
        } => quarantine(store, scope, target, reason, ttl_seconds).await,
        Commands::VerifyAudit => verify_audit(store).await,
    }
}

async fn run(store: std::sync::Arc<Store>, config: &Config) -> Result<()> {
    info!(command = %config.downstream_command, "spawning downstream tool-execution server");
    let (interceptor, mut child) =
        Interceptor::spawn(store, &config.downstream_command, &config.downstream_args).await?;
    let interceptor = std::sync::Arc::new(interceptor);

    info!("sentinel running; reading tool calls from stdin");
    tokio::select! {
        result = interceptor.serve(tokio::io::stdin(), tokio::io::stdout()) => {
            result?;
        }
        status = child.wait() => {
            info!(?status, "downstream process exited");
        }
    }
    Ok(())
}

async fn set_mode(store: std::sync::Arc<Store>, mode: &str) -> Result<()> {
    let parsed = Mode::parse(mode)?;
    store.set_mode(parsed).await?;
    println!("mode set to {}", parsed);
    Ok(())
}

async fn show_mode(store: std::sync::Arc<Store>) -> Result<()> {
    let mode = store.get_mode().await?;
    println!("{mode}");
    Ok(())
}

async fn list_rules(store: std::sync::Arc<Store>) -> Result<()> {
    let rules = store.list_rules().await?;
    for rule in rules {
        println!(
            "{:<36} priority={:<5} action={:<8} enabled={} tool={:?} host={:?} agent={:?}",
            rule.id,
            rule.priority,
            rule.action.as_str(),
            rule.enabled,
            rule.tool_pattern,
            rule.host_pattern,
            rule.agent_pattern
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn add_rule(
    store: std::sync::Arc<Store>,
    name: String,
    priority: i64,
    action: String,
    tool_pattern: Option<String>,
    host_pattern: Option<String>,
    agent_pattern: Option<String>,
) -> Result<()> {
    let action = Action::parse(&action)?;
    let now = chrono::Utc::now();
    let rule = Rule {
        id: Uuid::new_v4().to_string(),
        name,
        priority,
        action,
        enabled: true,
        tool_pattern,
        host_pattern,
        agent_pattern,
        argument_pattern: None,
        rate_limit: None,
        schedule: None,
        created_at: now,
        updated_at: now,
    };
    store.upsert_rule(&rule).await?;
    println!("added rule {}", rule.id);
    Ok(())
}

async fn quarantine(
    store: std::sync::Arc<Store>,
    scope: String,
    target: String,
    reason: String,
    ttl_seconds: Option<i64>,
) -> Result<()> {
    let scope = QuarantineScope::parse(&scope)?;
    let now_ms = toolsentinel::PolicyContext::now_ms();
    let entry = QuarantineEntry {
        scope,
        target: target.clone(),
        reason,
        created_at: now_ms,
        expires_at: ttl_seconds.map(|s| now_ms + s * 1_000),
        created_by: Some("cli".to_string()),
    };
    store.upsert_quarantine(&entry).await?;
    println!("quarantined {} {}", scope.as_str(), target);
    Ok(())
}

async fn verify_audit(store: std::sync::Arc<Store>) -> Result<()> {
    let report = store.verify_audit_chain().await?;
    println!(
        "valid={} total_entries={} broken_chains={}",
        report.valid,
        report.total_entries,
        report.broken_chains.len()
    );
    for broken in &report.broken_chains {
        println!("  seq={} kind={:?} expected={} actual={}", broken.sequence_number, broken.kind, broken.expected, broken.actual);
    }
    if !report.valid {
        std::process::exit(1);
    }
    Ok(())
}
