//! `wintermute-gateway` binary: wires every component together behind a
//! small `clap` CLI (SPEC_FULL §A.5).
//!
//! `serve` runs the long-lived gateway process. The other subcommands are
//! one-shot operator utilities that either touch local state directly
//! (`token hash`, `policy init`) or talk to an already-running `serve`
//! process over the loopback transport (`pair`, `status`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use wintermute_gateway::approval_flow::ApprovalFlow;
use wintermute_gateway::audit::{self, AuditLogger};
use wintermute_gateway::auth::{hash_token, AuthManager};
use wintermute_gateway::config::Config;
use wintermute_gateway::events::EventBus;
use wintermute_gateway::executor::Executor;
use wintermute_gateway::gateway::Gateway;
use wintermute_gateway::logging;
use wintermute_gateway::orchestrator::{TaskHandle, TaskOrchestrator};
use wintermute_gateway::planner::Planner;
use wintermute_gateway::policy::CommandPolicy;
use wintermute_gateway::registry::ToolRegistry;
use wintermute_gateway::replanner::Replanner;
use wintermute_gateway::runtime::{RuntimeLimits, ToolRuntime};
use wintermute_gateway::session::SessionStore;
use wintermute_gateway::transport::client::TransportClient;
use wintermute_gateway::transport::TransportServer;

/// Tool id reserved for the privileged shell-command tool the command
/// policy governs (spec §4.4). Tool implementations beyond the registry
/// entry itself are registered by whatever process owns them, not here.
const COMMAND_TOOL_ID: &str = "system.run";

#[derive(Parser)]
#[command(name = "wintermute-gateway", about = "Local-first JSON-RPC gateway for LLM-driven agents")]
struct Cli {
    /// Path to `gateway.toml`. Defaults to `$HOME/.moonbot/gateway.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway: bind the transport and serve requests until signaled.
    Serve,
    /// Issue a one-time pairing code for a new surface identity.
    Pair {
        /// User id the code will bind to.
        #[arg(long)]
        user: String,
        /// Code lifetime in seconds.
        #[arg(long, default_value_t = 900)]
        ttl_secs: u64,
    },
    /// Hash a bearer token for `gateway.toml`'s `token_hashes`.
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
    /// Write a starter command policy file if one doesn't already exist.
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },
    /// Query a running gateway's operator status summary.
    Status,
}

#[derive(Subcommand)]
enum TokenAction {
    /// Print the SHA-256 hex digest of `token`.
    Hash {
        /// The raw bearer token.
        token: String,
    },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Write the default allow/deny policy to the configured policy file.
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => serve(cli.config.as_deref()).await,
        Commands::Pair { user, ttl_secs } => {
            logging::init_cli();
            pair(cli.config.as_deref(), &user, ttl_secs).await
        }
        Commands::Token {
            action: TokenAction::Hash { token },
        } => {
            logging::init_cli();
            println!("{}", hash_token(&token));
            Ok(())
        }
        Commands::Policy {
            action: PolicyAction::Init,
        } => {
            logging::init_cli();
            policy_init(cli.config.as_deref())
        }
        Commands::Status => {
            logging::init_cli();
            status(cli.config.as_deref()).await
        }
    }
}

/// Build every component and serve the loopback transport until `ctrl_c`
/// (or another process signal) requests shutdown, then drain in-flight
/// work before exiting (SPEC_FULL §B.3).
async fn serve(config_path: Option<&std::path::Path>) -> Result<()> {
    let config = Config::load(config_path).context("failed to load configuration")?;
    let _logging_guard = logging::init_production(&config.logs_dir)?;

    tracing::info!(bind = %config.bind_addr, port = config.bind_port, "starting wintermute-gateway");

    let policy = CommandPolicy::load(&config.policy_file, &config.workspace_root)
        .context("failed to load command policy")?;

    let registry = ToolRegistry::new();
    let bus = EventBus::new();

    let approval_store = config.data_dir.join("approvals.json");
    let approval_flow = ApprovalFlow::new(approval_store, config.approval_expiry, bus.clone())
        .await
        .context("failed to load approval store")?;

    let runtime = ToolRuntime::new(
        registry.clone(),
        approval_flow.clone(),
        bus.clone(),
        RuntimeLimits {
            default_timeout: config.default_timeout,
            invocation_ttl: config.invocation_ttl,
            max_concurrent: config.max_concurrent_invocations,
        },
        Some((COMMAND_TOOL_ID.to_string(), policy)),
    );

    let sessions = SessionStore::new(config.data_dir.clone());
    let planner = Planner::new(registry.clone(), None).with_workspace_root(config.workspace_root.clone());
    let handle = TaskHandle::new(bus.clone());
    let executor = Executor::new(
        runtime.clone(),
        sessions.clone(),
        Replanner::default(),
        handle.clone(),
        bus.clone(),
    );
    let orchestrator = TaskOrchestrator::new(handle, sessions.clone(), planner, executor, bus.clone());
    let auth = AuthManager::new(config.token_hashes.clone(), config.allow_legacy_tokens, bus.clone());

    let gateway = Gateway::new(registry, runtime.clone(), approval_flow.clone(), sessions, orchestrator, auth);

    let audit_logger = Arc::new(AuditLogger::open(&config.data_dir.join("audit.log"))?);
    audit::spawn_subscriber(audit_logger, &bus);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cleanup_handle = tokio::spawn(cleanup_sweep(runtime, approval_flow, config.cleanup_interval, shutdown_rx.clone()));

    let server = TransportServer::new(gateway, bus, config.bind_addr, config.bind_port, config.default_timeout);
    let serve_handle = tokio::spawn(server.serve(shutdown_rx));

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl_c")?;
    tracing::info!("shutdown requested, draining in-flight work");
    let _ = shutdown_tx.send(true);

    serve_handle.await.context("transport task panicked")??;
    cleanup_handle.await.context("cleanup sweep task panicked")?;

    tracing::info!("wintermute-gateway stopped");
    Ok(())
}

/// Periodically force-fail invocations past their TTL and expire stale
/// approval requests (spec §4.5, §4.6), until told to stop.
async fn cleanup_sweep(
    runtime: ToolRuntime,
    approval_flow: ApprovalFlow,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let expired_invocations = runtime.sweep_expired().await;
                if !expired_invocations.is_empty() {
                    tracing::debug!(count = expired_invocations.len(), "swept TTL-expired invocations");
                }
                let expired_approvals = approval_flow.sweep_expired(chrono::Utc::now()).await;
                if !expired_approvals.is_empty() {
                    tracing::debug!(count = expired_approvals.len(), "swept expired approval requests");
                    for request in &expired_approvals {
                        if let Err(err) = runtime.approve_request(request.invocation_id, false).await {
                            tracing::warn!(invocation_id = %request.invocation_id, error = %err, "failed to fail invocation for expired approval");
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Connect to a running gateway and issue a pairing code for `user`.
async fn pair(config_path: Option<&std::path::Path>, user: &str, ttl_secs: u64) -> Result<()> {
    let client = connect_cli_client(config_path).await?;
    let result = client
        .pair(user, Duration::from_secs(ttl_secs))
        .await
        .context("auth.pair failed")?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Connect to a running gateway and print its operator status summary.
async fn status(config_path: Option<&std::path::Path>) -> Result<()> {
    let client = connect_cli_client(config_path).await?;
    let result: serde_json::Value = client
        .call("status", serde_json::json!({}))
        .await
        .context("status call failed")?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Write the default command policy file, refusing to clobber an existing one.
fn policy_init(config_path: Option<&std::path::Path>) -> Result<()> {
    let config = Config::load(config_path).context("failed to load configuration")?;
    if config.policy_file.exists() {
        bail!("policy file {} already exists; remove it first", config.policy_file.display());
    }
    let policy = CommandPolicy::default_for(&config.workspace_root);
    if let Some(parent) = config.policy_file.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(&config.policy_file, policy.to_json()?)
        .with_context(|| format!("failed to write {}", config.policy_file.display()))?;
    println!("wrote default command policy to {}", config.policy_file.display());
    Ok(())
}

/// Connect a [`TransportClient`] for a one-shot CLI call. The raw bearer
/// token is never recoverable from `gateway.toml`'s stored hash, so these
/// calls rely on `allow_legacy_tokens` or an operator exporting
/// `WINTERMUTE_GATEWAY_TOKEN` out of band. Retries briefly since `serve`
/// may still be starting up.
async fn connect_cli_client(config_path: Option<&std::path::Path>) -> Result<TransportClient> {
    let config = Config::load(config_path).context("failed to load configuration")?;
    let token = std::env::var("WINTERMUTE_GATEWAY_TOKEN").unwrap_or_default();
    let addr = SocketAddr::new(config.bind_addr, config.bind_port);
    let client = TransportClient::connect(addr, token, "cli".to_string(), env!("CARGO_PKG_VERSION").to_string());

    for _ in 0..25 {
        if client
            .call_raw("tools.list", serde_json::json!({}))
            .await
            .is_ok()
        {
            return Ok(client);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    bail!("could not reach gateway at {addr}; is `wintermute-gateway serve` running?");
}
