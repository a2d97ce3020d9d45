//! Auth & Pairing scenarios (spec §4.10, invariant 5) through the Gateway
//! Facade, plus a CLI smoke test for `wintermute-gateway token hash`.

use std::time::Duration;

use assert_cmd::Command;
use tempfile::tempdir;

use wintermute_gateway::approval_flow::ApprovalFlow;
use wintermute_gateway::auth::{hash_token, AuthManager};
use wintermute_gateway::events::EventBus;
use wintermute_gateway::executor::Executor;
use wintermute_gateway::gateway::{ConnectParams, Gateway};
use wintermute_gateway::orchestrator::{TaskHandle, TaskOrchestrator};
use wintermute_gateway::planner::Planner;
use wintermute_gateway::policy::CommandPolicy;
use wintermute_gateway::registry::ToolRegistry;
use wintermute_gateway::replanner::Replanner;
use wintermute_gateway::runtime::{RuntimeLimits, ToolRuntime};
use wintermute_gateway::session::SessionStore;

async fn gateway_with_token(token: &str) -> Gateway {
    let dir = tempdir().unwrap();
    let registry = ToolRegistry::new();
    let bus = EventBus::new();
    let approval_flow = ApprovalFlow::new(dir.path().join("approvals.json"), Duration::from_secs(900), bus.clone())
        .await
        .unwrap();
    let runtime = ToolRuntime::new(
        registry.clone(),
        approval_flow.clone(),
        bus.clone(),
        RuntimeLimits {
            default_timeout: Duration::from_secs(5),
            invocation_ttl: Duration::from_secs(600),
            max_concurrent: 4,
        },
        None::<(String, CommandPolicy)>,
    );
    let sessions = SessionStore::new(dir.path().to_path_buf());
    let planner = Planner::new(registry.clone(), None);
    let handle = TaskHandle::new(bus.clone());
    let executor = Executor::new(
        runtime.clone(),
        sessions.clone(),
        Replanner::default(),
        handle.clone(),
        bus.clone(),
    );
    let orchestrator = TaskOrchestrator::new(handle, sessions.clone(), planner, executor, bus.clone());
    let auth = AuthManager::new(vec![hash_token(token)], false, bus);

    Gateway::new(registry, runtime, approval_flow, sessions, orchestrator, auth)
}

#[tokio::test]
async fn connect_accepts_a_token_matching_the_configured_hash() {
    let gateway = gateway_with_token("s3cret").await;
    let result = gateway
        .connect(ConnectParams {
            client_type: "cli".to_string(),
            version: "1.0".to_string(),
            token: "s3cret".to_string(),
        })
        .unwrap();
    assert!(result.authenticated);
}

#[tokio::test]
async fn connect_rejects_an_unknown_token() {
    let gateway = gateway_with_token("s3cret").await;
    let err = gateway
        .connect(ConnectParams {
            client_type: "cli".to_string(),
            version: "1.0".to_string(),
            token: "wrong".to_string(),
        })
        .unwrap_err();
    assert!(matches!(
        err,
        wintermute_gateway::error::GatewayError::Auth(wintermute_gateway::error::AuthError::InvalidToken)
    ));
}

/// Invariant 5: a pairing code is consumed exactly once, even though it
/// hasn't expired yet.
#[tokio::test]
async fn pairing_code_cannot_be_replayed() {
    let gateway = gateway_with_token("s3cret").await;
    let pairing = gateway.pair("alice", Duration::from_secs(900)).await;

    let user = gateway.approve_pairing(&pairing.code).await.unwrap();
    assert_eq!(user, "alice");

    let replay = gateway.approve_pairing(&pairing.code).await;
    assert!(replay.is_err());
}

#[tokio::test]
async fn unknown_pairing_code_is_rejected() {
    let gateway = gateway_with_token("s3cret").await;
    let err = gateway.approve_pairing("not-a-real-code").await.unwrap_err();
    assert!(matches!(
        err,
        wintermute_gateway::error::GatewayError::Auth(wintermute_gateway::error::AuthError::InvalidPairingCode)
    ));
}

#[test]
fn token_hash_subcommand_prints_the_sha256_digest() {
    let mut cmd = Command::cargo_bin("wintermute-gateway").unwrap();
    cmd.args(["token", "hash", "s3cret"]);
    cmd.assert().success().stdout(format!("{}\n", hash_token("s3cret")));
}
