//! Multi-session scenarios run against both store backends.

use chrono::{Duration, Utc};
use concord_core::{
    FileStore, IdentitySource, Kernel, KernelConfig, LeaseStore, ManualClock,
    SessionIdentity, SqliteStore,
};
use concord_hook_protocol::{Decision, HookEvent};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

const PROJECT: &str = "/work/shop";

fn identity(id: &str) -> SessionIdentity {
    SessionIdentity {
        session_id: id.to_string(),
        project_path: PROJECT.to_string(),
        source: IdentitySource::Host,
        label: None,
    }
}

fn config() -> KernelConfig {
    let mut config = KernelConfig::default();
    config.sweep.one_in = 0;
    config
}

fn file_store(dir: &TempDir) -> Box<dyn LeaseStore> {
    Box::new(FileStore::new(dir.path(), Duration::hours(4)).expect("file store"))
}

fn sqlite_store(dir: &TempDir) -> Box<dyn LeaseStore> {
    Box::new(SqliteStore::new(dir.path().join("concord.db")).expect("sqlite store"))
}

fn write(path: &str) -> HookEvent {
    HookEvent::PreToolUse {
        tool_name: "Write".to_string(),
        tool_input: json!({"file_path": path, "content": "x"}),
    }
}

fn prompt(text: &str) -> HookEvent {
    HookEvent::UserPromptSubmit {
        prompt: text.to_string(),
    }
}

fn spawn(agent: &str) -> HookEvent {
    HookEvent::PreToolUse {
        tool_name: "Task".to_string(),
        tool_input: json!({"subagent_type": agent, "prompt": "do it"}),
    }
}

fn two_sessions_share_a_project(store: Box<dyn LeaseStore>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let kernel = Kernel::new(config(), store, clock.clone()).expect("kernel");
    let alpha = identity("alpha001");
    let bravo = identity("bravo002");

    assert_eq!(kernel.handle(&HookEvent::SessionStart, &alpha), Decision::Allow);
    clock.advance(Duration::seconds(40));
    assert!(matches!(
        kernel.handle(&HookEvent::SessionStart, &bravo),
        Decision::Advisory { .. }
    ));

    // Claims: first writer wins, second is denied while the first is live.
    assert_eq!(kernel.handle(&write("/work/shop/src/cart.rs"), &alpha), Decision::Allow);
    assert!(kernel.handle(&write("/work/shop/src/cart.rs"), &bravo).is_deny());
    assert_eq!(kernel.handle(&write("/work/shop/src/order.rs"), &bravo), Decision::Allow);

    let status = kernel.status(&alpha);
    assert_eq!(status.open_claims.len(), 1);
    assert_eq!(status.active_peers.len(), 1);
    assert_eq!(status.active_peers[0].session_id, "bravo002");

    // Workflow gates are per session.
    kernel.handle(&prompt("orchestrate: implement discount codes"), &bravo);
    assert!(kernel.handle(&spawn("implementer"), &bravo).is_deny());
    assert_eq!(kernel.handle(&spawn("implementer"), &alpha), Decision::Allow);
    assert_eq!(kernel.status(&alpha).orchestration_phase, "inactive");
    assert_eq!(kernel.status(&bravo).orchestration_phase, "recon_pending");

    // Ending a session frees its files.
    kernel.handle(&HookEvent::SessionEnd, &alpha);
    assert_eq!(kernel.handle(&write("/work/shop/src/cart.rs"), &bravo), Decision::Allow);
    assert!(kernel.status(&alpha).open_claims.is_empty());

    // A day later nothing is live and the sweep clears it all out.
    clock.advance(Duration::hours(25));
    assert!(kernel.status(&bravo).active_peers.is_empty());
    let stats = kernel.sweep().expect("sweep");
    assert_eq!(stats.sessions_removed, 2);
    assert!(kernel.store().get_session("bravo002").expect("read").is_none());
}

#[test]
fn two_sessions_share_a_project_file_backend() {
    let dir = TempDir::new().unwrap();
    two_sessions_share_a_project(file_store(&dir));
}

#[test]
fn two_sessions_share_a_project_sqlite_backend() {
    let dir = TempDir::new().unwrap();
    two_sessions_share_a_project(sqlite_store(&dir));
}

fn delegation_blocks_code_but_not_plans(store: Box<dyn LeaseStore>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let kernel = Kernel::new(config(), store, clock.clone()).expect("kernel");
    let me = identity("carol003");
    kernel.handle(&HookEvent::SessionStart, &me);

    assert!(matches!(
        kernel.handle(&prompt("enable delegation mode"), &me),
        Decision::Advisory { .. }
    ));
    assert!(kernel.handle(&write("/work/shop/src/cart.rs"), &me).is_deny());
    assert_eq!(kernel.handle(&write("/work/shop/PLAN.md"), &me), Decision::Allow);

    let test_run = HookEvent::PreToolUse {
        tool_name: "Bash".to_string(),
        tool_input: json!({"command": "cargo test --workspace"}),
    };
    assert!(kernel.handle(&test_run, &me).is_deny());

    // TTL lapses without activity: the gate turns itself off.
    clock.advance(Duration::hours(2));
    assert_eq!(kernel.handle(&test_run, &me), Decision::Allow);
    assert_eq!(kernel.status(&me).delegation_phase, "inactive");
}

#[test]
fn delegation_blocks_code_but_not_plans_file_backend() {
    let dir = TempDir::new().unwrap();
    delegation_blocks_code_but_not_plans(file_store(&dir));
}

#[test]
fn delegation_blocks_code_but_not_plans_sqlite_backend() {
    let dir = TempDir::new().unwrap();
    delegation_blocks_code_but_not_plans(sqlite_store(&dir));
}
