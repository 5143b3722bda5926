use std::sync::Arc;

use serde_json::json;

use psgate_core::config::{AppConfig, ConfigStore, EnvOverrides};
use psgate_core::types::{EventKind, Tier};
use psgate_engine::ShellSpec;
use psgate_tools::{CallerInfo, Dispatcher, Pipeline};

fn dispatcher_with(mut config: AppConfig, data_dir: &std::path::Path) -> Dispatcher {
    config.data_dir = Some(data_dir.to_path_buf());
    let store = Arc::new(ConfigStore::new(config, EnvOverrides::default()).unwrap());
    let pipeline = Pipeline::new(store, ShellSpec::posix()).unwrap();
    Dispatcher::new(pipeline)
}

fn default_dispatcher(data_dir: &std::path::Path) -> Dispatcher {
    let mut config = AppConfig::default();
    // Tests hammer the dispatcher; keep the limiter out of the way
    // except where a test opts back in.
    config.rate_limit.enabled = false;
    dispatcher_with(config, data_dir)
}

async fn events_of_kind(
    dispatcher: &Dispatcher,
    kind: EventKind,
) -> Vec<psgate_core::types::CommandEvent> {
    // The publisher owner task applies events asynchronously.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    dispatcher
        .pipeline()
        .publisher
        .replay(0, 200)
        .into_iter()
        .filter(|e| e.kind == kind)
        .collect()
}

#[tokio::test]
async fn safe_command_executes_with_two_events() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = default_dispatcher(dir.path());

    let output = dispatcher
        .dispatch("run-powershell", json!({ "command": "echo gateway-ok" }), CallerInfo::default())
        .await
        .unwrap();

    assert!(!output.is_error);
    let v = &output.value;
    assert_eq!(v["success"], json!(true));
    assert_eq!(v["terminationReason"], json!("completed"));
    assert_eq!(v["adaptiveExtended"], json!(false));
    assert!(v["stdout"].as_str().unwrap().contains("gateway-ok"));
    assert!(v["totalBytes"].as_u64().unwrap() > 0);
    assert_eq!(v["securityAssessment"]["level"], json!("SAFE"));

    let attempts = events_of_kind(&dispatcher, EventKind::Attempt).await;
    let completions = events_of_kind(&dispatcher, EventKind::Completion).await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(completions.len(), 1);
    assert!(attempts[0].seq < completions[0].seq);
    assert_eq!(attempts[0].duration_ms, 0);
    assert!(completions[0].duration_ms >= 1);
}

#[tokio::test]
async fn blocked_force_push_never_spawns() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = default_dispatcher(dir.path());

    let output = dispatcher
        .dispatch(
            "run-powershell",
            json!({ "command": "git push --force origin main" }),
            CallerInfo::default(),
        )
        .await
        .unwrap();

    assert!(output.is_error);
    let v = &output.value;
    assert_eq!(v["success"], json!(false));
    assert_eq!(v["reason"], json!("blocked"));
    assert_eq!(v["securityAssessment"]["level"], json!("CRITICAL"));
    assert_eq!(v["securityAssessment"]["category"], json!("VCS_DESTRUCTIVE"));

    let attempts = events_of_kind(&dispatcher, EventKind::Attempt).await;
    let completions = events_of_kind(&dispatcher, EventKind::Completion).await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(completions.len(), 0, "blocked command must not execute");
}

#[tokio::test]
async fn confirmation_flow_converts() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = default_dispatcher(dir.path());
    let victim = dir.path().join("x.txt");
    std::fs::write(&victim, "bye").unwrap();

    // sh understands rm, not Remove-Item; use the alias so the
    // classifier sees Remove-Item while the shell runs rm.
    let command = format!("rm {}", victim.display());

    let first = dispatcher
        .dispatch("run-powershell", json!({ "command": command }), CallerInfo::default())
        .await
        .unwrap();
    assert!(first.is_error);
    assert_eq!(first.value["reason"], json!("confirmation_required"));
    assert_eq!(first.value["securityAssessment"]["level"], json!("RISKY"));
    assert!(victim.exists(), "no spawn before confirmation");

    let second = dispatcher
        .dispatch(
            "run-powershell",
            json!({ "command": command, "confirmed": true }),
            CallerInfo::default(),
        )
        .await
        .unwrap();
    assert_eq!(second.value["success"], json!(true));
    assert!(!victim.exists());

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let stats = dispatcher.pipeline().registry.snapshot();
    assert_eq!(stats.attempt_confirmation_required, 1);
    assert_eq!(stats.confirmed_executions, 1);
    assert!(stats.confirmation_conversion >= 1.0);
}

#[tokio::test]
async fn unknown_command_queues_candidate() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = default_dispatcher(dir.path());

    let output = dispatcher
        .dispatch(
            "run-powershell",
            json!({ "command": "mytool --flag" }),
            CallerInfo::default(),
        )
        .await
        .unwrap();
    assert_eq!(output.value["reason"], json!("confirmation_required"));
    assert_eq!(output.value["securityAssessment"]["level"], json!("UNKNOWN"));

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let queue = dispatcher.pipeline().learning.list_queue().await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].normalized, "mytool --flag");
}

#[tokio::test]
async fn learning_promotion_makes_command_safe() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = default_dispatcher(dir.path());

    // Warm the merged-pattern cache so the approval below invalidates it.
    dispatcher
        .dispatch(
            "threat-analysis",
            json!({ "command": "Get-Date" }),
            CallerInfo::default(),
        )
        .await
        .unwrap();

    dispatcher
        .dispatch(
            "learn",
            json!({ "action": "queue", "normalized": ["MyTool --flag"] }),
            CallerInfo::default(),
        )
        .await
        .unwrap();

    let approve = dispatcher
        .dispatch(
            "learn",
            json!({ "action": "approve", "normalized": ["mytool --flag"] }),
            CallerInfo::default(),
        )
        .await
        .unwrap();
    assert_eq!(approve.value["promoted"], json!(1));

    let analysis = dispatcher
        .dispatch(
            "threat-analysis",
            json!({ "command": "MyTool   --flag" }),
            CallerInfo::default(),
        )
        .await
        .unwrap();
    assert_eq!(analysis.value["assessment"]["level"], json!("SAFE"));
    assert_eq!(analysis.value["assessment"]["category"], json!("LEARNED_SAFE"));

    // The invalidation lands on the audit stream after the next
    // classification rebuilds the merged cache.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let audits = events_of_kind(&dispatcher, EventKind::Audit).await;
    assert!(audits
        .iter()
        .any(|e| e.note.as_deref().unwrap_or("").contains("PATTERN_CACHE_INVALIDATED")));
}

#[tokio::test]
async fn rate_limit_rejects_with_retry_hint() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.rate_limit.enabled = true;
    config.rate_limit.burst = 1;
    config.rate_limit.max_requests = 1;
    config.rate_limit.interval_ms = 3_600_000;
    let dispatcher = dispatcher_with(config, dir.path());

    let first = dispatcher
        .dispatch("run-powershell", json!({ "command": "echo one" }), CallerInfo::default())
        .await
        .unwrap();
    assert_eq!(first.value["success"], json!(true));

    let second = dispatcher
        .dispatch("run-powershell", json!({ "command": "echo two" }), CallerInfo::default())
        .await
        .unwrap();
    assert!(second.is_error);
    assert_eq!(second.value["reason"], json!("rate_limited"));
    assert!(second.value["retryAfterMs"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn working_directory_policy_rejects_outside_roots() {
    let dir = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.rate_limit.enabled = false;
    config.security.enforce_working_directory = true;
    config.security.allowed_write_roots = vec!["/definitely/not/here".to_string()];
    let dispatcher = dispatcher_with(config, dir.path());

    let output = dispatcher
        .dispatch(
            "run-powershell",
            json!({
                "command": "echo hi",
                "workingDirectory": outside.path().to_string_lossy(),
            }),
            CallerInfo::default(),
        )
        .await
        .unwrap();
    assert!(output.is_error);
    assert_eq!(output.value["reason"], json!("working_dir_out_of_root"));
}

#[tokio::test]
async fn deprecated_timeout_alias_warns() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = default_dispatcher(dir.path());

    let output = dispatcher
        .dispatch(
            "run-powershell",
            json!({ "command": "echo hi", "timeout": 5 }),
            CallerInfo::default(),
        )
        .await
        .unwrap();
    let warnings = output.value["warnings"].as_array().unwrap();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].as_str().unwrap().contains("deprecated"));
}

#[tokio::test]
async fn syntax_check_does_not_execute() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = default_dispatcher(dir.path());

    let output = dispatcher
        .dispatch(
            "powershell-syntax-check",
            json!({ "script": "if ($x) { Get-Date }" }),
            CallerInfo::default(),
        )
        .await
        .unwrap();
    assert_eq!(output.value["isValid"], json!(true));

    let bad = dispatcher
        .dispatch(
            "powershell-syntax-check",
            json!({ "script": "if ($x) { Get-Date" }),
            CallerInfo::default(),
        )
        .await
        .unwrap();
    assert_eq!(bad.value["isValid"], json!(false));

    // No command events at all: this tool never enters the pipeline.
    let attempts = events_of_kind(&dispatcher, EventKind::Attempt).await;
    assert!(attempts.is_empty());
}

#[tokio::test]
async fn workdir_policy_tool_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = default_dispatcher(dir.path());

    let get = dispatcher
        .dispatch("working-directory-policy", json!({ "action": "get" }), CallerInfo::default())
        .await
        .unwrap();
    assert_eq!(get.value["enabled"], json!(false));

    let set = dispatcher
        .dispatch(
            "working-directory-policy",
            json!({ "action": "set", "enabled": true, "allowedWriteRoots": ["${TEMP}"] }),
            CallerInfo::default(),
        )
        .await
        .unwrap();
    assert_eq!(set.value["enabled"], json!(true));

    let get = dispatcher
        .dispatch("working-directory-policy", json!({ "action": "get" }), CallerInfo::default())
        .await
        .unwrap();
    assert_eq!(get.value["enabled"], json!(true));
}

#[tokio::test]
async fn server_stats_reflects_traffic() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = default_dispatcher(dir.path());

    dispatcher
        .dispatch("run-powershell", json!({ "command": "echo hi" }), CallerInfo::default())
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let stats = dispatcher
        .dispatch("server-stats", json!({ "verbose": true }), CallerInfo::default())
        .await
        .unwrap();
    assert_eq!(stats.value["totalCommands"], json!(1));
    assert_eq!(stats.value["executionCommands"], json!(1));
    let p95 = stats.value["p95DurationMs"].as_f64().unwrap();
    let avg = stats.value["averageDurationMs"].as_f64().unwrap();
    assert!(p95 >= avg);
}

#[tokio::test]
async fn ai_agent_tests_all_pass() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = default_dispatcher(dir.path());

    let output = dispatcher
        .dispatch("ai-agent-tests", json!({}), CallerInfo::default())
        .await
        .unwrap();
    assert_eq!(output.value["failed"], json!(0));
    assert!(output.value["passed"].as_u64().unwrap() >= 5);
}

#[tokio::test]
async fn unknown_tool_is_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = default_dispatcher(dir.path());
    let err = dispatcher
        .dispatch("no-such-tool", json!({}), CallerInfo::default())
        .await;
    assert!(err.is_err());
}

#[tokio::test]
async fn assessment_tier_is_unknown_for_new_tools() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = default_dispatcher(dir.path());
    let a = dispatcher.pipeline().classify_only("frobnicate --all");
    assert_eq!(a.level, Tier::Unknown);
}
