//! Integration tests for `LlmRunner` against a real subprocess — a small
//! fake "llm" shell script standing in for the actual CLI, in the same
//! spirit as `bash_tool_test.rs`'s real-`bash` integration tests.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use jam_orchestrator::llm_runner::{LlmRunner, TurnOutcome};

fn write_fake_cli(dir: &tempfile::TempDir, name: &str, script: &str) -> PathBuf {
    let path = dir.path().join(name);
    let mut file = fs::File::create(&path).unwrap();
    file.write_all(script.as_bytes()).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

#[tokio::test]
async fn returns_response_on_valid_ndjson_stream() {
    let dir = tempfile::tempdir().unwrap();
    let cli = write_fake_cli(
        &dir,
        "fake_llm.sh",
        "#!/bin/sh\ncat >/dev/null\necho '{\"type\":\"thread.started\",\"thread_id\":\"t-1\"}'\necho '{\"type\":\"item.agent.message.delta\",\"delta\":\"{\\\"pattern\\\": \\\"s(\\\\\"bd sd\\\\\")\\\", \\\"thoughts\\\": \\\"steady four on the floor\\\"}\"}'\necho '{\"type\":\"turn.completed\"}'\n",
    );

    let runner = LlmRunner::new(cli, Duration::from_secs(5));
    let outcome = runner.run_turn("lay down a beat", "default", None, &[]).await;

    match outcome {
        TurnOutcome::Response { response, thread_id } => {
            assert_eq!(thread_id.as_deref(), Some("t-1"));
            assert_eq!(response.pattern, "s(\"bd sd\")");
            assert_eq!(response.thoughts, "steady four on the floor");
        }
        other => panic!("expected Response, got {:?}", other),
    }
}

#[tokio::test]
async fn falls_back_to_null_on_malformed_payload() {
    let dir = tempfile::tempdir().unwrap();
    let cli = write_fake_cli(
        &dir,
        "fake_llm.sh",
        "#!/bin/sh\ncat >/dev/null\necho '{\"type\":\"item.agent.message.delta\",\"delta\":\"not json at all\"}'\necho '{\"type\":\"turn.completed\"}'\n",
    );

    let runner = LlmRunner::new(cli, Duration::from_secs(5));
    let outcome = runner.run_turn("lay down a beat", "default", None, &[]).await;

    assert!(matches!(outcome, TurnOutcome::Null { .. }));
}

#[tokio::test]
async fn drops_session_on_nonzero_exit() {
    let dir = tempfile::tempdir().unwrap();
    let cli = write_fake_cli(&dir, "fake_llm.sh", "#!/bin/sh\ncat >/dev/null\nexit 1\n");

    let runner = LlmRunner::new(cli, Duration::from_secs(5));
    let outcome = runner.run_turn("lay down a beat", "default", None, &[]).await;

    assert!(matches!(outcome, TurnOutcome::Dropped { .. }));
}

#[tokio::test]
async fn times_out_and_kills_subprocess() {
    let dir = tempfile::tempdir().unwrap();
    let cli = write_fake_cli(&dir, "fake_llm.sh", "#!/bin/sh\ncat >/dev/null\nsleep 5\n");

    let runner = LlmRunner::new(cli, Duration::from_millis(200));
    let outcome = runner.run_turn("lay down a beat", "default", None, &[]).await;

    assert!(matches!(outcome, TurnOutcome::Null { .. }));
}
