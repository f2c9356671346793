//! End-to-end scenario tests (`SPEC_FULL.md` §8 S3-S6), driving `governance`
//! directly against a fake "llm" shell script that branches on `--model` so
//! each agent can return a distinct response, the same stand-in role
//! `MockClient` plays elsewhere in this crate's test suite.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use jam_orchestrator::config::JamOrchestratorConfig;
use jam_orchestrator::context_parser::key_to_scale;
use jam_orchestrator::event::JamBroadcastEvent;
use jam_orchestrator::governance::{run_auto_tick_turn, run_directive_turn};
use jam_orchestrator::llm_runner::LlmRunner;
use jam_orchestrator::session::{AgentId, AgentSessionHandle, AgentStatus, JamStartMode, Session};
use jam_orchestrator::JamEventHandler;

struct RecordingHandler {
    events: Mutex<Vec<JamBroadcastEvent>>,
}

impl RecordingHandler {
    fn new() -> Self {
        RecordingHandler { events: Mutex::new(Vec::new()) }
    }

    fn events(&self) -> Vec<JamBroadcastEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl JamEventHandler for RecordingHandler {
    async fn on_event(&self, event: &JamBroadcastEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

fn write_fake_cli(dir: &tempfile::TempDir, script: &str) -> PathBuf {
    let path = dir.path().join("fake_llm.sh");
    let mut file = fs::File::create(&path).unwrap();
    file.write_all(script.as_bytes()).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

fn fully_activated_session() -> Session {
    let mut session = Session::new("s1".to_string(), JamStartMode::AutonomousOpening, Utc::now());
    session.preset_configured = true;
    for id in AgentId::ALL {
        session.activate(id);
        if let Some(state) = session.agents.get_mut(&id) {
            state.current_pattern = "s(\"bd sd\")".to_string();
            state.fallback_pattern = "s(\"bd sd\")".to_string();
            state.status = AgentStatus::Playing;
        }
    }
    session
}

fn attach_sessions(session: &mut Session) {
    for id in AgentId::ALL {
        session.sessions.insert(id, AgentSessionHandle::new(id, String::new(), id.persona_key().to_string()));
    }
}

// S3 — key consensus applied: two agents vote "G major" at high confidence.
#[tokio::test]
async fn s3_key_consensus_applied() {
    let dir = tempfile::tempdir().unwrap();
    let script = r#"#!/bin/sh
cat >/dev/null
model=""
while [ "$#" -gt 0 ]; do
  if [ "$1" = "--model" ]; then model="$2"; fi
  shift
done
case "$model" in
  drummer|bassist)
    echo '{"type":"item.agent.message.delta","delta":"{\"pattern\": \"no_change\", \"thoughts\": \"locking key\", \"decision\": {\"suggested_key\": \"G major\", \"confidence\": \"high\"}}"}'
    ;;
  *)
    echo '{"type":"item.agent.message.delta","delta":"{\"pattern\": \"no_change\", \"thoughts\": \"holding\"}"}'
    ;;
esac
echo '{"type":"turn.completed"}'
"#;
    let cli = write_fake_cli(&dir, script);

    let mut session = fully_activated_session();
    attach_sessions(&mut session);

    let config = JamOrchestratorConfig::default();
    let runner = LlmRunner::new(cli, Duration::from_secs(5));
    let handler = Arc::new(RecordingHandler::new());

    run_auto_tick_turn(&mut session, &config, &runner, handler.as_ref()).await;

    assert_eq!(session.musical_context.key, "G major");
    let (expected_scale, _minor) = key_to_scale("G major").unwrap();
    assert_eq!(session.musical_context.scale, expected_scale);
    assert_eq!(session.musical_context.chord_progression, vec!["G", "Em", "C", "D"]);
}

// S4 — explicit BPM anchor wins over a relative tempo cue on the same axis.
#[tokio::test]
async fn s4_explicit_bpm_overrides_relative_cue() {
    let dir = tempfile::tempdir().unwrap();
    let script = "#!/bin/sh\ncat >/dev/null\necho '{\"type\":\"item.agent.message.delta\",\"delta\":\"{\\\"pattern\\\": \\\"no_change\\\", \\\"thoughts\\\": \\\"ok\\\"}\"}'\necho '{\"type\":\"turn.completed\"}'\n";
    let cli = write_fake_cli(&dir, script);

    let mut session = fully_activated_session();
    session.musical_context.bpm = 120;
    attach_sessions(&mut session);

    let config = JamOrchestratorConfig::default();
    let runner = LlmRunner::new(cli, Duration::from_secs(5));
    let handler = Arc::new(RecordingHandler::new());

    run_directive_turn(&mut session, &config, &runner, handler.as_ref(), "BPM 140 and faster", None).await;

    assert_eq!(session.musical_context.bpm, 140);
}

// S5 — auto-tick silence coerced back to the prior non-silence pattern.
#[tokio::test]
async fn s5_auto_tick_silence_coerced_to_no_change() {
    let dir = tempfile::tempdir().unwrap();
    let script = r#"#!/bin/sh
cat >/dev/null
echo '{"type":"item.agent.message.delta","delta":"{\"pattern\": \"silence\", \"thoughts\": \"laying out\", \"decision\": {\"arrangement_intent\": \"hold\", \"confidence\": \"medium\"}}"}'
echo '{"type":"turn.completed"}'
"#;
    let cli = write_fake_cli(&dir, script);

    let mut session = fully_activated_session();
    attach_sessions(&mut session);

    let config = JamOrchestratorConfig::default();
    let runner = LlmRunner::new(cli, Duration::from_secs(5));
    let handler = Arc::new(RecordingHandler::new());

    run_auto_tick_turn(&mut session, &config, &runner, handler.as_ref()).await;

    let drums = &session.agents[&AgentId::Drums];
    assert_eq!(drums.current_pattern, "s(\"bd sd\")");
    assert_eq!(drums.status, AgentStatus::Playing);
}

// S6 — directive targeting an agent not in the session.
#[tokio::test]
async fn s6_directive_target_not_in_session() {
    let dir = tempfile::tempdir().unwrap();
    let cli = write_fake_cli(&dir, "#!/bin/sh\ncat >/dev/null\necho '{\"type\":\"turn.completed\"}'\n");

    let mut session = Session::new("s1".to_string(), JamStartMode::AutonomousOpening, Utc::now());
    session.preset_configured = true;
    session.activate(AgentId::Drums);
    session.sessions.insert(
        AgentId::Drums,
        AgentSessionHandle::new(AgentId::Drums, String::new(), "drummer".to_string()),
    );

    let config = JamOrchestratorConfig::default();
    let runner = LlmRunner::new(cli, Duration::from_secs(5));
    let handler = Arc::new(RecordingHandler::new());

    let round_before = session.round_number;
    run_directive_turn(
        &mut session,
        &config,
        &runner,
        handler.as_ref(),
        "play a bassline",
        Some(AgentId::Bass),
    )
    .await;

    assert_eq!(session.round_number, round_before);
    let events = handler.events();
    assert_eq!(events.len(), 1);
    match &events[0] {
        JamBroadcastEvent::DirectiveError(err) => {
            assert!(err.message.contains("Bass"));
            assert!(err.message.contains("not in this jam session"));
        }
        other => panic!("expected DirectiveError, got {:?}", other),
    }
}
