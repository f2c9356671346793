//! Public orchestrator facade (`SPEC_FULL.md` §6.3).
//!
//! `JamOrchestrator` wires the Turn Scheduler, the LLM Session Runner, and a
//! caller-supplied `JamEventHandler` together behind a small constructor +
//! command-method surface, mirroring `Orchestration`'s builder
//! (`new` + `with_*` + verb methods) without the builder chain itself, since
//! this crate's "what to build" is fixed by persona files rather than
//! runtime-assembled agents.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::process::Command;
use uuid::Uuid;

use crate::config::{JamOrchestratorConfig, AGENT_TIMEOUT_MS};
use crate::error::JamError;
use crate::event::{JamEventHandler, JamStateUpdate, NullEventHandler};
use crate::llm_runner::LlmRunner;
use crate::persona;
use crate::scheduler::{self, SchedulerHandle, Turn};
use crate::session::{AgentId, AgentSessionHandle, JamStartMode, Session};

/// Entry point for driving a jam session. One instance per live session;
/// `start` consumes it into a running scheduler.
pub struct JamOrchestrator {
    config: JamOrchestratorConfig,
    handler: Arc<dyn JamEventHandler>,
    handle: Option<SchedulerHandle>,
}

impl JamOrchestrator {
    pub fn new(config: JamOrchestratorConfig) -> Self {
        JamOrchestrator {
            config,
            handler: Arc::new(NullEventHandler),
            handle: None,
        }
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn JamEventHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Loads personas, builds the session, and spawns the scheduler
    /// (`SPEC_FULL.md` §4.6.3). `active_agents` seeds the agents the jam
    /// starts with active; `mode` selects whether agent 1 opens solo
    /// (`AutonomousOpening`) or every agent sits silent awaiting a directive
    /// (`StagedSilent`).
    pub async fn start(&mut self, active_agents: Vec<AgentId>, mode: JamStartMode) -> Result<(), JamError> {
        if self.handle.is_some() {
            return Err(JamError::AlreadyRunning);
        }

        probe_llm_cli_spawnable(&self.config.llm_cli_path).await?;

        let personas = persona::load_all(&self.config)?;

        let session_id = Uuid::new_v4().to_string();
        let mut session = Session::new(session_id, mode, Utc::now());
        for id in active_agents {
            session.active_agents.insert(id);
        }
        for persona in personas {
            session
                .sessions
                .insert(persona.agent_id, AgentSessionHandle::new(persona.agent_id, persona.system_prompt, persona.model));
        }

        let runner = LlmRunner::new(self.config.llm_cli_path.clone(), Duration::from_millis(AGENT_TIMEOUT_MS));
        let handle = scheduler::spawn(session, self.config.clone(), runner, self.handler.clone());
        handle.send(Turn::JamStart);
        self.handle = Some(handle);
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<(), JamError> {
        match self.handle.take() {
            Some(handle) => {
                handle.stop().await;
                Ok(())
            }
            None => Err(JamError::NotRunning),
        }
    }

    /// Applies a genre preset (`SPEC_FULL.md` §6.3 `setJamPreset`), unlocking
    /// directive handling for staged-silent jams.
    pub fn set_jam_preset(&self, genre: String, key: String, bpm: i32, time_signature: String) -> Result<(), JamError> {
        let handle = self.handle.as_ref().ok_or(JamError::NotRunning)?;
        handle.send(Turn::SetPreset { genre, key, bpm, time_signature });
        Ok(())
    }

    /// Enqueues a boss directive, optionally targeted at one agent
    /// (`SPEC_FULL.md` §6.3 `handleDirective`).
    pub fn handle_directive(&self, text: String, target_agent: Option<AgentId>) -> Result<(), JamError> {
        let handle = self.handle.as_ref().ok_or(JamError::NotRunning)?;
        handle.send(Turn::Directive { text, target: target_agent });
        Ok(())
    }

    /// Forwards an out-of-band audio-analysis summary; consumed by the next
    /// prompt build, bounded by its own TTL (`SPEC_FULL.md` §3.7).
    pub fn handle_audio_feedback(&self, summary: String) -> Result<(), JamError> {
        let handle = self.handle.as_ref().ok_or(JamError::NotRunning)?;
        handle.send(Turn::AudioFeedback { summary });
        Ok(())
    }

    /// Fetches a point-in-time snapshot of jam state (`SPEC_FULL.md` §6.3
    /// `getJamStateSnapshot`).
    pub async fn get_jam_state_snapshot(&self) -> Result<JamStateUpdate, JamError> {
        let handle = self.handle.as_ref().ok_or(JamError::NotRunning)?;
        handle.snapshot().await.ok_or(JamError::NotRunning)
    }
}

/// Verifies `cli_path` is actually spawnable before committing to a session
/// (`SPEC_FULL.md`: "only an unrecoverable failure to spawn any subprocess …
/// aborts the session"). A per-turn transport error or non-zero exit later
/// is not this kind of failure; only the OS-level spawn call itself is
/// checked here, the same `Command::new(...).spawn()` call `LlmRunner` makes
/// per turn.
async fn probe_llm_cli_spawnable(cli_path: &std::path::Path) -> Result<(), JamError> {
    let spawned = Command::new(cli_path)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();

    match spawned {
        Ok(mut child) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            Ok(())
        }
        Err(err) => Err(JamError::Spawn(format!("{}: {}", cli_path.display(), err))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_orchestrator_starts_unstarted() {
        let orchestrator = JamOrchestrator::new(JamOrchestratorConfig::default());
        assert!(orchestrator.handle.is_none());
    }

    #[tokio::test]
    async fn start_fails_fast_on_unspawnable_cli_path() {
        let config = JamOrchestratorConfig {
            llm_cli_path: std::path::PathBuf::from("/nonexistent/llm-cli-does-not-exist"),
            ..JamOrchestratorConfig::default()
        };
        let mut orchestrator = JamOrchestrator::new(config);
        let result = orchestrator.start(vec![AgentId::Drums], JamStartMode::StagedSilent).await;
        assert!(matches!(result, Err(JamError::Spawn(_))));
        assert!(orchestrator.handle.is_none());
    }
}
