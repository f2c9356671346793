//! Broadcast Fan-out (`SPEC_FULL.md` §4.7, §6.2).
//!
//! Modeled directly on `cloudllm::event::{AgentEvent, EventHandler}`: a single
//! `Send + Sync` trait with one method and a no-op default, so subscribers
//! only implement what they care about. Fan-out is lossy-best-effort:
//! handler errors are logged, never propagated.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{AgentId, AgentStatus, MusicalContext};

/// `{agent, emoji, thought, pattern, timestamp}` (`SPEC_FULL.md` §6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentThought {
    pub agent: AgentId,
    pub emoji: &'static str,
    pub thought: String,
    pub pattern: String,
    pub timestamp: DateTime<Utc>,
}

/// `{agent, emoji, text, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCommentary {
    pub agent: AgentId,
    pub emoji: &'static str,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// `{agent, status}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusUpdate {
    pub agent: AgentId,
    pub status: AgentStatus,
}

/// `{musicalContext}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MusicalContextUpdate {
    pub musical_context: MusicalContext,
}

/// Source that triggered the turn currently being broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnSource {
    JamStart,
    Directive,
    AutoTick,
    SetPreset,
}

/// `{code, sessionId, round, turnSource, changedAgents[], changed, issuedAtMs}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutePayload {
    pub code: String,
    pub session_id: String,
    pub round: u64,
    pub turn_source: TurnSource,
    pub changed_agents: Vec<AgentId>,
    pub changed: bool,
    pub issued_at_ms: i64,
}

/// A minimal per-agent view inside a jam-state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub status: AgentStatus,
    pub current_pattern: String,
    pub thoughts: String,
}

/// `{jamState, combinedPattern, turnSource?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JamStateUpdate {
    pub session_id: String,
    pub round: u64,
    pub musical_context: MusicalContext,
    pub agents: Vec<AgentSnapshot>,
    pub activated: Vec<AgentId>,
    pub muted: Vec<AgentId>,
    pub combined_pattern: String,
    pub turn_source: Option<TurnSource>,
}

/// `{message, targetAgent?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectiveError {
    pub message: String,
    pub target_agent: Option<AgentId>,
}

/// `{intervalMs, nextTickAtMs, serverNowMs}` wrapped under `autoTick`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoTickTimingUpdate {
    pub interval_ms: u64,
    pub next_tick_at_ms: i64,
    pub server_now_ms: i64,
}

/// `{sessionId, round, activeAgents[], autoTick, firedAtMs}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoTickFired {
    pub session_id: String,
    pub round: u64,
    pub active_agents: Vec<AgentId>,
    pub auto_tick: AutoTickTimingUpdate,
    pub fired_at_ms: i64,
}

/// The full set of client push-channel events (`SPEC_FULL.md` §6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JamBroadcastEvent {
    AgentThought(AgentThought),
    AgentCommentary(AgentCommentary),
    AgentStatus(AgentStatusUpdate),
    MusicalContextUpdate(MusicalContextUpdate),
    Execute(ExecutePayload),
    JamStateUpdate(JamStateUpdate),
    DirectiveError(DirectiveError),
    AutoTickTimingUpdate(AutoTickTimingUpdate),
    AutoTickFired(AutoTickFired),
}

/// Receives broadcast events emitted by the orchestrator.
///
/// The default implementation is a no-op, so a subscriber only overrides the
/// event kinds it cares about. Implementations are shared via
/// `Arc<dyn JamEventHandler>` across the scheduler's consumer task and any
/// concurrently-dispatched per-agent turn futures.
#[async_trait]
pub trait JamEventHandler: Send + Sync {
    /// Called for every broadcast event, in the order they are produced
    /// within one logical batch (`SPEC_FULL.md` §4.7).
    async fn on_event(&self, _event: &JamBroadcastEvent) {}
}

/// A handler that discards every event; used as the default when no
/// subscriber is registered.
pub struct NullEventHandler;

#[async_trait]
impl JamEventHandler for NullEventHandler {}
