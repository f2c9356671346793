//! Core data model: musical context, agents, sessions, and structured
//! decisions (`SPEC_FULL.md` §3).

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{
    COMMENTARY_RECENT_SIGNATURE_WINDOW, ENERGY_DELTA_MAX, ENERGY_DELTA_MIN, TEMPO_DELTA_PCT_MAX,
    TEMPO_DELTA_PCT_MIN,
};

/// The fixed set of musical roles. Every jam has exactly these four.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentId {
    Drums,
    Bass,
    Melody,
    Chords,
}

impl AgentId {
    pub const ALL: [AgentId; 4] = [AgentId::Drums, AgentId::Bass, AgentId::Melody, AgentId::Chords];

    /// Persona-file stem, per `SPEC_FULL.md` §6.4 (`drummer`, `bassist`, `melody`, `chords`).
    pub fn persona_key(self) -> &'static str {
        match self {
            AgentId::Drums => "drummer",
            AgentId::Bass => "bassist",
            AgentId::Melody => "melody",
            AgentId::Chords => "chords",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            AgentId::Drums => "Drums",
            AgentId::Bass => "Bass",
            AgentId::Melody => "Melody",
            AgentId::Chords => "Chords",
        }
    }

    pub fn emoji(self) -> &'static str {
        match self {
            AgentId::Drums => "\u{1F941}",
            AgentId::Bass => "\u{1F3B8}",
            AgentId::Melody => "\u{1F3B9}",
            AgentId::Chords => "\u{1F3B5}",
        }
    }

    /// Case-insensitive lookup by id, persona key, or display name, used to
    /// resolve `@mention` targets from directive text.
    pub fn parse(s: &str) -> Option<AgentId> {
        let lower = s.to_ascii_lowercase();
        AgentId::ALL.into_iter().find(|a| {
            lower == a.display_name().to_ascii_lowercase() || lower == a.persona_key()
        })
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Lifecycle status of one agent within a session (`SPEC_FULL.md` §4.6.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Thinking,
    Playing,
    Muted,
    Error,
    Timeout,
}

/// Confidence tier attached to a structured decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Closed set of arrangement intents a decision may express (`SPEC_FULL.md` §3.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrangementIntent {
    Build,
    Breakdown,
    Drop,
    StripBack,
    BringForward,
    Hold,
    NoChange,
    Transition,
}

impl ArrangementIntent {
    /// Canonicalizes spelling/hyphen/space variants (e.g. `"strip back"`,
    /// `"strip-back"`, `"STRIP_BACK"`) before matching against the closed enum.
    pub fn canonicalize(raw: &str) -> Option<ArrangementIntent> {
        let normalized: String = raw
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c == '-' || c == ' ' { '_' } else { c })
            .collect();
        match normalized.as_str() {
            "build" => Some(ArrangementIntent::Build),
            "breakdown" => Some(ArrangementIntent::Breakdown),
            "drop" => Some(ArrangementIntent::Drop),
            "strip_back" => Some(ArrangementIntent::StripBack),
            "bring_forward" => Some(ArrangementIntent::BringForward),
            "hold" => Some(ArrangementIntent::Hold),
            "no_change" => Some(ArrangementIntent::NoChange),
            "transition" => Some(ArrangementIntent::Transition),
            _ => None,
        }
    }
}

/// A per-response optional steering block (`SPEC_FULL.md` §3.4).
///
/// Any field failing validation is dropped during construction; if nothing
/// remains, the caller is expected to treat the decision as entirely absent.
#[derive(Debug, Clone, Default)]
pub struct StructuredDecision {
    pub tempo_delta_pct: Option<f64>,
    pub energy_delta: Option<i32>,
    pub arrangement_intent: Option<ArrangementIntent>,
    pub confidence: Option<Confidence>,
    pub suggested_key: Option<String>,
    pub suggested_chords: Option<Vec<String>>,
}

impl StructuredDecision {
    /// `true` once every field has been dropped by validation.
    pub fn is_empty(&self) -> bool {
        self.tempo_delta_pct.is_none()
            && self.energy_delta.is_none()
            && self.arrangement_intent.is_none()
            && self.confidence.is_none()
            && self.suggested_key.is_none()
            && self.suggested_chords.is_none()
    }

    /// Clamps `tempo_delta_pct` / `energy_delta` to their legal ranges,
    /// rounding half-away-from-zero, and drops invalid enum/string fields.
    pub fn normalize(mut self) -> StructuredDecision {
        self.tempo_delta_pct = self
            .tempo_delta_pct
            .map(|v| round_half_away_from_zero(v).clamp(TEMPO_DELTA_PCT_MIN, TEMPO_DELTA_PCT_MAX));
        self.energy_delta = self
            .energy_delta
            .map(|v| v.clamp(ENERGY_DELTA_MIN, ENERGY_DELTA_MAX));
        if let Some(chords) = &self.suggested_chords {
            if chords.is_empty() {
                self.suggested_chords = None;
            }
        }
        self
    }
}

/// Rounds half-away-from-zero, the rounding rule used for aggregated drift.
pub fn round_half_away_from_zero(v: f64) -> f64 {
    if v >= 0.0 {
        (v + 0.5).floor()
    } else {
        (v - 0.5).ceil()
    }
}

/// The musical context shared by the whole jam (`SPEC_FULL.md` §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MusicalContext {
    pub genre: String,
    pub key: String,
    pub scale: Vec<String>,
    pub chord_progression: Vec<String>,
    pub bpm: i32,
    pub time_signature: String,
    pub energy: i32,
}

impl Default for MusicalContext {
    fn default() -> Self {
        MusicalContext {
            genre: String::new(),
            key: String::new(),
            scale: Vec::new(),
            chord_progression: Vec::new(),
            bpm: 120,
            time_signature: String::from("4/4"),
            energy: 5,
        }
    }
}

/// Per-agent bookkeeping used only by the commentary-dedupe rules (`SPEC_FULL.md` §4.6.5).
#[derive(Debug, Clone, Default)]
pub struct CommentaryRuntime {
    pub last_emitted_round: Option<u64>,
    pub recent_signatures: VecDeque<String>,
}

impl CommentaryRuntime {
    pub fn remember(&mut self, round: u64, signature: String) {
        self.last_emitted_round = Some(round);
        self.recent_signatures.push_back(signature);
        while self.recent_signatures.len() > COMMENTARY_RECENT_SIGNATURE_WINDOW {
            self.recent_signatures.pop_front();
        }
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.recent_signatures.iter().any(|s| s == signature)
    }
}

/// Mutable per-agent state (`SPEC_FULL.md` §3.2).
#[derive(Debug, Clone)]
pub struct AgentState {
    pub id: AgentId,
    pub current_pattern: String,
    pub fallback_pattern: String,
    pub thoughts: String,
    pub status: AgentStatus,
    pub last_updated: DateTime<Utc>,
    pub commentary_runtime: CommentaryRuntime,
    pub auto_tick_no_change_streak: u32,
    pub pending_thread_compaction: bool,
    pub last_decision: Option<StructuredDecision>,
}

impl AgentState {
    pub fn new(id: AgentId, now: DateTime<Utc>) -> Self {
        AgentState {
            id,
            current_pattern: String::new(),
            fallback_pattern: String::new(),
            thoughts: String::new(),
            status: AgentStatus::Idle,
            last_updated: now,
            commentary_runtime: CommentaryRuntime::default(),
            auto_tick_no_change_streak: 0,
            pending_thread_compaction: false,
            last_decision: None,
        }
    }

    pub fn is_silent(&self) -> bool {
        self.current_pattern.is_empty() || self.current_pattern == "silence"
    }
}

/// Per-agent handle to the persona prompt and LLM thread continuity
/// (`SPEC_FULL.md` §3.3).
#[derive(Debug, Clone)]
pub struct AgentSessionHandle {
    pub id: AgentId,
    pub system_prompt: String,
    pub model: String,
    pub thread_id: Option<String>,
}

impl AgentSessionHandle {
    pub fn new(id: AgentId, system_prompt: String, model: String) -> Self {
        AgentSessionHandle {
            id,
            system_prompt,
            model,
            thread_id: None,
        }
    }

    /// Drops continuity: the next turn starts a fresh LLM thread.
    pub fn compact(&mut self) {
        self.thread_id = None;
    }
}

/// Jam start mode (`SPEC_FULL.md` §3.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JamStartMode {
    AutonomousOpening,
    StagedSilent,
}

/// Freshness-bound snapshot of the optional audio-feedback channel.
#[derive(Debug, Clone)]
pub struct AudioFeedback {
    pub summary: String,
    pub received_at: DateTime<Utc>,
    pub ttl: chrono::Duration,
}

impl AudioFeedback {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.received_at) < self.ttl
    }
}

/// Authoritative session state (`SPEC_FULL.md` §3.6).
///
/// Owned exclusively by the Turn Scheduler's consumer task; never shared via
/// `Arc<RwLock<_>>` handles (`SPEC_FULL.md` §9 Design Notes).
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub round_number: u64,
    pub musical_context: MusicalContext,
    pub agents: HashMap<AgentId, AgentState>,
    pub sessions: HashMap<AgentId, AgentSessionHandle>,
    pub active_agents: HashSet<AgentId>,
    pub activated_agents: Vec<AgentId>,
    pub muted_agents: HashSet<AgentId>,
    pub preset_configured: bool,
    pub start_mode: JamStartMode,
    pub audio_feedback: Option<AudioFeedback>,
}

impl Session {
    pub fn new(session_id: String, start_mode: JamStartMode, now: DateTime<Utc>) -> Self {
        let mut agents = HashMap::new();
        for id in AgentId::ALL {
            agents.insert(id, AgentState::new(id, now));
        }
        Session {
            session_id,
            round_number: 0,
            musical_context: MusicalContext::default(),
            agents,
            sessions: HashMap::new(),
            active_agents: AgentId::ALL.into_iter().collect(),
            activated_agents: Vec::new(),
            muted_agents: HashSet::new(),
            preset_configured: start_mode == JamStartMode::AutonomousOpening,
            start_mode,
            audio_feedback: None,
        }
    }

    pub fn is_activated(&self, id: AgentId) -> bool {
        self.activated_agents.contains(&id)
    }

    pub fn is_muted(&self, id: AgentId) -> bool {
        self.muted_agents.contains(&id)
    }

    pub fn activate(&mut self, id: AgentId) {
        if !self.is_activated(id) {
            self.activated_agents.push(id);
        }
    }

    /// Activated, unmuted agents with a live subprocess session handle —
    /// the participant set for auto-tick and broadcast directive turns.
    pub fn eligible_participants(&self) -> Vec<AgentId> {
        self.activated_agents
            .iter()
            .copied()
            .filter(|id| !self.is_muted(*id) && self.sessions.contains_key(id))
            .collect()
    }
}
