//! Configuration for the jam orchestrator.
//!
//! Provides [`JamOrchestratorConfig`], constructed manually — no TOML/YAML/JSON
//! config-file parsing dependency is introduced, same philosophy as
//! `cloudllm::config::CloudLLMConfig`.
//!
//! # Example
//!
//! ```rust
//! use jam_orchestrator::config::JamOrchestratorConfig;
//! use std::path::PathBuf;
//!
//! let config = JamOrchestratorConfig {
//!     persona_dir: PathBuf::from("/etc/jam/personas"),
//!     ..JamOrchestratorConfig::default()
//! };
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use crate::session::AgentId;

/// Model-id prefixes accepted for a persona's `model:` frontmatter override
/// or a config-level per-agent override, grounded on the model families the
/// teacher's own LLM clients speak (`clients::{openai, claude, grok, gemini}`):
/// `gpt-`/`o1-`/`o3-`/`o4-` (OpenAI), `claude-`, `grok-`, `gemini-`.
pub const SUPPORTED_MODEL_FAMILIES: &[&str] =
    &["gpt-", "o1-", "o3-", "o4-", "claude-", "grok-", "gemini-"];

/// Whether `model` names one of the supported model families, matched as a
/// case-insensitive prefix (`SPEC_FULL.md` persona frontmatter validation).
pub fn is_supported_model_family(model: &str) -> bool {
    let lower = model.to_ascii_lowercase();
    SUPPORTED_MODEL_FAMILIES.iter().any(|family| lower.starts_with(family))
}

/// Final BPM clamp range.
pub const BPM_MIN: i32 = 60;
pub const BPM_MAX: i32 = 300;

/// Final energy clamp range.
pub const ENERGY_MIN: i32 = 1;
pub const ENERGY_MAX: i32 = 10;

/// Per-decision tempo delta clamp, in percent.
pub const TEMPO_DELTA_PCT_MIN: f64 = -50.0;
pub const TEMPO_DELTA_PCT_MAX: f64 = 50.0;

/// Per-decision energy delta clamp.
pub const ENERGY_DELTA_MIN: i32 = -3;
pub const ENERGY_DELTA_MAX: i32 = 3;

/// Scale applied to aggregated auto-tick drift before it is applied.
pub const AUTO_TICK_DAMPENING: f64 = 0.5;

/// Auto-tick timer period.
pub const AUTO_TICK_INTERVAL_MS: u64 = 30_000;

/// Minimum number of agreeing agents required to accept a key-change consensus.
pub const KEY_CONSENSUS_MIN_AGENTS: usize = 2;

/// Per-turn wall clock budget for a single agent subprocess.
pub const AGENT_TIMEOUT_MS: u64 = 15_000;

/// Grace period between a graceful termination signal and a forceful kill.
pub const SUBPROCESS_GRACE_MS: u64 = 2_000;

/// Maximum length, in characters, of a broadcast commentary line.
pub const COMMENTARY_MAX_CHARS: usize = 180;

/// Per-agent commentary cooldown, in rounds, on auto-tick turns.
pub const COMMENTARY_AUTO_TICK_MIN_ROUNDS: u64 = 2;

/// Size of the per-agent recent-commentary-signature dedupe ring.
pub const COMMENTARY_RECENT_SIGNATURE_WINDOW: usize = 3;

/// Confidence-weighted multiplier used when aggregating decision deltas.
pub fn confidence_multiplier(confidence: crate::session::Confidence) -> f64 {
    use crate::session::Confidence::*;
    match confidence {
        Low => 0.0,
        Medium => 0.5,
        High => 1.0,
    }
}

/// Global configuration for the jam orchestrator.
///
/// Intentionally minimal; callers construct it however they want. No config
/// file format is parsed.
#[derive(Debug, Clone)]
pub struct JamOrchestratorConfig {
    /// Directory containing one persona file per agent id (`drummer`,
    /// `bassist`, `melody`, `chords`).
    pub persona_dir: PathBuf,

    /// Shared policy document, appended verbatim to every persona prompt.
    pub shared_policy_path: PathBuf,

    /// Pattern-DSL reference document, appended verbatim to every persona prompt.
    pub dsl_reference_path: PathBuf,

    /// Path to the LLM CLI executable invoked as a subprocess per turn.
    pub llm_cli_path: PathBuf,

    /// Default model identifier, used unless a persona's frontmatter
    /// overrides it.
    pub default_model: String,

    /// Per-agent model overrides, keyed by agent id. Takes precedence over
    /// both `default_model` and a persona's own `model:` frontmatter line —
    /// an operator-level pin wins over an author-level suggestion.
    pub model_overrides: HashMap<AgentId, String>,

    /// Number of consecutive qualifying no-change auto-ticks before an
    /// agent's LLM thread is dropped and restarted fresh. Defaults to 3
    /// (see `DESIGN.md`).
    pub thread_compaction_streak: u32,
}

impl Default for JamOrchestratorConfig {
    fn default() -> Self {
        Self {
            persona_dir: PathBuf::from("personas"),
            shared_policy_path: PathBuf::from("personas/shared_policy.md"),
            dsl_reference_path: PathBuf::from("personas/dsl_reference.md"),
            llm_cli_path: PathBuf::from("llm"),
            default_model: String::from("default"),
            model_overrides: HashMap::new(),
            thread_compaction_streak: 3,
        }
    }
}
