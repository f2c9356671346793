//! Persona & reference file loading (`SPEC_FULL.md` §6.4).
//!
//! Plain `std::fs::read_to_string`, no file-parsing dependency — the same
//! "users construct this manually" stance `CloudLLMConfig` takes. A persona
//! file may open with a minimal hand-rolled
//! `model: <id>` frontmatter line overriding the default model; everything
//! else is opaque prompt text appended verbatim.

use std::path::Path;

use crate::config::{is_supported_model_family, JamOrchestratorConfig};
use crate::error::JamError;
use crate::session::AgentId;

/// One agent's loaded persona: the assembled system prompt and the model id
/// to invoke it with.
#[derive(Debug, Clone)]
pub struct LoadedPersona {
    pub agent_id: AgentId,
    pub system_prompt: String,
    pub model: String,
}

/// Loads all four personas plus the shared policy and DSL reference
/// documents, appending the latter two verbatim to every persona's prompt
/// (`SPEC_FULL.md` §6.4). A missing or unreadable file is a fatal start
/// error — there is no partial-jam fallback.
pub fn load_all(config: &JamOrchestratorConfig) -> Result<Vec<LoadedPersona>, JamError> {
    let shared_policy = read_required(&config.shared_policy_path)?;
    let dsl_reference = read_required(&config.dsl_reference_path)?;

    AgentId::ALL
        .into_iter()
        .map(|id| load_one(config, id, &shared_policy, &dsl_reference))
        .collect()
}

fn load_one(
    config: &JamOrchestratorConfig,
    agent_id: AgentId,
    shared_policy: &str,
    dsl_reference: &str,
) -> Result<LoadedPersona, JamError> {
    let path = config.persona_dir.join(format!("{}.md", agent_id.persona_key()));
    let raw = read_required(&path)?;

    let (frontmatter_model, body) = extract_model_override(&raw);

    let mut model = config.default_model.clone();
    if let Some(candidate) = frontmatter_model {
        if is_supported_model_family(&candidate) {
            model = candidate;
        } else {
            log::warn!(
                "{}: ignoring unsupported model family override {:?}, falling back to {}",
                agent_id.persona_key(),
                candidate,
                model
            );
        }
    }
    if let Some(pinned) = config.model_overrides.get(&agent_id) {
        model = pinned.clone();
    }

    let system_prompt = format!("{}\n\n{}\n\n{}", body.trim_end(), shared_policy.trim(), dsl_reference.trim());

    Ok(LoadedPersona {
        agent_id,
        system_prompt,
        model,
    })
}

/// Parses an optional leading `model: <id>` line, returning `(Some(model), rest)`
/// when present and non-empty, `(None, raw)` otherwise. Validity of the model
/// name is left to the caller; the frontmatter line is stripped from the body
/// either way so an unsupported family name never leaks into the prompt.
fn extract_model_override(raw: &str) -> (Option<String>, &str) {
    if let Some(first_line) = raw.lines().next() {
        if let Some(rest) = first_line.strip_prefix("model:") {
            let model = rest.trim().to_string();
            if !model.is_empty() {
                let after = raw.strip_prefix(first_line).unwrap_or("");
                let after = after.strip_prefix('\n').unwrap_or(after);
                return (Some(model), after);
            }
        }
    }
    (None, raw)
}

fn read_required(path: &Path) -> Result<String, JamError> {
    std::fs::read_to_string(path).map_err(|err| JamError::PersonaLoad(format!("{}: {}", path.display(), err)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_model_override_detects_leading_line() {
        let raw = "model: gpt-5-high\nYou are the drummer.";
        let (model, body) = extract_model_override(raw);
        assert_eq!(model, Some("gpt-5-high".to_string()));
        assert_eq!(body, "You are the drummer.");
    }

    #[test]
    fn extract_model_override_falls_back_without_frontmatter() {
        let raw = "You are the bassist.";
        let (model, body) = extract_model_override(raw);
        assert_eq!(model, None);
        assert_eq!(body, "You are the bassist.");
    }

    #[test]
    fn load_all_errors_on_missing_file() {
        let config = JamOrchestratorConfig {
            persona_dir: std::path::PathBuf::from("/nonexistent/personas"),
            shared_policy_path: std::path::PathBuf::from("/nonexistent/shared.md"),
            dsl_reference_path: std::path::PathBuf::from("/nonexistent/dsl.md"),
            ..JamOrchestratorConfig::default()
        };
        assert!(load_all(&config).is_err());
    }

    #[test]
    fn unsupported_model_family_falls_back_to_default() {
        let dir = std::env::temp_dir().join(format!("jam_persona_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("drummer.md"), "model: homegrown-llm-v1\nYou are the drummer.").unwrap();
        std::fs::write(dir.join("shared.md"), "shared policy").unwrap();
        std::fs::write(dir.join("dsl.md"), "dsl reference").unwrap();

        let config = JamOrchestratorConfig {
            persona_dir: dir.clone(),
            shared_policy_path: dir.join("shared.md"),
            dsl_reference_path: dir.join("dsl.md"),
            default_model: "claude-sonnet-4-0".to_string(),
            ..JamOrchestratorConfig::default()
        };
        let persona = load_one(&config, AgentId::Drums, "shared policy", "dsl reference").unwrap();
        assert_eq!(persona.model, "claude-sonnet-4-0");
        assert!(!persona.system_prompt.contains("model:"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn config_model_override_wins_over_frontmatter() {
        let dir = std::env::temp_dir().join(format!("jam_persona_test_override_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("drummer.md"), "model: gpt-4o\nYou are the drummer.").unwrap();

        let mut model_overrides = std::collections::HashMap::new();
        model_overrides.insert(AgentId::Drums, "claude-opus-4-1".to_string());
        let config = JamOrchestratorConfig {
            persona_dir: dir.clone(),
            model_overrides,
            ..JamOrchestratorConfig::default()
        };
        let persona = load_one(&config, AgentId::Drums, "shared policy", "dsl reference").unwrap();
        assert_eq!(persona.model, "claude-opus-4-1");

        std::fs::remove_dir_all(&dir).ok();
    }
}
