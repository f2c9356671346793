//! Prompt/Context Builder (`SPEC_FULL.md` §4.3).
//!
//! Deterministic string templates for the three turn kinds. Grounded on
//! `cloudllm::council_session`'s `build_messages_for_participant` /
//! `format_turn_for_participant` — one function per "what does a peer's
//! state look like from this agent's point of view" concern, composed into
//! a final prompt string.

use crate::session::MusicalContext;

/// One peer's band-state line contribution (`SPEC_FULL.md` §4.3).
#[derive(Debug, Clone)]
pub struct PeerBandState {
    pub emoji: &'static str,
    pub name: &'static str,
    pub key: String,
    pub summary: Option<String>,
    /// `"silence"` for muted peers or peers with no pattern yet.
    pub pattern_or_silence: String,
}

const JSON_CONTRACT: &str = concat!(
    "Respond with a single strict JSON object (no prose outside it):\n",
    "{\n",
    "  \"pattern\": string,        // required\n",
    "  \"thoughts\": string,       // required\n",
    "  \"commentary\": string,     // optional, short chat-facing line\n",
    "  \"decision\": {             // optional\n",
    "    \"tempo_delta_pct\": number,\n",
    "    \"energy_delta\": number,\n",
    "    \"arrangement_intent\": string,\n",
    "    \"confidence\": \"low\" | \"medium\" | \"high\",\n",
    "    \"suggested_key\": string,\n",
    "    \"suggested_chords\": [string]\n",
    "  }\n",
    "}",
);

fn context_lines(ctx: &MusicalContext) -> String {
    let mut lines = Vec::new();
    if !ctx.genre.is_empty() {
        lines.push(format!("Genre: {}", ctx.genre));
    }
    let key_part = if ctx.key.is_empty() {
        "unset".to_string()
    } else {
        format!("{} ({})", ctx.key, ctx.scale.join(" "))
    };
    lines.push(format!(
        "Key/Scale: {} | BPM: {} | Time: {} | Energy: {}/10",
        key_part, ctx.bpm, ctx.time_signature, ctx.energy
    ));
    if !ctx.chord_progression.is_empty() {
        lines.push(format!("Chords: {}", ctx.chord_progression.join(" - ")));
    }
    lines.join("\n")
}

fn band_state_block(peers: &[PeerBandState], first_round: bool) -> String {
    peers
        .iter()
        .map(|p| {
            if first_round {
                format!("{} {}: first round — no pattern yet", p.emoji, p.name)
            } else {
                let summary = p
                    .summary
                    .as_deref()
                    .map(|s| format!(" [{}]", s))
                    .unwrap_or_default();
                format!(
                    "{} {} ({}){}: {}",
                    p.emoji, p.name, p.key, summary, p.pattern_or_silence
                )
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn audio_block(audio_summary: Option<&str>) -> String {
    match audio_summary {
        Some(summary) if !summary.is_empty() => format!("\nAUDIO FEEDBACK:\n{}\n", summary),
        _ => String::new(),
    }
}

/// Builds the `jam_start` prompt (`SPEC_FULL.md` §4.3).
pub fn build_jam_start_prompt(
    round: u64,
    ctx: &MusicalContext,
    peers: &[PeerBandState],
    audio_summary: Option<&str>,
) -> String {
    format!(
        "JAM START — CONTEXT\nRound {} (first round)\n{}\n{}BAND:\n{}\nThe boss hasn't said anything yet.\nNo pattern yet — lay down the first groove.\n\n{}",
        round,
        context_lines(ctx),
        audio_block(audio_summary),
        band_state_block(peers, true),
        JSON_CONTRACT,
    )
}

/// Builds a `directive` prompt (`SPEC_FULL.md` §4.3). `targeted` distinguishes
/// `BOSS SAYS TO YOU:` from a broadcast `BOSS SAYS:`.
pub fn build_directive_prompt(
    round: u64,
    directive_text: &str,
    targeted: bool,
    ctx: &MusicalContext,
    current_pattern: &str,
    peers: &[PeerBandState],
    audio_summary: Option<&str>,
) -> String {
    let boss_line = if targeted {
        format!("BOSS SAYS TO YOU: {}", directive_text)
    } else {
        format!("BOSS SAYS: {}", directive_text)
    };
    format!(
        "DIRECTIVE from the boss.\nRound {}\n{}\n{}\n{}Your current pattern: {}\nBAND:\n{}\nRespond with your updated pattern.\n\n{}",
        round,
        boss_line,
        context_lines(ctx),
        audio_block(audio_summary),
        current_pattern,
        band_state_block(peers, false),
        JSON_CONTRACT,
    )
}

/// Builds an `auto_tick` prompt (`SPEC_FULL.md` §4.3).
pub fn build_auto_tick_prompt(
    round: u64,
    ctx: &MusicalContext,
    current_pattern: &str,
    peers: &[PeerBandState],
    audio_summary: Option<&str>,
) -> String {
    format!(
        "AUTO-TICK — LISTEN AND EVOLVE\nRound {}\n{}\n{}Your current pattern: {}\nBAND:\n{}\nHold with `no_change` when the groove still serves the jam; avoid long no_change runs; use silence only for a deliberate strip-back.\n\n{}",
        round,
        context_lines(ctx),
        audio_block(audio_summary),
        current_pattern,
        band_state_block(peers, false),
        JSON_CONTRACT,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> MusicalContext {
        MusicalContext {
            genre: "house".to_string(),
            key: "G major".to_string(),
            scale: vec!["G", "A", "B", "C", "D", "E", "F#"]
                .into_iter()
                .map(String::from)
                .collect(),
            chord_progression: vec!["G", "Em", "C", "D"].into_iter().map(String::from).collect(),
            bpm: 124,
            time_signature: "4/4".to_string(),
            energy: 6,
        }
    }

    #[test]
    fn jam_start_is_deterministic() {
        let a = build_jam_start_prompt(1, &ctx(), &[], None);
        let b = build_jam_start_prompt(1, &ctx(), &[], None);
        assert_eq!(a, b);
        assert!(a.contains("JAM START — CONTEXT"));
        assert!(a.contains("no pattern yet"));
    }

    #[test]
    fn directive_prompt_distinguishes_targeted() {
        let targeted = build_directive_prompt(2, "more cowbell", true, &ctx(), "silence", &[], None);
        let broadcast = build_directive_prompt(2, "more cowbell", false, &ctx(), "silence", &[], None);
        assert!(targeted.contains("BOSS SAYS TO YOU: more cowbell"));
        assert!(broadcast.contains("BOSS SAYS: more cowbell"));
    }

    #[test]
    fn auto_tick_prompt_mentions_no_change_guidance() {
        let prompt = build_auto_tick_prompt(3, &ctx(), "s(\"bd sd\")", &[], None);
        assert!(prompt.contains("AUTO-TICK"));
        assert!(prompt.contains("no_change"));
    }
}
