//! Governance & State Machine (`SPEC_FULL.md` §4.6).
//!
//! Owns the rules for applying an agent's response to session state, for
//! aggregating decision-driven context drift, and for composing the three
//! turn kinds (jam-start, directive, auto-tick) on top of the LLM Session
//! Runner and the Broadcast Fan-out. Dispatch parallelism generalizes
//! `orchestration.rs`'s pattern of spawning one task per participant and
//! joining them before continuing the loop.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;

use crate::config::{
    confidence_multiplier, JamOrchestratorConfig, AUTO_TICK_DAMPENING, BPM_MAX, BPM_MIN,
    COMMENTARY_AUTO_TICK_MIN_ROUNDS, COMMENTARY_MAX_CHARS, ENERGY_MAX, ENERGY_MIN,
    KEY_CONSENSUS_MIN_AGENTS,
};
use crate::context_parser::{self, parse_directive, CueDirection, RelativeCues};
use crate::event::{
    AgentCommentary, AgentSnapshot, AgentStatusUpdate, AgentThought, DirectiveError, ExecutePayload,
    JamBroadcastEvent, JamEventHandler, JamStateUpdate, MusicalContextUpdate, TurnSource,
};
use crate::llm_runner::{AgentResponse, LlmRunner, TurnOutcome};
use crate::pattern;
use crate::session::{
    round_half_away_from_zero, AgentId, AgentState, AgentStatus, ArrangementIntent, Confidence,
    JamStartMode, Session, StructuredDecision,
};

lazy_static! {
    static ref MUTE_RE: Regex =
        Regex::new(r"(?i)\bmute\b|\bgo silent\b|\bstop playing\b|\bdrop out\b|\blay out\b|\bsit out\b")
            .unwrap();
    static ref UNMUTE_RE: Regex = Regex::new(r"(?i)\bunmute\b").unwrap();
}

fn is_mute_directive(text: &str) -> bool {
    MUTE_RE.is_match(text) && !UNMUTE_RE.is_match(text)
}

/// What apply_response should do with one agent's resolved outcome for this
/// turn (`SPEC_FULL.md` §4.6.4).
enum ResolvedResponse {
    Accepted(AgentResponse),
    Null,
    /// Validation-rejected after a failed repair retry: state is untouched.
    KeepPrevious,
}

/// Accumulates the events produced while applying one turn's responses, kept
/// separate from broadcast so ordering (`SPEC_FULL.md` §4.7) is enforced in
/// one place regardless of how many agents were involved.
#[derive(Default)]
struct TurnBatch {
    thoughts: Vec<JamBroadcastEvent>,
    commentary: Vec<JamBroadcastEvent>,
    statuses: Vec<JamBroadcastEvent>,
    changed_agents: Vec<AgentId>,
    context_changed: bool,
}

/// Runs the jam-start turn (`SPEC_FULL.md` §4.6.3).
pub async fn run_jam_start_turn(
    session: &mut Session,
    config: &JamOrchestratorConfig,
    runner: &LlmRunner,
    handler: &dyn JamEventHandler,
) {
    let now = Utc::now();

    if session.start_mode == JamStartMode::StagedSilent {
        let snapshot = build_snapshot(session, composite_program(session), session.round_number, None);
        handler.on_event(&JamBroadcastEvent::JamStateUpdate(snapshot)).await;
        return;
    }

    let targets: Vec<AgentId> = session.active_agents.iter().copied().collect();
    for &t in &targets {
        session.activate(t);
        if let Some(state) = session.agents.get_mut(&t) {
            state.status = AgentStatus::Thinking;
        }
    }

    session.round_number += 1;
    let round = session.round_number;

    let peers = build_peer_states(session);
    let audio = fresh_audio_summary(session, now);
    let prompts: HashMap<AgentId, String> = targets
        .iter()
        .map(|&t| (t, crate::prompt::build_jam_start_prompt(round, &session.musical_context, &peers, audio.as_deref())))
        .collect();

    let mut outcomes = dispatch_turns(session, runner, config, &targets, &prompts).await;

    let mut batch = TurnBatch::default();
    for &t in &targets {
        let outcome = outcomes.remove(&t).unwrap_or(TurnOutcome::Null { thread_id: None });
        let resolved = match outcome {
            TurnOutcome::Response { response, thread_id } => {
                update_thread_id(session, t, thread_id);
                ResolvedResponse::Accepted(response)
            }
            TurnOutcome::Null { thread_id } => {
                update_thread_id(session, t, thread_id);
                ResolvedResponse::Null
            }
            TurnOutcome::Dropped { reason } => {
                drop_session(session, t, &reason);
                ResolvedResponse::KeepPrevious
            }
        };
        apply_response(session, &mut batch, t, resolved, TurnSource::JamStart, None, round, now);
    }

    broadcast_batch(session, handler, batch, round, TurnSource::JamStart, now).await;
}

/// Runs a directive turn (`SPEC_FULL.md` §4.6.1).
pub async fn run_directive_turn(
    session: &mut Session,
    config: &JamOrchestratorConfig,
    runner: &LlmRunner,
    handler: &dyn JamEventHandler,
    text: &str,
    target: Option<AgentId>,
) {
    let now = Utc::now();

    if !session.preset_configured {
        emit_directive_error(
            handler,
            "Choose a genre preset and press Play before sending directives.".to_string(),
            None,
        )
        .await;
        return;
    }

    if let Some(t) = target {
        if !session.active_agents.contains(&t) {
            emit_directive_error(handler, format!("{} is not in this jam session", t.display_name()), Some(t)).await;
            return;
        }
        if !session.sessions.contains_key(&t) {
            emit_directive_error(handler, format!("{}'s process is unavailable", t.display_name()), Some(t)).await;
            return;
        }
    }

    let is_mute_verb = is_mute_directive(text);
    if let Some(t) = target {
        if session.is_muted(t) && !is_mute_verb {
            session.muted_agents.remove(&t);
            if let Some(state) = session.agents.get_mut(&t) {
                state.pending_thread_compaction = false;
                state.auto_tick_no_change_streak = 0;
            }
        }
    }

    let (partial, cues) = parse_directive(text, session.musical_context.bpm);

    if target.is_none() {
        let any_available = session
            .activated_agents
            .iter()
            .any(|a| !session.is_muted(*a) && session.sessions.contains_key(a));
        if !any_available {
            emit_directive_error(
                handler,
                "No activated agents are available to receive this directive.".to_string(),
                None,
            )
            .await;
            return;
        }
    }

    let targets: Vec<AgentId> = if let Some(t) = target {
        session.activate(t);
        vec![t]
    } else {
        session
            .activated_agents
            .iter()
            .copied()
            .filter(|a| !session.is_muted(*a) && session.sessions.contains_key(a))
            .collect()
    };

    for &t in &targets {
        if let Some(state) = session.agents.get_mut(&t) {
            state.status = AgentStatus::Thinking;
            state.pending_thread_compaction = false;
        }
    }

    session.round_number += 1;
    let round = session.round_number;

    apply_anchor_updates(session, &partial);

    let peers = build_peer_states(session);
    let audio = fresh_audio_summary(session, now);
    let prompts: HashMap<AgentId, String> = targets
        .iter()
        .map(|&t| {
            let targeted = target == Some(t);
            let current_pattern = session.agents[&t].current_pattern.clone();
            let prompt = crate::prompt::build_directive_prompt(
                round,
                text,
                targeted,
                &session.musical_context,
                &current_pattern,
                &peers,
                audio.as_deref(),
            );
            (t, prompt)
        })
        .collect();

    let mut outcomes = dispatch_turns(session, runner, config, &targets, &prompts).await;

    let mut resolved: HashMap<AgentId, ResolvedResponse> = HashMap::new();
    for &t in &targets {
        let outcome = outcomes.remove(&t).unwrap_or(TurnOutcome::Null { thread_id: None });
        match outcome {
            TurnOutcome::Response { response, thread_id } => {
                update_thread_id(session, t, thread_id);
                let needs_validation = response.pattern != "silence" && response.pattern != "no_change";
                let rejection = if needs_validation {
                    pattern::validate(&response.pattern).err()
                } else {
                    None
                };
                match rejection {
                    None => {
                        resolved.insert(t, ResolvedResponse::Accepted(response));
                    }
                    Some(reason) => {
                        let result = repair_retry(session, runner, handler, t, &prompts[&t], &reason).await;
                        resolved.insert(t, result);
                    }
                }
            }
            TurnOutcome::Null { thread_id } => {
                update_thread_id(session, t, thread_id);
                let reason = "no response received (timed out or unparseable)".to_string();
                let result = repair_retry(session, runner, handler, t, &prompts[&t], &reason).await;
                resolved.insert(t, result);
            }
            TurnOutcome::Dropped { reason } => {
                drop_session(session, t, &reason);
                resolved.insert(t, ResolvedResponse::KeepPrevious);
            }
        }
    }

    if is_mute_verb {
        if let Some(t) = target {
            resolved.insert(
                t,
                ResolvedResponse::Accepted(AgentResponse {
                    pattern: "silence".to_string(),
                    thoughts: "Muting for the boss.".to_string(),
                    commentary: None,
                    decision: None,
                }),
            );
            session.muted_agents.insert(t);
        }
    }

    let mut batch = TurnBatch::default();
    for &t in &targets {
        let r = resolved.remove(&t).unwrap_or(ResolvedResponse::KeepPrevious);
        apply_response(session, &mut batch, t, r, TurnSource::Directive, target, round, now);
    }

    apply_directive_context_delta(session, cues, partial.bpm.is_some(), partial.energy.is_some(), &targets, &mut batch);

    broadcast_batch(session, handler, batch, round, TurnSource::Directive, now).await;
}

/// Runs an auto-tick turn (`SPEC_FULL.md` §4.6.2).
pub async fn run_auto_tick_turn(
    session: &mut Session,
    config: &JamOrchestratorConfig,
    runner: &LlmRunner,
    handler: &dyn JamEventHandler,
) {
    let now = Utc::now();

    if !session.preset_configured {
        return;
    }

    for id in AgentId::ALL {
        let pending = session.agents.get(&id).map(|s| s.pending_thread_compaction).unwrap_or(false);
        if pending {
            if let Some(handle) = session.sessions.get_mut(&id) {
                handle.compact();
            }
            if let Some(state) = session.agents.get_mut(&id) {
                state.pending_thread_compaction = false;
                state.auto_tick_no_change_streak = 0;
            }
        }
    }

    let participants = session.eligible_participants();
    if participants.is_empty() {
        return;
    }

    let prior_patterns: HashMap<AgentId, String> =
        participants.iter().map(|&id| (id, session.agents[&id].current_pattern.clone())).collect();

    session.round_number += 1;
    let round = session.round_number;

    for &id in &participants {
        if let Some(state) = session.agents.get_mut(&id) {
            state.status = AgentStatus::Thinking;
        }
    }

    let peers = build_peer_states(session);
    let audio = fresh_audio_summary(session, now);
    let prompts: HashMap<AgentId, String> = participants
        .iter()
        .map(|&id| {
            let pattern = session.agents[&id].current_pattern.clone();
            let prompt =
                crate::prompt::build_auto_tick_prompt(round, &session.musical_context, &pattern, &peers, audio.as_deref());
            (id, prompt)
        })
        .collect();

    let mut outcomes = dispatch_turns(session, runner, config, &participants, &prompts).await;

    let mut raw_patterns: HashMap<AgentId, Option<String>> = HashMap::new();
    let mut batch = TurnBatch::default();
    for &id in &participants {
        let outcome = outcomes.remove(&id).unwrap_or(TurnOutcome::Null { thread_id: None });
        match outcome {
            TurnOutcome::Response { response, thread_id } => {
                update_thread_id(session, id, thread_id);
                let needs_validation = response.pattern != "silence" && response.pattern != "no_change";
                if needs_validation && pattern::validate(&response.pattern).is_err() {
                    raw_patterns.insert(id, None);
                    apply_response(session, &mut batch, id, ResolvedResponse::Null, TurnSource::AutoTick, None, round, now);
                } else {
                    raw_patterns.insert(id, Some(response.pattern.clone()));
                    apply_response(
                        session,
                        &mut batch,
                        id,
                        ResolvedResponse::Accepted(response),
                        TurnSource::AutoTick,
                        None,
                        round,
                        now,
                    );
                }
            }
            TurnOutcome::Null { thread_id } => {
                update_thread_id(session, id, thread_id);
                raw_patterns.insert(id, None);
                apply_response(session, &mut batch, id, ResolvedResponse::Null, TurnSource::AutoTick, None, round, now);
            }
            TurnOutcome::Dropped { reason } => {
                drop_session(session, id, &reason);
                raw_patterns.insert(id, None);
            }
        }
    }

    for &id in &participants {
        let had_nonsilence_before = prior_patterns.get(&id).map(|p| !p.is_empty() && p != "silence").unwrap_or(false);
        let was_no_change = raw_patterns.get(&id).and_then(|o| o.as_deref()) == Some("no_change");
        if let Some(state) = session.agents.get_mut(&id) {
            if was_no_change && had_nonsilence_before {
                state.auto_tick_no_change_streak += 1;
            } else {
                state.auto_tick_no_change_streak = 0;
            }
            if state.auto_tick_no_change_streak >= config.thread_compaction_streak {
                state.pending_thread_compaction = true;
                state.auto_tick_no_change_streak = 0;
            }
        }
    }

    apply_auto_tick_drift(session, &participants, &mut batch);
    apply_context_suggestions(session, &participants, &mut batch);

    broadcast_batch(session, handler, batch, round, TurnSource::AutoTick, now).await;
}

/// Spawns one subprocess turn per target, following the
/// `tasks.push(tokio::spawn(...))` + join fan-out pattern in `orchestration.rs`.
async fn dispatch_turns(
    session: &Session,
    runner: &LlmRunner,
    _config: &JamOrchestratorConfig,
    targets: &[AgentId],
    prompts: &HashMap<AgentId, String>,
) -> HashMap<AgentId, TurnOutcome> {
    let mut handles = Vec::new();
    for &t in targets {
        let handle = match session.sessions.get(&t) {
            Some(h) => h,
            None => continue,
        };
        let runner = runner.clone();
        let prompt = prompts.get(&t).cloned().unwrap_or_default();
        let model = handle.model.clone();
        let thread_id = handle.thread_id.clone();
        handles.push((
            t,
            tokio::spawn(async move { runner.run_turn(&prompt, &model, thread_id.as_deref(), &[]).await }),
        ));
    }

    let mut results = HashMap::new();
    for (t, join_handle) in handles {
        let outcome = join_handle.await.unwrap_or(TurnOutcome::Null { thread_id: None });
        results.insert(t, outcome);
    }
    results
}

async fn dispatch_single(session: &Session, runner: &LlmRunner, agent: AgentId, prompt: String) -> TurnOutcome {
    match session.sessions.get(&agent) {
        Some(handle) => runner.run_turn(&prompt, &handle.model, handle.thread_id.as_deref(), &[]).await,
        None => TurnOutcome::Null { thread_id: None },
    }
}

/// One-shot repair retry for a directive-turn outcome that was rejected by
/// the validator or came back null (timeout/unparseable), per `SPEC_FULL.md`
/// §4.6.1 step 6: re-prompt once with the rejection reason attached, keep the
/// previous pattern if the retry also fails.
async fn repair_retry(
    session: &mut Session,
    runner: &LlmRunner,
    handler: &dyn JamEventHandler,
    agent: AgentId,
    original_prompt: &str,
    reason: &str,
) -> ResolvedResponse {
    let repair_prompt = format!(
        "{}\n\nYour previous response was rejected: {}. Respond with strict JSON and a valid pattern.",
        original_prompt, reason
    );
    let retry = dispatch_single(session, runner, agent, repair_prompt).await;
    match retry {
        TurnOutcome::Response { response: retry_response, thread_id: retry_thread } => {
            update_thread_id(session, agent, retry_thread);
            let retry_ok = retry_response.pattern == "silence"
                || retry_response.pattern == "no_change"
                || pattern::validate(&retry_response.pattern).is_ok();
            if retry_ok {
                ResolvedResponse::Accepted(retry_response)
            } else {
                emit_directive_error(handler, format!("{}: {}", agent.display_name(), reason), Some(agent)).await;
                ResolvedResponse::KeepPrevious
            }
        }
        TurnOutcome::Null { thread_id: retry_thread } => {
            update_thread_id(session, agent, retry_thread);
            emit_directive_error(handler, format!("{}: {}", agent.display_name(), reason), Some(agent)).await;
            ResolvedResponse::KeepPrevious
        }
        TurnOutcome::Dropped { reason: drop_reason } => {
            drop_session(session, agent, &drop_reason);
            ResolvedResponse::KeepPrevious
        }
    }
}

fn update_thread_id(session: &mut Session, agent: AgentId, thread_id: Option<String>) {
    if let Some(id) = thread_id {
        if let Some(handle) = session.sessions.get_mut(&agent) {
            handle.thread_id = Some(id);
        }
    }
}

fn drop_session(session: &mut Session, agent: AgentId, reason: &str) {
    log::warn!("dropping llm session for {}: {}", agent, reason);
    session.sessions.remove(&agent);
    if let Some(state) = session.agents.get_mut(&agent) {
        state.status = AgentStatus::Error;
    }
}

async fn emit_directive_error(handler: &dyn JamEventHandler, message: String, target_agent: Option<AgentId>) {
    handler
        .on_event(&JamBroadcastEvent::DirectiveError(DirectiveError { message, target_agent }))
        .await;
}

/// Returns the audio-feedback summary if still within its TTL, per
/// `SPEC_FULL.md` §3.7.
fn fresh_audio_summary(session: &Session, now: DateTime<Utc>) -> Option<String> {
    session
        .audio_feedback
        .as_ref()
        .filter(|feedback| feedback.is_fresh(now))
        .map(|feedback| feedback.summary.clone())
}

fn build_peer_states(session: &Session) -> Vec<crate::prompt::PeerBandState> {
    AgentId::ALL
        .iter()
        .map(|&id| {
            let state = &session.agents[&id];
            let pattern_or_silence = if session.is_muted(id) || state.is_silent() {
                "silence".to_string()
            } else {
                state.current_pattern.clone()
            };
            crate::prompt::PeerBandState {
                emoji: id.emoji(),
                name: id.display_name(),
                key: id.persona_key().to_string(),
                summary: pattern::summarize(&state.current_pattern),
                pattern_or_silence,
            }
        })
        .collect()
}

fn apply_anchor_updates(session: &mut Session, partial: &context_parser::PartialMusicalContext) {
    if let (Some(key), Some(scale)) = (&partial.key, &partial.scale) {
        session.musical_context.key = key.clone();
        session.musical_context.scale = scale.clone();
    }
    if let Some(bpm) = partial.bpm {
        session.musical_context.bpm = bpm;
    }
    if let Some(energy) = partial.energy {
        session.musical_context.energy = energy;
    }
}

/// Installs `resolved` into `agent_id`'s state, implementing the shared
/// response-application rules (`SPEC_FULL.md` §4.6.4).
fn apply_response(
    session: &mut Session,
    batch: &mut TurnBatch,
    agent_id: AgentId,
    resolved: ResolvedResponse,
    turn_source: TurnSource,
    directive_target: Option<AgentId>,
    round: u64,
    now: DateTime<Utc>,
) {
    let is_directive_target = directive_target == Some(agent_id);

    match resolved {
        ResolvedResponse::KeepPrevious => {}
        ResolvedResponse::Null => {
            let state = session.agents.get_mut(&agent_id).expect("agent state exists");
            let prior_pattern = state.current_pattern.clone();
            let fallback_nonsilence = !state.fallback_pattern.is_empty() && state.fallback_pattern != "silence";
            state.current_pattern = if fallback_nonsilence {
                state.fallback_pattern.clone()
            } else {
                "silence".to_string()
            };
            state.status = if fallback_nonsilence { AgentStatus::Playing } else { AgentStatus::Timeout };
            state.last_updated = now;
            if state.current_pattern != prior_pattern {
                batch.changed_agents.push(agent_id);
            }
            batch.statuses.push(status_event(agent_id, state.status));
            if turn_source == TurnSource::Directive && is_directive_target {
                let state = session.agents.get_mut(&agent_id).unwrap();
                process_commentary(state, batch, agent_id, None, None, turn_source, true, round, now);
            }
        }
        ResolvedResponse::Accepted(response) => {
            let state = session.agents.get_mut(&agent_id).expect("agent state exists");
            let prior_pattern = state.current_pattern.clone();
            let raw_pattern = response.pattern.trim().to_string();

            let override_allowed = response.decision.as_ref().map_or(false, |d| {
                d.confidence == Some(Confidence::High)
                    && matches!(
                        d.arrangement_intent,
                        Some(ArrangementIntent::Breakdown) | Some(ArrangementIntent::StripBack) | Some(ArrangementIntent::Transition)
                    )
            });
            let had_nonsilence = !prior_pattern.is_empty() && prior_pattern != "silence";
            let treat_as_no_change = raw_pattern == "no_change"
                || (turn_source == TurnSource::AutoTick && raw_pattern == "silence" && had_nonsilence && !override_allowed);

            if treat_as_no_change {
                if state.current_pattern.is_empty() {
                    state.current_pattern = "silence".to_string();
                }
            } else {
                state.current_pattern = raw_pattern.clone();
                if raw_pattern != "silence" {
                    state.fallback_pattern = raw_pattern.clone();
                }
            }
            state.status = if state.current_pattern != "silence" { AgentStatus::Playing } else { AgentStatus::Idle };
            state.thoughts = response.thoughts.clone();
            state.last_updated = now;
            state.last_decision = response.decision.clone();

            if state.current_pattern != prior_pattern {
                batch.changed_agents.push(agent_id);
            }
            batch.thoughts.push(thought_event(agent_id, state));
            batch.statuses.push(status_event(agent_id, state.status));

            let state = session.agents.get_mut(&agent_id).unwrap();
            process_commentary(
                state,
                batch,
                agent_id,
                response.commentary.as_deref(),
                Some(response.thoughts.as_str()),
                turn_source,
                is_directive_target,
                round,
                now,
            );
        }
    }
}

/// Commentary emission rules (`SPEC_FULL.md` §4.6.5).
fn process_commentary(
    state: &mut AgentState,
    batch: &mut TurnBatch,
    agent_id: AgentId,
    commentary: Option<&str>,
    thoughts: Option<&str>,
    turn_source: TurnSource,
    is_directive_target: bool,
    round: u64,
    now: DateTime<Utc>,
) {
    let guaranteed = turn_source == TurnSource::Directive && is_directive_target;

    let raw: String = if guaranteed {
        commentary
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .or_else(|| thoughts.map(str::trim).filter(|s| !s.is_empty()))
            .unwrap_or("Locking in your cue.")
            .to_string()
    } else {
        match commentary.map(str::trim) {
            Some(text) if !text.is_empty() => text.to_string(),
            _ => return,
        }
    };

    let truncated = truncate_commentary(&raw);
    let signature = normalize_signature(&truncated);

    if !guaranteed {
        if signature.is_empty() {
            return;
        }
        let thoughts_sig = thoughts.map(normalize_signature).unwrap_or_default();
        if signature == thoughts_sig {
            return;
        }
        if state.commentary_runtime.contains(&signature) {
            return;
        }
        if turn_source == TurnSource::AutoTick {
            if let Some(last) = state.commentary_runtime.last_emitted_round {
                if round.saturating_sub(last) < COMMENTARY_AUTO_TICK_MIN_ROUNDS {
                    return;
                }
            }
        }
    }

    batch.commentary.push(JamBroadcastEvent::AgentCommentary(AgentCommentary {
        agent: agent_id,
        emoji: agent_id.emoji(),
        text: truncated,
        timestamp: now,
    }));
    state.commentary_runtime.remember(round, signature);
}

fn truncate_commentary(text: &str) -> String {
    let truncated: String = text.chars().take(COMMENTARY_MAX_CHARS).collect();
    truncated.trim_end().to_string()
}

fn normalize_signature(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = false;
    for ch in text.to_ascii_lowercase().chars() {
        if ch.is_alphanumeric() {
            out.push(ch);
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    out.trim().to_string()
}

fn thought_event(agent: AgentId, state: &AgentState) -> JamBroadcastEvent {
    JamBroadcastEvent::AgentThought(AgentThought {
        agent,
        emoji: agent.emoji(),
        thought: state.thoughts.clone(),
        pattern: state.current_pattern.clone(),
        timestamp: state.last_updated,
    })
}

fn status_event(agent: AgentId, status: AgentStatus) -> JamBroadcastEvent {
    JamBroadcastEvent::AgentStatus(AgentStatusUpdate { agent, status })
}

/// Model-relative context delta for a directive turn (`SPEC_FULL.md` §4.6.1 step 9).
fn apply_directive_context_delta(
    session: &mut Session,
    cues: RelativeCues,
    tempo_anchor_applied: bool,
    energy_anchor_applied: bool,
    participants: &[AgentId],
    batch: &mut TurnBatch,
) {
    if let Some(dir) = cues.tempo {
        if dir != CueDirection::Mixed && !tempo_anchor_applied {
            if let Some(avg) = aggregate_cue_weighted(session, participants, dir, |d| d.tempo_delta_pct) {
                apply_tempo_delta_pct(session, round_half_away_from_zero(avg));
                batch.context_changed = true;
            }
        }
    }
    if let Some(dir) = cues.energy {
        if dir != CueDirection::Mixed && !energy_anchor_applied {
            if let Some(avg) = aggregate_cue_weighted(session, participants, dir, |d| d.energy_delta.map(|v| v as f64)) {
                apply_energy_delta(session, avg);
                batch.context_changed = true;
            }
        }
    }
}

/// Averages confidence-weighted contributions whose sign matches `dir`,
/// counting only decisions with non-zero confidence weight.
fn aggregate_cue_weighted<F>(session: &Session, participants: &[AgentId], dir: CueDirection, extract: F) -> Option<f64>
where
    F: Fn(&StructuredDecision) -> Option<f64>,
{
    let mut contributions = Vec::new();
    for &id in participants {
        if let Some(decision) = &session.agents[&id].last_decision {
            if let (Some(value), Some(confidence)) = (extract(decision), decision.confidence) {
                let weight = confidence_multiplier(confidence);
                if weight <= 0.0 {
                    continue;
                }
                let matches_dir = match dir {
                    CueDirection::Increase => value > 0.0,
                    CueDirection::Decrease => value < 0.0,
                    CueDirection::Mixed => false,
                };
                if matches_dir {
                    contributions.push(value * weight);
                }
            }
        }
    }
    if contributions.is_empty() {
        return None;
    }
    Some(contributions.iter().sum::<f64>() / contributions.len() as f64)
}

fn apply_tempo_delta_pct(session: &mut Session, pct: f64) {
    let delta_bpm = round_half_away_from_zero(session.musical_context.bpm as f64 * pct / 100.0);
    let new_bpm = (session.musical_context.bpm as f64 + delta_bpm) as i32;
    session.musical_context.bpm = new_bpm.clamp(BPM_MIN, BPM_MAX);
}

fn apply_energy_delta(session: &mut Session, delta: f64) {
    let rounded = round_half_away_from_zero(delta) as i32;
    session.musical_context.energy = (session.musical_context.energy + rounded).clamp(ENERGY_MIN, ENERGY_MAX);
}

/// Auto-tick drift, independent of cues and dampened (`SPEC_FULL.md` §4.6.2 step 7).
fn apply_auto_tick_drift(session: &mut Session, participants: &[AgentId], batch: &mut TurnBatch) {
    let tempo_contribs: Vec<f64> = participants
        .iter()
        .filter_map(|id| {
            session.agents[id].last_decision.as_ref().and_then(|d| match (d.tempo_delta_pct, d.confidence) {
                (Some(v), Some(c)) => {
                    let w = confidence_multiplier(c);
                    if w > 0.0 {
                        Some(v * w)
                    } else {
                        None
                    }
                }
                _ => None,
            })
        })
        .collect();
    if !tempo_contribs.is_empty() {
        let avg = tempo_contribs.iter().sum::<f64>() / tempo_contribs.len() as f64 * AUTO_TICK_DAMPENING;
        apply_tempo_delta_pct(session, avg);
        batch.context_changed = true;
    }

    let energy_contribs: Vec<f64> = participants
        .iter()
        .filter_map(|id| {
            session.agents[id].last_decision.as_ref().and_then(|d| match (d.energy_delta, d.confidence) {
                (Some(v), Some(c)) => {
                    let w = confidence_multiplier(c);
                    if w > 0.0 {
                        Some(v as f64 * w)
                    } else {
                        None
                    }
                }
                _ => None,
            })
        })
        .collect();
    if !energy_contribs.is_empty() {
        let avg = energy_contribs.iter().sum::<f64>() / energy_contribs.len() as f64 * AUTO_TICK_DAMPENING;
        apply_energy_delta(session, avg);
        batch.context_changed = true;
    }
}

/// Key consensus and chord-suggestion fallback (`SPEC_FULL.md` §4.6.2 step 8).
fn apply_context_suggestions(session: &mut Session, participants: &[AgentId], batch: &mut TurnBatch) {
    let mut key_votes: HashMap<String, usize> = HashMap::new();
    for &id in participants {
        if let Some(d) = &session.agents[&id].last_decision {
            if d.confidence == Some(Confidence::High) {
                if let Some(key) = &d.suggested_key {
                    *key_votes.entry(key.clone()).or_insert(0) += 1;
                }
            }
        }
    }
    let consensus_key = key_votes.into_iter().find(|(_, count)| *count >= KEY_CONSENSUS_MIN_AGENTS).map(|(k, _)| k);

    if let Some(key) = consensus_key {
        if let Some((scale, minor)) = context_parser::key_to_scale(&key) {
            session.musical_context.chord_progression = context_parser::diatonic_fallback_chords(&scale, minor);
            session.musical_context.key = key;
            session.musical_context.scale = scale;
            batch.context_changed = true;
            return;
        }
    }

    for &id in participants {
        if let Some(d) = &session.agents[&id].last_decision {
            if d.confidence == Some(Confidence::High) {
                if let Some(chords) = &d.suggested_chords {
                    if !chords.is_empty() {
                        session.musical_context.chord_progression = chords.clone();
                        batch.context_changed = true;
                        return;
                    }
                }
            }
        }
    }
}

/// Composite program (`SPEC_FULL.md` §4.6.6).
pub fn composite_program(session: &Session) -> String {
    let patterns: Vec<&str> = session
        .activated_agents
        .iter()
        .filter(|a| !session.is_muted(**a))
        .filter_map(|a| {
            let state = &session.agents[a];
            if state.is_silent() {
                None
            } else {
                Some(state.current_pattern.as_str())
            }
        })
        .collect();
    match patterns.len() {
        0 => "silence".to_string(),
        1 => patterns[0].to_string(),
        _ => format!("stack({})", patterns.join(", ")),
    }
}

pub(crate) fn build_snapshot(session: &Session, code: String, round: u64, turn_source: Option<TurnSource>) -> JamStateUpdate {
    let agents = AgentId::ALL
        .iter()
        .map(|&id| {
            let state = &session.agents[&id];
            AgentSnapshot {
                id,
                status: state.status,
                current_pattern: state.current_pattern.clone(),
                thoughts: state.thoughts.clone(),
            }
        })
        .collect();
    JamStateUpdate {
        session_id: session.session_id.clone(),
        round,
        musical_context: session.musical_context.clone(),
        agents,
        activated: session.activated_agents.clone(),
        muted: session.muted_agents.iter().copied().collect(),
        combined_pattern: code,
        turn_source,
    }
}

/// Emits one logical broadcast batch in the order mandated by `SPEC_FULL.md` §4.7.
async fn broadcast_batch(
    session: &Session,
    handler: &dyn JamEventHandler,
    batch: TurnBatch,
    round: u64,
    turn_source: TurnSource,
    now: DateTime<Utc>,
) {
    for event in &batch.thoughts {
        handler.on_event(event).await;
    }
    for event in &batch.commentary {
        handler.on_event(event).await;
    }
    for event in &batch.statuses {
        handler.on_event(event).await;
    }
    if batch.context_changed {
        handler
            .on_event(&JamBroadcastEvent::MusicalContextUpdate(MusicalContextUpdate {
                musical_context: session.musical_context.clone(),
            }))
            .await;
    }

    let code = composite_program(session);
    let changed = !batch.changed_agents.is_empty();
    handler
        .on_event(&JamBroadcastEvent::Execute(ExecutePayload {
            code: code.clone(),
            session_id: session.session_id.clone(),
            round,
            turn_source,
            changed_agents: batch.changed_agents,
            changed,
            issued_at_ms: now.timestamp_millis(),
        }))
        .await;

    let snapshot = build_snapshot(session, code, round, Some(turn_source));
    handler.on_event(&JamBroadcastEvent::JamStateUpdate(snapshot)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_signature_collapses_punctuation() {
        assert_eq!(normalize_signature("Hey!!  Nice groove."), "hey nice groove");
    }

    #[test]
    fn truncate_commentary_trims_trailing_whitespace() {
        let long = "a".repeat(COMMENTARY_MAX_CHARS + 10);
        let truncated = truncate_commentary(&long);
        assert_eq!(truncated.chars().count(), COMMENTARY_MAX_CHARS);
    }

    #[test]
    fn is_mute_directive_ignores_unmute() {
        assert!(is_mute_directive("mute the bass"));
        assert!(!is_mute_directive("unmute the bass please"));
        assert!(is_mute_directive("drop out for a bit"));
    }

    #[test]
    fn composite_program_is_silence_when_nothing_playing() {
        let session = Session::new("s1".to_string(), JamStartMode::AutonomousOpening, Utc::now());
        assert_eq!(composite_program(&session), "silence");
    }
}
