//! LLM Session Runner (`SPEC_FULL.md` §4.4, §6.1).
//!
//! Spawns the LLM CLI as a subprocess per agent-turn, streams its NDJSON
//! stdout, and resolves a single structured response or `None`.
//!
//! Subprocess shape — piped stdio under `tokio::time::timeout`, concurrent
//! stdout/stderr draining, `kill().await` + `wait().await` on the
//! timeout/cancel path — is grounded directly on
//! `tools/bash::BashTool::execute`.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;

use crate::config::SUBPROCESS_GRACE_MS;
use crate::ndjson::{extract_response_object, normalize_line, ParseState, RuntimeEvent};
use crate::session::{ArrangementIntent, Confidence, StructuredDecision};

lazy_static! {
    static ref TRANSPORT_ERROR_RE: Regex =
        Regex::new(r"(?i)websocket (?:reset|closed)|econnreset|connection reset|broken pipe").unwrap();
    static ref CACHE_TTL_WARNING_RE: Regex = Regex::new(r"(?i)cache.{0,10}ttl.{0,10}expir").unwrap();
}

/// A shape-validated agent response (`SPEC_FULL.md` §3.5).
#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub pattern: String,
    pub thoughts: String,
    pub commentary: Option<String>,
    pub decision: Option<StructuredDecision>,
}

/// Outcome of one dispatched turn for one agent.
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    /// A structurally valid response, plus the thread id to remember for the
    /// next turn (unchanged if no `thread.started` event arrived).
    Response {
        response: AgentResponse,
        thread_id: Option<String>,
    },
    /// Timeout or parse failure: caller falls back to the previous pattern.
    Null { thread_id: Option<String> },
    /// Non-zero exit without a recognized transport retry: the agent session
    /// must be dropped from the active map.
    Dropped { reason: String },
}

/// Spawns and drives the LLM CLI subprocess for a single agent turn.
#[derive(Clone)]
pub struct LlmRunner {
    pub cli_path: PathBuf,
    pub timeout: Duration,
}

impl LlmRunner {
    pub fn new(cli_path: PathBuf, timeout: Duration) -> Self {
        LlmRunner { cli_path, timeout }
    }

    /// Builds the subprocess argument vector (`SPEC_FULL.md` §4.4 step 1).
    fn build_args(&self, model: &str, thread_id: Option<&str>, config_overrides: &[(String, String)]) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        match thread_id {
            Some(id) => {
                args.push("resume".to_string());
                args.push(id.to_string());
            }
            None => {
                args.push("--profile".to_string());
                args.push("default".to_string());
            }
        }
        args.push("--model".to_string());
        args.push(model.to_string());
        for (k, v) in config_overrides {
            args.push("-c".to_string());
            args.push(format!("{}={}", k, v));
        }
        args
    }

    /// Runs one turn, retrying exactly once on a recognized transport error
    /// (`SPEC_FULL.md` §4.4 steps 2-7).
    pub async fn run_turn(
        &self,
        prompt: &str,
        model: &str,
        thread_id: Option<&str>,
        config_overrides: &[(String, String)],
    ) -> TurnOutcome {
        match self.run_turn_once(prompt, model, thread_id, config_overrides).await {
            AttemptOutcome::TransportRetry => {
                log::warn!("llm subprocess reported a transport error; retrying turn once");
                match self.run_turn_once(prompt, model, thread_id, config_overrides).await {
                    AttemptOutcome::Final(outcome) => outcome,
                    AttemptOutcome::TransportRetry => TurnOutcome::Null {
                        thread_id: thread_id.map(String::from),
                    },
                }
            }
            AttemptOutcome::Final(outcome) => outcome,
        }
    }

    async fn run_turn_once(
        &self,
        prompt: &str,
        model: &str,
        thread_id: Option<&str>,
        config_overrides: &[(String, String)],
    ) -> AttemptOutcome {
        let args = self.build_args(model, thread_id, config_overrides);

        let spawn_result = Command::new(&self.cli_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawn_result {
            Ok(child) => child,
            Err(err) => {
                return AttemptOutcome::Final(TurnOutcome::Dropped {
                    reason: format!("failed to spawn llm cli: {}", err),
                });
            }
        };

        if let Err(err) = write_prompt(&mut child, prompt).await {
            let _ = child.kill().await;
            let _ = child.wait().await;
            return AttemptOutcome::Final(TurnOutcome::Dropped {
                reason: format!("failed to write prompt: {}", err),
            });
        }

        let stdout = match child.stdout.take() {
            Some(s) => s,
            None => {
                let _ = child.kill().await;
                return AttemptOutcome::Final(TurnOutcome::Null { thread_id: thread_id.map(String::from) });
            }
        };
        let stderr = match child.stderr.take() {
            Some(s) => s,
            None => {
                let _ = child.kill().await;
                return AttemptOutcome::Final(TurnOutcome::Null { thread_id: thread_id.map(String::from) });
            }
        };

        let (transport_tx, transport_rx) = oneshot::channel::<()>();
        let stderr_task = tokio::spawn(watch_stderr(stderr, transport_tx));

        let drive = drive_stdout(stdout, transport_rx);

        let result = tokio::time::timeout(self.timeout, drive).await;
        let _ = stderr_task.await;

        match result {
            Ok(DriveResult::Completed { state, error }) => {
                let status = child.wait().await;
                match error {
                    Some(msg) => {
                        log::warn!("llm turn failed: {}", msg);
                        AttemptOutcome::Final(TurnOutcome::Null { thread_id: state.thread_id })
                    }
                    None => match status {
                        Ok(status) if !status.success() => AttemptOutcome::Final(TurnOutcome::Dropped {
                            reason: format!("llm cli exited with status {:?}", status.code()),
                        }),
                        _ => finalize_response(state),
                    },
                }
            }
            Ok(DriveResult::TransportError { state: _ }) => {
                terminate_gracefully(&mut child).await;
                AttemptOutcome::TransportRetry
            }
            Err(_elapsed) => {
                log::warn!("llm turn exceeded timeout; terminating subprocess");
                terminate_gracefully(&mut child).await;
                AttemptOutcome::Final(TurnOutcome::Null { thread_id: thread_id.map(String::from) })
            }
        }
    }
}

enum AttemptOutcome {
    Final(TurnOutcome),
    TransportRetry,
}

enum DriveResult {
    Completed { state: ParseState, error: Option<String> },
    TransportError { state: ParseState },
}

async fn write_prompt(child: &mut Child, prompt: &str) -> std::io::Result<()> {
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(prompt.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.shutdown().await?;
    }
    Ok(())
}

/// Sends a graceful termination signal, waits a short grace period for the
/// subprocess to exit on its own, then escalates to a forceful kill and reaps
/// it either way. Grounded on the SIGTERM-then-SIGKILL subprocess teardown
/// used elsewhere in the wider agent-runner ecosystem.
async fn terminate_gracefully(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: `pid` is this child's own process id, read just above.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            if tokio::time::timeout(Duration::from_millis(SUBPROCESS_GRACE_MS), child.wait())
                .await
                .is_ok()
            {
                return;
            }
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Reads stdout line by line, normalizing each line, until a terminal event
/// or a transport-error signal from the stderr watcher arrives.
async fn drive_stdout(
    stdout: tokio::process::ChildStdout,
    mut transport_rx: oneshot::Receiver<()>,
) -> DriveResult {
    let mut reader = BufReader::new(stdout).lines();
    let mut state = ParseState::default();

    loop {
        tokio::select! {
            biased;
            _ = &mut transport_rx => {
                return DriveResult::TransportError { state };
            }
            line = reader.next_line() => {
                match line {
                    Ok(Some(raw)) => {
                        if raw.trim().is_empty() {
                            continue;
                        }
                        let parsed: Value = match serde_json::from_str(&raw) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        let outcome = normalize_line(&parsed, &mut state);
                        let mut turn_error = None;
                        for event in &outcome.events {
                            if let RuntimeEvent::Error(msg) = event {
                                turn_error = Some(msg.clone());
                            }
                        }
                        if outcome.turn_completed {
                            return DriveResult::Completed { state, error: turn_error };
                        }
                    }
                    Ok(None) => {
                        return DriveResult::Completed { state, error: None };
                    }
                    Err(_) => {
                        return DriveResult::Completed { state, error: Some("stdout read error".to_string()) };
                    }
                }
            }
        }
    }
}

/// Drains stderr, logging a cache-TTL warning at most once, and signals the
/// stdout driver the moment a recognized transport error substring appears.
async fn watch_stderr(stderr: tokio::process::ChildStderr, transport_tx: oneshot::Sender<()>) {
    let mut reader = BufReader::new(stderr).lines();
    let mut warned_cache_ttl = false;
    let mut tx = Some(transport_tx);

    while let Ok(Some(line)) = reader.next_line().await {
        if !warned_cache_ttl && CACHE_TTL_WARNING_RE.is_match(&line) {
            log::warn!("llm cli cache ttl warning: {}", line);
            warned_cache_ttl = true;
        }
        if TRANSPORT_ERROR_RE.is_match(&line) {
            if let Some(tx) = tx.take() {
                let _ = tx.send(());
            }
        } else {
            log::debug!("llm cli stderr: {}", line);
        }
    }
}

fn finalize_response(state: ParseState) -> AttemptOutcome {
    let thread_id = state.thread_id.clone();
    match extract_response_object(&state.accumulated_text) {
        Some(value) => match shape_validate(&value) {
            Some(response) => AttemptOutcome::Final(TurnOutcome::Response { response, thread_id }),
            None => AttemptOutcome::Final(TurnOutcome::Null { thread_id }),
        },
        None => AttemptOutcome::Final(TurnOutcome::Null { thread_id }),
    }
}

/// Strict shape validation (`SPEC_FULL.md` §3.5): `pattern` and `thoughts`
/// must be strings; anything else is a parse failure.
fn shape_validate(value: &Value) -> Option<AgentResponse> {
    let pattern = value.get("pattern")?.as_str()?.to_string();
    let thoughts = value.get("thoughts")?.as_str()?.to_string();
    let commentary = value
        .get("commentary")
        .and_then(Value::as_str)
        .map(str::to_string);
    let decision = value.get("decision").and_then(parse_decision);

    Some(AgentResponse {
        pattern,
        thoughts,
        commentary,
        decision,
    })
}

fn parse_decision(value: &Value) -> Option<StructuredDecision> {
    let confidence = value
        .get("confidence")
        .and_then(Value::as_str)
        .and_then(|s| match s.to_ascii_lowercase().as_str() {
            "low" => Some(Confidence::Low),
            "medium" => Some(Confidence::Medium),
            "high" => Some(Confidence::High),
            _ => None,
        });
    let arrangement_intent = value
        .get("arrangement_intent")
        .and_then(Value::as_str)
        .and_then(ArrangementIntent::canonicalize);
    let tempo_delta_pct = value.get("tempo_delta_pct").and_then(Value::as_f64);
    let energy_delta = value
        .get("energy_delta")
        .and_then(Value::as_i64)
        .map(|v| v as i32);
    let suggested_key = value
        .get("suggested_key")
        .and_then(Value::as_str)
        .filter(|key| crate::context_parser::key_to_scale(key).is_some())
        .map(str::to_string);
    let suggested_chords = value.get("suggested_chords").and_then(Value::as_array).map(|arr| {
        arr.iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect::<Vec<_>>()
    });

    let decision = StructuredDecision {
        tempo_delta_pct,
        energy_delta,
        arrangement_intent,
        confidence,
        suggested_key,
        suggested_chords,
    }
    .normalize();

    if decision.is_empty() {
        None
    } else {
        Some(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_validation_accepts_minimal_response() {
        let value = serde_json::json!({"pattern": "silence", "thoughts": "resting"});
        let response = shape_validate(&value).unwrap();
        assert_eq!(response.pattern, "silence");
        assert!(response.decision.is_none());
    }

    #[test]
    fn shape_validation_rejects_non_string_pattern() {
        let value = serde_json::json!({"pattern": 5, "thoughts": "resting"});
        assert!(shape_validate(&value).is_none());
    }

    #[test]
    fn decision_with_only_invalid_fields_is_absent() {
        let value = serde_json::json!({"arrangement_intent": "not-a-real-intent"});
        assert!(parse_decision(&value).is_none());
    }

    #[test]
    fn decision_tempo_is_clamped() {
        let value = serde_json::json!({"tempo_delta_pct": 80, "confidence": "high"});
        let decision = parse_decision(&value).unwrap();
        assert_eq!(decision.tempo_delta_pct, Some(50.0));
    }
}
