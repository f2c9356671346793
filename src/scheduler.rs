//! Turn Scheduler (`SPEC_FULL.md` §4.5).
//!
//! A single-writer `tokio::sync::mpsc` consumer owns the `Session` and
//! drives every turn through it sequentially — no turn starts until the
//! previous one has finished applying and broadcasting. Auto-tick is a timer
//! that enqueues a coalesced tick (never more than one outstanding) and is
//! reset by every directive. Generalizes the
//! `tasks.push(tokio::spawn(...))` fan-out inside `orchestration.rs`, moved
//! one level up: here the fan-out is across turn *kinds* queued over time,
//! not across participants within one turn (that part stays in `governance`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

use crate::config::{JamOrchestratorConfig, AUTO_TICK_INTERVAL_MS};
use crate::event::{AutoTickFired, AutoTickTimingUpdate, JamBroadcastEvent, JamEventHandler, JamStateUpdate};
use crate::governance;
use crate::llm_runner::LlmRunner;
use crate::session::{AgentId, AudioFeedback, Session};

/// TTL applied to an incoming audio-feedback summary (`SPEC_FULL.md` §3.7):
/// stale by the time the next auto-tick or directive prompt is built.
const AUDIO_FEEDBACK_TTL_SECONDS: i64 = 60;

/// One request the scheduler's consumer loop processes in order.
pub enum Turn {
    JamStart,
    Directive { text: String, target: Option<AgentId> },
    AutoTick,
    SetPreset { genre: String, key: String, bpm: i32, time_signature: String },
    AudioFeedback { summary: String },
    Snapshot { reply: oneshot::Sender<JamStateUpdate> },
    Stop { ack: oneshot::Sender<()> },
}

/// Handle used by the public facade to enqueue turns and signal shutdown.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Turn>,
    stopped: Arc<AtomicBool>,
}

impl SchedulerHandle {
    pub fn send(&self, turn: Turn) {
        let _ = self.tx.send(turn);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub async fn stop(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.stopped.store(true, Ordering::SeqCst);
        self.send(Turn::Stop { ack: ack_tx });
        let _ = ack_rx.await;
    }

    /// Requests a point-in-time jam-state snapshot from the consumer task.
    /// Returns `None` if the consumer has already shut down.
    pub async fn snapshot(&self) -> Option<JamStateUpdate> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Turn::Snapshot { reply: reply_tx });
        reply_rx.await.ok()
    }
}

/// Spawns the consumer task and the auto-tick timer task, returning a handle
/// to enqueue turns. `session` is moved in and lives exclusively inside the
/// consumer task for the rest of the jam, per the single-writer discipline
/// (`SPEC_FULL.md` §9 Design Notes).
pub fn spawn(
    mut session: Session,
    config: JamOrchestratorConfig,
    runner: LlmRunner,
    handler: Arc<dyn JamEventHandler>,
) -> SchedulerHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<Turn>();
    let stopped = Arc::new(AtomicBool::new(false));

    let timer_stopped = stopped.clone();
    let timer_tx = tx.clone();
    let tick_pending = Arc::new(AtomicBool::new(false));
    let timer_tick_pending = tick_pending.clone();
    let (reset_tx, mut reset_rx) = mpsc::unbounded_channel::<()>();
    tokio::spawn(async move {
        let interval = Duration::from_millis(AUTO_TICK_INTERVAL_MS);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if timer_stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    // Coalesce: a tick already queued or still being processed
                    // (tick_pending stays true until the consumer finishes it)
                    // means this fire is dropped.
                    if timer_tick_pending
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        if timer_tx.send(Turn::AutoTick).is_err() {
                            break;
                        }
                    }
                }
                reset = reset_rx.recv() => {
                    if reset.is_none() {
                        break;
                    }
                    // A directive just ran; restart the interval from now.
                }
            }
        }
    });

    let consumer_stopped = stopped.clone();
    tokio::spawn(async move {
        let stopped = consumer_stopped;
        while let Some(turn) = rx.recv().await {
            match turn {
                Turn::Stop { ack } => {
                    for handle in session.sessions.values() {
                        log::info!("shutting down llm session for {}", handle.id);
                    }
                    session.sessions.clear();
                    let _ = ack.send(());
                    break;
                }
                Turn::JamStart => {
                    governance::run_jam_start_turn(&mut session, &config, &runner, handler.as_ref()).await;
                }
                Turn::Directive { text, target } => {
                    // A directive resets the auto-tick timer outright
                    // (SPEC_FULL.md §4.5, §4.6.1 step 11), whether or not the
                    // directive itself is accepted.
                    tick_pending.store(false, Ordering::SeqCst);
                    let _ = reset_tx.send(());
                    let reset_now = Utc::now();
                    handler
                        .on_event(&JamBroadcastEvent::AutoTickTimingUpdate(AutoTickTimingUpdate {
                            interval_ms: AUTO_TICK_INTERVAL_MS,
                            next_tick_at_ms: reset_now.timestamp_millis() + AUTO_TICK_INTERVAL_MS as i64,
                            server_now_ms: reset_now.timestamp_millis(),
                        }))
                        .await;
                    governance::run_directive_turn(&mut session, &config, &runner, handler.as_ref(), &text, target)
                        .await;
                }
                Turn::AutoTick => {
                    if stopped.load(Ordering::SeqCst) {
                        tick_pending.store(false, Ordering::SeqCst);
                        continue;
                    }
                    let now = Utc::now();
                    handler
                        .on_event(&JamBroadcastEvent::AutoTickFired(AutoTickFired {
                            session_id: session.session_id.clone(),
                            round: session.round_number,
                            active_agents: session.activated_agents.clone(),
                            auto_tick: AutoTickTimingUpdate {
                                interval_ms: AUTO_TICK_INTERVAL_MS,
                                next_tick_at_ms: now.timestamp_millis() + AUTO_TICK_INTERVAL_MS as i64,
                                server_now_ms: now.timestamp_millis(),
                            },
                            fired_at_ms: now.timestamp_millis(),
                        }))
                        .await;
                    governance::run_auto_tick_turn(&mut session, &config, &runner, handler.as_ref()).await;
                    // Cleared only after the turn fully completes, so a timer
                    // fire while this tick is still in flight is dropped
                    // rather than queuing a second one (SPEC_FULL.md §4.5).
                    tick_pending.store(false, Ordering::SeqCst);
                }
                Turn::SetPreset { genre, key, bpm, time_signature } => {
                    session.musical_context.genre = genre;
                    if let Some((scale, _minor)) = crate::context_parser::key_to_scale(&key) {
                        session.musical_context.key = key;
                        session.musical_context.scale = scale;
                    }
                    session.musical_context.bpm = bpm;
                    session.musical_context.time_signature = time_signature;
                    session.preset_configured = true;
                }
                Turn::AudioFeedback { summary } => {
                    session.audio_feedback = Some(AudioFeedback {
                        summary,
                        received_at: Utc::now(),
                        ttl: chrono::Duration::seconds(AUDIO_FEEDBACK_TTL_SECONDS),
                    });
                }
                Turn::Snapshot { reply } => {
                    let code = governance::composite_program(&session);
                    let snapshot = governance::build_snapshot(&session, code, session.round_number, None);
                    let _ = reply.send(snapshot);
                }
            }
        }
    });

    SchedulerHandle { tx, stopped }
}
