// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Barge-in handling: the utterance clock and the interruption controller.
//!
//! Every assistant reply is scoped to an utterance id issued by the
//! [`UtteranceClock`]. Cancelling an utterance fires its
//! [`CancellationToken`] (stopping model generation and synthesis mid-stream)
//! and raises a staleness watermark, so any of its frames still sitting in
//! pipeline queues are dropped at the transport before they reach the
//! socket. Cancelling an utterance that is no longer active is a no-op, not
//! an error — the interruption simply lost the race against completion.
//!
//! The [`InterruptionController`] is the only owner of the barge-in state
//! machine. The transport notifies it synchronously, in the same call that
//! detected the VAD edge or wrote the first audio chunk, so the reaction is
//! never queued behind data frames.

use std::sync::Arc;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::context::ContextAggregator;
use crate::frames::ControlSignal;

/// Issues utterance ids and owns their cancellation tokens.
pub struct UtteranceClock {
    inner: Mutex<ClockInner>,
}

struct ClockInner {
    /// Most recently issued utterance id; 0 before the first reply.
    active: u64,
    /// Ids at or below this are stale; their frames must be dropped.
    watermark: u64,
    token: CancellationToken,
}

impl UtteranceClock {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ClockInner {
                active: 0,
                watermark: 0,
                token: CancellationToken::new(),
            }),
        }
    }

    /// Start a new utterance: supersedes (cancels) the previous one and
    /// returns the new id with its cancellation token.
    pub fn begin(&self) -> (u64, CancellationToken) {
        let mut inner = self.lock();
        inner.token.cancel();
        inner.watermark = inner.active;
        inner.active += 1;
        inner.token = CancellationToken::new();
        (inner.active, inner.token.clone())
    }

    /// Cancel the given utterance. Returns `false` without side effects when
    /// the id is not the live one (the cancellation raced a completed or
    /// superseded reply).
    pub fn cancel(&self, utterance: u64) -> bool {
        let mut inner = self.lock();
        if utterance != inner.active || utterance <= inner.watermark {
            return false;
        }
        inner.watermark = utterance;
        inner.token.cancel();
        true
    }

    /// Cancel whatever utterance is live, if any. Returns its id.
    pub fn cancel_active(&self) -> Option<u64> {
        let mut inner = self.lock();
        if inner.active > inner.watermark {
            inner.watermark = inner.active;
            inner.token.cancel();
            Some(inner.active)
        } else {
            None
        }
    }

    /// Whether frames for this utterance should still flow.
    pub fn is_live(&self, utterance: u64) -> bool {
        let inner = self.lock();
        utterance > inner.watermark && utterance <= inner.active
    }

    /// Cancellation token for the given utterance; already cancelled when
    /// the id is stale.
    pub fn watch(&self, utterance: u64) -> CancellationToken {
        let inner = self.lock();
        if utterance == inner.active && utterance > inner.watermark {
            inner.token.clone()
        } else {
            let cancelled = CancellationToken::new();
            cancelled.cancel();
            cancelled
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClockInner> {
        self.inner.lock().expect("utterance clock lock poisoned")
    }
}

impl Default for UtteranceClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Barge-in state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BargeInState {
    Idle,
    BotSpeaking,
    BotSpeakingInterrupted,
}

/// What an interruption check decided.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterruptionOutcome {
    /// The utterance whose playback was cut short, when a barge-in fired.
    pub cancelled: Option<u64>,
}

/// Owner of the barge-in state machine.
///
/// Transitions, driven only by control signals:
///
/// ```text
/// Idle --BotStartedSpeaking--> BotSpeaking
/// BotSpeaking --UserStartedSpeaking--> BotSpeakingInterrupted
///     (cancels generation + synthesis, truncates the assistant turn)
/// BotSpeaking --BotStoppedSpeaking--> Idle
/// BotSpeakingInterrupted --BotStoppedSpeaking--> Idle
/// ```
pub struct InterruptionController {
    clock: Arc<UtteranceClock>,
    aggregator: ContextAggregator,
    state: Mutex<ControllerState>,
}

struct ControllerState {
    barge_in: BargeInState,
    /// Utterance currently being played out, if any.
    speaking: Option<u64>,
}

impl InterruptionController {
    pub fn new(clock: Arc<UtteranceClock>, aggregator: ContextAggregator) -> Self {
        Self {
            clock,
            aggregator,
            state: Mutex::new(ControllerState {
                barge_in: BargeInState::Idle,
                speaking: None,
            }),
        }
    }

    pub fn state(&self) -> BargeInState {
        self.lock().barge_in
    }

    /// Apply a control signal. Must be called by the stage that created the
    /// signal, before the corresponding frame is queued.
    pub fn on_control(&self, signal: &ControlSignal) -> InterruptionOutcome {
        let mut state = self.lock();
        match signal {
            ControlSignal::UserStartedSpeaking => {
                if state.barge_in == BargeInState::BotSpeaking {
                    if let Some(utterance) = state.speaking {
                        if self.clock.cancel(utterance) {
                            self.aggregator.truncate_last_assistant_turn(utterance);
                            state.barge_in = BargeInState::BotSpeakingInterrupted;
                            tracing::info!(utterance, "barge-in: cancelled assistant reply");
                            return InterruptionOutcome {
                                cancelled: Some(utterance),
                            };
                        }
                        // The reply already finished or was superseded.
                        tracing::debug!(utterance, "interruption raced a finished reply");
                    }
                }
            }
            ControlSignal::BotStartedSpeaking { utterance } => {
                state.barge_in = BargeInState::BotSpeaking;
                state.speaking = Some(*utterance);
            }
            ControlSignal::BotStoppedSpeaking { utterance } => {
                if state.speaking == Some(*utterance) {
                    state.barge_in = BargeInState::Idle;
                    state.speaking = None;
                }
            }
            ControlSignal::EndConversation => {
                self.clock.cancel_active();
                state.barge_in = BargeInState::Idle;
                state.speaking = None;
            }
            ControlSignal::UserStoppedSpeaking | ControlSignal::StartConversation => {}
        }
        InterruptionOutcome::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ControllerState> {
        self.state.lock().expect("barge-in state lock poisoned")
    }
}
