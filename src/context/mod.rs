// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Conversation context: turns, history, and the aggregator that owns them.
//!
//! The [`ContextAggregator`] is the single owner of the
//! [`ConversationHistory`]; every read is an immutable snapshot and every
//! mutation goes through a named operation. Two pipeline stages feed it:
//! [`UserContextStage`] commits finalized user transcripts on their way to
//! the model stage, and [`AssistantContextStage`] sits at the pipeline tail
//! accumulating streamed reply text into the assistant turn.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;

use crate::frames::{Frame, Role};
use crate::pipeline::{FrameDirection, Stage, StageContext, StageWeight};

/// One finalized utterance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub utterance: u64,
}

/// Ordered turns plus the fixed system instruction.
///
/// The system instruction is always the first message; turns are append-only
/// and never reordered. Consecutive same-role turns are allowed — real
/// dialogue has them.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationHistory {
    system: String,
    turns: Vec<Turn>,
}

impl ConversationHistory {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            turns: Vec::new(),
        }
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn last_turn(&self) -> Option<&Turn> {
        self.turns.last()
    }

    fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// Render as the `[{role, content}, ...]` message array chat-model
    /// providers consume, system message first.
    pub fn messages(&self) -> Vec<serde_json::Value> {
        let mut messages = Vec::with_capacity(self.turns.len() + 1);
        messages.push(serde_json::json!({
            "role": "system",
            "content": self.system,
        }));
        for turn in &self.turns {
            messages.push(serde_json::json!({
                "role": turn.role.as_str(),
                "content": turn.text,
            }));
        }
        messages
    }
}

/// Cheaply-cloneable handle over the shared conversation context.
#[derive(Clone)]
pub struct ContextAggregator {
    inner: Arc<Mutex<AggregatorInner>>,
}

struct AggregatorInner {
    history: ConversationHistory,
    /// User utterances already committed, for idempotent finals.
    committed_user: HashSet<u64>,
    /// In-flight assistant reply text, keyed by utterance.
    partial_assistant: Option<(u64, String)>,
    /// Assistant utterances truncated by an interruption; late deltas and
    /// finals for these are dropped.
    discarded: HashSet<u64>,
}

impl ContextAggregator {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(AggregatorInner {
                history: ConversationHistory::new(system),
                committed_user: HashSet::new(),
                partial_assistant: None,
                discarded: HashSet::new(),
            })),
        }
    }

    /// Immutable snapshot of the current history.
    pub fn history(&self) -> ConversationHistory {
        self.lock().history.clone()
    }

    /// Append a finalized user turn. Returns `false` when this utterance was
    /// already committed (re-delivered final).
    pub fn commit_user(&self, utterance: u64, text: &str) -> bool {
        let mut inner = self.lock();
        if !inner.committed_user.insert(utterance) {
            tracing::debug!(utterance, "duplicate final transcript ignored");
            return false;
        }
        inner.history.push(Turn {
            role: Role::User,
            text: text.to_string(),
            utterance,
        });
        true
    }

    /// Accumulate streamed assistant reply text. A delta for a new utterance
    /// drops any unfinalized text from a previous (cancelled) one.
    pub fn push_assistant_delta(&self, utterance: u64, delta: &str) {
        let mut inner = self.lock();
        if inner.discarded.contains(&utterance) {
            return;
        }
        match &mut inner.partial_assistant {
            Some((current, buffer)) if *current == utterance => buffer.push_str(delta),
            _ => inner.partial_assistant = Some((utterance, delta.to_string())),
        }
    }

    /// Finalize the in-flight assistant reply into a turn. Returns `false`
    /// when there is nothing to commit (no text, wrong utterance, or the
    /// reply was discarded).
    pub fn finalize_assistant(&self, utterance: u64) -> bool {
        let mut inner = self.lock();
        if inner.discarded.contains(&utterance) {
            return false;
        }
        match inner.partial_assistant.take() {
            Some((current, buffer)) if current == utterance && !buffer.is_empty() => {
                inner.history.push(Turn {
                    role: Role::Assistant,
                    text: buffer,
                    utterance,
                });
                true
            }
            Some((current, buffer)) if current != utterance => {
                // Not ours; put it back.
                inner.partial_assistant = Some((current, buffer));
                false
            }
            _ => false,
        }
    }

    /// Discard the assistant turn for this utterance: the in-flight partial
    /// text, a finalized turn the user never fully heard, and any late
    /// re-deliveries.
    pub fn truncate_last_assistant_turn(&self, utterance: u64) {
        let mut inner = self.lock();
        inner.discarded.insert(utterance);
        if matches!(inner.partial_assistant, Some((current, _)) if current == utterance) {
            inner.partial_assistant = None;
        }
        if matches!(
            inner.history.last_turn(),
            Some(turn) if turn.role == Role::Assistant && turn.utterance == utterance
        ) {
            inner.history.turns.pop();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AggregatorInner> {
        self.inner.lock().expect("context aggregator lock poisoned")
    }
}

/// Commits finalized user transcripts to history before they reach the model
/// stage, so a generation always sees its own trigger in the snapshot.
pub struct UserContextStage {
    aggregator: ContextAggregator,
}

impl UserContextStage {
    pub fn new(aggregator: ContextAggregator) -> Self {
        Self { aggregator }
    }
}

#[async_trait]
impl Stage for UserContextStage {
    fn name(&self) -> &str {
        "user-context"
    }

    fn weight(&self) -> StageWeight {
        StageWeight::Light
    }

    async fn process(&mut self, frame: Frame, direction: FrameDirection, ctx: &StageContext) {
        if direction == FrameDirection::Upstream {
            ctx.send_upstream(frame);
            return;
        }
        match frame {
            Frame::Transcript(t) if t.role == Role::User && t.is_final => {
                if self.aggregator.commit_user(t.utterance, &t.text) {
                    ctx.send_downstream(Frame::Transcript(t));
                }
                // A duplicate final is consumed so it cannot retrigger the
                // model stage.
            }
            other => ctx.send_downstream(other),
        }
    }
}

/// Accumulates streamed reply text into the assistant turn at the pipeline
/// tail, after the transport — so the frames it sees have already been
/// delivered (or dropped) toward the caller.
pub struct AssistantContextStage {
    aggregator: ContextAggregator,
}

impl AssistantContextStage {
    pub fn new(aggregator: ContextAggregator) -> Self {
        Self { aggregator }
    }
}

#[async_trait]
impl Stage for AssistantContextStage {
    fn name(&self) -> &str {
        "assistant-context"
    }

    fn weight(&self) -> StageWeight {
        StageWeight::Light
    }

    async fn process(&mut self, frame: Frame, direction: FrameDirection, ctx: &StageContext) {
        if direction == FrameDirection::Upstream {
            ctx.send_upstream(frame);
            return;
        }
        match &frame {
            Frame::ModelReply(reply) => {
                if reply.is_final {
                    self.aggregator.finalize_assistant(reply.utterance);
                } else {
                    self.aggregator
                        .push_assistant_delta(reply.utterance, &reply.text);
                }
                ctx.send_downstream(frame);
            }
            _ => ctx.send_downstream(frame),
        }
    }
}
