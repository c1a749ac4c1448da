// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Conversational model stage.
//!
//! Generation runs on a dedicated worker task that owns the provider, so the
//! stage loop stays responsive while tokens stream in. Each generation takes
//! a fresh utterance id from the clock and races the provider stream against
//! that utterance's cancellation token: a barge-in or shutdown stops the
//! stream mid-flight and no final frame is emitted for the cancelled reply.
//!
//! Triggers: `StartConversation` (the greeting — a system-only history is
//! valid input) and each finalized user transcript. The history snapshot is
//! taken at generation start, after the user-context stage has committed the
//! triggering turn.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::context::ContextAggregator;
use crate::frames::{ControlSignal, Frame, ModelReplyFrame, Role};
use crate::interruption::UtteranceClock;
use crate::latency::{TimingMark, TimingTracker};
use crate::pipeline::{ContextSender, FrameDirection, Stage, StageContext, StageWeight};
use crate::providers::ChatModel;

pub struct ModelStage {
    provider: Option<Box<dyn ChatModel>>,
    aggregator: ContextAggregator,
    clock: Arc<UtteranceClock>,
    timing: Arc<TimingTracker>,
    requests: Option<mpsc::UnboundedSender<()>>,
}

impl ModelStage {
    pub fn new(
        provider: Box<dyn ChatModel>,
        aggregator: ContextAggregator,
        clock: Arc<UtteranceClock>,
        timing: Arc<TimingTracker>,
    ) -> Self {
        Self {
            provider: Some(provider),
            aggregator,
            clock,
            timing,
            requests: None,
        }
    }

    fn request_generation(&self) {
        if let Some(requests) = &self.requests {
            if requests.send(()).is_err() {
                tracing::warn!("generation worker gone, reply dropped");
            }
        }
    }
}

#[async_trait]
impl Stage for ModelStage {
    fn name(&self) -> &str {
        "model"
    }

    fn weight(&self) -> StageWeight {
        StageWeight::Heavy
    }

    async fn setup(&mut self, ctx: &StageContext) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.requests = Some(tx);
        if let Some(provider) = self.provider.take() {
            tokio::spawn(generation_worker(
                provider,
                rx,
                self.aggregator.clone(),
                self.clock.clone(),
                self.timing.clone(),
                ctx.downstream_sender(),
                ctx.cancel_token().clone(),
            ));
        }
    }

    async fn process(&mut self, frame: Frame, direction: FrameDirection, ctx: &StageContext) {
        if direction == FrameDirection::Upstream {
            ctx.send_upstream(frame);
            return;
        }
        match &frame {
            Frame::Control(c) if c.signal == ControlSignal::StartConversation => {
                ctx.send_downstream(frame);
                self.request_generation();
            }
            Frame::Transcript(t) if t.role == Role::User && t.is_final => {
                ctx.send_downstream(frame);
                self.request_generation();
            }
            _ => ctx.send_downstream(frame),
        }
    }
}

async fn generation_worker(
    mut provider: Box<dyn ChatModel>,
    mut requests: mpsc::UnboundedReceiver<()>,
    aggregator: ContextAggregator,
    clock: Arc<UtteranceClock>,
    timing: Arc<TimingTracker>,
    out: ContextSender,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            maybe = requests.recv() => {
                if maybe.is_none() {
                    break;
                }
                run_generation(&mut provider, &aggregator, &clock, &timing, &out, &cancel).await;
            }
        }
    }
    tracing::debug!("generation worker exited");
}

async fn run_generation(
    provider: &mut Box<dyn ChatModel>,
    aggregator: &ContextAggregator,
    clock: &UtteranceClock,
    timing: &TimingTracker,
    out: &ContextSender,
    cancel: &CancellationToken,
) {
    let (utterance, token) = clock.begin();
    let history = aggregator.history();
    tracing::debug!(utterance, turns = history.turns().len(), "generating reply");

    let mut stream = match provider.generate(&history).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(%err, utterance, "reply generation failed");
            return;
        }
    };

    let mut first = true;
    loop {
        tokio::select! {
            biased;
            // Pipeline shutdown can outrun the per-utterance cancellation;
            // either one must stop the provider stream.
            _ = cancel.cancelled() => {
                tracing::debug!(utterance, "reply generation stopped by shutdown");
                return;
            }
            _ = token.cancelled() => {
                tracing::debug!(utterance, "reply generation cancelled");
                return;
            }
            chunk = stream.next() => match chunk {
                Some(Ok(delta)) => {
                    if first {
                        timing.mark(TimingMark::ModelFirstToken);
                        first = false;
                    }
                    out.send(Frame::ModelReply(ModelReplyFrame::new(
                        delta, false, utterance,
                    )));
                }
                Some(Err(err)) => {
                    // Partial deltas may already be out; without a final
                    // frame they never become a turn.
                    tracing::warn!(%err, utterance, "reply stream failed mid-generation");
                    return;
                }
                None => break,
            }
        }
    }

    timing.mark(TimingMark::ModelLastToken);
    out.send(Frame::ModelReply(ModelReplyFrame::new(
        String::new(),
        true,
        utterance,
    )));
}
