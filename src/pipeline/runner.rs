// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! The pipeline runner: stage tasks, frame routing, lifecycle events.
//!
//! Each stage runs on its own tokio task connected to its neighbors by
//! boundary channels (see [`super::channel`]). A supervisor loop owns the
//! tail boundary: it turns control frames and final transcripts into
//! [`LifecycleEvent`]s, delivered synchronously to registered handlers in
//! the order the frames arrived, and ends the session when `EndConversation`
//! has propagated through every stage.
//!
//! External collaborators inject frames only through
//! [`RunnerHandle::queue_frames`]; queuing `EndConversation` also cancels the
//! in-flight reply so generation stops before the frame has even traveled.

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::channel::{boundary, BoundaryReceiver, BoundarySender, DirectedFrame};
use super::{Stage, StageContext, StageWeight};
use crate::error::SessionError;
use crate::frames::{ControlSignal, Frame, Role};
use crate::interruption::UtteranceClock;
use crate::latency::{ResponseBand, TimingTracker};

/// Session lifecycle notifications, fired at the pipeline tail.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    ConversationStarted,
    UserStartedSpeaking,
    UserStoppedSpeaking,
    BotStartedSpeaking,
    BotStoppedSpeaking,
    /// A finalized transcript passed through the pipeline.
    FinalTranscript { role: Role, text: String },
    /// Derived once per turn when the bot starts speaking.
    ResponseDelay { delay: Duration, band: ResponseBand },
    ConversationEnded,
}

pub type LifecycleHandler = Box<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Cloneable injection handle for external collaborators.
#[derive(Clone)]
pub struct RunnerHandle {
    head: BoundarySender,
    clock: Arc<UtteranceClock>,
}

impl RunnerHandle {
    /// Queue frames at the pipeline head, in order. The only external way to
    /// feed the pipeline.
    pub async fn queue_frames(&self, frames: Vec<Frame>) {
        for frame in frames {
            if frame.is_end_conversation() {
                // Stop in-flight generation before the frame travels.
                self.clock.cancel_active();
            }
            if !self.head.send(DirectedFrame::downstream(frame)).await {
                tracing::warn!("frame queued after pipeline shutdown, dropped");
            }
        }
    }
}

/// Wires stages into concurrent tasks and supervises the session.
pub struct PipelineRunner {
    head: BoundarySender,
    tail_rx: Option<BoundaryReceiver>,
    head_up_rx: Option<BoundaryReceiver>,
    tasks: JoinSet<()>,
    cancel: CancellationToken,
    handlers: Vec<LifecycleHandler>,
    clock: Arc<UtteranceClock>,
    timing: Arc<TimingTracker>,
}

impl PipelineRunner {
    /// Spawn one task per stage, linked in order. Frames queued before
    /// `run()` wait in the boundary lanes.
    pub fn new(
        stages: Vec<Box<dyn Stage>>,
        clock: Arc<UtteranceClock>,
        timing: Arc<TimingTracker>,
    ) -> Self {
        let n = stages.len();
        let cancel = CancellationToken::new();

        // Downstream lane i feeds stage i; lane n is the tail. Upstream lane
        // i carries frames from stage i toward stage i-1; lane 0 ends at the
        // supervisor, and the last stage's upstream input (lane n) has no
        // producer.
        let mut down_tx = Vec::with_capacity(n + 1);
        let mut down_rx = Vec::with_capacity(n + 1);
        let mut up_tx = Vec::with_capacity(n + 1);
        let mut up_rx = Vec::with_capacity(n + 1);
        for i in 0..=n {
            let weight = stages
                .get(i)
                .map(|s| s.weight())
                .unwrap_or(StageWeight::Standard);
            let (tx, rx) = boundary(weight.data_capacity());
            down_tx.push(tx);
            down_rx.push(Some(rx));

            let up_weight = if i > 0 {
                stages[i - 1].weight()
            } else {
                StageWeight::Standard
            };
            let (tx, rx) = boundary(up_weight.data_capacity());
            up_tx.push(tx);
            up_rx.push(Some(rx));
        }

        let head = down_tx[0].clone();
        let tail_rx = down_rx[n].take();
        let head_up_rx = up_rx[0].take();

        let mut tasks = JoinSet::new();
        for (i, stage) in stages.into_iter().enumerate() {
            let harness = StageHarness {
                stage,
                down_in: down_rx[i].take().expect("downstream lane taken twice"),
                up_in: up_rx[i + 1].take().expect("upstream lane taken twice"),
                down_out: down_tx[i + 1].clone(),
                up_out: up_tx[i].clone(),
            };
            tasks.spawn(run_stage(harness, cancel.clone()));
        }
        // Drop the unused lane senders so their receivers close cleanly.
        drop(down_tx);
        drop(up_tx);

        Self {
            head,
            tail_rx,
            head_up_rx,
            tasks,
            cancel,
            handlers: Vec::new(),
            clock,
            timing,
        }
    }

    /// Register a lifecycle handler. Handlers run synchronously on the
    /// supervisor, in frame delivery order.
    pub fn on_lifecycle(&mut self, handler: impl Fn(&LifecycleEvent) + Send + Sync + 'static) {
        self.handlers.push(Box::new(handler));
    }

    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            head: self.head.clone(),
            clock: self.clock.clone(),
        }
    }

    /// Supervise the session until `EndConversation` has propagated through
    /// every stage, then shut the stage tasks down. Never restarts.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        let mut tail = self
            .tail_rx
            .take()
            .ok_or_else(|| SessionError::Stalled("run() called twice".into()))?;
        let mut head_up = self
            .head_up_rx
            .take()
            .ok_or_else(|| SessionError::Stalled("run() called twice".into()))?;

        loop {
            tokio::select! {
                biased;
                maybe = tail.recv() => match maybe {
                    Some(df) => {
                        if self.observe_tail(df.frame) {
                            break;
                        }
                    }
                    None => {
                        self.shutdown().await;
                        return Err(SessionError::Stalled(
                            "pipeline output closed before EndConversation".into(),
                        ));
                    }
                },
                Some(df) = head_up.recv() => {
                    tracing::debug!(frame = %df.frame, "control frame reached pipeline head");
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Handle one frame arriving at the tail; returns `true` on
    /// `EndConversation`.
    fn observe_tail(&self, frame: Frame) -> bool {
        match frame {
            Frame::Control(control) => match control.signal {
                ControlSignal::StartConversation => {
                    tracing::info!("conversation started");
                    self.emit(LifecycleEvent::ConversationStarted);
                    false
                }
                ControlSignal::UserStartedSpeaking => {
                    self.emit(LifecycleEvent::UserStartedSpeaking);
                    false
                }
                ControlSignal::UserStoppedSpeaking => {
                    self.emit(LifecycleEvent::UserStoppedSpeaking);
                    false
                }
                ControlSignal::BotStartedSpeaking { .. } => {
                    self.emit(LifecycleEvent::BotStartedSpeaking);
                    if let Some((delay, band)) = self.timing.take_response_delay() {
                        tracing::info!(
                            delay_ms = delay.as_millis() as u64,
                            band = %band,
                            "turn response delay"
                        );
                        self.emit(LifecycleEvent::ResponseDelay { delay, band });
                    }
                    false
                }
                ControlSignal::BotStoppedSpeaking { .. } => {
                    self.emit(LifecycleEvent::BotStoppedSpeaking);
                    false
                }
                ControlSignal::EndConversation => {
                    tracing::info!("conversation ended");
                    self.emit(LifecycleEvent::ConversationEnded);
                    true
                }
            },
            Frame::Transcript(t) if t.is_final => {
                self.emit(LifecycleEvent::FinalTranscript {
                    role: t.role,
                    text: t.text,
                });
                false
            }
            other => {
                tracing::trace!(frame = %other, "frame reached pipeline tail");
                false
            }
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        for handler in &self.handlers {
            handler(&event);
        }
    }

    async fn shutdown(&mut self) {
        self.cancel.cancel();
        while self.tasks.join_next().await.is_some() {}
    }
}

struct StageHarness {
    stage: Box<dyn Stage>,
    down_in: BoundaryReceiver,
    up_in: BoundaryReceiver,
    down_out: BoundarySender,
    up_out: BoundarySender,
}

async fn run_stage(mut harness: StageHarness, cancel: CancellationToken) {
    let (ctx, mut ctx_down_rx, mut ctx_up_rx) = StageContext::new(cancel.clone());
    harness.stage.setup(&ctx).await;
    let name = harness.stage.name().to_string();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            // Emissions from `process` and background tasks forward before
            // the next input frame is taken, preserving per-stage order.
            Some(frame) = ctx_down_rx.recv() => {
                harness.down_out.send(DirectedFrame::downstream(frame)).await;
            }
            Some(frame) = ctx_up_rx.recv() => {
                harness.up_out.send(DirectedFrame::upstream(frame)).await;
            }
            Some(df) = harness.down_in.recv() => {
                dispatch(&mut harness.stage, &name, df, &ctx, &harness.down_out).await;
            }
            Some(df) = harness.up_in.recv() => {
                dispatch(&mut harness.stage, &name, df, &ctx, &harness.down_out).await;
            }
            else => break,
        }
    }

    harness.stage.cleanup().await;
    tracing::debug!(stage = %name, "stage task exited");
}

/// Run one `process` call, degrading a panic into a clean shutdown signal.
async fn dispatch(
    stage: &mut Box<dyn Stage>,
    name: &str,
    df: DirectedFrame,
    ctx: &StageContext,
    down_out: &BoundarySender,
) {
    let result = std::panic::AssertUnwindSafe(stage.process(df.frame, df.direction, ctx))
        .catch_unwind()
        .await;
    if result.is_err() {
        tracing::error!(stage = %name, "stage panicked, ending conversation");
        down_out
            .send(DirectedFrame::downstream(Frame::control(
                ControlSignal::EndConversation,
            )))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::frames::TranscriptFrame;
    use crate::pipeline::FrameDirection;

    struct Uppercase;

    #[async_trait]
    impl Stage for Uppercase {
        fn name(&self) -> &str {
            "uppercase"
        }

        async fn process(&mut self, frame: Frame, direction: FrameDirection, ctx: &StageContext) {
            if direction == FrameDirection::Upstream {
                ctx.send_upstream(frame);
                return;
            }
            match frame {
                Frame::Transcript(t) => ctx.send_downstream(Frame::Transcript(
                    TranscriptFrame::new(t.text.to_uppercase(), t.role, t.is_final, t.utterance),
                )),
                other => ctx.send_downstream(other),
            }
        }
    }

    struct Panicking;

    #[async_trait]
    impl Stage for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn process(&mut self, frame: Frame, _direction: FrameDirection, ctx: &StageContext) {
            if matches!(frame, Frame::Transcript(_)) {
                panic!("boom");
            }
            ctx.send_downstream(frame);
        }
    }

    fn new_runner(stages: Vec<Box<dyn Stage>>) -> PipelineRunner {
        PipelineRunner::new(
            stages,
            Arc::new(UtteranceClock::new()),
            Arc::new(TimingTracker::new()),
        )
    }

    fn collect_events(runner: &mut PipelineRunner) -> Arc<Mutex<Vec<String>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        runner.on_lifecycle(move |event| {
            sink.lock().unwrap().push(format!("{event:?}"));
        });
        events
    }

    #[tokio::test]
    async fn frames_flow_through_stages_in_order() {
        let mut runner = new_runner(vec![Box::new(Uppercase)]);
        let events = collect_events(&mut runner);
        let handle = runner.handle();

        handle
            .queue_frames(vec![
                Frame::control(ControlSignal::StartConversation),
                Frame::Transcript(TranscriptFrame::new("hello", Role::User, true, 1)),
                Frame::control(ControlSignal::EndConversation),
            ])
            .await;
        runner.run().await.expect("clean run");

        let events = events.lock().unwrap();
        assert!(events[0].contains("ConversationStarted"));
        // The transcript was queued before the end frame and must not be
        // overtaken by it.
        let transcript = events
            .iter()
            .position(|e| e.contains("HELLO"))
            .expect("transcript reached the tail");
        let ended = events
            .iter()
            .position(|e| e.contains("ConversationEnded"))
            .expect("session ended");
        assert!(transcript < ended);
        assert_eq!(ended, events.len() - 1);
    }

    #[tokio::test]
    async fn lifecycle_events_follow_delivery_order() {
        let mut runner = new_runner(vec![Box::new(Uppercase)]);
        let events = collect_events(&mut runner);
        let handle = runner.handle();

        handle
            .queue_frames(vec![
                Frame::control(ControlSignal::UserStartedSpeaking),
                Frame::control(ControlSignal::UserStoppedSpeaking),
                Frame::control(ControlSignal::EndConversation),
            ])
            .await;
        runner.run().await.expect("clean run");

        let events = events.lock().unwrap();
        let names: Vec<&str> = events.iter().map(|s| s.as_str()).collect();
        assert!(names[0].contains("UserStartedSpeaking"));
        assert!(names[1].contains("UserStoppedSpeaking"));
        assert!(names[2].contains("ConversationEnded"));
    }

    #[tokio::test]
    async fn stage_panic_ends_conversation_cleanly() {
        let mut runner = new_runner(vec![Box::new(Panicking), Box::new(Uppercase)]);
        let events = collect_events(&mut runner);
        let handle = runner.handle();

        handle
            .queue_frames(vec![Frame::Transcript(TranscriptFrame::new(
                "trigger", Role::User, true, 1,
            ))])
            .await;
        runner.run().await.expect("panic degraded to clean end");

        let events = events.lock().unwrap();
        assert!(events.last().unwrap().contains("ConversationEnded"));
    }

    #[tokio::test]
    async fn queue_end_conversation_cancels_active_utterance() {
        let clock = Arc::new(UtteranceClock::new());
        let mut runner = PipelineRunner::new(
            vec![Box::new(Uppercase)],
            clock.clone(),
            Arc::new(TimingTracker::new()),
        );
        let (utterance, token) = clock.begin();
        let handle = runner.handle();

        handle
            .queue_frames(vec![Frame::control(ControlSignal::EndConversation)])
            .await;
        assert!(token.is_cancelled());
        assert!(!clock.is_live(utterance));
        runner.run().await.expect("clean run");
    }
}
