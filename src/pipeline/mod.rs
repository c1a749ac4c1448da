// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Pipeline infrastructure: the [`Stage`] trait, per-stage contexts, boundary
//! channels, and the [`PipelineRunner`] that wires stages into concurrent
//! tasks.

pub mod channel;
pub mod runner;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::frames::{Frame, FrameKind};

pub use channel::{boundary, BoundaryReceiver, BoundarySender, DirectedFrame};
pub use runner::{LifecycleEvent, LifecycleHandler, PipelineRunner, RunnerHandle};

/// Direction a frame travels relative to the pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirection {
    Downstream,
    Upstream,
}

/// How much data-lane buffering a stage gets. Heavier stages (provider
/// network calls) take deeper queues so bursty upstream output doesn't stall
/// the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageWeight {
    Light,
    #[default]
    Standard,
    Heavy,
}

impl StageWeight {
    /// Capacity of the bounded data lane feeding a stage of this weight.
    pub fn data_capacity(&self) -> usize {
        match self {
            StageWeight::Light => 32,
            StageWeight::Standard => 64,
            StageWeight::Heavy => 128,
        }
    }
}

/// Sending half of a stage's emission lanes for one direction. Routes frames
/// exactly like a boundary does: turn-taking control frames onto a priority
/// lane so they never wait behind bulk audio emitted earlier, everything
/// else FIFO. Both lanes are unbounded and non-blocking so `process` and
/// background tasks can emit without awaiting; the runner forwards emitted
/// frames onto the bounded boundary lanes.
#[derive(Clone)]
pub struct ContextSender {
    control_tx: mpsc::UnboundedSender<Frame>,
    data_tx: mpsc::UnboundedSender<Frame>,
}

impl ContextSender {
    pub fn send(&self, frame: Frame) {
        let sent = match frame.kind() {
            FrameKind::Control => self.control_tx.send(frame).is_ok(),
            FrameKind::Data => self.data_tx.send(frame).is_ok(),
        };
        if !sent {
            tracing::warn!("stage emission receiver dropped, frame lost");
        }
    }
}

/// Receiving half of a stage's emission lanes, control drained first.
pub struct ContextReceiver {
    control_rx: mpsc::UnboundedReceiver<Frame>,
    data_rx: mpsc::UnboundedReceiver<Frame>,
}

impl ContextReceiver {
    /// Next emitted frame, control lane first. Returns `None` once both
    /// lanes are closed and drained.
    pub async fn recv(&mut self) -> Option<Frame> {
        tokio::select! {
            biased;
            Some(frame) = self.control_rx.recv() => Some(frame),
            Some(frame) = self.data_rx.recv() => Some(frame),
            else => None,
        }
    }

    /// Non-blocking variant used in tests.
    pub fn try_recv(&mut self) -> Result<Frame, mpsc::error::TryRecvError> {
        match self.control_rx.try_recv() {
            Ok(frame) => Ok(frame),
            Err(_) => self.data_rx.try_recv(),
        }
    }
}

fn context_lane() -> (ContextSender, ContextReceiver) {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (data_tx, data_rx) = mpsc::unbounded_channel();
    (
        ContextSender {
            control_tx,
            data_tx,
        },
        ContextReceiver {
            control_rx,
            data_rx,
        },
    )
}

/// Emission lanes a stage uses to send frames onward, plus the pipeline-wide
/// shutdown token.
pub struct StageContext {
    downstream: ContextSender,
    upstream: ContextSender,
    cancel: CancellationToken,
}

impl StageContext {
    pub(crate) fn new(cancel: CancellationToken) -> (Self, ContextReceiver, ContextReceiver) {
        let (downstream, downstream_rx) = context_lane();
        let (upstream, upstream_rx) = context_lane();
        (
            Self {
                downstream,
                upstream,
                cancel,
            },
            downstream_rx,
            upstream_rx,
        )
    }

    /// Context wired to inspectable receivers, for unit-testing stages in
    /// isolation.
    pub fn for_test() -> (Self, ContextReceiver, ContextReceiver) {
        Self::new(CancellationToken::new())
    }

    pub fn send_downstream(&self, frame: Frame) {
        self.downstream.send(frame);
    }

    pub fn send_upstream(&self, frame: Frame) {
        self.upstream.send(frame);
    }

    /// Sender clone for background tasks (socket readers, provider workers)
    /// that outlive a single `process` call.
    pub fn downstream_sender(&self) -> ContextSender {
        self.downstream.clone()
    }

    /// Pipeline-wide shutdown token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// One processing step in the pipeline.
///
/// A stage consumes every frame delivered to it and re-emits (possibly
/// transformed) frames through the context; a frame that is not sent onward
/// is consumed. Stages run one at a time per instance — `process` needs no
/// internal locking for stage-local state.
#[async_trait]
pub trait Stage: Send {
    fn name(&self) -> &str;

    fn weight(&self) -> StageWeight {
        StageWeight::default()
    }

    /// Called once before any frame is delivered. Stages with background
    /// work (socket readers, provider workers) spawn it here using senders
    /// cloned from the context.
    async fn setup(&mut self, _ctx: &StageContext) {}

    async fn process(&mut self, frame: Frame, direction: FrameDirection, ctx: &StageContext);

    /// Called once after the stage's task loop exits.
    async fn cleanup(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::ControlSignal;

    struct Passthrough;

    #[async_trait]
    impl Stage for Passthrough {
        fn name(&self) -> &str {
            "passthrough"
        }

        async fn process(&mut self, frame: Frame, direction: FrameDirection, ctx: &StageContext) {
            match direction {
                FrameDirection::Downstream => ctx.send_downstream(frame),
                FrameDirection::Upstream => ctx.send_upstream(frame),
            }
        }
    }

    #[test]
    fn weights_map_to_capacities() {
        assert_eq!(StageWeight::Light.data_capacity(), 32);
        assert_eq!(StageWeight::Standard.data_capacity(), 64);
        assert_eq!(StageWeight::Heavy.data_capacity(), 128);
        assert_eq!(StageWeight::default(), StageWeight::Standard);
    }

    #[tokio::test]
    async fn context_routes_by_direction() {
        let (ctx, mut down_rx, mut up_rx) = StageContext::for_test();
        let mut stage = Passthrough;

        stage
            .process(
                Frame::control(ControlSignal::StartConversation),
                FrameDirection::Downstream,
                &ctx,
            )
            .await;
        assert!(down_rx.try_recv().is_ok());
        assert!(up_rx.try_recv().is_err());

        stage
            .process(
                Frame::control(ControlSignal::UserStartedSpeaking),
                FrameDirection::Upstream,
                &ctx,
            )
            .await;
        assert!(up_rx.try_recv().is_ok());
    }
}
