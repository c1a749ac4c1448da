// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Two-lane boundary channels between stages.
//!
//! Each stage boundary is a pair of lanes: an unbounded control lane and a
//! bounded data lane sized by the receiving stage's weight. Turn-taking
//! control frames (speech edges, interruptions) must never queue behind bulk
//! audio or text, so the receiver drains the control lane first. The
//! lifecycle frames (`StartConversation`, `EndConversation`) are different:
//! they delimit the conversation and must arrive after everything queued
//! before them, so they ride the data lane in FIFO order — an end frame that
//! overtook a pending transcript would shut the session down with that
//! transcript still in flight.
//!
//! The bounded data lane is what gives the pipeline backpressure: a slow
//! consumer eventually blocks its producer's forwarding loop instead of
//! buffering without limit. Within one lane, delivery order is FIFO — this is
//! the per-boundary in-order guarantee the rest of the pipeline relies on.

use tokio::sync::mpsc;

use super::FrameDirection;
use crate::frames::{Frame, FrameKind};

/// A frame together with its travel direction.
#[derive(Debug, Clone)]
pub struct DirectedFrame {
    pub frame: Frame,
    pub direction: FrameDirection,
}

impl DirectedFrame {
    pub fn downstream(frame: Frame) -> Self {
        Self {
            frame,
            direction: FrameDirection::Downstream,
        }
    }

    pub fn upstream(frame: Frame) -> Self {
        Self {
            frame,
            direction: FrameDirection::Upstream,
        }
    }
}

/// Sending half of a boundary.
#[derive(Clone)]
pub struct BoundarySender {
    control_tx: mpsc::UnboundedSender<DirectedFrame>,
    data_tx: mpsc::Sender<DirectedFrame>,
}

impl BoundarySender {
    /// Route a frame onto the lane matching its kind. Data sends await lane
    /// capacity; control sends never block. Returns `false` when the
    /// receiving stage is gone.
    pub async fn send(&self, df: DirectedFrame) -> bool {
        match df.frame.kind() {
            FrameKind::Control => self.control_tx.send(df).is_ok(),
            FrameKind::Data => self.data_tx.send(df).await.is_ok(),
        }
    }
}

/// Receiving half of a boundary.
pub struct BoundaryReceiver {
    control_rx: mpsc::UnboundedReceiver<DirectedFrame>,
    data_rx: mpsc::Receiver<DirectedFrame>,
}

impl BoundaryReceiver {
    /// Next frame, control lane first. Returns `None` once both lanes are
    /// closed and drained.
    pub async fn recv(&mut self) -> Option<DirectedFrame> {
        tokio::select! {
            biased;
            Some(df) = self.control_rx.recv() => Some(df),
            Some(df) = self.data_rx.recv() => Some(df),
            else => None,
        }
    }

    /// Non-blocking variant used in tests.
    pub fn try_recv(&mut self) -> Option<DirectedFrame> {
        if let Ok(df) = self.control_rx.try_recv() {
            return Some(df);
        }
        self.data_rx.try_recv().ok()
    }
}

/// Create one boundary with the given data-lane capacity.
pub fn boundary(data_capacity: usize) -> (BoundarySender, BoundaryReceiver) {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (data_tx, data_rx) = mpsc::channel(data_capacity);
    (
        BoundarySender {
            control_tx,
            data_tx,
        },
        BoundaryReceiver {
            control_rx,
            data_rx,
        },
    )
}
