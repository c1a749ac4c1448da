// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Frame types flowing through the conversation pipeline.
//!
//! A [`Frame`] is an immutable, timestamped unit with a discriminated kind:
//! audio, transcript, model reply, synthesized audio, or a control signal.
//! Data frames carry the conversational payload downstream; control frames
//! coordinate turn-taking and shutdown and may travel in both directions.
//!
//! Every frame carries a [`FrameMeta`] with a process-wide monotonic sequence
//! number and a creation timestamp, used for ordering and latency
//! measurement.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Process-wide frame sequence counter.
static FRAME_SEQ: AtomicU64 = AtomicU64::new(1);

/// Speaker attribution for transcripts and conversation turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata carried by every frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameMeta {
    /// Monotonic sequence number, unique per process.
    pub seq: u64,
    /// Instant the frame was created.
    pub created_at: Instant,
}

impl FrameMeta {
    pub fn new() -> Self {
        Self {
            seq: FRAME_SEQ.fetch_add(1, Ordering::Relaxed),
            created_at: Instant::now(),
        }
    }
}

impl Default for FrameMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// Raw inbound audio, PCM16 little-endian.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub meta: FrameMeta,
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(pcm: Vec<u8>, sample_rate: u32) -> Self {
        Self {
            meta: FrameMeta::new(),
            pcm,
            sample_rate,
        }
    }

    /// Number of PCM16 samples in this frame.
    pub fn num_samples(&self) -> usize {
        self.pcm.len() / 2
    }
}

/// A speech-to-text result, partial or final, for one user utterance.
#[derive(Debug, Clone)]
pub struct TranscriptFrame {
    pub meta: FrameMeta,
    pub text: String,
    pub role: Role,
    pub is_final: bool,
    pub utterance: u64,
}

impl TranscriptFrame {
    pub fn new(text: impl Into<String>, role: Role, is_final: bool, utterance: u64) -> Self {
        Self {
            meta: FrameMeta::new(),
            text: text.into(),
            role,
            is_final,
            utterance,
        }
    }
}

/// A streamed piece of the conversational model's reply.
///
/// Partial frames carry text deltas; the terminal frame has `is_final = true`
/// and empty text. A cancelled reply never produces a final frame.
#[derive(Debug, Clone)]
pub struct ModelReplyFrame {
    pub meta: FrameMeta,
    pub text: String,
    pub is_final: bool,
    pub utterance: u64,
}

impl ModelReplyFrame {
    pub fn new(text: impl Into<String>, is_final: bool, utterance: u64) -> Self {
        Self {
            meta: FrameMeta::new(),
            text: text.into(),
            is_final,
            utterance,
        }
    }
}

/// Synthesized reply audio, PCM16 little-endian at the session sample rate.
///
/// A frame with `last = true` (and empty pcm) marks the end of the
/// utterance's audio.
#[derive(Debug, Clone)]
pub struct SynthesizedAudioFrame {
    pub meta: FrameMeta,
    pub pcm: Vec<u8>,
    pub utterance: u64,
    pub last: bool,
}

impl SynthesizedAudioFrame {
    pub fn new(pcm: Vec<u8>, utterance: u64) -> Self {
        Self {
            meta: FrameMeta::new(),
            pcm,
            utterance,
            last: false,
        }
    }

    /// End-of-utterance marker frame.
    pub fn last_marker(utterance: u64) -> Self {
        Self {
            meta: FrameMeta::new(),
            pcm: Vec::new(),
            utterance,
            last: true,
        }
    }
}

/// Turn-taking and lifecycle signals.
///
/// The bot-speaking signals carry the utterance id of the reply being played
/// so the interruption controller can tell a live cancellation from a stale
/// one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    UserStartedSpeaking,
    UserStoppedSpeaking,
    BotStartedSpeaking { utterance: u64 },
    BotStoppedSpeaking { utterance: u64 },
    StartConversation,
    EndConversation,
}

impl ControlSignal {
    /// Lifecycle signals delimit the conversation's frame stream: they must
    /// arrive after every frame queued before them, so they travel in-band on
    /// the data lane. Turn-taking signals jump ahead on the priority lane.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            ControlSignal::StartConversation | ControlSignal::EndConversation
        )
    }
}

impl fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlSignal::UserStartedSpeaking => write!(f, "UserStartedSpeaking"),
            ControlSignal::UserStoppedSpeaking => write!(f, "UserStoppedSpeaking"),
            ControlSignal::BotStartedSpeaking { utterance } => {
                write!(f, "BotStartedSpeaking(#{utterance})")
            }
            ControlSignal::BotStoppedSpeaking { utterance } => {
                write!(f, "BotStoppedSpeaking(#{utterance})")
            }
            ControlSignal::StartConversation => write!(f, "StartConversation"),
            ControlSignal::EndConversation => write!(f, "EndConversation"),
        }
    }
}

/// A control signal wrapped with frame metadata.
#[derive(Debug, Clone)]
pub struct ControlFrame {
    pub meta: FrameMeta,
    pub signal: ControlSignal,
}

impl ControlFrame {
    pub fn new(signal: ControlSignal) -> Self {
        Self {
            meta: FrameMeta::new(),
            signal,
        }
    }
}

/// Classification used for channel routing: turn-taking control frames
/// travel on the unbounded priority lane; data frames and lifecycle control
/// frames share the FIFO lane so conversation delimiters never overtake the
/// frames they delimit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Control,
}

/// The unit of data and control flowing through the pipeline.
#[derive(Debug, Clone)]
pub enum Frame {
    Audio(AudioFrame),
    Transcript(TranscriptFrame),
    ModelReply(ModelReplyFrame),
    SynthesizedAudio(SynthesizedAudioFrame),
    Control(ControlFrame),
}

impl Frame {
    /// Wrap a control signal in a frame.
    pub fn control(signal: ControlSignal) -> Self {
        Frame::Control(ControlFrame::new(signal))
    }

    pub fn meta(&self) -> &FrameMeta {
        match self {
            Frame::Audio(f) => &f.meta,
            Frame::Transcript(f) => &f.meta,
            Frame::ModelReply(f) => &f.meta,
            Frame::SynthesizedAudio(f) => &f.meta,
            Frame::Control(f) => &f.meta,
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Control(c) if !c.signal.is_lifecycle() => FrameKind::Control,
            _ => FrameKind::Data,
        }
    }

    /// True for the `EndConversation` control frame.
    pub fn is_end_conversation(&self) -> bool {
        matches!(
            self,
            Frame::Control(c) if c.signal == ControlSignal::EndConversation
        )
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Audio(a) => {
                write!(f, "Audio#{}({}B @{}Hz)", a.meta.seq, a.pcm.len(), a.sample_rate)
            }
            Frame::Transcript(t) => write!(
                f,
                "Transcript#{}({}, {:?}, final={})",
                t.meta.seq, t.role, t.text, t.is_final
            ),
            Frame::ModelReply(r) => write!(
                f,
                "ModelReply#{}(utt={}, {:?}, final={})",
                r.meta.seq, r.utterance, r.text, r.is_final
            ),
            Frame::SynthesizedAudio(s) => write!(
                f,
                "SynthesizedAudio#{}(utt={}, {}B, last={})",
                s.meta.seq, s.utterance, s.pcm.len(), s.last
            ),
            Frame::Control(c) => write!(f, "Control#{}({})", c.meta.seq, c.signal),
        }
    }
}
