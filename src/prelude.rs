// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Common imports for building and running sessions.

pub use crate::audio::vad::{RmsVad, VadEvent, VadParams};
pub use crate::context::{ContextAggregator, ConversationHistory, Turn};
pub use crate::error::{ProviderError, ServiceKind, SessionError, TransportError};
pub use crate::frames::{
    AudioFrame, ControlSignal, Frame, ModelReplyFrame, Role, SynthesizedAudioFrame,
    TranscriptFrame,
};
pub use crate::interruption::{BargeInState, InterruptionController, UtteranceClock};
pub use crate::latency::{ResponseBand, TimingMark, TimingTracker};
pub use crate::pipeline::{
    ContextReceiver, ContextSender, FrameDirection, LifecycleEvent, PipelineRunner, RunnerHandle,
    Stage, StageContext, StageWeight,
};
pub use crate::providers::{
    ChatModel, PcmStream, SpeechSynthesizer, SpeechToText, TextStream, TranscriptEvent,
    VoiceActivityDetector,
};
pub use crate::session::{PipelineSession, SessionParams};
pub use crate::transport::{
    CallAudioSink, CallAudioSource, ChannelCallSocket, DuplexCallSocket, TransportParams,
    WIRE_SAMPLE_RATE,
};
