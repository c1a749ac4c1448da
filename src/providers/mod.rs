// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Capability traits for the pluggable external providers.
//!
//! The pipeline owns no vendor integration; a call site supplies
//! implementations of these traits (network-backed in production, scripted in
//! tests). Model and synthesis providers return streams so partial output can
//! flow through the pipeline as it arrives, and both are cancellable by
//! simply dropping the stream — the stages stop polling when the utterance's
//! cancellation token fires.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::audio::vad::VadEvent;
use crate::context::ConversationHistory;
use crate::error::ProviderError;

/// One speech-to-text result for a user utterance.
#[derive(Debug, Clone)]
pub struct TranscriptEvent {
    /// Monotonically increasing utterance id assigned by the provider.
    pub utterance: u64,
    pub text: String,
    pub is_final: bool,
}

impl TranscriptEvent {
    pub fn partial(utterance: u64, text: impl Into<String>) -> Self {
        Self {
            utterance,
            text: text.into(),
            is_final: false,
        }
    }

    pub fn final_result(utterance: u64, text: impl Into<String>) -> Self {
        Self {
            utterance,
            text: text.into(),
            is_final: true,
        }
    }
}

/// Streamed text deltas from the conversational model.
pub type TextStream = BoxStream<'static, Result<String, ProviderError>>;

/// Streamed PCM16 chunks from the speech synthesizer.
pub type PcmStream = BoxStream<'static, Result<Vec<u8>, ProviderError>>;

/// Speech-to-text capability.
#[async_trait]
pub trait SpeechToText: Send {
    /// Feed a PCM16 chunk; returns zero or more transcript events. Partials
    /// for an utterance may be superseded by later partials; exactly one
    /// final event ends each utterance.
    async fn transcribe(
        &mut self,
        pcm: &[u8],
        sample_rate: u32,
    ) -> Result<Vec<TranscriptEvent>, ProviderError>;
}

/// Conversational model capability.
#[async_trait]
pub trait ChatModel: Send {
    /// Stream a reply to the given history. A history with no turns (system
    /// instruction only) is valid and produces the opening greeting.
    async fn generate(
        &mut self,
        history: &ConversationHistory,
    ) -> Result<TextStream, ProviderError>;
}

/// Speech synthesis capability.
#[async_trait]
pub trait SpeechSynthesizer: Send {
    /// Stream PCM16 audio for one sentence of reply text.
    async fn synthesize(&mut self, text: &str) -> Result<PcmStream, ProviderError>;
}

/// Voice-activity detection capability.
///
/// Synchronous by design: it runs on the transport's read loop and must
/// never await, so barge-in detection keeps pace with inbound audio.
pub trait VoiceActivityDetector: Send {
    /// Feed a PCM16 chunk; returns at most one edge event per call.
    fn evaluate(&mut self, pcm: &[u8]) -> VadEvent;

    /// Return to the quiet state, discarding buffered audio.
    fn reset(&mut self);
}
