// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Text-to-speech stage.
//!
//! Reply text is buffered to sentence boundaries before synthesis — single
//! words make for poor prosody — and flushed when the reply finalizes. A
//! dedicated worker task owns the synthesizer and processes sentences
//! sequentially, so audio for sentence two never interleaves ahead of
//! sentence one. Each synthesis races the utterance's cancellation token;
//! sentences for an utterance that is no longer live are skipped entirely.
//!
//! Reply frames pass through unchanged: the assistant context aggregator at
//! the tail still needs them.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::frames::{Frame, SynthesizedAudioFrame};
use crate::interruption::UtteranceClock;
use crate::latency::{TimingMark, TimingTracker};
use crate::pipeline::{ContextSender, FrameDirection, Stage, StageContext, StageWeight};
use crate::providers::SpeechSynthesizer;

/// Characters that end a sentence or clause worth synthesizing.
const SENTENCE_ENDINGS: &[char] = &['.', '!', '?', '\n'];

/// Whether the buffered text ends at a sentence boundary. A trailing newline
/// counts before whitespace trimming would hide it.
fn is_sentence_boundary(text: &str) -> bool {
    if text.ends_with('\n') {
        return true;
    }
    match text.trim_end().chars().last() {
        Some(last) => SENTENCE_ENDINGS.contains(&last),
        None => false,
    }
}

struct SynthesisRequest {
    utterance: u64,
    text: String,
    /// Marks the tail sentence of the utterance.
    last: bool,
}

pub struct TtsStage {
    provider: Option<Box<dyn SpeechSynthesizer>>,
    clock: Arc<UtteranceClock>,
    timing: Arc<TimingTracker>,
    requests: Option<mpsc::UnboundedSender<SynthesisRequest>>,
    buffer: String,
    buffered_utterance: u64,
}

impl TtsStage {
    pub fn new(
        provider: Box<dyn SpeechSynthesizer>,
        clock: Arc<UtteranceClock>,
        timing: Arc<TimingTracker>,
    ) -> Self {
        Self {
            provider: Some(provider),
            clock,
            timing,
            requests: None,
            buffer: String::with_capacity(256),
            buffered_utterance: 0,
        }
    }

    fn request(&self, request: SynthesisRequest) {
        if let Some(requests) = &self.requests {
            if requests.send(request).is_err() {
                tracing::warn!("synthesis worker gone, sentence dropped");
            }
        }
    }
}

#[async_trait]
impl Stage for TtsStage {
    fn name(&self) -> &str {
        "tts"
    }

    fn weight(&self) -> StageWeight {
        StageWeight::Heavy
    }

    async fn setup(&mut self, ctx: &StageContext) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.requests = Some(tx);
        if let Some(provider) = self.provider.take() {
            tokio::spawn(synthesis_worker(
                provider,
                rx,
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
            Frame::ModelReply(reply) => {
                if reply.utterance != self.buffered_utterance {
                    // A new reply started; whatever the cancelled one left
                    // behind is stale.
                    self.buffer.clear();
                    self.buffered_utterance = reply.utterance;
                }
                if reply.is_final {
                    let remainder = std::mem::take(&mut self.buffer);
                    self.request(SynthesisRequest {
                        utterance: reply.utterance,
                        text: remainder,
                        last: true,
                    });
                } else {
                    self.buffer.push_str(&reply.text);
                    if is_sentence_boundary(&self.buffer) {
                        let sentence = std::mem::take(&mut self.buffer);
                        self.request(SynthesisRequest {
                            utterance: reply.utterance,
                            text: sentence,
                            last: false,
                        });
                    }
                }
                ctx.send_downstream(frame);
            }
            _ => ctx.send_downstream(frame),
        }
    }
}

async fn synthesis_worker(
    mut provider: Box<dyn SpeechSynthesizer>,
    mut requests: mpsc::UnboundedReceiver<SynthesisRequest>,
    clock: Arc<UtteranceClock>,
    timing: Arc<TimingTracker>,
    out: ContextSender,
    cancel: CancellationToken,
) {
    // Utterance whose first audio chunk has been emitted.
    let mut audio_started: Option<u64> = None;
    loop {
        let request = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            maybe = requests.recv() => match maybe {
                Some(request) => request,
                None => break,
            },
        };

        if !clock.is_live(request.utterance) {
            tracing::debug!(
                utterance = request.utterance,
                "skipping synthesis for cancelled reply"
            );
            continue;
        }

        if !request.text.trim().is_empty() {
            synthesize_sentence(
                &mut provider,
                &request,
                &clock,
                &timing,
                &out,
                &cancel,
                &mut audio_started,
            )
            .await;
        }

        if request.last && clock.is_live(request.utterance) {
            out.send(Frame::SynthesizedAudio(SynthesizedAudioFrame::last_marker(
                request.utterance,
            )));
        }
    }
    tracing::debug!("synthesis worker exited");
}

async fn synthesize_sentence(
    provider: &mut Box<dyn SpeechSynthesizer>,
    request: &SynthesisRequest,
    clock: &UtteranceClock,
    timing: &TimingTracker,
    out: &ContextSender,
    cancel: &CancellationToken,
    audio_started: &mut Option<u64>,
) {
    let token = clock.watch(request.utterance);
    let mut stream = match provider.synthesize(&request.text).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(%err, utterance = request.utterance, "synthesis failed, sentence skipped");
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            // Pipeline shutdown can outrun the per-utterance cancellation;
            // either one must stop the synthesis stream.
            _ = cancel.cancelled() => {
                tracing::debug!(utterance = request.utterance, "synthesis stopped by shutdown");
                return;
            }
            _ = token.cancelled() => {
                tracing::debug!(utterance = request.utterance, "synthesis cancelled mid-stream");
                return;
            }
            chunk = stream.next() => match chunk {
                Some(Ok(pcm)) => {
                    if *audio_started != Some(request.utterance) {
                        timing.mark(TimingMark::TtsFirstAudio);
                        *audio_started = Some(request.utterance);
                    }
                    out.send(Frame::SynthesizedAudio(SynthesizedAudioFrame::new(
                        pcm,
                        request.utterance,
                    )));
                }
                Some(Err(err)) => {
                    tracing::warn!(%err, utterance = request.utterance, "synthesis stream failed");
                    return;
                }
                None => return,
            }
        }
    }
}
