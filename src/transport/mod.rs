// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Duplex transport between the telephony call socket and the pipeline.
//!
//! The wire carries 8 kHz G.711 mu-law; internally the pipeline works on
//! PCM16 at the session sample rate. The input stage owns a background
//! reader task so inbound audio and VAD evaluation never wait on downstream
//! processing — barge-in detection depends on that. The output stage writes
//! synthesized audio in arrival order, dropping frames whose utterance has
//! been cancelled so flushed replies never reach the caller.
//!
//! Both stages notify the [`InterruptionController`] synchronously, in the
//! same call that detected the VAD edge or wrote the first chunk, before the
//! corresponding control frame is queued.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::codec;
use crate::audio::vad::{RmsVad, VadEvent, VadParams};
use crate::error::TransportError;
use crate::frames::{AudioFrame, ControlSignal, Frame};
use crate::interruption::InterruptionController;
use crate::latency::{TimingMark, TimingTracker};
use crate::pipeline::{ContextSender, FrameDirection, Stage, StageContext, StageWeight};
use crate::providers::VoiceActivityDetector;

/// Telephony wire sample rate (G.711).
pub const WIRE_SAMPLE_RATE: u32 = 8000;

/// Length of the zero-PCM tail written after an utterance when silence
/// padding is enabled, so the final syllable is not clipped.
const SILENCE_TAIL_MS: usize = 40;

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportParams {
    /// Internal PCM sample rate the pipeline works at.
    pub sample_rate: u32,
    /// Write a short silence tail after each utterance.
    pub pad_silence: bool,
    pub vad: VadParams,
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            pad_silence: true,
            vad: VadParams::default(),
        }
    }
}

/// Reading half of the call socket. `read` returns one mu-law chunk, or
/// `None` once the call has ended.
#[async_trait]
pub trait CallAudioSource: Send {
    async fn read(&mut self) -> Option<Vec<u8>>;
}

/// Writing half of the call socket.
#[async_trait]
pub trait CallAudioSink: Send {
    async fn write(&mut self, mulaw: &[u8]) -> Result<(), TransportError>;

    async fn close(&mut self) {}
}

/// A connected call socket, split into its two halves when the session is
/// built.
pub trait DuplexCallSocket: Send {
    fn split(self: Box<Self>) -> (Box<dyn CallAudioSource>, Box<dyn CallAudioSink>);
}

/// In-memory duplex socket over channels. The production transport for a
/// telephony vendor implements the same traits over its media stream.
pub struct ChannelCallSocket {
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelCallSocket {
    /// Returns the socket plus the far end: a sender feeding caller audio in
    /// and a receiver observing what the pipeline plays back.
    pub fn new() -> (
        Self,
        mpsc::UnboundedSender<Vec<u8>>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                inbound: inbound_rx,
                outbound: outbound_tx,
            },
            inbound_tx,
            outbound_rx,
        )
    }
}

struct ChannelSource {
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

struct ChannelSink {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl CallAudioSource for ChannelSource {
    async fn read(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }
}

#[async_trait]
impl CallAudioSink for ChannelSink {
    async fn write(&mut self, mulaw: &[u8]) -> Result<(), TransportError> {
        self.outbound
            .send(mulaw.to_vec())
            .map_err(|_| TransportError::Closed)
    }
}

impl DuplexCallSocket for ChannelCallSocket {
    fn split(self: Box<Self>) -> (Box<dyn CallAudioSource>, Box<dyn CallAudioSink>) {
        (
            Box::new(ChannelSource {
                inbound: self.inbound,
            }),
            Box::new(ChannelSink {
                outbound: self.outbound,
            }),
        )
    }
}

/// Inbound half: socket reader, codec, VAD, speech-edge control frames.
pub struct TransportInputStage {
    source: Option<Box<dyn CallAudioSource>>,
    detector: Option<Box<dyn VoiceActivityDetector>>,
    params: TransportParams,
    controller: Arc<InterruptionController>,
    timing: Arc<TimingTracker>,
}

impl TransportInputStage {
    pub fn new(
        source: Box<dyn CallAudioSource>,
        params: TransportParams,
        controller: Arc<InterruptionController>,
        timing: Arc<TimingTracker>,
    ) -> Self {
        let detector = RmsVad::new(params.sample_rate, params.vad.clone());
        Self {
            source: Some(source),
            detector: Some(Box::new(detector)),
            params,
            controller,
            timing,
        }
    }

    /// Replace the built-in RMS detector.
    pub fn with_detector(mut self, detector: Box<dyn VoiceActivityDetector>) -> Self {
        self.detector = Some(detector);
        self
    }
}

#[async_trait]
impl Stage for TransportInputStage {
    fn name(&self) -> &str {
        "transport-input"
    }

    fn weight(&self) -> StageWeight {
        StageWeight::Light
    }

    async fn setup(&mut self, ctx: &StageContext) {
        let (Some(source), Some(detector)) = (self.source.take(), self.detector.take()) else {
            return;
        };
        tokio::spawn(read_loop(
            source,
            detector,
            self.params.clone(),
            self.controller.clone(),
            self.timing.clone(),
            ctx.downstream_sender(),
            ctx.cancel_token().clone(),
        ));
    }

    async fn process(&mut self, frame: Frame, direction: FrameDirection, ctx: &StageContext) {
        // Head stage: externally queued frames pass straight through;
        // upstream frames have reached the end of their travel.
        match direction {
            FrameDirection::Downstream => ctx.send_downstream(frame),
            FrameDirection::Upstream => ctx.send_upstream(frame),
        }
    }
}

async fn read_loop(
    mut source: Box<dyn CallAudioSource>,
    mut detector: Box<dyn VoiceActivityDetector>,
    params: TransportParams,
    controller: Arc<InterruptionController>,
    timing: Arc<TimingTracker>,
    out: ContextSender,
    cancel: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            chunk = source.read() => chunk,
        };
        let Some(mulaw) = chunk else {
            tracing::info!("call socket closed, ending conversation");
            // The caller is gone: stop the in-flight reply now instead of
            // letting it run until the end frame reaches the providers.
            controller.on_control(&ControlSignal::EndConversation);
            out.send(Frame::control(ControlSignal::EndConversation));
            return;
        };

        let wire_pcm = codec::mulaw_to_pcm(&mulaw);
        let pcm = codec::resample_linear(&wire_pcm, WIRE_SAMPLE_RATE, params.sample_rate);

        match detector.evaluate(&pcm) {
            VadEvent::SpeechStarted => {
                let outcome = controller.on_control(&ControlSignal::UserStartedSpeaking);
                out.send(Frame::control(ControlSignal::UserStartedSpeaking));
                if let Some(utterance) = outcome.cancelled {
                    // The output side will see no further frames for the
                    // cancelled reply; close its speaking segment here.
                    let stopped = ControlSignal::BotStoppedSpeaking { utterance };
                    controller.on_control(&stopped);
                    out.send(Frame::control(stopped));
                }
            }
            VadEvent::SpeechStopped => {
                timing.mark(TimingMark::UserStoppedSpeaking);
                controller.on_control(&ControlSignal::UserStoppedSpeaking);
                out.send(Frame::control(ControlSignal::UserStoppedSpeaking));
            }
            VadEvent::None => {}
        }

        out.send(Frame::Audio(AudioFrame::new(pcm, params.sample_rate)));
    }
}

/// Outbound half: ordered playback with staleness filtering and the
/// bot-speaking control frames.
pub struct TransportOutputStage {
    sink: Box<dyn CallAudioSink>,
    params: TransportParams,
    clock: Arc<crate::interruption::UtteranceClock>,
    controller: Arc<InterruptionController>,
    timing: Arc<TimingTracker>,
    /// Utterance currently being played out.
    speaking: Option<u64>,
    /// Set after a fatal write failure or `EndConversation`.
    closed: bool,
}

impl TransportOutputStage {
    pub fn new(
        sink: Box<dyn CallAudioSink>,
        params: TransportParams,
        clock: Arc<crate::interruption::UtteranceClock>,
        controller: Arc<InterruptionController>,
        timing: Arc<TimingTracker>,
    ) -> Self {
        Self {
            sink,
            params,
            clock,
            controller,
            timing,
            speaking: None,
            closed: false,
        }
    }

    async fn write_pcm(&mut self, pcm: &[u8], ctx: &StageContext) {
        let wire_pcm = codec::resample_linear(pcm, self.params.sample_rate, WIRE_SAMPLE_RATE);
        let mulaw = codec::pcm_to_mulaw(&wire_pcm);
        if let Err(err) = self.sink.write(&mulaw).await {
            tracing::error!(%err, "outbound audio write failed, ending conversation");
            self.closed = true;
            ctx.send_downstream(Frame::control(ControlSignal::EndConversation));
        }
    }

    fn announce(&self, signal: ControlSignal, ctx: &StageContext) {
        self.controller.on_control(&signal);
        ctx.send_upstream(Frame::control(signal.clone()));
        ctx.send_downstream(Frame::control(signal));
    }
}

#[async_trait]
impl Stage for TransportOutputStage {
    fn name(&self) -> &str {
        "transport-output"
    }

    fn weight(&self) -> StageWeight {
        StageWeight::Standard
    }

    async fn process(&mut self, frame: Frame, direction: FrameDirection, ctx: &StageContext) {
        if direction == FrameDirection::Upstream {
            ctx.send_upstream(frame);
            return;
        }
        match frame {
            Frame::SynthesizedAudio(audio) => {
                if self.closed {
                    return;
                }
                if !self.clock.is_live(audio.utterance) {
                    tracing::debug!(
                        utterance = audio.utterance,
                        "dropping audio for cancelled reply"
                    );
                    return;
                }
                if audio.last {
                    if self.speaking.take() == Some(audio.utterance) {
                        if self.params.pad_silence {
                            let samples =
                                self.params.sample_rate as usize / 1000 * SILENCE_TAIL_MS;
                            self.write_pcm(&vec![0u8; samples * 2], ctx).await;
                        }
                        self.announce(
                            ControlSignal::BotStoppedSpeaking {
                                utterance: audio.utterance,
                            },
                            ctx,
                        );
                    }
                    return;
                }
                if audio.pcm.is_empty() {
                    return;
                }
                if self.speaking != Some(audio.utterance) {
                    self.speaking = Some(audio.utterance);
                    self.timing.mark(TimingMark::BotStartedSpeaking);
                    self.announce(
                        ControlSignal::BotStartedSpeaking {
                            utterance: audio.utterance,
                        },
                        ctx,
                    );
                }
                self.write_pcm(&audio.pcm, ctx).await;
            }
            Frame::Control(control) => {
                if control.signal == ControlSignal::EndConversation {
                    self.closed = true;
                }
                ctx.send_downstream(Frame::Control(control));
            }
            other => ctx.send_downstream(other),
        }
    }

    async fn cleanup(&mut self) {
        self.sink.close().await;
    }
}
