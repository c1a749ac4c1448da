// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! One conversation session: the assembled pipeline over a call socket.
//!
//! Stage order mirrors the frame flow — transport input, speech-to-text,
//! user context, model, synthesis, transport output, assistant context. The
//! assistant-context stage sits past the output so a reply only becomes a
//! history turn once its audio has actually been accepted for playback.

use std::sync::Arc;

use crate::context::{
    AssistantContextStage, ContextAggregator, ConversationHistory, UserContextStage,
};
use crate::error::SessionError;
use crate::frames::{ControlSignal, Frame};
use crate::interruption::{InterruptionController, UtteranceClock};
use crate::latency::TimingTracker;
use crate::pipeline::{LifecycleEvent, PipelineRunner, RunnerHandle, Stage};
use crate::providers::{ChatModel, SpeechSynthesizer, SpeechToText, VoiceActivityDetector};
use crate::stages::{ModelStage, SttStage, TtsStage};
use crate::transport::{
    DuplexCallSocket, TransportInputStage, TransportOutputStage, TransportParams,
};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// System instruction seeding the conversation history.
    pub system_instruction: String,
    pub transport: TransportParams,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            system_instruction: "You are a helpful voice assistant. Keep replies short and \
                                 conversational."
                .into(),
            transport: TransportParams::default(),
        }
    }
}

/// A running voice conversation over one call socket.
pub struct PipelineSession {
    runner: PipelineRunner,
    aggregator: ContextAggregator,
}

impl PipelineSession {
    pub fn new(
        socket: Box<dyn DuplexCallSocket>,
        stt: Box<dyn SpeechToText>,
        model: Box<dyn ChatModel>,
        tts: Box<dyn SpeechSynthesizer>,
        params: SessionParams,
    ) -> Self {
        Self::build(socket, stt, model, tts, params, None)
    }

    /// Same as [`new`](Self::new) with a custom voice activity detector on
    /// the inbound transport.
    pub fn with_detector(
        socket: Box<dyn DuplexCallSocket>,
        stt: Box<dyn SpeechToText>,
        model: Box<dyn ChatModel>,
        tts: Box<dyn SpeechSynthesizer>,
        params: SessionParams,
        detector: Box<dyn VoiceActivityDetector>,
    ) -> Self {
        Self::build(socket, stt, model, tts, params, Some(detector))
    }

    fn build(
        socket: Box<dyn DuplexCallSocket>,
        stt: Box<dyn SpeechToText>,
        model: Box<dyn ChatModel>,
        tts: Box<dyn SpeechSynthesizer>,
        params: SessionParams,
        detector: Option<Box<dyn VoiceActivityDetector>>,
    ) -> Self {
        let (source, sink) = socket.split();
        let clock = Arc::new(UtteranceClock::new());
        let timing = Arc::new(TimingTracker::new());
        let aggregator = ContextAggregator::new(params.system_instruction);
        let controller = Arc::new(InterruptionController::new(
            clock.clone(),
            aggregator.clone(),
        ));

        let mut input = TransportInputStage::new(
            source,
            params.transport.clone(),
            controller.clone(),
            timing.clone(),
        );
        if let Some(detector) = detector {
            input = input.with_detector(detector);
        }

        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(input),
            Box::new(SttStage::new(stt)),
            Box::new(UserContextStage::new(aggregator.clone())),
            Box::new(ModelStage::new(
                model,
                aggregator.clone(),
                clock.clone(),
                timing.clone(),
            )),
            Box::new(TtsStage::new(tts, clock.clone(), timing.clone())),
            Box::new(TransportOutputStage::new(
                sink,
                params.transport,
                clock.clone(),
                controller,
                timing.clone(),
            )),
            Box::new(AssistantContextStage::new(aggregator.clone())),
        ];

        Self {
            runner: PipelineRunner::new(stages, clock, timing),
            aggregator,
        }
    }

    /// Injection handle for external collaborators (call control, admin
    /// hangup).
    pub fn handle(&self) -> RunnerHandle {
        self.runner.handle()
    }

    /// Register a lifecycle handler; runs synchronously in delivery order.
    pub fn on_lifecycle(&mut self, handler: impl Fn(&LifecycleEvent) + Send + Sync + 'static) {
        self.runner.on_lifecycle(handler);
    }

    /// Snapshot of the conversation so far.
    pub fn history(&self) -> ConversationHistory {
        self.aggregator.history()
    }

    /// Run the conversation to completion: greet the caller, then supervise
    /// until `EndConversation` has propagated through every stage. Returns
    /// the final conversation history.
    pub async fn run(mut self) -> Result<ConversationHistory, SessionError> {
        self.handle()
            .queue_frames(vec![Frame::control(ControlSignal::StartConversation)])
            .await;
        self.runner.run().await?;
        Ok(self.aggregator.history())
    }
}
