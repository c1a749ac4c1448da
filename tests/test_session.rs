// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! End-to-end session tests over an in-memory call socket with scripted
//! providers.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use tokio::sync::mpsc;

use voxline::audio::codec;
use voxline::prelude::*;

const LOUD: i16 = 8000;

/// 20 ms of constant-amplitude wire audio.
fn wire_chunk(amplitude: i16) -> Vec<u8> {
    let samples = (WIRE_SAMPLE_RATE / 50) as usize;
    let pcm: Vec<u8> = (0..samples).flat_map(|_| amplitude.to_le_bytes()).collect();
    codec::pcm_to_mulaw(&pcm)
}

fn is_loud(pcm: &[u8]) -> bool {
    pcm.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]).unsigned_abs())
        .any(|a| a > 1000)
}

/// Debounce-free detector: fires an edge on the first loud or silent chunk,
/// keeping speech-edge timing deterministic.
struct EdgeDetector {
    speaking: bool,
}

impl EdgeDetector {
    fn new() -> Box<Self> {
        Box::new(Self { speaking: false })
    }
}

impl VoiceActivityDetector for EdgeDetector {
    fn evaluate(&mut self, pcm: &[u8]) -> VadEvent {
        let loud = is_loud(pcm);
        if loud && !self.speaking {
            self.speaking = true;
            VadEvent::SpeechStarted
        } else if !loud && self.speaking {
            self.speaking = false;
            VadEvent::SpeechStopped
        } else {
            VadEvent::None
        }
    }

    fn reset(&mut self) {
        self.speaking = false;
    }
}

/// Pops one scripted result per loud-to-silent transition.
struct TurnTakingStt {
    script: Vec<Result<&'static str, ProviderError>>,
    utterance: u64,
    in_speech: bool,
}

impl TurnTakingStt {
    fn new(script: Vec<Result<&'static str, ProviderError>>) -> Box<Self> {
        Box::new(Self {
            script,
            utterance: 0,
            in_speech: false,
        })
    }
}

#[async_trait]
impl SpeechToText for TurnTakingStt {
    async fn transcribe(
        &mut self,
        pcm: &[u8],
        _sample_rate: u32,
    ) -> Result<Vec<TranscriptEvent>, ProviderError> {
        if is_loud(pcm) {
            self.in_speech = true;
            return Ok(Vec::new());
        }
        if !self.in_speech {
            return Ok(Vec::new());
        }
        self.in_speech = false;
        self.utterance += 1;
        if self.script.is_empty() {
            return Ok(Vec::new());
        }
        let text = self.script.remove(0)?;
        Ok(vec![TranscriptEvent::final_result(self.utterance, text)])
    }
}

/// One scripted stream per `generate` call.
enum Reply {
    /// Deltas, then a clean end of stream.
    Full(Vec<&'static str>),
    /// Deltas, then pending forever; only cancellation stops it.
    Stall(Vec<&'static str>),
}

struct ScriptedModel {
    script: Vec<Reply>,
}

impl ScriptedModel {
    fn new(script: Vec<Reply>) -> Box<Self> {
        Box::new(Self { script })
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn generate(
        &mut self,
        _history: &ConversationHistory,
    ) -> Result<TextStream, ProviderError> {
        if self.script.is_empty() {
            return Err(ProviderError::model("script exhausted"));
        }
        match self.script.remove(0) {
            Reply::Full(deltas) => {
                let chunks: Vec<Result<String, ProviderError>> =
                    deltas.iter().map(|d| Ok(d.to_string())).collect();
                Ok(stream::iter(chunks).boxed())
            }
            Reply::Stall(deltas) => {
                let chunks: Vec<Result<String, ProviderError>> =
                    deltas.iter().map(|d| Ok(d.to_string())).collect();
                Ok(stream::iter(chunks).chain(stream::pending()).boxed())
            }
        }
    }
}

/// Two fixed PCM chunks per synthesized sentence.
struct ChunkedTts;

#[async_trait]
impl SpeechSynthesizer for ChunkedTts {
    async fn synthesize(&mut self, _text: &str) -> Result<PcmStream, ProviderError> {
        let chunks: Vec<Result<Vec<u8>, ProviderError>> =
            vec![Ok(vec![0x10; 640]), Ok(vec![0x20; 640])];
        Ok(stream::iter(chunks).boxed())
    }
}

struct Harness {
    caller_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    caller_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::UnboundedReceiver<String>,
    handle: RunnerHandle,
    session: tokio::task::JoinHandle<Result<ConversationHistory, SessionError>>,
}

fn start_session(
    stt: Box<dyn SpeechToText>,
    model: Box<dyn ChatModel>,
    tts: Box<dyn SpeechSynthesizer>,
) -> Harness {
    // Stage traces under RUST_LOG, captured per test.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let (socket, caller_tx, caller_rx) = ChannelCallSocket::new();
    let params = SessionParams {
        transport: TransportParams {
            pad_silence: false,
            ..TransportParams::default()
        },
        ..SessionParams::default()
    };
    let mut session = PipelineSession::with_detector(
        Box::new(socket),
        stt,
        model,
        tts,
        params,
        EdgeDetector::new(),
    );
    let (events_tx, events) = mpsc::unbounded_channel();
    session.on_lifecycle(move |event| {
        let _ = events_tx.send(format!("{event:?}"));
    });
    let handle = session.handle();
    Harness {
        caller_tx: Some(caller_tx),
        caller_rx,
        events,
        handle,
        session: tokio::spawn(session.run()),
    }
}

impl Harness {
    /// Consume events until one contains `needle`.
    async fn wait_for(&mut self, needle: &str) -> String {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {needle}"))
                .expect("event channel closed");
            if event.contains(needle) {
                return event;
            }
        }
    }

    /// 100 ms of speech followed by 100 ms of silence.
    fn speak_turn(&self) {
        let tx = self.caller_tx.as_ref().expect("already hung up");
        for _ in 0..5 {
            tx.send(wire_chunk(LOUD)).expect("socket open");
        }
        for _ in 0..5 {
            tx.send(wire_chunk(0)).expect("socket open");
        }
    }

    /// Close the caller side of the socket.
    fn hangup(&mut self) {
        self.caller_tx.take();
    }

    async fn join(self) -> ConversationHistory {
        tokio::time::timeout(Duration::from_secs(5), self.session)
            .await
            .expect("session did not end")
            .expect("session task panicked")
            .expect("session failed")
    }

    /// Inject `EndConversation` and wait for the session to wind down.
    async fn finish(self) -> ConversationHistory {
        self.handle
            .queue_frames(vec![Frame::control(ControlSignal::EndConversation)])
            .await;
        self.join().await
    }
}

#[tokio::test]
async fn greeting_plays_before_any_user_speech() {
    let mut h = start_session(
        TurnTakingStt::new(vec![]),
        ScriptedModel::new(vec![Reply::Full(vec!["Hi ", "there!"])]),
        Box::new(ChunkedTts),
    );

    h.wait_for("ConversationStarted").await;
    h.wait_for("BotStartedSpeaking").await;
    h.wait_for("BotStoppedSpeaking").await;

    // The greeting reached the wire.
    let played = h.caller_rx.recv().await.expect("wire audio");
    assert!(!played.is_empty());

    // Hang up from the far end: the session winds down on its own.
    h.hangup();
    h.wait_for("ConversationEnded").await;
    let history = h.join().await;
    let turns = history.turns();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].role, Role::Assistant);
    assert_eq!(turns[0].text, "Hi there!");
}

#[tokio::test]
async fn user_turn_gets_a_reply() {
    let mut h = start_session(
        TurnTakingStt::new(vec![Ok("yeah sure")]),
        ScriptedModel::new(vec![
            Reply::Full(vec!["Hello!"]),
            Reply::Full(vec!["Of ", "course."]),
        ]),
        Box::new(ChunkedTts),
    );

    h.wait_for("BotStoppedSpeaking").await;

    h.speak_turn();
    let transcript = h.wait_for("FinalTranscript").await;
    assert!(transcript.contains("yeah sure"));
    h.wait_for("BotStartedSpeaking").await;
    h.wait_for("BotStoppedSpeaking").await;

    let history = h.finish().await;
    let turns = history.turns();
    assert_eq!(turns.len(), 3);
    assert_eq!(turns[0].text, "Hello!");
    assert_eq!(turns[1].role, Role::User);
    assert_eq!(turns[1].text, "yeah sure");
    assert_eq!(turns[2].role, Role::Assistant);
    assert_eq!(turns[2].text, "Of course.");
}

#[tokio::test]
async fn barge_in_truncates_the_interrupted_reply() {
    let mut h = start_session(
        TurnTakingStt::new(vec![Ok("wait stop")]),
        ScriptedModel::new(vec![
            // The greeting never finishes on its own: one spoken sentence,
            // then the stream hangs until the barge-in cancels it.
            Reply::Stall(vec!["Let me tell you a very long story. "]),
            Reply::Full(vec!["Okay."]),
        ]),
        Box::new(ChunkedTts),
    );

    h.wait_for("BotStartedSpeaking").await;

    // Talk over the bot.
    h.speak_turn();
    h.wait_for("UserStartedSpeaking").await;
    h.wait_for("BotStoppedSpeaking").await;
    h.wait_for("UserStoppedSpeaking").await;

    // The pipeline recovers and answers the interrupting turn.
    let transcript = h.wait_for("FinalTranscript").await;
    assert!(transcript.contains("wait stop"));
    h.wait_for("BotStartedSpeaking").await;
    h.wait_for("BotStoppedSpeaking").await;

    let history = h.finish().await;
    let turns = history.turns();
    // No trace of the interrupted story.
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, Role::User);
    assert_eq!(turns[0].text, "wait stop");
    assert_eq!(turns[1].role, Role::Assistant);
    assert_eq!(turns[1].text, "Okay.");
}

#[tokio::test]
async fn transcription_failure_drops_one_utterance_only() {
    let mut h = start_session(
        TurnTakingStt::new(vec![
            Err(ProviderError::stt("connection reset")),
            Ok("hello again"),
        ]),
        ScriptedModel::new(vec![
            Reply::Full(vec!["Hello!"]),
            Reply::Full(vec!["Hi ", "again!"]),
        ]),
        Box::new(ChunkedTts),
    );

    h.wait_for("BotStoppedSpeaking").await;

    // First turn: transcription fails, no transcript and no reply.
    h.speak_turn();
    h.wait_for("UserStoppedSpeaking").await;

    // The next turn works normally.
    h.speak_turn();
    let transcript = h.wait_for("FinalTranscript").await;
    assert!(transcript.contains("hello again"));
    h.wait_for("BotStoppedSpeaking").await;

    let history = h.finish().await;
    let turns = history.turns();
    assert_eq!(turns.len(), 3);
    assert_eq!(turns[1].text, "hello again");
    assert_eq!(turns[2].text, "Hi again!");
}

#[tokio::test]
async fn hangup_during_generation_cancels_and_closes() {
    let mut h = start_session(
        TurnTakingStt::new(vec![]),
        // No sentence boundary, so nothing is synthesized: the session is
        // mid-generation when the caller hangs up.
        ScriptedModel::new(vec![Reply::Stall(vec!["Well"])]),
        Box::new(ChunkedTts),
    );

    h.wait_for("ConversationStarted").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.caller_rx.try_recv().is_err(), "no audio should have played");

    // Hang up from the far end while the reply is still streaming. The
    // session must cancel the stalled generation and wind down on its own.
    h.hangup();
    h.wait_for("ConversationEnded").await;
    let history = h.join().await;
    assert!(history.turns().is_empty());
}
