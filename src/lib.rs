// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Real-time duplex voice conversation pipeline.
//!
//! Telephony audio flows in over a mu-law call socket, through voice
//! activity detection, speech-to-text, a context aggregator and a streaming
//! conversational model, then back out through speech synthesis — all
//! concurrently, tuned for sub-second response delays. The caller can talk
//! over the bot at any point: a barge-in cancels generation and synthesis
//! mid-stream, flushes queued audio, and truncates the interrupted reply
//! from the conversation history.
//!
//! A session is assembled from pluggable providers:
//!
//! ```no_run
//! # use voxline::prelude::*;
//! # async fn run(
//! #     socket: Box<dyn DuplexCallSocket>,
//! #     stt: Box<dyn SpeechToText>,
//! #     model: Box<dyn ChatModel>,
//! #     tts: Box<dyn SpeechSynthesizer>,
//! # ) -> Result<(), SessionError> {
//! let mut session = PipelineSession::new(socket, stt, model, tts, SessionParams::default());
//! session.on_lifecycle(|event| tracing::debug!(?event, "lifecycle"));
//! let history = session.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod context;
pub mod error;
pub mod frames;
pub mod interruption;
pub mod latency;
pub mod pipeline;
pub mod prelude;
pub mod providers;
pub mod session;
pub mod stages;
pub mod transport;
