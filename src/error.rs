// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Error taxonomy for the conversation pipeline.
//!
//! Three failure classes with different blast radii:
//!
//! - [`TransportError`]: the call socket is gone. Fatal to the session; the
//!   transport emits a clean `EndConversation` and stops writing.
//! - [`ProviderError`]: an STT/model/TTS call failed. Recovered locally; the
//!   stage logs a warning and produces no output for that utterance, the
//!   session keeps running.
//! - [`SessionError`]: surfaced from `PipelineSession::run()` when the
//!   pipeline itself cannot continue.
//!
//! An interruption that arrives after a generation already finished is not an
//! error at all; the utterance clock treats it as a no-op.

use std::fmt;

use thiserror::Error;

/// Fatal failure of the duplex call socket.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("call socket closed")]
    Closed,
    #[error("call socket I/O failure: {0}")]
    Io(String),
}

/// Which provider capability failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Stt,
    Model,
    Tts,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKind::Stt => f.write_str("STT"),
            ServiceKind::Model => f.write_str("model"),
            ServiceKind::Tts => f.write_str("TTS"),
        }
    }
}

/// Recoverable failure of an external provider call.
#[derive(Debug, Clone, Error)]
#[error("{service} provider failure: {message}")]
pub struct ProviderError {
    pub service: ServiceKind,
    pub message: String,
}

impl ProviderError {
    pub fn stt(message: impl Into<String>) -> Self {
        Self {
            service: ServiceKind::Stt,
            message: message.into(),
        }
    }

    pub fn model(message: impl Into<String>) -> Self {
        Self {
            service: ServiceKind::Model,
            message: message.into(),
        }
    }

    pub fn tts(message: impl Into<String>) -> Self {
        Self {
            service: ServiceKind::Tts,
            message: message.into(),
        }
    }
}

/// Failure surfaced from running a pipeline session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A stage task died without propagating `EndConversation`.
    #[error("pipeline stalled: {0}")]
    Stalled(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_display() {
        let err = ProviderError::stt("connection reset");
        assert_eq!(err.to_string(), "STT provider failure: connection reset");
        let err = ProviderError::model("timeout");
        assert_eq!(err.to_string(), "model provider failure: timeout");
    }

    #[test]
    fn transport_error_converts_to_session_error() {
        let err: SessionError = TransportError::Closed.into();
        assert_eq!(err.to_string(), "call socket closed");
    }
}
