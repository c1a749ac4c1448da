// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Provider-backed pipeline stages: speech-to-text, conversational model,
//! speech synthesis.

pub mod model;
pub mod stt;
pub mod tts;

pub use model::ModelStage;
pub use stt::SttStage;
pub use tts::TtsStage;
