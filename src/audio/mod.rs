// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Audio processing: telephony codec, PCM utilities, voice-activity
//! detection.

pub mod codec;
pub mod utils;
pub mod vad;
