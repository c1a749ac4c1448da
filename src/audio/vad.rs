// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Voice-activity detection over 10 ms PCM windows.
//!
//! [`RmsVad`] is the built-in detector: it computes a smoothed RMS-based
//! speech confidence per window and runs a four-state debouncing machine so
//! that a speech segment produces exactly one [`VadEvent::SpeechStarted`] and
//! one [`VadEvent::SpeechStopped`], with the pad durations deciding how much
//! sustained speech or silence flips the state.

use crate::audio::utils::{calculate_rms, exp_smoothing};
use crate::providers::VoiceActivityDetector;

/// Analysis window length in milliseconds.
pub const VAD_WINDOW_MS: u64 = 10;

/// Smoothing factor applied to the per-window RMS volume.
const VOLUME_SMOOTHING: f64 = 0.5;

/// Normalized RMS level treated as fully confident speech. Telephone speech
/// sits well above this; line noise well below.
const SPEECH_RMS_FLOOR: f64 = 0.01;

/// VAD sensitivity parameters.
///
/// Defaults match the telephony deployment this pipeline was built for:
/// confidence 0.6, 200 ms of sustained speech before a start event, 100 ms of
/// sustained silence before a stop event.
#[derive(Debug, Clone)]
pub struct VadParams {
    /// Confidence in [0.0, 1.0] above which a window counts as speech.
    pub confidence_threshold: f64,
    /// Sustained speech required before `SpeechStarted`, in milliseconds.
    pub speech_pad_ms: u64,
    /// Sustained silence required before `SpeechStopped`, in milliseconds.
    pub silence_pad_ms: u64,
}

impl Default for VadParams {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            speech_pad_ms: 200,
            silence_pad_ms: 100,
        }
    }
}

/// Debouncing states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    Quiet,
    Starting,
    Speaking,
    Stopping,
}

/// Edge events produced by a detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    None,
    SpeechStarted,
    SpeechStopped,
}

/// RMS-based voice-activity detector.
pub struct RmsVad {
    params: VadParams,
    state: VadState,
    smoothed_volume: f64,
    /// Carry-over bytes smaller than one window.
    buffer: Vec<u8>,
    window_bytes: usize,
    /// Consecutive windows counted toward the pending state flip.
    windows_in_state: u64,
    start_windows: u64,
    stop_windows: u64,
}

impl RmsVad {
    pub fn new(sample_rate: u32, params: VadParams) -> Self {
        let window_samples = (sample_rate as u64 / 1000 * VAD_WINDOW_MS) as usize;
        let start_windows = (params.speech_pad_ms / VAD_WINDOW_MS).max(1);
        let stop_windows = (params.silence_pad_ms / VAD_WINDOW_MS).max(1);
        Self {
            params,
            state: VadState::Quiet,
            smoothed_volume: 0.0,
            buffer: Vec::with_capacity(window_samples * 4),
            window_bytes: window_samples * 2,
            windows_in_state: 0,
            start_windows,
            stop_windows,
        }
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    /// Speech confidence for one window: smoothed RMS scaled so that
    /// [`SPEECH_RMS_FLOOR`] maps to full confidence.
    fn confidence(&mut self, window: &[u8]) -> f64 {
        let volume = calculate_rms(window);
        self.smoothed_volume = exp_smoothing(volume, self.smoothed_volume, VOLUME_SMOOTHING);
        (self.smoothed_volume / SPEECH_RMS_FLOOR).min(1.0)
    }

    fn step(&mut self, speaking: bool) -> VadEvent {
        match self.state {
            VadState::Quiet => {
                if speaking {
                    self.state = VadState::Starting;
                    self.windows_in_state = 1;
                    if self.windows_in_state >= self.start_windows {
                        self.state = VadState::Speaking;
                        return VadEvent::SpeechStarted;
                    }
                }
            }
            VadState::Starting => {
                if speaking {
                    self.windows_in_state += 1;
                    if self.windows_in_state >= self.start_windows {
                        self.state = VadState::Speaking;
                        return VadEvent::SpeechStarted;
                    }
                } else {
                    self.state = VadState::Quiet;
                    self.windows_in_state = 0;
                }
            }
            VadState::Speaking => {
                if !speaking {
                    self.state = VadState::Stopping;
                    self.windows_in_state = 1;
                    if self.windows_in_state >= self.stop_windows {
                        self.state = VadState::Quiet;
                        return VadEvent::SpeechStopped;
                    }
                }
            }
            VadState::Stopping => {
                if !speaking {
                    self.windows_in_state += 1;
                    if self.windows_in_state >= self.stop_windows {
                        self.state = VadState::Quiet;
                        return VadEvent::SpeechStopped;
                    }
                } else {
                    // Short pause, not an end of turn.
                    self.state = VadState::Speaking;
                    self.windows_in_state = 0;
                }
            }
        }
        VadEvent::None
    }
}

impl VoiceActivityDetector for RmsVad {
    /// Feed PCM16 bytes; returns at most one edge event per call. Bytes past
    /// the first edge stay buffered for the next call so events are never
    /// coalesced.
    fn evaluate(&mut self, pcm: &[u8]) -> VadEvent {
        self.buffer.extend_from_slice(pcm);
        while self.buffer.len() >= self.window_bytes {
            let window: Vec<u8> = self.buffer.drain(..self.window_bytes).collect();
            let confidence = self.confidence(&window);
            let speaking = confidence >= self.params.confidence_threshold;
            let event = self.step(speaking);
            if event != VadEvent::None {
                return event;
            }
        }
        VadEvent::None
    }

    fn reset(&mut self) {
        self.state = VadState::Quiet;
        self.smoothed_volume = 0.0;
        self.buffer.clear();
        self.windows_in_state = 0;
    }
}
