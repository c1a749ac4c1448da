// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! PCM16 helpers shared by the VAD and the transport.

/// Normalized RMS volume of PCM16 little-endian audio, in [0.0, 1.0].
pub fn calculate_rms(audio: &[u8]) -> f64 {
    let num_samples = audio.len() / 2;
    if num_samples == 0 {
        return 0.0;
    }

    let mut sum_squares = 0.0f64;
    for chunk in audio.chunks_exact(2) {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]) as f64;
        sum_squares += sample * sample;
    }

    let rms = (sum_squares / num_samples as f64).sqrt();
    (rms / i16::MAX as f64).clamp(0.0, 1.0)
}

/// Exponential smoothing: weight `factor` on the new value, the rest on the
/// previous smoothed value.
pub fn exp_smoothing(value: f64, prev_value: f64, factor: f64) -> f64 {
    prev_value + factor * (value - prev_value)
}
