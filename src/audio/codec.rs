// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! ITU-T G.711 mu-law codec and linear resampling for the telephony wire.
//!
//! Telephony calls carry 8 kHz 8-bit mu-law audio; the pipeline works on
//! 16-bit linear PCM at the session sample rate. The transport converts in
//! both directions with these functions.

/// Bias added before mu-law compression (ITU-T G.711).
const MULAW_BIAS: i32 = 0x84;
/// Maximum linear magnitude before clipping.
const MULAW_CLIP: i32 = 32635;

/// Encode a single 16-bit linear PCM sample to mu-law.
pub fn linear_to_mulaw(sample: i16) -> u8 {
    let sign: i32 = if sample < 0 { 0x80 } else { 0x00 };
    let mut magnitude = (sample as i32).abs();

    if magnitude > MULAW_CLIP {
        magnitude = MULAW_CLIP;
    }
    magnitude += MULAW_BIAS;

    // Segment (exponent) search from the top bit down.
    let mut exponent: i32 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (magnitude & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }

    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Decode a single mu-law byte to a 16-bit linear PCM sample.
pub fn mulaw_to_linear(mulaw_byte: u8) -> i16 {
    let complement = !mulaw_byte as i32;
    let sign = complement & 0x80;
    let exponent = (complement >> 4) & 0x07;
    let mantissa = complement & 0x0F;

    let mut magnitude = ((mantissa << 1) | 0x21) << (exponent + 2);
    magnitude -= MULAW_BIAS;

    if sign == 0x80 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Decode a mu-law buffer to PCM16 little-endian bytes.
pub fn mulaw_to_pcm(mulaw_data: &[u8]) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(mulaw_data.len().saturating_mul(2));
    for &byte in mulaw_data {
        pcm.extend_from_slice(&mulaw_to_linear(byte).to_le_bytes());
    }
    pcm
}

/// Encode PCM16 little-endian bytes to mu-law. An odd trailing byte is
/// ignored.
pub fn pcm_to_mulaw(pcm_data: &[u8]) -> Vec<u8> {
    if pcm_data.len() % 2 != 0 {
        tracing::warn!(
            len = pcm_data.len(),
            "odd-length PCM input, trailing byte ignored"
        );
    }
    let mut mulaw = Vec::with_capacity(pcm_data.len() / 2);
    for chunk in pcm_data.chunks_exact(2) {
        mulaw.push(linear_to_mulaw(i16::from_le_bytes([chunk[0], chunk[1]])));
    }
    mulaw
}

/// Resample PCM16 little-endian bytes between rates by linear interpolation.
///
/// Returns the input unchanged when the rates match or the buffer holds
/// fewer than two samples.
pub fn resample_linear(pcm_data: &[u8], from_rate: u32, to_rate: u32) -> Vec<u8> {
    if from_rate == to_rate || pcm_data.len() < 4 {
        return pcm_data.to_vec();
    }

    let input: Vec<i16> = pcm_data
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect();

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = ((input.len() as f64) / ratio).ceil() as usize;

    let mut output = Vec::with_capacity(output_len.saturating_mul(2));
    for i in 0..output_len {
        let src_pos = i as f64 * ratio;
        let src_idx = src_pos.floor() as usize;
        let frac = src_pos - src_idx as f64;

        let sample = if src_idx + 1 < input.len() {
            let s0 = input[src_idx] as f64;
            let s1 = input[src_idx + 1] as f64;
            (s0 + frac * (s1 - s0)) as i16
        } else {
            input[input.len() - 1]
        };
        output.extend_from_slice(&sample.to_le_bytes());
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mulaw_roundtrip_within_companding_error() {
        for sample in [-32000i16, -1000, -100, 0, 100, 1000, 32000] {
            let decoded = mulaw_to_linear(linear_to_mulaw(sample));
            let error = (sample as i32 - decoded as i32).unsigned_abs();
            assert!(
                error < 1000 || (error as f64 / sample.unsigned_abs() as f64) < 0.05,
                "sample={sample}, decoded={decoded}, error={error}"
            );
        }
    }

    #[test]
    fn mulaw_silence_stays_near_zero() {
        let decoded = mulaw_to_linear(linear_to_mulaw(0));
        assert!(decoded.unsigned_abs() < 50, "silence decoded to {decoded}");
    }

    #[test]
    fn buffer_encode_decode_lengths() {
        let pcm = vec![0u8, 0, 0xFF, 0x7F];
        let mulaw = pcm_to_mulaw(&pcm);
        assert_eq!(mulaw.len(), 2);
        assert_eq!(mulaw_to_pcm(&mulaw).len(), 4);
    }

    #[test]
    fn resample_same_rate_is_identity() {
        let data = vec![0u8, 1, 2, 3];
        assert_eq!(resample_linear(&data, 8000, 8000), data);
    }

    #[test]
    fn resample_doubles_sample_count() {
        let data: Vec<u8> = [100i16, 200, 300, 400]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let result = resample_linear(&data, 8000, 16000);
        assert_eq!(result.len() / 2, 8);
    }

    #[test]
    fn resample_halves_sample_count() {
        let data: Vec<u8> = [100i16, 200, 300, 400, 500, 600]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let result = resample_linear(&data, 16000, 8000);
        assert_eq!(result.len() / 2, 3);
    }

    #[test]
    fn resample_empty_is_empty() {
        assert!(resample_linear(&[], 8000, 16000).is_empty());
    }
}
