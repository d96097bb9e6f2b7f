//! Stateless helpers for conditioning synthesized audio before playback:
//! sample-rate inference from HTTP metadata, linear-interpolation
//! downsampling, and saturating gain.

use std::collections::HashMap;

use crate::error::PlaybackError;
use crate::BYTES_PER_SAMPLE;

/// Header keys that advertise the PCM sample rate, in priority order.
const SAMPLE_RATE_HEADER_KEYS: [&str; 4] = [
    "x-audio-sample-rate",
    "x-sample-rate",
    "sample-rate",
    "samplerate",
];

/// Infer the sample rate advertised by a synthesis response.
///
/// Header keys are matched case-insensitively; failing that, `rate=` /
/// `samplerate=` parameters of the content type are consulted. Returns
/// `None` when nothing usable is present.
pub fn infer_sample_rate(
    headers: &HashMap<String, String>,
    content_type: Option<&str>,
) -> Option<u32> {
    for key in SAMPLE_RATE_HEADER_KEYS {
        let value = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v);
        if let Some(value) = value {
            if let Ok(rate) = value.trim().parse::<u32>() {
                return Some(rate);
            }
        }
    }
    let content_type = content_type?;
    for part in content_type.split(';') {
        if let Some((name, value)) = part.split_once('=') {
            let name = name.trim().to_ascii_lowercase();
            if name == "rate" || name == "samplerate" {
                if let Ok(rate) = value.trim().parse::<u32>() {
                    return Some(rate);
                }
            }
        }
    }
    None
}

/// Downsample little-endian s16 PCM via linear interpolation.
///
/// A no-op when the rates match (or `target_rate` is zero). Upsampling is
/// rejected; callers must pre-negotiate a playback rate at or below the
/// source rate.
pub fn downsample_linear(
    pcm: &[u8],
    src_rate: u32,
    target_rate: u32,
) -> Result<(Vec<u8>, u32), PlaybackError> {
    if target_rate == 0 || src_rate == target_rate {
        return Ok((pcm.to_vec(), src_rate));
    }
    if target_rate > src_rate {
        return Err(PlaybackError::UpsamplingUnsupported {
            src: src_rate,
            target: target_rate,
        });
    }

    let samples = decode_samples(pcm);
    let ratio = src_rate as f64 / target_rate as f64;
    let target_len = ((samples.len() as f64 / ratio) as usize).max(1);
    let mut out = Vec::with_capacity(target_len * BYTES_PER_SAMPLE);
    for i in 0..target_len {
        let src_index = i as f64 * ratio;
        let left = src_index.floor() as usize;
        let right = (left + 1).min(samples.len().saturating_sub(1));
        let frac = src_index - left as f64;
        let value = if right == left || samples.is_empty() {
            samples.get(left).copied().unwrap_or(0) as f64
        } else {
            samples[left] as f64 + (samples[right] as f64 - samples[left] as f64) * frac
        };
        let sample = value.round().clamp(-32768.0, 32767.0) as i16;
        out.extend_from_slice(&sample.to_le_bytes());
    }
    Ok((out, target_rate))
}

/// Apply a dB gain (`10^(dB/20)`) with saturation to the i16 range.
pub fn apply_gain_db(pcm: &[u8], gain_db: f64) -> Vec<u8> {
    if pcm.is_empty() || gain_db == 0.0 {
        return pcm.to_vec();
    }
    let factor = 10f64.powf(gain_db / 20.0);
    let mut out = Vec::with_capacity(pcm.len());
    for pair in pcm.chunks_exact(BYTES_PER_SAMPLE) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]) as f64;
        let amplified = (sample * factor).round().clamp(-32768.0, 32767.0) as i16;
        out.extend_from_slice(&amplified.to_le_bytes());
    }
    out
}

/// Mean of absolute sample amplitudes; 0.0 for empty input.
pub fn mean_abs_amplitude(pcm: &[u8]) -> f64 {
    let samples = decode_samples(pcm);
    if samples.is_empty() {
        return 0.0;
    }
    let total: f64 = samples.iter().map(|&s| (s as f64).abs()).sum();
    total / samples.len() as f64
}

fn decode_samples(pcm: &[u8]) -> Vec<i16> {
    pcm.chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}
