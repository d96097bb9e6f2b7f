use std::time::Duration;

use thiserror::Error;

/// Failures raised by the serial bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Expected data did not arrive in time. Callers decide whether to retry.
    #[error("serial read timed out after {0:?}")]
    SerialTimeout(Duration),

    /// Frame magic matched but version/type/length were invalid. Fatal for
    /// the session: continuing would risk desyncing into audio payloads.
    #[error("malformed audio frame header: {}", hex_preview(.header))]
    MalformedAudioHeader { header: Vec<u8> },

    #[error("playback sample rate must be positive")]
    InvalidPlaybackRate,

    #[error(transparent)]
    Serial(#[from] serialport::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn hex_preview(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Invalid constructor input. Fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("sample_rate must be one of 8000, 16000, 32000, 48000 (got {0})")]
    UnsupportedSampleRate(u32),

    #[error("frame_ms must be 10, 20, or 30 (got {0})")]
    UnsupportedFrameDuration(u32),

    #[error("aggressiveness must be between 0 and 3 (got {0})")]
    AggressivenessOutOfRange(u8),

    #[error("{field} must be >= 1")]
    TriggerTooSmall { field: &'static str },

    #[error("{field} must be positive")]
    NonPositive { field: &'static str },
}

/// Failures while conditioning synthesized audio for playback.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlaybackError {
    /// Callers must pre-negotiate a playback rate at or below the source
    /// rate; interpolating samples upward is not supported.
    #[error("upsampling from {src} Hz to {target} Hz is not supported")]
    UpsamplingUnsupported { src: u32, target: u32 },
}

/// Errors that terminate the controller loop. Soft conditions (discarded
/// segments, stage failures) end the turn and are journaled instead.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_header_formats_as_hex() {
        let err = BridgeError::MalformedAudioHeader {
            header: vec![0x41, 0x55, 0x44, 0x30],
        };
        assert!(err.to_string().contains("41554430"));
    }

    #[test]
    fn config_errors_name_the_field() {
        let err = ConfigError::TriggerTooSmall {
            field: "start_trigger_frames",
        };
        assert!(err.to_string().contains("start_trigger_frames"));
    }
}
