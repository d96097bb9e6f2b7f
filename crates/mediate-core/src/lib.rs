//! Session-controller core for the voice mediation bridge.
//!
//! The device streams microphone audio to the host over a serial link using
//! an interleaved text/binary framing. This crate owns the real-time side of
//! that conversation: parsing the frame stream, running an incremental voice
//! activity detector over the incoming PCM, and driving the capture → ASR →
//! rewrite → synthesis → playback turn loop. The ASR, LLM, and TTS engines
//! themselves live behind the capability traits in [`types`].

pub mod bridge;
pub mod controller;
pub mod error;
pub mod frame;
pub mod journal;
pub mod playback;
pub mod types;
pub mod vad;

pub use bridge::{AudioBridge, SerialBridge, SerialIo, DEFAULT_BAUD};
pub use controller::{SessionConfig, SessionController, TurnState};
pub use error::{BridgeError, ConfigError, ControllerError, PlaybackError};
pub use frame::{FrameCodec, FrameEvent};
pub use journal::Journal;
pub use types::{
    Presence, Rewriter, SynthesisChunk, SynthesisStream, Synthesizer, TranscriptionResult,
    Transcriber, TransformResult,
};
pub use vad::{SpeechSegment, SpeechStart, VadConfig, VadEvent, VadStream};

/// Bytes per mono sample everywhere in this pipeline (little-endian s16).
pub const BYTES_PER_SAMPLE: usize = 2;
