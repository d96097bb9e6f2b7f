//! Codec for the interleaved text/binary serial framing.
//!
//! Two frame shapes share one byte stream: ASCII lines terminated by `\n`
//! (banners, presence telemetry, firmware logs) and binary audio frames with
//! a fixed 12-byte header. The parser works over an append-only receive
//! buffer and is guaranteed to make forward progress on corrupt input: it
//! either emits a frame, signals a malformed header (dropping the magic), or
//! drops a single byte to resynchronize.

/// Frame magic, little-endian `"AUD0"`.
pub const FRAME_MAGIC: u32 = 0x3044_5541;
/// Only protocol version understood by this host.
pub const FRAME_VERSION: u8 = 1;
/// Frame type carrying raw PCM.
pub const FRAME_TYPE_AUDIO: u8 = 1;
/// Header size: magic(4) + version(1) + type(1) + reserved(2) + length(4).
pub const HEADER_LEN: usize = 12;
/// Upper bound on a single payload; anything larger is a corrupt header.
pub const MAX_PAYLOAD_LEN: usize = 4_000_000;

/// One parsed frame, or a resynchronization signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// An ASCII line, newline (and any trailing `\r`) stripped.
    Text(String),
    /// Raw little-endian s16 PCM payload.
    Audio(Vec<u8>),
    /// Magic matched but version/type/length were invalid. The codec has
    /// already dropped the 4 magic bytes and will keep scanning.
    MalformedHeader { header: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MagicStatus {
    /// The first four bytes are the magic.
    Match,
    /// The buffered prefix can no longer become the magic.
    Mismatch,
    /// Fewer than four bytes buffered, all consistent with the magic so far.
    NeedMore,
}

/// Incremental parser over an append-only receive buffer.
#[derive(Debug, Default)]
pub struct FrameCodec {
    buf: Vec<u8>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly received bytes.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered, not-yet-consumed bytes.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop all buffered bytes (used when the input stream is flushed).
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Whether a valid audio header is buffered and the codec is still
    /// waiting for the rest of its payload. Callers use this to tell a quiet
    /// wire from a stalled frame.
    pub fn awaiting_audio_payload(&self) -> bool {
        let magic = FRAME_MAGIC.to_le_bytes();
        if self.buf.len() < 4 || self.buf[..4] != magic {
            return false;
        }
        if self.buf.len() < HEADER_LEN {
            return true;
        }
        let payload_len =
            u32::from_le_bytes([self.buf[8], self.buf[9], self.buf[10], self.buf[11]]) as usize;
        let valid = self.buf[4] == FRAME_VERSION
            && self.buf[5] == FRAME_TYPE_AUDIO
            && payload_len <= MAX_PAYLOAD_LEN;
        valid && self.buf.len() < HEADER_LEN + payload_len
    }

    /// Pull the next complete frame out of the buffer, if any.
    ///
    /// Returns `None` when more input is needed. A text line is only
    /// consumed when its newline precedes a complete candidate audio header,
    /// so a log line can never be misparsed as audio and vice versa.
    pub fn next_event(&mut self) -> Option<FrameEvent> {
        loop {
            let newline = self.buf.iter().position(|&b| b == b'\n');
            let magic = self.magic_status();

            if let Some(nl) = newline {
                if self.buf.len() < HEADER_LEN || magic != MagicStatus::Match {
                    return Some(self.take_text_line(nl));
                }
            }

            match magic {
                MagicStatus::Match => {
                    if self.buf.len() < HEADER_LEN {
                        return None;
                    }
                    let version = self.buf[4];
                    let frame_type = self.buf[5];
                    let payload_len = u32::from_le_bytes([
                        self.buf[8],
                        self.buf[9],
                        self.buf[10],
                        self.buf[11],
                    ]) as usize;

                    if version != FRAME_VERSION
                        || frame_type != FRAME_TYPE_AUDIO
                        || payload_len > MAX_PAYLOAD_LEN
                    {
                        let header = self.buf[..HEADER_LEN].to_vec();
                        self.buf.drain(..4);
                        return Some(FrameEvent::MalformedHeader { header });
                    }

                    if self.buf.len() < HEADER_LEN + payload_len {
                        return None;
                    }
                    self.buf.drain(..HEADER_LEN);
                    let payload: Vec<u8> = self.buf.drain(..payload_len).collect();
                    return Some(FrameEvent::Audio(payload));
                }
                MagicStatus::Mismatch => {
                    // No newline in the buffer (handled above), so drop one
                    // byte and rescan.
                    self.buf.drain(..1);
                    if self.buf.is_empty() {
                        return None;
                    }
                }
                MagicStatus::NeedMore => return None,
            }
        }
    }

    fn magic_status(&self) -> MagicStatus {
        let magic = FRAME_MAGIC.to_le_bytes();
        let prefix_len = self.buf.len().min(4);
        if self.buf[..prefix_len] != magic[..prefix_len] {
            return MagicStatus::Mismatch;
        }
        if prefix_len < 4 {
            MagicStatus::NeedMore
        } else {
            MagicStatus::Match
        }
    }

    fn take_text_line(&mut self, newline_at: usize) -> FrameEvent {
        let mut line: Vec<u8> = self.buf.drain(..=newline_at).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        FrameEvent::Text(String::from_utf8_lossy(&line).into_owned())
    }
}

/// Encode a PCM payload as a wire-ready audio frame.
pub fn encode_audio_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    frame.push(FRAME_VERSION);
    frame.push(FRAME_TYPE_AUDIO);
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}
