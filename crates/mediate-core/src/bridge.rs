//! Serial bridge to the embedded audio device.
//!
//! Owns the serial port exclusively: demultiplexes the incoming frame stream
//! through [`FrameCodec`], tracks presence telemetry, issues the text control
//! commands (`PAUSE`, `RESUME`, `PRESENCE?`, `START`, `END`), and drives
//! paced playback so the device's small ring buffer cannot overflow.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::frame::{FrameCodec, FrameEvent};
use crate::types::Presence;
use crate::BYTES_PER_SAMPLE;

/// Default line rate of the device firmware.
pub const DEFAULT_BAUD: u32 = 921_600;
/// Timeout of each underlying serial read.
pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(200);

const STREAM_CHUNK_BYTES: usize = 1024;
const READY_BANNER_TIMEOUT: Duration = Duration::from_secs(5);
const PRESENCE_REPLY_TIMEOUT: Duration = Duration::from_millis(1500);
const HIGH_PASS_CUTOFF_HZ: f64 = 250.0;

/// Transport under the bridge. Lets tests script the wire; production code
/// uses the blanket impl for an open [`serialport::SerialPort`].
pub trait SerialIo: Read + Write + Send {
    /// Discard any bytes buffered on the receive side.
    fn clear_input(&mut self) -> Result<(), BridgeError>;
}

impl SerialIo for Box<dyn SerialPort> {
    fn clear_input(&mut self) -> Result<(), BridgeError> {
        self.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

/// What the turn controller needs from a bridge. [`SerialBridge`] is the
/// production implementation.
pub trait AudioBridge {
    /// Next audio payload within `timeout`, or `None` on timeout. Non-audio
    /// frames seen while waiting are consumed for their side effects.
    fn read_audio_chunk(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, BridgeError>;

    fn pause_capture(&mut self) -> Result<(), BridgeError>;
    fn resume_capture(&mut self) -> Result<(), BridgeError>;
    fn flush_input(&mut self) -> Result<(), BridgeError>;

    /// Stream mono s16 PCM to the device speakers, paced to real time.
    fn play_pcm(&mut self, pcm: &[u8], sample_rate: u32) -> Result<(), BridgeError>;

    fn presence(&self) -> Presence;

    /// Service the wire briefly so presence telemetry keeps flowing; any
    /// audio observed is discarded.
    fn poll_presence(&mut self, timeout: Duration) -> Result<(), BridgeError>;
}

/// High-level helper to interact with the device firmware.
pub struct SerialBridge<P: SerialIo> {
    port: P,
    codec: FrameCodec,
    capture_paused: bool,
    presence: Presence,
    high_pass_playback: bool,
}

impl SerialBridge<Box<dyn SerialPort>> {
    /// Open the port and run the startup protocol.
    pub fn open(path: &str, baud: u32, high_pass_playback: bool) -> Result<Self, BridgeError> {
        let port = serialport::new(path, baud)
            .timeout(SERIAL_READ_TIMEOUT)
            .open()?;
        info!("serial port {path} open at {baud} baud");
        let mut bridge = Self::from_port(port, high_pass_playback);
        bridge.startup_handshake()?;
        Ok(bridge)
    }
}

impl<P: SerialIo> SerialBridge<P> {
    /// Wrap an already-open transport. The handshake is not run.
    pub fn from_port(port: P, high_pass_playback: bool) -> Self {
        Self {
            port,
            codec: FrameCodec::new(),
            capture_paused: false,
            presence: Presence::Unknown,
            high_pass_playback,
        }
    }

    /// Startup protocol: wait for the optional `READY` banner, pause the
    /// capture stream, drain stale input, ask for presence, then resume.
    pub fn startup_handshake(&mut self) -> Result<(), BridgeError> {
        if self.wait_for_line("READY", READY_BANNER_TIMEOUT)? {
            debug!("device reported READY");
        } else {
            debug!("no READY banner; continuing");
        }
        self.write_line("PAUSE")?;
        self.capture_paused = true;
        self.flush_input()?;
        self.write_line("PRESENCE?")?;
        if !self.wait_for_presence(PRESENCE_REPLY_TIMEOUT)? {
            debug!("no presence reply; leaving presence unknown");
        }
        self.write_line("RESUME")?;
        self.capture_paused = false;
        Ok(())
    }

    /// Send one text command line, flushed immediately.
    pub fn write_line(&mut self, line: &str) -> Result<(), BridgeError> {
        debug!("=> {line}");
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\n")?;
        self.port.flush()?;
        Ok(())
    }

    fn wait_for_line(&mut self, expected: &str, timeout: Duration) -> Result<bool, BridgeError> {
        let deadline = Instant::now() + timeout;
        loop {
            while let Some(event) = self.codec.next_event() {
                match event {
                    FrameEvent::Text(line) => {
                        let seen = line.trim() == expected;
                        self.handle_text_line(&line);
                        if seen {
                            return Ok(true);
                        }
                    }
                    FrameEvent::Audio(_) => {} // stale capture data, drop
                    FrameEvent::MalformedHeader { header } => {
                        return Err(BridgeError::MalformedAudioHeader { header });
                    }
                }
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            self.fill()?;
        }
    }

    fn wait_for_presence(&mut self, timeout: Duration) -> Result<bool, BridgeError> {
        let deadline = Instant::now() + timeout;
        loop {
            while let Some(event) = self.codec.next_event() {
                match event {
                    FrameEvent::Text(line) => {
                        self.handle_text_line(&line);
                        if self.presence != Presence::Unknown {
                            return Ok(true);
                        }
                    }
                    FrameEvent::Audio(_) => {}
                    FrameEvent::MalformedHeader { header } => {
                        return Err(BridgeError::MalformedAudioHeader { header });
                    }
                }
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            self.fill()?;
        }
    }

    fn handle_text_line(&mut self, line: &str) {
        match line.trim() {
            "PRESENCE ON" => {
                if self.presence != Presence::Active {
                    info!("presence: active");
                }
                self.presence = Presence::Active;
            }
            "PRESENCE OFF" => {
                if self.presence != Presence::Idle {
                    info!("presence: idle");
                }
                self.presence = Presence::Idle;
            }
            "READY" => debug!("<= READY"),
            "" => {}
            other => debug!("<= {other}"),
        }
    }

    /// Pull whatever the port has ready into the codec.
    fn fill(&mut self) -> Result<usize, BridgeError> {
        let mut scratch = [0u8; 4096];
        match self.port.read(&mut scratch) {
            Ok(n) => {
                self.codec.push_bytes(&scratch[..n]);
                Ok(n)
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::TimedOut
                    || err.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(0)
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl<P: SerialIo> AudioBridge for SerialBridge<P> {
    fn read_audio_chunk(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, BridgeError> {
        let deadline = Instant::now() + timeout;
        loop {
            while let Some(event) = self.codec.next_event() {
                match event {
                    FrameEvent::Text(line) => self.handle_text_line(&line),
                    FrameEvent::Audio(payload) => return Ok(Some(payload)),
                    FrameEvent::MalformedHeader { header } => {
                        return Err(BridgeError::MalformedAudioHeader { header });
                    }
                }
            }
            if Instant::now() >= deadline {
                // A quiet wire is a normal timeout; a half-received frame
                // means the stream stalled mid-payload.
                if self.codec.awaiting_audio_payload() {
                    return Err(BridgeError::SerialTimeout(timeout));
                }
                return Ok(None);
            }
            self.fill()?;
        }
    }

    fn pause_capture(&mut self) -> Result<(), BridgeError> {
        if self.capture_paused {
            return Ok(());
        }
        self.write_line("PAUSE")?;
        self.capture_paused = true;
        Ok(())
    }

    fn resume_capture(&mut self) -> Result<(), BridgeError> {
        if !self.capture_paused {
            return Ok(());
        }
        self.write_line("RESUME")?;
        self.capture_paused = false;
        Ok(())
    }

    fn flush_input(&mut self) -> Result<(), BridgeError> {
        self.codec.clear();
        self.port.clear_input()
    }

    fn play_pcm(&mut self, pcm: &[u8], sample_rate: u32) -> Result<(), BridgeError> {
        if sample_rate == 0 {
            return Err(BridgeError::InvalidPlaybackRate);
        }
        let sample_count = pcm.len() / BYTES_PER_SAMPLE;
        self.write_line(&format!("START {sample_rate} 1 16 {sample_count}"))?;

        // Filter state spans the whole playback, fresh each call.
        let mut filter = self
            .high_pass_playback
            .then(|| DcBlocker::new(sample_rate));
        let bytes_per_sec = sample_rate as f64 * BYTES_PER_SAMPLE as f64;
        let mut next_deadline = Instant::now();

        for chunk in pcm.chunks(STREAM_CHUNK_BYTES) {
            let mut staged;
            let outgoing: &[u8] = match &mut filter {
                Some(filter) => {
                    staged = chunk.to_vec();
                    filter.process_in_place(&mut staged);
                    &staged
                }
                None => chunk,
            };
            self.port.write_all(outgoing)?;
            self.port.flush()?;

            next_deadline += Duration::from_secs_f64(chunk.len() as f64 / bytes_per_sec);
            let now = Instant::now();
            if next_deadline > now {
                std::thread::sleep(next_deadline - now);
            } else {
                // Fell behind the wire clock; do not burst to catch up.
                next_deadline = now;
            }
        }
        self.port.flush()?;
        self.write_line("END")
    }

    fn presence(&self) -> Presence {
        self.presence
    }

    fn poll_presence(&mut self, timeout: Duration) -> Result<(), BridgeError> {
        if let Some(chunk) = self.read_audio_chunk(timeout)? {
            if !self.capture_paused {
                warn!("discarding {} bytes of audio during presence poll", chunk.len());
            }
        }
        Ok(())
    }
}

/// First-order high-pass (~250 Hz) removing DC and low rumble from playback.
struct DcBlocker {
    alpha: f64,
    prev_in: f64,
    prev_out: f64,
}

impl DcBlocker {
    fn new(sample_rate: u32) -> Self {
        let rc = 1.0 / (2.0 * std::f64::consts::PI * HIGH_PASS_CUTOFF_HZ);
        let dt = 1.0 / sample_rate as f64;
        Self {
            alpha: rc / (rc + dt),
            prev_in: 0.0,
            prev_out: 0.0,
        }
    }

    fn process_in_place(&mut self, chunk: &mut [u8]) {
        for pair in chunk.chunks_exact_mut(BYTES_PER_SAMPLE) {
            let x = i16::from_le_bytes([pair[0], pair[1]]) as f64;
            let y = self.alpha * (self.prev_out + x - self.prev_in);
            self.prev_in = x;
            self.prev_out = y;
            let sample = y.round().clamp(-32768.0, 32767.0) as i16;
            pair.copy_from_slice(&sample.to_le_bytes());
        }
    }
}
