//! Telemetry frame decoding.
//!
//! The hand streams two EMG channel amplitudes at roughly 20 Hz. Each frame
//! is at least 4 bytes:
//! - Bytes 0-1: channel 1 amplitude (uint16_t big-endian)
//! - Bytes 2-3: channel 2 amplitude (uint16_t big-endian)
//!
//! Anything past byte 3 is ignored. Shorter frames are not an error: they
//! are a normal occurrence on a streaming transport.

use bytes::{Buf, BytesMut};
use tracing::trace;

/// Size of one telemetry frame in bytes.
pub const TELEMETRY_FRAME_SIZE: usize = 4;

/// One pair of channel readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TelemetrySample {
    /// Position of this sample in the link's telemetry sequence.
    pub sequence: u64,
    /// Channel 1 amplitude.
    pub channel_1: u16,
    /// Channel 2 amplitude.
    pub channel_2: u16,
}

impl TelemetrySample {
    /// Create a sample at sequence position zero.
    pub fn new(channel_1: u16, channel_2: u16) -> Self {
        Self {
            sequence: 0,
            channel_1,
            channel_2,
        }
    }

    /// The two readings as a tuple.
    pub fn channels(&self) -> (u16, u16) {
        (self.channel_1, self.channel_2)
    }

    /// The two readings as floating point amplitudes, for plotting.
    pub fn amplitudes(&self) -> (f64, f64) {
        (f64::from(self.channel_1), f64::from(self.channel_2))
    }

    fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }
}

/// Decode one telemetry frame.
///
/// Returns `None` when `data` is shorter than [`TELEMETRY_FRAME_SIZE`]. The
/// returned sample has sequence position zero; [`TelemetryDecoder`] assigns
/// positions.
pub fn decode(data: &[u8]) -> Option<TelemetrySample> {
    if data.len() < TELEMETRY_FRAME_SIZE {
        return None;
    }

    let channel_1 = u16::from_be_bytes([data[0], data[1]]);
    let channel_2 = u16::from_be_bytes([data[2], data[3]]);

    Some(TelemetrySample::new(channel_1, channel_2))
}

/// Build the wire bytes of a telemetry frame.
pub fn encode_telemetry_bytes(channel_1: u16, channel_2: u16) -> [u8; TELEMETRY_FRAME_SIZE] {
    let a = channel_1.to_be_bytes();
    let b = channel_2.to_be_bytes();
    [a[0], a[1], b[0], b[1]]
}

/// How inbound chunks map onto frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Each chunk is one frame (GATT notifications).
    Datagram,
    /// Chunks are arbitrary slices of a byte stream (RFCOMM sockets).
    Stream,
}

/// Stateful decoder for one link.
///
/// Stamps each decoded sample with a monotonically increasing sequence
/// position and, for stream framing, carries partial frames over to the
/// next chunk.
#[derive(Debug)]
pub struct TelemetryDecoder {
    framing: Framing,
    buffer: BytesMut,
    next_sequence: u64,
}

impl TelemetryDecoder {
    /// Create a decoder for the given framing.
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: BytesMut::with_capacity(TELEMETRY_FRAME_SIZE * 8),
            next_sequence: 0,
        }
    }

    /// The framing this decoder was created with.
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Number of samples produced so far.
    pub fn samples_decoded(&self) -> u64 {
        self.next_sequence
    }

    /// Feed one inbound chunk and collect the samples it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<TelemetrySample> {
        match self.framing {
            Framing::Datagram => match decode(chunk) {
                Some(sample) => vec![self.stamp(sample)],
                None => {
                    trace!("Ignoring short telemetry frame: {} bytes", chunk.len());
                    Vec::new()
                }
            },
            Framing::Stream => {
                self.buffer.extend_from_slice(chunk);

                let mut samples = Vec::with_capacity(self.buffer.len() / TELEMETRY_FRAME_SIZE);
                while self.buffer.len() >= TELEMETRY_FRAME_SIZE {
                    let channel_1 = self.buffer.get_u16();
                    let channel_2 = self.buffer.get_u16();
                    let sample = TelemetrySample::new(channel_1, channel_2);
                    samples.push(self.stamp(sample));
                }

                if !self.buffer.is_empty() {
                    trace!("Holding {} bytes of partial frame", self.buffer.len());
                }

                samples
            }
        }
    }

    /// Drop any partial frame and restart sequence numbering.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.next_sequence = 0;
    }

    fn stamp(&mut self, sample: TelemetrySample) -> TelemetrySample {
        let sample = sample.with_sequence(self.next_sequence);
        self.next_sequence += 1;
        sample
    }
}
