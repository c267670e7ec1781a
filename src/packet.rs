// Copyright 2025 Au-Zone Technologies Inc.
// SPDX-License-Identifier: Apache-2.0

//! SHTP packet codec.
//!
//! Every frame starts with a 4-byte header:
//!
//! ```text
//! Byte 0-1: length including header, little-endian
//!           bit 15 set on continuation fragments
//! Byte 2:   channel (0-5)
//! Byte 3:   sequence number, per channel and direction
//! ```
//!
//! Cargo larger than one frame is split into fragments. Each fragment declares
//! the cargo still outstanding (its own bytes included) and carries its own
//! sequence number. [`Reassembler`] rebuilds the cargo per channel.

use crate::{
    constants::{
        CONTINUATION_FLAG, LENGTH_MASK, NUM_CHANNELS, PACKET_HEADER_LENGTH, PACKET_RECV_BUF_LEN,
    },
    error::{Error, FramingError},
};
use log::{debug, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// SHTP logical channel. Each owns its own sequence counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Channel {
    Command = 0,
    Executable = 1,
    HubControl = 2,
    SensorReports = 3,
    WakeReports = 4,
    GyroRotation = 5,
}

impl Channel {
    pub const ALL: [Channel; NUM_CHANNELS] = [
        Channel::Command,
        Channel::Executable,
        Channel::HubControl,
        Channel::SensorReports,
        Channel::WakeReports,
        Channel::GyroRotation,
    ];

    pub fn index(self) -> usize {
        u8::from(self) as usize
    }

    /// Channels carrying sensor input reports with the timestamp prefix
    pub fn is_input_reports(self) -> bool {
        matches!(self, Channel::SensorReports | Channel::WakeReports)
    }
}

/// A single frame, or a complete cargo once reassembled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub channel: Channel,
    pub sequence: u8,
    pub continuation: bool,
    /// Value of the length field: cargo outstanding including this header
    pub declared_len: usize,
    pub payload: Vec<u8>,
}

impl Packet {
    /// First payload byte, the report id on most channels
    pub fn report_id(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// Is the full cargo present in this frame
    pub fn is_complete(&self) -> bool {
        !self.continuation && self.declared_len == self.payload.len() + PACKET_HEADER_LENGTH
    }
}

fn parse_header(bytes: &[u8]) -> Result<(usize, bool, u8, u8), FramingError> {
    if bytes.len() < PACKET_HEADER_LENGTH {
        return Err(FramingError::TooShort(bytes.len()));
    }
    let raw = u16::from_le_bytes([bytes[0], bytes[1]]);
    Ok((
        (raw & LENGTH_MASK) as usize,
        raw & CONTINUATION_FLAG != 0,
        bytes[2],
        bytes[3],
    ))
}

/// Length of the frame at the start of `bytes`, 0 when the hub had nothing
/// to send.
pub fn peek_length(bytes: &[u8]) -> usize {
    match parse_header(bytes) {
        Ok((len, ..)) => len,
        Err(_) => 0,
    }
}

fn frame_header(len: usize, continuation: bool, channel: Channel, sequence: u8) -> [u8; 4] {
    let mut raw = len as u16 & LENGTH_MASK;
    if continuation {
        raw |= CONTINUATION_FLAG;
    }
    let [lsb, msb] = raw.to_le_bytes();
    [lsb, msb, channel.into(), sequence]
}

/// Frame `payload` for `channel`.
///
/// Returns one frame when the cargo fits in `max_frame` bytes, otherwise
/// fragments whose sequence numbers follow on from `sequence`.
pub fn encode(
    channel: Channel,
    sequence: u8,
    payload: &[u8],
    max_frame: usize,
) -> Result<Vec<Vec<u8>>, FramingError> {
    let total = payload.len() + PACKET_HEADER_LENGTH;
    if total > LENGTH_MASK as usize || max_frame <= PACKET_HEADER_LENGTH {
        return Err(FramingError::PayloadTooLarge {
            len: payload.len(),
            max: LENGTH_MASK as usize - PACKET_HEADER_LENGTH,
        });
    }

    let chunk = max_frame - PACKET_HEADER_LENGTH;
    let mut frames = Vec::with_capacity(payload.len() / chunk + 1);
    let mut offset = 0;
    let mut seq = sequence;
    loop {
        let remaining = payload.len() - offset;
        let take = remaining.min(chunk);
        let mut frame = Vec::with_capacity(take + PACKET_HEADER_LENGTH);
        frame.extend_from_slice(&frame_header(
            remaining + PACKET_HEADER_LENGTH,
            offset > 0,
            channel,
            seq,
        ));
        frame.extend_from_slice(&payload[offset..offset + take]);
        frames.push(frame);

        offset += take;
        seq = seq.wrapping_add(1);
        if offset >= payload.len() {
            break;
        }
    }
    Ok(frames)
}

/// Decode one complete frame. The declared length must match the bytes given.
pub fn decode(bytes: &[u8]) -> Result<Packet, FramingError> {
    match decode_frame(bytes, bytes.len())? {
        Some(packet) if packet.declared_len == bytes.len() => Ok(packet),
        Some(packet) => Err(FramingError::LengthMismatch {
            declared: packet.declared_len,
            received: bytes.len(),
        }),
        None => Err(FramingError::TooShort(0)),
    }
}

/// Decode the frame received by one bus exchange.
///
/// `capacity` is the exchange size; a frame declaring more bytes than that is
/// accepted as the leading part of a larger cargo. Returns `None` for an idle
/// (zero length) header.
pub fn decode_frame(bytes: &[u8], capacity: usize) -> Result<Option<Packet>, FramingError> {
    let (declared, continuation, channel, sequence) = parse_header(bytes)?;
    if declared == 0 {
        return Ok(None);
    }
    if declared < PACKET_HEADER_LENGTH {
        return Err(FramingError::TooShort(declared));
    }
    let channel = Channel::try_from(channel).map_err(|e| FramingError::InvalidChannel(e.number))?;

    let truncated = declared > bytes.len() && bytes.len() == capacity;
    if declared != bytes.len() && !truncated {
        return Err(FramingError::LengthMismatch {
            declared,
            received: bytes.len(),
        });
    }

    Ok(Some(Packet {
        channel,
        sequence,
        continuation,
        declared_len: declared,
        payload: bytes[PACKET_HEADER_LENGTH..].to_vec(),
    }))
}

struct Partial {
    sequence: u8,
    payload: Vec<u8>,
    remaining: usize,
}

/// Rebuilds fragmented cargo, one slot per channel
pub struct Reassembler {
    max_cargo: usize,
    partial: [Option<Partial>; NUM_CHANNELS],
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(PACKET_RECV_BUF_LEN)
    }
}

impl Reassembler {
    pub fn new(max_cargo: usize) -> Self {
        Self {
            max_cargo,
            partial: Default::default(),
        }
    }

    /// Feed one frame. Returns the full cargo once its last fragment arrives.
    pub fn push(&mut self, frame: Packet) -> Result<Option<Packet>, FramingError> {
        let idx = frame.channel.index();
        let carried = frame.payload.len();
        let declared = frame.declared_len - PACKET_HEADER_LENGTH;

        if !frame.continuation {
            if self.partial[idx].take().is_some() {
                warn!("{:?}: new cargo before previous one completed", frame.channel);
            }
            if declared == carried {
                return Ok(Some(frame));
            }
            if declared > self.max_cargo {
                return Err(FramingError::ReassemblyOverflow(self.max_cargo));
            }
            debug!(
                "{:?}: fragmented cargo of {} bytes, {} received",
                frame.channel, declared, carried
            );
            let mut payload = Vec::with_capacity(declared);
            payload.extend_from_slice(&frame.payload);
            self.partial[idx] = Some(Partial {
                sequence: frame.sequence,
                payload,
                remaining: declared - carried,
            });
            return Ok(None);
        }

        let Some(mut partial) = self.partial[idx].take() else {
            return Err(FramingError::OrphanContinuation(frame.channel));
        };
        if declared != partial.remaining || carried > partial.remaining {
            return Err(FramingError::LengthMismatch {
                declared,
                received: partial.remaining,
            });
        }
        partial.payload.extend_from_slice(&frame.payload);
        partial.remaining -= carried;
        if partial.remaining > 0 {
            self.partial[idx] = Some(partial);
            return Ok(None);
        }

        Ok(Some(Packet {
            channel: frame.channel,
            sequence: partial.sequence,
            continuation: false,
            declared_len: partial.payload.len() + PACKET_HEADER_LENGTH,
            payload: partial.payload,
        }))
    }

    pub fn clear(&mut self) {
        self.partial = Default::default();
    }
}

/// Tracks inbound sequence numbers per channel
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: [Option<u8>; NUM_CHANNELS],
}

impl SequenceTracker {
    /// Accept `sequence` if it moves the channel forward.
    ///
    /// Forward distances up to half the wrap width are accepted; the number
    /// of skipped sequence numbers is returned. Anything else is a duplicate
    /// or a regression and leaves the tracker unchanged.
    pub fn check(&mut self, channel: Channel, sequence: u8) -> Result<u8, Error> {
        let slot = &mut self.last[channel.index()];
        let Some(last) = *slot else {
            *slot = Some(sequence);
            return Ok(0);
        };
        let distance = sequence.wrapping_sub(last);
        if distance == 0 || distance >= 0x80 {
            return Err(Error::Sequence {
                channel,
                expected: last.wrapping_add(1),
                received: sequence,
            });
        }
        *slot = Some(sequence);
        Ok(distance - 1)
    }

    pub fn reset(&mut self) {
        self.last = [None; NUM_CHANNELS];
    }
}
