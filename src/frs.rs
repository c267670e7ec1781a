// Copyright 2025 Au-Zone Technologies Inc.
// SPDX-License-Identifier: Apache-2.0

//! Flash Record System transfers.
//!
//! Reads stream words back two at a time in FRS read responses; writes
//! push two words per write data request, each acknowledged by an FRS write
//! response before the next is sent. One transfer is active at a time.

use crate::{
    constants::{
        f32_to_q, frs_read_status_to_str, frs_status_to_str, q32_to_f32, FRS_READ_BLOCK_AND_RECORD_COMPLETE,
        FRS_READ_BLOCK_COMPLETE, FRS_READ_BUSY, FRS_READ_DEVICE_ERROR, FRS_READ_NO_ERROR,
        FRS_READ_OFFSET_OUT_OF_RANGE, FRS_READ_RECORD_COMPLETE, FRS_READ_RECORD_EMPTY,
        FRS_READ_UNRECOGNIZED_FRS_TYPE, FRS_STATUS_BUSY, FRS_STATUS_DATA_RECV_NOT_IN_WRITE_MODE,
        FRS_STATUS_DEVICE_ERROR, FRS_STATUS_INVALID_LENGTH, FRS_STATUS_READONLY,
        FRS_STATUS_RECORD_INVALID, FRS_STATUS_RECORD_VALID, FRS_STATUS_UNRECOGNIZED_FRS_TYPE,
        FRS_STATUS_WORD_RECEIVED, FRS_STATUS_WRITE_COMPLETE, FRS_STATUS_WRITE_FAILED,
        FRS_STATUS_WRITE_READY, FRS_WRITE_BURST_WORDS, SHUB_FRS_READ_REQ, SHUB_FRS_WRITE_DATA_REQ,
        SHUB_FRS_WRITE_REQ,
    },
    error::{FramingError, FrsError},
    reports::ReportParser,
};
use log::{debug, trace};

pub fn build_frs_read_request(record: u16, offset: u16, block_size: u16) -> [u8; 8] {
    let [o0, o1] = offset.to_le_bytes();
    let [r0, r1] = record.to_le_bytes();
    let [b0, b1] = block_size.to_le_bytes();
    [SHUB_FRS_READ_REQ, 0, o0, o1, r0, r1, b0, b1]
}

pub fn build_frs_write_request(length: u16, record: u16) -> [u8; 6] {
    let [l0, l1] = length.to_le_bytes();
    let [r0, r1] = record.to_le_bytes();
    [SHUB_FRS_WRITE_REQ, 0, l0, l1, r0, r1]
}

pub fn build_frs_write_data(offset: u16, word0: u32, word1: u32) -> [u8; 12] {
    let mut body = [0u8; 12];
    body[0] = SHUB_FRS_WRITE_DATA_REQ;
    body[2..4].copy_from_slice(&offset.to_le_bytes());
    body[4..8].copy_from_slice(&word0.to_le_bytes());
    body[8..12].copy_from_slice(&word1.to_le_bytes());
    body
}

/// Sensor orientation quaternion as the Q30 words of the system
/// orientation record
pub fn quaternion_to_frs_words(qi: f32, qj: f32, qk: f32, qr: f32) -> [u32; 4] {
    [qi, qj, qk, qr].map(|v| u32::from_le_bytes(f32_to_q(v, 30)))
}

/// FRS read response (0xF3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrsReadResponse {
    pub data_len: u8,
    pub status: u8,
    pub offset: u16,
    pub words: [u32; 2],
    pub record: u16,
}

impl FrsReadResponse {
    pub fn parse(msg: &[u8]) -> Result<Self, FramingError> {
        if msg.len() < 14 {
            return Err(FramingError::Truncated {
                report_id: msg.first().copied().unwrap_or(0),
                needed: 14,
                available: msg.len(),
            });
        }
        let mut cursor = 2;
        let offset = ReportParser::read_u16(msg, &mut cursor);
        let w0 = ReportParser::read_u32(msg, &mut cursor);
        let w1 = ReportParser::read_u32(msg, &mut cursor);
        let record = ReportParser::read_u16(msg, &mut cursor);
        Ok(Self {
            data_len: msg[1] >> 4,
            status: msg[1] & 0x0F,
            offset,
            words: [w0, w1],
            record,
        })
    }
}

/// FRS write response (0xF5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrsWriteResponse {
    pub status: u8,
    pub offset: u16,
}

impl FrsWriteResponse {
    pub fn parse(msg: &[u8]) -> Result<Self, FramingError> {
        if msg.len() < 4 {
            return Err(FramingError::Truncated {
                report_id: msg.first().copied().unwrap_or(0),
                needed: 4,
                available: msg.len(),
            });
        }
        Ok(Self {
            status: msg[1],
            offset: u16::from_le_bytes([msg[2], msg[3]]),
        })
    }
}

/// What the engine does next after a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrsStep {
    /// Keep waiting
    Pending,
    /// Queue this control payload and keep waiting
    Send(Vec<u8>),
    /// Transfer finished; words read (empty for writes)
    Done(Vec<u32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrsDirection {
    Read,
    Write,
}

/// State of one read or write
#[derive(Debug)]
pub struct FrsTransfer {
    record: u16,
    direction: FrsDirection,
    /// Next word offset expected (read) or to send (write)
    offset: u16,
    /// Words requested (read, 0 for the whole record) or to write
    total: u16,
    words: Vec<u32>,
    /// Offset of the write burst awaiting acknowledgment
    in_flight: Option<u16>,
}

impl FrsTransfer {
    /// Start a read of `count` words at `offset`, 0 reads to the end of the
    /// record. Returns the request payload to send.
    pub fn read(record: u16, offset: u16, count: u16) -> (Self, [u8; 8]) {
        let transfer = Self {
            record,
            direction: FrsDirection::Read,
            offset,
            total: count,
            words: Vec::with_capacity(count as usize),
            in_flight: None,
        };
        (transfer, build_frs_read_request(record, offset, count))
    }

    /// Start a write of `words`. An empty slice erases the record.
    pub fn write(record: u16, words: &[u32]) -> (Self, [u8; 6]) {
        let total = words.len().min(u16::MAX as usize) as u16;
        let transfer = Self {
            record,
            direction: FrsDirection::Write,
            offset: 0,
            total,
            words: words[..total as usize].to_vec(),
            in_flight: None,
        };
        (transfer, build_frs_write_request(total, record))
    }

    pub fn record(&self) -> u16 {
        self.record
    }

    pub fn direction(&self) -> FrsDirection {
        self.direction
    }

    /// Current word offset
    pub fn offset(&self) -> u16 {
        self.offset
    }

    pub fn on_read_response(&mut self, resp: &FrsReadResponse) -> Result<FrsStep, FrsError> {
        if self.direction != FrsDirection::Read {
            return Err(FrsError::Unexpected(resp.status));
        }
        trace!(
            "frs read 0x{:04X} @{}: {} ({} words)",
            resp.record,
            resp.offset,
            frs_read_status_to_str(resp.status),
            resp.data_len
        );
        match resp.status {
            FRS_READ_UNRECOGNIZED_FRS_TYPE => return Err(FrsError::InvalidRecord),
            FRS_READ_BUSY => return Err(FrsError::DeviceBusy),
            FRS_READ_OFFSET_OUT_OF_RANGE => return Err(FrsError::OffsetOutOfRange),
            FRS_READ_RECORD_EMPTY => return Err(FrsError::RecordEmpty),
            FRS_READ_DEVICE_ERROR => return Err(FrsError::DeviceError),
            FRS_READ_NO_ERROR
            | FRS_READ_RECORD_COMPLETE
            | FRS_READ_BLOCK_COMPLETE
            | FRS_READ_BLOCK_AND_RECORD_COMPLETE => {}
            other => return Err(FrsError::Unexpected(other)),
        }

        let data_len = (resp.data_len as usize).min(2);
        if data_len > 0 {
            if resp.offset != self.offset {
                return Err(FrsError::OffsetMismatch {
                    expected: self.offset,
                    received: resp.offset,
                });
            }
            let wanted = if self.total == 0 {
                data_len
            } else {
                data_len.min(self.total as usize - self.words.len())
            };
            self.words.extend_from_slice(&resp.words[..wanted]);
            self.offset = self.offset.wrapping_add(data_len as u16);
        }

        let count_reached = self.total > 0 && self.words.len() >= self.total as usize;
        let record_done = matches!(
            resp.status,
            FRS_READ_RECORD_COMPLETE | FRS_READ_BLOCK_AND_RECORD_COMPLETE
        );
        if count_reached || record_done {
            return Ok(FrsStep::Done(std::mem::take(&mut self.words)));
        }
        if resp.status == FRS_READ_BLOCK_COMPLETE {
            let remaining = if self.total == 0 {
                0
            } else {
                self.total - self.words.len() as u16
            };
            debug!(
                "frs read 0x{:04X}: block done, requesting more at {}",
                self.record, self.offset
            );
            return Ok(FrsStep::Send(
                build_frs_read_request(self.record, self.offset, remaining).to_vec(),
            ));
        }
        Ok(FrsStep::Pending)
    }

    fn next_burst(&mut self) -> FrsStep {
        let start = self.offset as usize;
        if start >= self.words.len() {
            return FrsStep::Pending;
        }
        let word0 = self.words[start];
        let word1 = self.words.get(start + 1).copied().unwrap_or(0);
        self.in_flight = Some(self.offset);
        FrsStep::Send(build_frs_write_data(self.offset, word0, word1).to_vec())
    }

    pub fn on_write_response(&mut self, resp: &FrsWriteResponse) -> Result<FrsStep, FrsError> {
        if self.direction != FrsDirection::Write {
            return Err(FrsError::Unexpected(resp.status));
        }
        trace!(
            "frs write 0x{:04X} @{}: {}",
            self.record,
            resp.offset,
            frs_status_to_str(resp.status)
        );
        match resp.status {
            FRS_STATUS_WRITE_READY => {
                if self.in_flight.is_some() {
                    return Ok(FrsStep::Pending);
                }
                Ok(self.next_burst())
            }
            FRS_STATUS_WORD_RECEIVED => {
                let Some(sent) = self.in_flight else {
                    return Ok(FrsStep::Pending);
                };
                let burst = (self.words.len() - sent as usize).min(FRS_WRITE_BURST_WORDS) as u16;
                let next = sent.saturating_add(burst);
                if resp.offset != sent && resp.offset != next {
                    return Err(FrsError::OffsetMismatch {
                        expected: sent,
                        received: resp.offset,
                    });
                }
                self.in_flight = None;
                self.offset = next;
                Ok(self.next_burst())
            }
            FRS_STATUS_RECORD_VALID => Ok(FrsStep::Pending),
            FRS_STATUS_WRITE_COMPLETE => {
                if (self.offset as usize) < self.words.len() && self.in_flight.is_none() {
                    debug!(
                        "frs write 0x{:04X}: completed at {} of {} words",
                        self.record,
                        self.offset,
                        self.words.len()
                    );
                }
                Ok(FrsStep::Done(Vec::new()))
            }
            FRS_STATUS_UNRECOGNIZED_FRS_TYPE => Err(FrsError::InvalidRecord),
            FRS_STATUS_BUSY => Err(FrsError::DeviceBusy),
            FRS_STATUS_WRITE_FAILED | FRS_STATUS_DATA_RECV_NOT_IN_WRITE_MODE => {
                Err(FrsError::WriteFailed(frs_status_to_str(resp.status)))
            }
            FRS_STATUS_INVALID_LENGTH => Err(FrsError::InvalidLength),
            FRS_STATUS_RECORD_INVALID => Err(FrsError::RecordInvalid),
            FRS_STATUS_DEVICE_ERROR => Err(FrsError::DeviceError),
            FRS_STATUS_READONLY => Err(FrsError::ReadOnly),
            other => Err(FrsError::Unexpected(other)),
        }
    }
}

/// Sensor metadata record (0xE301..0xE324)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorMetadata {
    pub me_version: u8,
    pub mh_version: u8,
    pub sh_version: u8,
    /// Full scale range in the sensor's units
    pub range: f32,
    pub resolution: f32,
    pub revision: u16,
    /// Milliamps
    pub power_ma: f32,
    pub min_period_us: u32,
    pub fifo_reserved: u16,
    pub fifo_max: u16,
    pub q_point_1: u16,
    pub q_point_2: u16,
    pub q_point_3: u16,
}

impl SensorMetadata {
    pub const MIN_WORDS: usize = 9;

    pub fn from_words(words: &[u32]) -> Result<Self, FrsError> {
        if words.len() < Self::MIN_WORDS {
            return Err(FrsError::InvalidLength);
        }
        let lo = |w: u32| (w & 0xFFFF) as u16;
        let hi = |w: u32| (w >> 16) as u16;
        let q_point_1 = lo(words[7]);
        let q1 = q_point_1.min(31) as u8;
        Ok(Self {
            me_version: (words[0] & 0xFF) as u8,
            mh_version: ((words[0] >> 8) & 0xFF) as u8,
            sh_version: ((words[0] >> 16) & 0xFF) as u8,
            range: q32_to_f32(words[1] as i32, q1),
            resolution: q32_to_f32(words[2] as i32, q1),
            revision: lo(words[3]),
            power_ma: q32_to_f32(hi(words[3]) as i32, 10),
            min_period_us: words[4],
            fifo_reserved: lo(words[5]),
            fifo_max: hi(words[5]),
            q_point_1,
            q_point_2: hi(words[7]),
            q_point_3: hi(words[8]),
        })
    }
}
