// Copyright 2025 Au-Zone Technologies Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::{calibration::CalibrationState, command::ResponseKey, packet::Channel};
use thiserror::Error;

/// Malformed frames and report payloads. Dropped by the processing context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("frame of {0} bytes is shorter than the SHTP header")]
    TooShort(usize),

    #[error("declared length {declared} disagrees with {received} bytes received")]
    LengthMismatch { declared: usize, received: usize },

    #[error("channel {0} is outside the valid range")]
    InvalidChannel(u8),

    #[error("continuation fragment on {0:?} without a packet in progress")]
    OrphanContinuation(Channel),

    #[error("reassembled cargo exceeds {0} bytes")]
    ReassemblyOverflow(usize),

    #[error("payload of {len} bytes does not fit in {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("report 0x{report_id:02X} needs {needed} bytes, {available} available")]
    Truncated {
        report_id: u8,
        needed: usize,
        available: usize,
    },
}

/// Flash record system failures reported by the hub or detected locally
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrsError {
    #[error("record is empty")]
    RecordEmpty,

    #[error("record type is not recognized")]
    InvalidRecord,

    #[error("expected word offset {expected}, device sent {received}")]
    OffsetMismatch { expected: u16, received: u16 },

    #[error("offset out of range")]
    OffsetOutOfRange,

    #[error("flash record system busy")]
    DeviceBusy,

    #[error("flash device error")]
    DeviceError,

    #[error("write failed: {0}")]
    WriteFailed(&'static str),

    #[error("record is read only")]
    ReadOnly,

    #[error("invalid record length")]
    InvalidLength,

    #[error("record failed validation")]
    RecordInvalid,

    #[error("unexpected status {0}")]
    Unexpected(u8),
}

/// Errors in this crate
#[derive(Debug, Error)]
pub enum Error {
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("sequence error on {channel:?}: expected {expected}, received {received}")]
    Sequence {
        channel: Channel,
        expected: u8,
        received: u8,
    },

    #[error("response {0:?} has no pending request")]
    UnmatchedResponse(ResponseKey),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("sensor hub reset during the operation")]
    ResetOccurred,

    #[error("FRS error: {0}")]
    Frs(#[from] FrsError),

    #[error("bus error: {0}")]
    Bus(String),

    #[error("calibration aborted")]
    CalibrationAborted,

    #[error("operation not valid while calibration is {0:?}")]
    InvalidCalibrationState(CalibrationState),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("command 0x{command:02X} failed with status {status}")]
    CommandFailed { command: u8, status: u8 },

    #[error("another transfer is already in progress")]
    Busy,

    #[error("engine is shut down")]
    Shutdown,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
