// Copyright 2025 Au-Zone Technologies Inc.
// SPDX-License-Identifier: Apache-2.0

//! Protocol constants for the SHTP engine.
//!
//! Control report ids, command ids, FRS status codes and
//! record ids, and the Q-point table used to convert fixed-point report
//! fields into engineering units.

/// Largest buffer handed over by a single bus exchange
pub const PACKET_RECV_BUF_LEN: usize = 2048;
/// Largest frame the host writes in one exchange
pub const PACKET_SEND_BUF_LEN: usize = 256;
/// SHTP header: u16 length, channel, sequence
pub const PACKET_HEADER_LENGTH: usize = 4;
pub const NUM_CHANNELS: usize = 6;
/// Bit 15 of the length field marks a continuation fragment
pub const CONTINUATION_FLAG: u16 = 0x8000;
pub const LENGTH_MASK: u16 = 0x7FFF;

// =============================================================================
// Command / Executable Channel
// =============================================================================

/// Advertisement response
pub const CMD_RESP_ADVERTISEMENT: u8 = 0;
/// Error list response
pub const CMD_RESP_ERROR_LIST: u8 = 1;

pub const EXECUTABLE_DEVICE_CMD_RESET: u8 = 1;
pub const EXECUTABLE_DEVICE_CMD_ON: u8 = 2;
pub const EXECUTABLE_DEVICE_CMD_SLEEP: u8 = 3;
pub const EXECUTABLE_DEVICE_RESP_RESET_COMPLETE: u8 = 1;

// =============================================================================
// Sensor Hub (SHUB) Control Reports
// =============================================================================

pub const SHUB_COMMAND_RESP: u8 = 0xF1;
pub const SHUB_COMMAND_REQ: u8 = 0xF2;
pub const SHUB_FRS_READ_RESP: u8 = 0xF3;
pub const SHUB_FRS_READ_REQ: u8 = 0xF4;
pub const SHUB_FRS_WRITE_RESP: u8 = 0xF5;
pub const SHUB_FRS_WRITE_DATA_REQ: u8 = 0xF6;
pub const SHUB_FRS_WRITE_REQ: u8 = 0xF7;
pub const SHUB_PROD_ID_RESP: u8 = 0xF8;
pub const SHUB_PROD_ID_REQ: u8 = 0xF9;
/// Timestamp rebase, signed delta in 100 us ticks
pub const SHUB_TIMESTAMP_REBASE: u8 = 0xFA;
/// Base timestamp reference, delta in 100 us ticks
pub const SHUB_BASE_TIMESTAMP: u8 = 0xFB;
pub const SHUB_GET_FEATURE_RESP: u8 = 0xFC;
pub const SHUB_REPORT_SET_FEATURE_CMD: u8 = 0xFD;

/// Length of a command request (0xF2)
pub const COMMAND_REQ_LEN: usize = 12;
/// Number of parameter bytes carried by a command request
pub const COMMAND_PARAM_COUNT: usize = 9;
/// Length of a set feature command (0xFD)
pub const SET_FEATURE_LEN: usize = 17;

// =============================================================================
// Command IDs (SH-2 command request, byte 2)
// =============================================================================

pub const SH2_CMD_TARE: u8 = 3;
pub const SH2_CMD_INITIALIZE: u8 = 4;
pub const SH2_CMD_DCD: u8 = 6;
pub const SH2_CMD_ME_CALIBRATE: u8 = 7;
pub const SH2_CMD_DCD_PERIOD_SAVE: u8 = 9;
pub const SH2_CMD_CLEAR_DCD_AND_RESET: u8 = 11;

/// Set on command ids in responses the hub sends without a request
pub const SH2_INIT_UNSOLICITED: u8 = 0x80;
pub const SH2_STARTUP_INIT_UNSOLICITED: u8 = SH2_CMD_INITIALIZE | SH2_INIT_UNSOLICITED;

pub const TARE_NOW: u8 = 0;
pub const TARE_PERSIST: u8 = 1;
pub const TARE_SET_REORIENTATION: u8 = 2;

pub const ME_CAL_CONFIGURE: u8 = 0;
pub const ME_CAL_GET: u8 = 1;

// =============================================================================
// FRS (Flash Record System) Status Codes
// =============================================================================

// Write response (0xF5)
pub const FRS_STATUS_WORD_RECEIVED: u8 = 0;
pub const FRS_STATUS_UNRECOGNIZED_FRS_TYPE: u8 = 1;
pub const FRS_STATUS_BUSY: u8 = 2;
pub const FRS_STATUS_WRITE_COMPLETE: u8 = 3;
pub const FRS_STATUS_WRITE_READY: u8 = 4;
pub const FRS_STATUS_WRITE_FAILED: u8 = 5;
pub const FRS_STATUS_DATA_RECV_NOT_IN_WRITE_MODE: u8 = 6;
pub const FRS_STATUS_INVALID_LENGTH: u8 = 7;
pub const FRS_STATUS_RECORD_VALID: u8 = 8;
pub const FRS_STATUS_RECORD_INVALID: u8 = 9;
pub const FRS_STATUS_DEVICE_ERROR: u8 = 10;
pub const FRS_STATUS_READONLY: u8 = 11;

// Read response (0xF3), low nibble of byte 1
pub const FRS_READ_NO_ERROR: u8 = 0;
pub const FRS_READ_UNRECOGNIZED_FRS_TYPE: u8 = 1;
pub const FRS_READ_BUSY: u8 = 2;
pub const FRS_READ_RECORD_COMPLETE: u8 = 3;
pub const FRS_READ_OFFSET_OUT_OF_RANGE: u8 = 4;
pub const FRS_READ_RECORD_EMPTY: u8 = 5;
pub const FRS_READ_BLOCK_COMPLETE: u8 = 6;
pub const FRS_READ_BLOCK_AND_RECORD_COMPLETE: u8 = 7;
pub const FRS_READ_DEVICE_ERROR: u8 = 8;

// =============================================================================
// FRS Record IDs
// =============================================================================

pub const FRS_TYPE_DYNAMIC_CALIBRATION: u16 = 0x1F1F;
pub const FRS_TYPE_SENSOR_ORIENTATION: u16 = 0x2D3E;
/// Accelerometer metadata record
pub const FRS_META_ACCELEROMETER: u16 = 0xE302;

/// Words of a record streamed per FRS write data request
pub const FRS_WRITE_BURST_WORDS: usize = 2;

// =============================================================================
// Q-Point Table
// =============================================================================

/// Q points of a sensor report's data fields and of its secondary field
/// (heading accuracy, bias or angular velocity). `None` for reports carrying
/// plain integers.
pub const fn q_points(report_id: u8) -> Option<(u8, u8)> {
    match report_id {
        0x01 | 0x04 | 0x06 => Some((8, 0)),
        0x02 => Some((9, 0)),
        0x07 => Some((9, 9)),
        0x03 => Some((4, 0)),
        0x0F => Some((4, 4)),
        0x05 | 0x09 | 0x28 => Some((14, 12)),
        0x08 | 0x29 => Some((14, 0)),
        0x2A => Some((14, 10)),
        _ => None,
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Convert Q-point fixed-point value to f32
#[inline]
pub fn q_to_f32(q_val: i16, q_point: u8) -> f32 {
    q32_to_f32(q_val as i32, q_point)
}

/// Convert a 32-bit Q-point value (FRS metadata) to f32
#[inline]
pub fn q32_to_f32(q_val: i32, q_point: u8) -> f32 {
    (q_val as f64 / (1u64 << q_point) as f64) as f32
}

/// Convert f32 to Q-point fixed-point bytes (little-endian)
#[inline]
pub fn f32_to_q(f32_val: f32, q_point: u8) -> [u8; 4] {
    ((f32_val as f64 * (1u64 << q_point) as f64) as i32).to_le_bytes()
}

/// FRS write status description
pub fn frs_status_to_str(status: u8) -> &'static str {
    match status {
        FRS_STATUS_WORD_RECEIVED => "word(s) received",
        FRS_STATUS_UNRECOGNIZED_FRS_TYPE => "unrecognized FRS type",
        FRS_STATUS_BUSY => "busy",
        FRS_STATUS_WRITE_COMPLETE => "write completed",
        FRS_STATUS_WRITE_READY => "write mode entered or ready",
        FRS_STATUS_WRITE_FAILED => "write failed",
        FRS_STATUS_DATA_RECV_NOT_IN_WRITE_MODE => "data received while not in write mode",
        FRS_STATUS_INVALID_LENGTH => "invalid length",
        FRS_STATUS_RECORD_VALID => "record valid (passed internal validation)",
        FRS_STATUS_RECORD_INVALID => "record invalid (failed internal validation)",
        FRS_STATUS_DEVICE_ERROR => "device error (DFU flash unavailable)",
        FRS_STATUS_READONLY => "record is read only",
        _ => "reserved",
    }
}

/// FRS read status description
pub fn frs_read_status_to_str(status: u8) -> &'static str {
    match status {
        FRS_READ_NO_ERROR => "no error",
        FRS_READ_UNRECOGNIZED_FRS_TYPE => "unrecognized FRS type",
        FRS_READ_BUSY => "busy",
        FRS_READ_RECORD_COMPLETE => "read record completed",
        FRS_READ_OFFSET_OUT_OF_RANGE => "offset out of range",
        FRS_READ_RECORD_EMPTY => "record empty",
        FRS_READ_BLOCK_COMPLETE => "read block completed",
        FRS_READ_BLOCK_AND_RECORD_COMPLETE => "read block and record completed",
        FRS_READ_DEVICE_ERROR => "device error",
        _ => "reserved",
    }
}

/// Device error list codes reported on the command channel
pub fn hub_error_to_str(code: u8) -> Option<&'static str> {
    let msg = match code {
        1 => "hub application attempted to exceed maximum read cargo length",
        2 => "host write was too short (need at least a 4-byte header)",
        3 => "host wrote a header with length greater than maximum write cargo length",
        4 => "host wrote a header with length less than or equal to header length",
        5 => "host wrote beginning of fragmented cargo, fragmentation not supported",
        6 => "host wrote continuation of fragmented cargo, fragmentation not supported",
        7 => "unrecognized command on control channel",
        8 => "unrecognized parameter to get-advertisement command",
        9 => "host wrote to unrecognized channel",
        10 => "advertisement request received while advertisement response was pending",
        11 => "host performed a write before the hub finished sending its advertisement",
        12 => "error list too long to send, truncated",
        _ => return None,
    };
    Some(msg)
}
