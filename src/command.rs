// Copyright 2025 Au-Zone Technologies Inc.
// SPDX-License-Identifier: Apache-2.0

//! Outbound requests and the table of requests awaiting a response.

use crate::{
    constants::{
        COMMAND_PARAM_COUNT, COMMAND_REQ_LEN, NUM_CHANNELS, SET_FEATURE_LEN, SHUB_COMMAND_REQ,
        SHUB_PROD_ID_REQ, SHUB_REPORT_SET_FEATURE_CMD, SH2_INIT_UNSOLICITED, TARE_NOW, TARE_PERSIST,
        TARE_SET_REORIENTATION,
    },
    error::{Error, FramingError},
    packet::{encode, Channel},
    reports::ReportParser,
};
use log::{debug, trace};
use std::{
    collections::VecDeque,
    sync::mpsc::{sync_channel, Receiver, SyncSender},
    time::Duration,
};

/// Frames waiting for the I/O thread, and the outbound sequence counters
pub struct Outbox {
    sequence_numbers: [u8; NUM_CHANNELS],
    command_sequence: u8,
    frames: VecDeque<Vec<u8>>,
    max_frame: usize,
}

impl Outbox {
    pub fn new(max_frame: usize) -> Self {
        Self {
            sequence_numbers: [0; NUM_CHANNELS],
            command_sequence: 0,
            frames: VecDeque::new(),
            max_frame,
        }
    }

    /// Frame `payload` on `channel` and queue it. Returns the sequence number
    /// of the first frame.
    pub fn enqueue(&mut self, channel: Channel, payload: &[u8]) -> Result<u8, FramingError> {
        let seq = &mut self.sequence_numbers[channel.index()];
        let first = *seq;
        let frames = encode(channel, first, payload, self.max_frame)?;
        *seq = seq.wrapping_add(frames.len() as u8);
        trace!(
            "queue {:?} seq {} ({} bytes, {} frames)",
            channel,
            first,
            payload.len(),
            frames.len()
        );
        self.frames.extend(frames);
        Ok(first)
    }

    /// Allocate the next command request sequence number
    pub fn next_command_sequence(&mut self) -> u8 {
        let seq = self.command_sequence;
        self.command_sequence = seq.wrapping_add(1);
        seq
    }

    pub fn pop(&mut self) -> Option<Vec<u8>> {
        self.frames.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }
}

/// Command request (0xF2)
pub fn command_request(command_sequence: u8, command: u8, params: &[u8]) -> [u8; COMMAND_REQ_LEN] {
    let mut body = [0u8; COMMAND_REQ_LEN];
    body[0] = SHUB_COMMAND_REQ;
    body[1] = command_sequence;
    body[2] = command;
    let n = params.len().min(COMMAND_PARAM_COUNT);
    body[3..3 + n].copy_from_slice(&params[..n]);
    body
}

pub fn product_id_request() -> [u8; 2] {
    [SHUB_PROD_ID_REQ, 0]
}

/// Set feature parameters for one report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureSettings {
    pub flags: u8,
    pub change_sensitivity: u16,
    pub interval_us: u32,
    pub batch_interval_us: u32,
    pub sensor_specific: u32,
}

impl FeatureSettings {
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval_us: interval.as_micros().min(u32::MAX as u128) as u32,
            ..Default::default()
        }
    }

    pub fn sensor_specific(mut self, config: u32) -> Self {
        self.sensor_specific = config;
        self
    }

    fn parse(msg: &[u8]) -> Self {
        let mut cursor = 2;
        let flags = ReportParser::read_u8(msg, &mut cursor);
        let change_sensitivity = ReportParser::read_u16(msg, &mut cursor);
        let interval_us = ReportParser::read_u32(msg, &mut cursor);
        let batch_interval_us = ReportParser::read_u32(msg, &mut cursor);
        let sensor_specific = ReportParser::read_u32(msg, &mut cursor);
        Self {
            flags,
            change_sensitivity,
            interval_us,
            batch_interval_us,
            sensor_specific,
        }
    }
}

/// Set feature command (0xFD)
pub fn set_feature_command(report_id: u8, settings: &FeatureSettings) -> [u8; SET_FEATURE_LEN] {
    let mut body = [0u8; SET_FEATURE_LEN];
    body[0] = SHUB_REPORT_SET_FEATURE_CMD;
    body[1] = report_id;
    body[2] = settings.flags;
    body[3..5].copy_from_slice(&settings.change_sensitivity.to_le_bytes());
    body[5..9].copy_from_slice(&settings.interval_us.to_le_bytes());
    body[9..13].copy_from_slice(&settings.batch_interval_us.to_le_bytes());
    body[13..17].copy_from_slice(&settings.sensor_specific.to_le_bytes());
    body
}

/// Get feature response (0xFC), sent by the hub whenever a feature changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureResponse {
    pub report_id: u8,
    pub settings: FeatureSettings,
}

impl FeatureResponse {
    pub fn parse(msg: &[u8]) -> Result<Self, FramingError> {
        ensure_len(msg, SET_FEATURE_LEN)?;
        Ok(Self {
            report_id: msg[1],
            settings: FeatureSettings::parse(msg),
        })
    }
}

/// Command response (0xF1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandResponse {
    pub sequence: u8,
    /// Command id, bit 7 set when unsolicited
    pub command: u8,
    /// Sequence number of the request this answers
    pub command_sequence: u8,
    pub response_sequence: u8,
    /// R0..R10
    pub results: [u8; 11],
}

impl CommandResponse {
    pub const LEN: usize = 16;

    pub fn parse(msg: &[u8]) -> Result<Self, FramingError> {
        ensure_len(msg, Self::LEN)?;
        let mut results = [0u8; 11];
        results.copy_from_slice(&msg[5..16]);
        Ok(Self {
            sequence: msg[1],
            command: msg[2],
            command_sequence: msg[3],
            response_sequence: msg[4],
            results,
        })
    }

    pub fn command_id(&self) -> u8 {
        self.command & !SH2_INIT_UNSOLICITED
    }

    pub fn is_unsolicited(&self) -> bool {
        self.command & SH2_INIT_UNSOLICITED != 0
    }

    /// R0, zero on success for most commands
    pub fn status(&self) -> u8 {
        self.results[0]
    }
}

/// Cause of the most recent hub reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetReason {
    #[default]
    Undefined,
    PowerOn,
    Internal,
    Watchdog,
    External,
    Other,
}

impl From<u8> for ResetReason {
    fn from(value: u8) -> Self {
        match value {
            1 => ResetReason::PowerOn,
            2 => ResetReason::Internal,
            3 => ResetReason::Watchdog,
            4 => ResetReason::External,
            5 => ResetReason::Other,
            _ => ResetReason::Undefined,
        }
    }
}

/// Product id response (0xF8)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductId {
    pub reset_reason: ResetReason,
    pub sw_major: u8,
    pub sw_minor: u8,
    pub part_number: u32,
    pub build_number: u32,
    pub patch: u16,
}

impl ProductId {
    pub fn parse(msg: &[u8]) -> Result<Self, FramingError> {
        ensure_len(msg, 14)?;
        let mut cursor = 4;
        let part_number = ReportParser::read_u32(msg, &mut cursor);
        let build_number = ReportParser::read_u32(msg, &mut cursor);
        let patch = ReportParser::read_u16(msg, &mut cursor);
        Ok(Self {
            reset_reason: ResetReason::from(msg[1]),
            sw_major: msg[2],
            sw_minor: msg[3],
            part_number,
            build_number,
            patch,
        })
    }
}

fn ensure_len(msg: &[u8], needed: usize) -> Result<(), FramingError> {
    if msg.len() < needed {
        return Err(FramingError::Truncated {
            report_id: msg.first().copied().unwrap_or(0),
            needed,
            available: msg.len(),
        });
    }
    Ok(())
}

/// What a pending request waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKey {
    /// Command response for a command id
    Command(u8),
    ProductId,
    /// Get feature response for a report id
    Feature(u8),
    /// FRS read or write response
    Frs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Command(CommandResponse),
    ProductId(ProductId),
    Feature(FeatureResponse),
}

impl Response {
    pub fn key(&self) -> ResponseKey {
        match self {
            Response::Command(r) => ResponseKey::Command(r.command_id()),
            Response::ProductId(_) => ResponseKey::ProductId,
            Response::Feature(r) => ResponseKey::Feature(r.report_id),
        }
    }
}

pub type Completion = Result<Response, Error>;

struct PendingSlot {
    token: u64,
    key: ResponseKey,
    command_sequence: Option<u8>,
    done: SyncSender<Completion>,
}

/// Caller side of a pending request
pub struct PendingHandle {
    pub token: u64,
    pub key: ResponseKey,
    pub rx: Receiver<Completion>,
}

/// Requests waiting for a response, oldest first
#[derive(Default)]
pub struct PendingTable {
    next_token: u64,
    slots: VecDeque<PendingSlot>,
}

impl PendingTable {
    pub fn register(&mut self, key: ResponseKey, command_sequence: Option<u8>) -> PendingHandle {
        let token = self.next_token;
        self.next_token += 1;
        let (done, rx) = sync_channel(1);
        self.slots.push_back(PendingSlot {
            token,
            key,
            command_sequence,
            done,
        });
        PendingHandle { token, key, rx }
    }

    /// Complete the oldest slot waiting for this response
    pub fn resolve(&mut self, response: Response) -> Result<(), Error> {
        let key = response.key();
        let Some(pos) = self.slots.iter().position(|s| s.key == key) else {
            return Err(Error::UnmatchedResponse(key));
        };
        let Some(slot) = self.slots.remove(pos) else {
            return Err(Error::UnmatchedResponse(key));
        };
        if let (Some(expected), Response::Command(r)) = (slot.command_sequence, &response) {
            if expected != r.command_sequence {
                debug!(
                    "command 0x{:02X}: response for sequence {}, oldest pending is {}",
                    r.command_id(),
                    r.command_sequence,
                    expected
                );
            }
        }
        // the caller may have given up already
        let _ = slot.done.try_send(Ok(response));
        Ok(())
    }

    /// Drop a slot whose caller stopped waiting
    pub fn release(&mut self, token: u64) -> bool {
        let before = self.slots.len();
        self.slots.retain(|s| s.token != token);
        before != self.slots.len()
    }

    /// Fail every slot, returns how many were pending
    pub fn fail_all(&mut self, make_error: impl Fn() -> Error) -> usize {
        let count = self.slots.len();
        for slot in self.slots.drain(..) {
            let _ = slot.done.try_send(Err(make_error()));
        }
        count
    }

    pub fn contains(&self, key: ResponseKey) -> bool {
        self.slots.iter().any(|s| s.key == key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Rotation vector a tare applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TareBasis {
    RotationVector = 0,
    GameRotationVector = 1,
    GeomagneticRotationVector = 2,
    GyroIntegratedRotationVector = 3,
    ArvrStabilizedRotationVector = 4,
    ArvrStabilizedGameRotationVector = 5,
}

pub const TARE_AXIS_X: u8 = 0x01;
pub const TARE_AXIS_Y: u8 = 0x02;
pub const TARE_AXIS_Z: u8 = 0x04;
pub const TARE_AXIS_ALL: u8 = TARE_AXIS_X | TARE_AXIS_Y | TARE_AXIS_Z;

/// Tare now: zero the selected axes of `basis` at the current orientation
pub fn tare_now_params(axes: u8, basis: TareBasis) -> [u8; COMMAND_PARAM_COUNT] {
    let mut params = [0u8; COMMAND_PARAM_COUNT];
    params[0] = TARE_NOW;
    params[1] = axes & TARE_AXIS_ALL;
    params[2] = basis as u8;
    params
}

pub fn tare_persist_params() -> [u8; COMMAND_PARAM_COUNT] {
    let mut params = [0u8; COMMAND_PARAM_COUNT];
    params[0] = TARE_PERSIST;
    params
}

/// Set reorientation to the quaternion `[i, j, k, real]`, Q14 per component.
/// The zero quaternion clears the tare.
pub fn reorientation_params(q: [f32; 4]) -> [u8; COMMAND_PARAM_COUNT] {
    let mut params = [0u8; COMMAND_PARAM_COUNT];
    params[0] = TARE_SET_REORIENTATION;
    for (i, v) in q.iter().enumerate() {
        let fixed = (v.clamp(-1.0, 1.0) * (1 << 14) as f32).round() as i32;
        let fixed = fixed.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        params[1 + 2 * i..3 + 2 * i].copy_from_slice(&fixed.to_le_bytes());
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{SHUB_COMMAND_RESP, SH2_CMD_DCD, SH2_CMD_ME_CALIBRATE};
    use crate::packet::decode;

    fn response(command: u8, command_sequence: u8, status: u8) -> Response {
        let mut msg = [0u8; 16];
        msg[0] = SHUB_COMMAND_RESP;
        msg[2] = command;
        msg[3] = command_sequence;
        msg[5] = status;
        Response::Command(CommandResponse::parse(&msg).unwrap())
    }

    #[test]
    fn test_set_feature_layout() {
        let settings = FeatureSettings::with_interval(Duration::from_millis(10));
        let body = set_feature_command(0x05, &settings);
        assert_eq!(body[0], 0xFD);
        assert_eq!(body[1], 0x05);
        // 10_000 us little-endian
        assert_eq!(&body[5..9], &[0x10, 0x27, 0x00, 0x00]);
        assert_eq!(&body[13..], &[0, 0, 0, 0]);

        let parsed = FeatureResponse::parse(&body).unwrap();
        assert_eq!(parsed.report_id, 0x05);
        assert_eq!(parsed.settings, settings);
    }

    #[test]
    fn test_command_request_layout() {
        let body = command_request(9, SH2_CMD_ME_CALIBRATE, &[1, 1, 0, 0, 0]);
        assert_eq!(body, [0xF2, 9, 7, 1, 1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_outbox_sequences_per_channel() {
        let mut outbox = Outbox::new(256);
        assert_eq!(outbox.enqueue(Channel::HubControl, &[1]).unwrap(), 0);
        assert_eq!(outbox.enqueue(Channel::HubControl, &[2]).unwrap(), 1);
        assert_eq!(outbox.enqueue(Channel::Executable, &[1]).unwrap(), 0);
        assert_eq!(outbox.len(), 3);
        let first = decode(&outbox.pop().unwrap()).unwrap();
        assert_eq!((first.channel, first.sequence), (Channel::HubControl, 0));
        assert_eq!(outbox.next_command_sequence(), 0);
        assert_eq!(outbox.next_command_sequence(), 1);
    }

    #[test]
    fn test_response_resolves_once() {
        let mut table = PendingTable::default();
        let handle = table.register(ResponseKey::Command(SH2_CMD_ME_CALIBRATE), Some(3));

        // unrelated traffic in between
        for _ in 0..5 {
            assert!(matches!(
                table.resolve(response(SH2_CMD_DCD, 0, 0)),
                Err(Error::UnmatchedResponse(ResponseKey::Command(SH2_CMD_DCD)))
            ));
        }
        table.resolve(response(SH2_CMD_ME_CALIBRATE, 3, 0)).unwrap();
        match handle.rx.try_recv().unwrap() {
            Ok(Response::Command(r)) => assert_eq!(r.command_sequence, 3),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            table.resolve(response(SH2_CMD_ME_CALIBRATE, 3, 0)),
            Err(Error::UnmatchedResponse(_))
        ));
        assert!(handle.rx.try_recv().is_err());
    }

    #[test]
    fn test_oldest_pending_matched_first() {
        let mut table = PendingTable::default();
        let first = table.register(ResponseKey::Command(SH2_CMD_DCD), Some(1));
        let second = table.register(ResponseKey::Command(SH2_CMD_DCD), Some(2));
        table.resolve(response(SH2_CMD_DCD, 2, 0)).unwrap();
        assert!(first.rx.try_recv().is_ok());
        assert!(second.rx.try_recv().is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_released_slot_drops_late_response() {
        let mut table = PendingTable::default();
        let handle = table.register(ResponseKey::ProductId, None);
        assert!(table.release(handle.token));
        let mut msg = [0u8; 16];
        msg[0] = 0xF8;
        let pid = ProductId::parse(&msg).unwrap();
        assert!(table.resolve(Response::ProductId(pid)).is_err());
    }

    #[test]
    fn test_fail_all() {
        let mut table = PendingTable::default();
        let a = table.register(ResponseKey::Command(SH2_CMD_DCD), None);
        let b = table.register(ResponseKey::Feature(5), None);
        assert_eq!(table.fail_all(|| Error::ResetOccurred), 2);
        assert!(matches!(a.rx.try_recv(), Ok(Err(Error::ResetOccurred))));
        assert!(matches!(b.rx.try_recv(), Ok(Err(Error::ResetOccurred))));
        assert!(table.is_empty());
    }

    #[test]
    fn test_unsolicited_initialize() {
        let r = response(0x84, 0, 0);
        match r {
            Response::Command(c) => {
                assert!(c.is_unsolicited());
                assert_eq!(c.command_id(), 4);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_product_id_parse() {
        let msg = [
            0xF8, 0x01, 3, 2, 0x5A, 0x51, 0x98, 0x00, 0x2C, 0x01, 0, 0, 0x07, 0x00, 0, 0,
        ];
        let pid = ProductId::parse(&msg).unwrap();
        assert_eq!(pid.reset_reason, ResetReason::PowerOn);
        assert_eq!((pid.sw_major, pid.sw_minor), (3, 2));
        assert_eq!(pid.part_number, 0x0098_515A);
        assert_eq!(pid.build_number, 300);
        assert_eq!(pid.patch, 7);
    }

    #[test]
    fn test_tare_params() {
        let now = tare_now_params(TARE_AXIS_Z, TareBasis::GameRotationVector);
        assert_eq!(now, [0, 0x04, 1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(tare_persist_params()[0], 1);

        let identity = reorientation_params([0.0, 0.0, 0.0, 1.0]);
        assert_eq!(identity, [2, 0, 0, 0, 0, 0, 0, 0x00, 0x40]);
        let half = reorientation_params([-0.5, 0.0, 0.0, 0.0]);
        assert_eq!(i16::from_le_bytes([half[1], half[2]]), -8192);
        assert_eq!(reorientation_params([0.0; 4])[1..], [0; 8]);
    }
}
