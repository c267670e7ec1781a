// Copyright 2025 Au-Zone Technologies Inc.
// SPDX-License-Identifier: Apache-2.0

//! Sensor report decoding.
//!
//! Input report packets on the sensor channels start with a base timestamp
//! record followed by one or more fixed-size reports:
//!
//! ```text
//! Byte 0:   report id
//! Byte 1:   report sequence number
//! Byte 2:   status, bits 1:0 accuracy, bits 7:2 delay MSBs
//! Byte 3:   delay LSBs (100 us ticks)
//! Byte 4..: report-specific fields, little-endian
//! ```
//!
//! The gyro-integrated rotation vector channel carries bare 14 byte records
//! with no id, sequence or status.

use crate::{
    constants::{
        q_points, q_to_f32, NUM_CHANNELS, SHUB_BASE_TIMESTAMP, SHUB_TIMESTAMP_REBASE,
    },
    error::FramingError,
    packet::Channel,
};
use log::{trace, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Sensor report ids understood by the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ReportId {
    /// m/s^2 including gravity, Q8
    Accelerometer = 0x01,
    /// rad/s, Q9
    GyroscopeCalibrated = 0x02,
    /// uTesla, Q4
    MagneticFieldCalibrated = 0x03,
    /// m/s^2 without gravity, Q8
    LinearAcceleration = 0x04,
    /// Unit quaternion Q14, heading accuracy Q12 (radians)
    RotationVector = 0x05,
    Gravity = 0x06,
    GyroscopeUncalibrated = 0x07,
    GameRotationVector = 0x08,
    GeomagneticRotationVector = 0x09,
    MagneticFieldUncalibrated = 0x0F,
    TapDetector = 0x10,
    StepCounter = 0x11,
    StabilityClassifier = 0x13,
    RawAccelerometer = 0x14,
    RawGyroscope = 0x15,
    RawMagnetometer = 0x16,
    ShakeDetector = 0x19,
    PersonalActivityClassifier = 0x1E,
    ArvrStabilizedRotationVector = 0x28,
    ArvrStabilizedGameRotationVector = 0x29,
    /// Quaternion Q14 and angular velocity Q10, sent on its own channel
    GyroIntegratedRotationVector = 0x2A,
}

impl ReportId {
    pub const ALL: [ReportId; 21] = [
        ReportId::Accelerometer,
        ReportId::GyroscopeCalibrated,
        ReportId::MagneticFieldCalibrated,
        ReportId::LinearAcceleration,
        ReportId::RotationVector,
        ReportId::Gravity,
        ReportId::GyroscopeUncalibrated,
        ReportId::GameRotationVector,
        ReportId::GeomagneticRotationVector,
        ReportId::MagneticFieldUncalibrated,
        ReportId::TapDetector,
        ReportId::StepCounter,
        ReportId::StabilityClassifier,
        ReportId::RawAccelerometer,
        ReportId::RawGyroscope,
        ReportId::RawMagnetometer,
        ReportId::ShakeDetector,
        ReportId::PersonalActivityClassifier,
        ReportId::ArvrStabilizedRotationVector,
        ReportId::ArvrStabilizedGameRotationVector,
        ReportId::GyroIntegratedRotationVector,
    ];

    /// Size of the report on the sensor channels, header included
    pub fn report_len(self) -> usize {
        match self {
            ReportId::TapDetector => 5,
            ReportId::StabilityClassifier | ReportId::ShakeDetector => 6,
            ReportId::Accelerometer
            | ReportId::GyroscopeCalibrated
            | ReportId::MagneticFieldCalibrated
            | ReportId::LinearAcceleration
            | ReportId::Gravity => 10,
            ReportId::GameRotationVector
            | ReportId::ArvrStabilizedGameRotationVector
            | ReportId::StepCounter => 12,
            ReportId::RotationVector
            | ReportId::GeomagneticRotationVector
            | ReportId::ArvrStabilizedRotationVector => 14,
            ReportId::GyroscopeUncalibrated
            | ReportId::MagneticFieldUncalibrated
            | ReportId::RawAccelerometer
            | ReportId::RawGyroscope
            | ReportId::RawMagnetometer
            | ReportId::PersonalActivityClassifier => 16,
            // header, then the record the gyro channel carries bare
            ReportId::GyroIntegratedRotationVector => 4 + GYRO_INTEGRATED_RECORD_LEN,
        }
    }
}

/// Accuracy of a report, from the two low status bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Accuracy {
    Unreliable,
    Low,
    Medium,
    High,
    /// Reports that carry no accuracy
    #[default]
    Undefined,
}

impl Accuracy {
    pub fn from_status(status: u8) -> Self {
        match status & 0x03 {
            0 => Accuracy::Unreliable,
            1 => Accuracy::Low,
            2 => Accuracy::Medium,
            _ => Accuracy::High,
        }
    }

    fn rank(self) -> Option<u8> {
        match self {
            Accuracy::Unreliable => Some(0),
            Accuracy::Low => Some(1),
            Accuracy::Medium => Some(2),
            Accuracy::High => Some(3),
            Accuracy::Undefined => None,
        }
    }

    /// Is this accuracy at or above `threshold`
    pub fn meets(self, threshold: Accuracy) -> bool {
        match (self.rank(), threshold.rank()) {
            (Some(a), Some(t)) => a >= t,
            _ => false,
        }
    }
}

/// Three fixed-point components sharing one Q point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vector3 {
    pub raw: [i16; 3],
    pub q_point: u8,
}

impl Vector3 {
    pub fn values(&self) -> [f32; 3] {
        self.raw.map(|v| q_to_f32(v, self.q_point))
    }
}

/// Uncalibrated gyro or magnetometer sample with its bias estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UncalibratedVector3 {
    pub raw: [i16; 3],
    pub bias: [i16; 3],
    pub q_point: u8,
}

impl UncalibratedVector3 {
    pub fn values(&self) -> [f32; 3] {
        self.raw.map(|v| q_to_f32(v, self.q_point))
    }

    pub fn bias_values(&self) -> [f32; 3] {
        self.bias.map(|v| q_to_f32(v, self.q_point))
    }
}

/// Unit quaternion [i, j, k, real], optionally with a heading accuracy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationVector {
    pub raw: [i16; 4],
    pub q_point: u8,
    pub raw_accuracy: Option<i16>,
    pub accuracy_q_point: u8,
}

impl RotationVector {
    pub fn quaternion(&self) -> [f32; 4] {
        self.raw.map(|v| q_to_f32(v, self.q_point))
    }

    /// Estimated heading accuracy in radians
    pub fn heading_accuracy(&self) -> Option<f32> {
        self.raw_accuracy
            .map(|a| q_to_f32(a, self.accuracy_q_point))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GyroIntegratedRotation {
    pub raw: [i16; 4],
    pub angular_velocity: [i16; 3],
}

impl GyroIntegratedRotation {
    pub fn quaternion(&self) -> [f32; 4] {
        self.raw.map(|v| q_to_f32(v, 14))
    }

    /// rad/s
    pub fn angular_velocity_values(&self) -> [f32; 3] {
        self.angular_velocity.map(|v| q_to_f32(v, 10))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapDetector {
    pub flags: u8,
}

impl TapDetector {
    pub fn x(&self) -> bool {
        self.flags & 0x01 != 0
    }
    pub fn positive_x(&self) -> bool {
        self.flags & 0x02 != 0
    }
    pub fn y(&self) -> bool {
        self.flags & 0x04 != 0
    }
    pub fn positive_y(&self) -> bool {
        self.flags & 0x08 != 0
    }
    pub fn z(&self) -> bool {
        self.flags & 0x10 != 0
    }
    pub fn positive_z(&self) -> bool {
        self.flags & 0x20 != 0
    }
    pub fn double_tap(&self) -> bool {
        self.flags & 0x40 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepCounter {
    /// Detection latency in microseconds
    pub latency_us: u32,
    pub steps: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShakeDetector {
    pub flags: u16,
}

impl ShakeDetector {
    pub fn x(&self) -> bool {
        self.flags & 0x01 != 0
    }
    pub fn y(&self) -> bool {
        self.flags & 0x02 != 0
    }
    pub fn z(&self) -> bool {
        self.flags & 0x04 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Stability {
    Unknown = 0,
    OnTable = 1,
    Stationary = 2,
    Stable = 3,
    Motion = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Activity {
    Unknown = 0,
    InVehicle = 1,
    OnBicycle = 2,
    OnFoot = 3,
    Still = 4,
    Tilting = 5,
    Walking = 6,
    Running = 7,
    OnStairs = 8,
}

impl From<u8> for Stability {
    fn from(value: u8) -> Self {
        match value {
            1 => Stability::OnTable,
            2 => Stability::Stationary,
            3 => Stability::Stable,
            4 => Stability::Motion,
            _ => Stability::Unknown,
        }
    }
}

impl From<u8> for Activity {
    fn from(value: u8) -> Self {
        match value {
            1 => Activity::InVehicle,
            2 => Activity::OnBicycle,
            3 => Activity::OnFoot,
            4 => Activity::Still,
            5 => Activity::Tilting,
            6 => Activity::Walking,
            7 => Activity::Running,
            8 => Activity::OnStairs,
            _ => Activity::Unknown,
        }
    }
}

/// Enable mask for the personal activity classifier, one bit per [`Activity`]
pub const ACTIVITY_MASK_ALL: u32 = 0x1FF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityClassifier {
    pub page: u8,
    pub last_page: bool,
    pub most_likely: Activity,
    /// Confidence in percent, indexed by [`Activity`]
    pub confidence: [u8; 10],
}

/// Raw ADC counts with the sensor's own timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMems {
    pub raw: [i16; 3],
    /// Temperature on the raw gyroscope, reserved otherwise
    pub extra: i16,
    pub sensor_time_us: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportData {
    Accelerometer(Vector3),
    GyroscopeCalibrated(Vector3),
    MagneticFieldCalibrated(Vector3),
    LinearAcceleration(Vector3),
    Gravity(Vector3),
    GyroscopeUncalibrated(UncalibratedVector3),
    MagneticFieldUncalibrated(UncalibratedVector3),
    RotationVector(RotationVector),
    GameRotationVector(RotationVector),
    GeomagneticRotationVector(RotationVector),
    ArvrStabilizedRotationVector(RotationVector),
    ArvrStabilizedGameRotationVector(RotationVector),
    GyroIntegratedRotationVector(GyroIntegratedRotation),
    TapDetector(TapDetector),
    StepCounter(StepCounter),
    StabilityClassifier(Stability),
    ShakeDetector(ShakeDetector),
    PersonalActivityClassifier(ActivityClassifier),
    RawAccelerometer(RawMems),
    RawGyroscope(RawMems),
    RawMagnetometer(RawMems),
}

/// One decoded sensor report
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Report {
    pub id: ReportId,
    pub sequence: u8,
    pub accuracy: Accuracy,
    /// Device time in microseconds
    pub timestamp_us: u64,
    pub data: ReportData,
}

impl Report {
    /// Quaternion of any member of the rotation vector family
    pub fn quaternion(&self) -> Option<[f32; 4]> {
        match &self.data {
            ReportData::RotationVector(rv)
            | ReportData::GameRotationVector(rv)
            | ReportData::GeomagneticRotationVector(rv)
            | ReportData::ArvrStabilizedRotationVector(rv)
            | ReportData::ArvrStabilizedGameRotationVector(rv) => Some(rv.quaternion()),
            ReportData::GyroIntegratedRotationVector(g) => Some(g.quaternion()),
            _ => None,
        }
    }

    /// Values of the three-axis reports in engineering units
    pub fn vector(&self) -> Option<[f32; 3]> {
        match &self.data {
            ReportData::Accelerometer(v)
            | ReportData::GyroscopeCalibrated(v)
            | ReportData::MagneticFieldCalibrated(v)
            | ReportData::LinearAcceleration(v)
            | ReportData::Gravity(v) => Some(v.values()),
            ReportData::GyroscopeUncalibrated(u) | ReportData::MagneticFieldUncalibrated(u) => {
                Some(u.values())
            }
            _ => None,
        }
    }
}

/// Device clock per channel, rebuilt from base timestamp records
#[derive(Debug, Default)]
pub struct TimestampClock {
    base_us: [i64; NUM_CHANNELS],
}

impl TimestampClock {
    /// Base timestamp reference, resets the channel clock
    pub fn set_base(&mut self, channel: Channel, ticks: u32) {
        self.base_us[channel.index()] = ticks as i64 * 100;
    }

    pub fn rebase(&mut self, channel: Channel, ticks: i32) {
        self.base_us[channel.index()] += ticks as i64 * 100;
    }

    /// Timestamp of a report delayed `delay_ticks` from the channel base
    pub fn stamp(&self, channel: Channel, delay_ticks: u16) -> u64 {
        (self.base_us[channel.index()] + delay_ticks as i64 * 100).max(0) as u64
    }

    pub fn reset(&mut self) {
        self.base_us = [0; NUM_CHANNELS];
    }
}

/// Helpers for reading little-endian fields at a cursor
pub struct ReportParser;

impl ReportParser {
    #[inline]
    pub fn read_u8(msg: &[u8], cursor: &mut usize) -> u8 {
        let val = msg[*cursor];
        *cursor += 1;
        val
    }

    #[inline]
    pub fn read_i16(msg: &[u8], cursor: &mut usize) -> i16 {
        let val = i16::from_le_bytes([msg[*cursor], msg[*cursor + 1]]);
        *cursor += 2;
        val
    }

    #[inline]
    pub fn read_u16(msg: &[u8], cursor: &mut usize) -> u16 {
        Self::read_i16(msg, cursor) as u16
    }

    #[inline]
    pub fn read_u32(msg: &[u8], cursor: &mut usize) -> u32 {
        let val = u32::from_le_bytes([
            msg[*cursor],
            msg[*cursor + 1],
            msg[*cursor + 2],
            msg[*cursor + 3],
        ]);
        *cursor += 4;
        val
    }

    fn read_i16s<const N: usize>(msg: &[u8], cursor: &mut usize) -> [i16; N] {
        let mut out = [0; N];
        for v in out.iter_mut() {
            *v = Self::read_i16(msg, cursor);
        }
        out
    }

    fn ensure(report_id: u8, msg: &[u8], needed: usize) -> Result<(), FramingError> {
        if msg.len() < needed {
            return Err(FramingError::Truncated {
                report_id,
                needed,
                available: msg.len(),
            });
        }
        Ok(())
    }
}

/// Decode the report at the start of `msg`.
pub fn decode_report(
    id: ReportId,
    msg: &[u8],
    channel: Channel,
    clock: &TimestampClock,
) -> Result<Report, FramingError> {
    ReportParser::ensure(id.into(), msg, id.report_len())?;

    let mut cursor = 1;
    let sequence = ReportParser::read_u8(msg, &mut cursor);
    let status = ReportParser::read_u8(msg, &mut cursor);
    let delay_lsb = ReportParser::read_u8(msg, &mut cursor);
    let delay = ((status as u16 >> 2) << 8) | delay_lsb as u16;
    let (q1, q2) = q_points(id.into()).unwrap_or((0, 0));

    let vector3 = |cursor: &mut usize| Vector3 {
        raw: ReportParser::read_i16s::<3>(msg, cursor),
        q_point: q1,
    };
    let uncalibrated = |cursor: &mut usize| UncalibratedVector3 {
        raw: ReportParser::read_i16s::<3>(msg, cursor),
        bias: ReportParser::read_i16s::<3>(msg, cursor),
        q_point: q1,
    };
    let rotation = |cursor: &mut usize, with_accuracy: bool| RotationVector {
        raw: ReportParser::read_i16s::<4>(msg, cursor),
        q_point: q1,
        raw_accuracy: with_accuracy.then(|| ReportParser::read_i16(msg, cursor)),
        accuracy_q_point: q2,
    };
    let raw_mems = |cursor: &mut usize| RawMems {
        raw: ReportParser::read_i16s::<3>(msg, cursor),
        extra: ReportParser::read_i16(msg, cursor),
        sensor_time_us: ReportParser::read_u32(msg, cursor),
    };

    let c = &mut cursor;
    let data = match id {
        ReportId::Accelerometer => ReportData::Accelerometer(vector3(c)),
        ReportId::GyroscopeCalibrated => ReportData::GyroscopeCalibrated(vector3(c)),
        ReportId::MagneticFieldCalibrated => ReportData::MagneticFieldCalibrated(vector3(c)),
        ReportId::LinearAcceleration => ReportData::LinearAcceleration(vector3(c)),
        ReportId::Gravity => ReportData::Gravity(vector3(c)),
        ReportId::GyroscopeUncalibrated => ReportData::GyroscopeUncalibrated(uncalibrated(c)),
        ReportId::MagneticFieldUncalibrated => {
            ReportData::MagneticFieldUncalibrated(uncalibrated(c))
        }
        ReportId::RotationVector => ReportData::RotationVector(rotation(c, true)),
        ReportId::GameRotationVector => ReportData::GameRotationVector(rotation(c, false)),
        ReportId::GeomagneticRotationVector => {
            ReportData::GeomagneticRotationVector(rotation(c, true))
        }
        ReportId::ArvrStabilizedRotationVector => {
            ReportData::ArvrStabilizedRotationVector(rotation(c, true))
        }
        ReportId::ArvrStabilizedGameRotationVector => {
            ReportData::ArvrStabilizedGameRotationVector(rotation(c, false))
        }
        ReportId::GyroIntegratedRotationVector => {
            ReportData::GyroIntegratedRotationVector(GyroIntegratedRotation {
                raw: ReportParser::read_i16s::<4>(msg, c),
                angular_velocity: ReportParser::read_i16s::<3>(msg, c),
            })
        }
        ReportId::TapDetector => ReportData::TapDetector(TapDetector {
            flags: ReportParser::read_u8(msg, c),
        }),
        ReportId::StepCounter => {
            let latency_us = ReportParser::read_u32(msg, c);
            let steps = ReportParser::read_u16(msg, c);
            ReportData::StepCounter(StepCounter { latency_us, steps })
        }
        ReportId::StabilityClassifier => ReportData::StabilityClassifier(
            Stability::from(ReportParser::read_u8(msg, c)),
        ),
        ReportId::ShakeDetector => ReportData::ShakeDetector(ShakeDetector {
            flags: ReportParser::read_u16(msg, c),
        }),
        ReportId::PersonalActivityClassifier => {
            let page = ReportParser::read_u8(msg, c);
            let most_likely = Activity::from(ReportParser::read_u8(msg, c));
            let mut confidence = [0u8; 10];
            confidence.copy_from_slice(&msg[*c..*c + 10]);
            ReportData::PersonalActivityClassifier(ActivityClassifier {
                page: page & 0x7F,
                last_page: page & 0x80 != 0,
                most_likely,
                confidence,
            })
        }
        ReportId::RawAccelerometer => ReportData::RawAccelerometer(raw_mems(c)),
        ReportId::RawGyroscope => ReportData::RawGyroscope(raw_mems(c)),
        ReportId::RawMagnetometer => ReportData::RawMagnetometer(raw_mems(c)),
    };

    let accuracy = match id {
        ReportId::TapDetector
        | ReportId::StepCounter
        | ReportId::StabilityClassifier
        | ReportId::ShakeDetector
        | ReportId::PersonalActivityClassifier => Accuracy::Undefined,
        _ => Accuracy::from_status(status),
    };

    Ok(Report {
        id,
        sequence,
        accuracy,
        timestamp_us: clock.stamp(channel, delay),
        data,
    })
}

/// Iterates over the records of one input report packet, applying timestamp
/// records to the clock as they are met.
pub struct InputReports<'a> {
    channel: Channel,
    msg: &'a [u8],
    cursor: usize,
    clock: &'a mut TimestampClock,
    done: bool,
}

impl<'a> InputReports<'a> {
    pub fn new(channel: Channel, msg: &'a [u8], clock: &'a mut TimestampClock) -> Self {
        Self {
            channel,
            msg,
            cursor: 0,
            clock,
            done: false,
        }
    }
}

impl Iterator for InputReports<'_> {
    type Item = Result<Report, FramingError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done && self.cursor < self.msg.len() {
            let rest = &self.msg[self.cursor..];
            let id = rest[0];
            match id {
                SHUB_BASE_TIMESTAMP | SHUB_TIMESTAMP_REBASE => {
                    if let Err(e) = ReportParser::ensure(id, rest, 5) {
                        self.done = true;
                        return Some(Err(e));
                    }
                    let mut c = 1;
                    let ticks = ReportParser::read_u32(rest, &mut c);
                    if id == SHUB_BASE_TIMESTAMP {
                        self.clock.set_base(self.channel, ticks);
                    } else {
                        self.clock.rebase(self.channel, ticks as i32);
                    }
                    self.cursor += 5;
                }
                _ => {
                    let Ok(report_id) = ReportId::try_from(id) else {
                        warn!(
                            "{:?}: unknown report 0x{:02X}, skipping {} bytes",
                            self.channel,
                            id,
                            rest.len()
                        );
                        self.done = true;
                        return None;
                    };
                    let result = decode_report(report_id, rest, self.channel, self.clock);
                    match result {
                        Ok(_) => self.cursor += report_id.report_len(),
                        Err(_) => self.done = true,
                    }
                    return Some(result);
                }
            }
        }
        None
    }
}

/// Quaternion and angular velocity of one gyro-integrated rotation vector
const GYRO_INTEGRATED_RECORD_LEN: usize = 14;

/// Decode the bare records of the gyro-integrated rotation vector channel
pub fn decode_gyro_integrated(
    msg: &[u8],
    sequence: u8,
    host_time_us: u64,
) -> Vec<Report> {
    if msg.len() % GYRO_INTEGRATED_RECORD_LEN != 0 {
        trace!(
            "gyro channel: {} trailing bytes",
            msg.len() % GYRO_INTEGRATED_RECORD_LEN
        );
    }
    msg.chunks_exact(GYRO_INTEGRATED_RECORD_LEN)
        .map(|chunk| {
            let mut c = 0;
            Report {
                id: ReportId::GyroIntegratedRotationVector,
                sequence,
                accuracy: Accuracy::Undefined,
                timestamp_us: host_time_us,
                data: ReportData::GyroIntegratedRotationVector(GyroIntegratedRotation {
                    raw: ReportParser::read_i16s::<4>(chunk, &mut c),
                    angular_velocity: ReportParser::read_i16s::<3>(chunk, &mut c),
                }),
            }
        })
        .collect()
}
