// Copyright 2025 Au-Zone Technologies Inc.
// SPDX-License-Identifier: Apache-2.0

//! Motion engine calibration sessions.
//!
//! A session moves `Idle -> Requested -> InProgress -> {Completed, Aborted}`.
//! While in progress, reports from calibratable sensors update their
//! accuracy; the session completes once every requested sensor has reached
//! the threshold at least once.

use crate::{
    command::CommandResponse,
    constants::{COMMAND_PARAM_COUNT, ME_CAL_CONFIGURE},
    error::Error,
    reports::{Accuracy, Report, ReportId},
};
use log::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalibrationState {
    #[default]
    Idle,
    Requested,
    InProgress,
    Completed,
    Aborted,
}

/// Sensors the motion engine can calibrate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibratedSensor {
    Accelerometer = 0,
    Gyroscope = 1,
    Magnetometer = 2,
    PlanarAccelerometer = 3,
}

impl CalibratedSensor {
    pub const ALL: [CalibratedSensor; 4] = [
        CalibratedSensor::Accelerometer,
        CalibratedSensor::Gyroscope,
        CalibratedSensor::Magnetometer,
        CalibratedSensor::PlanarAccelerometer,
    ];

    /// Sensors whose accuracy a report carries
    pub fn from_report(id: ReportId) -> &'static [CalibratedSensor] {
        match id {
            ReportId::Accelerometer => &[
                CalibratedSensor::Accelerometer,
                CalibratedSensor::PlanarAccelerometer,
            ],
            ReportId::GyroscopeCalibrated | ReportId::GyroscopeUncalibrated => {
                &[CalibratedSensor::Gyroscope]
            }
            ReportId::MagneticFieldCalibrated | ReportId::MagneticFieldUncalibrated => {
                &[CalibratedSensor::Magnetometer]
            }
            _ => &[],
        }
    }
}

/// Which calibration routines to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CalibrationRequest {
    pub accelerometer: bool,
    pub gyroscope: bool,
    pub magnetometer: bool,
    pub planar_accelerometer: bool,
    /// Enable the on-table calibration routine
    pub on_table: bool,
}

impl CalibrationRequest {
    /// Accelerometer, gyroscope and magnetometer
    pub fn all() -> Self {
        Self {
            accelerometer: true,
            gyroscope: true,
            magnetometer: true,
            ..Default::default()
        }
    }

    pub fn accelerometer() -> Self {
        Self {
            accelerometer: true,
            ..Default::default()
        }
    }

    pub fn gyroscope() -> Self {
        Self {
            gyroscope: true,
            ..Default::default()
        }
    }

    pub fn magnetometer() -> Self {
        Self {
            magnetometer: true,
            ..Default::default()
        }
    }

    pub fn planar_accelerometer() -> Self {
        Self {
            planar_accelerometer: true,
            ..Default::default()
        }
    }

    pub fn with(mut self, sensor: CalibratedSensor) -> Self {
        match sensor {
            CalibratedSensor::Accelerometer => self.accelerometer = true,
            CalibratedSensor::Gyroscope => self.gyroscope = true,
            CalibratedSensor::Magnetometer => self.magnetometer = true,
            CalibratedSensor::PlanarAccelerometer => self.planar_accelerometer = true,
        }
        self
    }

    pub fn includes(&self, sensor: CalibratedSensor) -> bool {
        match sensor {
            CalibratedSensor::Accelerometer => self.accelerometer,
            CalibratedSensor::Gyroscope => self.gyroscope,
            CalibratedSensor::Magnetometer => self.magnetometer,
            CalibratedSensor::PlanarAccelerometer => self.planar_accelerometer,
        }
    }

    pub fn is_empty(&self) -> bool {
        !CalibratedSensor::ALL.iter().any(|s| self.includes(*s))
    }

    /// ME calibration command parameters P0..P8 for `subcommand`
    pub fn me_calibrate_params(&self, subcommand: u8) -> [u8; COMMAND_PARAM_COUNT] {
        let mut p = [0u8; COMMAND_PARAM_COUNT];
        p[0] = self.accelerometer as u8;
        p[1] = self.gyroscope as u8;
        p[2] = self.magnetometer as u8;
        p[3] = subcommand;
        p[4] = self.planar_accelerometer as u8;
        p[5] = self.on_table as u8;
        p
    }
}

/// Routines the motion engine reports as enabled (ME calibration get)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationStatus {
    pub status: u8,
    pub enabled: CalibrationRequest,
}

impl From<&CommandResponse> for CalibrationStatus {
    fn from(r: &CommandResponse) -> Self {
        Self {
            status: r.results[0],
            enabled: CalibrationRequest {
                accelerometer: r.results[1] != 0,
                gyroscope: r.results[2] != 0,
                magnetometer: r.results[3] != 0,
                planar_accelerometer: r.results[4] != 0,
                on_table: r.results[5] != 0,
            },
        }
    }
}

/// Snapshot of a session for callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationProgress {
    pub state: CalibrationState,
    pub request: CalibrationRequest,
    pub threshold: Accuracy,
    /// Latest accuracy per [`CalibratedSensor`]
    pub accuracy: [Accuracy; 4],
    /// Threshold reached at least once
    pub reached: [bool; 4],
}

#[derive(Debug, Default)]
pub struct CalibrationSession {
    state: CalibrationState,
    request: CalibrationRequest,
    threshold: Accuracy,
    accuracy: [Accuracy; 4],
    reached: [bool; 4],
}

impl CalibrationSession {
    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn progress(&self) -> CalibrationProgress {
        CalibrationProgress {
            state: self.state,
            request: self.request,
            threshold: self.threshold,
            accuracy: self.accuracy,
            reached: self.reached,
        }
    }

    /// Start a new session. Not allowed while one is running, and the
    /// request must name at least one sensor.
    pub fn request(&mut self, request: CalibrationRequest, threshold: Accuracy) -> Result<(), Error> {
        if request.is_empty() {
            return Err(Error::InvalidArgument("calibration request names no sensor"));
        }
        if matches!(
            self.state,
            CalibrationState::Requested | CalibrationState::InProgress
        ) {
            return Err(Error::InvalidCalibrationState(self.state));
        }
        *self = Self {
            state: CalibrationState::Requested,
            request,
            threshold,
            ..Default::default()
        };
        debug!("calibration requested: {:?}", request);
        Ok(())
    }

    /// The ME calibrate command has been queued
    pub fn queued(&mut self) {
        if self.state == CalibrationState::Requested {
            self.state = CalibrationState::InProgress;
        }
    }

    /// Track the accuracy a report carries. Returns true when this report
    /// completed the session.
    pub fn on_report(&mut self, report: &Report) -> bool {
        if self.state != CalibrationState::InProgress {
            return false;
        }
        for sensor in CalibratedSensor::from_report(report.id) {
            let idx = *sensor as usize;
            self.accuracy[idx] = report.accuracy;
            if report.accuracy.meets(self.threshold) {
                self.reached[idx] = true;
            }
        }
        let done = CalibratedSensor::ALL
            .iter()
            .filter(|s| self.request.includes(**s))
            .all(|s| self.reached[*s as usize]);
        if done {
            info!("calibration completed: {:?}", self.request);
            self.state = CalibrationState::Completed;
        }
        done
    }

    /// Abort a requested or running session. Returns true if one was aborted.
    pub fn abort(&mut self) -> bool {
        if matches!(
            self.state,
            CalibrationState::Requested | CalibrationState::InProgress
        ) {
            self.state = CalibrationState::Aborted;
            return true;
        }
        false
    }

    /// Saving is only valid once the session has completed
    pub fn ensure_saveable(&self) -> Result<(), Error> {
        match self.state {
            CalibrationState::Completed => Ok(()),
            other => Err(Error::InvalidCalibrationState(other)),
        }
    }

    pub fn configure_params(&self) -> [u8; COMMAND_PARAM_COUNT] {
        self.request.me_calibrate_params(ME_CAL_CONFIGURE)
    }
}
