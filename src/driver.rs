// Copyright 2025 Au-Zone Technologies Inc.
// SPDX-License-Identifier: Apache-2.0

//! BNO08x sensor hub driver.
//!
//! [`Bno08x`] owns the engine threads and exposes the application API:
//! initialization, feature control, the latest value of every report,
//! callbacks, calibration, tare and the flash record system. Every call is
//! safe from any thread; request/response calls block the caller until the
//! hub answers or the configured timeout expires.

use crate::{
    calibration::{CalibrationProgress, CalibrationRequest, CalibrationState, CalibrationStatus},
    command::{
        product_id_request, reorientation_params, set_feature_command, tare_now_params,
        tare_persist_params, CommandResponse, FeatureSettings, PendingHandle, ProductId,
        ResetReason, Response, ResponseKey, TareBasis,
    },
    config::Config,
    constants::{
        EXECUTABLE_DEVICE_CMD_ON, EXECUTABLE_DEVICE_CMD_RESET, EXECUTABLE_DEVICE_CMD_SLEEP,
        FRS_TYPE_SENSOR_ORIENTATION, ME_CAL_GET, SH2_CMD_CLEAR_DCD_AND_RESET, SH2_CMD_DCD,
        SH2_CMD_DCD_PERIOD_SAVE, SH2_CMD_ME_CALIBRATE, SH2_CMD_TARE,
    },
    error::{Error, Result},
    frs::{quaternion_to_frs_words, FrsTransfer, SensorMetadata},
    interface::{Pin, SensorInterface, SpiConfig, SpiInterface},
    packet::Channel,
    pipeline::{lock, read, ActiveFrs, Pipeline, Shared},
    processor::ResetStatus,
    reports::{
        Accuracy, ActivityClassifier, Report, ReportData, ReportId, ShakeDetector, Stability,
        StepCounter, TapDetector,
    },
    store::CallbackKey,
};
use log::{debug, info, trace, warn};
use std::{
    sync::{
        atomic::Ordering,
        mpsc::{sync_channel, RecvTimeoutError},
        Arc,
    },
    time::{Duration, Instant},
};

/// Report interval used by [`Bno08x::calibrate`] for sensors not already on
const CALIBRATION_REPORT_INTERVAL: Duration = Duration::from_millis(50);

/// BNO08x sensor hub
///
/// Created over any [`SensorInterface`]; dropping it stops the engine.
pub struct Bno08x {
    shared: Arc<Shared>,
    pipeline: Pipeline,
}

impl Bno08x {
    /// Bring up the hub on `interface` and start the engine threads.
    ///
    /// The interface's `setup` (hardware reset) runs first. Call
    /// [`Bno08x::init`] afterwards to wait for the hub and read its product
    /// id.
    pub fn new<SI: SensorInterface>(mut interface: SI, config: Config) -> Result<Self> {
        trace!("driver setup");
        interface
            .setup()
            .map_err(|e| Error::Bus(format!("{:?}", e)))?;
        let shared = Arc::new(Shared::new(config));
        let pipeline = Pipeline::spawn(interface, Arc::clone(&shared))?;
        Ok(Self { shared, pipeline })
    }

    /// Open the hub on Linux spidev with the default engine configuration
    pub fn open_spi(spi: &SpiConfig) -> Result<Self> {
        Self::new(SpiInterface::open(spi)?, Config::default())
    }

    /// Create a new BNO08x driver using SPI with explicit GPIO chip and pin
    /// numbers
    ///
    /// # Arguments
    /// * `spidevice` - Path to the SPI device (e.g., "/dev/spidev1.0")
    /// * `hintn_gpiochip` - GPIO chip for the interrupt pin
    /// * `hintn_pin` - GPIO pin number for the interrupt
    /// * `reset_gpiochip` - GPIO chip for the reset pin
    /// * `reset_pin` - GPIO pin number for reset
    pub fn new_spi(
        spidevice: &str,
        hintn_gpiochip: &str,
        hintn_pin: u32,
        reset_gpiochip: &str,
        reset_pin: u32,
    ) -> Result<Self> {
        Self::open_spi(&SpiConfig::new(
            spidevice,
            Pin::Line {
                chip: hintn_gpiochip.into(),
                offset: hintn_pin,
            },
            Pin::Line {
                chip: reset_gpiochip.into(),
                offset: reset_pin,
            },
        ))
    }

    /// Create a new BNO08x driver using SPI with GPIO pin names (symbol lookup)
    ///
    /// # Arguments
    /// * `spidevice` - Path to the SPI device (e.g., "/dev/spidev1.0")
    /// * `hintn_pin` - Symbolic name of the interrupt pin (e.g., "IMU_INT")
    /// * `reset_pin` - Symbolic name of the reset pin (e.g., "IMU_RST")
    pub fn new_spi_from_symbol(spidevice: &str, hintn_pin: &str, reset_pin: &str) -> Result<Self> {
        Self::open_spi(&SpiConfig::new(
            spidevice,
            Pin::Named(hintn_pin.into()),
            Pin::Named(reset_pin.into()),
        ))
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    // =========================================================================
    // Reset and power
    // =========================================================================

    /// Wait for the hub to come out of reset, then read its product id.
    ///
    /// The BNO08x starts up with all sensors disabled, waiting for the
    /// application to configure it.
    pub fn init(&self) -> Result<ProductId> {
        trace!("driver init");
        if !self.wait_for_reset(0, self.shared.config.reset_timeout) {
            debug!(
                "no reset indication within {:?}",
                self.shared.config.reset_timeout
            );
        }
        let pid = match self.product_id() {
            Err(Error::ResetOccurred) => {
                debug!("hub reset while reading the product id, retrying");
                self.product_id()
            }
            other => other,
        }?;
        info!(
            "BNO08x part {} sw {}.{}.{} build {}",
            pid.part_number, pid.sw_major, pid.sw_minor, pid.patch, pid.build_number
        );
        Ok(pid)
    }

    /// Request the product id. The response also carries the reset cause.
    pub fn product_id(&self) -> Result<ProductId> {
        let handle = self.submit(ResponseKey::ProductId, |shared| {
            shared.queue(Channel::HubControl, &product_id_request())?;
            Ok(None)
        })?;
        match self.await_response(handle, "product id")? {
            Response::ProductId(pid) => Ok(pid),
            _ => Err(Error::UnmatchedResponse(ResponseKey::ProductId)),
        }
    }

    /// Tell the sensor to reset and wait for it to come back.
    ///
    /// All enabled reports are off afterwards.
    pub fn soft_reset(&self) -> Result<()> {
        trace!("soft_reset");
        let seen = self.reset_count();
        self.send_executable(EXECUTABLE_DEVICE_CMD_RESET)?;
        self.expect_reset(seen)
    }

    /// Put the hub to sleep
    pub fn sleep(&self) -> Result<()> {
        self.send_executable(EXECUTABLE_DEVICE_CMD_SLEEP)
    }

    /// Wake the hub from sleep
    pub fn wake(&self) -> Result<()> {
        self.send_executable(EXECUTABLE_DEVICE_CMD_ON)
    }

    /// Cause of the latest reset, as reported by the last product id response
    pub fn reset_reason(&self) -> ResetReason {
        lock(&self.shared.control).reset.reason
    }

    /// Hub resets observed since the engine started
    pub fn reset_count(&self) -> u32 {
        lock(&self.shared.control).reset.count
    }

    pub fn reset_status(&self) -> ResetStatus {
        lock(&self.shared.control).reset
    }

    fn send_executable(&self, command: u8) -> Result<()> {
        let mut control = lock(&self.shared.control);
        control.requested();
        self.shared.queue(Channel::Executable, &[command])?;
        Ok(())
    }

    fn expect_reset(&self, seen: u32) -> Result<()> {
        if self.wait_for_reset(seen, self.shared.config.reset_timeout) {
            Ok(())
        } else {
            Err(Error::Timeout("reset complete"))
        }
    }

    /// Block until more than `seen` resets have been handled
    fn wait_for_reset(&self, seen: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut control = lock(&self.shared.control);
        while control.reset.count <= seen {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            control = match self.shared.control_cv.wait_timeout(control, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Queue a request and register the slot its response will complete.
    ///
    /// Both happen under the control lock so the response cannot be
    /// processed before the slot exists.
    fn submit(
        &self,
        key: ResponseKey,
        queue: impl FnOnce(&Shared) -> Result<Option<u8>>,
    ) -> Result<PendingHandle> {
        let mut control = lock(&self.shared.control);
        control.requested();
        let command_sequence = queue(&self.shared)?;
        Ok(control.pending.register(key, command_sequence))
    }

    fn await_response(&self, handle: PendingHandle, what: &'static str) -> Result<Response> {
        match handle.rx.recv_timeout(self.shared.config.command_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.shared.mark_unresponsive(what);
                lock(&self.shared.control).pending.release(handle.token);
                // resolved between the timeout and the release
                if let Ok(result) = handle.rx.try_recv() {
                    return result;
                }
                warn!("timed out waiting for {}", what);
                Err(Error::Timeout(what))
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::Shutdown),
        }
    }

    /// Send a command request and wait for its response
    pub fn command(&self, command: u8, params: &[u8]) -> Result<CommandResponse> {
        let handle = self.submit(ResponseKey::Command(command), |shared| {
            shared.queue_command(command, params).map(Some)
        })?;
        match self.await_response(handle, "command response")? {
            Response::Command(r) => Ok(r),
            _ => Err(Error::UnmatchedResponse(ResponseKey::Command(command))),
        }
    }

    /// Send a command request that has no response
    pub fn send_command(&self, command: u8, params: &[u8]) -> Result<()> {
        let mut control = lock(&self.shared.control);
        control.requested();
        self.shared.queue_command(command, params)?;
        Ok(())
    }

    /// Run a command and fail on a non-zero status
    fn checked_command(&self, command: u8, params: &[u8]) -> Result<CommandResponse> {
        let response = self.command(command, params)?;
        match response.status() {
            0 => Ok(response),
            status => Err(Error::CommandFailed { command, status }),
        }
    }

    // =========================================================================
    // Feature control
    // =========================================================================

    /// Enable a sensor report with the specified update interval.
    ///
    /// Returns the settings the hub actually applied.
    pub fn enable_report(&self, id: ReportId, interval: Duration) -> Result<FeatureSettings> {
        self.enable_report_with(id, FeatureSettings::with_interval(interval))
    }

    /// Set every feature parameter of a report. An interval of zero disables
    /// it.
    pub fn enable_report_with(&self, id: ReportId, settings: FeatureSettings) -> Result<FeatureSettings> {
        trace!("enable_report 0x{:X}", u8::from(id));
        let body = set_feature_command(id.into(), &settings);
        let handle = {
            let mut control = lock(&self.shared.control);
            control.requested();
            self.shared.queue(Channel::HubControl, &body)?;
            if settings.interval_us > 0 {
                control.enabled.insert(id);
            } else {
                control.enabled.remove(id);
            }
            control.pending.register(ResponseKey::Feature(id.into()), None)
        };
        match self.await_response(handle, "feature response")? {
            Response::Feature(r) => {
                if r.settings.interval_us != settings.interval_us {
                    debug!(
                        "report 0x{:02X}: asked for {} us, hub runs at {} us",
                        u8::from(id),
                        settings.interval_us,
                        r.settings.interval_us
                    );
                }
                Ok(r.settings)
            }
            _ => Err(Error::UnmatchedResponse(ResponseKey::Feature(id.into()))),
        }
    }

    pub fn disable_report(&self, id: ReportId) -> Result<()> {
        self.enable_report_with(id, FeatureSettings::default()).map(|_| ())
    }

    /// Check if a report is enabled
    pub fn is_report_enabled(&self, id: ReportId) -> bool {
        lock(&self.shared.control).enabled.contains(id)
    }

    /// Enable reporting of acceleration including gravity
    pub fn enable_accelerometer(&self, interval: Duration) -> Result<FeatureSettings> {
        self.enable_report(ReportId::Accelerometer, interval)
    }

    /// Enable reporting of calibrated gyroscope data.
    pub fn enable_gyro(&self, interval: Duration) -> Result<FeatureSettings> {
        self.enable_report(ReportId::GyroscopeCalibrated, interval)
    }

    pub fn enable_gyro_uncalib(&self, interval: Duration) -> Result<FeatureSettings> {
        self.enable_report(ReportId::GyroscopeUncalibrated, interval)
    }

    pub fn enable_mag_field(&self, interval: Duration) -> Result<FeatureSettings> {
        self.enable_report(ReportId::MagneticFieldCalibrated, interval)
    }

    pub fn enable_mag_field_uncalib(&self, interval: Duration) -> Result<FeatureSettings> {
        self.enable_report(ReportId::MagneticFieldUncalibrated, interval)
    }

    /// Enable reporting of linear acceleration vector.
    pub fn enable_linear_accel(&self, interval: Duration) -> Result<FeatureSettings> {
        self.enable_report(ReportId::LinearAcceleration, interval)
    }

    /// Enable reporting of gravity vector.
    pub fn enable_gravity(&self, interval: Duration) -> Result<FeatureSettings> {
        self.enable_report(ReportId::Gravity, interval)
    }

    /// Enable reporting of rotation vector (fused quaternion).
    ///
    /// Note that the maximum valid update rate is 1 kHz, based on the max
    /// update rate of the sensor's gyros.
    pub fn enable_rotation_vector(&self, interval: Duration) -> Result<FeatureSettings> {
        self.enable_report(ReportId::RotationVector, interval)
    }

    /// Rotation vector without the magnetometer
    pub fn enable_game_rotation_vector(&self, interval: Duration) -> Result<FeatureSettings> {
        self.enable_report(ReportId::GameRotationVector, interval)
    }

    /// Rotation vector without the gyroscope
    pub fn enable_geomag_rotation_vector(&self, interval: Duration) -> Result<FeatureSettings> {
        self.enable_report(ReportId::GeomagneticRotationVector, interval)
    }

    pub fn enable_arvr_rotation_vector(&self, interval: Duration) -> Result<FeatureSettings> {
        self.enable_report(ReportId::ArvrStabilizedRotationVector, interval)
    }

    pub fn enable_arvr_game_rotation_vector(&self, interval: Duration) -> Result<FeatureSettings> {
        self.enable_report(ReportId::ArvrStabilizedGameRotationVector, interval)
    }

    /// Enable the gyro-integrated rotation vector, delivered on its own
    /// channel at up to 1 kHz
    pub fn enable_gyro_integrated_rotation_vector(&self, interval: Duration) -> Result<FeatureSettings> {
        self.enable_report(ReportId::GyroIntegratedRotationVector, interval)
    }

    pub fn enable_raw_accelerometer(&self, interval: Duration) -> Result<FeatureSettings> {
        self.enable_report(ReportId::RawAccelerometer, interval)
    }

    pub fn enable_raw_gyro(&self, interval: Duration) -> Result<FeatureSettings> {
        self.enable_report(ReportId::RawGyroscope, interval)
    }

    pub fn enable_raw_mag(&self, interval: Duration) -> Result<FeatureSettings> {
        self.enable_report(ReportId::RawMagnetometer, interval)
    }

    pub fn enable_tap_detector(&self, interval: Duration) -> Result<FeatureSettings> {
        self.enable_report(ReportId::TapDetector, interval)
    }

    pub fn enable_step_counter(&self, interval: Duration) -> Result<FeatureSettings> {
        self.enable_report(ReportId::StepCounter, interval)
    }

    pub fn enable_stability_classifier(&self, interval: Duration) -> Result<FeatureSettings> {
        self.enable_report(ReportId::StabilityClassifier, interval)
    }

    pub fn enable_shake_detector(&self, interval: Duration) -> Result<FeatureSettings> {
        self.enable_report(ReportId::ShakeDetector, interval)
    }

    /// Enable the personal activity classifier for the activities set in
    /// `activity_mask` (see [`crate::reports::ACTIVITY_MASK_ALL`])
    pub fn enable_activity_classifier(
        &self,
        interval: Duration,
        activity_mask: u32,
    ) -> Result<FeatureSettings> {
        self.enable_report_with(
            ReportId::PersonalActivityClassifier,
            FeatureSettings::with_interval(interval).sensor_specific(activity_mask),
        )
    }

    // =========================================================================
    // Latest values
    // =========================================================================

    /// Latest report of a type, if one has arrived
    pub fn report(&self, id: ReportId) -> Option<Report> {
        read(&self.shared.store).get(id)
    }

    /// Host time of the last update for a report, microseconds since the
    /// engine started; 0 if none arrived
    pub fn report_update_time(&self, id: ReportId) -> u64 {
        read(&self.shared.store).last_update_time(id)
    }

    pub fn accuracy(&self, id: ReportId) -> Option<Accuracy> {
        self.report(id).map(|r| r.accuracy)
    }

    fn vector(&self, id: ReportId) -> Option<[f32; 3]> {
        self.report(id).and_then(|r| r.vector())
    }

    fn quaternion(&self, id: ReportId) -> Option<[f32; 4]> {
        self.report(id).and_then(|r| r.quaternion())
    }

    /// Get accelerometer data [x, y, z] in m/s^2
    pub fn accelerometer(&self) -> Option<[f32; 3]> {
        self.vector(ReportId::Accelerometer)
    }

    /// Get linear acceleration [x, y, z] in m/s^2 (gravity removed)
    pub fn linear_accel(&self) -> Option<[f32; 3]> {
        self.vector(ReportId::LinearAcceleration)
    }

    /// Get gravity vector [x, y, z] in m/s^2
    pub fn gravity(&self) -> Option<[f32; 3]> {
        self.vector(ReportId::Gravity)
    }

    /// Get calibrated gyroscope data [x, y, z] in rad/s
    pub fn gyro(&self) -> Option<[f32; 3]> {
        self.vector(ReportId::GyroscopeCalibrated)
    }

    /// Get uncalibrated gyroscope data [x, y, z] in rad/s
    pub fn gyro_uncalib(&self) -> Option<[f32; 3]> {
        self.vector(ReportId::GyroscopeUncalibrated)
    }

    /// Get calibrated magnetic field [x, y, z] in uT (micro-Tesla)
    pub fn mag_field(&self) -> Option<[f32; 3]> {
        self.vector(ReportId::MagneticFieldCalibrated)
    }

    pub fn mag_field_uncalib(&self) -> Option<[f32; 3]> {
        self.vector(ReportId::MagneticFieldUncalibrated)
    }

    /// Get rotation quaternion [i, j, k, real] (unit quaternion)
    pub fn rotation_quaternion(&self) -> Option<[f32; 4]> {
        self.quaternion(ReportId::RotationVector)
    }

    /// Get rotation accuracy estimate in radians
    pub fn rotation_acc(&self) -> Option<f32> {
        match self.report(ReportId::RotationVector)?.data {
            ReportData::RotationVector(rv) => rv.heading_accuracy(),
            _ => None,
        }
    }

    /// Get game rotation quaternion [i, j, k, real] (unit quaternion)
    pub fn game_rotation_quaternion(&self) -> Option<[f32; 4]> {
        self.quaternion(ReportId::GameRotationVector)
    }

    /// Get geomagnetic rotation quaternion [i, j, k, real] (unit quaternion)
    pub fn geomag_rotation_quaternion(&self) -> Option<[f32; 4]> {
        self.quaternion(ReportId::GeomagneticRotationVector)
    }

    /// Get geomagnetic rotation accuracy estimate in radians
    pub fn geomag_rotation_acc(&self) -> Option<f32> {
        match self.report(ReportId::GeomagneticRotationVector)?.data {
            ReportData::GeomagneticRotationVector(rv) => rv.heading_accuracy(),
            _ => None,
        }
    }

    pub fn arvr_rotation_quaternion(&self) -> Option<[f32; 4]> {
        self.quaternion(ReportId::ArvrStabilizedRotationVector)
    }

    pub fn arvr_game_rotation_quaternion(&self) -> Option<[f32; 4]> {
        self.quaternion(ReportId::ArvrStabilizedGameRotationVector)
    }

    pub fn gyro_integrated_rotation(&self) -> Option<[f32; 4]> {
        self.quaternion(ReportId::GyroIntegratedRotationVector)
    }

    pub fn tap(&self) -> Option<TapDetector> {
        match self.report(ReportId::TapDetector)?.data {
            ReportData::TapDetector(tap) => Some(tap),
            _ => None,
        }
    }

    pub fn step_counter(&self) -> Option<StepCounter> {
        match self.report(ReportId::StepCounter)?.data {
            ReportData::StepCounter(steps) => Some(steps),
            _ => None,
        }
    }

    pub fn stability(&self) -> Option<Stability> {
        match self.report(ReportId::StabilityClassifier)?.data {
            ReportData::StabilityClassifier(stability) => Some(stability),
            _ => None,
        }
    }

    pub fn shake(&self) -> Option<ShakeDetector> {
        match self.report(ReportId::ShakeDetector)?.data {
            ReportData::ShakeDetector(shake) => Some(shake),
            _ => None,
        }
    }

    pub fn activity(&self) -> Option<ActivityClassifier> {
        match self.report(ReportId::PersonalActivityClassifier)?.data {
            ReportData::PersonalActivityClassifier(activity) => Some(activity),
            _ => None,
        }
    }

    // =========================================================================
    // Callbacks and notifications
    // =========================================================================

    /// Add a callback invoked on the processing thread for every matching
    /// report. Returns false if `name` is already registered for `key`.
    pub fn add_report_callback(
        &self,
        key: impl Into<CallbackKey>,
        name: impl Into<String>,
        callback: impl Fn(&Report) + Send + Sync + 'static,
    ) -> bool {
        lock(&self.shared.callbacks).add(key.into(), name.into(), Arc::new(callback))
    }

    /// Remove a callback by key and name
    pub fn remove_report_callback(&self, key: impl Into<CallbackKey>, name: &str) -> bool {
        lock(&self.shared.callbacks).remove(key.into(), name)
    }

    /// Block until a packet arrives on `channel`, any channel for `None`.
    /// Returns false on timeout.
    pub fn wait_for_data(&self, channel: Option<Channel>, timeout: Duration) -> bool {
        self.shared.notifier.wait(channel, timeout)
    }

    /// False once a bounded wait with requests outstanding expired without
    /// hearing from the hub; true again on the next received frame
    pub fn is_responsive(&self) -> bool {
        self.shared.responsive.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Calibration
    // =========================================================================

    /// Start the motion engine calibration routines in `request`. The session
    /// completes once each requested sensor reports `threshold` accuracy.
    ///
    /// The reports carrying that accuracy must be enabled for the session to
    /// make progress; [`Bno08x::calibrate`] takes care of it.
    pub fn start_calibration(&self, request: CalibrationRequest, threshold: Accuracy) -> Result<()> {
        let params = {
            let mut control = lock(&self.shared.control);
            control.calibration.request(request, threshold)?;
            control.calibration.configure_params()
        };
        if let Err(e) = self.checked_command(SH2_CMD_ME_CALIBRATE, &params) {
            self.abort_session();
            return Err(e);
        }
        lock(&self.shared.control).calibration.queued();
        info!("calibration started: {:?}", request);
        Ok(())
    }

    pub fn calibration_state(&self) -> CalibrationState {
        lock(&self.shared.control).calibration.state()
    }

    pub fn calibration_progress(&self) -> CalibrationProgress {
        lock(&self.shared.control).calibration.progress()
    }

    /// Block until the running session completes or is aborted
    pub fn wait_calibration(&self, timeout: Duration) -> Result<CalibrationProgress> {
        let deadline = Instant::now() + timeout;
        let mut control = lock(&self.shared.control);
        loop {
            match control.calibration.state() {
                CalibrationState::Completed => return Ok(control.calibration.progress()),
                CalibrationState::Aborted => return Err(Error::CalibrationAborted),
                CalibrationState::Idle => {
                    return Err(Error::InvalidCalibrationState(CalibrationState::Idle))
                }
                CalibrationState::Requested | CalibrationState::InProgress => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout("calibration"));
            }
            control = self
                .shared
                .control_cv
                .wait_timeout(control, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Turn the calibration routines off and abort the session
    pub fn stop_calibration(&self) -> Result<()> {
        let result = self.checked_command(
            SH2_CMD_ME_CALIBRATE,
            &CalibrationRequest::default().me_calibrate_params(0),
        );
        if self.abort_session() {
            info!("calibration stopped");
        }
        result.map(|_| ())
    }

    fn abort_session(&self) -> bool {
        let aborted = lock(&self.shared.control).calibration.abort();
        self.shared.control_cv.notify_all();
        aborted
    }

    /// Save the dynamic calibration data to flash. Only valid once a session
    /// has completed.
    pub fn save_calibration(&self) -> Result<()> {
        lock(&self.shared.control).calibration.ensure_saveable()?;
        self.checked_command(SH2_CMD_DCD, &[])?;
        info!("calibration saved");
        Ok(())
    }

    /// Clear the dynamic calibration data and reset the hub
    pub fn clear_calibration(&self) -> Result<()> {
        let seen = self.reset_count();
        self.send_command(SH2_CMD_CLEAR_DCD_AND_RESET, &[])?;
        self.expect_reset(seen)
    }

    /// Which calibration routines the motion engine has enabled
    pub fn calibration_status(&self) -> Result<CalibrationStatus> {
        let params = CalibrationRequest::default().me_calibrate_params(ME_CAL_GET);
        let response = self.command(SH2_CMD_ME_CALIBRATE, &params)?;
        Ok(CalibrationStatus::from(&response))
    }

    /// Enable or disable the hub's periodic saving of calibration data
    pub fn set_dcd_auto_save(&self, enabled: bool) -> Result<()> {
        // P0: 0 enables, 1 disables
        self.send_command(SH2_CMD_DCD_PERIOD_SAVE, &[u8::from(!enabled)])
    }

    /// Enable the reports needed, run a session to completion and save it.
    /// The session is stopped if it fails.
    pub fn calibrate(
        &self,
        request: CalibrationRequest,
        threshold: Accuracy,
        timeout: Duration,
    ) -> Result<CalibrationProgress> {
        let mut reports = Vec::new();
        if request.accelerometer || request.planar_accelerometer {
            reports.push(ReportId::Accelerometer);
        }
        if request.gyroscope {
            reports.push(ReportId::GyroscopeCalibrated);
        }
        if request.magnetometer {
            reports.push(ReportId::MagneticFieldCalibrated);
        }
        for id in reports {
            if !self.is_report_enabled(id) {
                self.enable_report(id, CALIBRATION_REPORT_INTERVAL)?;
            }
        }

        self.start_calibration(request, threshold)?;
        let progress = match self.wait_calibration(timeout) {
            Ok(progress) => progress,
            Err(e) => {
                if let Err(stop) = self.stop_calibration() {
                    debug!("stopping calibration: {}", stop);
                }
                return Err(e);
            }
        };
        self.save_calibration()?;
        Ok(progress)
    }

    // =========================================================================
    // Tare
    // =========================================================================

    /// Make the current orientation the reference for the axes in `axes`
    /// (see [`crate::command::TARE_AXIS_ALL`]) of the rotation vector `basis`
    pub fn tare_now(&self, axes: u8, basis: TareBasis) -> Result<()> {
        self.send_command(SH2_CMD_TARE, &tare_now_params(axes, basis))
    }

    /// Store the current tare in flash
    pub fn persist_tare(&self) -> Result<()> {
        self.send_command(SH2_CMD_TARE, &tare_persist_params())
    }

    /// Set the reference orientation to the quaternion `[i, j, k, real]`
    pub fn set_reorientation(&self, q: [f32; 4]) -> Result<()> {
        self.send_command(SH2_CMD_TARE, &reorientation_params(q))
    }

    /// Remove any tare
    pub fn clear_tare(&self) -> Result<()> {
        self.set_reorientation([0.0; 4])
    }

    // =========================================================================
    // Flash record system
    // =========================================================================

    fn frs_transfer(&self, transfer: FrsTransfer, request: &[u8]) -> Result<Vec<u32>> {
        let record = transfer.record();
        let (done, rx) = sync_channel(1);
        let token = {
            let mut control = lock(&self.shared.control);
            if control.frs.is_some() {
                return Err(Error::Busy);
            }
            control.requested();
            self.shared.queue(Channel::HubControl, request)?;
            let token = control.next_frs_token;
            control.next_frs_token += 1;
            control.frs = Some(ActiveFrs {
                token,
                transfer,
                done,
            });
            token
        };
        trace!("FRS 0x{:04X}: transfer {} started", record, token);

        match rx.recv_timeout(self.shared.config.frs_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.shared.mark_unresponsive("FRS");
                {
                    let mut control = lock(&self.shared.control);
                    if control.frs.as_ref().is_some_and(|a| a.token == token) {
                        control.frs = None;
                    }
                }
                if let Ok(result) = rx.try_recv() {
                    return result;
                }
                warn!("FRS 0x{:04X}: timed out", record);
                Err(Error::Timeout("FRS response"))
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::Shutdown),
        }
    }

    /// Read `count` words of a record starting at word `offset`; a count of 0
    /// reads to the end of the record
    pub fn frs_read(&self, record: u16, offset: u16, count: u16) -> Result<Vec<u32>> {
        let (transfer, request) = FrsTransfer::read(record, offset, count);
        self.frs_transfer(transfer, &request)
    }

    /// Replace a record with `words`
    pub fn frs_write(&self, record: u16, words: &[u32]) -> Result<()> {
        let (transfer, request) = FrsTransfer::write(record, words);
        self.frs_transfer(transfer, &request).map(|_| ())
    }

    /// Erase a record, restoring its default
    pub fn frs_erase(&self, record: u16) -> Result<()> {
        self.frs_write(record, &[])
    }

    /// Read a sensor metadata record (0xE3xx, e.g. `FRS_META_ACCELEROMETER`)
    pub fn sensor_metadata(&self, record: u16) -> Result<SensorMetadata> {
        let words = self.frs_read(record, 0, 0)?;
        Ok(SensorMetadata::from_words(&words)?)
    }

    /// Set the sensor orientation using a quaternion.
    ///
    /// This configures the reference frame transformation applied to all
    /// sensor outputs. Takes effect after the next reset.
    pub fn set_sensor_orientation(&self, qi: f32, qj: f32, qk: f32, qr: f32) -> Result<()> {
        self.frs_write(
            FRS_TYPE_SENSOR_ORIENTATION,
            &quaternion_to_frs_words(qi, qj, qk, qr),
        )
    }
}

impl Drop for Bno08x {
    fn drop(&mut self) {
        debug!("shutting down");
        self.pipeline.shutdown(&self.shared);
    }
}
