// Copyright 2025 Au-Zone Technologies Inc.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests of the engine over the in-memory hub.
//!
//! `Hub` answers product id, set feature, command and FRS requests the way
//! the BNO08x does; tests push sensor traffic through the `MockHandle`.

use bno08x_shtp::{
    command::{TareBasis, TARE_AXIS_ALL},
    constants::{
        FRS_META_ACCELEROMETER, FRS_TYPE_SENSOR_ORIENTATION, ME_CAL_GET, SH2_CMD_DCD,
        SH2_CMD_ME_CALIBRATE, SH2_CMD_TARE,
    },
    frs::quaternion_to_frs_words,
    packet::Packet,
    Accuracy, Bno08x, CalibrationRequest, CalibrationState, CallbackKey, Channel, Config, Error,
    FrsError, MockHandle, MockInterface, Report, ReportId, ResetReason,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Once,
    },
    thread,
    time::{Duration, Instant},
};

static INIT: Once = Once::new();

/// Initialize logger for tests (only once)
fn init_logger() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

const REPORT_INTERVAL: Duration = Duration::from_millis(10);
const WAIT: Duration = Duration::from_secs(2);

fn test_config() -> Config {
    Config::default()
        .with_liveness_timeout(Duration::from_millis(100))
        .with_command_timeout(Duration::from_millis(500))
        .with_frs_timeout(Duration::from_millis(500))
        .with_reset_timeout(Duration::from_millis(500))
}

// =============================================================================
// Hub emulation
// =============================================================================

#[derive(Default)]
struct Hub {
    records: HashMap<u16, Vec<u32>>,
    /// Record and length of the write in progress
    writing: Option<(u16, Vec<u32>, usize)>,
    /// Command ids to leave unanswered
    silent: Vec<u8>,
    /// Reset instead of answering this command id
    reset_on: Option<u8>,
}

fn product_id_response(reset_cause: u8) -> Vec<u8> {
    vec![0xF8, reset_cause, 3, 2, 0x5A, 0x51, 0x98, 0, 0x2C, 0x01, 0, 0, 7, 0, 0, 0]
}

fn command_response(command: u8, command_sequence: u8, results: &[u8]) -> Vec<u8> {
    let mut msg = vec![0xF1, 0, command, command_sequence, 0];
    let mut r = [0u8; 11];
    r[..results.len()].copy_from_slice(results);
    msg.extend_from_slice(&r);
    msg
}

fn frs_read_response(len: u8, status: u8, offset: u16, words: [u32; 2], record: u16) -> Vec<u8> {
    let mut msg = vec![0xF3, (len << 4) | status];
    msg.extend_from_slice(&offset.to_le_bytes());
    msg.extend_from_slice(&words[0].to_le_bytes());
    msg.extend_from_slice(&words[1].to_le_bytes());
    msg.extend_from_slice(&record.to_le_bytes());
    msg.extend_from_slice(&[0, 0]);
    msg
}

fn frs_write_response(status: u8, offset: u16) -> Vec<u8> {
    let [lo, hi] = offset.to_le_bytes();
    vec![0xF5, status, lo, hi]
}

fn le16(p: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([p[at], p[at + 1]])
}

fn le32(p: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([p[at], p[at + 1], p[at + 2], p[at + 3]])
}

impl Hub {
    fn respond(&mut self, packet: &Packet) -> Vec<(Channel, Vec<u8>)> {
        let p = &packet.payload;
        let control = |msg: Vec<u8>| (Channel::HubControl, msg);
        match (packet.channel, p.first().copied()) {
            (Channel::Executable, Some(1)) => vec![(Channel::Executable, vec![1])],
            (Channel::HubControl, Some(0xF9)) => vec![control(product_id_response(4))],
            (Channel::HubControl, Some(0xFD)) => {
                let mut echo = p.clone();
                echo[0] = 0xFC;
                vec![control(echo)]
            }
            (Channel::HubControl, Some(0xF2)) => {
                let (command, command_sequence) = (p[2], p[1]);
                if self.reset_on == Some(command) {
                    return vec![(Channel::Executable, vec![1])];
                }
                if self.silent.contains(&command) {
                    return vec![];
                }
                let results: &[u8] = if command == SH2_CMD_ME_CALIBRATE && p[6] == ME_CAL_GET {
                    // status, accel, gyro, mag routines enabled
                    &[0, 1, 0, 1]
                } else {
                    &[0]
                };
                vec![control(command_response(command, command_sequence, results))]
            }
            (Channel::HubControl, Some(0xF4)) => self.read(le16(p, 4), le16(p, 2)),
            (Channel::HubControl, Some(0xF7)) => {
                let (len, record) = (le16(p, 2) as usize, le16(p, 4));
                if len == 0 {
                    self.records.remove(&record);
                    return vec![control(frs_write_response(3, 0))];
                }
                self.writing = Some((record, vec![0; len], 0));
                vec![control(frs_write_response(4, 0))]
            }
            (Channel::HubControl, Some(0xF6)) => {
                let offset = le16(p, 2);
                let Some((record, mut words, mut written)) = self.writing.take() else {
                    return vec![control(frs_write_response(6, offset))];
                };
                for (i, word) in [le32(p, 4), le32(p, 8)].into_iter().enumerate() {
                    if let Some(slot) = words.get_mut(offset as usize + i) {
                        *slot = word;
                        written += 1;
                    }
                }
                let mut out = vec![control(frs_write_response(0, offset))];
                if written >= words.len() {
                    self.records.insert(record, words);
                    out.push(control(frs_write_response(3, offset)));
                } else {
                    self.writing = Some((record, words, written));
                }
                out
            }
            _ => vec![],
        }
    }

    fn read(&self, record: u16, offset: u16) -> Vec<(Channel, Vec<u8>)> {
        let Some(words) = self.records.get(&record) else {
            return vec![(Channel::HubControl, frs_read_response(0, 5, 0, [0, 0], record))];
        };
        let mut out = Vec::new();
        let mut at = offset as usize;
        while at < words.len() {
            let n = (words.len() - at).min(2);
            let last = at + n >= words.len();
            let pair = [words[at], words.get(at + 1).copied().unwrap_or(0)];
            let status = if last { 3 } else { 0 };
            out.push((
                Channel::HubControl,
                frs_read_response(n as u8, status, at as u16, pair, record),
            ));
            at += n;
        }
        out
    }
}

fn start_with(mut hub: Hub) -> (Bno08x, MockHandle) {
    init_logger();
    let (mock, handle) = MockInterface::new();
    handle.set_responder(move |packet| hub.respond(packet));
    // power-on reset complete
    handle.send(Channel::Executable, &[1]);
    let imu = Bno08x::new(mock, test_config()).expect("engine start");
    imu.init().expect("init");
    (imu, handle)
}

fn start() -> (Bno08x, MockHandle) {
    start_with(Hub::default())
}

/// Poll `cond` until it holds or `WAIT` expires
fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn collect(imu: &Bno08x, key: impl Into<CallbackKey>) -> mpsc::Receiver<Report> {
    let (tx, rx) = mpsc::channel();
    imu.add_report_callback(key, "collect", move |r| {
        let _ = tx.send(*r);
    });
    rx
}

fn rotation_packet(report_seq: u8, base_ticks: u32) -> Vec<u8> {
    let mut msg = vec![0xFB];
    msg.extend_from_slice(&base_ticks.to_le_bytes());
    // identity quaternion, high accuracy
    msg.extend_from_slice(&[0x05, report_seq, 0x03, 0x00, 0, 0, 0, 0, 0, 0, 0x00, 0x40, 0, 0]);
    msg
}

fn accel_packet(report_seq: u8, status: u8) -> Vec<u8> {
    vec![0x01, report_seq, status, 0x00, 0x00, 0x00, 0x00, 0x00, 0x33, 0x09]
}

fn gyro_packet(report_seq: u8) -> Vec<u8> {
    vec![0x02, report_seq, 0x03, 0x00, 0, 0, 0, 0, 0, 0]
}

// =============================================================================
// Startup and reports
// =============================================================================

#[test]
fn test_init_reads_product_id() {
    let (imu, hub) = start();
    assert_eq!(hub.setup_calls(), 1);
    assert!(imu.reset_count() >= 1);
    assert_eq!(imu.reset_reason(), ResetReason::External);
    let pid = imu.product_id().unwrap();
    assert_eq!(pid.part_number, 0x0098_515A);
    assert_eq!((pid.sw_major, pid.sw_minor, pid.patch), (3, 2, 7));
    assert_eq!(pid.build_number, 300);
}

#[test]
fn test_rotation_vector_stream() {
    let (imu, hub) = start();
    let settings = imu.enable_rotation_vector(REPORT_INTERVAL).unwrap();
    assert_eq!(settings.interval_us, 10_000);
    assert!(imu.is_report_enabled(ReportId::RotationVector));

    let set_feature = hub
        .sent_on(Channel::HubControl)
        .into_iter()
        .find(|p| p[0] == 0xFD)
        .expect("set feature sent");
    assert_eq!(set_feature[1], 0x05);
    assert_eq!(&set_feature[5..9], &10_000u32.to_le_bytes());

    let rx = collect(&imu, ReportId::RotationVector);
    for i in 0..3u32 {
        hub.send(Channel::SensorReports, &rotation_packet(i as u8, 1_000 + 100 * i));
    }
    let reports: Vec<Report> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    assert!(reports
        .windows(2)
        .all(|w| w[1].timestamp_us > w[0].timestamp_us));
    assert_eq!(reports[0].timestamp_us, 100_000);
    assert_eq!(reports[2].accuracy, Accuracy::High);

    let q = imu.rotation_quaternion().unwrap();
    assert_eq!(q, [0.0, 0.0, 0.0, 1.0]);
    assert!(imu.report_update_time(ReportId::RotationVector) > 0);
}

#[test]
fn test_reports_for_disabled_features_are_ignored() {
    let (imu, hub) = start();
    imu.enable_gyro(REPORT_INTERVAL).unwrap();
    let rx = collect(&imu, CallbackKey::Any);

    hub.send(Channel::SensorReports, &accel_packet(0, 3));
    hub.send(Channel::SensorReports, &gyro_packet(0));
    let first = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(first.id, ReportId::GyroscopeCalibrated);
    assert!(imu.accelerometer().is_none());
    assert_eq!(imu.gyro(), Some([0.0, 0.0, 0.0]));

    imu.disable_report(ReportId::GyroscopeCalibrated).unwrap();
    assert!(!imu.is_report_enabled(ReportId::GyroscopeCalibrated));
}

#[test]
fn test_duplicate_packets_dropped() {
    let (imu, hub) = start();
    imu.enable_accelerometer(REPORT_INTERVAL).unwrap();
    imu.enable_gyro(REPORT_INTERVAL).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = Arc::clone(&hits);
    imu.add_report_callback(ReportId::Accelerometer, "count", move |_| {
        h.fetch_add(1, Ordering::SeqCst);
    });
    let marker = collect(&imu, ReportId::GyroscopeCalibrated);

    hub.set_sequence(Channel::SensorReports, 9);
    hub.send(Channel::SensorReports, &accel_packet(0, 3));
    hub.set_sequence(Channel::SensorReports, 9);
    hub.send(Channel::SensorReports, &accel_packet(1, 3));
    hub.send(Channel::SensorReports, &gyro_packet(2));

    marker.recv_timeout(WAIT).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(imu.report(ReportId::Accelerometer).unwrap().sequence, 0);
}

#[test]
fn test_malformed_frames_dropped() {
    let (imu, hub) = start();
    imu.enable_accelerometer(REPORT_INTERVAL).unwrap();
    let rx = collect(&imu, CallbackKey::Any);

    // channel out of range
    hub.inject_raw(vec![0x0A, 0x00, 0x09, 0x00, 0x01, 0x00, 0x03, 0x00, 0x00, 0x00]);
    // declares more bytes than the transfer carried
    hub.inject_raw(vec![0x20, 0x00, 0x03, 0x00, 0x01, 0x00]);
    // shorter than a header
    hub.inject_raw(vec![0x05, 0x00]);
    hub.send(Channel::SensorReports, &accel_packet(7, 3));

    let report = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(report.id, ReportId::Accelerometer);
    assert_eq!(report.sequence, 7);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert!(wait_until(|| hub.pending() == 0));
    assert!(imu.is_responsive());
}

#[test]
fn test_callbacks_added_and_removed() {
    let (imu, hub) = start();
    imu.enable_accelerometer(REPORT_INTERVAL).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = Arc::clone(&hits);
    assert!(imu.add_report_callback(ReportId::Accelerometer, "count", move |_| {
        h.fetch_add(1, Ordering::SeqCst);
    }));
    assert!(!imu.add_report_callback(ReportId::Accelerometer, "count", |_| {}));
    let marker = collect(&imu, ReportId::Accelerometer);

    hub.send(Channel::SensorReports, &accel_packet(0, 3));
    marker.recv_timeout(WAIT).unwrap();
    assert!(imu.remove_report_callback(ReportId::Accelerometer, "count"));
    hub.send(Channel::SensorReports, &accel_packet(1, 3));
    marker.recv_timeout(WAIT).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_wait_for_data() {
    let (imu, hub) = start();
    assert!(!imu.wait_for_data(Some(Channel::WakeReports), Duration::from_millis(50)));
    let sender = hub.clone();
    let feeder = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        sender.send(Channel::WakeReports, &accel_packet(0, 3));
    });
    assert!(imu.wait_for_data(Some(Channel::WakeReports), WAIT));
    feeder.join().unwrap();
}

// =============================================================================
// Commands, timeouts and resets
// =============================================================================

#[test]
fn test_command_timeout_marks_unresponsive() {
    let (imu, hub) = start_with(Hub {
        silent: vec![SH2_CMD_DCD],
        ..Default::default()
    });
    assert!(imu.is_responsive());
    assert!(matches!(
        imu.command(SH2_CMD_DCD, &[]),
        Err(Error::Timeout(_))
    ));
    assert!(!imu.is_responsive());

    hub.send(Channel::Command, &[1, 0]);
    assert!(wait_until(|| imu.is_responsive()));
}

#[test]
fn test_reset_fails_pending_command() {
    let (imu, _hub) = start_with(Hub {
        reset_on: Some(SH2_CMD_DCD),
        ..Default::default()
    });
    imu.enable_accelerometer(REPORT_INTERVAL).unwrap();
    let resets = imu.reset_count();

    assert!(matches!(
        imu.command(SH2_CMD_DCD, &[]),
        Err(Error::ResetOccurred)
    ));
    assert_eq!(imu.reset_count(), resets + 1);
    assert!(!imu.is_report_enabled(ReportId::Accelerometer));
    assert!(imu.reset_status().last_reset_us.is_some());
}

#[test]
fn test_bus_error_fails_pending_command() {
    let (imu, hub) = start();
    hub.fail_exchanges(1);
    assert!(matches!(
        imu.command(SH2_CMD_DCD, &[]),
        Err(Error::Bus(_))
    ));

    // the engine keeps running after the fault
    let response = imu.command(SH2_CMD_DCD, &[]).unwrap();
    assert_eq!(response.status(), 0);
}

#[test]
fn test_soft_reset() {
    let (imu, hub) = start();
    let resets = imu.reset_count();
    imu.soft_reset().unwrap();
    assert_eq!(imu.reset_count(), resets + 1);
    assert_eq!(hub.sent_on(Channel::Executable), vec![vec![1]]);
}

#[test]
fn test_tare_commands() {
    let (imu, hub) = start();
    imu.tare_now(TARE_AXIS_ALL, TareBasis::GameRotationVector).unwrap();
    imu.clear_tare().unwrap();

    let tares = || {
        hub.sent_on(Channel::HubControl)
            .into_iter()
            .filter(|p| p[0] == 0xF2 && p[2] == SH2_CMD_TARE)
            .collect::<Vec<_>>()
    };
    assert!(wait_until(|| tares().len() == 2));
    let sent = tares();
    assert_eq!(&sent[0][3..6], &[0, 0x07, 1]);
    assert_eq!(&sent[1][3..12], &[2, 0, 0, 0, 0, 0, 0, 0, 0]);
    // command sequence numbers advance
    assert_eq!(sent[1][1], sent[0][1].wrapping_add(1));
}

// =============================================================================
// Calibration
// =============================================================================

#[test]
fn test_calibration_session() {
    let (imu, hub) = start();
    imu.enable_accelerometer(REPORT_INTERVAL).unwrap();
    assert!(matches!(
        imu.save_calibration(),
        Err(Error::InvalidCalibrationState(CalibrationState::Idle))
    ));

    imu.start_calibration(CalibrationRequest::accelerometer(), Accuracy::High)
        .unwrap();
    assert_eq!(imu.calibration_state(), CalibrationState::InProgress);
    assert!(matches!(
        imu.start_calibration(CalibrationRequest::all(), Accuracy::High),
        Err(Error::InvalidCalibrationState(_))
    ));

    let configure = hub
        .sent_on(Channel::HubControl)
        .into_iter()
        .find(|p| p[0] == 0xF2 && p[2] == SH2_CMD_ME_CALIBRATE)
        .unwrap();
    assert_eq!(&configure[3..9], &[1, 0, 0, 0, 0, 0]);

    hub.send(Channel::SensorReports, &accel_packet(0, 2));
    hub.send(Channel::SensorReports, &accel_packet(1, 3));
    let progress = imu.wait_calibration(WAIT).unwrap();
    assert_eq!(progress.state, CalibrationState::Completed);
    imu.save_calibration().unwrap();

    let status = imu.calibration_status().unwrap();
    assert!(status.enabled.accelerometer && status.enabled.magnetometer);
    assert!(!status.enabled.gyroscope);
}

#[test]
fn test_empty_calibration_request_rejected() {
    let (imu, hub) = start();
    imu.enable_rotation_vector(REPORT_INTERVAL).unwrap();
    assert!(matches!(
        imu.start_calibration(CalibrationRequest::default(), Accuracy::High),
        Err(Error::InvalidArgument(_))
    ));
    hub.send(Channel::SensorReports, &rotation_packet(0, 0));
    assert!(wait_until(|| imu.rotation_quaternion().is_some()));
    assert_eq!(imu.calibration_state(), CalibrationState::Idle);
    assert!(!hub
        .sent_on(Channel::HubControl)
        .iter()
        .any(|p| p[0] == 0xF2 && p[2] == SH2_CMD_ME_CALIBRATE));
}

#[test]
fn test_calibration_aborted_by_reset() {
    let (imu, hub) = start();
    imu.start_calibration(CalibrationRequest::gyroscope(), Accuracy::Medium)
        .unwrap();
    hub.send(Channel::Executable, &[1]);
    assert!(matches!(
        imu.wait_calibration(WAIT),
        Err(Error::CalibrationAborted)
    ));
    assert_eq!(imu.calibration_state(), CalibrationState::Aborted);
}

#[test]
fn test_calibrate_enables_reports_and_saves() {
    let (imu, hub) = start();
    thread::scope(|s| {
        let run = s.spawn(|| {
            imu.calibrate(
                CalibrationRequest::accelerometer(),
                Accuracy::High,
                WAIT,
            )
        });
        let mut seq = 0u8;
        while !run.is_finished() {
            hub.send(Channel::SensorReports, &accel_packet(seq, 3));
            seq = seq.wrapping_add(1);
            thread::sleep(Duration::from_millis(10));
        }
        let progress = run.join().unwrap().unwrap();
        assert_eq!(progress.state, CalibrationState::Completed);
    });
    assert!(imu.is_report_enabled(ReportId::Accelerometer));
    assert!(hub
        .sent_on(Channel::HubControl)
        .iter()
        .any(|p| p[0] == 0xF2 && p[2] == SH2_CMD_DCD));
}

// =============================================================================
// Flash record system
// =============================================================================

#[test]
fn test_frs_write_then_read() {
    let (imu, _hub) = start();
    imu.set_sensor_orientation(0.0, 0.0, 0.0, 1.0).unwrap();
    let words = imu.frs_read(FRS_TYPE_SENSOR_ORIENTATION, 0, 0).unwrap();
    assert_eq!(words, quaternion_to_frs_words(0.0, 0.0, 0.0, 1.0).to_vec());

    imu.frs_write(0x3E2D, &[1, 2, 3]).unwrap();
    assert_eq!(imu.frs_read(0x3E2D, 1, 2).unwrap(), vec![2, 3]);

    imu.frs_erase(0x3E2D).unwrap();
    assert!(matches!(
        imu.frs_read(0x3E2D, 0, 0),
        Err(Error::Frs(FrsError::RecordEmpty))
    ));
}

#[test]
fn test_sensor_metadata() {
    let mut hub = Hub::default();
    hub.records.insert(
        FRS_META_ACCELEROMETER,
        vec![
            0x0003_0201,
            80 << 16,
            0x0000_0100,
            (0x0035 << 16) | 4,
            2_500,
            0x0100_0000,
            0,
            16,
            9 << 16,
            0xDEAD_BEEF,
        ],
    );
    let (imu, _hub) = start_with(hub);
    let meta = imu.sensor_metadata(FRS_META_ACCELEROMETER).unwrap();
    assert_eq!((meta.me_version, meta.mh_version, meta.sh_version), (1, 2, 3));
    assert_eq!(meta.q_point_1, 16);
    assert_eq!(meta.min_period_us, 2_500);
    assert_eq!(meta.revision, 4);
    assert!((meta.range - 80.0).abs() < 1e-3);
}

#[test]
fn test_frs_busy_and_timeout() {
    let (imu, hub) = start();
    // the hub stops answering
    hub.set_responder(|_| vec![]);
    thread::scope(|s| {
        let first = s.spawn(|| imu.frs_read(0x1234, 0, 0));
        assert!(wait_until(|| hub
            .sent_on(Channel::HubControl)
            .iter()
            .any(|p| p[0] == 0xF4)));
        assert!(matches!(imu.frs_read(0x1234, 0, 0), Err(Error::Busy)));
        assert!(matches!(first.join().unwrap(), Err(Error::Timeout(_))));
    });
    assert!(!imu.is_responsive());
}
