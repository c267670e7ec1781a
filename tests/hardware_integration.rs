// Copyright 2025 Au-Zone Technologies Inc.
// SPDX-License-Identifier: Apache-2.0

//! Hardware integration tests for the BNO08x SHTP engine
//!
//! These tests require real hardware and are marked with #[ignore].
//! Run with: RUST_LOG=debug cargo test -- --ignored --test-threads=1
//!
//! Reports are decoded on the engine's own threads; tests block on
//! wait_for_data() instead of polling the bus.

use bno08x_shtp::{constants::FRS_META_ACCELEROMETER, Bno08x, Channel, ReportId};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Once,
    },
    thread::sleep,
    time::Duration,
};

static INIT: Once = Once::new();

/// Initialize logger for tests (only once)
fn init_logger() {
    INIT.call_once(|| {
        env_logger::init();
    });
}

const TEST_SPI_DEVICE: &str = "/dev/spidev1.0";
const TEST_INT_GPIO: &str = "IMU_INT";
const TEST_RST_GPIO: &str = "IMU_RST";
const REPORT_INTERVAL: Duration = Duration::from_millis(100);
const SENSOR_WARMUP: Duration = Duration::from_millis(500);

fn open() -> Bno08x {
    let imu = Bno08x::new_spi_from_symbol(TEST_SPI_DEVICE, TEST_INT_GPIO, TEST_RST_GPIO)
        .expect("Failed to create IMU driver");
    imu.init().expect("Failed to initialize IMU");
    imu
}

/// Let `samples` sensor report packets arrive
fn collect_samples(imu: &Bno08x, samples: usize) {
    for _ in 0..samples {
        imu.wait_for_data(Some(Channel::SensorReports), REPORT_INTERVAL * 2);
    }
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

// =============================================================================
// Basic Tests
// =============================================================================

#[test]
#[ignore]
fn test_imu_initialization() {
    init_logger();

    let imu = open();
    let pid = imu.product_id().expect("Failed to read product id");
    assert!(imu.reset_count() >= 1, "No reset indication seen");
    assert!(imu.is_responsive());

    println!(
        "✓ IMU initialized: part {} sw {}.{}.{}, reset cause {:?}",
        pid.part_number,
        pid.sw_major,
        pid.sw_minor,
        pid.patch,
        imu.reset_reason()
    );
}

#[test]
#[ignore]
fn test_soft_reset() {
    init_logger();

    let imu = open();
    imu.enable_accelerometer(REPORT_INTERVAL)
        .expect("Failed to enable accelerometer");
    let before = imu.reset_count();

    imu.soft_reset().expect("Failed to perform soft reset");
    assert!(imu.reset_count() > before);
    assert!(!imu.is_report_enabled(ReportId::Accelerometer));

    imu.init().expect("Failed to re-initialize after reset");
    println!("✓ Soft reset successful ({} resets)", imu.reset_count());
}

// =============================================================================
// Sensor Reading Tests
// =============================================================================

#[test]
#[ignore]
fn test_accelerometer() {
    init_logger();

    let imu = open();
    imu.enable_accelerometer(REPORT_INTERVAL)
        .expect("Failed to enable accelerometer");
    sleep(SENSOR_WARMUP);
    collect_samples(&imu, 10);

    let accel = imu.accelerometer().expect("No accelerometer data");
    let magnitude = norm(&accel);

    assert!(
        magnitude > 8.0 && magnitude < 12.0,
        "Accelerometer magnitude {} outside expected range",
        magnitude
    );

    println!("✓ Accelerometer: {:?}, |a| = {:.2} m/s²", accel, magnitude);
}

#[test]
#[ignore]
fn test_gyroscope() {
    init_logger();

    let imu = open();
    imu.enable_gyro(REPORT_INTERVAL)
        .expect("Failed to enable gyroscope");
    sleep(SENSOR_WARMUP);
    collect_samples(&imu, 10);

    let gyro = imu.gyro().expect("No gyroscope data");

    // At rest, angular velocity should be small
    assert!(
        gyro.iter().all(|w| w.abs() < 1.0),
        "Gyroscope readings {:?} too high for stationary sensor",
        gyro
    );

    println!("✓ Gyroscope: {:?} rad/s", gyro);
}

#[test]
#[ignore]
fn test_magnetometer() {
    init_logger();

    let imu = open();
    imu.enable_mag_field(REPORT_INTERVAL)
        .expect("Failed to enable magnetometer");
    sleep(SENSOR_WARMUP);
    collect_samples(&imu, 10);

    let mag = imu.mag_field().expect("No magnetometer data");
    let magnitude = norm(&mag);

    // Earth's magnetic field is typically 25-65 µT
    assert!(
        magnitude > 10.0 && magnitude < 100.0,
        "Magnetic field {} outside expected range",
        magnitude
    );

    println!("✓ Magnetometer: {:?}, |B| = {:.2} µT", mag, magnitude);
}

#[test]
#[ignore]
fn test_rotation_vector() {
    init_logger();

    let imu = open();
    imu.enable_rotation_vector(REPORT_INTERVAL)
        .expect("Failed to enable rotation vector");
    sleep(SENSOR_WARMUP * 2);
    collect_samples(&imu, 10);

    let quat = imu.rotation_quaternion().expect("No rotation quaternion");
    let acc = imu.rotation_acc();

    let magnitude = norm(&quat);
    assert!(
        (magnitude - 1.0).abs() < 0.1,
        "Quaternion magnitude {} should be close to 1.0",
        magnitude
    );

    println!(
        "✓ Rotation: {:?}, |q| = {:.3}, acc = {:?} rad",
        quat, magnitude, acc
    );
}

#[test]
#[ignore]
fn test_linear_acceleration_and_gravity() {
    init_logger();

    let imu = open();
    imu.enable_linear_accel(REPORT_INTERVAL)
        .expect("Failed to enable linear accel");
    imu.enable_gravity(REPORT_INTERVAL)
        .expect("Failed to enable gravity");
    sleep(SENSOR_WARMUP);
    collect_samples(&imu, 10);

    let linear = imu.linear_accel().expect("No linear accel data");
    let gravity = imu.gravity().expect("No gravity data");

    let linear_mag = norm(&linear);
    let gravity_mag = norm(&gravity);

    // At rest, linear acceleration should be near zero
    assert!(
        linear_mag < 2.0,
        "Linear accel too high for stationary sensor"
    );

    // Gravity should be ~9.8 m/s²
    assert!(
        gravity_mag > 8.0 && gravity_mag < 11.0,
        "Gravity magnitude {} outside expected range",
        gravity_mag
    );

    println!(
        "✓ Linear accel: {:?}, |a_lin| = {:.2} m/s²",
        linear, linear_mag
    );
    println!("✓ Gravity: {:?}, |g| = {:.2} m/s²", gravity, gravity_mag);
}

// =============================================================================
// API Usage Tests
// =============================================================================

#[test]
#[ignore]
fn test_sensor_report_callback() {
    init_logger();

    let imu = open();
    let callback_count = Arc::new(AtomicUsize::new(0));
    let callback_count_clone = callback_count.clone();

    imu.add_report_callback(ReportId::Accelerometer, "test_callback", move |_report| {
        callback_count_clone.fetch_add(1, Ordering::SeqCst);
    });

    imu.enable_accelerometer(REPORT_INTERVAL)
        .expect("Failed to enable accelerometer");
    sleep(SENSOR_WARMUP);
    collect_samples(&imu, 10);

    let count = callback_count.load(Ordering::SeqCst);
    assert!(
        count > 0,
        "Callback should have been triggered, got {}",
        count
    );

    println!("✓ Callback triggered {} times", count);

    assert!(imu.remove_report_callback(ReportId::Accelerometer, "test_callback"));
    println!("✓ Callback removed successfully");
}

#[test]
#[ignore]
fn test_report_status_queries() {
    init_logger();

    let imu = open();

    // Initially disabled
    assert!(!imu.is_report_enabled(ReportId::Accelerometer));
    assert_eq!(imu.report_update_time(ReportId::Accelerometer), 0);

    let settings = imu
        .enable_accelerometer(REPORT_INTERVAL)
        .expect("Failed to enable accelerometer");
    assert!(imu.is_report_enabled(ReportId::Accelerometer));
    collect_samples(&imu, 5);

    let update_time = imu.report_update_time(ReportId::Accelerometer);
    assert!(
        update_time > 0,
        "Update time should be non-zero after receiving data"
    );

    println!("✓ is_report_enabled() and report_update_time() work correctly");
    println!(
        "  Update time: {} us, hub interval {} us",
        update_time, settings.interval_us
    );
}

#[test]
#[ignore]
fn test_multiple_sensors() {
    init_logger();

    let imu = open();
    imu.enable_accelerometer(REPORT_INTERVAL).expect("accel");
    imu.enable_gyro(REPORT_INTERVAL).expect("gyro");
    imu.enable_rotation_vector(REPORT_INTERVAL)
        .expect("rotation");
    sleep(SENSOR_WARMUP);
    collect_samples(&imu, 20);

    // All sensors should have data
    let accel = imu.accelerometer().expect("No accel");
    let gyro = imu.gyro().expect("No gyro");
    let quat = imu.rotation_quaternion().expect("No rotation");

    println!("✓ Multiple sensors:");
    println!("  Accel: {:?}", accel);
    println!("  Gyro: {:?}", gyro);
    println!("  Rotation: {:?}", quat);
}

// =============================================================================
// Flash Record System
// =============================================================================

#[test]
#[ignore]
fn test_accelerometer_metadata() {
    init_logger();

    let imu = open();
    let meta = imu
        .sensor_metadata(FRS_META_ACCELEROMETER)
        .expect("Failed to read accelerometer metadata");

    assert!(meta.range > 0.0, "Range should be positive");
    assert!(meta.min_period_us > 0, "Minimum period should be set");

    println!(
        "✓ Accelerometer metadata: range {:.1}, resolution {:.5}, min period {} us",
        meta.range, meta.resolution, meta.min_period_us
    );
}
