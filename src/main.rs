// Copyright 2025 Au-Zone Technologies Inc.
// SPDX-License-Identifier: Apache-2.0

use bno08x_shtp::{Bno08x, Channel, Config, Pin, SpiConfig, SpiInterface};
use clap::Parser;
use log::{info, warn};
use std::{f32::consts::PI, time::Duration};

const RAD_TO_DEG: f32 = 180f32 / PI;

/// Print orientation and gravity from a BNO08x on spidev
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// SPI device
    #[arg(long, default_value = "/dev/spidev1.0")]
    spi: String,

    /// Interrupt line: a line name, or CHIP:OFFSET
    #[arg(long, default_value = "IMU_INT")]
    hintn: String,

    /// Reset line: a line name, or CHIP:OFFSET
    #[arg(long, default_value = "IMU_RST")]
    reset: String,

    /// SPI clock in Hz
    #[arg(long, default_value_t = 1_000_000)]
    speed: u32,

    /// Report interval in milliseconds
    #[arg(long, default_value_t = 50)]
    interval: u64,

    /// Stop after this many samples, 0 runs forever
    #[arg(long, default_value_t = 0)]
    count: u64,
}

fn parse_pin(arg: &str) -> Pin {
    match arg.rsplit_once(':') {
        Some((chip, offset)) => match offset.parse() {
            Ok(offset) => Pin::Line {
                chip: chip.to_string(),
                offset,
            },
            Err(_) => Pin::Named(arg.to_string()),
        },
        None => Pin::Named(arg.to_string()),
    }
}

fn quaternion_to_euler(qr: f32, qi: f32, qj: f32, qk: f32) -> [f32; 3] {
    let sqr = qr * qr;
    let sqi = qi * qi;
    let sqj = qj * qj;
    let sqk = qk * qk;

    let yaw = (2.0 * (qi * qj + qk * qr)).atan2(sqi - sqj - sqk + sqr) * RAD_TO_DEG;
    let pitch = (-2.0 * (qi * qk - qj * qr) / (sqi + sqj + sqk + sqr)).asin() * RAD_TO_DEG;
    let roll = (2.0 * (qj * qk + qi * qr)).atan2(-sqi - sqj + sqk + sqr) * RAD_TO_DEG;

    [yaw, pitch, roll]
}

fn main() -> bno08x_shtp::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let spi = SpiConfig::new(args.spi, parse_pin(&args.hintn), parse_pin(&args.reset))
        .with_speed(args.speed);
    let imu = Bno08x::new(SpiInterface::open(&spi)?, Config::default())?;
    let pid = imu.init()?;
    info!("reset cause: {:?}", pid.reset_reason);

    let interval = Duration::from_millis(args.interval);
    imu.enable_rotation_vector(interval)?;
    imu.enable_gravity(interval)?;

    let mut samples = 0;
    loop {
        if !imu.wait_for_data(Some(Channel::SensorReports), interval * 4) {
            warn!("no data for {:?}", interval * 4);
            continue;
        }
        if let Some([qi, qj, qk, qr]) = imu.rotation_quaternion() {
            println!("Current rotation: {:?}", quaternion_to_euler(qr, qi, qj, qk));
        }
        if let Some([ax, ay, az]) = imu.gravity() {
            println!("Gravity: {} {} {}", ax, ay, az);
        }
        samples += 1;
        if args.count > 0 && samples >= args.count {
            return Ok(());
        }
    }
}
