// Copyright 2025 Au-Zone Technologies Inc.
// SPDX-License-Identifier: Apache-2.0

//! Linux SPI transport using spidev and the GPIO character device.
//!
//! Lines used:
//! - SCK, MISO, MOSI, CSN: driven by the spidev kernel driver
//! - HINTN: hardware interrupt, the hub pulls it low when it needs attention
//! - RSTN: hub reset, active low

use super::{DataReadyCallback, SensorInterface};
use crate::{constants::PACKET_HEADER_LENGTH, packet::peek_length};
use gpiod::{Chip, EdgeDetect, Input, Lines, Options, Output};
use log::{debug, error, trace, warn};
use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};
use std::{
    io::{self, ErrorKind},
    thread,
    time::{Duration, Instant},
};

const CONSUMER: &str = "bno08x-shtp";
/// Hub boot time after the reset line is released
const WAKE_TIMEOUT: Duration = Duration::from_millis(200);

/// A GPIO line, by chip and offset or by line name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pin {
    Line { chip: String, offset: u32 },
    Named(String),
}

/// Where the hub is wired
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiConfig {
    pub device: String,
    pub hintn: Pin,
    pub reset: Pin,
    pub speed_hz: u32,
}

impl SpiConfig {
    pub fn new(device: impl Into<String>, hintn: Pin, reset: Pin) -> Self {
        Self {
            device: device.into(),
            hintn,
            reset,
            speed_hz: 1_000_000,
        }
    }

    pub fn with_speed(mut self, speed_hz: u32) -> Self {
        self.speed_hz = speed_hz;
        self
    }
}

/// Find the chip and offset of a named line
fn find_line(name: &str) -> io::Result<(String, u32)> {
    for entry in Chip::list_devices()? {
        let chip = Chip::new(&entry)?;
        for offset in 0..chip.num_lines() {
            let info = chip.line_info(offset)?;
            trace!("--- {} ---", info.name);
            if info.name == name {
                return Ok((entry.display().to_string(), offset));
            }
        }
    }
    Err(io::Error::new(
        ErrorKind::AddrNotAvailable,
        format!("Did not find pin \"{}\"", name),
    ))
}

fn resolve(pin: &Pin) -> io::Result<(String, u32)> {
    match pin {
        Pin::Line { chip, offset } => Ok((chip.clone(), *offset)),
        Pin::Named(name) => find_line(name),
    }
}

/// SPI peripheral plus the interrupt and reset lines
pub struct SpiInterface {
    spi: Spidev,
    /// Moved into the watcher thread by `on_data_ready`
    hintn: Option<Lines<Input>>,
    reset: Lines<Output>,
    received_packet_count: usize,
}

impl SpiInterface {
    pub fn open(config: &SpiConfig) -> io::Result<Self> {
        let (hintn_chip, hintn_offset) = resolve(&config.hintn)?;
        let (reset_chip, reset_offset) = resolve(&config.reset)?;
        debug!(
            "hintn {}:{}, reset {}:{}",
            hintn_chip, hintn_offset, reset_chip, reset_offset
        );

        let hintn = Chip::new(&hintn_chip)?.request_lines(
            Options::input([hintn_offset])
                .edge(EdgeDetect::Falling)
                .consumer(CONSUMER),
        )?;
        let reset = Chip::new(&reset_chip)?.request_lines(
            Options::output([reset_offset])
                .values([true])
                .consumer(CONSUMER),
        )?;

        let mut spi = Spidev::open(&config.device)?;
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(config.speed_hz)
            .mode(SpiModeFlags::SPI_MODE_3)
            .lsb_first(false)
            .build();
        spi.configure(&options)?;

        Ok(Self {
            spi,
            hintn: Some(hintn),
            reset,
            received_packet_count: 0,
        })
    }

    /// Is the hub asking for attention
    fn hintn_signaled(&self) -> bool {
        match &self.hintn {
            Some(lines) => lines.get_values([false]).map(|v| !v[0]).unwrap_or(false),
            None => false,
        }
    }

    /// Wait for the hub to assert HINTN after reset. This takes around 120 ms.
    fn wait_for_sensor_awake(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.hintn_signaled() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()> {
        let mut transfer = SpidevTransfer::read_write(tx, rx);
        self.spi.transfer(&mut transfer)
    }

    pub fn received_packet_count(&self) -> usize {
        self.received_packet_count
    }
}

impl SensorInterface for SpiInterface {
    type SensorError = io::Error;

    fn setup(&mut self) -> io::Result<()> {
        debug!("reset cycle");
        self.reset.set_values([true])?;
        self.reset.set_values([false])?;
        thread::sleep(Duration::from_millis(2));
        self.reset.set_values([true])?;

        if self.hintn.is_some() && !self.wait_for_sensor_awake(WAKE_TIMEOUT) {
            return Err(io::Error::new(ErrorKind::TimedOut, "sensor not ready"));
        }
        Ok(())
    }

    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<usize> {
        // learn how much the hub wants to send
        let mut header = [0u8; PACKET_HEADER_LENGTH];
        let zeros = [0u8; PACKET_HEADER_LENGTH];
        self.transfer(&zeros, &mut header)?;
        let read_len = peek_length(&header);

        let total = read_len.max(tx.len()).min(rx.len());
        if total == 0 {
            return Ok(0);
        }
        if read_len > rx.len() {
            debug!(
                "frame of {} bytes exceeds the {} byte receive buffer",
                read_len,
                rx.len()
            );
        }

        let mut out = vec![0u8; total];
        let n = tx.len().min(total);
        out[..n].copy_from_slice(&tx[..n]);
        rx[..total].fill(0);
        self.transfer(&out, &mut rx[..total])?;

        let received = peek_length(&rx[..total]).min(total);
        if received > 0 {
            self.received_packet_count += 1;
        }
        Ok(received)
    }

    fn on_data_ready(&mut self, callback: DataReadyCallback) -> io::Result<()> {
        let Some(mut lines) = self.hintn.take() else {
            warn!("interrupt line already claimed");
            return Ok(());
        };
        thread::Builder::new()
            .name("bno08x-hintn".into())
            .spawn(move || loop {
                match lines.read_event() {
                    Ok(_) => callback(),
                    Err(e) => {
                        error!("interrupt line: {}", e);
                        break;
                    }
                }
            })?;
        Ok(())
    }
}
