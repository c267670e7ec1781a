// Copyright 2025 Au-Zone Technologies Inc.
// SPDX-License-Identifier: Apache-2.0

//! SHTP sensor hub protocol engine for the BNO08x family.
//!
//! An I/O thread owns the bus and exchanges frames with the hub; a processing
//! thread decodes them into the latest value of every report, completes
//! pending requests and handles hub resets. [`Bno08x`] is the application
//! handle on top of both.
//!
//! ```no_run
//! use bno08x_shtp::Bno08x;
//! use std::time::Duration;
//!
//! let imu = Bno08x::new_spi_from_symbol("/dev/spidev1.0", "IMU_INT", "IMU_RST")?;
//! imu.init()?;
//! imu.enable_rotation_vector(Duration::from_millis(10))?;
//! if let Some(q) = imu.rotation_quaternion() {
//!     println!("{:?}", q);
//! }
//! # Ok::<(), bno08x_shtp::Error>(())
//! ```

pub mod calibration;
pub mod command;
pub mod config;
pub mod constants;
pub mod driver;
pub mod error;
pub mod frs;
pub mod interface;
pub mod packet;
mod pipeline;
pub mod processor;
pub mod reports;
pub mod store;

pub use calibration::{CalibrationProgress, CalibrationRequest, CalibrationState};
pub use command::{FeatureSettings, ProductId, ResetReason, TareBasis};
pub use config::Config;
pub use driver::Bno08x;
pub use error::{Error, FramingError, FrsError, Result};
pub use frs::SensorMetadata;
pub use interface::{MockHandle, MockInterface, Pin, SensorInterface, SpiConfig, SpiInterface};
pub use packet::Channel;
pub use reports::{Accuracy, Report, ReportData, ReportId};
pub use store::CallbackKey;
