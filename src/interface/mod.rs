// Copyright 2025 Au-Zone Technologies Inc.
// SPDX-License-Identifier: Apache-2.0

//! Transports the protocol engine runs over.

use std::{fmt::Debug, sync::Arc};

pub mod mock;
pub mod spidev;

pub use self::mock::{MockHandle, MockInterface};
pub use self::spidev::{Pin, SpiConfig, SpiInterface};

/// Invoked on every falling edge of the hub's interrupt line
pub type DataReadyCallback = Arc<dyn Fn() + Send + Sync>;

/// A bus the sensor hub is attached to.
///
/// The interface is moved into the I/O thread; `exchange` is only ever
/// called from there.
pub trait SensorInterface: Send + 'static {
    type SensorError: Debug;

    /// Bring the hub out of reset and wait for it to signal readiness
    fn setup(&mut self) -> Result<(), Self::SensorError>;

    /// One full-duplex transfer. `tx` may be empty when only polling.
    ///
    /// Returns the length of the frame now at the start of `rx`, or 0 when
    /// the hub had nothing to send. A frame longer than `rx` is truncated and
    /// its declared length clamped to `rx.len()`.
    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<usize, Self::SensorError>;

    /// Register the data-ready notification
    fn on_data_ready(&mut self, callback: DataReadyCallback) -> Result<(), Self::SensorError>;
}
