// Copyright 2025 Au-Zone Technologies Inc.
// SPDX-License-Identifier: Apache-2.0

//! Engine configuration.

use crate::constants::{PACKET_HEADER_LENGTH, PACKET_RECV_BUF_LEN, PACKET_SEND_BUF_LEN};
use std::time::Duration;

/// Tunables for the protocol engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Size of the receive buffer used for every bus exchange
    pub max_transfer: usize,
    /// Largest frame written to the hub; larger cargo is fragmented
    pub max_frame: usize,
    /// Bound on the I/O and processing waits
    pub liveness_timeout: Duration,
    /// Bound on a command round trip
    pub command_timeout: Duration,
    /// Bound on a complete FRS read or write
    pub frs_timeout: Duration,
    /// Bound on waiting for the hub to announce itself after reset
    pub reset_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_transfer: PACKET_RECV_BUF_LEN,
            max_frame: PACKET_SEND_BUF_LEN,
            liveness_timeout: Duration::from_secs(1),
            command_timeout: Duration::from_millis(2000),
            frs_timeout: Duration::from_millis(3000),
            reset_timeout: Duration::from_secs(1),
        }
    }
}

impl Config {
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame.max(PACKET_HEADER_LENGTH + 1);
        self
    }

    pub fn with_max_transfer(mut self, max_transfer: usize) -> Self {
        self.max_transfer = max_transfer.max(PACKET_HEADER_LENGTH);
        self
    }

    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_frs_timeout(mut self, timeout: Duration) -> Self {
        self.frs_timeout = timeout;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_buffers() {
        let config = Config::default();
        assert_eq!(config.max_transfer, PACKET_RECV_BUF_LEN);
        assert_eq!(config.max_frame, PACKET_SEND_BUF_LEN);
        assert_eq!(config.liveness_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_max_frame_never_below_header() {
        let config = Config::default().with_max_frame(2);
        assert_eq!(config.max_frame, PACKET_HEADER_LENGTH + 1);
    }
}
