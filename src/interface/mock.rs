// Copyright 2025 Au-Zone Technologies Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-memory sensor hub for tests.
//!
//! [`MockInterface`] is handed to the engine; the paired [`MockHandle`] stays
//! with the test to inject frames, script replies to host requests and
//! inspect what the host sent.

use super::{DataReadyCallback, SensorInterface};
use crate::{
    constants::{NUM_CHANNELS, PACKET_HEADER_LENGTH},
    packet::{decode, encode, Channel, Packet},
};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use thiserror::Error;

/// Replies to a host frame: cargo to send back, per channel
pub type Responder = Box<dyn FnMut(&Packet) -> Vec<(Channel, Vec<u8>)> + Send>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MockError {
    #[error("injected bus failure")]
    Injected,
}

#[derive(Default)]
struct MockState {
    pending: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    device_sequence: [u8; NUM_CHANNELS],
    responder: Option<Responder>,
    data_ready: Option<DataReadyCallback>,
    fail_exchanges: usize,
    setup_calls: usize,
    exchanges: usize,
}

impl MockState {
    fn frame(&mut self, channel: Channel, payload: &[u8]) {
        let seq = &mut self.device_sequence[channel.index()];
        let max_frame = payload.len().max(1) + PACKET_HEADER_LENGTH;
        if let Ok(frames) = encode(channel, *seq, payload, max_frame) {
            *seq = seq.wrapping_add(frames.len() as u8);
            self.pending.extend(frames);
        }
    }
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transport half, moved into the engine
pub struct MockInterface {
    state: Arc<Mutex<MockState>>,
}

/// Test half
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockInterface {
    pub fn new() -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            MockHandle { state },
        )
    }
}

impl MockHandle {
    /// Queue `payload` as a hub frame with the next device sequence number
    /// for `channel`, and raise the interrupt
    pub fn send(&self, channel: Channel, payload: &[u8]) {
        lock(&self.state).frame(channel, payload);
        self.raise_interrupt();
    }

    /// Queue raw bytes exactly as given
    pub fn inject_raw(&self, bytes: Vec<u8>) {
        lock(&self.state).pending.push_back(bytes);
        self.raise_interrupt();
    }

    /// Override the next device sequence number for `channel`
    pub fn set_sequence(&self, channel: Channel, sequence: u8) {
        lock(&self.state).device_sequence[channel.index()] = sequence;
    }

    pub fn set_responder(&self, responder: impl FnMut(&Packet) -> Vec<(Channel, Vec<u8>)> + Send + 'static) {
        lock(&self.state).responder = Some(Box::new(responder));
    }

    /// Fail the next `count` exchanges
    pub fn fail_exchanges(&self, count: usize) {
        lock(&self.state).fail_exchanges = count;
    }

    pub fn raise_interrupt(&self) {
        let callback = lock(&self.state).data_ready.clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Frames the host has written, in order
    pub fn sent(&self) -> Vec<Packet> {
        lock(&self.state)
            .sent
            .iter()
            .filter_map(|bytes| decode(bytes).ok())
            .collect()
    }

    /// Cargo the host has written on `channel`
    pub fn sent_on(&self, channel: Channel) -> Vec<Vec<u8>> {
        self.sent()
            .into_iter()
            .filter(|p| p.channel == channel)
            .map(|p| p.payload)
            .collect()
    }

    pub fn setup_calls(&self) -> usize {
        lock(&self.state).setup_calls
    }

    pub fn exchanges(&self) -> usize {
        lock(&self.state).exchanges
    }

    /// Frames queued but not yet read by the host
    pub fn pending(&self) -> usize {
        lock(&self.state).pending.len()
    }
}

impl SensorInterface for MockInterface {
    type SensorError = MockError;

    fn setup(&mut self) -> Result<(), Self::SensorError> {
        lock(&self.state).setup_calls += 1;
        Ok(())
    }

    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<usize, Self::SensorError> {
        let (len, more, callback) = {
            let mut state = lock(&self.state);
            state.exchanges += 1;
            if state.fail_exchanges > 0 {
                state.fail_exchanges -= 1;
                return Err(MockError::Injected);
            }
            if !tx.is_empty() {
                state.sent.push(tx.to_vec());
                if let Ok(packet) = decode(tx) {
                    if let Some(mut responder) = state.responder.take() {
                        for (channel, payload) in responder(&packet) {
                            state.frame(channel, &payload);
                        }
                        state.responder = Some(responder);
                    }
                }
            }
            let len = match state.pending.pop_front() {
                Some(frame) => {
                    let n = frame.len().min(rx.len());
                    rx[..n].copy_from_slice(&frame[..n]);
                    n
                }
                None => 0,
            };
            (len, !state.pending.is_empty(), state.data_ready.clone())
        };
        if more {
            if let Some(callback) = callback {
                callback();
            }
        }
        Ok(len)
    }

    fn on_data_ready(&mut self, callback: DataReadyCallback) -> Result<(), Self::SensorError> {
        let pending = {
            let mut state = lock(&self.state);
            state.data_ready = Some(Arc::clone(&callback));
            !state.pending.is_empty()
        };
        if pending {
            callback();
        }
        Ok(())
    }
}
