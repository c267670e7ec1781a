// Copyright 2025 Au-Zone Technologies Inc.
// SPDX-License-Identifier: Apache-2.0

//! The I/O and processing threads and the state they share.
//!
//! The I/O thread owns the transport. It sleeps until the hub raises its
//! interrupt, a frame is queued for transmission, or the liveness timeout
//! expires, then runs bus exchanges until the hub is idle and the outbox is
//! empty. Every received frame goes, in order, to the processing thread.
//!
//! Lock order: `control`, then `outbox`, then the I/O signal.

use crate::{
    calibration::CalibrationSession,
    command::{command_request, Outbox, PendingTable},
    config::Config,
    constants::PACKET_HEADER_LENGTH,
    error::{Error, Result},
    frs::FrsTransfer,
    interface::SensorInterface,
    packet::Channel,
    processor::{Processor, ResetStatus},
    store::{CallbackRegistry, DataNotifier, EnabledReports, ReportStore},
};
use log::{debug, error, info, trace, warn};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{channel, Receiver, RecvTimeoutError, Sender, SyncSender},
        Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(rwlock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(rwlock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Bytes from one bus exchange
#[derive(Debug, Clone)]
pub struct RxBuffer {
    pub bytes: Vec<u8>,
    /// Size of the exchange; a frame filling it may continue in the next one
    pub capacity: usize,
    /// Host receive time, microseconds since the engine started
    pub host_time_us: u64,
}

#[derive(Debug, Default)]
struct IoFlags {
    data_ready: bool,
    tx_pending: bool,
    shutdown: bool,
}

/// Why the I/O thread woke up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Wake {
    pub data_ready: bool,
    pub tx_pending: bool,
    pub shutdown: bool,
    pub timed_out: bool,
}

/// Wakes the I/O thread: interrupt, pending transmit or shutdown
#[derive(Default)]
pub(crate) struct IoSignal {
    flags: Mutex<IoFlags>,
    cv: Condvar,
}

impl IoSignal {
    pub fn data_ready(&self) {
        lock(&self.flags).data_ready = true;
        self.cv.notify_one();
    }

    pub fn tx_pending(&self) {
        lock(&self.flags).tx_pending = true;
        self.cv.notify_one();
    }

    /// Only called with the outbox lock held, once it is empty
    pub fn clear_tx_pending(&self) {
        lock(&self.flags).tx_pending = false;
    }

    pub fn shutdown(&self) {
        lock(&self.flags).shutdown = true;
        self.cv.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        lock(&self.flags).shutdown
    }

    /// Block until signalled or `timeout` elapses. Consumes the data ready
    /// flag; the transmit flag stays set until the outbox drains.
    pub fn wait(&self, timeout: Duration) -> Wake {
        let deadline = Instant::now() + timeout;
        let mut flags = lock(&self.flags);
        let mut timed_out = false;
        while !(flags.data_ready || flags.tx_pending || flags.shutdown) {
            let now = Instant::now();
            if now >= deadline {
                timed_out = true;
                break;
            }
            flags = match self.cv.wait_timeout(flags, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        let wake = Wake {
            data_ready: flags.data_ready,
            tx_pending: flags.tx_pending,
            shutdown: flags.shutdown,
            timed_out,
        };
        flags.data_ready = false;
        wake
    }
}

/// An FRS transfer and the caller waiting on it
pub(crate) struct ActiveFrs {
    pub token: u64,
    pub transfer: FrsTransfer,
    pub done: SyncSender<Result<Vec<u32>>>,
}

/// Request bookkeeping shared by callers and the processing thread
#[derive(Default)]
pub(crate) struct ControlState {
    pub pending: PendingTable,
    pub enabled: EnabledReports,
    pub calibration: CalibrationSession,
    pub frs: Option<ActiveFrs>,
    pub next_frs_token: u64,
    pub reset: ResetStatus,
    /// A reset was handled and nothing has been requested since
    pub reset_latched: bool,
    /// Report id of the previous hub control packet
    pub last_control_report: Option<u8>,
}

impl ControlState {
    /// Note that the host is about to send a request
    pub fn requested(&mut self) {
        self.reset_latched = false;
    }

    pub fn has_outstanding_work(&self) -> bool {
        !self.pending.is_empty() || self.frs.is_some()
    }
}

pub(crate) struct Shared {
    pub config: Config,
    pub signal: IoSignal,
    pub outbox: Mutex<Outbox>,
    pub store: RwLock<ReportStore>,
    pub control: Mutex<ControlState>,
    /// Paired with `control`, signalled on calibration progress and resets
    pub control_cv: Condvar,
    pub callbacks: Mutex<CallbackRegistry>,
    pub notifier: DataNotifier,
    pub responsive: AtomicBool,
    epoch: Instant,
}

impl Shared {
    pub fn new(config: Config) -> Self {
        Self {
            outbox: Mutex::new(Outbox::new(config.max_frame)),
            config,
            signal: IoSignal::default(),
            store: RwLock::new(ReportStore::new()),
            control: Mutex::new(ControlState::default()),
            control_cv: Condvar::new(),
            callbacks: Mutex::new(CallbackRegistry::default()),
            notifier: DataNotifier::default(),
            responsive: AtomicBool::new(true),
            epoch: Instant::now(),
        }
    }

    /// Microseconds since the engine started
    pub fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Frame and queue `payload`, waking the I/O thread
    pub fn queue(&self, channel: Channel, payload: &[u8]) -> Result<u8> {
        let mut outbox = lock(&self.outbox);
        let seq = outbox.enqueue(channel, payload)?;
        self.signal.tx_pending();
        Ok(seq)
    }

    /// Queue a command request with the next command sequence number
    pub fn queue_command(&self, command: u8, params: &[u8]) -> Result<u8> {
        let mut outbox = lock(&self.outbox);
        let command_sequence = outbox.next_command_sequence();
        let body = command_request(command_sequence, command, params);
        outbox.enqueue(Channel::HubControl, &body)?;
        self.signal.tx_pending();
        Ok(command_sequence)
    }

    fn next_frame(&self) -> Option<Vec<u8>> {
        let mut outbox = lock(&self.outbox);
        let frame = outbox.pop();
        if outbox.is_empty() {
            self.signal.clear_tx_pending();
        }
        frame
    }

    /// Fail every request and FRS transfer in flight with a bus error.
    /// Returns how many were failed.
    pub fn fail_in_flight(&self, cause: &str) -> usize {
        let mut control = lock(&self.control);
        let mut failed = control.pending.fail_all(|| Error::Bus(cause.to_string()));
        if let Some(active) = control.frs.take() {
            let _ = active.done.try_send(Err(Error::Bus(cause.to_string())));
            failed += 1;
        }
        drop(control);
        self.control_cv.notify_all();
        failed
    }

    pub fn mark_unresponsive(&self, context: &str) {
        if lock(&self.control).has_outstanding_work()
            && self.responsive.swap(false, Ordering::SeqCst)
        {
            warn!("{}: no activity from the sensor hub", context);
        }
    }
}

/// Pause after a failed exchange before touching the bus again
const BUS_ERROR_BACKOFF: Duration = Duration::from_millis(10);

fn io_loop<SI: SensorInterface>(mut interface: SI, shared: Arc<Shared>, tx: Sender<RxBuffer>) {
    let capacity = shared.config.max_transfer;
    let mut rx = vec![0u8; capacity];
    loop {
        let wake = shared.signal.wait(shared.config.liveness_timeout);
        if wake.shutdown {
            break;
        }
        if wake.timed_out {
            shared.mark_unresponsive("I/O");
        }

        // exchange until the hub is idle and nothing is left to send
        loop {
            let frame = shared.next_frame();
            let sent = frame.is_some();
            let out = frame.unwrap_or_default();
            match interface.exchange(&out, &mut rx) {
                Ok(n) if n >= PACKET_HEADER_LENGTH => {
                    shared.responsive.store(true, Ordering::SeqCst);
                    let buffer = RxBuffer {
                        bytes: rx[..n].to_vec(),
                        capacity,
                        host_time_us: shared.now_us(),
                    };
                    if tx.send(buffer).is_err() {
                        debug!("processing thread gone, stopping I/O");
                        return;
                    }
                }
                Ok(n) => {
                    if n > 0 {
                        trace!("ignoring {} byte exchange", n);
                    }
                    if !sent {
                        break;
                    }
                }
                Err(e) => {
                    let cause = format!("{:?}", e);
                    error!("bus error: {}", cause);
                    if sent {
                        warn!("dropped {} byte frame", out.len());
                    }
                    let failed = shared.fail_in_flight(&cause);
                    if failed > 0 {
                        warn!("{} requests failed by bus error", failed);
                    }
                    thread::sleep(BUS_ERROR_BACKOFF);
                    break;
                }
            }
            if shared.signal.is_shutdown() {
                return;
            }
        }
    }
    debug!("I/O thread stopped");
}

fn processing_loop(mut processor: Processor, shared: Arc<Shared>, rx: Receiver<RxBuffer>) {
    loop {
        match rx.recv_timeout(shared.config.liveness_timeout) {
            Ok(buffer) => {
                for outcome in processor.handle_buffer(buffer) {
                    trace!("{:?}", outcome);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if shared.signal.is_shutdown() {
                    break;
                }
                shared.mark_unresponsive("processing");
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("processing thread stopped");
}

/// The two engine threads
pub(crate) struct Pipeline {
    io: Option<JoinHandle<()>>,
    processing: Option<JoinHandle<()>>,
}

impl Pipeline {
    pub fn spawn<SI: SensorInterface>(mut interface: SI, shared: Arc<Shared>) -> Result<Self> {
        let signal = Arc::clone(&shared);
        interface
            .on_data_ready(Arc::new(move || signal.signal.data_ready()))
            .map_err(|e| Error::Bus(format!("{:?}", e)))?;

        let (tx, rx) = channel();
        let processor = Processor::new(Arc::clone(&shared));
        let io_shared = Arc::clone(&shared);
        let io = thread::Builder::new()
            .name("shtp-io".into())
            .spawn(move || io_loop(interface, io_shared, tx))?;
        let processing = thread::Builder::new()
            .name("shtp-processing".into())
            .spawn(move || processing_loop(processor, shared, rx))?;
        info!("pipeline started");
        Ok(Self {
            io: Some(io),
            processing: Some(processing),
        })
    }

    pub fn shutdown(&mut self, shared: &Shared) {
        shared.signal.shutdown();
        for handle in [self.io.take(), self.processing.take()].into_iter().flatten() {
            if handle.join().is_err() {
                error!("engine thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::ResponseKey,
        constants::{FRS_TYPE_SENSOR_ORIENTATION, SH2_CMD_DCD},
    };
    use std::sync::mpsc::sync_channel;

    #[test]
    fn test_signal_wait_times_out() {
        let signal = IoSignal::default();
        let wake = signal.wait(Duration::from_millis(10));
        assert!(wake.timed_out);
        assert!(!wake.data_ready);
    }

    #[test]
    fn test_data_ready_consumed_tx_pending_kept() {
        let signal = IoSignal::default();
        signal.data_ready();
        signal.tx_pending();
        let wake = signal.wait(Duration::from_millis(10));
        assert!(wake.data_ready && wake.tx_pending && !wake.timed_out);
        let wake = signal.wait(Duration::from_millis(10));
        assert!(!wake.data_ready && wake.tx_pending);
        signal.clear_tx_pending();
        assert!(signal.wait(Duration::from_millis(10)).timed_out);
    }

    #[test]
    fn test_queue_sets_tx_pending_until_drained() {
        let shared = Shared::new(Config::default());
        shared.queue(Channel::HubControl, &[0xF9, 0]).unwrap();
        shared.queue(Channel::HubControl, &[0xF9, 0]).unwrap();
        assert!(shared.signal.wait(Duration::from_millis(10)).tx_pending);
        assert!(shared.next_frame().is_some());
        assert!(shared.signal.wait(Duration::from_millis(10)).tx_pending);
        assert!(shared.next_frame().is_some());
        assert!(shared.signal.wait(Duration::from_millis(10)).timed_out);
    }

    #[test]
    fn test_fail_in_flight_reaches_waiters() {
        let shared = Shared::new(Config::default());
        let handle = lock(&shared.control)
            .pending
            .register(ResponseKey::Command(SH2_CMD_DCD), Some(0));
        let (transfer, _) = FrsTransfer::read(FRS_TYPE_SENSOR_ORIENTATION, 0, 4);
        let (done, frs_waiter) = sync_channel(1);
        lock(&shared.control).frs = Some(ActiveFrs {
            token: 1,
            transfer,
            done,
        });

        assert_eq!(shared.fail_in_flight("EIO"), 2);
        assert!(matches!(handle.rx.try_recv(), Ok(Err(Error::Bus(ref e))) if e == "EIO"));
        assert!(matches!(frs_waiter.try_recv(), Ok(Err(Error::Bus(_)))));
        assert!(!lock(&shared.control).has_outstanding_work());
        assert_eq!(shared.fail_in_flight("EIO"), 0);
    }

    #[test]
    fn test_shutdown_wakes_waiter() {
        let signal = Arc::new(IoSignal::default());
        let s = Arc::clone(&signal);
        let handle = thread::spawn(move || s.wait(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        signal.shutdown();
        assert!(handle.join().unwrap().shutdown);
    }
}
