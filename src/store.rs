// Copyright 2025 Au-Zone Technologies Inc.
// SPDX-License-Identifier: Apache-2.0

//! Latest report values, the enabled-report set and report callbacks.
//!
//! The processing thread is the only writer of [`ReportStore`]; every other
//! thread reads copies taken under a short read lock.

use crate::{
    constants::NUM_CHANNELS,
    packet::Channel,
    reports::{Report, ReportId},
};
use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

/// One slot per report id below 64
pub const REPORT_SLOTS: usize = 64;

/// Handler invoked from the processing thread for each new report
pub type ReportCallback = Arc<dyn Fn(&Report) + Send + Sync>;

/// Bitmask of the reports the host has asked the hub to produce
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnabledReports(u64);

impl EnabledReports {
    fn bit(id: ReportId) -> u64 {
        1u64 << (u8::from(id) as u32 % REPORT_SLOTS as u32)
    }

    pub fn insert(&mut self, id: ReportId) {
        self.0 |= Self::bit(id);
    }

    pub fn remove(&mut self, id: ReportId) {
        self.0 &= !Self::bit(id);
    }

    pub fn contains(&self, id: ReportId) -> bool {
        self.0 & Self::bit(id) != 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = ReportId> + '_ {
        ReportId::ALL.into_iter().filter(|id| self.contains(*id))
    }
}

/// Most recent value of every report type
pub struct ReportStore {
    latest: [Option<Report>; REPORT_SLOTS],
    /// Host receive time of the last update, microseconds since engine start
    update_time: [u64; REPORT_SLOTS],
    updates: u64,
}

impl Default for ReportStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportStore {
    pub fn new() -> Self {
        Self {
            latest: [None; REPORT_SLOTS],
            update_time: [0; REPORT_SLOTS],
            updates: 0,
        }
    }

    fn slot(id: ReportId) -> usize {
        u8::from(id) as usize % REPORT_SLOTS
    }

    pub fn update(&mut self, report: Report, host_time_us: u64) {
        let slot = Self::slot(report.id);
        self.latest[slot] = Some(report);
        self.update_time[slot] = host_time_us;
        self.updates += 1;
    }

    pub fn get(&self, id: ReportId) -> Option<Report> {
        self.latest[Self::slot(id)]
    }

    pub fn last_update_time(&self, id: ReportId) -> u64 {
        self.update_time[Self::slot(id)]
    }

    /// Total number of reports stored since creation
    pub fn update_count(&self) -> u64 {
        self.updates
    }

    pub fn clear(&mut self) {
        self.latest = [None; REPORT_SLOTS];
        self.update_time = [0; REPORT_SLOTS];
    }
}

/// What a callback listens to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKey {
    Report(ReportId),
    Any,
}

impl From<ReportId> for CallbackKey {
    fn from(id: ReportId) -> Self {
        CallbackKey::Report(id)
    }
}

/// Named handlers, in registration order per key
#[derive(Default)]
pub struct CallbackRegistry {
    handlers: HashMap<CallbackKey, Vec<(String, ReportCallback)>>,
}

impl CallbackRegistry {
    /// Register `callback` under `name`. An existing handler with the same
    /// name is kept and `false` returned.
    pub fn add(&mut self, key: CallbackKey, name: String, callback: ReportCallback) -> bool {
        let list = self.handlers.entry(key).or_default();
        if list.iter().any(|(n, _)| *n == name) {
            return false;
        }
        list.push((name, callback));
        true
    }

    pub fn remove(&mut self, key: CallbackKey, name: &str) -> bool {
        let Some(list) = self.handlers.get_mut(&key) else {
            return false;
        };
        let before = list.len();
        list.retain(|(n, _)| n != name);
        before != list.len()
    }

    /// Handlers for `id` followed by the "any" handlers
    pub fn handlers_for(&self, id: ReportId) -> Vec<ReportCallback> {
        let specific = self.handlers.get(&CallbackKey::Report(id));
        let any = self.handlers.get(&CallbackKey::Any);
        specific
            .into_iter()
            .chain(any)
            .flat_map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// "Data available" notification per channel
#[derive(Default)]
pub struct DataNotifier {
    counts: Mutex<[u64; NUM_CHANNELS]>,
    cv: Condvar,
}

impl DataNotifier {
    pub fn notify(&self, channel: Channel) {
        if let Ok(mut counts) = self.counts.lock() {
            counts[channel.index()] += 1;
        }
        self.cv.notify_all();
    }

    fn count(counts: &[u64; NUM_CHANNELS], channel: Option<Channel>) -> u64 {
        match channel {
            Some(c) => counts[c.index()],
            None => counts.iter().sum(),
        }
    }

    /// Block until new data arrives on `channel` (any channel for `None`).
    /// Returns false on timeout.
    pub fn wait(&self, channel: Option<Channel>, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let Ok(mut counts) = self.counts.lock() else {
            return false;
        };
        let start = Self::count(&counts, channel);
        while Self::count(&counts, channel) == start {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            counts = match self.cv.wait_timeout(counts, deadline - now) {
                Ok((guard, _)) => guard,
                Err(_) => return false,
            };
        }
        true
    }
}
