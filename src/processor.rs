// Copyright 2025 Au-Zone Technologies Inc.
// SPDX-License-Identifier: Apache-2.0

//! Processing context.
//!
//! Deframes every received buffer, checks channel sequence numbers, rebuilds
//! fragmented cargo and dispatches it by channel: sensor reports to the
//! report store and callbacks, responses to the requests waiting on them,
//! FRS responses to the active transfer. Reset indications fail everything
//! in flight.

use crate::{
    command::{CommandResponse, FeatureResponse, ProductId, ResetReason, Response, ResponseKey},
    constants::{
        hub_error_to_str, CMD_RESP_ADVERTISEMENT, CMD_RESP_ERROR_LIST,
        EXECUTABLE_DEVICE_RESP_RESET_COMPLETE, PACKET_RECV_BUF_LEN, SH2_STARTUP_INIT_UNSOLICITED,
        SHUB_COMMAND_RESP, SHUB_FRS_READ_RESP, SHUB_FRS_WRITE_RESP, SHUB_GET_FEATURE_RESP,
        SHUB_PROD_ID_RESP,
    },
    error::{Error, FrsError},
    frs::{FrsReadResponse, FrsStep, FrsTransfer, FrsWriteResponse},
    packet::{decode_frame, Channel, Packet, Reassembler, SequenceTracker},
    pipeline::{lock, write, RxBuffer, Shared},
    reports::{decode_gyro_integrated, InputReports, Report, ReportId, TimestampClock},
};
use log::{debug, info, trace, warn};
use std::sync::Arc;

/// What the hub last told us about resets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetStatus {
    pub reason: ResetReason,
    /// Resets observed since the engine started
    pub count: u32,
    /// Host time of the latest reset, microseconds since the engine started
    pub last_reset_us: Option<u64>,
}

/// Result of handling one packet, or one report within it
#[derive(Debug)]
pub enum Outcome {
    Report(ReportId),
    /// Report for a feature the host has not enabled
    Stale(ReportId),
    Resolved(ResponseKey),
    FrsProgress,
    FrsComplete,
    Reset,
    /// Other traffic, by report id
    Control(u8),
    Dropped(Error),
}

pub(crate) struct Processor {
    shared: Arc<Shared>,
    sequences: SequenceTracker,
    reassembler: Reassembler,
    clock: TimestampClock,
}

impl Processor {
    pub fn new(shared: Arc<Shared>) -> Self {
        let max_cargo = shared.config.max_transfer.max(PACKET_RECV_BUF_LEN);
        Self {
            shared,
            sequences: SequenceTracker::default(),
            reassembler: Reassembler::new(max_cargo),
            clock: TimestampClock::default(),
        }
    }

    pub fn handle_buffer(&mut self, buffer: RxBuffer) -> Vec<Outcome> {
        let frame = match decode_frame(&buffer.bytes, buffer.capacity) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!("dropping frame: {}", e);
                return vec![Outcome::Dropped(e.into())];
            }
        };

        let reset = if frame.continuation {
            None
        } else {
            self.reset_indication(&frame)
        };
        if reset.is_some() {
            // the hub restarts its sequence numbers and clock
            self.sequences.reset();
            self.reassembler.clear();
            self.clock.reset();
        }

        match self.sequences.check(frame.channel, frame.sequence) {
            Ok(0) => {}
            Ok(lost) => debug!(
                "{:?}: {} packets lost before seq {}",
                frame.channel, lost, frame.sequence
            ),
            Err(e) => {
                warn!("{}", e);
                return vec![Outcome::Dropped(e)];
            }
        }

        let packet = match self.reassembler.push(frame) {
            Ok(Some(packet)) => packet,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!("dropping fragment: {}", e);
                return vec![Outcome::Dropped(e.into())];
            }
        };

        let mut outcomes = Vec::new();
        if let Some(source) = reset {
            self.handle_reset(source);
            outcomes.push(Outcome::Reset);
        }
        self.dispatch(&packet, buffer.host_time_us, reset.is_some(), &mut outcomes);
        self.shared.notifier.notify(packet.channel);
        outcomes
    }

    /// Does this packet announce a hub reset
    fn reset_indication(&self, frame: &Packet) -> Option<&'static str> {
        let id = *frame.payload.first()?;
        match (frame.channel, id) {
            (Channel::Command, CMD_RESP_ADVERTISEMENT) => Some("advertisement"),
            (Channel::Executable, EXECUTABLE_DEVICE_RESP_RESET_COMPLETE) => Some("reset complete"),
            (Channel::HubControl, SHUB_COMMAND_RESP)
                if frame.payload.get(2) == Some(&SH2_STARTUP_INIT_UNSOLICITED) =>
            {
                Some("unsolicited initialize")
            }
            (Channel::HubControl, SHUB_PROD_ID_RESP) => {
                // the hub answers one request with a burst of product ids
                let control = lock(&self.shared.control);
                let solicited = control.pending.contains(ResponseKey::ProductId)
                    || control.last_control_report == Some(SHUB_PROD_ID_RESP);
                (!solicited).then_some("unsolicited product id")
            }
            _ => None,
        }
    }

    fn handle_reset(&mut self, source: &str) {
        let mut control = lock(&self.shared.control);
        let mut failed = control.pending.fail_all(|| Error::ResetOccurred);
        if let Some(active) = control.frs.take() {
            let _ = active.done.try_send(Err(Error::ResetOccurred));
            failed += 1;
        }
        control.enabled.clear();
        let aborted = control.calibration.abort();

        if control.reset_latched {
            debug!("{} after reset, nothing new in flight", source);
        } else {
            control.reset.count += 1;
            control.reset.last_reset_us = Some(self.shared.now_us());
            control.reset_latched = true;
            info!(
                "sensor hub reset ({}), {} requests failed",
                source, failed
            );
        }
        if aborted {
            warn!("calibration aborted by reset");
        }
        drop(control);
        self.shared.control_cv.notify_all();
    }

    fn dispatch(&mut self, packet: &Packet, host_time_us: u64, is_reset: bool, outcomes: &mut Vec<Outcome>) {
        let payload = packet.payload.as_slice();
        let Some(&id) = payload.first() else {
            return;
        };
        match packet.channel {
            Channel::Command => match id {
                CMD_RESP_ADVERTISEMENT => {
                    log_advertisement(payload);
                    outcomes.push(Outcome::Control(id));
                }
                CMD_RESP_ERROR_LIST => {
                    log_error_list(payload);
                    outcomes.push(Outcome::Control(id));
                }
                _ => debug!("unknown command channel report 0x{:02X}", id),
            },
            Channel::Executable => match id {
                EXECUTABLE_DEVICE_RESP_RESET_COMPLETE => trace!("reset complete"),
                _ => debug!("unknown executable report 0x{:02X}", id),
            },
            Channel::HubControl => {
                self.dispatch_control(id, payload, is_reset, outcomes);
                lock(&self.shared.control).last_control_report = Some(id);
            }
            Channel::SensorReports | Channel::WakeReports => {
                let reports: Vec<_> =
                    InputReports::new(packet.channel, payload, &mut self.clock).collect();
                for result in reports {
                    match result {
                        Ok(report) => self.apply(report, host_time_us, outcomes),
                        Err(e) => {
                            warn!("{:?}: {}", packet.channel, e);
                            outcomes.push(Outcome::Dropped(e.into()));
                        }
                    }
                }
            }
            Channel::GyroRotation => {
                for report in decode_gyro_integrated(payload, packet.sequence, host_time_us) {
                    self.apply(report, host_time_us, outcomes);
                }
            }
        }
    }

    fn dispatch_control(&mut self, id: u8, payload: &[u8], is_reset: bool, outcomes: &mut Vec<Outcome>) {
        match id {
            SHUB_COMMAND_RESP => match CommandResponse::parse(payload) {
                Ok(r) if r.is_unsolicited() => {
                    debug!("unsolicited command response 0x{:02X}", r.command);
                    outcomes.push(Outcome::Control(id));
                }
                Ok(r) => {
                    trace!("CMD_RESP: 0x{:X} status {}", r.command, r.status());
                    self.resolve(Response::Command(r), outcomes);
                }
                Err(e) => outcomes.push(Outcome::Dropped(e.into())),
            },
            SHUB_PROD_ID_RESP => match ProductId::parse(payload) {
                Ok(pid) => {
                    debug!(
                        "product id: part {} sw {}.{}.{} build {}, reset cause {:?}",
                        pid.part_number,
                        pid.sw_major,
                        pid.sw_minor,
                        pid.patch,
                        pid.build_number,
                        pid.reset_reason
                    );
                    lock(&self.shared.control).reset.reason = pid.reset_reason;
                    if !is_reset {
                        self.resolve(Response::ProductId(pid), outcomes);
                    }
                }
                Err(e) => outcomes.push(Outcome::Dropped(e.into())),
            },
            SHUB_GET_FEATURE_RESP => match FeatureResponse::parse(payload) {
                Ok(r) => {
                    trace!("feat resp: 0x{:02X} every {} us", r.report_id, r.settings.interval_us);
                    if r.settings.interval_us == 0 {
                        if let Ok(report_id) = ReportId::try_from(r.report_id) {
                            lock(&self.shared.control).enabled.remove(report_id);
                        }
                    }
                    self.resolve(Response::Feature(r), outcomes);
                }
                Err(e) => outcomes.push(Outcome::Dropped(e.into())),
            },
            SHUB_FRS_READ_RESP => match FrsReadResponse::parse(payload) {
                Ok(r) => outcomes.push(self.advance_frs(Some(r.record), |t| t.on_read_response(&r))),
                Err(e) => outcomes.push(Outcome::Dropped(e.into())),
            },
            SHUB_FRS_WRITE_RESP => match FrsWriteResponse::parse(payload) {
                Ok(r) => outcomes.push(self.advance_frs(None, |t| t.on_write_response(&r))),
                Err(e) => outcomes.push(Outcome::Dropped(e.into())),
            },
            _ => debug!("unhandled hub control report 0x{:02X}", id),
        }
    }

    fn resolve(&self, response: Response, outcomes: &mut Vec<Outcome>) {
        let key = response.key();
        match lock(&self.shared.control).pending.resolve(response) {
            Ok(()) => outcomes.push(Outcome::Resolved(key)),
            Err(e) => {
                debug!("{}", e);
                outcomes.push(Outcome::Dropped(e));
            }
        }
    }

    fn advance_frs(
        &self,
        record: Option<u16>,
        step: impl FnOnce(&mut FrsTransfer) -> Result<FrsStep, FrsError>,
    ) -> Outcome {
        let mut control = lock(&self.shared.control);
        let Some(active) = control.frs.as_mut() else {
            debug!("FRS response with no transfer in progress");
            return Outcome::Dropped(Error::UnmatchedResponse(ResponseKey::Frs));
        };
        if let Some(record) = record.filter(|r| *r != active.transfer.record()) {
            debug!(
                "FRS response for 0x{:04X}, transfer is for 0x{:04X}",
                record,
                active.transfer.record()
            );
            return Outcome::Dropped(Error::UnmatchedResponse(ResponseKey::Frs));
        }

        let record = active.transfer.record();
        let result = match step(&mut active.transfer) {
            Ok(FrsStep::Pending) => return Outcome::FrsProgress,
            Ok(FrsStep::Send(payload)) => match self.shared.queue(Channel::HubControl, &payload) {
                Ok(_) => return Outcome::FrsProgress,
                Err(e) => Err(e),
            },
            Ok(FrsStep::Done(words)) => {
                debug!("FRS 0x{:04X}: done, {} words", record, words.len());
                Ok(words)
            }
            Err(e) => {
                warn!("FRS 0x{:04X}: transfer aborted: {}", record, e);
                Err(e.into())
            }
        };
        if let Some(active) = control.frs.take() {
            let _ = active.done.try_send(result);
        }
        Outcome::FrsComplete
    }

    fn apply(&self, report: Report, host_time_us: u64, outcomes: &mut Vec<Outcome>) {
        let id = report.id;
        {
            let mut control = lock(&self.shared.control);
            if !control.enabled.contains(id) {
                trace!("stale report 0x{:02X}", u8::from(id));
                outcomes.push(Outcome::Stale(id));
                return;
            }
            if control.calibration.on_report(&report) {
                self.shared.control_cv.notify_all();
            }
        }
        write(&self.shared.store).update(report, host_time_us);

        let handlers = lock(&self.shared.callbacks).handlers_for(id);
        for handler in handlers {
            handler(&report);
        }
        outcomes.push(Outcome::Report(id));
    }
}

fn log_advertisement(payload: &[u8]) {
    let mut cursor = 1;
    let mut tags = 0;
    while cursor + 2 <= payload.len() {
        let tag = payload[cursor];
        let len = payload[cursor + 1] as usize;
        trace!("advertisement tag {} ({} bytes)", tag, len);
        cursor += 2 + len;
        tags += 1;
    }
    debug!("advertisement received, {} tags", tags);
}

fn log_error_list(payload: &[u8]) {
    for &code in &payload[1..] {
        match hub_error_to_str(code) {
            Some(msg) => warn!("{}: Error code {}", msg, code),
            None if code == 0 => {}
            None => debug!("Unknown error code {}", code),
        }
    }
}
