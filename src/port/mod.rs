// ptpsyncd — PTP Port Engine
// Distributed under the MIT software license.

//! The nine-state port machine.
//!
//! The port is sans-I/O: the engine feeds it received datagrams, resolved
//! TX timestamps and ticks, and drains packed outbound messages from
//! `take_outbound`. All protocol sequencing, timestamp pairing and state
//! transitions happen here.

pub mod alarms;
pub mod bmca;
pub mod foreign;
pub mod timers;

pub use alarms::*;
pub use bmca::{compare_datasets, decide_state, select_best, ComparableDataset, RecommendedState};
pub use foreign::{ForeignMasterDataset, ForeignMasterRecord, ObserveOutcome};
pub use timers::{TimerBank, TimerId, TICK_RESOLUTION};

use crate::clock::{Clock, CompareMonitor};
use crate::config::{Config, DelayMechanism};
use crate::error::{ConfigError, WireError};
use crate::servo::{Servo, ServoOutcome, TimestampSet};
use crate::stats::PortStats;
use crate::transport::{is_unicast_destination, Acl, SendKind, TxTag, TxTimestampCache};
use crate::types::{
    log_interval_to_secs, ClockIdentity, PortIdentity, TimeInterval, Timestamp, WireTimestamp,
};
use crate::wire::{
    precise_origin_timestamp, precise_receipt_timestamp, AnnounceBody, Body, ClockQuality, Header,
    ManagementAction, ManagementBody, Message, MessageType, SlaveRxComputedRecord,
    SlaveRxSyncRecord, Tlv, TxEventRecord, FLAG_LEAP59, FLAG_LEAP61,
    FLAG_TWO_STEP, FLAG_UNICAST, FLAG_UTC_OFFSET_VALID, MGMT_CURRENT_DATA_SET,
    MGMT_DEFAULT_DATA_SET, MGMT_ERROR_NO_SUCH_ID, MGMT_NULL_MANAGEMENT, MGMT_PARENT_DATA_SET,
    MGMT_PORT_DATA_SET, MGMT_TIME_PROPERTIES_DATA_SET,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// The IEEE 1588 port states, numbered per the standard's enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PortState {
    Initializing = 1,
    Faulty = 2,
    Disabled = 3,
    Listening = 4,
    PreMaster = 5,
    Master = 6,
    Passive = 7,
    Uncalibrated = 8,
    Slave = 9,
}

/// Timestamp failures tolerated before the corresponding alarm latches.
const TIMESTAMP_FAILURE_THRESHOLD: u32 = 3;

/// Records age out of the foreign-master table after this many announce
/// intervals without a refresh.
const FOREIGN_EXPIRY_INTERVALS: u32 = 4;

/// Observation window reported to MTIE monitoring polls.
const MTIE_WINDOW: Duration = Duration::from_secs(60);

/// A packed message waiting for the engine to put it on the wire.
#[derive(Debug)]
pub struct Outbound {
    pub kind: SendKind,
    pub bytes: Vec<u8>,
    pub dest: Option<SocketAddr>,
}

/// Per-role transmit sequence counters.
#[derive(Debug, Default, Clone, Copy)]
struct Sequences {
    sent_sync: u16,
    sent_delay_req: u16,
    sent_pdelay_req: u16,
    sent_announce: u16,
    sent_signaling: u16,
}

/// The selected master and what we have adopted from it.
#[derive(Debug, Clone)]
struct Parent {
    identity: PortIdentity,
    announce: AnnounceBody,
    log_announce_interval: i8,
    log_sync_interval: i8,
    /// Master-advertised Delay_Req pacing, from Delay_Resp.
    log_min_delay_req_interval: i8,
}

/// A Sync waiting for its Follow_Up.
#[derive(Debug, Clone, Copy)]
struct PendingSync {
    sequence_id: u16,
    rx_timestamp: Timestamp,
    correction: TimeInterval,
    received_at: Instant,
}

/// An in-flight peer-delay exchange.
#[derive(Debug, Clone, Copy, Default)]
struct PendingPDelay {
    sequence_id: u16,
    /// Our request egress.
    t1: Option<Timestamp>,
    /// Remote request receipt.
    t2: Option<Timestamp>,
    /// Remote response origin.
    t3: Option<Timestamp>,
    /// Our response ingress, with the response correction removed.
    t4: Option<Timestamp>,
    two_step: bool,
}

impl PendingPDelay {
    fn mean_path_delay(&self) -> Option<f64> {
        let (t1, t2, t3, t4) = (self.t1?, self.t2?, self.t3?, self.t4?);
        let turnaround = t4.delta_nanos_f64(t1);
        let residence = t3.delta_nanos_f64(t2);
        Some((turnaround - residence) / 2.0)
    }
}

/// Wrap-aware sequence comparison: true when `new` advances past `old`.
fn sequence_newer(new: u16, old: u16) -> bool {
    new.wrapping_sub(old) as i16 > 0
}

pub struct PtpPort {
    config: Config,
    state: PortState,
    own_identity: PortIdentity,
    own_quality: ClockQuality,

    foreign: ForeignMasterDataset,
    parent: Option<Parent>,

    timers: TimerBank,
    pub alarms: AlarmSet,
    sequences: Sequences,
    tx_cache: TxTimestampCache,
    servo: Servo,
    ts_set: TimestampSet,

    pending_sync: Option<PendingSync>,
    /// Sequence id of the outstanding Delay_Req, once its egress resolves.
    pending_delay_req: Option<u16>,
    unanswered_delay_reqs: u32,
    pending_pdelay: Option<PendingPDelay>,
    pdelay_mean_path_ns: Option<f64>,

    last_rx_sync_seq: Option<u16>,
    last_rx_sync_record: Option<SlaveRxSyncRecord>,
    last_tx_event: Option<TxEventRecord>,

    /// Diagnostic cross-check clock (the system clock when a PHC is being
    /// disciplined), compared once per announce interval.
    reference_clock: Option<Arc<dyn Clock>>,
    compare_monitor: CompareMonitor,

    /// Offset extremes: the window being filled and the last completed one.
    mtie_current: Option<(f64, f64)>,
    mtie_reported: Option<(f64, f64)>,
    mtie_last_roll: Option<Instant>,

    acl_timing: Acl,
    acl_management: Acl,
    acl_monitoring: Acl,

    current_utc_offset: i16,
    utc_offset_valid: bool,
    leap61: bool,
    leap59: bool,

    consecutive_rx_ts_failures: u32,
    trailer_len: usize,

    pub stats: PortStats,
    outbound: Vec<Outbound>,
}

impl PtpPort {
    pub fn new(
        config: Config,
        mac: [u8; 6],
        port_number: u16,
        clock: Arc<dyn Clock>,
        saved_correction_ppb: f64,
        trailer_len: usize,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let clock_identity = ClockIdentity::from_mac(mac, config.clockid_fill());
        let own_identity = PortIdentity::new(clock_identity, port_number);
        let acl_timing = Acl::compile(&config.acl_timing)?;
        let acl_management = Acl::compile(&config.acl_management)?;
        let acl_monitoring = Acl::compile(&config.acl_monitoring)?;
        let servo = Servo::new(clock, &config, saved_correction_ppb);
        let foreign = ForeignMasterDataset::new(config.foreign_record_capacity);
        Ok(PtpPort {
            state: PortState::Initializing,
            own_identity,
            own_quality: ClockQuality::default_free_running(),
            foreign,
            parent: None,
            timers: TimerBank::new(),
            alarms: AlarmSet::new(),
            sequences: Sequences::default(),
            tx_cache: TxTimestampCache::new(),
            servo,
            ts_set: TimestampSet::default(),
            pending_sync: None,
            pending_delay_req: None,
            unanswered_delay_reqs: 0,
            pending_pdelay: None,
            pdelay_mean_path_ns: None,
            last_rx_sync_seq: None,
            last_rx_sync_record: None,
            last_tx_event: None,
            reference_clock: None,
            compare_monitor: CompareMonitor::new(),
            mtie_current: None,
            mtie_reported: None,
            mtie_last_roll: None,
            acl_timing,
            acl_management,
            acl_monitoring,
            current_utc_offset: 0,
            utc_offset_valid: false,
            leap61: false,
            leap59: false,
            consecutive_rx_ts_failures: 0,
            trailer_len,
            stats: PortStats::default(),
            outbound: Vec::new(),
            config,
        })
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn identity(&self) -> PortIdentity {
        self.own_identity
    }

    pub fn parent_identity(&self) -> Option<PortIdentity> {
        self.parent.as_ref().map(|p| p.identity)
    }

    pub fn servo(&self) -> &Servo {
        &self.servo
    }

    pub fn foreign_dataset(&self) -> &ForeignMasterDataset {
        &self.foreign
    }

    /// Install the diagnostic cross-check clock; compares run once per
    /// announce interval from `tick`.
    pub fn set_reference_clock(&mut self, clock: Arc<dyn Clock>) {
        self.reference_clock = Some(clock);
    }

    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbound)
    }

    /// Drop into FAULTY after a fatal setup failure. Only an external
    /// re-initialise leaves this state.
    pub fn set_fault(&mut self) {
        warn!("port {} entering FAULTY", self.own_identity);
        self.signal_sync_status(false);
        self.timers.stop_all();
        self.state = PortState::Faulty;
    }

    /// Enable the port: LISTENING with the receipt timeout armed.
    pub fn start(&mut self) {
        self.state = PortState::Listening;
        self.sequences = Sequences::default();
        self.alarms.clear_all();
        self.timers.stop_all();
        self.timers.start(TimerId::AnnounceReceiptTimeout, self.announce_receipt_window());
        self.timers.start(TimerId::ForeignMasterTimeout, self.announce_interval());
        if self.config.delay_mechanism == DelayMechanism::P2p {
            self.timers.start_random(TimerId::PDelayReqInterval, self.pdelay_req_interval());
        }
        info!("port {} listening (domain {})", self.own_identity, self.config.domain_number);
    }

    /// Disable the port. Timers stop, the TX cache flushes, and the engine
    /// finishes teardown (groups, sockets, persistence).
    pub fn stop(&mut self) {
        self.timers.stop_all();
        let flushed = self.tx_cache.flush();
        if flushed > 0 {
            info!("flushed {} pending tx timestamps at shutdown", flushed);
            self.stats.tx_cache_evictions += flushed as u64;
        }
        self.signal_sync_status(false);
        self.parent = None;
        self.ts_set.clear();
        self.state = PortState::Disabled;
    }

    // =========================================================================
    // INTERVALS
    // =========================================================================

    fn announce_interval(&self) -> Duration {
        let log2 = self
            .parent
            .as_ref()
            .map(|p| p.log_announce_interval)
            .unwrap_or(self.config.announce_interval_log2);
        Duration::from_secs_f64(log_interval_to_secs(log2))
    }

    fn announce_receipt_window(&self) -> Duration {
        self.announce_interval() * self.config.announce_receipt_timeout as u32
    }

    fn sync_interval(&self) -> Duration {
        let log2 = self
            .parent
            .as_ref()
            .map(|p| p.log_sync_interval)
            .unwrap_or(self.config.sync_interval_log2);
        Duration::from_secs_f64(log_interval_to_secs(log2))
    }

    fn delay_req_interval(&self) -> Duration {
        let log2 = self
            .parent
            .as_ref()
            .map(|p| p.log_min_delay_req_interval.max(self.config.min_delay_req_interval_log2))
            .unwrap_or(self.config.min_delay_req_interval_log2);
        Duration::from_secs_f64(log_interval_to_secs(log2))
    }

    fn pdelay_req_interval(&self) -> Duration {
        Duration::from_secs_f64(log_interval_to_secs(self.config.min_delay_req_interval_log2))
    }

    // =========================================================================
    // RECEIVE PATH
    // =========================================================================

    /// Process one received datagram.
    pub fn on_rx(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        rx_timestamp: Option<Timestamp>,
        now: Instant,
    ) {
        if matches!(self.state, PortState::Initializing | PortState::Faulty | PortState::Disabled)
        {
            return;
        }

        let message = match Message::unpack(data) {
            Ok(message) => message,
            Err(e) => {
                self.stats.rx_decode_errors += 1;
                if matches!(e, WireError::Truncated { .. }) {
                    self.stats.rx_truncated += 1;
                }
                debug!("rx decode error from {}: {}", from, e);
                return;
            }
        };

        if message.header.domain_number != self.config.domain_number {
            return;
        }
        if message.header.source_port_identity.clock == self.own_identity.clock {
            // Our own multicast looped back.
            return;
        }

        let acl = match message.header.message_type {
            MessageType::Management => &mut self.acl_management,
            MessageType::Signaling => &mut self.acl_monitoring,
            _ => &mut self.acl_timing,
        };
        if !acl.permits(from.ip()) {
            self.stats.rx_acl_drops += 1;
            debug!("acl drop {} from {}", message.header.message_type.name(), from);
            return;
        }

        self.stats.rx_messages += 1;

        match message.header.message_type {
            MessageType::Announce => self.handle_announce(&message, from, now),
            MessageType::Sync => self.handle_sync(&message, rx_timestamp, now),
            MessageType::FollowUp => self.handle_follow_up(&message, now),
            MessageType::DelayReq => self.handle_delay_req(&message, rx_timestamp, now),
            MessageType::DelayResp => self.handle_delay_resp(&message, now),
            MessageType::PDelayReq => self.handle_pdelay_req(&message, rx_timestamp, now),
            MessageType::PDelayResp => self.handle_pdelay_resp(&message, rx_timestamp, now),
            MessageType::PDelayRespFollowUp => self.handle_pdelay_resp_follow_up(&message, now),
            MessageType::Management => {
                if let Some(response) = self.handle_management(&message) {
                    self.emit(SendKind::General, response, Some(from), now);
                }
            }
            MessageType::Signaling => self.handle_signaling(&message, from, now),
        }
    }

    fn handle_announce(&mut self, message: &Message, from: SocketAddr, now: Instant) {
        let Body::Announce(announce) = &message.body else { return };

        // Duplicate/stale suppression keyed on the sender's record.
        if let Some((_, record)) = self
            .foreign
            .occupied()
            .find(|(_, r)| r.port_identity == message.header.source_port_identity)
            && !sequence_newer(message.header.sequence_id, record.header.sequence_id)
        {
            self.stats.rx_stale_sequence += 1;
            return;
        }

        match self.foreign.observe(message.header, *announce, from, now) {
            ObserveOutcome::Dropped => {
                self.stats.rx_foreign_dropped += 1;
                return;
            }
            ObserveOutcome::Inserted(_) | ObserveOutcome::Updated(_) => {}
        }

        if self.parent.as_ref().is_some_and(|p| p.identity == message.header.source_port_identity)
        {
            // Fresh announce from the selected master.
            self.timers.start(TimerId::AnnounceReceiptTimeout, self.announce_receipt_window());
            self.adopt_time_properties(&message.header, announce);
            if let Some(parent) = self.parent.as_mut() {
                parent.announce = *announce;
                parent.log_announce_interval = message.header.log_message_interval;
            }
        }

        self.run_bmca(now);
    }

    fn handle_sync(&mut self, message: &Message, rx_timestamp: Option<Timestamp>, now: Instant) {
        if !matches!(self.state, PortState::Slave | PortState::Uncalibrated) {
            return;
        }
        if !self.from_parent(&message.header) {
            return;
        }
        if self.config.delay_mechanism == DelayMechanism::Disabled {
            return;
        }

        let seq = message.header.sequence_id;
        if let Some(last) = self.last_rx_sync_seq
            && !sequence_newer(seq, last)
        {
            self.stats.rx_stale_sequence += 1;
            return;
        }
        self.last_rx_sync_seq = Some(seq);

        let Some(rx_timestamp) = rx_timestamp else {
            self.note_rx_timestamp_failure();
            return;
        };
        self.note_rx_timestamp_ok();

        if message.header.log_message_interval != 0x7f
            && let Some(parent) = self.parent.as_mut()
            && parent.log_sync_interval != message.header.log_message_interval
        {
            parent.log_sync_interval = message.header.log_message_interval;
            self.servo.set_sync_interval(message.header.log_message_interval);
        }

        if message.header.two_step() {
            self.pending_sync = Some(PendingSync {
                sequence_id: seq,
                rx_timestamp,
                correction: message.header.correction,
                received_at: now,
            });
            return;
        }

        // One-step: the Sync body carries the origin.
        let Body::Sync { origin } = &message.body else { return };
        self.ts_set.set_t1(Timestamp::from_wire(*origin), message.header.correction);
        self.ts_set.set_t2(rx_timestamp, TimeInterval::ZERO);
        self.pending_sync = None;
        self.last_rx_sync_record = Some(SlaveRxSyncRecord {
            sequence_id: seq,
            sync_origin: *origin,
            total_correction: message.header.correction,
            scaled_cumulative_rate_offset: 0,
            sync_ingress: rx_timestamp.split_precise().0,
        });
        self.after_m2s_update(now);
    }

    fn handle_follow_up(&mut self, message: &Message, now: Instant) {
        if !matches!(self.state, PortState::Slave | PortState::Uncalibrated) {
            return;
        }
        if !self.from_parent(&message.header) {
            return;
        }
        let Body::FollowUp { precise_origin } = &message.body else { return };

        let Some(pending) = self.pending_sync else {
            self.stats.missing_followups += 1;
            return;
        };
        if pending.sequence_id != message.header.sequence_id {
            // Late or mismatched Follow_Up: the m2s half is lost.
            self.stats.missing_followups += 1;
            if self.stats.missing_followups >= TIMESTAMP_FAILURE_THRESHOLD as u64
                && self.alarms.raise(ALARM_NO_FOLLOWUPS)
            {
                warn!("follow-ups not matching syncs (seq {} vs {})",
                    message.header.sequence_id, pending.sequence_id);
            }
            return;
        }
        if now.saturating_duration_since(pending.received_at) > self.sync_interval() {
            self.stats.missing_followups += 1;
            debug!("follow-up for seq {} arrived after the sync interval", pending.sequence_id);
            return;
        }

        self.alarms.clear(ALARM_NO_FOLLOWUPS);
        self.pending_sync = None;
        self.ts_set
            .set_t1(Timestamp::from_wire(*precise_origin), message.header.correction);
        self.ts_set.set_t2(pending.rx_timestamp, pending.correction);
        self.last_rx_sync_record = Some(SlaveRxSyncRecord {
            sequence_id: pending.sequence_id,
            sync_origin: *precise_origin,
            total_correction: message.header.correction + pending.correction,
            scaled_cumulative_rate_offset: 0,
            sync_ingress: pending.rx_timestamp.split_precise().0,
        });
        self.after_m2s_update(now);
    }

    /// Master-to-slave half refreshed: drive the servo (E2E needs the full
    /// quadruple, P2P combines with the standing peer delay).
    fn after_m2s_update(&mut self, now: Instant) {
        match self.config.delay_mechanism {
            DelayMechanism::E2e => {
                if self.ts_set.complete() {
                    self.run_servo(now);
                } else if !self.timers.running(TimerId::DelayReqInterval) {
                    self.timers.start_random(TimerId::DelayReqInterval, self.delay_req_interval());
                }
            }
            DelayMechanism::P2p => {
                if let (Some(m2s), Some(mpd)) =
                    (self.ts_set.m2s_delta_nanos(), self.pdelay_mean_path_ns)
                {
                    match self.servo.update_sample(m2s - mpd, mpd, now) {
                        Ok(ServoOutcome::Stepped(_)) => {
                            self.stats.clock_steps += 1;
                            self.ts_set.clear();
                            self.pending_sync = None;
                            self.note_clock_ok();
                            self.promote_if_uncalibrated();
                        }
                        Ok(ServoOutcome::RejectedOutlier) => self.stats.outliers_rejected += 1,
                        Ok(_) => {
                            if let Some(offset) = self.servo.last_offset_ns {
                                self.note_offset(offset);
                            }
                            self.note_clock_ok();
                            self.promote_if_uncalibrated();
                        }
                        Err(e) => self.note_clock_failure(&e),
                    }
                }
            }
            DelayMechanism::Disabled => {}
        }
    }

    fn handle_delay_resp(&mut self, message: &Message, now: Instant) {
        if !matches!(self.state, PortState::Slave | PortState::Uncalibrated) {
            return;
        }
        let Body::DelayResp { receive, requesting } = &message.body else { return };
        if *requesting != self.own_identity {
            return;
        }
        if !self.from_parent(&message.header) {
            return;
        }
        if self.config.delay_mechanism == DelayMechanism::P2p {
            if self.alarms.raise(ALARM_CAPS_MISMATCH) {
                warn!("master answers end-to-end delay while this port runs peer delay");
            }
            return;
        }
        let Some(expected) = self.pending_delay_req else {
            return;
        };
        if message.header.sequence_id != expected {
            self.stats.rx_stale_sequence += 1;
            return;
        }

        self.pending_delay_req = None;
        self.unanswered_delay_reqs = 0;
        self.alarms.clear(ALARM_NO_DELAY_RESPS);

        if message.header.log_message_interval != 0x7f
            && let Some(parent) = self.parent.as_mut()
        {
            parent.log_min_delay_req_interval = message.header.log_message_interval;
        }

        self.ts_set.set_t4(Timestamp::from_wire(*receive), message.header.correction);
        if self.ts_set.complete() {
            self.run_servo(now);
        }
    }

    // =========================================================================
    // MASTER-ROLE RESPONDERS
    // =========================================================================

    fn handle_delay_req(&mut self, message: &Message, rx_timestamp: Option<Timestamp>, now: Instant) {
        if self.state != PortState::Master {
            if self.config.delay_mechanism == DelayMechanism::P2p
                && self.from_parent(&message.header)
                && self.alarms.raise(ALARM_CAPS_MISMATCH)
            {
                warn!("peer requests end-to-end delay while this port runs peer delay");
            }
            return;
        }
        let Some(rx_timestamp) = rx_timestamp else {
            self.note_rx_timestamp_failure();
            return;
        };
        self.note_rx_timestamp_ok();

        let (receive, correction) =
            precise_receipt_timestamp(rx_timestamp, message.header.correction);
        let mut header = self.base_header(MessageType::DelayResp);
        header.sequence_id = message.header.sequence_id;
        header.correction = correction;
        header.log_message_interval = self.config.min_delay_req_interval_log2;
        let response = Message::new(
            header,
            Body::DelayResp { receive, requesting: message.header.source_port_identity },
        );
        self.emit(SendKind::General, response, None, now);
    }

    fn handle_pdelay_req(&mut self, message: &Message, rx_timestamp: Option<Timestamp>, now: Instant) {
        if self.config.delay_mechanism != DelayMechanism::P2p {
            if self.from_parent(&message.header) && self.alarms.raise(ALARM_CAPS_MISMATCH) {
                warn!("peer runs peer delay while this port runs end-to-end");
            }
            return;
        }
        self.stats.recv_pdelay_reqs += 1;
        let Some(rx_timestamp) = rx_timestamp else {
            self.note_rx_timestamp_failure();
            return;
        };
        self.note_rx_timestamp_ok();

        // Two-step response: receipt timestamp now, origin in the follow-up.
        let (receipt, correction) =
            precise_receipt_timestamp(rx_timestamp, message.header.correction);
        let mut header = self.base_header(MessageType::PDelayResp);
        header.sequence_id = message.header.sequence_id;
        header.correction = correction;
        header.set_flag(FLAG_TWO_STEP, true);
        let requesting = message.header.source_port_identity;
        let response = Message::new(
            header,
            Body::PDelayResp { request_receipt: receipt, requesting },
        );
        self.emit(SendKind::PeerEvent, response, None, now);

        let origin = match self.servo.clock().get_time() {
            Ok(ts) => ts,
            Err(_) => Timestamp::default(),
        };
        let (response_origin, fu_correction) =
            precise_origin_timestamp(origin, TimeInterval::ZERO);
        let mut header = self.base_header(MessageType::PDelayRespFollowUp);
        header.sequence_id = message.header.sequence_id;
        header.correction = fu_correction;
        let follow_up =
            Message::new(header, Body::PDelayRespFollowUp { response_origin, requesting });
        self.emit(SendKind::PeerGeneral, follow_up, None, now);
    }

    fn handle_pdelay_resp(
        &mut self,
        message: &Message,
        rx_timestamp: Option<Timestamp>,
        now: Instant,
    ) {
        let Body::PDelayResp { request_receipt, requesting } = &message.body else { return };
        if *requesting != self.own_identity {
            return;
        }
        if !self
            .pending_pdelay
            .is_some_and(|p| p.sequence_id == message.header.sequence_id)
        {
            return;
        }
        let Some(rx_timestamp) = rx_timestamp else {
            self.note_rx_timestamp_failure();
            return;
        };
        self.note_rx_timestamp_ok();

        if let Some(pending) = self.pending_pdelay.as_mut() {
            pending.t2 = Some(Timestamp::from_wire(*request_receipt));
            pending.t4 = Some(rx_timestamp.apply(-message.header.correction));
            pending.two_step = message.header.two_step();
            if !pending.two_step {
                // One-step responders fold the turnaround into the correction.
                pending.t3 = pending.t2;
            }
        }
        self.finish_pdelay_exchange();
    }

    fn handle_pdelay_resp_follow_up(&mut self, message: &Message, now: Instant) {
        let Body::PDelayRespFollowUp { response_origin, requesting } = &message.body else {
            return;
        };
        if *requesting != self.own_identity {
            return;
        }
        let Some(pending) = self.pending_pdelay.as_mut() else { return };
        if pending.sequence_id != message.header.sequence_id {
            return;
        }
        pending.t3 =
            Some(Timestamp::from_wire(*response_origin).apply(message.header.correction));
        self.finish_pdelay_exchange();
    }

    fn finish_pdelay_exchange(&mut self) {
        let Some(pending) = self.pending_pdelay else { return };
        let Some(mpd) = pending.mean_path_delay() else { return };
        self.pending_pdelay = None;
        self.pdelay_mean_path_ns = Some(mpd);
        debug!("peer delay {:.1} ns", mpd);
    }

    // =========================================================================
    // TX TIMESTAMPS
    // =========================================================================

    /// An error-queue timestamp arrived; correlate and route it.
    pub fn on_tx_ts(&mut self, payload: &[u8], timestamp: Timestamp, now: Instant) {
        let Some(tag) = self.tx_cache.match_payload(payload, now) else {
            warn!(
                "unmatched tx timestamp ({} byte payload, {} pending)",
                payload.len(),
                self.tx_cache.len()
            );
            let tail = &payload[payload.len().saturating_sub(32)..];
            debug!("unmatched payload tail: {}", hex::encode(tail));
            return;
        };
        self.alarms.clear(ALARM_NO_TX_TIMESTAMPS);

        match tag.message_type {
            MessageType::DelayReq => {
                self.pending_delay_req = Some(tag.sequence_id);
                self.ts_set.set_t3(timestamp);
                self.last_tx_event = Some(TxEventRecord {
                    sequence_id: tag.sequence_id,
                    egress: timestamp.split_precise().0,
                });
            }
            MessageType::PDelayReq => {
                if let Some(pending) = self.pending_pdelay.as_mut()
                    && pending.sequence_id == tag.sequence_id
                {
                    pending.t1 = Some(timestamp);
                    self.finish_pdelay_exchange();
                }
            }
            MessageType::Sync => {
                // Two-step master: publish the precise origin.
                let (origin, correction) = precise_origin_timestamp(timestamp, TimeInterval::ZERO);
                let mut header = self.base_header(MessageType::FollowUp);
                header.sequence_id = tag.sequence_id;
                header.correction = correction;
                header.log_message_interval = self.config.sync_interval_log2;
                let follow_up = Message::new(header, Body::FollowUp { precise_origin: origin });
                self.emit(SendKind::General, follow_up, None, now);
            }
            other => {
                debug!("tx timestamp for {:?} ignored", other);
            }
        }
    }

    // =========================================================================
    // TICK
    // =========================================================================

    /// Advance timers and handle expiries. Called by the engine at the tick
    /// resolution.
    pub fn tick(&mut self, delta: Duration, now: Instant) {
        if matches!(self.state, PortState::Initializing | PortState::Faulty | PortState::Disabled)
        {
            return;
        }
        self.timers.tick(delta);

        if self.timers.expired(TimerId::AnnounceReceiptTimeout) {
            self.on_announce_timeout(now);
        }
        if self.timers.expired(TimerId::ForeignMasterTimeout) {
            let window = self.announce_interval() * FOREIGN_EXPIRY_INTERVALS;
            let best_lost = self.foreign.expire(now, window);
            if best_lost {
                info!("selected master aged out of the foreign-master table");
            }
            self.run_bmca(now);
            self.compare_clocks();
            self.timers.start(TimerId::ForeignMasterTimeout, self.announce_interval());
        }
        if self.timers.expired(TimerId::QualificationTimeout) && self.state == PortState::PreMaster
        {
            self.enter_master();
        }
        if self.timers.expired(TimerId::AnnounceInterval) && self.state == PortState::Master {
            self.send_announce(now);
        }
        if self.timers.expired(TimerId::SyncInterval) && self.state == PortState::Master {
            self.send_sync(now);
        }
        if self.timers.expired(TimerId::DelayReqInterval)
            && matches!(self.state, PortState::Slave | PortState::Uncalibrated)
            && self.config.delay_mechanism == DelayMechanism::E2e
        {
            self.send_delay_req(now);
            self.timers.start_random(TimerId::DelayReqInterval, self.delay_req_interval());
        }
        if self.timers.expired(TimerId::PDelayReqInterval)
            && self.config.delay_mechanism == DelayMechanism::P2p
        {
            self.send_pdelay_req(now);
            self.timers.start_random(TimerId::PDelayReqInterval, self.pdelay_req_interval());
        }
        if self.timers.expired(TimerId::LeapSecond) {
            info!("leap second boundary passed, resetting measurement state");
            self.ts_set.clear();
            self.servo.reset();
            self.leap61 = false;
            self.leap59 = false;
        }

        match self.mtie_last_roll {
            None => self.mtie_last_roll = Some(now),
            Some(started) if now.saturating_duration_since(started) >= MTIE_WINDOW => {
                self.mtie_reported = self.mtie_current.take();
                self.mtie_last_roll = Some(now);
            }
            _ => {}
        }

        let sweep = self.tx_cache.sweep(
            now,
            Duration::from_millis(self.config.tx_timestamp_timeout_ms),
            Duration::from_millis(self.config.tx_timestamp_timeout_ms * 100),
        );
        for tag in &sweep.alarmed {
            self.stats.missing_tx_timestamps += 1;
            if self.alarms.raise(ALARM_NO_TX_TIMESTAMPS) {
                warn!(
                    "tx timestamp missing for {:?} seq {}",
                    tag.message_type, tag.sequence_id
                );
            }
            if tag.message_type == MessageType::DelayReq {
                self.unanswered_delay_reqs += 1;
            }
        }
        self.stats.tx_cache_evictions += sweep.evicted.len() as u64;
    }

    fn on_announce_timeout(&mut self, _now: Instant) {
        if matches!(self.state, PortState::Master | PortState::PreMaster | PortState::Passive) {
            // Masters do not track announce receipt.
            return;
        }
        if self.alarms.raise(ALARM_NO_MASTER) {
            warn!("no master: announce receipt timeout after {:?}", self.announce_receipt_window());
        }
        self.drop_master();
        self.state = PortState::Listening;
        self.timers.start(TimerId::AnnounceReceiptTimeout, self.announce_receipt_window());
    }

    // =========================================================================
    // BMCA + STATE DECISIONS
    // =========================================================================

    fn run_bmca(&mut self, now: Instant) {
        self.stats.bmca_runs += 1;
        let own = ComparableDataset::from_own(
            self.own_identity.clock,
            self.own_quality,
            self.config.priority1,
            self.config.priority2,
            self.own_identity,
        );
        match decide_state(&self.foreign, &own, self.config.slave_only) {
            RecommendedState::Slave { master } => {
                self.foreign.set_best(master);
                self.adopt_master(master, now);
            }
            RecommendedState::Master => {
                if !matches!(self.state, PortState::Master | PortState::PreMaster) {
                    self.state = PortState::PreMaster;
                    self.timers.start(
                        TimerId::QualificationTimeout,
                        self.announce_interval() * 2,
                    );
                    info!("port {} pre-master, qualifying", self.own_identity);
                }
            }
            RecommendedState::Passive => {
                if self.state != PortState::Passive {
                    info!("port {} passive", self.own_identity);
                    self.drop_master();
                    self.state = PortState::Passive;
                }
            }
            RecommendedState::Listening => {
                if !matches!(self.state, PortState::Listening) {
                    self.drop_master();
                    self.state = PortState::Listening;
                }
            }
        }
    }

    fn adopt_master(&mut self, index: usize, _now: Instant) {
        let Some(record) = self.foreign.get(index) else { return };
        let identity = record.port_identity;
        let same = self.parent.as_ref().is_some_and(|p| p.identity == identity);
        if same {
            return;
        }

        let header = record.header;
        let announce = record.announce;
        info!(
            "new master {} at {} (gm {}, class {})",
            identity,
            record.address,
            announce.grandmaster_identity,
            announce.grandmaster_clock_quality.clock_class
        );

        self.parent = Some(Parent {
            identity,
            announce,
            log_announce_interval: header.log_message_interval,
            log_sync_interval: self.config.sync_interval_log2,
            log_min_delay_req_interval: self.config.min_delay_req_interval_log2,
        });
        self.stats.master_changes += 1;

        // Delay-measurement state is meaningless across masters.
        self.ts_set.clear();
        self.pending_sync = None;
        self.pending_delay_req = None;
        self.unanswered_delay_reqs = 0;
        self.last_rx_sync_seq = None;
        self.last_rx_sync_record = None;
        self.last_tx_event = None;
        self.mtie_current = None;
        self.mtie_reported = None;
        self.servo.reset();
        self.alarms.clear_all();
        self.adopt_time_properties(&header, &announce);

        self.timers.start(TimerId::AnnounceReceiptTimeout, self.announce_receipt_window());
        self.timers.stop(TimerId::AnnounceInterval);
        self.timers.stop(TimerId::SyncInterval);
        if self.config.delay_mechanism == DelayMechanism::E2e {
            self.timers.start_random(TimerId::DelayReqInterval, self.delay_req_interval());
        }
        self.state = PortState::Uncalibrated;
    }

    fn drop_master(&mut self) {
        self.signal_sync_status(false);
        self.parent = None;
        self.foreign.clear_best();
        self.ts_set.clear();
        self.pending_sync = None;
        self.pending_delay_req = None;
        self.last_rx_sync_seq = None;
        self.last_rx_sync_record = None;
        self.last_tx_event = None;
        self.mtie_current = None;
        self.mtie_reported = None;
        self.servo.reset();
        self.timers.stop(TimerId::DelayReqInterval);
    }

    fn enter_master(&mut self) {
        info!("port {} qualified as master", self.own_identity);
        self.state = PortState::Master;
        self.timers.start(TimerId::AnnounceInterval, self.announce_interval());
        self.timers.start(TimerId::SyncInterval, self.sync_interval());
    }

    fn promote_if_uncalibrated(&mut self) {
        if self.state == PortState::Uncalibrated {
            info!("port {} calibrated, tracking {}", self.own_identity,
                self.parent.as_ref().map(|p| p.identity).unwrap_or_default());
            self.state = PortState::Slave;
        }
        self.alarms.clear(ALARM_NO_MASTER);
        // Refresh the hardware lock indication on every good update; it
        // times out on its own if updates stop.
        self.signal_sync_status(true);
    }

    /// Push lock state to clocks that consume it. No-op without the
    /// capability.
    fn signal_sync_status(&mut self, in_sync: bool) {
        let clock = self.servo.clock().clone();
        if !clock.has_sync_status() {
            return;
        }
        let timeout = self.announce_receipt_window();
        if let Err(e) = clock.set_sync_status(in_sync, timeout) {
            debug!("set_sync_status({}) failed: {}", in_sync, e);
        }
    }

    /// Cross-check the disciplined clock against the reference once per
    /// announce interval. Failures latch the clock-control alarm; the
    /// warning re-fires only after a healthy streak.
    fn compare_clocks(&mut self) {
        let Some(reference) = self.reference_clock.clone() else { return };
        self.stats.clock_compares += 1;
        match self.servo.clock().compare_to(reference.as_ref()) {
            Ok(diff) => {
                self.compare_monitor.record_success();
                self.alarms.clear(ALARM_CLOCK_CTRL_FAILURE);
                debug!("clock offset to {}: {:.0} ns", reference.name(), diff);
            }
            Err(e) => {
                let worth_warning = self.compare_monitor.record_failure();
                self.alarms.raise(ALARM_CLOCK_CTRL_FAILURE);
                if worth_warning {
                    warn!("clock compare against {} failed: {}", reference.name(), e);
                }
            }
        }
    }

    fn adopt_time_properties(&mut self, header: &Header, announce: &AnnounceBody) {
        self.current_utc_offset = announce.current_utc_offset;
        self.utc_offset_valid = header.utc_offset_valid();
        let leap61 = header.flags & FLAG_LEAP61 != 0;
        let leap59 = header.flags & FLAG_LEAP59 != 0;
        if (leap61 && !self.leap61) || (leap59 && !self.leap59) {
            self.arm_leap_second_timer();
        }
        self.leap61 = leap61;
        self.leap59 = leap59;
    }

    /// One-shot to the next UTC midnight, when the pending leap applies.
    fn arm_leap_second_timer(&mut self) {
        if let Ok(ts) = self.servo.clock().get_time() {
            let total_secs = (ts.as_nanos_f64() / 1e9) as u64;
            let utc_secs = total_secs.saturating_sub(self.current_utc_offset.max(0) as u64);
            let until_midnight = 86_400 - (utc_secs % 86_400);
            self.timers.start(TimerId::LeapSecond, Duration::from_secs(until_midnight));
            info!("leap second pending in {} s", until_midnight);
        }
    }

    // =========================================================================
    // SERVO GLUE
    // =========================================================================

    fn run_servo(&mut self, now: Instant) {
        let set = self.ts_set;
        match self.servo.update(&set, now) {
            Ok(ServoOutcome::Stepped(delta)) => {
                self.stats.clock_steps += 1;
                self.ts_set.clear();
                self.pending_sync = None;
                self.note_offset(-delta);
                self.note_clock_ok();
                self.promote_if_uncalibrated();
            }
            Ok(ServoOutcome::RejectedOutlier) => {
                self.stats.outliers_rejected += 1;
            }
            Ok(ServoOutcome::RejectedClustering) => {
                self.stats.clustering_rejected += 1;
                if self.alarms.raise(ALARM_CLUSTERING_THRESHOLD_EXCEEDED) {
                    warn!("offset rejected by clustering guard");
                }
            }
            Ok(_) => {
                self.alarms.clear(ALARM_CLUSTERING_THRESHOLD_EXCEEDED);
                if let Some(offset) = self.servo.last_offset_ns {
                    self.note_offset(offset);
                }
                self.note_clock_ok();
                self.promote_if_uncalibrated();
            }
            Err(e) => self.note_clock_failure(&e),
        }
    }

    /// Track offset extremes for the MTIE monitoring window.
    fn note_offset(&mut self, offset_ns: f64) {
        self.mtie_current = Some(match self.mtie_current {
            None => (offset_ns, offset_ns),
            Some((lo, hi)) => (lo.min(offset_ns), hi.max(offset_ns)),
        });
    }

    fn note_clock_failure(&mut self, e: &crate::error::ClockError) {
        if self.alarms.raise(ALARM_CLOCK_CTRL_FAILURE) {
            warn!("clock control failure: {}", e);
        }
    }

    fn note_clock_ok(&mut self) {
        self.alarms.clear(ALARM_CLOCK_CTRL_FAILURE);
    }

    fn note_rx_timestamp_failure(&mut self) {
        self.stats.missing_rx_timestamps += 1;
        self.consecutive_rx_ts_failures += 1;
        if self.consecutive_rx_ts_failures >= TIMESTAMP_FAILURE_THRESHOLD
            && self.alarms.raise(ALARM_NO_RX_TIMESTAMPS)
        {
            warn!("no rx timestamps on event socket");
        }
    }

    fn note_rx_timestamp_ok(&mut self) {
        self.consecutive_rx_ts_failures = 0;
        self.alarms.clear(ALARM_NO_RX_TIMESTAMPS);
    }

    // =========================================================================
    // TRANSMIT PATH
    // =========================================================================

    fn base_header(&self, message_type: MessageType) -> Header {
        let mut header = Header::new(message_type, self.config.domain_number, self.own_identity);
        header.log_message_interval = 0x7f;
        header
    }

    fn send_announce(&mut self, now: Instant) {
        let mut header = self.base_header(MessageType::Announce);
        self.sequences.sent_announce = self.sequences.sent_announce.wrapping_add(1);
        header.sequence_id = self.sequences.sent_announce;
        header.log_message_interval = self.config.announce_interval_log2;
        if self.utc_offset_valid {
            header.set_flag(FLAG_UTC_OFFSET_VALID, true);
        }
        let announce = AnnounceBody {
            origin_timestamp: WireTimestamp::default(),
            current_utc_offset: self.current_utc_offset,
            grandmaster_priority1: self.config.priority1,
            grandmaster_clock_quality: self.own_quality,
            grandmaster_priority2: self.config.priority2,
            grandmaster_identity: self.own_identity.clock,
            steps_removed: 0,
            time_source: 0xa0, // internal oscillator
        };
        let message = Message::new(header, Body::Announce(announce));
        self.emit(SendKind::General, message, None, now);
    }

    fn send_sync(&mut self, now: Instant) {
        let mut header = self.base_header(MessageType::Sync);
        self.sequences.sent_sync = self.sequences.sent_sync.wrapping_add(1);
        header.sequence_id = self.sequences.sent_sync;
        header.log_message_interval = self.config.sync_interval_log2;
        header.set_flag(FLAG_TWO_STEP, true);
        let message =
            Message::new(header, Body::Sync { origin: WireTimestamp::default() });
        self.emit(SendKind::Event, message, None, now);
    }

    fn send_delay_req(&mut self, now: Instant) {
        if self.pending_delay_req.is_some() {
            // Previous request never completed.
            self.stats.missing_delay_resps += 1;
            self.unanswered_delay_reqs += 1;
            if self.unanswered_delay_reqs >= TIMESTAMP_FAILURE_THRESHOLD
                && self.alarms.raise(ALARM_NO_DELAY_RESPS)
            {
                warn!("master not answering delay requests");
            }
            self.pending_delay_req = None;
            self.ts_set.clear_s2m();
        }
        let mut header = self.base_header(MessageType::DelayReq);
        self.sequences.sent_delay_req = self.sequences.sent_delay_req.wrapping_add(1);
        header.sequence_id = self.sequences.sent_delay_req;
        let message =
            Message::new(header, Body::DelayReq { origin: WireTimestamp::default() });
        self.emit(SendKind::Event, message, None, now);
    }

    fn send_pdelay_req(&mut self, now: Instant) {
        self.sequences.sent_pdelay_req = self.sequences.sent_pdelay_req.wrapping_add(1);
        let mut header = self.base_header(MessageType::PDelayReq);
        header.sequence_id = self.sequences.sent_pdelay_req;
        self.pending_pdelay = Some(PendingPDelay {
            sequence_id: header.sequence_id,
            ..PendingPDelay::default()
        });
        let message =
            Message::new(header, Body::PDelayReq { origin: WireTimestamp::default() });
        self.emit(SendKind::PeerEvent, message, None, now);
    }

    /// Pack and queue a message; event messages get a TX-cache entry so
    /// their egress timestamps can be claimed later.
    fn emit(&mut self, kind: SendKind, mut message: Message, dest: Option<SocketAddr>, now: Instant) {
        if is_unicast_destination(dest) {
            message.header.set_flag(FLAG_UNICAST, true);
        }
        let bytes = match message.pack() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("failed to pack {:?}: {}", message.header.message_type, e);
                return;
            }
        };
        let wants_tx_timestamp = matches!(
            message.header.message_type,
            MessageType::DelayReq | MessageType::PDelayReq | MessageType::Sync
        );
        if wants_tx_timestamp {
            self.tx_cache.insert(
                &bytes,
                self.trailer_len,
                TxTag {
                    message_type: message.header.message_type,
                    sequence_id: message.header.sequence_id,
                    port_number: self.own_identity.port,
                },
                now,
            );
        }
        self.stats.tx_messages += 1;
        self.outbound.push(Outbound { kind, bytes, dest });
    }

    // =========================================================================
    // MONITORING
    // =========================================================================

    /// Answer monitoring polls carried in Signaling messages. Replies leave
    /// through the unbound monitoring socket, straight back to the sender.
    fn handle_signaling(&mut self, message: &Message, from: SocketAddr, now: Instant) {
        let Body::Signaling { target, tlvs } = &message.body else { return };
        if target.clock != ClockIdentity::ALL_ONES && target.clock != self.own_identity.clock {
            return;
        }

        let mut responses = Vec::new();
        for tlv in tlvs {
            match tlv {
                Tlv::PtpMonRequest => {
                    self.stats.monitoring_requests += 1;
                    responses.extend(self.ptpmon_response_tlvs());
                }
                Tlv::MtieRequest => {
                    self.stats.monitoring_requests += 1;
                    responses.push(self.mtie_response_tlv());
                }
                _ => {}
            }
        }
        if responses.is_empty() {
            debug!(
                "signaling from {} carried nothing actionable",
                message.header.source_port_identity
            );
            return;
        }

        let mut header = self.base_header(MessageType::Signaling);
        self.sequences.sent_signaling = self.sequences.sent_signaling.wrapping_add(1);
        header.sequence_id = self.sequences.sent_signaling;
        let reply = Message::new(
            header,
            Body::Signaling { target: message.header.source_port_identity, tlvs: responses },
        );
        self.emit(SendKind::Monitor, reply, Some(from), now);
    }

    fn ptpmon_response_tlvs(&self) -> Vec<Tlv> {
        let parent = self.parent.as_ref().map(|p| p.identity).unwrap_or(self.own_identity);
        let offset =
            TimeInterval::from_nanos_f64(self.servo.last_offset_ns.unwrap_or(0.0));
        let mean_path_delay =
            TimeInterval::from_nanos_f64(self.servo.last_mean_path_delay_ns.unwrap_or(0.0));

        let mut tlvs = vec![Tlv::PtpMonResponse {
            port_state: self.state as u8,
            offset_from_master: offset,
            mean_path_delay,
            parent_port: parent,
        }];
        if let Some(record) = self.last_rx_sync_record.clone() {
            tlvs.push(Tlv::SlaveRxSyncTimingData { source_port: parent, records: vec![record] });
        }
        if self.servo.last_offset_ns.is_some() {
            tlvs.push(Tlv::SlaveRxSyncComputedData {
                source_port: parent,
                records: vec![SlaveRxComputedRecord {
                    sequence_id: self.last_rx_sync_seq.unwrap_or(0),
                    offset_from_master: offset,
                    mean_path_delay,
                    scaled_neighbor_rate_ratio: 0,
                }],
            });
        }
        if let Some(record) = self.last_tx_event.clone() {
            tlvs.push(Tlv::SlaveTxEventTimestamps {
                source_port: self.own_identity,
                event_message_type: MessageType::DelayReq as u8,
                records: vec![record],
            });
        }
        tlvs.push(Tlv::PortCommunicationCapabilities {
            sync_availability: 0x01,
            delay_resp_availability: 0x01,
        });
        tlvs
    }

    fn mtie_response_tlv(&self) -> Tlv {
        let window_seconds = MTIE_WINDOW.as_secs() as u32;
        match self.mtie_reported {
            Some((lo, hi)) => Tlv::MtieResponse {
                valid: true,
                window_seconds,
                mtie_min_ns: lo.abs().min(u32::MAX as f64) as u32,
                mtie_max_ns: hi.abs().min(u32::MAX as f64) as u32,
            },
            None => Tlv::MtieResponse {
                valid: false,
                window_seconds,
                mtie_min_ns: 0,
                mtie_max_ns: 0,
            },
        }
    }

    // =========================================================================
    // MANAGEMENT
    // =========================================================================

    /// Handle a management request, producing a response or error-status
    /// message addressed to the requester.
    pub fn inject_management(&mut self, message: &Message) -> Option<Message> {
        self.handle_management(message)
    }

    fn handle_management(&mut self, message: &Message) -> Option<Message> {
        let Body::Management(body) = &message.body else { return None };
        if body.target.clock != ClockIdentity::ALL_ONES
            && body.target.clock != self.own_identity.clock
        {
            return None;
        }
        match body.action {
            ManagementAction::Get => {}
            // Never answer answers: responses loop on multicast otherwise.
            ManagementAction::Response | ManagementAction::Acknowledge => return None,
            ManagementAction::Set | ManagementAction::Command => {
                return Some(self.management_error(
                    message,
                    body,
                    crate::wire::MGMT_ERROR_NOT_SUPPORTED,
                    "only GET is supported",
                ));
            }
        }
        let Tlv::Management { management_id, .. } = &body.tlv else {
            return None;
        };
        let management_id = *management_id;

        let data = match management_id {
            MGMT_NULL_MANAGEMENT => Vec::new(),
            MGMT_DEFAULT_DATA_SET => self.default_data_set(),
            MGMT_CURRENT_DATA_SET => self.current_data_set(),
            MGMT_PARENT_DATA_SET => self.parent_data_set(),
            MGMT_TIME_PROPERTIES_DATA_SET => self.time_properties_data_set(),
            MGMT_PORT_DATA_SET => self.port_data_set(),
            other => {
                return Some(self.management_error(
                    message,
                    body,
                    MGMT_ERROR_NO_SUCH_ID,
                    &format!("management id {:#06x} not recognised", other),
                ));
            }
        };

        let mut header = self.base_header(MessageType::Management);
        header.sequence_id = message.header.sequence_id;
        Some(Message::new(
            header,
            Body::Management(ManagementBody {
                target: message.header.source_port_identity,
                starting_boundary_hops: body.starting_boundary_hops,
                boundary_hops: body.boundary_hops,
                action: ManagementAction::Response,
                tlv: Tlv::Management { management_id, data },
            }),
        ))
    }

    fn management_error(
        &self,
        request: &Message,
        body: &ManagementBody,
        error_id: u16,
        display: &str,
    ) -> Message {
        let management_id = match &body.tlv {
            Tlv::Management { management_id, .. } => *management_id,
            _ => 0,
        };
        let mut header = self.base_header(MessageType::Management);
        header.sequence_id = request.header.sequence_id;
        Message::new(
            header,
            Body::Management(ManagementBody {
                target: request.header.source_port_identity,
                starting_boundary_hops: body.starting_boundary_hops,
                boundary_hops: body.boundary_hops,
                action: ManagementAction::Response,
                tlv: Tlv::ManagementErrorStatus {
                    error_id,
                    management_id,
                    display: display.to_string(),
                },
            }),
        )
    }

    fn default_data_set(&self) -> Vec<u8> {
        let mut data = vec![0u8; 20];
        data[0] = 0x03; // two-step, slave-capable
        data[2..4].copy_from_slice(&1u16.to_be_bytes()); // numberPorts
        data[4] = self.config.priority1;
        data[5] = self.own_quality.clock_class;
        data[6] = self.own_quality.clock_accuracy;
        data[7..9].copy_from_slice(&self.own_quality.offset_scaled_log_variance.to_be_bytes());
        data[9] = self.config.priority2;
        data[10..18].copy_from_slice(self.own_identity.clock.as_bytes());
        data[18] = self.config.domain_number;
        data
    }

    fn current_data_set(&self) -> Vec<u8> {
        let mut data = vec![0u8; 18];
        let steps = self
            .parent
            .as_ref()
            .map(|p| p.announce.steps_removed.saturating_add(1))
            .unwrap_or(0);
        data[..2].copy_from_slice(&steps.to_be_bytes());
        let offset =
            TimeInterval::from_nanos_f64(self.servo.last_offset_ns.unwrap_or(0.0));
        let mpd =
            TimeInterval::from_nanos_f64(self.servo.last_mean_path_delay_ns.unwrap_or(0.0));
        data[2..10].copy_from_slice(&offset.0.to_be_bytes());
        data[10..18].copy_from_slice(&mpd.0.to_be_bytes());
        data
    }

    fn parent_data_set(&self) -> Vec<u8> {
        let mut data = vec![0u8; 32];
        match &self.parent {
            Some(parent) => {
                parent.identity.write(&mut data[..10]);
                data[12..14].copy_from_slice(&0xffffu16.to_be_bytes());
                data[14..18].copy_from_slice(&0x7fff_ffffu32.to_be_bytes());
                data[18] = parent.announce.grandmaster_priority1;
                data[19] = parent.announce.grandmaster_clock_quality.clock_class;
                data[20] = parent.announce.grandmaster_clock_quality.clock_accuracy;
                data[21..23].copy_from_slice(
                    &parent
                        .announce
                        .grandmaster_clock_quality
                        .offset_scaled_log_variance
                        .to_be_bytes(),
                );
                data[23] = parent.announce.grandmaster_priority2;
                data[24..32].copy_from_slice(parent.announce.grandmaster_identity.as_bytes());
            }
            None => {
                // Self-parented while no master is selected.
                self.own_identity.write(&mut data[..10]);
                data[18] = self.config.priority1;
                data[19] = self.own_quality.clock_class;
                data[20] = self.own_quality.clock_accuracy;
                data[21..23]
                    .copy_from_slice(&self.own_quality.offset_scaled_log_variance.to_be_bytes());
                data[23] = self.config.priority2;
                data[24..32].copy_from_slice(self.own_identity.clock.as_bytes());
            }
        }
        data
    }

    fn time_properties_data_set(&self) -> Vec<u8> {
        let mut data = vec![0u8; 4];
        data[..2].copy_from_slice(&self.current_utc_offset.to_be_bytes());
        let mut flags = 0u8;
        if self.leap61 {
            flags |= 0x01;
        }
        if self.leap59 {
            flags |= 0x02;
        }
        if self.utc_offset_valid {
            flags |= 0x04;
        }
        data[2] = flags;
        data[3] = 0xa0;
        data
    }

    fn port_data_set(&self) -> Vec<u8> {
        let mut data = vec![0u8; 26];
        self.own_identity.write(&mut data[..10]);
        data[10] = self.state as u8;
        data[11] = self.config.min_delay_req_interval_log2 as u8;
        let peer_mpd = TimeInterval::from_nanos_f64(self.pdelay_mean_path_ns.unwrap_or(0.0));
        data[12..20].copy_from_slice(&peer_mpd.0.to_be_bytes());
        data[20] = self.config.announce_interval_log2 as u8;
        data[21] = self.config.announce_receipt_timeout;
        data[22] = self.config.sync_interval_log2 as u8;
        data[23] = match self.config.delay_mechanism {
            DelayMechanism::E2e => 1,
            DelayMechanism::P2p => 2,
            DelayMechanism::Disabled => 0xfe,
        };
        data[24] = self.config.min_delay_req_interval_log2 as u8;
        data[25] = crate::types::PTP_VERSION;
        data
    }

    fn from_parent(&self, header: &Header) -> bool {
        self.parent.as_ref().is_some_and(|p| p.identity == header.source_port_identity)
    }
}
