//! Port state machine scenarios, driven without sockets.

use ptpsyncd::clock::{Clock, FakeClock};
use ptpsyncd::config::{Config, DelayMechanism};
use ptpsyncd::error::ClockError;
use ptpsyncd::port::{PortState, PtpPort, ALARM_CLOCK_CTRL_FAILURE, ALARM_NO_MASTER};
use ptpsyncd::transport::SendKind;
use ptpsyncd::types::{ClockIdentity, PortIdentity, Timestamp, WireTimestamp};
use ptpsyncd::wire::{
    AnnounceBody, Body, ClockQuality, Header, ManagementAction, ManagementBody, Message,
    MessageType, Tlv, FLAG_TWO_STEP, MGMT_DEFAULT_DATA_SET,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MASTER_ID: [u8; 8] = [0x11, 0x22, 0x33, 0xff, 0xfe, 0x44, 0x55, 0x66];

fn master_identity() -> PortIdentity {
    PortIdentity::new(ClockIdentity(MASTER_ID), 1)
}

fn master_addr() -> SocketAddr {
    "192.0.2.10:320".parse().unwrap()
}

fn test_config() -> Config {
    Config {
        interface: "eth0".into(),
        slave_only: true,
        announce_interval_log2: 0,
        sync_interval_log2: 0,
        min_delay_req_interval_log2: 0,
        fir_filter_size: 1,
        path_delay_filter_size: 4,
        outlier_filter_size: 16,
        ..Config::default()
    }
}

fn make_port(config: Config) -> (PtpPort, Arc<FakeClock>) {
    let clock = Arc::new(FakeClock::new());
    let mut port = PtpPort::new(
        config,
        [0x00, 0x0f, 0x53, 0xaa, 0xbb, 0xcc],
        1,
        clock.clone(),
        0.0,
        0,
    )
    .expect("port construction");
    port.start();
    (port, clock)
}

fn announce(seq: u16) -> Vec<u8> {
    let mut header = Header::new(MessageType::Announce, 0, master_identity());
    header.sequence_id = seq;
    header.log_message_interval = 0;
    let body = AnnounceBody {
        grandmaster_priority1: 10,
        grandmaster_identity: ClockIdentity(MASTER_ID),
        grandmaster_clock_quality: ClockQuality {
            clock_class: 6,
            clock_accuracy: 0x21,
            offset_scaled_log_variance: 0x4e5d,
        },
        grandmaster_priority2: 128,
        steps_removed: 0,
        ..AnnounceBody::default()
    };
    Message::new(header, Body::Announce(body)).pack().unwrap()
}

fn two_step_sync(seq: u16) -> Vec<u8> {
    let mut header = Header::new(MessageType::Sync, 0, master_identity());
    header.sequence_id = seq;
    header.log_message_interval = 0;
    header.set_flag(FLAG_TWO_STEP, true);
    Message::new(header, Body::Sync { origin: WireTimestamp::default() }).pack().unwrap()
}

fn follow_up(seq: u16, origin: WireTimestamp) -> Vec<u8> {
    let mut header = Header::new(MessageType::FollowUp, 0, master_identity());
    header.sequence_id = seq;
    Message::new(header, Body::FollowUp { precise_origin: origin }).pack().unwrap()
}

fn delay_resp(seq: u16, receive: WireTimestamp, requesting: PortIdentity) -> Vec<u8> {
    let mut header = Header::new(MessageType::DelayResp, 0, master_identity());
    header.sequence_id = seq;
    header.log_message_interval = 0;
    Message::new(header, Body::DelayResp { receive, requesting }).pack().unwrap()
}

#[test]
fn test_announce_moves_listening_port_onto_master() {
    let (mut port, _clock) = make_port(test_config());
    assert_eq!(port.state(), PortState::Listening);

    port.on_rx(&announce(1), master_addr(), None, Instant::now());

    assert_eq!(port.state(), PortState::Uncalibrated);
    assert_eq!(port.parent_identity(), Some(master_identity()));
    assert_eq!(port.foreign_dataset().number_records(), 1);
    assert_eq!(port.stats.master_changes, 1);
}

/// Drive one complete two-step exchange with the slave 200 ns ahead over a
/// symmetric 1 us path. Returns the elapsed-time cursor.
fn run_two_step_exchange(port: &mut PtpPort, sync_seq: u16, now: Instant) -> Instant {
    let t1 = WireTimestamp::new(1000, 0);
    let t2 = Timestamp::from_secs_nanos(1000, 1_200); // delay 1000 + offset 200
    port.on_rx(&two_step_sync(sync_seq), master_addr(), Some(t2), now);
    port.on_rx(&follow_up(sync_seq, t1), master_addr(), None, now);

    // Let the randomized Delay_Req timer fire (bounded by 2 x interval).
    let later = now + Duration::from_secs(3);
    port.tick(Duration::from_secs(3), later);
    let outbound = port.take_outbound();
    let delay_req = outbound
        .iter()
        .find(|o| o.bytes[0] & 0x0f == MessageType::DelayReq as u8)
        .expect("delay request emitted");
    let seq = u16::from_be_bytes([delay_req.bytes[30], delay_req.bytes[31]]);

    // Egress timestamp resolves from the error queue.
    let t3 = Timestamp::from_secs_nanos(1000, 500_000);
    port.on_tx_ts(&delay_req.bytes, t3, later);

    // Master answers: t4 = t3 + delay 1000 - offset 200.
    let t4 = WireTimestamp::new(1000, 500_800);
    port.on_rx(&delay_resp(seq, t4, port.identity()), master_addr(), None, later);
    later
}

#[test]
fn test_full_two_step_exchange_reaches_slave() {
    let (mut port, clock) = make_port(test_config());
    let now = Instant::now();
    port.on_rx(&announce(1), master_addr(), None, now);

    run_two_step_exchange(&mut port, 100, now);

    assert_eq!(port.state(), PortState::Slave);
    assert_eq!(port.servo().samples, 1);
    assert!((port.servo().last_offset_ns.unwrap() - 200.0).abs() < 1.0);
    assert!((port.servo().last_mean_path_delay_ns.unwrap() - 1000.0).abs() < 1.0);
    assert_eq!(clock.freq_writes().len(), 1);
}

#[test]
fn test_follow_up_sequence_mismatch_is_dropped() {
    // Scenario: Sync seq 100 followed by Follow_Up seq 99.
    let (mut port, _clock) = make_port(test_config());
    let now = Instant::now();
    port.on_rx(&announce(1), master_addr(), None, now);

    let t2 = Timestamp::from_secs_nanos(1000, 1_000);
    port.on_rx(&two_step_sync(100), master_addr(), Some(t2), now);
    port.on_rx(&follow_up(99, WireTimestamp::new(1000, 0)), master_addr(), None, now);

    assert_eq!(port.stats.missing_followups, 1);
    assert_eq!(port.servo().samples, 0);
    // The pending sync is still armed for the correct Follow_Up.
    port.on_rx(&follow_up(100, WireTimestamp::new(1000, 0)), master_addr(), None, now);
    assert_eq!(port.stats.missing_followups, 1);
}

#[test]
fn test_duplicate_sync_sequence_dropped() {
    let (mut port, _clock) = make_port(test_config());
    let now = Instant::now();
    port.on_rx(&announce(1), master_addr(), None, now);

    let t2 = Timestamp::from_secs_nanos(1000, 1_000);
    port.on_rx(&two_step_sync(100), master_addr(), Some(t2), now);
    port.on_rx(&two_step_sync(100), master_addr(), Some(t2), now);
    port.on_rx(&two_step_sync(99), master_addr(), Some(t2), now);
    assert_eq!(port.stats.rx_stale_sequence, 2);
}

#[test]
fn test_announce_timeout_returns_to_listening() {
    let (mut port, _clock) = make_port(test_config());
    let now = Instant::now();
    port.on_rx(&announce(1), master_addr(), None, now);
    assert_eq!(port.state(), PortState::Uncalibrated);

    // Default receipt timeout is 6 announce intervals (1 s each here);
    // nothing arrives for 13 s.
    port.tick(Duration::from_secs(13), now + Duration::from_secs(13));

    assert_eq!(port.state(), PortState::Listening);
    assert!(port.alarms.test(ALARM_NO_MASTER));
    assert_eq!(port.parent_identity(), None);
}

#[test]
fn test_foreign_messages_do_not_disturb_slave() {
    let (mut port, _clock) = make_port(test_config());
    let now = Instant::now();
    port.on_rx(&announce(1), master_addr(), None, now);

    // Sync from a non-selected master is ignored.
    let stranger = PortIdentity::new(ClockIdentity([0x77; 8]), 2);
    let mut header = Header::new(MessageType::Sync, 0, stranger);
    header.sequence_id = 1;
    header.set_flag(FLAG_TWO_STEP, true);
    let sync = Message::new(header, Body::Sync { origin: WireTimestamp::default() })
        .pack()
        .unwrap();
    port.on_rx(&sync, "192.0.2.99:319".parse().unwrap(),
        Some(Timestamp::from_secs_nanos(1, 0)), now);

    assert_eq!(port.servo().samples, 0);
    assert_eq!(port.parent_identity(), Some(master_identity()));
}

#[test]
fn test_wrong_domain_ignored() {
    let (mut port, _clock) = make_port(test_config());
    let now = Instant::now();
    let mut header = Header::new(MessageType::Announce, 5, master_identity());
    header.sequence_id = 1;
    let body = AnnounceBody::default();
    let bytes = Message::new(header, Body::Announce(body)).pack().unwrap();
    port.on_rx(&bytes, master_addr(), None, now);
    assert_eq!(port.foreign_dataset().number_records(), 0);
    assert_eq!(port.state(), PortState::Listening);
}

#[test]
fn test_decode_failure_counts_without_state_change() {
    let (mut port, _clock) = make_port(test_config());
    let now = Instant::now();
    port.on_rx(&announce(1), master_addr(), None, now);

    port.on_rx(&[0u8; 20], master_addr(), None, now);
    port.on_rx(&announce(2)[..40], master_addr(), None, now);

    assert_eq!(port.stats.rx_decode_errors, 2);
    assert_eq!(port.state(), PortState::Uncalibrated);
}

#[test]
fn test_caps_mismatch_alarm_on_delay_mechanism_disagreement() {
    let mut config = test_config();
    config.delay_mechanism = DelayMechanism::P2p;
    let (mut port, _clock) = make_port(config);
    let now = Instant::now();
    port.on_rx(&announce(1), master_addr(), None, now);

    // Master answers end-to-end delay while we run peer delay.
    let bytes = delay_resp(1, WireTimestamp::default(), port.identity());
    port.on_rx(&bytes, master_addr(), None, now);

    assert!(port.alarms.test(ptpsyncd::port::ALARM_CAPS_MISMATCH));
}

#[test]
fn test_management_get_default_data_set() {
    let (mut port, _clock) = make_port(test_config());

    let request = Message::new(
        Header::new(MessageType::Management, 0, master_identity()),
        Body::Management(ManagementBody {
            target: PortIdentity::new(ClockIdentity::ALL_ONES, 0xffff),
            starting_boundary_hops: 1,
            boundary_hops: 1,
            action: ManagementAction::Get,
            tlv: Tlv::Management { management_id: MGMT_DEFAULT_DATA_SET, data: vec![] },
        }),
    );

    let response = port.inject_management(&request).expect("response");
    let Body::Management(body) = &response.body else { panic!("not management") };
    assert_eq!(body.action, ManagementAction::Response);
    assert_eq!(body.target, master_identity());
    match &body.tlv {
        Tlv::Management { management_id, data } => {
            assert_eq!(*management_id, MGMT_DEFAULT_DATA_SET);
            assert_eq!(data.len(), 20);
            // clockIdentity sits at offset 10 and reflects our EUI-64.
            assert_eq!(&data[10..13], &[0x00, 0x0f, 0x53]);
        }
        other => panic!("unexpected tlv {:?}", other),
    }
}

#[test]
fn test_management_unknown_id_yields_error_status() {
    let (mut port, _clock) = make_port(test_config());

    let request = Message::new(
        Header::new(MessageType::Management, 0, master_identity()),
        Body::Management(ManagementBody {
            target: PortIdentity::new(ClockIdentity::ALL_ONES, 0xffff),
            starting_boundary_hops: 1,
            boundary_hops: 1,
            action: ManagementAction::Get,
            tlv: Tlv::Management { management_id: 0x7777, data: vec![] },
        }),
    );

    let response = port.inject_management(&request).expect("response");
    let Body::Management(body) = &response.body else { panic!("not management") };
    match &body.tlv {
        Tlv::ManagementErrorStatus { management_id, display, .. } => {
            assert_eq!(*management_id, 0x7777);
            assert!(!display.is_empty());
        }
        other => panic!("unexpected tlv {:?}", other),
    }
}

#[test]
fn test_stop_flushes_and_disables() {
    let (mut port, _clock) = make_port(test_config());
    let now = Instant::now();
    port.on_rx(&announce(1), master_addr(), None, now);
    port.tick(Duration::from_secs(3), now + Duration::from_secs(3));
    let _ = port.take_outbound();

    port.stop();
    assert_eq!(port.state(), PortState::Disabled);

    // A disabled port ignores everything.
    port.on_rx(&announce(2), master_addr(), None, now + Duration::from_secs(4));
    assert_eq!(port.parent_identity(), None);
}

/// A reference clock whose reads always fail, for the compare path.
struct FailingClock;

impl Clock for FailingClock {
    fn name(&self) -> &str {
        "failing"
    }

    fn get_time(&self) -> Result<Timestamp, ClockError> {
        Err(ClockError::GetTime(std::io::Error::other("no such clock")))
    }

    fn adjust_time(&self, _delta_ns: f64) -> Result<(), ClockError> {
        Ok(())
    }

    fn adjust_frequency(&self, _ppb: f64) -> Result<(), ClockError> {
        Ok(())
    }

    fn set_sync_status(&self, _in_sync: bool, _timeout: Duration) -> Result<(), ClockError> {
        Ok(())
    }

    fn max_frequency_adjustment(&self) -> f64 {
        100_000.0
    }
}

fn monitor_addr() -> SocketAddr {
    "192.0.2.50:33333".parse().unwrap()
}

fn signaling_request(tlvs: Vec<Tlv>) -> Vec<u8> {
    let mut header = Header::new(MessageType::Signaling, 0, master_identity());
    header.sequence_id = 9;
    Message::new(
        header,
        Body::Signaling { target: PortIdentity::new(ClockIdentity::ALL_ONES, 0xffff), tlvs },
    )
    .pack()
    .unwrap()
}

#[test]
fn test_sync_status_signaled_on_lock_and_loss() {
    let (mut port, clock) = make_port(test_config());
    let now = Instant::now();
    assert_eq!(clock.in_sync(), None);

    port.on_rx(&announce(1), master_addr(), None, now);
    let cursor = run_two_step_exchange(&mut port, 100, now);
    assert_eq!(port.state(), PortState::Slave);
    assert_eq!(clock.in_sync(), Some(true));

    // Master disappears; lock indication is withdrawn with it.
    port.tick(Duration::from_secs(13), cursor + Duration::from_secs(13));
    assert_eq!(port.state(), PortState::Listening);
    assert_eq!(clock.in_sync(), Some(false));
}

#[test]
fn test_periodic_compare_runs_against_reference() {
    let (mut port, _clock) = make_port(test_config());
    port.set_reference_clock(Arc::new(FakeClock::new()));
    let now = Instant::now();

    // The compare piggybacks on the foreign-master sweep, one per
    // announce interval.
    port.tick(Duration::from_secs(2), now + Duration::from_secs(2));
    assert!(port.stats.clock_compares >= 1);
    assert!(!port.alarms.test(ALARM_CLOCK_CTRL_FAILURE));
}

#[test]
fn test_failed_compare_raises_clock_alarm() {
    let (mut port, _clock) = make_port(test_config());
    port.set_reference_clock(Arc::new(FailingClock));
    let now = Instant::now();

    port.tick(Duration::from_secs(2), now + Duration::from_secs(2));
    assert!(port.stats.clock_compares >= 1);
    assert!(port.alarms.test(ALARM_CLOCK_CTRL_FAILURE));
}

#[test]
fn test_ptpmon_request_answered_from_monitor_socket() {
    let (mut port, _clock) = make_port(test_config());
    let now = Instant::now();
    port.on_rx(&announce(1), master_addr(), None, now);
    let cursor = run_two_step_exchange(&mut port, 100, now);
    let _ = port.take_outbound();

    port.on_rx(&signaling_request(vec![Tlv::PtpMonRequest]), monitor_addr(), None, cursor);
    assert_eq!(port.stats.monitoring_requests, 1);

    let outbound = port.take_outbound();
    let reply = outbound
        .iter()
        .find(|o| o.kind == SendKind::Monitor)
        .expect("monitoring reply emitted");
    assert_eq!(reply.dest, Some(monitor_addr()));

    let message = Message::unpack(&reply.bytes).expect("reply decodes");
    let Body::Signaling { target, tlvs } = &message.body else { panic!("not signaling") };
    assert_eq!(*target, master_identity());

    let mon = tlvs
        .iter()
        .find_map(|t| match t {
            Tlv::PtpMonResponse { port_state, offset_from_master, parent_port, .. } => {
                Some((*port_state, *offset_from_master, *parent_port))
            }
            _ => None,
        })
        .expect("ptpmon response present");
    assert_eq!(mon.0, PortState::Slave as u8);
    assert!((mon.1.as_nanos_f64() - 200.0).abs() < 1.0);
    assert_eq!(mon.2, master_identity());

    assert!(tlvs.iter().any(|t| matches!(t, Tlv::SlaveRxSyncTimingData { .. })));
    assert!(tlvs.iter().any(|t| matches!(t, Tlv::SlaveRxSyncComputedData { .. })));
    assert!(tlvs.iter().any(|t| matches!(t, Tlv::SlaveTxEventTimestamps { .. })));
    assert!(tlvs.iter().any(|t| matches!(t, Tlv::PortCommunicationCapabilities { .. })));
}

#[test]
fn test_mtie_request_reports_completed_window() {
    let (mut port, _clock) = make_port(test_config());
    let now = Instant::now();
    port.on_rx(&announce(1), master_addr(), None, now);
    let mut cursor = run_two_step_exchange(&mut port, 100, now);

    // Before a window completes, the response is flagged invalid.
    port.on_rx(&signaling_request(vec![Tlv::MtieRequest]), monitor_addr(), None, cursor);
    let outbound = port.take_outbound();
    let reply = outbound.iter().find(|o| o.kind == SendKind::Monitor).expect("reply");
    let message = Message::unpack(&reply.bytes).unwrap();
    let Body::Signaling { tlvs, .. } = &message.body else { panic!("not signaling") };
    assert!(tlvs.iter().any(|t| matches!(t, Tlv::MtieResponse { valid: false, .. })));

    // Keep the master alive while the 60 s observation window rolls over.
    for i in 0..12u16 {
        cursor += Duration::from_millis(5500);
        port.on_rx(&announce(2 + i), master_addr(), None, cursor);
        port.tick(Duration::from_millis(5500), cursor);
    }
    let _ = port.take_outbound();

    port.on_rx(&signaling_request(vec![Tlv::MtieRequest]), monitor_addr(), None, cursor);
    let outbound = port.take_outbound();
    let reply = outbound.iter().find(|o| o.kind == SendKind::Monitor).expect("reply");
    let message = Message::unpack(&reply.bytes).unwrap();
    let Body::Signaling { tlvs, .. } = &message.body else { panic!("not signaling") };
    let mtie = tlvs
        .iter()
        .find_map(|t| match t {
            Tlv::MtieResponse { valid, window_seconds, mtie_min_ns, mtie_max_ns } => {
                Some((*valid, *window_seconds, *mtie_min_ns, *mtie_max_ns))
            }
            _ => None,
        })
        .expect("mtie response present");
    assert!(mtie.0);
    assert_eq!(mtie.1, 60);
    assert_eq!(mtie.2, 200);
    assert_eq!(mtie.3, 200);
}

#[test]
fn test_unanswered_delay_requests_raise_alarm() {
    let (mut port, _clock) = make_port(test_config());
    let mut now = Instant::now();
    port.on_rx(&announce(1), master_addr(), None, now);

    let mut announce_seq = 1u16;
    // Repeatedly: sync exchange emits a Delay_Req whose egress resolves,
    // but the master never answers.
    for round in 0..4u16 {
        now += Duration::from_secs(3);
        port.on_rx(&announce(announce_seq + 1), master_addr(), None, now);
        announce_seq += 1;
        port.tick(Duration::from_secs(3), now);
        for out in port.take_outbound() {
            if out.bytes[0] & 0x0f == MessageType::DelayReq as u8 {
                port.on_tx_ts(&out.bytes, Timestamp::from_secs_nanos(1000 + round as u64, 0), now);
            }
        }
    }

    assert!(port.stats.missing_delay_resps >= 3);
    assert!(port.alarms.test(ptpsyncd::port::ALARM_NO_DELAY_RESPS));
}
