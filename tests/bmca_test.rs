//! Foreign-master table and best-master selection scenarios.

use ptpsyncd::port::{
    compare_datasets, decide_state, select_best, ComparableDataset, ForeignMasterDataset,
    ObserveOutcome, RecommendedState,
};
use ptpsyncd::types::{ClockIdentity, PortIdentity};
use ptpsyncd::wire::{AnnounceBody, ClockQuality, Header, MessageType};
use std::cmp::Ordering;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

fn addr(last: u8) -> SocketAddr {
    format!("192.0.2.{}:320", last).parse().unwrap()
}

fn announce_from(id: u8, seq: u16, priority1: u8) -> (Header, AnnounceBody) {
    let mut header =
        Header::new(MessageType::Announce, 0, PortIdentity::new(ClockIdentity([id; 8]), 1));
    header.sequence_id = seq;
    header.log_message_interval = 1;
    let body = AnnounceBody {
        grandmaster_priority1: priority1,
        grandmaster_identity: ClockIdentity([id; 8]),
        grandmaster_clock_quality: ClockQuality {
            clock_class: 248,
            clock_accuracy: 0xfe,
            offset_scaled_log_variance: 0xffff,
        },
        grandmaster_priority2: 128,
        steps_removed: 0,
        ..AnnounceBody::default()
    };
    (header, body)
}

fn own_dataset() -> ComparableDataset {
    ComparableDataset::from_own(
        ClockIdentity([0xee; 8]),
        ClockQuality { clock_class: 248, clock_accuracy: 0xfe, offset_scaled_log_variance: 0xffff },
        128,
        128,
        PortIdentity::new(ClockIdentity([0xee; 8]), 1),
    )
}

#[test]
fn test_empty_table_single_announce() {
    // Scenario: one announce into an empty table lands at index 0.
    let mut table = ForeignMasterDataset::new(8);
    let (h, b) = announce_from(1, 1, 100);
    let outcome = table.observe(h, b, addr(1), Instant::now());
    assert_eq!(outcome, ObserveOutcome::Inserted(0));
    assert_eq!(table.number_records(), 1);

    let best = select_best(&table).unwrap();
    assert_eq!(best, 0);
    table.set_best(best);
    assert_eq!(table.best_index(), Some(0));
}

#[test]
fn test_two_masters_alternating_dominant_stays_best() {
    // Scenario: A (priority1 10) dominates B (priority1 20) across ten
    // alternating announces each; B's record keeps refreshing.
    let mut table = ForeignMasterDataset::new(8);
    let base = Instant::now();
    let mut a_index = None;

    for round in 0..10u16 {
        let now = base + Duration::from_millis(u64::from(round) * 100);
        let (ha, ba) = announce_from(0xa, round + 1, 10);
        let (hb, bb) = announce_from(0xb, round + 1, 20);
        let oa = table.observe(ha, ba, addr(10), now);
        table.observe(hb, bb, addr(11), now);
        if let ObserveOutcome::Inserted(i) = oa {
            a_index = Some(i);
        }

        let best = select_best(&table).unwrap();
        table.set_best(best);
        assert_eq!(Some(best), a_index, "round {}", round);
    }

    let b_record = table
        .occupied()
        .find(|(_, r)| r.port_identity.clock == ClockIdentity([0xb; 8]))
        .map(|(_, r)| r)
        .unwrap();
    assert_eq!(b_record.announce_count, 10);
}

#[test]
fn test_full_table_fifth_master_evicts_oldest_non_best() {
    // Scenario: table of 4 is full; a fifth distinct master takes the slot
    // of the oldest non-best record.
    let mut table = ForeignMasterDataset::new(4);
    let base = Instant::now();
    for i in 0..4u8 {
        // Equal priorities: id 1 wins on the identity tiebreak.
        let (h, b) = announce_from(i + 1, 1, 100);
        table.observe(h, b, addr(i + 1), base + Duration::from_secs(u64::from(i)));
    }
    let best = select_best(&table).unwrap();
    table.set_best(best);

    let victim_expected: usize = if best == 0 { 1 } else { 0 };
    let (h, b) = announce_from(9, 1, 200);
    let outcome = table.observe(h, b, addr(9), base + Duration::from_secs(60));
    assert_eq!(outcome, ObserveOutcome::Inserted(victim_expected));
    assert_eq!(table.number_records(), 4);
    assert_eq!(table.best_index(), Some(best));
}

#[test]
fn test_bmca_monotonic_under_insertion_order() {
    // A strictly dominates B; selection must not depend on insertion order.
    let (ha, ba) = announce_from(1, 1, 10);
    let (hb, bb) = announce_from(2, 1, 200);
    let now = Instant::now();

    for &reversed in &[false, true] {
        let mut table = ForeignMasterDataset::new(4);
        if reversed {
            table.observe(hb, bb, addr(2), now);
            table.observe(ha, ba, addr(1), now);
        } else {
            table.observe(ha, ba, addr(1), now);
            table.observe(hb, bb, addr(2), now);
        }
        let best = select_best(&table).unwrap();
        assert_eq!(table.get(best).unwrap().port_identity.clock, ClockIdentity([1; 8]));
    }
}

#[test]
fn test_comparison_walks_the_field_order() {
    let mk = |p1, class, accuracy, variance, p2, id: u8| ComparableDataset {
        priority1: p1,
        identity: ClockIdentity([id; 8]),
        quality: ClockQuality {
            clock_class: class,
            clock_accuracy: accuracy,
            offset_scaled_log_variance: variance,
        },
        priority2: p2,
        steps_removed: 1,
        sender: PortIdentity::new(ClockIdentity([id; 8]), 1),
    };

    // Each candidate beats the next on exactly one field.
    let chain = [
        mk(1, 200, 0xfe, 0xffff, 200, 9),
        mk(2, 100, 0xfe, 0xffff, 200, 9),
        mk(2, 101, 0x20, 0xffff, 200, 9),
        mk(2, 101, 0x21, 0x1000, 200, 9),
        mk(2, 101, 0x21, 0x1001, 100, 9),
        mk(2, 101, 0x21, 0x1001, 101, 3),
    ];
    for pair in chain.windows(2) {
        assert_eq!(compare_datasets(&pair[0], &pair[1]), Ordering::Less);
        assert_eq!(compare_datasets(&pair[1], &pair[0]), Ordering::Greater);
    }
}

#[test]
fn test_expiry_of_best_forces_reselection() {
    let mut table = ForeignMasterDataset::new(4);
    let base = Instant::now();
    let (ha, ba) = announce_from(1, 1, 10);
    let (hb, bb) = announce_from(2, 1, 20);
    table.observe(ha, ba, addr(1), base);
    table.observe(hb, bb, addr(2), base + Duration::from_secs(7));
    table.set_best(select_best(&table).unwrap());
    assert_eq!(table.get(table.best_index().unwrap()).unwrap().port_identity.clock,
        ClockIdentity([1; 8]));

    // Only the best record (id 1) is stale at t=8 with a 4 s window.
    let best_lost = table.expire(base + Duration::from_secs(8), Duration::from_secs(4));
    assert!(best_lost);
    assert_eq!(table.best_index(), None);

    let new_best = select_best(&table).unwrap();
    assert_eq!(table.get(new_best).unwrap().port_identity.clock, ClockIdentity([2; 8]));
}

#[test]
fn test_state_decision_slave_only_never_master() {
    let table = ForeignMasterDataset::new(4);
    assert_eq!(decide_state(&table, &own_dataset(), true), RecommendedState::Listening);

    let mut table = ForeignMasterDataset::new(4);
    let (h, b) = announce_from(1, 1, 255); // worse than us on priority1
    table.observe(h, b, addr(1), Instant::now());
    assert_eq!(
        decide_state(&table, &own_dataset(), true),
        RecommendedState::Slave { master: 0 }
    );
}
