// ptpsyncd — Best Master Clock Algorithm
// Distributed under the MIT software license.

//! IEEE 1588 § 9.3 data-set comparison and § 9.2.6 state decision.
//!
//! The comparison is lexicographic over the eight advertised fields. With
//! distinct grandmasters it walks priority1, clockClass, clockAccuracy,
//! offsetScaledLogVariance, priority2 and the grandmaster identity; with a
//! shared grandmaster it falls through to stepsRemoved and the sender
//! identity. Lower always wins.

use crate::port::foreign::{ForeignMasterDataset, ForeignMasterRecord};
use crate::types::{ClockIdentity, PortIdentity};
use crate::wire::ClockQuality;
use std::cmp::Ordering;

/// The advertised fields the comparison runs over, extracted from an
/// Announce or synthesised from our own defaults (D0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComparableDataset {
    pub priority1: u8,
    pub identity: ClockIdentity,
    pub quality: ClockQuality,
    pub priority2: u8,
    pub steps_removed: u16,
    pub sender: PortIdentity,
}

impl ComparableDataset {
    pub fn from_record(record: &ForeignMasterRecord) -> Self {
        ComparableDataset {
            priority1: record.announce.grandmaster_priority1,
            identity: record.announce.grandmaster_identity,
            quality: record.announce.grandmaster_clock_quality,
            priority2: record.announce.grandmaster_priority2,
            steps_removed: record.announce.steps_removed,
            sender: record.header.source_port_identity,
        }
    }

    /// Our own advertisement, compared as a zero-step candidate.
    pub fn from_own(
        identity: ClockIdentity,
        quality: ClockQuality,
        priority1: u8,
        priority2: u8,
        own_port: PortIdentity,
    ) -> Self {
        ComparableDataset {
            priority1,
            identity,
            quality,
            priority2,
            steps_removed: 0,
            sender: own_port,
        }
    }
}

/// `Ordering::Less` means `a` is the better master.
pub fn compare_datasets(a: &ComparableDataset, b: &ComparableDataset) -> Ordering {
    if a.identity == b.identity {
        // Same grandmaster: closer and lower-numbered wins.
        return a
            .steps_removed
            .cmp(&b.steps_removed)
            .then_with(|| a.sender.cmp(&b.sender));
    }
    a.priority1
        .cmp(&b.priority1)
        .then_with(|| a.quality.clock_class.cmp(&b.quality.clock_class))
        .then_with(|| a.quality.clock_accuracy.cmp(&b.quality.clock_accuracy))
        .then_with(|| {
            a.quality
                .offset_scaled_log_variance
                .cmp(&b.quality.offset_scaled_log_variance)
        })
        .then_with(|| a.priority2.cmp(&b.priority2))
        .then_with(|| a.identity.cmp(&b.identity))
}

/// Index of the best occupied record, if any.
pub fn select_best(dataset: &ForeignMasterDataset) -> Option<usize> {
    dataset
        .occupied()
        .map(|(i, r)| (i, ComparableDataset::from_record(r)))
        .min_by(|(_, a), (_, b)| compare_datasets(a, b))
        .map(|(i, _)| i)
}

/// § 9.2.6 recommendation, fed to the port FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecommendedState {
    /// Track the record at this index.
    Slave { master: usize },
    Master,
    Passive,
    Listening,
}

/// Run the decision over the current table. `own` is D0, the port's own
/// advertisement.
pub fn decide_state(
    dataset: &ForeignMasterDataset,
    own: &ComparableDataset,
    slave_only: bool,
) -> RecommendedState {
    let Some(best) = select_best(dataset) else {
        return if slave_only { RecommendedState::Listening } else { RecommendedState::Master };
    };

    if slave_only {
        return RecommendedState::Slave { master: best };
    }

    let best_record = match dataset.get(best) {
        Some(record) => ComparableDataset::from_record(record),
        None => return RecommendedState::Listening,
    };

    if compare_datasets(own, &best_record) == Ordering::Less {
        return RecommendedState::Master;
    }

    // A port belonging to a held grandmaster-class clock (clockClass 1..127)
    // that loses the comparison goes PASSIVE rather than SLAVE.
    if own.quality.clock_class < 128 {
        RecommendedState::Passive
    } else {
        RecommendedState::Slave { master: best }
    }
}
