// ptpsyncd — Foreign Master Dataset
// Distributed under the MIT software license.

//! Bounded table of recently-seen remote masters.
//!
//! One record per observed PortIdentity. The record the BMCA last selected
//! is pinned: replacement on overflow always victimises the oldest
//! non-best record, and if nothing older than the arrival exists the
//! arrival is dropped.

use crate::types::PortIdentity;
use crate::wire::{AnnounceBody, Header};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ForeignMasterRecord {
    pub port_identity: PortIdentity,
    pub address: SocketAddr,
    pub last_seen: Instant,
    pub header: Header,
    pub announce: AnnounceBody,
    pub announce_count: u64,
}

/// What `observe` did with an Announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveOutcome {
    Updated(usize),
    Inserted(usize),
    /// Table full and every record at least as fresh as the arrival.
    Dropped,
}

#[derive(Debug)]
pub struct ForeignMasterDataset {
    records: Vec<Option<ForeignMasterRecord>>,
    number_records: usize,
    write_index: usize,
    best_index: Option<usize>,
}

impl ForeignMasterDataset {
    pub fn new(capacity: usize) -> Self {
        ForeignMasterDataset {
            records: (0..capacity).map(|_| None).collect(),
            number_records: 0,
            write_index: 0,
            best_index: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    pub fn number_records(&self) -> usize {
        self.number_records
    }

    pub fn is_empty(&self) -> bool {
        self.number_records == 0
    }

    pub fn get(&self, index: usize) -> Option<&ForeignMasterRecord> {
        self.records.get(index).and_then(|r| r.as_ref())
    }

    pub fn best_index(&self) -> Option<usize> {
        self.best_index
    }

    pub fn best(&self) -> Option<&ForeignMasterRecord> {
        self.best_index.and_then(|i| self.get(i))
    }

    /// Adopt a BMCA verdict. The index must refer to an occupied slot.
    pub fn set_best(&mut self, index: usize) {
        debug_assert!(self.get(index).is_some());
        self.best_index = Some(index);
    }

    pub fn clear_best(&mut self) {
        self.best_index = None;
    }

    pub fn occupied(&self) -> impl Iterator<Item = (usize, &ForeignMasterRecord)> {
        self.records.iter().enumerate().filter_map(|(i, r)| r.as_ref().map(|r| (i, r)))
    }

    /// Fold an Announce into the table.
    pub fn observe(
        &mut self,
        header: Header,
        announce: AnnounceBody,
        address: SocketAddr,
        now: Instant,
    ) -> ObserveOutcome {
        let identity = header.source_port_identity;

        if let Some(index) = self.find(identity) {
            if let Some(record) = self.records[index].as_mut() {
                record.header = header;
                record.announce = announce;
                record.address = address;
                record.last_seen = now;
                record.announce_count += 1;
            }
            return ObserveOutcome::Updated(index);
        }

        let index = match self.free_slot() {
            Some(index) => index,
            None => match self.victim(now) {
                Some(index) => index,
                None => return ObserveOutcome::Dropped,
            },
        };

        self.records[index] = Some(ForeignMasterRecord {
            port_identity: identity,
            address,
            last_seen: now,
            header,
            announce,
            announce_count: 1,
        });
        self.number_records = self.records.iter().filter(|r| r.is_some()).count();
        self.write_index = (index + 1) % self.records.len();
        ObserveOutcome::Inserted(index)
    }

    /// Remove records not refreshed within `window` (four announce
    /// intervals). Returns true if the best record expired; the caller owns
    /// the resulting state transition.
    pub fn expire(&mut self, now: Instant, window: Duration) -> bool {
        let mut best_expired = false;
        for (index, slot) in self.records.iter_mut().enumerate() {
            let stale = slot
                .as_ref()
                .is_some_and(|r| now.saturating_duration_since(r.last_seen) > window);
            if stale {
                *slot = None;
                self.number_records -= 1;
                if self.best_index == Some(index) {
                    self.best_index = None;
                    best_expired = true;
                }
            }
        }
        best_expired
    }

    pub fn clear(&mut self) {
        self.records.iter_mut().for_each(|r| *r = None);
        self.number_records = 0;
        self.write_index = 0;
        self.best_index = None;
    }

    fn find(&self, identity: PortIdentity) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.as_ref().is_some_and(|r| r.port_identity == identity))
    }

    /// First free slot scanning from the write cursor.
    fn free_slot(&self) -> Option<usize> {
        let n = self.records.len();
        (0..n).map(|i| (self.write_index + i) % n).find(|&i| self.records[i].is_none())
    }

    /// Oldest non-best record strictly older than the arrival.
    fn victim(&self, arrival: Instant) -> Option<usize> {
        self.records
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != self.best_index)
            .filter_map(|(i, r)| r.as_ref().map(|r| (i, r.last_seen)))
            .filter(|(_, seen)| *seen < arrival)
            .min_by_key(|(_, seen)| *seen)
            .map(|(i, _)| i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClockIdentity;
    use crate::wire::MessageType;

    fn header(id: u8) -> Header {
        Header::new(
            MessageType::Announce,
            0,
            PortIdentity::new(ClockIdentity([id; 8]), 1),
        )
    }

    fn addr() -> SocketAddr {
        "10.0.0.1:320".parse().unwrap()
    }

    #[test]
    fn first_announce_inserts_at_zero() {
        let mut ds = ForeignMasterDataset::new(4);
        let out = ds.observe(header(1), AnnounceBody::default(), addr(), Instant::now());
        assert_eq!(out, ObserveOutcome::Inserted(0));
        assert_eq!(ds.number_records(), 1);
        ds.set_best(0);
        assert_eq!(ds.best_index(), Some(0));
    }

    #[test]
    fn repeat_announce_updates_in_place() {
        let mut ds = ForeignMasterDataset::new(4);
        let t0 = Instant::now();
        ds.observe(header(1), AnnounceBody::default(), addr(), t0);
        let out =
            ds.observe(header(1), AnnounceBody::default(), addr(), t0 + Duration::from_secs(1));
        assert_eq!(out, ObserveOutcome::Updated(0));
        assert_eq!(ds.number_records(), 1);
        assert_eq!(ds.get(0).unwrap().announce_count, 2);
    }

    #[test]
    fn overflow_evicts_oldest_non_best() {
        let mut ds = ForeignMasterDataset::new(4);
        let base = Instant::now();
        for i in 0..4u8 {
            ds.observe(
                header(i + 1),
                AnnounceBody::default(),
                addr(),
                base + Duration::from_secs(i as u64),
            );
        }
        // Record 0 (id 1) is oldest but pinned as best; record 1 (id 2) is
        // the victim.
        ds.set_best(0);
        let out = ds.observe(
            header(9),
            AnnounceBody::default(),
            addr(),
            base + Duration::from_secs(10),
        );
        assert_eq!(out, ObserveOutcome::Inserted(1));
        assert_eq!(ds.number_records(), 4);
        assert_eq!(ds.best_index(), Some(0));
        assert_eq!(ds.get(1).unwrap().port_identity.clock, ClockIdentity([9; 8]));
    }

    #[test]
    fn arrival_dropped_when_nothing_older() {
        let mut ds = ForeignMasterDataset::new(2);
        let now = Instant::now();
        ds.observe(header(1), AnnounceBody::default(), addr(), now);
        ds.observe(header(2), AnnounceBody::default(), addr(), now);
        let out = ds.observe(header(3), AnnounceBody::default(), addr(), now);
        assert_eq!(out, ObserveOutcome::Dropped);
        assert_eq!(ds.number_records(), 2);
    }

    #[test]
    fn expiry_removes_stale_and_reports_best_loss() {
        let mut ds = ForeignMasterDataset::new(4);
        let base = Instant::now();
        ds.observe(header(1), AnnounceBody::default(), addr(), base);
        ds.observe(header(2), AnnounceBody::default(), addr(), base + Duration::from_secs(8));
        ds.set_best(0);

        let best_lost = ds.expire(base + Duration::from_secs(9), Duration::from_secs(4));
        assert!(best_lost);
        assert_eq!(ds.number_records(), 1);
        assert_eq!(ds.best_index(), None);
        assert!(ds.get(1).is_some());
    }

    #[test]
    fn count_never_exceeds_capacity() {
        let mut ds = ForeignMasterDataset::new(4);
        let base = Instant::now();
        for i in 0..20u8 {
            ds.observe(
                header(i),
                AnnounceBody::default(),
                addr(),
                base + Duration::from_millis(i as u64 * 100),
            );
            assert!(ds.number_records() <= 4);
        }
    }

    #[test]
    fn best_points_at_occupied_record_after_churn() {
        let mut ds = ForeignMasterDataset::new(3);
        let base = Instant::now();
        for i in 0..3u8 {
            ds.observe(
                header(i + 1),
                AnnounceBody::default(),
                addr(),
                base + Duration::from_secs(i as u64),
            );
        }
        ds.set_best(2);
        for i in 0..10u8 {
            ds.observe(
                header(50 + i),
                AnnounceBody::default(),
                addr(),
                base + Duration::from_secs(10 + i as u64),
            );
            if ds.number_records() > 0 {
                if let Some(best) = ds.best_index() {
                    assert!(ds.get(best).is_some());
                }
            }
        }
        assert!(ds.get(ds.best_index().unwrap()).is_some());
    }
}
