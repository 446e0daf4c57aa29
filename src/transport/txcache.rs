// ptpsyncd — TX Timestamp Cache
// Distributed under the MIT software license.

//! Correlation of error-queue TX timestamps with sent PDUs.
//!
//! The kernel loops transmitted packets back on the socket error queue with
//! the hardware egress timestamp attached, but without any cookie tying them
//! to a send call. We keep the trailing bytes of every in-flight event PDU
//! in a fixed slab and match the looped-back payload tail against them.

use crate::stats::LogHistogram;
use crate::wire::MessageType;
use std::time::{Duration, Instant};

/// Slab capacity. A port has at most a handful of event messages in flight;
/// 32 gives headroom for bursty schedules without unbounded growth.
pub const TX_CACHE_SLOTS: usize = 32;

/// Longest stored fingerprint. Matching uses the final `len` bytes of the
/// PDU, which always cover the sequence id and source identity.
pub const TX_FINGERPRINT_MAX: usize = 64;

/// What the port needs back when a timestamp resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxTag {
    pub message_type: MessageType,
    pub sequence_id: u16,
    pub port_number: u16,
}

#[derive(Debug, Clone)]
struct Slot {
    fingerprint: [u8; TX_FINGERPRINT_MAX],
    fingerprint_len: usize,
    /// IPv6 sends carry a two-byte trailer excluded from matching.
    trailer_len: usize,
    tag: TxTag,
    sent_at: Instant,
    alarmed: bool,
}

/// Outcome of an age sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Entries newly past the alarm threshold.
    pub alarmed: Vec<TxTag>,
    /// Entries forcibly released.
    pub evicted: Vec<TxTag>,
}

#[derive(Debug)]
pub struct TxTimestampCache {
    slots: Vec<Option<Slot>>,
    /// Bit i set = slot i occupied. First free slot is
    /// `trailing_zeros(!bitmap)`.
    bitmap: u32,
    pub match_latency: LogHistogram,
    pub evictions: u64,
    pub unmatched_timestamps: u64,
}

impl Default for TxTimestampCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TxTimestampCache {
    pub fn new() -> Self {
        TxTimestampCache {
            slots: vec![None; TX_CACHE_SLOTS],
            bitmap: 0,
            match_latency: LogHistogram::new(),
            evictions: 0,
            unmatched_timestamps: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.bitmap.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap == 0
    }

    /// Record a just-sent PDU. On a full slab the oldest entry is evicted.
    pub fn insert(&mut self, pdu: &[u8], trailer_len: usize, tag: TxTag, now: Instant) {
        let idx = if self.bitmap != u32::MAX {
            (!self.bitmap).trailing_zeros() as usize
        } else {
            let oldest = self.oldest_slot();
            if let Some(slot) = self.slots[oldest].take() {
                tracing::debug!(
                    "tx cache full, evicting {:?} seq={}",
                    slot.tag.message_type,
                    slot.tag.sequence_id
                );
            }
            self.evictions += 1;
            oldest
        };

        let take = pdu.len().min(TX_FINGERPRINT_MAX);
        let mut fingerprint = [0u8; TX_FINGERPRINT_MAX];
        fingerprint[..take].copy_from_slice(&pdu[pdu.len() - take..]);
        self.slots[idx] = Some(Slot {
            fingerprint,
            fingerprint_len: take,
            trailer_len,
            tag,
            sent_at: now,
            alarmed: false,
        });
        self.bitmap |= 1 << idx;
    }

    /// Match a looped-back payload from the error queue. The stored trailer
    /// length is stripped from the payload before comparing tails.
    pub fn match_payload(&mut self, payload: &[u8], now: Instant) -> Option<TxTag> {
        for idx in 0..TX_CACHE_SLOTS {
            if self.bitmap & (1 << idx) == 0 {
                continue;
            }
            let matched = match self.slots[idx].as_ref() {
                Some(slot) => {
                    let pdu_len = payload.len().saturating_sub(slot.trailer_len);
                    pdu_len >= slot.fingerprint_len
                        && payload[pdu_len - slot.fingerprint_len..pdu_len]
                            == slot.fingerprint[..slot.fingerprint_len]
                }
                None => false,
            };
            if matched && let Some(slot) = self.slots[idx].take() {
                self.bitmap &= !(1 << idx);
                self.match_latency.record(now.saturating_duration_since(slot.sent_at));
                return Some(slot.tag);
            }
        }
        self.unmatched_timestamps += 1;
        None
    }

    /// Age pass: report entries past `alarm_after` once, release entries
    /// past `evict_after`.
    pub fn sweep(
        &mut self,
        now: Instant,
        alarm_after: Duration,
        evict_after: Duration,
    ) -> SweepReport {
        let mut report = SweepReport::default();
        for idx in 0..TX_CACHE_SLOTS {
            if self.bitmap & (1 << idx) == 0 {
                continue;
            }
            let Some(slot) = self.slots[idx].as_mut() else { continue };
            let age = now.saturating_duration_since(slot.sent_at);
            if age >= evict_after {
                report.evicted.push(slot.tag);
                self.slots[idx] = None;
                self.bitmap &= !(1 << idx);
                self.evictions += 1;
            } else if age >= alarm_after && !slot.alarmed {
                slot.alarmed = true;
                report.alarmed.push(slot.tag);
            }
        }
        report
    }

    /// Drop everything, counting each entry as an eviction. Used at port
    /// shutdown.
    pub fn flush(&mut self) -> usize {
        let dropped = self.len();
        self.evictions += dropped as u64;
        self.slots.iter_mut().for_each(|s| *s = None);
        self.bitmap = 0;
        dropped
    }

    fn oldest_slot(&self) -> usize {
        let mut oldest = 0;
        let mut oldest_at: Option<Instant> = None;
        for (idx, slot) in self.slots.iter().enumerate() {
            if let Some(slot) = slot
                && oldest_at.is_none_or(|t| slot.sent_at < t)
            {
                oldest = idx;
                oldest_at = Some(slot.sent_at);
            }
        }
        oldest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(seq: u16) -> TxTag {
        TxTag { message_type: MessageType::DelayReq, sequence_id: seq, port_number: 1 }
    }

    fn pdu(seq: u16) -> Vec<u8> {
        let mut p = vec![0u8; 54];
        p[30..32].copy_from_slice(&seq.to_be_bytes());
        p
    }

    #[test]
    fn match_returns_tag_and_frees_slot() {
        let mut cache = TxTimestampCache::new();
        let now = Instant::now();
        cache.insert(&pdu(10), 0, tag(10), now);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.match_payload(&pdu(10), now), Some(tag(10)));
        assert!(cache.is_empty());
        assert_eq!(cache.match_latency.total(), 1);
    }

    #[test]
    fn mismatch_counts_unmatched() {
        let mut cache = TxTimestampCache::new();
        let now = Instant::now();
        cache.insert(&pdu(10), 0, tag(10), now);
        assert_eq!(cache.match_payload(&pdu(11), now), None);
        assert_eq!(cache.unmatched_timestamps, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn ipv6_trailer_excluded_from_match() {
        let mut cache = TxTimestampCache::new();
        let now = Instant::now();
        let sent = pdu(3);
        cache.insert(&sent, 2, tag(3), now);
        let mut looped = sent.clone();
        looped.extend_from_slice(&[0, 0]);
        assert_eq!(cache.match_payload(&looped, now), Some(tag(3)));
    }

    #[test]
    fn overflow_evicts_oldest() {
        let mut cache = TxTimestampCache::new();
        let base = Instant::now();
        for i in 0..TX_CACHE_SLOTS as u16 {
            cache.insert(&pdu(i), 0, tag(i), base + Duration::from_millis(i as u64));
        }
        assert_eq!(cache.len(), TX_CACHE_SLOTS);
        cache.insert(&pdu(99), 0, tag(99), base + Duration::from_secs(1));
        assert_eq!(cache.len(), TX_CACHE_SLOTS);
        assert_eq!(cache.evictions, 1);
        // Slot for seq 0 (the oldest) is gone.
        assert_eq!(cache.match_payload(&pdu(0), base + Duration::from_secs(1)), None);
        assert_eq!(cache.match_payload(&pdu(99), base + Duration::from_secs(1)), Some(tag(99)));
    }

    #[test]
    fn sweep_alarms_once_then_evicts() {
        let mut cache = TxTimestampCache::new();
        let base = Instant::now();
        cache.insert(&pdu(5), 0, tag(5), base);

        let alarm = Duration::from_millis(10);
        let evict = Duration::from_millis(100);

        let r = cache.sweep(base + Duration::from_millis(20), alarm, evict);
        assert_eq!(r.alarmed, vec![tag(5)]);
        assert!(r.evicted.is_empty());

        // Already alarmed: not reported again.
        let r = cache.sweep(base + Duration::from_millis(30), alarm, evict);
        assert!(r.alarmed.is_empty());

        let r = cache.sweep(base + Duration::from_millis(200), alarm, evict);
        assert_eq!(r.evicted, vec![tag(5)]);
        assert!(cache.is_empty());
        assert_eq!(cache.evictions, 1);
    }

    #[test]
    fn flush_counts_evictions() {
        let mut cache = TxTimestampCache::new();
        let now = Instant::now();
        cache.insert(&pdu(1), 0, tag(1), now);
        cache.insert(&pdu(2), 0, tag(2), now);
        assert_eq!(cache.flush(), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.evictions, 2);
    }

    #[test]
    fn long_pdu_uses_trailing_64_bytes() {
        let mut cache = TxTimestampCache::new();
        let now = Instant::now();
        let mut long = vec![0xabu8; 200];
        long[199] = 0x42;
        cache.insert(&long, 0, tag(7), now);
        assert_eq!(cache.match_payload(&long, now), Some(tag(7)));
    }
}
