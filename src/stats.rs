//! In-process counters and latency quantiles.
//!
//! No external telemetry; the engine logs a snapshot periodically and on
//! shutdown.

use std::fmt;
use std::time::Duration;

/// Decade buckets from 1 microsecond to 100 seconds.
pub const HISTOGRAM_BUCKETS: usize = 9;

const BUCKET_EDGES_NS: [u64; HISTOGRAM_BUCKETS] = [
    1_000,              // 1 us
    10_000,             // 10 us
    100_000,            // 100 us
    1_000_000,          // 1 ms
    10_000_000,         // 10 ms
    100_000_000,        // 100 ms
    1_000_000_000,      // 1 s
    10_000_000_000,     // 10 s
    100_000_000_000,    // 100 s
];

/// Logarithmic latency histogram. Samples above the last edge land in the
/// final bucket.
#[derive(Debug, Clone, Default)]
pub struct LogHistogram {
    buckets: [u64; HISTOGRAM_BUCKETS],
    total: u64,
}

impl LogHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, latency: Duration) {
        let ns = latency.as_nanos().min(u64::MAX as u128) as u64;
        let idx = BUCKET_EDGES_NS
            .iter()
            .position(|&edge| ns <= edge)
            .unwrap_or(HISTOGRAM_BUCKETS - 1);
        self.buckets[idx] += 1;
        self.total += 1;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn bucket(&self, idx: usize) -> u64 {
        self.buckets[idx]
    }
}

impl fmt::Display for LogHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "1us:{} 10us:{} 100us:{} 1ms:{} 10ms:{} 100ms:{} 1s:{} 10s:{} 100s:{}",
            self.buckets[0],
            self.buckets[1],
            self.buckets[2],
            self.buckets[3],
            self.buckets[4],
            self.buckets[5],
            self.buckets[6],
            self.buckets[7],
            self.buckets[8],
        )
    }
}

/// Per-port message and error counters.
#[derive(Debug, Clone, Default)]
pub struct PortStats {
    pub rx_messages: u64,
    pub tx_messages: u64,
    pub rx_decode_errors: u64,
    pub rx_acl_drops: u64,
    pub rx_truncated: u64,
    pub rx_stale_sequence: u64,
    pub rx_foreign_dropped: u64,
    pub missing_followups: u64,
    pub missing_delay_resps: u64,
    pub missing_tx_timestamps: u64,
    pub missing_rx_timestamps: u64,
    pub recv_pdelay_reqs: u64,
    pub clock_compares: u64,
    pub monitoring_requests: u64,
    pub tx_cache_evictions: u64,
    pub outliers_rejected: u64,
    pub clustering_rejected: u64,
    pub clock_steps: u64,
    pub bmca_runs: u64,
    pub master_changes: u64,
}

impl fmt::Display for PortStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rx:{} tx:{} decode_err:{} acl_drop:{} stale_seq:{} no_fup:{} no_dresp:{} \
             no_txts:{} steps:{} master_changes:{}",
            self.rx_messages,
            self.tx_messages,
            self.rx_decode_errors,
            self.rx_acl_drops,
            self.rx_stale_sequence,
            self.missing_followups,
            self.missing_delay_resps,
            self.missing_tx_timestamps,
            self.clock_steps,
            self.master_changes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_bucket_selection() {
        let mut h = LogHistogram::new();
        h.record(Duration::from_nanos(500)); // <= 1us
        h.record(Duration::from_micros(5)); // <= 10us
        h.record(Duration::from_millis(2)); // <= 10ms
        h.record(Duration::from_secs(200)); // beyond last edge
        assert_eq!(h.bucket(0), 1);
        assert_eq!(h.bucket(1), 1);
        assert_eq!(h.bucket(4), 1);
        assert_eq!(h.bucket(8), 1);
        assert_eq!(h.total(), 4);
    }

    #[test]
    fn histogram_edge_inclusive() {
        let mut h = LogHistogram::new();
        h.record(Duration::from_micros(1));
        assert_eq!(h.bucket(0), 1);
        h.record(Duration::from_micros(1) + Duration::from_nanos(1));
        assert_eq!(h.bucket(1), 1);
    }
}
