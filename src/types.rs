// ptpsyncd — Protocol Constants and Types
// Distributed under the MIT software license.

//! Core identities, timestamps and protocol constants for IEEE 1588.
//!
//! Everything on the wire is big-endian. Timestamps are 48-bit seconds plus
//! 32-bit nanoseconds since the PTP epoch; sub-nanosecond precision travels
//! in the header `correctionField` as scaled nanoseconds (units of 2^-16 ns).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// PTP version carried in every header (IEEE 1588-2008/2019 both use 2).
pub const PTP_VERSION: u8 = 2;

/// UDP port for event messages (Sync, Delay_Req, PDelay_Req/Resp).
pub const PTP_EVENT_PORT: u16 = 319;

/// UDP port for general messages (Announce, Follow_Up, Delay_Resp, ...).
pub const PTP_GENERAL_PORT: u16 = 320;

/// Primary IPv4 multicast group: every message except peer delay.
pub const PTP_PRIMARY_MULTICAST_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 129);

/// Peer-delay IPv4 multicast group. Always sent with TTL 1.
pub const PTP_PEER_MULTICAST_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 107);

/// Primary IPv6 multicast group, link-local scope.
pub const PTP_PRIMARY_MULTICAST_V6_LINKLOCAL: Ipv6Addr =
    Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x181);

/// Primary IPv6 multicast group, global scope.
pub const PTP_PRIMARY_MULTICAST_V6_GLOBAL: Ipv6Addr =
    Ipv6Addr::new(0xff0e, 0, 0, 0, 0, 0, 0, 0x181);

/// Peer-delay IPv6 multicast group (always link-local, always hop limit 1).
pub const PTP_PEER_MULTICAST_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x6b);

/// Receive buffer bound. Datagrams longer than this are truncated by the
/// kernel and dropped by the transport with a warning.
pub const PACKET_SIZE: usize = 1536;

/// Scaled-nanosecond unit: correctionField carries ns * 2^16.
pub const SCALED_NS_PER_NS: i64 = 1 << 16;

// =============================================================================
// IDENTITIES
// =============================================================================

/// 8-byte clock identity (EUI-64). Built from the interface EUI-48 with a
/// two-byte fill between the OUI and the NIC-specific half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ClockIdentity(pub [u8; 8]);

/// The legacy EUI-48-to-EUI-64 fill. 1588-2019 allows an operator-chosen
/// fill instead; see `Config::unique_clockid_bits`.
pub const LEGACY_CLOCKID_FILL: [u8; 2] = [0xff, 0xfe];

impl ClockIdentity {
    pub const LEN: usize = 8;

    /// All-ones identity, reserved by the standard.
    pub const ALL_ONES: ClockIdentity = ClockIdentity([0xff; 8]);

    /// Build from a MAC address: OUI, fill bytes, NIC half.
    pub fn from_mac(mac: [u8; 6], fill: [u8; 2]) -> Self {
        ClockIdentity([mac[0], mac[1], mac[2], fill[0], fill[1], mac[3], mac[4], mac[5]])
    }

    pub fn from_bytes(bytes: &[u8; 8]) -> Self {
        ClockIdentity(*bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for ClockIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Clock identity plus 16-bit port number. Orders lexicographically as the
/// concatenated 10 bytes, which is what the derive produces field-by-field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct PortIdentity {
    pub clock: ClockIdentity,
    pub port: u16,
}

impl PortIdentity {
    pub const LEN: usize = 10;

    pub fn new(clock: ClockIdentity, port: u16) -> Self {
        PortIdentity { clock, port }
    }

    pub fn write(&self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.clock.0);
        out[8..10].copy_from_slice(&self.port.to_be_bytes());
    }

    pub fn read(buf: &[u8]) -> Self {
        let mut clock = [0u8; 8];
        clock.copy_from_slice(&buf[..8]);
        PortIdentity {
            clock: ClockIdentity(clock),
            port: u16::from_be_bytes([buf[8], buf[9]]),
        }
    }
}

impl fmt::Display for PortIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.clock, self.port)
    }
}

// =============================================================================
// TIME
// =============================================================================

/// On-wire PTP timestamp: 48-bit seconds + 32-bit nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireTimestamp {
    pub seconds: u64,
    pub nanoseconds: u32,
}

impl WireTimestamp {
    pub const LEN: usize = 10;

    pub fn new(seconds: u64, nanoseconds: u32) -> Self {
        WireTimestamp { seconds, nanoseconds }
    }

    pub fn write(&self, out: &mut [u8]) {
        let secs = self.seconds.to_be_bytes();
        out[..6].copy_from_slice(&secs[2..8]);
        out[6..10].copy_from_slice(&self.nanoseconds.to_be_bytes());
    }

    pub fn read(buf: &[u8]) -> Self {
        let seconds =
            u64::from_be_bytes([0, 0, buf[0], buf[1], buf[2], buf[3], buf[4], buf[5]]);
        let nanoseconds = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
        WireTimestamp { seconds, nanoseconds }
    }
}

/// Signed scaled-nanosecond quantity (ns * 2^16), the unit of
/// `correctionField` and of all path-delay arithmetic on the wire side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct TimeInterval(pub i64);

impl TimeInterval {
    pub const ZERO: TimeInterval = TimeInterval(0);

    pub fn from_nanos(ns: i64) -> Self {
        TimeInterval(ns.saturating_mul(SCALED_NS_PER_NS))
    }

    pub fn from_nanos_f64(ns: f64) -> Self {
        TimeInterval((ns * SCALED_NS_PER_NS as f64) as i64)
    }

    pub fn as_nanos_f64(&self) -> f64 {
        self.0 as f64 / SCALED_NS_PER_NS as f64
    }

    /// Whole-nanosecond part, truncated toward zero.
    pub fn whole_nanos(&self) -> i64 {
        self.0 / SCALED_NS_PER_NS
    }

    /// Sub-nanosecond remainder, still in scaled units.
    pub fn sub_nano_part(&self) -> i64 {
        self.0 % SCALED_NS_PER_NS
    }
}

impl std::ops::Add for TimeInterval {
    type Output = TimeInterval;
    fn add(self, rhs: TimeInterval) -> TimeInterval {
        TimeInterval(self.0.saturating_add(rhs.0))
    }
}

impl std::ops::Sub for TimeInterval {
    type Output = TimeInterval;
    fn sub(self, rhs: TimeInterval) -> TimeInterval {
        TimeInterval(self.0.saturating_sub(rhs.0))
    }
}

impl std::ops::Neg for TimeInterval {
    type Output = TimeInterval;
    fn neg(self) -> TimeInterval {
        TimeInterval(self.0.saturating_neg())
    }
}

/// A fine-grained instant since the PTP epoch: wire timestamp resolution
/// plus the sub-nanosecond part carried in correction fields. Internally a
/// single 128-bit scaled-nanosecond count so pairing arithmetic never
/// overflows across the 48-bit seconds range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp {
    scaled_ns: i128,
}

impl Timestamp {
    pub fn from_scaled_ns(scaled_ns: i128) -> Self {
        Timestamp { scaled_ns }
    }

    pub fn from_secs_nanos(seconds: u64, nanoseconds: u32) -> Self {
        let ns = seconds as i128 * 1_000_000_000 + nanoseconds as i128;
        Timestamp { scaled_ns: ns * SCALED_NS_PER_NS as i128 }
    }

    pub fn from_wire(ts: WireTimestamp) -> Self {
        Self::from_secs_nanos(ts.seconds, ts.nanoseconds)
    }

    pub fn scaled_ns(&self) -> i128 {
        self.scaled_ns
    }

    pub fn as_nanos_f64(&self) -> f64 {
        self.scaled_ns as f64 / SCALED_NS_PER_NS as f64
    }

    /// Split into the wire triple: (seconds, nanoseconds, sub-ns correction).
    /// The correction is what `correctionField` carries alongside a
    /// truncated body timestamp.
    pub fn split_precise(&self) -> (WireTimestamp, TimeInterval) {
        let total_ns = self.scaled_ns.div_euclid(SCALED_NS_PER_NS as i128);
        let sub = self.scaled_ns.rem_euclid(SCALED_NS_PER_NS as i128);
        let seconds = (total_ns.div_euclid(1_000_000_000)) as u64;
        let nanoseconds = (total_ns.rem_euclid(1_000_000_000)) as u32;
        (WireTimestamp::new(seconds, nanoseconds), TimeInterval(sub as i64))
    }

    pub fn apply(&self, correction: TimeInterval) -> Timestamp {
        Timestamp { scaled_ns: self.scaled_ns + correction.0 as i128 }
    }

    /// Difference in nanoseconds, `self - other`.
    pub fn delta_nanos_f64(&self, other: Timestamp) -> f64 {
        (self.scaled_ns - other.scaled_ns) as f64 / SCALED_NS_PER_NS as f64
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total_ns = self.scaled_ns.div_euclid(SCALED_NS_PER_NS as i128);
        write!(
            f,
            "{}.{:09}",
            total_ns.div_euclid(1_000_000_000),
            total_ns.rem_euclid(1_000_000_000)
        )
    }
}

/// Convert a log2 message interval (signed, seconds) to a float duration.
pub fn log_interval_to_secs(log2: i8) -> f64 {
    2f64.powi(log2 as i32)
}

/// Pick the multicast group for a destination family and scope.
pub fn primary_multicast(ipv6: bool, global_scope: bool) -> IpAddr {
    if !ipv6 {
        IpAddr::V4(PTP_PRIMARY_MULTICAST_V4)
    } else if global_scope {
        IpAddr::V6(PTP_PRIMARY_MULTICAST_V6_GLOBAL)
    } else {
        IpAddr::V6(PTP_PRIMARY_MULTICAST_V6_LINKLOCAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_identity_from_mac_legacy_fill() {
        let id = ClockIdentity::from_mac([0x00, 0x0f, 0x53, 0x12, 0x34, 0x56], LEGACY_CLOCKID_FILL);
        assert_eq!(id.0, [0x00, 0x0f, 0x53, 0xff, 0xfe, 0x12, 0x34, 0x56]);
        assert_eq!(id.to_string(), "000f53fffe123456");
    }

    #[test]
    fn port_identity_orders_as_concatenated_bytes() {
        let a = PortIdentity::new(ClockIdentity([0, 0, 0, 0, 0, 0, 0, 1]), 0xffff);
        let b = PortIdentity::new(ClockIdentity([0, 0, 0, 0, 0, 0, 0, 2]), 0x0001);
        assert!(a < b);

        let c = PortIdentity::new(ClockIdentity([1; 8]), 1);
        let d = PortIdentity::new(ClockIdentity([1; 8]), 2);
        assert!(c < d);
    }

    #[test]
    fn wire_timestamp_roundtrip() {
        let ts = WireTimestamp::new(0x0000_e8d4_a510_00, 999_999_999);
        let mut buf = [0u8; 10];
        ts.write(&mut buf);
        assert_eq!(WireTimestamp::read(&buf), ts);
    }

    #[test]
    fn precise_split_preserves_total() {
        let ts = Timestamp::from_scaled_ns(
            (1_700_000_000i128 * 1_000_000_000 + 123_456_789) * SCALED_NS_PER_NS as i128 + 0x8000,
        );
        let (wire, sub) = ts.split_precise();
        let rebuilt = Timestamp::from_wire(wire).apply(sub);
        assert_eq!(rebuilt, ts);
        assert_eq!(wire.seconds, 1_700_000_000);
        assert_eq!(wire.nanoseconds, 123_456_789);
        assert_eq!(sub.0, 0x8000);
    }

    #[test]
    fn interval_conversions() {
        assert_eq!(TimeInterval::from_nanos(5).0, 5 << 16);
        assert_eq!(TimeInterval::from_nanos(-3).whole_nanos(), -3);
        let i = TimeInterval::from_nanos_f64(1.5);
        assert!((i.as_nanos_f64() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn delta_spans_seconds() {
        let t1 = Timestamp::from_secs_nanos(100, 999_999_000);
        let t2 = Timestamp::from_secs_nanos(101, 500);
        assert!((t2.delta_nanos_f64(t1) - 1500.0).abs() < 1e-6);
    }

    #[test]
    fn log_interval() {
        assert_eq!(log_interval_to_secs(0), 1.0);
        assert_eq!(log_interval_to_secs(1), 2.0);
        assert_eq!(log_interval_to_secs(-3), 0.125);
    }
}
