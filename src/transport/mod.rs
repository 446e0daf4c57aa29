//! UDP transport: sockets, hardware timestamping, TX-timestamp correlation
//! and source-address ACLs.

pub mod acl;
pub mod socket;
pub mod txcache;

pub use acl::{Acl, AclEntry};
pub use socket::{
    is_unicast_destination, PortSockets, RxPacket, SendKind, TimestampingMode, TxTimestamp,
    IPV6_TRAILER_LEN,
};
pub use txcache::{SweepReport, TxTag, TxTimestampCache, TX_CACHE_SLOTS, TX_FINGERPRINT_MAX};
