//! Error taxonomy.
//!
//! Three classes drive handling policy: transient data errors are counted and
//! dropped, recoverable protocol errors latch an alarm and drive FSM
//! recovery, fatal setup errors push the port to FAULTY.

use thiserror::Error;

/// Codec failures. All are transient data errors: the offending datagram is
/// discarded and counted, state never changes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated input at offset {offset}: need {need} bytes, have {have}")]
    Truncated { offset: usize, need: usize, have: usize },

    #[error("malformed TLV: type {tlv_type:#06x}, length {length}")]
    MalformedTlv { tlv_type: u16, length: usize },

    #[error("invalid enumerated value {value:#x} for {field}")]
    InvalidEnum { field: &'static str, value: u32 },

    #[error("unsupported PTP version {0}")]
    BadVersion(u8),

    #[error("message length field {claimed} disagrees with buffer {actual}")]
    LengthMismatch { claimed: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket setup failed: {0}")]
    Setup(#[source] std::io::Error),

    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),

    #[error("receive failed: {0}")]
    Recv(#[source] std::io::Error),

    #[error("datagram of {0} bytes exceeds receive buffer")]
    Oversized(usize),

    #[error("no timestamp attached to received datagram")]
    MissingRxTimestamp,
}

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("cannot open clock device {device}: {source}")]
    Open { device: String, source: std::io::Error },

    #[error("clock_adjtime failed: {0}")]
    Adjust(#[source] std::io::Error),

    #[error("clock_gettime failed: {0}")]
    GetTime(#[source] std::io::Error),

    #[error("unknown clock id {0}")]
    UnknownClock(u32),

    #[error("frequency correction persistence failed: {0}")]
    Persistence(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read { path: String, source: std::io::Error },

    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid ACL entry '{0}'")]
    BadAcl(String),

    #[error("{0}")]
    Invalid(String),
}

/// Port-level failures. `Fatal` wraps the setup class that transitions the
/// port to FAULTY; everything else recovers in place.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error(transparent)]
    Wire(#[from] WireError),
}

impl PortError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PortError::Fatal(_) | PortError::Transport(TransportError::Setup(_)))
            || matches!(self, PortError::Clock(ClockError::Open { .. }))
    }
}
