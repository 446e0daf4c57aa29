pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod port;
pub mod servo;
pub mod stats;
pub mod transport;
pub mod types;
pub mod wire;

pub use clock::{Clock, ClockRegistry, FakeClock, FrequencyStore, PhcClock, SystemClock};
pub use config::{AclOrder, ClockCtrlPolicy, Config, DelayMechanism, Ipv6Scope, TransportMode};
pub use engine::{interface_mac, Engine};
pub use error::{ClockError, ConfigError, PortError, TransportError, WireError};
pub use port::{PortState, PtpPort};
pub use servo::{Servo, ServoOutcome, TimestampSet};
pub use types::{ClockIdentity, PortIdentity, TimeInterval, Timestamp, WireTimestamp};
pub use wire::{Header, Message, MessageType, Tlv};
