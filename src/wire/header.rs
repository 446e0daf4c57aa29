// ptpsyncd — PTP Common Header
// Distributed under the MIT software license.

//! The 34-byte common header preceding every PTP message.
//!
//! Byte layout (all multi-byte fields big-endian):
//!
//! | Offset | Field |
//! |--------|-------|
//! | 0      | transportSpecific (hi nibble), messageType (lo nibble) |
//! | 1      | reserved (hi), versionPTP (lo) |
//! | 2..4   | messageLength |
//! | 4      | domainNumber |
//! | 5      | reserved |
//! | 6..8   | flagField |
//! | 8..16  | correctionField (scaled ns) |
//! | 16..20 | reserved |
//! | 20..30 | sourcePortIdentity |
//! | 30..32 | sequenceId |
//! | 32     | controlField |
//! | 33     | logMessageInterval |

use crate::error::WireError;
use crate::types::{PortIdentity, TimeInterval, PTP_VERSION};

pub const HEADER_LEN: usize = 34;

/// The ten concrete IEEE 1588 message types. Event types (0x0..0x3) are
/// timestamped at the wire; general types are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Sync = 0x0,
    DelayReq = 0x1,
    PDelayReq = 0x2,
    PDelayResp = 0x3,
    FollowUp = 0x8,
    DelayResp = 0x9,
    PDelayRespFollowUp = 0xa,
    Announce = 0xb,
    Signaling = 0xc,
    Management = 0xd,
}

impl MessageType {
    pub fn from_nibble(value: u8) -> Result<Self, WireError> {
        match value & 0x0f {
            0x0 => Ok(MessageType::Sync),
            0x1 => Ok(MessageType::DelayReq),
            0x2 => Ok(MessageType::PDelayReq),
            0x3 => Ok(MessageType::PDelayResp),
            0x8 => Ok(MessageType::FollowUp),
            0x9 => Ok(MessageType::DelayResp),
            0xa => Ok(MessageType::PDelayRespFollowUp),
            0xb => Ok(MessageType::Announce),
            0xc => Ok(MessageType::Signaling),
            0xd => Ok(MessageType::Management),
            other => Err(WireError::InvalidEnum { field: "messageType", value: other as u32 }),
        }
    }

    /// Event messages go out the event socket and carry wire timestamps.
    pub fn is_event(&self) -> bool {
        (*self as u8) <= 0x3
    }

    /// controlField value kept for 1588-2008 compatibility.
    pub fn control_field(&self) -> u8 {
        match self {
            MessageType::Sync => 0,
            MessageType::DelayReq => 1,
            MessageType::FollowUp => 2,
            MessageType::DelayResp => 3,
            MessageType::Management => 4,
            _ => 5,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Sync => "sync",
            MessageType::DelayReq => "delay-req",
            MessageType::PDelayReq => "pdelay-req",
            MessageType::PDelayResp => "pdelay-resp",
            MessageType::FollowUp => "follow-up",
            MessageType::DelayResp => "delay-resp",
            MessageType::PDelayRespFollowUp => "pdelay-resp-follow-up",
            MessageType::Announce => "announce",
            MessageType::Signaling => "signaling",
            MessageType::Management => "management",
        }
    }
}

// flagField bits, expressed on the 16-bit big-endian view (octet 6 is the
// high byte).
pub const FLAG_ALTERNATE_MASTER: u16 = 0x0100;
pub const FLAG_TWO_STEP: u16 = 0x0200;
pub const FLAG_UNICAST: u16 = 0x0400;
pub const FLAG_LEAP61: u16 = 0x0001;
pub const FLAG_LEAP59: u16 = 0x0002;
pub const FLAG_UTC_OFFSET_VALID: u16 = 0x0004;
pub const FLAG_PTP_TIMESCALE: u16 = 0x0008;
pub const FLAG_TIME_TRACEABLE: u16 = 0x0010;
pub const FLAG_FREQ_TRACEABLE: u16 = 0x0020;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub message_type: MessageType,
    pub transport_specific: u8,
    pub version: u8,
    pub message_length: u16,
    pub domain_number: u8,
    pub flags: u16,
    pub correction: TimeInterval,
    pub source_port_identity: PortIdentity,
    pub sequence_id: u16,
    pub log_message_interval: i8,
}

impl Header {
    pub fn new(message_type: MessageType, domain_number: u8, source: PortIdentity) -> Self {
        Header {
            message_type,
            transport_specific: 0,
            version: PTP_VERSION,
            message_length: 0,
            domain_number,
            flags: 0,
            correction: TimeInterval::ZERO,
            source_port_identity: source,
            sequence_id: 0,
            log_message_interval: 0x7f,
        }
    }

    pub fn two_step(&self) -> bool {
        self.flags & FLAG_TWO_STEP != 0
    }

    pub fn unicast(&self) -> bool {
        self.flags & FLAG_UNICAST != 0
    }

    pub fn leap61(&self) -> bool {
        self.flags & FLAG_LEAP61 != 0
    }

    pub fn leap59(&self) -> bool {
        self.flags & FLAG_LEAP59 != 0
    }

    pub fn utc_offset_valid(&self) -> bool {
        self.flags & FLAG_UTC_OFFSET_VALID != 0
    }

    pub fn ptp_timescale(&self) -> bool {
        self.flags & FLAG_PTP_TIMESCALE != 0
    }

    pub fn time_traceable(&self) -> bool {
        self.flags & FLAG_TIME_TRACEABLE != 0
    }

    pub fn frequency_traceable(&self) -> bool {
        self.flags & FLAG_FREQ_TRACEABLE != 0
    }

    pub fn set_flag(&mut self, flag: u16, on: bool) {
        if on {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    /// Write the header into `out[..34]`. `message_length` must already hold
    /// the final length including TLVs.
    pub fn pack(&self, out: &mut [u8]) -> Result<(), WireError> {
        if out.len() < HEADER_LEN {
            return Err(WireError::Truncated { offset: 0, need: HEADER_LEN, have: out.len() });
        }
        out[0] = (self.transport_specific << 4) | (self.message_type as u8);
        out[1] = self.version & 0x0f;
        out[2..4].copy_from_slice(&self.message_length.to_be_bytes());
        out[4] = self.domain_number;
        out[5] = 0;
        out[6..8].copy_from_slice(&self.flags.to_be_bytes());
        out[8..16].copy_from_slice(&self.correction.0.to_be_bytes());
        out[16..20].fill(0);
        self.source_port_identity.write(&mut out[20..30]);
        out[30..32].copy_from_slice(&self.sequence_id.to_be_bytes());
        out[32] = self.message_type.control_field();
        out[33] = self.log_message_interval as u8;
        Ok(())
    }

    pub fn unpack(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::Truncated { offset: 0, need: HEADER_LEN, have: buf.len() });
        }
        let message_type = MessageType::from_nibble(buf[0])?;
        let version = buf[1] & 0x0f;
        if version != PTP_VERSION {
            return Err(WireError::BadVersion(version));
        }
        let message_length = u16::from_be_bytes([buf[2], buf[3]]);
        if (message_length as usize) > buf.len() || (message_length as usize) < HEADER_LEN {
            return Err(WireError::LengthMismatch {
                claimed: message_length as usize,
                actual: buf.len(),
            });
        }
        Ok(Header {
            message_type,
            transport_specific: buf[0] >> 4,
            version,
            message_length,
            domain_number: buf[4],
            flags: u16::from_be_bytes([buf[6], buf[7]]),
            correction: TimeInterval(i64::from_be_bytes([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ])),
            source_port_identity: PortIdentity::read(&buf[20..30]),
            sequence_id: u16::from_be_bytes([buf[30], buf[31]]),
            log_message_interval: buf[33] as i8,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClockIdentity;

    fn sample() -> Header {
        let mut h = Header::new(
            MessageType::Announce,
            3,
            PortIdentity::new(ClockIdentity([1, 2, 3, 0xff, 0xfe, 4, 5, 6]), 1),
        );
        h.message_length = HEADER_LEN as u16 + 30;
        h.sequence_id = 0xbeef;
        h.correction = TimeInterval::from_nanos(250);
        h.set_flag(FLAG_TWO_STEP, true);
        h.log_message_interval = 1;
        h
    }

    #[test]
    fn header_roundtrip() {
        let h = sample();
        let mut buf = [0u8; 64];
        h.pack(&mut buf).unwrap();
        let back = Header::unpack(&buf).unwrap();
        assert_eq!(back, h);
        assert!(back.two_step());
        assert!(!back.unicast());
    }

    #[test]
    fn nibble_packing_upper_transport_specific() {
        let mut h = sample();
        h.transport_specific = 0x5;
        let mut buf = [0u8; 64];
        h.pack(&mut buf).unwrap();
        assert_eq!(buf[0], 0x5b);
        assert_eq!(buf[1], 0x02);
    }

    #[test]
    fn truncated_header_is_precise() {
        let err = Header::unpack(&[0u8; 20]).unwrap_err();
        assert_eq!(err, WireError::Truncated { offset: 0, need: 34, have: 20 });
    }

    #[test]
    fn rejects_reserved_type_code() {
        let mut buf = [0u8; 64];
        sample().pack(&mut buf).unwrap();
        buf[0] = 0x04; // reserved message type
        assert!(matches!(
            Header::unpack(&buf),
            Err(WireError::InvalidEnum { field: "messageType", .. })
        ));
    }

    #[test]
    fn rejects_wrong_version() {
        let mut buf = [0u8; 64];
        sample().pack(&mut buf).unwrap();
        buf[1] = 0x01;
        assert_eq!(Header::unpack(&buf), Err(WireError::BadVersion(1)));
    }

    #[test]
    fn rejects_overlong_claimed_length() {
        let mut buf = [0u8; 64];
        sample().pack(&mut buf).unwrap();
        buf[2] = 0x10;
        buf[3] = 0x00;
        assert!(matches!(Header::unpack(&buf), Err(WireError::LengthMismatch { .. })));
    }
}
