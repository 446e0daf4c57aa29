// ptpsyncd — PTP Message Bodies
// Distributed under the MIT software license.

//! Message bodies and the tagged `Message` type.
//!
//! Bodies sit at fixed offsets after the 34-byte header: Sync/Delay_Req 10
//! bytes, Follow_Up 10, Announce 30, Delay_Resp 20, PDelay_Req 10 + 10
//! reserved, PDelay_Resp 20, PDelay_Resp_Follow_Up 20, Management and
//! Signaling variable. Suffix TLVs follow the body up to `messageLength`.

use crate::error::WireError;
use crate::types::{PortIdentity, TimeInterval, Timestamp, WireTimestamp};
use crate::wire::header::{Header, MessageType, HEADER_LEN};
use crate::wire::tlv::{append_tlv, Tlv};

// Management ids served by the port (IEEE 1588 table 59).
pub const MGMT_NULL_MANAGEMENT: u16 = 0x0000;
pub const MGMT_CLOCK_DESCRIPTION: u16 = 0x0001;
pub const MGMT_DEFAULT_DATA_SET: u16 = 0x2000;
pub const MGMT_CURRENT_DATA_SET: u16 = 0x2001;
pub const MGMT_PARENT_DATA_SET: u16 = 0x2002;
pub const MGMT_TIME_PROPERTIES_DATA_SET: u16 = 0x2003;
pub const MGMT_PORT_DATA_SET: u16 = 0x2004;

// Management error ids (IEEE 1588 table 109).
pub const MGMT_ERROR_NO_SUCH_ID: u16 = 0x0002;
pub const MGMT_ERROR_NOT_SUPPORTED: u16 = 0x0006;

/// Advertised quality of a clock, compared field-by-field by the BMCA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClockQuality {
    pub clock_class: u8,
    pub clock_accuracy: u8,
    pub offset_scaled_log_variance: u16,
}

impl ClockQuality {
    pub const LEN: usize = 4;

    /// Quality advertised by a clock that has never been synchronized
    /// (clockClass 248, accuracy unknown).
    pub fn default_free_running() -> Self {
        ClockQuality { clock_class: 248, clock_accuracy: 0xfe, offset_scaled_log_variance: 0xffff }
    }

    fn write(&self, out: &mut [u8]) {
        out[0] = self.clock_class;
        out[1] = self.clock_accuracy;
        out[2..4].copy_from_slice(&self.offset_scaled_log_variance.to_be_bytes());
    }

    fn read(buf: &[u8]) -> Self {
        ClockQuality {
            clock_class: buf[0],
            clock_accuracy: buf[1],
            offset_scaled_log_variance: u16::from_be_bytes([buf[2], buf[3]]),
        }
    }
}

/// Announce body: the grandmaster's advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AnnounceBody {
    pub origin_timestamp: WireTimestamp,
    pub current_utc_offset: i16,
    pub grandmaster_priority1: u8,
    pub grandmaster_clock_quality: ClockQuality,
    pub grandmaster_priority2: u8,
    pub grandmaster_identity: crate::types::ClockIdentity,
    pub steps_removed: u16,
    pub time_source: u8,
}

pub const ANNOUNCE_BODY_LEN: usize = 30;

/// Management action nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ManagementAction {
    Get = 0,
    Set = 1,
    Response = 2,
    Command = 3,
    Acknowledge = 4,
}

impl ManagementAction {
    fn from_nibble(value: u8) -> Result<Self, WireError> {
        match value & 0x0f {
            0 => Ok(ManagementAction::Get),
            1 => Ok(ManagementAction::Set),
            2 => Ok(ManagementAction::Response),
            3 => Ok(ManagementAction::Command),
            4 => Ok(ManagementAction::Acknowledge),
            other => {
                Err(WireError::InvalidEnum { field: "managementAction", value: other as u32 })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagementBody {
    pub target: PortIdentity,
    pub starting_boundary_hops: u8,
    pub boundary_hops: u8,
    pub action: ManagementAction,
    /// The single management TLV (or error-status TLV in responses).
    pub tlv: Tlv,
}

const MANAGEMENT_FIXED_LEN: usize = 14;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Sync { origin: WireTimestamp },
    DelayReq { origin: WireTimestamp },
    FollowUp { precise_origin: WireTimestamp },
    Announce(AnnounceBody),
    DelayResp { receive: WireTimestamp, requesting: PortIdentity },
    PDelayReq { origin: WireTimestamp },
    PDelayResp { request_receipt: WireTimestamp, requesting: PortIdentity },
    PDelayRespFollowUp { response_origin: WireTimestamp, requesting: PortIdentity },
    Management(ManagementBody),
    Signaling { target: PortIdentity, tlvs: Vec<Tlv> },
}

impl Body {
    pub fn message_type(&self) -> MessageType {
        match self {
            Body::Sync { .. } => MessageType::Sync,
            Body::DelayReq { .. } => MessageType::DelayReq,
            Body::FollowUp { .. } => MessageType::FollowUp,
            Body::Announce(_) => MessageType::Announce,
            Body::DelayResp { .. } => MessageType::DelayResp,
            Body::PDelayReq { .. } => MessageType::PDelayReq,
            Body::PDelayResp { .. } => MessageType::PDelayResp,
            Body::PDelayRespFollowUp { .. } => MessageType::PDelayRespFollowUp,
            Body::Management(_) => MessageType::Management,
            Body::Signaling { .. } => MessageType::Signaling,
        }
    }
}

/// A complete PTP message: header, body, and any suffix TLVs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub body: Body,
    pub suffix: Vec<Tlv>,
}

impl Message {
    pub fn new(header: Header, body: Body) -> Self {
        Message { header, body, suffix: Vec::new() }
    }

    /// Pack to wire bytes. The header `messageLength` is computed here and
    /// updated again for every appended suffix TLV.
    pub fn pack(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = vec![0u8; HEADER_LEN];
        self.pack_body(&mut buf);
        let mut header = self.header;
        header.message_length = buf.len() as u16;
        let mut head = [0u8; HEADER_LEN];
        header.pack(&mut head)?;
        buf[..HEADER_LEN].copy_from_slice(&head);
        for tlv in &self.suffix {
            append_tlv(&mut buf, tlv);
        }
        Ok(buf)
    }

    fn pack_body(&self, buf: &mut Vec<u8>) {
        match &self.body {
            Body::Sync { origin } | Body::DelayReq { origin } => {
                let mut b = [0u8; 10];
                origin.write(&mut b);
                buf.extend_from_slice(&b);
            }
            Body::FollowUp { precise_origin } => {
                let mut b = [0u8; 10];
                precise_origin.write(&mut b);
                buf.extend_from_slice(&b);
            }
            Body::Announce(a) => {
                let mut b = [0u8; ANNOUNCE_BODY_LEN];
                a.origin_timestamp.write(&mut b[..10]);
                b[10..12].copy_from_slice(&a.current_utc_offset.to_be_bytes());
                b[13] = a.grandmaster_priority1;
                a.grandmaster_clock_quality.write(&mut b[14..18]);
                b[18] = a.grandmaster_priority2;
                b[19..27].copy_from_slice(a.grandmaster_identity.as_bytes());
                b[27..29].copy_from_slice(&a.steps_removed.to_be_bytes());
                b[29] = a.time_source;
                buf.extend_from_slice(&b);
            }
            Body::DelayResp { receive, requesting } => {
                let mut b = [0u8; 20];
                receive.write(&mut b[..10]);
                requesting.write(&mut b[10..20]);
                buf.extend_from_slice(&b);
            }
            Body::PDelayReq { origin } => {
                let mut b = [0u8; 20];
                origin.write(&mut b[..10]);
                buf.extend_from_slice(&b);
            }
            Body::PDelayResp { request_receipt, requesting } => {
                let mut b = [0u8; 20];
                request_receipt.write(&mut b[..10]);
                requesting.write(&mut b[10..20]);
                buf.extend_from_slice(&b);
            }
            Body::PDelayRespFollowUp { response_origin, requesting } => {
                let mut b = [0u8; 20];
                response_origin.write(&mut b[..10]);
                requesting.write(&mut b[10..20]);
                buf.extend_from_slice(&b);
            }
            Body::Management(m) => {
                let mut b = [0u8; MANAGEMENT_FIXED_LEN];
                m.target.write(&mut b[..10]);
                b[10] = m.starting_boundary_hops;
                b[11] = m.boundary_hops;
                b[12] = m.action as u8;
                buf.extend_from_slice(&b);
                m.tlv.pack_into(buf);
            }
            Body::Signaling { target, tlvs } => {
                let mut b = [0u8; 10];
                target.write(&mut b);
                buf.extend_from_slice(&b);
                for tlv in tlvs {
                    tlv.pack_into(buf);
                }
            }
        }
    }

    /// Decode a datagram. Consumes exactly `header.messageLength` bytes;
    /// anything between body end and message end is parsed as suffix TLVs.
    pub fn unpack(buf: &[u8]) -> Result<Message, WireError> {
        let header = Header::unpack(buf)?;
        let end = header.message_length as usize;
        let payload = &buf[HEADER_LEN..end];

        let need = |n: usize| -> Result<(), WireError> {
            if payload.len() < n {
                Err(WireError::Truncated { offset: HEADER_LEN, need: n, have: payload.len() })
            } else {
                Ok(())
            }
        };

        let (body, body_len) = match header.message_type {
            MessageType::Sync => {
                need(10)?;
                (Body::Sync { origin: WireTimestamp::read(&payload[..10]) }, 10)
            }
            MessageType::DelayReq => {
                need(10)?;
                (Body::DelayReq { origin: WireTimestamp::read(&payload[..10]) }, 10)
            }
            MessageType::FollowUp => {
                need(10)?;
                (Body::FollowUp { precise_origin: WireTimestamp::read(&payload[..10]) }, 10)
            }
            MessageType::Announce => {
                need(ANNOUNCE_BODY_LEN)?;
                let mut gm = [0u8; 8];
                gm.copy_from_slice(&payload[19..27]);
                (
                    Body::Announce(AnnounceBody {
                        origin_timestamp: WireTimestamp::read(&payload[..10]),
                        current_utc_offset: i16::from_be_bytes([payload[10], payload[11]]),
                        grandmaster_priority1: payload[13],
                        grandmaster_clock_quality: ClockQuality::read(&payload[14..18]),
                        grandmaster_priority2: payload[18],
                        grandmaster_identity: crate::types::ClockIdentity(gm),
                        steps_removed: u16::from_be_bytes([payload[27], payload[28]]),
                        time_source: payload[29],
                    }),
                    ANNOUNCE_BODY_LEN,
                )
            }
            MessageType::DelayResp => {
                need(20)?;
                (
                    Body::DelayResp {
                        receive: WireTimestamp::read(&payload[..10]),
                        requesting: PortIdentity::read(&payload[10..20]),
                    },
                    20,
                )
            }
            MessageType::PDelayReq => {
                // The standard body carries 10 reserved bytes after the
                // timestamp; some stacks omit them. Accept both.
                need(10)?;
                let len = if payload.len() >= 20 { 20 } else { 10 };
                (Body::PDelayReq { origin: WireTimestamp::read(&payload[..10]) }, len)
            }
            MessageType::PDelayResp => {
                need(20)?;
                (
                    Body::PDelayResp {
                        request_receipt: WireTimestamp::read(&payload[..10]),
                        requesting: PortIdentity::read(&payload[10..20]),
                    },
                    20,
                )
            }
            MessageType::PDelayRespFollowUp => {
                need(20)?;
                (
                    Body::PDelayRespFollowUp {
                        response_origin: WireTimestamp::read(&payload[..10]),
                        requesting: PortIdentity::read(&payload[10..20]),
                    },
                    20,
                )
            }
            MessageType::Management => {
                need(MANAGEMENT_FIXED_LEN)?;
                let (tlv, consumed) = Tlv::unpack(&payload[MANAGEMENT_FIXED_LEN..])?;
                (
                    Body::Management(ManagementBody {
                        target: PortIdentity::read(&payload[..10]),
                        starting_boundary_hops: payload[10],
                        boundary_hops: payload[11],
                        action: ManagementAction::from_nibble(payload[12])?,
                        tlv,
                    }),
                    MANAGEMENT_FIXED_LEN + consumed,
                )
            }
            MessageType::Signaling => {
                need(10)?;
                let tlvs = Tlv::unpack_all(&payload[10..])?;
                let body_len = payload.len();
                (Body::Signaling { target: PortIdentity::read(&payload[..10]), tlvs }, body_len)
            }
        };

        let suffix = Tlv::unpack_all(&payload[body_len..])?;
        Ok(Message { header, body, suffix })
    }
}

/// Split a fine timestamp for the origin side of a two-step exchange:
/// the wire timestamp truncates to nanoseconds and the sub-ns remainder is
/// ADDED into the outgoing correctionField, on top of any correction being
/// propagated from the matching event message.
pub fn precise_origin_timestamp(
    ts: Timestamp,
    propagated: TimeInterval,
) -> (WireTimestamp, TimeInterval) {
    let (wire, sub) = ts.split_precise();
    (wire, propagated + sub)
}

/// Split a fine timestamp for the receipt side (Delay_Resp receiveTimestamp,
/// PDelay_Resp requestReceiptTimestamp): the consumer computes
/// `t = timestamp - correctionField`, so the sub-ns remainder is SUBTRACTED.
pub fn precise_receipt_timestamp(
    ts: Timestamp,
    propagated: TimeInterval,
) -> (WireTimestamp, TimeInterval) {
    let (wire, sub) = ts.split_precise();
    (wire, propagated - sub)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClockIdentity;
    use crate::wire::header::FLAG_TWO_STEP;

    fn source() -> PortIdentity {
        PortIdentity::new(ClockIdentity([0, 1, 2, 0xff, 0xfe, 3, 4, 5]), 1)
    }

    fn announce() -> Message {
        let mut header = Header::new(MessageType::Announce, 0, source());
        header.sequence_id = 42;
        header.log_message_interval = 1;
        Message::new(
            header,
            Body::Announce(AnnounceBody {
                origin_timestamp: WireTimestamp::new(1000, 2000),
                current_utc_offset: 37,
                grandmaster_priority1: 128,
                grandmaster_clock_quality: ClockQuality {
                    clock_class: 6,
                    clock_accuracy: 0x21,
                    offset_scaled_log_variance: 0x4e5d,
                },
                grandmaster_priority2: 128,
                grandmaster_identity: ClockIdentity([9; 8]),
                steps_removed: 2,
                time_source: 0x20,
            }),
        )
    }

    #[test]
    fn announce_roundtrip() {
        let msg = announce();
        let wire = msg.pack().unwrap();
        assert_eq!(wire.len(), HEADER_LEN + ANNOUNCE_BODY_LEN);
        let back = Message::unpack(&wire).unwrap();
        assert_eq!(back.body, msg.body);
        assert_eq!(back.header.sequence_id, 42);
    }

    #[test]
    fn sync_roundtrip_with_flags() {
        let mut header = Header::new(MessageType::Sync, 0, source());
        header.set_flag(FLAG_TWO_STEP, true);
        header.sequence_id = 7;
        let msg = Message::new(header, Body::Sync { origin: WireTimestamp::new(5, 6) });
        let wire = msg.pack().unwrap();
        let back = Message::unpack(&wire).unwrap();
        assert!(back.header.two_step());
        assert_eq!(back.body, msg.body);
    }

    #[test]
    fn delay_resp_roundtrip() {
        let header = Header::new(MessageType::DelayResp, 0, source());
        let msg = Message::new(
            header,
            Body::DelayResp {
                receive: WireTimestamp::new(123, 456),
                requesting: PortIdentity::new(ClockIdentity([7; 8]), 3),
            },
        );
        let back = Message::unpack(&msg.pack().unwrap()).unwrap();
        assert_eq!(back.body, msg.body);
    }

    #[test]
    fn pdelay_req_emits_reserved_block() {
        let header = Header::new(MessageType::PDelayReq, 0, source());
        let msg = Message::new(header, Body::PDelayReq { origin: WireTimestamp::new(1, 2) });
        let wire = msg.pack().unwrap();
        assert_eq!(wire.len(), HEADER_LEN + 20);
        let back = Message::unpack(&wire).unwrap();
        assert_eq!(back.body, msg.body);
    }

    #[test]
    fn management_roundtrip() {
        let header = Header::new(MessageType::Management, 0, source());
        let msg = Message::new(
            header,
            Body::Management(ManagementBody {
                target: PortIdentity::new(ClockIdentity::ALL_ONES, 0xffff),
                starting_boundary_hops: 1,
                boundary_hops: 1,
                action: ManagementAction::Get,
                tlv: Tlv::Management { management_id: MGMT_DEFAULT_DATA_SET, data: vec![] },
            }),
        );
        let back = Message::unpack(&msg.pack().unwrap()).unwrap();
        assert_eq!(back.body, msg.body);
    }

    #[test]
    fn suffix_tlv_extends_message_length() {
        let mut msg = announce();
        msg.suffix.push(Tlv::PortCommunicationCapabilities {
            sync_availability: 1,
            delay_resp_availability: 1,
        });
        let wire = msg.pack().unwrap();
        let claimed = u16::from_be_bytes([wire[2], wire[3]]) as usize;
        assert_eq!(claimed, wire.len());
        let back = Message::unpack(&wire).unwrap();
        assert_eq!(back.suffix.len(), 1);
    }

    #[test]
    fn truncation_at_every_offset_errors() {
        let wire = announce().pack().unwrap();
        for len in 0..wire.len() {
            assert!(
                Message::unpack(&wire[..len]).is_err(),
                "prefix of {} bytes must not decode",
                len
            );
        }
    }

    #[test]
    fn precise_origin_preserves_total() {
        let ts = Timestamp::from_scaled_ns(
            (42i128 * 1_000_000_000 + 7) * crate::types::SCALED_NS_PER_NS as i128 + 1234,
        );
        let (wire, corr) = precise_origin_timestamp(ts, TimeInterval::ZERO);
        let rebuilt = Timestamp::from_wire(wire).apply(corr);
        assert_eq!(rebuilt, ts);
    }

    #[test]
    fn precise_receipt_inverts_under_subtraction() {
        let ts = Timestamp::from_scaled_ns(
            (9i128 * 1_000_000_000 + 500) * crate::types::SCALED_NS_PER_NS as i128 + 77,
        );
        let (wire, corr) = precise_receipt_timestamp(ts, TimeInterval::ZERO);
        // Consumer-side reconstruction: timestamp - correction.
        let rebuilt = Timestamp::from_wire(wire).apply(-corr);
        assert_eq!(rebuilt, ts);
    }

    #[test]
    fn propagated_correction_accumulates() {
        let ts = Timestamp::from_secs_nanos(1, 0);
        let prior = TimeInterval::from_nanos(100);
        let (_, corr) = precise_origin_timestamp(ts, prior);
        assert_eq!(corr, prior);
    }
}
