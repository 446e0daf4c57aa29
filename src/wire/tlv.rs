// ptpsyncd — PTP TLVs
// Distributed under the MIT software license.

//! TLV encode/decode.
//!
//! Every TLV is `type(2) || length(2) || value(length)` with the value
//! padded to even length; the pad byte is included in the length field so
//! the stream stays 16-bit aligned. Appending a TLV to a packed message
//! also bumps the header `messageLength`.

use crate::error::WireError;
use crate::types::{PortIdentity, TimeInterval, WireTimestamp};

// IEEE 1588-2019 table 52 TLV types.
pub const TLV_MANAGEMENT: u16 = 0x0001;
pub const TLV_MANAGEMENT_ERROR_STATUS: u16 = 0x0002;
pub const TLV_ORGANIZATION_EXTENSION: u16 = 0x0003;
pub const TLV_PORT_COMMUNICATION_AVAILABILITY: u16 = 0x8002;
pub const TLV_SLAVE_RX_SYNC_TIMING_DATA: u16 = 0x8004;
pub const TLV_SLAVE_RX_SYNC_COMPUTED_DATA: u16 = 0x8005;
pub const TLV_SLAVE_TX_EVENT_TIMESTAMPS: u16 = 0x8006;
pub const TLV_PAD: u16 = 0x8008;
// Draft PTP-monitoring protocol types.
pub const TLV_PTPMON_REQ: u16 = 0x21fe;
pub const TLV_PTPMON_RESP: u16 = 0x21ff;
pub const TLV_MTIE_REQ: u16 = 0x2200;
pub const TLV_MTIE_RESP: u16 = 0x2201;

/// One record of Sync receive timing reported to a monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveRxSyncRecord {
    pub sequence_id: u16,
    pub sync_origin: WireTimestamp,
    pub total_correction: TimeInterval,
    pub scaled_cumulative_rate_offset: i32,
    pub sync_ingress: WireTimestamp,
}

const RX_SYNC_RECORD_LEN: usize = 34;

/// One record of computed offset/delay reported to a monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveRxComputedRecord {
    pub sequence_id: u16,
    pub offset_from_master: TimeInterval,
    pub mean_path_delay: TimeInterval,
    pub scaled_neighbor_rate_ratio: i32,
}

const RX_COMPUTED_RECORD_LEN: usize = 22;

/// One egress timestamp record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxEventRecord {
    pub sequence_id: u16,
    pub egress: WireTimestamp,
}

const TX_EVENT_RECORD_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tlv {
    /// Management request/response payload; the managementId is the first
    /// two value bytes, the dataset body follows.
    Management { management_id: u16, data: Vec<u8> },

    /// Error response: which managementId failed and why.
    ManagementErrorStatus { error_id: u16, management_id: u16, display: String },

    /// 3-byte OUI + 3-byte subtype + opaque payload.
    OrganizationExtension { oui: [u8; 3], subtype: [u8; 3], data: Vec<u8> },

    PortCommunicationCapabilities { sync_availability: u8, delay_resp_availability: u8 },

    SlaveRxSyncTimingData { source_port: PortIdentity, records: Vec<SlaveRxSyncRecord> },

    SlaveRxSyncComputedData { source_port: PortIdentity, records: Vec<SlaveRxComputedRecord> },

    SlaveTxEventTimestamps {
        source_port: PortIdentity,
        event_message_type: u8,
        records: Vec<TxEventRecord>,
    },

    /// Monitoring poll: asks the port for a state snapshot.
    PtpMonRequest,

    /// Monitoring poll: asks for the port's MTIE window.
    MtieRequest,

    /// Monitoring snapshot of the responding port.
    PtpMonResponse {
        port_state: u8,
        offset_from_master: TimeInterval,
        mean_path_delay: TimeInterval,
        parent_port: PortIdentity,
    },

    MtieResponse { valid: bool, window_seconds: u32, mtie_min_ns: u32, mtie_max_ns: u32 },

    Pad(usize),

    /// Unrecognized type carried through untouched.
    Unknown { tlv_type: u16, data: Vec<u8> },
}

impl Tlv {
    pub fn tlv_type(&self) -> u16 {
        match self {
            Tlv::Management { .. } => TLV_MANAGEMENT,
            Tlv::ManagementErrorStatus { .. } => TLV_MANAGEMENT_ERROR_STATUS,
            Tlv::OrganizationExtension { .. } => TLV_ORGANIZATION_EXTENSION,
            Tlv::PortCommunicationCapabilities { .. } => TLV_PORT_COMMUNICATION_AVAILABILITY,
            Tlv::SlaveRxSyncTimingData { .. } => TLV_SLAVE_RX_SYNC_TIMING_DATA,
            Tlv::SlaveRxSyncComputedData { .. } => TLV_SLAVE_RX_SYNC_COMPUTED_DATA,
            Tlv::SlaveTxEventTimestamps { .. } => TLV_SLAVE_TX_EVENT_TIMESTAMPS,
            Tlv::PtpMonRequest => TLV_PTPMON_REQ,
            Tlv::MtieRequest => TLV_MTIE_REQ,
            Tlv::PtpMonResponse { .. } => TLV_PTPMON_RESP,
            Tlv::MtieResponse { .. } => TLV_MTIE_RESP,
            Tlv::Pad(_) => TLV_PAD,
            Tlv::Unknown { tlv_type, .. } => *tlv_type,
        }
    }

    fn value_bytes(&self) -> Vec<u8> {
        match self {
            Tlv::Management { management_id, data } => {
                let mut v = Vec::with_capacity(2 + data.len());
                v.extend_from_slice(&management_id.to_be_bytes());
                v.extend_from_slice(data);
                v
            }
            Tlv::ManagementErrorStatus { error_id, management_id, display } => {
                let text = display.as_bytes();
                let mut v = Vec::with_capacity(9 + text.len());
                v.extend_from_slice(&error_id.to_be_bytes());
                v.extend_from_slice(&management_id.to_be_bytes());
                v.extend_from_slice(&[0u8; 4]);
                v.push(text.len().min(u8::MAX as usize) as u8);
                v.extend_from_slice(&text[..text.len().min(u8::MAX as usize)]);
                v
            }
            Tlv::OrganizationExtension { oui, subtype, data } => {
                let mut v = Vec::with_capacity(6 + data.len());
                v.extend_from_slice(oui);
                v.extend_from_slice(subtype);
                v.extend_from_slice(data);
                v
            }
            Tlv::PortCommunicationCapabilities { sync_availability, delay_resp_availability } => {
                vec![*sync_availability, *delay_resp_availability]
            }
            Tlv::SlaveRxSyncTimingData { source_port, records } => {
                let mut v = vec![0u8; 10];
                source_port.write(&mut v[..10]);
                for r in records {
                    let mut rec = [0u8; RX_SYNC_RECORD_LEN];
                    rec[..2].copy_from_slice(&r.sequence_id.to_be_bytes());
                    r.sync_origin.write(&mut rec[2..12]);
                    rec[12..20].copy_from_slice(&r.total_correction.0.to_be_bytes());
                    rec[20..24].copy_from_slice(&r.scaled_cumulative_rate_offset.to_be_bytes());
                    r.sync_ingress.write(&mut rec[24..34]);
                    v.extend_from_slice(&rec);
                }
                v
            }
            Tlv::SlaveRxSyncComputedData { source_port, records } => {
                let mut v = vec![0u8; 12];
                source_port.write(&mut v[..10]);
                for r in records {
                    let mut rec = [0u8; RX_COMPUTED_RECORD_LEN];
                    rec[..2].copy_from_slice(&r.sequence_id.to_be_bytes());
                    rec[2..10].copy_from_slice(&r.offset_from_master.0.to_be_bytes());
                    rec[10..18].copy_from_slice(&r.mean_path_delay.0.to_be_bytes());
                    rec[18..22].copy_from_slice(&r.scaled_neighbor_rate_ratio.to_be_bytes());
                    v.extend_from_slice(&rec);
                }
                v
            }
            Tlv::SlaveTxEventTimestamps { source_port, event_message_type, records } => {
                let mut v = vec![0u8; 12];
                source_port.write(&mut v[..10]);
                v[10] = *event_message_type;
                for r in records {
                    let mut rec = [0u8; TX_EVENT_RECORD_LEN];
                    rec[..2].copy_from_slice(&r.sequence_id.to_be_bytes());
                    r.egress.write(&mut rec[2..12]);
                    v.extend_from_slice(&rec);
                }
                v
            }
            Tlv::PtpMonResponse { port_state, offset_from_master, mean_path_delay, parent_port } => {
                let mut v = vec![0u8; 28];
                v[0] = *port_state;
                v[2..10].copy_from_slice(&offset_from_master.0.to_be_bytes());
                v[10..18].copy_from_slice(&mean_path_delay.0.to_be_bytes());
                parent_port.write(&mut v[18..28]);
                v
            }
            Tlv::MtieResponse { valid, window_seconds, mtie_min_ns, mtie_max_ns } => {
                let mut v = vec![0u8; 14];
                v[0] = u8::from(*valid);
                v[2..6].copy_from_slice(&window_seconds.to_be_bytes());
                v[6..10].copy_from_slice(&mtie_min_ns.to_be_bytes());
                v[10..14].copy_from_slice(&mtie_max_ns.to_be_bytes());
                v
            }
            Tlv::PtpMonRequest | Tlv::MtieRequest => Vec::new(),
            Tlv::Pad(len) => vec![0u8; *len],
            Tlv::Unknown { data, .. } => data.clone(),
        }
    }

    /// Append `type || length || value [|| pad]` to `out`. Returns the number
    /// of bytes written, always even.
    pub fn pack_into(&self, out: &mut Vec<u8>) -> usize {
        let mut value = self.value_bytes();
        if value.len() % 2 != 0 {
            value.push(0);
        }
        out.extend_from_slice(&self.tlv_type().to_be_bytes());
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(&value);
        4 + value.len()
    }

    /// Decode one TLV from the front of `buf`, returning it and the number
    /// of bytes consumed.
    pub fn unpack(buf: &[u8]) -> Result<(Tlv, usize), WireError> {
        if buf.len() < 4 {
            return Err(WireError::MalformedTlv { tlv_type: 0, length: buf.len() });
        }
        let tlv_type = u16::from_be_bytes([buf[0], buf[1]]);
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if buf.len() < 4 + length {
            return Err(WireError::Truncated { offset: 4, need: 4 + length, have: buf.len() });
        }
        let value = &buf[4..4 + length];
        let tlv = match tlv_type {
            TLV_MANAGEMENT => {
                if value.len() < 2 {
                    return Err(WireError::MalformedTlv { tlv_type, length });
                }
                Tlv::Management {
                    management_id: u16::from_be_bytes([value[0], value[1]]),
                    data: value[2..].to_vec(),
                }
            }
            TLV_MANAGEMENT_ERROR_STATUS => {
                if value.len() < 9 {
                    return Err(WireError::MalformedTlv { tlv_type, length });
                }
                let text_len = value[8] as usize;
                if value.len() < 9 + text_len {
                    return Err(WireError::MalformedTlv { tlv_type, length });
                }
                Tlv::ManagementErrorStatus {
                    error_id: u16::from_be_bytes([value[0], value[1]]),
                    management_id: u16::from_be_bytes([value[2], value[3]]),
                    display: String::from_utf8_lossy(&value[9..9 + text_len]).into_owned(),
                }
            }
            TLV_ORGANIZATION_EXTENSION => {
                if value.len() < 6 {
                    return Err(WireError::MalformedTlv { tlv_type, length });
                }
                Tlv::OrganizationExtension {
                    oui: [value[0], value[1], value[2]],
                    subtype: [value[3], value[4], value[5]],
                    data: value[6..].to_vec(),
                }
            }
            TLV_PORT_COMMUNICATION_AVAILABILITY => {
                if value.len() < 2 {
                    return Err(WireError::MalformedTlv { tlv_type, length });
                }
                Tlv::PortCommunicationCapabilities {
                    sync_availability: value[0],
                    delay_resp_availability: value[1],
                }
            }
            TLV_SLAVE_RX_SYNC_TIMING_DATA => {
                if value.len() < 10 || (value.len() - 10) % RX_SYNC_RECORD_LEN != 0 {
                    return Err(WireError::MalformedTlv { tlv_type, length });
                }
                let source_port = PortIdentity::read(&value[..10]);
                let records = value[10..]
                    .chunks_exact(RX_SYNC_RECORD_LEN)
                    .map(|rec| SlaveRxSyncRecord {
                        sequence_id: u16::from_be_bytes([rec[0], rec[1]]),
                        sync_origin: WireTimestamp::read(&rec[2..12]),
                        total_correction: TimeInterval(i64::from_be_bytes([
                            rec[12], rec[13], rec[14], rec[15], rec[16], rec[17], rec[18], rec[19],
                        ])),
                        scaled_cumulative_rate_offset: i32::from_be_bytes([
                            rec[20], rec[21], rec[22], rec[23],
                        ]),
                        sync_ingress: WireTimestamp::read(&rec[24..34]),
                    })
                    .collect();
                Tlv::SlaveRxSyncTimingData { source_port, records }
            }
            TLV_SLAVE_RX_SYNC_COMPUTED_DATA => {
                if value.len() < 12 || (value.len() - 12) % RX_COMPUTED_RECORD_LEN != 0 {
                    return Err(WireError::MalformedTlv { tlv_type, length });
                }
                let source_port = PortIdentity::read(&value[..10]);
                let records = value[12..]
                    .chunks_exact(RX_COMPUTED_RECORD_LEN)
                    .map(|rec| SlaveRxComputedRecord {
                        sequence_id: u16::from_be_bytes([rec[0], rec[1]]),
                        offset_from_master: TimeInterval(i64::from_be_bytes([
                            rec[2], rec[3], rec[4], rec[5], rec[6], rec[7], rec[8], rec[9],
                        ])),
                        mean_path_delay: TimeInterval(i64::from_be_bytes([
                            rec[10], rec[11], rec[12], rec[13], rec[14], rec[15], rec[16], rec[17],
                        ])),
                        scaled_neighbor_rate_ratio: i32::from_be_bytes([
                            rec[18], rec[19], rec[20], rec[21],
                        ]),
                    })
                    .collect();
                Tlv::SlaveRxSyncComputedData { source_port, records }
            }
            TLV_SLAVE_TX_EVENT_TIMESTAMPS => {
                if value.len() < 12 || (value.len() - 12) % TX_EVENT_RECORD_LEN != 0 {
                    return Err(WireError::MalformedTlv { tlv_type, length });
                }
                let source_port = PortIdentity::read(&value[..10]);
                let records = value[12..]
                    .chunks_exact(TX_EVENT_RECORD_LEN)
                    .map(|rec| TxEventRecord {
                        sequence_id: u16::from_be_bytes([rec[0], rec[1]]),
                        egress: WireTimestamp::read(&rec[2..12]),
                    })
                    .collect();
                Tlv::SlaveTxEventTimestamps {
                    source_port,
                    event_message_type: value[10],
                    records,
                }
            }
            TLV_PTPMON_REQ => Tlv::PtpMonRequest,
            TLV_MTIE_REQ => Tlv::MtieRequest,
            TLV_PTPMON_RESP => {
                if value.len() < 28 {
                    return Err(WireError::MalformedTlv { tlv_type, length });
                }
                Tlv::PtpMonResponse {
                    port_state: value[0],
                    offset_from_master: TimeInterval(i64::from_be_bytes([
                        value[2], value[3], value[4], value[5], value[6], value[7], value[8],
                        value[9],
                    ])),
                    mean_path_delay: TimeInterval(i64::from_be_bytes([
                        value[10], value[11], value[12], value[13], value[14], value[15],
                        value[16], value[17],
                    ])),
                    parent_port: PortIdentity::read(&value[18..28]),
                }
            }
            TLV_MTIE_RESP => {
                if value.len() < 14 {
                    return Err(WireError::MalformedTlv { tlv_type, length });
                }
                Tlv::MtieResponse {
                    valid: value[0] != 0,
                    window_seconds: u32::from_be_bytes([value[2], value[3], value[4], value[5]]),
                    mtie_min_ns: u32::from_be_bytes([value[6], value[7], value[8], value[9]]),
                    mtie_max_ns: u32::from_be_bytes([value[10], value[11], value[12], value[13]]),
                }
            }
            TLV_PAD => Tlv::Pad(value.len()),
            _ => Tlv::Unknown { tlv_type, data: value.to_vec() },
        };
        Ok((tlv, 4 + length))
    }

    /// Decode a whole TLV stream.
    pub fn unpack_all(mut buf: &[u8]) -> Result<Vec<Tlv>, WireError> {
        let mut tlvs = Vec::new();
        while !buf.is_empty() {
            let (tlv, consumed) = Tlv::unpack(buf)?;
            tlvs.push(tlv);
            buf = &buf[consumed..];
        }
        Ok(tlvs)
    }
}

/// Append a TLV to a fully packed message, fixing up the header
/// `messageLength` (bytes 2..4).
pub fn append_tlv(message: &mut Vec<u8>, tlv: &Tlv) {
    tlv.pack_into(message);
    let len = message.len() as u16;
    message[2..4].copy_from_slice(&len.to_be_bytes());
}
