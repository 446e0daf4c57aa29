//! Bit-exact IEEE 1588 message codec.

pub mod header;
pub mod message;
pub mod tlv;

pub use header::{
    Header, MessageType, FLAG_ALTERNATE_MASTER, FLAG_FREQ_TRACEABLE, FLAG_LEAP59, FLAG_LEAP61,
    FLAG_PTP_TIMESCALE, FLAG_TIME_TRACEABLE, FLAG_TWO_STEP, FLAG_UNICAST, FLAG_UTC_OFFSET_VALID,
    HEADER_LEN,
};
pub use message::{
    precise_origin_timestamp, precise_receipt_timestamp, AnnounceBody, Body, ClockQuality,
    ManagementAction, ManagementBody, Message, ANNOUNCE_BODY_LEN, MGMT_CLOCK_DESCRIPTION,
    MGMT_CURRENT_DATA_SET, MGMT_DEFAULT_DATA_SET, MGMT_ERROR_NO_SUCH_ID,
    MGMT_ERROR_NOT_SUPPORTED, MGMT_NULL_MANAGEMENT, MGMT_PARENT_DATA_SET, MGMT_PORT_DATA_SET,
    MGMT_TIME_PROPERTIES_DATA_SET,
};
pub use tlv::{
    append_tlv, SlaveRxComputedRecord, SlaveRxSyncRecord, Tlv, TxEventRecord,
    TLV_MANAGEMENT, TLV_MANAGEMENT_ERROR_STATUS, TLV_ORGANIZATION_EXTENSION, TLV_PAD,
};
