//! AVTP wire layout
//!
//! Offsets in [`offset`] are relative to the start of the AVTP header,
//! which follows an 18-byte VLAN-tagged Ethernet header.
//!
//! ```text
//!  0      1      2      3      4 ............ 11  12 ...... 15
//! +------+------+------+------+------------------+------------+
//! |subtyp|sv/tv | seq  |  tu  |    stream_id     | timestamp  |
//! +------+------+------+------+------------------+------------+
//!  16 ........ 19  20    21   22     23     24 ............ 31
//! +---------------+-----------+------+------+----------------+
//! | format / gw   |stream_len |M/tag |tcode | h264 ts / CIP  |
//! +---------------+-----------+------+------+----------------+
//! ```

use std::fmt;

use bytes::{BufMut, BytesMut};

/// Ethernet header including the 802.1Q tag
pub const ETH_HEADER_SIZE: usize = 18;
pub const AVTP_HEADER_SIZE: usize = 24;
pub const RTP_HEADER_SIZE: usize = 12;
pub const CIP_HEADER_SIZE: usize = 8;
/// RTP timestamp carried in front of the payload by the current CVF draft
pub const H264_TIMESTAMP_SIZE: usize = 4;

pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_AVTP: u16 = 0x22F0;

pub const SUBTYPE_IEC61883: u8 = 0x00;
pub const SUBTYPE_CVF: u8 = 0x03;

pub const CVF_FORMAT_RFC: u8 = 0x02;
pub const CVF_FORMAT_SUBTYPE_H264: u8 = 0x01;

/// sv=1, version 0, mr=0, tv=1
pub const CVF_FLAGS: u8 = 0x81;
/// sv=1, tv=0
pub const IEC61883_FLAGS: u8 = 0x80;

pub const TV_BIT: u8 = 0x01;
pub const TU_BIT: u8 = 0x01;

pub const CVF_MARKER_BIT: u8 = 0x10;
pub const CVF_PTV_BIT: u8 = 0x20;
pub const CVF_D5_MARKER_BIT: u8 = 0x04;

/// tag = 01, channel 31
pub const IEC61883_TAG_CHANNEL: u8 = 0x5F;
pub const IEC61883_TAG_BIT: u8 = 0x40;
/// tcode = 0xA, sy = 0
pub const IEC61883_TCODE_SY: u8 = 0xA0;

pub const CIP_SID: u8 = 63;
/// Data block size in quadlets for MPEG-TS source packets
pub const CIP_DBS: u8 = 0x06;
/// fn = 3, qpc = 0, sph = 1
pub const CIP_FN_QPC_SPH: u8 = 0xC4;
pub const CIP_SPH_BIT: u8 = 0x04;
pub const CIP_FMT_MPEG_TS: u8 = 0xA0;
/// Data blocks are 24 bytes (DBS 6 quadlets)
pub const CIP_DATA_BLOCK_SIZE: usize = 24;

pub const TSP_SIZE: usize = 188;
pub const SPH_SIZE: usize = 4;
pub const SOURCE_PACKET_SIZE: usize = TSP_SIZE + SPH_SIZE;

/// Field offsets within the AVTP header
pub mod offset {
    pub const SUBTYPE: usize = 0;
    pub const FLAGS: usize = 1;
    pub const SEQUENCE: usize = 2;
    pub const TU: usize = 3;
    pub const STREAM_ID: usize = 4;
    pub const TIMESTAMP: usize = 12;
    pub const FORMAT: usize = 16;
    pub const FORMAT_SUBTYPE: usize = 17;
    pub const STREAM_DATA_LENGTH: usize = 20;
    /// CVF M/evt byte, or 61883 tag/channel byte
    pub const MARKER: usize = 22;
    pub const TCODE: usize = 23;
    pub const H264_TIMESTAMP: usize = 24;
    pub const CIP: usize = 24;
    pub const CIP_FN_QPC_SPH: usize = 26;
    pub const CIP_DBC: usize = 27;
    pub const CIP_PAYLOAD: usize = 32;
}

/// 64-bit AVB stream identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }

    /// Build from a source MAC and a 16-bit unique id, the usual talker convention
    pub fn from_mac(mac: MacAddress, unique_id: u16) -> Self {
        let mut bytes = [0u8; 8];
        bytes[..6].copy_from_slice(&mac.0);
        bytes[6..].copy_from_slice(&unique_id.to_be_bytes());
        Self::from_bytes(bytes)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Ethernet MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// AVTP multicast base address 91:E0:F0:00:FE:00
    pub const AVTP_MULTICAST: MacAddress = MacAddress([0x91, 0xE0, 0xF0, 0x00, 0xFE, 0x00]);
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// Build the VLAN-tagged Ethernet header shared by every packet of a stream
pub fn ethernet_header(dmac: MacAddress, smac: MacAddress, vlan_tci: u16) -> BytesMut {
    let mut buf = BytesMut::with_capacity(ETH_HEADER_SIZE + AVTP_HEADER_SIZE + CIP_HEADER_SIZE);
    buf.put_slice(&dmac.0);
    buf.put_slice(&smac.0);
    buf.put_u16(ETHERTYPE_VLAN);
    buf.put_u16(vlan_tci);
    buf.put_u16(ETHERTYPE_AVTP);
    buf
}

/// AVTP part of a VLAN-tagged AVTP frame, `None` for anything else
pub fn avtp_view(frame: &[u8]) -> Option<&[u8]> {
    if frame.len() < ETH_HEADER_SIZE + AVTP_HEADER_SIZE
        || read_u16(frame, 12) != ETHERTYPE_VLAN
        || read_u16(frame, 16) != ETHERTYPE_AVTP
    {
        return None;
    }
    Some(&frame[ETH_HEADER_SIZE..])
}

/// Stream ID carried in an AVTP header
pub fn stream_id_of(avtp: &[u8]) -> Option<StreamId> {
    let bytes = avtp.get(offset::STREAM_ID..offset::STREAM_ID + 8)?;
    let mut id = [0u8; 8];
    id.copy_from_slice(bytes);
    Some(StreamId::from_bytes(id))
}

pub fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

pub fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

pub fn write_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_be_bytes());
}

pub fn write_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_be_bytes());
}
