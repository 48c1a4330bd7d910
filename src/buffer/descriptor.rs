//! Video descriptors exchanged through the local ring buffer

use crate::packet::Packet;

/// One queued unit of video data
///
/// In pool-backed mode the payload lives in the attached [`Packet`],
/// behind its payload offset. In internal-buffer mode `packet` is `None`
/// and the bytes are copied to the reader's destination buffer.
#[derive(Debug, Default)]
pub struct VideoDesc {
    /// Payload bytes held by this descriptor
    pub size: usize,
    /// MPEG-TS source packets packed into the attached packet
    pub tsps_in_packet: usize,
    /// Source packet headers are already present in the payload
    pub has_sph: bool,
    pub is_iec61883: bool,
    pub pts: u64,
    pub dts: u64,
    pub rtp_timestamp: u32,
    pub rtp_sequence: u16,
    /// RTP marker bit and payload type (M/PT byte)
    pub mpt_field: u8,
    pub packet: Option<Packet>,
}

impl VideoDesc {
    /// Whether the RTP marker bit is set
    pub fn marker(&self) -> bool {
        self.mpt_field & 0x80 != 0
    }

    pub(crate) fn clear(&mut self) {
        *self = VideoDesc::default();
    }
}

/// A unit handed to [`LocalVideoBuffer::write`](super::LocalVideoBuffer::write)
#[derive(Debug, Clone, Copy, Default)]
pub struct VideoUnit<'a> {
    pub data: &'a [u8],
    pub is_iec61883: bool,
    pub has_sph: bool,
    pub pts: u64,
    pub dts: u64,
    pub rtp_timestamp: u32,
    pub rtp_sequence: u16,
    pub mpt_field: u8,
}

impl<'a> VideoUnit<'a> {
    /// An H.264 RTP payload
    pub fn h264(data: &'a [u8], rtp_sequence: u16, rtp_timestamp: u32, marker: bool) -> Self {
        Self {
            data,
            rtp_sequence,
            rtp_timestamp,
            mpt_field: if marker { 0xE0 } else { 0x60 },
            ..Self::default()
        }
    }

    /// A run of MPEG-TS packets, 188 bytes each (192 with source packet headers)
    pub fn mpeg_ts(data: &'a [u8], has_sph: bool, rtp_sequence: u16) -> Self {
        Self {
            data,
            is_iec61883: true,
            has_sph,
            rtp_sequence,
            ..Self::default()
        }
    }
}

/// Outcome of a write that did not violate the buffer's size limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Bytes of the unit accepted
    Written(usize),
    /// No free slot
    Full,
    /// The packet pool had nothing to hand out
    PoolExhausted,
}

impl WriteStatus {
    pub fn bytes_written(self) -> usize {
        match self {
            WriteStatus::Written(n) => n,
            _ => 0,
        }
    }
}

/// Outcome of a read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// A descriptor was read; payload size in bytes
    Data(usize),
    /// Nothing queued
    Empty,
    /// Nothing queued and the stream reported that no data is arriving
    NoData,
}
