//! Application side of an AVB video stream
//!
//! A local stream owns the ring buffer shared with the application and
//! tracks which network stream, if any, is attached to it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::buffer::{LocalVideoBuffer, ReadStatus, SharedVideoBuffer, VideoDesc, VideoUnit, WriteStatus};
use crate::error::{BufferError, Error, Result, StreamError};
use crate::packet::avtp::{read_u16, read_u32, RTP_HEADER_SIZE};
use crate::packet::{PacketPool, StreamId};

/// Largest payload a local video stream accepts
pub const MAX_LOCAL_PACKET_SIZE: usize = 1500;

const RTP_VERSION_2: u8 = 0x80;

/// Direction of media flow relative to the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    TransmitToNetwork,
    ReceiveFromNetwork,
}

/// Payload format carried by a video stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VideoFormat {
    /// H.264 in RTP payload format
    Rtp,
    /// MPEG-TS over IEC 61883-4
    Iec61883,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClientState {
    NotConnected,
    Idle,
    Active,
}

#[derive(Debug)]
struct Connection {
    state: ClientState,
    client: Option<StreamId>,
}

/// Application endpoint of a video stream
pub struct LocalVideoStream {
    id: u16,
    direction: Direction,
    format: VideoFormat,
    max_packet_rate: u32,
    max_packet_size: usize,
    buffer: SharedVideoBuffer,
    connection: Mutex<Connection>,
}

impl LocalVideoStream {
    /// Create a local stream with a ring buffer of `num_packets` slots
    ///
    /// Receive streams use internal buffers so the application gets
    /// copies; transmit streams write straight into the AVB stream's
    /// packet pool once connected.
    pub fn new(
        id: u16,
        direction: Direction,
        format: VideoFormat,
        num_packets: usize,
        max_packet_rate: u32,
        max_packet_size: usize,
    ) -> Result<Self> {
        if max_packet_rate == 0 || max_packet_size == 0 || max_packet_size > MAX_LOCAL_PACKET_SIZE {
            return Err(StreamError::InvalidParam(format!(
                "rate {} size {}",
                max_packet_rate, max_packet_size
            ))
            .into());
        }

        let internal = direction == Direction::ReceiveFromNetwork;
        // received H.264 units carry a rebuilt RTP header
        let slot_size = if internal && format == VideoFormat::Rtp {
            max_packet_size + RTP_HEADER_SIZE
        } else {
            max_packet_size
        };
        let buffer = LocalVideoBuffer::new(num_packets, slot_size, internal)?;

        tracing::info!(id, ?direction, ?format, num_packets, max_packet_size, "Creating local video stream");

        Ok(Self {
            id,
            direction,
            format,
            max_packet_rate,
            max_packet_size,
            buffer: Arc::new(buffer),
            connection: Mutex::new(Connection {
                state: ClientState::NotConnected,
                client: None,
            }),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn format(&self) -> VideoFormat {
        self.format
    }

    pub fn max_packet_rate(&self) -> u32 {
        self.max_packet_rate
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    pub fn buffer(&self) -> &SharedVideoBuffer {
        &self.buffer
    }

    /// Attach an AVB stream
    pub fn connect(&self, client: StreamId) -> std::result::Result<(), StreamError> {
        let mut conn = self.connection.lock();
        if let Some(existing) = conn.client {
            tracing::warn!(local = self.id, %existing, requested = %client, "Local stream already in use");
            return Err(StreamError::AlreadyInUse);
        }
        conn.client = Some(client);
        conn.state = ClientState::Idle;
        tracing::info!(local = self.id, stream_id = %client, "Local stream connected");
        Ok(())
    }

    /// Detach the AVB stream, returning all queued packets to its pool
    pub fn disconnect(&self) {
        let mut conn = self.connection.lock();
        self.buffer.set_packet_pool(None);
        self.buffer.reset(0);
        if let Some(client) = conn.client.take() {
            tracing::info!(local = self.id, stream_id = %client, "Local stream disconnected");
        }
        conn.state = ClientState::NotConnected;
    }

    pub fn is_connected(&self) -> bool {
        self.connection.lock().client.is_some()
    }

    pub fn client(&self) -> Option<StreamId> {
        self.connection.lock().client
    }

    pub fn client_state(&self) -> ClientState {
        self.connection.lock().state
    }

    /// Activation resets the buffer so stale data is not sent or delivered
    pub fn set_client_active(&self, active: bool) {
        let mut conn = self.connection.lock();
        if conn.client.is_none() {
            return;
        }
        if active {
            if conn.state != ClientState::Active {
                conn.state = ClientState::Active;
                self.buffer.reset(0);
            }
        } else {
            conn.state = ClientState::Idle;
        }
    }

    pub(crate) fn set_packet_pool(&self, pool: Option<PacketPool>) {
        self.buffer.set_packet_pool(pool);
    }

    /// Queue an RTP packet carrying H.264 for transmission
    ///
    /// The 12-byte RTP header is consumed here; sequence number,
    /// timestamp and marker travel with the descriptor.
    pub fn write_rtp(&self, rtp_packet: &[u8]) -> Result<WriteStatus> {
        self.expect_direction(Direction::TransmitToNetwork)?;
        if self.format != VideoFormat::Rtp {
            return Err(StreamError::Mismatch("RTP write to an MPEG-TS stream".into()).into());
        }
        if rtp_packet.len() <= RTP_HEADER_SIZE {
            return Err(BufferError::InvalidPayloadSize {
                size: rtp_packet.len().saturating_sub(RTP_HEADER_SIZE),
                max: self.max_packet_size,
            }
            .into());
        }

        let mpt_field = rtp_packet[1];
        let unit = VideoUnit {
            data: &rtp_packet[RTP_HEADER_SIZE..],
            rtp_sequence: read_u16(rtp_packet, 2),
            rtp_timestamp: read_u32(rtp_packet, 4),
            mpt_field,
            ..VideoUnit::default()
        };
        Ok(self.buffer.write(&unit)?)
    }

    /// Queue MPEG-TS packets for transmission
    pub fn write_mpeg_ts(&self, data: &[u8], has_sph: bool, sequence: u16) -> Result<WriteStatus> {
        self.expect_direction(Direction::TransmitToNetwork)?;
        if self.format != VideoFormat::Iec61883 {
            return Err(StreamError::Mismatch("MPEG-TS write to an RTP stream".into()).into());
        }
        Ok(self.buffer.write(&VideoUnit::mpeg_ts(data, has_sph, sequence))?)
    }

    /// Take the next received unit
    ///
    /// H.264 units arrive as complete RTP packets, MPEG-TS units as
    /// source packets with their headers.
    pub fn read(&self, dest: &mut [u8], desc: &mut VideoDesc) -> Result<ReadStatus> {
        self.expect_direction(Direction::ReceiveFromNetwork)?;
        Ok(self.buffer.read(dest, desc)?)
    }

    pub fn read_timeout(&self, dest: &mut [u8], desc: &mut VideoDesc, timeout: Duration) -> Result<ReadStatus> {
        self.expect_direction(Direction::ReceiveFromNetwork)?;
        Ok(self.buffer.read_timeout(dest, desc, timeout)?)
    }

    /// Next descriptor for the transmit engine; the packet moves into `desc`
    pub(crate) fn pop_for_transmit(&self, desc: &mut VideoDesc) -> ReadStatus {
        match self.buffer.read(&mut [], desc) {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(local = self.id, "Transmit read failed: {}", e);
                ReadStatus::Empty
            }
        }
    }

    /// Hand a received unit to the application
    ///
    /// A full ring is a status; a unit the ring cannot hold is an error.
    pub(crate) fn push_received(&self, unit: &VideoUnit<'_>) -> std::result::Result<WriteStatus, BufferError> {
        self.buffer.write(unit)
    }

    pub(crate) fn signal_no_data(&self) {
        self.buffer.mark_no_data();
    }

    fn expect_direction(&self, direction: Direction) -> std::result::Result<(), Error> {
        if self.direction != direction {
            let name = match direction {
                Direction::TransmitToNetwork => "transmit",
                Direction::ReceiveFromNetwork => "receive",
            };
            return Err(StreamError::WrongDirection(name).into());
        }
        Ok(())
    }
}

impl Drop for LocalVideoStream {
    fn drop(&mut self) {
        if self.is_connected() {
            self.disconnect();
        }
    }
}

impl std::fmt::Debug for LocalVideoStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalVideoStream")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("format", &self.format)
            .field("client_state", &self.client_state())
            .finish_non_exhaustive()
    }
}

/// Rebuild the 12-byte RTP header of a received H.264 unit
pub(crate) fn rtp_header(mpt_field: u8, sequence: u16, timestamp: u32, ssrc: u32) -> [u8; RTP_HEADER_SIZE] {
    let mut header = [0u8; RTP_HEADER_SIZE];
    header[0] = RTP_VERSION_2;
    header[1] = mpt_field;
    header[2..4].copy_from_slice(&sequence.to_be_bytes());
    header[4..8].copy_from_slice(&timestamp.to_be_bytes());
    header[8..12].copy_from_slice(&ssrc.to_be_bytes());
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtp_packet(seq: u16, ts: u32, marker: bool, payload: &[u8]) -> Vec<u8> {
        let mpt = if marker { 0xE0 } else { 0x60 };
        let mut packet = rtp_header(mpt, seq, ts, 0x1234_5678).to_vec();
        packet.extend_from_slice(payload);
        packet
    }

    #[test]
    fn test_geometry_validation() {
        assert!(LocalVideoStream::new(1, Direction::TransmitToNetwork, VideoFormat::Rtp, 8, 0, 1000).is_err());
        assert!(LocalVideoStream::new(1, Direction::TransmitToNetwork, VideoFormat::Rtp, 8, 100, 1501).is_err());
        assert!(LocalVideoStream::new(1, Direction::TransmitToNetwork, VideoFormat::Rtp, 1, 100, 1000).is_err());
        assert!(LocalVideoStream::new(1, Direction::TransmitToNetwork, VideoFormat::Rtp, 8, 100, 1000).is_ok());
    }

    #[test]
    fn test_connect_states() {
        let local = LocalVideoStream::new(1, Direction::TransmitToNetwork, VideoFormat::Rtp, 8, 4000, 1000).unwrap();
        assert_eq!(local.client_state(), ClientState::NotConnected);

        // no client: activation is ignored
        local.set_client_active(true);
        assert_eq!(local.client_state(), ClientState::NotConnected);

        local.connect(StreamId(1)).unwrap();
        assert_eq!(local.client_state(), ClientState::Idle);
        assert_eq!(local.connect(StreamId(2)), Err(StreamError::AlreadyInUse));

        local.set_client_active(true);
        assert_eq!(local.client_state(), ClientState::Active);
        local.set_client_active(false);
        assert_eq!(local.client_state(), ClientState::Idle);

        local.disconnect();
        assert_eq!(local.client_state(), ClientState::NotConnected);
        assert!(local.connect(StreamId(2)).is_ok());
    }

    #[test]
    fn test_direction_checks() {
        let tx = LocalVideoStream::new(1, Direction::TransmitToNetwork, VideoFormat::Rtp, 8, 4000, 1000).unwrap();
        let mut desc = VideoDesc::default();
        assert!(matches!(
            tx.read(&mut [0u8; 16], &mut desc),
            Err(Error::Stream(StreamError::WrongDirection("receive")))
        ));
        assert!(matches!(
            tx.write_mpeg_ts(&[0u8; 188], false, 1),
            Err(Error::Stream(StreamError::Mismatch(_)))
        ));

        let rx = LocalVideoStream::new(2, Direction::ReceiveFromNetwork, VideoFormat::Rtp, 8, 4000, 1000).unwrap();
        assert!(matches!(
            rx.write_rtp(&rtp_packet(1, 0, false, &[1, 2, 3])),
            Err(Error::Stream(StreamError::WrongDirection("transmit")))
        ));
    }

    #[test]
    fn test_write_rtp_strips_header() {
        let local = LocalVideoStream::new(1, Direction::TransmitToNetwork, VideoFormat::Rtp, 8, 4000, 1000).unwrap();
        let pool = PacketPool::new(1100, 4).unwrap();
        local.connect(StreamId(1)).unwrap();
        local.set_packet_pool(Some(pool.clone()));

        let status = local.write_rtp(&rtp_packet(7, 0xAABB_CCDD, true, &[9u8; 100])).unwrap();
        assert_eq!(status, WriteStatus::Written(100));

        let mut desc = VideoDesc::default();
        assert_eq!(local.pop_for_transmit(&mut desc), ReadStatus::Data(100));
        assert_eq!(desc.rtp_sequence, 7);
        assert_eq!(desc.rtp_timestamp, 0xAABB_CCDD);
        assert!(desc.marker());
        assert_eq!(desc.packet.as_ref().map(|p| p.payload().len()), Some(100));
    }

    #[test]
    fn test_rtp_header_too_short() {
        let local = LocalVideoStream::new(1, Direction::TransmitToNetwork, VideoFormat::Rtp, 8, 4000, 1000).unwrap();
        assert!(matches!(
            local.write_rtp(&[0u8; RTP_HEADER_SIZE]),
            Err(Error::Buffer(BufferError::InvalidPayloadSize { .. }))
        ));
    }

    #[test]
    fn test_disconnect_returns_packets() {
        let local = LocalVideoStream::new(1, Direction::TransmitToNetwork, VideoFormat::Rtp, 8, 4000, 1000).unwrap();
        let pool = PacketPool::new(1100, 4).unwrap();
        local.connect(StreamId(1)).unwrap();
        local.set_packet_pool(Some(pool.clone()));

        for seq in 1..=3 {
            local.write_rtp(&rtp_packet(seq, 0, false, &[0u8; 10])).unwrap();
        }
        assert_eq!(pool.free_count(), 1);

        local.disconnect();
        assert_eq!(pool.free_count(), 4);
        assert!(!local.buffer().has_packet_pool());
    }

    #[test]
    fn test_receive_side_round_trip() {
        let local = LocalVideoStream::new(2, Direction::ReceiveFromNetwork, VideoFormat::Rtp, 8, 4000, 100).unwrap();
        let packet = rtp_packet(3, 99, false, &[5u8; 100]);
        let unit = VideoUnit {
            data: &packet,
            rtp_sequence: 3,
            rtp_timestamp: 99,
            mpt_field: 0x60,
            ..VideoUnit::default()
        };
        assert_eq!(local.push_received(&unit), Ok(WriteStatus::Written(112)));

        let mut dest = [0u8; 200];
        let mut desc = VideoDesc::default();
        assert_eq!(local.read(&mut dest, &mut desc).unwrap(), ReadStatus::Data(112));
        assert_eq!(&dest[..112], packet.as_slice());

        local.signal_no_data();
        assert_eq!(local.read(&mut dest, &mut desc).unwrap(), ReadStatus::NoData);
    }

    #[test]
    fn test_oversized_received_unit_rejected() {
        let local = LocalVideoStream::new(2, Direction::ReceiveFromNetwork, VideoFormat::Rtp, 8, 4000, 100).unwrap();
        let packet = rtp_packet(3, 99, false, &[5u8; 101]);
        let unit = VideoUnit {
            data: &packet,
            rtp_sequence: 3,
            ..VideoUnit::default()
        };
        assert!(matches!(
            local.push_received(&unit),
            Err(BufferError::InvalidPayloadSize { size: 113, max: 112 })
        ));
        assert_eq!(local.buffer().fill_level(), 0);
    }
}
