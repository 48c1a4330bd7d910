//! # AVB Video Transport
//!
//! Real-time data path for H.264 and MPEG-TS video over AVTP (IEEE 1722).
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── TALKER ─────────────────────────────────┐
//! │  ┌─────────────┐  write_rtp /   ┌──────────────────────────────────┐    │
//! │  │ Application │  write_mpeg_ts │ LocalVideoStream (stream::local) │    │
//! │  └─────────────┘ ─────────────▶ │  ring of descriptors, payload    │    │
//! │                                 │  written into pool packets       │    │
//! │                                 └────────────────┬─────────────────┘    │
//! │  ┌──────────────────────┐                        │ descriptor + Packet   │
//! │  │ PacketPool           │ ◀── acquire ───────────┤                       │
//! │  │ (packet::pool)       │                        ▼                       │
//! │  └──────────────────────┘       ┌──────────────────────────────────┐    │
//! │  ┌──────────────────────┐       │ AvbVideoStream (stream::video)   │    │
//! │  │ ClockSyncEngine      │ ────▶ │  header finalize, launch time,   │    │
//! │  │ ClockDomain (clock)  │       │  TU bit, dummy packets           │    │
//! │  └──────────────────────┘       └────────────────┬─────────────────┘    │
//! │                                 ┌────────────────▼─────────────────┐    │
//! │                                 │ TransmitWorker → PacketSink      │    │
//! │                                 └────────────────┬─────────────────┘    │
//! └──────────────────────────────────────────────────┼──────────────────────┘
//!                                                    │ AVTP over VLAN
//! ┌─────────────────────────────── LISTENER ─────────┼──────────────────────┐
//! │                                 ┌────────────────▼─────────────────┐    │
//! │                                 │ AvbVideoStream::dispatch_packet  │    │
//! │                                 │  validation, sequence tracking   │    │
//! │                                 └────────────────┬─────────────────┘    │
//! │  ┌─────────────┐     read       ┌────────────────▼─────────────────┐    │
//! │  │ Application │ ◀───────────── │ LocalVideoStream (internal bufs) │    │
//! │  └─────────────┘  RTP / MPEG-TS └──────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod buffer;
pub mod clock;
pub mod config;
pub mod error;
pub mod packet;
pub mod stream;

pub use error::{Error, Result};

/// Wire and timing constants
pub mod constants {
    /// Ethernet header with 802.1Q tag
    pub const ETH_HEADER_SIZE: usize = crate::packet::avtp::ETH_HEADER_SIZE;

    /// Common AVTP stream header
    pub const AVTP_HEADER_SIZE: usize = crate::packet::avtp::AVTP_HEADER_SIZE;

    /// Largest payload a local video stream accepts
    pub const MAX_LOCAL_PACKET_SIZE: usize = crate::stream::local::MAX_LOCAL_PACKET_SIZE;

    /// Default number of descriptors in a local stream's ring
    pub const DEFAULT_RING_SIZE: usize = 64;

    /// Default number of packets in a talker's pool
    pub const DEFAULT_POOL_SIZE: usize = 256;

    /// Receive tick after which a listener reports that no data arrived
    pub const RECEIVE_TIMEOUT_MS: u64 = 10;
}
