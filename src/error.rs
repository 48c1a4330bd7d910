//! Error types for the AVB video transport core
//!
//! Flow-control conditions (pool exhausted, buffer full/empty) are not
//! errors and never show up here; they are reported through `Option`
//! and status enums by the components themselves.

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Packet pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Clock error: {0}")]
    Clock(#[from] ClockError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Packet pool errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("Invalid packet size: {0} bytes")]
    InvalidPacketSize(usize),

    #[error("Invalid pool size: {0} packets")]
    InvalidPoolSize(usize),

    #[error("Packet returned to a pool it does not belong to")]
    ForeignPacket,

    #[error("Template packet is empty")]
    EmptyTemplate,

    #[error("Template length {len} exceeds packet size {packet_size}")]
    TemplateTooLarge { len: usize, packet_size: usize },

    #[error("{0} packets still outstanding")]
    Outstanding(usize),
}

/// Local ring buffer errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BufferError {
    #[error("Invalid buffer geometry: {num_packets} packets of {max_packet_size} bytes")]
    InvalidGeometry {
        num_packets: usize,
        max_packet_size: usize,
    },

    #[error("Payload size {size} outside 1..={max}")]
    InvalidPayloadSize { size: usize, max: usize },

    #[error("Payload of {size} bytes is not a whole number of {unit}-byte transport packets")]
    PartialTransportPacket { size: usize, unit: usize },

    #[error("Payload of {needed} bytes does not fit packet headroom of {headroom} bytes")]
    NoHeadroom { needed: usize, headroom: usize },

    #[error("No packet pool attached")]
    NoPool,

    #[error("Destination buffer too small: need {needed}, have {have}")]
    DestinationTooSmall { needed: usize, have: usize },
}

/// Clock synchronization errors
#[derive(Error, Debug)]
pub enum ClockError {
    #[error("Counter frequency could not be detected: {0}")]
    FrequencyDetection(String),

    #[error("Cross-timestamp failed: {0}")]
    CrossTimestamp(String),

    #[error("Clock read failed: {0}")]
    ClockRead(String),

    #[error("Invalid clock parameter: {0}")]
    InvalidParam(String),
}

/// Stream engine errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum StreamError {
    #[error("Stream initialization failed: {0}")]
    InitializationFailed(&'static str),

    #[error("Invalid stream parameter: {0}")]
    InvalidParam(String),

    #[error("Local stream already connected to another AVB stream")]
    AlreadyInUse,

    #[error("Local stream does not match: {0}")]
    Mismatch(String),

    #[error("Operation requires a {0} stream")]
    WrongDirection(&'static str),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
