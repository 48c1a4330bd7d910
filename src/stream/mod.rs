//! AVB video streams: traffic specs, the application endpoint, the AVTP
//! engine and the transmit worker

pub mod local;
pub mod tspec;
pub mod video;
pub mod worker;

use std::sync::Arc;

pub use local::{ClientState, Direction, LocalVideoStream, VideoFormat};
pub use tspec::{SrClass, SrClassParams, TSpec};
pub use video::{
    AvbVideoStream, Compatibility, ReceiveParams, StreamDiagnostics, StreamState, TransmitParams,
    ValidationConfig, ValidationMode,
};
pub use worker::{ChannelSink, PacketSink, TransmitWorker};

use crate::clock::NetworkTime;
use crate::config::ConfigRegistry;
use crate::packet::MacAddress;

/// The network port a stream is bound to
pub trait NetworkInterface: Send + Sync {
    /// MAC address used as the source of every transmitted frame
    fn source_mac(&self) -> Option<MacAddress>;
}

impl NetworkInterface for MacAddress {
    fn source_mac(&self) -> Option<MacAddress> {
        Some(*self)
    }
}

/// Shared collaborators handed to every stream at creation
#[derive(Clone)]
pub struct StreamEnvironment {
    pub clock: Arc<dyn NetworkTime>,
    pub interface: Arc<dyn NetworkInterface>,
    pub config: Arc<ConfigRegistry>,
}

impl StreamEnvironment {
    pub fn new(
        clock: Arc<dyn NetworkTime>,
        interface: Arc<dyn NetworkInterface>,
        config: Arc<ConfigRegistry>,
    ) -> Self {
        Self {
            clock,
            interface,
            config,
        }
    }
}

impl std::fmt::Debug for StreamEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEnvironment")
            .field("source_mac", &self.interface.source_mac())
            .field("config_keys", &self.config.len())
            .finish_non_exhaustive()
    }
}
