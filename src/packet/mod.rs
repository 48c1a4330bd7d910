//! Network packets: the pre-allocated pool and the AVTP wire layout

pub mod avtp;
pub mod pool;

pub use avtp::{MacAddress, StreamId};
pub use pool::{Packet, PacketPool, PoolStats};
