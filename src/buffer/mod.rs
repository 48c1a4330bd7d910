//! Local video buffering between applications and AVB streams

pub mod descriptor;
pub mod ring;

pub use descriptor::{ReadStatus, VideoDesc, VideoUnit, WriteStatus};
pub use ring::{BufferStats, LocalVideoBuffer, SharedVideoBuffer};
