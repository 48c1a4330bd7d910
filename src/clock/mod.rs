//! Network time and clock domains
//!
//! [`sync::ClockSyncEngine`] maps the local counter onto network time.
//! [`domain::ClockDomain`] tracks media clock rate ratios and lock state.

pub mod domain;
pub mod source;
pub mod sync;
pub mod tsc;

pub use domain::{ClockDomain, ClockDomainKind, LockState, PortState, PtpPortStatus, PtpReadiness};
pub use source::{ClockSources, CrossSample, CrossTimestamper, HardwareCounter, NetworkClock, TickCounter};
pub use sync::{ClockDiagnostics, ClockSyncConfig, ClockSyncEngine, ClockTime, RawXtstamp};

/// Source of current network time for stream engines
pub trait NetworkTime: Send + Sync {
    /// Cheap extrapolated reading
    fn approximate_time(&self) -> u64;

    /// Measured reading, refreshing the conversion state
    fn exact_time(&self) -> u64;
}
