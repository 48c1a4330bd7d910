//! Time sources consumed by the clock synchronization engine
//!
//! Hardware access sits behind small traits so the engine can run
//! against a NIC with a cross-timestamp latch, against plain system
//! clocks, or against simulated clocks in tests.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::clock::sync::ClockSyncConfig;
use crate::error::ClockError;

/// Monotonic local counter, in nanoseconds
pub trait HardwareCounter: Send + Sync {
    fn now(&self) -> u64;
}

/// Free-running tick counter behind the raw clock domain
pub trait TickCounter: Send + Sync {
    fn ticks(&self) -> u64;

    /// Tick rate in Hz when the counter knows it
    fn nominal_frequency(&self) -> Option<u64> {
        None
    }
}

/// Network (PTP) clock read through the operating system
pub trait NetworkClock: Send + Sync {
    fn now(&self) -> Result<u64, ClockError>;
}

/// One bracketed reading of the network clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrossSample {
    /// Local time read just before latching
    pub before: u64,
    /// Local time read just after latching
    pub after: u64,
    /// Latched network time
    pub network_time: u64,
}

impl CrossSample {
    /// Measurement uncertainty
    pub fn interval(&self) -> u64 {
        self.after.saturating_sub(self.before)
    }

    /// Local time assigned to the latched network time
    pub fn midpoint(&self) -> u64 {
        (self.before >> 1) + (self.after >> 1)
    }
}

/// Device able to latch its network clock between two local reads
///
/// Implementations hold the device's exclusive hardware lock for the
/// duration of one call, calling `local` immediately before and after
/// triggering the latch.
pub trait CrossTimestamper: Send + Sync {
    fn cross_timestamp(&self, local: &dyn Fn() -> u64) -> Result<CrossSample, ClockError>;
}

/// Handles to every time source the engine reads
#[derive(Clone)]
pub struct ClockSources {
    pub counter: Arc<dyn HardwareCounter>,
    pub ticks: Arc<dyn TickCounter>,
    pub network: Arc<dyn NetworkClock>,
    pub cross_timestamper: Option<Arc<dyn CrossTimestamper>>,
}

impl ClockSources {
    /// Plain operating-system clocks, no cross-timestamp device
    pub fn system() -> Self {
        let counter = Arc::new(MonotonicCounter::new());
        Self {
            ticks: counter.clone(),
            counter,
            network: Arc::new(SystemNetworkClock),
            cross_timestamper: None,
        }
    }

    /// System clocks with the CPU time-stamp counter behind the raw domain
    ///
    /// The TSC reports no frequency of its own, so the engine takes it
    /// from `clockdomain.raw.tscfreq` or detects it.
    #[cfg(target_arch = "x86_64")]
    pub fn with_tsc() -> Self {
        Self {
            ticks: Arc::new(Tsc),
            ..Self::system()
        }
    }

    /// Sources matching an engine configuration
    ///
    /// A configured tick frequency or raw cross-timestamping selects the
    /// TSC where one exists; otherwise raw time follows the system counter.
    #[cfg(target_arch = "x86_64")]
    pub fn for_config(config: &ClockSyncConfig) -> Self {
        if config.tick_frequency.is_some() || config.raw_xtstamp.is_enabled() {
            Self::with_tsc()
        } else {
            Self::system()
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn for_config(_config: &ClockSyncConfig) -> Self {
        Self::system()
    }
}

/// Monotonic nanosecond counter based on [`Instant`]
#[derive(Debug, Clone, Copy)]
pub struct MonotonicCounter {
    origin: Instant,
}

impl MonotonicCounter {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareCounter for MonotonicCounter {
    fn now(&self) -> u64 {
        // never report zero, which marks an unset sample
        self.origin.elapsed().as_nanos() as u64 + 1
    }
}

impl TickCounter for MonotonicCounter {
    fn ticks(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn nominal_frequency(&self) -> Option<u64> {
        Some(1_000_000_000)
    }
}

/// Time-stamp counter of the executing CPU
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Clone, Copy, Default)]
pub struct Tsc;

#[cfg(target_arch = "x86_64")]
impl TickCounter for Tsc {
    fn ticks(&self) -> u64 {
        // SAFETY: RDTSC is available on every x86_64 CPU and has no side effects
        unsafe { core::arch::x86_64::_rdtsc() }
    }
}

/// System real-time clock standing in for a PTP hardware clock
///
/// Suitable when the system clock is disciplined to PTP time by an
/// external service.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemNetworkClock;

impl NetworkClock for SystemNetworkClock {
    fn now(&self) -> Result<u64, ClockError> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .map_err(|e| ClockError::ClockRead(e.to_string()))
    }
}
