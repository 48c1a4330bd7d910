//! Clock domains and their lock state
//!
//! A clock domain tracks the rate ratio of some media clock against
//! network time. Incoming ratio measurements are smoothed by two
//! exponential filters: a fast one that follows the measurements and a
//! slow one that forms the long-term reference. The domain counts as
//! locked while the fast ratio stays within a ppm band around the slow
//! one.

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::{keys, ConfigRegistry};
use crate::error::ClockError;

/// Lock thresholds of the built-in PTP and raw domains
const BUILTIN_LOCK_THRESHOLD_PPM: u32 = 100_000;

/// Event clock granularity, an exact multiple of the 48 kHz period
const EVENT_GRANULARITY_NS: u64 = 125_000;

const DEFAULT_EVENT_RATE: u32 = 48_000;

/// Measurements outside this range are discarded
const RATIO_SANITY_MAX: f64 = 10.0;

const MAX_DRIFT_PPM: i32 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClockDomainKind {
    /// Network time itself
    Ptp,
    /// Raw tick counter of the local CPU
    Raw,
    /// Recovered from a received stream or a local device
    Derived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum LockState {
    Init,
    Unlocked,
    Locking,
    Locked,
}

#[derive(Debug, Clone, Copy)]
struct Filter {
    fast_locked: f64,
    fast_unlocked: f64,
    slow_locked: f64,
    slow_unlocked: f64,
}

#[derive(Debug)]
struct DomainState {
    lock_state: LockState,
    rate_ratio: f64,
    compensation: f64,
    slow: f64,
    fast: f64,
    initial_value: f64,
    time_constant: f64,
    calls_per_sec: u32,
    derivation_unlock: f64,
    derivation_long_term: f64,
    filter: Filter,
    fast_low: f64,
    fast_high: f64,
    slow_low: f64,
    slow_high: f64,
    unlock_count: u64,
    event_rate: u32,
    event_count: u64,
    event_timestamp: u64,
    event_start: u64,
    event_last_update: u64,
}

impl DomainState {
    fn apply_filter(&mut self) {
        let tc = self.time_constant * f64::from(self.calls_per_sec);
        self.filter = Filter {
            fast_locked: coefficient(tc),
            fast_unlocked: coefficient(tc * self.derivation_unlock),
            slow_locked: coefficient(tc * self.derivation_long_term),
            slow_unlocked: coefficient(tc * self.derivation_long_term * self.derivation_unlock),
        };
    }
}

fn coefficient(time_constant: f64) -> f64 {
    if time_constant == 0.0 {
        0.0
    } else {
        (-1.0 / time_constant).exp()
    }
}

fn smooth(value: &mut f64, new: f64, coeff: f64) {
    *value = coeff * *value + (1.0 - coeff) * new;
}

/// Upper and lower bound of a ppm band around 1.0
fn threshold_band(ppm: u32) -> (f64, f64) {
    let high = 1.0 + 1e-6 * f64::from(ppm);
    (1.0 / high, high)
}

/// Snapshot of a clock domain
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ClockDomainStatus {
    pub kind: ClockDomainKind,
    pub lock_state: LockState,
    pub rate_ratio: f64,
    pub rate_ratio_fast: f64,
    pub rate_ratio_slow: f64,
    pub compensation: f64,
    pub unlock_count: u64,
}

/// Rate ratio tracking and lock detection of one clock
pub struct ClockDomain {
    kind: ClockDomainKind,
    state: Mutex<DomainState>,
}

impl ClockDomain {
    /// Unconfigured domain; thresholds and filter must be set before use
    pub fn new(kind: ClockDomainKind) -> Self {
        Self {
            kind,
            state: Mutex::new(DomainState {
                lock_state: LockState::Init,
                rate_ratio: 1.0,
                compensation: 1.0,
                slow: 1.0,
                fast: 1.0,
                initial_value: 1.0,
                time_constant: 0.0,
                calls_per_sec: 1,
                derivation_unlock: 1.0,
                derivation_long_term: 1.0,
                filter: Filter {
                    fast_locked: 0.0,
                    fast_unlocked: 0.0,
                    slow_locked: 0.0,
                    slow_unlocked: 0.0,
                },
                fast_low: 0.0,
                fast_high: 0.0,
                slow_low: 0.0,
                slow_high: 0.0,
                unlock_count: 0,
                event_rate: DEFAULT_EVENT_RATE,
                event_count: 0,
                event_timestamp: 0,
                event_start: 0,
                event_last_update: 0,
            }),
        }
    }

    /// Network time domain, locked from construction
    pub fn ptp() -> Self {
        Self::builtin(ClockDomainKind::Ptp)
    }

    /// Raw counter domain, locked from construction
    pub fn raw() -> Self {
        Self::builtin(ClockDomainKind::Raw)
    }

    fn builtin(kind: ClockDomainKind) -> Self {
        let domain = Self::new(kind);
        domain.set_initial_value(1.0);
        domain.set_lock_threshold_fast(BUILTIN_LOCK_THRESHOLD_PPM);
        domain.set_lock_threshold_slow(BUILTIN_LOCK_THRESHOLD_PPM);
        // first call initializes, second locks
        domain.update_rate_ratio(1.0);
        domain.update_rate_ratio(1.0);
        domain
    }

    pub fn kind(&self) -> ClockDomainKind {
        self.kind
    }

    /// Feed one rate ratio measurement
    pub fn update_rate_ratio(&self, ratio: f64) {
        if !(0.0..=RATIO_SANITY_MAX).contains(&ratio) {
            // seen around network epoch changes
            return;
        }

        let mut s = self.state.lock();
        let fast_ok = ratio < s.fast_high * s.fast && ratio > s.fast_low * s.fast;

        let filter = s.filter;
        let (slow_coeff, fast_coeff) = if s.lock_state == LockState::Locked {
            (filter.slow_locked, filter.fast_locked)
        } else {
            (filter.slow_unlocked, filter.fast_unlocked)
        };
        smooth(&mut s.slow, ratio, slow_coeff);
        smooth(&mut s.fast, ratio, fast_coeff);

        let max = s.slow_high * s.slow;
        let min = s.slow_low * s.slow;
        let slow_ok = s.fast < max && s.fast > min;

        let previous = s.lock_state;
        match s.lock_state {
            LockState::Init | LockState::Unlocked | LockState::Locking => {
                if s.lock_state == LockState::Init {
                    s.slow = s.initial_value;
                    s.fast = s.initial_value;
                }
                s.lock_state = if fast_ok && slow_ok {
                    LockState::Locked
                } else {
                    LockState::Locking
                };
            }
            LockState::Locked => {
                if !slow_ok {
                    s.lock_state = LockState::Unlocked;
                    s.unlock_count += 1;
                }
            }
        }

        if previous != s.lock_state {
            tracing::debug!(
                kind = ?self.kind,
                from = ?previous,
                to = ?s.lock_state,
                ratio,
                fast = s.fast,
                slow = s.slow,
                "Clock domain lock state changed"
            );
        }

        s.rate_ratio = s.fast.clamp(min, max.max(min)) * s.compensation;
    }

    pub fn rate_ratio(&self) -> f64 {
        self.state.lock().rate_ratio
    }

    pub fn lock_state(&self) -> LockState {
        self.state.lock().lock_state
    }

    pub fn is_locked(&self) -> bool {
        self.lock_state() == LockState::Locked
    }

    /// Set the filter time constant in seconds for the given update rate
    ///
    /// A locked domain drops back to unlocked.
    pub fn set_filter(&self, time_constant: f64, calls_per_sec: u32) {
        if time_constant < 0.0 {
            return;
        }
        let mut s = self.state.lock();
        s.time_constant = time_constant;
        s.calls_per_sec = calls_per_sec;
        s.apply_filter();
        tracing::debug!(
            kind = ?self.kind,
            time_constant,
            calls_per_sec,
            fast_locked = s.filter.fast_locked,
            slow_locked = s.filter.slow_locked,
            "Clock domain filter set"
        );
        if s.lock_state > LockState::Unlocked {
            s.lock_state = LockState::Unlocked;
        }
    }

    /// Scale the slow filter and the unlocked filters relative to the fast locked one
    pub fn set_derivation_factors(&self, long_term: f64, unlock: f64) {
        let (tc, calls) = {
            let mut s = self.state.lock();
            s.derivation_long_term = long_term;
            s.derivation_unlock = unlock;
            (s.time_constant, s.calls_per_sec)
        };
        self.set_filter(tc, calls);
    }

    pub fn set_lock_threshold_fast(&self, ppm: u32) {
        if ppm > 0 {
            let mut s = self.state.lock();
            (s.fast_low, s.fast_high) = threshold_band(ppm);
        }
    }

    pub fn set_lock_threshold_slow(&self, ppm: u32) {
        if ppm > 0 {
            let mut s = self.state.lock();
            (s.slow_low, s.slow_high) = threshold_band(ppm);
        }
    }

    /// Ratio both filters start from on the first measurement
    pub fn set_initial_value(&self, value: f64) {
        if value >= 0.0 {
            self.state.lock().initial_value = value;
        }
    }

    /// Bend the reported rate ratio by `ppm`
    ///
    /// Positive values slow the clock down, negative values speed it up.
    pub fn set_drift_compensation(&self, ppm: i32) -> Result<(), ClockError> {
        if !(-MAX_DRIFT_PPM..=MAX_DRIFT_PPM).contains(&ppm) {
            return Err(ClockError::InvalidParam(format!(
                "drift compensation {} ppm",
                ppm
            )));
        }
        let compensation = if ppm >= 0 {
            1.0 / (1.0 + f64::from(ppm) * 1e-6)
        } else {
            1.0 + f64::from(-ppm) * 1e-6
        };
        self.state.lock().compensation = compensation;
        Ok(())
    }

    pub fn set_event_rate(&self, rate: u32) {
        self.state.lock().event_rate = rate;
    }

    /// Advance the event counter to network time `now`
    ///
    /// Events are counted at the configured rate from the first call,
    /// in steps of 125 µs.
    pub fn advance_events(&self, now: u64) {
        let mut s = self.state.lock();
        if s.event_start == 0 {
            s.event_start = now - now % EVENT_GRANULARITY_NS;
        }
        if now.wrapping_sub(s.event_last_update) > EVENT_GRANULARITY_NS {
            s.event_last_update = now - now % EVENT_GRANULARITY_NS;
            let elapsed = s.event_last_update.saturating_sub(s.event_start);
            s.event_count =
                (u128::from(elapsed) * u128::from(s.event_rate) / 1_000_000_000) as u64;
            s.event_timestamp = s.event_last_update;
        }
    }

    /// Event count and the time it was taken at
    pub fn event_count(&self) -> (u64, u64) {
        let s = self.state.lock();
        (s.event_count, s.event_timestamp)
    }

    pub fn status(&self) -> ClockDomainStatus {
        let s = self.state.lock();
        ClockDomainStatus {
            kind: self.kind,
            lock_state: s.lock_state,
            rate_ratio: s.rate_ratio,
            rate_ratio_fast: s.fast,
            rate_ratio_slow: s.slow,
            compensation: s.compensation,
            unlock_count: s.unlock_count,
        }
    }
}

impl std::fmt::Debug for ClockDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.lock();
        f.debug_struct("ClockDomain")
            .field("kind", &self.kind)
            .field("lock_state", &s.lock_state)
            .field("rate_ratio", &s.rate_ratio)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PortState {
    Master,
    Slave,
    Other,
}

/// Port state as published by the PTP daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PtpPortStatus {
    pub port_state: PortState,
    pub pdelay_count: u32,
    pub sync_count: u32,
}

/// Exchange counts required before PTP time is trusted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PtpReadiness {
    pub pdelay_count: u32,
    pub sync_count: u32,
}

impl PtpReadiness {
    pub fn from_registry(registry: &ConfigRegistry) -> Self {
        let get = |key| {
            registry
                .get_u64(key)
                .map_or(0, |v| v.min(u64::from(u32::MAX)) as u32)
        };
        Self {
            pdelay_count: get(keys::PTP_PDELAY_COUNT),
            sync_count: get(keys::PTP_SYNC_COUNT),
        }
    }
}

impl PtpPortStatus {
    /// Master after enough peer delay exchanges, slave after enough syncs
    pub fn is_ready(&self, required: &PtpReadiness) -> bool {
        match self.port_state {
            PortState::Master => self.pdelay_count >= required.pdelay_count,
            PortState::Slave => self.sync_count >= required.sync_count,
            PortState::Other => false,
        }
    }
}
