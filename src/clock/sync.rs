//! Clock synchronization engine
//!
//! Keeps a continuously corrected mapping from the local monotonic
//! counter to network (PTP) time, and optionally a second mapping from
//! the raw tick counter to network time.
//!
//! Each mapping stores the last observed (local, network) pair and a
//! factor, network nanoseconds per local nanosecond:
//!
//! ```text
//! network(t) = last_network + (t - last_local) * factor
//! ```
//!
//! The factor is refreshed at most every [`UPDATE_THRESHOLD_NS`] from a
//! new measurement, blended in with a smoothing coefficient that starts
//! at 1.0 and decays by [`SMOOTH_STEP`] per update down to
//! [`SMOOTH_BOUND`]. Phase errors beyond [`EPOCH_CHANGE_THRESHOLD_NS`]
//! are treated as a discontinuity of the network time base.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::Serialize;

use crate::clock::source::{ClockSources, CrossSample, CrossTimestamper, HardwareCounter, NetworkClock, TickCounter};
use crate::clock::tsc::detect_tsc_frequency;
use crate::clock::NetworkTime;
use crate::config::{keys, ConfigRegistry};
use crate::error::ClockError;

/// Phase error that signals a network time discontinuity once converged
pub const EPOCH_CHANGE_THRESHOLD_NS: i64 = 2_000_000;

/// Minimum spacing of factor updates
pub const UPDATE_THRESHOLD_NS: u64 = 125_000_000;

pub const MAX_CROSS_TIMESTAMP_SAMPLES: u32 = 3;
pub const SYS_MEASUREMENT_THRESHOLD: u64 = 3000;
pub const RAW_MEASUREMENT_THRESHOLD: u64 = 3000;
pub const RAW_MEASUREMENT_THRESHOLD_REV2: u64 = 300;

/// Candidate raw factors collected before the median bootstrap
pub const RAW_INIT_FACTOR_SAMPLES: usize = 20;

pub const SMOOTH_BOUND: f64 = 0.1;
pub const SMOOTH_STEP: f64 = 0.99;

/// Factor change that is logged as a warning
pub const NORMAL_FACTOR_DEVIATION: f64 = 0.005;
pub const RAW_DEVIATION_REV2: f64 = 0.094e-6;

pub const DEFAULT_TOLERANCE: f64 = 0.5;

/// Dummy epoch so raw time is never zero right after start-up
pub const RAW_EPOCH_NS: u64 = 125_000;

/// Sample retries before an unreadable time is treated as an epoch change
const MAX_READ_ATTEMPTS: u32 = 3;

const UPDATES_PER_SECOND: u64 = 1_000_000_000 / UPDATE_THRESHOLD_NS;

/// Which raw cross-timestamp behavior is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RawXtstamp {
    Disabled,
    Rev1,
    /// Tighter thresholds, median bootstrap and factor reset on fail-safe
    Rev2,
}

impl RawXtstamp {
    fn from_value(value: i64) -> Self {
        match value {
            0 => RawXtstamp::Disabled,
            2 => RawXtstamp::Rev2,
            _ => RawXtstamp::Rev1,
        }
    }

    pub fn is_enabled(self) -> bool {
        self != RawXtstamp::Disabled
    }

    /// Consecutive hard-check rejections tolerated before accepting
    fn unlock_count_max(self) -> u64 {
        match self {
            RawXtstamp::Rev2 => UPDATES_PER_SECOND * 10,
            _ => UPDATES_PER_SECOND * 5,
        }
    }
}

/// Tunables of the engine
#[derive(Debug, Clone, Serialize)]
pub struct ClockSyncConfig {
    pub max_cross_timestamp_samples: u32,
    pub sys_threshold: u64,
    pub raw_xtstamp: RawXtstamp,
    pub raw_threshold: u64,
    /// Hard-check deviation of the raw factor; the check is off at [`NORMAL_FACTOR_DEVIATION`]
    pub raw_deviation: f64,
    pub raw_initial_factor: f64,
    pub tolerance: f64,
    pub raw_tolerance: f64,
    /// Raw tick frequency in Hz; detected when absent
    pub tick_frequency: Option<u64>,
}

impl Default for ClockSyncConfig {
    fn default() -> Self {
        Self {
            max_cross_timestamp_samples: MAX_CROSS_TIMESTAMP_SAMPLES,
            sys_threshold: SYS_MEASUREMENT_THRESHOLD,
            raw_xtstamp: RawXtstamp::Disabled,
            raw_threshold: RAW_MEASUREMENT_THRESHOLD,
            raw_deviation: NORMAL_FACTOR_DEVIATION,
            raw_initial_factor: 1.0,
            tolerance: DEFAULT_TOLERANCE,
            raw_tolerance: DEFAULT_TOLERANCE,
            tick_frequency: None,
        }
    }
}

impl ClockSyncConfig {
    pub fn from_registry(registry: &ConfigRegistry) -> Self {
        let mut config = Self::default();

        if let Some(samples) = registry.get_u64(keys::PTP_XTSTAMP_SAMPLES) {
            config.max_cross_timestamp_samples = samples.clamp(1, u64::from(u32::MAX)) as u32;
        }
        if let Some(threshold) = registry.get_u64(keys::PTP_XTSTAMP_THRESHOLD) {
            config.sys_threshold = threshold;
        }
        if let Some(hz) = registry.get_u64(keys::RAW_TSC_FREQ) {
            config.tick_frequency = Some(hz);
        }

        if let Some(mode) = registry.get_i64(keys::RAW_XTSTAMP) {
            config.raw_xtstamp = RawXtstamp::from_value(mode);
        }
        if config.raw_xtstamp == RawXtstamp::Rev2 {
            config.raw_threshold = RAW_MEASUREMENT_THRESHOLD_REV2;
            config.raw_deviation = RAW_DEVIATION_REV2;
        }
        if let Some(threshold) = registry.get_u64(keys::RAW_XTSTAMP_THRESHOLD) {
            config.raw_threshold = threshold;
        }
        if let Some(val) = registry.get_u64(keys::RAW_DEVIATION_UNLOCK) {
            config.raw_deviation = val as f64 * 1e-7;
        }
        if let Some(val) = registry.get_u64(keys::RAW_RATIO_PTP) {
            config.raw_initial_factor = val as f64 * 1e-7;
        }

        config
    }

    fn hard_raw_check(&self) -> bool {
        self.raw_deviation != NORMAL_FACTOR_DEVIATION
    }
}

/// Which time base a value is expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockTime {
    /// Local monotonic counter
    Counter,
    /// Network (PTP) time
    Network,
    /// Raw tick counter scaled to nanoseconds
    Raw,
}

/// Local-to-network mapping of one clock domain
#[derive(Debug, Clone, Copy)]
struct FactorTracker {
    last_local: u64,
    last_network: u64,
    factor: f64,
    coeff: f64,
}

impl FactorTracker {
    fn new() -> Self {
        Self {
            last_local: 0,
            last_network: 0,
            factor: 1.0,
            coeff: 1.0,
        }
    }

    fn restart(&mut self, local: u64, network: u64) {
        self.last_local = local;
        self.last_network = network;
        self.factor = 1.0;
        self.coeff = 1.0;
    }

    fn to_network(&self, local: u64) -> u64 {
        let delta = local.wrapping_sub(self.last_local) as i64;
        ((delta as f64 * self.factor) as i64 as u64).wrapping_add(self.last_network)
    }

    fn to_local(&self, network: u64) -> u64 {
        let delta = network.wrapping_sub(self.last_network) as i64;
        ((delta as f64 / self.factor) as i64 as u64).wrapping_add(self.last_local)
    }

    fn blend(&mut self, candidate: f64) {
        self.factor = self.coeff * candidate + (1.0 - self.coeff) * self.factor;
        if self.coeff > SMOOTH_BOUND {
            self.coeff *= SMOOTH_STEP;
        }
    }

    fn converged(&self) -> bool {
        self.coeff <= SMOOTH_BOUND
    }
}

fn within_tolerance(factor: f64, tolerance: f64) -> bool {
    factor >= 1.0 / (1.0 + tolerance) && factor <= 1.0 + tolerance
}

struct SyncState {
    sys: FactorTracker,
    raw: FactorTracker,
    raw_factors: Vec<f64>,
    raw_unlock_count: u64,
    epoch: u32,
    /// Running average of the network time delta between exact reads
    avg_delta: f64,
}

/// Cross-timestamp statistics
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CrossTimestampStats {
    pub attempts: u64,
    pub failures: u64,
    pub min_interval: u64,
    pub max_interval: u64,
    pub total_interval: u64,
}

impl CrossTimestampStats {
    fn record(&mut self, interval: u64, failed: bool) {
        if self.attempts == 0 || interval < self.min_interval {
            self.min_interval = interval;
        }
        self.max_interval = self.max_interval.max(interval);
        self.total_interval = self.total_interval.saturating_add(interval);
        self.attempts += 1;
        if failed {
            self.failures += 1;
        }
    }

    fn record_failure(&mut self) {
        self.attempts += 1;
        self.failures += 1;
    }

    /// Share of cross-timestamps within the accuracy threshold
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        (self.attempts - self.failures) as f64 / self.attempts as f64
    }

    pub fn average_interval(&self) -> u64 {
        self.total_interval.checked_div(self.attempts).unwrap_or(0)
    }
}

/// Engine state snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ClockDiagnostics {
    pub factor: f64,
    pub coeff: f64,
    pub epoch: u32,
    pub raw_factor: f64,
    pub raw_coeff: f64,
    pub raw_unlock_count: u64,
    pub system_xtstamp: CrossTimestampStats,
    pub raw_xtstamp: CrossTimestampStats,
    pub clock_read_failures: u64,
}

/// Counter-to-network time conversion engine
pub struct ClockSyncEngine {
    config: ClockSyncConfig,
    counter: Arc<dyn HardwareCounter>,
    ticks: Arc<dyn TickCounter>,
    network: Arc<dyn NetworkClock>,
    cross_timestamper: Option<Arc<dyn CrossTimestamper>>,
    tick_frequency: u64,
    tick_epoch: OnceLock<u64>,
    state: Mutex<SyncState>,
    /// Set while a refresh runs; approximate readers skip their own refresh
    updating: AtomicBool,
    /// Serializes refreshes, which use the exclusive cross-timestamp device
    refresh_lock: Mutex<()>,
    system_xtstamp: Mutex<CrossTimestampStats>,
    raw_xtstamp: Mutex<CrossTimestampStats>,
    clock_read_failures: AtomicU64,
}

/// Clears the single-flight flag on every exit path
struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ClockSyncEngine {
    /// Resolve the tick frequency and take the first time sample
    ///
    /// Fails when the tick frequency is neither configured, known by the
    /// counter, nor detectable, or when the network clock cannot be read.
    pub fn new(config: ClockSyncConfig, sources: ClockSources) -> Result<Self, ClockError> {
        let tick_frequency = match config
            .tick_frequency
            .or_else(|| sources.ticks.nominal_frequency())
        {
            Some(hz) => hz,
            None => detect_tsc_frequency()?,
        };
        if tick_frequency < 1000 {
            return Err(ClockError::InvalidParam(format!(
                "tick frequency {} Hz",
                tick_frequency
            )));
        }

        let mut raw = FactorTracker::new();
        raw.factor = config.raw_initial_factor;
        if config.raw_initial_factor != 1.0 {
            raw.coeff = SMOOTH_BOUND;
        }

        tracing::info!(
            tick_frequency,
            raw_xtstamp = ?config.raw_xtstamp,
            raw_deviation_ppm = config.raw_deviation * 1e6,
            raw_initial_factor = config.raw_initial_factor,
            "Creating clock sync engine"
        );

        let engine = Self {
            config,
            counter: sources.counter,
            ticks: sources.ticks,
            network: sources.network,
            cross_timestamper: sources.cross_timestamper,
            tick_frequency,
            tick_epoch: OnceLock::new(),
            state: Mutex::new(SyncState {
                sys: FactorTracker::new(),
                raw,
                raw_factors: Vec::with_capacity(RAW_INIT_FACTOR_SAMPLES),
                raw_unlock_count: 0,
                epoch: 0,
                avg_delta: UPDATE_THRESHOLD_NS as f64,
            }),
            updating: AtomicBool::new(false),
            refresh_lock: Mutex::new(()),
            system_xtstamp: Mutex::new(CrossTimestampStats::default()),
            raw_xtstamp: Mutex::new(CrossTimestampStats::default()),
            clock_read_failures: AtomicU64::new(0),
        };

        let counter = engine.counter.now();
        let raw_now = engine.raw_time();
        let now = engine.network.now()?;
        {
            let mut state = engine.state.lock();
            state.sys.restart(counter, now);
            state.raw.last_local = raw_now;
            state.raw.last_network = now;
        }

        Ok(engine)
    }

    pub fn config(&self) -> &ClockSyncConfig {
        &self.config
    }

    pub fn tick_frequency(&self) -> u64 {
        self.tick_frequency
    }

    /// Local counter reading
    pub fn counter_time(&self) -> u64 {
        self.counter.now()
    }

    /// Raw tick counter scaled to nanoseconds since first use
    pub fn raw_time(&self) -> u64 {
        let ticks = self.ticks.ticks();
        let epoch = *self.tick_epoch.get_or_init(|| ticks);
        let elapsed = ticks.wrapping_sub(epoch);
        (elapsed as f64 * (1e9 / self.tick_frequency as f64)) as u64 + RAW_EPOCH_NS
    }

    /// Fast network time estimate
    ///
    /// Extrapolates from the last sample. When the extrapolation reaches
    /// past the update threshold and no refresh is running, this call
    /// performs the exact refresh itself.
    pub fn approximate_time(&self) -> u64 {
        let now = self.counter.now();
        let sys = self.state.lock().sys;
        let delta = (now.wrapping_sub(sys.last_local) as i64 as f64 * sys.factor) as i64;

        if delta > UPDATE_THRESHOLD_NS as i64
            && self
                .updating
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            let _guard = RefreshGuard(&self.updating);
            let _device = self.refresh_lock.lock();
            return self.refresh(false);
        }

        (delta as u64).wrapping_add(sys.last_network)
    }

    /// Measure network time and refresh the conversion factors
    ///
    /// The factor is only recomputed when `force` is set or the last
    /// sample is older than the update threshold.
    pub fn exact_time(&self, force: bool) -> u64 {
        let _guard = self
            .updating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            .then(|| RefreshGuard(&self.updating));
        let _device = self.refresh_lock.lock();
        self.refresh(force)
    }

    fn refresh(&self, force: bool) -> u64 {
        let mut attempt = 1u32;

        let (counter, now, mut state) = loop {
            let Some((counter, now)) = self.sample_network_time() else {
                // clock unreadable: keep the old mapping for this cycle
                let counter = self.counter.now();
                return self.state.lock().sys.to_network(counter);
            };

            let mut state = self.state.lock();
            let last = state.sys;
            if last.last_network == 0 {
                break (counter, now, state);
            }

            let delta = now.wrapping_sub(last.last_network) as i64;
            if delta < 0 {
                tracing::info!(
                    attempt,
                    delta,
                    last = last.last_network,
                    now,
                    "Negative network time change"
                );
            } else {
                let predicted =
                    (counter.wrapping_sub(last.last_local) as i64 as f64 * last.factor) as i64;
                let phase_error = delta - predicted;
                if (last.converged() && phase_error.abs() > EPOCH_CHANGE_THRESHOLD_NS)
                    || phase_error.abs() > EPOCH_CHANGE_THRESHOLD_NS * 10
                {
                    state.epoch = state.epoch.wrapping_add(1);
                    state.sys.last_network = 0;
                    tracing::info!(
                        attempt,
                        phase_error,
                        epoch = state.epoch,
                        last = last.last_network,
                        now,
                        "Detected epoch change"
                    );
                    break (counter, now, state);
                }

                state.avg_delta = state.avg_delta * 0.9 + delta as f64 * 0.1;
                if delta != 0 {
                    break (counter, now, state);
                }
            }

            if attempt >= MAX_READ_ATTEMPTS {
                state.epoch = state.epoch.wrapping_add(1);
                state.sys.last_network = 0;
                tracing::info!(
                    attempts = attempt,
                    epoch = state.epoch,
                    "Unable to read reliable network time, assuming epoch change"
                );
            }
            attempt += 1;
        };

        if state.sys.last_network == 0 {
            state.sys.restart(counter, now);
            if self.config.raw_xtstamp.is_enabled() {
                self.restart_raw(&mut state, now);
            }
        } else if force || now.wrapping_sub(state.sys.last_network) > UPDATE_THRESHOLD_NS {
            self.update_factor(&mut state, counter, now);
            if self.config.raw_xtstamp.is_enabled() {
                self.update_raw_factor(&mut state);
            }
        }

        now
    }

    fn update_factor(&self, state: &mut SyncState, counter: u64, now: u64) {
        let sys = &mut state.sys;
        let dt = now.wrapping_sub(sys.last_network) as i64;
        let dcounter = counter.wrapping_sub(sys.last_local) as i64;

        if dcounter > 0 {
            let candidate = dt as f64 / dcounter as f64;
            if within_tolerance(candidate, self.config.tolerance) {
                let change = (candidate - sys.factor).abs();
                sys.blend(candidate);
                if change > NORMAL_FACTOR_DEVIATION {
                    tracing::warn!(dt, dcounter, candidate, factor = sys.factor, coeff = sys.coeff, "Factor update");
                } else {
                    tracing::debug!(dt, dcounter, candidate, factor = sys.factor, coeff = sys.coeff, "Factor update");
                }
            } else {
                tracing::warn!(candidate, "Time update: new factor out of range");
            }
        }

        sys.last_network = now;
        sys.last_local = counter;
    }

    fn restart_raw(&self, state: &mut SyncState, now: u64) {
        let (raw, network) = match self.cross_timestamp_raw() {
            Some(sample) => (sample.midpoint(), sample.network_time),
            None => {
                let before = self.raw_time();
                let read = self.network.now();
                let after = self.raw_time();
                let network = read.unwrap_or(now);
                ((before >> 1) + (after >> 1), network)
            }
        };
        state.raw.restart(raw, network);
        state.raw_factors.clear();
    }

    fn update_raw_factor(&self, state: &mut SyncState) {
        let Some(sample) = self.cross_timestamp_raw() else {
            // no precise sample: free-wheel with the current factor
            return;
        };
        let raw_now = sample.midpoint();
        let network_now = sample.network_time;

        let draw = raw_now.wrapping_sub(state.raw.last_local) as i64;
        let dnet = network_now.wrapping_sub(state.raw.last_network) as i64;
        if draw <= 0 {
            return;
        }
        let candidate = dnet as f64 / draw as f64;
        let deviation = (candidate - state.raw.factor).abs();
        let hard_check = self.config.hard_raw_check();
        let mode = self.config.raw_xtstamp;

        let mut accept = true;
        if hard_check && state.raw.converged() && deviation > self.config.raw_deviation {
            state.raw_unlock_count += 1;
            if state.raw_unlock_count < mode.unlock_count_max() {
                accept = false;
            } else {
                state.raw_unlock_count = 0;
                if mode == RawXtstamp::Rev2 {
                    tracing::warn!(candidate, factor = state.raw.factor, "Resetting raw factor");
                    state.raw.factor = 1.0;
                    state.raw.coeff = 1.0;
                    state.raw_factors.clear();
                }
            }
        }

        if accept && within_tolerance(candidate, self.config.raw_tolerance) {
            let bootstrapping = !state.raw.converged();
            state.raw.blend(candidate);

            if bootstrapping
                && mode == RawXtstamp::Rev2
                && state.raw_factors.len() < RAW_INIT_FACTOR_SAMPLES
            {
                state.raw_factors.push(candidate);
                if state.raw_factors.len() == RAW_INIT_FACTOR_SAMPLES {
                    state.raw_factors.sort_by(f64::total_cmp);
                    let mid = RAW_INIT_FACTOR_SAMPLES / 2;
                    state.raw.factor = (state.raw_factors[mid - 1] + state.raw_factors[mid]) / 2.0;
                    state.raw.coeff = SMOOTH_BOUND;
                    tracing::info!(factor = state.raw.factor, "Raw rate ratio smoothing stabilized");
                }
            }

            if deviation > self.config.raw_deviation && state.raw.converged() {
                tracing::warn!(draw, dnet, candidate, factor = state.raw.factor, "Raw factor update");
            } else {
                tracing::debug!(draw, dnet, candidate, factor = state.raw.factor, coeff = state.raw.coeff, "Raw factor update");
            }

            if hard_check {
                state.raw.last_local = raw_now;
                state.raw.last_network = network_now;
                state.raw_unlock_count = 0;
            }
        } else {
            tracing::debug!(candidate, accepted = accept, "Raw time update: factor rejected");
        }

        if !hard_check {
            state.raw.last_local = raw_now;
            state.raw.last_network = network_now;
        }
    }

    /// Read network time with the best available method
    ///
    /// Returns the local counter value the reading belongs to.
    fn sample_network_time(&self) -> Option<(u64, u64)> {
        if let Some(device) = &self.cross_timestamper {
            let counter = Arc::clone(&self.counter);
            let local = move || counter.now();
            match self.best_cross_timestamp(device.as_ref(), &local, self.config.sys_threshold) {
                Ok(sample) => {
                    self.system_xtstamp.lock().record(sample.interval(), false);
                    return Some((sample.midpoint(), sample.network_time));
                }
                Err(e) => {
                    self.system_xtstamp.lock().record_failure();
                    tracing::debug!("Cross-timestamp failed, falling back to clock read: {}", e);
                }
            }
        }

        let before = self.counter.now();
        let read = self.network.now();
        let after = self.counter.now();
        match read {
            Ok(now) => Some(((before >> 1) + (after >> 1), now)),
            Err(e) => {
                self.clock_read_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Failed to read network clock: {}", e);
                None
            }
        }
    }

    /// Cross-timestamp the raw domain; `None` when unavailable or imprecise
    fn cross_timestamp_raw(&self) -> Option<CrossSample> {
        let device = self.cross_timestamper.as_ref()?;
        let local = || self.raw_time();
        let threshold = self.config.raw_threshold;
        let result = self.best_cross_timestamp(device.as_ref(), &local, threshold);

        let mut stats = self.raw_xtstamp.lock();
        match result {
            Ok(sample) if sample.interval() <= threshold => {
                stats.record(sample.interval(), false);
                Some(sample)
            }
            Ok(sample) => {
                stats.record(sample.interval(), true);
                tracing::debug!(interval = sample.interval(), threshold, "Raw cross-timestamp imprecise");
                None
            }
            Err(e) => {
                stats.record_failure();
                tracing::debug!("Raw cross-timestamp failed: {}", e);
                None
            }
        }
    }

    /// Take up to N cross-timestamps and keep the tightest bracket
    ///
    /// Device errors use up a try; only a run where every try fails is
    /// an error.
    fn best_cross_timestamp(
        &self,
        device: &dyn CrossTimestamper,
        local: &dyn Fn() -> u64,
        threshold: u64,
    ) -> Result<CrossSample, ClockError> {
        let mut best: Option<CrossSample> = None;
        let mut last_error = None;

        for attempt in 1..=self.config.max_cross_timestamp_samples {
            let sample = match device.cross_timestamp(local) {
                Ok(sample) => sample,
                Err(e) => {
                    tracing::debug!(attempt, "Cross-timestamp attempt failed: {}", e);
                    last_error = Some(e);
                    continue;
                }
            };
            if best.map_or(true, |b| sample.interval() < b.interval()) {
                best = Some(sample);
                if sample.interval() <= threshold {
                    break;
                }
            }
        }

        best.ok_or_else(|| last_error.unwrap_or_else(|| ClockError::CrossTimestamp("no samples taken".into())))
    }

    /// Convert a timestamp between time bases using the stored mappings
    pub fn convert(&self, time: u64, from: ClockTime, to: ClockTime) -> u64 {
        if from == to {
            return time;
        }
        let (sys, raw) = {
            let state = self.state.lock();
            (state.sys, state.raw)
        };
        let network = match from {
            ClockTime::Network => time,
            ClockTime::Counter => sys.to_network(time),
            ClockTime::Raw => raw.to_network(time),
        };
        match to {
            ClockTime::Network => network,
            ClockTime::Counter => sys.to_local(network),
            ClockTime::Raw => raw.to_local(network),
        }
    }

    /// Counter to network time
    pub fn sys_to_network(&self, counter: u64) -> u64 {
        self.convert(counter, ClockTime::Counter, ClockTime::Network)
    }

    /// Network to counter time
    pub fn network_to_sys(&self, network: u64) -> u64 {
        self.convert(network, ClockTime::Network, ClockTime::Counter)
    }

    /// Raw to network time
    pub fn raw_to_network(&self, raw: u64) -> u64 {
        if !self.config.raw_xtstamp.is_enabled() {
            tracing::error!("Raw cross-timestamping is disabled, check '{}'", keys::RAW_XTSTAMP);
        }
        self.convert(raw, ClockTime::Raw, ClockTime::Network)
    }

    #[must_use]
    pub fn factor(&self) -> f64 {
        self.state.lock().sys.factor
    }

    #[must_use]
    pub fn coeff(&self) -> f64 {
        self.state.lock().sys.coeff
    }

    #[must_use]
    pub fn raw_factor(&self) -> f64 {
        self.state.lock().raw.factor
    }

    #[must_use]
    pub fn epoch(&self) -> u32 {
        self.state.lock().epoch
    }

    pub fn diagnostics(&self) -> ClockDiagnostics {
        let state = self.state.lock();
        ClockDiagnostics {
            factor: state.sys.factor,
            coeff: state.sys.coeff,
            epoch: state.epoch,
            raw_factor: state.raw.factor,
            raw_coeff: state.raw.coeff,
            raw_unlock_count: state.raw_unlock_count,
            system_xtstamp: *self.system_xtstamp.lock(),
            raw_xtstamp: *self.raw_xtstamp.lock(),
            clock_read_failures: self.clock_read_failures.load(Ordering::Relaxed),
        }
    }
}

impl NetworkTime for ClockSyncEngine {
    fn approximate_time(&self) -> u64 {
        ClockSyncEngine::approximate_time(self)
    }

    fn exact_time(&self) -> u64 {
        ClockSyncEngine::exact_time(self, false)
    }
}

impl std::fmt::Debug for ClockSyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ClockSyncEngine")
            .field("factor", &state.sys.factor)
            .field("coeff", &state.sys.coeff)
            .field("epoch", &state.epoch)
            .field("tick_frequency", &self.tick_frequency)
            .finish_non_exhaustive()
    }
}
