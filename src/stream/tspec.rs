//! Stream Reservation classes and traffic specifications

use serde::Serialize;

use crate::config::{keys, ConfigRegistry};

/// Ethernet preamble, SFD, header with VLAN tag, FCS and inter-packet gap
pub const ETHERNET_PER_PACKET_OVERHEAD: u32 = 42;
/// Smallest Ethernet payload once a VLAN tag is present
pub const ETHERNET_MIN_PAYLOAD: u32 = 42;
pub const SRP_OVERHEAD: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SrClass {
    /// Class A
    High,
    /// Class B
    Low,
}

impl SrClass {
    pub fn suffix(self) -> &'static str {
        match self {
            SrClass::High => "high",
            SrClass::Low => "low",
        }
    }
}

/// Per-class network parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClassParams {
    /// Class measurement interval in ns
    pub interval: u32,
    pub vlan_id: u16,
    pub vlan_priority: u8,
    /// Presentation time offset in ns
    pub presentation_offset: u32,
}

impl ClassParams {
    pub fn packets_per_second(&self) -> u32 {
        if self.interval == 0 {
            return 0;
        }
        (1_000_000_000u64 / u64::from(self.interval)) as u32
    }

    /// Worst-case transit time: presentation offset plus one class interval
    pub fn max_transit_time(&self) -> u32 {
        self.presentation_offset.saturating_add(self.interval)
    }

    /// 802.1Q tag control information
    pub fn vlan_tci(&self) -> u16 {
        (u16::from(self.vlan_priority) << 13) | (self.vlan_id & 0x0FFF)
    }
}

/// Parameters of both SR classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SrClassParams {
    pub high: ClassParams,
    pub low: ClassParams,
}

impl Default for SrClassParams {
    fn default() -> Self {
        Self {
            high: ClassParams {
                interval: 125_000,
                vlan_id: 2,
                vlan_priority: 3,
                presentation_offset: 2_000_000 - 125_000,
            },
            // 10 ms instead of the 50 ms default, as automotive profiles prefer
            low: ClassParams {
                interval: 250_000,
                vlan_id: 3,
                vlan_priority: 2,
                presentation_offset: 10_000_000 - 250_000,
            },
        }
    }
}

impl SrClassParams {
    pub fn from_registry(registry: &ConfigRegistry) -> Self {
        let mut params = Self::default();
        apply(&mut params.high, registry, HIGH_KEYS);
        apply(&mut params.low, registry, LOW_KEYS);
        params
    }

    pub fn get(&self, class: SrClass) -> &ClassParams {
        match class {
            SrClass::High => &self.high,
            SrClass::Low => &self.low,
        }
    }
}

struct ClassKeys {
    interval: &'static str,
    vlan_id: &'static str,
    vlan_priority: &'static str,
    presentation_offset: &'static str,
}

const HIGH_KEYS: ClassKeys = ClassKeys {
    interval: keys::TSPEC_INTERVAL_HIGH,
    vlan_id: keys::TSPEC_VLAN_ID_HIGH,
    vlan_priority: keys::TSPEC_VLAN_PRIO_HIGH,
    presentation_offset: keys::TSPEC_PRESENTATION_OFFSET_HIGH,
};

const LOW_KEYS: ClassKeys = ClassKeys {
    interval: keys::TSPEC_INTERVAL_LOW,
    vlan_id: keys::TSPEC_VLAN_ID_LOW,
    vlan_priority: keys::TSPEC_VLAN_PRIO_LOW,
    presentation_offset: keys::TSPEC_PRESENTATION_OFFSET_LOW,
};

fn apply(class: &mut ClassParams, registry: &ConfigRegistry, keys: ClassKeys) {
    if let Some(v) = registry.get_u64(keys.interval) {
        class.interval = v.min(u64::from(u32::MAX)) as u32;
    }
    if let Some(v) = registry.get_u64(keys.vlan_id) {
        class.vlan_id = (v & 0x0FFF) as u16;
    }
    if let Some(v) = registry.get_u64(keys.vlan_priority) {
        class.vlan_priority = (v & 0x7) as u8;
    }
    if let Some(v) = registry.get_u64(keys.presentation_offset) {
        class.presentation_offset = v.min(u64::from(u32::MAX)) as u32;
    }
}

/// Traffic specification of one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TSpec {
    pub class: SrClass,
    /// Largest AVTP frame, without the Ethernet header
    pub max_frame_size: u16,
    pub max_interval_frames: u16,
    pub params: ClassParams,
}

impl TSpec {
    pub fn new(max_frame_size: u16, class: SrClass, params: &SrClassParams) -> Self {
        Self {
            class,
            max_frame_size,
            max_interval_frames: 1,
            params: *params.get(class),
        }
    }

    /// Size the per-interval frame count so `max_packet_rate` fits
    pub fn for_packet_rate(mut self, max_packet_rate: u32) -> Self {
        let pps = self.params.packets_per_second();
        if pps != 0 {
            self.max_interval_frames = max_packet_rate.div_ceil(pps).clamp(1, u32::from(u16::MAX)) as u16;
        }
        self
    }

    pub fn packets_per_second(&self) -> u32 {
        u32::from(self.max_interval_frames) * self.params.packets_per_second()
    }

    /// Spacing of consecutive launch times in ns
    pub fn launch_time_delta(&self) -> u32 {
        let pps = u64::from(self.packets_per_second());
        if pps == 0 {
            return 0;
        }
        (1_000_000_000 / pps) as u32
    }

    /// Bandwidth to reserve, in kbit/s
    pub fn required_bandwidth(&self) -> u32 {
        let payload = u32::from(self.max_frame_size).max(ETHERNET_MIN_PAYLOAD);
        let bits = u64::from(payload + ETHERNET_PER_PACKET_OVERHEAD + SRP_OVERHEAD)
            * u64::from(self.packets_per_second())
            * 8;
        (bits / 1000) as u32
    }

    pub fn vlan_tci(&self) -> u16 {
        self.params.vlan_tci()
    }
}
