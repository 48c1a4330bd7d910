//! Keyed configuration registry
//!
//! All tunable thresholds are looked up by dotted string key
//! (`clockdomain.raw.xtstamp.threshold`, `receive.validation.mode`, ...).
//! The registry is filled from TOML, where nested tables flatten into
//! dotted keys, or programmatically through [`ConfigRegistry::set`].

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Registry keys understood by the core
pub mod keys {
    /// Enable cross-timestamping for the raw clock domain
    pub const RAW_XTSTAMP: &str = "clockdomain.raw.xtstamp";
    /// Raw cross-timestamp accuracy threshold in counter ticks
    pub const RAW_XTSTAMP_THRESHOLD: &str = "clockdomain.raw.xtstamp.threshold";
    /// Raw hard-check deviation, in units of 1e-7
    pub const RAW_DEVIATION_UNLOCK: &str = "clockdomain.raw.deviation.unlock";
    /// Initial raw-to-PTP ratio, in units of 1e-7
    pub const RAW_RATIO_PTP: &str = "clockdomain.raw.ratio.ptp";
    /// Hardware counter frequency in Hz
    pub const RAW_TSC_FREQ: &str = "clockdomain.raw.tscfreq";
    /// Maximum cross-timestamp attempts per exact refresh
    pub const PTP_XTSTAMP_SAMPLES: &str = "ptp.xtstamp.samples";
    /// System cross-timestamp accuracy threshold in counter ticks
    pub const PTP_XTSTAMP_THRESHOLD: &str = "ptp.xtstamp.threshold";
    pub const PTP_PDELAY_COUNT: &str = "ptp.pdelaycount";
    pub const PTP_SYNC_COUNT: &str = "ptp.synccount";
    pub const VALIDATION_MODE: &str = "receive.validation.mode";
    pub const VALIDATION_THRESHOLD: &str = "receive.validation.threshold";
    pub const COMPATIBILITY_VIDEO: &str = "compatibility.video";
    /// Prefix of the per-stream compatibility override, followed by the stream id in hex
    pub const COMPATIBILITY_VIDEO_H264: &str = "compatibility.video.h.264";
    pub const TSPEC_INTERVAL_HIGH: &str = "tspec.interval.high";
    pub const TSPEC_INTERVAL_LOW: &str = "tspec.interval.low";
    pub const TSPEC_VLAN_ID_HIGH: &str = "tspec.vlanid.high";
    pub const TSPEC_VLAN_ID_LOW: &str = "tspec.vlanid.low";
    pub const TSPEC_VLAN_PRIO_HIGH: &str = "tspec.vlanprio.high";
    pub const TSPEC_VLAN_PRIO_LOW: &str = "tspec.vlanprio.low";
    pub const TSPEC_PRESENTATION_OFFSET_HIGH: &str = "tspec.presentation.time.offset.high";
    pub const TSPEC_PRESENTATION_OFFSET_LOW: &str = "tspec.presentation.time.offset.low";
}

/// A single configuration value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Bool(v)
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Int(v)
    }
}

impl From<u64> for ConfigValue {
    fn from(v: u64) -> Self {
        ConfigValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        ConfigValue::Float(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::Text(v.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(v: String) -> Self {
        ConfigValue::Text(v)
    }
}

/// String key to typed value lookup shared by all components
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigRegistry {
    values: BTreeMap<String, ConfigValue>,
}

impl ConfigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document, flattening nested tables into dotted keys
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let table: toml::Table = text
            .parse()
            .map_err(|e: toml::de::Error| Error::Config(e.to_string()))?;

        let mut registry = Self::new();
        registry.merge_table("", &table)?;
        Ok(registry)
    }

    /// Load a TOML file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let registry = Self::from_toml_str(&text)?;
        tracing::info!(
            path = %path.as_ref().display(),
            entries = registry.len(),
            "Loaded configuration"
        );
        Ok(registry)
    }

    fn merge_table(&mut self, prefix: &str, table: &toml::Table) -> Result<()> {
        for (name, value) in table {
            let key = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}.{}", prefix, name)
            };

            let converted = match value {
                toml::Value::Table(inner) => {
                    self.merge_table(&key, inner)?;
                    continue;
                }
                toml::Value::Boolean(b) => ConfigValue::Bool(*b),
                toml::Value::Integer(i) => ConfigValue::Int(*i),
                toml::Value::Float(f) => ConfigValue::Float(*f),
                toml::Value::String(s) => ConfigValue::Text(s.clone()),
                other => {
                    return Err(Error::Config(format!(
                        "unsupported value type for key {}: {}",
                        key,
                        other.type_str()
                    )))
                }
            };
            self.values.insert(key, converted);
        }
        Ok(())
    }

    /// Set or replace a value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<ConfigValue>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Integer lookup; text values holding a decimal or `0x` hex number are accepted
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.values.get(key)? {
            ConfigValue::Int(i) => Some(*i),
            ConfigValue::Bool(b) => Some(i64::from(*b)),
            ConfigValue::Text(s) => parse_int(s),
            ConfigValue::Float(_) => None,
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get_i64(key).and_then(|v| u64::try_from(v).ok())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.values.get(key)? {
            ConfigValue::Float(f) => Some(*f),
            ConfigValue::Int(i) => Some(*i as f64),
            ConfigValue::Text(s) => s.trim().parse().ok(),
            ConfigValue::Bool(_) => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key)? {
            ConfigValue::Bool(b) => Some(*b),
            ConfigValue::Int(i) => Some(*i != 0),
            ConfigValue::Text(s) => match s.trim() {
                "true" | "on" | "1" => Some(true),
                "false" | "off" | "0" => Some(false),
                _ => None,
            },
            ConfigValue::Float(_) => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.values.get(key)? {
            ConfigValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

fn parse_int(text: &str) -> Option<i64> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}
