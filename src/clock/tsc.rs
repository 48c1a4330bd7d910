//! Tick counter frequency detection
//!
//! The crystal-to-TSC ratio comes from CPUID leaf 0x15. Some CPUs report
//! no crystal frequency there, so the known Goldmont crystal is used for
//! that model. Anything else is a detection failure: a guessed frequency
//! would skew every raw-domain factor.

use crate::error::ClockError;

/// Atom Goldmont (Apollo Lake)
const CPU_MODEL_GOLDMONT: u32 = 0x5C;
const GOLDMONT_CRYSTAL_HZ: u64 = 19_200_000;

const CPUID_LEAF_SIGNATURE: u32 = 0x1;
const CPUID_LEAF_TSC: u32 = 0x15;

/// Raw CPUID values needed for detection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuidInfo {
    /// Highest supported basic leaf
    pub max_leaf: u32,
    /// EAX of leaf 1
    pub signature: u32,
    /// EAX, EBX, ECX of leaf 0x15
    pub tsc_leaf: (u32, u32, u32),
}

impl CpuidInfo {
    pub fn family(&self) -> u32 {
        (self.signature >> 8) & 0xF
    }

    /// Display model including the extended model bits
    pub fn model(&self) -> u32 {
        let mut model = (self.signature >> 4) & 0xF;
        let family = self.family();
        if family == 0x6 || family == 0xF {
            model |= ((self.signature >> 16) & 0xF) << 4;
        }
        model
    }
}

/// Compute the counter frequency in Hz from CPUID values
pub fn frequency_from_cpuid(info: &CpuidInfo) -> Result<u64, ClockError> {
    if info.max_leaf < CPUID_LEAF_TSC {
        return Err(ClockError::FrequencyDetection(format!(
            "CPUID leaf 0x15 unsupported (max leaf {:#x})",
            info.max_leaf
        )));
    }

    let (denominator, numerator, crystal) = info.tsc_leaf;
    let crystal_hz = match (crystal, info.model()) {
        (0, CPU_MODEL_GOLDMONT) => GOLDMONT_CRYSTAL_HZ,
        (0, model) => {
            return Err(ClockError::FrequencyDetection(format!(
                "unsupported CPU model {:#x}",
                model
            )))
        }
        (hz, _) => u64::from(hz),
    };

    if denominator == 0 || numerator == 0 {
        return Err(ClockError::FrequencyDetection(
            "CPUID reports no TSC/crystal ratio".into(),
        ));
    }

    Ok(crystal_hz * u64::from(numerator) / u64::from(denominator))
}

#[cfg(target_arch = "x86_64")]
fn read_cpuid() -> CpuidInfo {
    use core::arch::x86_64::__cpuid;

    let max_leaf = __cpuid(0).eax;
    let signature = __cpuid(CPUID_LEAF_SIGNATURE).eax;
    let tsc_leaf = if max_leaf >= CPUID_LEAF_TSC {
        let r = __cpuid(CPUID_LEAF_TSC);
        (r.eax, r.ebx, r.ecx)
    } else {
        (0, 0, 0)
    };

    CpuidInfo {
        max_leaf,
        signature,
        tsc_leaf,
    }
}

/// Detect the TSC frequency of the executing CPU in Hz
#[cfg(target_arch = "x86_64")]
pub fn detect_tsc_frequency() -> Result<u64, ClockError> {
    let info = read_cpuid();
    let result = frequency_from_cpuid(&info);
    match &result {
        Ok(hz) => tracing::info!(hz, model = info.model(), "Detected TSC frequency"),
        Err(e) => tracing::error!(model = info.model(), "TSC frequency detection failed: {}", e),
    }
    result
}

#[cfg(not(target_arch = "x86_64"))]
pub fn detect_tsc_frequency() -> Result<u64, ClockError> {
    Err(ClockError::FrequencyDetection(
        "no detection method for this architecture".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn goldmont(tsc_leaf: (u32, u32, u32)) -> CpuidInfo {
        // family 6, model 0xC, extended model 0x5
        CpuidInfo {
            max_leaf: 0x15,
            signature: (0x5 << 16) | (0x6 << 8) | (0xC << 4),
            tsc_leaf,
        }
    }

    #[test]
    fn test_model_decoding() {
        let info = goldmont((0, 0, 0));
        assert_eq!(info.family(), 6);
        assert_eq!(info.model(), CPU_MODEL_GOLDMONT);
    }

    #[test]
    fn test_goldmont_uses_known_crystal() {
        let hz = frequency_from_cpuid(&goldmont((3, 234, 0))).unwrap();
        assert_eq!(hz, 19_200_000 * 234 / 3);
    }

    #[test]
    fn test_reported_crystal_wins() {
        let mut info = goldmont((2, 176, 24_000_000));
        info.signature = (0x9 << 16) | (0x6 << 8) | (0xE << 4);
        assert_eq!(frequency_from_cpuid(&info).unwrap(), 2_112_000_000);
    }

    #[test]
    fn test_unknown_model_fails() {
        let mut info = goldmont((3, 234, 0));
        info.signature = (0x6 << 8) | (0x1 << 4);
        assert!(matches!(
            frequency_from_cpuid(&info),
            Err(ClockError::FrequencyDetection(_))
        ));
    }

    #[test]
    fn test_missing_leaf_fails() {
        let mut info = goldmont((3, 234, 0));
        info.max_leaf = 0x0D;
        assert!(frequency_from_cpuid(&info).is_err());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_read_cpuid_reports_signature() {
        let info = read_cpuid();
        assert!(info.max_leaf >= CPUID_LEAF_SIGNATURE);
        assert!(info.family() > 0);
        if info.max_leaf < CPUID_LEAF_TSC {
            assert_eq!(info.tsc_leaf, (0, 0, 0));
        }
    }

    #[test]
    fn test_zero_ratio_fails() {
        assert!(frequency_from_cpuid(&goldmont((0, 234, 0))).is_err());
    }
}
