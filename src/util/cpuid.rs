//! CPU identification via `cpuid`.

use crate::error::EmulError;

/// Vendor and model information for the host CPU.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpuInfo {
    pub vendor: String,
    pub max_leaf: u32,
    pub family: u32,
    pub model: u32,
    pub stepping: u32,
    pub hypervisor: bool,
}

impl CpuInfo {
    /// Build from the raw register values of leaf 0 and leaf 1.
    ///
    /// - `leaf0`: (eax, ebx, ecx, edx) of `cpuid(0)`
    /// - `leaf1_eax`, `leaf1_ecx`: signature and feature flags of `cpuid(1)`
    pub fn from_leaves(leaf0: (u32, u32, u32, u32), leaf1_eax: u32,
        leaf1_ecx: u32) -> Self
    {
        let (max_leaf, ebx, ecx, edx) = leaf0;
        let mut vendor = Vec::with_capacity(12);
        vendor.extend_from_slice(&ebx.to_le_bytes());
        vendor.extend_from_slice(&edx.to_le_bytes());
        vendor.extend_from_slice(&ecx.to_le_bytes());

        let base_family = (leaf1_eax >> 8) & 0xf;
        let family = if base_family == 0xf {
            base_family + ((leaf1_eax >> 20) & 0xff)
        } else {
            base_family
        };
        let model = ((leaf1_eax & 0xf0) >> 4) | ((leaf1_eax & 0xf_0000) >> 12);

        Self {
            vendor: String::from_utf8_lossy(&vendor).into_owned(),
            max_leaf,
            family,
            model,
            stepping: leaf1_eax & 0xf,
            hypervisor: leaf1_ecx & (1 << 31) != 0,
        }
    }

    #[cfg(target_arch = "x86_64")]
    pub fn detect() -> Result<Self, EmulError> {
        use core::arch::x86_64::__cpuid;
        let (l0, l1) = unsafe { (__cpuid(0), __cpuid(1)) };
        Ok(Self::from_leaves((l0.eax, l0.ebx, l0.ecx, l0.edx), l1.eax, l1.ecx))
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn detect() -> Result<Self, EmulError> {
        Err(EmulError::UnsupportedCpu("not an x86_64 host".to_string()))
    }

    /// Reject anything other than an Intel family 6 part.
    pub fn check_supported(&self) -> Result<(), EmulError> {
        if self.vendor != "GenuineIntel" {
            return Err(EmulError::UnsupportedCpu(
                format!("vendor '{}' (only Intel is supported)", self.vendor)
            ));
        }
        if self.family != 6 {
            return Err(EmulError::UnsupportedCpu(
                format!("family {} (only family 6 is supported)", self.family)
            ));
        }
        if self.hypervisor {
            tracing::warn!("detected a hypervisor; some counters might not be available");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // "GenuineIntel" in ebx/edx/ecx order
    const INTEL: (u32, u32, u32, u32) = (0x16, 0x756e_6547, 0x6c65_746e, 0x4965_6e69);

    #[test]
    fn skylake_x_signature() {
        let info = CpuInfo::from_leaves(INTEL, 0x0005_0654, 0);
        assert_eq!(info.vendor, "GenuineIntel");
        assert_eq!(info.family, 6);
        assert_eq!(info.model, 85);
        assert_eq!(info.stepping, 4);
        assert!(!info.hypervisor);
        assert!(info.check_supported().is_ok());
    }

    #[test]
    fn broadwell_x_signature() {
        let info = CpuInfo::from_leaves(INTEL, 0x0004_06f1, 1 << 31);
        assert_eq!(info.model, 79);
        assert!(info.hypervisor);
        assert!(info.check_supported().is_ok());
    }

    #[test]
    fn reject_other_vendor() {
        // "AuthenticAMD", family 0x17
        let amd = (0x10, 0x6874_7541, 0x444d_4163, 0x6974_6e65);
        let info = CpuInfo::from_leaves(amd, 0x0083_0f10, 0);
        assert_eq!(info.vendor, "AuthenticAMD");
        assert_eq!(info.family, 0x17);
        assert!(matches!(info.check_supported(), Err(EmulError::UnsupportedCpu(_))));
    }
}
