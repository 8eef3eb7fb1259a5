// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host/guest policy compatibility auditing.
//!
//! A guest policy is compatible with a host policy when everything it
//! declares is a subset of what the host can provide. The audit walks a
//! fixed checklist in a deterministic order (leaf families ascending, MSRs
//! last) and reports the first failure with its exact location.

use crate::msr::{MSR_ARCH_CAPABILITIES, MSR_INTEL_PLATFORM_INFO};
use crate::policy::{CpuPolicy, EXTD_LEAF_BASE};

/// Location of the first incompatibility found between a guest and a host
/// policy. Fields not implicated by the failing check are `None`.
#[derive(Debug, Default, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error(
    "Guest policy is not compatible with host (leaf {leaf:?}, subleaf {subleaf:?}, msr {msr:?})."
)]
pub struct CpuPolicyIncompatibility {
    /// Offending CPUID leaf, if the failure is in CPUID data.
    pub leaf: Option<u32>,
    /// Offending CPUID subleaf, for subleaf-indexed leaves.
    pub subleaf: Option<u32>,
    /// Offending MSR index, if the failure is in MSR data.
    pub msr: Option<u32>,
}

impl CpuPolicyIncompatibility {
    fn cpuid(leaf: u32) -> Self {
        Self {
            leaf: Some(leaf),
            ..Self::default()
        }
    }

    fn cpuid_subleaf(leaf: u32, subleaf: u32) -> Self {
        Self {
            leaf: Some(leaf),
            subleaf: Some(subleaf),
            ..Self::default()
        }
    }

    fn msr(idx: u32) -> Self {
        Self {
            msr: Some(idx),
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy)]
enum Reg {
    Eax,
    Ebx,
    Ecx,
    Edx,
}

/// One feature word to subset-check between guest and host. Ordered by
/// (leaf, subleaf); extend the table to widen the audit without touching
/// the scan loop.
struct FeatureWordCheck {
    leaf: u32,
    subleaf: Option<u32>,
    reg: Reg,
}

const FEATURE_WORD_CHECKS: &[FeatureWordCheck] = &[
    // Leaf 1 feature information.
    FeatureWordCheck {
        leaf: 0x1,
        subleaf: None,
        reg: Reg::Edx,
    },
    FeatureWordCheck {
        leaf: 0x1,
        subleaf: None,
        reg: Reg::Ecx,
    },
    // Leaf 7 structured features.
    FeatureWordCheck {
        leaf: 0x7,
        subleaf: Some(0),
        reg: Reg::Ebx,
    },
    FeatureWordCheck {
        leaf: 0x7,
        subleaf: Some(0),
        reg: Reg::Ecx,
    },
    FeatureWordCheck {
        leaf: 0x7,
        subleaf: Some(0),
        reg: Reg::Edx,
    },
    FeatureWordCheck {
        leaf: 0x7,
        subleaf: Some(1),
        reg: Reg::Eax,
    },
    // XSAVE feature flags.
    FeatureWordCheck {
        leaf: 0xd,
        subleaf: Some(1),
        reg: Reg::Eax,
    },
    // Extended leaf 1 features.
    FeatureWordCheck {
        leaf: 0x8000_0001,
        subleaf: None,
        reg: Reg::Edx,
    },
    FeatureWordCheck {
        leaf: 0x8000_0001,
        subleaf: None,
        reg: Reg::Ecx,
    },
];

fn feature_word(p: &CpuPolicy, check: &FeatureWordCheck) -> u32 {
    let subleaf = check.subleaf.unwrap_or(0) as usize;
    let regs = match check.leaf {
        0x7 => p.feat.raw[subleaf],
        0xd => p.xstate.raw[subleaf],
        leaf if leaf >= EXTD_LEAF_BASE => p.extd.raw[(leaf & 0xffff) as usize],
        leaf => p.basic.raw[leaf as usize],
    };

    match check.reg {
        Reg::Eax => regs.eax,
        Reg::Ebx => regs.ebx,
        Reg::Ecx => regs.ecx,
        Reg::Edx => regs.edx,
    }
}

/// Audits whether `guest` is compatible with `host`: every maximum leaf,
/// feature bit and MSR capability the guest declares must also be present
/// in the host.
///
/// The scan order is fixed (maximum-leaf counters, then the feature-word
/// table ascending by leaf, then MSRs) and only the first failure is
/// reported.
///
/// # Errors
///
/// [`CpuPolicyIncompatibility`] locating the first failing leaf, subleaf
/// or MSR.
pub fn policies_are_compatible(
    host: &CpuPolicy,
    guest: &CpuPolicy,
) -> Result<(), CpuPolicyIncompatibility> {
    if guest.basic.max_leaf() > host.basic.max_leaf() {
        return Err(CpuPolicyIncompatibility::cpuid(0x0));
    }

    if guest.feat.max_subleaf() > host.feat.max_subleaf() {
        return Err(CpuPolicyIncompatibility::cpuid_subleaf(0x7, 0));
    }

    if guest.extd.max_leaf() > host.extd.max_leaf() {
        return Err(CpuPolicyIncompatibility::cpuid(EXTD_LEAF_BASE));
    }

    for check in FEATURE_WORD_CHECKS {
        let guest_word = feature_word(guest, check);
        let host_word = feature_word(host, check);

        if guest_word & !host_word != 0 {
            return Err(match check.subleaf {
                Some(subleaf) => CpuPolicyIncompatibility::cpuid_subleaf(check.leaf, subleaf),
                None => CpuPolicyIncompatibility::cpuid(check.leaf),
            });
        }
    }

    // Covers cpuid_faulting: a guest wanting it needs a host providing it.
    if guest.msr.platform_info.raw & !host.msr.platform_info.raw != 0 {
        return Err(CpuPolicyIncompatibility::msr(MSR_INTEL_PLATFORM_INFO));
    }

    if guest.msr.arch_caps.raw & !host.msr.arch_caps.raw != 0 {
        return Err(CpuPolicyIncompatibility::msr(MSR_ARCH_CAPABILITIES));
    }

    Ok(())
}
