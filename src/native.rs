// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Filling a policy from the CPU identification of the running host.
//!
//! The loader is generic over the CPUID oracle so it can be driven by
//! canned data in tests; [`CpuPolicy::fill_native`] plugs in the real
//! instruction.

use crate::policy::{
    CPUID_GUEST_NR_CACHE, CPUID_GUEST_NR_FEAT, CPUID_GUEST_NR_TOPO, CPUID_GUEST_NR_XSTATE,
    CpuPolicy, CpuidRegisters, EXTD_LEAF_BASE,
};

#[cfg(target_arch = "x86_64")]
impl From<core::arch::x86_64::CpuidResult> for CpuidRegisters {
    fn from(
        core::arch::x86_64::CpuidResult { eax, ebx, ecx, edx }: core::arch::x86_64::CpuidResult,
    ) -> Self {
        Self { eax, ebx, ecx, edx }
    }
}

/// Safe wrapper around [`core::arch::x86_64::__cpuid_count`].
#[cfg(target_arch = "x86_64")]
fn cpuid_count(leaf: u32, subleaf: u32) -> core::arch::x86_64::CpuidResult {
    // JUSTIFICATION: There is no safe alternative.
    // SAFETY: The CPUID instruction is available on every x86_64 CPU.
    unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) }
}

impl CpuPolicy {
    /// Fills the CPUID half of the policy by querying `cpuid` once per
    /// (leaf, subleaf) pair the policy's own max-leaf counters and subleaf
    /// rules declare reachable, then refreshes the cached vendor.
    ///
    /// MSRs are left untouched; reading them needs ring 0 and is the
    /// management plane's job.
    pub fn fill_native_with<F>(&mut self, mut cpuid: F)
    where
        F: FnMut(u32, u32) -> CpuidRegisters,
    {
        self.basic.raw[0] = cpuid(0x0, 0);

        for leaf in 1..=self.last_basic_leaf_index() as u32 {
            match leaf {
                0x4 => {
                    for subleaf in 0..CPUID_GUEST_NR_CACHE {
                        self.cache.raw[subleaf] = cpuid(leaf, subleaf as u32);
                        if self.cache.subleaf_type(subleaf) == 0 {
                            break;
                        }
                    }
                }
                0x7 => {
                    self.feat.raw[0] = cpuid(leaf, 0);
                    let last =
                        std::cmp::min(self.feat.max_subleaf() as usize, CPUID_GUEST_NR_FEAT - 1);
                    for subleaf in 1..=last {
                        self.feat.raw[subleaf] = cpuid(leaf, subleaf as u32);
                    }
                }
                0xb => {
                    for subleaf in 0..CPUID_GUEST_NR_TOPO {
                        self.topo.raw[subleaf] = cpuid(leaf, subleaf as u32);
                        if self.topo.subleaf_type(subleaf) == 0 {
                            break;
                        }
                    }
                }
                0xd => {
                    self.xstate.raw[0] = cpuid(leaf, 0);
                    self.xstate.raw[1] = cpuid(leaf, 1);

                    let xstates = self.xstate.xstates();
                    for subleaf in 2..CPUID_GUEST_NR_XSTATE {
                        if xstates & (1u64 << subleaf) != 0 {
                            self.xstate.raw[subleaf] = cpuid(leaf, subleaf as u32);
                        }
                    }
                }
                _ => self.basic.raw[leaf as usize] = cpuid(leaf, 0),
            }
        }

        self.extd.raw[0] = cpuid(EXTD_LEAF_BASE, 0);
        for leaf in 1..=self.extd.last_leaf_index() as u32 {
            self.extd.raw[leaf as usize] = cpuid(EXTD_LEAF_BASE | leaf, 0);
        }

        self.recalculate_vendor();
    }

    /// Fills the CPUID half of the policy from the CPU this is running on.
    #[cfg(target_arch = "x86_64")]
    pub fn fill_native(&mut self) {
        self.fill_native_with(|leaf, subleaf| cpuid_count(leaf, subleaf).into());
    }
}
