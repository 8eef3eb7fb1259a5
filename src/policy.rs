// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Structured representation of a guest CPU policy.
//!
//! A policy is a set of per-leaf-family raw register arrays plus a handful
//! of scalar fields. Every named quantity (max leaf counters, vendor words,
//! cache/topology subleaf types, xstate masks) is a bit-slice of the raw
//! register words, so the raw arrays are the single source of truth and the
//! flat serialized form ([`crate::CpuidLeaf`]) loses no information.

use crate::msr::MsrPolicy;
use crate::vendor::VendorId;

/// Number of basic leaf slots (leaves 0x0 to 0xd).
pub const CPUID_GUEST_NR_BASIC: usize = 0xd + 1;
/// Number of cache (leaf 0x4) subleaf slots.
pub const CPUID_GUEST_NR_CACHE: usize = 5 + 1;
/// Number of feature (leaf 0x7) subleaf slots.
pub const CPUID_GUEST_NR_FEAT: usize = 2 + 1;
/// Number of topology (leaf 0xb) subleaf slots.
pub const CPUID_GUEST_NR_TOPO: usize = 1 + 1;
/// Number of extended state (leaf 0xd) subleaf slots.
pub const CPUID_GUEST_NR_XSTATE: usize = 62 + 1;
/// Number of extended leaf slots (leaves 0x80000000 to 0x80000021).
pub const CPUID_GUEST_NR_EXTD: usize = 0x21 + 1;

/// Upper bound on the number of leaves a policy can serialize to. Sized so
/// a caller-provided buffer of this capacity never overflows.
///
/// Every subleaf-based family already owns one slot of the basic count, so
/// each contributes its slot count minus one, and the two hypervisor
/// windows contribute one record each.
pub const CPUID_MAX_SERIALISED_LEAVES: usize = CPUID_GUEST_NR_BASIC
    + (CPUID_GUEST_NR_CACHE - 1)
    + (CPUID_GUEST_NR_FEAT - 1)
    + (CPUID_GUEST_NR_TOPO - 1)
    + (CPUID_GUEST_NR_XSTATE - 1)
    + CPUID_GUEST_NR_EXTD
    + 2;

/// Subleaf value carried by serialized records for leaves without subleaves.
pub const CPUID_NO_SUBLEAF: u32 = u32::MAX;

/// Base of the primary hypervisor leaf window.
pub const HYPERVISOR_LEAF_BASE: u32 = 0x4000_0000;
/// Base of the secondary hypervisor leaf window.
pub const HYPERVISOR_LEAF2_BASE: u32 = 0x4000_0100;
/// Width of each hypervisor leaf window.
pub const HYPERVISOR_LEAF_WINDOW: u32 = 0x100;
/// Base of the extended leaf range.
pub const EXTD_LEAF_BASE: u32 = 0x8000_0000;

/// The four output registers of a single CPUID invocation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuidRegisters {
    /// EAX
    pub eax: u32,
    /// EBX
    pub ebx: u32,
    /// ECX
    pub ecx: u32,
    /// EDX
    pub edx: u32,
}

impl CpuidRegisters {
    /// All-zero register set.
    pub const ZERO: Self = Self {
        eax: 0,
        ebx: 0,
        ecx: 0,
        edx: 0,
    };
}

/// Gets a given bit range within a given value.
pub(crate) fn get_range(x: u32, range: std::ops::RangeInclusive<u8>) -> u32 {
    let start = *range.start();
    let end = *range.end();

    debug_assert!(end >= start);
    debug_assert!(end < 32);

    let num_bits = end - start + 1;
    let mask = if num_bits == 32 {
        u32::MAX
    } else {
        ((1u32 << num_bits) - 1) << start
    };

    (x & mask) >> start
}

/// Sets a given bit to 1 or 0.
pub(crate) fn set_bit(x: &mut u32, bit: u8, y: bool) {
    debug_assert!(bit < 32);
    *x = (*x & !(1 << bit)) | (u32::from(y) << bit);
}

fn zero_leaves(raw: &mut [CpuidRegisters], first: usize) {
    for slot in raw.iter_mut().skip(first) {
        *slot = CpuidRegisters::ZERO;
    }
}

/// Basic leaves, 0x0 to 0xd. Slots 0x4, 0x7, 0xb and 0xd are dead; those
/// leaves are held in their own families.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BasicLeaves {
    /// Raw register words, indexed by leaf.
    pub raw: [CpuidRegisters; CPUID_GUEST_NR_BASIC],
}

impl BasicLeaves {
    /// Highest valid basic leaf (leaf 0 EAX).
    #[must_use]
    pub fn max_leaf(&self) -> u32 {
        self.raw[0].eax
    }

    /// Sets the highest valid basic leaf.
    pub fn set_max_leaf(&mut self, max_leaf: u32) {
        self.raw[0].eax = max_leaf;
    }

    /// Raw family/model/stepping word (leaf 1 EAX).
    #[must_use]
    pub fn raw_fms(&self) -> u32 {
        self.raw[1].eax
    }

    /// Vendor identification words (leaf 0 EBX/ECX/EDX).
    #[must_use]
    pub fn vendor_words(&self) -> (u32, u32, u32) {
        (self.raw[0].ebx, self.raw[0].ecx, self.raw[0].edx)
    }
}

/// Cache descriptors, leaf 0x4. A subleaf with type 0 terminates the list.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheLeaves {
    /// Raw register words, indexed by subleaf.
    pub raw: [CpuidRegisters; CPUID_GUEST_NR_CACHE],
}

impl CacheLeaves {
    /// Cache type discriminant of a subleaf (EAX bits 4:0).
    #[must_use]
    pub fn subleaf_type(&self, subleaf: usize) -> u32 {
        get_range(self.raw[subleaf].eax, 0..=4)
    }
}

/// Structured feature flags, leaf 0x7.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FeatureLeaves {
    /// Raw register words, indexed by subleaf.
    pub raw: [CpuidRegisters; CPUID_GUEST_NR_FEAT],
}

impl FeatureLeaves {
    /// Highest valid subleaf (subleaf 0 EAX).
    #[must_use]
    pub fn max_subleaf(&self) -> u32 {
        self.raw[0].eax
    }
}

/// Extended topology enumeration, leaf 0xb. A subleaf with type 0
/// terminates the list.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TopologyLeaves {
    /// Raw register words, indexed by subleaf.
    pub raw: [CpuidRegisters; CPUID_GUEST_NR_TOPO],
}

impl TopologyLeaves {
    /// Topology level type discriminant of a subleaf (ECX bits 15:8).
    #[must_use]
    pub fn subleaf_type(&self, subleaf: usize) -> u32 {
        get_range(self.raw[subleaf].ecx, 8..=15)
    }

    /// Bits to right-shift an x2APIC ID to reach the next level
    /// (EAX bits 4:0).
    #[must_use]
    pub fn id_shift(&self, subleaf: usize) -> u32 {
        get_range(self.raw[subleaf].eax, 0..=4)
    }
}

/// Extended state enumeration, leaf 0xd. Subleaves 0 and 1 are always
/// valid; subleaf `n >= 2` is valid iff bit `n` of [`Self::xstates`] is
/// set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XstateLeaves {
    /// Raw register words, indexed by subleaf.
    pub raw: [CpuidRegisters; CPUID_GUEST_NR_XSTATE],
}

impl Default for XstateLeaves {
    fn default() -> Self {
        Self {
            raw: [CpuidRegisters::ZERO; CPUID_GUEST_NR_XSTATE],
        }
    }
}

impl XstateLeaves {
    /// XCR0 low word (subleaf 0 EAX).
    #[must_use]
    pub fn xcr0_low(&self) -> u32 {
        self.raw[0].eax
    }

    /// XCR0 high word (subleaf 0 EDX).
    #[must_use]
    pub fn xcr0_high(&self) -> u32 {
        self.raw[0].edx
    }

    /// XSS low word (subleaf 1 ECX).
    #[must_use]
    pub fn xss_low(&self) -> u32 {
        self.raw[1].ecx
    }

    /// XSS high word (subleaf 1 EDX).
    #[must_use]
    pub fn xss_high(&self) -> u32 {
        self.raw[1].edx
    }

    /// Union of all state components the policy permits in XCR0 or XSS.
    /// Bit `n` gates the validity of subleaf `n` for `n >= 2`.
    #[must_use]
    pub fn xstates(&self) -> u64 {
        (u64::from(self.xcr0_high() | self.xss_high()) << 32)
            | u64::from(self.xcr0_low() | self.xss_low())
    }
}

/// Extended leaves, 0x80000000 window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedLeaves {
    /// Raw register words, indexed by leaf offset from 0x80000000.
    pub raw: [CpuidRegisters; CPUID_GUEST_NR_EXTD],
}

impl Default for ExtendedLeaves {
    fn default() -> Self {
        Self {
            raw: [CpuidRegisters::ZERO; CPUID_GUEST_NR_EXTD],
        }
    }
}

impl ExtendedLeaves {
    /// Highest valid extended leaf (leaf 0x80000000 EAX, full value
    /// including the 0x80000000 high bit).
    #[must_use]
    pub fn max_leaf(&self) -> u32 {
        self.raw[0].eax
    }

    /// Sets the highest valid extended leaf.
    pub fn set_max_leaf(&mut self, max_leaf: u32) {
        self.raw[0].eax = max_leaf;
    }

    /// Raw family/model/stepping word (leaf 0x80000001 EAX).
    #[must_use]
    pub fn raw_fms(&self) -> u32 {
        self.raw[1].eax
    }

    /// Index of the highest valid extended leaf slot, clamped to the
    /// representable range.
    #[must_use]
    pub fn last_leaf_index(&self) -> usize {
        std::cmp::min((self.max_leaf() & 0xffff) as usize, CPUID_GUEST_NR_EXTD - 1)
    }
}

/// A guest CPU policy: the CPUID and MSR data a virtual CPU is permitted
/// to observe.
///
/// Plain value object. `Default` yields the all-zero ("empty") policy.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CpuPolicy {
    /// Basic leaves.
    pub basic: BasicLeaves,
    /// Cache descriptor subleaves (leaf 0x4).
    pub cache: CacheLeaves,
    /// Structured feature subleaves (leaf 0x7).
    pub feat: FeatureLeaves,
    /// Topology subleaves (leaf 0xb).
    pub topo: TopologyLeaves,
    /// Extended state subleaves (leaf 0xd).
    pub xstate: XstateLeaves,
    /// Extended leaves (0x80000000 window).
    pub extd: ExtendedLeaves,
    /// Maximum leaf hint for the primary hypervisor window.
    pub hv_limit: u32,
    /// Maximum leaf hint for the secondary hypervisor window.
    pub hv2_limit: u32,
    /// MSR policy.
    pub msr: MsrPolicy,
    /// Cached vendor, derived from the basic vendor words. Not part of the
    /// serialized form; refresh with [`CpuPolicy::recalculate_vendor`].
    pub x86_vendor: VendorId,
}

impl CpuPolicy {
    /// Index of the highest valid basic leaf slot, clamped to the
    /// representable range.
    #[must_use]
    pub fn last_basic_leaf_index(&self) -> usize {
        std::cmp::min(self.basic.max_leaf() as usize, CPUID_GUEST_NR_BASIC - 1)
    }

    /// Refreshes [`Self::x86_vendor`] from the basic vendor words.
    pub fn recalculate_vendor(&mut self) {
        let (ebx, ecx, edx) = self.basic.vendor_words();
        self.x86_vendor = VendorId::from_identity(ebx, ecx, edx);
    }

    /// Zeroes every leaf slot the policy's own max-leaf counters and
    /// subleaf termination rules declare unreachable, so stale data cannot
    /// leak into a serialized buffer.
    ///
    /// Idempotent, and agrees exactly with the serializer's notion of
    /// which slots are reachable: serializing a policy after this call and
    /// deserializing the result reproduces the policy.
    pub fn clear_out_of_range_leaves(&mut self) {
        let max_leaf = self.basic.max_leaf();

        let first_dead_basic = self.last_basic_leaf_index() + 1;
        zero_leaves(&mut self.basic.raw, first_dead_basic);

        // Leaves 4/7/0xb/0xd live in their own families and never
        // serialize from basic.raw, so their basic slots hold nothing.
        for leaf in [0x4, 0x7, 0xb, 0xd] {
            self.basic.raw[leaf] = CpuidRegisters::ZERO;
        }

        if max_leaf < 0x4 {
            zero_leaves(&mut self.cache.raw, 0);
        } else {
            let mut first = 0;
            while first < CPUID_GUEST_NR_CACHE && self.cache.subleaf_type(first) != 0 {
                first += 1;
            }
            zero_leaves(&mut self.cache.raw, first);
        }

        if max_leaf < 0x7 {
            zero_leaves(&mut self.feat.raw, 0);
        } else {
            let last = std::cmp::min(self.feat.max_subleaf() as usize, CPUID_GUEST_NR_FEAT - 1);
            zero_leaves(&mut self.feat.raw, last + 1);
        }

        if max_leaf < 0xb {
            zero_leaves(&mut self.topo.raw, 0);
        } else {
            let mut first = 0;
            while first < CPUID_GUEST_NR_TOPO && self.topo.subleaf_type(first) != 0 {
                first += 1;
            }
            zero_leaves(&mut self.topo.raw, first);
        }

        if max_leaf < 0xd {
            zero_leaves(&mut self.xstate.raw, 0);
        } else {
            // Subleaves 0 and 1 are always valid.
            let xstates = self.xstate.xstates();
            for subleaf in 2..CPUID_GUEST_NR_XSTATE {
                if xstates & (1u64 << subleaf) == 0 {
                    self.xstate.raw[subleaf] = CpuidRegisters::ZERO;
                }
            }
        }

        let first_dead_extd = self.extd.last_leaf_index() + 1;
        zero_leaves(&mut self.extd.raw, first_dead_extd);
    }
}
