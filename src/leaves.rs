// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Flat, sorted leaf records: the serialized form of the CPUID half of a
//! policy, suitable for transport across a management-plane boundary.

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::policy::{
    CPUID_GUEST_NR_BASIC, CPUID_GUEST_NR_CACHE, CPUID_GUEST_NR_EXTD, CPUID_GUEST_NR_FEAT,
    CPUID_GUEST_NR_TOPO, CPUID_GUEST_NR_XSTATE, CPUID_NO_SUBLEAF, CpuPolicy, CpuidRegisters,
    EXTD_LEAF_BASE, HYPERVISOR_LEAF_BASE, HYPERVISOR_LEAF_WINDOW, HYPERVISOR_LEAF2_BASE,
};

/// One serialized CPUID record. Fixed `repr(C)` layout, 24 bytes, stable
/// across the transport boundary.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct CpuidLeaf {
    /// Leaf index.
    pub leaf: u32,
    /// Subleaf index, or [`CPUID_NO_SUBLEAF`] for single-subleaf leaves.
    pub subleaf: u32,
    /// EAX
    pub eax: u32,
    /// EBX
    pub ebx: u32,
    /// ECX
    pub ecx: u32,
    /// EDX
    pub edx: u32,
}

impl CpuidLeaf {
    /// `CpuidLeaf` carrying the given register words.
    #[must_use]
    pub fn new(leaf: u32, subleaf: u32, regs: CpuidRegisters) -> Self {
        Self {
            leaf,
            subleaf,
            eax: regs.eax,
            ebx: regs.ebx,
            ecx: regs.ecx,
            edx: regs.edx,
        }
    }

    /// The record's register words.
    #[must_use]
    pub fn registers(&self) -> CpuidRegisters {
        CpuidRegisters {
            eax: self.eax,
            ebx: self.ebx,
            ecx: self.ecx,
            edx: self.edx,
        }
    }
}

/// Error type for [`CpuPolicy::serialize_leaves`].
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("Destination buffer with capacity {capacity} cannot hold the serialized policy.")]
pub struct LeafBufferFullError {
    /// Capacity of the buffer the caller supplied.
    pub capacity: usize,
}

/// Error type for [`CpuPolicy::apply_leaves`] and [`validate_leaves`].
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("Leaf {leaf:#010x} subleaf {subleaf:#010x} is outside the policy index space.")]
pub struct LeafRangeError {
    /// Leaf index of the offending record.
    pub leaf: u32,
    /// Subleaf index of the offending record.
    pub subleaf: u32,
}

/// Bounds-checked record writer over the caller's buffer.
struct LeafWriter<'a> {
    buf: &'a mut [CpuidLeaf],
    nr: usize,
}

impl LeafWriter<'_> {
    fn push(&mut self, leaf: u32, subleaf: u32, regs: CpuidRegisters) -> Result<(), LeafBufferFullError> {
        let capacity = self.buf.len();
        let slot = self
            .buf
            .get_mut(self.nr)
            .ok_or(LeafBufferFullError { capacity })?;
        *slot = CpuidLeaf::new(leaf, subleaf, regs);
        self.nr += 1;
        Ok(())
    }
}

impl CpuPolicy {
    /// Serializes the CPUID half of the policy into `buf`, returning the
    /// number of records written.
    ///
    /// Records are emitted in strictly increasing (leaf, subleaf) order
    /// with no duplicates: basic leaves first (leaves 0x4/0x7/0xb/0xd
    /// emitting their family's subleaves in place), then the two
    /// hypervisor window base leaves, then extended leaves. A buffer of
    /// [`crate::CPUID_MAX_SERIALISED_LEAVES`] records is always large
    /// enough.
    ///
    /// # Errors
    ///
    /// When `buf` is too small for the policy. No record is written past
    /// the buffer's bound.
    pub fn serialize_leaves(&self, buf: &mut [CpuidLeaf]) -> Result<usize, LeafBufferFullError> {
        let mut out = LeafWriter { buf, nr: 0 };

        for leaf in 0..=self.last_basic_leaf_index() as u32 {
            match leaf {
                0x4 => {
                    // Stop after the first subleaf of type 0, inclusive.
                    for subleaf in 0..CPUID_GUEST_NR_CACHE {
                        out.push(leaf, subleaf as u32, self.cache.raw[subleaf])?;
                        if self.cache.subleaf_type(subleaf) == 0 {
                            break;
                        }
                    }
                }
                0x7 => {
                    let last =
                        std::cmp::min(self.feat.max_subleaf() as usize, CPUID_GUEST_NR_FEAT - 1);
                    for subleaf in 0..=last {
                        out.push(leaf, subleaf as u32, self.feat.raw[subleaf])?;
                    }
                }
                0xb => {
                    // Stop after the first subleaf of type 0, inclusive.
                    for subleaf in 0..CPUID_GUEST_NR_TOPO {
                        out.push(leaf, subleaf as u32, self.topo.raw[subleaf])?;
                        if self.topo.subleaf_type(subleaf) == 0 {
                            break;
                        }
                    }
                }
                0xd => {
                    // Subleaves 0 and 1 are always valid; subleaf n >= 2
                    // only when the xcr0/xss union has bit n set.
                    let xstates = self.xstate.xstates();

                    out.push(leaf, 0, self.xstate.raw[0])?;
                    out.push(leaf, 1, self.xstate.raw[1])?;

                    for subleaf in 2..CPUID_GUEST_NR_XSTATE {
                        if xstates & (1u64 << subleaf) != 0 {
                            out.push(leaf, subleaf as u32, self.xstate.raw[subleaf])?;
                        }
                    }
                }
                _ => out.push(leaf, CPUID_NO_SUBLEAF, self.basic.raw[leaf as usize])?,
            }
        }

        out.push(
            HYPERVISOR_LEAF_BASE,
            CPUID_NO_SUBLEAF,
            CpuidRegisters {
                eax: self.hv_limit,
                ..CpuidRegisters::ZERO
            },
        )?;
        out.push(
            HYPERVISOR_LEAF2_BASE,
            CPUID_NO_SUBLEAF,
            CpuidRegisters {
                eax: self.hv2_limit,
                ..CpuidRegisters::ZERO
            },
        )?;

        for leaf in 0..=self.extd.last_leaf_index() as u32 {
            out.push(
                EXTD_LEAF_BASE | leaf,
                CPUID_NO_SUBLEAF,
                self.extd.raw[leaf as usize],
            )?;
        }

        Ok(out.nr)
    }

    /// Writes each record of `leaves` into its slot in the policy,
    /// stopping at the first record outside the legal index space.
    ///
    /// Records written before a failure are not rolled back; on error the
    /// caller must discard the policy. No semantic consistency between
    /// leaves is checked here (that is [`CpuPolicy::clear_out_of_range_leaves`]
    /// and the compatibility checker's job), and [`CpuPolicy::x86_vendor`]
    /// is not refreshed.
    ///
    /// # Errors
    ///
    /// When a record's (leaf, subleaf) is outside the legal index space;
    /// the error reports that exact location.
    pub fn apply_leaves(&mut self, leaves: &[CpuidLeaf]) -> Result<(), LeafRangeError> {
        for data in leaves {
            copy_leaf_into(Some(&mut *self), data)?;
        }
        Ok(())
    }
}

/// Range-checks `leaves` without constructing or mutating any policy: the
/// probe-mode twin of [`CpuPolicy::apply_leaves`].
///
/// # Errors
///
/// When a record's (leaf, subleaf) is outside the legal index space.
pub fn validate_leaves(leaves: &[CpuidLeaf]) -> Result<(), LeafRangeError> {
    for data in leaves {
        copy_leaf_into(None, data)?;
    }
    Ok(())
}

fn copy_leaf_into(policy: Option<&mut CpuPolicy>, data: &CpuidLeaf) -> Result<(), LeafRangeError> {
    let out_of_range = LeafRangeError {
        leaf: data.leaf,
        subleaf: data.subleaf,
    };
    let regs = data.registers();

    match data.leaf {
        0x4 => {
            if data.subleaf >= CPUID_GUEST_NR_CACHE as u32 {
                return Err(out_of_range);
            }
            if let Some(p) = policy {
                p.cache.raw[data.subleaf as usize] = regs;
            }
        }
        0x7 => {
            if data.subleaf >= CPUID_GUEST_NR_FEAT as u32 {
                return Err(out_of_range);
            }
            if let Some(p) = policy {
                p.feat.raw[data.subleaf as usize] = regs;
            }
        }
        0xb => {
            if data.subleaf >= CPUID_GUEST_NR_TOPO as u32 {
                return Err(out_of_range);
            }
            if let Some(p) = policy {
                p.topo.raw[data.subleaf as usize] = regs;
            }
        }
        0xd => {
            if data.subleaf >= CPUID_GUEST_NR_XSTATE as u32 {
                return Err(out_of_range);
            }
            if let Some(p) = policy {
                p.xstate.raw[data.subleaf as usize] = regs;
            }
        }
        leaf if leaf < CPUID_GUEST_NR_BASIC as u32 => {
            if data.subleaf != CPUID_NO_SUBLEAF {
                return Err(out_of_range);
            }
            if let Some(p) = policy {
                p.basic.raw[leaf as usize] = regs;
            }
        }
        leaf if (HYPERVISOR_LEAF_BASE..HYPERVISOR_LEAF_BASE + HYPERVISOR_LEAF_WINDOW)
            .contains(&leaf) =>
        {
            if data.subleaf != CPUID_NO_SUBLEAF {
                return Err(out_of_range);
            }
            if let Some(p) = policy
                && leaf == HYPERVISOR_LEAF_BASE
            {
                p.hv_limit = data.eax;
            }
        }
        leaf if (HYPERVISOR_LEAF2_BASE..HYPERVISOR_LEAF2_BASE + HYPERVISOR_LEAF_WINDOW)
            .contains(&leaf) =>
        {
            if data.subleaf != CPUID_NO_SUBLEAF {
                return Err(out_of_range);
            }
            if let Some(p) = policy
                && leaf == HYPERVISOR_LEAF2_BASE
            {
                p.hv2_limit = data.eax;
            }
        }
        leaf if (EXTD_LEAF_BASE..EXTD_LEAF_BASE + CPUID_GUEST_NR_EXTD as u32).contains(&leaf) => {
            if data.subleaf != CPUID_NO_SUBLEAF {
                return Err(out_of_range);
            }
            if let Some(p) = policy {
                p.extd.raw[(leaf & 0xffff) as usize] = regs;
            }
        }
        _ => return Err(out_of_range),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;
    use proptest::prelude::*;

    use super::*;
    use crate::policy::CPUID_MAX_SERIALISED_LEAVES;

    fn serialize(p: &CpuPolicy) -> Vec<CpuidLeaf> {
        let mut buf = vec![CpuidLeaf::default(); CPUID_MAX_SERIALISED_LEAVES];
        let nr = p.serialize_leaves(&mut buf).unwrap();
        buf.truncate(nr);
        buf
    }

    fn assert_strictly_sorted(leaves: &[CpuidLeaf]) {
        for (prev, next) in leaves.iter().tuple_windows() {
            assert!(
                (prev.leaf, prev.subleaf) < (next.leaf, next.subleaf),
                "{prev:x?} not before {next:x?}"
            );
        }
    }

    #[test]
    fn serialize_empty_policy() {
        let p = CpuPolicy::default();
        let leaves = serialize(&p);

        // Leaf 0, the two hypervisor window bases, extended leaf 0.
        assert_eq!(leaves.len(), 4);
        assert_strictly_sorted(&leaves);
        assert_eq!(
            leaves.iter().map(|l| l.leaf).collect::<Vec<_>>(),
            [0x0, 0x4000_0000, 0x4000_0100, 0x8000_0000]
        );
        assert!(leaves.iter().all(|l| l.subleaf == CPUID_NO_SUBLEAF));
    }

    #[test]
    fn serialize_empty_leaf_4() {
        // Leaf 4 serialization stops at the first subleaf with type 0.
        let mut p = CpuPolicy::default();
        p.basic.set_max_leaf(4);

        let leaves = serialize(&p);
        assert_eq!(leaves.len(), 4 + 4);
        assert_strictly_sorted(&leaves);
    }

    #[test]
    fn serialize_partial_leaf_4() {
        let mut p = CpuPolicy::default();
        p.basic.set_max_leaf(4);
        p.cache.raw[0].eax = 1;

        let leaves = serialize(&p);
        assert_eq!(leaves.len(), 4 + 4 + 1);
        assert_strictly_sorted(&leaves);

        // Subleaf 0 carries the data; subleaf 1 is the terminator.
        assert_eq!(leaves[4], CpuidLeaf::new(4, 0, p.cache.raw[0]));
        assert_eq!(leaves[5], CpuidLeaf::new(4, 1, CpuidRegisters::ZERO));
    }

    #[test]
    fn serialize_empty_leaf_7() {
        // Leaf 7 serialization stops at max_subleaf.
        let mut p = CpuPolicy::default();
        p.basic.set_max_leaf(7);

        let leaves = serialize(&p);
        assert_eq!(leaves.len(), 4 + 7);
        assert_strictly_sorted(&leaves);
    }

    #[test]
    fn serialize_partial_leaf_7() {
        let mut p = CpuPolicy::default();
        p.basic.set_max_leaf(7);
        p.feat.raw[0].eax = 1;

        let leaves = serialize(&p);
        assert_eq!(leaves.len(), 4 + 7 + 1);
        assert_strictly_sorted(&leaves);
    }

    #[test]
    fn serialize_empty_leaf_b() {
        // Leaf 0xb serialization stops at the first subleaf with type 0.
        let mut p = CpuPolicy::default();
        p.basic.set_max_leaf(0xb);

        let leaves = serialize(&p);
        assert_eq!(leaves.len(), 4 + 0xb);
        assert_strictly_sorted(&leaves);
    }

    #[test]
    fn serialize_partial_leaf_b() {
        let mut p = CpuPolicy::default();
        p.basic.set_max_leaf(0xb);
        p.topo.raw[0].ecx = 0x0100;

        let leaves = serialize(&p);
        assert_eq!(leaves.len(), 4 + 0xb + 1);
        assert_strictly_sorted(&leaves);
    }

    #[test]
    fn serialize_empty_leaf_d() {
        // Leaf 0xd serialization always carries two subleaves, then one
        // per set bit in the xcr0/xss union.
        let mut p = CpuPolicy::default();
        p.basic.set_max_leaf(0xd);

        let leaves = serialize(&p);
        assert_eq!(leaves.len(), 4 + 0xd + 1);
        assert_strictly_sorted(&leaves);
    }

    #[test]
    fn serialize_partial_leaf_d() {
        let mut p = CpuPolicy::default();
        p.basic.set_max_leaf(0xd);
        p.xstate.raw[0].eax = 7;

        let leaves = serialize(&p);
        assert_eq!(leaves.len(), 4 + 0xd + 1 + 1);
        assert_strictly_sorted(&leaves);

        let xstate: Vec<_> = leaves
            .iter()
            .filter(|l| l.leaf == 0xd)
            .map(|l| l.subleaf)
            .collect();
        assert_eq!(xstate, [0, 1, 2]);
    }

    #[test]
    fn serialize_buffer_too_small() {
        let p = CpuPolicy::default();
        let mut buf = [CpuidLeaf::default(); 2];
        assert_eq!(
            p.serialize_leaves(&mut buf),
            Err(LeafBufferFullError { capacity: 2 })
        );
    }

    #[test]
    fn deserialize_out_of_range() {
        let tests: &[(&str, CpuidLeaf)] = &[
            (
                "incorrect basic subleaf",
                CpuidLeaf {
                    leaf: 0,
                    subleaf: 0,
                    ..CpuidLeaf::default()
                },
            ),
            (
                "incorrect hv1 subleaf",
                CpuidLeaf {
                    leaf: 0x4000_0000,
                    subleaf: 0,
                    ..CpuidLeaf::default()
                },
            ),
            (
                "incorrect hv2 subleaf",
                CpuidLeaf {
                    leaf: 0x4000_0100,
                    subleaf: 0,
                    ..CpuidLeaf::default()
                },
            ),
            (
                "incorrect extd subleaf",
                CpuidLeaf {
                    leaf: 0x8000_0000,
                    subleaf: 0,
                    ..CpuidLeaf::default()
                },
            ),
            (
                "OoB basic leaf",
                CpuidLeaf {
                    leaf: CPUID_GUEST_NR_BASIC as u32,
                    subleaf: CPUID_NO_SUBLEAF,
                    ..CpuidLeaf::default()
                },
            ),
            (
                "OoB cache subleaf",
                CpuidLeaf {
                    leaf: 0x4,
                    subleaf: CPUID_GUEST_NR_CACHE as u32,
                    ..CpuidLeaf::default()
                },
            ),
            (
                "OoB feat subleaf",
                CpuidLeaf {
                    leaf: 0x7,
                    subleaf: CPUID_GUEST_NR_FEAT as u32,
                    ..CpuidLeaf::default()
                },
            ),
            (
                "OoB topo subleaf",
                CpuidLeaf {
                    leaf: 0xb,
                    subleaf: CPUID_GUEST_NR_TOPO as u32,
                    ..CpuidLeaf::default()
                },
            ),
            (
                "OoB xstate subleaf",
                CpuidLeaf {
                    leaf: 0xd,
                    subleaf: CPUID_GUEST_NR_XSTATE as u32,
                    ..CpuidLeaf::default()
                },
            ),
            (
                "OoB extd leaf",
                CpuidLeaf {
                    leaf: 0x8000_0000 | CPUID_GUEST_NR_EXTD as u32,
                    subleaf: CPUID_NO_SUBLEAF,
                    ..CpuidLeaf::default()
                },
            ),
            (
                "unknown range",
                CpuidLeaf {
                    leaf: 0x1234_5678,
                    subleaf: 0,
                    ..CpuidLeaf::default()
                },
            ),
        ];

        for (name, leaf) in tests {
            // Probe mode performs zero writes.
            assert_eq!(
                validate_leaves(std::slice::from_ref(leaf)),
                Err(LeafRangeError {
                    leaf: leaf.leaf,
                    subleaf: leaf.subleaf,
                }),
                "test {name}"
            );
        }
    }

    #[test]
    fn deserialize_stops_at_first_failure() {
        let mut p = CpuPolicy::default();
        let records = [
            CpuidLeaf {
                leaf: 0,
                subleaf: CPUID_NO_SUBLEAF,
                eax: 4,
                ..CpuidLeaf::default()
            },
            CpuidLeaf {
                leaf: 0x4,
                subleaf: CPUID_GUEST_NR_CACHE as u32,
                ..CpuidLeaf::default()
            },
            CpuidLeaf {
                leaf: 0x4,
                subleaf: 0,
                eax: 1,
                ..CpuidLeaf::default()
            },
        ];

        assert_eq!(
            p.apply_leaves(&records),
            Err(LeafRangeError {
                leaf: 0x4,
                subleaf: CPUID_GUEST_NR_CACHE as u32,
            })
        );
        // The record before the failure landed; the one after did not.
        assert_eq!(p.basic.max_leaf(), 4);
        assert_eq!(p.cache.raw[0], CpuidRegisters::ZERO);
    }

    #[test]
    fn round_trip() {
        let mut p = CpuPolicy::default();
        p.basic.set_max_leaf(0xd);
        p.basic.raw[1].eax = 0x000a_0655;
        p.cache.raw[0] = CpuidRegisters {
            eax: 0x1c00_4121,
            ebx: 0x01c0_003f,
            ecx: 0x0000_003f,
            edx: 0,
        };
        p.feat.raw[0].eax = 1;
        p.feat.raw[0].ebx = 0x0292_1203;
        p.feat.raw[1].eax = 0x0000_0010;
        p.topo.raw[0] = CpuidRegisters {
            eax: 1,
            ebx: 2,
            ecx: 0x0100,
            edx: 0,
        };
        p.xstate.raw[0].eax = 7;
        p.xstate.raw[2].ebx = 0x240;
        p.extd.set_max_leaf(0x8000_0008);
        p.extd.raw[1].ecx = 0x121;
        p.hv_limit = 0x4000_0005;
        p.clear_out_of_range_leaves();

        let leaves = serialize(&p);
        assert_strictly_sorted(&leaves);

        let mut q = CpuPolicy::default();
        q.apply_leaves(&leaves).unwrap();
        assert_eq!(p, q);
    }

    const NR_POLICY_WORDS: usize = 4
        * (CPUID_GUEST_NR_BASIC
            + CPUID_GUEST_NR_CACHE
            + CPUID_GUEST_NR_FEAT
            + CPUID_GUEST_NR_TOPO
            + CPUID_GUEST_NR_XSTATE
            + CPUID_GUEST_NR_EXTD);

    prop_compose! {
        /// An arbitrary policy: fully random register words with the max
        /// leaf counters drawn from ranges that exercise every family
        /// boundary.
        fn arb_policy()(
            max_leaf in 0u32..=0x10,
            max_subleaf in 0u32..=0x4,
            extd_max in 0u32..=0x40,
            words in proptest::collection::vec(proptest::num::u32::ANY, NR_POLICY_WORDS),
            hv_limit in proptest::num::u32::ANY,
            hv2_limit in proptest::num::u32::ANY,
            platform_info in proptest::num::u32::ANY,
            arch_caps in proptest::num::u32::ANY,
        ) -> CpuPolicy {
            let mut p = CpuPolicy::default();
            let mut words = words.into_iter();

            {
                let families: [&mut [CpuidRegisters]; 6] = [
                    &mut p.basic.raw,
                    &mut p.cache.raw,
                    &mut p.feat.raw,
                    &mut p.topo.raw,
                    &mut p.xstate.raw,
                    &mut p.extd.raw,
                ];
                for slot in families.into_iter().flatten() {
                    *slot = CpuidRegisters {
                        eax: words.next().unwrap(),
                        ebx: words.next().unwrap(),
                        ecx: words.next().unwrap(),
                        edx: words.next().unwrap(),
                    };
                }
            }

            p.basic.set_max_leaf(max_leaf);
            p.feat.raw[0].eax = max_subleaf;
            p.extd.set_max_leaf(EXTD_LEAF_BASE | extd_max);
            p.hv_limit = hv_limit;
            p.hv2_limit = hv2_limit;
            p.msr.platform_info.raw = platform_info;
            p.msr.arch_caps.raw = arch_caps;
            p
        }
    }

    proptest! {
        #[test]
        fn serialized_leaves_are_strictly_sorted(p in arb_policy()) {
            let leaves = serialize(&p);
            assert_strictly_sorted(&leaves);
        }

        #[test]
        fn sanitizer_is_idempotent(mut p in arb_policy()) {
            p.clear_out_of_range_leaves();
            let once = p.clone();
            p.clear_out_of_range_leaves();
            prop_assert_eq!(p, once);
        }

        #[test]
        fn sanitized_policies_round_trip(mut p in arb_policy()) {
            p.clear_out_of_range_leaves();

            let leaves = serialize(&p);
            let mut msrs = [crate::msr::MsrEntry::default(); crate::msr::MSR_MAX_SERIALISED_ENTRIES];
            let nr_msrs = p.serialize_msrs(&mut msrs).unwrap();

            let mut q = CpuPolicy::default();
            q.apply_leaves(&leaves).unwrap();
            q.apply_msrs(&msrs[..nr_msrs]).unwrap();
            prop_assert_eq!(p, q);
        }
    }
}
