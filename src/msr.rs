// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! MSR half of a policy: a fixed set of model-specific registers with
//! per-register valid-bit masks, and its flat serialized form.

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::policy::{CpuPolicy, set_bit};

/// MSR_PLATFORM_INFO (Intel), carrying the CPUID-faulting capability bit.
pub const MSR_INTEL_PLATFORM_INFO: u32 = 0xce;

/// MSR_ARCH_CAPABILITIES, enumerating hardware speculation controls.
pub const MSR_ARCH_CAPABILITIES: u32 = 0x10a;

/// Number of records MSR serialization always emits.
pub const MSR_MAX_SERIALISED_ENTRIES: usize = 2;

/// One serialized MSR record. Fixed `repr(C)` layout, 16 bytes, stable
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
pub struct MsrEntry {
    /// MSR index.
    pub idx: u32,
    /// Reserved, must be zero.
    pub flags: u32,
    /// MSR value.
    pub val: u64,
}

/// MSR_PLATFORM_INFO contents.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PlatformInfoMsr {
    /// Raw value. Only the low 32 bits are modelled.
    pub raw: u32,
}

impl PlatformInfoMsr {
    const CPUID_FAULTING_BIT: u8 = 31;

    /// Whether CPUID faulting is available (bit 31).
    #[must_use]
    pub fn cpuid_faulting(&self) -> bool {
        self.raw & (1 << Self::CPUID_FAULTING_BIT) != 0
    }

    /// Sets the CPUID faulting capability bit.
    pub fn set_cpuid_faulting(&mut self, available: bool) {
        set_bit(&mut self.raw, Self::CPUID_FAULTING_BIT, available);
    }
}

/// MSR_ARCH_CAPABILITIES contents.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArchCapsMsr {
    /// Raw value. Only the low 32 bits are modelled.
    pub raw: u32,
}

impl ArchCapsMsr {
    /// Whether the CPU is not susceptible to rogue data cache load
    /// (RDCL_NO, bit 0).
    #[must_use]
    pub fn rdcl_no(&self) -> bool {
        self.raw & 1 != 0
    }
}

/// The MSRs a policy permits a guest to observe.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MsrPolicy {
    /// MSR_PLATFORM_INFO (0xce).
    pub platform_info: PlatformInfoMsr,
    /// MSR_ARCH_CAPABILITIES (0x10a).
    pub arch_caps: ArchCapsMsr,
}

/// One supported MSR: its index, the bits a value may legally carry, and
/// accessors into [`MsrPolicy`].
struct MsrDesc {
    idx: u32,
    valid_bits: u64,
    get: fn(&MsrPolicy) -> u64,
    set: fn(&mut MsrPolicy, u64),
}

/// The fixed supported-MSR list, in ascending index order. Serialization
/// walks this table; deserialization accepts exactly these indices.
const SUPPORTED_MSRS: [MsrDesc; MSR_MAX_SERIALISED_ENTRIES] = [
    MsrDesc {
        idx: MSR_INTEL_PLATFORM_INFO,
        valid_bits: u32::MAX as u64,
        get: |msr| u64::from(msr.platform_info.raw),
        set: |msr, val| msr.platform_info.raw = val as u32,
    },
    MsrDesc {
        idx: MSR_ARCH_CAPABILITIES,
        valid_bits: u32::MAX as u64,
        get: |msr| u64::from(msr.arch_caps.raw),
        set: |msr, val| msr.arch_caps.raw = val as u32,
    },
];

/// Error type for [`CpuPolicy::serialize_msrs`].
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("Destination buffer with capacity {capacity} cannot hold {MSR_MAX_SERIALISED_ENTRIES} MSR entries.")]
pub struct MsrBufferFullError {
    /// Capacity of the buffer the caller supplied.
    pub capacity: usize,
}

/// Error type for [`CpuPolicy::apply_msrs`] and [`validate_msrs`].
#[derive(Debug, thiserror::Error, displaydoc::Display, Clone, Copy, PartialEq, Eq)]
pub enum MsrApplyError {
    /// MSR {0:#x} is not in the supported set.
    UnknownIndex(u32),
    /// MSR {0:#x} record has reserved flags set.
    ReservedFlags(u32),
    /// MSR {0:#x} value has bits set outside the valid-bit mask and would be truncated.
    Truncated(u32),
}

impl MsrApplyError {
    /// Index of the offending MSR.
    #[must_use]
    pub fn msr(&self) -> u32 {
        match self {
            Self::UnknownIndex(idx) | Self::ReservedFlags(idx) | Self::Truncated(idx) => *idx,
        }
    }
}

impl CpuPolicy {
    /// Serializes the MSR half of the policy into `buf`, returning the
    /// number of records written: always [`MSR_MAX_SERIALISED_ENTRIES`],
    /// in ascending index order.
    ///
    /// # Errors
    ///
    /// When `buf` holds fewer than [`MSR_MAX_SERIALISED_ENTRIES`] records.
    pub fn serialize_msrs(&self, buf: &mut [MsrEntry]) -> Result<usize, MsrBufferFullError> {
        if buf.len() < SUPPORTED_MSRS.len() {
            return Err(MsrBufferFullError {
                capacity: buf.len(),
            });
        }

        for (slot, desc) in buf.iter_mut().zip(&SUPPORTED_MSRS) {
            *slot = MsrEntry {
                idx: desc.idx,
                flags: 0,
                val: (desc.get)(&self.msr),
            };
        }

        Ok(SUPPORTED_MSRS.len())
    }

    /// Writes each record of `entries` into the policy's MSR set,
    /// stopping at the first invalid record. Values round-trip exactly: a
    /// record whose value cannot be stored without truncation is
    /// rejected, never silently masked.
    ///
    /// Records written before a failure are not rolled back; on error the
    /// caller must discard the policy.
    ///
    /// # Errors
    ///
    /// - [`MsrApplyError::ReservedFlags`] when a record has nonzero flags.
    /// - [`MsrApplyError::UnknownIndex`] when the index is not supported.
    /// - [`MsrApplyError::Truncated`] when the value has bits outside the
    ///   MSR's valid-bit mask.
    pub fn apply_msrs(&mut self, entries: &[MsrEntry]) -> Result<(), MsrApplyError> {
        for data in entries {
            copy_msr_into(Some(&mut self.msr), data)?;
        }
        Ok(())
    }
}

/// Range- and value-checks `entries` without mutating any policy: the
/// probe-mode twin of [`CpuPolicy::apply_msrs`].
///
/// # Errors
///
/// As [`CpuPolicy::apply_msrs`].
pub fn validate_msrs(entries: &[MsrEntry]) -> Result<(), MsrApplyError> {
    for data in entries {
        copy_msr_into(None, data)?;
    }
    Ok(())
}

fn copy_msr_into(policy: Option<&mut MsrPolicy>, data: &MsrEntry) -> Result<(), MsrApplyError> {
    if data.flags != 0 {
        return Err(MsrApplyError::ReservedFlags(data.idx));
    }

    let desc = SUPPORTED_MSRS
        .iter()
        .find(|desc| desc.idx == data.idx)
        .ok_or(MsrApplyError::UnknownIndex(data.idx))?;

    if data.val & !desc.valid_bits != 0 {
        return Err(MsrApplyError::Truncated(data.idx));
    }

    if let Some(msr) = policy {
        (desc.set)(msr, data.val);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;

    #[test]
    fn serialize_empty_policy() {
        let p = CpuPolicy::default();
        let mut buf = [MsrEntry::default(); MSR_MAX_SERIALISED_ENTRIES];
        let nr = p.serialize_msrs(&mut buf).unwrap();

        assert_eq!(nr, MSR_MAX_SERIALISED_ENTRIES);
        assert!(buf.iter().tuple_windows().all(|(a, b)| a.idx < b.idx));
        assert_eq!(buf[0].idx, MSR_INTEL_PLATFORM_INFO);
        assert_eq!(buf[1].idx, MSR_ARCH_CAPABILITIES);
        assert!(buf.iter().all(|e| e.flags == 0 && e.val == 0));
    }

    #[test]
    fn serialize_buffer_too_small() {
        let p = CpuPolicy::default();
        let mut buf = [MsrEntry::default(); 1];
        assert_eq!(
            p.serialize_msrs(&mut buf),
            Err(MsrBufferFullError { capacity: 1 })
        );
    }

    #[test]
    fn deserialize_failures() {
        let tests: &[(&str, MsrEntry, MsrApplyError)] = &[
            (
                "bad msr index",
                MsrEntry {
                    idx: 0xdead_c0de,
                    flags: 0,
                    val: 0,
                },
                MsrApplyError::UnknownIndex(0xdead_c0de),
            ),
            (
                "nonzero flags",
                MsrEntry {
                    idx: 0xce,
                    flags: 1,
                    val: 0,
                },
                MsrApplyError::ReservedFlags(0xce),
            ),
            (
                "truncated platform_info",
                MsrEntry {
                    idx: 0xce,
                    flags: 0,
                    val: !0,
                },
                MsrApplyError::Truncated(0xce),
            ),
            (
                "truncated arch_caps",
                MsrEntry {
                    idx: 0x10a,
                    flags: 0,
                    val: !0,
                },
                MsrApplyError::Truncated(0x10a),
            ),
        ];

        for (name, entry, expected) in tests {
            // Probe mode performs zero writes.
            assert_eq!(
                validate_msrs(std::slice::from_ref(entry)),
                Err(*expected),
                "test {name}"
            );
            assert_eq!(expected.msr(), entry.idx, "test {name}");
        }
    }

    #[test]
    fn values_within_mask_round_trip() {
        let mut p = CpuPolicy::default();
        p.msr.platform_info.set_cpuid_faulting(true);
        p.msr.arch_caps.raw = 0x0000_002b;

        let mut buf = [MsrEntry::default(); MSR_MAX_SERIALISED_ENTRIES];
        let nr = p.serialize_msrs(&mut buf).unwrap();

        let mut q = CpuPolicy::default();
        q.apply_msrs(&buf[..nr]).unwrap();
        assert_eq!(p.msr, q.msr);
        assert!(q.msr.platform_info.cpuid_faulting());
        assert!(q.msr.arch_caps.rdcl_no());
    }

    #[test]
    fn deserialize_stops_at_first_failure() {
        let mut p = CpuPolicy::default();
        let entries = [
            MsrEntry {
                idx: 0xce,
                flags: 0,
                val: 1 << 31,
            },
            MsrEntry {
                idx: 0xce,
                flags: 1,
                val: 0,
            },
            MsrEntry {
                idx: 0x10a,
                flags: 0,
                val: 1,
            },
        ];

        assert_eq!(
            p.apply_msrs(&entries),
            Err(MsrApplyError::ReservedFlags(0xce))
        );
        // The record before the failure landed; the one after did not.
        assert!(p.msr.platform_info.cpuid_faulting());
        assert_eq!(p.msr.arch_caps.raw, 0);
    }
}
