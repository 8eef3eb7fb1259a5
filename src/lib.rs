// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Modelling and validation of guest CPU feature policies.
//!
//! A [`CpuPolicy`] is a compact description of the CPUID leaves/subleaves
//! and MSRs a virtual CPU is permitted to expose. This crate provides:
//!
//! - the structured policy representation and its index-space constants
//!   ([`policy`]);
//! - CPU vendor identification from the leaf 0 identity string
//!   ([`vendor`]);
//! - conversion between the structured policy and flat, strictly sorted
//!   record sequences for transport ([`leaves`], [`msr`]);
//! - out-of-range sanitization
//!   ([`CpuPolicy::clear_out_of_range_leaves`]);
//! - host/guest compatibility auditing ([`compat`]);
//! - a native policy loader querying the running CPU ([`native`]).
//!
//! All operations are synchronous pure-data transforms over caller-owned
//! memory: no allocation in the serialization paths, no locking, no I/O.
//! Failures are immediate typed errors carrying the offending leaf,
//! subleaf or MSR index.

/// Host/guest policy compatibility auditing.
pub mod compat;

/// Flat leaf records and the CPUID serializer/deserializer.
pub mod leaves;

/// MSR policy, flat MSR records and their serializer/deserializer.
pub mod msr;

/// Native policy loader.
pub mod native;

/// The structured policy representation.
pub mod policy;

/// CPU vendor identification.
pub mod vendor;

pub use compat::{CpuPolicyIncompatibility, policies_are_compatible};
pub use leaves::{CpuidLeaf, LeafBufferFullError, LeafRangeError, validate_leaves};
pub use msr::{
    MSR_MAX_SERIALISED_ENTRIES, MsrApplyError, MsrBufferFullError, MsrEntry, MsrPolicy,
    validate_msrs,
};
pub use policy::{
    CPUID_GUEST_NR_BASIC, CPUID_GUEST_NR_CACHE, CPUID_GUEST_NR_EXTD, CPUID_GUEST_NR_FEAT,
    CPUID_GUEST_NR_TOPO, CPUID_GUEST_NR_XSTATE, CPUID_MAX_SERIALISED_LEAVES, CPUID_NO_SUBLEAF,
    CpuPolicy, CpuidRegisters,
};
pub use vendor::VendorId;
