// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! CPU vendor identification from the leaf 0x0 identity string.

/// Intel identity string.
pub const VENDOR_ID_INTEL: &[u8; 12] = b"GenuineIntel";

/// AMD identity string.
pub const VENDOR_ID_AMD: &[u8; 12] = b"AuthenticAMD";

/// Centaur identity string.
pub const VENDOR_ID_CENTAUR: &[u8; 12] = b"CentaurHauls";

/// Shanghai (Zhaoxin) identity string.
pub const VENDOR_ID_SHANGHAI: &[u8; 12] = b"  Shanghai  ";

/// Hygon identity string.
pub const VENDOR_ID_HYGON: &[u8; 12] = b"HygonGenuine";

/// CPU vendors a policy can identify as.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum VendorId {
    /// No recognised identity string.
    #[default]
    Unknown,
    /// GenuineIntel
    Intel,
    /// AuthenticAMD
    Amd,
    /// CentaurHauls
    Centaur,
    /// Shanghai (Zhaoxin)
    Shanghai,
    /// HygonGenuine
    Hygon,
}

const VENDOR_TABLE: [(&[u8; 12], VendorId); 5] = [
    (VENDOR_ID_INTEL, VendorId::Intel),
    (VENDOR_ID_AMD, VendorId::Amd),
    (VENDOR_ID_CENTAUR, VendorId::Centaur),
    (VENDOR_ID_SHANGHAI, VendorId::Shanghai),
    (VENDOR_ID_HYGON, VendorId::Hygon),
];

impl VendorId {
    /// Identifies the vendor from the three identity words returned in
    /// leaf 0x0 EBX/ECX/EDX. Unrecognised (including blank or garbage)
    /// strings identify as [`VendorId::Unknown`].
    #[must_use]
    pub fn from_identity(ebx: u32, ecx: u32, edx: u32) -> Self {
        let ident = identity_bytes(ebx, ecx, edx);

        VENDOR_TABLE
            .iter()
            .find(|&&(name, _)| *name == ident)
            .map_or(Self::Unknown, |&(_, vendor)| vendor)
    }
}

/// Assembles the 12-byte identity string from the leaf 0x0 register words.
///
/// The character ordering of the string is ebx,edx,ecx; this is not a
/// mistake.
#[must_use]
pub fn identity_bytes(ebx: u32, ecx: u32, edx: u32) -> [u8; 12] {
    let (b, d, c) = (ebx.to_ne_bytes(), edx.to_ne_bytes(), ecx.to_ne_bytes());
    [
        b[0], b[1], b[2], b[3], d[0], d[1], d[2], d[3], c[0], c[1], c[2], c[3],
    ]
}
