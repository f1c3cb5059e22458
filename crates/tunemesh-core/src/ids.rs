// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 160-bit identifier used for node ids, tag hashes, keyword lookup
/// targets, and conversation ids alike.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id(pub [u8; 20]);

pub const ID_BITS: usize = 160;

impl Id {
    /// Derive a stable id from arbitrary text (SHA-256 truncated to 20
    /// bytes). Both sides of a lookup derive the same way, so the exact
    /// digest is not protocol-critical.
    pub fn from_text(text: &str) -> Self {
        Self::from_bytes(text.as_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut id = [0u8; 20];
        id.copy_from_slice(&digest[..20]);
        Self(id)
    }

    pub fn random() -> Self {
        let mut id = [0u8; 20];
        rand::rngs::OsRng.fill_bytes(&mut id);
        Self(id)
    }

    pub fn xor_distance(&self, other: &Self) -> [u8; 20] {
        let mut out = [0u8; 20];
        for (idx, byte) in out.iter_mut().enumerate() {
            *byte = self.0[idx] ^ other.0[idx];
        }
        out
    }

    /// Compare `self` and `other` by XOR distance to `target`.
    pub fn distance_cmp(&self, target: &Self, other: &Self) -> std::cmp::Ordering {
        let a = self.xor_distance(target);
        let b = other.xor_distance(target);
        a.cmp(&b)
    }

    /// Number of leading bits shared with `other` (0..=160). Equal ids
    /// share all 160.
    pub fn common_prefix_len(&self, other: &Self) -> usize {
        let distance = self.xor_distance(other);
        for (byte_idx, byte) in distance.iter().copied().enumerate() {
            if byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_BITS
    }

    pub fn from_hex(hex_str: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 20 {
            anyhow::bail!("id must be 20 bytes, got {}", bytes.len());
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(&bytes);
        Ok(Self(id))
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Id({})", hex::encode(&self.0[..4]))
    }
}
