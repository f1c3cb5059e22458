// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::time::{Duration, Instant};

use rand::RngCore;

use crate::{
    contact::Contact,
    ids::{Id, ID_BITS},
};

pub const K: usize = 20;

/// One k-bucket: contacts ordered least-recently-seen first, so the head
/// is always the eviction candidate.
#[derive(Debug, Clone)]
struct Bucket {
    contacts: Vec<Contact>,
    last_lookup: Instant,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Self {
            contacts: Vec::new(),
            last_lookup: now,
        }
    }
}

/// Kademlia routing table: 160 buckets keyed on the common-prefix length
/// between the local id and a candidate. The local id itself is never a
/// member.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    local_id: Id,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local_id: Id) -> Self {
        let now = Instant::now();
        Self {
            local_id,
            buckets: (0..ID_BITS).map(|_| Bucket::new(now)).collect(),
        }
    }

    pub fn local_id(&self) -> Id {
        self.local_id
    }

    /// Bucket index for `id`, or `None` for the local id (zero distance).
    fn bucket_index(&self, id: &Id) -> Option<usize> {
        let prefix = self.local_id.common_prefix_len(id);
        (prefix < ID_BITS).then_some(prefix)
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: &Id) -> Option<&Contact> {
        let idx = self.bucket_index(id)?;
        self.buckets[idx].contacts.iter().find(|c| &c.id == id)
    }

    /// Insert a contact into its bucket. Returns false when the bucket is
    /// already full (the caller decides between keeping the blocker and
    /// evicting it) or when the contact is the local node.
    pub fn put(&mut self, contact: Contact) -> bool {
        let Some(idx) = self.bucket_index(&contact.id) else {
            return false;
        };
        let bucket = &mut self.buckets[idx];
        if let Some(pos) = bucket.contacts.iter().position(|c| c.id == contact.id) {
            // Re-binding: keep position, replace the endpoint.
            bucket.contacts[pos] = contact;
            return true;
        }
        if bucket.contacts.len() >= K {
            return false;
        }
        bucket.contacts.push(contact);
        true
    }

    /// Move a contact to the most-recently-seen end of its bucket.
    pub fn promote(&mut self, id: &Id) -> bool {
        let Some(idx) = self.bucket_index(id) else {
            return false;
        };
        let bucket = &mut self.buckets[idx];
        let Some(pos) = bucket.contacts.iter().position(|c| &c.id == id) else {
            return false;
        };
        let contact = bucket.contacts.remove(pos);
        bucket.contacts.push(contact);
        true
    }

    pub fn remove(&mut self, id: &Id) -> bool {
        let Some(idx) = self.bucket_index(id) else {
            return false;
        };
        let bucket = &mut self.buckets[idx];
        let Some(pos) = bucket.contacts.iter().position(|c| &c.id == id) else {
            return false;
        };
        bucket.contacts.remove(pos);
        true
    }

    /// The contact that would be evicted if `id`'s bucket is full: the
    /// least-recently-seen one. `None` while the bucket still has room.
    pub fn blocker(&self, id: &Id) -> Option<Contact> {
        let idx = self.bucket_index(id)?;
        let bucket = &self.buckets[idx];
        if bucket.contacts.len() < K {
            return None;
        }
        bucket.contacts.first().cloned()
    }

    /// Record that a lookup passed through `target`'s bucket.
    pub fn touch(&mut self, target: &Id) {
        if let Some(idx) = self.bucket_index(target) {
            self.buckets[idx].last_lookup = Instant::now();
        }
    }

    /// The `n` contacts closest to `target` by XOR distance, drawn across
    /// all buckets, optionally excluding one id.
    pub fn close_contacts(&self, target: &Id, n: usize, exclude: Option<&Id>) -> Vec<Contact> {
        let mut all = self
            .buckets
            .iter()
            .flat_map(|b| b.contacts.iter())
            .filter(|c| exclude.map_or(true, |skip| &c.id != skip))
            .cloned()
            .collect::<Vec<_>>();
        all.sort_by(|a, b| a.id.distance_cmp(target, &b.id));
        all.truncate(n);
        all
    }

    /// For every bucket whose last lookup is older than `threshold`, a
    /// random id falling inside that bucket's distance range.
    pub fn refresh_candidates(&self, threshold: Duration) -> Vec<Id> {
        let now = Instant::now();
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| now.duration_since(bucket.last_lookup) > threshold)
            .map(|(idx, _)| random_id_in_bucket(&self.local_id, idx))
            .collect()
    }

    #[cfg(test)]
    fn bucket_len(&self, idx: usize) -> usize {
        self.buckets[idx].contacts.len()
    }
}

/// Build a random id sharing exactly `bucket_idx` leading bits with
/// `local`: copy the shared prefix, flip the next bit, randomize the rest.
fn random_id_in_bucket(local: &Id, bucket_idx: usize) -> Id {
    let mut bytes = [0u8; 20];
    rand::rngs::OsRng.fill_bytes(&mut bytes);

    for bit in 0..bucket_idx {
        let mask = 0x80u8 >> (bit % 8);
        let byte = bit / 8;
        bytes[byte] = (bytes[byte] & !mask) | (local.0[byte] & mask);
    }
    let mask = 0x80u8 >> (bucket_idx % 8);
    let byte = bucket_idx / 8;
    bytes[byte] = (bytes[byte] & !mask) | (!local.0[byte] & mask);

    Id(bytes)
}
