// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::{HashMap, HashSet};

use crate::{
    ids::Id,
    keywords::{generate_keywords, StopWords, KEYWORD_PREFIX},
    records::{KeywordEntry, ResourceRecord, SourceEntry, TrackTag},
    store::PersistedRepository,
};

/// Sources older than this are dropped by [`Repository::expire`].
pub const EXPIRE_TIME_SECS: u64 = 24 * 60 * 60;

/// Keyword-indexed resource store. Two primary collections (resources and
/// keyword entries) plus two secondary indices: `keys_by_tag` fans a
/// resource out to the keywords its metadata produced, and `empty_keys`
/// collects keyword ids whose last resource vanished, pending prune.
#[derive(Debug, Default)]
pub struct Repository {
    resources: HashMap<Id, ResourceRecord>,
    keywords: HashMap<String, KeywordEntry>,
    keys_by_tag: HashMap<Id, HashSet<String>>,
    empty_keys: HashSet<String>,
    stop_words: StopWords,
}

impl Repository {
    pub fn new(stop_words: StopWords) -> Self {
        Self {
            stop_words,
            ..Default::default()
        }
    }

    /// Record that `endpoint` serves the track described by `tag`.
    ///
    /// Known `(resource, endpoint)` pairs are merged: the newest
    /// publication time wins and no keyword work happens. A fresh
    /// resource is created and indexed under every keyword its metadata
    /// generates.
    pub fn store_resource(&mut self, tag: TrackTag, endpoint: &str, published_unix: u64) {
        if let Some(record) = self.resources.get_mut(&tag.tag_hash) {
            match record.sources.iter_mut().find(|s| s.endpoint == endpoint) {
                Some(source) => source.published_unix = source.published_unix.max(published_unix),
                None => record.sources.push(SourceEntry {
                    endpoint: endpoint.to_string(),
                    published_unix,
                }),
            }
            return;
        }

        let record = ResourceRecord::new(tag, endpoint, published_unix);
        let resource_id = record.id;
        let keyword_ids = generate_keywords(&record.tag, &self.stop_words);
        for keyword_id in &keyword_ids {
            self.keywords
                .entry(keyword_id.clone())
                .or_insert_with(|| KeywordEntry {
                    id: keyword_id.clone(),
                    resources: HashSet::new(),
                })
                .resources
                .insert(resource_id);
        }
        self.keys_by_tag.insert(resource_id, keyword_ids);
        self.resources.insert(resource_id, record);
    }

    /// Every resource whose keywords contain any query token as a
    /// substring. Matching is containment over normalized keywords, so a
    /// partial query ("lenn") finds the full keyword ("lennon").
    pub fn search(&self, query: &str) -> Vec<ResourceRecord> {
        let tokens = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>();
        if tokens.is_empty() {
            return Vec::new();
        }

        let mut hits = HashSet::new();
        for entry in self.keywords.values() {
            let keyword = entry.id.strip_prefix(KEYWORD_PREFIX).unwrap_or(&entry.id);
            if tokens.iter().any(|token| keyword.contains(token.as_str())) {
                hits.extend(entry.resources.iter().copied());
            }
        }

        let mut records = hits
            .into_iter()
            .filter_map(|id| self.resources.get(&id).cloned())
            .collect::<Vec<_>>();
        records.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        records
    }

    pub fn get(&self, id: &Id) -> Option<&ResourceRecord> {
        self.resources.get(id)
    }

    pub fn contains_source(&self, id: &Id, endpoint: &str) -> bool {
        self.publication_time(id, endpoint).is_some()
    }

    pub fn publication_time(&self, id: &Id, endpoint: &str) -> Option<u64> {
        self.resources
            .get(id)?
            .source(endpoint)
            .map(|s| s.published_unix)
    }

    /// Overwrite the publication time of a known `(resource, endpoint)`
    /// pair. Returns false when either side is unknown.
    pub fn refresh_source(&mut self, id: &Id, endpoint: &str, published_unix: u64) -> bool {
        let Some(record) = self.resources.get_mut(id) else {
            return false;
        };
        let Some(source) = record.sources.iter_mut().find(|s| s.endpoint == endpoint) else {
            return false;
        };
        source.published_unix = published_unix;
        true
    }

    /// Drop sources not republished within [`EXPIRE_TIME_SECS`]; resources
    /// left without any source are deleted outright, keyword index
    /// included.
    pub fn expire(&mut self, now_unix: u64) {
        let mut emptied = Vec::new();
        for record in self.resources.values_mut() {
            record
                .sources
                .retain(|s| now_unix.saturating_sub(s.published_unix) <= EXPIRE_TIME_SECS);
            if record.sources.is_empty() {
                emptied.push(record.id);
            }
        }
        for id in emptied {
            self.delete_resource(&id);
        }
    }

    /// Remove a resource and unlink it from every keyword that referenced
    /// it. Keyword entries left empty are pruned.
    pub fn delete_resource(&mut self, id: &Id) {
        if self.resources.remove(id).is_none() {
            return;
        }
        let keyword_ids = self.keys_by_tag.remove(id).unwrap_or_default();
        for keyword_id in keyword_ids {
            if let Some(entry) = self.keywords.get_mut(&keyword_id) {
                entry.resources.remove(id);
                if entry.resources.is_empty() {
                    self.empty_keys.insert(keyword_id);
                }
            }
        }
        self.prune_empty_keys();
    }

    fn prune_empty_keys(&mut self) {
        for keyword_id in self.empty_keys.drain() {
            if self
                .keywords
                .get(&keyword_id)
                .is_some_and(|entry| entry.resources.is_empty())
            {
                self.keywords.remove(&keyword_id);
            }
        }
    }

    /// Iteration surface for the replication loop.
    pub fn all_resources(&self) -> Vec<ResourceRecord> {
        self.resources.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn to_persisted(&self) -> PersistedRepository {
        PersistedRepository {
            resources: self.resources.values().cloned().collect(),
            keywords: self.keywords.values().cloned().collect(),
            keys_by_tag: self
                .keys_by_tag
                .iter()
                .map(|(id, keys)| (*id, keys.iter().cloned().collect()))
                .collect(),
            empty_keys: self.empty_keys.iter().cloned().collect(),
        }
    }

    pub fn from_persisted(persisted: PersistedRepository, stop_words: StopWords) -> Self {
        let mut repo = Self::new(stop_words);
        repo.resources = persisted
            .resources
            .into_iter()
            .map(|record| (record.id, record))
            .collect();
        repo.keywords = persisted
            .keywords
            .into_iter()
            .map(|entry| (entry.id.clone(), entry))
            .collect();
        repo.keys_by_tag = persisted
            .keys_by_tag
            .into_iter()
            .map(|(id, keys)| (id, keys.into_iter().collect()))
            .collect();
        repo.empty_keys = persisted.empty_keys.into_iter().collect();
        repo.prune_empty_keys();
        repo
    }

    #[cfg(test)]
    fn keyword_count(&self) -> usize {
        self.keywords.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> Repository {
        Repository::new(StopWords::default())
    }

    const PEER_A: &str = "udp://10.0.0.1:9997/kademlia";
    const PEER_B: &str = "udp://10.0.0.2:9997/kademlia";

    #[test]
    fn store_indexes_every_generated_keyword() {
        let mut repo = repo();
        let tag = TrackTag::new("Imagine", "John Lennon", "Imagine");
        repo.store_resource(tag.clone(), PEER_A, 1_000);

        for keyword_id in generate_keywords(&tag, &StopWords::default()) {
            let entry = repo.keywords.get(&keyword_id).expect("keyword indexed");
            assert!(entry.resources.contains(&tag.tag_hash));
        }
        assert_eq!(
            repo.keys_by_tag.get(&tag.tag_hash).map(|k| k.len()),
            Some(repo.keyword_count())
        );
    }

    #[test]
    fn repeated_store_for_same_endpoint_is_idempotent() {
        let mut repo = repo();
        let tag = TrackTag::new("Echoes", "Pink Floyd", "Meddle");
        repo.store_resource(tag.clone(), PEER_A, 1_000);
        repo.store_resource(tag.clone(), PEER_A, 2_000);

        let record = repo.get(&tag.tag_hash).expect("stored");
        assert_eq!(record.sources.len(), 1);
        assert_eq!(record.sources[0].published_unix, 2_000);

        // An older publication never rolls the time back.
        repo.store_resource(tag.clone(), PEER_A, 500);
        assert_eq!(repo.publication_time(&tag.tag_hash, PEER_A), Some(2_000));
    }

    #[test]
    fn second_endpoint_merges_into_existing_record() {
        let mut repo = repo();
        let tag = TrackTag::new("Echoes", "Pink Floyd", "Meddle");
        repo.store_resource(tag.clone(), PEER_A, 1_000);
        repo.store_resource(tag.clone(), PEER_B, 1_500);

        let record = repo.get(&tag.tag_hash).expect("stored");
        assert_eq!(record.sources.len(), 2);
        assert!(repo.contains_source(&tag.tag_hash, PEER_B));
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn search_matches_substrings_of_keywords() {
        let mut repo = repo();
        repo.store_resource(TrackTag::new("Imagine", "John Lennon", "Imagine"), PEER_A, 1_000);
        repo.store_resource(TrackTag::new("Echoes", "Pink Floyd", "Meddle"), PEER_A, 1_000);

        let hits = repo.search("lenn");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tag.artist, "John Lennon");

        assert!(repo.search("imagine floyd").len() == 2);
        assert!(repo.search("").is_empty());
        assert!(repo.search("zeppelin").is_empty());
    }

    #[test]
    fn delete_unlinks_keywords_and_prunes_empties() {
        let mut repo = repo();
        let shared = TrackTag::new("Wish You Were Here", "Pink Floyd", "");
        let other = TrackTag::new("Money", "Pink Floyd", "");
        repo.store_resource(shared.clone(), PEER_A, 1_000);
        repo.store_resource(other.clone(), PEER_A, 1_000);

        repo.delete_resource(&shared.tag_hash);

        assert!(repo.get(&shared.tag_hash).is_none());
        for entry in repo.keywords.values() {
            assert!(!entry.resources.contains(&shared.tag_hash));
            assert!(!entry.resources.is_empty());
        }
        // "pink"/"floyd" survive through the other track.
        assert!(!repo.search("floyd").is_empty());
        assert!(repo.search("wish").is_empty());
    }

    #[test]
    fn expire_drops_stale_sources_then_empty_records() {
        let mut repo = repo();
        let tag = TrackTag::new("Time", "Pink Floyd", "The Dark Side of the Moon");
        repo.store_resource(tag.clone(), PEER_A, 1_000);
        repo.store_resource(tag.clone(), PEER_B, 1_000 + EXPIRE_TIME_SECS);

        repo.expire(1_000 + EXPIRE_TIME_SECS + 1);
        let record = repo.get(&tag.tag_hash).expect("fresh source remains");
        assert_eq!(record.sources.len(), 1);
        assert_eq!(record.sources[0].endpoint, PEER_B);

        repo.expire(1_000 + 2 * EXPIRE_TIME_SECS + 1);
        assert!(repo.get(&tag.tag_hash).is_none());
        assert_eq!(repo.keyword_count(), 0);
    }

    #[test]
    fn persisted_roundtrip_preserves_index() {
        let mut repo = repo();
        let tag = TrackTag::new("Imagine", "John Lennon", "Imagine");
        repo.store_resource(tag.clone(), PEER_A, 1_000);

        let restored =
            Repository::from_persisted(repo.to_persisted(), StopWords::default());
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.search("imagine").len(), 1);
        assert!(restored.contains_source(&tag.tag_hash, PEER_A));
    }
}
