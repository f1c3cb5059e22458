// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::ids::Id;

/// Track metadata plus its content hash. The hash doubles as the
/// resource's primary key in the overlay namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackTag {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub tag_hash: Id,
}

impl TrackTag {
    pub fn new(title: impl Into<String>, artist: impl Into<String>, album: impl Into<String>) -> Self {
        let title = title.into();
        let artist = artist.into();
        let album = album.into();
        let tag_hash = Id::from_text(&format!("{title}\n{artist}\n{album}"));
        Self {
            title,
            artist,
            album,
            tag_hash,
        }
    }
}

/// One peer endpoint advertising a track, with the time it last
/// (re)published the advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub endpoint: String,
    pub published_unix: u64,
}

/// The stored value of the overlay: a track's metadata and every peer
/// endpoint known to serve it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: Id,
    pub tag: TrackTag,
    pub sources: Vec<SourceEntry>,
}

impl ResourceRecord {
    pub fn new(tag: TrackTag, endpoint: impl Into<String>, published_unix: u64) -> Self {
        Self {
            id: tag.tag_hash,
            tag,
            sources: vec![SourceEntry {
                endpoint: endpoint.into(),
                published_unix,
            }],
        }
    }

    pub fn source(&self, endpoint: &str) -> Option<&SourceEntry> {
        self.sources.iter().find(|s| s.endpoint == endpoint)
    }
}

/// Inverted-index row: a normalized keyword mapping to the resources
/// whose metadata produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordEntry {
    pub id: String,
    pub resources: HashSet<Id>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_hash_is_stable_over_metadata() {
        let a = TrackTag::new("Imagine", "John Lennon", "Imagine");
        let b = TrackTag::new("Imagine", "John Lennon", "Imagine");
        assert_eq!(a.tag_hash, b.tag_hash);
        assert_ne!(
            a.tag_hash,
            TrackTag::new("Imagine", "John Lennon", "Shaved Fish").tag_hash
        );
    }

    #[test]
    fn record_keeps_one_entry_per_endpoint() {
        let tag = TrackTag::new("Echoes", "Pink Floyd", "Meddle");
        let record = ResourceRecord::new(tag, "udp://10.0.0.1:9997/kademlia", 1_700_000_000);
        assert_eq!(record.sources.len(), 1);
        assert!(record.source("udp://10.0.0.1:9997/kademlia").is_some());
        assert!(record.source("udp://10.0.0.2:9997/kademlia").is_none());
    }
}
