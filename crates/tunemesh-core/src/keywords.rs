// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::HashSet;

use crate::records::TrackTag;

/// Namespace prefix for keyword entries in the repository.
pub const KEYWORD_PREFIX: &str = "keyword/";

/// Keywords are truncated to this many characters before indexing.
pub const MAX_KEYWORD_LEN: usize = 32;

/// Articles, prepositions, and conjunctions excluded from indexing.
/// English, Italian, and French; the list is closed and reproducible.
const BUILTIN_STOP_WORDS: &[&str] = &[
    // English
    "a", "an", "the", "of", "in", "on", "at", "to", "for", "with", "by",
    "from", "into", "over", "under", "and", "or", "but", "nor", "so", "yet",
    "as", "if", "than", "that", "because", "while", "although", "though",
    // Italian
    "il", "lo", "la", "i", "gli", "le", "un", "uno", "una", "di", "da",
    "del", "dello", "della", "dei", "degli", "delle", "nel", "nella", "sul",
    "sulla", "per", "con", "su", "tra", "fra", "e", "ed", "o", "od", "ma",
    "se", "che", "anche", "oppure",
    // French
    "les", "une", "des", "du", "de", "en", "au", "aux", "et", "ou", "mais",
    "donc", "ni", "car", "que", "qui", "dans", "sur", "sous", "avec",
    "pour", "par", "si",
];

/// The stop-word filter applied before indexing. Constructed once per
/// repository; callers may extend the builtin list for additional
/// languages.
#[derive(Debug, Clone)]
pub struct StopWords {
    words: HashSet<String>,
}

impl Default for StopWords {
    fn default() -> Self {
        Self {
            words: BUILTIN_STOP_WORDS.iter().map(|w| w.to_string()).collect(),
        }
    }
}

impl StopWords {
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut this = Self::default();
        this.words
            .extend(extra.into_iter().map(|w| w.into().to_lowercase()));
        this
    }

    pub fn contains(&self, token: &str) -> bool {
        self.words.contains(token)
    }
}

/// Lowercase, ASCII-fold, and truncate a single token.
pub fn normalize_token(token: &str) -> String {
    token
        .to_lowercase()
        .chars()
        .map(fold_char)
        .take(MAX_KEYWORD_LEN)
        .collect()
}

fn fold_char(c: char) -> char {
    match c {
        'à' | 'á' | 'â' | 'ä' | 'ã' | 'å' => 'a',
        'è' | 'é' | 'ê' | 'ë' => 'e',
        'ì' | 'í' | 'î' | 'ï' => 'i',
        'ò' | 'ó' | 'ô' | 'ö' | 'õ' => 'o',
        'ù' | 'ú' | 'û' | 'ü' => 'u',
        'ç' => 'c',
        'ñ' => 'n',
        other => other,
    }
}

/// Derive the deduplicated set of keyword ids for a track: concatenated
/// metadata, stop-words removed, whitespace collapsed, each surviving
/// token normalized and prefixed with [`KEYWORD_PREFIX`].
pub fn generate_keywords(tag: &TrackTag, stop_words: &StopWords) -> HashSet<String> {
    let text = format!("{} {} {}", tag.title, tag.artist, tag.album);
    text.split_whitespace()
        .map(normalize_token)
        .filter(|token| !token.is_empty() && !stop_words.contains(token))
        .map(|token| format!("{KEYWORD_PREFIX}{token}"))
        .collect()
}
