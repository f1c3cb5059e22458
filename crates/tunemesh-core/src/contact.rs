// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use serde::{Deserialize, Serialize};

use crate::ids::Id;

/// A peer as known locally: its node id plus the endpoint URI it published.
/// Identity is the id alone — a node may re-bind to a different endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Id,
    pub endpoint: String,
}

impl Contact {
    pub fn new(id: Id, endpoint: impl Into<String>) -> Self {
        Self {
            id,
            endpoint: endpoint.into(),
        }
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl std::hash::Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_endpoint() {
        let id = Id::random();
        let a = Contact::new(id, "udp://10.0.0.1:9997/kademlia");
        let b = Contact::new(id, "udp://10.0.0.2:9997/kademlia");
        assert_eq!(a, b);
    }
}
