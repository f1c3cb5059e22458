// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use tokio::sync::{oneshot, Mutex};

use crate::{
    ids::Id,
    records::TrackTag,
    wire::{Envelope, MsgKind},
};

/// How long a caller blocks on a response before treating the peer as
/// down for that lookup.
pub const MAX_SYNC_WAIT: Duration = Duration::from_millis(500);

/// Unclaimed responses and pending store offers older than this are
/// evicted by the cache sweeper.
pub const MAX_CACHE_TIME: Duration = Duration::from_secs(30);

struct WaiterState {
    waiting: HashMap<Id, oneshot::Sender<Envelope>>,
    unclaimed: HashMap<Id, (Envelope, Instant)>,
}

impl WaiterState {
    /// Remove and return the cached response for a conversation, but only
    /// when its discriminant is one of `expected`. A mismatch leaves the
    /// entry in place.
    fn take_unclaimed_matching(
        &mut self,
        conversation_id: &Id,
        expected: &[MsgKind],
    ) -> Option<Envelope> {
        let matches = self
            .unclaimed
            .get(conversation_id)
            .is_some_and(|(envelope, _)| {
                expected.iter().any(|kind| envelope.kind == *kind as u16)
            });
        if !matches {
            return None;
        }
        self.unclaimed
            .remove(conversation_id)
            .map(|(envelope, _)| envelope)
    }
}

/// Correlates inbound responses to waiting callers by conversation id.
///
/// At most one waiter per conversation; a waiter is resolved either by
/// response arrival or by the caller's timeout. Responses that arrive
/// with nobody waiting are kept briefly so a typed retrieval can still
/// claim them before the sweeper does.
pub struct ResponseWaiters {
    inner: Mutex<WaiterState>,
}

impl Default for ResponseWaiters {
    fn default() -> Self {
        Self {
            inner: Mutex::new(WaiterState {
                waiting: HashMap::new(),
                unclaimed: HashMap::new(),
            }),
        }
    }
}

impl ResponseWaiters {
    /// Register interest in a conversation, naming the response kinds the
    /// caller accepts. A response that already arrived is delivered
    /// through the returned channel immediately — but only when its
    /// discriminant matches; a cached envelope of the wrong kind stays
    /// put for the sweeper.
    pub async fn register(
        &self,
        conversation_id: Id,
        expected: &[MsgKind],
    ) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.lock().await;
        match state.take_unclaimed_matching(&conversation_id, expected) {
            Some(envelope) => {
                let _ = tx.send(envelope);
            }
            None => {
                state.waiting.insert(conversation_id, tx);
            }
        }
        rx
    }

    /// Hand an inbound response to its waiter, or cache it when nobody is
    /// listening (the caller may already have timed out).
    pub async fn resolve(&self, envelope: Envelope) {
        let conversation_id = envelope.conversation_id;
        let mut state = self.inner.lock().await;
        match state.waiting.remove(&conversation_id) {
            Some(tx) => {
                if let Err(envelope) = tx.send(envelope) {
                    state
                        .unclaimed
                        .insert(conversation_id, (envelope, Instant::now()));
                }
            }
            None => {
                state
                    .unclaimed
                    .insert(conversation_id, (envelope, Instant::now()));
            }
        }
    }

    /// Typed retrieval: the cached response is returned and removed only
    /// when its discriminant matches `kind`.
    pub async fn take_matching(&self, conversation_id: &Id, kind: MsgKind) -> Option<Envelope> {
        self.inner
            .lock()
            .await
            .take_unclaimed_matching(conversation_id, &[kind])
    }

    /// Drop a waiter whose caller gave up.
    pub async fn forget(&self, conversation_id: &Id) {
        let mut state = self.inner.lock().await;
        state.waiting.remove(conversation_id);
    }

    pub async fn evict(&self, max_age: Duration) {
        let now = Instant::now();
        let mut state = self.inner.lock().await;
        state
            .unclaimed
            .retain(|_, (_, arrived)| now.duration_since(*arrived) <= max_age);
        state.waiting.retain(|_, tx| !tx.is_closed());
    }
}

/// An accepted inbound store offer, waiting for its data message.
#[derive(Debug, Clone)]
pub struct AcceptedOffer {
    pub originator_endpoint: String,
    pub accepted_at: Instant,
}

/// An outbound store offer, waiting for the recipient's verdict.
#[derive(Debug, Clone)]
pub struct SentOffer {
    pub tag: TrackTag,
    pub published_unix: u64,
    pub sent_at: Instant,
}

/// The two sides of the two-phase store protocol, each keyed by
/// conversation id and guarded by its own lock.
#[derive(Default)]
pub struct StoreOffers {
    accepted: Mutex<HashMap<Id, AcceptedOffer>>,
    sent: Mutex<HashMap<Id, SentOffer>>,
}

impl StoreOffers {
    pub async fn accept(&self, conversation_id: Id, originator_endpoint: String) {
        self.accepted.lock().await.insert(
            conversation_id,
            AcceptedOffer {
                originator_endpoint,
                accepted_at: Instant::now(),
            },
        );
    }

    pub async fn take_accepted(&self, conversation_id: &Id) -> Option<AcceptedOffer> {
        self.accepted.lock().await.remove(conversation_id)
    }

    pub async fn record_sent(&self, conversation_id: Id, tag: TrackTag, published_unix: u64) {
        self.sent.lock().await.insert(
            conversation_id,
            SentOffer {
                tag,
                published_unix,
                sent_at: Instant::now(),
            },
        );
    }

    pub async fn take_sent(&self, conversation_id: &Id) -> Option<SentOffer> {
        self.sent.lock().await.remove(conversation_id)
    }

    pub async fn evict(&self, max_age: Duration) {
        let now = Instant::now();
        self.accepted
            .lock()
            .await
            .retain(|_, offer| now.duration_since(offer.accepted_at) <= max_age);
        self.sent
            .lock()
            .await
            .retain(|_, offer| now.duration_since(offer.sent_at) <= max_age);
    }
}
