// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! The overlay node: RPC handlers, iterative lookups, the two-phase store
//! lifecycle, and the background maintenance loops.

use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, SystemTime},
};

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    config::NodeConfig,
    contact::Contact,
    ids::Id,
    keywords::StopWords,
    pending::{ResponseWaiters, StoreOffers, MAX_CACHE_TIME, MAX_SYNC_WAIT},
    records::{ResourceRecord, TrackTag},
    repository::Repository,
    routing::{RoutingTable, K},
    store::{MemoryStore, SqliteStore, Store},
    transport::MessageTransport,
    wire::{
        Envelope, FindNode, FindNodeResult, FindValue, FindValueHits, FindValueNodes, MsgKind,
        Ping, Pong, StoreData, StoreQuery, StoreResult, WirePayload,
    },
};

/// Lookup parallelism per wave.
pub const ALPHA: usize = 3;

/// Admission requests beyond this are dropped rather than queued.
pub const ADMISSION_QUEUE_CAPACITY: usize = 10;

/// How often the cache sweeper evicts aged correlation and offer entries.
pub const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Locally held resources are re-advertised when the last replication
/// pass is older than this.
pub const REPLICATE_TIME_SECS: u64 = 60 * 60;

/// Buckets idle longer than this get refreshed with a random-id lookup.
pub const REFRESH_TIME: Duration = Duration::from_secs(60 * 60);

/// Publication times further in the future than this are rejected.
pub const MAX_CLOCK_SKEW_SECS: u64 = 60 * 60;

pub fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

struct NodeState {
    routing: RoutingTable,
    repository: Repository,
    last_replication_unix: u64,
    store: Arc<dyn Store>,
}

struct NodeInner {
    self_contact: Contact,
    state: RwLock<NodeState>,
    waiters: ResponseWaiters,
    offers: StoreOffers,
    transport: Arc<dyn MessageTransport>,
    admission_tx: mpsc::Sender<Contact>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheaply cloneable handle to a running overlay node.
#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeInner>,
}

pub struct Node;

impl Node {
    /// Boot a node: load the persisted repository, start the admission
    /// worker, the cache sweeper, and the maintenance loop.
    pub async fn start(
        config: NodeConfig,
        transport: Arc<dyn MessageTransport>,
    ) -> anyhow::Result<NodeHandle> {
        let store: Arc<dyn Store> = match &config.repository_path {
            Some(path) => SqliteStore::open(path)?,
            None => MemoryStore::new(),
        };
        Self::start_with_store(config, transport, store).await
    }

    pub async fn start_with_store(
        config: NodeConfig,
        transport: Arc<dyn MessageTransport>,
        store: Arc<dyn Store>,
    ) -> anyhow::Result<NodeHandle> {
        let persisted = store.load().await?;
        let repository = Repository::from_persisted(persisted, StopWords::default());

        let local_id = Id::random();
        let self_contact = Contact::new(local_id, config.endpoint.clone());
        let (admission_tx, admission_rx) = mpsc::channel(ADMISSION_QUEUE_CAPACITY);

        let handle = NodeHandle {
            inner: Arc::new(NodeInner {
                self_contact,
                state: RwLock::new(NodeState {
                    routing: RoutingTable::new(local_id),
                    repository,
                    last_replication_unix: now_unix_secs(),
                    store,
                }),
                waiters: ResponseWaiters::default(),
                offers: StoreOffers::default(),
                transport,
                admission_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        };

        let admission = tokio::spawn(handle.clone().run_admission(admission_rx));
        let sweeper = tokio::spawn(handle.clone().run_cache_sweeper());
        let maintenance = tokio::spawn(handle.clone().run_maintenance());
        handle
            .inner
            .tasks
            .lock()
            .await
            .extend([admission, sweeper, maintenance]);

        Ok(handle)
    }
}

impl NodeHandle {
    pub fn local_id(&self) -> Id {
        self.inner.self_contact.id
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.self_contact.endpoint
    }

    pub fn contact(&self) -> Contact {
        self.inner.self_contact.clone()
    }

    /// Advertise a track as served by this node, then offer it to the K
    /// closest peers. Best-effort: unreachable peers are simply skipped.
    pub async fn publish(&self, tag: TrackTag) -> anyhow::Result<()> {
        let now = now_unix_secs();
        {
            let mut state = self.inner.state.write().await;
            let endpoint = self.endpoint().to_string();
            state.repository.store_resource(tag.clone(), &endpoint, now);
        }
        self.persist().await?;
        self.iterative_store(tag, now, None).await;
        Ok(())
    }

    /// Keyword search: local matches win, otherwise an iterative value
    /// lookup asks the overlay. Empty when nothing matches anywhere.
    pub async fn search(&self, query: &str) -> Vec<ResourceRecord> {
        let local = {
            let state = self.inner.state.read().await;
            state.repository.search(query)
        };
        if !local.is_empty() {
            return local;
        }
        self.iterative_find_value(query).await
    }

    /// Join the overlay through a seed peer. True when the seed answered
    /// and the join lookup ran.
    pub async fn bootstrap(&self, seed_endpoint: &str) -> bool {
        let Some(envelope) = self
            .request(seed_endpoint, WirePayload::Ping(Ping {}), &[MsgKind::Pong])
            .await
        else {
            return false;
        };
        {
            let mut state = self.inner.state.write().await;
            state.routing.put(envelope.sender_contact());
        }
        let _ = self.iterative_find_node(self.local_id()).await;
        true
    }

    /// Queue a freshly seen contact for admission. Drops silently when
    /// the queue is saturated.
    pub fn saw_contact(&self, contact: Contact) {
        if contact.id == self.local_id() {
            return;
        }
        if self.inner.admission_tx.try_send(contact).is_err() {
            debug!("admission queue full, contact dropped");
        }
    }

    pub async fn has_contact(&self, id: &Id) -> bool {
        self.inner.state.read().await.routing.contains(id)
    }

    pub async fn resource_count(&self) -> usize {
        self.inner.state.read().await.repository.len()
    }

    /// Persist the repository snapshot without holding the state lock
    /// across the write.
    pub async fn persist(&self) -> anyhow::Result<()> {
        let (snapshot, store) = {
            let state = self.inner.state.read().await;
            (state.repository.to_persisted(), state.store.clone())
        };
        store.save(&snapshot).await
    }

    /// Stop the background loops and flush the repository.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.persist().await
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    /// Entry point for the transport: every inbound envelope lands here.
    pub async fn handle_envelope(&self, envelope: Envelope) {
        if envelope.sender_id == self.local_id() {
            return;
        }
        self.saw_contact(envelope.sender_contact());

        let payload = match envelope.to_typed() {
            Ok(payload) => payload,
            Err(err) => {
                debug!("undecodable envelope from {}: {err:#}", envelope.sender_endpoint);
                return;
            }
        };

        if payload.is_response() {
            self.inner.waiters.resolve(envelope.clone()).await;
        }

        match payload {
            WirePayload::Ping(_) => {
                self.reply(&envelope, WirePayload::Pong(Pong {})).await;
            }
            WirePayload::FindNode(req) => self.handle_find_node(&envelope, req).await,
            WirePayload::FindValue(req) => self.handle_find_value(&envelope, req).await,
            WirePayload::StoreQuery(req) => self.handle_store_query(&envelope, req).await,
            WirePayload::StoreResult(req) => self.handle_store_result(&envelope, req).await,
            WirePayload::StoreData(req) => self.handle_store_data(&envelope, req).await,
            WirePayload::Pong(_)
            | WirePayload::FindNodeResult(_)
            | WirePayload::FindValueNodes(_)
            | WirePayload::FindValueHits(_) => {}
        }
    }

    async fn handle_find_node(&self, envelope: &Envelope, req: FindNode) {
        let contacts = {
            let mut state = self.inner.state.write().await;
            state.routing.touch(&req.target);
            state
                .routing
                .close_contacts(&req.target, K, Some(&envelope.sender_id))
        };
        self.reply(
            envelope,
            WirePayload::FindNodeResult(FindNodeResult { contacts }),
        )
        .await;
    }

    async fn handle_find_value(&self, envelope: &Envelope, req: FindValue) {
        let target = Id::from_text(&req.query);
        let (hits, contacts) = {
            let mut state = self.inner.state.write().await;
            state.routing.touch(&target);
            let hits = state.repository.search(&req.query);
            if hits.is_empty() {
                let contacts = state
                    .routing
                    .close_contacts(&target, K, Some(&envelope.sender_id));
                (hits, contacts)
            } else {
                (hits, Vec::new())
            }
        };
        let payload = if hits.is_empty() {
            WirePayload::FindValueNodes(FindValueNodes { contacts })
        } else {
            WirePayload::FindValueHits(FindValueHits { resources: hits })
        };
        self.reply(envelope, payload).await;
    }

    /// First phase of an inbound store. Unknown (hash, originator) pairs
    /// are accepted and asked for data; a strictly newer in-skew
    /// publication refreshes silently; everything else is ignored.
    async fn handle_store_query(&self, envelope: &Envelope, req: StoreQuery) {
        let now = now_unix_secs();
        enum Verdict {
            Accept,
            Refreshed,
            Ignore,
        }
        let verdict = {
            let mut state = self.inner.state.write().await;
            match state
                .repository
                .publication_time(&req.tag_hash, &req.originator_endpoint)
            {
                None => Verdict::Accept,
                Some(stored)
                    if req.published_unix > stored
                        && req.published_unix <= now + MAX_CLOCK_SKEW_SECS =>
                {
                    state.repository.refresh_source(
                        &req.tag_hash,
                        &req.originator_endpoint,
                        req.published_unix,
                    );
                    Verdict::Refreshed
                }
                Some(_) => Verdict::Ignore,
            }
        };
        match verdict {
            Verdict::Accept => {
                self.inner
                    .offers
                    .accept(envelope.conversation_id, req.originator_endpoint)
                    .await;
                self.reply(
                    envelope,
                    WirePayload::StoreResult(StoreResult { send_data: true }),
                )
                .await;
            }
            Verdict::Refreshed => {
                // Deliberate protocol silence: the refresh sends no reply.
                if let Err(err) = self.persist().await {
                    warn!("persist after refresh failed: {err:#}");
                }
            }
            Verdict::Ignore => {}
        }
    }

    async fn handle_store_result(&self, envelope: &Envelope, req: StoreResult) {
        if !req.send_data {
            return;
        }
        let Some(offer) = self.inner.offers.take_sent(&envelope.conversation_id).await else {
            return;
        };
        let payload = WirePayload::StoreData(StoreData {
            tag: offer.tag,
            published_unix: offer.published_unix,
        });
        self.reply(envelope, payload).await;
    }

    /// Second phase of an inbound store: only accepted conversations with
    /// an in-skew publication time and a self-consistent tag are kept.
    async fn handle_store_data(&self, envelope: &Envelope, req: StoreData) {
        let now = now_unix_secs();
        if req.published_unix > now + MAX_CLOCK_SKEW_SECS {
            warn!(
                "store data from {} rejected: publication too far in the future",
                envelope.sender_endpoint
            );
            return;
        }
        let Some(offer) = self
            .inner
            .offers
            .take_accepted(&envelope.conversation_id)
            .await
        else {
            return;
        };
        let expected = TrackTag::new(&req.tag.title, &req.tag.artist, &req.tag.album);
        if expected.tag_hash != req.tag.tag_hash {
            warn!(
                "store data from {} rejected: tag hash mismatch",
                envelope.sender_endpoint
            );
            return;
        }
        {
            let mut state = self.inner.state.write().await;
            state
                .repository
                .store_resource(req.tag, &offer.originator_endpoint, req.published_unix);
        }
        if let Err(err) = self.persist().await {
            warn!("persist after store failed: {err:#}");
        }
    }

    // ------------------------------------------------------------------
    // Iterative operations
    // ------------------------------------------------------------------

    /// Wave-based lookup for the K contacts closest to `target`. Peers
    /// that miss the response window drop out of the shortlist only; the
    /// routing table keeps them until admission evicts them.
    pub async fn iterative_find_node(&self, target: Id) -> Vec<Contact> {
        let local_id = self.local_id();
        let mut shortlist = {
            let mut state = self.inner.state.write().await;
            state.routing.touch(&target);
            state.routing.close_contacts(&target, ALPHA, Some(&local_id))
        };
        let mut seen: HashSet<Id> = shortlist.iter().map(|c| c.id).collect();
        seen.insert(local_id);
        let mut queried: HashSet<Id> = HashSet::new();
        let mut responded = 0usize;

        loop {
            let wave = shortlist
                .iter()
                .filter(|c| !queried.contains(&c.id))
                .take(ALPHA)
                .cloned()
                .collect::<Vec<_>>();
            if wave.is_empty() || responded >= K {
                break;
            }

            for contact in wave {
                queried.insert(contact.id);
                match self.find_node_rpc(&contact, target).await {
                    Some(found) => {
                        responded += 1;
                        for candidate in found {
                            if seen.insert(candidate.id) {
                                shortlist.push(candidate);
                            }
                        }
                    }
                    None => {
                        shortlist.retain(|c| c.id != contact.id);
                    }
                }
                if responded >= K {
                    break;
                }
            }
            shortlist.sort_by(|a, b| a.id.distance_cmp(&target, &b.id));
        }

        shortlist.sort_by(|a, b| a.id.distance_cmp(&target, &b.id));
        shortlist.truncate(K);
        shortlist
    }

    /// Like the node lookup, but any peer holding matching resources ends
    /// the search immediately.
    pub async fn iterative_find_value(&self, query: &str) -> Vec<ResourceRecord> {
        let target = Id::from_text(query);
        let local_id = self.local_id();
        let mut shortlist = {
            let mut state = self.inner.state.write().await;
            state.routing.touch(&target);
            state.routing.close_contacts(&target, ALPHA, Some(&local_id))
        };
        let mut seen: HashSet<Id> = shortlist.iter().map(|c| c.id).collect();
        seen.insert(local_id);
        let mut queried: HashSet<Id> = HashSet::new();
        let mut responded = 0usize;

        loop {
            let wave = shortlist
                .iter()
                .filter(|c| !queried.contains(&c.id))
                .take(ALPHA)
                .cloned()
                .collect::<Vec<_>>();
            if wave.is_empty() || responded >= K {
                break;
            }

            for contact in wave {
                queried.insert(contact.id);
                match self.find_value_rpc(&contact, query).await {
                    Some(FindValueReply::Hits(resources)) => return resources,
                    Some(FindValueReply::Nodes(found)) => {
                        responded += 1;
                        for candidate in found {
                            if seen.insert(candidate.id) {
                                shortlist.push(candidate);
                            }
                        }
                    }
                    None => {
                        shortlist.retain(|c| c.id != contact.id);
                    }
                }
                if responded >= K {
                    break;
                }
            }
            shortlist.sort_by(|a, b| a.id.distance_cmp(&target, &b.id));
        }

        Vec::new()
    }

    /// Offer a track to the K contacts closest to its hash. When
    /// replicating a foreign resource the original holder's endpoint is
    /// passed through as originator.
    pub async fn iterative_store(
        &self,
        tag: TrackTag,
        published_unix: u64,
        originator_endpoint: Option<String>,
    ) {
        let originator =
            originator_endpoint.unwrap_or_else(|| self.endpoint().to_string());
        let closest = self.iterative_find_node(tag.tag_hash).await;
        for contact in closest {
            let conversation_id = Id::random();
            self.inner
                .offers
                .record_sent(conversation_id, tag.clone(), published_unix)
                .await;
            let payload = WirePayload::StoreQuery(StoreQuery {
                tag_hash: tag.tag_hash,
                published_unix,
                originator_endpoint: originator.clone(),
            });
            if let Err(err) = self
                .send_payload(&contact.endpoint, conversation_id, &payload)
                .await
            {
                debug!("store offer to {} failed: {err:#}", contact.endpoint);
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound RPC plumbing
    // ------------------------------------------------------------------

    async fn send_payload(
        &self,
        endpoint: &str,
        conversation_id: Id,
        payload: &WirePayload,
    ) -> anyhow::Result<()> {
        let envelope = Envelope::from_typed(&self.inner.self_contact, conversation_id, payload)?;
        self.inner.transport.send(endpoint, envelope).await
    }

    async fn reply(&self, request: &Envelope, payload: WirePayload) {
        if let Err(err) = self
            .send_payload(&request.sender_endpoint, request.conversation_id, &payload)
            .await
        {
            debug!("reply to {} failed: {err:#}", request.sender_endpoint);
        }
    }

    /// Send a request and wait up to [`MAX_SYNC_WAIT`] for a response of
    /// one of the `expected` kinds under the same conversation id. `None`
    /// means the peer is down for this lookup.
    async fn request(
        &self,
        endpoint: &str,
        payload: WirePayload,
        expected: &[MsgKind],
    ) -> Option<Envelope> {
        let conversation_id = Id::random();
        let rx = self.inner.waiters.register(conversation_id, expected).await;
        if let Err(err) = self.send_payload(endpoint, conversation_id, &payload).await {
            debug!("request to {endpoint} failed: {err:#}");
            self.inner.waiters.forget(&conversation_id).await;
            return None;
        }
        match tokio::time::timeout(MAX_SYNC_WAIT, rx).await {
            Ok(Ok(envelope)) => Some(envelope),
            _ => {
                self.inner.waiters.forget(&conversation_id).await;
                None
            }
        }
    }

    async fn ping(&self, endpoint: &str) -> bool {
        matches!(
            self.request(endpoint, WirePayload::Ping(Ping {}), &[MsgKind::Pong])
                .await
                .map(|e| e.kind),
            Some(kind) if kind == MsgKind::Pong as u16
        )
    }

    async fn find_node_rpc(&self, contact: &Contact, target: Id) -> Option<Vec<Contact>> {
        let envelope = self
            .request(
                &contact.endpoint,
                WirePayload::FindNode(FindNode { target }),
                &[MsgKind::FindNodeResult],
            )
            .await?;
        match envelope.to_typed().ok()? {
            WirePayload::FindNodeResult(result) => Some(result.contacts),
            _ => None,
        }
    }

    async fn find_value_rpc(&self, contact: &Contact, query: &str) -> Option<FindValueReply> {
        let envelope = self
            .request(
                &contact.endpoint,
                WirePayload::FindValue(FindValue {
                    query: query.to_string(),
                }),
                &[MsgKind::FindValueHits, MsgKind::FindValueNodes],
            )
            .await?;
        match envelope.to_typed().ok()? {
            WirePayload::FindValueHits(hits) => Some(FindValueReply::Hits(hits.resources)),
            WirePayload::FindValueNodes(nodes) => Some(FindValueReply::Nodes(nodes.contacts)),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Background loops
    // ------------------------------------------------------------------

    /// Drain the admission queue, applying the bucket rules. The blocker
    /// ping happens without holding the state lock.
    async fn run_admission(self, mut rx: mpsc::Receiver<Contact>) {
        while let Some(contact) = rx.recv().await {
            self.admit(contact).await;
        }
    }

    async fn admit(&self, contact: Contact) {
        if contact.id == self.local_id() {
            return;
        }
        let blocker = {
            let mut state = self.inner.state.write().await;
            if let Some(existing) = state.routing.get(&contact.id).cloned() {
                if existing.endpoint != contact.endpoint {
                    state.routing.put(contact);
                } else {
                    state.routing.promote(&contact.id);
                }
                return;
            }
            if state.routing.put(contact.clone()) {
                return;
            }
            state.routing.blocker(&contact.id)
        };
        let Some(blocker) = blocker else {
            return;
        };

        if self.ping(&blocker.endpoint).await {
            // Blocker is alive: keep it, drop the applicant.
            let mut state = self.inner.state.write().await;
            state.routing.promote(&blocker.id);
            debug!("applicant {} rejected, blocker alive", contact.id);
        } else {
            let mut state = self.inner.state.write().await;
            state.routing.remove(&blocker.id);
            state.routing.put(contact);
        }
    }

    async fn run_cache_sweeper(self) {
        loop {
            tokio::time::sleep(CACHE_SWEEP_INTERVAL).await;
            self.inner.waiters.evict(MAX_CACHE_TIME).await;
            self.inner.offers.evict(MAX_CACHE_TIME).await;
        }
    }

    async fn run_maintenance(self) {
        loop {
            tokio::time::sleep(MAINTENANCE_INTERVAL).await;
            if let Err(err) = self.maintenance_once().await {
                warn!("maintenance pass failed: {err:#}");
            }
        }
    }

    /// One maintenance pass: expire stale sources, re-advertise local
    /// resources when the replication window lapsed, refresh idle
    /// buckets.
    pub async fn maintenance_once(&self) -> anyhow::Result<()> {
        let now = now_unix_secs();
        let replicate = {
            let mut state = self.inner.state.write().await;
            state.repository.expire(now);
            if now.saturating_sub(state.last_replication_unix) > REPLICATE_TIME_SECS {
                state.last_replication_unix = now;
                Some(state.repository.all_resources())
            } else {
                None
            }
        };
        self.persist().await?;

        if let Some(resources) = replicate {
            for record in resources {
                for source in record.sources {
                    self.iterative_store(
                        record.tag.clone(),
                        source.published_unix,
                        Some(source.endpoint),
                    )
                    .await;
                }
            }
        }

        let candidates = {
            let state = self.inner.state.read().await;
            state.routing.refresh_candidates(REFRESH_TIME)
        };
        for target in candidates {
            let _ = self.iterative_find_node(target).await;
        }
        Ok(())
    }
}

enum FindValueReply {
    Nodes(Vec<Contact>),
    Hits(Vec<ResourceRecord>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// In-memory swarm: endpoints map to node handles, delivery is a
    /// spawned task per envelope. Endpoints marked silent accept sends
    /// and never deliver, which exercises the response timeout.
    #[derive(Default)]
    struct Loopback {
        nodes: RwLock<HashMap<String, NodeHandle>>,
        silent: RwLock<HashSet<String>>,
    }

    struct LoopbackTransport {
        network: Arc<Loopback>,
    }

    #[async_trait]
    impl MessageTransport for LoopbackTransport {
        async fn send(&self, endpoint: &str, envelope: Envelope) -> anyhow::Result<()> {
            if self.network.silent.read().await.contains(endpoint) {
                return Ok(());
            }
            let Some(handle) = self.network.nodes.read().await.get(endpoint).cloned() else {
                anyhow::bail!("no route to {endpoint}");
            };
            // Exercise the wire codec on every hop.
            let bytes = envelope.encode()?;
            let envelope = Envelope::decode(&bytes)?;
            tokio::spawn(async move {
                handle.handle_envelope(envelope).await;
            });
            Ok(())
        }
    }

    async fn spawn_node(network: &Arc<Loopback>, endpoint: &str) -> NodeHandle {
        let transport = Arc::new(LoopbackTransport {
            network: network.clone(),
        });
        let config = NodeConfig {
            endpoint: endpoint.to_string(),
            ..NodeConfig::default()
        };
        let handle = Node::start(config, transport).await.expect("start node");
        network
            .nodes
            .write()
            .await
            .insert(endpoint.to_string(), handle.clone());
        handle
    }

    /// Poll until `check` passes or two seconds elapse.
    async fn wait_for<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    const U_A: &str = "udp://10.0.0.1:9997/kademlia";
    const U_B: &str = "udp://10.0.0.2:9997/kademlia";

    #[tokio::test]
    async fn bootstrap_links_both_nodes() {
        let network = Arc::new(Loopback::default());
        let a = spawn_node(&network, U_A).await;
        let b = spawn_node(&network, U_B).await;

        assert!(b.bootstrap(U_A).await);

        assert!(
            wait_for(|| async { b.has_contact(&a.local_id()).await }).await,
            "seed should enter the joining node's table"
        );
        assert!(
            wait_for(|| async { a.has_contact(&b.local_id()).await }).await,
            "joining node should enter the seed's table"
        );
    }

    #[tokio::test]
    async fn bootstrap_against_dead_seed_fails() {
        let network = Arc::new(Loopback::default());
        let a = spawn_node(&network, U_A).await;
        assert!(!a.bootstrap("udp://10.9.9.9:9997/kademlia").await);
    }

    #[tokio::test]
    async fn published_track_is_searchable_from_peer() {
        let network = Arc::new(Loopback::default());
        let a = spawn_node(&network, U_A).await;
        let b = spawn_node(&network, U_B).await;
        assert!(b.bootstrap(U_A).await);
        wait_for(|| async { a.has_contact(&b.local_id()).await }).await;

        let tag = TrackTag::new("Imagine", "John Lennon", "Imagine");
        a.publish(tag.clone()).await.expect("publish");

        let hits = b.search("imagine").await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tag.title, "Imagine");
        assert_eq!(hits[0].id, tag.tag_hash);
        assert!(
            hits[0].sources.iter().any(|s| s.endpoint == U_A),
            "publisher endpoint should be listed as a source"
        );
    }

    #[tokio::test]
    async fn two_phase_store_replicates_to_peer() {
        let network = Arc::new(Loopback::default());
        let a = spawn_node(&network, U_A).await;
        let b = spawn_node(&network, U_B).await;
        assert!(b.bootstrap(U_A).await);
        wait_for(|| async { a.has_contact(&b.local_id()).await }).await;

        let tag = TrackTag::new("Echoes", "Pink Floyd", "Meddle");
        a.publish(tag.clone()).await.expect("publish");

        assert!(
            wait_for(|| async { b.resource_count().await == 1 }).await,
            "offer/accept/data exchange should land the record on the peer"
        );
        // A second publish refreshes silently instead of duplicating.
        a.publish(tag.clone()).await.expect("republish");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(b.resource_count().await, 1);
        let hits = b.search("echoes").await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].sources.len(), 1);
    }

    #[tokio::test]
    async fn store_data_with_future_publication_is_dropped() {
        let network = Arc::new(Loopback::default());
        let a = spawn_node(&network, U_A).await;
        let stranger = Contact::new(Id::random(), "udp://10.0.0.9:9997/kademlia");
        let tag = TrackTag::new("Time", "Pink Floyd", "The Dark Side of the Moon");
        let conversation = Id::random();

        let query = Envelope::from_typed(
            &stranger,
            conversation,
            &WirePayload::StoreQuery(StoreQuery {
                tag_hash: tag.tag_hash,
                published_unix: now_unix_secs(),
                originator_endpoint: stranger.endpoint.clone(),
            }),
        )
        .expect("query envelope");
        a.handle_envelope(query).await;

        let data = Envelope::from_typed(
            &stranger,
            conversation,
            &WirePayload::StoreData(StoreData {
                tag: tag.clone(),
                published_unix: now_unix_secs() + 2 * MAX_CLOCK_SKEW_SECS,
            }),
        )
        .expect("data envelope");
        a.handle_envelope(data).await;

        assert_eq!(a.resource_count().await, 0);

        // The accepted offer survives the skewed attempt, so a sane
        // retransmission still lands.
        let sane = Envelope::from_typed(
            &stranger,
            conversation,
            &WirePayload::StoreData(StoreData {
                tag,
                published_unix: now_unix_secs(),
            }),
        )
        .expect("sane envelope");
        a.handle_envelope(sane).await;
        assert_eq!(a.resource_count().await, 1);
    }

    #[tokio::test]
    async fn store_data_without_accepted_offer_is_dropped() {
        let network = Arc::new(Loopback::default());
        let a = spawn_node(&network, U_A).await;
        let stranger = Contact::new(Id::random(), "udp://10.0.0.9:9997/kademlia");
        let data = Envelope::from_typed(
            &stranger,
            Id::random(),
            &WirePayload::StoreData(StoreData {
                tag: TrackTag::new("Money", "Pink Floyd", ""),
                published_unix: now_unix_secs(),
            }),
        )
        .expect("data envelope");
        a.handle_envelope(data).await;
        assert_eq!(a.resource_count().await, 0);
    }

    #[tokio::test]
    async fn admission_pings_blocker_before_evicting() {
        let network = Arc::new(Loopback::default());
        let a = spawn_node(&network, U_A).await;

        // Fill one bucket with contacts whose endpoints never answer.
        // Admission runs through a bounded queue, so wait for each one.
        let mut first_id = None;
        for i in 0..K as u8 {
            let mut id = a.local_id().0;
            id[0] ^= 0x80;
            id[19] = id[19].wrapping_add(i.wrapping_add(1));
            let id = Id(id);
            first_id.get_or_insert(id);
            a.saw_contact(Contact::new(id, format!("udp://10.1.0.{i}:9997/kademlia")));
            assert!(
                wait_for(|| async { a.has_contact(&id).await }).await,
                "contact should be admitted while the bucket has room"
            );
        }
        let first_id = first_id.expect("at least one contact");

        // Applicant for the same bucket: the stalest contact is
        // unreachable, so it is evicted and the applicant admitted.
        let mut id = a.local_id().0;
        id[0] ^= 0x80;
        id[19] = id[19].wrapping_add(0xEE);
        let applicant = Id(id);
        a.saw_contact(Contact::new(applicant, "udp://10.2.0.1:9997/kademlia"));
        assert!(
            wait_for(|| async { a.has_contact(&applicant).await }).await,
            "applicant should replace the dead blocker"
        );
        assert!(!a.has_contact(&first_id).await);
    }

    #[tokio::test]
    async fn admission_keeps_live_blocker() {
        let network = Arc::new(Loopback::default());
        let a = spawn_node(&network, U_A).await;
        let b = spawn_node(&network, U_B).await;

        // A live node seeds the bucket, then dead contacts from the same
        // bucket fill the remaining slots behind it.
        let mut live_id = b.local_id().0;
        live_id[0] = a.local_id().0[0] ^ 0x80;
        let live = Id(live_id);
        let live_node_contact = Contact::new(live, U_B.to_string());
        a.saw_contact(live_node_contact.clone());
        wait_for(|| async { a.has_contact(&live).await }).await;

        for i in 1..K as u8 {
            let mut id = a.local_id().0;
            id[0] ^= 0x80;
            id[18] = i;
            let id = Id(id);
            a.saw_contact(Contact::new(id, format!("udp://10.1.1.{i}:9997/kademlia")));
            assert!(
                wait_for(|| async { a.has_contact(&id).await }).await,
                "contact should be admitted while the bucket has room"
            );
        }

        // The blocker (the live node, stalest) answers the ping, so the
        // applicant is dropped.
        let mut id = a.local_id().0;
        id[0] ^= 0x80;
        id[17] = 0x55;
        let applicant = Id(id);
        a.saw_contact(Contact::new(applicant, "udp://10.2.0.2:9997/kademlia"));
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(a.has_contact(&live).await, "live blocker must be kept");
        assert!(!a.has_contact(&applicant).await, "applicant must be dropped");
    }

    #[tokio::test]
    async fn lookup_survives_silent_peer() {
        let network = Arc::new(Loopback::default());
        let a = spawn_node(&network, U_A).await;
        let b = spawn_node(&network, U_B).await;
        assert!(b.bootstrap(U_A).await);
        wait_for(|| async { a.has_contact(&b.local_id()).await }).await;

        // A silent contact: sends reach it but nothing ever comes back.
        let silent_endpoint = "udp://10.3.0.1:9997/kademlia";
        network
            .silent
            .write()
            .await
            .insert(silent_endpoint.to_string());
        let silent_id = Id::random();
        b.saw_contact(Contact::new(silent_id, silent_endpoint));
        wait_for(|| async { b.has_contact(&silent_id).await }).await;

        let target = Id::random();
        let found = b.iterative_find_node(target).await;
        assert!(
            found.iter().any(|c| c.id == a.local_id()),
            "responsive peer must contribute results"
        );
        assert!(
            found.iter().all(|c| c.id != silent_id),
            "silent peer drops out of the shortlist"
        );
        // ... but stays in the routing table until admission evicts it.
        assert!(b.has_contact(&silent_id).await);
    }

    #[tokio::test]
    async fn lookup_results_are_sorted_and_capped() {
        let network = Arc::new(Loopback::default());
        let a = spawn_node(&network, U_A).await;
        let b = spawn_node(&network, U_B).await;
        assert!(b.bootstrap(U_A).await);

        let target = Id::random();
        let found = b.iterative_find_node(target).await;
        assert!(found.len() <= K);
        let mut ids = HashSet::new();
        for c in &found {
            assert!(ids.insert(c.id), "results must be distinct");
        }
        for pair in found.windows(2) {
            assert!(
                pair[0].id.distance_cmp(&target, &pair[1].id).is_le(),
                "results must be sorted by distance"
            );
        }
    }

    #[tokio::test]
    async fn search_spans_a_small_swarm() {
        let network = Arc::new(Loopback::default());
        let endpoints = [
            "udp://10.0.1.1:9997/kademlia",
            "udp://10.0.1.2:9997/kademlia",
            "udp://10.0.1.3:9997/kademlia",
            "udp://10.0.1.4:9997/kademlia",
        ];
        let mut nodes = Vec::new();
        for endpoint in endpoints {
            nodes.push(spawn_node(&network, endpoint).await);
        }
        for node in &nodes[1..] {
            assert!(node.bootstrap(endpoints[0]).await);
        }
        wait_for(|| async { nodes[0].has_contact(&nodes[3].local_id()).await }).await;

        let tag = TrackTag::new("Wish You Were Here", "Pink Floyd", "Wish You Were Here");
        nodes[0].publish(tag.clone()).await.expect("publish");

        let found = wait_for(|| async {
            let hits = nodes[3].search("wish floyd").await;
            hits.iter().any(|r| r.id == tag.tag_hash)
        })
        .await;
        assert!(found, "search should reach the published track");
    }

    #[tokio::test]
    async fn shutdown_persists_repository() {
        let network = Arc::new(Loopback::default());
        let store = MemoryStore::new();
        let transport = Arc::new(LoopbackTransport {
            network: network.clone(),
        });
        let config = NodeConfig {
            endpoint: U_A.to_string(),
            ..NodeConfig::default()
        };
        let a = Node::start_with_store(config, transport, store.clone())
            .await
            .expect("start node");
        network.nodes.write().await.insert(U_A.to_string(), a.clone());

        a.publish(TrackTag::new("Imagine", "John Lennon", "Imagine"))
            .await
            .expect("publish");
        a.shutdown().await.expect("shutdown");

        let persisted = store.load().await.expect("load");
        assert_eq!(persisted.resources.len(), 1);
        assert!(!persisted.keywords.is_empty());
    }
}
