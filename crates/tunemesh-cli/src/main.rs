// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::net::UdpSocket;
use tracing::debug;
use tunemesh_core::{
    Envelope, MemoryStore, MessageTransport, Node, NodeConfig, NodeHandle, SqliteStore, Store,
    TrackTag, MAX_ENVELOPE_BYTES,
};

#[derive(Parser)]
#[command(name = "tunemesh")]
#[command(about = "tunemesh reference peer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a peer until Ctrl-C.
    Start {
        #[arg(long, default_value = "tunemesh.db")]
        state_db: String,
        #[arg(long, default_value_t = 9997)]
        port: u16,
        /// Endpoint URI advertised to other peers; derived from the port
        /// when omitted.
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long = "bootstrap", value_name = "URI")]
        bootstrap: Option<String>,
    },
    /// Advertise a track on the overlay.
    Publish {
        #[arg(long, default_value = "tunemesh.db")]
        state_db: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        artist: String,
        #[arg(long, default_value = "")]
        album: String,
        #[arg(long = "bootstrap", value_name = "URI")]
        bootstrap: Option<String>,
    },
    /// Keyword search across the overlay.
    Search {
        #[arg(long, default_value = "tunemesh.db")]
        state_db: String,
        #[arg(long)]
        query: String,
        #[arg(long = "bootstrap", value_name = "URI")]
        bootstrap: Option<String>,
    },
    /// Dump the local repository.
    Inspect {
        #[arg(long, default_value = "tunemesh.db")]
        state_db: String,
    },
}

/// Datagram binding for the overlay: one socket, envelopes CBOR-encoded,
/// endpoints of the form `udp://host:port/kademlia`.
struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    async fn bind(port: u16) -> anyhow::Result<Arc<Self>> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
        }))
    }

    fn local_port(&self) -> anyhow::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Pump inbound datagrams into the node until the task is aborted.
    fn spawn_inbound(&self, handle: NodeHandle) -> tokio::task::JoinHandle<()> {
        let socket = self.socket.clone();
        tokio::spawn(async move {
            // Sized to the envelope cap so nothing legitimate is
            // truncated by the kernel before the decode-side check runs.
            let mut buf = vec![0u8; MAX_ENVELOPE_BYTES];
            loop {
                let Ok((len, _from)) = socket.recv_from(&mut buf).await else {
                    continue;
                };
                match Envelope::decode(&buf[..len]) {
                    Ok(envelope) => {
                        let handle = handle.clone();
                        tokio::spawn(async move {
                            handle.handle_envelope(envelope).await;
                        });
                    }
                    Err(err) => debug!("dropping undecodable datagram: {err:#}"),
                }
            }
        })
    }
}

#[async_trait]
impl MessageTransport for UdpTransport {
    async fn send(&self, endpoint: &str, envelope: Envelope) -> anyhow::Result<()> {
        let addr = resolve_endpoint(endpoint).await?;
        let bytes = envelope.encode()?;
        self.socket.send_to(&bytes, addr).await?;
        Ok(())
    }
}

/// Resolve `udp://host:port/...` to a socket address.
async fn resolve_endpoint(endpoint: &str) -> anyhow::Result<SocketAddr> {
    let Some(rest) = endpoint.strip_prefix("udp://") else {
        anyhow::bail!("endpoint must start with udp://: {endpoint}");
    };
    let host_port = rest.split('/').next().unwrap_or(rest);
    tokio::net::lookup_host(host_port)
        .await?
        .next()
        .ok_or_else(|| anyhow::anyhow!("endpoint does not resolve: {endpoint}"))
}

fn open_store(state_db: &str) -> anyhow::Result<Arc<dyn Store>> {
    if state_db == ":memory:" {
        Ok(MemoryStore::new())
    } else {
        Ok(SqliteStore::open(state_db)?)
    }
}

/// Boot a node on a bound socket and wire the inbound pump. Ephemeral
/// commands pass port 0 and advertise whatever the OS assigned.
async fn start_node(
    state_db: &str,
    port: u16,
    endpoint: Option<String>,
    bootstrap: Option<&str>,
) -> anyhow::Result<(NodeHandle, tokio::task::JoinHandle<()>)> {
    let transport = UdpTransport::bind(port).await?;
    let endpoint = match endpoint {
        Some(uri) => uri,
        None => format!("udp://localhost:{}/kademlia", transport.local_port()?),
    };
    let config = NodeConfig {
        endpoint,
        udp_port: transport.local_port()?,
        repository_path: None,
        bootstrap_endpoint: bootstrap.map(|b| b.to_string()),
        ..NodeConfig::default()
    };
    let store = open_store(state_db)?;
    let handle = Node::start_with_store(config, transport.clone(), store).await?;
    let inbound = transport.spawn_inbound(handle.clone());

    if let Some(seed) = bootstrap {
        if handle.bootstrap(seed).await {
            println!("joined overlay via {seed}");
        } else {
            println!("bootstrap peer {seed} did not answer; starting alone");
        }
    }
    Ok((handle, inbound))
}

fn print_resources(resources: &[tunemesh_core::ResourceRecord]) {
    for record in resources {
        println!(
            "{}  {} — {} [{}]",
            record.id, record.tag.artist, record.tag.title, record.tag.album
        );
        for source in &record.sources {
            println!("    served by {} (published {})", source.endpoint, source.published_unix);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Start {
            state_db,
            port,
            endpoint,
            bootstrap,
        } => {
            let (handle, inbound) =
                start_node(&state_db, port, endpoint, bootstrap.as_deref()).await?;
            println!(
                "peer running: id={} endpoint={}",
                handle.local_id(),
                handle.endpoint()
            );
            tokio::signal::ctrl_c().await?;
            inbound.abort();
            handle.shutdown().await?;
            println!("peer stopped");
        }
        Command::Publish {
            state_db,
            title,
            artist,
            album,
            bootstrap,
        } => {
            let (handle, inbound) =
                start_node(&state_db, 0, None, bootstrap.as_deref()).await?;
            let tag = TrackTag::new(title, artist, album);
            handle.publish(tag.clone()).await?;
            // Give the offer/data exchange a moment to drain before the
            // socket goes away.
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            println!("published {} ({})", tag.title, tag.tag_hash);
            inbound.abort();
            handle.shutdown().await?;
        }
        Command::Search {
            state_db,
            query,
            bootstrap,
        } => {
            let (handle, inbound) =
                start_node(&state_db, 0, None, bootstrap.as_deref()).await?;
            let hits = handle.search(&query).await;
            if hits.is_empty() {
                println!("no results");
            } else {
                print_resources(&hits);
            }
            inbound.abort();
            handle.shutdown().await?;
        }
        Command::Inspect { state_db } => {
            let store = open_store(&state_db)?;
            let snapshot = store.load().await?;
            println!(
                "resources={} keywords={}",
                snapshot.resources.len(),
                snapshot.keywords.len()
            );
            print_resources(&snapshot.resources);
        }
    }
    Ok(())
}
