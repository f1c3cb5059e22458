// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{
    ids::Id,
    records::{KeywordEntry, ResourceRecord},
};

/// Snapshot of the repository: the two primary collections plus the two
/// secondary indices.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedRepository {
    pub resources: Vec<ResourceRecord>,
    pub keywords: Vec<KeywordEntry>,
    pub keys_by_tag: Vec<(Id, Vec<String>)>,
    pub empty_keys: Vec<String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn load(&self) -> anyhow::Result<PersistedRepository>;
    async fn save(&self, snapshot: &PersistedRepository) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<PersistedRepository>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load(&self) -> anyhow::Result<PersistedRepository> {
        Ok(self.state.read().await.clone())
    }

    async fn save(&self, snapshot: &PersistedRepository) -> anyhow::Result<()> {
        *self.state.write().await = snapshot.clone();
        Ok(())
    }
}

pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Arc<Self>> {
        let store = Arc::new(Self {
            path: path.as_ref().to_path_buf(),
        });
        store.ensure_schema()?;
        Ok(store)
    }

    fn open_connection(&self) -> anyhow::Result<Connection> {
        Ok(Connection::open(&self.path)?)
    }

    fn ensure_schema(&self) -> anyhow::Result<()> {
        let conn = self.open_connection()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS resources (
                resource_id BLOB PRIMARY KEY,
                payload BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS keywords (
                keyword_id TEXT PRIMARY KEY,
                payload BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS keys_by_tag (
                resource_id BLOB NOT NULL,
                keyword_id TEXT NOT NULL,
                PRIMARY KEY (resource_id, keyword_id)
            );
            CREATE TABLE IF NOT EXISTS empty_keys (
                keyword_id TEXT PRIMARY KEY
            );",
        )?;
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn load(&self) -> anyhow::Result<PersistedRepository> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let store = SqliteStore { path };
            store.ensure_schema()?;
            let conn = store.open_connection()?;
            load_sync(&conn)
        })
        .await?
    }

    async fn save(&self, snapshot: &PersistedRepository) -> anyhow::Result<()> {
        let path = self.path.clone();
        let snapshot = snapshot.clone();
        tokio::task::spawn_blocking(move || {
            let store = SqliteStore { path };
            store.ensure_schema()?;
            let mut conn = store.open_connection()?;
            save_sync(&mut conn, &snapshot)
        })
        .await?
    }
}

/// All SQLite reads happen here, on a blocking thread.
fn load_sync(conn: &Connection) -> anyhow::Result<PersistedRepository> {
    let mut out = PersistedRepository::default();

    {
        let mut stmt = conn.prepare("SELECT payload FROM resources")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        for row in rows {
            let record: ResourceRecord = serde_cbor::from_slice(&row?)?;
            out.resources.push(record);
        }
    }

    {
        let mut stmt = conn.prepare("SELECT payload FROM keywords")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        for row in rows {
            let entry: KeywordEntry = serde_cbor::from_slice(&row?)?;
            out.keywords.push(entry);
        }
    }

    {
        let mut stmt =
            conn.prepare("SELECT resource_id, keyword_id FROM keys_by_tag ORDER BY resource_id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (blob, keyword_id) = row?;
            let resource_id = blob_to_id(&blob)?;
            match out.keys_by_tag.last_mut() {
                Some((id, keys)) if *id == resource_id => keys.push(keyword_id),
                _ => out.keys_by_tag.push((resource_id, vec![keyword_id])),
            }
        }
    }

    {
        let mut stmt = conn.prepare("SELECT keyword_id FROM empty_keys")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for row in rows {
            out.empty_keys.push(row?);
        }
    }

    Ok(out)
}

/// All SQLite writes happen here, on a blocking thread. UPSERT the live
/// rows, then prune anything the snapshot no longer contains.
fn save_sync(conn: &mut Connection, snapshot: &PersistedRepository) -> anyhow::Result<()> {
    let tx = conn.transaction()?;

    let mut live_resources: HashSet<Vec<u8>> = HashSet::new();
    for record in &snapshot.resources {
        let key = record.id.0.to_vec();
        tx.execute(
            "INSERT INTO resources(resource_id, payload) VALUES(?1, ?2)
             ON CONFLICT(resource_id) DO UPDATE SET payload = excluded.payload",
            params![key, serde_cbor::to_vec(record)?],
        )?;
        live_resources.insert(key);
    }
    prune_stale_blob_keys(&tx, "resources", "resource_id", &live_resources)?;

    let mut live_keywords: HashSet<String> = HashSet::new();
    for entry in &snapshot.keywords {
        tx.execute(
            "INSERT INTO keywords(keyword_id, payload) VALUES(?1, ?2)
             ON CONFLICT(keyword_id) DO UPDATE SET payload = excluded.payload",
            params![entry.id, serde_cbor::to_vec(entry)?],
        )?;
        live_keywords.insert(entry.id.clone());
    }
    prune_stale_text_keys(&tx, "keywords", "keyword_id", &live_keywords)?;

    tx.execute("DELETE FROM keys_by_tag", [])?;
    for (resource_id, keys) in &snapshot.keys_by_tag {
        for keyword_id in keys {
            tx.execute(
                "INSERT OR IGNORE INTO keys_by_tag(resource_id, keyword_id) VALUES(?1, ?2)",
                params![resource_id.0.to_vec(), keyword_id],
            )?;
        }
    }

    tx.execute("DELETE FROM empty_keys", [])?;
    for keyword_id in &snapshot.empty_keys {
        tx.execute(
            "INSERT OR IGNORE INTO empty_keys(keyword_id) VALUES(?1)",
            params![keyword_id],
        )?;
    }

    tx.commit()?;
    Ok(())
}

fn prune_stale_blob_keys(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    pk_col: &str,
    live_keys: &HashSet<Vec<u8>>,
) -> anyhow::Result<()> {
    let mut stmt = tx.prepare(&format!("SELECT {pk_col} FROM {table}"))?;
    let existing: Vec<Vec<u8>> = stmt
        .query_map([], |row| row.get::<_, Vec<u8>>(0))?
        .filter_map(|r| r.ok())
        .collect();
    for key in existing {
        if !live_keys.contains(&key) {
            tx.execute(
                &format!("DELETE FROM {table} WHERE {pk_col} = ?1"),
                params![key],
            )?;
        }
    }
    Ok(())
}

fn prune_stale_text_keys(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    pk_col: &str,
    live_keys: &HashSet<String>,
) -> anyhow::Result<()> {
    let mut stmt = tx.prepare(&format!("SELECT {pk_col} FROM {table}"))?;
    let existing: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .filter_map(|r| r.ok())
        .collect();
    for key in existing {
        if !live_keys.contains(&key) {
            tx.execute(
                &format!("DELETE FROM {table} WHERE {pk_col} = ?1"),
                params![key],
            )?;
        }
    }
    Ok(())
}

fn blob_to_id(blob: &[u8]) -> anyhow::Result<Id> {
    if blob.len() != 20 {
        anyhow::bail!("invalid resource_id length: expected 20, got {}", blob.len());
    }
    let mut id = [0u8; 20];
    id.copy_from_slice(blob);
    Ok(Id(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::TrackTag;

    fn sample_snapshot() -> PersistedRepository {
        let tag = TrackTag::new("Imagine", "John Lennon", "Imagine");
        let record = ResourceRecord::new(tag, "udp://10.0.0.1:9997/kademlia", 42);
        let keyword = KeywordEntry {
            id: "keyword/imagine".to_string(),
            resources: [record.id].into_iter().collect(),
        };
        PersistedRepository {
            keys_by_tag: vec![(record.id, vec![keyword.id.clone()])],
            empty_keys: vec!["keyword/orphan".to_string()],
            resources: vec![record],
            keywords: vec![keyword],
        }
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        let snapshot = sample_snapshot();
        store.save(&snapshot).await.expect("save");
        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.resources, snapshot.resources);
        assert_eq!(loaded.keywords, snapshot.keywords);
        assert_eq!(loaded.empty_keys, snapshot.empty_keys);
    }

    #[tokio::test]
    async fn sqlite_store_roundtrip_and_prune() {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "tunemesh_store_test_{}.db",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("now")
                .as_nanos()
        ));
        let store = SqliteStore::open(&path).expect("open sqlite");

        let snapshot = sample_snapshot();
        store.save(&snapshot).await.expect("save");
        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.resources, snapshot.resources);
        assert_eq!(loaded.keywords, snapshot.keywords);
        assert_eq!(loaded.keys_by_tag, snapshot.keys_by_tag);
        assert_eq!(loaded.empty_keys, snapshot.empty_keys);

        // A later save with an empty snapshot prunes every stale row.
        store
            .save(&PersistedRepository::default())
            .await
            .expect("save empty");
        let emptied = store.load().await.expect("load empty");
        assert!(emptied.resources.is_empty());
        assert!(emptied.keywords.is_empty());
        assert!(emptied.keys_by_tag.is_empty());

        let _ = std::fs::remove_file(path);
    }
}
