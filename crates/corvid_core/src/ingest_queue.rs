/*
 * SPDX-FileCopyrightText: 2026 Corvid Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::actor_dir::ActorDirectory;
use crate::domain_policy::{host_of, DomainPolicy};
use crate::router::ActivityRouter;
use crate::store::{now_ms, random_hex, Store};

/// Durable queue of raw inbound payloads. Rows are pre-authenticated: the
/// HTTP boundary verified the signature before enqueueing. Processing is
/// best-effort per item: every failure mode drops the item, because the
/// remote sender retries genuinely transient faults at the HTTP layer.
#[derive(Clone)]
pub struct IngestQueue {
    db_path: PathBuf,
    notify: Arc<Notify>,
}

#[derive(Debug, Clone)]
pub struct IngestItem {
    pub id: String,
    pub receiver: String,
    pub payload: Vec<u8>,
}

impl IngestQueue {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let conn =
            Connection::open(&db_path).with_context(|| format!("open db: {}", db_path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS ingest_items (
              id TEXT PRIMARY KEY,
              created_at_ms INTEGER NOT NULL,
              receiver TEXT NOT NULL,
              payload BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_ingest_created ON ingest_items(created_at_ms ASC);
            "#,
        )?;
        Ok(Self {
            db_path,
            notify: Arc::new(Notify::new()),
        })
    }

    pub async fn enqueue(&self, receiver: &str, payload: Vec<u8>) -> Result<()> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let receiver = receiver.to_string();
            move || -> Result<()> {
                let conn = Connection::open(db_path)?;
                conn.execute(
                    "INSERT INTO ingest_items (id, created_at_ms, receiver, payload) VALUES (?1, ?2, ?3, ?4)",
                    params![random_hex(), now_ms(), receiver, payload],
                )?;
                Ok(())
            }
        })
        .await??;
        self.notify.notify_one();
        Ok(())
    }

    async fn fetch_batch(&self, limit: u32) -> Result<Vec<IngestItem>> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<Vec<IngestItem>> {
                let conn = Connection::open(db_path)?;
                let mut stmt = conn.prepare(
                    r#"
                    SELECT id, receiver, payload FROM ingest_items
                    ORDER BY created_at_ms ASC, rowid ASC LIMIT ?1
                    "#,
                )?;
                let mut rows = stmt.query(params![limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(IngestItem {
                        id: row.get(0)?,
                        receiver: row.get(1)?,
                        payload: row.get(2)?,
                    });
                }
                Ok(out)
            }
        })
        .await?
    }

    async fn remove(&self, id: &str) -> Result<()> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let id = id.to_string();
            move || -> Result<()> {
                let conn = Connection::open(db_path)?;
                conn.execute("DELETE FROM ingest_items WHERE id = ?1", params![id])?;
                Ok(())
            }
        })
        .await??;
        Ok(())
    }

    pub async fn pending(&self) -> Result<u64> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<u64> {
                let conn = Connection::open(db_path)?;
                Ok(conn.query_row("SELECT COUNT(*) FROM ingest_items", [], |r| r.get(0))?)
            }
        })
        .await?
    }
}

/// The inbound batch worker: resolves both sides of each item, enforces
/// block policy, dispatches, and always consumes the item. One bad payload
/// never blocks the batch.
pub struct IngestWorker {
    queue: IngestQueue,
    store: Store,
    directory: ActorDirectory,
    policy: Arc<DomainPolicy>,
    router: Arc<ActivityRouter>,
    batch_size: u32,
}

impl IngestWorker {
    pub fn new(
        queue: IngestQueue,
        store: Store,
        directory: ActorDirectory,
        policy: Arc<DomainPolicy>,
        router: Arc<ActivityRouter>,
        batch_size: u32,
    ) -> Self {
        Self {
            queue,
            store,
            directory,
            policy,
            router,
            batch_size,
        }
    }

    pub fn start(self, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            info!("ingest queue db: {}", self.queue.db_path.display());
            let tick = Duration::from_secs(2);
            loop {
                if *shutdown.borrow() {
                    break;
                }
                match self.drain_once().await {
                    Ok(0) => {
                        tokio::select! {
                            _ = self.queue.notify.notified() => {}
                            _ = tokio::time::sleep(tick) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("ingest batch error: {e:#}");
                        tokio::time::sleep(tick).await;
                    }
                }
            }
        });
    }

    /// Process one batch; returns the number of items consumed.
    pub async fn drain_once(&self) -> Result<u64> {
        let items = self.queue.fetch_batch(self.batch_size).await?;
        let mut processed = 0u64;
        for item in items {
            if let Err(e) = self.process_item(&item).await {
                // Handler failures are logged and consumed, never retried:
                // the sender already has retry responsibility at the HTTP layer.
                warn!("ingest item {} failed: {e:#}", item.id);
            }
            self.queue.remove(&item.id).await?;
            processed += 1;
        }
        Ok(processed)
    }

    async fn process_item(&self, item: &IngestItem) -> Result<()> {
        let payload: Value = match serde_json::from_slice(&item.payload) {
            Ok(v) => v,
            Err(_) => {
                debug!("dropping malformed payload for {}", item.receiver);
                return Ok(());
            }
        };
        let Some(remote_ref) = corvid_protocol::actor_ref(&payload).map(str::to_string) else {
            debug!("dropping payload without actor reference");
            return Ok(());
        };

        let Some(local) = self.store.find_actor(&item.receiver)? else {
            debug!("dropping payload for unknown mailbox {}", item.receiver);
            return Ok(());
        };

        // Redundant delivery is expected; side effects run at most once.
        let dedup_id = dedup_id(&payload);
        if !self.store.mark_inbox_seen(&dedup_id)? {
            debug!("duplicate activity {dedup_id}; dropping");
            return Ok(());
        }

        let Some(remote) = self.directory.resolve(&remote_ref, true).await else {
            // Identity resolution failures are permanent for this item.
            debug!("dropping payload from unresolvable actor {remote_ref}");
            return Ok(());
        };

        if let Some(domain) = host_of(&remote.actor_id) {
            if self.policy.is_blocked(&domain) {
                // Silent: block state is never revealed to the sender.
                debug!("dropping payload from blocked domain {domain}");
                return Ok(());
            }
        }
        if self.store.is_blocked_by(&local.actor_id, &remote.actor_id)? {
            debug!("dropping payload from actor blocked by {}", local.actor_id);
            return Ok(());
        }

        let kind = payload.get("type").and_then(|v| v.as_str());
        self.store
            .store_inbox_activity(&dedup_id, Some(&remote.actor_id), kind, item.payload.clone())?;

        self.router.dispatch(&payload, &local, &remote).await?;
        Ok(())
    }
}

/// Stable id for duplicate suppression: the activity's own id, or a hash
/// of the canonicalized payload when the id is absent.
pub fn dedup_id(payload: &Value) -> String {
    if let Some(id) = payload.get("id").and_then(|v| v.as_str()) {
        let id = id.trim();
        if !id.is_empty() {
            return id.to_string();
        }
    }
    use sha2::Digest as _;
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let mut hasher = sha2::Sha256::new();
    hasher.update(&bytes);
    format!("urn:corvid:inbox:{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dedup_prefers_the_activity_id() {
        let with_id = json!({ "id": "https://r.example/a/1", "type": "Like" });
        assert_eq!(dedup_id(&with_id), "https://r.example/a/1");

        let anonymous = json!({ "type": "Like", "object": "x" });
        let a = dedup_id(&anonymous);
        assert!(a.starts_with("urn:corvid:inbox:"));
        assert_eq!(a, dedup_id(&anonymous));
    }

    #[tokio::test]
    async fn queue_holds_items_until_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let queue = IngestQueue::open(dir.path().join("ingest.db")).unwrap();
        queue
            .enqueue("https://l.example/users/amy", b"{}".to_vec())
            .await
            .unwrap();
        assert_eq!(queue.pending().await.unwrap(), 1);

        let batch = queue.fetch_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].receiver, "https://l.example/users/amy");
        queue.remove(&batch[0].id).await.unwrap();
        assert_eq!(queue.pending().await.unwrap(), 0);
    }
}
