/*
 * SPDX-FileCopyrightText: 2026 Corvid Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use rand::{rngs::OsRng, RngCore};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

/// Keyed entity store backing the engine: actors, objects with derived
/// counters, activity logs, follow relations, reactions and blocks.
/// Writes are per-record; no cross-record transactions are needed.
#[derive(Clone)]
pub struct Store {
    path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct Actor {
    pub actor_id: String,
    pub handle: Option<String>,
    pub display_name: Option<String>,
    pub inbox: Option<String>,
    pub outbox: Option<String>,
    pub shared_inbox: Option<String>,
    pub public_key_pem: Option<String>,
    pub private_key_pem: Option<String>,
    pub is_local: bool,
    pub suspended: bool,
}

impl Actor {
    /// Preferred delivery endpoint: shared inbox when advertised.
    pub fn delivery_inbox(&self) -> Option<&str> {
        self.shared_inbox.as_deref().or(self.inbox.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowingStatus {
    Pending,
    Accepted,
}

impl FollowingStatus {
    fn to_i64(self) -> i64 {
        match self {
            Self::Pending => 0,
            Self::Accepted => 1,
        }
    }

    fn from_i64(v: i64) -> Self {
        if v == 1 {
            Self::Accepted
        } else {
            Self::Pending
        }
    }
}

#[derive(Debug, Clone)]
pub struct ObjectRow {
    pub object_id: String,
    pub actor_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub deleted: bool,
    pub reply_count: i64,
    pub like_count: i64,
    pub boost_count: i64,
    pub object_json: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub enum Counter {
    Reply,
    Like,
    Boost,
}

impl Counter {
    fn column(self) -> &'static str {
        match self {
            Self::Reply => "reply_count",
            Self::Like => "like_count",
            Self::Boost => "boost_count",
        }
    }
}

impl Store {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn =
            Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS actors (
              actor_id TEXT PRIMARY KEY,
              handle TEXT NULL,
              display_name TEXT NULL,
              inbox TEXT NULL,
              outbox TEXT NULL,
              shared_inbox TEXT NULL,
              public_key_pem TEXT NULL,
              private_key_pem TEXT NULL,
              is_local INTEGER NOT NULL,
              suspended INTEGER NOT NULL DEFAULT 0,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS actor_blocks (
              actor_id TEXT NOT NULL,
              blocked_id TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL,
              PRIMARY KEY(actor_id, blocked_id)
            );

            CREATE TABLE IF NOT EXISTS inbox_seen (
              activity_id TEXT PRIMARY KEY,
              seen_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS inbox_items (
              activity_id TEXT PRIMARY KEY,
              created_at_ms INTEGER NOT NULL,
              actor_id TEXT NULL,
              type TEXT NULL,
              activity_json BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_inbox_created ON inbox_items(created_at_ms DESC);

            CREATE TABLE IF NOT EXISTS outbox_items (
              id TEXT PRIMARY KEY,
              created_at_ms INTEGER NOT NULL,
              activity_json BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_outbox_created ON outbox_items(created_at_ms DESC);

            CREATE TABLE IF NOT EXISTS objects (
              object_id TEXT PRIMARY KEY,
              local_key TEXT NULL,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              deleted INTEGER NOT NULL DEFAULT 0,
              actor_id TEXT NULL,
              in_reply_to TEXT NULL,
              reply_count INTEGER NOT NULL DEFAULT 0,
              like_count INTEGER NOT NULL DEFAULT 0,
              boost_count INTEGER NOT NULL DEFAULT 0,
              object_json BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_objects_local_key ON objects(local_key);
            CREATE INDEX IF NOT EXISTS idx_objects_reply ON objects(in_reply_to);

            CREATE TABLE IF NOT EXISTS followers (
              actor_id TEXT PRIMARY KEY,
              follow_activity_id TEXT NULL,
              created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_followers_follow_id ON followers(follow_activity_id);

            CREATE TABLE IF NOT EXISTS following (
              actor_id TEXT PRIMARY KEY,
              status INTEGER NOT NULL,
              follow_activity_id TEXT NULL,
              created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_following_follow_id ON following(follow_activity_id);

            CREATE TABLE IF NOT EXISTS reactions (
              reaction_id TEXT PRIMARY KEY,
              created_at_ms INTEGER NOT NULL,
              type TEXT NOT NULL,
              actor_id TEXT NOT NULL,
              object_id TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reactions_object ON reactions(object_id);

            CREATE TABLE IF NOT EXISTS quote_requests (
              activity_id TEXT PRIMARY KEY,
              created_at_ms INTEGER NOT NULL,
              actor_id TEXT NOT NULL,
              object_id TEXT NOT NULL,
              accepted INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )?;
        Ok(Self { path })
    }

    fn conn(&self) -> Result<Connection> {
        Connection::open(&self.path).with_context(|| format!("open db: {}", self.path.display()))
    }

    pub fn health_check(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    // ---- actors ----

    pub fn upsert_actor(&self, actor: &Actor) -> Result<()> {
        let conn = self.conn()?;
        let now = now_ms();
        conn.execute(
            r#"
            INSERT INTO actors (
              actor_id, handle, display_name, inbox, outbox, shared_inbox,
              public_key_pem, private_key_pem, is_local, suspended,
              created_at_ms, updated_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
            ON CONFLICT(actor_id) DO UPDATE SET
              handle = excluded.handle,
              display_name = excluded.display_name,
              inbox = excluded.inbox,
              outbox = excluded.outbox,
              shared_inbox = excluded.shared_inbox,
              public_key_pem = excluded.public_key_pem,
              private_key_pem = COALESCE(excluded.private_key_pem, actors.private_key_pem),
              is_local = excluded.is_local,
              suspended = excluded.suspended,
              updated_at_ms = excluded.updated_at_ms
            "#,
            params![
                actor.actor_id,
                actor.handle,
                actor.display_name,
                actor.inbox,
                actor.outbox,
                actor.shared_inbox,
                actor.public_key_pem,
                actor.private_key_pem,
                actor.is_local as i64,
                actor.suspended as i64,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn find_actor(&self, actor_id: &str) -> Result<Option<Actor>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT actor_id, handle, display_name, inbox, outbox, shared_inbox,
                       public_key_pem, private_key_pem, is_local, suspended
                FROM actors WHERE actor_id = ?1
                "#,
                params![actor_id],
                |r| {
                    Ok(Actor {
                        actor_id: r.get(0)?,
                        handle: r.get(1)?,
                        display_name: r.get(2)?,
                        inbox: r.get(3)?,
                        outbox: r.get(4)?,
                        shared_inbox: r.get(5)?,
                        public_key_pem: r.get(6)?,
                        private_key_pem: r.get(7)?,
                        is_local: r.get::<_, i64>(8)? != 0,
                        suspended: r.get::<_, i64>(9)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn add_actor_block(&self, actor_id: &str, blocked_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO actor_blocks (actor_id, blocked_id, created_at_ms) VALUES (?1, ?2, ?3)",
            params![actor_id, blocked_id, now_ms()],
        )?;
        Ok(())
    }

    pub fn remove_actor_block(&self, actor_id: &str, blocked_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM actor_blocks WHERE actor_id = ?1 AND blocked_id = ?2",
            params![actor_id, blocked_id],
        )?;
        Ok(())
    }

    pub fn is_blocked_by(&self, actor_id: &str, other_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let hit: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM actor_blocks WHERE actor_id = ?1 AND blocked_id = ?2",
                params![actor_id, other_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(hit.is_some())
    }

    // ---- activity logs ----

    /// Returns true the first time an activity id is seen. The dedup set is
    /// what makes redundant delivery harmless.
    pub fn mark_inbox_seen(&self, activity_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO inbox_seen (activity_id, seen_at_ms) VALUES (?1, ?2)",
            params![activity_id, now_ms()],
        )?;
        Ok(changed > 0)
    }

    pub fn store_inbox_activity(
        &self,
        activity_id: &str,
        actor_id: Option<&str>,
        kind: Option<&str>,
        activity_json: Vec<u8>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT OR IGNORE INTO inbox_items (activity_id, created_at_ms, actor_id, type, activity_json)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![activity_id, now_ms(), actor_id, kind, activity_json],
        )?;
        Ok(())
    }

    pub fn store_outbox(&self, id: &str, activity_json: Vec<u8>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO outbox_items (id, created_at_ms, activity_json) VALUES (?1, ?2, ?3)",
            params![id, now_ms(), activity_json],
        )?;
        Ok(())
    }

    pub fn get_outbox(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT activity_json FROM outbox_items WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(row)
    }

    // ---- objects & counters ----

    /// Insert or refresh an object. Returns true when the object was new.
    /// Counters are preserved on update; they belong to the cache layer.
    pub fn upsert_object(
        &self,
        object_id: &str,
        local_key: Option<&str>,
        actor_id: Option<&str>,
        in_reply_to: Option<&str>,
        object_json: Vec<u8>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let now = now_ms();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM objects WHERE object_id = ?1",
                params![object_id],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_some() {
            conn.execute(
                r#"
                UPDATE objects SET updated_at_ms = ?2, actor_id = COALESCE(?3, actor_id),
                  in_reply_to = COALESCE(?4, in_reply_to), object_json = ?5
                WHERE object_id = ?1
                "#,
                params![object_id, now, actor_id, in_reply_to, object_json],
            )?;
            return Ok(false);
        }
        conn.execute(
            r#"
            INSERT INTO objects (
              object_id, local_key, created_at_ms, updated_at_ms, deleted,
              actor_id, in_reply_to, object_json
            ) VALUES (?1, ?2, ?3, ?3, 0, ?4, ?5, ?6)
            "#,
            params![object_id, local_key, now, actor_id, in_reply_to, object_json],
        )?;
        Ok(true)
    }

    pub fn get_object(&self, object_id: &str) -> Result<Option<ObjectRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT object_id, actor_id, in_reply_to, deleted,
                       reply_count, like_count, boost_count, object_json
                FROM objects WHERE object_id = ?1
                "#,
                params![object_id],
                map_object_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_object_by_local_key(&self, local_key: &str) -> Result<Option<ObjectRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT object_id, actor_id, in_reply_to, deleted,
                       reply_count, like_count, boost_count, object_json
                FROM objects WHERE local_key = ?1
                "#,
                params![local_key],
                map_object_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn mark_object_deleted(&self, object_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE objects SET deleted = 1, updated_at_ms = ?2 WHERE object_id = ?1",
            params![object_id, now_ms()],
        )?;
        Ok(())
    }

    /// Atomic clamped counter adjustment; never drops below zero.
    pub fn adjust_counter(&self, object_id: &str, counter: Counter, delta: i64) -> Result<i64> {
        let conn = self.conn()?;
        let col = counter.column();
        conn.execute(
            &format!("UPDATE objects SET {col} = MAX(0, {col} + ?1) WHERE object_id = ?2"),
            params![delta, object_id],
        )?;
        let value = conn.query_row(
            &format!("SELECT {col} FROM objects WHERE object_id = ?1"),
            params![object_id],
            |r| r.get(0),
        )?;
        Ok(value)
    }

    /// Re-derive all counters of an object from stored rows. Counters are a
    /// cache, not a ledger; this is the reconciliation path.
    pub fn recount_object(&self, object_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE objects SET
              reply_count = (SELECT COUNT(*) FROM objects r
                             WHERE r.in_reply_to = objects.object_id AND r.deleted = 0),
              like_count = (SELECT COUNT(*) FROM reactions x
                            WHERE x.object_id = objects.object_id AND x.type = 'Like'),
              boost_count = (SELECT COUNT(*) FROM reactions x
                             WHERE x.object_id = objects.object_id AND x.type = 'Announce')
            WHERE object_id = ?1
            "#,
            params![object_id],
        )?;
        Ok(())
    }

    // ---- followers / following ----

    pub fn add_follower(&self, actor_id: &str, follow_activity_id: Option<&str>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO followers (actor_id, follow_activity_id, created_at_ms)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(actor_id) DO UPDATE SET
              follow_activity_id = COALESCE(excluded.follow_activity_id, followers.follow_activity_id)
            "#,
            params![actor_id, follow_activity_id, now_ms()],
        )?;
        Ok(())
    }

    pub fn remove_follower(&self, actor_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM followers WHERE actor_id = ?1", params![actor_id])?;
        Ok(())
    }

    pub fn follower_by_follow_id(&self, follow_activity_id: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT actor_id FROM followers WHERE follow_activity_id = ?1",
                params![follow_activity_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(row)
    }

    /// Followers page in insertion order; `cursor` is the previous page's
    /// last rowid.
    pub fn list_followers(
        &self,
        limit: u32,
        cursor: Option<i64>,
    ) -> Result<(Vec<String>, Option<i64>)> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT rowid, actor_id FROM followers
            WHERE rowid > ?1
            ORDER BY rowid ASC
            LIMIT ?2
            "#,
        )?;
        let mut rows = stmt.query(params![cursor.unwrap_or(0), limit])?;
        let mut items = Vec::new();
        let mut last = None;
        while let Some(row) = rows.next()? {
            last = Some(row.get::<_, i64>(0)?);
            items.push(row.get::<_, String>(1)?);
        }
        let next = if items.len() as u32 == limit { last } else { None };
        Ok((items, next))
    }

    pub fn set_following(
        &self,
        actor_id: &str,
        status: FollowingStatus,
        follow_activity_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO following (actor_id, status, follow_activity_id, created_at_ms)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(actor_id) DO UPDATE SET
              status = excluded.status,
              follow_activity_id = COALESCE(excluded.follow_activity_id, following.follow_activity_id)
            "#,
            params![actor_id, status.to_i64(), follow_activity_id, now_ms()],
        )?;
        Ok(())
    }

    pub fn get_following(&self, actor_id: &str) -> Result<Option<(FollowingStatus, Option<String>)>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT status, follow_activity_id FROM following WHERE actor_id = ?1",
                params![actor_id],
                |r| Ok((r.get::<_, i64>(0)?, r.get::<_, Option<String>>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(s, id)| (FollowingStatus::from_i64(s), id)))
    }

    pub fn following_by_follow_id(&self, follow_activity_id: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT actor_id FROM following WHERE follow_activity_id = ?1",
                params![follow_activity_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(row)
    }

    pub fn remove_following(&self, actor_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM following WHERE actor_id = ?1", params![actor_id])?;
        Ok(())
    }

    // ---- reactions / quote requests ----

    /// Returns true when the reaction is new. Keyed by the originating
    /// activity id, which is what makes a later Undo exact.
    pub fn upsert_reaction(
        &self,
        reaction_id: &str,
        kind: &str,
        actor_id: &str,
        object_id: &str,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"
            INSERT OR IGNORE INTO reactions (reaction_id, created_at_ms, type, actor_id, object_id)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![reaction_id, now_ms(), kind, actor_id, object_id],
        )?;
        Ok(changed > 0)
    }

    pub fn remove_reaction(&self, reaction_id: &str) -> Result<Option<(String, String)>> {
        let conn = self.conn()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT type, object_id FROM reactions WHERE reaction_id = ?1",
                params![reaction_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        if row.is_some() {
            conn.execute("DELETE FROM reactions WHERE reaction_id = ?1", params![reaction_id])?;
        }
        Ok(row)
    }

    /// Heuristic fallback for Undo payloads whose object id was never seen.
    pub fn find_reaction_by(
        &self,
        actor_id: &str,
        kind: &str,
        object_id: &str,
    ) -> Result<Option<String>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT reaction_id FROM reactions WHERE actor_id = ?1 AND type = ?2 AND object_id = ?3",
                params![actor_id, kind, object_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(row)
    }

    pub fn upsert_quote_request(
        &self,
        activity_id: &str,
        actor_id: &str,
        object_id: &str,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"
            INSERT OR IGNORE INTO quote_requests (activity_id, created_at_ms, actor_id, object_id)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![activity_id, now_ms(), actor_id, object_id],
        )?;
        Ok(changed > 0)
    }

    pub fn mark_quote_request_accepted(&self, activity_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE quote_requests SET accepted = 1 WHERE activity_id = ?1",
            params![activity_id],
        )?;
        Ok(())
    }

    // ---- retention ----

    /// Drop external actor records not refreshed within the window. Local
    /// actors are never hard-deleted.
    pub fn purge_stale_external_actors(&self, window_ms: i64) -> Result<u64> {
        let conn = self.conn()?;
        let cutoff = now_ms().saturating_sub(window_ms);
        let n = conn.execute(
            "DELETE FROM actors WHERE is_local = 0 AND updated_at_ms <= ?1",
            params![cutoff],
        )?;
        Ok(n as u64)
    }

    /// Drop inbox activity rows older than the window. Outbox items are our
    /// own record and are kept.
    pub fn purge_old_inbox_items(&self, window_ms: i64) -> Result<u64> {
        let conn = self.conn()?;
        let cutoff = now_ms().saturating_sub(window_ms);
        let items = conn.execute(
            "DELETE FROM inbox_items WHERE created_at_ms <= ?1",
            params![cutoff],
        )?;
        conn.execute(
            "DELETE FROM inbox_seen WHERE seen_at_ms <= ?1",
            params![cutoff],
        )?;
        Ok(items as u64)
    }

    // ---- id generation ----

    pub fn new_activity_id(&self, actor_id: &str) -> String {
        format!("{actor_id}/activities/{}", random_hex())
    }

    pub fn new_object_key(&self) -> String {
        random_hex()
    }
}

fn map_object_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<ObjectRow> {
    Ok(ObjectRow {
        object_id: r.get(0)?,
        actor_id: r.get(1)?,
        in_reply_to: r.get(2)?,
        deleted: r.get::<_, i64>(3)? != 0,
        reply_count: r.get(4)?,
        like_count: r.get(5)?,
        boost_count: r.get(6)?,
        object_json: r.get(7)?,
    })
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub(crate) fn random_hex() -> String {
    // 16 random bytes -> 32 hex chars
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    b.iter().map(|v| format!("{v:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn actor_round_trip_keeps_private_key() {
        let (_dir, store) = temp_store();
        let mut actor = Actor {
            actor_id: "https://social.example/users/amy".to_string(),
            handle: Some("amy".to_string()),
            inbox: Some("https://social.example/users/amy/inbox".to_string()),
            private_key_pem: Some("PRIVATE".to_string()),
            public_key_pem: Some("PUBLIC".to_string()),
            is_local: true,
            ..Default::default()
        };
        store.upsert_actor(&actor).unwrap();

        // Metadata refresh without a key must not erase the stored key.
        actor.private_key_pem = None;
        actor.display_name = Some("Amy".to_string());
        store.upsert_actor(&actor).unwrap();

        let got = store.find_actor(&actor.actor_id).unwrap().unwrap();
        assert_eq!(got.display_name.as_deref(), Some("Amy"));
        assert_eq!(got.private_key_pem.as_deref(), Some("PRIVATE"));
        assert!(got.is_local);
    }

    #[test]
    fn inbox_seen_is_first_time_only() {
        let (_dir, store) = temp_store();
        assert!(store.mark_inbox_seen("a1").unwrap());
        assert!(!store.mark_inbox_seen("a1").unwrap());
    }

    #[test]
    fn counters_clamp_at_zero_and_recount() {
        let (_dir, store) = temp_store();
        store
            .upsert_object("https://x.example/n/1", None, None, None, b"{}".to_vec())
            .unwrap();
        assert_eq!(
            store.adjust_counter("https://x.example/n/1", Counter::Reply, -3).unwrap(),
            0
        );
        assert_eq!(
            store.adjust_counter("https://x.example/n/1", Counter::Like, 2).unwrap(),
            2
        );

        store
            .upsert_object(
                "https://x.example/n/2",
                None,
                None,
                Some("https://x.example/n/1"),
                b"{}".to_vec(),
            )
            .unwrap();
        store
            .upsert_reaction("https://y.example/l/1", "Like", "https://y.example/u/b", "https://x.example/n/1")
            .unwrap();
        store.recount_object("https://x.example/n/1").unwrap();
        let row = store.get_object("https://x.example/n/1").unwrap().unwrap();
        assert_eq!(row.reply_count, 1);
        assert_eq!(row.like_count, 1);
        assert_eq!(row.boost_count, 0);
    }

    #[test]
    fn reactions_are_idempotent_and_undoable() {
        let (_dir, store) = temp_store();
        assert!(store.upsert_reaction("r1", "Like", "a", "o").unwrap());
        assert!(!store.upsert_reaction("r1", "Like", "a", "o").unwrap());
        assert_eq!(store.find_reaction_by("a", "Like", "o").unwrap().as_deref(), Some("r1"));
        assert_eq!(
            store.remove_reaction("r1").unwrap(),
            Some(("Like".to_string(), "o".to_string()))
        );
        assert_eq!(store.remove_reaction("r1").unwrap(), None);
    }

    #[test]
    fn retention_spares_local_actors() {
        let (_dir, store) = temp_store();
        store
            .upsert_actor(&Actor {
                actor_id: "https://l.example/users/me".to_string(),
                is_local: true,
                ..Default::default()
            })
            .unwrap();
        store
            .upsert_actor(&Actor {
                actor_id: "https://r.example/users/old".to_string(),
                ..Default::default()
            })
            .unwrap();

        // Window of zero makes everything stale.
        let purged = store.purge_stale_external_actors(0).unwrap();
        assert_eq!(purged, 1);
        assert!(store.find_actor("https://l.example/users/me").unwrap().is_some());
        assert!(store.find_actor("https://r.example/users/old").unwrap().is_none());
    }

    #[test]
    fn follower_paging_walks_everything() {
        let (_dir, store) = temp_store();
        for i in 0..5 {
            store.add_follower(&format!("https://r.example/u/{i}"), None).unwrap();
        }
        let mut all = Vec::new();
        let mut cursor = None;
        loop {
            let (items, next) = store.list_followers(2, cursor).unwrap();
            all.extend(items);
            if next.is_none() {
                break;
            }
            cursor = next;
        }
        assert_eq!(all.len(), 5);
    }
}
