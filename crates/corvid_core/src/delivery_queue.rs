/*
 * SPDX-FileCopyrightText: 2026 Corvid Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use corvid_protocol::ACTIVITY_JSON;
use http::{HeaderMap, Method, StatusCode, Uri};
use rusqlite::{params, Connection};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::domain_policy::{host_of, DomainPolicy};
use crate::http_sig::sign_request_rsa_sha256;
use crate::keys::main_key_id;
use crate::store::{now_ms, random_hex, Store};

#[derive(Clone, Debug)]
pub struct DeliverySettings {
    pub batch_size: u32,
    /// Transient failures beyond this count dead-letter the job.
    pub max_tries: u32,
    /// Escalating delays; attempts past the end reuse the last entry.
    pub backoff: Vec<Duration>,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            batch_size: 40,
            max_tries: 8,
            backoff: vec![
                Duration::from_secs(60),
                Duration::from_secs(300),
                Duration::from_secs(900),
            ],
        }
    }
}

/// Durable outbound queue. One row per (sender, target inbox, payload) job;
/// rows are mutated only by the worker that dequeued them and leave the
/// active set on success, permanent rejection or retry exhaustion.
#[derive(Clone)]
pub struct DeliveryQueue {
    db_path: PathBuf,
    notify: Arc<Notify>,
}

#[derive(Debug, Clone)]
pub struct DeliveryJob {
    pub id: String,
    pub attempt: u32,
    pub sender: String,
    pub inbox: String,
    pub activity_json: Vec<u8>,
}

#[derive(Debug)]
pub enum SendOutcome {
    Delivered,
    /// The remote rejected the payload semantically; retrying cannot help.
    Permanent(String),
    /// Timeout, connection failure, 429 or 5xx; retried per the schedule.
    Transient(String),
}

#[derive(Debug, Clone)]
pub struct QueueStats {
    pub pending: u64,
    pub delivered: u64,
    pub dead: u64,
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: String,
    pub inbox: String,
    pub attempt: u32,
    pub last_error: Option<String>,
    pub activity_json: Vec<u8>,
}

impl DeliveryQueue {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        init_db(&db_path)?;
        Ok(Self {
            db_path,
            notify: Arc::new(Notify::new()),
        })
    }

    /// Insert one job per target inbox in a single transaction, then wake
    /// the worker. Returns the pending count.
    pub async fn enqueue(
        &self,
        sender: &str,
        activity_json: Vec<u8>,
        inboxes: Vec<String>,
    ) -> Result<u64> {
        let created_at = now_ms();
        let sender = sender.to_string();
        let pending = tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<u64> {
                let mut conn = Connection::open(db_path)?;
                let tx = conn.transaction()?;
                for inbox in inboxes {
                    tx.execute(
                        r#"
                        INSERT INTO delivery_jobs (
                          id, created_at_ms, next_attempt_at_ms, attempt, status,
                          sender, inbox, activity_json, last_error
                        ) VALUES (?1, ?2, ?2, 0, 0, ?3, ?4, ?5, NULL)
                        "#,
                        params![random_hex(), created_at, sender, inbox, activity_json],
                    )?;
                }
                tx.commit()?;
                let pending: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM delivery_jobs WHERE status = 0",
                    [],
                    |r| r.get(0),
                )?;
                Ok(pending)
            }
        })
        .await??;

        self.notify.notify_one();
        Ok(pending)
    }

    pub(crate) async fn fetch_due_at(&self, limit: u32, now: i64) -> Result<Vec<DeliveryJob>> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<Vec<DeliveryJob>> {
                let conn = Connection::open(db_path)?;
                // Enqueue order within an inbox is preserved by the rowid
                // tiebreak; cross-inbox order carries no guarantee.
                let mut stmt = conn.prepare(
                    r#"
                    SELECT id, attempt, sender, inbox, activity_json
                    FROM delivery_jobs
                    WHERE status = 0 AND next_attempt_at_ms <= ?1
                    ORDER BY created_at_ms ASC, rowid ASC
                    LIMIT ?2
                    "#,
                )?;
                let mut rows = stmt.query(params![now, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(DeliveryJob {
                        id: row.get(0)?,
                        attempt: row.get(1)?,
                        sender: row.get(2)?,
                        inbox: row.get(3)?,
                        activity_json: row.get(4)?,
                    });
                }
                Ok(out)
            }
        })
        .await?
    }

    pub async fn fetch_due(&self, limit: u32) -> Result<Vec<DeliveryJob>> {
        self.fetch_due_at(limit, now_ms()).await
    }

    async fn mark_delivered(&self, id: &str) -> Result<()> {
        self.exec(
            "UPDATE delivery_jobs SET status = 1, last_error = NULL WHERE id = ?1",
            vec![id.to_string()],
        )
        .await
    }

    async fn mark_dead(&self, id: &str, err: &str) -> Result<()> {
        self.exec(
            "UPDATE delivery_jobs SET status = 2, last_error = ?2 WHERE id = ?1",
            vec![id.to_string(), err.to_string()],
        )
        .await
    }

    async fn reschedule(&self, id: &str, attempt: u32, delay: Duration, err: &str) -> Result<()> {
        let next = now_ms().saturating_add(delay.as_millis() as i64);
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let id = id.to_string();
            let err = err.to_string();
            move || -> Result<()> {
                let conn = Connection::open(db_path)?;
                conn.execute(
                    "UPDATE delivery_jobs SET attempt = ?2, next_attempt_at_ms = ?3, last_error = ?4 WHERE id = ?1",
                    params![id, attempt, next, err],
                )?;
                Ok(())
            }
        })
        .await??;
        Ok(())
    }

    /// Push a job's eligibility forward without counting an attempt. Keeps
    /// later jobs for an inbox from overtaking a transiently failed one.
    async fn defer(&self, id: &str, delay: Duration, note: &str) -> Result<()> {
        let next = now_ms().saturating_add(delay.as_millis() as i64);
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let id = id.to_string();
            let note = note.to_string();
            move || -> Result<()> {
                let conn = Connection::open(db_path)?;
                conn.execute(
                    "UPDATE delivery_jobs SET next_attempt_at_ms = ?2, last_error = ?3 WHERE id = ?1",
                    params![id, next, note],
                )?;
                Ok(())
            }
        })
        .await??;
        Ok(())
    }

    async fn exec(&self, sql: &'static str, args: Vec<String>) -> Result<()> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<()> {
                let conn = Connection::open(db_path)?;
                conn.execute(sql, rusqlite::params_from_iter(args))?;
                Ok(())
            }
        })
        .await??;
        Ok(())
    }

    /// Apply a send outcome to a job. Returns true when the failure was
    /// transient (the caller then defers queued work behind this job).
    pub async fn handle_outcome(
        &self,
        job: &DeliveryJob,
        outcome: SendOutcome,
        settings: &DeliverySettings,
    ) -> Result<bool> {
        match outcome {
            SendOutcome::Delivered => {
                self.mark_delivered(&job.id).await?;
                Ok(false)
            }
            SendOutcome::Permanent(err) => {
                warn!("delivery to {} permanently failed: {err}", job.inbox);
                self.mark_dead(&job.id, &err).await?;
                Ok(false)
            }
            SendOutcome::Transient(err) => {
                let attempt_no = job.attempt.saturating_add(1);
                if attempt_no >= settings.max_tries {
                    warn!("delivery to {} exhausted retries: {err}", job.inbox);
                    self.mark_dead(&job.id, &err).await?;
                } else {
                    let delay = backoff_delay(settings, attempt_no);
                    debug!(
                        "delivery to {} attempt {attempt_no} failed, retrying in {}s: {err}",
                        job.inbox,
                        delay.as_secs()
                    );
                    self.reschedule(&job.id, attempt_no, delay, &err).await?;
                }
                Ok(true)
            }
        }
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<QueueStats> {
                let conn = Connection::open(db_path)?;
                let count = |status: i64| -> Result<u64> {
                    Ok(conn.query_row(
                        "SELECT COUNT(*) FROM delivery_jobs WHERE status = ?1",
                        params![status],
                        |r| r.get(0),
                    )?)
                };
                Ok(QueueStats {
                    pending: count(0)?,
                    delivered: count(1)?,
                    dead: count(2)?,
                })
            }
        })
        .await?
    }

    /// Jobs that exhausted their retry budget or were rejected outright,
    /// kept for operator inspection.
    pub async fn dead_letters(&self, limit: u32) -> Result<Vec<DeadLetter>> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<Vec<DeadLetter>> {
                let conn = Connection::open(db_path)?;
                let mut stmt = conn.prepare(
                    r#"
                    SELECT id, inbox, attempt, last_error, activity_json
                    FROM delivery_jobs WHERE status = 2
                    ORDER BY created_at_ms DESC LIMIT ?1
                    "#,
                )?;
                let mut rows = stmt.query(params![limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(DeadLetter {
                        id: row.get(0)?,
                        inbox: row.get(1)?,
                        attempt: row.get(2)?,
                        last_error: row.get(3)?,
                        activity_json: row.get(4)?,
                    });
                }
                Ok(out)
            }
        })
        .await?
    }
}

/// Delay for the given (1-based) attempt from the configured schedule.
pub(crate) fn backoff_delay(settings: &DeliverySettings, attempt_no: u32) -> Duration {
    let idx = (attempt_no.saturating_sub(1) as usize).min(settings.backoff.len().saturating_sub(1));
    settings.backoff.get(idx).copied().unwrap_or(Duration::from_secs(60))
}

/// Response classification. 2xx delivered; 429 is backpressure, not
/// rejection; other 4xx are semantic rejections that retries cannot fix.
pub(crate) fn classify_status(status: StatusCode) -> SendOutcome {
    if status.is_success() {
        SendOutcome::Delivered
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        SendOutcome::Transient(format!("status {status}"))
    } else if status.is_client_error() {
        SendOutcome::Permanent(format!("status {status}"))
    } else {
        SendOutcome::Transient(format!("status {status}"))
    }
}

/// The batch worker: dequeues due jobs, signs and posts them, applies the
/// domain policy and records outcomes. Distinct inboxes carry no ordering
/// guarantee; within one inbox, enqueue order is preserved.
pub struct DeliveryWorker {
    queue: DeliveryQueue,
    store: Store,
    policy: Arc<DomainPolicy>,
    client: reqwest::Client,
    settings: DeliverySettings,
}

impl DeliveryWorker {
    pub fn new(
        queue: DeliveryQueue,
        store: Store,
        policy: Arc<DomainPolicy>,
        client: reqwest::Client,
        settings: DeliverySettings,
    ) -> Self {
        Self {
            queue,
            store,
            policy,
            client,
            settings,
        }
    }

    pub fn start(self, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            info!("delivery queue db: {}", self.queue.db_path.display());
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
                        warn!("delivery batch error: {e:#}");
                        tokio::time::sleep(tick).await;
                    }
                }
            }
        });
    }

    /// Process one batch. Returns the number of jobs acted upon (rate-limit
    /// deferrals do not count; those rows stay due for a later pass).
    pub async fn drain_once(&self) -> Result<u64> {
        let jobs = self.queue.fetch_due(self.settings.batch_size).await?;
        if jobs.is_empty() {
            return Ok(0);
        }

        // Group per inbox, preserving enqueue order within each group.
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<DeliveryJob>> = HashMap::new();
        for job in jobs {
            if !groups.contains_key(&job.inbox) {
                order.push(job.inbox.clone());
            }
            groups.entry(job.inbox.clone()).or_default().push(job);
        }

        let mut processed = 0u64;
        for inbox in order {
            let group = groups.remove(&inbox).unwrap_or_default();
            processed += self.process_group(&inbox, group).await?;
        }
        Ok(processed)
    }

    async fn process_group(&self, inbox: &str, group: Vec<DeliveryJob>) -> Result<u64> {
        let Some(domain) = host_of(inbox) else {
            let mut n = 0u64;
            for job in &group {
                self.queue.mark_dead(&job.id, "invalid inbox url").await?;
                n += 1;
            }
            return Ok(n);
        };

        if self.policy.is_blocked(&domain) {
            let mut n = 0u64;
            for job in &group {
                self.queue.mark_dead(&job.id, "destination domain blocked").await?;
                n += 1;
            }
            return Ok(n);
        }

        let mut processed = 0u64;
        let mut pending = group.into_iter();
        while let Some(job) = pending.next() {
            // A refused token is not an attempt; the job stays due and the
            // rest of the group waits behind it.
            if !self.policy.allow(&domain) {
                debug!("rate limited for {domain}; leaving jobs queued");
                break;
            }

            let sender = match self.store.find_actor(&job.sender) {
                Ok(Some(actor)) => actor,
                Ok(None) => {
                    self.queue
                        .mark_dead(&job.id, "signing actor not found")
                        .await?;
                    processed += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let Some(private_key_pem) = sender.private_key_pem.clone() else {
                // Configuration error, not retriable.
                self.queue
                    .mark_dead(&job.id, "signing actor has no private key")
                    .await?;
                processed += 1;
                continue;
            };

            let outcome = self
                .send_signed(&private_key_pem, &sender.actor_id, inbox, &job.activity_json)
                .await;
            let transient = self.queue.handle_outcome(&job, outcome, &self.settings).await?;
            processed += 1;

            if transient {
                // Preserve per-destination FIFO: nothing behind this job may
                // overtake it while it waits out the backoff.
                let delay = backoff_delay(&self.settings, job.attempt.saturating_add(1));
                for later in pending.by_ref() {
                    self.queue
                        .defer(&later.id, delay, "deferred behind failed delivery")
                        .await?;
                }
                break;
            }
        }
        Ok(processed)
    }

    async fn send_signed(
        &self,
        private_key_pem: &str,
        sender_id: &str,
        inbox: &str,
        body: &[u8],
    ) -> SendOutcome {
        let uri: Uri = match inbox.parse() {
            Ok(v) => v,
            Err(_) => return SendOutcome::Permanent("invalid inbox url".to_string()),
        };

        let mut headers = HeaderMap::new();
        headers.insert("Accept", ACTIVITY_JSON.parse().expect("static header"));
        headers.insert("Content-Type", ACTIVITY_JSON.parse().expect("static header"));

        if let Err(e) = sign_request_rsa_sha256(
            private_key_pem,
            &main_key_id(sender_id),
            &Method::POST,
            &uri,
            &mut headers,
            body,
            &["(request-target)", "host", "date", "digest"],
        ) {
            // A key that cannot sign is a config error; retrying cannot help.
            return SendOutcome::Permanent(format!("signing failed: {e:#}"));
        }

        let mut req = self.client.post(inbox);
        for (k, v) in headers.iter() {
            req = req.header(k.as_str(), v.to_str().unwrap_or_default());
        }
        match req.body(body.to_vec()).send().await {
            Ok(resp) => classify_status(resp.status()),
            Err(e) => SendOutcome::Transient(format!("request failed: {e}")),
        }
    }
}

fn init_db(path: &Path) -> Result<()> {
    let conn = Connection::open(path).with_context(|| format!("open db: {}", path.display()))?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS delivery_jobs (
          id TEXT PRIMARY KEY,
          created_at_ms INTEGER NOT NULL,
          next_attempt_at_ms INTEGER NOT NULL,
          attempt INTEGER NOT NULL,
          status INTEGER NOT NULL,
          sender TEXT NOT NULL,
          inbox TEXT NOT NULL,
          activity_json BLOB NOT NULL,
          last_error TEXT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_delivery_due ON delivery_jobs(status, next_attempt_at_ms);
        "#,
    )?;
    Ok(())
}
