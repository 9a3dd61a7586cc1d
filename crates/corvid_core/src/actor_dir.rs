/*
 * SPDX-FileCopyrightText: 2026 Corvid Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use corvid_protocol::{ActorDocument, JrdDocument, ACTIVITY_ACCEPT};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::store::{Actor, Store};

const POSITIVE_TTL: Duration = Duration::from_secs(300);
const NEGATIVE_TTL: Duration = Duration::from_secs(60);

/// Cache-through resolver for remote identities. Store hits return
/// immediately; misses go over the wire and are cached, positively or
/// negatively, for the configured TTLs. The cache is owned here, not
/// process-global, so tests can reset it.
#[derive(Clone)]
pub struct ActorDirectory {
    store: Store,
    client: reqwest::Client,
    cache: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

#[derive(Clone)]
struct CacheEntry {
    actor: Option<Actor>,
    expires_at: Instant,
}

impl ActorDirectory {
    pub fn new(store: Store, client: reqwest::Client) -> Self {
        Self {
            store,
            client,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Resolve an actor URI to a local record. `persist` controls whether a
    /// freshly discovered actor is written to the store; verification-only
    /// lookups pass false and still benefit from the in-process cache.
    /// Every failure mode (network, non-2xx, suspended, missing fields)
    /// resolves to None; the caller decides how fatal that is.
    pub async fn resolve(&self, actor_uri: &str, persist: bool) -> Option<Actor> {
        let actor_uri = actor_uri.trim();
        if actor_uri.is_empty() {
            return None;
        }

        match self.store.find_actor(actor_uri) {
            Ok(Some(actor)) => return Some(actor),
            Ok(None) => {}
            Err(e) => {
                warn!("actor store lookup failed: {e:#}");
                return None;
            }
        }

        if let Some(entry) = self.get_cached(actor_uri).await {
            return entry;
        }

        let resolved = match self.fetch_remote(actor_uri).await {
            Ok(actor) => Some(actor),
            Err(e) => {
                debug!("actor fetch failed for {actor_uri}: {e:#}");
                None
            }
        };

        let Some(actor) = resolved else {
            self.put_cached(actor_uri, None, NEGATIVE_TTL).await;
            return None;
        };

        // The document's own id wins over the URI we asked for. Re-check the
        // store under the canonical id before creating a duplicate record.
        if actor.actor_id != actor_uri {
            if let Ok(Some(existing)) = self.store.find_actor(&actor.actor_id) {
                self.put_cached(actor_uri, Some(existing.clone()), POSITIVE_TTL).await;
                return Some(existing);
            }
        }

        if persist {
            if let Err(e) = self.store.upsert_actor(&actor) {
                warn!("actor persist failed: {e:#}");
            }
        }
        self.put_cached(actor_uri, Some(actor.clone()), POSITIVE_TTL).await;
        if actor.actor_id != actor_uri {
            self.put_cached(&actor.actor_id.clone(), Some(actor.clone()), POSITIVE_TTL).await;
        }
        Some(actor)
    }

    /// WebFinger discovery: `user@domain` (leading `@` tolerated) to the
    /// actor URI advertised by the `rel=self` link.
    pub async fn resolve_handle(&self, handle: &str) -> Option<String> {
        let handle = handle.trim().trim_start_matches('@');
        let (user, domain) = handle.split_once('@')?;
        let user = user.trim();
        let domain = domain.trim();
        if user.is_empty() || domain.is_empty() {
            return None;
        }

        let url = format!("https://{domain}/.well-known/webfinger");
        let resource = format!("acct:{user}@{domain}");
        let resp = self
            .client
            .get(url)
            .query(&[("resource", resource.as_str())])
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let jrd: JrdDocument = resp.json().await.ok()?;
        jrd.self_link().map(|s| s.to_string())
    }

    /// Drop every cached entry, positive and negative.
    pub async fn reset_cache(&self) {
        self.cache.write().await.clear();
    }

    async fn fetch_remote(&self, actor_uri: &str) -> Result<Actor> {
        let resp = self
            .client
            .get(actor_uri)
            .header("Accept", ACTIVITY_ACCEPT)
            .send()
            .await
            .with_context(|| format!("fetch actor: {actor_uri}"))?
            .error_for_status()
            .with_context(|| format!("actor not ok: {actor_uri}"))?;

        let doc: ActorDocument = resp
            .json()
            .await
            .with_context(|| format!("parse actor json from {actor_uri}"))?;

        if doc.suspended == Some(true) {
            return Err(anyhow!("actor suspended: {}", doc.id));
        }

        let inbox = doc
            .inbox
            .clone()
            .ok_or_else(|| anyhow!("actor missing inbox: {}", doc.id))?;
        let public_key_pem = doc
            .public_key
            .as_ref()
            .map(|k| k.public_key_pem.clone())
            .ok_or_else(|| anyhow!("actor missing publicKey: {}", doc.id))?;

        Ok(Actor {
            actor_id: doc.id.clone(),
            handle: doc.preferred_username.clone(),
            display_name: doc.name.clone(),
            inbox: Some(inbox),
            outbox: doc.outbox.clone(),
            shared_inbox: doc.endpoints.as_ref().and_then(|e| e.shared_inbox.clone()),
            public_key_pem: Some(public_key_pem),
            private_key_pem: None,
            is_local: false,
            suspended: false,
        })
    }

    async fn get_cached(&self, actor_uri: &str) -> Option<Option<Actor>> {
        let mut cache = self.cache.write().await;
        let now = Instant::now();
        if let Some(entry) = cache.get(actor_uri) {
            if entry.expires_at > now {
                return Some(entry.actor.clone());
            }
        }
        cache.remove(actor_uri);
        None
    }

    async fn put_cached(&self, actor_uri: &str, actor: Option<Actor>, ttl: Duration) {
        self.cache.write().await.insert(
            actor_uri.to_string(),
            CacheEntry {
                actor,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> (tempfile::TempDir, ActorDirectory) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store.db")).unwrap();
        (dir, ActorDirectory::new(store, reqwest::Client::new()))
    }

    #[tokio::test]
    async fn store_hit_short_circuits_network() {
        let (_dir, directory) = directory();
        directory
            .store
            .upsert_actor(&Actor {
                actor_id: "https://remote.example/users/bob".to_string(),
                inbox: Some("https://remote.example/users/bob/inbox".to_string()),
                public_key_pem: Some("PEM".to_string()),
                ..Default::default()
            })
            .unwrap();

        let got = directory
            .resolve("https://remote.example/users/bob", false)
            .await
            .unwrap();
        assert_eq!(got.inbox.as_deref(), Some("https://remote.example/users/bob/inbox"));
    }

    #[tokio::test]
    async fn malformed_handles_resolve_to_none() {
        let (_dir, directory) = directory();
        assert_eq!(directory.resolve_handle("no-at-sign").await, None);
        assert_eq!(directory.resolve_handle("@").await, None);
        assert_eq!(directory.resolve("", true).await.map(|a| a.actor_id), None);
    }

    #[tokio::test]
    async fn reset_cache_clears_entries() {
        let (_dir, directory) = directory();
        directory
            .put_cached("https://x.example/u/1", None, Duration::from_secs(60))
            .await;
        assert!(directory.get_cached("https://x.example/u/1").await.is_some());
        directory.reset_cache().await;
        assert!(directory.get_cached("https://x.example/u/1").await.is_none());
    }
}
