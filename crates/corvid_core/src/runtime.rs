/*
 * SPDX-FileCopyrightText: 2026 Corvid Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use std::{path::Path, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::info;

use crate::actor_dir::ActorDirectory;
use crate::config::FederationConfig;
use crate::delivery_queue::{DeliveryQueue, DeliverySettings, DeliveryWorker};
use crate::domain_policy::DomainPolicy;
use crate::handlers;
use crate::ingest_queue::{IngestQueue, IngestWorker};
use crate::keys;
use crate::outbound::Outbound;
use crate::router::ActivityRouter;
use crate::store::{Actor, Store};
use crate::thread::ThreadPropagator;

/// Everything the engine needs, wired once at startup. The caches and rate
/// buckets live here rather than in process-wide statics so tests can build
/// several isolated instances side by side.
pub struct FederationState {
    pub config: FederationConfig,
    pub store: Store,
    pub directory: ActorDirectory,
    pub policy: Arc<DomainPolicy>,
    pub router: Arc<ActivityRouter>,
    pub delivery: DeliveryQueue,
    pub ingest: IngestQueue,
    pub propagator: ThreadPropagator,
    pub outbound: Outbound,
    pub http: reqwest::Client,
    pub max_date_skew: Duration,
}

impl FederationState {
    /// Open stores and queues under `data_dir`, provision the local identity
    /// and actor record, and assemble the dispatch table.
    pub fn open(config: FederationConfig, data_dir: &Path) -> Result<Arc<Self>> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("create data dir: {}", data_dir.display()))?;

        let store = Store::open(data_dir.join("store.db"))?;
        let delivery = DeliveryQueue::open(data_dir.join("delivery.db"))?;
        let ingest = IngestQueue::open(data_dir.join("ingest.db"))?;

        let identity = keys::load_or_generate_identity(data_dir)?;
        let me = config.local_actor_id();
        let base = config.base_url();
        store.upsert_actor(&Actor {
            actor_id: me.clone(),
            handle: Some(config.username.clone()),
            display_name: None,
            inbox: Some(format!("{me}/inbox")),
            outbox: Some(format!("{me}/outbox")),
            shared_inbox: Some(format!("{base}/inbox")),
            public_key_pem: Some(identity.public_key_pem.clone()),
            private_key_pem: Some(identity.private_key_pem.clone()),
            is_local: true,
            suspended: false,
        })?;

        let http = reqwest::Client::new();
        let directory = ActorDirectory::new(store.clone(), http.clone());
        let policy = Arc::new(DomainPolicy::new(
            config.blocked_domains.clone(),
            config.requests_per_minute,
        ));
        let propagator = ThreadPropagator::new(store.clone(), format!("{me}/objects"));
        let router = Arc::new(handlers::default_router(
            store.clone(),
            delivery.clone(),
            propagator.clone(),
        ));
        let outbound = Outbound::new(
            config.clone(),
            store.clone(),
            directory.clone(),
            delivery.clone(),
            propagator.clone(),
            policy.clone(),
        );

        let max_date_skew = Duration::from_secs(config.max_date_skew_secs);
        Ok(Arc::new(Self {
            config,
            store,
            directory,
            policy,
            router,
            delivery,
            ingest,
            propagator,
            outbound,
            http,
            max_date_skew,
        }))
    }

    pub fn local_actor_id(&self) -> String {
        self.config.local_actor_id()
    }

    pub fn delivery_settings(&self) -> DeliverySettings {
        DeliverySettings {
            batch_size: self.config.delivery_batch_size,
            max_tries: self.config.max_tries,
            backoff: self.config.backoff(),
        }
    }

    pub fn delivery_worker(&self) -> DeliveryWorker {
        DeliveryWorker::new(
            self.delivery.clone(),
            self.store.clone(),
            self.policy.clone(),
            self.http.clone(),
            self.delivery_settings(),
        )
    }

    pub fn ingest_worker(&self) -> IngestWorker {
        IngestWorker::new(
            self.ingest.clone(),
            self.store.clone(),
            self.directory.clone(),
            self.policy.clone(),
            self.router.clone(),
            self.config.ingest_batch_size,
        )
    }

    /// Start both queue workers. They run until the shutdown flag flips and
    /// never block each other.
    pub fn start_workers(&self, shutdown: watch::Receiver<bool>) {
        info!("starting federation workers for {}", self.local_actor_id());
        self.delivery_worker().start(shutdown.clone());
        self.ingest_worker().start(shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_provisions_the_local_actor() {
        let dir = tempfile::tempdir().unwrap();
        let config = FederationConfig {
            username: "amy".to_string(),
            domain: "local.example".to_string(),
            ..Default::default()
        };
        let state = FederationState::open(config, dir.path()).unwrap();

        let me = state.local_actor_id();
        let actor = state.store.find_actor(&me).unwrap().unwrap();
        assert!(actor.is_local);
        assert!(actor.private_key_pem.is_some());
        assert_eq!(actor.inbox.as_deref(), Some("https://local.example/users/amy/inbox"));
        assert_eq!(actor.shared_inbox.as_deref(), Some("https://local.example/inbox"));
    }
}
