/*
 * SPDX-FileCopyrightText: 2026 Corvid Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Engine settings. Loaded from a JSON file by the service binary;
/// everything has a default so tests can build one inline.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    pub username: String,
    pub domain: String,
    /// Public HTTPS base of this node, e.g. `https://social.example`.
    pub public_base_url: String,
    pub bind: String,
    pub data_dir: Option<PathBuf>,

    /// Block inbound/outbound interactions with these domains. An entry
    /// matches the domain itself and every subdomain (`example.com` blocks
    /// `sub.example.com`, never `notexample.com`).
    pub blocked_domains: Vec<String>,
    /// Block these exact actor ids.
    pub blocked_actors: Vec<String>,

    /// Outbound token-bucket capacity and refill, per remote domain.
    pub requests_per_minute: u32,
    pub delivery_batch_size: u32,
    pub ingest_batch_size: u32,
    /// Transient-failure retry budget before dead-lettering.
    pub max_tries: u32,
    /// Escalating retry delays; attempts past the end reuse the last entry.
    pub backoff_secs: Vec<u64>,

    pub max_date_skew_secs: u64,
    /// Accept unsigned inbox traffic. Local test harnesses only.
    pub signature_bypass: bool,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            username: "corvid".to_string(),
            domain: "localhost".to_string(),
            public_base_url: String::new(),
            bind: "127.0.0.1:8470".to_string(),
            data_dir: None,
            blocked_domains: Vec::new(),
            blocked_actors: Vec::new(),
            requests_per_minute: 60,
            delivery_batch_size: 40,
            ingest_batch_size: 40,
            max_tries: 8,
            backoff_secs: vec![60, 300, 900],
            max_date_skew_secs: 12 * 3600,
            signature_bypass: false,
        }
    }
}

impl FederationConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&text)
            .with_context(|| format!("parse config: {}", path.display()))?;
        Ok(cfg)
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Ok(v) = std::env::var("CORVID_DATA_DIR") {
            if !v.trim().is_empty() {
                return Ok(PathBuf::from(v));
            }
        }
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let proj = ProjectDirs::from("net", "corvid", "Corvid")
            .context("unable to determine platform data dir")?;
        Ok(proj.data_local_dir().to_path_buf())
    }

    pub fn base_url(&self) -> String {
        if self.public_base_url.trim().is_empty() {
            format!("https://{}", self.domain)
        } else {
            self.public_base_url.trim_end_matches('/').to_string()
        }
    }

    pub fn local_actor_id(&self) -> String {
        format!("{}/users/{}", self.base_url(), self.username)
    }

    pub fn backoff(&self) -> Vec<std::time::Duration> {
        if self.backoff_secs.is_empty() {
            return vec![std::time::Duration::from_secs(60)];
        }
        self.backoff_secs
            .iter()
            .map(|s| std::time::Duration::from_secs(*s))
            .collect()
    }
}
