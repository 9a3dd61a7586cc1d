/*
 * SPDX-FileCopyrightText: 2026 Corvid Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use http::Uri;
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Block-list plus per-domain token buckets, consulted before any trust
/// or send decision. One shared value serves every worker; the bucket
/// check-and-decrement happens under a single lock.
pub struct DomainPolicy {
    blocked: Vec<String>,
    per_minute: u32,
    buckets: Mutex<HashMap<String, Bucket>>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl DomainPolicy {
    pub fn new(blocked: Vec<String>, per_minute: u32) -> Self {
        Self {
            blocked: blocked
                .into_iter()
                .map(|d| d.trim().to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
            per_minute: per_minute.max(1),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// True when the domain or any parent domain is on the block list.
    pub fn is_blocked(&self, domain: &str) -> bool {
        let host = domain.trim().to_ascii_lowercase();
        self.blocked.iter().any(|p| domain_matches(&host, p))
    }

    /// Take one token for an outbound request to `domain`. Refused calls
    /// must not count as delivery attempts.
    pub fn allow(&self, domain: &str) -> bool {
        self.allow_at(domain, Instant::now())
    }

    fn allow_at(&self, domain: &str, now: Instant) -> bool {
        let capacity = self.per_minute as f64;
        let mut buckets = self.buckets.lock().expect("bucket lock poisoned");
        let bucket = buckets
            .entry(domain.trim().to_ascii_lowercase())
            .or_insert(Bucket {
                tokens: capacity,
                last_refill: now,
            });

        // Continuous refill proportional to elapsed time, capped at capacity.
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        if elapsed > Duration::ZERO {
            let refill = elapsed.as_secs_f64() * capacity / 60.0;
            bucket.tokens = (bucket.tokens + refill).min(capacity);
            bucket.last_refill = now;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop all bucket state. For tests and operator tooling.
    pub fn reset(&self) {
        self.buckets.lock().expect("bucket lock poisoned").clear();
    }
}

/// Label-suffix domain match: a plain pattern matches itself and any
/// subdomain. `notexample.com` never matches `example.com`. `*.` and `.`
/// prefixes are accepted with the same meaning.
pub fn domain_matches(host: &str, pattern: &str) -> bool {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    let p = pattern
        .trim()
        .trim_end_matches('.')
        .trim_start_matches("*.")
        .trim_start_matches('.')
        .to_ascii_lowercase();
    if p.is_empty() {
        return false;
    }
    host == p || host.ends_with(&format!(".{p}"))
}

/// Lowercased host of a URL, if it has one.
pub fn host_of(url: &str) -> Option<String> {
    let uri: Uri = url.parse().ok()?;
    uri.host().map(|h| h.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_list_uses_label_suffixes() {
        let policy = DomainPolicy::new(vec!["example.com".to_string()], 30);
        assert!(policy.is_blocked("example.com"));
        assert!(policy.is_blocked("sub.example.com"));
        assert!(policy.is_blocked("deep.sub.example.com"));
        assert!(!policy.is_blocked("notexample.com"));
        assert!(!policy.is_blocked("example.community"));

        let wild = DomainPolicy::new(vec!["*.tracker.example".to_string()], 30);
        assert!(wild.is_blocked("a.tracker.example"));
        assert!(wild.is_blocked("tracker.example"));
    }

    #[test]
    fn bucket_exhausts_and_refills() {
        let policy = DomainPolicy::new(Vec::new(), 30);
        let t0 = Instant::now();
        for _ in 0..30 {
            assert!(policy.allow_at("remote.example", t0));
        }
        assert!(!policy.allow_at("remote.example", t0));

        // Other domains have their own bucket.
        assert!(policy.allow_at("other.example", t0));

        // One full refill interval restores capacity.
        assert!(policy.allow_at("remote.example", t0 + Duration::from_secs(60)));
    }

    #[test]
    fn refill_is_proportional_and_capped() {
        let policy = DomainPolicy::new(Vec::new(), 60);
        let t0 = Instant::now();
        for _ in 0..60 {
            assert!(policy.allow_at("d.example", t0));
        }
        assert!(!policy.allow_at("d.example", t0));
        // One second at 60/min buys exactly one token.
        assert!(policy.allow_at("d.example", t0 + Duration::from_secs(1)));
        assert!(!policy.allow_at("d.example", t0 + Duration::from_secs(1)));
    }

    #[test]
    fn host_extraction() {
        assert_eq!(
            host_of("https://Social.Example/users/amy").as_deref(),
            Some("social.example")
        );
        assert_eq!(host_of("not a url"), None);
    }
}
