/*
 * SPDX-FileCopyrightText: 2026 Corvid Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use std::collections::HashSet;
use tracing::debug;

use crate::store::{Counter, ObjectRow, Store};

const MAX_DEPTH: usize = 100;

/// Propagates reply-count changes up a reply chain. The chain comes from
/// remote servers and can be cyclic or unbounded, so the walk is iterative
/// with a per-call visited set and a hard depth cap.
#[derive(Clone)]
pub struct ThreadPropagator {
    store: Store,
    /// Base under which local objects are addressable, e.g.
    /// `https://node.example/users/amy/objects`.
    objects_base: String,
}

impl ThreadPropagator {
    pub fn new(store: Store, objects_base: impl Into<String>) -> Self {
        Self {
            store,
            objects_base: objects_base.into().trim_end_matches('/').to_string(),
        }
    }

    /// Adjust `reply_count` by `delta` on `parent_ref` and every resolvable
    /// ancestor. Each node is touched at most once per call; counts clamp
    /// at zero. Stops at unresolvable references, the depth cap, or a
    /// previously visited node.
    pub fn adjust(&self, parent_ref: &str, delta: i64) -> Result<usize> {
        let mut visited = HashSet::new();
        let mut adjusted = 0usize;
        let mut current = parent_ref.trim().to_string();

        for _ in 0..MAX_DEPTH {
            let Some(row) = self.resolve_ref(&current)? else {
                break;
            };
            if !visited.insert(row.object_id.clone()) {
                debug!("reply chain cycle at {}; stopping", row.object_id);
                break;
            }

            self.store.adjust_counter(&row.object_id, Counter::Reply, delta)?;
            adjusted += 1;

            match row.in_reply_to {
                Some(next) if !next.trim().is_empty() => current = next,
                _ => break,
            }
        }
        Ok(adjusted)
    }

    /// An object may be referenced three ways: canonical id (protocol URI),
    /// bare local key, or local absolute URL. Tried in that order.
    fn resolve_ref(&self, reference: &str) -> Result<Option<ObjectRow>> {
        if let Some(row) = self.store.get_object(reference)? {
            return Ok(Some(row));
        }
        if let Some(row) = self.store.get_object_by_local_key(reference)? {
            return Ok(Some(row));
        }
        if let Some(key) = reference.strip_prefix(&format!("{}/", self.objects_base)) {
            if let Some(row) = self.store.get_object_by_local_key(key)? {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, Store, ThreadPropagator) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store.db")).unwrap();
        let propagator = ThreadPropagator::new(
            store.clone(),
            "https://node.example/users/amy/objects",
        );
        (dir, store, propagator)
    }

    fn insert(store: &Store, id: &str, local_key: Option<&str>, in_reply_to: Option<&str>) {
        store
            .upsert_object(id, local_key, None, in_reply_to, b"{}".to_vec())
            .unwrap();
    }

    #[test]
    fn walks_the_chain_to_the_root() {
        let (_dir, store, propagator) = setup();
        insert(&store, "root", None, None);
        insert(&store, "mid", None, Some("root"));
        insert(&store, "leaf", None, Some("mid"));

        assert_eq!(propagator.adjust("leaf", 1).unwrap(), 3);
        assert_eq!(store.get_object("root").unwrap().unwrap().reply_count, 1);
        assert_eq!(store.get_object("mid").unwrap().unwrap().reply_count, 1);
    }

    #[test]
    fn cycles_terminate_with_each_node_touched_once() {
        let (_dir, store, propagator) = setup();
        // A → B → A, the shape malformed remote data produces.
        insert(&store, "a", None, Some("b"));
        insert(&store, "b", None, Some("a"));

        assert_eq!(propagator.adjust("a", 1).unwrap(), 2);
        assert_eq!(store.get_object("a").unwrap().unwrap().reply_count, 1);
        assert_eq!(store.get_object("b").unwrap().unwrap().reply_count, 1);
    }

    #[test]
    fn decrement_clamps_at_zero() {
        let (_dir, store, propagator) = setup();
        insert(&store, "only", None, None);
        propagator.adjust("only", -1).unwrap();
        propagator.adjust("only", -1).unwrap();
        assert_eq!(store.get_object("only").unwrap().unwrap().reply_count, 0);
    }

    #[test]
    fn resolves_all_three_addressing_forms() {
        let (_dir, store, propagator) = setup();
        insert(
            &store,
            "https://node.example/users/amy/objects/abc123",
            Some("abc123"),
            None,
        );

        for form in [
            "https://node.example/users/amy/objects/abc123",
            "abc123",
        ] {
            assert_eq!(propagator.adjust(form, 1).unwrap(), 1, "form {form}");
        }
        assert_eq!(
            store
                .get_object("https://node.example/users/amy/objects/abc123")
                .unwrap()
                .unwrap()
                .reply_count,
            2
        );
    }

    #[test]
    fn unresolvable_reference_is_a_clean_stop() {
        let (_dir, store, propagator) = setup();
        insert(&store, "reply", None, Some("https://gone.example/n/404"));
        assert_eq!(propagator.adjust("reply", 1).unwrap(), 1);
        assert_eq!(propagator.adjust("https://gone.example/n/404", 1).unwrap(), 0);
    }
}
