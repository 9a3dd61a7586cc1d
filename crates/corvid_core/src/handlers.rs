/*
 * SPDX-FileCopyrightText: 2026 Corvid Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use async_trait::async_trait;
use corvid_protocol::{object_ref, AS_CONTEXT};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::delivery_queue::DeliveryQueue;
use crate::router::{ActivityHandler, ActivityRouter, Verb};
use crate::store::{Actor, Counter, FollowingStatus, Store};
use crate::thread::ThreadPropagator;

/// Build the default dispatch table. Every verb the engine understands is
/// registered here, at startup; nothing is resolved by name later.
pub fn default_router(
    store: Store,
    delivery: DeliveryQueue,
    propagator: ThreadPropagator,
) -> ActivityRouter {
    let content = Arc::new(ContentHandler {
        store: store.clone(),
        propagator,
    });
    let follow = Arc::new(FollowHandler {
        store: store.clone(),
        delivery: delivery.clone(),
    });
    let accept = Arc::new(AcceptHandler { store: store.clone() });
    let reaction = Arc::new(ReactionHandler { store: store.clone() });
    let undo = Arc::new(UndoHandler { store: store.clone() });
    let quote = Arc::new(QuoteHandler { store, delivery });

    let mut router = ActivityRouter::new();
    router.register(Verb::Create, "Note", content.clone());
    router.register_wildcard(Verb::Create, content.clone());
    router.register_wildcard(Verb::Update, content.clone());
    router.register_wildcard(Verb::Delete, content);
    router.register_wildcard(Verb::Follow, follow);
    router.register_wildcard(Verb::Accept, accept.clone());
    router.register_wildcard(Verb::Reject, accept);
    router.register_wildcard(Verb::Like, reaction.clone());
    router.register_wildcard(Verb::Announce, reaction);
    router.register_wildcard(Verb::Undo, undo);
    router.register_wildcard(Verb::QuoteRequest, quote);
    router
}

/// Create/Update/Delete of content objects, including reply indexing and
/// reply-count propagation up the thread.
pub struct ContentHandler {
    store: Store,
    propagator: ThreadPropagator,
}

#[async_trait]
impl ActivityHandler for ContentHandler {
    async fn on_create(&self, payload: &Value, _local: &Actor, remote: &Actor) -> Result<()> {
        let Some(object) = payload.get("object").filter(|o| o.is_object()) else {
            // Bare reference: type and content are unknown without a fetch.
            debug!("create with non-embedded object; nothing to store");
            return Ok(());
        };
        let Some(object_id) = object.get("id").and_then(|v| v.as_str()) else {
            debug!("create object without id; dropping");
            return Ok(());
        };
        let in_reply_to = object
            .get("inReplyTo")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let attributed = object
            .get("attributedTo")
            .and_then(|v| v.as_str())
            .unwrap_or(&remote.actor_id);

        let inserted = self.store.upsert_object(
            object_id,
            None,
            Some(attributed),
            in_reply_to,
            serde_json::to_vec(object)?,
        )?;
        // Only a first insert moves counters; replays are no-ops.
        if inserted {
            if let Some(parent) = in_reply_to {
                self.propagator.adjust(parent, 1)?;
            }
        }
        Ok(())
    }

    async fn on_update(&self, payload: &Value, _local: &Actor, _remote: &Actor) -> Result<()> {
        let Some(object) = payload.get("object").filter(|o| o.is_object()) else {
            return Ok(());
        };
        let Some(object_id) = object.get("id").and_then(|v| v.as_str()) else {
            return Ok(());
        };
        self.store
            .upsert_object(object_id, None, None, None, serde_json::to_vec(object)?)?;
        Ok(())
    }

    async fn on_delete(&self, payload: &Value, _local: &Actor, _remote: &Actor) -> Result<()> {
        let Some(object_id) = object_ref(payload) else {
            return Ok(());
        };
        let Some(row) = self.store.get_object(object_id)? else {
            return Ok(());
        };
        if row.deleted {
            return Ok(());
        }
        // Keep the tombstone when one is embedded; the raw payload stays
        // immutable either way.
        if let Some(tombstone) = payload.get("object").filter(|o| {
            o.is_object() && o.get("type").and_then(|t| t.as_str()) == Some("Tombstone")
        }) {
            self.store
                .upsert_object(object_id, None, None, None, serde_json::to_vec(tombstone)?)?;
        }
        self.store.mark_object_deleted(object_id)?;
        if let Some(parent) = row.in_reply_to.as_deref() {
            self.propagator.adjust(parent, -1)?;
        }
        Ok(())
    }
}

/// Inbound Follow: record the follower (keyed by the Follow's own id so a
/// later Undo can match exactly) and queue an Accept back to the sender.
pub struct FollowHandler {
    store: Store,
    delivery: DeliveryQueue,
}

#[async_trait]
impl ActivityHandler for FollowHandler {
    async fn on_follow(&self, payload: &Value, local: &Actor, remote: &Actor) -> Result<()> {
        let Some(target) = object_ref(payload) else {
            return Ok(());
        };
        if target != local.actor_id {
            debug!("follow for foreign actor {target}; ignoring");
            return Ok(());
        }

        let follow_id = payload.get("id").and_then(|v| v.as_str());
        self.store.add_follower(&remote.actor_id, follow_id)?;

        let Some(inbox) = remote.delivery_inbox() else {
            warn!("follower {} has no inbox; cannot accept", remote.actor_id);
            return Ok(());
        };

        let accept_id = self.store.new_activity_id(&local.actor_id);
        let accept = json!({
            "@context": AS_CONTEXT,
            "id": accept_id,
            "type": "Accept",
            "actor": local.actor_id,
            "object": payload,
            "to": [remote.actor_id],
        });
        let bytes = serde_json::to_vec(&accept)?;
        self.store.store_outbox(&accept_id, bytes.clone())?;
        self.delivery
            .enqueue(&local.actor_id, bytes, vec![inbox.to_string()])
            .await?;
        Ok(())
    }
}

/// Accept/Reject of a Follow we sent. Exact matching by the stored Follow
/// activity id; the actor-level heuristic is only a fallback for servers
/// that echo nothing usable back.
pub struct AcceptHandler {
    store: Store,
}

impl AcceptHandler {
    fn followed_target(&self, payload: &Value, local: &Actor, remote: &Actor) -> Result<Option<String>> {
        let follow_id = match payload.get("object") {
            Some(Value::String(id)) => Some(id.clone()),
            Some(obj) if obj.is_object() => obj.get("id").and_then(|v| v.as_str()).map(str::to_string),
            _ => None,
        };
        if let Some(id) = follow_id {
            if let Some(target) = self.store.following_by_follow_id(&id)? {
                return Ok(Some(target));
            }
        }

        // Fallback: an embedded Follow naming us as its actor.
        if let Some(obj) = payload.get("object").filter(|o| o.is_object()) {
            if obj.get("type").and_then(|v| v.as_str()) == Some("Follow")
                && obj.get("actor").and_then(|v| v.as_str()) == Some(local.actor_id.as_str())
            {
                if let Some(target) = obj.get("object").and_then(|v| v.as_str()) {
                    if self.store.get_following(target)?.is_some() {
                        return Ok(Some(target.to_string()));
                    }
                }
            }
        }

        // Last resort: the accepting actor itself, if we have them pending.
        if let Some((FollowingStatus::Pending, _)) = self.store.get_following(&remote.actor_id)? {
            return Ok(Some(remote.actor_id.clone()));
        }
        Ok(None)
    }
}

#[async_trait]
impl ActivityHandler for AcceptHandler {
    async fn on_accept(&self, payload: &Value, local: &Actor, remote: &Actor) -> Result<()> {
        if let Some(target) = self.followed_target(payload, local, remote)? {
            self.store.set_following(&target, FollowingStatus::Accepted, None)?;
        }
        Ok(())
    }

    async fn on_reject(&self, payload: &Value, local: &Actor, remote: &Actor) -> Result<()> {
        if let Some(target) = self.followed_target(payload, local, remote)? {
            self.store.remove_following(&target)?;
        }
        Ok(())
    }
}

/// Like/Announce. Reactions are keyed by their activity id, so replays are
/// no-ops and Undo can match exactly; counters move only on first sight of
/// a locally known object.
pub struct ReactionHandler {
    store: Store,
}

impl ReactionHandler {
    fn apply(&self, payload: &Value, remote: &Actor, kind: &str, counter: Counter) -> Result<()> {
        let Some(reaction_id) = payload.get("id").and_then(|v| v.as_str()) else {
            debug!("{kind} without id; dropping");
            return Ok(());
        };
        let Some(object_id) = object_ref(payload) else {
            return Ok(());
        };
        let inserted = self
            .store
            .upsert_reaction(reaction_id, kind, &remote.actor_id, object_id)?;
        if inserted && self.store.get_object(object_id)?.is_some() {
            self.store.adjust_counter(object_id, counter, 1)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ActivityHandler for ReactionHandler {
    async fn on_like(&self, payload: &Value, _local: &Actor, remote: &Actor) -> Result<()> {
        self.apply(payload, remote, "Like", Counter::Like)
    }

    async fn on_announce(&self, payload: &Value, _local: &Actor, remote: &Actor) -> Result<()> {
        self.apply(payload, remote, "Announce", Counter::Boost)
    }
}

/// Undo of Follow/Like/Announce. Tries the stored original activity id
/// first; reconstructing from actor/object is the legacy fallback.
pub struct UndoHandler {
    store: Store,
}

impl UndoHandler {
    fn retract_reaction(&self, reaction_id: &str) -> Result<bool> {
        let Some((kind, object_id)) = self.store.remove_reaction(reaction_id)? else {
            return Ok(false);
        };
        let counter = match kind.as_str() {
            "Like" => Counter::Like,
            "Announce" => Counter::Boost,
            _ => return Ok(true),
        };
        if self.store.get_object(&object_id)?.is_some() {
            self.store.adjust_counter(&object_id, counter, -1)?;
        }
        Ok(true)
    }

    fn undo_by_id(&self, id: &str, remote: &Actor) -> Result<bool> {
        if self.retract_reaction(id)? {
            return Ok(true);
        }
        if let Some(follower) = self.store.follower_by_follow_id(id)? {
            // Only the original follower may undo their follow.
            if follower == remote.actor_id {
                self.store.remove_follower(&follower)?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl ActivityHandler for UndoHandler {
    async fn on_undo(&self, payload: &Value, local: &Actor, remote: &Actor) -> Result<()> {
        let Some(obj) = payload.get("object") else {
            return Ok(());
        };

        if let Value::String(id) = obj {
            self.undo_by_id(id, remote)?;
            return Ok(());
        }
        if !obj.is_object() {
            return Ok(());
        }

        if let Some(id) = obj.get("id").and_then(|v| v.as_str()) {
            if self.undo_by_id(id, remote)? {
                return Ok(());
            }
        }

        // Heuristic fallback for ids the store has never seen.
        match obj.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "Follow" => {
                let actor = obj.get("actor").and_then(|v| v.as_str()).unwrap_or("");
                let target = obj.get("object").and_then(|v| v.as_str()).unwrap_or("");
                if actor == remote.actor_id && target == local.actor_id {
                    self.store.remove_follower(&remote.actor_id)?;
                }
            }
            kind @ ("Like" | "Announce") => {
                if let Some(object_id) = object_ref(obj) {
                    if let Some(reaction_id) =
                        self.store.find_reaction_by(&remote.actor_id, kind, object_id)?
                    {
                        self.retract_reaction(&reaction_id)?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// QuoteRequest: record the request and answer with an Accept, the same
/// shape the follow flow uses.
pub struct QuoteHandler {
    store: Store,
    delivery: DeliveryQueue,
}

#[async_trait]
impl ActivityHandler for QuoteHandler {
    async fn on_quote_request(&self, payload: &Value, local: &Actor, remote: &Actor) -> Result<()> {
        let Some(request_id) = payload.get("id").and_then(|v| v.as_str()) else {
            return Ok(());
        };
        let Some(object_id) = object_ref(payload) else {
            return Ok(());
        };
        // Only quotes of our own objects get an answer.
        if self.store.get_object(object_id)?.is_none() {
            return Ok(());
        }
        let inserted = self
            .store
            .upsert_quote_request(request_id, &remote.actor_id, object_id)?;
        if !inserted {
            return Ok(());
        }

        let Some(inbox) = remote.delivery_inbox() else {
            return Ok(());
        };
        let accept_id = self.store.new_activity_id(&local.actor_id);
        let accept = json!({
            "@context": AS_CONTEXT,
            "id": accept_id,
            "type": "Accept",
            "actor": local.actor_id,
            "object": payload,
            "to": [remote.actor_id],
        });
        let bytes = serde_json::to_vec(&accept)?;
        self.store.store_outbox(&accept_id, bytes.clone())?;
        self.store.mark_quote_request_accepted(request_id)?;
        self.delivery
            .enqueue(&local.actor_id, bytes, vec![inbox.to_string()])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadPropagator;
    use serde_json::json;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Store,
        delivery: DeliveryQueue,
        router: ActivityRouter,
        local: Actor,
        remote: Actor,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store.db")).unwrap();
        let delivery = DeliveryQueue::open(dir.path().join("delivery.db")).unwrap();
        let propagator =
            ThreadPropagator::new(store.clone(), "https://local.example/users/amy/objects");
        let router = default_router(store.clone(), delivery.clone(), propagator);

        let local = Actor {
            actor_id: "https://local.example/users/amy".to_string(),
            inbox: Some("https://local.example/users/amy/inbox".to_string()),
            is_local: true,
            ..Default::default()
        };
        let remote = Actor {
            actor_id: "https://remote.example/users/bob".to_string(),
            inbox: Some("https://remote.example/users/bob/inbox".to_string()),
            ..Default::default()
        };
        store.upsert_actor(&local).unwrap();

        Fixture {
            _dir: dir,
            store,
            delivery,
            router,
            local,
            remote,
        }
    }

    #[tokio::test]
    async fn follow_records_follower_and_queues_accept() {
        let f = fixture();
        let follow = json!({
            "id": "https://remote.example/activities/f1",
            "type": "Follow",
            "actor": f.remote.actor_id,
            "object": f.local.actor_id,
        });
        f.router.dispatch(&follow, &f.local, &f.remote).await.unwrap();

        assert_eq!(
            f.store
                .follower_by_follow_id("https://remote.example/activities/f1")
                .unwrap()
                .as_deref(),
            Some(f.remote.actor_id.as_str())
        );

        let jobs = f.delivery.fetch_due(10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].inbox, "https://remote.example/users/bob/inbox");
        let accept: Value = serde_json::from_slice(&jobs[0].activity_json).unwrap();
        assert_eq!(accept["type"], "Accept");
        assert_eq!(accept["actor"], f.local.actor_id.as_str());
        assert_eq!(accept["object"]["id"], "https://remote.example/activities/f1");
    }

    #[tokio::test]
    async fn undo_follow_matches_the_stored_activity_id() {
        let f = fixture();
        let follow = json!({
            "id": "https://remote.example/activities/f2",
            "type": "Follow",
            "actor": f.remote.actor_id,
            "object": f.local.actor_id,
        });
        f.router.dispatch(&follow, &f.local, &f.remote).await.unwrap();

        // Undo carrying only the original activity id.
        let undo = json!({
            "id": "https://remote.example/activities/u1",
            "type": "Undo",
            "actor": f.remote.actor_id,
            "object": "https://remote.example/activities/f2",
        });
        f.router.dispatch(&undo, &f.local, &f.remote).await.unwrap();
        assert_eq!(
            f.store.follower_by_follow_id("https://remote.example/activities/f2").unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn like_is_idempotent_and_undoable() {
        let f = fixture();
        let note = "https://local.example/users/amy/objects/n1";
        f.store.upsert_object(note, None, None, None, b"{}".to_vec()).unwrap();

        let like = json!({
            "id": "https://remote.example/activities/l1",
            "type": "Like",
            "actor": f.remote.actor_id,
            "object": note,
        });
        f.router.dispatch(&like, &f.local, &f.remote).await.unwrap();
        f.router.dispatch(&like, &f.local, &f.remote).await.unwrap();
        assert_eq!(f.store.get_object(note).unwrap().unwrap().like_count, 1);

        let undo = json!({
            "type": "Undo",
            "actor": f.remote.actor_id,
            "object": { "id": "https://remote.example/activities/l1", "type": "Like", "object": note },
        });
        f.router.dispatch(&undo, &f.local, &f.remote).await.unwrap();
        assert_eq!(f.store.get_object(note).unwrap().unwrap().like_count, 0);
    }

    #[tokio::test]
    async fn create_reply_bumps_the_parent_once() {
        let f = fixture();
        let parent = "https://local.example/users/amy/objects/p1";
        f.store.upsert_object(parent, None, None, None, b"{}".to_vec()).unwrap();

        let create = json!({
            "id": "https://remote.example/activities/c1",
            "type": "Create",
            "actor": f.remote.actor_id,
            "object": {
                "id": "https://remote.example/notes/reply1",
                "type": "Note",
                "inReplyTo": parent,
                "content": "hi",
            },
        });
        f.router.dispatch(&create, &f.local, &f.remote).await.unwrap();
        f.router.dispatch(&create, &f.local, &f.remote).await.unwrap();
        assert_eq!(f.store.get_object(parent).unwrap().unwrap().reply_count, 1);

        let delete = json!({
            "type": "Delete",
            "actor": f.remote.actor_id,
            "object": "https://remote.example/notes/reply1",
        });
        f.router.dispatch(&delete, &f.local, &f.remote).await.unwrap();
        assert_eq!(f.store.get_object(parent).unwrap().unwrap().reply_count, 0);
        assert!(f.store.get_object("https://remote.example/notes/reply1").unwrap().unwrap().deleted);
    }

    #[tokio::test]
    async fn accept_flips_pending_following() {
        let f = fixture();
        f.store
            .set_following(
                &f.remote.actor_id,
                FollowingStatus::Pending,
                Some("https://local.example/users/amy/activities/follow9"),
            )
            .unwrap();

        let accept = json!({
            "type": "Accept",
            "actor": f.remote.actor_id,
            "object": {
                "id": "https://local.example/users/amy/activities/follow9",
                "type": "Follow",
                "actor": f.local.actor_id,
                "object": f.remote.actor_id,
            },
        });
        f.router.dispatch(&accept, &f.local, &f.remote).await.unwrap();
        assert_eq!(
            f.store.get_following(&f.remote.actor_id).unwrap().map(|(s, _)| s),
            Some(FollowingStatus::Accepted)
        );
    }
}
