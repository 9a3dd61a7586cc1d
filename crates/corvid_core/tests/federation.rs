/*
 * SPDX-FileCopyrightText: 2026 Corvid Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! End-to-end federation flows driven through the queues, with remote
//! actors pre-seeded in the store so no network I/O is involved.

use corvid_core::config::FederationConfig;
use corvid_core::delivery_queue::SendOutcome;
use corvid_core::runtime::FederationState;
use corvid_core::store::{Actor, FollowingStatus};
use serde_json::{json, Value};
use std::sync::Arc;

fn remote_actor(id: &str, inbox: &str) -> Actor {
    Actor {
        actor_id: id.to_string(),
        inbox: Some(inbox.to_string()),
        public_key_pem: Some("PEM".to_string()),
        ..Default::default()
    }
}

fn open_state(blocked_domains: Vec<String>) -> (tempfile::TempDir, Arc<FederationState>) {
    let dir = tempfile::tempdir().unwrap();
    let config = FederationConfig {
        username: "amy".to_string(),
        domain: "local.example".to_string(),
        blocked_domains,
        ..Default::default()
    };
    let state = FederationState::open(config, dir.path()).unwrap();
    (dir, state)
}

#[tokio::test]
async fn follow_delivery_and_accept_round_trip() {
    let (_dir, state) = open_state(Vec::new());
    let bob = "https://remote.example/users/b";
    let bob_inbox = "https://remote.example/users/b/inbox";
    state.store.upsert_actor(&remote_actor(bob, bob_inbox)).unwrap();

    state.outbound.follow(bob).await.unwrap();

    // One queue item targeting bob's inbox, carrying our Follow.
    let jobs = state.delivery.fetch_due(10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].inbox, bob_inbox);
    let follow: Value = serde_json::from_slice(&jobs[0].activity_json).unwrap();
    assert_eq!(follow["type"], "Follow");
    assert_eq!(follow["actor"], state.local_actor_id().as_str());
    assert_eq!(follow["object"], bob);

    // Pending until the remote accepts.
    let (status, follow_id) = state.store.get_following(bob).unwrap().unwrap();
    assert_eq!(status, FollowingStatus::Pending);
    let follow_id = follow_id.unwrap();
    assert_eq!(follow["id"], follow_id.as_str());

    // Simulated 202 removes the job from the active queue.
    state
        .delivery
        .handle_outcome(&jobs[0], SendOutcome::Delivered, &state.delivery_settings())
        .await
        .unwrap();
    assert!(state.delivery.fetch_due(10).await.unwrap().is_empty());

    // Bob's Accept arrives and is dispatched; the follow goes accepted.
    let accept = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": "https://remote.example/activities/accept1",
        "type": "Accept",
        "actor": bob,
        "object": {
            "id": follow_id,
            "type": "Follow",
            "actor": state.local_actor_id(),
            "object": bob,
        },
    });
    state
        .ingest
        .enqueue(&state.local_actor_id(), serde_json::to_vec(&accept).unwrap())
        .await
        .unwrap();
    let processed = state.ingest_worker().drain_once().await.unwrap();
    assert_eq!(processed, 1);

    let (status, _) = state.store.get_following(bob).unwrap().unwrap();
    assert_eq!(status, FollowingStatus::Accepted);
}

#[tokio::test]
async fn duplicate_create_ingestion_is_idempotent() {
    let (_dir, state) = open_state(Vec::new());
    let bob = "https://remote.example/users/b";
    state
        .store
        .upsert_actor(&remote_actor(bob, "https://remote.example/users/b/inbox"))
        .unwrap();

    let parent = state.outbound.create_note("root post", None).await.unwrap();

    let create = json!({
        "id": "https://remote.example/activities/c1",
        "type": "Create",
        "actor": bob,
        "object": {
            "id": "https://remote.example/notes/r1",
            "type": "Note",
            "inReplyTo": parent,
            "content": "a reply",
        },
    });
    let bytes = serde_json::to_vec(&create).unwrap();
    let me = state.local_actor_id();
    state.ingest.enqueue(&me, bytes.clone()).await.unwrap();
    state.ingest.enqueue(&me, bytes).await.unwrap();

    assert_eq!(state.ingest_worker().drain_once().await.unwrap(), 2);

    // One stored reply, one counter bump.
    let row = state.store.get_object(&parent).unwrap().unwrap();
    assert_eq!(row.reply_count, 1);
    assert!(state
        .store
        .get_object("https://remote.example/notes/r1")
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn blocked_domains_are_dropped_silently() {
    let (_dir, state) = open_state(vec!["bad.example".to_string()]);
    let troll = "https://sub.bad.example/users/troll";
    state
        .store
        .upsert_actor(&remote_actor(troll, "https://sub.bad.example/inbox"))
        .unwrap();

    let note = state.outbound.create_note("hello", None).await.unwrap();
    let like = json!({
        "id": "https://sub.bad.example/activities/l1",
        "type": "Like",
        "actor": troll,
        "object": note,
    });
    state
        .ingest
        .enqueue(&state.local_actor_id(), serde_json::to_vec(&like).unwrap())
        .await
        .unwrap();
    assert_eq!(state.ingest_worker().drain_once().await.unwrap(), 1);

    // The like never applied, and nothing was surfaced to the sender.
    assert_eq!(state.store.get_object(&note).unwrap().unwrap().like_count, 0);
    assert_eq!(state.ingest.pending().await.unwrap(), 0);
}

#[tokio::test]
async fn note_fan_out_reaches_follower_inboxes_once() {
    let (_dir, state) = open_state(Vec::new());

    // Two followers on the same server share an inbox; one elsewhere.
    let shared = "https://big.example/inbox";
    for name in ["carol", "dave"] {
        let id = format!("https://big.example/users/{name}");
        let mut actor = remote_actor(&id, &format!("{id}/inbox"));
        actor.shared_inbox = Some(shared.to_string());
        state.store.upsert_actor(&actor).unwrap();
        state.store.add_follower(&id, None).unwrap();
    }
    let eve = "https://solo.example/users/eve";
    state
        .store
        .upsert_actor(&remote_actor(eve, "https://solo.example/users/eve/inbox"))
        .unwrap();
    state.store.add_follower(eve, None).unwrap();

    state.outbound.create_note("fan out", None).await.unwrap();

    let jobs = state.delivery.fetch_due(10).await.unwrap();
    let mut inboxes: Vec<&str> = jobs.iter().map(|j| j.inbox.as_str()).collect();
    inboxes.sort();
    assert_eq!(
        inboxes,
        vec!["https://big.example/inbox", "https://solo.example/users/eve/inbox"]
    );
}

#[tokio::test]
async fn undo_follow_restores_state_and_notifies() {
    let (_dir, state) = open_state(Vec::new());
    let bob = "https://remote.example/users/b";
    state
        .store
        .upsert_actor(&remote_actor(bob, "https://remote.example/users/b/inbox"))
        .unwrap();

    state.outbound.follow(bob).await.unwrap();
    let (_, follow_id) = state.store.get_following(bob).unwrap().unwrap();
    state.outbound.undo_follow(bob).await.unwrap();

    assert!(state.store.get_following(bob).unwrap().is_none());

    // Second job is the Undo embedding the original Follow id.
    let jobs = state.delivery.fetch_due(10).await.unwrap();
    assert_eq!(jobs.len(), 2);
    let undo: Value = serde_json::from_slice(&jobs[1].activity_json).unwrap();
    assert_eq!(undo["type"], "Undo");
    assert_eq!(undo["object"]["type"], "Follow");
    assert_eq!(undo["object"]["id"], follow_id.unwrap().as_str());
}
