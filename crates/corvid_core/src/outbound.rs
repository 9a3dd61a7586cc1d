/*
 * SPDX-FileCopyrightText: 2026 Corvid Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use corvid_protocol::{AS_CONTEXT, AS_PUBLIC};
use serde_json::{json, Value};
use std::{collections::HashSet, sync::Arc};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{debug, warn};

use crate::actor_dir::ActorDirectory;
use crate::config::FederationConfig;
use crate::delivery_queue::DeliveryQueue;
use crate::domain_policy::{host_of, DomainPolicy};
use crate::store::{Counter, FollowingStatus, Store};
use crate::thread::ThreadPropagator;

/// Local mutations that fan out over federation. Each builds the activity
/// document, records it in the outbox, and enqueues one delivery job per
/// distinct inbox. Delivery itself is asynchronous; nothing here waits on
/// a remote server.
#[derive(Clone)]
pub struct Outbound {
    config: FederationConfig,
    store: Store,
    directory: ActorDirectory,
    delivery: DeliveryQueue,
    propagator: ThreadPropagator,
    policy: Arc<DomainPolicy>,
}

impl Outbound {
    pub fn new(
        config: FederationConfig,
        store: Store,
        directory: ActorDirectory,
        delivery: DeliveryQueue,
        propagator: ThreadPropagator,
        policy: Arc<DomainPolicy>,
    ) -> Self {
        Self {
            config,
            store,
            directory,
            delivery,
            propagator,
            policy,
        }
    }

    fn me(&self) -> String {
        self.config.local_actor_id()
    }

    /// Follow a remote actor, given an actor URI or a `user@domain` handle.
    /// The follow is pending until their Accept is ingested; the Follow id
    /// is stored so that Accept (and any later Undo) can match exactly.
    pub async fn follow(&self, target: &str) -> Result<()> {
        let target_uri = if target.contains("://") {
            target.to_string()
        } else {
            self.directory
                .resolve_handle(target)
                .await
                .ok_or_else(|| anyhow!("handle not resolvable: {target}"))?
        };
        let actor = self
            .directory
            .resolve(&target_uri, true)
            .await
            .ok_or_else(|| anyhow!("actor not resolvable: {target_uri}"))?;
        let inbox = actor
            .delivery_inbox()
            .ok_or_else(|| anyhow!("actor has no inbox: {}", actor.actor_id))?
            .to_string();

        let me = self.me();
        let follow_id = self.store.new_activity_id(&me);
        let activity = json!({
            "@context": AS_CONTEXT,
            "id": follow_id,
            "type": "Follow",
            "actor": me,
            "object": actor.actor_id,
            "to": [actor.actor_id],
        });
        let bytes = serde_json::to_vec(&activity).context("encode follow")?;
        self.store.store_outbox(&follow_id, bytes.clone())?;
        self.store
            .set_following(&actor.actor_id, FollowingStatus::Pending, Some(&follow_id))?;
        self.delivery.enqueue(&me, bytes, vec![inbox]).await?;
        Ok(())
    }

    /// Undo a previous follow. The embedded object reconstructs the original
    /// Follow, id included, from what we stored at send time.
    pub async fn undo_follow(&self, target_uri: &str) -> Result<()> {
        let Some((_, follow_id)) = self.store.get_following(target_uri)? else {
            return Err(anyhow!("not following {target_uri}"));
        };
        let actor = self
            .directory
            .resolve(target_uri, false)
            .await
            .ok_or_else(|| anyhow!("actor not resolvable: {target_uri}"))?;
        let inbox = actor
            .delivery_inbox()
            .ok_or_else(|| anyhow!("actor has no inbox: {target_uri}"))?
            .to_string();

        let me = self.me();
        let undo_id = self.store.new_activity_id(&me);
        let mut follow_obj = json!({
            "type": "Follow",
            "actor": me,
            "object": target_uri,
        });
        if let Some(id) = follow_id {
            follow_obj["id"] = Value::String(id);
        }
        let activity = json!({
            "@context": AS_CONTEXT,
            "id": undo_id,
            "type": "Undo",
            "actor": me,
            "object": follow_obj,
            "to": [target_uri],
        });
        let bytes = serde_json::to_vec(&activity).context("encode undo")?;
        self.store.store_outbox(&undo_id, bytes.clone())?;
        self.store.remove_following(target_uri)?;
        self.delivery.enqueue(&me, bytes, vec![inbox]).await?;
        Ok(())
    }

    /// Publish a public note, optionally as a reply. Returns the object id.
    pub async fn create_note(&self, content: &str, in_reply_to: Option<&str>) -> Result<String> {
        let me = self.me();
        let key = self.store.new_object_key();
        let object_id = format!("{me}/objects/{key}");
        let mut note = json!({
            "id": object_id,
            "type": "Note",
            "attributedTo": me,
            "content": content,
            "published": published_now(),
            "to": [AS_PUBLIC],
            "cc": [format!("{me}/followers")],
        });
        if let Some(parent) = in_reply_to {
            note["inReplyTo"] = Value::String(parent.to_string());
        }

        self.store.upsert_object(
            &object_id,
            Some(&key),
            Some(&me),
            in_reply_to,
            serde_json::to_vec(&note)?,
        )?;
        if let Some(parent) = in_reply_to {
            self.propagator.adjust(parent, 1)?;
        }

        let activity_id = self.store.new_activity_id(&me);
        let activity = json!({
            "@context": AS_CONTEXT,
            "id": activity_id,
            "type": "Create",
            "actor": me,
            "object": note,
            "published": published_now(),
            "to": [AS_PUBLIC],
            "cc": [format!("{me}/followers")],
        });
        let bytes = serde_json::to_vec(&activity)?;
        self.store.store_outbox(&activity_id, bytes.clone())?;
        self.fan_out(bytes, Vec::new()).await?;
        Ok(object_id)
    }

    pub async fn like(&self, object_id: &str) -> Result<()> {
        self.react(object_id, "Like", Counter::Like).await
    }

    pub async fn announce(&self, object_id: &str) -> Result<()> {
        self.react(object_id, "Announce", Counter::Boost).await
    }

    async fn react(&self, object_id: &str, kind: &str, counter: Counter) -> Result<()> {
        let me = self.me();
        let activity_id = self.store.new_activity_id(&me);
        let activity = json!({
            "@context": AS_CONTEXT,
            "id": activity_id,
            "type": kind,
            "actor": me,
            "object": object_id,
            "to": [AS_PUBLIC],
        });
        let bytes = serde_json::to_vec(&activity)?;

        let inserted = self.store.upsert_reaction(&activity_id, kind, &me, object_id)?;
        if inserted && self.store.get_object(object_id)?.is_some() {
            self.store.adjust_counter(object_id, counter, 1)?;
        }
        self.store.store_outbox(&activity_id, bytes.clone())?;

        // The object's author hears about it alongside our followers.
        let mut extra = Vec::new();
        if let Some(row) = self.store.get_object(object_id)? {
            if let Some(author) = row.actor_id {
                extra.push(author);
            }
        }
        self.fan_out(bytes, extra).await?;
        Ok(())
    }

    /// Delete a local object: tombstone locally, retract the reply count,
    /// and tell everyone who heard about it.
    pub async fn delete_object(&self, object_ref: &str) -> Result<()> {
        let row = match self.store.get_object(object_ref)? {
            Some(row) => row,
            None => self
                .store
                .get_object_by_local_key(object_ref)?
                .ok_or_else(|| anyhow!("unknown object: {object_ref}"))?,
        };
        if row.deleted {
            return Ok(());
        }
        self.store.mark_object_deleted(&row.object_id)?;
        if let Some(parent) = row.in_reply_to.as_deref() {
            self.propagator.adjust(parent, -1)?;
        }

        let me = self.me();
        let activity_id = self.store.new_activity_id(&me);
        let activity = json!({
            "@context": AS_CONTEXT,
            "id": activity_id,
            "type": "Delete",
            "actor": me,
            "object": { "id": row.object_id, "type": "Tombstone" },
            "to": [AS_PUBLIC],
        });
        let bytes = serde_json::to_vec(&activity)?;
        self.store.store_outbox(&activity_id, bytes.clone())?;
        self.fan_out(bytes, Vec::new()).await?;
        Ok(())
    }

    /// Resolve follower plus extra recipients to inboxes and enqueue one
    /// job per distinct inbox. Shared inboxes collapse recipients on the
    /// same server into a single job. Blocked recipients are filtered
    /// before anything is queued.
    pub async fn fan_out(&self, activity_json: Vec<u8>, extra: Vec<String>) -> Result<u64> {
        let mut recipients: Vec<String> = Vec::new();
        let mut cursor = None;
        loop {
            let (page, next) = self.store.list_followers(500, cursor)?;
            recipients.extend(page);
            let Some(next) = next else { break };
            cursor = Some(next);
        }
        recipients.extend(extra);
        recipients.sort();
        recipients.dedup();

        let me = self.me();
        let mut inboxes = Vec::new();
        let mut seen = HashSet::new();
        for recipient in recipients {
            if recipient == me {
                continue;
            }
            if self.config.blocked_actors.iter().any(|a| a == &recipient) {
                continue;
            }
            if let Some(domain) = host_of(&recipient) {
                if self.policy.is_blocked(&domain) {
                    continue;
                }
            }
            let Some(actor) = self.directory.resolve(&recipient, true).await else {
                debug!("skipping unresolvable recipient {recipient}");
                continue;
            };
            let Some(inbox) = actor.delivery_inbox() else {
                warn!("recipient {} has no inbox", actor.actor_id);
                continue;
            };
            if seen.insert(inbox.to_string()) {
                inboxes.push(inbox.to_string());
            }
        }

        if inboxes.is_empty() {
            return Ok(0);
        }
        let pending = self.delivery.enqueue(&me, activity_json, inboxes).await?;
        Ok(pending)
    }
}

fn published_now() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn published_timestamps_are_rfc3339() {
        let ts = published_now();
        assert!(ts.contains('T'));
        assert!(OffsetDateTime::parse(&ts, &Rfc3339).is_ok());
    }
}
