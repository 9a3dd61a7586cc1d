/*
 * SPDX-FileCopyrightText: 2026 Corvid Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

use crate::store::Actor;

/// Sentinel object type for a bare URI object (type unknown until fetched).
pub const OBJECT_TYPE_REFERENCE: &str = "Reference";
/// Sentinel object type for an absent object.
pub const OBJECT_TYPE_UNKNOWN: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Create,
    Update,
    Delete,
    Follow,
    Accept,
    Reject,
    Like,
    Announce,
    Undo,
    QuoteRequest,
}

impl Verb {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "Create" => Self::Create,
            "Update" => Self::Update,
            "Delete" => Self::Delete,
            "Follow" => Self::Follow,
            "Accept" => Self::Accept,
            "Reject" => Self::Reject,
            "Like" => Self::Like,
            "Announce" => Self::Announce,
            "Undo" => Self::Undo,
            "QuoteRequest" => Self::QuoteRequest,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Follow => "Follow",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::Like => "Like",
            Self::Announce => "Announce",
            Self::Undo => "Undo",
            Self::QuoteRequest => "QuoteRequest",
        }
    }
}

/// One entry point per verb; a handler implements the verbs it supports and
/// leaves the rest as the default no-op. Resolution happens once at
/// registration, never by name at dispatch time.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn on_create(&self, payload: &Value, local: &Actor, remote: &Actor) -> Result<()> {
        let _ = (payload, local, remote);
        Ok(())
    }
    async fn on_update(&self, payload: &Value, local: &Actor, remote: &Actor) -> Result<()> {
        let _ = (payload, local, remote);
        Ok(())
    }
    async fn on_delete(&self, payload: &Value, local: &Actor, remote: &Actor) -> Result<()> {
        let _ = (payload, local, remote);
        Ok(())
    }
    async fn on_follow(&self, payload: &Value, local: &Actor, remote: &Actor) -> Result<()> {
        let _ = (payload, local, remote);
        Ok(())
    }
    async fn on_accept(&self, payload: &Value, local: &Actor, remote: &Actor) -> Result<()> {
        let _ = (payload, local, remote);
        Ok(())
    }
    async fn on_reject(&self, payload: &Value, local: &Actor, remote: &Actor) -> Result<()> {
        let _ = (payload, local, remote);
        Ok(())
    }
    async fn on_like(&self, payload: &Value, local: &Actor, remote: &Actor) -> Result<()> {
        let _ = (payload, local, remote);
        Ok(())
    }
    async fn on_announce(&self, payload: &Value, local: &Actor, remote: &Actor) -> Result<()> {
        let _ = (payload, local, remote);
        Ok(())
    }
    async fn on_undo(&self, payload: &Value, local: &Actor, remote: &Actor) -> Result<()> {
        let _ = (payload, local, remote);
        Ok(())
    }
    async fn on_quote_request(&self, payload: &Value, local: &Actor, remote: &Actor) -> Result<()> {
        let _ = (payload, local, remote);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    /// Unknown verbs and unregistered pairs are expected in an open-ended
    /// vocabulary; discarding them is not an error.
    Unhandled,
}

/// Registry mapping `"<Verb>:<ObjectType>"` to a handler, with
/// `"<Verb>:*"` as fallback. New pairs register at startup without
/// touching the dispatch path.
#[derive(Default)]
pub struct ActivityRouter {
    handlers: HashMap<String, Arc<dyn ActivityHandler>>,
}

impl ActivityRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, verb: Verb, object_type: &str, handler: Arc<dyn ActivityHandler>) {
        self.handlers
            .insert(format!("{}:{object_type}", verb.as_str()), handler);
    }

    pub fn register_wildcard(&mut self, verb: Verb, handler: Arc<dyn ActivityHandler>) {
        self.register(verb, "*", handler);
    }

    /// Object type of a payload: the embedded object's own `type`,
    /// `Reference` for a bare URI, `Unknown` when absent.
    pub fn object_type_of(payload: &Value) -> &str {
        match payload.get("object") {
            None | Some(Value::Null) => OBJECT_TYPE_UNKNOWN,
            Some(Value::String(_)) => OBJECT_TYPE_REFERENCE,
            Some(obj) => obj
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or(OBJECT_TYPE_UNKNOWN),
        }
    }

    pub async fn dispatch(
        &self,
        payload: &Value,
        local: &Actor,
        remote: &Actor,
    ) -> Result<Dispatch> {
        let verb_str = payload.get("type").and_then(|v| v.as_str()).unwrap_or("");
        let Some(verb) = Verb::parse(verb_str) else {
            debug!("no handler for activity type {verb_str:?}; ignoring");
            return Ok(Dispatch::Unhandled);
        };

        let object_type = Self::object_type_of(payload);
        let exact = format!("{}:{object_type}", verb.as_str());
        let handler = self
            .handlers
            .get(&exact)
            .or_else(|| self.handlers.get(&format!("{}:*", verb.as_str())));
        let Some(handler) = handler else {
            debug!("no handler registered for {exact}; ignoring");
            return Ok(Dispatch::Unhandled);
        };

        match verb {
            Verb::Create => handler.on_create(payload, local, remote).await?,
            Verb::Update => handler.on_update(payload, local, remote).await?,
            Verb::Delete => handler.on_delete(payload, local, remote).await?,
            Verb::Follow => handler.on_follow(payload, local, remote).await?,
            Verb::Accept => handler.on_accept(payload, local, remote).await?,
            Verb::Reject => handler.on_reject(payload, local, remote).await?,
            Verb::Like => handler.on_like(payload, local, remote).await?,
            Verb::Announce => handler.on_announce(payload, local, remote).await?,
            Verb::Undo => handler.on_undo(payload, local, remote).await?,
            Verb::QuoteRequest => handler.on_quote_request(payload, local, remote).await?,
        }
        Ok(Dispatch::Handled)
    }
}
