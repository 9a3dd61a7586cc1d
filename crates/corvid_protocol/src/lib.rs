/*
 * SPDX-FileCopyrightText: 2026 Corvid Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ACTIVITY_JSON: &str = "application/activity+json";
pub const ACTIVITY_ACCEPT: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";
pub const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const AS_PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Remote actor document as fetched from `GET <actor-id>` with the
/// ActivityStreams Accept header. Only the fields the engine consumes.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ActorDocument {
    #[serde(rename = "@context", skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "preferredUsername", skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inbox: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbox: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<ActorEndpoints>,
    #[serde(rename = "publicKey", skip_serializing_if = "Option::is_none")]
    pub public_key: Option<ActorPublicKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspended: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<ActorImage>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ActorEndpoints {
    #[serde(rename = "sharedInbox", skip_serializing_if = "Option::is_none")]
    pub shared_inbox: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ActorPublicKey {
    pub id: String,
    pub owner: String,
    #[serde(rename = "publicKeyPem")]
    pub public_key_pem: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ActorImage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub url: String,
}

/// WebFinger JRD document (`/.well-known/webfinger?resource=acct:user@domain`).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JrdDocument {
    pub subject: String,
    pub links: Vec<JrdLink>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JrdLink {
    pub rel: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

impl JrdDocument {
    /// The actor URI advertised by the `rel == "self"` link, if any.
    pub fn self_link(&self) -> Option<&str> {
        self.links
            .iter()
            .filter(|l| l.rel == "self")
            .find(|l| {
                l.kind
                    .as_deref()
                    .map(|t| t.contains("activity+json") || t.contains("ld+json"))
                    .unwrap_or(true)
            })
            .and_then(|l| l.href.as_deref())
    }
}

/// All addressed recipients (`to` + `cc`), the public collection excluded,
/// sorted and deduplicated.
pub fn extract_recipients(activity: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_field(activity, "to", &mut out);
    collect_field(activity, "cc", &mut out);
    out.retain(|v| v != AS_PUBLIC);
    out.sort();
    out.dedup();
    out
}

fn collect_field(activity: &Value, field: &str, out: &mut Vec<String>) {
    let Some(v) = activity.get(field) else { return };
    match v {
        Value::String(s) => out.push(s.clone()),
        Value::Array(arr) => {
            for item in arr {
                if let Value::String(s) = item {
                    out.push(s.clone());
                }
            }
        }
        _ => {}
    }
}

pub fn is_public_activity(activity: &Value) -> bool {
    fn has_public(v: &Value) -> bool {
        match v {
            Value::String(s) => s == AS_PUBLIC,
            Value::Array(arr) => arr.iter().any(has_public),
            _ => false,
        }
    }
    activity.get("to").map(has_public).unwrap_or(false)
        || activity.get("cc").map(has_public).unwrap_or(false)
}

/// Actor reference of an activity: either a bare string or an embedded
/// object with an `id`.
pub fn actor_ref(activity: &Value) -> Option<&str> {
    match activity.get("actor")? {
        Value::String(s) => Some(s.as_str()),
        Value::Object(m) => m.get("id").and_then(|v| v.as_str()),
        _ => None,
    }
}

/// Object reference of an activity: bare string, or the embedded object's `id`.
pub fn object_ref(activity: &Value) -> Option<&str> {
    match activity.get("object")? {
        Value::String(s) => Some(s.as_str()),
        Value::Object(m) => m.get("id").and_then(|v| v.as_str()),
        _ => None,
    }
}
