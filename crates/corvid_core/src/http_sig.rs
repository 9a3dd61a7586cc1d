/*
 * SPDX-FileCopyrightText: 2026 Corvid Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use http::{HeaderMap, Method, Uri};
use httpdate::parse_http_date;
use rsa::{
    pkcs1v15::{SigningKey, VerifyingKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    signature::{RandomizedSigner, SignatureEncoding, Verifier},
    RsaPrivateKey, RsaPublicKey,
};
use sha2::{Digest, Sha256};
use std::{collections::HashMap, time::Duration};
use tracing::debug;

use crate::actor_dir::ActorDirectory;
use crate::keys::actor_id_from_key_id;

/// Parsed `Signature` header.
#[derive(Debug)]
pub struct SignatureParams {
    pub key_id: String,
    /// Signed header names, lowercased, in signature order.
    pub headers: Vec<String>,
    pub signature: Vec<u8>,
}

/// Parse `Signature: keyId="...",algorithm="...",headers="...",signature="..."`.
pub fn parse_signature_header(value: &str) -> Result<SignatureParams> {
    let mut fields = HashMap::<&str, &str>::new();
    for part in value.split(',') {
        let Some((k, v)) = part.trim().split_once('=') else { continue };
        fields.insert(k.trim(), v.trim().trim_matches('"'));
    }

    let key_id = fields
        .get("keyId")
        .ok_or_else(|| anyhow!("Signature missing keyId"))?
        .to_string();
    let signature = B64
        .decode(
            fields
                .get("signature")
                .ok_or_else(|| anyhow!("Signature missing signature"))?
                .as_bytes(),
        )
        .context("decode signature")?;
    let headers = fields
        .get("headers")
        .copied()
        .unwrap_or("date")
        .split_whitespace()
        .map(|s| s.to_ascii_lowercase())
        .collect();

    Ok(SignatureParams {
        key_id,
        headers,
        signature,
    })
}

/// Canonical signing string: one `name: value` line per signed header, in
/// the order given, `(request-target)` substituted from the live request.
pub fn build_signing_string(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    signed_headers: &[String],
) -> Result<String> {
    let mut lines = Vec::with_capacity(signed_headers.len());
    for name in signed_headers {
        if name == "(request-target)" {
            let query = uri.query().map(|q| format!("?{q}")).unwrap_or_default();
            lines.push(format!(
                "(request-target): {} {}{query}",
                method.as_str().to_ascii_lowercase(),
                uri.path()
            ));
            continue;
        }
        let header_name = http::header::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("bad signed header name: {name}"))?;
        let value = headers
            .get(&header_name)
            .ok_or_else(|| anyhow!("missing signed header: {name}"))?
            .to_str()
            .with_context(|| format!("invalid header value for {name}"))?;
        lines.push(format!("{name}: {}", value.trim()));
    }
    Ok(lines.join("\n"))
}

/// Check the body against the `Digest` header. A present header must match;
/// a non-empty body must carry one.
pub fn verify_digest(headers: &HeaderMap, body: &[u8]) -> Result<()> {
    let Some(digest) = headers.get("Digest") else {
        if body.is_empty() {
            return Ok(());
        }
        return Err(anyhow!("missing Digest header"));
    };
    let digest = digest.to_str().context("Digest header not utf8")?;
    let Some((alg, value)) = digest.split_once('=') else {
        return Err(anyhow!("invalid Digest header"));
    };
    if !alg.trim().eq_ignore_ascii_case("SHA-256") {
        return Err(anyhow!("unsupported digest alg: {alg}"));
    }
    let expected = B64.decode(value.trim().as_bytes()).context("decode digest")?;
    if expected.as_slice() != Sha256::digest(body).as_slice() {
        return Err(anyhow!("digest mismatch"));
    }
    Ok(())
}

pub fn verify_date(headers: &HeaderMap, max_skew: Duration) -> Result<()> {
    let date = headers
        .get("Date")
        .ok_or_else(|| anyhow!("missing Date header"))?
        .to_str()
        .context("Date header not utf8")?;
    let ts = parse_http_date(date).context("parse Date header")?;
    let now = std::time::SystemTime::now();
    let skew = now
        .duration_since(ts)
        .or_else(|_| ts.duration_since(now))
        .unwrap_or_default();
    if skew > max_skew {
        return Err(anyhow!("Date skew too large: {}s", skew.as_secs()));
    }
    Ok(())
}

pub fn verify_signature_rsa_sha256(
    public_key_pem: &str,
    signing_string: &str,
    signature: &[u8],
) -> Result<()> {
    let public_key =
        RsaPublicKey::from_public_key_pem(public_key_pem).context("parse public key pem")?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let sig =
        rsa::pkcs1v15::Signature::try_from(signature).context("invalid rsa signature bytes")?;
    verifying_key
        .verify(signing_string.as_bytes(), &sig)
        .context("signature verify failed")?;
    Ok(())
}

/// Sign an outgoing request in place: fills `Date`, `Digest` and `Host` as
/// needed, then adds the `Signature` header covering `signed_headers`.
pub fn sign_request_rsa_sha256(
    private_key_pem: &str,
    key_id: &str,
    method: &Method,
    uri: &Uri,
    headers: &mut HeaderMap,
    body: &[u8],
    signed_headers: &[&str],
) -> Result<()> {
    if !headers.contains_key("Date") {
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());
        headers.insert("Date", date.parse().context("set Date")?);
    }

    let signed_lower: Vec<String> = signed_headers.iter().map(|s| s.to_ascii_lowercase()).collect();
    let want_digest =
        !body.is_empty() || signed_lower.iter().any(|h| h == "digest") || headers.contains_key("Digest");
    if want_digest && !headers.contains_key("Digest") {
        let digest_b64 = B64.encode(Sha256::digest(body));
        headers.insert(
            "Digest",
            format!("SHA-256={digest_b64}").parse().context("set Digest")?,
        );
    }
    if !headers.contains_key("Host") {
        if let Some(auth) = uri.authority() {
            headers.insert("Host", auth.as_str().parse().context("set Host")?);
        }
    }

    let signing_string = build_signing_string(method, uri, headers, &signed_lower)?;

    let private_key =
        RsaPrivateKey::from_pkcs8_pem(private_key_pem).context("parse private key pem")?;
    let signing_key = SigningKey::<Sha256>::new(private_key);
    let mut rng = rand::rngs::OsRng;
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
    let sig_b64 = B64.encode(signature.to_bytes());

    let headers_list = signed_lower.join(" ");
    headers.insert(
        "Signature",
        format!(
            "keyId=\"{key_id}\",algorithm=\"rsa-sha256\",headers=\"{headers_list}\",signature=\"{sig_b64}\""
        )
        .parse()
        .context("set Signature")?,
    );
    Ok(())
}

/// Verify an inbound request end to end. This is a security boundary:
/// every parse, resolution or crypto failure verifies false and is never
/// retried. The signer's key is resolved through the directory without
/// persisting (a verification-only lookup need not be durable).
pub async fn verify_request(
    directory: &ActorDirectory,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
    max_skew: Duration,
) -> bool {
    match verify_request_inner(directory, method, uri, headers, body, max_skew).await {
        Ok(()) => true,
        Err(e) => {
            debug!("signature verification failed: {e:#}");
            false
        }
    }
}

async fn verify_request_inner(
    directory: &ActorDirectory,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
    max_skew: Duration,
) -> Result<()> {
    verify_digest(headers, body)?;
    verify_date(headers, max_skew)?;

    let sig_header = headers
        .get("Signature")
        .or_else(|| headers.get("signature"))
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| anyhow!("missing Signature header"))?;
    let sig = parse_signature_header(sig_header)?;

    let actor_id = actor_id_from_key_id(&sig.key_id);
    let actor = directory
        .resolve(actor_id, false)
        .await
        .ok_or_else(|| anyhow!("unresolvable signer: {actor_id}"))?;
    let pem = actor
        .public_key_pem
        .ok_or_else(|| anyhow!("signer has no public key: {actor_id}"))?;

    let signing_string = build_signing_string(method, uri, headers, &sig.headers)?;
    verify_signature_rsa_sha256(&pem, &signing_string, &sig.signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{generate_identity, main_key_id};
    use crate::store::{Actor, Store};

    fn signed_post(
        identity: &crate::keys::Identity,
        key_id: &str,
        uri: &Uri,
        body: &[u8],
    ) -> HeaderMap {
        let mut headers = HeaderMap::new();
        sign_request_rsa_sha256(
            &identity.private_key_pem,
            key_id,
            &Method::POST,
            uri,
            &mut headers,
            body,
            &["(request-target)", "host", "date", "digest"],
        )
        .unwrap();
        headers
    }

    #[test]
    fn signature_header_parses_and_rejects_garbage() {
        let params = parse_signature_header(
            r#"keyId="https://a.example/users/a#main-key",algorithm="rsa-sha256",headers="(request-target) host date digest",signature="aGk=""#,
        )
        .unwrap();
        assert_eq!(params.key_id, "https://a.example/users/a#main-key");
        assert_eq!(
            params.headers,
            vec!["(request-target)", "host", "date", "digest"]
        );
        assert_eq!(params.signature, b"hi");

        assert!(parse_signature_header("algorithm=\"rsa-sha256\"").is_err());
    }

    #[tokio::test]
    async fn sign_verify_round_trip_and_tamper_detection() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store.db")).unwrap();
        let identity = generate_identity().unwrap();

        let actor_id = "https://remote.example/users/bob";
        store
            .upsert_actor(&Actor {
                actor_id: actor_id.to_string(),
                public_key_pem: Some(identity.public_key_pem.clone()),
                ..Default::default()
            })
            .unwrap();
        let directory = ActorDirectory::new(store, reqwest::Client::new());

        let uri: Uri = "https://local.example/inbox".parse().unwrap();
        let body = br#"{"type":"Follow"}"#;
        let skew = Duration::from_secs(300);

        let headers = signed_post(&identity, &main_key_id(actor_id), &uri, body);
        assert!(verify_request(&directory, &Method::POST, &uri, &headers, body, skew).await);

        // Any signed header mutated after signing must fail closed.
        let mut tampered = headers.clone();
        tampered.insert("Date", "Mon, 01 Jan 2024 00:00:00 GMT".parse().unwrap());
        assert!(!verify_request(&directory, &Method::POST, &uri, &tampered, body, skew).await);

        // Body swap breaks the digest.
        assert!(
            !verify_request(&directory, &Method::POST, &uri, &headers, b"{\"type\":\"Like\"}", skew)
                .await
        );

        // Absent Signature header fails closed.
        let mut missing = headers.clone();
        missing.remove("Signature");
        assert!(!verify_request(&directory, &Method::POST, &uri, &missing, body, skew).await);
    }

    #[test]
    fn signing_string_is_order_sensitive() {
        let uri: Uri = "https://h.example/inbox?page=2".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("Host", "h.example".parse().unwrap());
        headers.insert("Date", "Sun, 01 Jun 2025 00:00:00 GMT".parse().unwrap());

        let a = build_signing_string(
            &Method::POST,
            &uri,
            &headers,
            &["(request-target)".into(), "host".into(), "date".into()],
        )
        .unwrap();
        assert!(a.starts_with("(request-target): post /inbox?page=2\n"));

        let b = build_signing_string(
            &Method::POST,
            &uri,
            &headers,
            &["date".into(), "host".into(), "(request-target)".into()],
        )
        .unwrap();
        assert_ne!(a, b);

        assert!(build_signing_string(&Method::POST, &uri, &headers, &["digest".into()]).is_err());
    }
}
