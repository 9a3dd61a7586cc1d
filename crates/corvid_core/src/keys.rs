/*
 * SPDX-FileCopyrightText: 2026 Corvid Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rsa::{
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    RsaPrivateKey, RsaPublicKey,
};
use std::{fs, path::Path};

#[derive(Clone)]
pub struct Identity {
    pub private_key_pem: String,
    pub public_key_pem: String,
}

/// Signing-key id for an actor. One key per actor, fixed fragment.
pub fn main_key_id(actor_id: &str) -> String {
    format!("{actor_id}#main-key")
}

/// Actor id referenced by a signature keyId (fragment stripped).
pub fn actor_id_from_key_id(key_id: &str) -> &str {
    key_id.split_once('#').map(|(a, _)| a).unwrap_or(key_id)
}

/// Load the node identity from the data dir, generating a 2048-bit RSA
/// keypair on first run. Keys are never rotated implicitly.
pub fn load_or_generate_identity(dir: impl AsRef<Path>) -> Result<Identity> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).with_context(|| format!("create data dir: {}", dir.display()))?;

    let priv_path = dir.join("identity_private_key.pem");
    let priv_pem = if priv_path.exists() {
        fs::read_to_string(&priv_path).with_context(|| format!("read {}", priv_path.display()))?
    } else {
        let mut rng = OsRng;
        let priv_key = RsaPrivateKey::new(&mut rng, 2048)?;
        let priv_pem = priv_key.to_pkcs8_pem(LineEnding::LF)?.to_string();
        fs::write(&priv_path, &priv_pem)
            .with_context(|| format!("write {}", priv_path.display()))?;
        priv_pem
    };

    let private_key = RsaPrivateKey::from_pkcs8_pem(&priv_pem).context("parse private key pem")?;
    let public_key_pem = RsaPublicKey::from(&private_key)
        .to_public_key_pem(LineEnding::LF)?
        .to_string();

    Ok(Identity {
        private_key_pem: priv_pem,
        public_key_pem,
    })
}

/// Generate a throwaway keypair. Used by tests and provisioning tooling.
pub fn generate_identity() -> Result<Identity> {
    let mut rng = OsRng;
    let priv_key = RsaPrivateKey::new(&mut rng, 2048)?;
    let private_key_pem = priv_key.to_pkcs8_pem(LineEnding::LF)?.to_string();
    let public_key_pem = RsaPublicKey::from(&priv_key)
        .to_public_key_pem(LineEnding::LF)?
        .to_string();
    Ok(Identity {
        private_key_pem,
        public_key_pem,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_id_round_trip() {
        let id = "https://social.example/users/amy";
        assert_eq!(main_key_id(id), "https://social.example/users/amy#main-key");
        assert_eq!(actor_id_from_key_id(&main_key_id(id)), id);
        assert_eq!(actor_id_from_key_id(id), id);
    }

    #[test]
    fn identity_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let a = load_or_generate_identity(dir.path()).unwrap();
        let b = load_or_generate_identity(dir.path()).unwrap();
        assert_eq!(a.private_key_pem, b.private_key_pem);
        assert_eq!(a.public_key_pem, b.public_key_pem);
        assert!(a.public_key_pem.contains("BEGIN PUBLIC KEY"));
    }
}
