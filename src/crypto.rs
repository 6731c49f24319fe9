//! Sealed destination addresses: X25519 key agreement + AES-256-GCM.
//!
//! In keyed mode the client does not send the shared token at all. Instead
//! the request body carries the destination `host:port` sealed against the
//! server's long-term public key; being able to decrypt it is the
//! authentication.
//!
//! # Wire Format
//!
//! ```text
//! [ 32 bytes  client ephemeral X25519 public key ]
//! [ ..        AES-256-GCM ciphertext             ]
//! [ 12 bytes  GCM nonce (trailing)               ]
//! ```
//!
//! The AEAD key is the raw X25519 shared secret between the client's
//! ephemeral key and the server's long-term key. Keys travel as URL-safe
//! unpadded base64.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64, Engine};
use rand::RngCore;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

/// Nonce size for AES-GCM (96 bits = 12 bytes).
const NONCE_SIZE: usize = 12;

/// X25519 key size.
const KEY_SIZE: usize = 32;

/// A long-term server keypair for keyed mode.
pub struct Keypair {
    secret: StaticSecret,
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the private scalar.
        f.debug_struct("Keypair")
            .field("public", &self.public_str())
            .finish_non_exhaustive()
    }
}

impl Keypair {
    /// Generate a fresh keypair.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random(),
        }
    }

    /// Load the private key from its base64 string form.
    ///
    /// # Errors
    ///
    /// Returns an error when the string is not 32 bytes of URL-safe base64.
    pub fn from_private_str(s: &str) -> Result<Self> {
        let bytes = decode_key(s)?;
        Ok(Self {
            secret: StaticSecret::from(bytes),
        })
    }

    /// The private key as URL-safe unpadded base64.
    #[must_use]
    pub fn private_str(&self) -> String {
        BASE64.encode(self.secret.to_bytes())
    }

    /// The public key as URL-safe unpadded base64.
    #[must_use]
    pub fn public_str(&self) -> String {
        BASE64.encode(PublicKey::from(&self.secret).as_bytes())
    }
}

fn decode_key(s: &str) -> Result<[u8; KEY_SIZE]> {
    let bytes = BASE64.decode(s).context("invalid key encoding")?;
    let bytes: [u8; KEY_SIZE] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("key must be {KEY_SIZE} bytes"))?;
    Ok(bytes)
}

/// Seal a destination address against the server's public key.
///
/// # Errors
///
/// Returns an error when the public key string is malformed or encryption
/// fails.
pub fn seal_destination(server_public: &str, addr: &str) -> Result<Vec<u8>> {
    let server_public = PublicKey::from(decode_key(server_public)?);

    let ephemeral = EphemeralSecret::random();
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&server_public);

    let cipher = Aes256Gcm::new_from_slice(shared.as_bytes())
        .map_err(|e| anyhow::anyhow!("key setup failed: {e}"))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, addr.as_bytes())
        .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

    let mut sealed = Vec::with_capacity(KEY_SIZE + ciphertext.len() + NONCE_SIZE);
    sealed.extend_from_slice(ephemeral_public.as_bytes());
    sealed.extend_from_slice(&ciphertext);
    sealed.extend_from_slice(&nonce_bytes);
    Ok(sealed)
}

/// Open a sealed destination with the server's private key, recovering the
/// plaintext `host:port`.
///
/// # Errors
///
/// Returns an error on truncated input, on a failed AEAD tag check (wrong
/// key or tampering), or when the plaintext is not valid ASCII.
pub fn open_destination(keypair: &Keypair, sealed: &[u8]) -> Result<String> {
    anyhow::ensure!(
        sealed.len() > KEY_SIZE + NONCE_SIZE,
        "sealed destination too short"
    );

    let (public, rest) = sealed.split_at(KEY_SIZE);
    let (ciphertext, nonce_bytes) = rest.split_at(rest.len() - NONCE_SIZE);

    let client_public: [u8; KEY_SIZE] = public.try_into().expect("split_at keeps the size");
    let shared = keypair.secret.diffie_hellman(&PublicKey::from(client_public));

    let cipher = Aes256Gcm::new_from_slice(shared.as_bytes())
        .map_err(|e| anyhow::anyhow!("key setup failed: {e}"))?;

    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| anyhow::anyhow!("failed to decrypt destination"))?;

    let addr = String::from_utf8(plaintext).context("destination is not valid text")?;
    anyhow::ensure!(addr.is_ascii(), "destination is not valid text");
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let keypair = Keypair::generate();
        let sealed = seal_destination(&keypair.public_str(), "localhost:22").unwrap();
        let addr = open_destination(&keypair, &sealed).unwrap();
        assert_eq!(addr, "localhost:22");
    }

    #[test]
    fn test_wrong_key_fails() {
        let keypair = Keypair::generate();
        let other = Keypair::generate();
        let sealed = seal_destination(&keypair.public_str(), "localhost:22").unwrap();
        assert!(open_destination(&other, &sealed).is_err());
    }

    #[test]
    fn test_truncated_input_fails() {
        let keypair = Keypair::generate();
        let sealed = seal_destination(&keypair.public_str(), "localhost:22").unwrap();
        assert!(open_destination(&keypair, &sealed[..KEY_SIZE + NONCE_SIZE]).is_err());
        assert!(open_destination(&keypair, &[]).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let keypair = Keypair::generate();
        let mut sealed = seal_destination(&keypair.public_str(), "localhost:22").unwrap();
        let mid = sealed.len() / 2;
        sealed[mid] ^= 0xFF;
        assert!(open_destination(&keypair, &sealed).is_err());
    }

    #[test]
    fn test_key_string_roundtrip() {
        let keypair = Keypair::generate();
        let reloaded = Keypair::from_private_str(&keypair.private_str()).unwrap();
        assert_eq!(keypair.public_str(), reloaded.public_str());

        // The reloaded private key must decrypt what the original public
        // key sealed.
        let sealed = seal_destination(&keypair.public_str(), "10.0.0.1:8080").unwrap();
        assert_eq!(open_destination(&reloaded, &sealed).unwrap(), "10.0.0.1:8080");
    }

    #[test]
    fn test_malformed_key_strings_rejected() {
        assert!(Keypair::from_private_str("not base64 !!!").is_err());
        assert!(Keypair::from_private_str("c2hvcnQ").is_err());
    }
}
