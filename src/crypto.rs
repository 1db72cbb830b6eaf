//! Organization secret encryption-at-rest, and webhook HMAC verification.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use ed25519_dalek::{Signature, Verifier as _, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::RngCore as _;
use sha2::Sha256;

const NONCE_LEN: usize = 12;

/// Process-level master key, wrapping per-organization agent shared secrets
/// at rest. Held once at the composition root.
#[derive(Clone)]
pub struct MasterKey {
    cipher: Aes256Gcm,
}

impl MasterKey {
    pub fn from_bytes(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> crate::error::Result<(Vec<u8>, Vec<u8>)> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.try_fill_bytes(&mut nonce_bytes).map_err(|e| {
            crate::error::Error::Other(anyhow::anyhow!("failed to generate nonce: {e}"))
        })?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| crate::error::Error::Other(anyhow::anyhow!("encryption failed: {e}")))?;

        Ok((ciphertext, nonce_bytes.to_vec()))
    }

    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> crate::error::Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| crate::error::Error::Other(anyhow::anyhow!("decryption failed: {e}")))
    }
}

/// Constant-time comparison of an agent-presented secret against the
/// organization's decrypted shared secret.
pub fn secrets_match(presented: &str, actual: &[u8]) -> bool {
    constant_time_eq(presented.as_bytes(), actual)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

type HmacSha256 = Hmac<Sha256>;

/// Verify a webhook HMAC-SHA256 signature (Slack-style `v0=<hex>` scheme).
/// Discord's Ed25519 scheme is verified separately by the Discord adapter.
pub fn verify_hmac_signature(secret: &[u8], body: &[u8], signature_hex: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);

    let Ok(expected) = hex::decode(signature_hex) else {
        return false;
    };

    mac.verify_slice(&expected).is_ok()
}

/// Verify a Discord webhook Ed25519 signature over `timestamp || body`.
/// `public_key_hex`/`signature_hex` are the hex encodings Discord sends in
/// the `X-Signature-Ed25519` header and the app's public key respectively.
pub fn verify_ed25519_signature(
    public_key_hex: &str,
    timestamp: &str,
    body: &[u8],
    signature_hex: &str,
) -> bool {
    let Ok(key_bytes) = hex::decode(public_key_hex) else {
        return false;
    };
    let Ok(key_bytes): Result<[u8; 32], _> = key_bytes.try_into() else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };

    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(sig_bytes): Result<[u8; 64], _> = sig_bytes.try_into() else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_bytes);

    let mut message = Vec::with_capacity(timestamp.len() + body.len());
    message.extend_from_slice(timestamp.as_bytes());
    message.extend_from_slice(body);

    verifying_key.verify(&message, &signature).is_ok()
}
