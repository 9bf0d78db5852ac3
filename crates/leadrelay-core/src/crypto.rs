//! Field-level encryption of lead personal data at rest.
//!
//! When a secret is configured, the PostgreSQL repositories seal the
//! `user_data` object of every stored payload and the raw body of poison
//! dead letters. Sealed values are strings of the form
//! `enc:v1:<nonce>:<ciphertext>` (URL-safe base64, no padding), encrypted
//! with ChaCha20-Poly1305 under a key derived from the secret with SHA-256.
//!
//! Values that are not sealed are read back unchanged, so rows written
//! before a key was configured stay readable.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, KeyInit, Nonce};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{
    error::{CoreError, Result},
    payload::LeadPayload,
};

const ENVELOPE_PREFIX: &str = "enc:v1:";
const NONCE_LEN: usize = 12;
const SEALED_FIELD: &str = "user_data";

/// Symmetric cipher for personal data columns.
#[derive(Clone)]
pub struct PayloadCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCipher").finish_non_exhaustive()
    }
}

impl PayloadCipher {
    /// Derives the cipher key from an operator-supplied secret.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if the secret is blank.
    pub fn from_secret(secret: &str) -> Result<Self> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(CoreError::InvalidInput("encryption secret must not be empty".into()));
        }
        Ok(Self { key: Sha256::digest(secret.as_bytes()).into() })
    }

    /// Whether `value` carries a sealed envelope.
    pub fn is_sealed(value: &str) -> bool {
        value.starts_with(ENVELOPE_PREFIX)
    }

    fn aead(&self) -> Result<ChaCha20Poly1305> {
        ChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|e| CoreError::Encryption(format!("cipher init failed: {e}")))
    }

    /// Encrypts `plaintext` under a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .aead()?
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| CoreError::Encryption(format!("encrypt failed: {e}")))?;

        Ok(format!(
            "{ENVELOPE_PREFIX}{}:{}",
            URL_SAFE_NO_PAD.encode(nonce_bytes),
            URL_SAFE_NO_PAD.encode(ciphertext)
        ))
    }

    /// Decrypts an envelope produced by [`PayloadCipher::seal`].
    ///
    /// # Errors
    ///
    /// `Encryption` for malformed envelopes, a wrong key or tampered data.
    pub fn open(&self, sealed: &str) -> Result<Vec<u8>> {
        let body = sealed
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or_else(|| CoreError::Encryption("value is not sealed".into()))?;
        let (nonce_b64, ciphertext_b64) = body
            .split_once(':')
            .ok_or_else(|| CoreError::Encryption("sealed value is malformed".into()))?;

        let nonce = URL_SAFE_NO_PAD
            .decode(nonce_b64)
            .map_err(|e| CoreError::Encryption(format!("bad nonce encoding: {e}")))?;
        if nonce.len() != NONCE_LEN {
            return Err(CoreError::Encryption("nonce length is invalid".into()));
        }
        let ciphertext = URL_SAFE_NO_PAD
            .decode(ciphertext_b64)
            .map_err(|e| CoreError::Encryption(format!("bad ciphertext encoding: {e}")))?;

        self.aead()?.decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice()).map_err(|_| {
            CoreError::Encryption("decryption failed; wrong key or tampered data".into())
        })
    }
}

/// Serializes `payload` for storage, sealing its personal data.
pub(crate) fn seal_payload(
    cipher: Option<&PayloadCipher>,
    payload: &LeadPayload,
) -> Result<Value> {
    let mut value = serde_json::to_value(payload)?;
    let Some(cipher) = cipher else {
        return Ok(value);
    };
    if let Some(field) = value.get_mut(SEALED_FIELD) {
        let plaintext = serde_json::to_vec(field)?;
        *field = Value::String(cipher.seal(&plaintext)?);
    }
    Ok(value)
}

/// Reverses [`seal_payload`] on a stored payload.
pub(crate) fn open_payload(cipher: Option<&PayloadCipher>, mut stored: Value) -> Result<Value> {
    let Some(field) = stored.get_mut(SEALED_FIELD) else {
        return Ok(stored);
    };
    let Some(sealed) = field.as_str().filter(|s| PayloadCipher::is_sealed(s)) else {
        return Ok(stored);
    };
    let cipher = cipher.ok_or_else(|| {
        CoreError::Encryption("payload is encrypted but no key is configured".into())
    })?;
    let opened = cipher.open(sealed)?;
    *field = serde_json::from_slice(&opened)?;
    Ok(stored)
}

/// Seals free text such as a raw queue entry.
pub(crate) fn seal_text(
    cipher: Option<&PayloadCipher>,
    text: Option<&str>,
) -> Result<Option<String>> {
    match (cipher, text) {
        (Some(cipher), Some(text)) => cipher.seal(text.as_bytes()).map(Some),
        (_, text) => Ok(text.map(str::to_string)),
    }
}

/// Reverses [`seal_text`].
pub(crate) fn open_text(
    cipher: Option<&PayloadCipher>,
    stored: Option<String>,
) -> Result<Option<String>> {
    let Some(stored) = stored else {
        return Ok(None);
    };
    if !PayloadCipher::is_sealed(&stored) {
        return Ok(Some(stored));
    }
    let cipher = cipher.ok_or_else(|| {
        CoreError::Encryption("entry is encrypted but no key is configured".into())
    })?;
    let bytes = cipher.open(&stored)?;
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> LeadPayload {
        serde_json::from_value(serde_json::json!({
            "schema_version": 1,
            "event_name": "Lead",
            "telegram_id": "77",
            "user_data": { "email": "ana@example.com", "phone": "+55 11 99999-0000" }
        }))
        .unwrap()
    }

    #[test]
    fn sealed_payload_hides_personal_data_and_reads_back() {
        let cipher = PayloadCipher::from_secret("correct horse").unwrap();
        let original = payload();

        let stored = seal_payload(Some(&cipher), &original).unwrap();

        let text = stored.to_string();
        assert!(!text.contains("ana@example.com"));
        assert!(!text.contains("99999"));
        assert_eq!(stored["telegram_id"], "77");
        assert!(PayloadCipher::is_sealed(stored["user_data"].as_str().unwrap()));

        let opened = open_payload(Some(&cipher), stored).unwrap();
        let restored: LeadPayload = serde_json::from_value(opened).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn each_seal_uses_a_fresh_nonce() {
        let cipher = PayloadCipher::from_secret("k").unwrap();
        let a = cipher.seal(b"same").unwrap();
        let b = cipher.seal(b"same").unwrap();
        assert_ne!(a, b);
        assert_eq!(cipher.open(&a).unwrap(), b"same");
    }

    #[test]
    fn wrong_key_or_missing_key_is_an_error() {
        let stored = seal_payload(Some(&PayloadCipher::from_secret("one").unwrap()), &payload())
            .unwrap();

        let other = PayloadCipher::from_secret("two").unwrap();
        let err = open_payload(Some(&other), stored.clone()).unwrap_err();
        assert!(matches!(err, CoreError::Encryption(_)));
        assert!(matches!(open_payload(None, stored).unwrap_err(), CoreError::Encryption(_)));
    }

    #[test]
    fn plaintext_rows_stay_readable() {
        let plain = seal_payload(None, &payload()).unwrap();
        let cipher = PayloadCipher::from_secret("k").unwrap();

        assert_eq!(open_payload(Some(&cipher), plain.clone()).unwrap(), plain);
        assert_eq!(
            open_text(Some(&cipher), Some("{not json".into())).unwrap().as_deref(),
            Some("{not json")
        );
    }

    #[test]
    fn raw_entries_round_trip() {
        let cipher = PayloadCipher::from_secret("k").unwrap();
        let sealed = seal_text(Some(&cipher), Some("{\"email\":\"x@y.z\"")).unwrap().unwrap();
        assert!(!sealed.contains("x@y.z"));
        let opened = open_text(Some(&cipher), Some(sealed)).unwrap();
        assert_eq!(opened.as_deref(), Some("{\"email\":\"x@y.z\""));
    }

    #[test]
    fn blank_secret_is_rejected() {
        assert!(matches!(PayloadCipher::from_secret("  "), Err(CoreError::InvalidInput(_))));
    }
}
