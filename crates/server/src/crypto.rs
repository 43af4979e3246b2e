//! Credential encryption and signed-path utilities.
//!
//! AES-256-GCM with PBKDF2-HMAC-SHA256 key derivation: two peers holding the
//! same shared secret and context salt derive identical keys without any
//! further exchange. Payload layout: 12-byte nonce || ciphertext || 16-byte
//! tag, base64-encoded.

use std::num::NonZeroU32;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{constant_time, hmac, pbkdf2};

use crate::error::AppError;

pub const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;
const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_NAMESPACE: &str = "loft";

/// Derive a 256-bit key from a shared secret and a context salt.
/// Deterministic: both sides derive the same key independently.
pub fn derive_key(shared_secret: &str, context_salt: &str) -> [u8; KEY_LEN] {
    let salt = format!("{SALT_NAMESPACE}:{context_salt}");
    let mut key = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        NonZeroU32::new(PBKDF2_ITERATIONS).expect("iterations are non-zero"),
        salt.as_bytes(),
        shared_secret.as_bytes(),
        &mut key,
    );
    key
}

/// Encrypt plaintext with AES-256-GCM. A fresh random nonce is generated on
/// every call; reusing one would break GCM, so there is no way to supply it.
pub fn encrypt(plaintext: &str, key: &[u8; KEY_LEN]) -> Result<String, AppError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| AppError::Internal("rng failure".into()))?;

    let unbound = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| AppError::Internal("invalid AES key".into()))?;
    let sealing = LessSafeKey::new(unbound);

    let mut in_out = plaintext.as_bytes().to_vec();
    sealing
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| AppError::Internal("encryption failed".into()))?;

    let mut payload = Vec::with_capacity(NONCE_LEN + in_out.len());
    payload.extend_from_slice(&nonce_bytes);
    payload.extend_from_slice(&in_out);
    Ok(BASE64.encode(payload))
}

/// Decrypt a base64 payload produced by [`encrypt`]. Fails with
/// [`AppError::Decryption`] on tampering, a wrong key, or a truncated
/// payload; never returns corrupted plaintext.
pub fn decrypt(payload: &str, key: &[u8; KEY_LEN]) -> Result<String, AppError> {
    let raw = BASE64.decode(payload).map_err(|_| AppError::Decryption)?;
    if raw.len() < NONCE_LEN + TAG_LEN {
        return Err(AppError::Decryption);
    }

    let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| AppError::Decryption)?;

    let unbound = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| AppError::Internal("invalid AES key".into()))?;
    let opening = LessSafeKey::new(unbound);

    let mut in_out = ciphertext.to_vec();
    let plaintext = opening
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| AppError::Decryption)?;

    String::from_utf8(plaintext.to_vec()).map_err(|_| AppError::Decryption)
}

/// HMAC-SHA256 signature over `"<path>:<expiry>"`, hex-encoded. Used for
/// time-limited, header-less file URLs.
pub fn sign_path(path: &str, expiry_unix: i64, secret: &str) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let tag = hmac::sign(&key, format!("{path}:{expiry_unix}").as_bytes());
    hex::encode(tag.as_ref())
}

/// Verify a signed path: constant-time signature comparison, then expiry.
pub fn verify_path(path: &str, expiry_unix: i64, signature: &str, secret: &str, now_unix: i64) -> bool {
    let expected = sign_path(path, expiry_unix, secret);
    let Ok(provided) = hex::decode(signature) else {
        return false;
    };
    let Ok(expected) = hex::decode(expected) else {
        return false;
    };
    if constant_time::verify_slices_are_equal(&expected, &provided).is_err() {
        return false;
    }
    now_unix <= expiry_unix
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_is_deterministic() {
        let a = derive_key("secret", "workspace-1");
        let b = derive_key("secret", "workspace-1");
        assert_eq!(a, b);

        let c = derive_key("secret", "workspace-2");
        assert_ne!(a, c);

        let d = derive_key("other-secret", "workspace-1");
        assert_ne!(a, d);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = derive_key("secret", "ctx");
        let payload = encrypt("ghp_supersecrettoken", &key).unwrap();
        assert_ne!(payload, "ghp_supersecrettoken");
        assert_eq!(decrypt(&payload, &key).unwrap(), "ghp_supersecrettoken");
    }

    #[test]
    fn test_encrypt_uses_fresh_nonce_per_call() {
        let key = derive_key("secret", "ctx");
        let a = encrypt("same plaintext", &key).unwrap();
        let b = encrypt("same plaintext", &key).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let key = derive_key("secret", "ctx");
        let other = derive_key("secret", "other");
        let payload = encrypt("token", &key).unwrap();
        assert!(matches!(decrypt(&payload, &other), Err(AppError::Decryption)));
    }

    #[test]
    fn test_decrypt_tampered_payload_fails() {
        let key = derive_key("secret", "ctx");
        let payload = encrypt("token", &key).unwrap();
        let mut raw = BASE64.decode(&payload).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = BASE64.encode(raw);
        assert!(matches!(decrypt(&tampered, &key), Err(AppError::Decryption)));
    }

    #[test]
    fn test_decrypt_short_payload_fails() {
        let key = derive_key("secret", "ctx");
        let short = BASE64.encode([0u8; NONCE_LEN + TAG_LEN - 1]);
        assert!(matches!(decrypt(&short, &key), Err(AppError::Decryption)));
        assert!(matches!(decrypt("not base64!!!", &key), Err(AppError::Decryption)));
    }

    #[test]
    fn test_signed_path_verification() {
        let sig = sign_path("/files/icons/a.png", 1_700_000_000, "secret");
        assert!(verify_path("/files/icons/a.png", 1_700_000_000, &sig, "secret", 1_699_999_999));
        // Expired
        assert!(!verify_path("/files/icons/a.png", 1_700_000_000, &sig, "secret", 1_700_000_001));
        // Wrong path
        assert!(!verify_path("/files/icons/b.png", 1_700_000_000, &sig, "secret", 1_699_999_999));
        // Wrong secret
        assert!(!verify_path("/files/icons/a.png", 1_700_000_000, &sig, "other", 1_699_999_999));
        // Garbage signature
        assert!(!verify_path("/files/icons/a.png", 1_700_000_000, "zz", "secret", 1_699_999_999));
    }
}
