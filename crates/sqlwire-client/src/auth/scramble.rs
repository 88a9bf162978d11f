//! Credential scrambles used by the built-in plugins.
//!
//! # Native hash
//!
//! ```text
//! SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))
//! ```
//!
//! # Cached-RSA fast path
//!
//! ```text
//! XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + seed))
//! ```
//!
//! # RSA full path
//!
//! The NUL-terminated password is XORed with the seed (cycled) and encrypted
//! with RSA-OAEP (SHA-1) under the server's public key.

use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use sqlwire_core::{AuthError, AuthErrorKind, Error, Result};

/// Seed length the hash scrambles operate on.
pub const SEED_LEN: usize = 20;

/// Drop the trailing NUL servers append to the 20 byte seed.
pub fn trim_seed(seed: &[u8]) -> &[u8] {
    match seed.split_last() {
        Some((&0, rest)) if seed.len() == SEED_LEN + 1 => rest,
        _ => seed,
    }
}

/// Native hash response. Empty password gives an empty response.
pub fn native_password(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let seed = &seed[..seed.len().min(SEED_LEN)];

    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();

    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// Cached-RSA fast-path response. Empty password gives an empty response.
pub fn caching_sha2_password(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let seed = trim_seed(seed);

    let password_hash: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    let password_hash_hash: [u8; 32] = Sha256::digest(password_hash).into();

    let mut hasher = Sha256::new();
    hasher.update(password_hash_hash);
    hasher.update(seed);
    let scramble: [u8; 32] = hasher.finalize().into();

    password_hash
        .iter()
        .zip(scramble.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// XOR the NUL-terminated password with the seed, cycling the seed.
pub fn xor_with_seed(password: &str, seed: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(password.len() + 1);
    bytes.extend_from_slice(password.as_bytes());
    bytes.push(0);
    if seed.is_empty() {
        return bytes;
    }
    for (i, b) in bytes.iter_mut().enumerate() {
        *b ^= seed[i % seed.len()];
    }
    bytes
}

/// Parse a PEM public key, SubjectPublicKeyInfo first, then PKCS#1.
pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| crypto_error(format!("failed to parse RSA public key PEM: {e}")))
}

/// Encrypt the password for an RSA exchange.
pub fn rsa_encrypt_password(password: &str, seed: &[u8], public_key_pem: &str) -> Result<Vec<u8>> {
    let seed = trim_seed(seed);
    if seed.is_empty() {
        return Err(crypto_error("authentication seed is empty"));
    }
    let key = parse_public_key(public_key_pem)?;
    let masked = xor_with_seed(password, seed);
    key.encrypt(&mut OsRng, Oaep::new::<Sha1>(), &masked)
        .map_err(|e| crypto_error(format!("RSA OAEP encryption failed: {e}")))
}

fn crypto_error(message: impl Into<String>) -> Error {
    Error::Auth(AuthError::new(AuthErrorKind::Crypto, message))
}
