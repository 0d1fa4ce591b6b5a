//! Secret payload encryption.
//!
//! Two kinds of key material are accepted:
//!
//! * [`KeyMaterial::Random`]: 16 server-generated bytes used directly as an
//!   AES-128-GCM key. Blob layout: `nonce (12) || ciphertext + tag`.
//! * [`KeyMaterial::Password`]: arbitrary bytes stretched with Argon2id
//!   (t=1, m=64 MiB, p=4) over a fresh 32-byte salt into a ChaCha20-Poly1305
//!   key. Blob layout: `nonce (12) || ciphertext + tag || salt (32)`.
//!
//! The salt always sits at a fixed offset from the end of the blob.

use std::fmt;
use std::str::FromStr;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes128Gcm,
};
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::ChaCha20Poly1305;
use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{Error, Result};

/// Length of server-generated key material carried in capability URLs.
pub const KEY_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const SALT_LEN: usize = 32;

const DERIVED_KEY_LEN: usize = 32;
const ARGON2_M_COST: u32 = 64 * 1024; // KiB
const ARGON2_T_COST: u32 = 1;
const ARGON2_P_COST: u32 = 4;

/// Key material a secret is sealed with. Never persisted server-side.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub enum KeyMaterial {
    Random([u8; KEY_LEN]),
    Password(Vec<u8>),
}

impl KeyMaterial {
    /// Fresh random key material from the OS RNG.
    pub fn generate() -> Result<Self> {
        Ok(KeyMaterial::Random(random_bytes()?))
    }

    /// Raw key material of exactly [`KEY_LEN`] bytes.
    pub fn from_raw_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            Error::CipherInit(format!("expected {KEY_LEN} key bytes, got {}", bytes.len()))
        })?;
        Ok(KeyMaterial::Random(key))
    }

    pub fn password(bytes: impl Into<Vec<u8>>) -> Self {
        KeyMaterial::Password(bytes.into())
    }

    /// Bytes that travel to the caller (the raw key or the password).
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            KeyMaterial::Random(k) => k,
            KeyMaterial::Password(p) => p,
        }
    }

    fn overhead(&self) -> usize {
        match self {
            KeyMaterial::Random(_) => NONCE_LEN + TAG_LEN,
            KeyMaterial::Password(_) => NONCE_LEN + TAG_LEN + SALT_LEN,
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMaterial::Random(_) => f.write_str("KeyMaterial::Random(..)"),
            KeyMaterial::Password(_) => f.write_str("KeyMaterial::Password(..)"),
        }
    }
}

/// How the server turns its generated 16 bytes into key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyScheme {
    /// Use the bytes directly as the cipher key.
    #[default]
    Raw,
    /// Treat the bytes as a password and run them through Argon2id.
    Argon2,
}

impl KeyScheme {
    pub fn material(self, bytes: [u8; KEY_LEN]) -> KeyMaterial {
        match self {
            KeyScheme::Raw => KeyMaterial::Random(bytes),
            KeyScheme::Argon2 => KeyMaterial::Password(bytes.to_vec()),
        }
    }
}

impl FromStr for KeyScheme {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(KeyScheme::Raw),
            "argon2" | "argon2id" => Ok(KeyScheme::Argon2),
            other => Err(format!("unknown key scheme '{other}' (expected raw or argon2)")),
        }
    }
}

/// Fill an array from the OS RNG, surfacing entropy failures.
pub fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut out = [0u8; N];
    OsRng.try_fill_bytes(&mut out)?;
    Ok(out)
}

/// Seal `plaintext` under `key`.
pub fn encrypt(key: &KeyMaterial, plaintext: &[u8]) -> Result<Vec<u8>> {
    let nonce: [u8; NONCE_LEN] = random_bytes()?;
    let mut out = Vec::with_capacity(plaintext.len() + key.overhead());
    out.extend_from_slice(&nonce);

    match key {
        KeyMaterial::Random(raw) => {
            let cipher = Aes128Gcm::new_from_slice(raw)
                .map_err(|e| Error::CipherInit(e.to_string()))?;
            let sealed = cipher
                .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext)
                .map_err(|_| Error::CipherInit("aes-gcm seal".into()))?;
            out.extend_from_slice(&sealed);
        }
        KeyMaterial::Password(password) => {
            let salt: [u8; SALT_LEN] = random_bytes()?;
            let derived = derive_key(password, &salt)?;
            let cipher = ChaCha20Poly1305::new_from_slice(derived.as_slice())
                .map_err(|e| Error::CipherInit(e.to_string()))?;
            let sealed = cipher
                .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plaintext)
                .map_err(|_| Error::CipherInit("chacha20poly1305 seal".into()))?;
            out.extend_from_slice(&sealed);
            out.extend_from_slice(&salt);
        }
    }
    Ok(out)
}

/// Open a blob produced by [`encrypt`] with the same key material.
///
/// Fails with `MalformedInput` for blobs too short to hold the framing and
/// `AuthenticationFailure` for a wrong key or any tampering.
pub fn decrypt(key: &KeyMaterial, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if blob.len() < key.overhead() {
        return Err(Error::MalformedInput("ciphertext too short"));
    }

    let plaintext = match key {
        KeyMaterial::Random(raw) => {
            let (nonce, sealed) = blob.split_at(NONCE_LEN);
            let cipher = Aes128Gcm::new_from_slice(raw)
                .map_err(|e| Error::CipherInit(e.to_string()))?;
            cipher
                .decrypt(aes_gcm::Nonce::from_slice(nonce), sealed)
                .map_err(|_| Error::AuthenticationFailure)?
        }
        KeyMaterial::Password(password) => {
            let (body, salt) = blob.split_at(blob.len() - SALT_LEN);
            let (nonce, sealed) = body.split_at(NONCE_LEN);
            let derived = derive_key(password, salt)?;
            let cipher = ChaCha20Poly1305::new_from_slice(derived.as_slice())
                .map_err(|e| Error::CipherInit(e.to_string()))?;
            cipher
                .decrypt(chacha20poly1305::Nonce::from_slice(nonce), sealed)
                .map_err(|_| Error::AuthenticationFailure)?
        }
    };
    Ok(Zeroizing::new(plaintext))
}

/// Argon2id over `password` and `salt`. Deliberately expensive; call from a
/// blocking context.
fn derive_key(password: &[u8], salt: &[u8]) -> Result<Zeroizing<[u8; DERIVED_KEY_LEN]>> {
    let params = Params::new(
        ARGON2_M_COST,
        ARGON2_T_COST,
        ARGON2_P_COST,
        Some(DERIVED_KEY_LEN),
    )
    .map_err(|e| Error::CipherInit(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
    argon2
        .hash_password_into(password, salt, key.as_mut_slice())
        .map_err(|e| Error::CipherInit(format!("argon2: {e}")))?;
    Ok(key)
}
