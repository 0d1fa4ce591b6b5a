//! Capability strings carried in redemption and deletion URLs.
//!
//! Redemption: base64url (no padding) of `access_key (16) || key (16)`.
//! Deletion: the deletion key's UUID text form.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use uuid::Uuid;

use crate::crypto::KEY_LEN;
use crate::error::{Error, Result};

const ACCESS_KEY_LEN: usize = 16;
const BLOB_LEN: usize = ACCESS_KEY_LEN + KEY_LEN;

/// Decoded redemption capability.
pub struct Capability {
    pub access_key: Uuid,
    pub key: [u8; KEY_LEN],
}

impl Capability {
    pub fn encode(&self) -> String {
        let mut raw = [0u8; BLOB_LEN];
        raw[..ACCESS_KEY_LEN].copy_from_slice(self.access_key.as_bytes());
        raw[ACCESS_KEY_LEN..].copy_from_slice(&self.key);
        URL_SAFE_NO_PAD.encode(raw)
    }

    pub fn decode(s: &str) -> Result<Self> {
        let raw = URL_SAFE_NO_PAD
            .decode(s.trim())
            .map_err(|_| Error::MalformedInput("capability is not base64url"))?;
        if raw.len() != BLOB_LEN {
            return Err(Error::MalformedInput("capability has wrong length"));
        }
        let (id, key) = raw.split_at(ACCESS_KEY_LEN);
        let access_key = random_uuid(
            Uuid::from_slice(id).map_err(|_| Error::MalformedInput("bad access key"))?,
        )?;
        let mut k = [0u8; KEY_LEN];
        k.copy_from_slice(key);
        Ok(Self { access_key, key: k })
    }
}

/// Parse a deletion key in any of the usual UUID text forms (hyphenated or
/// simple). Only random (v4) identifiers are accepted.
pub fn parse_deletion_key(s: &str) -> Result<Uuid> {
    let id = Uuid::parse_str(s.trim()).map_err(|_| Error::MalformedInput("bad deletion key"))?;
    random_uuid(id)
}

fn random_uuid(id: Uuid) -> Result<Uuid> {
    if id.get_version_num() != 4 {
        return Err(Error::MalformedInput("identifier is not a v4 uuid"));
    }
    Ok(id)
}

/// Redemption URL for `cap` under the public base URL.
pub fn redeem_url(base: &str, cap: &Capability) -> String {
    format!("{base}?q={}", cap.encode())
}

/// Deletion URL for `deletion_key` under the public base URL.
pub fn delete_url(base: &str, deletion_key: &Uuid) -> String {
    format!("{base}?rm={}", deletion_key.hyphenated())
}
