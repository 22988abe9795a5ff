use std::fmt;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CustodyError, CustodyResult};

/// Bytes of randomness behind every alias and master-key id.
const ID_ENTROPY: usize = 16;

/// Length of an encoded alias: 16 bytes, unpadded URL-safe base64.
pub const ALIAS_LEN: usize = 22;

/// A 256-bit AES data key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    bytes: [u8; 32],
}

/// The key-encryption key every data key is wrapped under.
#[derive(Clone, Zeroize, ZeroizeOnDrop, serde::Serialize, serde::Deserialize)]
pub struct MasterKey {
    bytes: [u8; 32],
}

/// HMAC key used to sign tokens. 512 bits so it is full-width for HS512.
#[derive(Clone, Zeroize, ZeroizeOnDrop, serde::Serialize, serde::Deserialize)]
pub struct SigningKey {
    bytes: Vec<u8>,
}

/// A wrapped (ciphertext) data key. Safe to persist.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WrappedKey {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; 12],
    /// Identifies which master key wrapped this data key.
    pub master_id: MasterKeyId,
}

/// Opaque master key identifier.
#[derive(Clone, Debug, Hash, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MasterKeyId(pub String);

/// Unguessable name of a data key entry.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct KeyAlias(String);

impl DataKey {
    pub fn generate() -> CustodyResult<Self> {
        let mut bytes = [0u8; 32];
        fill_random(&mut bytes)?;
        Ok(Self { bytes })
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl MasterKey {
    pub fn generate() -> CustodyResult<Self> {
        let mut bytes = [0u8; 32];
        fill_random(&mut bytes)?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl SigningKey {
    pub fn generate() -> CustodyResult<Self> {
        let mut bytes = vec![0u8; 64];
        fill_random(&mut bytes)?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl MasterKeyId {
    pub fn generate() -> CustodyResult<Self> {
        Ok(Self(random_id()?))
    }
}

impl KeyAlias {
    pub fn generate() -> CustodyResult<Self> {
        Ok(Self(random_id()?))
    }

    /// Accept an alias taken from untrusted input (a token claim).
    pub fn parse(raw: &str) -> CustodyResult<Self> {
        if Self::is_well_formed(raw) {
            Ok(Self(raw.to_owned()))
        } else {
            Err(CustodyError::malformed("keyAlias is not a valid alias"))
        }
    }

    pub fn is_well_formed(raw: &str) -> bool {
        raw.len() == ALIAS_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataKey(***)")
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(***)")
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(***)")
    }
}

impl fmt::Display for KeyAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for MasterKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fill `buf` from the OS random source.
pub fn fill_random(buf: &mut [u8]) -> CustodyResult<()> {
    getrandom::getrandom(buf).map_err(CustodyError::keygen)
}

fn random_id() -> CustodyResult<String> {
    let mut raw = [0u8; ID_ENTROPY];
    fill_random(&mut raw)?;
    Ok(URL_SAFE_NO_PAD.encode(raw))
}
