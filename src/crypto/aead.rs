use aes_gcm::{Aes256Gcm, KeyInit, Nonce, aead::Aead};
use base64::{Engine as _, engine::general_purpose::STANDARD};

use super::keys::{DataKey, fill_random};
use crate::error::{CustodyError, CustodyResult};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Where the decrypting side finds the GCM nonce.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NonceTransport {
    /// Wire text is `base64(nonce || ciphertext || tag)`.
    #[default]
    Embedded,
    /// Wire text is `base64(ciphertext || tag)`; the nonce is the one last
    /// recorded in the client's registry binding. Only correct when a
    /// client never has two encryptions outstanding.
    Registry,
}

impl std::str::FromStr for NonceTransport {
    type Err = CustodyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "embedded" => Ok(Self::Embedded),
            "registry" => Ok(Self::Registry),
            other => Err(CustodyError::Config(format!(
                "unknown nonce transport '{other}'"
            ))),
        }
    }
}

pub fn generate_nonce() -> CustodyResult<[u8; NONCE_LEN]> {
    let mut nonce = [0u8; NONCE_LEN];
    fill_random(&mut nonce)?;
    Ok(nonce)
}

/// AES-256-GCM encrypt. Output is `ciphertext || tag`.
pub fn seal(key: &DataKey, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> CustodyResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CustodyError::cipher(format!("data key: {e}")))?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| CustodyError::cipher(format!("payload encrypt failed: {e}")))
}

/// AES-256-GCM decrypt and verify. Any fault is `DecryptionFailed`.
pub fn open(key: &DataKey, nonce: &[u8; NONCE_LEN], sealed: &[u8]) -> CustodyResult<Vec<u8>> {
    if sealed.len() < TAG_LEN {
        return Err(CustodyError::DecryptionFailed);
    }
    let cipher =
        Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CustodyError::DecryptionFailed)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| CustodyError::DecryptionFailed)
}

/// Render sealed bytes as wire text.
pub fn encode_wire(transport: NonceTransport, nonce: &[u8; NONCE_LEN], sealed: &[u8]) -> String {
    match transport {
        NonceTransport::Embedded => {
            let mut buf = Vec::with_capacity(NONCE_LEN + sealed.len());
            buf.extend_from_slice(nonce);
            buf.extend_from_slice(sealed);
            STANDARD.encode(buf)
        }
        NonceTransport::Registry => STANDARD.encode(sealed),
    }
}

/// Split wire text into an optional carried nonce and the sealed bytes.
pub fn decode_wire(
    transport: NonceTransport,
    text: &str,
) -> CustodyResult<(Option<[u8; NONCE_LEN]>, Vec<u8>)> {
    let raw = STANDARD
        .decode(text.trim())
        .map_err(|_| CustodyError::DecryptionFailed)?;
    match transport {
        NonceTransport::Embedded => {
            if raw.len() < NONCE_LEN + TAG_LEN {
                return Err(CustodyError::DecryptionFailed);
            }
            let mut nonce = [0u8; NONCE_LEN];
            nonce.copy_from_slice(&raw[..NONCE_LEN]);
            Ok((Some(nonce), raw[NONCE_LEN..].to_vec()))
        }
        NonceTransport::Registry => Ok((None, raw)),
    }
}
