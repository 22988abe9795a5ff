use thiserror::Error;

pub type CustodyResult<T> = Result<T, CustodyError>;

/// Failure kinds surfaced by every custody operation.
///
/// Messages carry aliases, client ids and underlying causes, never key
/// material.
#[derive(Debug, Error)]
pub enum CustodyError {
    #[error("secret store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("master key missing from keystore")]
    MasterKeyMissing,
    #[error("unwrap failed for {alias}: {reason}")]
    UnwrapFailed { alias: String, reason: String },
    #[error("key binding mismatch for client {client}")]
    KeyBindingMismatch { client: String },
    #[error("token signature invalid")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("insecure token algorithm: {0}")]
    InsecureAlgorithm(String),
    #[error("malformed token: {0}")]
    MalformedToken(String),
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("key generation failed: {0}")]
    KeyGenFailed(String),
    /// A seal, wrap or signing primitive refused its input.
    #[error("cipher operation failed: {0}")]
    Cipher(String),
    #[error("configuration error: {0}")]
    Config(String),
}

/// How the request layer should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input from the caller: token or ciphertext problems.
    Client,
    /// The caller is not entitled to the key it referenced.
    Authorization,
    /// Custody integrity or infrastructure failure; needs an operator.
    Internal,
}

impl CustodyError {
    pub fn store<E: std::fmt::Display>(err: E) -> Self {
        Self::StoreUnavailable(err.to_string())
    }

    pub fn unwrap_failed<E: std::fmt::Display>(alias: &str, err: E) -> Self {
        Self::UnwrapFailed {
            alias: alias.to_owned(),
            reason: err.to_string(),
        }
    }

    pub fn keygen<E: std::fmt::Display>(err: E) -> Self {
        Self::KeyGenFailed(err.to_string())
    }

    pub fn cipher<E: std::fmt::Display>(err: E) -> Self {
        Self::Cipher(err.to_string())
    }

    pub fn malformed<E: std::fmt::Display>(err: E) -> Self {
        Self::MalformedToken(err.to_string())
    }

    pub fn mismatch(client: &str) -> Self {
        Self::KeyBindingMismatch {
            client: client.to_owned(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::BadSignature
            | Self::Expired
            | Self::InsecureAlgorithm(_)
            | Self::MalformedToken(_)
            | Self::DecryptionFailed => ErrorClass::Client,
            Self::KeyBindingMismatch { .. } => ErrorClass::Authorization,
            Self::StoreUnavailable(_)
            | Self::MasterKeyMissing
            | Self::UnwrapFailed { .. }
            | Self::KeyGenFailed(_)
            | Self::Cipher(_)
            | Self::Config(_) => ErrorClass::Internal,
        }
    }
}

impl From<std::io::Error> for CustodyError {
    fn from(err: std::io::Error) -> Self {
        Self::store(err)
    }
}

impl From<bincode::Error> for CustodyError {
    fn from(err: bincode::Error) -> Self {
        Self::store(err)
    }
}
