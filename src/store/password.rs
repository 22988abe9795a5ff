use std::fmt;

use zeroize::Zeroizing;

use crate::error::{CustodyError, CustodyResult};

/// Scoped secret bytes. Zeroized when dropped, on every exit path.
pub struct SecretBuffer(Zeroizing<Vec<u8>>);

impl SecretBuffer {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBuffer([REDACTED {} bytes])", self.0.len())
    }
}

/// Where the keystore password comes from. Called once per load/save; the
/// returned buffer lives only as long as the key derivation needs it.
pub trait PasswordSource: Send + Sync + 'static {
    fn password(&self) -> CustodyResult<SecretBuffer>;
}

/// Reads the password from an environment variable on every call.
#[derive(Debug, Clone)]
pub struct EnvPassword {
    var: String,
}

impl EnvPassword {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl PasswordSource for EnvPassword {
    fn password(&self) -> CustodyResult<SecretBuffer> {
        let value = std::env::var(&self.var).map_err(|_| {
            CustodyError::StoreUnavailable(format!("keystore password variable {} not set", self.var))
        })?;
        let buf = SecretBuffer::new(value.into_bytes());
        if buf.is_empty() {
            return Err(CustodyError::StoreUnavailable(format!(
                "keystore password variable {} is empty",
                self.var
            )));
        }
        Ok(buf)
    }
}

/// A password held in memory; for embedding and tests.
pub struct StaticPassword(Zeroizing<Vec<u8>>);

impl StaticPassword {
    pub fn new(password: &str) -> Self {
        Self(Zeroizing::new(password.as_bytes().to_vec()))
    }
}

impl PasswordSource for StaticPassword {
    fn password(&self) -> CustodyResult<SecretBuffer> {
        Ok(SecretBuffer::new(self.0.to_vec()))
    }
}
