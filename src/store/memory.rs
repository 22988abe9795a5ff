use parking_lot::Mutex;

use super::{Keystore, SecretStore};
use crate::error::CustodyResult;

/// Process-local keystore backend. Nothing touches disk.
#[derive(Default)]
pub struct MemorySecretStore {
    keystore: Mutex<Keystore>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn load(&self) -> CustodyResult<Keystore> {
        Ok(self.keystore.lock().clone())
    }

    fn save(&self, keystore: &Keystore) -> CustodyResult<()> {
        *self.keystore.lock() = keystore.clone();
        Ok(())
    }
}
