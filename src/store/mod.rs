//! Durable keystore: the container value, the backend trait, and the
//! writer-lock wrapper every load-modify-save goes through.

pub mod file;
pub mod memory;
pub mod password;

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::{
    crypto::keys::{MasterKey, MasterKeyId, SigningKey, WrappedKey},
    error::{CustodyError, CustodyResult},
};
use password::PasswordSource;

/// Reserved alias of the active master key.
pub const MASTER_ALIAS: &str = "master-key";
/// Reserved alias of the token-signing key.
pub const SIGNING_ALIAS: &str = "token-signing-key";

/// One keystore slot.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub enum Entry {
    Master {
        id: MasterKeyId,
        key: MasterKey,
        created_at: u64,
    },
    Signing {
        key: SigningKey,
        created_at: u64,
    },
    /// A client data key, wrapped under the master key.
    Data { wrapped: WrappedKey, created_at: u64 },
}

impl Entry {
    pub fn created_at(&self) -> u64 {
        match self {
            Entry::Master { created_at, .. }
            | Entry::Signing { created_at, .. }
            | Entry::Data { created_at, .. } => *created_at,
        }
    }

    /// Master and signing entries never take part in sweeps or rotation.
    pub fn is_exempt(&self) -> bool {
        !matches!(self, Entry::Data { .. })
    }
}

/// In-memory image of the persisted keystore.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Keystore {
    entries: BTreeMap<String, Entry>,
    /// Aliases of deleted data keys; never handed out again.
    retired: BTreeSet<String>,
}

impl Keystore {
    pub fn get_entry(&self, alias: &str) -> Option<&Entry> {
        self.entries.get(alias)
    }

    pub fn set_entry(&mut self, alias: impl Into<String>, entry: Entry) {
        self.entries.insert(alias.into(), entry);
    }

    /// Remove an entry. Data-key aliases are remembered as retired.
    pub fn delete_entry(&mut self, alias: &str) -> Option<Entry> {
        let removed = self.entries.remove(alias);
        if matches!(removed, Some(Entry::Data { .. })) {
            self.retired.insert(alias.to_owned());
        }
        removed
    }

    pub fn list_aliases(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Aliases of client data keys only.
    pub fn data_aliases(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.is_exempt())
            .map(|(alias, _)| alias.clone())
            .collect()
    }

    pub fn contains_alias(&self, alias: &str) -> bool {
        self.entries.contains_key(alias)
    }

    pub fn is_retired(&self, alias: &str) -> bool {
        self.retired.contains(alias)
    }

    /// Whether `alias` is live, retired, or reserved.
    pub fn alias_taken(&self, alias: &str) -> bool {
        alias == MASTER_ALIAS
            || alias == SIGNING_ALIAS
            || self.contains_alias(alias)
            || self.is_retired(alias)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Durable backend for the keystore.
pub trait SecretStore: Send + Sync + 'static {
    fn load(&self) -> CustodyResult<Keystore>;

    /// Persist atomically: after a crash the backend holds either the
    /// previous keystore or this one.
    fn save(&self, keystore: &Keystore) -> CustodyResult<()>;

    /// Re-protect the container under a new password.
    fn change_password(&self, _new_source: Box<dyn PasswordSource>) -> CustodyResult<()> {
        Err(CustodyError::StoreUnavailable(
            "password change not supported by this store".into(),
        ))
    }
}

/// A backend plus the single writer lock.
pub struct SharedStore {
    backend: Arc<dyn SecretStore>,
    write_lock: Mutex<()>,
}

impl SharedStore {
    pub fn new(backend: Arc<dyn SecretStore>) -> Self {
        Self {
            backend,
            write_lock: Mutex::new(()),
        }
    }

    /// Snapshot the keystore without taking the writer lock.
    pub fn read(&self) -> CustodyResult<Keystore> {
        self.backend.load()
    }

    /// Load, apply `f`, and save, serialized against every other update.
    /// Nothing is saved if `f` fails.
    pub fn update<T>(&self, f: impl FnOnce(&mut Keystore) -> CustodyResult<T>) -> CustodyResult<T> {
        self.update_then(f, |out| out)
    }

    /// Like `update`, but runs `commit` once the save succeeded, still
    /// under the writer lock. Side state kept outside the keystore changes
    /// in the same order as the keystore itself, and never on failure.
    pub fn update_then<T, R>(
        &self,
        f: impl FnOnce(&mut Keystore) -> CustodyResult<T>,
        commit: impl FnOnce(T) -> R,
    ) -> CustodyResult<R> {
        let _guard = self.write_lock.lock();
        let mut keystore = self.backend.load()?;
        let out = f(&mut keystore)?;
        self.backend.save(&keystore)?;
        Ok(commit(out))
    }

    pub fn change_password(&self, new_source: Box<dyn PasswordSource>) -> CustodyResult<()> {
        let _guard = self.write_lock.lock();
        self.backend.change_password(new_source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::keys::{KeyAlias, MasterKeyId},
        store::memory::MemorySecretStore,
    };

    fn data_entry(created_at: u64) -> Entry {
        Entry::Data {
            wrapped: WrappedKey {
                ciphertext: vec![1, 2, 3],
                nonce: [0u8; 12],
                master_id: MasterKeyId("m1".into()),
            },
            created_at,
        }
    }

    #[test]
    fn delete_retires_data_aliases() {
        let mut ks = Keystore::default();
        let alias = KeyAlias::generate().unwrap();
        ks.set_entry(alias.as_str(), data_entry(10));

        assert!(ks.delete_entry(alias.as_str()).is_some());
        assert!(!ks.contains_alias(alias.as_str()));
        assert!(ks.is_retired(alias.as_str()));
        assert!(ks.alias_taken(alias.as_str()));
    }

    #[test]
    fn data_aliases_skip_exempt_entries() {
        let mut ks = Keystore::default();
        ks.set_entry(
            MASTER_ALIAS,
            Entry::Master {
                id: MasterKeyId::generate().unwrap(),
                key: MasterKey::generate().unwrap(),
                created_at: 0,
            },
        );
        ks.set_entry(
            SIGNING_ALIAS,
            Entry::Signing {
                key: SigningKey::generate().unwrap(),
                created_at: 0,
            },
        );
        ks.set_entry("client-key", data_entry(0));

        assert_eq!(ks.list_aliases().len(), 3);
        assert_eq!(ks.data_aliases(), vec!["client-key".to_string()]);
        assert!(ks.alias_taken(MASTER_ALIAS));
    }

    #[test]
    fn failed_update_saves_nothing() {
        let store = SharedStore::new(Arc::new(MemorySecretStore::new()));
        let result: CustodyResult<()> = store.update(|ks| {
            ks.set_entry("doomed", data_entry(0));
            Err(CustodyError::MasterKeyMissing)
        });

        assert!(result.is_err());
        assert!(store.read().unwrap().is_empty());
    }

    #[test]
    fn successful_update_persists() {
        let store = SharedStore::new(Arc::new(MemorySecretStore::new()));
        store
            .update(|ks| {
                ks.set_entry("kept", data_entry(0));
                Ok(())
            })
            .unwrap();

        assert!(store.read().unwrap().contains_alias("kept"));
    }

    #[test]
    fn commit_runs_only_after_save() {
        let store = SharedStore::new(Arc::new(MemorySecretStore::new()));
        let mut committed = Vec::new();

        let failed: CustodyResult<()> = store.update_then(
            |_| Err(CustodyError::MasterKeyMissing),
            |()| committed.push("failed"),
        );
        assert!(failed.is_err());
        assert!(committed.is_empty());

        store
            .update_then(
                |ks| {
                    ks.set_entry("kept", data_entry(0));
                    Ok("kept")
                },
                |alias| committed.push(alias),
            )
            .unwrap();
        assert_eq!(committed, vec!["kept"]);
    }

    #[test]
    fn memory_store_rejects_password_change() {
        let store = SharedStore::new(Arc::new(MemorySecretStore::new()));
        let err = store
            .change_password(Box::new(password::StaticPassword::new("pw")))
            .unwrap_err();
        assert!(matches!(err, CustodyError::StoreUnavailable(_)));
    }
}
