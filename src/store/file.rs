//! Password-protected on-disk keystore container.
//!
//! Layout:
//! ```text
//! [ MAGIC (8) | header_len u32 LE | bincode header | AES-256-GCM(keystore) ]
//! ```
//! The container key is derived from the password with Argon2id and a
//! salt that is regenerated on every save. Magic and header are bound as
//! associated data, so tampering with the KDF parameters breaks the tag.
//!
//! The last derived container key is cached per salt, so loads between two
//! saves skip Argon2id.

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use aes_gcm::{
    Aes256Gcm, KeyInit, Nonce,
    aead::{Aead, Payload},
};
use argon2::{Algorithm, Argon2, Params, Version};
use parking_lot::{Mutex, RwLock};
use zeroize::Zeroizing;

use super::{
    Keystore, SecretStore,
    password::{PasswordSource, SecretBuffer},
};
use crate::{
    crypto::keys::fill_random,
    error::{CustodyError, CustodyResult},
};

const KEYSTORE_MAGIC: &[u8; 8] = b"KCUSTKS1";
const KEYSTORE_VERSION: u32 = 1;
const MAX_HEADER_LEN: usize = 64 * 1024;

/// Argon2id cost parameters for the container key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KdfParams {
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_cost: Params::DEFAULT_M_COST,
            t_cost: Params::DEFAULT_T_COST,
            p_cost: Params::DEFAULT_P_COST,
        }
    }
}

impl KdfParams {
    pub fn new(m_cost: u32, t_cost: u32, p_cost: u32) -> CustodyResult<Self> {
        let params = Self {
            m_cost,
            t_cost,
            p_cost,
        };
        params.argon2()?;
        Ok(params)
    }

    fn argon2(&self) -> CustodyResult<Argon2<'static>> {
        let params = Params::new(self.m_cost, self.t_cost, self.p_cost, Some(32))
            .map_err(|e| CustodyError::Config(format!("argon2 params: {e}")))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct ContainerHeader {
    version: u32,
    salt: [u8; 16],
    m_cost: u32,
    t_cost: u32,
    p_cost: u32,
    nonce: [u8; 12],
}

/// A container key together with the salt and cost it was derived with.
struct DerivedKey {
    salt: [u8; 16],
    kdf: KdfParams,
    key: Zeroizing<[u8; 32]>,
}

pub struct FileSecretStore {
    path: PathBuf,
    password: RwLock<Box<dyn PasswordSource>>,
    kdf: KdfParams,
    derived: Mutex<Option<DerivedKey>>,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>, password: Box<dyn PasswordSource>) -> Self {
        Self {
            path: path.into(),
            password: RwLock::new(password),
            kdf: KdfParams::default(),
            derived: Mutex::new(None),
        }
    }

    pub fn with_kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cached_key(&self, salt: &[u8; 16], kdf: &KdfParams) -> Option<Zeroizing<[u8; 32]>> {
        self.derived
            .lock()
            .as_ref()
            .filter(|derived| &derived.salt == salt && &derived.kdf == kdf)
            .map(|derived| derived.key.clone())
    }

    fn remember_key(&self, salt: [u8; 16], kdf: KdfParams, key: Zeroizing<[u8; 32]>) {
        *self.derived.lock() = Some(DerivedKey { salt, kdf, key });
    }

    fn decode(&self, data: &[u8], source: &dyn PasswordSource) -> CustodyResult<Keystore> {
        if data.len() < 12 || &data[0..8] != KEYSTORE_MAGIC {
            return Err(CustodyError::store("invalid keystore: bad magic"));
        }
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&data[8..12]);
        let hdr_len = u32::from_le_bytes(len_buf) as usize;
        if hdr_len > MAX_HEADER_LEN || data.len() < 12 + hdr_len {
            return Err(CustodyError::store(format!(
                "invalid keystore: header length {hdr_len}"
            )));
        }
        let header: ContainerHeader = bincode::deserialize(&data[12..12 + hdr_len])?;
        if header.version != KEYSTORE_VERSION {
            return Err(CustodyError::store(format!(
                "unsupported keystore version: {}",
                header.version
            )));
        }

        let kdf = KdfParams {
            m_cost: header.m_cost,
            t_cost: header.t_cost,
            p_cost: header.p_cost,
        };
        let (key, fresh) = match self.cached_key(&header.salt, &kdf) {
            Some(key) => (key, false),
            None => {
                let password = source.password()?;
                (derive_key(&password, &header.salt, &kdf)?, true)
            }
        };

        let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(CustodyError::store)?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(&header.nonce),
                    Payload {
                        msg: &data[12 + hdr_len..],
                        aad: &data[..12 + hdr_len],
                    },
                )
                .map_err(|_| {
                    CustodyError::store("keystore authentication failed (wrong password or corrupt container)")
                })?,
        );
        if fresh {
            self.remember_key(header.salt, kdf, key);
        }
        Ok(bincode::deserialize(&plaintext)?)
    }

    fn encode(&self, keystore: &Keystore, source: &dyn PasswordSource) -> CustodyResult<Vec<u8>> {
        let mut salt = [0u8; 16];
        let mut nonce = [0u8; 12];
        fill_random(&mut salt)?;
        fill_random(&mut nonce)?;

        let header = ContainerHeader {
            version: KEYSTORE_VERSION,
            salt,
            m_cost: self.kdf.m_cost,
            t_cost: self.kdf.t_cost,
            p_cost: self.kdf.p_cost,
            nonce,
        };
        let header_bytes = bincode::serialize(&header)?;

        let mut out = Vec::new();
        out.extend_from_slice(KEYSTORE_MAGIC);
        out.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&header_bytes);

        let key = {
            let password = source.password()?;
            derive_key(&password, &salt, &self.kdf)?
        };
        let plaintext = Zeroizing::new(bincode::serialize(keystore)?);
        let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(CustodyError::store)?;
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext.as_slice(),
                    aad: &out,
                },
            )
            .map_err(|e| CustodyError::store(format!("keystore encrypt failed: {e}")))?;
        out.extend_from_slice(&ciphertext);
        self.remember_key(salt, self.kdf, key);
        Ok(out)
    }
}

impl SecretStore for FileSecretStore {
    fn load(&self) -> CustodyResult<Keystore> {
        if !self.path.exists() {
            log::debug!("keystore {} absent, starting empty", self.path.display());
            return Ok(Keystore::default());
        }
        let data = fs::read(&self.path)?;
        let source = self.password.read();
        self.decode(&data, &**source)
    }

    fn save(&self, keystore: &Keystore) -> CustodyResult<()> {
        let data = {
            let source = self.password.read();
            self.encode(keystore, &**source)?
        };
        write_atomic(&self.path, &data)?;
        log::debug!(
            "keystore saved: {} entries -> {}",
            keystore.len(),
            self.path.display()
        );
        Ok(())
    }

    fn change_password(&self, new_source: Box<dyn PasswordSource>) -> CustodyResult<()> {
        let mut source = self.password.write();
        let keystore = if self.path.exists() {
            let data = fs::read(&self.path)?;
            self.decode(&data, &**source)?
        } else {
            Keystore::default()
        };
        let data = self.encode(&keystore, new_source.as_ref())?;
        write_atomic(&self.path, &data)?;
        *source = new_source;
        log::info!("keystore password changed for {}", self.path.display());
        Ok(())
    }
}

fn derive_key(
    password: &SecretBuffer,
    salt: &[u8; 16],
    kdf: &KdfParams,
) -> CustodyResult<Zeroizing<[u8; 32]>> {
    let mut key = Zeroizing::new([0u8; 32]);
    kdf.argon2()?
        .hash_password_into(password.as_bytes(), salt, &mut key[..])
        .map_err(|e| CustodyError::store(format!("argon2 failed: {e}")))?;
    Ok(key)
}

/// Write to a sibling temp file, fsync, then rename over `path`.
fn write_atomic(path: &Path, data: &[u8]) -> CustodyResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let result = (|| -> std::io::Result<()> {
        let mut file = open_secure(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            // Persist the rename itself; not every platform allows this.
            let _ = File::open(parent).and_then(|dir| dir.sync_all());
        }
        Ok(())
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(CustodyError::store(format!(
            "write {} failed: {e}",
            path.display()
        )));
    }
    Ok(())
}

fn open_secure(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    options.open(path)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::{
        crypto::keys::{MasterKey, MasterKeyId},
        store::{Entry, MASTER_ALIAS, password::StaticPassword},
    };

    fn cheap_kdf() -> KdfParams {
        KdfParams::new(64, 1, 1).unwrap()
    }

    fn sample_keystore() -> Keystore {
        let mut ks = Keystore::default();
        ks.set_entry(
            MASTER_ALIAS,
            Entry::Master {
                id: MasterKeyId::generate().unwrap(),
                key: MasterKey::generate().unwrap(),
                created_at: 42,
            },
        );
        ks
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(
            dir.path().join("absent.ks"),
            Box::new(StaticPassword::new("pw")),
        )
        .with_kdf(cheap_kdf());

        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.ks");
        let store = FileSecretStore::new(&path, Box::new(StaticPassword::new("pw")))
            .with_kdf(cheap_kdf());

        store.save(&sample_keystore()).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.get_entry(MASTER_ALIAS).unwrap().created_at(), 42);

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        assert!(!PathBuf::from(tmp).exists());
    }

    #[test]
    fn container_does_not_leak_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.ks");
        let store = FileSecretStore::new(&path, Box::new(StaticPassword::new("pw")))
            .with_kdf(cheap_kdf());
        store.save(&sample_keystore()).unwrap();

        let raw = fs::read(&path).unwrap();
        assert!(!raw.windows(MASTER_ALIAS.len()).any(|w| w == MASTER_ALIAS.as_bytes()));
    }

    #[test]
    fn wrong_password_is_store_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.ks");
        FileSecretStore::new(&path, Box::new(StaticPassword::new("right")))
            .with_kdf(cheap_kdf())
            .save(&sample_keystore())
            .unwrap();

        let wrong = FileSecretStore::new(&path, Box::new(StaticPassword::new("wrong")));
        let err = wrong.load().unwrap_err();
        assert!(matches!(err, CustodyError::StoreUnavailable(_)));
    }

    #[test]
    fn corrupt_container_is_rejected_and_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.ks");
        let store = FileSecretStore::new(&path, Box::new(StaticPassword::new("pw")))
            .with_kdf(cheap_kdf());
        store.save(&sample_keystore()).unwrap();

        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        fs::write(&path, &raw).unwrap();

        assert!(store.load().is_err());
        assert_eq!(fs::read(&path).unwrap(), raw);
    }

    #[test]
    fn change_password_reencrypts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.ks");
        let store = FileSecretStore::new(&path, Box::new(StaticPassword::new("old")))
            .with_kdf(cheap_kdf());
        store.save(&sample_keystore()).unwrap();

        store
            .change_password(Box::new(StaticPassword::new("new")))
            .unwrap();
        assert!(store.load().unwrap().contains_alias(MASTER_ALIAS));

        let stale = FileSecretStore::new(&path, Box::new(StaticPassword::new("old")));
        assert!(stale.load().is_err());
    }

    struct CountingPassword {
        calls: Arc<AtomicUsize>,
    }

    impl PasswordSource for CountingPassword {
        fn password(&self) -> CustodyResult<SecretBuffer> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SecretBuffer::new(b"pw".to_vec()))
        }
    }

    #[test]
    fn loads_between_saves_reuse_the_container_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.ks");
        let calls = Arc::new(AtomicUsize::new(0));
        let store = FileSecretStore::new(
            &path,
            Box::new(CountingPassword {
                calls: calls.clone(),
            }),
        )
        .with_kdf(cheap_kdf());

        store.save(&sample_keystore()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for _ in 0..3 {
            assert!(store.load().unwrap().contains_alias(MASTER_ALIAS));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        store.save(&sample_keystore()).unwrap();
        store.load().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cold_store_derives_once_then_caches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.ks");
        FileSecretStore::new(&path, Box::new(StaticPassword::new("pw")))
            .with_kdf(cheap_kdf())
            .save(&sample_keystore())
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let store = FileSecretStore::new(
            &path,
            Box::new(CountingPassword {
                calls: calls.clone(),
            }),
        );
        store.load().unwrap();
        store.load().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_open_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.ks");
        FileSecretStore::new(&path, Box::new(StaticPassword::new("right")))
            .with_kdf(cheap_kdf())
            .save(&sample_keystore())
            .unwrap();

        let wrong = FileSecretStore::new(&path, Box::new(StaticPassword::new("wrong")));
        assert!(wrong.load().is_err());
        assert!(wrong.derived.lock().is_none());
    }

    #[test]
    fn rejects_invalid_kdf_params() {
        assert!(KdfParams::new(1, 0, 1).is_err());
    }
}
