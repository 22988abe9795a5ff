//! Envelope-key custody for per-client AES-256-GCM encryption.
//!
//! A password-protected keystore holds one master key, one token signing
//! key and any number of data keys wrapped under the master key. Clients
//! are issued a data key plus a signed token naming it, and present both
//! their id and that token on every encrypt/decrypt.
//!
//! ```no_run
//! use std::sync::Arc;
//! use keycustody::{KeyCustodyBuilder, store::memory::MemorySecretStore};
//!
//! let custody = KeyCustodyBuilder::new(Arc::new(MemorySecretStore::new())).build()?;
//! let issued = custody.issue("alice")?;
//! let sealed = custody.encrypt("alice", b"hello", &issued.token)?;
//! assert_eq!(custody.decrypt("alice", &sealed, &issued.token)?, b"hello");
//! # Ok::<(), keycustody::CustodyError>(())
//! ```

pub mod clock;
pub mod config;
pub mod crypto;
pub mod custodian;
pub mod engine;
pub mod error;
pub mod issuer;
pub mod lifecycle;
pub mod registry;
pub mod store;
pub mod token;

use std::{sync::Arc, time::Duration};

pub use crate::{
    clock::{Clock, ManualClock, SystemClock},
    config::Config,
    crypto::{aead::NonceTransport, keys::KeyAlias},
    engine::EncryptionEngine,
    error::{CustodyError, CustodyResult, ErrorClass},
    issuer::{IssuedKey, KeyIssuer},
    lifecycle::{KeyLifecycleScheduler, LifecycleConfig, SchedulerHandle},
    registry::ClientKeyRegistry,
    token::{Algorithm, Claims, TokenBinder},
};
use crate::{
    crypto::keys::{MasterKeyId, SigningKey},
    store::{
        Entry,
        SIGNING_ALIAS,
        SecretStore,
        SharedStore,
        file::FileSecretStore,
        password::{EnvPassword, PasswordSource},
    },
};

pub struct KeyCustodyBuilder {
    backend: Arc<dyn SecretStore>,
    registry: Option<Arc<ClientKeyRegistry>>,
    clock: Arc<dyn Clock>,
    token_lifetime: Duration,
    token_algorithm: Algorithm,
    nonce_transport: NonceTransport,
    lifecycle: LifecycleConfig,
}

impl KeyCustodyBuilder {
    pub fn new(backend: Arc<dyn SecretStore>) -> Self {
        Self {
            backend,
            registry: None,
            clock: Arc::new(SystemClock),
            token_lifetime: token::DEFAULT_TOKEN_LIFETIME,
            token_algorithm: Algorithm::default(),
            nonce_transport: NonceTransport::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }

    /// Share a registry with another custody instance.
    pub fn registry(mut self, registry: Arc<ClientKeyRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn token_lifetime(mut self, lifetime: Duration) -> Self {
        self.token_lifetime = lifetime;
        self
    }

    pub fn token_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.token_algorithm = algorithm;
        self
    }

    pub fn nonce_transport(mut self, transport: NonceTransport) -> Self {
        self.nonce_transport = transport;
        self
    }

    pub fn lifecycle(mut self, lifecycle: LifecycleConfig) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn key_ttl(mut self, ttl: Duration) -> Self {
        self.lifecycle.key_ttl = ttl;
        self
    }

    /// Open the keystore, creating the master and signing keys on first
    /// use, and wire the components together.
    pub fn build(self) -> CustodyResult<KeyCustody> {
        let store = Arc::new(SharedStore::new(self.backend));
        let now = self.clock.now();
        let created = store.update(|keystore| {
            let master = custodian::ensure_master_key(keystore, now)?;
            let signing = keystore.get_entry(SIGNING_ALIAS).is_none();
            if signing {
                keystore.set_entry(
                    SIGNING_ALIAS,
                    Entry::Signing {
                        key: SigningKey::generate()?,
                        created_at: now,
                    },
                );
            }
            Ok((master, signing))
        })?;
        if created.0 {
            log::info!("keycustody: generated master key");
        }
        if created.1 {
            log::info!("keycustody: generated token signing key");
        }

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ClientKeyRegistry::new()));
        let binder = Arc::new(
            TokenBinder::new(store.clone(), self.clock.clone())
                .algorithm(self.token_algorithm)
                .lifetime(self.token_lifetime),
        );
        let issuer = KeyIssuer::new(
            store.clone(),
            registry.clone(),
            binder.clone(),
            self.clock.clone(),
        );
        let engine = EncryptionEngine::new(
            store.clone(),
            registry.clone(),
            binder.clone(),
            self.nonce_transport,
        );
        let lifecycle = Arc::new(KeyLifecycleScheduler::new(
            store.clone(),
            registry.clone(),
            self.clock,
            self.lifecycle,
        ));

        Ok(KeyCustody {
            store,
            registry,
            binder,
            issuer,
            engine,
            lifecycle,
        })
    }
}

/// The assembled custody service.
pub struct KeyCustody {
    store: Arc<SharedStore>,
    registry: Arc<ClientKeyRegistry>,
    binder: Arc<TokenBinder>,
    issuer: KeyIssuer,
    engine: EncryptionEngine,
    lifecycle: Arc<KeyLifecycleScheduler>,
}

impl KeyCustody {
    /// File-backed custody as described by `config`.
    pub fn from_config(config: &Config) -> CustodyResult<Self> {
        let backend = FileSecretStore::new(
            &config.keystore_path,
            Box::new(EnvPassword::new(config.password_var.clone())),
        )
        .with_kdf(config.kdf);
        KeyCustodyBuilder::new(Arc::new(backend))
            .token_lifetime(config.token_lifetime)
            .nonce_transport(config.nonce_transport)
            .lifecycle(config.lifecycle)
            .build()
    }

    pub fn issue(&self, client_id: &str) -> CustodyResult<IssuedKey> {
        self.issuer.issue(client_id)
    }

    pub fn encrypt(&self, client_id: &str, plaintext: &[u8], token: &str) -> CustodyResult<String> {
        self.engine.encrypt(client_id, plaintext, token)
    }

    pub fn decrypt(&self, client_id: &str, ciphertext: &str, token: &str) -> CustodyResult<Vec<u8>> {
        self.engine.decrypt(client_id, ciphertext, token)
    }

    pub fn verify_token(&self, token: &str) -> CustodyResult<Claims> {
        self.binder.verify_token(token)
    }

    pub fn scheduler(&self) -> Arc<KeyLifecycleScheduler> {
        self.lifecycle.clone()
    }

    pub fn registry(&self) -> &Arc<ClientKeyRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<SharedStore> {
        &self.store
    }

    /// Check that every stored data key unwraps under the current master
    /// key. Read-only.
    pub fn verify_keystore(&self) -> CustodyResult<KeystoreReport> {
        let keystore = self.store.read()?;
        let master_id = custodian::current_master_key(&keystore)?.0.clone();
        let aliases = keystore.data_aliases();
        let mut bad = Vec::new();
        for alias in &aliases {
            let ok = KeyAlias::parse(alias)
                .and_then(|parsed| custodian::unwrap_entry(&keystore, &parsed))
                .is_ok();
            if !ok {
                log::warn!("keycustody: data key {alias} does not unwrap");
                bad.push(alias.clone());
            }
        }
        Ok(KeystoreReport {
            master_id,
            data_keys: aliases.len(),
            ok: aliases.len() - bad.len(),
            bad,
        })
    }

    /// Re-protect the keystore container under a new password.
    pub fn change_keystore_password(&self, new_source: Box<dyn PasswordSource>) -> CustodyResult<()> {
        self.store.change_password(new_source)?;
        log::info!("keycustody: keystore password changed");
        Ok(())
    }
}

#[derive(Debug)]
pub struct KeystoreReport {
    pub master_id: MasterKeyId,
    pub data_keys: usize,
    pub ok: usize,
    pub bad: Vec<String>,
}

impl KeystoreReport {
    pub fn is_ok(&self) -> bool {
        self.bad.is_empty()
    }
}

/// Entry point for hosts configured through the environment.
pub fn init_from_env() -> CustodyResult<KeyCustody> {
    let _ = env_logger::try_init();

    let config = Config::from_env()?;
    match KeyCustody::from_config(&config) {
        Ok(custody) => {
            log::info!(
                "keycustody: keystore {} opened",
                config.keystore_path.display()
            );
            Ok(custody)
        }
        Err(e) => {
            log::error!("keycustody: initialization failed: {e}");
            Err(e)
        }
    }
}
