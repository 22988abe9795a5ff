use std::sync::Arc;

use crate::{
    clock::Clock,
    crypto::keys::{DataKey, KeyAlias},
    custodian,
    error::{CustodyError, CustodyResult},
    registry::ClientKeyRegistry,
    store::{Entry, Keystore, SharedStore},
    token::TokenBinder,
};

/// Attempts at drawing an unused alias before giving up.
const ALIAS_ATTEMPTS: usize = 8;

/// Result of a successful issuance.
#[derive(Clone, Debug)]
pub struct IssuedKey {
    pub token: String,
    pub key_alias: KeyAlias,
}

pub struct KeyIssuer {
    store: Arc<SharedStore>,
    registry: Arc<ClientKeyRegistry>,
    binder: Arc<TokenBinder>,
    clock: Arc<dyn Clock>,
}

impl KeyIssuer {
    pub fn new(
        store: Arc<SharedStore>,
        registry: Arc<ClientKeyRegistry>,
        binder: Arc<TokenBinder>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            binder,
            clock,
        }
    }

    /// Generate, wrap and persist a fresh data key for `client_id`, mint a
    /// token for it and bind it in the registry. The binding only changes
    /// once the key is saved and the token exists.
    ///
    /// A previous key of the same client is left in the store so in-flight
    /// decrypts keep working; the expiration sweep reclaims it.
    pub fn issue(&self, client_id: &str) -> CustodyResult<IssuedKey> {
        let now = self.clock.now();
        let (issued, replaced) = self.store.update_then(
            |keystore| {
                let alias = fresh_alias(keystore)?;
                let key = DataKey::generate()?;
                let wrapped = {
                    let (master_id, master) = custodian::current_master_key(keystore)?;
                    custodian::wrap(&key, master, master_id, &alias)?
                };
                keystore.set_entry(
                    alias.as_str(),
                    Entry::Data {
                        wrapped,
                        created_at: now,
                    },
                );
                let token = self.binder.issue_token_in(keystore, &alias, client_id)?;
                Ok(IssuedKey {
                    token,
                    key_alias: alias,
                })
            },
            |issued| {
                let replaced = self.registry.bind(client_id, issued.key_alias.clone(), now);
                (issued, replaced)
            },
        )?;

        if let Some(old) = replaced {
            log::debug!("client {client_id}: key {old} orphaned until expiry");
        }
        log::info!("issued data key {} to client {client_id}", issued.key_alias);
        Ok(issued)
    }
}

fn fresh_alias(keystore: &Keystore) -> CustodyResult<KeyAlias> {
    for _ in 0..ALIAS_ATTEMPTS {
        let alias = KeyAlias::generate()?;
        if !keystore.alias_taken(alias.as_str()) {
            return Ok(alias);
        }
        log::warn!("alias collision on {alias}, drawing again");
    }
    Err(CustodyError::keygen("could not draw an unused alias"))
}
