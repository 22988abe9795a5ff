use std::sync::Arc;

use crate::{
    crypto::{
        aead::{self, NonceTransport},
        keys::{DataKey, KeyAlias},
    },
    custodian,
    error::{CustodyError, CustodyResult},
    registry::ClientKeyRegistry,
    store::SharedStore,
    token::TokenBinder,
};

/// Token-bound AES-256-GCM over client payloads.
pub struct EncryptionEngine {
    store: Arc<SharedStore>,
    registry: Arc<ClientKeyRegistry>,
    binder: Arc<TokenBinder>,
    transport: NonceTransport,
}

impl EncryptionEngine {
    pub fn new(
        store: Arc<SharedStore>,
        registry: Arc<ClientKeyRegistry>,
        binder: Arc<TokenBinder>,
        transport: NonceTransport,
    ) -> Self {
        Self {
            store,
            registry,
            binder,
            transport,
        }
    }

    pub fn transport(&self) -> NonceTransport {
        self.transport
    }

    pub fn encrypt(&self, client_id: &str, plaintext: &[u8], token: &str) -> CustodyResult<String> {
        let (alias, key) = self.resolve(client_id, token)?;
        self.seal_for(client_id, &alias, &key, plaintext)
    }

    /// Decrypt and verify. Fails closed: no plaintext unless the tag checks.
    pub fn decrypt(&self, client_id: &str, ciphertext: &str, token: &str) -> CustodyResult<Vec<u8>> {
        let (alias, key) = self.resolve(client_id, token)?;
        let (carried, sealed) = aead::decode_wire(self.transport, ciphertext)?;
        let nonce = match carried {
            Some(nonce) => nonce,
            None => self
                .registry
                .binding(client_id)
                .filter(|binding| binding.key_alias == alias)
                .and_then(|binding| binding.nonce)
                .ok_or(CustodyError::DecryptionFailed)?,
        };
        aead::open(&key, &nonce, &sealed)
    }

    fn seal_for(
        &self,
        client_id: &str,
        alias: &KeyAlias,
        key: &DataKey,
        plaintext: &[u8],
    ) -> CustodyResult<String> {
        let nonce = aead::generate_nonce()?;
        let sealed = aead::seal(key, &nonce, plaintext)?;

        if !self.registry.record_nonce(client_id, alias, nonce) {
            // Re-issued since resolve. The embedded nonce keeps the
            // ciphertext usable; a registry-carried one would be lost.
            if self.transport == NonceTransport::Registry {
                return Err(CustodyError::mismatch(client_id));
            }
            log::debug!("client {client_id}: binding moved off {alias} during encrypt");
        }
        Ok(aead::encode_wire(self.transport, &nonce, &sealed))
    }

    /// Token check, binding check, then unwrap, all against one keystore
    /// snapshot.
    fn resolve(&self, client_id: &str, token: &str) -> CustodyResult<(KeyAlias, DataKey)> {
        let keystore = self.store.read()?;
        let claims = self.binder.verify_token_in(&keystore, token)?;
        if claims.issued_to != client_id {
            log::warn!(
                "token for {} presented by client {client_id}",
                claims.issued_to
            );
            return Err(CustodyError::mismatch(client_id));
        }
        match self.registry.alias_for(client_id) {
            Some(bound) if bound == claims.key_alias => {}
            _ => {
                log::warn!(
                    "client {client_id} not bound to key {}",
                    claims.key_alias
                );
                return Err(CustodyError::mismatch(client_id));
            }
        }

        if keystore.is_retired(claims.key_alias.as_str()) {
            // The sweep saved this snapshot but has not unbound the client yet.
            return Err(CustodyError::mismatch(client_id));
        }
        let key = custodian::unwrap_entry(&keystore, &claims.key_alias)?;
        Ok((claims.key_alias, key))
    }
}
