use std::collections::HashMap;

use parking_lot::RwLock;

use crate::crypto::{aead::NONCE_LEN, keys::KeyAlias};

/// What the registry knows about one client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientKeyBinding {
    pub key_alias: KeyAlias,
    /// Nonce of the most recent encryption, if any.
    pub nonce: Option<[u8; NONCE_LEN]>,
    pub created_at: u64,
}

/// Authoritative client → key binding map.
///
/// Owned and injected rather than global, so every `KeyCustody` (and every
/// test) has its own. Each method is one atomic step per client.
#[derive(Default)]
pub struct ClientKeyRegistry {
    bindings: RwLock<HashMap<String, ClientKeyBinding>>,
}

impl ClientKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `client` to `alias`, replacing any previous binding.
    /// Returns the alias that was replaced.
    pub fn bind(&self, client: &str, alias: KeyAlias, created_at: u64) -> Option<KeyAlias> {
        self.bindings
            .write()
            .insert(
                client.to_owned(),
                ClientKeyBinding {
                    key_alias: alias,
                    nonce: None,
                    created_at,
                },
            )
            .map(|old| old.key_alias)
    }

    pub fn binding(&self, client: &str) -> Option<ClientKeyBinding> {
        self.bindings.read().get(client).cloned()
    }

    pub fn alias_for(&self, client: &str) -> Option<KeyAlias> {
        self.bindings
            .read()
            .get(client)
            .map(|binding| binding.key_alias.clone())
    }

    /// Record the nonce of an encryption, but only if `client` is still
    /// bound to `alias`. Returns whether the nonce was recorded.
    pub fn record_nonce(&self, client: &str, alias: &KeyAlias, nonce: [u8; NONCE_LEN]) -> bool {
        match self.bindings.write().get_mut(client) {
            Some(binding) if &binding.key_alias == alias => {
                binding.nonce = Some(nonce);
                true
            }
            _ => false,
        }
    }

    /// Remove whichever binding still points at `alias`. A client that was
    /// re-issued a newer key keeps its binding.
    pub fn remove_alias(&self, alias: &str) -> Option<String> {
        let mut bindings = self.bindings.write();
        let client = bindings
            .iter()
            .find(|(_, binding)| binding.key_alias.as_str() == alias)
            .map(|(client, _)| client.clone())?;
        bindings.remove(&client);
        Some(client)
    }

    pub fn remove(&self, client: &str) -> Option<ClientKeyBinding> {
        self.bindings.write().remove(client)
    }

    /// Point-in-time copy for whole-set walks.
    pub fn snapshot(&self) -> Vec<(String, ClientKeyBinding)> {
        self.bindings
            .read()
            .iter()
            .map(|(client, binding)| (client.clone(), binding.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.read().is_empty()
    }
}
