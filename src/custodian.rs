//! Master-key custody: finds the active master key in a keystore and
//! wraps, unwraps and re-wraps data keys with it.

use crate::{
    crypto::{
        envelope,
        keys::{DataKey, KeyAlias, MasterKey, MasterKeyId, WrappedKey},
    },
    error::{CustodyError, CustodyResult},
    store::{Entry, Keystore, MASTER_ALIAS},
};

/// The active master key and its id, borrowed from `keystore`.
pub fn current_master_key(keystore: &Keystore) -> CustodyResult<(&MasterKeyId, &MasterKey)> {
    match keystore.get_entry(MASTER_ALIAS) {
        Some(Entry::Master { id, key, .. }) => Ok((id, key)),
        _ => Err(CustodyError::MasterKeyMissing),
    }
}

pub fn wrap(
    key: &DataKey,
    master: &MasterKey,
    master_id: &MasterKeyId,
    alias: &KeyAlias,
) -> CustodyResult<WrappedKey> {
    envelope::wrap_key(key, master, master_id, alias)
}

pub fn unwrap(
    wrapped: &WrappedKey,
    master: &MasterKey,
    master_id: &MasterKeyId,
    alias: &KeyAlias,
) -> CustodyResult<DataKey> {
    envelope::unwrap_key(wrapped, master, master_id, alias)
}

/// Resolve `alias` to a plaintext data key under the active master key.
pub fn unwrap_entry(keystore: &Keystore, alias: &KeyAlias) -> CustodyResult<DataKey> {
    let (master_id, master) = current_master_key(keystore)?;
    match keystore.get_entry(alias.as_str()) {
        Some(Entry::Data { wrapped, .. }) => unwrap(wrapped, master, master_id, alias),
        Some(_) => Err(CustodyError::unwrap_failed(alias.as_str(), "not a data key")),
        None => Err(CustodyError::unwrap_failed(alias.as_str(), "no such entry")),
    }
}

/// Create the first master key if the keystore has none.
/// Returns `true` when a key was installed.
pub fn ensure_master_key(keystore: &mut Keystore, now: u64) -> CustodyResult<bool> {
    if keystore.contains_alias(MASTER_ALIAS) {
        return Ok(false);
    }
    keystore.set_entry(
        MASTER_ALIAS,
        Entry::Master {
            id: MasterKeyId::generate()?,
            key: MasterKey::generate()?,
            created_at: now,
        },
    );
    Ok(true)
}

/// Re-wrap every data key under `new_key` and install it as the active
/// master key. On error the keystore is left as it was: re-wrapped
/// entries are staged and only applied once every entry succeeded.
pub fn rewrap_all(
    keystore: &mut Keystore,
    new_id: MasterKeyId,
    new_key: MasterKey,
    now: u64,
) -> CustodyResult<usize> {
    let mut staged = Vec::new();
    {
        let (old_id, old_key) = current_master_key(keystore)?;
        for alias in keystore.data_aliases() {
            let key_alias = KeyAlias::parse(&alias)
                .map_err(|_| CustodyError::unwrap_failed(&alias, "stored alias is malformed"))?;
            if let Some(Entry::Data {
                wrapped,
                created_at,
            }) = keystore.get_entry(&alias)
            {
                let key = unwrap(wrapped, old_key, old_id, &key_alias)?;
                let rewrapped = wrap(&key, &new_key, &new_id, &key_alias)?;
                staged.push((
                    alias,
                    Entry::Data {
                        wrapped: rewrapped,
                        created_at: *created_at,
                    },
                ));
            }
        }
    }

    let count = staged.len();
    for (alias, entry) in staged {
        keystore.set_entry(alias, entry);
    }
    keystore.set_entry(
        MASTER_ALIAS,
        Entry::Master {
            id: new_id,
            key: new_key,
            created_at: now,
        },
    );
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keystore_with_keys(n: usize) -> (Keystore, Vec<(KeyAlias, [u8; 32])>) {
        let mut ks = Keystore::default();
        ensure_master_key(&mut ks, 0).unwrap();
        let mut issued = Vec::new();
        for _ in 0..n {
            let alias = KeyAlias::generate().unwrap();
            let key = DataKey::generate().unwrap();
            let (id, master) = current_master_key(&ks).unwrap();
            let wrapped = wrap(&key, master, id, &alias).unwrap();
            ks.set_entry(
                alias.as_str(),
                Entry::Data {
                    wrapped,
                    created_at: 0,
                },
            );
            issued.push((alias, *key.as_bytes()));
        }
        (ks, issued)
    }

    #[test]
    fn missing_master_key() {
        let ks = Keystore::default();
        assert!(matches!(
            current_master_key(&ks),
            Err(CustodyError::MasterKeyMissing)
        ));
    }

    #[test]
    fn ensure_master_key_is_idempotent() {
        let mut ks = Keystore::default();
        assert!(ensure_master_key(&mut ks, 1).unwrap());
        let first = current_master_key(&ks).unwrap().0.clone();

        assert!(!ensure_master_key(&mut ks, 2).unwrap());
        assert_eq!(current_master_key(&ks).unwrap().0, &first);
    }

    #[test]
    fn unwrap_entry_resolves_alias() {
        let (ks, issued) = keystore_with_keys(1);
        let (alias, bytes) = &issued[0];

        let key = unwrap_entry(&ks, alias).unwrap();
        assert_eq!(key.as_bytes(), bytes);
    }

    #[test]
    fn unwrap_entry_unknown_alias() {
        let (ks, _) = keystore_with_keys(0);
        let err = unwrap_entry(&ks, &KeyAlias::generate().unwrap()).unwrap_err();
        assert!(matches!(err, CustodyError::UnwrapFailed { .. }));
    }

    #[test]
    fn rewrap_all_moves_every_entry_to_new_master() {
        let (mut ks, issued) = keystore_with_keys(3);
        let old_id = current_master_key(&ks).unwrap().0.clone();

        let new_id = MasterKeyId::generate().unwrap();
        let count = rewrap_all(&mut ks, new_id.clone(), MasterKey::generate().unwrap(), 9).unwrap();
        assert_eq!(count, 3);
        assert_eq!(current_master_key(&ks).unwrap().0, &new_id);
        assert_ne!(old_id, new_id);

        for (alias, bytes) in &issued {
            match ks.get_entry(alias.as_str()) {
                Some(Entry::Data { wrapped, .. }) => assert_eq!(wrapped.master_id, new_id),
                other => panic!("unexpected entry {other:?}"),
            }
            assert_eq!(unwrap_entry(&ks, alias).unwrap().as_bytes(), bytes);
        }
    }

    #[test]
    fn rewrap_all_leaves_keystore_untouched_on_failure() {
        let (mut ks, issued) = keystore_with_keys(2);
        let old_id = current_master_key(&ks).unwrap().0.clone();

        // Corrupt one entry so its unwrap fails mid-rotation.
        let (alias, _) = &issued[1];
        if let Some(Entry::Data {
            wrapped,
            created_at,
        }) = ks.get_entry(alias.as_str()).cloned()
        {
            let mut broken = wrapped;
            broken.ciphertext[0] ^= 0xFF;
            ks.set_entry(
                alias.as_str(),
                Entry::Data {
                    wrapped: broken,
                    created_at,
                },
            );
        }

        let result = rewrap_all(
            &mut ks,
            MasterKeyId::generate().unwrap(),
            MasterKey::generate().unwrap(),
            9,
        );
        assert!(result.is_err());
        assert_eq!(current_master_key(&ks).unwrap().0, &old_id);
        assert_eq!(
            unwrap_entry(&ks, &issued[0].0).unwrap().as_bytes(),
            &issued[0].1
        );
    }
}
