use aes_gcm::{
    Aes256Gcm, KeyInit, Nonce,
    aead::{Aead, Payload},
};
use zeroize::Zeroizing;

use super::keys::{DataKey, KeyAlias, MasterKey, MasterKeyId, WrappedKey, fill_random};
use crate::error::{CustodyError, CustodyResult};

/// Domain separator mixed into the associated data so a wrapped key can
/// never be confused with a payload ciphertext.
const WRAP_CONTEXT: &[u8] = b"keycustody/wrap/v1:";

/// Wrap a data key under `master`. The alias is bound as associated data,
/// so an entry copied to another alias no longer unwraps.
pub fn wrap_key(
    key: &DataKey,
    master: &MasterKey,
    master_id: &MasterKeyId,
    alias: &KeyAlias,
) -> CustodyResult<WrappedKey> {
    let cipher = Aes256Gcm::new_from_slice(master.as_bytes())
        .map_err(|e| CustodyError::cipher(format!("master key: {e}")))?;
    let mut nonce_bytes = [0u8; 12];
    fill_random(&mut nonce_bytes)?;
    let aad = associated_data(alias);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: key.as_bytes(),
                aad: &aad,
            },
        )
        .map_err(|e| CustodyError::cipher(format!("wrap encrypt failed: {e}")))?;
    Ok(WrappedKey {
        ciphertext,
        nonce: nonce_bytes,
        master_id: master_id.clone(),
    })
}

/// Unwrap a data key. Fails if `wrapped` names a different master key,
/// if the tag does not verify, or if the plaintext is not 32 bytes.
pub fn unwrap_key(
    wrapped: &WrappedKey,
    master: &MasterKey,
    master_id: &MasterKeyId,
    alias: &KeyAlias,
) -> CustodyResult<DataKey> {
    if &wrapped.master_id != master_id {
        return Err(CustodyError::unwrap_failed(
            alias.as_str(),
            format!("wrapped under retired master key {}", wrapped.master_id),
        ));
    }
    let cipher = Aes256Gcm::new_from_slice(master.as_bytes())
        .map_err(|e| CustodyError::unwrap_failed(alias.as_str(), e))?;
    let aad = associated_data(alias);
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(
                Nonce::from_slice(&wrapped.nonce),
                Payload {
                    msg: &wrapped.ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|e| CustodyError::unwrap_failed(alias.as_str(), e))?,
    );
    if plaintext.len() != 32 {
        return Err(CustodyError::unwrap_failed(
            alias.as_str(),
            format!("data key plaintext is {} bytes", plaintext.len()),
        ));
    }
    let mut buf = [0u8; 32];
    buf.copy_from_slice(&plaintext);
    let key = DataKey::from_bytes(buf);
    zeroize::Zeroize::zeroize(&mut buf);
    Ok(key)
}

fn associated_data(alias: &KeyAlias) -> Vec<u8> {
    let mut aad = Vec::with_capacity(WRAP_CONTEXT.len() + alias.as_str().len());
    aad.extend_from_slice(WRAP_CONTEXT);
    aad.extend_from_slice(alias.as_str().as_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (DataKey, MasterKey, MasterKeyId, KeyAlias) {
        (
            DataKey::generate().unwrap(),
            MasterKey::generate().unwrap(),
            MasterKeyId::generate().unwrap(),
            KeyAlias::generate().unwrap(),
        )
    }

    #[test]
    fn wrap_then_unwrap() {
        let (key, master, id, alias) = fixture();
        let wrapped = wrap_key(&key, &master, &id, &alias).unwrap();
        assert_ne!(wrapped.ciphertext[..32], key.as_bytes()[..]);

        let back = unwrap_key(&wrapped, &master, &id, &alias).unwrap();
        assert_eq!(back.as_bytes(), key.as_bytes());
    }

    #[test]
    fn wrong_master_fails() {
        let (key, master, id, alias) = fixture();
        let wrapped = wrap_key(&key, &master, &id, &alias).unwrap();

        let other = MasterKey::generate().unwrap();
        let err = unwrap_key(&wrapped, &other, &id, &alias).unwrap_err();
        assert!(matches!(err, CustodyError::UnwrapFailed { .. }));
    }

    #[test]
    fn retired_master_id_fails() {
        let (key, master, id, alias) = fixture();
        let wrapped = wrap_key(&key, &master, &id, &alias).unwrap();

        let newer = MasterKeyId::generate().unwrap();
        assert!(unwrap_key(&wrapped, &master, &newer, &alias).is_err());
    }

    #[test]
    fn moved_entry_fails() {
        let (key, master, id, alias) = fixture();
        let wrapped = wrap_key(&key, &master, &id, &alias).unwrap();

        let elsewhere = KeyAlias::generate().unwrap();
        assert!(unwrap_key(&wrapped, &master, &id, &elsewhere).is_err());
    }

    #[test]
    fn corrupted_entry_fails() {
        let (key, master, id, alias) = fixture();
        let mut wrapped = wrap_key(&key, &master, &id, &alias).unwrap();
        wrapped.ciphertext[0] ^= 0x01;

        assert!(unwrap_key(&wrapped, &master, &id, &alias).is_err());
    }
}
