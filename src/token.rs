//! Signed, time-bounded tokens binding a client to a key alias.
//!
//! Tokens are HMAC-signed JWTs: header `{"typ":"JWT","alg":"HS256"}` and
//! claims `{"keyAlias","issuedTo","issuedAt","expiresAt"}`. Expiry is checked
//! against the injected clock, not by `jsonwebtoken`'s validation.

use std::{sync::Arc, time::Duration};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{DecodingKey, EncodingKey};

use crate::{
    clock::Clock,
    crypto::keys::{KeyAlias, SigningKey},
    error::{CustodyError, CustodyResult},
    store::{Entry, Keystore, SIGNING_ALIAS, SharedStore},
};

pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// The only algorithms a token may declare.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Algorithm {
    #[default]
    HS256,
    HS384,
    HS512,
}

impl Algorithm {
    pub const WHITELIST: [Algorithm; 3] = [Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];

    pub fn name(self) -> &'static str {
        match self {
            Algorithm::HS256 => "HS256",
            Algorithm::HS384 => "HS384",
            Algorithm::HS512 => "HS512",
        }
    }

    /// Exact, case-sensitive lookup. `none` and everything else is `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::WHITELIST.into_iter().find(|alg| alg.name() == name)
    }

    fn jwt(self) -> jsonwebtoken::Algorithm {
        match self {
            Algorithm::HS256 => jsonwebtoken::Algorithm::HS256,
            Algorithm::HS384 => jsonwebtoken::Algorithm::HS384,
            Algorithm::HS512 => jsonwebtoken::Algorithm::HS512,
        }
    }
}

/// Header as declared by the presenter, before any trust decision.
#[derive(serde::Deserialize)]
struct DeclaredHeader {
    alg: String,
}

#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key_alias: Option<String>,
    issued_to: String,
    issued_at: u64,
    expires_at: u64,
}

/// Claims of a token that passed every verification stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Claims {
    pub key_alias: KeyAlias,
    pub issued_to: String,
    pub issued_at: u64,
    pub expires_at: u64,
}

pub struct TokenBinder {
    store: Arc<SharedStore>,
    clock: Arc<dyn Clock>,
    algorithm: Algorithm,
    lifetime: Duration,
}

impl TokenBinder {
    pub fn new(store: Arc<SharedStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            algorithm: Algorithm::default(),
            lifetime: DEFAULT_TOKEN_LIFETIME,
        }
    }

    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn issue_token(&self, key_alias: &KeyAlias, issued_to: &str) -> CustodyResult<String> {
        let keystore = self.store.read()?;
        self.issue_token_in(&keystore, key_alias, issued_to)
    }

    /// Mint a token with the signing key held in `keystore`.
    pub fn issue_token_in(
        &self,
        keystore: &Keystore,
        key_alias: &KeyAlias,
        issued_to: &str,
    ) -> CustodyResult<String> {
        let now = self.clock.now();
        let claims = RawClaims {
            key_alias: Some(key_alias.as_str().to_owned()),
            issued_to: issued_to.to_owned(),
            issued_at: now,
            expires_at: now.saturating_add(self.lifetime.as_secs()),
        };
        let key = signing_key(keystore)?;
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(self.algorithm.jwt()),
            &claims,
            &EncodingKey::from_secret(key.as_bytes()),
        )
        .map_err(|e| CustodyError::cipher(format!("token signing failed: {e}")))
    }

    pub fn verify_token(&self, token: &str) -> CustodyResult<Claims> {
        let keystore = self.store.read()?;
        self.verify_token_in(&keystore, token)
    }

    /// Verify `token` in fixed order: structure, signature, expiry,
    /// algorithm, alias claim. The first failing stage decides the error.
    pub fn verify_token_in(&self, keystore: &Keystore, token: &str) -> CustodyResult<Claims> {
        // 1. structure
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 || parts[0].is_empty() || parts[1].is_empty() {
            return Err(CustodyError::malformed("expected header.claims.signature"));
        }
        let header: DeclaredHeader = decode_json(parts[0], "header")?;
        let claims: RawClaims = decode_json(parts[1], "claims")?;
        if URL_SAFE_NO_PAD.decode(parts[2]).is_err() {
            return Err(CustodyError::malformed("signature is not base64url"));
        }

        // 2. signature
        let signed = &token[..parts[0].len() + 1 + parts[1].len()];
        let mac_alg = Algorithm::from_name(&header.alg).unwrap_or(self.algorithm);
        let key = signing_key(keystore)?;
        let valid = jsonwebtoken::crypto::verify(
            parts[2],
            signed.as_bytes(),
            &DecodingKey::from_secret(key.as_bytes()),
            mac_alg.jwt(),
        )
        .unwrap_or(false);
        if !valid {
            log::warn!("token rejected: bad signature (issuedTo={})", claims.issued_to);
            return Err(CustodyError::BadSignature);
        }

        // 3. expiry
        if self.clock.now() >= claims.expires_at {
            return Err(CustodyError::Expired);
        }

        // 4. algorithm whitelist
        if Algorithm::from_name(&header.alg).is_none() {
            log::warn!("token rejected: algorithm '{}' not allowed", header.alg);
            return Err(CustodyError::InsecureAlgorithm(header.alg));
        }

        // 5. alias claim
        let raw_alias = claims
            .key_alias
            .ok_or_else(|| CustodyError::malformed("missing keyAlias claim"))?;
        let key_alias = KeyAlias::parse(&raw_alias)?;

        Ok(Claims {
            key_alias,
            issued_to: claims.issued_to,
            issued_at: claims.issued_at,
            expires_at: claims.expires_at,
        })
    }
}

fn signing_key(keystore: &Keystore) -> CustodyResult<&SigningKey> {
    match keystore.get_entry(SIGNING_ALIAS) {
        Some(Entry::Signing { key, .. }) => Ok(key),
        _ => Err(CustodyError::StoreUnavailable(
            "token signing key missing from keystore".into(),
        )),
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(segment: &str, what: &str) -> CustodyResult<T> {
    let raw = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| CustodyError::malformed(format!("{what} is not base64url")))?;
    serde_json::from_slice(&raw).map_err(|e| CustodyError::malformed(format!("{what}: {e}")))
}
