use std::{path::PathBuf, time::Duration};

use crate::{
    crypto::aead::NonceTransport,
    error::{CustodyError, CustodyResult},
    lifecycle::LifecycleConfig,
    store::file::KdfParams,
    token::DEFAULT_TOKEN_LIFETIME,
};

pub const ENV_KEYSTORE: &str = "KEYCUSTODY_KEYSTORE";
pub const ENV_PASSWORD_VAR: &str = "KEYCUSTODY_PASSWORD_VAR";
pub const DEFAULT_PASSWORD_VAR: &str = "KEYCUSTODY_KEYSTORE_PASSWORD";
pub const ENV_KEY_TTL: &str = "KEYCUSTODY_KEY_TTL_SECS";
pub const ENV_SWEEP_INTERVAL: &str = "KEYCUSTODY_SWEEP_INTERVAL_SECS";
pub const ENV_ROTATION_INTERVAL: &str = "KEYCUSTODY_ROTATION_INTERVAL_SECS";
pub const ENV_TOKEN_LIFETIME: &str = "KEYCUSTODY_TOKEN_LIFETIME_SECS";
pub const ENV_NONCE_TRANSPORT: &str = "KEYCUSTODY_NONCE_TRANSPORT";
pub const ENV_KDF_M_COST: &str = "KEYCUSTODY_KDF_M_COST";
pub const ENV_KDF_T_COST: &str = "KEYCUSTODY_KDF_T_COST";
pub const ENV_KDF_P_COST: &str = "KEYCUSTODY_KDF_P_COST";

/// Operational settings. The password itself is never held here, only the
/// name of the variable it is read from on each keystore access.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub keystore_path: PathBuf,
    pub password_var: String,
    pub kdf: KdfParams,
    pub lifecycle: LifecycleConfig,
    pub token_lifetime: Duration,
    pub nonce_transport: NonceTransport,
}

impl Config {
    pub fn new(keystore_path: impl Into<PathBuf>) -> Self {
        Self {
            keystore_path: keystore_path.into(),
            password_var: DEFAULT_PASSWORD_VAR.into(),
            kdf: KdfParams::default(),
            lifecycle: LifecycleConfig::default(),
            token_lifetime: DEFAULT_TOKEN_LIFETIME,
            nonce_transport: NonceTransport::default(),
        }
    }

    pub fn from_env() -> CustodyResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any name → value lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> CustodyResult<Self> {
        let path = lookup(ENV_KEYSTORE)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| CustodyError::Config(format!("{ENV_KEYSTORE} is not set")))?;
        let mut config = Self::new(path);

        if let Some(var) = lookup(ENV_PASSWORD_VAR).filter(|v| !v.is_empty()) {
            config.password_var = var;
        }
        if let Some(ttl) = secs(&lookup, ENV_KEY_TTL)? {
            config.lifecycle.key_ttl = ttl;
        }
        if let Some(interval) = secs(&lookup, ENV_SWEEP_INTERVAL)? {
            config.lifecycle.sweep_interval = interval;
        }
        if let Some(interval) = secs(&lookup, ENV_ROTATION_INTERVAL)? {
            config.lifecycle.rotation_interval = interval;
        }
        if let Some(lifetime) = secs(&lookup, ENV_TOKEN_LIFETIME)? {
            config.token_lifetime = lifetime;
        }
        if let Some(transport) = lookup(ENV_NONCE_TRANSPORT) {
            config.nonce_transport = transport.parse()?;
        }

        let m_cost = number(&lookup, ENV_KDF_M_COST)?.unwrap_or(config.kdf.m_cost);
        let t_cost = number(&lookup, ENV_KDF_T_COST)?.unwrap_or(config.kdf.t_cost);
        let p_cost = number(&lookup, ENV_KDF_P_COST)?.unwrap_or(config.kdf.p_cost);
        config.kdf = KdfParams::new(m_cost, t_cost, p_cost)?;

        Ok(config)
    }
}

fn number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> CustodyResult<Option<T>> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CustodyError::Config(format!("{name}: '{raw}' is not a number"))),
    }
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> CustodyResult<Option<Duration>> {
    match number::<u64>(lookup, name)? {
        Some(0) => Err(CustodyError::Config(format!("{name} must be positive"))),
        other => Ok(other.map(Duration::from_secs)),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply() {
        let config = Config::from_lookup(lookup(&[(ENV_KEYSTORE, "/var/lib/keys.ks")])).unwrap();
        assert_eq!(config.keystore_path, PathBuf::from("/var/lib/keys.ks"));
        assert_eq!(config.password_var, DEFAULT_PASSWORD_VAR);
        assert_eq!(config.lifecycle.key_ttl, Duration::from_secs(3600));
        assert_eq!(config.lifecycle.rotation_interval, Duration::from_secs(86400));
        assert_eq!(config.token_lifetime, Duration::from_secs(3600));
        assert_eq!(config.nonce_transport, NonceTransport::Embedded);
    }

    #[test]
    fn overrides_apply() {
        let config = Config::from_lookup(lookup(&[
            (ENV_KEYSTORE, "keys.ks"),
            (ENV_PASSWORD_VAR, "VAULT_PW"),
            (ENV_KEY_TTL, "120"),
            (ENV_SWEEP_INTERVAL, "60"),
            (ENV_ROTATION_INTERVAL, "600"),
            (ENV_TOKEN_LIFETIME, "90"),
            (ENV_NONCE_TRANSPORT, "registry"),
            (ENV_KDF_M_COST, "64"),
            (ENV_KDF_T_COST, "1"),
        ]))
        .unwrap();
        assert_eq!(config.password_var, "VAULT_PW");
        assert_eq!(config.lifecycle.key_ttl, Duration::from_secs(120));
        assert_eq!(config.lifecycle.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.lifecycle.rotation_interval, Duration::from_secs(600));
        assert_eq!(config.token_lifetime, Duration::from_secs(90));
        assert_eq!(config.nonce_transport, NonceTransport::Registry);
        assert_eq!(config.kdf.m_cost, 64);
        assert_eq!(config.kdf.t_cost, 1);
    }

    #[test]
    fn missing_keystore_is_an_error() {
        assert!(matches!(
            Config::from_lookup(lookup(&[])),
            Err(CustodyError::Config(_))
        ));
    }

    #[test]
    fn bad_numbers_are_errors() {
        assert!(Config::from_lookup(lookup(&[(ENV_KEYSTORE, "k"), (ENV_KEY_TTL, "soon")])).is_err());
        assert!(Config::from_lookup(lookup(&[(ENV_KEYSTORE, "k"), (ENV_KEY_TTL, "0")])).is_err());
        assert!(
            Config::from_lookup(lookup(&[(ENV_KEYSTORE, "k"), (ENV_NONCE_TRANSPORT, "udp")])).is_err()
        );
    }
}
