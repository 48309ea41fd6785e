//! Caller authentication and network-origin checks.
//!
//! Both checks read immutable sets built once at startup and consult a single
//! [`SecurityPolicy`] for the dev-mode relaxations.

mod credentials;
mod policy;
mod whitelist;

use std::{fs, io, net::IpAddr, path::Path};

use crate::{config::AppConfig, error::ServiceError};

pub use credentials::CredentialStore;
pub use policy::SecurityPolicy;
pub use whitelist::OriginWhitelist;

/// Everything the request pipeline needs to admit or reject a caller.
#[derive(Debug, Clone)]
pub struct AccessControl {
    policy: SecurityPolicy,
    credentials: CredentialStore,
    whitelist: OriginWhitelist,
}

impl AccessControl {
    pub fn new(
        policy: SecurityPolicy,
        credentials: CredentialStore,
        whitelist: OriginWhitelist,
    ) -> Self {
        Self {
            policy,
            credentials,
            whitelist,
        }
    }

    /// Loads the key and whitelist files named in `config`. Outside dev-mode a
    /// missing file is fatal.
    pub fn load(config: &AppConfig) -> Result<Self, ServiceError> {
        let keys = CredentialStore::load(&config.api_keys_path)?;
        let keys_present = keys.is_some();
        let credentials = match keys {
            Some(store) => store,
            None if config.dev_mode => {
                tracing::warn!(
                    path = %config.api_keys_path.display(),
                    "api key file missing, authentication disabled in dev mode"
                );
                CredentialStore::default()
            }
            None => {
                return Err(ServiceError::Config(format!(
                    "api key file missing: {}",
                    config.api_keys_path.display()
                )));
            }
        };

        let whitelist = OriginWhitelist::load(&config.whitelist_path)?;
        if whitelist.is_none() && !config.dev_mode {
            return Err(ServiceError::Config(format!(
                "whitelist file missing: {}",
                config.whitelist_path.display()
            )));
        }

        let policy = SecurityPolicy::resolve(config.dev_mode, keys_present, whitelist.is_some());
        tracing::info!(
            keys = credentials.len(),
            whitelist_entries = whitelist.as_ref().map(|w| w.len()).unwrap_or(0),
            require_auth = policy.require_auth,
            require_whitelist = policy.require_whitelist,
            "access control loaded"
        );

        Ok(Self::new(policy, credentials, whitelist.unwrap_or_default()))
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    pub fn authenticate(&self, key: Option<&str>) -> Result<(), ServiceError> {
        if !self.policy.require_auth {
            return Ok(());
        }
        match key {
            Some(key) if self.credentials.is_valid(key) => Ok(()),
            _ => Err(ServiceError::Unauthorized),
        }
    }

    pub fn authorize_origin(&self, peer: Option<IpAddr>) -> Result<(), ServiceError> {
        if !self.policy.require_whitelist {
            return Ok(());
        }
        let Some(peer) = peer.map(|ip| ip.to_canonical()) else {
            return Err(ServiceError::OriginRejected(None));
        };
        if self.policy.allow_loopback && peer.is_loopback() {
            return Ok(());
        }
        if self.whitelist.is_allowed(peer) {
            Ok(())
        } else {
            Err(ServiceError::OriginRejected(Some(peer)))
        }
    }
}

/// Reads a line-delimited configuration file, skipping blanks and `#` comments.
/// Returns `None` when the file does not exist.
fn read_entries(path: &Path) -> Result<Option<Vec<(usize, String)>>, ServiceError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let entries = contents
        .lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(lineno, line)| (lineno, line.to_string()))
        .collect();
    Ok(Some(entries))
}
