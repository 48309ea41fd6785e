use std::{collections::HashSet, path::Path};

use crate::error::ServiceError;

/// API keys accepted in the `X-API-Key` header.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    keys: HashSet<String>,
}

impl CredentialStore {
    /// Returns `None` if the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ServiceError> {
        let Some(entries) = super::read_entries(path)? else {
            return Ok(None);
        };
        Ok(Some(Self::from_keys(
            entries.iter().map(|(_, key)| key.as_str()),
        )))
    }

    pub fn from_keys<'a, I>(keys: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        Self {
            keys: keys
                .into_iter()
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn is_valid(&self, key: &str) -> bool {
        let key = key.trim();
        !key.is_empty() && self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
