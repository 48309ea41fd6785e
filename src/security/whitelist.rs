use std::{net::IpAddr, path::Path};

use ipnet::IpNet;

use crate::error::ServiceError;

/// Addresses and CIDR ranges allowed to reach the API.
#[derive(Debug, Clone, Default)]
pub struct OriginWhitelist {
    entries: Vec<IpNet>,
}

impl OriginWhitelist {
    /// Returns `None` if the file does not exist. A line that is neither an
    /// address nor a CIDR range fails the load.
    pub fn load(path: &Path) -> Result<Option<Self>, ServiceError> {
        let Some(lines) = super::read_entries(path)? else {
            return Ok(None);
        };
        let mut entries = Vec::with_capacity(lines.len());
        for (lineno, line) in lines {
            let entry = parse_entry(&line).ok_or_else(|| {
                ServiceError::Config(format!(
                    "{}:{lineno}: invalid whitelist entry `{line}`",
                    path.display()
                ))
            })?;
            entries.push(entry);
        }
        Ok(Some(Self { entries }))
    }

    pub fn parse<'a, I>(lines: I) -> Result<Self, ServiceError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let entries = lines
            .into_iter()
            .map(|line| {
                parse_entry(line).ok_or_else(|| {
                    ServiceError::Config(format!("invalid whitelist entry `{line}`"))
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { entries })
    }

    pub fn is_allowed(&self, addr: IpAddr) -> bool {
        let addr = addr.to_canonical();
        self.entries.iter().any(|net| net.contains(&addr))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_entry(raw: &str) -> Option<IpNet> {
    let raw = raw.trim();
    if raw.contains('/') {
        return raw.parse::<IpNet>().ok().map(|net| net.trunc());
    }
    let addr: IpAddr = raw.parse().ok()?;
    let addr = addr.to_canonical();
    let prefix = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    IpNet::new(addr, prefix).ok()
}
