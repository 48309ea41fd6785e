/// Dev-mode relaxations resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityPolicy {
    pub require_auth: bool,
    pub require_whitelist: bool,
    pub allow_loopback: bool,
}

impl SecurityPolicy {
    /// Dev-mode only relaxes a check whose file is absent: without a key file
    /// authentication is off, without a whitelist file any origin passes.
    /// Loopback callers always pass the origin check in dev-mode.
    pub fn resolve(dev_mode: bool, keys_present: bool, whitelist_present: bool) -> Self {
        Self {
            require_auth: !dev_mode || keys_present,
            require_whitelist: !dev_mode || whitelist_present,
            allow_loopback: dev_mode,
        }
    }
}
