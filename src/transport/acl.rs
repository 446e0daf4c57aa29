//! Source-address access control for timing, management and monitoring flows.
//!
//! Two evaluation orders, named after Apache httpd:
//! allow-deny defaults closed, deny-allow defaults open.

use crate::config::{AclConfig, AclOrder};
use crate::error::ConfigError;
use std::net::{IpAddr, Ipv4Addr};

/// One IPv4 CIDR entry. Matching is `(addr & mask) == network`.
#[derive(Debug, Clone)]
pub struct AclEntry {
    network: u32,
    prefix: u8,
    mask: u32,
    hits: u64,
}

impl AclEntry {
    pub fn parse(entry: &str) -> Result<Self, ConfigError> {
        let (addr_part, prefix) = match entry.split_once('/') {
            Some((a, p)) => {
                let prefix: u8 =
                    p.parse().map_err(|_| ConfigError::BadAcl(entry.to_string()))?;
                if prefix > 32 {
                    return Err(ConfigError::BadAcl(entry.to_string()));
                }
                (a, prefix)
            }
            None => (entry, 32),
        };
        let addr: Ipv4Addr =
            addr_part.parse().map_err(|_| ConfigError::BadAcl(entry.to_string()))?;
        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        Ok(AclEntry { network: u32::from(addr) & mask, prefix, mask, hits: 0 })
    }

    fn matches(&mut self, addr: u32) -> bool {
        if addr & self.mask == self.network {
            self.hits += 1;
            true
        } else {
            false
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }
}

/// Compiled ACL: both lists sorted by network for deterministic iteration.
#[derive(Debug, Clone, Default)]
pub struct Acl {
    order: AclOrder,
    allow: Vec<AclEntry>,
    deny: Vec<AclEntry>,
    enabled: bool,
}

impl Acl {
    pub fn compile(config: &AclConfig) -> Result<Self, ConfigError> {
        let mut allow = config
            .allow
            .iter()
            .map(|s| AclEntry::parse(s))
            .collect::<Result<Vec<_>, _>>()?;
        let mut deny = config
            .deny
            .iter()
            .map(|s| AclEntry::parse(s))
            .collect::<Result<Vec<_>, _>>()?;
        allow.sort_by_key(|e| (e.network, e.prefix));
        deny.sort_by_key(|e| (e.network, e.prefix));
        Ok(Acl { order: config.order, allow, deny, enabled: !config.is_empty() })
    }

    /// Disabled ACLs (no entries configured) pass everything.
    pub fn permits(&mut self, addr: IpAddr) -> bool {
        if !self.enabled {
            return true;
        }
        let v4 = match addr {
            IpAddr::V4(a) => u32::from(a),
            // CIDR entries are IPv4; v6 peers fall through to the default.
            IpAddr::V6(_) => {
                return matches!(self.order, AclOrder::DenyAllow);
            }
        };
        let in_allow = self.allow.iter_mut().any(|e| e.matches(v4));
        let in_deny = self.deny.iter_mut().any(|e| e.matches(v4));
        match self.order {
            AclOrder::AllowDeny => in_allow && !in_deny,
            AclOrder::DenyAllow => !(in_deny && !in_allow),
        }
    }

    pub fn total_hits(&self) -> u64 {
        self.allow.iter().map(AclEntry::hits).sum::<u64>()
            + self.deny.iter().map(AclEntry::hits).sum::<u64>()
    }
}
