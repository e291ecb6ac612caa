//! The persisted static network identity.

use crate::discovery::NetworkTopology;
use crate::error::{EngineError, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Which address the host should use for name resolution after the switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverChoice {
    /// The host's own static address (the local resolver answers).
    SelfHosted,
    /// The resolver the host used before.
    Original,
}

/// Static identity chosen on first configuration.
///
/// Serialized as JSON with six required fields plus an optional `interface`:
///
/// ```json
/// {"router":"192.168.1.1","subnet":"192.168.1.0/24","original_ip":"192.168.1.23",
///  "original_resolver":"192.168.1.1","static_ip":"192.168.1.2","resolver":"192.168.1.2"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Default gateway.
    pub router: Ipv4Addr,
    /// Subnet the static address lives in.
    pub subnet: Ipv4Network,
    /// Address leased before the switch.
    pub original_ip: Ipv4Addr,
    /// Resolver used before the switch.
    pub original_resolver: Ipv4Addr,
    /// Chosen static address.
    pub static_ip: Ipv4Addr,
    /// Resolver announced for the host: `static_ip` or `original_resolver`.
    pub resolver: Ipv4Addr,
    /// Interface receiving the static assignment.
    #[serde(default = "default_interface")]
    pub interface: String,
}

fn default_interface() -> String {
    "eth0".to_string()
}

impl IdentityRecord {
    /// Builds a record from a topology and an allocated address.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidIdentity`] if the result violates
    /// [`validate`](Self::validate).
    pub fn new(topology: &NetworkTopology, static_ip: Ipv4Addr, choice: ResolverChoice) -> Result<Self> {
        let resolver = match choice {
            ResolverChoice::SelfHosted => static_ip,
            ResolverChoice::Original => topology.original_resolver,
        };
        let record = Self {
            router: topology.router,
            subnet: topology.subnet,
            original_ip: topology.original_ip,
            original_resolver: topology.original_resolver,
            static_ip,
            resolver,
            interface: topology.interface.clone(),
        };
        record.validate()?;
        Ok(record)
    }

    /// Returns the record with its resolver switched to `choice`.
    #[must_use]
    pub const fn with_resolver(mut self, choice: ResolverChoice) -> Self {
        self.resolver = match choice {
            ResolverChoice::SelfHosted => self.static_ip,
            ResolverChoice::Original => self.original_resolver,
        };
        self
    }

    /// Which resolver the record announces.
    ///
    /// When the static address equals the original resolver both readings
    /// hold; self-hosting wins.
    #[must_use]
    pub fn resolver_choice(&self) -> ResolverChoice {
        if self.resolver == self.static_ip {
            ResolverChoice::SelfHosted
        } else {
            ResolverChoice::Original
        }
    }

    /// Checks the record's invariants.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidIdentity`] if the static address is
    /// outside the subnet or equals the router, or if the resolver is neither
    /// the static address nor the original resolver.
    pub fn validate(&self) -> Result<()> {
        if !self.subnet.contains(self.static_ip) {
            return Err(EngineError::InvalidIdentity(format!(
                "static address {} outside {}",
                self.static_ip, self.subnet
            )));
        }
        if self.static_ip == self.router {
            return Err(EngineError::InvalidIdentity(format!(
                "static address {} is the router",
                self.static_ip
            )));
        }
        if self.resolver != self.static_ip && self.resolver != self.original_resolver {
            return Err(EngineError::InvalidIdentity(format!(
                "resolver {} is neither {} nor {}",
                self.resolver, self.static_ip, self.original_resolver
            )));
        }
        if self.interface.trim().is_empty() {
            return Err(EngineError::InvalidIdentity("empty interface name".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology() -> NetworkTopology {
        NetworkTopology {
            router: Ipv4Addr::new(192, 168, 1, 1),
            subnet: "192.168.1.0/24".parse().unwrap(),
            original_ip: Ipv4Addr::new(192, 168, 1, 23),
            original_resolver: Ipv4Addr::new(192, 168, 1, 1),
            interface: "eth0".into(),
        }
    }

    #[test]
    fn resolver_follows_choice() {
        let ip = Ipv4Addr::new(192, 168, 1, 2);
        let own = IdentityRecord::new(&topology(), ip, ResolverChoice::SelfHosted).unwrap();
        assert_eq!(own.resolver, ip);
        assert_eq!(own.resolver_choice(), ResolverChoice::SelfHosted);

        let orig = own.with_resolver(ResolverChoice::Original);
        assert_eq!(orig.resolver, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(orig.resolver_choice(), ResolverChoice::Original);
    }

    #[test]
    fn rejects_address_outside_subnet() {
        let err = IdentityRecord::new(&topology(), Ipv4Addr::new(10, 0, 0, 2), ResolverChoice::Original)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidIdentity(_)));
    }

    #[test]
    fn rejects_router_as_static() {
        assert!(
            IdentityRecord::new(&topology(), Ipv4Addr::new(192, 168, 1, 1), ResolverChoice::Original)
                .is_err()
        );
    }

    #[test]
    fn rejects_third_resolver() {
        let mut r =
            IdentityRecord::new(&topology(), Ipv4Addr::new(192, 168, 1, 2), ResolverChoice::Original)
                .unwrap();
        r.resolver = Ipv4Addr::new(8, 8, 8, 8);
        assert!(r.validate().is_err());
    }

    #[test]
    fn json_uses_canonical_notation_and_defaults_interface() {
        let json = r#"{"router":"192.168.1.1","subnet":"192.168.1.0/24","original_ip":"192.168.1.23",
            "original_resolver":"192.168.1.1","static_ip":"192.168.1.2","resolver":"192.168.1.2"}"#;
        let r: IdentityRecord = serde_json::from_str(json).unwrap();
        assert_eq!(r.interface, "eth0");
        assert_eq!(r.subnet.prefix(), 24);

        let out = serde_json::to_string(&r).unwrap();
        assert!(out.contains(r#""subnet":"192.168.1.0/24""#));
        assert!(out.contains(r#""static_ip":"192.168.1.2""#));
    }

    #[test]
    fn missing_field_is_rejected() {
        let json = r#"{"router":"192.168.1.1","subnet":"192.168.1.0/24"}"#;
        assert!(serde_json::from_str::<IdentityRecord>(json).is_err());
    }
}
