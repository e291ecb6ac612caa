//! Filtering policy document.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;

/// Forwarder entry replaced by the identity's original resolver.
pub const ORIGINAL_RESOLVER_SENTINEL: &str = "original_resolver";

/// Resolution policy applied to the resolver.
///
/// ```json
/// {
///   "forwarders": ["original_resolver"],
///   "forward_over_tls": false,
///   "block_zones": ["db.malware", "db.ads"],
///   "whitelist_domains": ["example.com"]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    /// Upstream resolvers in order of preference.
    pub forwarders: Vec<String>,
    /// Relay upstream queries through the local TLS forwarder.
    pub forward_over_tls: bool,
    /// Response-policy zones pulled from a remote authority.
    pub block_zones: Vec<String>,
    /// Domains exempt from blocking.
    pub whitelist_domains: Vec<String>,
    /// Primaries the block zones are transferred from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub zone_masters: Vec<Ipv4Addr>,
}

impl Default for PolicyDocument {
    fn default() -> Self {
        Self {
            forwarders: vec![ORIGINAL_RESOLVER_SENTINEL.to_string()],
            forward_over_tls: false,
            block_zones: Vec::new(),
            whitelist_domains: Vec::new(),
            zone_masters: Vec::new(),
        }
    }
}

impl PolicyDocument {
    /// Reads and validates the document at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Io`] if the file cannot be read,
    /// [`EngineError::Json`] if a required field is missing or mistyped, and
    /// [`EngineError::InvalidPolicy`] if [`validate`](Self::validate) fails.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let policy: Self = serde_json::from_str(&content)?;
        policy.validate()?;
        tracing::debug!(
            path = %path.display(),
            forwarders = policy.forwarders.len(),
            block_zones = policy.block_zones.len(),
            whitelist = policy.whitelist_domains.len(),
            tls = policy.forward_over_tls,
            "Loaded policy"
        );
        Ok(policy)
    }

    /// Checks that forwarders are IPv4 addresses or the sentinel, and that
    /// zone and domain names are non-empty and free of quoting or statement
    /// characters.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidPolicy`] naming the offending entry.
    pub fn validate(&self) -> Result<()> {
        if self.forwarders.is_empty() {
            return Err(EngineError::InvalidPolicy("no forwarders".to_string()));
        }
        for f in &self.forwarders {
            if f != ORIGINAL_RESOLVER_SENTINEL && f.parse::<Ipv4Addr>().is_err() {
                return Err(EngineError::InvalidPolicy(format!("forwarder {f:?} is not an IPv4 address")));
            }
        }
        if self.forward_over_tls && self.forwarders[0] == ORIGINAL_RESOLVER_SENTINEL {
            return Err(EngineError::InvalidPolicy(
                "forward_over_tls needs an explicit upstream as first forwarder".to_string(),
            ));
        }
        for name in self.block_zones.iter().chain(&self.whitelist_domains) {
            if !is_domain_like(name) {
                return Err(EngineError::InvalidPolicy(format!("invalid name {name:?}")));
            }
        }
        Ok(())
    }
}

fn is_domain_like(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '*'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, json: &str) -> std::path::PathBuf {
        let path = dir.join("fw.conf.json");
        std::fs::write(&path, json).unwrap();
        path
    }

    #[test]
    fn loads_required_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            r#"{"forwarders":["1.1.1.1","original_resolver"],"forward_over_tls":false,
                "block_zones":["db.a","db.b"],"whitelist_domains":["x.com"]}"#,
        );
        let p = PolicyDocument::load(&path).unwrap();
        assert_eq!(p.forwarders, vec!["1.1.1.1", ORIGINAL_RESOLVER_SENTINEL]);
        assert_eq!(p.block_zones, vec!["db.a", "db.b"]);
        assert!(p.zone_masters.is_empty());
    }

    #[test]
    fn missing_field_is_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), r#"{"forwarders":["1.1.1.1"],"block_zones":[]}"#);
        assert!(matches!(PolicyDocument::load(&path), Err(EngineError::Json(_))));
    }

    #[test]
    fn rejects_bad_forwarder() {
        let p = PolicyDocument {
            forwarders: vec!["dns.google".into()],
            ..PolicyDocument::default()
        };
        assert!(matches!(p.validate(), Err(EngineError::InvalidPolicy(_))));
    }

    #[test]
    fn rejects_statement_injection_in_zone_name() {
        let p = PolicyDocument {
            block_zones: vec![r#"db.a"; zone "evil"#.into()],
            ..PolicyDocument::default()
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn tls_requires_explicit_upstream() {
        let p = PolicyDocument {
            forward_over_tls: true,
            ..PolicyDocument::default()
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn default_forwards_to_original_resolver() {
        let p = PolicyDocument::default();
        p.validate().unwrap();
        assert_eq!(p.forwarders, vec![ORIGINAL_RESOLVER_SENTINEL]);
    }
}
