//! Install state: the persisted identity and the DHCP config marker.
//!
//! The persisted [`IdentityRecord`] is the source of truth. The marker search
//! in the live DHCP config is kept so a host configured by an earlier run (or
//! by hand) is still recognized as configured.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::identity::IdentityRecord;
use crate::util::{remove_if_exists, write_atomic};
use std::path::PathBuf;

/// Statement prefixes of the static-assignment block, in block order.
pub const STATIC_STATEMENT_PREFIXES: [&str; 4] = [
    "interface ",
    "static ip_address=",
    "static routers=",
    "static domain_name_servers=",
];

/// Reads and writes the persisted [`IdentityRecord`].
pub struct InstallStateStore {
    dhcp_conf: PathBuf,
    identity_file: PathBuf,
}

impl InstallStateStore {
    /// Creates a store for the paths in `config`.
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            dhcp_conf: config.dhcp_conf.clone(),
            identity_file: config.identity_file.clone(),
        }
    }

    /// Returns `true` if the live DHCP config carries an uncommented static
    /// address statement.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Io`] if the DHCP config cannot be read.
    pub fn is_configured(&self) -> Result<bool> {
        let content = std::fs::read_to_string(&self.dhcp_conf)?;
        Ok(has_static_marker(&content))
    }

    /// Returns `true` if an identity record is persisted.
    #[must_use]
    pub fn has_record(&self) -> bool {
        self.identity_file.is_file()
    }

    /// Persists `record`, replacing any previous one atomically.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidIdentity`] if the record is invalid, or
    /// an I/O / serialization error.
    pub fn save(&self, record: &IdentityRecord) -> Result<()> {
        record.validate()?;
        let json = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.identity_file, &json)?;
        tracing::info!(
            static_ip = %record.static_ip,
            resolver = %record.resolver,
            path = %self.identity_file.display(),
            "Saved identity record"
        );
        Ok(())
    }

    /// Loads the persisted record.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotConfigured`] if no record exists (or the file
    /// is empty), [`EngineError::Json`] if it is malformed, and
    /// [`EngineError::InvalidIdentity`] if it violates its invariants.
    pub fn load(&self) -> Result<IdentityRecord> {
        let content = match std::fs::read_to_string(&self.identity_file) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::NotConfigured);
            }
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Err(EngineError::NotConfigured);
        }
        let record: IdentityRecord = serde_json::from_str(&content)?;
        record.validate()?;
        Ok(record)
    }

    /// Deletes the persisted record. Missing records are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Io`] if the file exists but cannot be removed.
    pub fn clear(&self) -> Result<()> {
        if remove_if_exists(&self.identity_file)? {
            tracing::info!(path = %self.identity_file.display(), "Removed identity record");
        }
        Ok(())
    }
}

/// Uncommented `static ip_address=` statement anywhere in `content`.
pub(crate) fn has_static_marker(content: &str) -> bool {
    content
        .lines()
        .map(str::trim_start)
        .any(|l| l.starts_with(STATIC_STATEMENT_PREFIXES[1]))
}
