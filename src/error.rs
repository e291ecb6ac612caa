//! Error types.

use ipnetwork::Ipv4Network;
use thiserror::Error;

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem I/O failed (typically `PermissionDenied` under `/etc`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted JSON document could not be read or written.
    #[error("malformed document: {0}")]
    Json(#[from] serde_json::Error),

    /// An external command could not be spawned or exited unsuccessfully.
    #[error("command `{command}` failed: {detail}")]
    Command {
        /// The command line that was run.
        command: String,
        /// Exit status and captured stderr.
        detail: String,
    },

    /// Routing or resolver state could not be read. Aborts the run.
    #[error("network discovery failed: {0}")]
    Discovery(String),

    /// Every host address in the subnet is taken.
    #[error("no free host address left in {subnet}")]
    AllocationExhausted {
        /// The scanned subnet.
        subnet: Ipv4Network,
    },

    /// Network services failed to come back after a DHCP config change.
    /// The DHCP config has already been restored from its backup.
    #[error("network reconfiguration failed (original dhcp config restored): {0}")]
    Reconfiguration(String),

    /// The resolver rejected the rendered configuration.
    #[error("resolver configuration rejected:\n{diagnostics}")]
    ConfigInvalid {
        /// Validator output.
        diagnostics: String,
    },

    /// The resolver or forwarding process could not be reloaded.
    #[error("resolver reload failed: {0}")]
    ReloadFailed(String),

    /// Reverting the static identity failed; manual intervention required.
    #[error("revert failed, restart dhcpcd and networking manually: {0}")]
    Revert(String),

    /// No identity has been persisted yet.
    #[error("static identity not configured")]
    NotConfigured,

    /// A template placeholder survived rendering.
    #[error("unresolved template placeholder: {token}")]
    UnresolvedPlaceholder {
        /// The placeholder, braces included.
        token: String,
    },

    /// An identity record violates its invariants.
    #[error("invalid identity record: {0}")]
    InvalidIdentity(String),

    /// The policy document is unusable.
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    /// Another engine process holds the lock.
    #[error("another dns-firewall run is in progress ({})", describe_holder(.pid))]
    Locked {
        /// PID recorded in the lock file; `None` if not written yet.
        pid: Option<u32>,
    },

    /// A termination request was observed between steps.
    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    /// Returns `true` if the underlying I/O error is `PermissionDenied`.
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied)
    }

    /// Returns `true` for the benign "nothing persisted yet" condition.
    #[must_use]
    pub const fn is_not_configured(&self) -> bool {
        matches!(self, Self::NotConfigured)
    }
}

#[allow(clippy::ref_option)]
fn describe_holder(pid: &Option<u32>) -> String {
    pid.map_or_else(|| "holder still starting".to_string(), |pid| format!("pid={pid}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_is_detected() {
        let e = EngineError::from(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(e.is_permission_denied());
        assert!(!EngineError::NotConfigured.is_permission_denied());
    }

    #[test]
    fn exhaustion_names_subnet() {
        let subnet: Ipv4Network = "192.0.2.0/30".parse().unwrap();
        let e = EngineError::AllocationExhausted { subnet };
        assert_eq!(e.to_string(), "no free host address left in 192.0.2.0/30");
    }

    #[test]
    fn locked_names_holder_when_known() {
        let known = EngineError::Locked { pid: Some(4242) };
        assert_eq!(known.to_string(), "another dns-firewall run is in progress (pid=4242)");
        let starting = EngineError::Locked { pid: None };
        assert!(starting.to_string().contains("holder still starting"));
    }
}
