//! Engine configuration.
//!
//! Every path, service name, and timing knob the engine touches lives in
//! [`EngineConfig`]. Components borrow it; nothing reads global state.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// systemd unit names driven by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceNames {
    /// DHCP client daemon.
    pub dhcp_client: String,
    /// General networking service.
    pub networking: String,
    /// DNS resolver daemon.
    pub resolver: String,
    /// Local DNS-over-TLS forwarding process.
    pub forwarder: String,
}

impl Default for ServiceNames {
    fn default() -> Self {
        Self {
            dhcp_client: "dhcpcd".to_string(),
            networking: "networking".to_string(),
            resolver: "bind9".to_string(),
            forwarder: "stunnel4".to_string(),
        }
    }
}

/// Immutable engine configuration.
///
/// # Example
///
/// ```
/// use dns_firewall::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig::with_root("/tmp/fw-test")
///     .with_restart_attempts(5)
///     .with_retry_delay(Duration::ZERO);
///
/// assert_eq!(config.dhcp_conf.to_str(), Some("/tmp/fw-test/etc/dhcpcd.conf"));
/// assert_eq!(config.restart_attempts, 5);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Live DHCP client configuration.
    pub dhcp_conf: PathBuf,
    /// Pre-mutation copy of [`dhcp_conf`](Self::dhcp_conf).
    pub dhcp_conf_backup: PathBuf,
    /// Persisted [`IdentityRecord`](crate::IdentityRecord).
    pub identity_file: PathBuf,
    /// Persisted [`PolicyDocument`](crate::PolicyDocument).
    pub policy_file: PathBuf,
    /// Live resolver configuration.
    pub resolver_conf: PathBuf,
    /// Where a rendered resolver config is validated before going live.
    pub resolver_conf_staged: PathBuf,
    /// Pristine resolver configuration saved on first apply.
    pub resolver_conf_original: PathBuf,
    /// Generated response-policy zone holding whitelist exceptions.
    pub passthru_zone_file: PathBuf,
    /// Config of the local encrypted-forwarding process.
    pub forwarder_conf: PathBuf,
    /// Directory receiving slave-zone cache files.
    pub zone_cache_dir: PathBuf,
    /// Directory listing network interfaces.
    pub net_class_dir: PathBuf,
    /// Resolver list of the host before the engine ran.
    pub resolv_conf: PathBuf,
    /// Process-wide lock file.
    pub lock_file: PathBuf,
    /// Custom base template for the resolver config.
    pub template_file: Option<PathBuf>,
    /// systemd units.
    pub services: ServiceNames,
    /// Interface used when the route table does not name one.
    pub default_interface: String,
    /// Attempts of the networking restart/health-check cycle.
    pub restart_attempts: u32,
    /// Fixed pause between restart attempts.
    pub retry_delay: Duration,
    /// Pause after an identity change before continuing.
    pub settle_delay: Duration,
    /// Per-host timeout handed to the host scanner.
    pub scan_host_timeout: Duration,
    /// Listen address of the local encrypted forwarder.
    pub forwarder_addr: Ipv4Addr,
    /// Listen port of the local encrypted forwarder.
    pub forwarder_port: u16,
    /// Upstream DNS-over-TLS port.
    pub upstream_tls_port: u16,
    /// Whether to look up the router's PTR names for forward zones.
    pub lookup_router_names: bool,
}

impl EngineConfig {
    /// Creates a config with every path rooted at `/`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_root("/")
    }

    /// Creates a config with every path rebased under `root` (useful for testing).
    #[must_use]
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let at = |p: &str| root.join(p);
        Self {
            dhcp_conf: at("etc/dhcpcd.conf"),
            dhcp_conf_backup: at("etc/dhcpcd.conf.original"),
            identity_file: at("etc/dns-fw/static_ip.info.json"),
            policy_file: at("etc/dns-fw/fw.conf.json"),
            resolver_conf: at("etc/bind/named.conf"),
            resolver_conf_staged: at("etc/bind/named.conf.staged"),
            resolver_conf_original: at("etc/bind/named.conf.original"),
            passthru_zone_file: at("etc/bind/db.passthru"),
            forwarder_conf: at("etc/stunnel/dot.conf"),
            zone_cache_dir: at("var/cache/named"),
            net_class_dir: at("sys/class/net"),
            resolv_conf: at("etc/resolv.conf"),
            lock_file: at("run/dns-firewall.lock"),
            template_file: None,
            services: ServiceNames::default(),
            default_interface: "eth0".to_string(),
            restart_attempts: 3,
            retry_delay: Duration::from_secs(2),
            settle_delay: Duration::from_secs(10),
            scan_host_timeout: Duration::from_secs(5),
            forwarder_addr: Ipv4Addr::LOCALHOST,
            forwarder_port: 10853,
            upstream_tls_port: 853,
            lookup_router_names: true,
        }
    }

    /// Overrides the number of restart attempts (at least one is always made).
    #[must_use]
    pub const fn with_restart_attempts(mut self, attempts: u32) -> Self {
        self.restart_attempts = attempts;
        self
    }

    /// Overrides the pause between restart attempts.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Overrides the pause after identity changes.
    #[must_use]
    pub const fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Uses a custom base template instead of the built-in one.
    #[must_use]
    pub fn with_template_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.template_file = Some(path.into());
        self
    }

    /// Overrides the systemd unit names.
    #[must_use]
    pub fn with_services(mut self, services: ServiceNames) -> Self {
        self.services = services;
        self
    }

    /// Enables or disables the router PTR lookup.
    #[must_use]
    pub const fn with_router_name_lookup(mut self, enabled: bool) -> Self {
        self.lookup_router_names = enabled;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}
