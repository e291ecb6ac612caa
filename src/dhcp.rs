//! DHCP client config mutation and network service cycling.
//!
//! # Lifecycle
//!
//! 1. [`configure`](DhcpConfigurator::configure) backs up the live
//!    `dhcpcd.conf`, appends a static-assignment block, and cycles the
//!    network services. If cycling fails the backup is moved back over the
//!    live file before the error surfaces.
//! 2. [`revert`](DhcpConfigurator::revert) restores the backup (or strips
//!    the block textually when no backup exists) and cycles again.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::identity::IdentityRecord;
use crate::runner::CommandRunner;
use crate::service::ServiceManager;
use crate::state::{InstallStateStore, STATIC_STATEMENT_PREFIXES};
use crate::util::{remove_if_exists, write_atomic};

/// Comment line opening the static-assignment block.
pub const STATIC_BLOCK_HEADER: &str = "# Static IPv4 configuration for dns-firewall";

/// Result of [`DhcpConfigurator::configure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigureOutcome {
    /// The block was appended and the network came back up.
    Applied,
    /// A static assignment was already present; nothing was touched.
    AlreadyConfigured,
}

/// Result of [`DhcpConfigurator::revert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertOutcome {
    /// The pre-mutation backup was restored.
    Restored,
    /// No backup existed; static statements were stripped from the live file.
    Stripped,
    /// No static assignment was present.
    NothingToRevert,
}

/// Mutates the DHCP client config and cycles network services.
pub struct DhcpConfigurator<'a, R: CommandRunner> {
    runner: &'a R,
    config: &'a EngineConfig,
    store: InstallStateStore,
}

impl<'a, R: CommandRunner> DhcpConfigurator<'a, R> {
    /// Creates a configurator for the paths and services in `config`.
    pub fn new(runner: &'a R, config: &'a EngineConfig) -> Self {
        Self {
            runner,
            config,
            store: InstallStateStore::new(config),
        }
    }

    /// Applies `record` as a static assignment.
    ///
    /// No-op if [`InstallStateStore::is_configured`] already holds: no file is
    /// written and no service is touched.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Reconfiguration`] if the network services fail
    /// to cycle; the live DHCP config is byte-identical to its pre-call
    /// content when this is returned and one attempt is made to start the
    /// DHCP client again. Addresses flushed before the failure are not
    /// restored. I/O errors before the mutation leave the live file
    /// untouched.
    pub fn configure(&self, record: &IdentityRecord) -> Result<ConfigureOutcome> {
        if self.store.is_configured()? {
            tracing::info!(
                path = %self.config.dhcp_conf.display(),
                "Static assignment already present, skipping"
            );
            return Ok(ConfigureOutcome::AlreadyConfigured);
        }
        record.validate()?;

        let live = &self.config.dhcp_conf;
        let backup = &self.config.dhcp_conf_backup;
        std::fs::copy(live, backup)?;
        tracing::debug!(backup = %backup.display(), "Saved pristine DHCP config");

        let mut content = std::fs::read_to_string(live)?;
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&static_block(record));
        write_atomic(live, content.as_bytes())?;
        tracing::info!(
            interface = %record.interface,
            static_ip = %record.static_ip,
            router = %record.router,
            resolver = %record.resolver,
            "Appended static assignment to DHCP config"
        );

        if let Err(e) = self.reconfigure_network() {
            tracing::error!(error = %e, "Network reconfiguration failed, restoring DHCP config");
            if let Err(restore) = std::fs::rename(backup, live) {
                return Err(EngineError::Reconfiguration(format!(
                    "{e}; restoring {} also failed: {restore}",
                    backup.display()
                )));
            }
            let dhcp_client = &self.config.services.dhcp_client;
            if let Err(start) = ServiceManager::new(self.runner).start(dhcp_client) {
                tracing::warn!(unit = %dhcp_client, error = %start, "DHCP client not restarted after rollback");
            }
            return Err(EngineError::Reconfiguration(e.to_string()));
        }
        Ok(ConfigureOutcome::Applied)
    }

    /// Undoes [`configure`](Self::configure).
    ///
    /// With a backup: restore it, cycle the network, then delete the backup
    /// and the identity record. Without one: drop every uncommented
    /// static-assignment statement from the live file and cycle the network.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Revert`] if cycling the network fails; the
    /// backup and record are kept for manual recovery.
    pub fn revert(&self) -> Result<RevertOutcome> {
        let live = &self.config.dhcp_conf;
        let backup = &self.config.dhcp_conf_backup;

        let outcome = if backup.is_file() {
            let pristine = std::fs::read(backup)?;
            write_atomic(live, &pristine)?;
            tracing::info!(backup = %backup.display(), "Restored pristine DHCP config");
            RevertOutcome::Restored
        } else if self.store.is_configured()? {
            let content = std::fs::read_to_string(live)?;
            write_atomic(live, strip_static_block(&content).as_bytes())?;
            tracing::warn!(
                path = %live.display(),
                "No DHCP config backup, stripped static statements instead"
            );
            RevertOutcome::Stripped
        } else {
            tracing::debug!("No static assignment to revert");
            self.store.clear()?;
            return Ok(RevertOutcome::NothingToRevert);
        };

        self.reconfigure_network()
            .map_err(|e| EngineError::Revert(e.to_string()))?;

        remove_if_exists(backup)?;
        self.store.clear()?;
        Ok(outcome)
    }

    /// Reloads unit definitions, stops the DHCP client, flushes every
    /// interface, starts the DHCP client, then restarts networking until it
    /// reports active (bounded by [`EngineConfig::restart_attempts`]).
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error.
    pub fn reconfigure_network(&self) -> Result<()> {
        let services = ServiceManager::new(self.runner);
        let names = &self.config.services;

        services.daemon_reload()?;
        services.stop(&names.dhcp_client)?;
        for device in self.interfaces()? {
            self.runner
                .output("ip", &["addr", "flush", "dev", device.as_str()])?;
        }
        services.start(&names.dhcp_client)?;
        services.restart_until_active(
            &names.networking,
            self.config.restart_attempts,
            self.config.retry_delay,
        )?;
        tracing::info!("Network services reconfigured");
        Ok(())
    }

    fn interfaces(&self) -> Result<Vec<String>> {
        let mut devices = Vec::new();
        for entry in std::fs::read_dir(&self.config.net_class_dir)? {
            if let Some(name) = entry?.file_name().to_str() {
                devices.push(name.to_string());
            }
        }
        devices.sort();
        Ok(devices)
    }
}

/// Renders the block appended to `dhcpcd.conf`.
///
/// ```text
///
/// # Static IPv4 configuration for dns-firewall
/// interface eth0
/// static ip_address=192.168.1.2/24
/// static routers=192.168.1.1
/// static domain_name_servers=192.168.1.2
/// ```
#[must_use]
pub fn static_block(record: &IdentityRecord) -> String {
    let [interface, address, routers, servers] = STATIC_STATEMENT_PREFIXES;
    format!(
        "\n{STATIC_BLOCK_HEADER}\n{interface}{iface}\n{address}{ip}/{prefix}\n{routers}{router}\n{servers}{resolver}\n",
        iface = record.interface,
        ip = record.static_ip,
        prefix = record.subnet.prefix(),
        router = record.router,
        resolver = record.resolver,
    )
}

/// Drops uncommented static-assignment statements and the block header.
fn strip_static_block(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for line in content.lines() {
        let trimmed = line.trim_start();
        let is_static = STATIC_STATEMENT_PREFIXES
            .iter()
            .any(|prefix| trimmed.starts_with(prefix));
        if is_static || trimmed == STATIC_BLOCK_HEADER {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CommandOutput, ScriptedRunner};
    use std::net::Ipv4Addr;
    use std::path::Path;
    use std::time::Duration;

    const PRISTINE: &str = "hostname\nclientid\npersistent\n#static ip_address=10.0.0.2/24\n";

    fn record() -> IdentityRecord {
        IdentityRecord {
            router: Ipv4Addr::new(192, 168, 1, 1),
            subnet: "192.168.1.0/24".parse().unwrap(),
            original_ip: Ipv4Addr::new(192, 168, 1, 23),
            original_resolver: Ipv4Addr::new(192, 168, 1, 1),
            static_ip: Ipv4Addr::new(192, 168, 1, 2),
            resolver: Ipv4Addr::new(192, 168, 1, 2),
            interface: "eth0".into(),
        }
    }

    fn setup(dir: &Path) -> EngineConfig {
        let config = EngineConfig::with_root(dir).with_retry_delay(Duration::ZERO);
        std::fs::create_dir_all(config.dhcp_conf.parent().unwrap()).unwrap();
        std::fs::write(&config.dhcp_conf, PRISTINE).unwrap();
        for dev in ["eth0", "lo"] {
            std::fs::create_dir_all(config.net_class_dir.join(dev)).unwrap();
        }
        config
    }

    fn healthy() -> ScriptedRunner {
        ScriptedRunner::new().respond("systemctl is-active", "active\n")
    }

    #[test]
    fn static_block_lists_four_statements() {
        let block = static_block(&record());
        assert!(block.contains("interface eth0\n"));
        assert!(block.contains("static ip_address=192.168.1.2/24\n"));
        assert!(block.contains("static routers=192.168.1.1\n"));
        assert!(block.contains("static domain_name_servers=192.168.1.2\n"));
    }

    #[test]
    fn configure_appends_and_cycles_services_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let runner = healthy();
        let dhcp = DhcpConfigurator::new(&runner, &config);

        assert_eq!(dhcp.configure(&record()).unwrap(), ConfigureOutcome::Applied);

        let live = std::fs::read_to_string(&config.dhcp_conf).unwrap();
        assert!(live.starts_with(PRISTINE));
        assert!(live.contains("static ip_address=192.168.1.2/24"));
        assert_eq!(std::fs::read_to_string(&config.dhcp_conf_backup).unwrap(), PRISTINE);
        assert_eq!(
            runner.calls(),
            vec![
                "systemctl daemon-reload",
                "systemctl stop dhcpcd",
                "ip addr flush dev eth0",
                "ip addr flush dev lo",
                "systemctl start dhcpcd",
                "systemctl restart networking",
                "systemctl is-active networking",
            ]
        );
    }

    #[test]
    fn configure_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let runner = healthy();
        let dhcp = DhcpConfigurator::new(&runner, &config);

        dhcp.configure(&record()).unwrap();
        let before = std::fs::read(&config.dhcp_conf).unwrap();
        let calls = runner.calls().len();

        assert_eq!(
            dhcp.configure(&record()).unwrap(),
            ConfigureOutcome::AlreadyConfigured
        );
        assert_eq!(std::fs::read(&config.dhcp_conf).unwrap(), before);
        assert_eq!(runner.calls().len(), calls);
    }

    #[test]
    fn failed_reconfiguration_restores_byte_identical_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let runner = ScriptedRunner::new().fail("systemctl start dhcpcd", "Job failed");
        let dhcp = DhcpConfigurator::new(&runner, &config);

        let err = dhcp.configure(&record()).unwrap_err();
        assert!(matches!(err, EngineError::Reconfiguration(_)));
        assert_eq!(std::fs::read(&config.dhcp_conf).unwrap(), PRISTINE.as_bytes());
        assert!(!config.dhcp_conf_backup.exists());
    }

    #[test]
    fn rollback_starts_dhcp_client_again() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let runner = ScriptedRunner::new().fail("systemctl restart networking", "Job failed");
        let dhcp = DhcpConfigurator::new(&runner, &config);

        assert!(matches!(
            dhcp.configure(&record()),
            Err(EngineError::Reconfiguration(_))
        ));
        let calls = runner.calls();
        assert_eq!(calls.last().map(String::as_str), Some("systemctl start dhcpcd"));
        assert_eq!(runner.count("systemctl start dhcpcd"), 2);
        assert_eq!(std::fs::read_to_string(&config.dhcp_conf).unwrap(), PRISTINE);
    }

    #[test]
    fn networking_never_active_triggers_rollback_after_bounded_retries() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let runner = ScriptedRunner::new().sequence(
            "systemctl is-active",
            vec![CommandOutput::ok("failed\n")],
        );
        let dhcp = DhcpConfigurator::new(&runner, &config);

        assert!(dhcp.configure(&record()).is_err());
        assert_eq!(runner.count("systemctl restart networking"), 3);
        assert_eq!(std::fs::read_to_string(&config.dhcp_conf).unwrap(), PRISTINE);
    }

    #[test]
    fn revert_restores_backup_and_clears_record() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let runner = healthy();
        let dhcp = DhcpConfigurator::new(&runner, &config);
        let store = InstallStateStore::new(&config);

        store.save(&record()).unwrap();
        dhcp.configure(&record()).unwrap();

        assert_eq!(dhcp.revert().unwrap(), RevertOutcome::Restored);
        assert_eq!(std::fs::read_to_string(&config.dhcp_conf).unwrap(), PRISTINE);
        assert!(!config.dhcp_conf_backup.exists());
        assert!(!store.has_record());
        assert_eq!(runner.count("systemctl daemon-reload"), 2);
    }

    #[test]
    fn revert_without_backup_strips_statements() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let mut live = PRISTINE.to_string();
        live.push_str(&static_block(&record()));
        std::fs::write(&config.dhcp_conf, &live).unwrap();

        let runner = healthy();
        let dhcp = DhcpConfigurator::new(&runner, &config);
        assert_eq!(dhcp.revert().unwrap(), RevertOutcome::Stripped);

        let stripped = std::fs::read_to_string(&config.dhcp_conf).unwrap();
        assert_eq!(stripped, format!("{PRISTINE}\n"));
        assert!(stripped.contains("#static ip_address=10.0.0.2/24"));
    }

    #[test]
    fn revert_when_unconfigured_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let runner = healthy();
        let dhcp = DhcpConfigurator::new(&runner, &config);

        assert_eq!(dhcp.revert().unwrap(), RevertOutcome::NothingToRevert);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn failed_revert_keeps_backup_for_manual_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let ok = healthy();
        DhcpConfigurator::new(&ok, &config).configure(&record()).unwrap();

        let broken = ScriptedRunner::new().fail("systemctl daemon-reload", "dbus down");
        let err = DhcpConfigurator::new(&broken, &config).revert().unwrap_err();
        assert!(matches!(err, EngineError::Revert(_)));
        assert!(config.dhcp_conf_backup.exists());
    }
}
