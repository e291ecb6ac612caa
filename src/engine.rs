//! Top-level operations.
//!
//! [`Engine`] sequences the components: discovery, allocation, persistence,
//! and DHCP mutation establish the identity once; rendering and reload apply
//! policy on every change. Each public operation holds the [`EngineLock`] for
//! its whole duration and checks the cancel flag only between steps.

use crate::allocator::allocate;
use crate::config::EngineConfig;
use crate::dhcp::{ConfigureOutcome, DhcpConfigurator};
use crate::discovery::{discover, lookup_router_names};
use crate::error::{EngineError, Result};
use crate::identity::{IdentityRecord, ResolverChoice};
use crate::lock::EngineLock;
use crate::policy::PolicyDocument;
use crate::reload::ReloadOrchestrator;
use crate::render::{PolicyRenderer, next_serial, read_serial};
use crate::runner::{CommandRunner, SystemRunner};
use crate::scan::scan_active_hosts;
use crate::state::InstallStateStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Network identity and DNS policy engine.
///
/// # Example
///
/// ```rust,ignore
/// use dns_firewall::{Engine, EngineConfig, ResolverChoice};
///
/// let engine = Engine::system(EngineConfig::new());
/// engine.establish_identity(ResolverChoice::Original)?;
/// engine.apply_policy()?;
/// ```
pub struct Engine<R: CommandRunner = SystemRunner> {
    runner: R,
    config: EngineConfig,
    cancel: Option<Arc<AtomicBool>>,
}

impl Engine<SystemRunner> {
    /// Creates an engine running commands on the host.
    #[must_use]
    pub const fn system(config: EngineConfig) -> Self {
        Self::new(SystemRunner, config)
    }
}

impl<R: CommandRunner> Engine<R> {
    /// Creates an engine with a custom command runner.
    pub const fn new(runner: R, config: EngineConfig) -> Self {
        Self {
            runner,
            config,
            cancel: None,
        }
    }

    /// Observes `flag` between top-level steps; once set, the next checkpoint
    /// fails with [`EngineError::Cancelled`].
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// The command runner.
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    /// The configuration.
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the current identity, or [`EngineError::NotConfigured`].
    ///
    /// # Errors
    ///
    /// See [`InstallStateStore::load`].
    pub fn identity(&self) -> Result<IdentityRecord> {
        InstallStateStore::new(&self.config).load()
    }

    /// Claims a static identity announcing the resolver picked by `choice`.
    ///
    /// Already configured with the same choice: returns the stored record
    /// without touching anything. Configured with the other choice: reverts
    /// and reapplies the stored record with the new resolver. Static
    /// assignment present but no record: reverts and starts over.
    ///
    /// # Errors
    ///
    /// [`EngineError::Discovery`], [`EngineError::AllocationExhausted`],
    /// [`EngineError::Reconfiguration`], [`EngineError::Revert`], or
    /// [`EngineError::Locked`] / [`EngineError::Cancelled`].
    pub fn establish_identity(&self, choice: ResolverChoice) -> Result<IdentityRecord> {
        let _lock = self.lock()?;
        self.establish_identity_locked(choice)
    }

    /// Renders the stored policy for the stored identity and applies it.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotConfigured`] if no identity exists, policy load and
    /// render errors, [`EngineError::ConfigInvalid`], or
    /// [`EngineError::ReloadFailed`].
    pub fn apply_policy(&self) -> Result<()> {
        let _lock = self.lock()?;
        self.apply_policy_locked()
    }

    /// Establishes the identity, then applies policy, under one lock.
    ///
    /// # Errors
    ///
    /// Any error of [`establish_identity`](Self::establish_identity) or
    /// [`apply_policy`](Self::apply_policy).
    pub fn start(&self, choice: ResolverChoice) -> Result<IdentityRecord> {
        let _lock = self.lock()?;
        let record = self.establish_identity_locked(choice)?;
        self.checkpoint()?;
        self.apply_policy_locked()?;
        Ok(record)
    }

    /// Stops the resolver and the TLS forwarder.
    ///
    /// # Errors
    ///
    /// [`EngineError::Command`] if a unit fails to stop.
    pub fn stop(&self) -> Result<()> {
        let _lock = self.lock()?;
        ReloadOrchestrator::new(&self.runner, &self.config).stop()
    }

    /// Stops services, reverts the static identity, and restores the
    /// pristine resolver config.
    ///
    /// # Errors
    ///
    /// [`EngineError::Revert`] if the network cannot be cycled back; the
    /// resolver config is left as is in that case.
    pub fn remove(&self) -> Result<()> {
        let _lock = self.lock()?;
        let orchestrator = ReloadOrchestrator::new(&self.runner, &self.config);
        orchestrator.stop()?;
        self.checkpoint()?;

        DhcpConfigurator::new(&self.runner, &self.config).revert()?;
        self.settle();
        self.checkpoint()?;

        orchestrator.restore_original()?;
        tracing::info!("dns-firewall removed");
        Ok(())
    }

    fn establish_identity_locked(&self, choice: ResolverChoice) -> Result<IdentityRecord> {
        self.checkpoint()?;
        let store = InstallStateStore::new(&self.config);
        let dhcp = DhcpConfigurator::new(&self.runner, &self.config);

        if store.is_configured()? {
            match store.load() {
                Ok(record) if record.resolver_choice() == choice => {
                    tracing::info!(static_ip = %record.static_ip, "Static identity already in place");
                    return Ok(record);
                }
                Ok(record) => {
                    tracing::info!(
                        static_ip = %record.static_ip,
                        choice = ?choice,
                        "Resolver choice changed, reapplying stored identity"
                    );
                    dhcp.revert()?;
                    self.settle();
                    self.checkpoint()?;
                    return self.commit(&store, &dhcp, record.with_resolver(choice));
                }
                Err(EngineError::NotConfigured) => {
                    tracing::warn!("Static assignment present without identity record, starting over");
                    dhcp.revert()?;
                    self.settle();
                    self.checkpoint()?;
                }
                Err(e) => return Err(e),
            }
        }

        let topology = discover(&self.runner, &self.config)?;
        self.checkpoint()?;

        let active = match scan_active_hosts(&self.runner, &topology, self.config.scan_host_timeout) {
            Ok(hosts) => Some(hosts),
            Err(e) => {
                tracing::warn!(error = %e, "Host scan failed, allocating best effort");
                None
            }
        };
        let static_ip = allocate(&topology, active.as_ref())?;
        let record = IdentityRecord::new(&topology, static_ip, choice)?;
        self.checkpoint()?;

        self.commit(&store, &dhcp, record)
    }

    /// Persists `record` and applies it; the record is dropped again if the
    /// network does not come back.
    fn commit(
        &self,
        store: &InstallStateStore,
        dhcp: &DhcpConfigurator<'_, R>,
        record: IdentityRecord,
    ) -> Result<IdentityRecord> {
        store.save(&record)?;
        match dhcp.configure(&record) {
            Ok(ConfigureOutcome::Applied) => {
                self.settle();
                Ok(record)
            }
            Ok(ConfigureOutcome::AlreadyConfigured) => Ok(record),
            Err(e) => {
                if let Err(clear) = store.clear() {
                    tracing::warn!(error = %clear, "Failed to drop identity record after failed configure");
                }
                Err(e)
            }
        }
    }

    fn apply_policy_locked(&self) -> Result<()> {
        let identity = InstallStateStore::new(&self.config).load()?;
        let policy = PolicyDocument::load(&self.config.policy_file)?;

        let router_names = if self.config.lookup_router_names {
            lookup_router_names(&self.runner, identity.router, identity.original_resolver)
        } else {
            Vec::new()
        };
        let previous = std::fs::read_to_string(&self.config.passthru_zone_file)
            .ok()
            .and_then(|zone| read_serial(&zone));
        let renderer = PolicyRenderer::new(&self.config)?;
        let serial = next_serial(previous, renderer.serial());
        let rendered = renderer
            .with_router_names(router_names)
            .with_serial(serial)
            .render(&policy, &identity)?;
        self.checkpoint()?;

        ReloadOrchestrator::new(&self.runner, &self.config).apply(&rendered)
    }

    fn lock(&self) -> Result<EngineLock> {
        EngineLock::acquire(&self.config.lock_file)
    }

    fn checkpoint(&self) -> Result<()> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::SeqCst) => {
                tracing::info!("Termination requested, stopping between steps");
                Err(EngineError::Cancelled)
            }
            _ => Ok(()),
        }
    }

    fn settle(&self) {
        if !self.config.settle_delay.is_zero() {
            tracing::debug!(delay = ?self.config.settle_delay, "Waiting for network to settle");
            std::thread::sleep(self.config.settle_delay);
        }
    }
}
