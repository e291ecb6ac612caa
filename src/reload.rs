//! Validation and application of rendered resolver configuration.
//!
//! # Apply sequence
//!
//! 1. Write the rendered config to a staged path next to the live one.
//! 2. Run `named-checkconf` on the staged copy. Any output aborts with
//!    [`EngineError::ConfigInvalid`]; the live config is never touched.
//! 3. Write the passthru zone and forwarder config (or remove them).
//! 4. Rename the staged copy over the live config.
//! 5. Start or stop the TLS forwarder, then `rndc reload` the resolver.
//!
//! Reload is attempted once. A failure is more likely a persistent defect in
//! the config than a transient condition, so it surfaces immediately.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::render::RenderedConfig;
use crate::runner::CommandRunner;
use crate::service::ServiceManager;
use crate::util::{remove_if_exists, write_atomic};
use std::path::Path;

/// Validates, installs, and signals resolver configuration.
pub struct ReloadOrchestrator<'a, R: CommandRunner> {
    runner: &'a R,
    config: &'a EngineConfig,
}

impl<'a, R: CommandRunner> ReloadOrchestrator<'a, R> {
    /// Creates an orchestrator for the paths and services in `config`.
    pub const fn new(runner: &'a R, config: &'a EngineConfig) -> Self {
        Self { runner, config }
    }

    /// Applies `rendered` to the running resolver.
    ///
    /// The passthru zone and forwarder config are only written once the
    /// validated resolver config is live.
    ///
    /// # Errors
    ///
    /// - [`EngineError::ConfigInvalid`] if validation reports anything; no
    ///   file other than the (removed) staged copy was written and no signal
    ///   was sent.
    /// - [`EngineError::ReloadFailed`] if the forwarder cannot be started or
    ///   the resolver cannot be reloaded.
    /// - [`EngineError::Io`] if a file cannot be written.
    pub fn apply(&self, rendered: &RenderedConfig) -> Result<()> {
        let staged = &self.config.resolver_conf_staged;
        let live = &self.config.resolver_conf;

        write_atomic(staged, rendered.resolver_conf.as_bytes())?;
        if let Err(e) = self.validate(staged) {
            remove_if_exists(staged)?;
            return Err(e);
        }

        if live.is_file() && !self.config.resolver_conf_original.exists() {
            std::fs::copy(live, &self.config.resolver_conf_original)?;
            tracing::info!(
                backup = %self.config.resolver_conf_original.display(),
                "Saved pristine resolver config"
            );
        }

        std::fs::rename(staged, live)?;
        tracing::info!(path = %live.display(), "Installed resolver config");
        install_optional(&self.config.passthru_zone_file, rendered.passthru_zone.as_deref())?;
        install_optional(&self.config.forwarder_conf, rendered.forwarder_conf.as_deref())?;

        self.signal(rendered.forward_over_tls())
    }

    /// Runs the config validator on `path`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ConfigInvalid`] carrying the validator's output
    /// if it printed anything or exited non-zero, or [`EngineError::Command`]
    /// if it could not be run at all.
    pub fn validate(&self, path: &Path) -> Result<()> {
        let path_arg = path.display().to_string();
        let out = self
            .runner
            .run("named-checkconf", &[path_arg.as_str()])
            .map_err(|e| EngineError::Command {
                command: format!("named-checkconf {path_arg}"),
                detail: e.to_string(),
            })?;

        let diagnostics = format!("{}{}", out.stdout, out.stderr).trim().to_string();
        if diagnostics.is_empty() && out.success {
            tracing::debug!(path = %path_arg, "Resolver config valid");
            return Ok(());
        }
        let diagnostics = if diagnostics.is_empty() {
            "validator exited unsuccessfully without output".to_string()
        } else {
            diagnostics
        };
        tracing::error!(path = %path_arg, diagnostics = %diagnostics, "Resolver config rejected");
        Err(EngineError::ConfigInvalid { diagnostics })
    }

    /// Stops the resolver and the TLS forwarder. The forwarder unit may not
    /// be installed, so failing to stop it only logs a warning.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Command`] if the resolver fails to stop.
    pub fn stop(&self) -> Result<()> {
        let services = ServiceManager::new(self.runner);
        let forwarder = &self.config.services.forwarder;
        services.stop(&self.config.services.resolver)?;
        if let Err(e) = services.stop(forwarder) {
            tracing::warn!(unit = %forwarder, error = %e, "Could not stop TLS forwarder");
        }
        tracing::info!("Resolver and forwarder stopped");
        Ok(())
    }

    /// Moves the pristine resolver config saved on first apply back over the
    /// live one and deletes the generated files. Returns `false` if there was
    /// nothing to restore.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Io`] on filesystem failure.
    pub fn restore_original(&self) -> Result<bool> {
        remove_if_exists(&self.config.passthru_zone_file)?;
        remove_if_exists(&self.config.forwarder_conf)?;
        remove_if_exists(&self.config.resolver_conf_staged)?;

        let original = &self.config.resolver_conf_original;
        if !original.is_file() {
            return Ok(false);
        }
        std::fs::rename(original, &self.config.resolver_conf)?;
        tracing::info!(path = %self.config.resolver_conf.display(), "Restored pristine resolver config");
        Ok(true)
    }

    fn signal(&self, forward_over_tls: bool) -> Result<()> {
        let services = ServiceManager::new(self.runner);
        let forwarder = &self.config.services.forwarder;

        if forward_over_tls {
            services
                .restart(forwarder)
                .map_err(|e| EngineError::ReloadFailed(e.to_string()))?;
        } else if let Err(e) = services.stop(forwarder) {
            tracing::warn!(unit = %forwarder, error = %e, "Could not stop TLS forwarder");
        }

        services
            .reload_resolver()
            .map_err(|e| EngineError::ReloadFailed(e.to_string()))?;
        tracing::info!(tls = forward_over_tls, "Resolver reloaded");
        Ok(())
    }
}

fn install_optional(path: &Path, contents: Option<&str>) -> Result<()> {
    match contents {
        Some(text) => write_atomic(path, text.as_bytes())?,
        None => {
            remove_if_exists(path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ScriptedRunner;

    fn rendered(conf: &str) -> RenderedConfig {
        RenderedConfig {
            resolver_conf: conf.to_string(),
            passthru_zone: None,
            forwarder_conf: None,
        }
    }

    fn setup(dir: &Path) -> EngineConfig {
        let config = EngineConfig::with_root(dir);
        std::fs::create_dir_all(config.resolver_conf.parent().unwrap()).unwrap();
        std::fs::write(&config.resolver_conf, "// distribution default\n").unwrap();
        config
    }

    #[test]
    fn valid_config_goes_live_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let runner = ScriptedRunner::new();

        ReloadOrchestrator::new(&runner, &config)
            .apply(&rendered("options { };\n"))
            .unwrap();

        assert_eq!(std::fs::read_to_string(&config.resolver_conf).unwrap(), "options { };\n");
        assert_eq!(
            std::fs::read_to_string(&config.resolver_conf_original).unwrap(),
            "// distribution default\n"
        );
        assert!(!config.resolver_conf_staged.exists());
        let staged = config.resolver_conf_staged.display().to_string();
        assert_eq!(
            runner.calls(),
            vec![
                format!("named-checkconf {staged}"),
                "systemctl stop stunnel4".to_string(),
                "rndc reload".to_string(),
            ]
        );
    }

    #[test]
    fn diagnostics_block_reload_and_keep_live_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let runner = ScriptedRunner::new().fail(
            "named-checkconf",
            "named.conf.staged:3: missing '}' before end of file",
        );

        let err = ReloadOrchestrator::new(&runner, &config)
            .apply(&rendered("options {\n"))
            .unwrap_err();

        match err {
            EngineError::ConfigInvalid { diagnostics } => assert!(diagnostics.contains("missing '}'")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(runner.count("rndc"), 0);
        assert_eq!(runner.count("systemctl"), 0);
        assert_eq!(
            std::fs::read_to_string(&config.resolver_conf).unwrap(),
            "// distribution default\n"
        );
        assert!(!config.resolver_conf_staged.exists());
    }

    #[test]
    fn output_on_success_still_counts_as_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let runner = ScriptedRunner::new().respond("named-checkconf", "warning: something odd\n");
        let orchestrator = ReloadOrchestrator::new(&runner, &config);
        assert!(matches!(
            orchestrator.apply(&rendered("options { };\n")),
            Err(EngineError::ConfigInvalid { .. })
        ));
    }

    #[test]
    fn reload_failure_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let runner = ScriptedRunner::new().fail("rndc reload", "rndc: connect failed: 127.0.0.1#953");

        let err = ReloadOrchestrator::new(&runner, &config)
            .apply(&rendered("options { };\n"))
            .unwrap_err();
        assert!(matches!(err, EngineError::ReloadFailed(_)));
        assert_eq!(runner.count("rndc reload"), 1);
    }

    #[test]
    fn tls_restarts_forwarder_and_writes_aux_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let runner = ScriptedRunner::new();
        let mut r = rendered("options { };\n");
        r.passthru_zone = Some("x.com\tCNAME rpz-passthru.\n".into());
        r.forwarder_conf = Some("[dns-over-tls]\n".into());

        ReloadOrchestrator::new(&runner, &config).apply(&r).unwrap();

        assert!(config.passthru_zone_file.exists());
        assert!(config.forwarder_conf.exists());
        assert_eq!(runner.count("systemctl restart stunnel4"), 1);
        assert_eq!(runner.count("systemctl stop"), 0);
    }

    #[test]
    fn stale_aux_files_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        std::fs::write(&config.passthru_zone_file, "old").unwrap();

        ReloadOrchestrator::new(&ScriptedRunner::new(), &config)
            .apply(&rendered("options { };\n"))
            .unwrap();
        assert!(!config.passthru_zone_file.exists());
    }

    #[test]
    fn forwarder_stop_failure_does_not_block_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let runner = ScriptedRunner::new().fail("systemctl stop stunnel4", "Unit stunnel4.service not loaded.");

        ReloadOrchestrator::new(&runner, &config)
            .apply(&rendered("options { };\n"))
            .unwrap();
        assert_eq!(runner.count("rndc reload"), 1);
    }

    #[test]
    fn stop_tolerates_missing_forwarder_unit() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let runner = ScriptedRunner::new().fail("systemctl stop stunnel4", "Unit stunnel4.service not loaded.");

        ReloadOrchestrator::new(&runner, &config).stop().unwrap();
        assert_eq!(runner.count("systemctl stop bind9"), 1);
    }

    #[test]
    fn resolver_stop_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let runner = ScriptedRunner::new().fail("systemctl stop bind9", "Job failed");

        assert!(matches!(
            ReloadOrchestrator::new(&runner, &config).stop(),
            Err(EngineError::Command { .. })
        ));
    }

    #[test]
    fn aux_files_untouched_when_install_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        std::fs::remove_file(&config.resolver_conf).unwrap();
        std::fs::create_dir_all(config.resolver_conf.join("occupied")).unwrap();
        let runner = ScriptedRunner::new();
        let mut r = rendered("options { };\n");
        r.passthru_zone = Some("x.com\tCNAME rpz-passthru.\n".into());
        r.forwarder_conf = Some("[dns-over-tls]\n".into());

        assert!(ReloadOrchestrator::new(&runner, &config).apply(&r).is_err());
        assert!(!config.passthru_zone_file.exists());
        assert!(!config.forwarder_conf.exists());
        assert_eq!(runner.count("rndc"), 0);
    }

    #[test]
    fn restore_original_puts_pristine_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let runner = ScriptedRunner::new();
        let orchestrator = ReloadOrchestrator::new(&runner, &config);

        assert!(!orchestrator.restore_original().unwrap());
        orchestrator.apply(&rendered("options { };\n")).unwrap();
        assert!(orchestrator.restore_original().unwrap());
        assert_eq!(
            std::fs::read_to_string(&config.resolver_conf).unwrap(),
            "// distribution default\n"
        );
    }
}
