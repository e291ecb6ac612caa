//! systemd and resolver control primitives.

use crate::error::{EngineError, Result};
use crate::runner::CommandRunner;
use std::time::Duration;

/// Thin wrapper over `systemctl` and `rndc`.
pub struct ServiceManager<'a, R: CommandRunner> {
    runner: &'a R,
}

impl<'a, R: CommandRunner> ServiceManager<'a, R> {
    /// Wraps a command runner.
    pub const fn new(runner: &'a R) -> Self {
        Self { runner }
    }

    /// Reloads unit definitions (`systemctl daemon-reload`).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Command`] if `systemctl` fails.
    pub fn daemon_reload(&self) -> Result<()> {
        self.systemctl(&["daemon-reload"])
    }

    /// Starts `unit`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Command`] if `systemctl` fails.
    pub fn start(&self, unit: &str) -> Result<()> {
        self.systemctl(&["start", unit])
    }

    /// Stops `unit`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Command`] if `systemctl` fails.
    pub fn stop(&self, unit: &str) -> Result<()> {
        self.systemctl(&["stop", unit])
    }

    /// Restarts `unit`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Command`] if `systemctl` fails.
    pub fn restart(&self, unit: &str) -> Result<()> {
        self.systemctl(&["restart", unit])
    }

    /// Returns `true` if `systemctl is-active` prints `active`.
    ///
    /// `is-active` exits non-zero for inactive units, so only a spawn failure
    /// is an error here.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Command`] if `systemctl` cannot be run.
    pub fn is_active(&self, unit: &str) -> Result<bool> {
        let out = self
            .runner
            .run("systemctl", &["is-active", unit])
            .map_err(|e| EngineError::Command {
                command: format!("systemctl is-active {unit}"),
                detail: e.to_string(),
            })?;
        Ok(out.stdout.trim() == "active")
    }

    /// Asks the running resolver to re-read its config in place.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Command`] if `rndc` fails.
    pub fn reload_resolver(&self) -> Result<()> {
        self.runner.output("rndc", &["reload"]).map(drop)
    }

    /// Restarts `unit` until `is-active` reports `active`, at most `attempts`
    /// times, sleeping `delay` between attempts. No backoff.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Command`] naming the unit once attempts run out.
    pub fn restart_until_active(&self, unit: &str, attempts: u32, delay: Duration) -> Result<()> {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            match self.restart(unit).and_then(|()| self.is_active(unit)) {
                Ok(true) => {
                    tracing::info!(unit = %unit, attempt, "Service active");
                    return Ok(());
                }
                Ok(false) => {
                    tracing::warn!(unit = %unit, attempt, "Service not active after restart");
                }
                Err(e) => {
                    tracing::warn!(unit = %unit, attempt, error = %e, "Service restart failed");
                }
            }
            if attempt < attempts && !delay.is_zero() {
                std::thread::sleep(delay);
            }
        }
        Err(EngineError::Command {
            command: format!("systemctl restart {unit}"),
            detail: format!("not active after {attempts} restart attempts"),
        })
    }

    fn systemctl(&self, args: &[&str]) -> Result<()> {
        self.runner.output("systemctl", args).map(drop)
    }
}
