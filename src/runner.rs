//! External command execution.
//!
//! Every tool the engine drives (`ip`, `nmap`, `dig`, `systemctl`, `rndc`,
//! `named-checkconf`) goes through [`CommandRunner`], so the whole engine can
//! run against a [`ScriptedRunner`] in tests.

use crate::error::{EngineError, Result};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::process::Command;

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `true` if the process exited with status 0.
    pub success: bool,
    /// Captured stdout, lossily decoded.
    pub stdout: String,
    /// Captured stderr, lossily decoded.
    pub stderr: String,
}

impl CommandOutput {
    /// A successful run printing `stdout`.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed run printing `stderr`.
    #[must_use]
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Runs external programs synchronously. No timeout is applied at this layer.
pub trait CommandRunner {
    /// Runs `program` with `args` and waits for it to exit.
    ///
    /// # Errors
    ///
    /// Returns an I/O error only if the process could not be spawned; a
    /// non-zero exit is reported through [`CommandOutput::success`].
    fn run(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput>;

    /// Runs a command and returns its stdout, failing on spawn error or
    /// non-zero exit.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Command`] describing the failure.
    fn output(&self, program: &str, args: &[&str]) -> Result<String> {
        let command = command_line(program, args);
        let out = self.run(program, args).map_err(|e| EngineError::Command {
            command: command.clone(),
            detail: e.to_string(),
        })?;
        if out.success {
            Ok(out.stdout)
        } else {
            Err(EngineError::Command {
                command,
                detail: out.stderr.trim().to_string(),
            })
        }
    }
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput> {
        (**self).run(program, args)
    }
}

/// Runs commands on the host via [`std::process::Command`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput> {
        tracing::debug!(command = %command_line(program, args), "Running command");
        let out = Command::new(program).args(args).output()?;
        Ok(CommandOutput {
            success: out.status.success(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

/// Answers commands from scripted responses and records every invocation.
///
/// A rule matches when the full command line starts with its prefix; the
/// longest matching prefix wins, and among equal prefixes the one added last.
/// A rule given several responses replays them in order and repeats the last
/// one. Unmatched commands succeed silently.
///
/// ```
/// use dns_firewall::runner::{CommandRunner, ScriptedRunner};
///
/// let runner = ScriptedRunner::new()
///     .respond("systemctl is-active", "active\n")
///     .fail("rndc reload", "rndc: connect failed");
///
/// assert_eq!(runner.output("systemctl", &["is-active", "bind9"]).unwrap(), "active\n");
/// assert!(runner.output("rndc", &["reload"]).is_err());
/// assert_eq!(runner.count("systemctl"), 1);
/// ```
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: RefCell<Vec<(String, VecDeque<Scripted>)>>,
    calls: RefCell<Vec<String>>,
}

#[derive(Debug, Clone)]
enum Scripted {
    Output(CommandOutput),
    SpawnError,
}

impl ScriptedRunner {
    /// Creates a runner where every command succeeds with empty output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands starting with `prefix` succeed and print `stdout`.
    #[must_use]
    pub fn respond(self, prefix: &str, stdout: &str) -> Self {
        self.push(prefix, vec![Scripted::Output(CommandOutput::ok(stdout))])
    }

    /// Commands starting with `prefix` exit non-zero and print `stderr`.
    #[must_use]
    pub fn fail(self, prefix: &str, stderr: &str) -> Self {
        self.push(prefix, vec![Scripted::Output(CommandOutput::failed(stderr))])
    }

    /// Commands starting with `prefix` cannot be spawned.
    #[must_use]
    pub fn missing(self, prefix: &str) -> Self {
        self.push(prefix, vec![Scripted::SpawnError])
    }

    /// Commands starting with `prefix` replay `outputs` in order.
    #[must_use]
    pub fn sequence(self, prefix: &str, outputs: Vec<CommandOutput>) -> Self {
        self.push(prefix, outputs.into_iter().map(Scripted::Output).collect())
    }

    /// Every command line run so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    /// Number of recorded command lines starting with `prefix`.
    #[must_use]
    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn push(self, prefix: &str, responses: Vec<Scripted>) -> Self {
        self.rules
            .borrow_mut()
            .push((prefix.to_string(), responses.into()));
        self
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput> {
        let line = command_line(program, args);
        self.calls.borrow_mut().push(line.clone());

        let mut rules = self.rules.borrow_mut();
        let Some((_, queue)) = rules
            .iter_mut()
            .filter(|(prefix, _)| line.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
        else {
            return Ok(CommandOutput::ok(""));
        };

        let next = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        match next {
            Some(Scripted::Output(out)) => Ok(out),
            Some(Scripted::SpawnError) => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{program}: not found"),
            )),
            None => Ok(CommandOutput::ok("")),
        }
    }
}

/// Joins a program and its arguments for logs and error messages.
pub(crate) fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}
