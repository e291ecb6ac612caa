//! # dns-firewall
//!
//! Network identity and DNS policy configuration for a small DNS-filtering
//! appliance.
//!
//! The engine claims a stable static address once, then renders the
//! filtering policy (forwarders, DNS-over-TLS, blocked response-policy zones,
//! whitelist exceptions) into a BIND9 configuration and applies it. Every
//! step that mutates the host is paired with a way back: the DHCP client
//! config is backed up before it changes and restored if the network fails
//! to come back, and resolver config is validated as a staged copy before it
//! replaces the live one.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use dns_firewall::{Engine, EngineConfig, ResolverChoice};
//!
//! let engine = Engine::system(EngineConfig::new());
//!
//! // Once: pick a free address, persist it, switch dhcpcd to it.
//! let identity = engine.establish_identity(ResolverChoice::SelfHosted)?;
//!
//! // On every policy change: render /etc/dns-fw/fw.conf.json and reload.
//! engine.apply_policy()?;
//!
//! // Uninstall: stop services, restore dhcpcd.conf and named.conf.
//! engine.remove()?;
//! ```
//!
//! ## External tools
//!
//! `ip`, `nmap`, `dig`, `systemctl`, `named-checkconf`, and `rndc` must be
//! installed. All of them are driven through [`CommandRunner`], so tests can
//! substitute a [`ScriptedRunner`].
//!
//! ## Concurrency
//!
//! Operations are strictly sequential and blocking. Each top-level operation
//! holds an exclusive `flock` on a PID-marked lock file so two runs never
//! interleave their backup-then-mutate sequences.
//!
//! ## Permissions
//!
//! Writing under `/etc` and driving systemd requires root. The caller is
//! responsible for privilege elevation.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod allocator;
pub mod config;
pub mod dhcp;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod identity;
pub mod lock;
pub mod policy;
pub mod reload;
pub mod render;
pub mod runner;
pub mod scan;
pub mod service;
pub mod state;
pub mod templates;
pub mod util;

pub use allocator::allocate;
pub use config::{EngineConfig, ServiceNames};
pub use dhcp::{ConfigureOutcome, DhcpConfigurator, RevertOutcome};
pub use discovery::{NetworkTopology, discover};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use identity::{IdentityRecord, ResolverChoice};
pub use lock::EngineLock;
pub use policy::PolicyDocument;
pub use reload::ReloadOrchestrator;
pub use render::{PolicyRenderer, RenderedConfig};
pub use runner::{CommandOutput, CommandRunner, ScriptedRunner, SystemRunner};
pub use scan::ActiveHostSet;
pub use state::InstallStateStore;
