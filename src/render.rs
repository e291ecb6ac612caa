//! Resolver configuration rendering.
//!
//! A [`PolicyDocument`] and the stored [`IdentityRecord`] become three
//! independent fragments (forwarding, policy zones, zone bodies) substituted
//! into a base template. Rendering is pure: nothing is written here.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::identity::IdentityRecord;
use crate::policy::{ORIGINAL_RESOLVER_SENTINEL, PolicyDocument};
use crate::templates;
use chrono::{DateTime, Datelike, TimeZone, Timelike};
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Reserved response-policy zone holding whitelist exceptions.
pub const PASSTHRU_ZONE: &str = "db.passthru";

/// Output of [`PolicyRenderer::render`]. Lives until written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    /// Resolver configuration text.
    pub resolver_conf: String,
    /// Passthru zone file, present iff the whitelist is non-empty.
    pub passthru_zone: Option<String>,
    /// Local TLS forwarder config, present iff forwarding over TLS.
    pub forwarder_conf: Option<String>,
}

impl RenderedConfig {
    /// Whether the local TLS forwarder should be running.
    #[must_use]
    pub const fn forward_over_tls(&self) -> bool {
        self.forwarder_conf.is_some()
    }
}

/// Renders resolver configuration.
///
/// # Example
///
/// ```rust,ignore
/// let rendered = PolicyRenderer::new(&config)?
///     .with_router_names(vec!["fritz.box".into()])
///     .render(&policy, &identity)?;
/// ```
#[derive(Debug, Clone)]
pub struct PolicyRenderer {
    base_template: String,
    passthru_zone_file: PathBuf,
    zone_cache_dir: PathBuf,
    forwarder_addr: Ipv4Addr,
    forwarder_port: u16,
    upstream_tls_port: u16,
    router_names: Vec<String>,
    serial: u32,
}

impl PolicyRenderer {
    /// Creates a renderer using the config's template (or the built-in one)
    /// and a serial stamped from the current hour.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Io`] if a custom template cannot be read.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let base_template = match &config.template_file {
            Some(path) => std::fs::read_to_string(path)?,
            None => templates::BASE.to_string(),
        };
        Ok(Self {
            base_template,
            passthru_zone_file: config.passthru_zone_file.clone(),
            zone_cache_dir: config.zone_cache_dir.clone(),
            forwarder_addr: config.forwarder_addr,
            forwarder_port: config.forwarder_port,
            upstream_tls_port: config.upstream_tls_port,
            router_names: Vec::new(),
            serial: hour_serial(&chrono::Local::now()),
        })
    }

    /// Adds forward zones for the router's names.
    #[must_use]
    pub fn with_router_names(mut self, names: Vec<String>) -> Self {
        self.router_names = names;
        self
    }

    /// Overrides the passthru zone serial.
    #[must_use]
    pub const fn with_serial(mut self, serial: u32) -> Self {
        self.serial = serial;
        self
    }

    /// Serial stamped into the passthru zone.
    #[must_use]
    pub const fn serial(&self) -> u32 {
        self.serial
    }

    /// Renders `policy` for `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidPolicy`] if the policy fails validation
    /// and [`EngineError::UnresolvedPlaceholder`] if any `{TOKEN}` survives.
    pub fn render(&self, policy: &PolicyDocument, identity: &IdentityRecord) -> Result<RenderedConfig> {
        policy.validate()?;

        let (forwarders, server) = self.forwarding_fragment(policy, identity);
        let policies = policy_fragment(policy);
        let response_policy = if policies.is_empty() {
            String::new()
        } else {
            substitute(templates::RESPONSE_POLICY, &[("POLICIES", policies.as_str())])
        };
        let zones = self.zone_body_fragment(policy);
        let forward_zones = self.forward_zone_fragment(identity);

        let subnet = identity.subnet.to_string();

        let resolver_conf = substitute(
            &self.base_template,
            &[
                ("SUBNET", subnet.as_str()),
                ("FORWARDERS", forwarders.as_str()),
                ("RESPONSE_POLICY", response_policy.as_str()),
                ("POLICIES", policies.as_str()),
                ("SERVER", server.as_str()),
                ("FORWARD_ZONES", forward_zones.as_str()),
                ("PASSTHRU_ZONE", zones.passthru.as_str()),
                ("SLAVE_ZONES", zones.slaves.as_str()),
            ],
        );
        ensure_resolved(&resolver_conf)?;

        let passthru_zone = self.passthru_zone_file_body(policy);
        if let Some(body) = &passthru_zone {
            ensure_resolved(body)?;
        }

        let forwarder_conf = policy
            .forward_over_tls
            .then(|| self.forwarder_conf(&policy.forwarders[0]));
        if let Some(conf) = &forwarder_conf {
            ensure_resolved(conf)?;
        }

        tracing::debug!(
            block_zones = policy.block_zones.len(),
            whitelist = policy.whitelist_domains.len(),
            tls = policy.forward_over_tls,
            serial = self.serial,
            "Rendered resolver configuration"
        );
        Ok(RenderedConfig {
            resolver_conf,
            passthru_zone,
            forwarder_conf,
        })
    }

    /// Forwarder list (without braces) and optional `server` statement.
    ///
    /// Over TLS the resolver forwards only to the local forwarding process;
    /// otherwise to the policy list with the sentinel replaced by the
    /// original resolver.
    #[must_use]
    pub fn forwarding_fragment(&self, policy: &PolicyDocument, identity: &IdentityRecord) -> (String, String) {
        if policy.forward_over_tls {
            let forwarders = format!("{} port {};", self.forwarder_addr, self.forwarder_port);
            let address = self.forwarder_addr.to_string();
            let server = substitute(templates::SERVER, &[("ADDRESS", address.as_str())]);
            return (forwarders, server);
        }
        let original = identity.original_resolver.to_string();
        let forwarders = policy
            .forwarders
            .iter()
            .map(|f| {
                if f == ORIGINAL_RESOLVER_SENTINEL {
                    format!("{original};")
                } else {
                    format!("{f};")
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
        (forwarders, String::new())
    }

    fn zone_body_fragment(&self, policy: &PolicyDocument) -> ZoneBodies {
        let masters = if policy.zone_masters.is_empty() {
            String::new()
        } else {
            let addresses = policy
                .zone_masters
                .iter()
                .map(|m| format!("{m};"))
                .collect::<Vec<_>>()
                .join(" ");
            substitute(templates::MASTERS, &[("ADDRESSES", addresses.as_str())])
        };

        let slaves = policy
            .block_zones
            .iter()
            .map(|zone| {
                let file = self.zone_cache_dir.join(zone).display().to_string();
                substitute(
                    templates::SLAVE_ZONE,
                    &[
                        ("NAME", zone.as_str()),
                        ("FILE", file.as_str()),
                        ("MASTERS", masters.as_str()),
                    ],
                )
            })
            .collect();

        let passthru = if policy.whitelist_domains.is_empty() {
            String::new()
        } else {
            let file = self.passthru_zone_file.display().to_string();
            substitute(
                templates::MASTER_ZONE,
                &[("NAME", PASSTHRU_ZONE), ("FILE", file.as_str())],
            )
        };
        ZoneBodies { passthru, slaves }
    }

    fn forward_zone_fragment(&self, identity: &IdentityRecord) -> String {
        let forwarder = identity.original_resolver.to_string();
        self.router_names
            .iter()
            .map(|name| {
                substitute(
                    templates::FORWARD_ZONE,
                    &[("NAME", name.as_str()), ("FORWARDER", forwarder.as_str())],
                )
            })
            .collect()
    }

    fn passthru_zone_file_body(&self, policy: &PolicyDocument) -> Option<String> {
        if policy.whitelist_domains.is_empty() {
            return None;
        }
        let serial = self.serial.to_string();
        let mut body = substitute(templates::RPZ_HEADER, &[("SERIAL", serial.as_str())]);
        for domain in &policy.whitelist_domains {
            body.push_str(domain);
            body.push_str("\tCNAME rpz-passthru.\n");
        }
        Some(body)
    }

    fn forwarder_conf(&self, upstream: &str) -> String {
        let accept = format!("{}:{}", self.forwarder_addr, self.forwarder_port);
        let connect = format!("{upstream}:{}", self.upstream_tls_port);
        substitute(
            templates::FORWARDER,
            &[
                ("ACCEPT", accept.as_str()),
                ("CONNECT", connect.as_str()),
                ("CHECK_IP", upstream),
            ],
        )
    }
}

struct ZoneBodies {
    passthru: String,
    slaves: String,
}

/// `zone "<name>";` per blocked zone in input order, preceded by the passthru
/// zone when the whitelist is non-empty.
#[must_use]
pub fn policy_fragment(policy: &PolicyDocument) -> String {
    let passthru = (!policy.whitelist_domains.is_empty()).then_some(PASSTHRU_ZONE);
    passthru
        .into_iter()
        .chain(policy.block_zones.iter().map(String::as_str))
        .map(|zone| format!("zone \"{zone}\";"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// `YYYYMMDDHH` of `now`.
#[must_use]
pub fn hour_serial<Tz: TimeZone>(now: &DateTime<Tz>) -> u32 {
    let stamp = u64::try_from(now.year()).unwrap_or(0) * 1_000_000
        + u64::from(now.month()) * 10_000
        + u64::from(now.day()) * 100
        + u64::from(now.hour());
    u32::try_from(stamp).unwrap_or(u32::MAX)
}

/// Serial strictly greater than `previous`, and at least the hour stamp.
#[must_use]
pub fn next_serial(previous: Option<u32>, hour_stamp: u32) -> u32 {
    previous.map_or(hour_stamp, |p| hour_stamp.max(p.saturating_add(1)))
}

/// Reads the serial back out of a rendered passthru zone file.
#[must_use]
pub fn read_serial(zone: &str) -> Option<u32> {
    zone.lines()
        .find(|l| l.contains("; serial"))
        .and_then(|l| l.split_whitespace().next())
        .and_then(|s| s.parse().ok())
}

fn substitute(template: &str, values: &[(&str, &str)]) -> String {
    values.iter().fold(template.to_string(), |text, (token, value)| {
        text.replace(&format!("{{{token}}}"), value)
    })
}

/// Fails on the first `{UPPER_CASE}` token left in `text`.
fn ensure_resolved(text: &str) -> Result<()> {
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let len = after
            .find(|c: char| !(c.is_ascii_uppercase() || c == '_'))
            .unwrap_or(after.len());
        if len > 0 && after[len..].starts_with('}') {
            return Err(EngineError::UnresolvedPlaceholder {
                token: format!("{{{}}}", &after[..len]),
            });
        }
        rest = after;
    }
    Ok(())
}
