//! Built-in configuration templates.
//!
//! Placeholders are `{UPPER_CASE}` tokens. Anything still matching that shape
//! after rendering is an error, so templates must not use it for other text.

/// Resolver (`named.conf`) base template.
pub const BASE: &str = r#"// Generated by dns-firewall. Local changes are overwritten on every reload.
include "/etc/bind/named.conf.default-zones";

acl "trusted" {
	{SUBNET};
	localhost;
	localnets;
};

options {
	directory "/var/cache/bind";

	recursion yes;
	allow-query { trusted; };
	allow-recursion { trusted; };
	allow-transfer { none; };

	forwarders { {FORWARDERS} };
	forward only;

	dnssec-validation auto;
	listen-on-v6 { any; };
{RESPONSE_POLICY}};
{SERVER}{FORWARD_ZONES}{PASSTHRU_ZONE}{SLAVE_ZONES}"#;

/// `response-policy` statement inside `options`.
pub const RESPONSE_POLICY: &str = "\n\tresponse-policy { {POLICIES} };\n";

/// Server statement for the local TLS forwarder.
pub const SERVER: &str = r#"
server {ADDRESS} {
	tcp-only yes;
};
"#;

/// Forward zone keeping the router reachable by name.
pub const FORWARD_ZONE: &str = r#"
zone "{NAME}" {
	type forward;
	forward only;
	forwarders { {FORWARDER}; };
};
"#;

/// Block zone transferred from a remote authority.
pub const SLAVE_ZONE: &str = r#"
zone "{NAME}" {
	type slave;
	file "{FILE}";
{MASTERS}	allow-query { none; };
};
"#;

/// `masters` clause of [`SLAVE_ZONE`].
pub const MASTERS: &str = "\tmasters { {ADDRESSES} };\n";

/// Locally authoritative passthru zone.
pub const MASTER_ZONE: &str = r#"
zone "{NAME}" {
	type master;
	file "{FILE}";
	allow-query { none; };
};
"#;

/// Header of the generated response-policy zone file.
pub const RPZ_HEADER: &str = "$TTL 60
@\tIN\tSOA\tlocalhost. root.localhost. (
\t\t{SERIAL}\t; serial
\t\t3600\t\t; refresh
\t\t300\t\t; retry
\t\t604800\t\t; expire
\t\t60 )\t\t; negative cache ttl
\tIN\tNS\tlocalhost.
";

/// Local TLS forwarding process config.
pub const FORWARDER: &str = "; Generated by dns-firewall.
[dns-over-tls]
client = yes
accept = {ACCEPT}
connect = {CONNECT}
verifyChain = yes
checkIP = {CHECK_IP}
CApath = /etc/ssl/certs
";
