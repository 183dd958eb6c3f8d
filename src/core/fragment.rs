//! Rule fragments and the primitive builders that produce them
//!
//! A [`Fragment`] is one filter rule: an ordered list of [`Match`]es and a
//! [`Verdict`]. It renders to nftables text (`Display`) for previews and to
//! nftables JSON expressions ([`Fragment::to_nft_exprs`]) for the batch that
//! goes to `nft --json -f -`. Match order is preserved in both renderings.
//!
//! The builders in this module are pure: one policy rule plus a target IP
//! version in, zero or more fragments out.

use crate::core::error::{Error, Result};
use crate::core::model::{IcmpMatch, IpVersion, MatchSpec, PortRange, Protocol};
use ipnetwork::IpNetwork;
use serde_json::{Value, json};
use std::fmt;
use std::net::IpAddr;

/// Connection-tracking state
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum CtState {
    Invalid,
    Established,
    Related,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Match {
    CtState(Vec<CtState>),
    Protocol(Protocol),
    SourceNet(IpNetwork),
    DestAddr(IpAddr),
    SourcePort { protocol: Protocol, port: u16 },
    DestPort { protocol: Protocol, ports: PortRange },
    IcmpType { protocol: Protocol, icmp_type: u8 },
    IcmpCode { protocol: Protocol, code: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
    Jump(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub matches: Vec<Match>,
    pub verdict: Verdict,
}

impl Fragment {
    pub fn new(matches: Vec<Match>, verdict: Verdict) -> Self {
        Self { matches, verdict }
    }

    pub fn jump(chain: &str) -> Self {
        Self::new(Vec::new(), Verdict::Jump(chain.to_string()))
    }

    pub fn jumps_to(&self, chain: &str) -> bool {
        matches!(&self.verdict, Verdict::Jump(target) if target == chain)
    }

    /// nftables JSON expressions for this rule (matches, then the verdict)
    pub fn to_nft_exprs(&self) -> Vec<Value> {
        let mut exprs: Vec<Value> = self.matches.iter().map(Match::to_nft_expr).collect();
        exprs.push(self.verdict.to_nft_expr());
        exprs
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for m in &self.matches {
            write!(f, "{m} ")?;
        }
        write!(f, "{}", self.verdict)
    }
}

/// Creates a `{"match": ...}` expression with `==`
fn eq_match(left: Value, right: Value) -> Value {
    json!({
        "match": {
            "left": left,
            "op": "==",
            "right": right
        }
    })
}

fn payload(protocol: &str, field: &str) -> Value {
    json!({ "payload": { "protocol": protocol, "field": field } })
}

impl Match {
    pub fn to_nft_expr(&self) -> Value {
        match self {
            Match::CtState(states) => {
                let names: Vec<&str> = states.iter().map(AsRef::as_ref).collect();
                let right = if names.len() == 1 {
                    json!(names)
                } else {
                    json!({ "set": names })
                };
                eq_match(json!({ "ct": { "key": "state" } }), right)
            }
            Match::Protocol(p) => eq_match(json!({ "meta": { "key": "l4proto" } }), json!(p.l4proto())),
            Match::SourceNet(net) => eq_match(
                payload(IpVersion::of_network(net).family(), "saddr"),
                network_value(net),
            ),
            Match::DestAddr(addr) => eq_match(
                payload(IpVersion::of_addr(addr).family(), "daddr"),
                json!(addr.to_string()),
            ),
            Match::SourcePort { protocol, port } => {
                eq_match(payload(protocol.payload_name(), "sport"), json!(port))
            }
            Match::DestPort { protocol, ports } => {
                let right = if ports.is_single() {
                    json!(ports.start)
                } else {
                    json!({ "range": [ports.start, ports.end] })
                };
                eq_match(payload(protocol.payload_name(), "dport"), right)
            }
            Match::IcmpType {
                protocol,
                icmp_type,
            } => eq_match(payload(protocol.payload_name(), "type"), json!(icmp_type)),
            Match::IcmpCode { protocol, code } => {
                eq_match(payload(protocol.payload_name(), "code"), json!(code))
            }
        }
    }
}

/// Host routes stay plain addresses; anything wider becomes a prefix expression
fn network_value(net: &IpNetwork) -> Value {
    let host_prefix = match net {
        IpNetwork::V4(_) => 32,
        IpNetwork::V6(_) => 128,
    };
    if net.prefix() == host_prefix {
        json!(net.ip().to_string())
    } else {
        json!({ "prefix": { "addr": net.network().to_string(), "len": net.prefix() } })
    }
}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Match::CtState(states) => {
                let names: Vec<&str> = states.iter().map(AsRef::as_ref).collect();
                write!(f, "ct state {}", names.join(","))
            }
            Match::Protocol(p) => write!(f, "meta l4proto {}", p.l4proto()),
            Match::SourceNet(net) => write!(f, "{} saddr {net}", IpVersion::of_network(net).family()),
            Match::DestAddr(addr) => write!(f, "{} daddr {addr}", IpVersion::of_addr(addr).family()),
            Match::SourcePort { protocol, port } => {
                write!(f, "{} sport {port}", protocol.payload_name())
            }
            Match::DestPort { protocol, ports } => {
                write!(f, "{} dport {ports}", protocol.payload_name())
            }
            Match::IcmpType {
                protocol,
                icmp_type,
            } => write!(f, "{} type {icmp_type}", protocol.payload_name()),
            Match::IcmpCode { protocol, code } => {
                write!(f, "{} code {code}", protocol.payload_name())
            }
        }
    }
}

impl Verdict {
    pub fn to_nft_expr(&self) -> Value {
        match self {
            Verdict::Accept => json!({ "accept": null }),
            Verdict::Drop => json!({ "drop": null }),
            Verdict::Jump(target) => json!({ "jump": { "target": target } }),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Accept => f.write_str("accept"),
            Verdict::Drop => f.write_str("drop"),
            Verdict::Jump(target) => write!(f, "jump {target}"),
        }
    }
}

/// `/32` or `/128` network for a single address
pub fn host_network(addr: IpAddr) -> IpNetwork {
    IpNetwork::from(addr)
}

/// Destination-port match: a single-port match when the range is one port wide.
pub fn port_matches(protocol: Protocol, ports: PortRange) -> Vec<Match> {
    vec![Match::DestPort { protocol, ports }]
}

/// ICMP selector matches for an already version-adjusted ICMP protocol.
///
/// The wildcard type emits nothing, a type emits a type match, and a code adds
/// a code match after it.
pub fn icmp_matches(protocol: Protocol, selector: IcmpMatch) -> Vec<Match> {
    match selector {
        IcmpMatch::Any => Vec::new(),
        IcmpMatch::Type(icmp_type) => vec![Match::IcmpType {
            protocol,
            icmp_type,
        }],
        IcmpMatch::TypeCode(icmp_type, code) => vec![
            Match::IcmpType {
                protocol,
                icmp_type,
            },
            Match::IcmpCode { protocol, code },
        ],
    }
}

/// Protocol, port and ICMP matches of a rule targeted at `version`.
///
/// Rules without a protocol produce no matches at all.
pub fn protocol_matches(spec: &dyn MatchSpec, version: IpVersion) -> Result<Vec<Match>> {
    let Some(protocol) = spec.protocol() else {
        return Ok(Vec::new());
    };
    let protocol = protocol.for_version(version);

    let mut matches = vec![Match::Protocol(protocol)];
    if protocol.uses_ports() {
        matches.extend(port_matches(protocol, spec.port_range()?));
    } else if protocol.is_icmp() {
        matches.extend(icmp_matches(protocol, spec.icmp_match()?));
    }
    Ok(matches)
}

/// One fragment per source network, each ending in `verdict`.
///
/// All sources must be of `version`; the caller sorts sources by version.
pub fn sourced_fragments(
    spec: &dyn MatchSpec,
    version: IpVersion,
    sources: &[IpNetwork],
    verdict: &Verdict,
) -> Result<Vec<Fragment>> {
    let base = protocol_matches(spec, version)?;

    sources
        .iter()
        .map(|source| {
            if IpVersion::of_network(source) != version {
                return Err(Error::invalid_rule(
                    spec,
                    format!("source {source} does not belong to {version}"),
                ));
            }
            let mut matches = base.clone();
            matches.push(Match::SourceNet(*source));
            Ok(Fragment::new(matches, verdict.clone()))
        })
        .collect()
}
