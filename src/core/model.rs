//! Policy data model
//!
//! Security-group rules, provider rules and the identifiers that tie them to
//! entities. Rules keep the wire shape the policy store hands out
//! (`from_port`/`to_port` double as ICMP type/code) and expose typed views
//! ([`PortRange`], [`IcmpMatch`]) that validate on access.
//!
//! # Example
//!
//! ```
//! use sgfw::core::model::{IcmpMatch, MatchSpec, Protocol, SecurityGroupRule};
//!
//! let rule = SecurityGroupRule::cidr(Some(Protocol::Icmp), 8, -1, "0.0.0.0/0".parse().unwrap());
//! assert_eq!(rule.icmp_match().unwrap(), IcmpMatch::Type(8));
//! ```

use crate::core::error::{Error, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Port/type value meaning "any" in the wire shape
pub const WILDCARD: i32 = -1;

/// Layer-4 protocol a rule can be restricted to
///
/// A rule without a protocol (`None` in the wire shape) matches every protocol.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(try_from = "String", into = "String")]
#[strum(ascii_case_insensitive, serialize_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
}

impl Protocol {
    /// ICMP is rewritten to ICMPv6 when the rule lands in the IPv6 table.
    pub const fn for_version(self, version: IpVersion) -> Self {
        match (self, version) {
            (Protocol::Icmp, IpVersion::V6) => Protocol::Icmpv6,
            (protocol, _) => protocol,
        }
    }

    /// Name nftables uses for `meta l4proto`
    pub const fn l4proto(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::Icmpv6 => "ipv6-icmp",
        }
    }

    /// Name nftables uses for payload expressions (`tcp dport`, `icmpv6 type`)
    pub const fn payload_name(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::Icmpv6 => "icmpv6",
        }
    }

    pub const fn uses_ports(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }

    pub const fn is_icmp(self) -> bool {
        matches!(self, Protocol::Icmp | Protocol::Icmpv6)
    }
}

impl TryFrom<String> for Protocol {
    type Error = strum::ParseError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.trim().parse()
    }
}

impl From<Protocol> for String {
    fn from(protocol: Protocol) -> Self {
        protocol.as_ref().to_string()
    }
}

/// IP version; the filter tables are partitioned by it
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    #[strum(serialize = "ipv4")]
    V4,
    #[strum(serialize = "ipv6")]
    V6,
}

impl IpVersion {
    pub const fn of_network(network: &IpNetwork) -> Self {
        match network {
            IpNetwork::V4(_) => IpVersion::V4,
            IpNetwork::V6(_) => IpVersion::V6,
        }
    }

    pub const fn of_addr(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    /// nftables address family for this version
    pub const fn family(self) -> &'static str {
        match self {
            IpVersion::V4 => "ip",
            IpVersion::V6 => "ip6",
        }
    }

    /// Versions a host works with: IPv4 always, IPv6 only when enabled.
    pub fn active(enable_ipv6: bool) -> &'static [IpVersion] {
        if enable_ipv6 {
            &[IpVersion::V4, IpVersion::V6]
        } else {
            &[IpVersion::V4]
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn is_single(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// ICMP type/code selector derived from `from_port`/`to_port`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpMatch {
    /// Type is the wildcard: every message of the protocol
    Any,
    Type(u8),
    TypeCode(u8, u8),
}

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

id_newtype!(
    /// Identity of a filtered workload (one VM, one container)
    EntityId
);
id_newtype!(
    /// Identity of a security group
    GroupId
);

/// Where traffic accepted by a security-group rule may come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    Cidr(IpNetwork),
    /// Every current member of the group, expanded at compile time
    Group(GroupId),
}

/// Protocol and port/ICMP selector shared by group and provider rules
pub trait MatchSpec: fmt::Debug {
    fn protocol(&self) -> Option<Protocol>;
    fn from_port(&self) -> i32;
    fn to_port(&self) -> i32;

    /// Destination-port range for TCP/UDP rules.
    fn port_range(&self) -> Result<PortRange> {
        let (from, to) = (self.from_port(), self.to_port());
        crate::validators::validate_port_bounds(from, to)
            .map(|(start, end)| PortRange { start, end })
            .map_err(|reason| Error::invalid_rule(self, reason))
    }

    /// Type/code selector for ICMP rules.
    fn icmp_match(&self) -> Result<IcmpMatch> {
        let icmp_type = crate::validators::validate_icmp_value(self.from_port(), "type")
            .map_err(|reason| Error::invalid_rule(self, reason))?;
        let icmp_code = crate::validators::validate_icmp_value(self.to_port(), "code")
            .map_err(|reason| Error::invalid_rule(self, reason))?;

        Ok(match (icmp_type, icmp_code) {
            (None, _) => IcmpMatch::Any,
            (Some(t), None) => IcmpMatch::Type(t),
            (Some(t), Some(c)) => IcmpMatch::TypeCode(t, c),
        })
    }
}

fn wildcard() -> i32 {
    WILDCARD
}

/// One ACCEPT rule of a security group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupRule {
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default = "wildcard")]
    pub from_port: i32,
    #[serde(default = "wildcard")]
    pub to_port: i32,
    #[serde(default)]
    pub source: Option<RuleSource>,
}

impl SecurityGroupRule {
    pub fn cidr(protocol: Option<Protocol>, from_port: i32, to_port: i32, cidr: IpNetwork) -> Self {
        Self {
            protocol,
            from_port,
            to_port,
            source: Some(RuleSource::Cidr(cidr)),
        }
    }

    pub fn group(
        protocol: Option<Protocol>,
        from_port: i32,
        to_port: i32,
        group: impl Into<GroupId>,
    ) -> Self {
        Self {
            protocol,
            from_port,
            to_port,
            source: Some(RuleSource::Group(group.into())),
        }
    }

    /// IP version implied by a CIDR source; group sources have none.
    pub fn ip_version(&self) -> Option<IpVersion> {
        match &self.source {
            Some(RuleSource::Cidr(net)) => Some(IpVersion::of_network(net)),
            _ => None,
        }
    }

    /// Rejects rules that cannot describe any traffic.
    pub fn validate(&self) -> Result<()> {
        if self.source.is_none() && self.protocol.is_none() {
            return Err(Error::invalid_rule(self, "rule has neither a source nor a protocol"));
        }
        match self.protocol {
            Some(p) if p.uses_ports() => self.port_range().map(|_| ()),
            Some(p) if p.is_icmp() => self.icmp_match().map(|_| ()),
            _ => Ok(()),
        }
    }
}

impl MatchSpec for SecurityGroupRule {
    fn protocol(&self) -> Option<Protocol> {
        self.protocol
    }

    fn from_port(&self) -> i32 {
        self.from_port
    }

    fn to_port(&self) -> i32 {
        self.to_port
    }
}

/// Provider-wide DROP rule, applied ahead of any security group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRule {
    pub protocol: Protocol,
    #[serde(default = "wildcard")]
    pub from_port: i32,
    #[serde(default = "wildcard")]
    pub to_port: i32,
    pub cidr: IpNetwork,
}

impl ProviderRule {
    pub fn new(protocol: Protocol, from_port: i32, to_port: i32, cidr: IpNetwork) -> Self {
        Self {
            protocol,
            from_port,
            to_port,
            cidr,
        }
    }

    pub fn ip_version(&self) -> IpVersion {
        IpVersion::of_network(&self.cidr)
    }
}

impl MatchSpec for ProviderRule {
    fn protocol(&self) -> Option<Protocol> {
        Some(self.protocol)
    }

    fn from_port(&self) -> i32 {
        self.from_port
    }

    fn to_port(&self) -> i32 {
        self.to_port
    }
}
