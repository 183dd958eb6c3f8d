//! Per-entity network topology
//!
//! Rule derivation only ever consumes [`NetworkTopology`]: an ordered list of
//! (subnet, address mapping) pairs. Topology sources may instead hand over the
//! interface model (virtual interfaces → network → subnets); [`TopologyInput`]
//! accepts either shape and [`TopologyInput::normalize`] converts it once, at
//! the boundary where it enters the driver.

use crate::core::model::IpVersion;
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// The IPv4 and IPv6 blocks of one attached network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    #[serde(default)]
    pub cidr: Option<Ipv4Network>,
    #[serde(default)]
    pub cidr_v6: Option<Ipv6Network>,
}

/// The entity's addresses on one attached network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressMapping {
    #[serde(default)]
    pub ips: Vec<Ipv4Addr>,
    #[serde(default)]
    pub ip6s: Vec<Ipv6Addr>,
    #[serde(default)]
    pub dhcp_server: Option<Ipv4Addr>,
    #[serde(default)]
    pub gateway_v6: Option<Ipv6Addr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkBinding {
    pub subnet: Subnet,
    pub mapping: AddressMapping,
}

/// Normalized topology consumed by the compiler and scope manager
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkTopology {
    pub networks: Vec<NetworkBinding>,
}

impl NetworkTopology {
    pub fn new(networks: Vec<NetworkBinding>) -> Self {
        Self { networks }
    }

    /// Every address the entity owns for `version`, in network order.
    pub fn addresses(&self, version: IpVersion) -> Vec<IpAddr> {
        match version {
            IpVersion::V4 => self
                .networks
                .iter()
                .flat_map(|n| n.mapping.ips.iter().copied().map(IpAddr::V4))
                .collect(),
            IpVersion::V6 => self
                .networks
                .iter()
                .flat_map(|n| n.mapping.ip6s.iter().copied().map(IpAddr::V6))
                .collect(),
        }
    }
}

/// One subnet in the interface model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSubnet {
    pub cidr: IpNetwork,
    #[serde(default)]
    pub dhcp_server: Option<IpAddr>,
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub ips: Vec<IpAddr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceNetwork {
    #[serde(default)]
    pub subnets: Vec<InterfaceSubnet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualInterface {
    #[serde(default)]
    pub address: Option<String>,
    pub network: InterfaceNetwork,
}

/// Interface-model topology, as reported per virtual interface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceModel {
    pub interfaces: Vec<VirtualInterface>,
}

impl InterfaceModel {
    /// Collapses each interface into one (subnet, mapping) pair.
    ///
    /// The first IPv4 subnet provides `cidr` and the DHCP server, the first
    /// IPv6 subnet provides `cidr_v6` and the router; addresses from every
    /// subnet of the interface are kept.
    pub fn normalize(&self) -> NetworkTopology {
        let networks = self
            .interfaces
            .iter()
            .map(|vif| {
                let mut binding = NetworkBinding::default();
                for subnet in &vif.network.subnets {
                    match subnet.cidr {
                        IpNetwork::V4(net) => {
                            if binding.subnet.cidr.is_none() {
                                binding.subnet.cidr = Some(net);
                                binding.mapping.dhcp_server = subnet.dhcp_server.and_then(v4);
                            }
                        }
                        IpNetwork::V6(net) => {
                            if binding.subnet.cidr_v6.is_none() {
                                binding.subnet.cidr_v6 = Some(net);
                                binding.mapping.gateway_v6 = subnet.gateway.and_then(v6);
                            }
                        }
                    }
                    for ip in &subnet.ips {
                        match ip {
                            IpAddr::V4(addr) => binding.mapping.ips.push(*addr),
                            IpAddr::V6(addr) => binding.mapping.ip6s.push(*addr),
                        }
                    }
                }
                binding
            })
            .collect();

        NetworkTopology { networks }
    }
}

fn v4(addr: IpAddr) -> Option<Ipv4Addr> {
    match addr {
        IpAddr::V4(a) => Some(a),
        IpAddr::V6(_) => None,
    }
}

fn v6(addr: IpAddr) -> Option<Ipv6Addr> {
    match addr {
        IpAddr::V6(a) => Some(a),
        IpAddr::V4(_) => None,
    }
}

/// Topology as received from a topology source, in either shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TopologyInput {
    Normalized(NetworkTopology),
    Interfaces(InterfaceModel),
}

impl TopologyInput {
    pub fn normalize(self) -> NetworkTopology {
        match self {
            TopologyInput::Normalized(topology) => topology,
            TopologyInput::Interfaces(model) => model.normalize(),
        }
    }
}

impl From<NetworkTopology> for TopologyInput {
    fn from(topology: NetworkTopology) -> Self {
        TopologyInput::Normalized(topology)
    }
}

impl From<InterfaceModel> for TopologyInput {
    fn from(model: InterfaceModel) -> Self {
        TopologyInput::Interfaces(model)
    }
}
