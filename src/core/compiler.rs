//! Policy rule compiler
//!
//! Turns an entity's topology and the security-group rules attached to it
//! into the ordered IPv4 and IPv6 rule lists of its chain.
//!
//! # Rule Order
//!
//! Every list starts with the same prelude:
//!
//! 1. Drop `ct state invalid`
//! 2. Accept `ct state established,related`
//! 3. Jump to the provider chain
//!
//! followed by DHCP replies (IPv4), same-network traffic (optional), IPv6
//! router advertisements, then one or more ACCEPT fragments per group rule in
//! policy-store order, and finally a jump to the fallback (default-deny)
//! chain. The packet filter evaluates first-match-wins, so nothing here is
//! sorted or deduplicated.
//!
//! With IPv6 disabled the IPv6 list holds only the prelude and the fallback
//! jump; the scope manager does not apply it.

use crate::config::FirewallConfig;
use crate::core::error::Result;
use crate::core::fragment::{CtState, Fragment, Match, Verdict, host_network, sourced_fragments};
use crate::core::model::{EntityId, IpVersion, Protocol, RuleSource, SecurityGroupRule};
use crate::core::policy::PolicyStore;
use crate::core::sink::{FALLBACK_CHAIN, PROVIDER_CHAIN};
use crate::core::topology::NetworkTopology;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use tracing::debug;

/// Compiled contents of one scope, per IP version
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledRules {
    pub ipv4: Vec<Fragment>,
    pub ipv6: Vec<Fragment>,
}

impl CompiledRules {
    pub fn for_version(&self, version: IpVersion) -> &[Fragment] {
        match version {
            IpVersion::V4 => &self.ipv4,
            IpVersion::V6 => &self.ipv6,
        }
    }

    pub fn for_version_mut(&mut self, version: IpVersion) -> &mut Vec<Fragment> {
        match version {
            IpVersion::V4 => &mut self.ipv4,
            IpVersion::V6 => &mut self.ipv6,
        }
    }

    pub fn len(&self) -> usize {
        self.ipv4.len() + self.ipv6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ipv4.is_empty() && self.ipv6.is_empty()
    }
}

/// Compiles entity scopes; a pure function of its inputs and the config it was built with
#[derive(Debug, Clone, Copy)]
pub struct RuleCompiler {
    enable_ipv6: bool,
    allow_same_network_traffic: bool,
}

impl RuleCompiler {
    pub fn new(config: &FirewallConfig) -> Self {
        Self {
            enable_ipv6: config.enable_ipv6,
            allow_same_network_traffic: config.allow_same_network_traffic,
        }
    }

    pub fn enable_ipv6(&self) -> bool {
        self.enable_ipv6
    }

    /// Compiles the complete rule lists for `entity`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the policy store fails, a rule is invalid, or a
    /// group-sourced rule cannot resolve its members. Nothing is partially
    /// returned.
    pub fn compile(
        &self,
        entity: &EntityId,
        topology: &NetworkTopology,
        store: &dyn PolicyStore,
    ) -> Result<CompiledRules> {
        let mut rules = CompiledRules::default();

        Self::add_basic_rules(&mut rules);
        Self::add_dhcp_rules(&mut rules.ipv4, topology);

        if self.allow_same_network_traffic {
            self.add_same_network_rules(&mut rules, topology);
        }

        if self.enable_ipv6 {
            Self::add_router_advertisement_rules(&mut rules.ipv6, topology);
        }

        for group in store.security_groups_for_entity(entity)? {
            for rule in store.rules_for_group(&group)? {
                debug!(%entity, %group, ?rule, "Adding security group rule");
                self.add_group_rule(&rule, store, &mut rules)?;
            }
        }

        rules.ipv4.push(Fragment::jump(FALLBACK_CHAIN));
        rules.ipv6.push(Fragment::jump(FALLBACK_CHAIN));

        debug!(
            %entity,
            ipv4 = rules.ipv4.len(),
            ipv6 = rules.ipv6.len(),
            "Compiled entity rules"
        );
        Ok(rules)
    }

    fn add_basic_rules(rules: &mut CompiledRules) {
        for list in [&mut rules.ipv4, &mut rules.ipv6] {
            list.push(Fragment::new(
                vec![Match::CtState(vec![CtState::Invalid])],
                Verdict::Drop,
            ));
            list.push(Fragment::new(
                vec![Match::CtState(vec![CtState::Established, CtState::Related])],
                Verdict::Accept,
            ));
            list.push(Fragment::jump(PROVIDER_CHAIN));
        }
    }

    fn add_dhcp_rules(ipv4: &mut Vec<Fragment>, topology: &NetworkTopology) {
        for server in topology
            .networks
            .iter()
            .filter_map(|n| n.mapping.dhcp_server)
        {
            ipv4.push(Fragment::new(
                vec![
                    Match::SourceNet(host_network(IpAddr::V4(server))),
                    Match::Protocol(Protocol::Udp),
                    Match::SourcePort {
                        protocol: Protocol::Udp,
                        port: 67,
                    },
                    Match::DestPort {
                        protocol: Protocol::Udp,
                        ports: crate::core::model::PortRange::single(68),
                    },
                ],
                Verdict::Accept,
            ));
        }
    }

    fn add_same_network_rules(&self, rules: &mut CompiledRules, topology: &NetworkTopology) {
        for cidr in topology.networks.iter().filter_map(|n| n.subnet.cidr) {
            rules.ipv4.push(Fragment::new(
                vec![Match::SourceNet(IpNetwork::V4(cidr))],
                Verdict::Accept,
            ));
        }

        if self.enable_ipv6 {
            for cidr in topology.networks.iter().filter_map(|n| n.subnet.cidr_v6) {
                rules.ipv6.push(Fragment::new(
                    vec![Match::SourceNet(IpNetwork::V6(cidr))],
                    Verdict::Accept,
                ));
            }
        }
    }

    fn add_router_advertisement_rules(ipv6: &mut Vec<Fragment>, topology: &NetworkTopology) {
        for gateway in topology
            .networks
            .iter()
            .filter_map(|n| n.mapping.gateway_v6)
        {
            ipv6.push(Fragment::new(
                vec![
                    Match::SourceNet(host_network(IpAddr::V6(gateway))),
                    Match::Protocol(Protocol::Icmpv6),
                ],
                Verdict::Accept,
            ));
        }
    }

    fn add_group_rule(
        &self,
        rule: &SecurityGroupRule,
        store: &dyn PolicyStore,
        rules: &mut CompiledRules,
    ) -> Result<()> {
        rule.validate()?;

        match &rule.source {
            Some(RuleSource::Cidr(cidr)) => {
                let version = IpVersion::of_network(cidr);
                if version == IpVersion::V6 && !self.enable_ipv6 {
                    debug!(%cidr, "Skipping IPv6 rule, IPv6 disabled");
                    return Ok(());
                }
                debug!(%cidr, "Using cidr");
                let fragments = sourced_fragments(rule, version, &[*cidr], &Verdict::Accept)?;
                rules.for_version_mut(version).extend(fragments);
            }
            Some(RuleSource::Group(group)) => {
                for &version in IpVersion::active(self.enable_ipv6) {
                    let members: Vec<IpNetwork> = store
                        .member_addresses(group, version)?
                        .into_iter()
                        .map(host_network)
                        .collect();
                    debug!(%group, %version, ?members, "Expanded group members");
                    let fragments = sourced_fragments(rule, version, &members, &Verdict::Accept)?;
                    rules.for_version_mut(version).extend(fragments);
                }
            }
            None => {
                debug!(?rule, "Rule has no source, nothing to accept");
            }
        }
        Ok(())
    }
}
