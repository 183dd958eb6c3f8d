#[cfg(test)]
mod tests_impl {
    use crate::core::compiler::RuleCompiler;
    use crate::core::model::{Protocol, ProviderRule, SecurityGroupRule};
    use crate::core::nft_json::render_tables;
    use crate::core::policy::InMemoryPolicyStore;
    use crate::core::scope::chain_name;
    use crate::core::sink::{FilterSink, MemorySink, Table, TableSet};
    use crate::core::test_helpers::{config, dual_stack_topology, single_subnet_topology};
    use crate::core::topology::NetworkTopology;
    use crate::core::{coordinator::ApplyCoordinator, model::IpVersion, scope::ScopeManager};
    use std::sync::Arc;

    fn web_store() -> InMemoryPolicyStore {
        let store = InMemoryPolicyStore::new();
        store.attach("vm-1", "web");
        store.set_group_rules(
            "web",
            vec![
                SecurityGroupRule::cidr(Some(Protocol::Tcp), 80, 80, "0.0.0.0/0".parse().unwrap()),
                SecurityGroupRule::cidr(Some(Protocol::Tcp), 8000, 8080, "192.168.0.0/16".parse().unwrap()),
                SecurityGroupRule::cidr(Some(Protocol::Icmp), 8, -1, "0.0.0.0/0".parse().unwrap()),
            ],
        );
        store
    }

    #[test]
    fn test_group_rules_keep_store_order() {
        let rules = RuleCompiler::new(&config(false, false))
            .compile(&"vm-1".into(), &single_subnet_topology(), &web_store())
            .unwrap();

        let v4: Vec<String> = rules.ipv4.iter().map(ToString::to_string).collect();
        assert_eq!(
            v4,
            [
                "ct state invalid drop",
                "ct state established,related accept",
                "jump provider",
                "ip saddr 10.0.0.1/32 meta l4proto udp udp sport 67 udp dport 68 accept",
                "meta l4proto tcp tcp dport 80 ip saddr 0.0.0.0/0 accept",
                "meta l4proto tcp tcp dport 8000-8080 ip saddr 192.168.0.0/16 accept",
                "meta l4proto icmp icmp type 8 ip saddr 0.0.0.0/0 accept",
                "jump sg-fallback",
            ]
        );
    }

    #[test]
    fn test_compiled_scope_renders_to_nft_batch() {
        let store = Arc::new(web_store());
        let sink = MemorySink::new();
        let journal = sink.journal();
        let coordinator = Arc::new(ApplyCoordinator::new(Box::new(sink)));
        coordinator
            .mutate(|sink| {
                let table = Table::filter(IpVersion::V4);
                for chain in ["forward", "local", "provider", "sg-fallback"] {
                    sink.add_chain(table, chain);
                }
                Ok(())
            })
            .unwrap();

        let scopes = ScopeManager::new(&config(false, false), store, coordinator);
        scopes.prepare(&"vm-1".into(), single_subnet_topology()).unwrap();

        let tables: TableSet = journal.last().unwrap();
        let json = render_tables(&tables, "sgfw");
        let nft = json["nftables"].as_array().unwrap();

        assert!(nft[0].get("metainfo").is_some());
        assert_eq!(nft[1]["add"]["table"]["family"], "ip");
        assert!(nft[2].get("delete").is_some());

        let inst = chain_name(&"vm-1".into());
        let chain_rules: Vec<&serde_json::Value> = nft
            .iter()
            .filter(|item| item["add"]["rule"]["chain"] == inst.as_str())
            .collect();
        assert_eq!(chain_rules.len(), 8);

        // only the ip table is populated, ip6 never appears
        assert!(!nft.iter().any(|item| item["add"]["table"]["family"] == "ip6"));
    }

    #[test]
    fn test_provider_rules_compile_to_drops() {
        let store = InMemoryPolicyStore::new();
        store.set_provider_rules(vec![
            ProviderRule::new(Protocol::Tcp, 25, 25, "0.0.0.0/0".parse().unwrap()),
            ProviderRule::new(Protocol::Udp, 53, 53, "2001:db8::/32".parse().unwrap()),
        ]);
        let sink = MemorySink::new();
        let coordinator = Arc::new(ApplyCoordinator::new(Box::new(sink)));
        let manager = crate::core::provider::ProviderRuleManager::new(Arc::new(store), coordinator, true);

        let rules = manager.compile().unwrap();
        assert_eq!(
            rules.ipv4[0].to_string(),
            "meta l4proto tcp tcp dport 25 ip saddr 0.0.0.0/0 drop"
        );
        assert_eq!(
            rules.ipv6[0].to_string(),
            "meta l4proto udp udp dport 53 ip6 saddr 2001:db8::/32 drop"
        );
    }

    #[test]
    fn test_dual_stack_icmp_rule_follows_version() {
        let store = InMemoryPolicyStore::new();
        store.attach("vm-1", "ping");
        store.attach("vm-2", "peers");
        store.set_addresses("vm-2", vec!["10.0.0.6".parse().unwrap(), "fd00::6".parse().unwrap()]);
        store.set_group_rules(
            "ping",
            vec![SecurityGroupRule::group(Some(Protocol::Icmp), 128, 0, "peers")],
        );

        let rules = RuleCompiler::new(&config(true, false))
            .compile(&"vm-1".into(), &dual_stack_topology(), &store)
            .unwrap();

        assert!(rules.ipv4.iter().any(|r| r.to_string()
            == "meta l4proto icmp icmp type 128 icmp code 0 ip saddr 10.0.0.6/32 accept"));
        assert!(rules.ipv6.iter().any(|r| r.to_string()
            == "meta l4proto ipv6-icmp icmpv6 type 128 icmpv6 code 0 ip6 saddr fd00::6/128 accept"));
    }

    #[test]
    fn test_empty_group_contributes_nothing() {
        let store = InMemoryPolicyStore::new();
        store.attach("vm-1", "web");
        store.set_group_rules(
            "web",
            vec![SecurityGroupRule::group(Some(Protocol::Tcp), 22, 22, "nobody")],
        );

        let rules = RuleCompiler::new(&config(true, false))
            .compile(&"vm-1".into(), &NetworkTopology::default(), &store)
            .unwrap();
        assert_eq!(rules.ipv4.len(), 4);
        assert_eq!(rules.ipv6.len(), 4);
    }
}

#[cfg(test)]
mod property_tests {
    use crate::core::compiler::RuleCompiler;
    use crate::core::fragment::{Match, Verdict, sourced_fragments};
    use crate::core::model::{IpVersion, Protocol, SecurityGroupRule};
    use crate::core::policy::InMemoryPolicyStore;
    use crate::core::test_helpers::{config, dual_stack_topology};
    use ipnetwork::IpNetwork;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    prop_compose! {
        fn arb_v4_network()(addr in any::<u32>(), prefix in 0u8..=32) -> IpNetwork {
            IpNetwork::new(Ipv4Addr::from(addr).into(), prefix).unwrap()
        }
    }

    prop_compose! {
        fn arb_port_rule()(
            tcp in any::<bool>(),
            start in 0i32..=65535,
            width in 0i32..1000,
            source in arb_v4_network(),
        ) -> SecurityGroupRule {
            let protocol = if tcp { Protocol::Tcp } else { Protocol::Udp };
            SecurityGroupRule::cidr(Some(protocol), start, (start + width).min(65535), source)
        }
    }

    prop_compose! {
        fn arb_icmp_rule()(
            icmp_type in -1i32..=255,
            icmp_code in -1i32..=255,
            source in arb_v4_network(),
        ) -> SecurityGroupRule {
            SecurityGroupRule::cidr(Some(Protocol::Icmp), icmp_type, icmp_code, source)
        }
    }

    fn arb_rule() -> impl Strategy<Value = SecurityGroupRule> {
        prop_oneof![arb_port_rule(), arb_icmp_rule()]
    }

    proptest! {
        #[test]
        fn single_port_never_renders_range(port in 0i32..=65535, source in arb_v4_network()) {
            let rule = SecurityGroupRule::cidr(Some(Protocol::Tcp), port, port, source);
            let frags = sourced_fragments(&rule, IpVersion::V4, &[source], &Verdict::Accept).unwrap();

            prop_assert_eq!(frags.len(), 1);
            let text = frags[0].to_string();
            let expected = format!("tcp dport {port} ");
            prop_assert!(text.contains(&expected));
            prop_assert!(frags[0].to_nft_exprs()[1]["match"]["right"].get("range").is_none());
        }

        #[test]
        fn icmp_selector_matches_wildcards(rule in arb_icmp_rule()) {
            let frags = sourced_fragments(&rule, IpVersion::V4, &[rule_source(&rule)], &Verdict::Accept).unwrap();
            let matches = &frags[0].matches;

            let has_type = matches.iter().any(|m| matches!(m, Match::IcmpType { .. }));
            let has_code = matches.iter().any(|m| matches!(m, Match::IcmpCode { .. }));

            // a wildcard type ignores the code entirely
            prop_assert_eq!(has_type, rule.from_port != -1);
            prop_assert_eq!(has_code, rule.from_port != -1 && rule.to_port != -1);
        }

        #[test]
        fn compile_is_deterministic(rules in proptest::collection::vec(arb_rule(), 0..8)) {
            let store = InMemoryPolicyStore::new();
            store.attach("vm-1", "g");
            store.set_group_rules("g", rules);
            let compiler = RuleCompiler::new(&config(true, true));

            let first = compiler.compile(&"vm-1".into(), &dual_stack_topology(), &store).unwrap();
            let second = compiler.compile(&"vm-1".into(), &dual_stack_topology(), &store).unwrap();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prelude_first_and_fallback_last(
            rules in proptest::collection::vec(arb_rule(), 0..8),
            enable_ipv6 in any::<bool>(),
            same_network in any::<bool>(),
        ) {
            let store = InMemoryPolicyStore::new();
            store.attach("vm-1", "g");
            store.set_group_rules("g", rules.clone());
            let compiled = RuleCompiler::new(&config(enable_ipv6, same_network))
                .compile(&"vm-1".into(), &dual_stack_topology(), &store)
                .unwrap();

            for list in [&compiled.ipv4, &compiled.ipv6] {
                let text: Vec<String> = list.iter().map(ToString::to_string).collect();
                prop_assert_eq!(&text[0], "ct state invalid drop");
                prop_assert_eq!(&text[1], "ct state established,related accept");
                prop_assert_eq!(&text[2], "jump provider");
                prop_assert_eq!(text.last().unwrap(), "jump sg-fallback");
            }

            // prelude, DHCP, optional same-network, one per CIDR rule, fallback
            let prefix = if same_network { 6 } else { 5 };
            prop_assert_eq!(compiled.ipv4.len(), prefix + rules.len());
        }

        #[test]
        fn ipv6_disabled_keeps_only_prelude_and_fallback(
            rules in proptest::collection::vec(arb_rule(), 0..8),
            same_network in any::<bool>(),
        ) {
            let store = InMemoryPolicyStore::new();
            store.attach("vm-1", "g");
            store.set_group_rules("g", rules);
            let compiled = RuleCompiler::new(&config(false, same_network))
                .compile(&"vm-1".into(), &dual_stack_topology(), &store)
                .unwrap();

            let v6: Vec<String> = compiled.ipv6.iter().map(ToString::to_string).collect();
            prop_assert_eq!(
                v6,
                [
                    "ct state invalid drop",
                    "ct state established,related accept",
                    "jump provider",
                    "jump sg-fallback",
                ]
            );
        }
    }

    fn rule_source(rule: &SecurityGroupRule) -> IpNetwork {
        match &rule.source {
            Some(crate::core::model::RuleSource::Cidr(net)) => *net,
            _ => unreachable!("strategies only build cidr rules"),
        }
    }
}
