//! Provider rule manager
//!
//! The provider chain is a global blacklist consulted from every entity chain
//! before any security-group rule. It is never diffed: each refresh empties
//! the chain and rebuilds it from the full set of provider rules.
//!
//! Rules are compiled outside the rule-table lock, so two rebuilds can finish
//! compiling in either order. Each compile is stamped with a generation taken
//! before it reads the store, and a rebuild older than the installed one is
//! dropped.

use crate::core::compiler::CompiledRules;
use crate::core::coordinator::ApplyCoordinator;
use crate::core::error::Result;
use crate::core::fragment::{Verdict, sourced_fragments};
use crate::core::model::IpVersion;
use crate::core::policy::PolicyStore;
use crate::core::sink::{FilterSink, PROVIDER_CHAIN, Table};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

pub struct ProviderRuleManager {
    store: Arc<dyn PolicyStore>,
    coordinator: Arc<ApplyCoordinator>,
    enable_ipv6: bool,
    issued: AtomicU64,
    installed: AtomicU64,
}

impl ProviderRuleManager {
    pub fn new(
        store: Arc<dyn PolicyStore>,
        coordinator: Arc<ApplyCoordinator>,
        enable_ipv6: bool,
    ) -> Self {
        Self {
            store,
            coordinator,
            enable_ipv6,
            issued: AtomicU64::new(0),
            installed: AtomicU64::new(0),
        }
    }

    /// DROP fragments for every provider rule, split by IP version.
    ///
    /// IPv6 rules are skipped when IPv6 is disabled.
    pub fn compile(&self) -> Result<CompiledRules> {
        let mut rules = CompiledRules::default();
        for rule in self.store.provider_rules()? {
            let version = rule.ip_version();
            if version == IpVersion::V6 && !self.enable_ipv6 {
                debug!(?rule, "Skipping IPv6 provider rule, IPv6 disabled");
                continue;
            }
            let fragments = sourced_fragments(&rule, version, &[rule.cidr], &Verdict::Drop)?;
            rules.for_version_mut(version).extend(fragments);
        }
        Ok(rules)
    }

    /// [`Self::compile`], stamped with a fresh generation
    pub fn compile_next(&self) -> Result<(u64, CompiledRules)> {
        let generation = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok((generation, self.compile()?))
    }

    /// Purges and refills the provider chain of every active table; does not commit.
    ///
    /// Returns `false` without touching the sink if a newer generation is
    /// already installed. Must run under the rule-table lock.
    pub fn rebuild(
        &self,
        sink: &mut dyn FilterSink,
        rules: &CompiledRules,
        generation: u64,
    ) -> Result<bool> {
        if self.installed.load(Ordering::SeqCst) > generation {
            debug!(generation, "Provider rules superseded, skipping rebuild");
            return Ok(false);
        }
        for &version in IpVersion::active(self.enable_ipv6) {
            let table = Table::filter(version);
            sink.add_chain(table, PROVIDER_CHAIN);
            sink.empty_chain(table, PROVIDER_CHAIN);
            for rule in rules.for_version(version) {
                sink.add_rule(table, PROVIDER_CHAIN, rule.clone())?;
            }
        }
        Ok(true)
    }

    /// Records a committed rebuild; call from the same critical section as [`Self::rebuild`].
    pub fn mark_installed(&self, generation: u64) {
        self.installed.fetch_max(generation, Ordering::SeqCst);
    }

    /// Recompiles the provider rules and swaps them in atomically.
    pub fn refresh(&self) -> Result<()> {
        let (generation, rules) = self.compile_next()?;
        self.coordinator.mutate_and_commit(
            |sink| self.rebuild(sink, &rules, generation),
            |&fresh| {
                if fresh {
                    self.mark_installed(generation);
                }
            },
        )?;
        info!(
            ipv4 = rules.ipv4.len(),
            ipv6 = rules.ipv6.len(),
            "Provider rules refreshed"
        );
        Ok(())
    }
}
