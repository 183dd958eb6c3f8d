//! Scope manager
//!
//! Tracks which entities are filtered and with what topology, and maps each
//! one to its isolated chain (`inst-<entity>`). Inbound traffic reaches that
//! chain through `ip daddr <addr> jump inst-<entity>` rules in the shared
//! `local` chain, one per entity address.
//!
//! # Locking
//!
//! Rules are compiled before the coordinator's rule-table lock is taken, so a
//! slow policy store never stalls other refreshes. The scope map is written
//! only inside that lock, after a successful commit: an entity is tracked
//! exactly when its chain is staged. Lock order is coordinator, then scopes.
//!
//! Each compile is stamped with a generation taken before it reads the store.
//! A refresh whose generation is older than the one installed for an entity,
//! or that compiled against a topology the entity no longer has, is skipped
//! for that entity.

use crate::config::FirewallConfig;
use crate::core::compiler::{CompiledRules, RuleCompiler};
use crate::core::coordinator::ApplyCoordinator;
use crate::core::error::{Error, Result};
use crate::core::fragment::{Fragment, Match, Verdict};
use crate::core::model::{EntityId, GroupId, IpVersion};
use crate::core::policy::PolicyStore;
use crate::core::provider::ProviderRuleManager;
use crate::core::sink::{FilterSink, LOCAL_CHAIN, Table};
use crate::core::topology::NetworkTopology;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// A filtered entity and the generation of its installed chain
#[derive(Debug, Clone)]
struct Scope {
    topology: NetworkTopology,
    generation: u64,
}

type Compiled = (EntityId, NetworkTopology, CompiledRules);

pub struct ScopeManager {
    compiler: RuleCompiler,
    store: Arc<dyn PolicyStore>,
    coordinator: Arc<ApplyCoordinator>,
    provider: ProviderRuleManager,
    scopes: RwLock<BTreeMap<EntityId, Scope>>,
    issued: AtomicU64,
}

/// Chain name of an entity's scope
pub fn chain_name(entity: &EntityId) -> String {
    format!("inst-{entity}")
}

impl ScopeManager {
    pub fn new(
        config: &FirewallConfig,
        store: Arc<dyn PolicyStore>,
        coordinator: Arc<ApplyCoordinator>,
    ) -> Self {
        let provider =
            ProviderRuleManager::new(store.clone(), coordinator.clone(), config.enable_ipv6);
        Self {
            compiler: RuleCompiler::new(config),
            store,
            coordinator,
            provider,
            scopes: RwLock::new(BTreeMap::new()),
            issued: AtomicU64::new(0),
        }
    }

    pub fn provider(&self) -> &ProviderRuleManager {
        &self.provider
    }

    fn versions(&self) -> &'static [IpVersion] {
        IpVersion::active(self.compiler.enable_ipv6())
    }

    fn next_generation(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn topology_of(&self, entity: &EntityId) -> Option<NetworkTopology> {
        self.scopes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity)
            .map(|scope| scope.topology.clone())
    }

    fn is_tracked(&self, entity: &EntityId) -> bool {
        self.scopes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(entity)
    }

    /// Whether a refresh compiled at `generation` against `topology` may
    /// still replace the entity's chain.
    fn is_current(&self, entity: &EntityId, topology: &NetworkTopology, generation: u64) -> bool {
        self.scopes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity)
            .is_some_and(|scope| scope.generation <= generation && &scope.topology == topology)
    }

    /// Entities currently filtered, in id order
    pub fn tracked(&self) -> Vec<EntityId> {
        self.scopes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn snapshot(&self) -> Vec<(EntityId, NetworkTopology)> {
        self.scopes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(entity, scope)| (entity.clone(), scope.topology.clone()))
            .collect()
    }

    /// Replaces the entity's chain and its address jumps; does not commit.
    fn install(
        &self,
        sink: &mut dyn FilterSink,
        entity: &EntityId,
        topology: &NetworkTopology,
        rules: &CompiledRules,
    ) -> Result<()> {
        let chain = chain_name(entity);
        for &version in self.versions() {
            let table = Table::filter(version);
            sink.remove_chain(table, &chain);
            sink.add_chain(table, &chain);
            for addr in topology.addresses(version) {
                sink.add_rule(
                    table,
                    LOCAL_CHAIN,
                    Fragment::new(vec![Match::DestAddr(addr)], Verdict::Jump(chain.clone())),
                )?;
            }
            for rule in rules.for_version(version) {
                sink.add_rule(table, &chain, rule.clone())?;
            }
        }
        Ok(())
    }

    /// Registers an entity, builds its scope and refreshes the provider chain,
    /// all in one commit.
    ///
    /// Preparing an entity that is already filtered replaces its topology and
    /// chain.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the id is invalid, compilation fails, or the sink
    /// rejects the commit. On error the tracked state is unchanged.
    pub fn prepare(&self, entity: &EntityId, topology: NetworkTopology) -> Result<()> {
        crate::validators::validate_entity_id(entity.as_str()).map_err(|message| {
            Error::Validation {
                field: "entity_id".to_string(),
                message,
            }
        })?;

        let generation = self.next_generation();
        let rules = self.compiler.compile(entity, &topology, self.store.as_ref())?;
        let (provider_generation, provider_rules) = self.provider.compile_next()?;

        self.coordinator.mutate_and_commit(
            |sink| {
                self.install(sink, entity, &topology, &rules)?;
                self.provider.rebuild(sink, &provider_rules, provider_generation)
            },
            |&fresh| {
                if fresh {
                    self.provider.mark_installed(provider_generation);
                }
                self.scopes
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(
                        entity.clone(),
                        Scope {
                            topology: topology.clone(),
                            generation,
                        },
                    );
            },
        )?;
        info!(%entity, rules = rules.len(), "Prepared entity filter");
        Ok(())
    }

    /// Tears down an entity's scope. Unknown entities are a logged no-op.
    ///
    /// If the commit fails the entity stays tracked with its chain staged, so
    /// the call can be retried.
    pub fn unfilter(&self, entity: &EntityId) -> Result<()> {
        let chain = chain_name(entity);
        let removed = self.coordinator.mutate_and_commit(
            |sink| {
                if !self.is_tracked(entity) {
                    return Ok(false);
                }
                for &version in self.versions() {
                    sink.remove_chain(Table::filter(version), &chain);
                }
                Ok(true)
            },
            |&removed| {
                if removed {
                    self.scopes
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(entity);
                }
            },
        )?;

        if removed {
            info!(%entity, "Removed entity filter");
        } else {
            info!(%entity, "Attempted to unfilter entity which is not filtered");
        }
        Ok(())
    }

    /// Swaps in every compiled chain that is still current, in one commit.
    ///
    /// Returns the entities that were installed.
    fn install_refreshed(&self, compiled: &[Compiled], generation: u64) -> Result<Vec<EntityId>> {
        self.coordinator.mutate_and_commit(
            |sink| {
                let mut installed = Vec::new();
                for (entity, topology, rules) in compiled {
                    if self.is_current(entity, topology, generation) {
                        self.install(sink, entity, topology, rules)?;
                        installed.push(entity.clone());
                    } else {
                        debug!(%entity, generation, "Entity unfiltered or superseded during refresh, skipping");
                    }
                }
                Ok(installed)
            },
            |installed| {
                let mut scopes = self.scopes.write().unwrap_or_else(PoisonError::into_inner);
                for entity in installed {
                    if let Some(scope) = scopes.get_mut(entity) {
                        scope.generation = generation;
                    }
                }
            },
        )
    }

    /// Recompiles one entity and swaps its chain in atomically.
    ///
    /// On a compile error the previous chain contents stay in place.
    pub fn refresh_rules(&self, entity: &EntityId) -> Result<()> {
        let generation = self.next_generation();
        let Some(topology) = self.topology_of(entity) else {
            info!(%entity, "Attempted to refresh rules of entity which is not filtered");
            return Ok(());
        };

        let rules = self.compiler.compile(entity, &topology, self.store.as_ref())?;
        self.install_refreshed(&[(entity.clone(), topology, rules)], generation)?;
        debug!(%entity, "Refreshed entity rules");
        Ok(())
    }

    /// Recompiles every tracked entity after a change to `group`.
    ///
    /// A membership change can affect entities that no longer reference the
    /// group at all, so no entity is skipped. Entities that compile are
    /// swapped in together under one commit even if others fail; the failures
    /// are reported as [`Error::Refresh`].
    pub fn refresh_for_group(&self, group: &GroupId) -> Result<()> {
        let generation = self.next_generation();
        let mut compiled = Vec::new();
        let mut failed: Vec<(EntityId, Error)> = Vec::new();

        for (entity, topology) in self.snapshot() {
            match self.compiler.compile(&entity, &topology, self.store.as_ref()) {
                Ok(rules) => compiled.push((entity, topology, rules)),
                Err(e) => {
                    warn!(%entity, %group, "Failed to compile rules for group refresh: {e}");
                    failed.push((entity, e));
                }
            }
        }

        let refreshed = if compiled.is_empty() {
            0
        } else {
            self.install_refreshed(&compiled, generation)?.len()
        };
        info!(%group, refreshed, failed = failed.len(), "Group refresh done");

        if failed.is_empty() {
            return Ok(());
        }
        let entities = failed.iter().map(|(entity, _)| entity.to_string()).collect();
        let (_, first) = failed.swap_remove(0);
        Err(Error::Refresh {
            entities,
            source: Box::new(first),
        })
    }

    /// Whether the entity's chain is present in the staged IPv4 table
    pub fn exists(&self, entity: &EntityId) -> Result<bool> {
        let chain = chain_name(entity);
        self.coordinator
            .inspect(|sink| sink.has_chain(Table::filter(IpVersion::V4), &chain))
    }
}
