//! Firewall driver surface exposed to the host
//!
//! The host talks to one [`FirewallDriver`], picked once at start-up from
//! [`FirewallConfig::driver`]: [`NoopDriver`] when filtering is handled
//! elsewhere, [`CompilingDriver`] otherwise.

use crate::config::{DriverKind, FirewallConfig};
use crate::core::coordinator::ApplyCoordinator;
use crate::core::error::Result;
use crate::core::fragment::{Fragment, Verdict};
use crate::core::model::{EntityId, GroupId, IpVersion};
use crate::core::policy::PolicyStore;
use crate::core::scope::ScopeManager;
use crate::core::sink::{BASE_CHAIN, FALLBACK_CHAIN, FilterSink, LOCAL_CHAIN, PROVIDER_CHAIN, Table};
use crate::core::topology::TopologyInput;
use std::sync::Arc;
use tracing::info;

/// Host-facing lifecycle of entity filtering
pub trait FirewallDriver: Send + Sync {
    /// Builds the entity's scope; must complete before the entity is reachable.
    fn prepare(&self, entity: &EntityId, topology: TopologyInput) -> Result<()>;

    fn unfilter(&self, entity: &EntityId) -> Result<()>;

    /// Called when a group's rules or membership change
    fn refresh_rules_for_group(&self, group: &GroupId) -> Result<()>;

    fn refresh_rules_for_entity(&self, entity: &EntityId) -> Result<()>;

    fn refresh_provider_rules(&self) -> Result<()>;

    fn scope_exists(&self, entity: &EntityId, topology: &TopologyInput) -> Result<bool>;

    fn begin_batch(&self) -> Result<()>;

    fn end_batch(&self) -> Result<()>;

    /// Host-wide rules outside any entity scope; nothing to do by default
    fn setup_basic_filtering(&self, _entity: &EntityId, _topology: &TopologyInput) -> Result<()> {
        Ok(())
    }

    /// Everything is applied in [`FirewallDriver::prepare`]
    fn apply_instance_filter(&self, _entity: &EntityId, _topology: &TopologyInput) -> Result<()> {
        Ok(())
    }

    fn refresh_security_group_rules(&self, group: &GroupId) -> Result<()> {
        self.refresh_rules_for_group(group)
    }

    fn refresh_security_group_members(&self, group: &GroupId) -> Result<()> {
        self.refresh_rules_for_group(group)
    }
}

/// Driver that filters nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDriver;

impl FirewallDriver for NoopDriver {
    fn prepare(&self, _entity: &EntityId, _topology: TopologyInput) -> Result<()> {
        Ok(())
    }

    fn unfilter(&self, _entity: &EntityId) -> Result<()> {
        Ok(())
    }

    fn refresh_rules_for_group(&self, _group: &GroupId) -> Result<()> {
        Ok(())
    }

    fn refresh_rules_for_entity(&self, _entity: &EntityId) -> Result<()> {
        Ok(())
    }

    fn refresh_provider_rules(&self) -> Result<()> {
        Ok(())
    }

    fn scope_exists(&self, _entity: &EntityId, _topology: &TopologyInput) -> Result<bool> {
        Ok(true)
    }

    fn begin_batch(&self) -> Result<()> {
        Ok(())
    }

    fn end_batch(&self) -> Result<()> {
        Ok(())
    }
}

/// Driver that compiles policy into per-entity chains
pub struct CompilingDriver {
    scopes: ScopeManager,
    coordinator: Arc<ApplyCoordinator>,
}

impl CompilingDriver {
    /// Stages the base chains of every active table; nothing is committed
    /// until the first mutation or batch end.
    pub fn new(
        config: &FirewallConfig,
        store: Arc<dyn PolicyStore>,
        sink: Box<dyn FilterSink>,
    ) -> Result<Self> {
        let coordinator = Arc::new(ApplyCoordinator::new(sink));
        let versions = IpVersion::active(config.enable_ipv6);

        coordinator.mutate(|sink| {
            for &version in versions {
                let table = Table::filter(version);
                for chain in [BASE_CHAIN, LOCAL_CHAIN, PROVIDER_CHAIN, FALLBACK_CHAIN] {
                    sink.add_chain(table, chain);
                }
                sink.add_rule(table, BASE_CHAIN, Fragment::jump(LOCAL_CHAIN))?;
                sink.add_rule(table, FALLBACK_CHAIN, Fragment::new(Vec::new(), Verdict::Drop))?;
            }
            Ok(())
        })?;

        info!(
            ipv6 = config.enable_ipv6,
            same_network = config.allow_same_network_traffic,
            "Compiling firewall driver ready"
        );
        Ok(Self {
            scopes: ScopeManager::new(config, store, coordinator.clone()),
            coordinator,
        })
    }

    pub fn scopes(&self) -> &ScopeManager {
        &self.scopes
    }

    pub fn coordinator(&self) -> &ApplyCoordinator {
        &self.coordinator
    }
}

impl FirewallDriver for CompilingDriver {
    fn prepare(&self, entity: &EntityId, topology: TopologyInput) -> Result<()> {
        self.scopes.prepare(entity, topology.normalize())
    }

    fn unfilter(&self, entity: &EntityId) -> Result<()> {
        self.scopes.unfilter(entity)
    }

    fn refresh_rules_for_group(&self, group: &GroupId) -> Result<()> {
        self.scopes.refresh_for_group(group)
    }

    fn refresh_rules_for_entity(&self, entity: &EntityId) -> Result<()> {
        self.scopes.refresh_rules(entity)
    }

    fn refresh_provider_rules(&self) -> Result<()> {
        self.scopes.provider().refresh()
    }

    fn scope_exists(&self, entity: &EntityId, _topology: &TopologyInput) -> Result<bool> {
        self.scopes.exists(entity)
    }

    fn begin_batch(&self) -> Result<()> {
        self.coordinator.begin_deferred()
    }

    fn end_batch(&self) -> Result<()> {
        self.coordinator.end_deferred()
    }
}

/// Builds the driver selected by `config.driver`.
pub fn load_driver(
    config: &FirewallConfig,
    store: Arc<dyn PolicyStore>,
    sink: Box<dyn FilterSink>,
) -> Result<Box<dyn FirewallDriver>> {
    info!("Loading firewall driver: {}", config.driver);
    match config.driver {
        DriverKind::Noop => Ok(Box::new(NoopDriver)),
        DriverKind::Nftables => Ok(Box::new(CompilingDriver::new(config, store, sink)?)),
    }
}
