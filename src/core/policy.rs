//! Policy store interface
//!
//! The compiler reads security groups, their rules, group membership and
//! provider rules through [`PolicyStore`]. Persistence lives elsewhere; the
//! [`InMemoryPolicyStore`] here serves the CLI (loaded from a JSON snapshot)
//! and the tests.

use crate::core::error::{Error, Result};
use crate::core::model::{EntityId, GroupId, IpVersion, ProviderRule, SecurityGroupRule};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

/// Read-side queries the compiler needs
///
/// Results are returned in store order; the compiler never reorders them.
pub trait PolicyStore: Send + Sync {
    fn security_groups_for_entity(&self, entity: &EntityId) -> Result<Vec<GroupId>>;

    fn rules_for_group(&self, group: &GroupId) -> Result<Vec<SecurityGroupRule>>;

    fn provider_rules(&self) -> Result<Vec<ProviderRule>>;

    /// Current addresses of every member of `group` for `version`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MemberLookup`] when membership cannot be resolved.
    fn member_addresses(&self, group: &GroupId, version: IpVersion) -> Result<Vec<IpAddr>>;
}

/// Policy attached to one entity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityPolicy {
    /// Attached groups, in evaluation order
    #[serde(default)]
    pub groups: Vec<GroupId>,
    /// Addresses used when the entity is expanded as a group member
    #[serde(default)]
    pub addresses: Vec<IpAddr>,
}

/// Whole policy state, as loaded from JSON
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    #[serde(default)]
    pub groups: BTreeMap<GroupId, Vec<SecurityGroupRule>>,
    #[serde(default)]
    pub entities: BTreeMap<EntityId, EntityPolicy>,
    #[serde(default)]
    pub provider_rules: Vec<ProviderRule>,
}

/// Thread-safe in-memory store with mutators for runtime policy changes
#[derive(Debug, Default)]
pub struct InMemoryPolicyStore {
    snapshot: RwLock<PolicySnapshot>,
    member_lookup_down: AtomicBool,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: PolicySnapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
            member_lookup_down: AtomicBool::new(false),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(Self::from_snapshot(serde_json::from_str(json)?))
    }

    pub fn snapshot(&self) -> PolicySnapshot {
        self.read().clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PolicySnapshot> {
        // Every writer leaves the snapshot consistent, so a poisoned lock is still usable
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, PolicySnapshot> {
        self.snapshot.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the rules of a group (creates the group if needed)
    pub fn set_group_rules(&self, group: impl Into<GroupId>, rules: Vec<SecurityGroupRule>) {
        self.write().groups.insert(group.into(), rules);
    }

    /// Attaches `group` to `entity`; attaching twice is a no-op
    pub fn attach(&self, entity: impl Into<EntityId>, group: impl Into<GroupId>) {
        let group = group.into();
        let mut snapshot = self.write();
        let policy = snapshot.entities.entry(entity.into()).or_default();
        if !policy.groups.contains(&group) {
            policy.groups.push(group);
        }
    }

    pub fn detach(&self, entity: &EntityId, group: &GroupId) {
        if let Some(policy) = self.write().entities.get_mut(entity) {
            policy.groups.retain(|g| g != group);
        }
    }

    pub fn set_addresses(&self, entity: impl Into<EntityId>, addresses: Vec<IpAddr>) {
        self.write()
            .entities
            .entry(entity.into())
            .or_default()
            .addresses = addresses;
    }

    pub fn set_provider_rules(&self, rules: Vec<ProviderRule>) {
        self.write().provider_rules = rules;
    }

    /// Simulates the member lookup backend going away (or coming back)
    pub fn set_member_lookup_available(&self, available: bool) {
        self.member_lookup_down.store(!available, Ordering::SeqCst);
    }
}

impl PolicyStore for InMemoryPolicyStore {
    fn security_groups_for_entity(&self, entity: &EntityId) -> Result<Vec<GroupId>> {
        Ok(self
            .read()
            .entities
            .get(entity)
            .map(|p| p.groups.clone())
            .unwrap_or_default())
    }

    fn rules_for_group(&self, group: &GroupId) -> Result<Vec<SecurityGroupRule>> {
        Ok(self.read().groups.get(group).cloned().unwrap_or_default())
    }

    fn provider_rules(&self) -> Result<Vec<ProviderRule>> {
        Ok(self.read().provider_rules.clone())
    }

    fn member_addresses(&self, group: &GroupId, version: IpVersion) -> Result<Vec<IpAddr>> {
        if self.member_lookup_down.load(Ordering::SeqCst) {
            return Err(Error::MemberLookup {
                group: group.to_string(),
                message: "member lookup unavailable".to_string(),
            });
        }

        Ok(self
            .read()
            .entities
            .values()
            .filter(|p| p.groups.contains(group))
            .flat_map(|p| p.addresses.iter().copied())
            .filter(|addr| IpVersion::of_addr(addr) == version)
            .collect())
    }
}
