//! Filter-rule sinks
//!
//! Chain mutations are staged in memory as [`TableSet`]s and pushed to the
//! packet filter as a whole on [`FilterSink::commit`]. A push replaces the
//! engine's tables in one transaction, so a removed-and-recreated chain is
//! never observable half-built. While deferred apply is on, commits only
//! accumulate.
//!
//! Sinks are not synchronized themselves; the
//! [`ApplyCoordinator`](crate::core::coordinator::ApplyCoordinator) owns the
//! one instance in use and serializes access to it.

use crate::core::error::{Error, Result};
use crate::core::fragment::Fragment;
use crate::core::model::IpVersion;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Base chain hooked into the forward path
pub const BASE_CHAIN: &str = "forward";
/// Per-address jumps into entity chains
pub const LOCAL_CHAIN: &str = "local";
/// Provider-wide DROP rules
pub const PROVIDER_CHAIN: &str = "provider";
/// Default-deny chain every entity chain ends in
pub const FALLBACK_CHAIN: &str = "sg-fallback";

/// Filter stage of a table; only the inbound/forward filter is used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Stage {
    Filter,
}

/// One table: an IP version and a filter stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Table {
    pub version: IpVersion,
    pub stage: Stage,
}

impl Table {
    pub const fn filter(version: IpVersion) -> Self {
        Self {
            version,
            stage: Stage::Filter,
        }
    }
}

/// Ordered rules per chain name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleTable {
    chains: BTreeMap<String, Vec<Fragment>>,
}

impl RuleTable {
    /// Creates an empty chain; an existing chain is left untouched.
    pub fn add_chain(&mut self, name: &str) {
        self.chains.entry(name.to_string()).or_default();
    }

    /// Removes a chain and every rule in other chains that jumps to it.
    ///
    /// Returns `false` if the chain did not exist.
    pub fn remove_chain(&mut self, name: &str) -> bool {
        let existed = self.chains.remove(name).is_some();
        for rules in self.chains.values_mut() {
            rules.retain(|rule| !rule.jumps_to(name));
        }
        existed
    }

    /// Drops every rule of a chain, keeping the chain itself
    pub fn empty_chain(&mut self, name: &str) {
        if let Some(rules) = self.chains.get_mut(name) {
            rules.clear();
        }
    }

    pub fn add_rule(&mut self, chain: &str, rule: Fragment) -> Result<()> {
        self.chains
            .get_mut(chain)
            .ok_or_else(|| Error::Internal(format!("chain {chain} does not exist")))?
            .push(rule);
        Ok(())
    }

    pub fn chain(&self, name: &str) -> Option<&[Fragment]> {
        self.chains.get(name).map(Vec::as_slice)
    }

    pub fn has_chain(&self, name: &str) -> bool {
        self.chains.contains_key(name)
    }

    pub fn chains(&self) -> impl Iterator<Item = (&str, &[Fragment])> {
        self.chains
            .iter()
            .map(|(name, rules)| (name.as_str(), rules.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

/// The IPv4 and IPv6 filter tables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSet {
    pub ipv4: RuleTable,
    pub ipv6: RuleTable,
}

impl TableSet {
    pub fn get(&self, table: Table) -> &RuleTable {
        match table.version {
            IpVersion::V4 => &self.ipv4,
            IpVersion::V6 => &self.ipv6,
        }
    }

    pub fn get_mut(&mut self, table: Table) -> &mut RuleTable {
        match table.version {
            IpVersion::V4 => &mut self.ipv4,
            IpVersion::V6 => &mut self.ipv6,
        }
    }

    /// Tables holding at least one chain; untouched tables are never pushed
    pub fn populated(&self) -> impl Iterator<Item = (IpVersion, &RuleTable)> {
        [(IpVersion::V4, &self.ipv4), (IpVersion::V6, &self.ipv6)]
            .into_iter()
            .filter(|(_, table)| !table.is_empty())
    }
}

/// Staged state shared by every sink implementation
#[derive(Debug, Clone, Default)]
pub struct StagedTables {
    pub tables: TableSet,
    pub deferred: bool,
    pub dirty: bool,
}

/// Ordered-rule-list sink with atomic apply
///
/// Implementors provide access to their [`StagedTables`] and a `push` that
/// replaces the engine's tables with a staged generation. Everything else is
/// shared.
pub trait FilterSink: Send {
    fn staging(&self) -> &StagedTables;

    fn staging_mut(&mut self) -> &mut StagedTables;

    /// Applies a complete generation to the packet filter in one transaction.
    fn push(&mut self, tables: &TableSet) -> Result<()>;

    fn add_chain(&mut self, table: Table, name: &str) {
        let staging = self.staging_mut();
        staging.tables.get_mut(table).add_chain(name);
        staging.dirty = true;
    }

    fn remove_chain(&mut self, table: Table, name: &str) -> bool {
        let staging = self.staging_mut();
        let existed = staging.tables.get_mut(table).remove_chain(name);
        staging.dirty |= existed;
        existed
    }

    fn empty_chain(&mut self, table: Table, name: &str) {
        let staging = self.staging_mut();
        staging.tables.get_mut(table).empty_chain(name);
        staging.dirty = true;
    }

    fn add_rule(&mut self, table: Table, chain: &str, rule: Fragment) -> Result<()> {
        let staging = self.staging_mut();
        staging.tables.get_mut(table).add_rule(chain, rule)?;
        staging.dirty = true;
        Ok(())
    }

    fn has_chain(&self, table: Table, name: &str) -> bool {
        self.staging().tables.get(table).has_chain(name)
    }

    fn begin_deferred_apply(&mut self) {
        debug!("Deferred apply on");
        self.staging_mut().deferred = true;
    }

    fn end_deferred_apply_and_commit(&mut self) -> Result<()> {
        debug!("Deferred apply off");
        self.staging_mut().deferred = false;
        self.commit()
    }

    /// Pushes the staged tables unless deferred or nothing changed.
    ///
    /// A failed push keeps the staged changes pending so the next commit
    /// retries them.
    fn commit(&mut self) -> Result<()> {
        let staging = self.staging();
        if staging.deferred || !staging.dirty {
            return Ok(());
        }
        let tables = staging.tables.clone();
        self.push(&tables)?;
        self.staging_mut().dirty = false;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct JournalState {
    commits: Vec<TableSet>,
    fail_next: Option<String>,
}

/// Shared view of every generation a [`MemorySink`] committed
#[derive(Debug, Clone, Default)]
pub struct SinkJournal {
    inner: Arc<Mutex<JournalState>>,
}

impl SinkJournal {
    fn lock(&self) -> std::sync::MutexGuard<'_, JournalState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn commits(&self) -> Vec<TableSet> {
        self.lock().commits.clone()
    }

    pub fn commit_count(&self) -> usize {
        self.lock().commits.len()
    }

    pub fn last(&self) -> Option<TableSet> {
        self.lock().commits.last().cloned()
    }

    /// Makes the next push fail with an nftables error carrying `message`
    pub fn fail_next(&self, message: impl Into<String>) {
        self.lock().fail_next = Some(message.into());
    }
}

/// In-memory sink for dry runs and tests
#[derive(Debug, Default)]
pub struct MemorySink {
    staging: StagedTables,
    journal: SinkJournal,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn journal(&self) -> SinkJournal {
        self.journal.clone()
    }
}

impl FilterSink for MemorySink {
    fn staging(&self) -> &StagedTables {
        &self.staging
    }

    fn staging_mut(&mut self) -> &mut StagedTables {
        &mut self.staging
    }

    fn push(&mut self, tables: &TableSet) -> Result<()> {
        let mut journal = self.journal.lock();
        if let Some(message) = journal.fail_next.take() {
            return Err(Error::Nftables {
                message: message.clone(),
                stderr: Some(message),
                exit_code: Some(1),
            });
        }
        journal.commits.push(tables.clone());
        Ok(())
    }
}
