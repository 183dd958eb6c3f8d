//! sgfw - security-group firewall compiler
//!
//! Turns security-group policy and per-entity network topology into
//! per-instance nftables chains, and keeps them current as policy changes.
//!
//! # Architecture
//!
//! - [`core`] - Rule compilation, scope management, and the nftables sink
//! - [`audit`] - Audit log of every commit to the kernel
//! - [`validators`] - Input validation for ids, names, ports and ICMP values
//! - [`config`] - Configuration persistence
//! - [`elevation`] - Running `nft` with privileges
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Safety Features
//!
//! - Optional pre-apply verification with `nft --check`
//! - Whole-table atomic batches, never partially applied chains
//! - Staged state rolled back when a commit fails
//! - SHA-256 checksums of every committed batch in the audit log

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use config::{DriverKind, FirewallConfig};
pub use core::driver::{CompilingDriver, FirewallDriver, NoopDriver, load_driver};
pub use core::error::{Error, Result};
pub use core::model::{EntityId, GroupId, Protocol, ProviderRule, SecurityGroupRule};
pub use core::policy::{InMemoryPolicyStore, PolicyStore};
pub use core::topology::{NetworkTopology, TopologyInput};
