//! Policy compilation and rule-table management
//!
//! Leaves first:
//!
//! - [`model`], [`topology`]: policy rules, identifiers and per-entity network topology
//! - [`fragment`]: rule primitives (one policy rule to filter fragments)
//! - [`policy`]: the policy store the compiler reads from
//! - [`compiler`]: complete ordered rule lists per entity
//! - [`sink`], [`nft_json`], [`verify`]: staged tables and the nftables sink
//! - [`coordinator`]: serialized, optionally deferred, commits
//! - [`scope`], [`provider`]: per-entity chains and the provider chain
//! - [`driver`]: the surface the host talks to
//! - [`error`]: error types

pub mod compiler;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod fragment;
pub mod model;
pub mod nft_json;
pub mod policy;
pub mod provider;
pub mod scope;
pub mod sink;
pub mod topology;
pub mod verify;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;
