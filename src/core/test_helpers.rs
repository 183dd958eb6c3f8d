//! Shared test utilities for core module tests
//!
//! This module is only compiled in test mode.

use crate::config::FirewallConfig;
use crate::core::topology::{AddressMapping, NetworkBinding, NetworkTopology, Subnet};
use std::sync::Mutex;

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("SGFW_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("SGFW_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// Points `nft` at `tests/mock_nft.sh` and disables elevation.
///
/// The caller must hold [`ENV_VAR_MUTEX`].
pub fn use_mock_nft() {
    let mock_path = format!("{}/tests/mock_nft.sh", env!("CARGO_MANIFEST_DIR"));
    // SAFETY: callers hold ENV_VAR_MUTEX
    unsafe {
        std::env::set_var("SGFW_NFT_COMMAND", &mock_path);
        std::env::set_var("SGFW_TEST_NO_ELEVATION", "1");
    }
}

pub fn config(enable_ipv6: bool, allow_same_network_traffic: bool) -> FirewallConfig {
    FirewallConfig {
        enable_ipv6,
        allow_same_network_traffic,
        ..FirewallConfig::default()
    }
}

/// One IPv4 subnet `10.0.0.0/24`, DHCP server `10.0.0.1`, entity at `10.0.0.5`
pub fn single_subnet_topology() -> NetworkTopology {
    NetworkTopology::new(vec![NetworkBinding {
        subnet: Subnet {
            cidr: Some("10.0.0.0/24".parse().unwrap()),
            cidr_v6: None,
        },
        mapping: AddressMapping {
            ips: vec!["10.0.0.5".parse().unwrap()],
            dhcp_server: Some("10.0.0.1".parse().unwrap()),
            ..AddressMapping::default()
        },
    }])
}

/// [`single_subnet_topology`] plus `fd00::/64`, router `fd00::1`, entity at `fd00::5`
pub fn dual_stack_topology() -> NetworkTopology {
    NetworkTopology::new(vec![NetworkBinding {
        subnet: Subnet {
            cidr: Some("10.0.0.0/24".parse().unwrap()),
            cidr_v6: Some("fd00::/64".parse().unwrap()),
        },
        mapping: AddressMapping {
            ips: vec!["10.0.0.5".parse().unwrap()],
            ip6s: vec!["fd00::5".parse().unwrap()],
            dhcp_server: Some("10.0.0.1".parse().unwrap()),
            gateway_v6: Some("fd00::1".parse().unwrap()),
        },
    }])
}
