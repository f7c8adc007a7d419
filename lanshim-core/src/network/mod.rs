//! Host network backend.
//!
//! Every inspection or mutation of links, addresses and routes made by the
//! provisioner and the route synchronizer goes through [`HostNetwork`].
//!
//! ## Backends
//!
//! - **Linux**: [`IpCommandNetwork`] drives iproute2 (`ip -json` for queries).
//! - **Tests**: `fakes::FakeHostNetwork` (behind the `test-util` feature)
//!   keeps state in memory and records every mutating call.

#[cfg(target_os = "linux")]
pub mod linux;
pub mod privilege;

#[cfg(target_os = "linux")]
pub use linux::IpCommandNetwork;

use crate::error::{HostError, ShimError};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{info, instrument};

/// Link kind of the shim interface.
pub const MACVLAN_KIND: &str = "macvlan";

/// Macvlan mode of the shim interface.
pub const MACVLAN_MODE: &str = "bridge";

/// Observed state of a network link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    /// Interface name
    pub name: String,
    /// Link kind (`macvlan`, `bridge`, ...); `None` for physical devices
    pub kind: Option<String>,
    /// Macvlan mode when `kind` is macvlan
    pub mode: Option<String>,
    /// Lower device the link is stacked on
    pub parent: Option<String>,
    /// Administratively up
    pub up: bool,
    /// IPv4 addresses with prefix length
    pub ipv4: Vec<Ipv4Net>,
}

impl LinkInfo {
    /// Whether this link is a bridge-mode macvlan on `parent` carrying exactly
    /// `address` and administratively up.
    pub fn is_shim_for(&self, parent: &str, address: Ipv4Net) -> bool {
        self.kind.as_deref() == Some(MACVLAN_KIND)
            && self.mode.as_deref() == Some(MACVLAN_MODE)
            && self.parent.as_deref() == Some(parent)
            && self.up
            && self.ipv4 == [address]
    }
}

/// A route to a single destination as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub destination: Ipv4Net,
    pub dev: String,
}

/// Host network operations used by the shim lifecycle.
///
/// Removal operations return `Ok(false)` when the target was already absent.
#[async_trait::async_trait]
pub trait HostNetwork: Send + Sync {
    /// Whether the current process holds the privilege to mutate links and routes.
    fn has_net_admin(&self) -> bool;

    /// Whether an interface with this name exists.
    async fn interface_exists(&self, name: &str) -> Result<bool, HostError>;

    /// Inspect a link, `None` if it does not exist.
    async fn link(&self, name: &str) -> Result<Option<LinkInfo>, HostError>;

    /// Create a bridge-mode macvlan `name` stacked on `parent`.
    async fn add_macvlan(&self, name: &str, parent: &str) -> Result<(), HostError>;

    /// Assign an IPv4 address to a link.
    async fn add_address(&self, name: &str, address: Ipv4Net) -> Result<(), HostError>;

    /// Bring a link administratively up.
    async fn set_link_up(&self, name: &str) -> Result<(), HostError>;

    /// Delete a link.
    async fn delete_link(&self, name: &str) -> Result<bool, HostError>;

    /// Routes whose destination is exactly `destination`.
    async fn routes_to(&self, destination: Ipv4Net) -> Result<Vec<RouteInfo>, HostError>;

    /// Add a route to `destination` through `dev`.
    async fn add_route(&self, destination: Ipv4Net, dev: &str) -> Result<(), HostError>;

    /// Delete the route to `destination` through `dev`.
    async fn delete_route(&self, destination: Ipv4Net, dev: &str) -> Result<bool, HostError>;
}

/// Shared handle to a host network backend.
pub type SharedHostNetwork = Arc<dyn HostNetwork>;

/// A /32 network for a single host address.
pub fn host_net(addr: Ipv4Addr) -> Ipv4Net {
    Ipv4Net::from(addr)
}

/// Fail fast with [`ShimError::Permission`] unless the backend reports the
/// privilege to mutate links and routes.
pub fn require_net_admin(net: &dyn HostNetwork, operation: &str) -> crate::Result<()> {
    if net.has_net_admin() {
        Ok(())
    } else {
        Err(ShimError::Permission { operation: operation.to_string() })
    }
}

/// Create the host network backend for the current platform.
///
/// # Returns
/// * `Ok(SharedHostNetwork)` - iproute2 backend on Linux
/// * `Err(ShimError::Validation)` - on platforms without macvlan support
#[instrument]
pub fn create_host_network() -> crate::Result<SharedHostNetwork> {
    #[cfg(target_os = "linux")]
    {
        info!("Using iproute2 host network backend");
        Ok(Arc::new(IpCommandNetwork::new()))
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(ShimError::validation(
            "platform",
            format!("macvlan shims are not supported on {}", std::env::consts::OS),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shim_link() -> LinkInfo {
        LinkInfo {
            name: "lanshim0".into(),
            kind: Some("macvlan".into()),
            mode: Some("bridge".into()),
            parent: Some("eth0".into()),
            up: true,
            ipv4: vec!["192.168.1.246/32".parse().unwrap()],
        }
    }

    #[test]
    fn test_is_shim_for_matches() {
        let addr = "192.168.1.246/32".parse().unwrap();
        assert!(shim_link().is_shim_for("eth0", addr));
    }

    #[test]
    fn test_is_shim_for_rejects_mismatch() {
        let addr: Ipv4Net = "192.168.1.246/32".parse().unwrap();

        assert!(!shim_link().is_shim_for("wlan0", addr));

        let mut down = shim_link();
        down.up = false;
        assert!(!down.is_shim_for("eth0", addr));

        let mut wrong_mode = shim_link();
        wrong_mode.mode = Some("vepa".into());
        assert!(!wrong_mode.is_shim_for("eth0", addr));

        let mut extra = shim_link();
        extra.ipv4.push("10.0.0.1/24".parse().unwrap());
        assert!(!extra.is_shim_for("eth0", addr));

        let mut wide = shim_link();
        wide.ipv4 = vec!["192.168.1.246/29".parse().unwrap()];
        assert!(!wide.is_shim_for("eth0", addr));
    }

    #[test]
    fn test_host_net() {
        let net = host_net(Ipv4Addr::new(192, 168, 1, 241));
        assert_eq!(net.prefix_len(), 32);
        assert_eq!(net.addr(), Ipv4Addr::new(192, 168, 1, 241));
    }
}
