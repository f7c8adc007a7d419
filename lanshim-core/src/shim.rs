//! Shim interface provisioner.
//!
//! The shim is a bridge-mode macvlan stacked on the host interface and
//! carrying the host endpoint as a /32. Macvlan children cannot talk to their
//! parent directly, so the shim is what lets the host reach containers on the
//! isolated segment. This module is the only place the shim is created or
//! deleted.

use crate::error::{HostError, ProvisionStage, Result, ShimError};
use crate::lock::ProvisionGuard;
use crate::network::{host_net, require_net_admin, SharedHostNetwork};
use crate::topology::TopologyDescriptor;
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use tracing::{error, info, instrument, warn};

/// Lifecycle state of the shim interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShimState {
    Absent,
    Created,
    Routed,
}

impl fmt::Display for ShimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Absent => "absent",
            Self::Created => "created",
            Self::Routed => "routed",
        };
        f.write_str(s)
    }
}

/// The host-side shim interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShimInterface {
    pub name: String,
    pub parent: String,
    pub host_endpoint: Ipv4Addr,
    pub state: ShimState,
}

/// Map a host failure at `stage` onto the error surfaced to callers.
fn stage_error(stage: ProvisionStage, cause: HostError) -> ShimError {
    if cause.is_permission_denied() {
        ShimError::Permission { operation: format!("{} shim interface", stage) }
    } else {
        ShimError::Provision { stage, cause }
    }
}

/// Creates, verifies and removes the shim interface.
#[derive(Clone)]
pub struct ShimProvisioner {
    net: SharedHostNetwork,
}

impl ShimProvisioner {
    pub fn new(net: SharedHostNetwork) -> Self {
        Self { net }
    }

    /// Make sure the shim exists exactly as `descriptor` describes it.
    ///
    /// A shim that already matches is left alone; a mismatching one is
    /// removed and recreated. If creation fails part way, the half-built
    /// link is deleted before the error is returned.
    #[instrument(skip_all, fields(shim = %descriptor.shim_name(), parent = %descriptor.host_interface()))]
    pub async fn ensure_shim(
        &self,
        _lock: &ProvisionGuard,
        descriptor: &TopologyDescriptor,
    ) -> Result<ShimInterface> {
        require_net_admin(self.net.as_ref(), "create the shim interface")?;

        let name = descriptor.shim_name();
        let parent = descriptor.host_interface();
        let address = descriptor.host_endpoint_net();

        let shim = ShimInterface {
            name: name.to_string(),
            parent: parent.to_string(),
            host_endpoint: descriptor.host_endpoint(),
            state: ShimState::Created,
        };

        let existing = self
            .net
            .link(name)
            .await
            .map_err(|e| stage_error(ProvisionStage::Inspect, e))?;

        if let Some(link) = existing {
            if link.is_shim_for(parent, address) {
                info!("Shim {} already configured, nothing to do", name);
                return Ok(shim);
            }

            warn!(
                kind = ?link.kind,
                found_parent = ?link.parent,
                addresses = ?link.ipv4,
                up = link.up,
                "Shim {} exists with a different configuration, recreating",
                name
            );
            self.net
                .delete_link(name)
                .await
                .map_err(|e| stage_error(ProvisionStage::RemoveStale, e))?;

            let still_there = self
                .net
                .link(name)
                .await
                .map_err(|e| stage_error(ProvisionStage::RemoveStale, e))?;
            if still_there.is_some() {
                error!("Shim {} survived removal", name);
                return Err(ShimError::StaleShim { name: name.to_string() });
            }
            metrics::counter!("lanshim_shim_removed_total").increment(1);
        }

        self.net
            .add_macvlan(name, parent)
            .await
            .map_err(|e| stage_error(ProvisionStage::CreateLink, e))?;

        if let Err(e) = self.net.add_address(name, address).await {
            self.rollback(name).await;
            return Err(stage_error(ProvisionStage::AssignAddress, e));
        }

        if let Err(e) = self.net.set_link_up(name).await {
            self.rollback(name).await;
            return Err(stage_error(ProvisionStage::LinkUp, e));
        }

        info!("Shim {} created on {} with {}", name, parent, address);
        metrics::counter!("lanshim_shim_created_total").increment(1);

        Ok(shim)
    }

    /// Remove the shim. An absent shim is success.
    #[instrument(skip_all, fields(shim = %descriptor.shim_name()))]
    pub async fn remove_shim(
        &self,
        _lock: &ProvisionGuard,
        descriptor: &TopologyDescriptor,
    ) -> Result<()> {
        require_net_admin(self.net.as_ref(), "remove the shim interface")?;

        let name = descriptor.shim_name();
        let removed = self
            .net
            .delete_link(name)
            .await
            .map_err(|e| stage_error(ProvisionStage::Remove, e))?;

        if removed {
            info!("Shim {} removed", name);
            metrics::counter!("lanshim_shim_removed_total").increment(1);
        } else {
            info!("Shim {} already absent", name);
        }
        Ok(())
    }

    /// Observe the shim without changing anything.
    ///
    /// A shim that exists but no longer matches the descriptor reports as
    /// `Absent`, since `ensure_shim` would replace it.
    pub async fn inspect(&self, descriptor: &TopologyDescriptor) -> Result<ShimInterface> {
        let link = self
            .net
            .link(descriptor.shim_name())
            .await
            .map_err(|e| stage_error(ProvisionStage::Inspect, e))?;

        let matches = link
            .map(|l| l.is_shim_for(descriptor.host_interface(), host_net(descriptor.host_endpoint())))
            .unwrap_or(false);

        Ok(ShimInterface {
            name: descriptor.shim_name().to_string(),
            parent: descriptor.host_interface().to_string(),
            host_endpoint: descriptor.host_endpoint(),
            state: if matches { ShimState::Created } else { ShimState::Absent },
        })
    }

    async fn rollback(&self, name: &str) {
        match self.net.delete_link(name).await {
            Ok(_) => warn!("Rolled back partially created shim {}", name),
            Err(e) => error!("Failed to roll back partially created shim {}: {}", name, e),
        }
    }
}
