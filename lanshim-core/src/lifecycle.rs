//! Lifecycle orchestration.
//!
//! Composes the provisioner, route synchronizer and registrar into the flows
//! the command line exposes. The boot-time unit runs [`ShimLifecycle::apply`]
//! and [`ShimLifecycle::remove`], the same functions a manual run uses.

use crate::error::{Result, ShimError};
use crate::lock::ProvisionGuard;
use crate::network::SharedHostNetwork;
use crate::persistence::{PersistenceRegistrar, PersistentUnit};
use crate::routes::{RouteEntry, RouteStatus, RouteSynchronizer};
use crate::shim::{ShimInterface, ShimProvisioner, ShimState};
use crate::topology::TopologyDescriptor;
use serde::Serialize;
use std::path::Path;
use tracing::{error, info, instrument, warn};

/// Outcome of a successful `apply`.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub shim: ShimInterface,
    pub routes: Vec<RouteEntry>,
}

/// Outcome of a successful `install`.
#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    #[serde(flatten)]
    pub applied: ApplyReport,
    pub unit: PersistentUnit,
}

/// Read-only view of the host.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub shim: ShimInterface,
    pub routes: Vec<RouteStatus>,
    pub unit: String,
    pub unit_installed: bool,
}

/// Shim lifecycle over one host network backend and one registrar.
#[derive(Clone)]
pub struct ShimLifecycle {
    shims: ShimProvisioner,
    routes: RouteSynchronizer,
    registrar: PersistenceRegistrar,
}

impl ShimLifecycle {
    pub fn new(net: SharedHostNetwork, registrar: PersistenceRegistrar) -> Self {
        Self {
            shims: ShimProvisioner::new(net.clone()),
            routes: RouteSynchronizer::new(net),
            registrar,
        }
    }

    pub fn registrar(&self) -> &PersistenceRegistrar {
        &self.registrar
    }

    /// Ensure the shim and its routes.
    ///
    /// If the routes cannot be installed and the shim was created by this
    /// call, the shim is removed again. A shim that already matched is kept.
    #[instrument(skip_all, fields(shim = %descriptor.shim_name()))]
    pub async fn apply(
        &self,
        lock: &ProvisionGuard,
        descriptor: &TopologyDescriptor,
    ) -> Result<ApplyReport> {
        let preexisting = self.shims.inspect(descriptor).await?.state != ShimState::Absent;
        let mut shim = self.shims.ensure_shim(lock, descriptor).await?;

        let routes = match self.routes.sync_routes(descriptor, &shim).await {
            Ok(routes) => routes,
            Err(e) => {
                if !preexisting {
                    match self.shims.remove_shim(lock, descriptor).await {
                        Ok(()) => warn!("Removed shim {} after route failure", shim.name),
                        Err(cleanup) => {
                            error!("Failed to remove shim {} after route failure: {}", shim.name, cleanup)
                        }
                    }
                }
                return Err(e);
            }
        };
        shim.state = ShimState::Routed;

        info!(
            "Shim {} up at {} with {} service routes",
            shim.name,
            shim.host_endpoint,
            routes.len()
        );
        Ok(ApplyReport { shim, routes })
    }

    /// Apply, then register the persistent unit.
    ///
    /// A registration failure is returned as is; the shim and routes already
    /// in place stay up.
    #[instrument(skip_all, fields(shim = %descriptor.shim_name()))]
    pub async fn install(
        &self,
        lock: &ProvisionGuard,
        descriptor: &TopologyDescriptor,
        executable: &Path,
    ) -> Result<InstallReport> {
        let applied = self.apply(lock, descriptor).await?;
        let unit = self.registrar.register_persistent_unit(descriptor, executable).await?;
        Ok(InstallReport { applied, unit })
    }

    /// Clear the service routes, then remove the shim.
    ///
    /// The shim is removed even if clearing routes failed; the first error is
    /// returned afterwards.
    #[instrument(skip_all, fields(shim = %descriptor.shim_name()))]
    pub async fn remove(&self, lock: &ProvisionGuard, descriptor: &TopologyDescriptor) -> Result<()> {
        let mut first: Option<ShimError> = None;
        let mut note = |step: &str, result: Result<()>| {
            if let Err(e) = result {
                error!("{} failed: {}", step, e);
                first.get_or_insert(e);
            }
        };

        note("clear routes", self.routes.clear_routes(descriptor).await);
        note("remove shim", self.shims.remove_shim(lock, descriptor).await);

        match first {
            Some(e) => Err(e),
            None => {
                info!("Shim {} removed", descriptor.shim_name());
                Ok(())
            }
        }
    }

    /// Unregister the unit, clear routes and remove the shim.
    ///
    /// Every step runs even if an earlier one failed; the first error is
    /// returned once all have been tried.
    #[instrument(skip_all, fields(shim = %descriptor.shim_name()))]
    pub async fn uninstall(
        &self,
        lock: &ProvisionGuard,
        descriptor: &TopologyDescriptor,
    ) -> Result<()> {
        let mut first: Option<ShimError> = None;
        let mut note = |step: &str, result: Result<()>| {
            if let Err(e) = result {
                error!("{} failed: {}", step, e);
                first.get_or_insert(e);
            }
        };

        note("unregister", self.unregister(descriptor).await);
        note("clear routes", self.routes.clear_routes(descriptor).await);
        note("remove shim", self.shims.remove_shim(lock, descriptor).await);

        match first {
            Some(e) => Err(e),
            None => {
                info!("lanshim uninstalled");
                Ok(())
            }
        }
    }

    /// Remove only the persistent unit and its snapshot.
    pub async fn unregister(&self, descriptor: &TopologyDescriptor) -> Result<()> {
        self.registrar.unregister_persistent_unit(descriptor.unit_name()).await
    }

    /// Observe the shim, its routes and the unit.
    pub async fn status(&self, descriptor: &TopologyDescriptor) -> Result<StatusReport> {
        let mut shim = self.shims.inspect(descriptor).await?;
        let routes = self.routes.inspect(descriptor).await?;
        if shim.state == ShimState::Created && routes.iter().all(|r| r.present) {
            shim.state = ShimState::Routed;
        }

        Ok(StatusReport {
            shim,
            routes,
            unit: descriptor.unit_name().to_string(),
            unit_installed: self.registrar.is_registered(descriptor.unit_name()).await?,
        })
    }
}
