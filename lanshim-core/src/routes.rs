//! Route table synchronizer.
//!
//! Keeps one /32 host route per service address through the shim. Routes to
//! those addresses through any other device belong to someone else and are
//! never modified.

use crate::error::{HostError, Result, RouteError, ShimError};
use crate::network::{host_net, require_net_admin, SharedHostNetwork};
use crate::shim::{ShimInterface, ShimState};
use crate::topology::TopologyDescriptor;
use ipnet::Ipv4Net;
use serde::Serialize;
use std::net::Ipv4Addr;
use tracing::{debug, error, info, instrument, warn};

/// A host route to one service address through the shim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteEntry {
    pub service: String,
    pub destination: Ipv4Addr,
    pub via: String,
}

impl RouteEntry {
    pub fn destination_net(&self) -> Ipv4Net {
        host_net(self.destination)
    }
}

/// Observed state of one service route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteStatus {
    pub service: String,
    pub destination: Ipv4Addr,
    /// Route through the shim exists
    pub present: bool,
    /// Device of a route to the same destination owned by someone else
    pub foreign_dev: Option<String>,
}

/// The routes `descriptor` calls for, in service-name order.
pub fn desired_routes(descriptor: &TopologyDescriptor) -> Vec<RouteEntry> {
    descriptor
        .services()
        .iter()
        .map(|(service, addr)| RouteEntry {
            service: service.clone(),
            destination: *addr,
            via: descriptor.shim_name().to_string(),
        })
        .collect()
}

fn route_failure(
    cause: HostError,
    operation: &str,
    build: impl FnOnce(HostError) -> RouteError,
) -> ShimError {
    if cause.is_permission_denied() {
        ShimError::Permission { operation: operation.to_string() }
    } else {
        ShimError::Route(build(cause))
    }
}

/// Adds and removes the service routes.
#[derive(Clone)]
pub struct RouteSynchronizer {
    net: SharedHostNetwork,
}

impl RouteSynchronizer {
    pub fn new(net: SharedHostNetwork) -> Self {
        Self { net }
    }

    /// Ensure every service has exactly its route through the shim.
    ///
    /// All destinations are inspected before anything is added, so a foreign
    /// route fails the call with nothing changed. Routes added by this call
    /// are removed again if a later add fails.
    #[instrument(skip_all, fields(shim = %shim.name))]
    pub async fn sync_routes(
        &self,
        descriptor: &TopologyDescriptor,
        shim: &ShimInterface,
    ) -> Result<Vec<RouteEntry>> {
        require_net_admin(self.net.as_ref(), "add service routes")?;

        if shim.state == ShimState::Absent {
            return Err(RouteError::ShimMissing { name: shim.name.clone() }.into());
        }

        let wanted = desired_routes(descriptor);
        let mut missing = Vec::new();

        for entry in &wanted {
            let dst = entry.destination_net();
            let existing = self.net.routes_to(dst).await.map_err(|e| {
                ShimError::Route(RouteError::Query { destination: entry.destination, cause: e })
            })?;

            if let Some(foreign) = existing.iter().find(|r| r.dev != shim.name) {
                error!(
                    destination = %entry.destination,
                    dev = %foreign.dev,
                    "Foreign route blocks service {}",
                    entry.service
                );
                return Err(RouteError::Conflict {
                    destination: entry.destination,
                    existing_dev: foreign.dev.clone(),
                }
                .into());
            }

            if existing.is_empty() {
                missing.push(entry);
            } else {
                debug!(destination = %entry.destination, "Route already present");
            }
        }

        let mut added: Vec<&RouteEntry> = Vec::new();
        for entry in missing {
            let dst = entry.destination_net();
            if let Err(cause) = self.net.add_route(dst, &shim.name).await {
                self.rollback(&added).await;
                return Err(route_failure(cause, "add service routes", |cause| RouteError::Add {
                    destination: entry.destination,
                    dev: shim.name.clone(),
                    cause,
                }));
            }
            info!("Route to {} ({}) via {} added", entry.destination, entry.service, shim.name);
            metrics::counter!("lanshim_routes_added_total").increment(1);
            added.push(entry);
        }

        Ok(wanted)
    }

    /// Remove the routes `sync_routes` would have created.
    ///
    /// Missing routes are fine; routes through other devices are untouched.
    #[instrument(skip_all, fields(shim = %descriptor.shim_name()))]
    pub async fn clear_routes(&self, descriptor: &TopologyDescriptor) -> Result<()> {
        require_net_admin(self.net.as_ref(), "remove service routes")?;

        for entry in desired_routes(descriptor) {
            match self.net.delete_route(entry.destination_net(), &entry.via).await {
                Ok(true) => {
                    info!("Route to {} ({}) removed", entry.destination, entry.service);
                    metrics::counter!("lanshim_routes_removed_total").increment(1);
                }
                Ok(false) => debug!("Route to {} already absent", entry.destination),
                Err(cause) => {
                    return Err(route_failure(cause, "remove service routes", |cause| {
                        RouteError::Remove {
                            destination: entry.destination,
                            dev: entry.via.clone(),
                            cause,
                        }
                    }))
                }
            }
        }
        Ok(())
    }

    /// Report each service route without changing anything.
    pub async fn inspect(&self, descriptor: &TopologyDescriptor) -> Result<Vec<RouteStatus>> {
        let mut report = Vec::new();
        for entry in desired_routes(descriptor) {
            let routes = self.net.routes_to(entry.destination_net()).await.map_err(|e| {
                ShimError::Route(RouteError::Query { destination: entry.destination, cause: e })
            })?;
            report.push(RouteStatus {
                present: routes.iter().any(|r| r.dev == entry.via),
                foreign_dev: routes.iter().find(|r| r.dev != entry.via).map(|r| r.dev.clone()),
                service: entry.service,
                destination: entry.destination,
            });
        }
        Ok(report)
    }

    /// Whether every service route through the shim is present.
    pub async fn all_present(&self, descriptor: &TopologyDescriptor) -> Result<bool> {
        Ok(self.inspect(descriptor).await?.iter().all(|r| r.present))
    }

    async fn rollback(&self, added: &[&RouteEntry]) {
        for entry in added.iter().rev() {
            if let Err(e) = self.net.delete_route(entry.destination_net(), &entry.via).await {
                error!("Failed to roll back route to {}: {}", entry.destination, e);
            } else {
                warn!("Rolled back route to {}", entry.destination);
            }
        }
    }
}
