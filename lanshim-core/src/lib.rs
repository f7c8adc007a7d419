//! lanshim core library
//!
//! Provisions, verifies and tears down a host-side macvlan shim so the host
//! can reach services that own static addresses on a bridged LAN segment,
//! and keeps that configuration durable across reboots.

pub mod config;
pub mod error;
pub mod exec;
#[cfg(any(test, feature = "test-util"))]
pub mod fakes;
pub mod lifecycle;
pub mod lock;
pub mod network;
pub mod observability;
pub mod paths;
pub mod persistence;
pub mod readiness;
pub mod routes;
pub mod shim;
pub mod topology;

// Re-export commonly used items
pub use config::RawConfig;
pub use error::{HostError, ProvisionStage, Result, RouteError, ShimError};
pub use lifecycle::{ApplyReport, InstallReport, ShimLifecycle, StatusReport};
pub use lock::ProvisionGuard;
pub use network::{HostNetwork, SharedHostNetwork};
pub use observability::init as init_observability;
pub use persistence::{PersistenceRegistrar, PersistentUnit, ServiceSupervisor, SystemdSupervisor};
pub use readiness::{await_ready, ProbeTarget, Readiness, ReadinessCheck};
pub use routes::{RouteEntry, RouteSynchronizer};
pub use shim::{ShimInterface, ShimProvisioner, ShimState};
pub use topology::{load_and_validate, TopologyDescriptor};
