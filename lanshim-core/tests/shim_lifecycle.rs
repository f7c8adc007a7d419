//! Integration tests for the shim lifecycle.
//!
//! These tests drive the full flow against in-memory collaborators:
//! - Load and validate configuration from an env file
//! - Install (shim, routes, persistent unit)
//! - Re-apply from the boot snapshot
//! - Uninstall
//!
//! No privileges or real interfaces are needed.

use lanshim_core::{
    fakes::{FakeHostNetwork, FakeSupervisor, Mutation},
    load_and_validate, PersistenceRegistrar, ProvisionGuard, RawConfig, ShimError, ShimLifecycle,
    ShimState,
};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const EXAMPLE_ENV: &str = "\
SHIM_HOST_INTERFACE=eth0
SHIM_SUBNET=192.168.1.0/24
SHIM_GATEWAY=192.168.1.1
SHIM_SERVICE_RANGE=192.168.1.240/29
SHIM_SERVICE_OLLAMA_ADDR=192.168.1.241
SHIM_SERVICE_WHISPER_ADDR=192.168.1.242
";

fn net(cidr: &str) -> Ipv4Net {
    cidr.parse().unwrap()
}

struct Host {
    net: Arc<FakeHostNetwork>,
    supervisor: Arc<FakeSupervisor>,
    lifecycle: ShimLifecycle,
    dir: TempDir,
}

impl Host {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let net = FakeHostNetwork::with_interface("eth0");
        let supervisor = FakeSupervisor::new();
        let registrar =
            PersistenceRegistrar::new(supervisor.clone(), dir.path().join("etc/lanshim.env"));
        let lifecycle = ShimLifecycle::new(net.clone(), registrar);
        Self { net, supervisor, lifecycle, dir }
    }

    fn write_env(&self, contents: &str) -> std::path::PathBuf {
        let path = self.dir.path().join("input.env");
        std::fs::write(&path, contents).unwrap();
        path
    }

    async fn lock(&self) -> ProvisionGuard {
        ProvisionGuard::acquire(&self.dir.path().join("run/provision.lock"), Duration::ZERO)
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_example_scenario() {
    let host = Host::new();
    let raw = RawConfig::from_env_file(&host.write_env(EXAMPLE_ENV)).unwrap();
    let descriptor = load_and_validate(&raw, host.net.as_ref()).await.unwrap();
    assert_eq!(descriptor.host_endpoint(), Ipv4Addr::new(192, 168, 1, 246));

    let lock = host.lock().await;
    let report =
        host.lifecycle.install(&lock, &descriptor, Path::new("/usr/local/bin/lanshim")).await.unwrap();

    let shim = host.net.link_state("lanshim0").unwrap();
    assert_eq!(shim.parent.as_deref(), Some("eth0"));
    assert_eq!(shim.ipv4, vec![net("192.168.1.246/32")]);
    assert_eq!(report.applied.shim.state, ShimState::Routed);

    let routes = host.net.routes();
    assert_eq!(routes.len(), 2);
    assert_eq!(routes[0].destination, net("192.168.1.241/32"));
    assert_eq!(routes[1].destination, net("192.168.1.242/32"));
    assert!(routes.iter().all(|r| r.dev == "lanshim0"));

    host.lifecycle.uninstall(&lock, &descriptor).await.unwrap();
    assert!(host.net.link_state("lanshim0").is_none());
    assert!(host.net.routes().is_empty());
    assert!(!host.supervisor.installed("lanshim.service"));
}

#[tokio::test]
async fn test_boot_rerun_from_snapshot_is_a_noop() {
    let host = Host::new();
    let raw = RawConfig::from_env_file(&host.write_env(EXAMPLE_ENV)).unwrap();
    let descriptor = load_and_validate(&raw, host.net.as_ref()).await.unwrap();
    let lock = host.lock().await;
    let report =
        host.lifecycle.install(&lock, &descriptor, Path::new("/usr/local/bin/lanshim")).await.unwrap();

    // The unit's ExecStart reads the snapshot the registrar wrote.
    let snapshot = Path::new(&report.unit.provision_command[3]);
    let boot_raw = RawConfig::from_env_file(snapshot).unwrap();
    let boot_descriptor = load_and_validate(&boot_raw, host.net.as_ref()).await.unwrap();
    assert_eq!(boot_descriptor, descriptor);

    host.net.clear_mutations();
    host.lifecycle.apply(&lock, &boot_descriptor).await.unwrap();
    assert!(host.net.mutations().is_empty());
}

#[tokio::test]
async fn test_round_trip_remove_twice() {
    let host = Host::new();
    let raw = RawConfig::from_env_file(&host.write_env(EXAMPLE_ENV)).unwrap();
    let descriptor = load_and_validate(&raw, host.net.as_ref()).await.unwrap();
    let lock = host.lock().await;

    host.lifecycle.apply(&lock, &descriptor).await.unwrap();
    host.lifecycle.remove(&lock, &descriptor).await.unwrap();
    assert!(host.net.link_state("lanshim0").is_none());
    assert!(host.net.routes().is_empty());

    host.net.clear_mutations();
    host.lifecycle.remove(&lock, &descriptor).await.unwrap();
    assert!(host.net.link_state("eth0").is_some());
}

#[tokio::test]
async fn test_address_outside_range_fails_before_any_mutation() {
    let host = Host::new();
    let env = EXAMPLE_ENV.replace("192.168.1.242", "192.168.1.50");
    let raw = RawConfig::from_env_file(&host.write_env(&env)).unwrap();

    let err = load_and_validate(&raw, host.net.as_ref()).await.unwrap_err();
    assert!(matches!(err, ShimError::Validation { .. }));
    assert_eq!(err.exit_code(), 1);
    assert!(host.net.mutations().is_empty());
    assert!(host.supervisor.calls().is_empty());
}

#[tokio::test]
async fn test_missing_host_interface_fails_validation() {
    let host = Host::new();
    let env = EXAMPLE_ENV.replace("=eth0", "=eth9");
    let raw = RawConfig::from_env_file(&host.write_env(&env)).unwrap();

    let err = load_and_validate(&raw, host.net.as_ref()).await.unwrap_err();
    assert!(matches!(err, ShimError::Validation { .. }));
    assert!(host.net.mutations().is_empty());
}

#[tokio::test]
async fn test_foreign_route_survives_install() {
    let host = Host::new();
    host.net.insert_route(net("192.168.1.241/32"), "eth0");
    let raw = RawConfig::from_env_file(&host.write_env(EXAMPLE_ENV)).unwrap();
    let descriptor = load_and_validate(&raw, host.net.as_ref()).await.unwrap();
    let lock = host.lock().await;

    let err = host
        .lifecycle
        .install(&lock, &descriptor, Path::new("/usr/local/bin/lanshim"))
        .await
        .unwrap_err();
    assert!(matches!(err, ShimError::Route(_)));
    assert_eq!(err.exit_code(), 3);

    let routes = host.net.routes();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].dev, "eth0");
    assert!(host.net.link_state("lanshim0").is_none());
    assert!(!host
        .net
        .mutations()
        .iter()
        .any(|m| matches!(m, Mutation::AddRoute { .. } | Mutation::DeleteRoute { .. })));
    assert!(host.supervisor.calls().is_empty());
}
