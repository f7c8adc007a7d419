//! In-memory host network.

use crate::error::HostError;
use crate::network::{HostNetwork, LinkInfo, RouteInfo, MACVLAN_KIND, MACVLAN_MODE};
use ipnet::Ipv4Net;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

/// A mutating call observed by [`FakeHostNetwork`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    AddMacvlan { name: String, parent: String },
    AddAddress { name: String, address: Ipv4Net },
    SetLinkUp { name: String },
    DeleteLink { name: String },
    AddRoute { destination: Ipv4Net, dev: String },
    DeleteRoute { destination: Ipv4Net, dev: String },
}

/// Operation at which [`FakeHostNetwork`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    AddMacvlan,
    AddAddress,
    SetLinkUp,
    DeleteLink,
    AddRoute,
    DeleteRoute,
}

#[derive(Debug, Clone, Copy)]
struct Injected {
    /// Calls to let through before failing
    skip: usize,
    permission: bool,
}

#[derive(Default)]
struct FakeState {
    links: BTreeMap<String, LinkInfo>,
    routes: Vec<RouteInfo>,
    undeletable: BTreeSet<String>,
    mutations: Vec<Mutation>,
    failures: HashMap<FailPoint, Injected>,
}

/// A fake implementation of [`HostNetwork`].
///
/// Keeps links and routes in memory, mimics the kernel's answers for
/// duplicates and missing targets, and records every mutating call so tests
/// can assert that no mutation happened.
pub struct FakeHostNetwork {
    state: Mutex<FakeState>,
    privileged: std::sync::atomic::AtomicBool,
}

impl FakeHostNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState::default()),
            privileged: std::sync::atomic::AtomicBool::new(true),
        })
    }

    /// A fake host with one physical interface.
    pub fn with_interface(name: &str) -> Arc<Self> {
        let net = Self::new();
        net.add_physical(name);
        net
    }

    /// Add a physical interface.
    pub fn add_physical(&self, name: &str) {
        self.lock().links.insert(
            name.to_string(),
            LinkInfo {
                name: name.to_string(),
                kind: None,
                mode: None,
                parent: None,
                up: true,
                ipv4: Vec::new(),
            },
        );
    }

    /// Insert a link as-is, bypassing the mutation log.
    pub fn insert_link(&self, link: LinkInfo) {
        self.lock().links.insert(link.name.clone(), link);
    }

    /// Insert a route as-is, bypassing the mutation log.
    pub fn insert_route(&self, destination: Ipv4Net, dev: &str) {
        self.lock().routes.push(RouteInfo { destination, dev: dev.to_string() });
    }

    /// Make deletion of `name` report success while leaving the link in place.
    pub fn make_undeletable(&self, name: &str) {
        self.lock().undeletable.insert(name.to_string());
    }

    /// Grant or revoke the privilege to mutate.
    pub fn set_privileged(&self, privileged: bool) {
        self.privileged.store(privileged, std::sync::atomic::Ordering::SeqCst);
    }

    /// Fail the call at `point` after letting `skip` calls through.
    pub fn fail_at(&self, point: FailPoint, skip: usize) {
        self.lock().failures.insert(point, Injected { skip, permission: false });
    }

    /// Like [`Self::fail_at`], but the failure is a permission denial.
    pub fn deny_at(&self, point: FailPoint) {
        self.lock().failures.insert(point, Injected { skip: 0, permission: true });
    }

    /// All mutating calls made so far, including failed ones.
    pub fn mutations(&self) -> Vec<Mutation> {
        self.lock().mutations.clone()
    }

    /// Forget the mutation log.
    pub fn clear_mutations(&self) {
        self.lock().mutations.clear();
    }

    /// Current state of a link.
    pub fn link_state(&self, name: &str) -> Option<LinkInfo> {
        self.lock().links.get(name).cloned()
    }

    /// Current route table.
    pub fn routes(&self) -> Vec<RouteInfo> {
        self.lock().routes.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }
}

impl FakeState {
    fn record(&mut self, point: FailPoint, mutation: Mutation) -> Result<(), HostError> {
        let command = format!("{:?}", mutation);
        self.mutations.push(mutation);

        if let Some(injected) = self.failures.get_mut(&point) {
            if injected.skip > 0 {
                injected.skip -= 1;
            } else {
                let permission = injected.permission;
                self.failures.remove(&point);
                return Err(if permission {
                    HostError::PermissionDenied {
                        command,
                        stderr: "Operation not permitted".to_string(),
                    }
                } else {
                    HostError::Failed {
                        command,
                        status: "exit status: 2".to_string(),
                        stderr: "injected failure".to_string(),
                    }
                });
            }
        }
        Ok(())
    }
}

fn not_found(command: String, what: &str) -> HostError {
    HostError::NotFound { command, stderr: format!("Cannot find {}", what) }
}

fn exists(command: String) -> HostError {
    HostError::Failed {
        command,
        status: "exit status: 2".to_string(),
        stderr: "RTNETLINK answers: File exists".to_string(),
    }
}

#[async_trait::async_trait]
impl HostNetwork for FakeHostNetwork {
    fn has_net_admin(&self) -> bool {
        self.privileged.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn interface_exists(&self, name: &str) -> Result<bool, HostError> {
        Ok(self.lock().links.contains_key(name))
    }

    async fn link(&self, name: &str) -> Result<Option<LinkInfo>, HostError> {
        Ok(self.lock().links.get(name).cloned())
    }

    async fn add_macvlan(&self, name: &str, parent: &str) -> Result<(), HostError> {
        let mut state = self.lock();
        let mutation = Mutation::AddMacvlan { name: name.into(), parent: parent.into() };
        let command = format!("{:?}", mutation);
        state.record(FailPoint::AddMacvlan, mutation)?;

        if state.links.contains_key(name) {
            return Err(exists(command));
        }
        if !state.links.contains_key(parent) {
            return Err(not_found(command, parent));
        }
        state.links.insert(
            name.to_string(),
            LinkInfo {
                name: name.to_string(),
                kind: Some(MACVLAN_KIND.to_string()),
                mode: Some(MACVLAN_MODE.to_string()),
                parent: Some(parent.to_string()),
                up: false,
                ipv4: Vec::new(),
            },
        );
        Ok(())
    }

    async fn add_address(&self, name: &str, address: Ipv4Net) -> Result<(), HostError> {
        let mut state = self.lock();
        let mutation = Mutation::AddAddress { name: name.into(), address };
        let command = format!("{:?}", mutation);
        state.record(FailPoint::AddAddress, mutation)?;

        let link = state.links.get_mut(name).ok_or_else(|| not_found(command.clone(), name))?;
        if link.ipv4.contains(&address) {
            return Err(exists(command));
        }
        link.ipv4.push(address);
        Ok(())
    }

    async fn set_link_up(&self, name: &str) -> Result<(), HostError> {
        let mut state = self.lock();
        let mutation = Mutation::SetLinkUp { name: name.into() };
        let command = format!("{:?}", mutation);
        state.record(FailPoint::SetLinkUp, mutation)?;

        let link = state.links.get_mut(name).ok_or_else(|| not_found(command, name))?;
        link.up = true;
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> Result<bool, HostError> {
        let mut state = self.lock();
        state.record(FailPoint::DeleteLink, Mutation::DeleteLink { name: name.into() })?;

        if state.undeletable.contains(name) {
            return Ok(true);
        }
        if state.links.remove(name).is_none() {
            return Ok(false);
        }
        // The kernel drops routes through a link together with the link.
        state.routes.retain(|r| r.dev != name);
        Ok(true)
    }

    async fn routes_to(&self, destination: Ipv4Net) -> Result<Vec<RouteInfo>, HostError> {
        Ok(self.lock().routes.iter().filter(|r| r.destination == destination).cloned().collect())
    }

    async fn add_route(&self, destination: Ipv4Net, dev: &str) -> Result<(), HostError> {
        let mut state = self.lock();
        let mutation = Mutation::AddRoute { destination, dev: dev.into() };
        let command = format!("{:?}", mutation);
        state.record(FailPoint::AddRoute, mutation)?;

        if !state.links.contains_key(dev) {
            return Err(not_found(command, dev));
        }
        if state.routes.iter().any(|r| r.destination == destination) {
            return Err(exists(command));
        }
        state.routes.push(RouteInfo { destination, dev: dev.to_string() });
        Ok(())
    }

    async fn delete_route(&self, destination: Ipv4Net, dev: &str) -> Result<bool, HostError> {
        let mut state = self.lock();
        state.record(FailPoint::DeleteRoute, Mutation::DeleteRoute { destination, dev: dev.into() })?;

        let before = state.routes.len();
        state.routes.retain(|r| !(r.destination == destination && r.dev == dev));
        Ok(state.routes.len() != before)
    }
}
