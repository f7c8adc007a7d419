//! In-memory service supervisor.

use crate::error::{Result, ShimError};
use crate::persistence::{PersistentUnit, ServiceSupervisor};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A call observed by [`FakeSupervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorCall {
    Install(String),
    Enable(String),
    Disable(String),
    Remove(String),
}

#[derive(Default)]
struct Installed {
    unit: Option<PersistentUnit>,
    enabled: bool,
}

/// A fake implementation of [`ServiceSupervisor`].
#[derive(Default)]
pub struct FakeSupervisor {
    units: Mutex<BTreeMap<String, Installed>>,
    calls: Mutex<Vec<SupervisorCall>>,
    fail_install: AtomicBool,
    fail_enable: AtomicBool,
}

impl FakeSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every `install` fail.
    pub fn fail_install(&self) {
        self.fail_install.store(true, Ordering::SeqCst);
    }

    /// Make every `enable` fail.
    pub fn fail_enable(&self) {
        self.fail_enable.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<SupervisorCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn installed(&self, name: &str) -> bool {
        self.units.lock().unwrap().get(name).is_some_and(|u| u.unit.is_some())
    }

    pub fn enabled(&self, name: &str) -> bool {
        self.units.lock().unwrap().get(name).is_some_and(|u| u.enabled)
    }

    /// The unit as last installed.
    pub fn unit(&self, name: &str) -> Option<PersistentUnit> {
        self.units.lock().unwrap().get(name).and_then(|u| u.unit.clone())
    }

    fn record(&self, call: SupervisorCall) {
        self.calls.lock().unwrap().push(call);
    }
}

fn refused(unit: &str, what: &str) -> ShimError {
    ShimError::Registration { unit: unit.to_string(), reason: format!("{} refused", what) }
}

#[async_trait::async_trait]
impl ServiceSupervisor for FakeSupervisor {
    async fn install(&self, unit: &PersistentUnit) -> Result<()> {
        self.record(SupervisorCall::Install(unit.name.clone()));
        if self.fail_install.load(Ordering::SeqCst) {
            return Err(refused(&unit.name, "install"));
        }
        self.units.lock().unwrap().entry(unit.name.clone()).or_default().unit = Some(unit.clone());
        Ok(())
    }

    async fn enable(&self, unit: &PersistentUnit) -> Result<()> {
        self.record(SupervisorCall::Enable(unit.name.clone()));
        if self.fail_enable.load(Ordering::SeqCst) {
            return Err(refused(&unit.name, "enable"));
        }
        match self.units.lock().unwrap().get_mut(&unit.name) {
            Some(installed) if installed.unit.is_some() => {
                installed.enabled = true;
                Ok(())
            }
            _ => Err(refused(&unit.name, "enable of missing unit")),
        }
    }

    async fn disable(&self, name: &str) -> Result<bool> {
        self.record(SupervisorCall::Disable(name.to_string()));
        Ok(self
            .units
            .lock()
            .unwrap()
            .get_mut(name)
            .map(|u| std::mem::replace(&mut u.enabled, false))
            .unwrap_or(false))
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        self.record(SupervisorCall::Remove(name.to_string()));
        Ok(self.units.lock().unwrap().remove(name).is_some_and(|u| u.unit.is_some()))
    }

    async fn is_installed(&self, name: &str) -> Result<bool> {
        Ok(self.installed(name))
    }
}
