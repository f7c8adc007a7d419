//! Scripted readiness collaborators.

use crate::error::HostError;
use crate::readiness::{ContainerRuntime, Probe, ProbeOutcome};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A probe that becomes ready after a fixed number of failed attempts.
pub struct ScriptedProbe {
    failures_before_ready: Option<u32>,
    delay: Duration,
    attempts: AtomicU32,
}

impl ScriptedProbe {
    /// Ready once `failures` attempts have reported not-yet.
    pub fn ready_after(failures: u32) -> Self {
        Self { failures_before_ready: Some(failures), delay: Duration::ZERO, attempts: AtomicU32::new(0) }
    }

    /// Never ready.
    pub fn never() -> Self {
        Self { failures_before_ready: None, delay: Duration::ZERO, attempts: AtomicU32::new(0) }
    }

    /// Make each attempt take `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Probe for ScriptedProbe {
    async fn attempt(&self) -> ProbeOutcome {
        let made = self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.failures_before_ready {
            Some(failures) if made >= failures => ProbeOutcome::Ready,
            _ => ProbeOutcome::NotYet("connection refused".to_string()),
        }
    }
}

/// A container runtime with settable container states.
#[derive(Default)]
pub struct FakeContainerRuntime {
    running: Mutex<BTreeMap<String, bool>>,
    execs: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeContainerRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_running(&self, container: &str, running: bool) {
        self.running.lock().unwrap().insert(container.to_string(), running);
    }

    /// Every exec requested, in order.
    pub fn execs(&self) -> Vec<(String, Vec<String>)> {
        self.execs.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for FakeContainerRuntime {
    async fn is_running(&self, container: &str) -> Result<bool, HostError> {
        match self.running.lock().unwrap().get(container) {
            Some(running) => Ok(*running),
            None => Err(HostError::NotFound {
                command: format!("inspect {}", container),
                stderr: format!("No such container: {}", container),
            }),
        }
    }

    async fn exec(&self, container: &str, command: &[String]) -> Result<String, HostError> {
        self.execs.lock().unwrap().push((container.to_string(), command.to_vec()));
        if self.is_running(container).await? {
            Ok(String::new())
        } else {
            Err(HostError::Failed {
                command: format!("exec {} {}", container, command.join(" ")),
                status: "exit status: 1".to_string(),
                stderr: format!("container {} is not running", container),
            })
        }
    }
}
