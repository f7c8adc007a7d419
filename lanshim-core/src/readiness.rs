//! Readiness prober.
//!
//! Polls a target at a fixed interval until it answers or the attempt budget
//! runs out. Transport failures are "not yet", never errors, and a timeout is
//! a result for the caller to interpret.

use crate::error::HostError;
use crate::exec;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Attempts made when none are configured.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 30;

/// Interval between attempts when none is configured.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

/// What a readiness check polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    /// A TCP listener accepts connections.
    Tcp(SocketAddr),
    /// An HTTP GET answers with a 2xx status.
    Http(String),
    /// A container reports itself running.
    ContainerRunning(String),
    /// A command inside a container exits zero.
    ContainerExec { container: String, command: Vec<String> },
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeTarget::Tcp(addr) => write!(f, "tcp://{}", addr),
            ProbeTarget::Http(url) => write!(f, "{}", url),
            ProbeTarget::ContainerRunning(name) => write!(f, "container {}", name),
            ProbeTarget::ContainerExec { container, command } => {
                write!(f, "`{}` in container {}", command.join(" "), container)
            }
        }
    }
}

impl ProbeTarget {
    /// Build the probe for this target.
    pub fn probe(&self, runtime: SharedContainerRuntime) -> Box<dyn Probe> {
        match self {
            ProbeTarget::Tcp(addr) => Box::new(TcpProbe::new(*addr)),
            ProbeTarget::Http(url) => Box::new(HttpProbe::new(url.clone())),
            ProbeTarget::ContainerRunning(name) => {
                Box::new(ContainerRunningProbe::new(runtime, name.clone()))
            }
            ProbeTarget::ContainerExec { container, command } => {
                Box::new(ContainerExecProbe::new(runtime, container.clone(), command.clone()))
            }
        }
    }
}

/// A bounded polling request.
#[derive(Debug, Clone)]
pub struct ReadinessCheck {
    pub target: ProbeTarget,
    pub max_attempts: u32,
    pub interval: Duration,
}

impl ReadinessCheck {
    pub fn new(target: ProbeTarget) -> Self {
        Self { target, max_attempts: DEFAULT_MAX_ATTEMPTS, interval: DEFAULT_INTERVAL }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Result of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready,
    NotYet(String),
}

/// Success predicate for one target.
#[async_trait::async_trait]
pub trait Probe: Send + Sync {
    /// Make one attempt.
    async fn attempt(&self) -> ProbeOutcome;
}

/// Terminal state of [`await_ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Readiness {
    Ready { attempts: u32 },
    Timeout { attempts_made: u32 },
    Cancelled { attempts_made: u32 },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready { .. })
    }

    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> u8 {
        if self.is_ready() {
            crate::error::exit_code::SUCCESS
        } else {
            crate::error::exit_code::READINESS
        }
    }
}

/// Poll `probe` until it reports ready, the attempts run out or `cancel` fires.
///
/// Each attempt is bounded by the interval. There is no sleep after the final
/// attempt, and no attempt starts once cancellation is observed.
#[instrument(skip(probe, cancel), fields(target = %check.target))]
pub async fn await_ready(
    check: &ReadinessCheck,
    probe: &dyn Probe,
    cancel: &CancellationToken,
) -> Readiness {
    let max_attempts = check.max_attempts.max(1);
    let mut attempts = 0;

    loop {
        if cancel.is_cancelled() {
            warn!("Readiness wait cancelled after {} attempts", attempts);
            return Readiness::Cancelled { attempts_made: attempts };
        }

        attempts += 1;
        metrics::counter!("lanshim_readiness_attempts_total").increment(1);

        let outcome = match tokio::time::timeout(check.interval, probe.attempt()).await {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::NotYet("attempt timed out".to_string()),
        };

        match outcome {
            ProbeOutcome::Ready => {
                info!("{} ready after {} attempts", check.target, attempts);
                return Readiness::Ready { attempts };
            }
            ProbeOutcome::NotYet(reason) => {
                debug!(attempt = attempts, "Not ready: {}", reason);
            }
        }

        if attempts >= max_attempts {
            warn!("{} not ready after {} attempts", check.target, attempts);
            return Readiness::Timeout { attempts_made: attempts };
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                warn!("Readiness wait cancelled after {} attempts", attempts);
                return Readiness::Cancelled { attempts_made: attempts };
            }
            _ = tokio::time::sleep(check.interval) => {}
        }
    }
}

/// Run `action` once the target is ready.
///
/// When the wait ends any other way the action is skipped and the terminal
/// state is returned instead.
pub async fn run_when_ready<F, Fut, T>(
    check: &ReadinessCheck,
    probe: &dyn Probe,
    cancel: &CancellationToken,
    action: F,
) -> Result<T, Readiness>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    match await_ready(check, probe, cancel).await {
        Readiness::Ready { .. } => Ok(action().await),
        other => Err(other),
    }
}

/// Ready when a TCP connection is accepted.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    addr: SocketAddr,
}

impl TcpProbe {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait::async_trait]
impl Probe for TcpProbe {
    async fn attempt(&self) -> ProbeOutcome {
        match tokio::net::TcpStream::connect(self.addr).await {
            Ok(_) => ProbeOutcome::Ready,
            Err(e) => ProbeOutcome::NotYet(e.to_string()),
        }
    }
}

/// Ready when a GET answers with a 2xx status.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), url: url.into() }
    }
}

#[async_trait::async_trait]
impl Probe for HttpProbe {
    async fn attempt(&self) -> ProbeOutcome {
        match self.client.get(&self.url).send().await {
            Ok(resp) if resp.status().is_success() => ProbeOutcome::Ready,
            Ok(resp) => ProbeOutcome::NotYet(format!("HTTP {}", resp.status())),
            Err(e) => ProbeOutcome::NotYet(e.to_string()),
        }
    }
}

/// Container runtime collaborator.
///
/// Only status and exec are needed; container lifecycle lives elsewhere.
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether the named container is running.
    async fn is_running(&self, container: &str) -> Result<bool, HostError>;

    /// Run a command inside the container, returning its stdout.
    async fn exec(&self, container: &str, command: &[String]) -> Result<String, HostError>;
}

/// Shared handle to a container runtime.
pub type SharedContainerRuntime = Arc<dyn ContainerRuntime>;

/// Container runtime driven through the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    docker: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self { docker: "docker".to_string() }
    }

    pub fn with_binary(docker: impl Into<String>) -> Self {
        Self { docker: docker.into() }
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerCli {
    async fn is_running(&self, container: &str) -> Result<bool, HostError> {
        let out =
            exec::run(&self.docker, ["inspect", "--format", "{{.State.Running}}", container]).await?;
        Ok(out.trim() == "true")
    }

    async fn exec(&self, container: &str, command: &[String]) -> Result<String, HostError> {
        let mut args = vec!["exec".to_string(), container.to_string()];
        args.extend(command.iter().cloned());
        exec::run(&self.docker, &args).await
    }
}

/// Ready when the container is running.
pub struct ContainerRunningProbe {
    runtime: SharedContainerRuntime,
    container: String,
}

impl ContainerRunningProbe {
    pub fn new(runtime: SharedContainerRuntime, container: String) -> Self {
        Self { runtime, container }
    }
}

#[async_trait::async_trait]
impl Probe for ContainerRunningProbe {
    async fn attempt(&self) -> ProbeOutcome {
        match self.runtime.is_running(&self.container).await {
            Ok(true) => ProbeOutcome::Ready,
            Ok(false) => ProbeOutcome::NotYet(format!("{} is not running", self.container)),
            Err(e) => ProbeOutcome::NotYet(e.to_string()),
        }
    }
}

/// Ready when a command inside the container succeeds.
pub struct ContainerExecProbe {
    runtime: SharedContainerRuntime,
    container: String,
    command: Vec<String>,
}

impl ContainerExecProbe {
    pub fn new(runtime: SharedContainerRuntime, container: String, command: Vec<String>) -> Self {
        Self { runtime, container, command }
    }
}

#[async_trait::async_trait]
impl Probe for ContainerExecProbe {
    async fn attempt(&self) -> ProbeOutcome {
        match self.runtime.exec(&self.container, &self.command).await {
            Ok(_) => ProbeOutcome::Ready,
            Err(e) => ProbeOutcome::NotYet(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeContainerRuntime, ScriptedProbe};
    use tokio::time::Instant;

    fn check(max_attempts: u32, interval_ms: u64) -> ReadinessCheck {
        ReadinessCheck::new(ProbeTarget::Tcp("127.0.0.1:9".parse().unwrap()))
            .with_max_attempts(max_attempts)
            .with_interval(Duration::from_millis(interval_ms))
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_max_attempts() {
        let probe = ScriptedProbe::never();
        let start = Instant::now();

        let result = await_ready(&check(3, 10), &probe, &CancellationToken::new()).await;

        assert_eq!(result, Readiness::Timeout { attempts_made: 3 });
        assert_eq!(probe.attempts(), 3);
        // Two sleeps between three attempts, none after the last.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(20) && elapsed < Duration::from_millis(30));
        assert_eq!(result.exit_code(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_second_attempt() {
        let probe = ScriptedProbe::ready_after(1);

        let result = await_ready(&check(3, 10), &probe, &CancellationToken::new()).await;

        assert_eq!(result, Readiness::Ready { attempts: 2 });
        assert_eq!(probe.attempts(), 2);
        assert_eq!(result.exit_code(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_first_attempt() {
        let probe = ScriptedProbe::never();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = await_ready(&check(3, 10), &probe, &cancel).await;
        assert_eq!(result, Readiness::Cancelled { attempts_made: 0 });
        assert_eq!(probe.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_sleep_stops_attempts() {
        let probe = Arc::new(ScriptedProbe::never());
        let cancel = CancellationToken::new();

        let task = {
            let probe = probe.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { await_ready(&check(5, 1000), probe.as_ref(), &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(1500)).await;
        cancel.cancel();

        assert_eq!(task.await.unwrap(), Readiness::Cancelled { attempts_made: 2 });
        assert_eq!(probe.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_counts_as_not_yet() {
        let probe = ScriptedProbe::never().with_delay(Duration::from_secs(60));

        let result = await_ready(&check(2, 10), &probe, &CancellationToken::new()).await;
        assert_eq!(result, Readiness::Timeout { attempts_made: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_when_ready_gates_action() {
        let ready = ScriptedProbe::ready_after(0);
        let ran = run_when_ready(&check(3, 10), &ready, &CancellationToken::new(), || async { 7 })
            .await;
        assert_eq!(ran, Ok(7));

        let never = ScriptedProbe::never();
        let skipped =
            run_when_ready(&check(2, 10), &never, &CancellationToken::new(), || async { 7 }).await;
        assert_eq!(skipped, Err(Readiness::Timeout { attempts_made: 2 }));
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert_eq!(TcpProbe::new(addr).attempt().await, ProbeOutcome::Ready);

        drop(listener);
        assert!(matches!(TcpProbe::new(addr).attempt().await, ProbeOutcome::NotYet(_)));
    }

    #[tokio::test]
    async fn test_container_probes() {
        let runtime = FakeContainerRuntime::new();
        let running = ContainerRunningProbe::new(runtime.clone(), "ollama".into());
        let exec = ContainerExecProbe::new(
            runtime.clone(),
            "ollama".into(),
            vec!["ollama".into(), "list".into()],
        );

        assert!(matches!(running.attempt().await, ProbeOutcome::NotYet(_)));
        assert!(matches!(exec.attempt().await, ProbeOutcome::NotYet(_)));

        runtime.set_running("ollama", true);
        assert_eq!(running.attempt().await, ProbeOutcome::Ready);
        assert_eq!(exec.attempt().await, ProbeOutcome::Ready);
        assert_eq!(runtime.execs().len(), 2);
        assert_eq!(
            runtime.execs().last(),
            Some(&("ollama".to_string(), vec!["ollama".to_string(), "list".to_string()]))
        );
    }

    #[test]
    fn test_readiness_json() {
        let json = serde_json::to_value(Readiness::Timeout { attempts_made: 3 }).unwrap();
        assert_eq!(json["state"], "timeout");
        assert_eq!(json["attempts_made"], 3);
    }
}
