//! `lanshim wait` command

use super::GlobalArgs;
use anyhow::{anyhow, Result};
use clap::{ArgGroup, Args};
use colored::Colorize;
use lanshim_core::readiness::{DockerCli, DEFAULT_MAX_ATTEMPTS};
use lanshim_core::{await_ready, topology, ProbeTarget, Readiness, ReadinessCheck};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Args, Debug, Clone)]
#[command(group(ArgGroup::new("target").required(true).args(["tcp", "http", "container", "service"])))]
pub struct WaitArgs {
    /// TCP address that must accept connections (HOST:PORT)
    #[arg(long)]
    pub tcp: Option<SocketAddr>,

    /// URL that must answer a GET with a 2xx status
    #[arg(long)]
    pub http: Option<String>,

    /// Container that must be running
    #[arg(long)]
    pub container: Option<String>,

    /// Command that must succeed inside --container
    #[arg(long, requires = "container", num_args = 1.., allow_hyphen_values = true)]
    pub exec: Vec<String>,

    /// Configured service whose address must accept connections on --port
    #[arg(long, requires = "port")]
    pub service: Option<String>,

    /// Port for --service
    #[arg(long)]
    pub port: Option<u16>,

    /// Attempts before giving up
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub attempts: u32,

    /// Milliseconds between attempts
    #[arg(long, default_value_t = 2000)]
    pub interval_ms: u64,
}

impl WaitArgs {
    fn target(&self, global: &GlobalArgs) -> Result<ProbeTarget> {
        if let Some(addr) = self.tcp {
            return Ok(ProbeTarget::Tcp(addr));
        }
        if let Some(url) = &self.http {
            return Ok(ProbeTarget::Http(url.clone()));
        }
        if let Some(container) = &self.container {
            return Ok(if self.exec.is_empty() {
                ProbeTarget::ContainerRunning(container.clone())
            } else {
                ProbeTarget::ContainerExec { container: container.clone(), command: self.exec.clone() }
            });
        }
        if let (Some(service), Some(port)) = (&self.service, self.port) {
            // Only the address lookup is needed, so no host check here.
            let descriptor = topology::validate(&global.raw_config()?)?;
            let addr = descriptor
                .services()
                .get(service)
                .ok_or_else(|| anyhow!("no service named {} is configured", service))?;
            return Ok(ProbeTarget::Tcp(SocketAddr::from((*addr, port))));
        }
        Err(anyhow!("no readiness target given"))
    }
}

/// Wait for the target; Ctrl-C cancels between attempts.
pub async fn wait(global: &GlobalArgs, args: &WaitArgs) -> Result<u8> {
    let check = ReadinessCheck::new(args.target(global)?)
        .with_max_attempts(args.attempts)
        .with_interval(Duration::from_millis(args.interval_ms));
    let probe = check.target.probe(Arc::new(DockerCli::new()));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let outcome = await_ready(&check, probe.as_ref(), &cancel).await;
    match outcome {
        Readiness::Ready { attempts } => {
            println!("{} {} ready after {} attempts", "✓".green().bold(), check.target, attempts);
        }
        Readiness::Timeout { attempts_made } => {
            eprintln!(
                "{} {} not ready after {} attempts",
                "✗".red().bold(),
                check.target,
                attempts_made
            );
        }
        Readiness::Cancelled { attempts_made } => {
            eprintln!("{} Cancelled after {} attempts", "✗".red().bold(), attempts_made);
        }
    }
    Ok(outcome.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        global: GlobalArgs,
        #[command(flatten)]
        wait: WaitArgs,
    }

    #[test]
    fn test_container_exec_target() {
        let cli = TestCli::parse_from([
            "lanshim", "--container", "ollama", "--exec", "ollama", "list",
        ]);
        assert_eq!(
            cli.wait.target(&cli.global).unwrap(),
            ProbeTarget::ContainerExec {
                container: "ollama".into(),
                command: vec!["ollama".into(), "list".into()]
            }
        );
    }

    #[test]
    fn test_service_target_resolves_configured_address() {
        let dir = tempfile::tempdir().unwrap();
        let env = dir.path().join("shim.env");
        std::fs::write(
            &env,
            "SHIM_HOST_INTERFACE=eth0\nSHIM_SUBNET=192.168.1.0/24\n\
             SHIM_SERVICE_RANGE=192.168.1.240/29\nSHIM_SERVICE_OLLAMA_ADDR=192.168.1.241\n",
        )
        .unwrap();

        let cli = TestCli::parse_from([
            "lanshim",
            "--env-file",
            env.to_str().unwrap(),
            "--service",
            "ollama",
            "--port",
            "11434",
        ]);
        assert_eq!(
            cli.wait.target(&cli.global).unwrap(),
            ProbeTarget::Tcp("192.168.1.241:11434".parse().unwrap())
        );
    }

    #[test]
    fn test_target_is_required() {
        assert!(TestCli::try_parse_from(["lanshim", "--attempts", "3"]).is_err());
    }
}
