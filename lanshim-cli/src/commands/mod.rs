//! CLI command implementations

pub mod provision;
pub mod status;
pub mod wait;

pub use wait::WaitArgs;

use anyhow::Result;
use clap::{ArgAction, Args};
use lanshim_core::error::exit_code;
use lanshim_core::network::{create_host_network, require_net_admin};
use lanshim_core::{
    load_and_validate, paths, PersistenceRegistrar, ProvisionGuard, RawConfig, SharedHostNetwork,
    ShimError, ShimLifecycle, SystemdSupervisor, TopologyDescriptor,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Flags shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Env file with SHIM_* settings (process environment overrides it)
    #[arg(long, global = true, env = "LANSHIM_ENV_FILE")]
    pub env_file: Option<PathBuf>,

    /// Provisioning lock file
    #[arg(long, global = true, env = "LANSHIM_LOCK_FILE")]
    pub lock_file: Option<PathBuf>,

    /// Seconds to wait for a concurrent run to release the lock
    #[arg(long, global = true, default_value_t = 30)]
    pub lock_wait_secs: u64,

    /// Directory the boot-time unit is installed into
    #[arg(long, global = true)]
    pub unit_dir: Option<PathBuf>,

    /// Configuration snapshot the boot-time unit reads
    #[arg(long, global = true)]
    pub snapshot: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

impl GlobalArgs {
    pub fn lock_path(&self) -> PathBuf {
        self.lock_file.clone().unwrap_or_else(paths::lock_path)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.snapshot.clone().unwrap_or_else(paths::snapshot_path)
    }

    pub fn unit_dir(&self) -> PathBuf {
        self.unit_dir.clone().unwrap_or_else(paths::unit_dir)
    }

    /// Env file first, process environment on top.
    pub fn raw_config(&self) -> Result<RawConfig> {
        let file = match &self.env_file {
            Some(path) => RawConfig::from_env_file(path)?,
            None => RawConfig::new(),
        };
        Ok(file.merge(RawConfig::from_process_env()))
    }
}

/// Everything a provisioning command needs.
pub struct Context {
    pub net: SharedHostNetwork,
    pub descriptor: TopologyDescriptor,
    pub lifecycle: ShimLifecycle,
}

impl Context {
    /// Load and validate the configuration against the host.
    pub async fn load(global: &GlobalArgs) -> Result<Self> {
        let net = create_host_network()?;
        let raw = global.raw_config()?;
        let descriptor = load_and_validate(&raw, net.as_ref()).await?;

        let supervisor = Arc::new(SystemdSupervisor::new(global.unit_dir()));
        let registrar = PersistenceRegistrar::new(supervisor, global.snapshot_path());
        let lifecycle = ShimLifecycle::new(net.clone(), registrar);

        Ok(Self { net, descriptor, lifecycle })
    }

    /// Check privilege, then take the provisioning lock.
    pub async fn lock(&self, global: &GlobalArgs, operation: &str) -> Result<ProvisionGuard> {
        require_net_admin(self.net.as_ref(), operation)?;
        let guard =
            ProvisionGuard::acquire(&global.lock_path(), Duration::from_secs(global.lock_wait_secs))
                .await?;
        Ok(guard)
    }
}

/// Exit code for an error that reached `main`.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ShimError>())
        .map(ShimError::exit_code)
        .unwrap_or(exit_code::PROVISION)
}
