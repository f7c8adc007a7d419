//! Persistence registrar.
//!
//! Registers a boot-time unit that re-runs the same idempotent provisioning
//! the installer ran, so the shim and its routes come back after a reboot.
//! The unit does not embed addresses: it re-invokes this tool against a
//! snapshot of the raw configuration, and the descriptor (host endpoint
//! included) is recomputed by the same validation on every run.

use crate::error::{Result, ShimError};
use crate::exec;
use crate::topology::TopologyDescriptor;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

/// Units the shim unit is ordered after.
pub const UNIT_AFTER: &[&str] = &["network-online.target", "docker.service"];

/// Durable description of the provisioning and teardown procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistentUnit {
    pub name: String,
    pub description: String,
    pub provision_command: Vec<String>,
    pub teardown_command: Vec<String>,
    pub enabled: bool,
    pub run_at_boot: bool,
    pub after: Vec<String>,
}

/// Build the unit for `descriptor`, invoking `executable` against `snapshot`.
pub fn build_unit(descriptor: &TopologyDescriptor, executable: &Path, snapshot: &Path) -> PersistentUnit {
    let command = |action: &str| {
        vec![
            executable.display().to_string(),
            action.to_string(),
            "--env-file".to_string(),
            snapshot.display().to_string(),
        ]
    };

    PersistentUnit {
        name: descriptor.unit_name().to_string(),
        description: format!(
            "lanshim host shim {} on {} for {}",
            descriptor.shim_name(),
            descriptor.host_interface(),
            descriptor.service_range()
        ),
        provision_command: command("apply"),
        teardown_command: command("remove"),
        enabled: true,
        run_at_boot: true,
        after: UNIT_AFTER.iter().map(|s| s.to_string()).collect(),
    }
}

/// Service supervisor collaborator.
///
/// Removal operations return `Ok(false)` when the unit was already absent.
#[async_trait::async_trait]
pub trait ServiceSupervisor: Send + Sync {
    /// Install (or overwrite) the unit definition.
    async fn install(&self, unit: &PersistentUnit) -> Result<()>;

    /// Enable the unit to run at boot.
    async fn enable(&self, unit: &PersistentUnit) -> Result<()>;

    /// Disable the unit.
    async fn disable(&self, name: &str) -> Result<bool>;

    /// Delete the unit definition.
    async fn remove(&self, name: &str) -> Result<bool>;

    /// Whether a unit definition with this name is installed.
    async fn is_installed(&self, name: &str) -> Result<bool>;
}

/// Shared handle to a service supervisor.
pub type SharedSupervisor = Arc<dyn ServiceSupervisor>;

/// Registers and unregisters the persistent unit.
#[derive(Clone)]
pub struct PersistenceRegistrar {
    supervisor: SharedSupervisor,
    snapshot: PathBuf,
}

impl PersistenceRegistrar {
    pub fn new(supervisor: SharedSupervisor, snapshot: impl Into<PathBuf>) -> Self {
        Self { supervisor, snapshot: snapshot.into() }
    }

    /// Path of the configuration snapshot the unit runs against.
    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot
    }

    /// Snapshot the configuration, install the unit and enable it.
    ///
    /// Runtime shim state is never touched here; a failure leaves whatever
    /// was provisioned in place and undoes only this call's own steps.
    #[instrument(skip_all, fields(unit = %descriptor.unit_name()))]
    pub async fn register_persistent_unit(
        &self,
        descriptor: &TopologyDescriptor,
        executable: &Path,
    ) -> Result<PersistentUnit> {
        self.write_snapshot(descriptor).await?;

        let unit = build_unit(descriptor, executable, &self.snapshot);

        if let Err(e) = self.supervisor.install(&unit).await {
            if let Err(cleanup) = self.supervisor.remove(&unit.name).await {
                warn!("Failed to remove unit {} after install failure: {}", unit.name, cleanup);
            }
            self.discard_snapshot().await;
            return Err(e);
        }

        if let Err(e) = self.supervisor.enable(&unit).await {
            if let Err(cleanup) = self.supervisor.remove(&unit.name).await {
                warn!("Failed to remove unit {} after enable failure: {}", unit.name, cleanup);
            }
            self.discard_snapshot().await;
            return Err(e);
        }

        info!("Persistent unit {} registered", unit.name);
        Ok(unit)
    }

    /// Disable and delete the unit, then drop the snapshot.
    ///
    /// Every step treats an absent target as done. The shim and its routes
    /// stay as they are.
    #[instrument(skip(self))]
    pub async fn unregister_persistent_unit(&self, unit_name: &str) -> Result<()> {
        if !self.supervisor.disable(unit_name).await? {
            debug!("Unit {} was not enabled", unit_name);
        }
        if self.supervisor.remove(unit_name).await? {
            info!("Persistent unit {} removed", unit_name);
        } else {
            info!("Persistent unit {} already absent", unit_name);
        }

        match tokio::fs::remove_file(&self.snapshot).await {
            Ok(()) => debug!(path = %self.snapshot.display(), "Snapshot removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ShimError::Io { path: self.snapshot.clone(), source: e }),
        }
        Ok(())
    }

    /// Whether the unit is installed.
    pub async fn is_registered(&self, unit_name: &str) -> Result<bool> {
        self.supervisor.is_installed(unit_name).await
    }

    async fn write_snapshot(&self, descriptor: &TopologyDescriptor) -> Result<()> {
        let io_err = |path: &Path, source| ShimError::Io { path: path.to_path_buf(), source };

        if let Some(parent) = self.snapshot.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| io_err(parent, e))?;
        }

        let contents = format!(
            "# Written by lanshim; read by {} at boot.\n{}",
            descriptor.unit_name(),
            descriptor.to_raw().to_env_string()
        );
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&self.snapshot).await.map_err(|e| io_err(&self.snapshot, e))?;

        // A snapshot left by an earlier run keeps its old mode on open.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| io_err(&self.snapshot, e))?;
        }

        file.write_all(contents.as_bytes()).await.map_err(|e| io_err(&self.snapshot, e))?;
        file.flush().await.map_err(|e| io_err(&self.snapshot, e))?;

        debug!(path = %self.snapshot.display(), "Configuration snapshot written");
        Ok(())
    }

    async fn discard_snapshot(&self) {
        if let Err(e) = tokio::fs::remove_file(&self.snapshot).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove snapshot {}: {}", self.snapshot.display(), e);
            }
        }
    }
}

/// Quote a word for a systemd `Exec*=` line.
///
/// `%` specifiers expand anywhere on the line. `$` variables expand only in
/// arguments, never in the executable path.
fn quote_exec_arg(arg: &str, is_argument: bool) -> String {
    let mut escaped = arg.replace('%', "%%");
    if is_argument {
        escaped = escaped.replace('$', "$$");
    }
    if !escaped.is_empty()
        && !escaped.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\' || c == '\'')
    {
        return escaped;
    }
    let escaped = escaped.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

fn exec_line(command: &[String]) -> String {
    command
        .iter()
        .enumerate()
        .map(|(i, word)| quote_exec_arg(word, i > 0))
        .collect::<Vec<_>>()
        .join(" ")
}

/// systemd-backed service supervisor.
#[derive(Debug, Clone)]
pub struct SystemdSupervisor {
    unit_dir: PathBuf,
    systemctl: String,
}

impl SystemdSupervisor {
    pub fn new(unit_dir: impl Into<PathBuf>) -> Self {
        Self { unit_dir: unit_dir.into(), systemctl: "systemctl".to_string() }
    }

    /// Use a specific `systemctl` binary.
    pub fn with_systemctl(mut self, systemctl: impl Into<String>) -> Self {
        self.systemctl = systemctl.into();
        self
    }

    /// Path of a unit file.
    pub fn unit_path(&self, name: &str) -> PathBuf {
        self.unit_dir.join(name)
    }

    /// Render the unit file.
    pub fn render(unit: &PersistentUnit) -> String {
        let mut out = String::new();
        out.push_str("[Unit]\n");
        out.push_str(&format!("Description={}\n", unit.description));
        if !unit.after.is_empty() {
            out.push_str(&format!("After={}\n", unit.after.join(" ")));
        }
        out.push_str("Wants=network-online.target\n");
        out.push_str("\n[Service]\n");
        out.push_str("Type=oneshot\n");
        out.push_str("RemainAfterExit=yes\n");
        out.push_str(&format!("ExecStart={}\n", exec_line(&unit.provision_command)));
        out.push_str(&format!("ExecStop={}\n", exec_line(&unit.teardown_command)));
        if unit.run_at_boot {
            out.push_str("\n[Install]\n");
            out.push_str("WantedBy=multi-user.target\n");
        }
        out
    }

    async fn systemctl(&self, unit: &str, args: &[&str]) -> Result<()> {
        exec::run(&self.systemctl, args).await.map(drop).map_err(|e| {
            if e.is_permission_denied() {
                ShimError::Permission { operation: format!("manage unit {}", unit) }
            } else {
                ShimError::Registration { unit: unit.to_string(), reason: e.to_string() }
            }
        })
    }

    fn io_error(&self, unit: &str, path: &Path, e: std::io::Error) -> ShimError {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ShimError::Permission { operation: format!("write {}", path.display()) }
        } else {
            ShimError::Registration {
                unit: unit.to_string(),
                reason: format!("{}: {}", path.display(), e),
            }
        }
    }
}

#[async_trait::async_trait]
impl ServiceSupervisor for SystemdSupervisor {
    #[instrument(skip_all, fields(unit = %unit.name))]
    async fn install(&self, unit: &PersistentUnit) -> Result<()> {
        tokio::fs::create_dir_all(&self.unit_dir)
            .await
            .map_err(|e| self.io_error(&unit.name, &self.unit_dir, e))?;

        let path = self.unit_path(&unit.name);
        tokio::fs::write(&path, Self::render(unit))
            .await
            .map_err(|e| self.io_error(&unit.name, &path, e))?;
        info!(path = %path.display(), "Unit file written");

        if let Err(e) = self.systemctl(&unit.name, &["daemon-reload"]).await {
            if let Err(cleanup) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), "Failed to remove unit file: {}", cleanup);
            }
            return Err(e);
        }
        Ok(())
    }

    #[instrument(skip_all, fields(unit = %unit.name))]
    async fn enable(&self, unit: &PersistentUnit) -> Result<()> {
        self.systemctl(&unit.name, &["enable", &unit.name]).await
    }

    #[instrument(skip(self))]
    async fn disable(&self, name: &str) -> Result<bool> {
        if !self.is_installed(name).await? {
            return Ok(false);
        }
        match exec::run(&self.systemctl, ["disable", name]).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) if e.is_permission_denied() => {
                Err(ShimError::Permission { operation: format!("disable unit {}", name) })
            }
            Err(e) => Err(ShimError::Registration { unit: name.to_string(), reason: e.to_string() }),
        }
    }

    #[instrument(skip(self))]
    async fn remove(&self, name: &str) -> Result<bool> {
        let path = self.unit_path(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(self.io_error(name, &path, e)),
        }
        self.systemctl(name, &["daemon-reload"]).await?;
        Ok(true)
    }

    async fn is_installed(&self, name: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.unit_path(name)).await.unwrap_or(false))
    }
}
