//! Centralized path configuration for lanshim.
//!
//! The CLI and the boot-time unit resolve the same defaults here, so a
//! manual run and a boot run agree on where the lock and snapshot live.

use std::path::PathBuf;

/// Get the runtime directory.
///
/// Resolution order:
/// 1. `LANSHIM_RUNTIME_DIR` environment variable
/// 2. `/run/lanshim`
pub fn runtime_dir() -> PathBuf {
    std::env::var_os("LANSHIM_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/run/lanshim"))
}

/// Get the configuration directory.
///
/// Resolution order:
/// 1. `LANSHIM_CONFIG_DIR` environment variable
/// 2. `/etc/lanshim`
pub fn config_dir() -> PathBuf {
    std::env::var_os("LANSHIM_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/lanshim"))
}

/// Get the provisioning lock path.
pub fn lock_path() -> PathBuf {
    runtime_dir().join("provision.lock")
}

/// Get the configuration snapshot the boot-time unit reads.
pub fn snapshot_path() -> PathBuf {
    config_dir().join("lanshim.env")
}

/// Directory systemd units are installed into.
pub const SYSTEMD_UNIT_DIR: &str = "/etc/systemd/system";

/// Get the unit directory.
pub fn unit_dir() -> PathBuf {
    std::env::var_os("LANSHIM_UNIT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(SYSTEMD_UNIT_DIR))
}
