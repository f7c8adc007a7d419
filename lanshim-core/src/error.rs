//! Error types for lanshim.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for lanshim operations.
pub type Result<T> = std::result::Result<T, ShimError>;

/// Process exit codes for the command line tool.
pub mod exit_code {
    pub const SUCCESS: u8 = 0;
    pub const VALIDATION: u8 = 1;
    pub const PERMISSION: u8 = 2;
    pub const PROVISION: u8 = 3;
    pub const READINESS: u8 = 4;
}

/// Main error type for lanshim.
#[derive(Error, Debug)]
pub enum ShimError {
    // Configuration errors
    #[error("Invalid configuration for {field}: {reason}")]
    Validation { field: String, reason: String },

    // Privilege errors
    #[error("Insufficient privilege to {operation}; run as root")]
    Permission { operation: String },

    // Interface errors
    #[error("Shim provisioning failed at stage '{stage}': {cause}")]
    Provision {
        stage: ProvisionStage,
        #[source]
        cause: HostError,
    },

    #[error("Shim interface {name} still present after removing stale configuration")]
    StaleShim { name: String },

    // Route errors
    #[error(transparent)]
    Route(#[from] RouteError),

    // Persistence errors
    #[error("Failed to register persistent unit {unit}: {reason}")]
    Registration { unit: String, reason: String },

    // Locking errors
    #[error("Failed to acquire provisioning lock {path:?}: {reason}")]
    Lock { path: PathBuf, reason: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ShimError {
    /// Shorthand for a validation failure on `field`.
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation { field: field.into(), reason: reason.into() }
    }

    /// Exit code the command line tool reports for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Validation { .. } => exit_code::VALIDATION,
            Self::Permission { .. } => exit_code::PERMISSION,
            Self::Provision { .. }
            | Self::StaleShim { .. }
            | Self::Route(_)
            | Self::Registration { .. }
            | Self::Lock { .. }
            | Self::Io { .. } => exit_code::PROVISION,
        }
    }
}

/// Step of shim creation or removal that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStage {
    Inspect,
    RemoveStale,
    CreateLink,
    AssignAddress,
    LinkUp,
    Remove,
}

impl fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Inspect => "inspect",
            Self::RemoveStale => "remove-stale",
            Self::CreateLink => "create-link",
            Self::AssignAddress => "assign-address",
            Self::LinkUp => "link-up",
            Self::Remove => "remove",
        };
        f.write_str(s)
    }
}

/// Route table failures.
#[derive(Error, Debug)]
pub enum RouteError {
    #[error(
        "Route to {destination} already exists via {existing_dev}; refusing to override it \
         (remove it manually or change the service address)"
    )]
    Conflict { destination: Ipv4Addr, existing_dev: String },

    #[error("Shim interface {name} is not present; provision it before syncing routes")]
    ShimMissing { name: String },

    #[error("Failed to add route to {destination} via {dev}: {cause}")]
    Add {
        destination: Ipv4Addr,
        dev: String,
        #[source]
        cause: HostError,
    },

    #[error("Failed to query routes to {destination}: {cause}")]
    Query {
        destination: Ipv4Addr,
        #[source]
        cause: HostError,
    },

    #[error("Failed to remove route to {destination} via {dev}: {cause}")]
    Remove {
        destination: Ipv4Addr,
        dev: String,
        #[source]
        cause: HostError,
    },
}

/// Failure of a single host command or host query.
#[derive(Error, Debug)]
pub enum HostError {
    #[error("Failed to start [{command}]: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("[{command}] was denied: {stderr}")]
    PermissionDenied { command: String, stderr: String },

    #[error("[{command}] target not found: {stderr}")]
    NotFound { command: String, stderr: String },

    #[error("[{command}] failed with {status}: {stderr}")]
    Failed { command: String, status: String, stderr: String },

    #[error("Failed to parse output of [{command}]: {reason}")]
    Parse { command: String, reason: String },
}

impl HostError {
    /// Whether the host refused the operation for lack of privilege.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }

    /// Whether the target of the operation does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
