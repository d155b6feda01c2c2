//! Resource manager types and error definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Character joining a namespace and a resource name into a single key.
///
/// Neither part of a key may contain it.
pub const KEY_SEPARATOR: char = '.';

/// Result type for resource manager operations
pub type ResourceResult<T> = std::result::Result<T, ResourceError>;

/// Resource manager errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// A namespace or resource name contains the key separator
    #[error("Invalid name '{0}': names must not contain '.'")]
    InvalidName(String),

    /// The namespace was never registered (or was unregistered)
    #[error("Unknown namespace: {0}")]
    UnknownNamespace(String),

    /// The namespace factory disavows the resource
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Namespace registered twice without `force`
    #[error("Namespace already registered: {0}")]
    AlreadyRegistered(String),

    /// Timeout value is not a usable number of seconds
    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),

    /// Waiting for a grant exceeded the timeout
    #[error("Timed out after {timeout:?} waiting for resource '{resource}'")]
    TimedOut { resource: String, timeout: Duration },

    /// Grant or cancel called on a request that already reached a final state
    #[error("Request {request} was already processed ({state})")]
    AlreadyProcessed { request: Uuid, state: RequestState },

    /// The factory could not create or switch an instance for the request
    #[error("Could not create resource '{resource}': {reason}")]
    CreationFailed { resource: String, reason: String },

    /// Legacy release on a resource nobody holds
    #[error("Resource is not locked: {0}")]
    NotLocked(String),

    /// An owner asked for a resource it already holds
    #[error("Resource '{0}' is already owned")]
    AlreadyOwned(String),
}

impl ResourceError {
    /// Get error code for this resource error
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidName(_) => "E300",
            Self::UnknownNamespace(_) => "E301",
            Self::NotFound(_) => "E302",
            Self::AlreadyRegistered(_) => "E303",
            Self::InvalidTimeout(_) => "E304",
            Self::TimedOut { .. } => "E305",
            Self::AlreadyProcessed { .. } => "E306",
            Self::CreationFailed { .. } => "E307",
            Self::NotLocked(_) => "E308",
            Self::AlreadyOwned(_) => "E309",
        }
    }
}

/// Lock mode requested for a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Reader access, compatible with other shared holders
    Shared,
    /// Writer access, compatible with nothing
    Exclusive,
}

impl LockMode {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Exclusive => "exclusive",
        }
    }

    /// Whether a holder in this mode can coexist with one in `other`
    pub fn is_compatible_with(&self, other: LockMode) -> bool {
        matches!((self, other), (Self::Shared, Self::Shared))
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for LockMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shared" => Ok(Self::Shared),
            "exclusive" => Ok(Self::Exclusive),
            other => Err(format!("unknown lock mode '{}'", other)),
        }
    }
}

/// Externally visible state of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Nobody holds the resource
    Free,
    /// One or more shared holders
    Shared,
    /// A single exclusive holder
    Locked,
}

impl From<Option<LockMode>> for ResourceStatus {
    fn from(mode: Option<LockMode>) -> Self {
        match mode {
            None => Self::Free,
            Some(LockMode::Shared) => Self::Shared,
            Some(LockMode::Exclusive) => Self::Locked,
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Shared => write!(f, "shared"),
            Self::Locked => write!(f, "locked"),
        }
    }
}

/// Lifecycle state of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Queued, waiting for admission
    Pending,
    /// Holds the lock
    Granted,
    /// Will never be granted
    Canceled,
}

impl RequestState {
    /// Granted and canceled are final
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Granted => write!(f, "granted"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

/// Identity of a lockable entity: `(namespace, name)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    namespace: String,
    name: String,
}

impl ResourceKey {
    /// Build a key, rejecting parts that contain the separator
    pub fn new(namespace: &str, name: &str) -> ResourceResult<Self> {
        validate_name(namespace)?;
        validate_name(name)?;
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    /// Parse a joined `namespace.name` key
    pub fn parse(joined: &str) -> ResourceResult<Self> {
        match joined.split_once(KEY_SEPARATOR) {
            Some((namespace, name)) => Self::new(namespace, name),
            None => Err(ResourceError::InvalidName(joined.to_string())),
        }
    }

    /// Namespace part
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Resource name part
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.namespace, KEY_SEPARATOR, self.name)
    }
}

/// Reject names that would make a joined key ambiguous
pub fn validate_name(name: &str) -> ResourceResult<()> {
    if name.contains(KEY_SEPARATOR) {
        return Err(ResourceError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Convert a number of seconds into a timeout
pub fn timeout_from_secs(secs: f64) -> ResourceResult<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|_| ResourceError::InvalidTimeout(secs.to_string()))
}

/// Parse a textual timeout given in seconds (e.g. `"1.5"`)
pub fn parse_timeout(value: &str) -> ResourceResult<Duration> {
    let secs: f64 = value
        .trim()
        .parse()
        .map_err(|_| ResourceError::InvalidTimeout(value.to_string()))?;
    timeout_from_secs(secs)
}

/// Snapshot of a single request, as reported by [`ResourceInfo`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestInfo {
    /// Request ID
    pub id: Uuid,
    /// Requested mode
    pub mode: LockMode,
    /// Current state
    pub state: RequestState,
    /// When the request was registered
    pub created_at: DateTime<Utc>,
}

/// Snapshot of a resource's lock entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceInfo {
    /// Joined resource key
    pub key: String,
    /// Current status
    pub status: ResourceStatus,
    /// Mode the live instance was created or switched for
    pub instance_mode: Option<LockMode>,
    /// Current holders, in grant order
    pub grantees: Vec<RequestInfo>,
    /// Waiting requests, in arrival order
    pub queued: Vec<RequestInfo>,
}

/// Configuration for the resource manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Timeout applied by `acquire_resource` when the caller passes none.
    /// `None` waits forever.
    pub default_timeout_secs: Option<f64>,

    /// Emit a warning when a handle is released by being dropped
    pub log_auto_release: bool,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: None,
            log_auto_release: true,
        }
    }
}

impl ResourceConfig {
    /// Set the default acquisition timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_secs = Some(timeout.as_secs_f64());
        self
    }

    /// Enable or disable auto-release warnings
    pub fn with_auto_release_logging(mut self, enabled: bool) -> Self {
        self.log_auto_release = enabled;
        self
    }

    /// Resolved default timeout
    pub fn default_timeout(&self) -> ResourceResult<Option<Duration>> {
        self.default_timeout_secs.map(timeout_from_secs).transpose()
    }

    /// Validate configuration
    pub fn validate(&self) -> ResourceResult<()> {
        self.default_timeout().map(|_| ())
    }
}
