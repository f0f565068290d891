use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

pub mod bus;
pub mod waiter;

/// Port every backend keeps open for the remote bootstrapper.
pub const ADMIN_PORT: u16 = 22;
/// Host port the workload's container ports are published on.
pub const WORKLOAD_HOST_PORT: u16 = 80;

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Aws,
    Azure,
    Gcp,
    Hetzner,
    /// In-memory backend used for local runs and tests.
    Mock,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Aws => "aws",
            ProviderKind::Azure => "azure",
            ProviderKind::Gcp => "gcp",
            ProviderKind::Hetzner => "hetzner",
            ProviderKind::Mock => "mock",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aws" => Ok(ProviderKind::Aws),
            "azure" => Ok(ProviderKind::Azure),
            "gcp" => Ok(ProviderKind::Gcp),
            "hetzner" => Ok(ProviderKind::Hetzner),
            "mock" => Ok(ProviderKind::Mock),
            other => Err(format!("unknown provider '{}'", other)),
        }
    }
}

/// Provider-independent lifecycle state of a compute resource.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NormalizedStatus {
    Pending,
    Running,
    Stopping,
    Stopped,
    Terminating,
    Terminated,
    Error,
    Unknown,
}

impl NormalizedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NormalizedStatus::Pending => "pending",
            NormalizedStatus::Running => "running",
            NormalizedStatus::Stopping => "stopping",
            NormalizedStatus::Stopped => "stopped",
            NormalizedStatus::Terminating => "terminating",
            NormalizedStatus::Terminated => "terminated",
            NormalizedStatus::Error => "error",
            NormalizedStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for NormalizedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backend's native-status vocabulary. Lookups are case-insensitive.
pub type StatusTable = &'static [(&'static str, NormalizedStatus)];

/// Map a native status through `table`. Anything unmapped is `Unknown`.
pub fn normalize_status(table: StatusTable, native: &str) -> NormalizedStatus {
    let native = native.trim();
    table
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(native))
        .map(|(_, status)| *status)
        .unwrap_or(NormalizedStatus::Unknown)
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceAction {
    Start,
    Stop,
    Terminate,
}

impl InstanceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceAction::Start => "start",
            InstanceAction::Stop => "stop",
            InstanceAction::Terminate => "terminate",
        }
    }
}

impl fmt::Display for InstanceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(InstanceAction::Start),
            "stop" => Ok(InstanceAction::Stop),
            "terminate" => Ok(InstanceAction::Terminate),
            other => Err(format!("unknown instance action '{}'", other)),
        }
    }
}

/// States of one orchestration run, in the order they are reached.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningState {
    Requested,
    Created,
    NetworkAssigned,
    Reachable,
    RuntimeBootstrapped,
    PortsOpened,
    ContainerLaunched,
    Verified,
    Failed,
}

impl ProvisioningState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisioningState::Requested => "requested",
            ProvisioningState::Created => "created",
            ProvisioningState::NetworkAssigned => "network_assigned",
            ProvisioningState::Reachable => "reachable",
            ProvisioningState::RuntimeBootstrapped => "runtime_bootstrapped",
            ProvisioningState::PortsOpened => "ports_opened",
            ProvisioningState::ContainerLaunched => "container_launched",
            ProvisioningState::Verified => "verified",
            ProvisioningState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProvisioningState::Verified | ProvisioningState::Failed)
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a provisioning run ended in `Failed`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InvalidSpec,
    QuotaExceeded,
    ProviderUnavailable,
    NetworkTimeout,
    UnreachableTimeout,
    AuthenticationFailed,
    ImageUnavailable,
    LaunchFailed,
    Cancelled,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::InvalidSpec => "invalid_spec",
            FailureReason::QuotaExceeded => "quota_exceeded",
            FailureReason::ProviderUnavailable => "provider_unavailable",
            FailureReason::NetworkTimeout => "network_timeout",
            FailureReason::UnreachableTimeout => "unreachable_timeout",
            FailureReason::AuthenticationFailed => "authentication_failed",
            FailureReason::ImageUnavailable => "image_unavailable",
            FailureReason::LaunchFailed => "launch_failed",
            FailureReason::Cancelled => "cancelled",
        }
    }

    /// Whether re-issuing the same request can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureReason::NetworkTimeout | FailureReason::UnreachableTimeout
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Port set ---

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid port {0}: ports must be in 1..=65535")]
pub struct InvalidPort(pub u32);

/// Ordered set of distinct TCP ports (1..=65535).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u32>", into = "Vec<u16>")]
pub struct PortSet(BTreeSet<u16>);

impl PortSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ports<I>(ports: I) -> Result<Self, InvalidPort>
    where
        I: IntoIterator<Item = u32>,
    {
        let mut set = BTreeSet::new();
        for port in ports {
            if port == 0 || port > u16::MAX as u32 {
                return Err(InvalidPort(port));
            }
            set.insert(port as u16);
        }
        Ok(Self(set))
    }

    pub fn insert(&mut self, port: u16) -> Result<bool, InvalidPort> {
        if port == 0 {
            return Err(InvalidPort(0));
        }
        Ok(self.0.insert(port))
    }

    pub fn contains(&self, port: u16) -> bool {
        self.0.contains(&port)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.iter().copied()
    }

    pub fn union(&self, other: &PortSet) -> PortSet {
        PortSet(self.0.union(&other.0).copied().collect())
    }

    /// Ports in `self` that are not in `other`.
    pub fn difference(&self, other: &PortSet) -> PortSet {
        PortSet(self.0.difference(&other.0).copied().collect())
    }

    /// This set plus the administrative port.
    pub fn with_admin(&self) -> PortSet {
        let mut out = self.clone();
        out.0.insert(ADMIN_PORT);
        out
    }

    /// This set plus the administrative and workload host ports.
    pub fn with_required(&self) -> PortSet {
        let mut out = self.with_admin();
        out.0.insert(WORKLOAD_HOST_PORT);
        out
    }

    pub fn to_vec(&self) -> Vec<u16> {
        self.0.iter().copied().collect()
    }
}

impl TryFrom<Vec<u32>> for PortSet {
    type Error = InvalidPort;

    fn try_from(ports: Vec<u32>) -> Result<Self, Self::Error> {
        PortSet::from_ports(ports)
    }
}

impl From<PortSet> for Vec<u16> {
    fn from(set: PortSet) -> Self {
        set.to_vec()
    }
}

impl FromIterator<u16> for PortSet {
    fn from_iter<T: IntoIterator<Item = u16>>(iter: T) -> Self {
        PortSet(iter.into_iter().filter(|p| *p != 0).collect())
    }
}

impl fmt::Display for PortSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "[{}]", joined)
    }
}

// --- Entities ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ComputeResource {
    pub id: String,
    pub name: String,
    pub provider: ProviderKind,
    pub status: NormalizedStatus,
    pub machine_class: String,
    /// Provider creation timestamp; the observation time when the provider omits it.
    pub created_at: DateTime<Utc>,
    pub private_address: Option<String>,
    pub public_address: Option<String>,
    pub zone: Option<String>,
}

impl ComputeResource {
    /// Public address when assigned, private otherwise.
    pub fn reachable_address(&self) -> Option<&str> {
        self.public_ip().or_else(|| self.private_ip())
    }

    pub fn public_ip(&self) -> Option<&str> {
        usable_address(&self.public_address)
    }

    pub fn private_ip(&self) -> Option<&str> {
        usable_address(&self.private_address)
    }
}

fn usable_address(addr: &Option<String>) -> Option<&str> {
    addr.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Everything a backend needs to find an instance (and what it created
/// alongside it) again. Reconstructible from a `ComputeResource`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProviderHandle {
    pub provider: ProviderKind,
    pub instance_id: String,
    pub instance_name: String,
    pub zone: Option<String>,
}

impl ProviderHandle {
    pub fn from_resource(resource: &ComputeResource) -> Self {
        Self {
            provider: resource.provider,
            instance_id: resource.id.clone(),
            instance_name: resource.name.clone(),
            zone: resource.zone.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BootstrapCommandResult {
    /// Typed step label, e.g. `install_runtime`.
    pub step: String,
    /// Redacted rendering of what was executed.
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub succeeded: bool,
}

impl BootstrapCommandResult {
    pub fn new(
        step: impl Into<String>,
        command: impl Into<String>,
        stdout: String,
        stderr: String,
        exit_code: Option<i32>,
    ) -> Self {
        let succeeded = stderr.trim().is_empty() && exit_code.map_or(true, |c| c == 0);
        Self {
            step: step.into(),
            command: command.into(),
            stdout,
            stderr,
            exit_code,
            succeeded,
        }
    }
}

/// Inbound request, as supplied by the request-parsing layer.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub provider: ProviderKind,
    pub machine_class: String,
    #[serde(default)]
    pub base_image: Option<String>,
    pub container_image: String,
    #[serde(default)]
    pub ssh_credential_ref: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProvisioningResult {
    pub resource: ComputeResource,
    pub handle: ProviderHandle,
    pub ports: PortSet,
    pub container_name: String,
    pub verified: bool,
    /// Per-command outcome of the runtime bootstrap and launch.
    pub bootstrap: Vec<BootstrapCommandResult>,
}
