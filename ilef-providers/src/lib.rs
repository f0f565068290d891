use async_trait::async_trait;
use ilef_common::{
    normalize_status, ComputeResource, FailureReason, InstanceAction, NormalizedStatus, PortSet,
    ProviderHandle, ProviderKind, StatusTable,
};

mod http;
pub mod sigv4;

pub mod aws;
pub mod azure;
pub mod gcp;
pub mod hetzner;

#[cfg(feature = "mock")]
pub mod mock;

/// Typed failure of a provider API call.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("invalid spec: {0}")]
    InvalidSpec(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("{provider} API error: status={status} body={body}")]
    Api {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl ProviderError {
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            ProviderError::InvalidSpec(_) => FailureReason::InvalidSpec,
            ProviderError::QuotaExceeded(_) => FailureReason::QuotaExceeded,
            ProviderError::AuthenticationFailed(_) => FailureReason::AuthenticationFailed,
            ProviderError::NotFound(_)
            | ProviderError::Unavailable(_)
            | ProviderError::Api { .. }
            | ProviderError::Transport(_) => FailureReason::ProviderUnavailable,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

/// How the administrative user will be allowed in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdminAccess {
    /// Key pair already registered with the provider (AWS, Hetzner).
    pub key_name: Option<String>,
    /// OpenSSH public key material (Azure, GCP, or imported on demand).
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub name: String,
    pub machine_class: String,
    /// Provider image reference; the backend default when `None`.
    pub base_image: Option<String>,
    pub admin: AdminAccess,
}

impl InstanceSpec {
    pub(crate) fn validate(&self) -> Result<(), ProviderError> {
        if self.name.trim().is_empty() {
            return Err(ProviderError::InvalidSpec("instance name is empty".into()));
        }
        if self.machine_class.trim().is_empty() {
            return Err(ProviderError::InvalidSpec("machine class is empty".into()));
        }
        Ok(())
    }
}

/// Uniform capability set over one infrastructure vendor.
///
/// Mutating calls return once the provider has acknowledged the request.
/// Waiting for the result to materialise is left to the caller.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// OS user the image's SSH key is installed for.
    fn admin_username(&self) -> &str;

    fn status_table(&self) -> StatusTable;

    /// Address SSH and the workload are reached on. Ingress is opened on
    /// the public interface, so a private address alone is not enough.
    fn ssh_address<'a>(&self, resource: &'a ComputeResource) -> Option<&'a str> {
        resource.public_ip()
    }

    fn normalize_status(&self, native: &str) -> NormalizedStatus {
        normalize_status(self.status_table(), native)
    }

    async fn create_instance(
        &self,
        spec: &InstanceSpec,
    ) -> Result<(ComputeResource, ProviderHandle), ProviderError>;

    /// Re-read live status and addresses. Never waits.
    async fn get_instance(&self, handle: &ProviderHandle) -> Result<ComputeResource, ProviderError>;

    async fn list_instances(&self) -> Result<Vec<ComputeResource>, ProviderError>;

    /// `terminate` also releases every network artifact the backend created
    /// for the instance.
    async fn manage_instance_action(
        &self,
        handle: &ProviderHandle,
        action: InstanceAction,
    ) -> Result<(), ProviderError>;

    /// Allow inbound TCP on `ports` plus the administrative port.
    /// Idempotent: rules already present are left alone.
    async fn open_ingress(&self, handle: &ProviderHandle, ports: &PortSet) -> Result<(), ProviderError>;
}
