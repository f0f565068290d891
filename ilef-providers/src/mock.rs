//! In-memory backend for local runs and orchestrator tests.
//!
//! Instances get an address after a configurable number of `get_instance`
//! polls, and every call is counted so tests can assert what was (not) done.

use async_trait::async_trait;
use chrono::Utc;
use ilef_common::{
    ComputeResource, InstanceAction, NormalizedStatus, PortSet, ProviderHandle, ProviderKind,
    StatusTable,
};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::{CloudProvider, InstanceSpec, ProviderError};

pub const STATUS_TABLE: StatusTable = &[
    ("pending", NormalizedStatus::Pending),
    ("running", NormalizedStatus::Running),
    ("stopping", NormalizedStatus::Stopping),
    ("stopped", NormalizedStatus::Stopped),
    ("terminating", NormalizedStatus::Terminating),
    ("terminated", NormalizedStatus::Terminated),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    QuotaExceeded,
    InvalidSpec,
    Unavailable,
    AuthenticationFailed,
}

impl MockFailure {
    fn to_error(self, what: &str) -> ProviderError {
        match self {
            MockFailure::QuotaExceeded => ProviderError::QuotaExceeded(format!("mock quota reached ({})", what)),
            MockFailure::InvalidSpec => ProviderError::InvalidSpec(format!("mock rejected {}", what)),
            MockFailure::Unavailable => ProviderError::Unavailable(format!("mock down ({})", what)),
            MockFailure::AuthenticationFailed => {
                ProviderError::AuthenticationFailed(format!("mock credentials refused ({})", what))
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockCalls {
    pub create: u32,
    pub get: u32,
    pub list: u32,
    pub actions: u32,
    pub open_ingress: u32,
    /// `open_ingress` calls that actually changed the rule set.
    pub ingress_writes: u32,
}

struct MockInstance {
    resource: ComputeResource,
    polls_until_address: u32,
    polls_until_public: u32,
    ingress: PortSet,
}

#[derive(Default)]
struct MockState {
    instances: BTreeMap<String, MockInstance>,
    calls: MockCalls,
    next_id: u64,
}

pub struct MockProvider {
    state: Mutex<MockState>,
    address_after_polls: Option<u32>,
    public_delay: u32,
    public_address: String,
    private_address: String,
    create_failure: Option<MockFailure>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            address_after_polls: Some(1),
            public_delay: 0,
            public_address: "203.0.113.10".to_string(),
            private_address: "10.0.0.10".to_string(),
            create_failure: None,
        }
    }

    /// Addresses appear on the `n`-th `get_instance` call (0: already at create).
    pub fn with_address_after_polls(mut self, n: u32) -> Self {
        self.address_after_polls = Some(n);
        self
    }

    /// The public address shows up `n` polls after the private one,
    /// like EC2 right after RunInstances.
    pub fn with_public_address_delay(mut self, n: u32) -> Self {
        self.public_delay = n;
        self
    }

    pub fn without_addresses(mut self) -> Self {
        self.address_after_polls = None;
        self
    }

    pub fn with_public_address(mut self, ip: &str) -> Self {
        self.public_address = ip.to_string();
        self
    }

    pub fn failing_create(mut self, failure: MockFailure) -> Self {
        self.create_failure = Some(failure);
        self
    }

    pub fn calls(&self) -> MockCalls {
        self.lock().calls.clone()
    }

    /// Current ingress rules of an instance.
    pub fn ingress(&self, instance_id: &str) -> Option<PortSet> {
        self.lock().instances.get(instance_id).map(|i| i.ingress.clone())
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn assign_private(&self, resource: &mut ComputeResource) {
        resource.private_address = Some(self.private_address.clone());
        resource.status = NormalizedStatus::Running;
    }

    fn assign_public(&self, resource: &mut ComputeResource) {
        resource.public_address = Some(self.public_address.clone());
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Mock
    }

    fn admin_username(&self) -> &str {
        "ubuntu"
    }

    fn status_table(&self) -> StatusTable {
        STATUS_TABLE
    }

    async fn create_instance(
        &self,
        spec: &InstanceSpec,
    ) -> Result<(ComputeResource, ProviderHandle), ProviderError> {
        let mut state = self.lock();
        state.calls.create += 1;
        if let Some(failure) = self.create_failure {
            return Err(failure.to_error(&spec.name));
        }
        spec.validate()?;

        state.next_id += 1;
        let mut resource = ComputeResource {
            id: format!("mock-{}", state.next_id),
            name: spec.name.clone(),
            provider: ProviderKind::Mock,
            status: self.normalize_status("pending"),
            machine_class: spec.machine_class.clone(),
            created_at: Utc::now(),
            private_address: None,
            public_address: None,
            zone: Some("mock-zone-1".to_string()),
        };
        let (polls_until_address, polls_until_public) = match self.address_after_polls {
            Some(n) => (n, n.saturating_add(self.public_delay)),
            None => (u32::MAX, u32::MAX),
        };
        if polls_until_address == 0 {
            self.assign_private(&mut resource);
        }
        if polls_until_public == 0 {
            self.assign_public(&mut resource);
        }
        tracing::info!("🧪 [Mock] created {} ({})", resource.id, resource.name);

        state.instances.insert(
            resource.id.clone(),
            MockInstance {
                resource: resource.clone(),
                polls_until_address,
                polls_until_public,
                ingress: PortSet::new(),
            },
        );
        let handle = ProviderHandle::from_resource(&resource);
        Ok((resource, handle))
    }

    async fn get_instance(&self, handle: &ProviderHandle) -> Result<ComputeResource, ProviderError> {
        let mut state = self.lock();
        state.calls.get += 1;
        let never = self.address_after_polls.is_none();
        let inst = state
            .instances
            .get_mut(&handle.instance_id)
            .ok_or_else(|| ProviderError::NotFound(format!("mock instance {}", handle.instance_id)))?;
        if !never && inst.resource.status != NormalizedStatus::Terminated {
            if inst.polls_until_address > 0 {
                inst.polls_until_address -= 1;
                if inst.polls_until_address == 0 {
                    self.assign_private(&mut inst.resource);
                }
            }
            if inst.polls_until_public > 0 {
                inst.polls_until_public -= 1;
                if inst.polls_until_public == 0 {
                    self.assign_public(&mut inst.resource);
                }
            }
        }
        Ok(inst.resource.clone())
    }

    async fn list_instances(&self) -> Result<Vec<ComputeResource>, ProviderError> {
        let mut state = self.lock();
        state.calls.list += 1;
        Ok(state.instances.values().map(|i| i.resource.clone()).collect())
    }

    async fn manage_instance_action(
        &self,
        handle: &ProviderHandle,
        action: InstanceAction,
    ) -> Result<(), ProviderError> {
        let mut state = self.lock();
        state.calls.actions += 1;
        let inst = state
            .instances
            .get_mut(&handle.instance_id)
            .ok_or_else(|| ProviderError::NotFound(format!("mock instance {}", handle.instance_id)))?;
        inst.resource.status = match action {
            InstanceAction::Start => NormalizedStatus::Running,
            InstanceAction::Stop => NormalizedStatus::Stopped,
            InstanceAction::Terminate => {
                inst.ingress = PortSet::new();
                inst.resource.public_address = None;
                NormalizedStatus::Terminated
            }
        };
        tracing::info!("🧪 [Mock] {} {}", action, handle.instance_id);
        Ok(())
    }

    async fn open_ingress(&self, handle: &ProviderHandle, ports: &PortSet) -> Result<(), ProviderError> {
        let mut state = self.lock();
        state.calls.open_ingress += 1;
        let inst = state
            .instances
            .get_mut(&handle.instance_id)
            .ok_or_else(|| ProviderError::NotFound(format!("mock instance {}", handle.instance_id)))?;
        let wanted = ports.with_admin();
        let missing = wanted.difference(&inst.ingress);
        if missing.is_empty() {
            return Ok(());
        }
        inst.ingress = inst.ingress.union(&missing);
        state.calls.ingress_writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AdminAccess;

    fn spec() -> InstanceSpec {
        InstanceSpec {
            name: "app-1-0-abcd-mock".into(),
            machine_class: "small".into(),
            base_image: None,
            admin: AdminAccess::default(),
        }
    }

    #[tokio::test]
    async fn address_appears_after_configured_polls() {
        let provider = MockProvider::new().with_address_after_polls(3);
        let (created, handle) = provider.create_instance(&spec()).await.unwrap();
        assert_eq!(created.status, NormalizedStatus::Pending);
        assert!(created.reachable_address().is_none());

        assert!(provider.get_instance(&handle).await.unwrap().reachable_address().is_none());
        assert!(provider.get_instance(&handle).await.unwrap().reachable_address().is_none());
        let third = provider.get_instance(&handle).await.unwrap();
        assert_eq!(third.reachable_address(), Some("203.0.113.10"));
        assert_eq!(third.status, NormalizedStatus::Running);
    }

    #[tokio::test]
    async fn public_address_can_lag_behind_private() {
        let provider = MockProvider::new().with_public_address_delay(2);
        let (_, handle) = provider.create_instance(&spec()).await.unwrap();

        let first = provider.get_instance(&handle).await.unwrap();
        assert_eq!(first.private_ip(), Some("10.0.0.10"));
        assert!(first.public_ip().is_none());
        assert!(provider.get_instance(&handle).await.unwrap().public_ip().is_none());
        let third = provider.get_instance(&handle).await.unwrap();
        assert_eq!(third.public_ip(), Some("203.0.113.10"));
        assert_eq!(provider.ssh_address(&third), Some("203.0.113.10"));
    }

    #[tokio::test]
    async fn open_ingress_is_idempotent() {
        let provider = MockProvider::new();
        let (_, handle) = provider.create_instance(&spec()).await.unwrap();
        let ports = PortSet::from_ports([8080, 80]).unwrap();

        provider.open_ingress(&handle, &ports).await.unwrap();
        provider.open_ingress(&handle, &ports).await.unwrap();

        assert_eq!(provider.ingress(&handle.instance_id).unwrap().to_vec(), vec![22, 80, 8080]);
        let calls = provider.calls();
        assert_eq!(calls.open_ingress, 2);
        assert_eq!(calls.ingress_writes, 1);
    }

    #[tokio::test]
    async fn injected_create_failure_is_typed() {
        let provider = MockProvider::new().failing_create(MockFailure::QuotaExceeded);
        let err = provider.create_instance(&spec()).await.unwrap_err();
        assert!(matches!(err, ProviderError::QuotaExceeded(_)));
        assert!(provider.list_instances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminate_releases_ingress() {
        let provider = MockProvider::new().with_address_after_polls(0);
        let (_, handle) = provider.create_instance(&spec()).await.unwrap();
        provider
            .open_ingress(&handle, &PortSet::from_ports([5000]).unwrap())
            .await
            .unwrap();
        provider
            .manage_instance_action(&handle, InstanceAction::Terminate)
            .await
            .unwrap();
        let after = provider.get_instance(&handle).await.unwrap();
        assert_eq!(after.status, NormalizedStatus::Terminated);
        assert!(provider.ingress(&handle.instance_id).unwrap().is_empty());
    }
}
