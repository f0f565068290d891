//! End-to-end provisioning run: create, wait for an address, wait for SSH,
//! bootstrap the runtime, open the image's ports, launch and verify.

use ilef_common::waiter::{wait_for, WaitError, WaitPolicy};
use ilef_common::{
    BootstrapCommandResult, ComputeResource, FailureReason, NormalizedStatus, ProviderHandle,
    ProviderKind, ProvisionRequest, ProvisioningResult, ProvisioningState,
};
use ilef_providers::{AdminAccess, CloudProvider, InstanceSpec, ProviderError};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bootstrap::{self, BootstrapStep, RemoteConnector, RuntimeRegistry, SshCredential};
use crate::image_inspector::ImageInspector;
use crate::state_machine::{RunTrail, TransitionRecord};

const MAX_NAME_LEN: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionPolicy {
    pub network_wait: WaitPolicy,
    pub reachability_wait: WaitPolicy,
}

impl Default for ProvisionPolicy {
    fn default() -> Self {
        Self {
            network_wait: WaitPolicy::attempts(10, Duration::from_secs(10)),
            reachability_wait: WaitPolicy::attempts(10, Duration::from_secs(10)),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("provisioning failed in {state}: {reason}: {detail}")]
pub struct ProvisionFailure {
    /// Last state reached before failing.
    pub state: ProvisioningState,
    pub reason: FailureReason,
    pub detail: String,
    /// Set once the instance exists; cleanup is left to the caller.
    pub resource: Option<ComputeResource>,
}

#[derive(Debug)]
pub struct ProvisionRun {
    pub run_id: Uuid,
    pub transitions: Vec<TransitionRecord>,
    pub outcome: Result<ProvisioningResult, ProvisionFailure>,
}

/// Per-request inputs that do not come from the request body itself.
pub struct RunAccess<'a> {
    pub admin: AdminAccess,
    pub credential: &'a SshCredential,
}

pub struct Orchestrator {
    connector: Arc<dyn RemoteConnector>,
    inspector: Arc<ImageInspector>,
    registry: Option<RuntimeRegistry>,
    policy: ProvisionPolicy,
}

impl Orchestrator {
    pub fn new(
        connector: Arc<dyn RemoteConnector>,
        inspector: Arc<ImageInspector>,
        registry: Option<RuntimeRegistry>,
        policy: ProvisionPolicy,
    ) -> Self {
        Self {
            connector,
            inspector,
            registry,
            policy,
        }
    }

    /// Run one request to `Verified` or `Failed`. Cancellation is honoured
    /// between transitions and during waits; nothing is rolled back.
    pub async fn provision(
        &self,
        provider: &dyn CloudProvider,
        request: &ProvisionRequest,
        access: RunAccess<'_>,
        cancel: &CancellationToken,
    ) -> ProvisionRun {
        let run_id = Uuid::new_v4();
        tracing::info!(
            "🚀 [Provision] run {} provider={} class={} image={}",
            run_id,
            provider.kind(),
            request.machine_class,
            request.container_image
        );
        let mut run = Run {
            trail: RunTrail::new(run_id),
            resource: None,
        };
        let outcome = self.drive(&mut run, provider, request, &access, cancel).await;
        match &outcome {
            Ok(result) => tracing::info!(
                "✅ [Provision] run {} verified: {} ({}) container={}",
                run_id,
                result.resource.name,
                result.resource.id,
                result.container_name
            ),
            Err(failure) => tracing::error!("❌ [Provision] run {} {}", run_id, failure),
        }
        ProvisionRun {
            run_id,
            transitions: run.trail.into_transitions(),
            outcome,
        }
    }

    async fn drive(
        &self,
        run: &mut Run,
        provider: &dyn CloudProvider,
        request: &ProvisionRequest,
        access: &RunAccess<'_>,
        cancel: &CancellationToken,
    ) -> Result<ProvisioningResult, ProvisionFailure> {
        // Requested -> Created
        run.checkpoint(cancel)?;
        let spec = InstanceSpec {
            name: instance_name(&request.container_image, provider.kind()),
            machine_class: request.machine_class.clone(),
            base_image: request.base_image.clone(),
            admin: access.admin.clone(),
        };
        let (created, handle) = provider
            .create_instance(&spec)
            .await
            .map_err(|e| run.fail(e.failure_reason(), format!("create_instance: {}", e)))?;
        run.resource = Some(created);
        run.trail.advance(&format!("instance {} created", handle.instance_id));

        // Created -> NetworkAssigned
        run.checkpoint(cancel)?;
        let resource = self.wait_for_address(run, provider, &handle, cancel).await?;
        let address = provider.ssh_address(&resource).unwrap_or_default().to_string();
        run.resource = Some(resource.clone());
        run.trail.advance(&format!("address {}", address));

        // NetworkAssigned -> Reachable
        run.checkpoint(cancel)?;
        let user = provider.admin_username().to_string();
        match bootstrap::wait_for_reachable(
            self.connector.as_ref(),
            &address,
            &user,
            access.credential,
            self.policy.reachability_wait,
            cancel,
        )
        .await
        {
            Ok(()) => {}
            Err(WaitError::Cancelled) => {
                return Err(run.fail(FailureReason::Cancelled, "cancelled while waiting for SSH".into()))
            }
            Err(e) => {
                return Err(run.fail(
                    FailureReason::UnreachableTimeout,
                    format!("{}@{} not reachable: {}", user, address, e),
                ))
            }
        }
        run.trail.advance(&format!("ssh {}@{} answered", user, address));

        // Reachable -> RuntimeBootstrapped
        run.checkpoint(cancel)?;
        let plan = bootstrap::runtime_plan(&user, self.registry.as_ref());
        let mut transcript = bootstrap::bootstrap(self.connector.as_ref(), &address, &user, access.credential, &plan)
            .await
            .map_err(|e| run.fail(e.failure_reason(), format!("runtime bootstrap: {}", e)))?;
        let noisy = transcript.iter().filter(|r| !r.succeeded).count();
        run.trail.advance(&format!(
            "{} bootstrap steps run, {} reported errors",
            transcript.len(),
            noisy
        ));

        // RuntimeBootstrapped -> PortsOpened
        run.checkpoint(cancel)?;
        let ports = self
            .inspector
            .get_exposed_ports(&request.container_image)
            .await
            .map_err(|e| run.fail(FailureReason::ImageUnavailable, e.to_string()))?;
        let ingress = ports.with_required();
        provider
            .open_ingress(&handle, &ingress)
            .await
            .map_err(|e| run.fail(e.failure_reason(), format!("open_ingress: {}", e)))?;
        run.trail.advance(&format!("ingress {} open", ingress));

        // PortsOpened -> ContainerLaunched
        run.checkpoint(cancel)?;
        let container_name = container_name(&request.container_image);
        let launch = self
            .run_single(
                run,
                &address,
                &user,
                access.credential,
                BootstrapStep::RunContainer {
                    name: container_name.clone(),
                    image: request.container_image.clone(),
                    ports: ports.clone(),
                },
            )
            .await?;
        let launch_clean = launch.succeeded;
        if !launch_clean {
            tracing::warn!(
                "⚠️ [Provision] launch of {} reported errors, confirming with docker ps: {}",
                container_name,
                launch.stderr.trim()
            );
        }
        transcript.push(launch);
        run.trail.advance(&format!("docker run {}", container_name));

        // ContainerLaunched -> Verified: the listing is the ground truth.
        run.checkpoint(cancel)?;
        let listing = self
            .run_single(
                run,
                &address,
                &user,
                access.credential,
                BootstrapStep::ListRunningContainers,
            )
            .await?;
        let running = container_listed(&listing.stdout, &container_name);
        transcript.push(listing);
        if !running {
            return Err(run.fail(
                FailureReason::LaunchFailed,
                format!("container {} not running on {}", container_name, address),
            ));
        }
        if !launch_clean {
            tracing::info!("[Provision] {} is running despite launch errors", container_name);
        }
        run.trail.advance(&format!("container {} running", container_name));

        Ok(ProvisioningResult {
            resource,
            handle,
            ports,
            container_name,
            verified: true,
            bootstrap: transcript,
        })
    }

    async fn wait_for_address(
        &self,
        run: &mut Run,
        provider: &dyn CloudProvider,
        handle: &ProviderHandle,
        cancel: &CancellationToken,
    ) -> Result<ComputeResource, ProvisionFailure> {
        let waited = wait_for(self.policy.network_wait, cancel, || async move {
            match provider.get_instance(handle).await {
                Ok(resource) if provider.ssh_address(&resource).is_some() => Ok(Some(resource)),
                Ok(resource)
                    if matches!(
                        resource.status,
                        NormalizedStatus::Error | NormalizedStatus::Terminated
                    ) =>
                {
                    Err(ProviderError::Unavailable(format!(
                        "instance {} entered {} before getting an address",
                        resource.id, resource.status
                    )))
                }
                Ok(_) => Ok(None),
                Err(e @ ProviderError::Transport(_))
                | Err(e @ ProviderError::Unavailable(_))
                | Err(e @ ProviderError::NotFound(_))
                | Err(e @ ProviderError::Api { .. }) => {
                    tracing::warn!("⏳ [Provision] get_instance {} not ready: {}", handle.instance_id, e);
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        })
        .await;
        waited.map_err(|e| match e {
            WaitError::Cancelled => run.fail(FailureReason::Cancelled, "cancelled while waiting for an address".into()),
            WaitError::Timeout { attempts, elapsed } => run.fail(
                FailureReason::NetworkTimeout,
                format!(
                    "no address for {} after {} attempts ({:?})",
                    handle.instance_id, attempts, elapsed
                ),
            ),
            WaitError::Predicate(e) => run.fail(e.failure_reason(), format!("get_instance: {}", e)),
        })
    }

    async fn run_single(
        &self,
        run: &mut Run,
        address: &str,
        user: &str,
        credential: &SshCredential,
        step: BootstrapStep,
    ) -> Result<BootstrapCommandResult, ProvisionFailure> {
        let label = step.label();
        let mut results = bootstrap::bootstrap(self.connector.as_ref(), address, user, credential, &[step])
            .await
            .map_err(|e| run.fail(e.failure_reason(), format!("{}: {}", label, e)))?;
        results
            .pop()
            .ok_or_else(|| run.fail(FailureReason::LaunchFailed, format!("{}: no result", label)))
    }
}

struct Run {
    trail: RunTrail,
    resource: Option<ComputeResource>,
}

impl Run {
    fn fail(&mut self, reason: FailureReason, detail: String) -> ProvisionFailure {
        let state = self.trail.fail(reason, &detail);
        ProvisionFailure {
            state,
            reason,
            detail,
            resource: self.resource.clone(),
        }
    }

    fn checkpoint(&mut self, cancel: &CancellationToken) -> Result<(), ProvisionFailure> {
        if cancel.is_cancelled() {
            let state = self.trail.state();
            return Err(self.fail(FailureReason::Cancelled, format!("cancelled in {}", state)));
        }
        Ok(())
    }
}

/// Exact line match against `docker ps --format '{{.Names}}'` output.
pub fn container_listed(listing: &str, name: &str) -> bool {
    listing.lines().any(|line| line.trim() == name)
}

/// `myrepo/app:1.0` -> `myrepo-app-1.0-container`
pub fn container_name(image: &str) -> String {
    let mut out = String::with_capacity(image.len() + 10);
    for c in image.trim().chars() {
        match c {
            '/' | ':' | '@' => out.push('-'),
            c if c.is_whitespace() => {}
            c if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' => out.push(c),
            _ => out.push('-'),
        }
    }
    let trimmed = out.trim_start_matches(|c: char| !c.is_ascii_alphanumeric());
    format!("{}-container", trimmed)
}

/// Instance name valid on every backend: `[a-z0-9-]`, starts with a letter,
/// at most 63 characters, e.g. `app-1-0-k3x9-aws`.
pub fn instance_name(image: &str, provider: ProviderKind) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(4)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect();
    instance_name_with_suffix(image, provider, &suffix)
}

pub fn instance_name_with_suffix(image: &str, provider: ProviderKind, suffix: &str) -> String {
    let without_digest = image.trim().split('@').next().unwrap_or_default();
    let last = without_digest.rsplit('/').next().unwrap_or_default();

    let mut base = String::with_capacity(last.len());
    for c in last.chars().map(|c| c.to_ascii_lowercase()) {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' };
        if c == '-' && (base.is_empty() || base.ends_with('-')) {
            continue;
        }
        base.push(c);
    }
    if !base.starts_with(|c: char| c.is_ascii_lowercase()) {
        base.insert_str(0, "i-");
    }

    let tail = format!("-{}-{}", suffix, provider.as_str());
    let room = MAX_NAME_LEN.saturating_sub(tail.len());
    base.truncate(room);
    let base = base.trim_end_matches('-');
    format!("{}{}", base, tail)
}
