use ilef_common::bus::{Command, Event};
use ilef_common::{FailureReason, ProvisionRequest, ProvisioningState};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::provider_manager::ProviderManager;
use crate::provisioning::{Orchestrator, RunAccess};
use crate::settings::Settings;

/// Executes bus commands. One instance is shared by every spawned handler.
pub struct Worker {
    providers: ProviderManager,
    orchestrator: Orchestrator,
    settings: Settings,
    in_flight: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl Worker {
    pub fn new(providers: ProviderManager, orchestrator: Orchestrator, settings: Settings) -> Self {
        Self {
            providers,
            orchestrator,
            settings,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Run one command to completion. `None` when there is nothing to report.
    pub async fn handle(&self, command: Command) -> Option<Event> {
        let request_id = command.request_id();
        tracing::info!("📥 [Worker] {} request_id={}", command.type_str(), request_id);
        match command {
            Command::Provision { request_id, request } => Some(self.provision(request_id, request).await),
            Command::Cancel { request_id } => {
                match self.lock().get(&request_id) {
                    Some(token) => {
                        tracing::warn!("🛑 [Worker] cancelling request {}", request_id);
                        token.cancel();
                    }
                    None => tracing::warn!("⚠️ [Worker] cancel for unknown request {}", request_id),
                }
                None
            }
            Command::Manage {
                request_id,
                handle,
                action,
            } => {
                let outcome = match self.providers.get(handle.provider) {
                    Ok(provider) => provider.manage_instance_action(&handle, action).await,
                    Err(e) => Err(e),
                };
                Some(match outcome {
                    Ok(()) => Event::ActionDone {
                        request_id,
                        handle,
                        action,
                    },
                    Err(e) => {
                        tracing::error!(
                            "❌ [Worker] {} on {} failed: {}",
                            action,
                            handle.instance_id,
                            e
                        );
                        Event::ActionFailed {
                            request_id,
                            reason: e.failure_reason(),
                            detail: e.to_string(),
                        }
                    }
                })
            }
            Command::List { request_id, provider } => {
                let outcome = match self.providers.get(provider) {
                    Ok(p) => p.list_instances().await,
                    Err(e) => Err(e),
                };
                Some(match outcome {
                    Ok(instances) => Event::Instances {
                        request_id,
                        provider,
                        instances,
                    },
                    Err(e) => Event::ActionFailed {
                        request_id,
                        reason: e.failure_reason(),
                        detail: e.to_string(),
                    },
                })
            }
        }
    }

    async fn provision(&self, request_id: Uuid, request: ProvisionRequest) -> Event {
        let rejected = |reason: FailureReason, detail: String| {
            tracing::error!("❌ [Worker] request {} rejected: {}", request_id, detail);
            Event::ProvisionFailed {
                request_id,
                state: ProvisioningState::Requested,
                reason,
                detail,
                resource: None,
            }
        };

        let provider = match self.providers.get(request.provider) {
            Ok(p) => p,
            Err(e) => return rejected(e.failure_reason(), e.to_string()),
        };
        let credential = match self
            .settings
            .resolve_ssh_credential(request.ssh_credential_ref.as_deref())
        {
            Ok(c) => c,
            Err(e) => return rejected(e.failure_reason(), e.to_string()),
        };

        let cancel = CancellationToken::new();
        self.lock().insert(request_id, cancel.clone());
        let access = RunAccess {
            admin: self.providers.admin_access(),
            credential: &credential,
        };
        let run = self
            .orchestrator
            .provision(provider.as_ref(), &request, access, &cancel)
            .await;
        self.lock().remove(&request_id);

        match run.outcome {
            Ok(result) => Event::Provisioned { request_id, result },
            Err(failure) => Event::ProvisionFailed {
                request_id,
                state: failure.state,
                reason: failure.reason,
                detail: failure.detail,
                resource: failure.resource,
            },
        }
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
