use chrono::{DateTime, Utc};
use ilef_common::{FailureReason, ProvisioningState};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: ProvisioningState,
    pub to: ProvisioningState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Successor of `state` on the success path.
pub fn next_state(state: ProvisioningState) -> Option<ProvisioningState> {
    use ilef_common::ProvisioningState::*;
    match state {
        Requested => Some(Created),
        Created => Some(NetworkAssigned),
        NetworkAssigned => Some(Reachable),
        Reachable => Some(RuntimeBootstrapped),
        RuntimeBootstrapped => Some(PortsOpened),
        PortsOpened => Some(ContainerLaunched),
        ContainerLaunched => Some(Verified),
        Verified | Failed => None,
    }
}

pub fn is_valid_transition(from: ProvisioningState, to: ProvisioningState) -> bool {
    if to == ProvisioningState::Failed {
        return !from.is_terminal();
    }
    next_state(from) == Some(to)
}

fn log_state_transition(run_id: Uuid, from: ProvisioningState, to: ProvisioningState, reason: &str) {
    if to == ProvisioningState::Failed {
        tracing::error!("❌ [state_machine] run {}: {} -> {} ({})", run_id, from, to, reason);
    } else {
        tracing::info!("🔄 [state_machine] run {}: {} -> {} ({})", run_id, from, to, reason);
    }
}

/// State and transition history of one provisioning run.
#[derive(Debug, Clone)]
pub struct RunTrail {
    run_id: Uuid,
    state: ProvisioningState,
    transitions: Vec<TransitionRecord>,
}

impl RunTrail {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            state: ProvisioningState::Requested,
            transitions: Vec::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    pub fn into_transitions(self) -> Vec<TransitionRecord> {
        self.transitions
    }

    /// Move to the next success state. No-op once terminal.
    pub fn advance(&mut self, reason: &str) -> ProvisioningState {
        match next_state(self.state) {
            Some(to) => self.record(to, reason.to_string()),
            None => {
                tracing::warn!(
                    "⚠️ [state_machine] run {}: advance ignored in terminal state {}",
                    self.run_id,
                    self.state
                );
            }
        }
        self.state
    }

    /// Move to `Failed`, returning the state the run failed in.
    pub fn fail(&mut self, reason: FailureReason, detail: &str) -> ProvisioningState {
        let failed_in = self.state;
        if !is_valid_transition(failed_in, ProvisioningState::Failed) {
            tracing::warn!(
                "⚠️ [state_machine] run {}: fail({}) ignored in terminal state {}",
                self.run_id,
                reason,
                failed_in
            );
            return failed_in;
        }
        self.record(ProvisioningState::Failed, format!("{}: {}", reason, detail));
        failed_in
    }

    fn record(&mut self, to: ProvisioningState, reason: String) {
        let from = self.state;
        log_state_transition(self.run_id, from, to, &reason);
        self.transitions.push(TransitionRecord {
            from,
            to,
            reason,
            at: Utc::now(),
        });
        self.state = to;
    }
}
