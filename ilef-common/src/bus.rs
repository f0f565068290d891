use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    ComputeResource, FailureReason, InstanceAction, ProviderHandle, ProviderKind,
    ProvisionRequest, ProvisioningResult, ProvisioningState,
};

// -----------------------------------------------------------------------------
// Channels
// -----------------------------------------------------------------------------

pub const CHANNEL_PROVISIONING_COMMANDS: &str = "provisioning_commands";
pub const CHANNEL_PROVISIONING_RESULTS: &str = "provisioning_results";

// -----------------------------------------------------------------------------
// Commands (CMD:*)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum Command {
    #[serde(rename = "CMD:PROVISION")]
    Provision {
        request_id: Uuid,
        request: ProvisionRequest,
    },
    #[serde(rename = "CMD:CANCEL")]
    Cancel { request_id: Uuid },
    #[serde(rename = "CMD:MANAGE")]
    Manage {
        request_id: Uuid,
        handle: ProviderHandle,
        action: InstanceAction,
    },
    #[serde(rename = "CMD:LIST")]
    List {
        request_id: Uuid,
        provider: ProviderKind,
    },
}

impl Command {
    pub fn type_str(&self) -> &'static str {
        match self {
            Command::Provision { .. } => "CMD:PROVISION",
            Command::Cancel { .. } => "CMD:CANCEL",
            Command::Manage { .. } => "CMD:MANAGE",
            Command::List { .. } => "CMD:LIST",
        }
    }

    pub fn request_id(&self) -> Uuid {
        match self {
            Command::Provision { request_id, .. }
            | Command::Cancel { request_id }
            | Command::Manage { request_id, .. }
            | Command::List { request_id, .. } => *request_id,
        }
    }
}

// -----------------------------------------------------------------------------
// Results (EVT:*)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "EVT:PROVISIONED")]
    Provisioned {
        request_id: Uuid,
        result: ProvisioningResult,
    },
    #[serde(rename = "EVT:PROVISION_FAILED")]
    ProvisionFailed {
        request_id: Uuid,
        state: ProvisioningState,
        reason: FailureReason,
        detail: String,
        resource: Option<ComputeResource>,
    },
    #[serde(rename = "EVT:ACTION_DONE")]
    ActionDone {
        request_id: Uuid,
        handle: ProviderHandle,
        action: InstanceAction,
    },
    #[serde(rename = "EVT:ACTION_FAILED")]
    ActionFailed {
        request_id: Uuid,
        reason: FailureReason,
        detail: String,
    },
    #[serde(rename = "EVT:INSTANCES")]
    Instances {
        request_id: Uuid,
        provider: ProviderKind,
        instances: Vec<ComputeResource>,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub source: String,
    #[serde(flatten)]
    pub event: Event,
}

impl EventEnvelope {
    pub fn new(event: Event, source: &str) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            source: source.to_string(),
            event,
        }
    }
}
