//! Compute Engine backend. Mutations return long-running operations which
//! are polled to completion, since quota and invalid-request errors only show up there.

use async_trait::async_trait;
use ilef_common::waiter::{wait_for, WaitError, WaitPolicy};
use ilef_common::{
    ComputeResource, InstanceAction, NormalizedStatus, PortSet, ProviderHandle, ProviderKind,
    StatusTable,
};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::http::{base_url, build_client, classify_status, expect_success, non_empty, parse_timestamp};
use crate::{CloudProvider, InstanceSpec, ProviderError};

pub const DEFAULT_IMAGE: &str = "projects/debian-cloud/global/images/family/debian-12";
const DEFAULT_ENDPOINT: &str = "https://compute.googleapis.com/compute/v1";
const DEFAULT_NETWORK: &str = "global/networks/default";

pub const STATUS_TABLE: StatusTable = &[
    ("PROVISIONING", NormalizedStatus::Pending),
    ("STAGING", NormalizedStatus::Pending),
    ("REPAIRING", NormalizedStatus::Pending),
    ("RUNNING", NormalizedStatus::Running),
    ("STOPPING", NormalizedStatus::Stopping),
    ("SUSPENDING", NormalizedStatus::Stopping),
    ("STOPPED", NormalizedStatus::Stopped),
    ("SUSPENDED", NormalizedStatus::Stopped),
    // GCE reports a stopped VM as TERMINATED; deleted VMs simply disappear.
    ("TERMINATED", NormalizedStatus::Stopped),
];

#[derive(Debug, Clone)]
pub struct GcpConfig {
    pub project_id: String,
    pub zone: String,
    /// OAuth2 bearer token with the compute scope.
    pub access_token: String,
    pub default_image: String,
    pub network: String,
    pub endpoint: Option<String>,
    pub operation_wait: WaitPolicy,
}

impl GcpConfig {
    pub fn new(project_id: String, zone: String, access_token: String) -> Self {
        Self {
            project_id: project_id.trim().to_string(),
            zone: zone.trim().to_string(),
            access_token: access_token.trim().to_string(),
            default_image: DEFAULT_IMAGE.to_string(),
            network: DEFAULT_NETWORK.to_string(),
            endpoint: None,
            operation_wait: WaitPolicy::new(Duration::from_secs(2), Duration::from_secs(300)),
        }
    }
}

enum OperationScope<'a> {
    Zone(&'a str),
    Global,
}

pub struct GcpProvider {
    client: Client,
    config: GcpConfig,
    base: String,
}

impl GcpProvider {
    pub fn new(config: GcpConfig) -> Result<Self, ProviderError> {
        let base = config
            .endpoint
            .as_deref()
            .map(base_url)
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        Ok(Self {
            client: build_client()?,
            config,
            base,
        })
    }

    fn firewall_name(instance_name: &str) -> String {
        format!("{}-ingress", instance_name)
    }

    fn project_url(&self) -> String {
        format!("{}/projects/{}", self.base, self.config.project_id)
    }

    fn zone_of<'a>(&'a self, handle: &'a ProviderHandle) -> &'a str {
        handle.zone.as_deref().unwrap_or(&self.config.zone)
    }

    fn instances_url(&self, zone: &str) -> String {
        format!("{}/zones/{}/instances", self.project_url(), zone)
    }

    async fn send(&self, method: &str, url: &str, req: RequestBuilder) -> Result<Value, ProviderError> {
        tracing::debug!("🔵 [GCP API] {} {}", method, url);
        let resp = req.bearer_auth(&self.config.access_token).send().await?;
        let resp = expect_success("GCP API", method, url, resp, gcp_error).await?;
        Ok(resp.json().await?)
    }

    async fn wait_operation(&self, op: &Value, scope: OperationScope<'_>) -> Result<(), ProviderError> {
        let name = op["name"]
            .as_str()
            .ok_or_else(|| ProviderError::Api {
                provider: "gcp",
                status: 200,
                body: format!("operation without a name: {}", op),
            })?
            .to_string();
        let url = match scope {
            OperationScope::Zone(zone) => format!("{}/zones/{}/operations/{}", self.project_url(), zone, name),
            OperationScope::Global => format!("{}/global/operations/{}", self.project_url(), name),
        };

        let done = if op["status"] == "DONE" {
            op.clone()
        } else {
            let cancel = CancellationToken::new();
            let waited = wait_for(self.config.operation_wait, &cancel, move || {
                let url = url.clone();
                async move {
                    match self.send("GET", &url, self.client.get(&url)).await {
                        Ok(current) if current["status"] == "DONE" => Ok(Some(current)),
                        Ok(_) => Ok(None),
                        Err(ProviderError::Transport(_)) | Err(ProviderError::Unavailable(_)) => Ok(None),
                        Err(e) => Err(e),
                    }
                }
            })
            .await;
            match waited {
                Ok(done) => done,
                Err(WaitError::Predicate(e)) => return Err(e),
                Err(e) => {
                    return Err(ProviderError::Unavailable(format!(
                        "operation {} did not finish: {}",
                        name, e
                    )))
                }
            }
        };

        match operation_error(&done) {
            Some(err) => {
                tracing::error!("❌ [GCP API] operation {} failed: {}", name, err);
                Err(err)
            }
            None => Ok(()),
        }
    }

    async fn get_firewall(&self, name: &str) -> Result<Option<Value>, ProviderError> {
        let url = format!("{}/global/firewalls/{}", self.project_url(), name);
        match self.send("GET", &url, self.client.get(&url)).await {
            Ok(fw) => Ok(Some(fw)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn insert_firewall(&self, instance_name: &str, ports: &PortSet) -> Result<(), ProviderError> {
        let url = format!("{}/global/firewalls", self.project_url());
        let body = json!({
            "name": Self::firewall_name(instance_name),
            "network": self.config.network,
            "direction": "INGRESS",
            "sourceRanges": ["0.0.0.0/0"],
            "targetTags": [instance_name],
            "allowed": [{ "IPProtocol": "tcp", "ports": port_strings(ports) }],
        });
        let op = self.send("POST", &url, self.client.post(&url).json(&body)).await?;
        self.wait_operation(&op, OperationScope::Global).await
    }

    async fn delete_firewall(&self, instance_name: &str) -> Result<(), ProviderError> {
        let url = format!(
            "{}/global/firewalls/{}",
            self.project_url(),
            Self::firewall_name(instance_name)
        );
        match self.send("DELETE", &url, self.client.delete(&url)).await {
            Ok(op) => self.wait_operation(&op, OperationScope::Global).await,
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Best-effort cleanup after a create that failed part way. The instance
    /// is deleted without waiting; a 404 means it never materialised.
    async fn roll_back_create(&self, instance_name: &str, zone: &str, firewall_created: bool) {
        let url = format!("{}/{}", self.instances_url(zone), instance_name);
        match self.send("DELETE", &url, self.client.delete(&url)).await {
            Ok(_) => tracing::info!("[GCP API] rolled back instance {}", instance_name),
            Err(e) if e.is_not_found() => {}
            Err(e) => tracing::warn!("⚠️ [GCP API] could not roll back instance {}: {}", instance_name, e),
        }
        if firewall_created {
            if let Err(e) = self.delete_firewall(instance_name).await {
                tracing::warn!(
                    "⚠️ [GCP API] could not roll back firewall {}: {}",
                    Self::firewall_name(instance_name),
                    e
                );
            }
        }
    }

    fn to_resource(&self, inst: &Value) -> ComputeResource {
        let nic = &inst["networkInterfaces"][0];
        ComputeResource {
            id: value_string(&inst["id"]),
            name: inst["name"].as_str().unwrap_or_default().to_string(),
            provider: ProviderKind::Gcp,
            status: self.normalize_status(inst["status"].as_str().unwrap_or_default()),
            machine_class: last_segment(inst["machineType"].as_str()),
            created_at: parse_timestamp(inst["creationTimestamp"].as_str()),
            private_address: non_empty(nic["networkIP"].as_str()),
            public_address: non_empty(nic["accessConfigs"][0]["natIP"].as_str()),
            zone: non_empty(Some(last_segment(inst["zone"].as_str()).as_str())),
        }
    }
}

#[async_trait]
impl CloudProvider for GcpProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gcp
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
        spec.validate()?;
        let public_key = non_empty(spec.admin.public_key.as_deref())
            .ok_or_else(|| ProviderError::InvalidSpec("GCP needs SSH public key material".into()))?;
        let image = non_empty(spec.base_image.as_deref()).unwrap_or_else(|| self.config.default_image.clone());
        let zone = self.config.zone.clone();

        let url = self.instances_url(&zone);
        let body = json!({
            "name": spec.name,
            "machineType": format!("zones/{}/machineTypes/{}", zone, spec.machine_class),
            "tags": { "items": [spec.name] },
            "disks": [{
                "boot": true,
                "autoDelete": true,
                "initializeParams": { "sourceImage": image },
            }],
            "networkInterfaces": [{
                "network": self.config.network,
                "accessConfigs": [{ "name": "External NAT", "type": "ONE_TO_ONE_NAT" }],
            }],
            "metadata": {
                "items": [{
                    "key": "ssh-keys",
                    "value": format!("{}:{}", self.admin_username(), public_key),
                }],
            },
        });

        // The firewall matches on the instance tag, so it can exist first.
        let firewall_created = match self.get_firewall(&Self::firewall_name(&spec.name)).await? {
            Some(_) => false,
            None => {
                self.insert_firewall(&spec.name, &PortSet::new().with_admin()).await?;
                true
            }
        };

        tracing::info!(
            "🔵 [GCP API] POST {} name={} type={} image={}",
            url,
            spec.name,
            spec.machine_class,
            image
        );
        let created = async {
            let op = self.send("POST", &url, self.client.post(&url).json(&body)).await?;
            self.wait_operation(&op, OperationScope::Zone(&zone)).await?;
            let url = format!("{}/{}", url, spec.name);
            let inst = self.send("GET", &url, self.client.get(&url)).await?;
            Ok::<Value, ProviderError>(inst)
        }
        .await;
        let inst = match created {
            Ok(inst) => inst,
            Err(e) => {
                tracing::error!("❌ [GCP API] create of {} failed: {}", spec.name, e);
                self.roll_back_create(&spec.name, &zone, firewall_created).await;
                return Err(e);
            }
        };
        let resource = self.to_resource(&inst);
        let handle = ProviderHandle::from_resource(&resource);
        tracing::info!("✅ [GCP API] instance {} created ({})", resource.name, resource.status);
        Ok((resource, handle))
    }

    async fn get_instance(&self, handle: &ProviderHandle) -> Result<ComputeResource, ProviderError> {
        let url = format!("{}/{}", self.instances_url(self.zone_of(handle)), handle.instance_name);
        let inst = self.send("GET", &url, self.client.get(&url)).await?;
        Ok(self.to_resource(&inst))
    }

    async fn list_instances(&self) -> Result<Vec<ComputeResource>, ProviderError> {
        let url = self.instances_url(&self.config.zone);
        let list = self.send("GET", &url, self.client.get(&url)).await?;
        Ok(list["items"]
            .as_array()
            .map(|items| items.iter().map(|i| self.to_resource(i)).collect())
            .unwrap_or_default())
    }

    async fn manage_instance_action(
        &self,
        handle: &ProviderHandle,
        action: InstanceAction,
    ) -> Result<(), ProviderError> {
        let zone = self.zone_of(handle).to_string();
        let url = format!("{}/{}", self.instances_url(&zone), handle.instance_name);
        match action {
            InstanceAction::Start | InstanceAction::Stop => {
                let url = format!("{}/{}", url, action.as_str());
                self.send("POST", &url, self.client.post(&url)).await?;
            }
            InstanceAction::Terminate => {
                let op = self.send("DELETE", &url, self.client.delete(&url)).await?;
                self.wait_operation(&op, OperationScope::Zone(&zone)).await?;
                self.delete_firewall(&handle.instance_name).await?;
            }
        }
        tracing::info!("✅ [GCP API] {} {}", action, handle.instance_name);
        Ok(())
    }

    async fn open_ingress(&self, handle: &ProviderHandle, ports: &PortSet) -> Result<(), ProviderError> {
        let name = Self::firewall_name(&handle.instance_name);
        let wanted = ports.with_admin();
        let Some(fw) = self.get_firewall(&name).await? else {
            tracing::info!("🔵 [GCP API] creating firewall {} with {}", name, wanted);
            return self.insert_firewall(&handle.instance_name, &wanted).await;
        };

        let allowed = allowed_tcp_ports(&fw);
        if wanted.iter().all(|p| allowed.iter().any(|(lo, hi)| *lo <= p && p <= *hi)) {
            tracing::info!("[GCP API] {} already allows {}", name, wanted);
            return Ok(());
        }

        let current: PortSet = allowed
            .iter()
            .filter(|(lo, hi)| lo == hi)
            .map(|(lo, _)| *lo)
            .collect();
        let mut rules = port_strings(&current.union(&wanted));
        rules.extend(
            allowed
                .iter()
                .filter(|(lo, hi)| lo != hi)
                .map(|(lo, hi)| format!("{}-{}", lo, hi)),
        );
        let url = format!("{}/global/firewalls/{}", self.project_url(), name);
        let body = json!({ "allowed": [{ "IPProtocol": "tcp", "ports": rules }] });
        tracing::info!("🔵 [GCP API] PATCH {} ports={:?}", url, rules);
        let op = self.send("PATCH", &url, self.client.patch(&url).json(&body)).await?;
        self.wait_operation(&op, OperationScope::Global).await
    }
}

fn port_strings(ports: &PortSet) -> Vec<String> {
    ports.iter().map(|p| p.to_string()).collect()
}

/// TCP port ranges allowed by a firewall resource, as inclusive pairs.
fn allowed_tcp_ports(fw: &Value) -> Vec<(u16, u16)> {
    let mut out = Vec::new();
    for rule in fw["allowed"].as_array().into_iter().flatten() {
        if rule["IPProtocol"] != "tcp" {
            continue;
        }
        for entry in rule["ports"].as_array().into_iter().flatten() {
            let Some(raw) = entry.as_str() else { continue };
            let parsed = match raw.split_once('-') {
                Some((lo, hi)) => lo.trim().parse().ok().zip(hi.trim().parse().ok()),
                None => raw.trim().parse().ok().map(|p| (p, p)),
            };
            if let Some(range) = parsed {
                out.push(range);
            }
        }
    }
    out
}

fn value_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

fn last_segment(url: Option<&str>) -> String {
    url.unwrap_or_default()
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

fn classify_code(code: &str, detail: String) -> Option<ProviderError> {
    let lower = code.to_ascii_lowercase();
    if lower.contains("quota") {
        Some(ProviderError::QuotaExceeded(detail))
    } else if lower.contains("resource_pool_exhausted") || lower.contains("ratelimit") || lower == "backenderror" {
        Some(ProviderError::Unavailable(detail))
    } else if lower == "notfound" {
        Some(ProviderError::NotFound(detail))
    } else if lower.contains("invalid") || lower.contains("not_found") || lower == "badrequest" || lower.contains("already_exists") {
        Some(ProviderError::InvalidSpec(detail))
    } else {
        None
    }
}

fn gcp_error(status: StatusCode, body: String) -> ProviderError {
    let parsed: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
    let reason = parsed["error"]["errors"][0]["reason"].as_str().unwrap_or_default();
    let message = parsed["error"]["message"].as_str().unwrap_or(&body).to_string();
    if !reason.is_empty() && status != StatusCode::NOT_FOUND {
        if let Some(err) = classify_code(reason, format!("{}: {}", reason, message)) {
            return err;
        }
    }
    classify_status("gcp", status, body)
}

/// Typed error carried by a finished operation, if any.
fn operation_error(op: &Value) -> Option<ProviderError> {
    let first = op["error"]["errors"].as_array()?.first()?;
    let code = first["code"].as_str().unwrap_or("UNKNOWN");
    let detail = format!("{}: {}", code, first["message"].as_str().unwrap_or_default());
    Some(classify_code(code, detail.clone()).unwrap_or(ProviderError::Api {
        provider: "gcp",
        status: op["httpErrorStatusCode"].as_u64().unwrap_or(500) as u16,
        body: detail,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_errors_are_typed() {
        let quota = json!({
            "name": "op-1",
            "status": "DONE",
            "error": { "errors": [{ "code": "QUOTA_EXCEEDED", "message": "Quota 'CPUS' exceeded." }] }
        });
        assert!(matches!(operation_error(&quota), Some(ProviderError::QuotaExceeded(_))));

        let exhausted = json!({
            "status": "DONE",
            "error": { "errors": [{ "code": "ZONE_RESOURCE_POOL_EXHAUSTED", "message": "" }] }
        });
        assert!(matches!(operation_error(&exhausted), Some(ProviderError::Unavailable(_))));

        let bad_type = json!({
            "status": "DONE",
            "error": { "errors": [{ "code": "INVALID_FIELD_VALUE", "message": "machineType" }] }
        });
        assert!(matches!(operation_error(&bad_type), Some(ProviderError::InvalidSpec(_))));

        assert!(operation_error(&json!({ "status": "DONE" })).is_none());
    }

    #[test]
    fn http_errors_use_reason_before_status() {
        let body = json!({
            "error": {
                "code": 403,
                "message": "Quota exceeded for quota metric",
                "errors": [{ "reason": "quotaExceeded" }]
            }
        })
        .to_string();
        assert!(matches!(gcp_error(StatusCode::FORBIDDEN, body), ProviderError::QuotaExceeded(_)));
        assert!(matches!(
            gcp_error(StatusCode::FORBIDDEN, "{}".into()),
            ProviderError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            gcp_error(StatusCode::NOT_FOUND, json!({"error": {"errors": [{"reason": "notFound"}]}}).to_string()),
            ProviderError::NotFound(_)
        ));
    }

    #[test]
    fn firewall_ranges_parse() {
        let fw = json!({
            "allowed": [
                { "IPProtocol": "tcp", "ports": ["22", "8000-8100"] },
                { "IPProtocol": "udp", "ports": ["53"] }
            ]
        });
        assert_eq!(allowed_tcp_ports(&fw), vec![(22, 22), (8000, 8100)]);
    }

    #[test]
    fn terminated_means_stopped() {
        assert_eq!(
            ilef_common::normalize_status(STATUS_TABLE, "TERMINATED"),
            NormalizedStatus::Stopped
        );
        assert_eq!(
            ilef_common::normalize_status(STATUS_TABLE, "SOMETHING_NEW"),
            NormalizedStatus::Unknown
        );
    }
}
