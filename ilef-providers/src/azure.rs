//! Azure Resource Manager backend. The VM needs a public IP, an NSG and a
//! NIC first; those are created and awaited here, the VM itself only
//! acknowledged.

use async_trait::async_trait;
use ilef_common::waiter::{wait_for, WaitError, WaitPolicy};
use ilef_common::{
    ComputeResource, InstanceAction, NormalizedStatus, PortSet, ProviderHandle, ProviderKind,
    StatusTable, ADMIN_PORT,
};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::http::{base_url, build_client, classify_status, expect_success, non_empty, parse_timestamp};
use crate::{CloudProvider, InstanceSpec, ProviderError};

pub const DEFAULT_IMAGE: &str = "Canonical:0001-com-ubuntu-server-jammy:22_04-lts:latest";
const DEFAULT_MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";
const DEFAULT_LOGIN_ENDPOINT: &str = "https://login.microsoftonline.com";
const COMPUTE_API: &str = "2023-09-01";
const NETWORK_API: &str = "2023-09-01";
const DISK_API: &str = "2023-04-02";
const FIRST_RULE_PRIORITY: u64 = 1000;
const MAX_RULE_PRIORITY: u64 = 4096;

pub const STATUS_TABLE: StatusTable = &[
    ("PowerState/running", NormalizedStatus::Running),
    ("PowerState/starting", NormalizedStatus::Pending),
    ("PowerState/stopping", NormalizedStatus::Stopping),
    ("PowerState/stopped", NormalizedStatus::Stopped),
    ("PowerState/deallocating", NormalizedStatus::Stopping),
    ("PowerState/deallocated", NormalizedStatus::Stopped),
    ("PowerState/unknown", NormalizedStatus::Unknown),
    ("Creating", NormalizedStatus::Pending),
    ("Updating", NormalizedStatus::Pending),
    ("Succeeded", NormalizedStatus::Running),
    ("Failed", NormalizedStatus::Error),
    ("Canceled", NormalizedStatus::Error),
    ("Deleting", NormalizedStatus::Terminating),
];

#[derive(Debug, Clone)]
pub struct AzureConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub subscription_id: String,
    pub resource_group: String,
    pub location: String,
    /// `publisher:offer:sku:version`
    pub default_image: String,
    pub management_endpoint: Option<String>,
    pub login_endpoint: Option<String>,
    /// Polling for network resources to reach `Succeeded`.
    pub provisioning_wait: WaitPolicy,
    /// Polling for deletions during terminate.
    pub cleanup_wait: WaitPolicy,
}

impl AzureConfig {
    pub fn new(
        tenant_id: String,
        client_id: String,
        client_secret: String,
        subscription_id: String,
        resource_group: String,
        location: String,
    ) -> Self {
        Self {
            tenant_id: tenant_id.trim().to_string(),
            client_id: client_id.trim().to_string(),
            client_secret: client_secret.trim().to_string(),
            subscription_id: subscription_id.trim().to_string(),
            resource_group: resource_group.trim().to_string(),
            location: location.trim().to_string(),
            default_image: DEFAULT_IMAGE.to_string(),
            management_endpoint: None,
            login_endpoint: None,
            provisioning_wait: WaitPolicy::new(Duration::from_secs(3), Duration::from_secs(300)),
            cleanup_wait: WaitPolicy::new(Duration::from_secs(5), Duration::from_secs(600)),
        }
    }
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct AzureProvider {
    client: Client,
    config: AzureConfig,
    management: String,
    login: String,
    token: Mutex<Option<CachedToken>>,
}

impl AzureProvider {
    pub fn new(config: AzureConfig) -> Result<Self, ProviderError> {
        let management = config
            .management_endpoint
            .as_deref()
            .map(base_url)
            .unwrap_or_else(|| DEFAULT_MANAGEMENT_ENDPOINT.to_string());
        let login = config
            .login_endpoint
            .as_deref()
            .map(base_url)
            .unwrap_or_else(|| DEFAULT_LOGIN_ENDPOINT.to_string());
        Ok(Self {
            client: build_client()?,
            config,
            management,
            login,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let url = format!("{}/{}/oauth2/v2.0/token", self.login, self.config.tenant_id);
        let scope = format!("{}/.default", DEFAULT_MANAGEMENT_ENDPOINT);
        let resp = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("scope", scope.as_str()),
            ])
            .send()
            .await?;
        let resp = expect_success("Azure Login", "POST", &url, resp, |status, body| {
            if status.is_client_error() {
                ProviderError::AuthenticationFailed(body)
            } else {
                classify_status("azure", status, body)
            }
        })
        .await?;
        let body: Value = resp.json().await?;
        let value = body["access_token"]
            .as_str()
            .ok_or_else(|| ProviderError::AuthenticationFailed("token response without access_token".into()))?
            .to_string();
        // Refresh a minute early.
        let ttl = body["expires_in"].as_u64().unwrap_or(3600).saturating_sub(60);
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + Duration::from_secs(ttl),
        });
        Ok(value)
    }

    fn resource_id(&self, kind: &str, name: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/{}/{}",
            self.config.subscription_id, self.config.resource_group, kind, name
        )
    }

    fn url(&self, resource_id: &str, api_version: &str) -> String {
        format!("{}{}?api-version={}", self.management, resource_id, api_version)
    }

    fn vm_url(&self, name: &str) -> String {
        self.url(&self.resource_id("Microsoft.Compute/virtualMachines", name), COMPUTE_API)
    }

    fn network_url(&self, kind: &str, name: &str) -> String {
        self.url(&self.resource_id(&format!("Microsoft.Network/{}", kind), name), NETWORK_API)
    }

    async fn send(&self, method: &str, url: &str, req: RequestBuilder) -> Result<Value, ProviderError> {
        let token = self.access_token().await?;
        tracing::debug!("🔵 [Azure API] {} {}", method, url);
        let resp = req.bearer_auth(token).send().await?;
        let resp = expect_success("Azure API", method, url, resp, azure_error).await?;
        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ProviderError::Api {
            provider: "azure",
            status: 200,
            body: format!("unparsable response from {}: {}", url, e),
        })
    }

    async fn get_optional(&self, url: &str) -> Result<Option<Value>, ProviderError> {
        match self.send("GET", url, self.client.get(url)).await {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// PUT `body` to `url` and poll the resource until it is `Succeeded`.
    async fn put_and_wait(&self, url: &str, body: &Value) -> Result<Value, ProviderError> {
        let created = self.send("PUT", url, self.client.put(url).json(body)).await?;
        if created["properties"]["provisioningState"] == "Succeeded" {
            return Ok(created);
        }
        let cancel = CancellationToken::new();
        let waited = wait_for(self.config.provisioning_wait, &cancel, move || async move {
            match self.send("GET", url, self.client.get(url)).await {
                Ok(current) => match current["properties"]["provisioningState"].as_str() {
                    Some("Succeeded") => Ok(Some(current)),
                    Some("Failed") | Some("Canceled") => Err(ProviderError::Api {
                        provider: "azure",
                        status: 200,
                        body: format!("provisioning failed for {}", url),
                    }),
                    _ => Ok(None),
                },
                Err(ProviderError::Transport(_)) | Err(ProviderError::Unavailable(_)) => Ok(None),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await;
        waited.map_err(|e| match e {
            WaitError::Predicate(e) => e,
            other => ProviderError::Unavailable(format!("{} not provisioned: {}", url, other)),
        })
    }

    /// DELETE `url` (absent is fine) and poll until it is gone.
    async fn delete_and_wait(&self, url: &str) -> Result<(), ProviderError> {
        match self.send("DELETE", url, self.client.delete(url)).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        }
        let cancel = CancellationToken::new();
        let waited = wait_for(self.config.cleanup_wait, &cancel, move || async move {
            match self.send("GET", url, self.client.get(url)).await {
                Err(e) if e.is_not_found() => Ok(Some(())),
                Ok(_) | Err(ProviderError::Transport(_)) | Err(ProviderError::Unavailable(_)) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await;
        waited.map_err(|e| match e {
            WaitError::Predicate(e) => e,
            other => ProviderError::Unavailable(format!("{} not deleted: {}", url, other)),
        })
    }

    async fn ensure_subnet(&self) -> Result<String, ProviderError> {
        let vnet_name = format!("{}-vnet", self.config.resource_group);
        let url = self.network_url("virtualNetworks", &vnet_name);
        if self.get_optional(&url).await?.is_none() {
            tracing::info!("🔵 [Azure API] creating virtual network {}", vnet_name);
            let body = json!({
                "location": self.config.location,
                "properties": {
                    "addressSpace": { "addressPrefixes": ["10.0.0.0/16"] },
                    "subnets": [{ "name": "default", "properties": { "addressPrefix": "10.0.0.0/24" } }],
                },
            });
            self.put_and_wait(&url, &body).await?;
        }
        Ok(format!(
            "{}/subnets/default",
            self.resource_id("Microsoft.Network/virtualNetworks", &vnet_name)
        ))
    }

    fn image_reference(&self, image: &str) -> Result<Value, ProviderError> {
        let parts: Vec<&str> = image.split(':').collect();
        match parts.as_slice() {
            [publisher, offer, sku, version] => Ok(json!({
                "publisher": publisher,
                "offer": offer,
                "sku": sku,
                "version": version,
            })),
            _ if image.starts_with("/subscriptions/") => Ok(json!({ "id": image })),
            _ => Err(ProviderError::InvalidSpec(format!(
                "Azure image must be publisher:offer:sku:version or a resource id, got {}",
                image
            ))),
        }
    }

    /// Private and public address of a VM, read through its NIC.
    async fn addresses(&self, vm: &Value) -> Result<(Option<String>, Option<String>), ProviderError> {
        let Some(nic_id) = vm["properties"]["networkProfile"]["networkInterfaces"][0]["id"].as_str() else {
            return Ok((None, None));
        };
        let Some(nic) = self.get_optional(&self.url(nic_id, NETWORK_API)).await? else {
            return Ok((None, None));
        };
        let ip_config = &nic["properties"]["ipConfigurations"][0]["properties"];
        let private = non_empty(ip_config["privateIPAddress"].as_str());
        let public = match ip_config["publicIPAddress"]["id"].as_str() {
            Some(ip_id) => self
                .get_optional(&self.url(ip_id, NETWORK_API))
                .await?
                .and_then(|ip| non_empty(ip["properties"]["ipAddress"].as_str())),
            None => None,
        };
        Ok((private, public))
    }

    async fn to_resource(&self, vm: &Value) -> Result<ComputeResource, ProviderError> {
        let (private_address, public_address) = self.addresses(vm).await?;
        Ok(ComputeResource {
            id: vm["id"].as_str().unwrap_or_default().to_string(),
            name: vm["name"].as_str().unwrap_or_default().to_string(),
            provider: ProviderKind::Azure,
            status: self.normalize_status(&native_status(vm)),
            machine_class: vm["properties"]["hardwareProfile"]["vmSize"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            created_at: parse_timestamp(vm["properties"]["timeCreated"].as_str()),
            private_address,
            public_address,
            zone: non_empty(vm["location"].as_str()),
        })
    }

    async fn get_vm(&self, name: &str) -> Result<Value, ProviderError> {
        let url = format!("{}&$expand=instanceView", self.vm_url(name));
        self.send("GET", &url, self.client.get(&url)).await
    }
}

#[async_trait]
impl CloudProvider for AzureProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Azure
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
            .ok_or_else(|| ProviderError::InvalidSpec("Azure needs SSH public key material".into()))?;
        let image = non_empty(spec.base_image.as_deref()).unwrap_or_else(|| self.config.default_image.clone());
        let image_reference = self.image_reference(&image)?;
        let location = self.config.location.clone();

        let subnet_id = self.ensure_subnet().await?;

        let ip_name = format!("{}-ip", spec.name);
        let ip_body = json!({
            "location": location,
            "sku": { "name": "Standard" },
            "properties": { "publicIPAllocationMethod": "Static" },
        });
        self.put_and_wait(&self.network_url("publicIPAddresses", &ip_name), &ip_body)
            .await?;

        let nsg_name = format!("{}-nsg", spec.name);
        let nsg_body = json!({
            "location": location,
            "properties": { "securityRules": [security_rule(ADMIN_PORT, FIRST_RULE_PRIORITY)] },
        });
        self.put_and_wait(&self.network_url("networkSecurityGroups", &nsg_name), &nsg_body)
            .await?;

        let nic_name = format!("{}-nic", spec.name);
        let nic_body = json!({
            "location": location,
            "properties": {
                "ipConfigurations": [{
                    "name": "ipconfig1",
                    "properties": {
                        "subnet": { "id": subnet_id },
                        "privateIPAllocationMethod": "Dynamic",
                        "publicIPAddress": { "id": self.resource_id("Microsoft.Network/publicIPAddresses", &ip_name) },
                    },
                }],
                "networkSecurityGroup": { "id": self.resource_id("Microsoft.Network/networkSecurityGroups", &nsg_name) },
            },
        });
        self.put_and_wait(&self.network_url("networkInterfaces", &nic_name), &nic_body)
            .await?;

        let admin = self.admin_username();
        let vm_body = json!({
            "location": location,
            "properties": {
                "hardwareProfile": { "vmSize": spec.machine_class },
                "storageProfile": {
                    "imageReference": image_reference,
                    "osDisk": { "name": format!("{}-osdisk", spec.name), "createOption": "FromImage" },
                },
                "osProfile": {
                    "computerName": spec.name,
                    "adminUsername": admin,
                    "linuxConfiguration": {
                        "disablePasswordAuthentication": true,
                        "ssh": { "publicKeys": [{
                            "path": format!("/home/{}/.ssh/authorized_keys", admin),
                            "keyData": public_key,
                        }] },
                    },
                },
                "networkProfile": { "networkInterfaces": [{
                    "id": self.resource_id("Microsoft.Network/networkInterfaces", &nic_name),
                    "properties": { "primary": true },
                }] },
            },
        });
        let url = self.vm_url(&spec.name);
        tracing::info!(
            "🔵 [Azure API] PUT {} - Creating VM: size={}, image={}",
            url,
            spec.machine_class,
            image
        );
        let vm = self.send("PUT", &url, self.client.put(&url).json(&vm_body)).await?;

        let mut resource = self.to_resource(&vm).await?;
        if resource.name.is_empty() {
            resource.name = spec.name.clone();
        }
        let handle = ProviderHandle::from_resource(&resource);
        tracing::info!("✅ [Azure API] VM {} accepted ({})", resource.name, resource.status);
        Ok((resource, handle))
    }

    async fn get_instance(&self, handle: &ProviderHandle) -> Result<ComputeResource, ProviderError> {
        let vm = self.get_vm(&handle.instance_name).await?;
        self.to_resource(&vm).await
    }

    async fn list_instances(&self) -> Result<Vec<ComputeResource>, ProviderError> {
        let mut url = self.url(
            &format!(
                "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines",
                self.config.subscription_id, self.config.resource_group
            ),
            COMPUTE_API,
        );
        let mut out = Vec::new();
        loop {
            let page = self.send("GET", &url, self.client.get(&url)).await?;
            for vm in page["value"].as_array().into_iter().flatten() {
                let name = vm["name"].as_str().unwrap_or_default();
                let detailed = match self.get_vm(name).await {
                    Ok(detailed) => detailed,
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e),
                };
                out.push(self.to_resource(&detailed).await?);
            }
            match page["nextLink"].as_str() {
                Some(next) if !next.is_empty() => url = next.to_string(),
                _ => break,
            }
        }
        Ok(out)
    }

    async fn manage_instance_action(
        &self,
        handle: &ProviderHandle,
        action: InstanceAction,
    ) -> Result<(), ProviderError> {
        let name = &handle.instance_name;
        let vm_id = self.resource_id("Microsoft.Compute/virtualMachines", name);
        match action {
            InstanceAction::Start => {
                let url = self.url(&format!("{}/start", vm_id), COMPUTE_API);
                self.send("POST", &url, self.client.post(&url)).await?;
            }
            InstanceAction::Stop => {
                let url = self.url(&format!("{}/powerOff", vm_id), COMPUTE_API);
                self.send("POST", &url, self.client.post(&url)).await?;
            }
            InstanceAction::Terminate => {
                let vm = self.get_optional(&self.vm_url(name)).await?;
                let disk_name = vm
                    .as_ref()
                    .and_then(|vm| non_empty(vm["properties"]["storageProfile"]["osDisk"]["name"].as_str()))
                    .unwrap_or_else(|| format!("{}-osdisk", name));

                self.delete_and_wait(&self.vm_url(name)).await?;
                let disk_url = self.url(&self.resource_id("Microsoft.Compute/disks", &disk_name), DISK_API);
                self.delete_and_wait(&disk_url).await?;
                // The NIC holds references to the IP and NSG, so it goes first.
                self.delete_and_wait(&self.network_url("networkInterfaces", &format!("{}-nic", name)))
                    .await?;
                self.delete_and_wait(&self.network_url("publicIPAddresses", &format!("{}-ip", name)))
                    .await?;
                self.delete_and_wait(&self.network_url("networkSecurityGroups", &format!("{}-nsg", name)))
                    .await?;
            }
        }
        tracing::info!("✅ [Azure API] {} {}", action, name);
        Ok(())
    }

    async fn open_ingress(&self, handle: &ProviderHandle, ports: &PortSet) -> Result<(), ProviderError> {
        let nsg_name = format!("{}-nsg", handle.instance_name);
        let nsg_url = self.network_url("networkSecurityGroups", &nsg_name);
        let nsg = self.send("GET", &nsg_url, self.client.get(&nsg_url)).await?;
        let rules: Vec<Value> = nsg["properties"]["securityRules"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let wanted = ports.with_admin();
        let missing: PortSet = wanted.iter().filter(|p| !rules_allow(&rules, *p)).collect();
        if missing.is_empty() {
            tracing::info!("[Azure API] {} already allows {}", nsg_name, wanted);
            return Ok(());
        }

        let mut priority = rules
            .iter()
            .filter_map(|r| r["properties"]["priority"].as_u64())
            .max()
            .map(|p| p + 10)
            .unwrap_or(FIRST_RULE_PRIORITY);
        for port in missing.iter() {
            if priority > MAX_RULE_PRIORITY {
                return Err(ProviderError::QuotaExceeded(format!(
                    "{} has no free rule priority for port {}",
                    nsg_name, port
                )));
            }
            let rule = security_rule(port, priority);
            let rule_id = format!(
                "{}/securityRules/{}",
                self.resource_id("Microsoft.Network/networkSecurityGroups", &nsg_name),
                rule["name"].as_str().unwrap_or_default()
            );
            let url = self.url(&rule_id, NETWORK_API);
            tracing::info!("🔵 [Azure API] PUT {} priority={}", url, priority);
            self.send(
                "PUT",
                &url,
                self.client.put(&url).json(&json!({ "properties": rule["properties"] })),
            )
            .await?;
            priority += 10;
        }
        Ok(())
    }
}

fn security_rule(port: u16, priority: u64) -> Value {
    json!({
        "name": format!("allow-tcp-{}", port),
        "properties": {
            "protocol": "Tcp",
            "sourcePortRange": "*",
            "destinationPortRange": port.to_string(),
            "sourceAddressPrefix": "*",
            "destinationAddressPrefix": "*",
            "access": "Allow",
            "priority": priority,
            "direction": "Inbound",
        },
    })
}

fn port_spec_covers(spec: &str, port: u16) -> bool {
    let spec = spec.trim();
    if spec == "*" {
        return true;
    }
    match spec.split_once('-') {
        Some((lo, hi)) => match (lo.trim().parse::<u16>(), hi.trim().parse::<u16>()) {
            (Ok(lo), Ok(hi)) => lo <= port && port <= hi,
            _ => false,
        },
        None => spec.parse::<u16>().map(|p| p == port).unwrap_or(false),
    }
}

fn rules_allow(rules: &[Value], port: u16) -> bool {
    rules.iter().any(|rule| {
        let p = &rule["properties"];
        let inbound_allow = p["direction"] == "Inbound" && p["access"] == "Allow";
        let tcp = p["protocol"] == "Tcp" || p["protocol"] == "*";
        let single = p["destinationPortRange"]
            .as_str()
            .map(|s| port_spec_covers(s, port))
            .unwrap_or(false);
        let listed = p["destinationPortRanges"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .any(|s| port_spec_covers(s, port));
        inbound_allow && tcp && (single || listed)
    })
}

/// PowerState from the instance view when present, provisioning state otherwise.
fn native_status(vm: &Value) -> String {
    vm["properties"]["instanceView"]["statuses"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|s| s["code"].as_str())
        .find(|code| code.starts_with("PowerState/"))
        .or_else(|| vm["properties"]["provisioningState"].as_str())
        .unwrap_or_default()
        .to_string()
}

fn azure_error(status: StatusCode, body: String) -> ProviderError {
    let parsed: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
    let code = parsed["error"]["code"].as_str().unwrap_or_default();
    let message = parsed["error"]["message"].as_str().unwrap_or_default();
    let detail = format!("{}: {}", code, message);
    match code {
        "AuthorizationFailed" | "InvalidAuthenticationToken" | "ExpiredAuthenticationToken"
        | "AuthenticationFailed" => ProviderError::AuthenticationFailed(detail),
        "ResourceNotFound" | "NotFound" => ProviderError::NotFound(detail),
        "SkuNotAvailable" | "AllocationFailed" | "ZonalAllocationFailed" | "RetryableError"
        | "InternalServerError" => ProviderError::Unavailable(detail),
        _ if code.contains("Quota") || (code == "OperationNotAllowed" && message.to_ascii_lowercase().contains("quota")) => {
            ProviderError::QuotaExceeded(detail)
        }
        _ if code.starts_with("Invalid")
            || code.ends_with("NotFound")
            || matches!(code, "BadRequest" | "LinkedInvalidPropertyId" | "OperationNotAllowed") =>
        {
            ProviderError::InvalidSpec(detail)
        }
        _ => classify_status("azure", status, body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_state_wins_over_provisioning_state() {
        let vm = json!({
            "properties": {
                "provisioningState": "Succeeded",
                "instanceView": { "statuses": [
                    { "code": "ProvisioningState/succeeded" },
                    { "code": "PowerState/deallocated" }
                ] }
            }
        });
        assert_eq!(native_status(&vm), "PowerState/deallocated");
        assert_eq!(
            ilef_common::normalize_status(STATUS_TABLE, &native_status(&vm)),
            NormalizedStatus::Stopped
        );

        let creating = json!({ "properties": { "provisioningState": "Creating" } });
        assert_eq!(
            ilef_common::normalize_status(STATUS_TABLE, &native_status(&creating)),
            NormalizedStatus::Pending
        );
        assert_eq!(native_status(&json!({})), "");
    }

    #[test]
    fn nsg_rule_coverage() {
        let rules = vec![
            security_rule(22, 1000),
            json!({ "properties": {
                "protocol": "*", "access": "Allow", "direction": "Inbound",
                "destinationPortRanges": ["8000-8100", "9000"]
            } }),
            json!({ "properties": {
                "protocol": "Tcp", "access": "Deny", "direction": "Inbound",
                "destinationPortRange": "80"
            } }),
        ];
        assert!(rules_allow(&rules, 22));
        assert!(rules_allow(&rules, 8080));
        assert!(rules_allow(&rules, 9000));
        assert!(!rules_allow(&rules, 80));
    }

    #[test]
    fn error_codes_map_to_typed_errors() {
        let body = |code: &str, msg: &str| json!({ "error": { "code": code, "message": msg } }).to_string();
        assert!(matches!(
            azure_error(StatusCode::CONFLICT, body("OperationNotAllowed", "Operation could not be completed as it results in exceeding approved standardDSv3Family Cores quota.")),
            ProviderError::QuotaExceeded(_)
        ));
        assert!(matches!(
            azure_error(StatusCode::BAD_REQUEST, body("InvalidParameter", "vmSize")),
            ProviderError::InvalidSpec(_)
        ));
        assert!(matches!(
            azure_error(StatusCode::FORBIDDEN, body("AuthorizationFailed", "")),
            ProviderError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            azure_error(StatusCode::NOT_FOUND, body("ResourceNotFound", "")),
            ProviderError::NotFound(_)
        ));
        assert!(matches!(
            azure_error(StatusCode::CONFLICT, body("SkuNotAvailable", "")),
            ProviderError::Unavailable(_)
        ));
    }

    #[test]
    fn image_reference_forms() {
        let provider = AzureProvider::new(AzureConfig::new(
            "t".into(),
            "c".into(),
            "s".into(),
            "sub".into(),
            "rg".into(),
            "westeurope".into(),
        ))
        .unwrap();
        let urn = provider.image_reference(DEFAULT_IMAGE).unwrap();
        assert_eq!(urn["offer"], "0001-com-ubuntu-server-jammy");
        assert_eq!(urn["version"], "latest");
        assert!(provider.image_reference("ubuntu").is_err());
    }
}
