//! Hetzner Cloud backend. Plain REST with bearer auth; actions are
//! fire-and-forget, so nothing here waits except terminate's cleanup.

use async_trait::async_trait;
use ilef_common::waiter::{wait_until, WaitError, WaitPolicy};
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

pub const DEFAULT_IMAGE: &str = "ubuntu-22.04";
const DEFAULT_ENDPOINT: &str = "https://api.hetzner.cloud/v1";

pub const STATUS_TABLE: StatusTable = &[
    ("initializing", NormalizedStatus::Pending),
    ("starting", NormalizedStatus::Pending),
    ("migrating", NormalizedStatus::Pending),
    ("rebuilding", NormalizedStatus::Pending),
    ("running", NormalizedStatus::Running),
    ("stopping", NormalizedStatus::Stopping),
    ("off", NormalizedStatus::Stopped),
    ("deleting", NormalizedStatus::Terminating),
];

#[derive(Debug, Clone)]
pub struct HetznerConfig {
    pub api_token: String,
    /// e.g. `fsn1`; Hetzner picks one when unset.
    pub location: Option<String>,
    pub default_image: String,
    pub endpoint: Option<String>,
    pub cleanup_wait: WaitPolicy,
}

impl HetznerConfig {
    pub fn new(api_token: String) -> Self {
        Self {
            api_token: api_token.trim().to_string(),
            location: None,
            default_image: DEFAULT_IMAGE.to_string(),
            endpoint: None,
            cleanup_wait: WaitPolicy::new(Duration::from_secs(3), Duration::from_secs(180)),
        }
    }
}

pub struct HetznerProvider {
    client: Client,
    config: HetznerConfig,
    base: String,
}

impl HetznerProvider {
    pub fn new(config: HetznerConfig) -> Result<Self, ProviderError> {
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

    fn firewall_name(server_id: &str) -> String {
        format!("firewall-{}", server_id)
    }

    fn imported_key_name(server_name: &str) -> String {
        format!("{}-key", server_name)
    }

    async fn send(&self, method: &str, url: &str, req: RequestBuilder) -> Result<Value, ProviderError> {
        tracing::debug!("🔵 [Hetzner API] {} {}", method, url);
        let resp = req.bearer_auth(&self.config.api_token).send().await?;
        let resp = expect_success("Hetzner API", method, url, resp, hetzner_error).await?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ProviderError::Api {
            provider: "hetzner",
            status: 200,
            body: format!("unparsable response from {}: {}", url, e),
        })
    }

    /// Key reference for the create body, plus the id of a key uploaded for
    /// this server alone.
    async fn ssh_key_ref(&self, spec: &InstanceSpec) -> Result<(Option<Value>, Option<String>), ProviderError> {
        if let Some(name) = non_empty(spec.admin.key_name.as_deref()) {
            return Ok((Some(json!(name)), None));
        }
        let Some(public_key) = non_empty(spec.admin.public_key.as_deref()) else {
            return Ok((None, None));
        };
        let url = format!("{}/ssh_keys", self.base);
        let body = json!({ "name": Self::imported_key_name(&spec.name), "public_key": public_key });
        let created = self.send("POST", &url, self.client.post(&url).json(&body)).await?;
        let id = created["ssh_key"]["id"].clone();
        Ok((Some(id.clone()), Some(id_string(&id))))
    }

    async fn delete_ssh_key(&self, key_id: &str) -> Result<(), ProviderError> {
        let url = format!("{}/ssh_keys/{}", self.base, key_id);
        match self.send("DELETE", &url, self.client.delete(&url)).await {
            Ok(_) => {
                tracing::info!("[Hetzner API] deleted ssh key {}", key_id);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Deletes the key uploaded for `server_name`, if one exists.
    async fn delete_imported_key(&self, server_name: &str) -> Result<(), ProviderError> {
        let url = format!("{}/ssh_keys", self.base);
        let name = Self::imported_key_name(server_name);
        let found = self
            .send("GET", &url, self.client.get(&url).query(&[("name", name.as_str())]))
            .await?;
        let ids: Vec<String> = found["ssh_keys"]
            .as_array()
            .map(|keys| {
                keys.iter()
                    .filter(|k| k["name"] == name.as_str())
                    .map(|k| id_string(&k["id"]))
                    .collect()
            })
            .unwrap_or_default();
        for id in ids {
            self.delete_ssh_key(&id).await?;
        }
        Ok(())
    }

    async fn find_firewall(&self, server_id: &str) -> Result<Option<Value>, ProviderError> {
        let url = format!("{}/firewalls", self.base);
        let name = Self::firewall_name(server_id);
        let found = self
            .send("GET", &url, self.client.get(&url).query(&[("name", name.as_str())]))
            .await?;
        Ok(found["firewalls"]
            .as_array()
            .and_then(|list| list.iter().find(|fw| fw["name"] == name.as_str()).cloned()))
    }

    fn to_resource(&self, server: &Value) -> ComputeResource {
        ComputeResource {
            id: id_string(&server["id"]),
            name: server["name"].as_str().unwrap_or_default().to_string(),
            provider: ProviderKind::Hetzner,
            status: self.normalize_status(server["status"].as_str().unwrap_or_default()),
            machine_class: server["server_type"]["name"].as_str().unwrap_or_default().to_string(),
            created_at: parse_timestamp(server["created"].as_str()),
            private_address: non_empty(server["private_net"][0]["ip"].as_str()),
            public_address: non_empty(server["public_net"]["ipv4"]["ip"].as_str()),
            zone: non_empty(server["datacenter"]["location"]["name"].as_str())
                .or_else(|| non_empty(server["datacenter"]["name"].as_str())),
        }
    }

    async fn delete_firewall_after_server(&self, handle: &ProviderHandle) -> Result<(), ProviderError> {
        let server_url = format!("{}/servers/{}", self.base, handle.instance_id);
        let cancel = CancellationToken::new();
        let gone = wait_until(self.config.cleanup_wait, &cancel, move || {
            let url = server_url.clone();
            async move {
                match self.send("GET", &url, self.client.get(&url)).await {
                    Ok(_) => Ok(false),
                    Err(e) if e.is_not_found() => Ok(true),
                    Err(ProviderError::Transport(_)) | Err(ProviderError::Unavailable(_)) => Ok(false),
                    Err(e) => Err(e),
                }
            }
        })
        .await;
        match gone {
            Ok(()) => {}
            Err(WaitError::Predicate(e)) => return Err(e),
            Err(e) => {
                return Err(ProviderError::Unavailable(format!(
                    "server {} still present, firewall kept: {}",
                    handle.instance_id, e
                )))
            }
        }

        if let Some(fw) = self.find_firewall(&handle.instance_id).await? {
            let url = format!("{}/firewalls/{}", self.base, id_string(&fw["id"]));
            self.send("DELETE", &url, self.client.delete(&url)).await?;
            tracing::info!("[Hetzner API] deleted {}", Self::firewall_name(&handle.instance_id));
        }
        Ok(())
    }
}

#[async_trait]
impl CloudProvider for HetznerProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Hetzner
    }

    fn admin_username(&self) -> &str {
        "root"
    }

    fn status_table(&self) -> StatusTable {
        STATUS_TABLE
    }

    async fn create_instance(
        &self,
        spec: &InstanceSpec,
    ) -> Result<(ComputeResource, ProviderHandle), ProviderError> {
        spec.validate()?;
        let image = non_empty(spec.base_image.as_deref()).unwrap_or_else(|| self.config.default_image.clone());
        let mut body = json!({
            "name": spec.name,
            "server_type": spec.machine_class,
            "image": image,
        });
        if let Some(location) = non_empty(self.config.location.as_deref()) {
            body["location"] = json!(location);
        }
        let (key, uploaded_key) = self.ssh_key_ref(spec).await?;
        if let Some(key) = key {
            body["ssh_keys"] = json!([key]);
        }

        let url = format!("{}/servers", self.base);
        tracing::info!(
            "🔵 [Hetzner API] POST {} - Creating server: name={}, type={}, image={}",
            url,
            spec.name,
            spec.machine_class,
            image
        );
        let created = match self.send("POST", &url, self.client.post(&url).json(&body)).await {
            Ok(created) => created,
            Err(e) => {
                tracing::error!("❌ [Hetzner API] server create failed for {}: {}", spec.name, e);
                if let Some(key_id) = uploaded_key {
                    if let Err(cleanup) = self.delete_ssh_key(&key_id).await {
                        tracing::warn!("⚠️ [Hetzner API] could not roll back ssh key {}: {}", key_id, cleanup);
                    }
                }
                return Err(e);
            }
        };
        let server = &created["server"];
        if server.is_null() {
            return Err(ProviderError::Api {
                provider: "hetzner",
                status: 201,
                body: "no server in create response".into(),
            });
        }
        let resource = self.to_resource(server);
        let handle = ProviderHandle::from_resource(&resource);
        tracing::info!("✅ [Hetzner API] server {} accepted ({})", resource.id, resource.status);
        Ok((resource, handle))
    }

    async fn get_instance(&self, handle: &ProviderHandle) -> Result<ComputeResource, ProviderError> {
        let url = format!("{}/servers/{}", self.base, handle.instance_id);
        let found = self.send("GET", &url, self.client.get(&url)).await?;
        Ok(self.to_resource(&found["server"]))
    }

    async fn list_instances(&self) -> Result<Vec<ComputeResource>, ProviderError> {
        let url = format!("{}/servers", self.base);
        let mut out = Vec::new();
        let mut page: u64 = 1;
        loop {
            let page_str = page.to_string();
            let listed = self
                .send(
                    "GET",
                    &url,
                    self.client
                        .get(&url)
                        .query(&[("page", page_str.as_str()), ("per_page", "50")]),
                )
                .await?;
            if let Some(servers) = listed["servers"].as_array() {
                out.extend(servers.iter().map(|s| self.to_resource(s)));
            }
            match listed["meta"]["pagination"]["next_page"].as_u64() {
                Some(next) if next > page => page = next,
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
        let server_url = format!("{}/servers/{}", self.base, handle.instance_id);
        match action {
            InstanceAction::Start => {
                let url = format!("{}/actions/poweron", server_url);
                self.send("POST", &url, self.client.post(&url)).await?;
            }
            InstanceAction::Stop => {
                let url = format!("{}/actions/poweroff", server_url);
                self.send("POST", &url, self.client.post(&url)).await?;
            }
            InstanceAction::Terminate => {
                self.send("DELETE", &server_url, self.client.delete(&server_url))
                    .await?;
                self.delete_imported_key(&handle.instance_name).await?;
                self.delete_firewall_after_server(handle).await?;
            }
        }
        tracing::info!("✅ [Hetzner API] {} server {}", action, handle.instance_id);
        Ok(())
    }

    async fn open_ingress(&self, handle: &ProviderHandle, ports: &PortSet) -> Result<(), ProviderError> {
        let wanted = ports.with_admin();
        let name = Self::firewall_name(&handle.instance_id);

        let Some(fw) = self.find_firewall(&handle.instance_id).await? else {
            let url = format!("{}/firewalls", self.base);
            let server_id: Value = handle
                .instance_id
                .parse::<u64>()
                .map(|id| json!(id))
                .unwrap_or_else(|_| json!(handle.instance_id));
            let body = json!({
                "name": name,
                "apply_to": [{ "type": "server", "server": { "id": server_id } }],
                "rules": wanted.iter().map(inbound_rule).collect::<Vec<_>>(),
            });
            tracing::info!("🔵 [Hetzner API] POST {} - creating {} with {}", url, name, wanted);
            self.send("POST", &url, self.client.post(&url).json(&body)).await?;
            return Ok(());
        };

        let existing: Vec<Value> = fw["rules"].as_array().cloned().unwrap_or_default();
        let covered = open_tcp_ports(&existing);
        let missing: PortSet = wanted
            .iter()
            .filter(|p| !covered.iter().any(|(lo, hi)| lo <= p && p <= hi))
            .collect();
        if missing.is_empty() {
            tracing::info!("[Hetzner API] {} already allows {}", name, wanted);
            return Ok(());
        }

        let mut rules = existing;
        rules.extend(missing.iter().map(inbound_rule));
        let url = format!("{}/firewalls/{}/actions/set_rules", self.base, id_string(&fw["id"]));
        tracing::info!("🔵 [Hetzner API] POST {} - adding {}", url, missing);
        self.send("POST", &url, self.client.post(&url).json(&json!({ "rules": rules })))
            .await?;
        Ok(())
    }
}

const ANYWHERE_V4: &str = "0.0.0.0/0";

fn inbound_rule(port: u16) -> Value {
    json!({
        "direction": "in",
        "protocol": "tcp",
        "port": port.to_string(),
        "source_ips": [ANYWHERE_V4, "::/0"],
    })
}

/// Inbound TCP port ranges a firewall opens to every IPv4 source.
fn open_tcp_ports(rules: &[Value]) -> Vec<(u16, u16)> {
    rules
        .iter()
        .filter(|r| r["direction"] == "in" && r["protocol"] == "tcp")
        .filter(|r| {
            r["source_ips"]
                .as_array()
                .is_some_and(|ips| ips.iter().any(|ip| ip == ANYWHERE_V4))
        })
        .filter_map(|r| {
            let raw = r["port"].as_str()?;
            match raw.split_once('-') {
                Some((lo, hi)) => lo.trim().parse().ok().zip(hi.trim().parse().ok()),
                None => raw.trim().parse().ok().map(|p| (p, p)),
            }
        })
        .collect()
}

fn id_string(v: &Value) -> String {
    match v {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => String::new(),
    }
}

fn hetzner_error(status: StatusCode, body: String) -> ProviderError {
    let parsed: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
    let code = parsed["error"]["code"].as_str().unwrap_or_default();
    let detail = format!(
        "{}: {}",
        code,
        parsed["error"]["message"].as_str().unwrap_or(&body)
    );
    match code {
        "resource_limit_exceeded" => ProviderError::QuotaExceeded(detail),
        "invalid_input" | "json_error" | "uniqueness_error" | "unsupported_error" => {
            ProviderError::InvalidSpec(detail)
        }
        "unauthorized" | "forbidden" | "token_readonly" => ProviderError::AuthenticationFailed(detail),
        "not_found" => ProviderError::NotFound(detail),
        "rate_limit_exceeded" | "resource_unavailable" | "server_error" | "service_error"
        | "maintenance" | "locked" | "conflict" | "placement_error" => ProviderError::Unavailable(detail),
        _ => classify_status("hetzner", status, body),
    }
}
