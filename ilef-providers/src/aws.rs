//! EC2 backend over the Query API (form-encoded POST, XML answers, SigV4).

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use ilef_common::waiter::{wait_until, WaitError, WaitPolicy};
use ilef_common::{
    ComputeResource, InstanceAction, NormalizedStatus, PortSet, ProviderHandle, ProviderKind,
    StatusTable, ADMIN_PORT,
};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::http::{base_url, build_client, classify_status, expect_success, non_empty, parse_timestamp};
use crate::sigv4::{self, encode};
use crate::{CloudProvider, InstanceSpec, ProviderError};

pub const DEFAULT_IMAGE_ID: &str = "ami-04b70fa74e45c3917";
const API_VERSION: &str = "2016-11-15";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";
const ANYWHERE: &str = "0.0.0.0/0";

pub const STATUS_TABLE: StatusTable = &[
    ("pending", NormalizedStatus::Pending),
    ("running", NormalizedStatus::Running),
    ("stopping", NormalizedStatus::Stopping),
    ("stopped", NormalizedStatus::Stopped),
    ("shutting-down", NormalizedStatus::Terminating),
    ("terminated", NormalizedStatus::Terminated),
];

#[derive(Debug, Clone)]
pub struct AwsConfig {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub default_image_id: String,
    /// Overrides `https://ec2.<region>.amazonaws.com`.
    pub endpoint: Option<String>,
    /// How long terminate waits before deleting the security group.
    pub cleanup_wait: WaitPolicy,
}

impl AwsConfig {
    pub fn new(access_key_id: String, secret_access_key: String, region: String) -> Self {
        Self {
            access_key_id: access_key_id.trim().to_string(),
            secret_access_key: secret_access_key.trim().to_string(),
            region: region.trim().to_string(),
            default_image_id: DEFAULT_IMAGE_ID.to_string(),
            endpoint: None,
            cleanup_wait: WaitPolicy::new(Duration::from_secs(5), Duration::from_secs(300)),
        }
    }
}

pub struct AwsProvider {
    client: Client,
    config: AwsConfig,
    endpoint: String,
    host: String,
}

impl AwsProvider {
    pub fn new(config: AwsConfig) -> Result<Self, ProviderError> {
        let endpoint = config
            .endpoint
            .as_deref()
            .map(base_url)
            .unwrap_or_else(|| format!("https://ec2.{}.amazonaws.com", config.region));
        let parsed = reqwest::Url::parse(&endpoint)
            .map_err(|e| ProviderError::InvalidSpec(format!("bad AWS endpoint {}: {}", endpoint, e)))?;
        let host = match (parsed.host_str(), parsed.port()) {
            (Some(h), Some(p)) => format!("{}:{}", h, p),
            (Some(h), None) => h.to_string(),
            (None, _) => {
                return Err(ProviderError::InvalidSpec(format!(
                    "AWS endpoint {} has no host",
                    endpoint
                )))
            }
        };
        Ok(Self {
            client: build_client()?,
            config,
            endpoint,
            host,
        })
    }

    fn security_group_name(instance_name: &str) -> String {
        format!("{}-sg", instance_name)
    }

    fn imported_key_name(instance_name: &str) -> String {
        format!("{}-key", instance_name)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        action: &str,
        params: &[(String, String)],
    ) -> Result<T, ProviderError> {
        let mut form: Vec<(&str, &str)> = vec![("Action", action), ("Version", API_VERSION)];
        form.extend(params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let body = form
            .iter()
            .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let signature = sigv4::sign(
            &sigv4::Credentials {
                access_key: &self.config.access_key_id,
                secret_key: &self.config.secret_access_key,
            },
            &self.config.region,
            "ec2",
            &sigv4::Request {
                method: "POST",
                host: &self.host,
                path: "/",
                query: &[],
                content_type: FORM_CONTENT_TYPE,
                body: body.as_bytes(),
            },
            Utc::now(),
        )?;

        let url = format!("{}/", self.endpoint);
        tracing::debug!("🔵 [AWS API] POST {} Action={}", url, action);
        let resp = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, FORM_CONTENT_TYPE)
            .header("x-amz-date", signature.amz_date)
            .header(reqwest::header::AUTHORIZATION, signature.authorization)
            .body(body)
            .send()
            .await?;
        let resp = expect_success("AWS API", action, &url, resp, ec2_error).await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;
        quick_xml::de::from_str(&text).map_err(|e| ProviderError::Api {
            provider: "aws",
            status,
            body: format!("unparsable {} response: {}", action, e),
        })
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<Ec2Instance, ProviderError> {
        let resp: DescribeInstancesResponse = self
            .call(
                "DescribeInstances",
                &[("InstanceId.1".to_string(), instance_id.to_string())],
            )
            .await?;
        resp.reservation_set
            .items
            .into_iter()
            .flat_map(|r| r.instances_set.items)
            .next()
            .ok_or_else(|| ProviderError::NotFound(format!("instance {}", instance_id)))
    }

    async fn default_vpc_id(&self) -> Result<String, ProviderError> {
        let resp: DescribeVpcsResponse = self
            .call(
                "DescribeVpcs",
                &[
                    ("Filter.1.Name".to_string(), "isDefault".to_string()),
                    ("Filter.1.Value.1".to_string(), "true".to_string()),
                ],
            )
            .await?;
        resp.vpc_set
            .items
            .into_iter()
            .next()
            .map(|v| v.vpc_id)
            .ok_or_else(|| ProviderError::InvalidSpec(format!("no default VPC in {}", self.config.region)))
    }

    async fn find_security_group(&self, group_name: &str) -> Result<Option<SecurityGroup>, ProviderError> {
        let resp: DescribeSecurityGroupsResponse = self
            .call(
                "DescribeSecurityGroups",
                &[
                    ("Filter.1.Name".to_string(), "group-name".to_string()),
                    ("Filter.1.Value.1".to_string(), group_name.to_string()),
                ],
            )
            .await?;
        Ok(resp.security_group_info.items.into_iter().next())
    }

    async fn authorize_ports(&self, group_id: &str, ports: &PortSet) -> Result<(), ProviderError> {
        if ports.is_empty() {
            return Ok(());
        }
        let mut params = vec![("GroupId".to_string(), group_id.to_string())];
        for (i, port) in ports.iter().enumerate() {
            let n = i + 1;
            params.push((format!("IpPermissions.{}.IpProtocol", n), "tcp".to_string()));
            params.push((format!("IpPermissions.{}.FromPort", n), port.to_string()));
            params.push((format!("IpPermissions.{}.ToPort", n), port.to_string()));
            params.push((format!("IpPermissions.{}.IpRanges.1.CidrIp", n), ANYWHERE.to_string()));
        }
        match self
            .call::<Acknowledged>("AuthorizeSecurityGroupIngress", &params)
            .await
        {
            Ok(_) => Ok(()),
            Err(ProviderError::Api { body, .. }) if body.contains("InvalidPermission.Duplicate") => {
                tracing::info!("[AWS API] ingress on {} already present", group_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Returns the group id and whether this call created it.
    async fn create_security_group(&self, instance_name: &str) -> Result<(String, bool), ProviderError> {
        let group_name = Self::security_group_name(instance_name);
        if let Some(existing) = self.find_security_group(&group_name).await? {
            return Ok((existing.group_id, false));
        }
        let vpc_id = self.default_vpc_id().await?;
        let created: CreateSecurityGroupResponse = self
            .call(
                "CreateSecurityGroup",
                &[
                    ("GroupName".to_string(), group_name.clone()),
                    (
                        "GroupDescription".to_string(),
                        format!("ingress for {}", instance_name),
                    ),
                    ("VpcId".to_string(), vpc_id),
                ],
            )
            .await?;
        tracing::info!("[AWS API] created security group {} ({})", group_name, created.group_id);
        let admin: PortSet = [ADMIN_PORT].into_iter().collect();
        if let Err(e) = self.authorize_ports(&created.group_id, &admin).await {
            self.delete_security_group(&created.group_id).await;
            return Err(e);
        }
        Ok((created.group_id, true))
    }

    /// Returns the key pair name and whether it was imported for this instance.
    async fn resolve_key_name(&self, spec: &InstanceSpec) -> Result<(String, bool), ProviderError> {
        if let Some(name) = non_empty(spec.admin.key_name.as_deref()) {
            return Ok((name, false));
        }
        let Some(public_key) = non_empty(spec.admin.public_key.as_deref()) else {
            return Err(ProviderError::InvalidSpec(
                "AWS needs a key pair name or public key material".into(),
            ));
        };
        let key_name = Self::imported_key_name(&spec.name);
        let material = base64::engine::general_purpose::STANDARD.encode(public_key.as_bytes());
        self.call::<Acknowledged>(
            "ImportKeyPair",
            &[
                ("KeyName".to_string(), key_name.clone()),
                ("PublicKeyMaterial".to_string(), material),
            ],
        )
        .await?;
        tracing::info!("[AWS API] imported key pair {}", key_name);
        Ok((key_name, true))
    }

    /// Best-effort removal used when a create fails half way. No instance
    /// references the group yet, so there is nothing to wait for.
    async fn delete_security_group(&self, group_id: &str) {
        match self
            .call::<Acknowledged>("DeleteSecurityGroup", &[("GroupId".to_string(), group_id.to_string())])
            .await
        {
            Ok(_) => tracing::info!("[AWS API] rolled back security group {}", group_id),
            Err(e) => tracing::warn!("⚠️ [AWS API] could not roll back security group {}: {}", group_id, e),
        }
    }

    /// Deletes the key pair imported for `instance_name`, if any.
    async fn delete_imported_key(&self, instance_name: &str) -> Result<(), ProviderError> {
        let key_name = Self::imported_key_name(instance_name);
        match self
            .call::<Acknowledged>("DeleteKeyPair", &[("KeyName".to_string(), key_name.clone())])
            .await
        {
            Ok(_) => {
                tracing::info!("[AWS API] deleted key pair {}", key_name);
                Ok(())
            }
            Err(ProviderError::InvalidSpec(detail)) if detail.starts_with("InvalidKeyPair.NotFound") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn rollback_key(&self, instance_name: &str) {
        if let Err(e) = self.delete_imported_key(instance_name).await {
            tracing::warn!("⚠️ [AWS API] could not roll back key pair for {}: {}", instance_name, e);
        }
    }

    async fn delete_security_group_after_termination(&self, handle: &ProviderHandle) -> Result<(), ProviderError> {
        let cancel = CancellationToken::new();
        let waited = wait_until(self.config.cleanup_wait, &cancel, move || async move {
            match self.describe_instance(&handle.instance_id).await {
                Ok(inst) => Ok(self.normalize_status(&inst.instance_state.name)
                    == NormalizedStatus::Terminated),
                Err(e) if e.is_not_found() => Ok(true),
                Err(ProviderError::Transport(_)) | Err(ProviderError::Unavailable(_)) => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await;
        match waited {
            Ok(()) => {}
            Err(WaitError::Predicate(e)) => return Err(e),
            Err(e) => {
                return Err(ProviderError::Unavailable(format!(
                    "instance {} not terminated, security group kept: {}",
                    handle.instance_id, e
                )))
            }
        }

        let group_name = Self::security_group_name(&handle.instance_name);
        if let Some(group) = self.find_security_group(&group_name).await? {
            self.call::<Acknowledged>(
                "DeleteSecurityGroup",
                &[("GroupId".to_string(), group.group_id.clone())],
            )
            .await?;
            tracing::info!("[AWS API] deleted security group {} ({})", group_name, group.group_id);
        }
        Ok(())
    }

    fn to_resource(&self, inst: &Ec2Instance) -> ComputeResource {
        let name = inst
            .tag_set
            .items
            .iter()
            .find(|t| t.key == "Name")
            .map(|t| t.value.clone())
            .unwrap_or_else(|| inst.instance_id.clone());
        ComputeResource {
            id: inst.instance_id.clone(),
            name,
            provider: ProviderKind::Aws,
            status: self.normalize_status(&inst.instance_state.name),
            machine_class: inst.instance_type.clone(),
            created_at: parse_timestamp(inst.launch_time.as_deref()),
            private_address: non_empty(inst.private_ip_address.as_deref()),
            public_address: non_empty(inst.ip_address.as_deref()),
            zone: inst
                .placement
                .as_ref()
                .and_then(|p| non_empty(p.availability_zone.as_deref())),
        }
    }
}

#[async_trait]
impl CloudProvider for AwsProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Aws
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
        let image = non_empty(spec.base_image.as_deref()).unwrap_or_else(|| self.config.default_image_id.clone());
        let (key_name, key_imported) = self.resolve_key_name(spec).await?;
        let (group_id, group_created) = match self.create_security_group(&spec.name).await {
            Ok(group) => group,
            Err(e) => {
                if key_imported {
                    self.rollback_key(&spec.name).await;
                }
                return Err(e);
            }
        };

        tracing::info!(
            "🔵 [AWS API] RunInstances name={} type={} image={} region={}",
            spec.name,
            spec.machine_class,
            image,
            self.config.region
        );
        let resp: Result<RunInstancesResponse, ProviderError> = self
            .call(
                "RunInstances",
                &[
                    ("ImageId".to_string(), image),
                    ("InstanceType".to_string(), spec.machine_class.clone()),
                    ("MinCount".to_string(), "1".to_string()),
                    ("MaxCount".to_string(), "1".to_string()),
                    ("KeyName".to_string(), key_name),
                    ("SecurityGroupId.1".to_string(), group_id.clone()),
                    ("TagSpecification.1.ResourceType".to_string(), "instance".to_string()),
                    ("TagSpecification.1.Tag.1.Key".to_string(), "Name".to_string()),
                    ("TagSpecification.1.Tag.1.Value".to_string(), spec.name.clone()),
                ],
            )
            .await;
        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!("❌ [AWS API] RunInstances failed for {}: {}", spec.name, e);
                if group_created {
                    self.delete_security_group(&group_id).await;
                }
                if key_imported {
                    self.rollback_key(&spec.name).await;
                }
                return Err(e);
            }
        };
        let inst = resp
            .instances_set
            .items
            .first()
            .ok_or_else(|| ProviderError::Api {
                provider: "aws",
                status: 200,
                body: "RunInstances returned no instance".into(),
            })?;

        let mut resource = self.to_resource(inst);
        resource.name = spec.name.clone();
        let handle = ProviderHandle::from_resource(&resource);
        tracing::info!("✅ [AWS API] instance {} accepted ({})", resource.id, resource.status);
        Ok((resource, handle))
    }

    async fn get_instance(&self, handle: &ProviderHandle) -> Result<ComputeResource, ProviderError> {
        let inst = self.describe_instance(&handle.instance_id).await?;
        Ok(self.to_resource(&inst))
    }

    async fn list_instances(&self) -> Result<Vec<ComputeResource>, ProviderError> {
        let resp: DescribeInstancesResponse = self.call("DescribeInstances", &[]).await?;
        Ok(resp
            .reservation_set
            .items
            .iter()
            .flat_map(|r| r.instances_set.items.iter())
            .map(|inst| self.to_resource(inst))
            .collect())
    }

    async fn manage_instance_action(
        &self,
        handle: &ProviderHandle,
        action: InstanceAction,
    ) -> Result<(), ProviderError> {
        let params = [("InstanceId.1".to_string(), handle.instance_id.clone())];
        match action {
            InstanceAction::Start => {
                self.call::<Acknowledged>("StartInstances", &params).await?;
            }
            InstanceAction::Stop => {
                self.call::<Acknowledged>("StopInstances", &params).await?;
            }
            InstanceAction::Terminate => {
                self.call::<Acknowledged>("TerminateInstances", &params).await?;
                self.delete_imported_key(&handle.instance_name).await?;
                self.delete_security_group_after_termination(handle).await?;
            }
        }
        tracing::info!("✅ [AWS API] {} {}", action, handle.instance_id);
        Ok(())
    }

    async fn open_ingress(&self, handle: &ProviderHandle, ports: &PortSet) -> Result<(), ProviderError> {
        let group_name = Self::security_group_name(&handle.instance_name);
        let group = self
            .find_security_group(&group_name)
            .await?
            .ok_or_else(|| ProviderError::NotFound(format!("security group {}", group_name)))?;

        let wanted = ports.with_admin();
        let missing: PortSet = wanted.iter().filter(|p| !group.allows(*p)).collect();
        if missing.is_empty() {
            tracing::info!("[AWS API] {} already allows {}", group_name, wanted);
            return Ok(());
        }
        tracing::info!("🔵 [AWS API] opening {} on {}", missing, group_name);
        self.authorize_ports(&group.group_id, &missing).await
    }
}

fn ec2_error(status: StatusCode, body: String) -> ProviderError {
    let code = quick_xml::de::from_str::<ErrorResponse>(&body)
        .ok()
        .and_then(|r| r.errors.error.into_iter().next());
    let Some(err) = code else {
        return classify_status("aws", status, body);
    };
    let detail = format!("{}: {}", err.code, err.message);
    let code = err.code.as_str();
    if matches!(
        code,
        "AuthFailure" | "UnauthorizedOperation" | "SignatureDoesNotMatch" | "InvalidClientTokenId"
    ) {
        ProviderError::AuthenticationFailed(detail)
    } else if code == "RequestLimitExceeded" || code.starts_with("Unavailable") || code == "InternalError" {
        ProviderError::Unavailable(detail)
    } else if code.ends_with("LimitExceeded") || code == "InsufficientInstanceCapacity" {
        ProviderError::QuotaExceeded(detail)
    } else if code.ends_with(".NotFound") && !code.starts_with("InvalidAMIID") && !code.starts_with("InvalidKeyPair") {
        ProviderError::NotFound(detail)
    } else if code.starts_with("Invalid") || code.starts_with("Missing") || code.starts_with("Unsupported") {
        if code == "InvalidPermission.Duplicate" || code == "InvalidGroup.Duplicate" {
            return ProviderError::Api {
                provider: "aws",
                status: status.as_u16(),
                body: detail,
            };
        }
        ProviderError::InvalidSpec(detail)
    } else {
        ProviderError::Api {
            provider: "aws",
            status: status.as_u16(),
            body: detail,
        }
    }
}

// --- EC2 XML shapes ---

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct ItemSet<T> {
    #[serde(rename = "item", default)]
    items: Vec<T>,
}

impl<T> Default for ItemSet<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeInstancesResponse {
    #[serde(default)]
    reservation_set: ItemSet<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Reservation {
    #[serde(default)]
    instances_set: ItemSet<Ec2Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunInstancesResponse {
    #[serde(default)]
    instances_set: ItemSet<Ec2Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ec2Instance {
    instance_id: String,
    #[serde(default)]
    instance_type: String,
    instance_state: InstanceState,
    #[serde(default)]
    private_ip_address: Option<String>,
    #[serde(default)]
    ip_address: Option<String>,
    #[serde(default)]
    launch_time: Option<String>,
    #[serde(default)]
    placement: Option<Placement>,
    #[serde(default)]
    tag_set: ItemSet<Tag>,
}

#[derive(Debug, Deserialize)]
struct InstanceState {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Placement {
    #[serde(default)]
    availability_zone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Tag {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeVpcsResponse {
    #[serde(default)]
    vpc_set: ItemSet<Vpc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Vpc {
    vpc_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeSecurityGroupsResponse {
    #[serde(default)]
    security_group_info: ItemSet<SecurityGroup>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecurityGroup {
    group_id: String,
    #[serde(default)]
    ip_permissions: ItemSet<IpPermission>,
}

impl SecurityGroup {
    fn allows(&self, port: u16) -> bool {
        let port = i32::from(port);
        self.ip_permissions.items.iter().any(|perm| {
            let covers = match (perm.from_port, perm.to_port) {
                (Some(from), Some(to)) => from <= port && port <= to,
                _ => false,
            };
            let protocol_ok = perm.ip_protocol == "tcp" || perm.ip_protocol == "-1";
            let open_world = perm.ip_ranges.items.iter().any(|r| r.cidr_ip == ANYWHERE);
            protocol_ok && open_world && (covers || perm.ip_protocol == "-1")
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpPermission {
    #[serde(default)]
    ip_protocol: String,
    #[serde(default)]
    from_port: Option<i32>,
    #[serde(default)]
    to_port: Option<i32>,
    #[serde(default)]
    ip_ranges: ItemSet<IpRange>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpRange {
    cidr_ip: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSecurityGroupResponse {
    group_id: String,
}

#[derive(Debug, Deserialize)]
struct Acknowledged {}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(rename = "Errors")]
    errors: ErrorList,
}

#[derive(Debug, Deserialize)]
struct ErrorList {
    #[serde(rename = "Error", default)]
    error: Vec<ErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ErrorItem {
    #[serde(rename = "Code")]
    code: String,
    #[serde(rename = "Message", default)]
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIBE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<DescribeInstancesResponse xmlns="http://ec2.amazonaws.com/doc/2016-11-15/">
  <requestId>8f7724cf-496f-496e-8fe3-example</requestId>
  <reservationSet>
    <item>
      <reservationId>r-1234567890abcdef0</reservationId>
      <instancesSet>
        <item>
          <instanceId>i-0598c7d356eba48d7</instanceId>
          <imageId>ami-04b70fa74e45c3917</imageId>
          <instanceState><code>16</code><name>running</name></instanceState>
          <instanceType>t3.micro</instanceType>
          <launchTime>2024-05-02T10:11:12.000Z</launchTime>
          <placement><availabilityZone>us-east-1a</availabilityZone></placement>
          <privateIpAddress>172.31.20.5</privateIpAddress>
          <ipAddress>54.10.20.30</ipAddress>
          <groupSet/>
          <tagSet>
            <item><key>Name</key><value>app-1-0-k3x9-aws</value></item>
          </tagSet>
        </item>
      </instancesSet>
    </item>
  </reservationSet>
</DescribeInstancesResponse>"#;

    #[test]
    fn parses_describe_instances() {
        let resp: DescribeInstancesResponse = quick_xml::de::from_str(DESCRIBE).unwrap();
        let inst = &resp.reservation_set.items[0].instances_set.items[0];
        assert_eq!(inst.instance_id, "i-0598c7d356eba48d7");
        assert_eq!(inst.instance_state.name, "running");
        assert_eq!(inst.ip_address.as_deref(), Some("54.10.20.30"));
        assert_eq!(inst.tag_set.items[0].value, "app-1-0-k3x9-aws");
    }

    #[test]
    fn pending_instance_without_addresses_parses() {
        let xml = r#"<RunInstancesResponse>
  <reservationId>r-1</reservationId>
  <instancesSet>
    <item>
      <instanceId>i-1</instanceId>
      <instanceState><code>0</code><name>pending</name></instanceState>
      <instanceType>t3.micro</instanceType>
    </item>
  </instancesSet>
</RunInstancesResponse>"#;
        let resp: RunInstancesResponse = quick_xml::de::from_str(xml).unwrap();
        let inst = &resp.instances_set.items[0];
        assert_eq!(inst.private_ip_address, None);
        assert!(inst.tag_set.items.is_empty());
    }

    #[test]
    fn error_codes_map_to_typed_errors() {
        let body = |code: &str| {
            format!(
                "<Response><Errors><Error><Code>{}</Code><Message>m</Message></Error></Errors><RequestID>x</RequestID></Response>",
                code
            )
        };
        assert!(matches!(
            ec2_error(StatusCode::BAD_REQUEST, body("InstanceLimitExceeded")),
            ProviderError::QuotaExceeded(_)
        ));
        assert!(matches!(
            ec2_error(StatusCode::BAD_REQUEST, body("VcpuLimitExceeded")),
            ProviderError::QuotaExceeded(_)
        ));
        assert!(matches!(
            ec2_error(StatusCode::BAD_REQUEST, body("InvalidAMIID.NotFound")),
            ProviderError::InvalidSpec(_)
        ));
        assert!(matches!(
            ec2_error(StatusCode::BAD_REQUEST, body("InvalidInstanceID.NotFound")),
            ProviderError::NotFound(_)
        ));
        assert!(matches!(
            ec2_error(StatusCode::UNAUTHORIZED, body("AuthFailure")),
            ProviderError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            ec2_error(StatusCode::SERVICE_UNAVAILABLE, body("RequestLimitExceeded")),
            ProviderError::Unavailable(_)
        ));
        assert!(matches!(
            ec2_error(StatusCode::BAD_GATEWAY, "<html>gateway</html>".into()),
            ProviderError::Unavailable(_)
        ));
    }

    #[test]
    fn security_group_port_coverage() {
        let xml = r#"<item>
  <groupId>sg-1</groupId>
  <ipPermissions>
    <item>
      <ipProtocol>tcp</ipProtocol><fromPort>22</fromPort><toPort>22</toPort>
      <ipRanges><item><cidrIp>0.0.0.0/0</cidrIp></item></ipRanges>
    </item>
    <item>
      <ipProtocol>tcp</ipProtocol><fromPort>8000</fromPort><toPort>8100</toPort>
      <ipRanges><item><cidrIp>10.0.0.0/8</cidrIp></item></ipRanges>
    </item>
  </ipPermissions>
</item>"#;
        let group: SecurityGroup = quick_xml::de::from_str(xml).unwrap();
        assert!(group.allows(22));
        assert!(!group.allows(8080));
        assert!(!group.allows(80));
    }

    #[test]
    fn status_table_is_total() {
        for native in ["pending", "running", "stopping", "stopped", "shutting-down", "terminated"] {
            assert_ne!(ilef_common::normalize_status(STATUS_TABLE, native), NormalizedStatus::Unknown);
        }
        assert_eq!(
            ilef_common::normalize_status(STATUS_TABLE, "hibernating"),
            NormalizedStatus::Unknown
        );
    }
}
