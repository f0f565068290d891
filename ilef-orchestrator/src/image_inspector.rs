//! Derives the TCP ports a container image declares as exposed.
//!
//! Local metadata is tried first. A missing image is pulled with the primary
//! registry credentials, then with the fallback set when the primary registry
//! refuses them. Pulled images stay in the local cache.

use async_trait::async_trait;
use ilef_common::PortSet;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    /// `host[:port]`
    pub registry: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("registry refused credentials: {0}")]
    Authentication(String),
    #[error("{0}")]
    Failed(String),
    #[error("failed to run docker: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum InspectError {
    #[error("image {image} unavailable: {detail}")]
    ImageUnavailable { image: String, detail: String },
}

/// Local container engine used for image metadata.
#[async_trait]
pub trait ImageEngine: Send + Sync {
    /// Raw `ExposedPorts` keys (e.g. `8080/tcp`), or `None` when the image
    /// is not present locally.
    async fn exposed_ports(&self, image: &str) -> Result<Option<Vec<String>>, EngineError>;

    async fn login(&self, credentials: &RegistryCredentials) -> Result<(), EngineError>;

    async fn pull(&self, image: &str) -> Result<(), EngineError>;
}

pub struct ImageInspector {
    engine: Arc<dyn ImageEngine>,
    primary: Option<RegistryCredentials>,
    fallback: Option<RegistryCredentials>,
}

impl ImageInspector {
    pub fn new(
        engine: Arc<dyn ImageEngine>,
        primary: Option<RegistryCredentials>,
        fallback: Option<RegistryCredentials>,
    ) -> Self {
        Self {
            engine,
            primary,
            fallback,
        }
    }

    pub async fn get_exposed_ports(&self, image: &str) -> Result<PortSet, InspectError> {
        let unavailable = |detail: String| InspectError::ImageUnavailable {
            image: image.to_string(),
            detail,
        };

        match self.engine.exposed_ports(image).await {
            Ok(Some(keys)) => return Ok(parse_exposed_ports(&keys)),
            Ok(None) => {
                tracing::info!("🔍 [ImageInspector] {} not cached locally, pulling", image);
            }
            Err(e) => return Err(unavailable(e.to_string())),
        }

        match self.pull_with(self.primary.as_ref(), image).await {
            Ok(()) => {}
            Err(EngineError::Authentication(detail)) => {
                let Some(fallback) = self.fallback.as_ref() else {
                    return Err(unavailable(format!("primary registry refused credentials: {}", detail)));
                };
                tracing::warn!(
                    "⚠️ [ImageInspector] primary registry refused credentials for {}, trying {}",
                    image,
                    fallback.registry
                );
                self.pull_with(Some(fallback), image)
                    .await
                    .map_err(|e| unavailable(format!("primary: {}; fallback: {}", detail, e)))?;
            }
            Err(e) => return Err(unavailable(e.to_string())),
        }

        match self.engine.exposed_ports(image).await {
            Ok(Some(keys)) => Ok(parse_exposed_ports(&keys)),
            Ok(None) => Err(unavailable("image missing after pull".into())),
            Err(e) => Err(unavailable(e.to_string())),
        }
    }

    async fn pull_with(&self, credentials: Option<&RegistryCredentials>, image: &str) -> Result<(), EngineError> {
        if let Some(credentials) = credentials {
            self.engine.login(credentials).await?;
        }
        self.engine.pull(image).await
    }
}

/// TCP ports from `ExposedPorts` keys. Non-TCP and malformed entries are skipped.
pub fn parse_exposed_ports(keys: &[String]) -> PortSet {
    keys.iter()
        .filter_map(|key| {
            let (port, proto) = key.trim().split_once('/').unwrap_or((key.trim(), "tcp"));
            if !proto.eq_ignore_ascii_case("tcp") {
                return None;
            }
            match port.parse::<u16>() {
                Ok(p) if p > 0 => Some(p),
                _ => {
                    tracing::warn!("⚠️ [ImageInspector] ignoring exposed port entry '{}'", key);
                    None
                }
            }
        })
        .collect()
}

/// `docker` CLI on the orchestrator host.
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    async fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<(bool, String, String), EngineError> {
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            pipe.write_all(b"\n").await?;
        }
        let output = child.wait_with_output().await?;
        Ok((
            output.status.success(),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ))
    }
}

fn is_auth_failure(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    ["unauthorized", "denied", "authentication required", "incorrect username or password"]
        .iter()
        .any(|needle| lower.contains(needle))
}

#[async_trait]
impl ImageEngine for DockerCli {
    async fn exposed_ports(&self, image: &str) -> Result<Option<Vec<String>>, EngineError> {
        let (ok, stdout, stderr) = self
            .run(
                &["image", "inspect", "--format", "{{json .Config.ExposedPorts}}", image],
                None,
            )
            .await?;
        if !ok {
            if stderr.to_ascii_lowercase().contains("no such image") {
                return Ok(None);
            }
            return Err(EngineError::Failed(stderr.trim().to_string()));
        }
        let parsed: serde_json::Value = serde_json::from_str(stdout.trim())
            .map_err(|e| EngineError::Failed(format!("unreadable inspect output: {}", e)))?;
        Ok(Some(
            parsed
                .as_object()
                .map(|ports| ports.keys().cloned().collect())
                .unwrap_or_default(),
        ))
    }

    async fn login(&self, credentials: &RegistryCredentials) -> Result<(), EngineError> {
        tracing::info!(
            "🔐 [ImageInspector] docker login {} as {}",
            credentials.registry,
            credentials.username
        );
        let (ok, _, stderr) = self
            .run(
                &[
                    "login",
                    "--username",
                    &credentials.username,
                    "--password-stdin",
                    &credentials.registry,
                ],
                Some(&credentials.password),
            )
            .await?;
        match (ok, is_auth_failure(&stderr)) {
            (true, _) => Ok(()),
            (false, true) => Err(EngineError::Authentication(stderr.trim().to_string())),
            (false, false) => Err(EngineError::Failed(stderr.trim().to_string())),
        }
    }

    async fn pull(&self, image: &str) -> Result<(), EngineError> {
        let (ok, _, stderr) = self.run(&["pull", image], None).await?;
        match (ok, is_auth_failure(&stderr)) {
            (true, _) => Ok(()),
            (false, true) => Err(EngineError::Authentication(stderr.trim().to_string())),
            (false, false) => Err(EngineError::Failed(stderr.trim().to_string())),
        }
    }
}
