//! Remote command execution over SSH and the typed runtime bootstrap steps.

use async_trait::async_trait;
use base64::Engine;
use ilef_common::waiter::{wait_until, WaitError, WaitPolicy};
use ilef_common::{BootstrapCommandResult, FailureReason, PortSet, WORKLOAD_HOST_PORT};
use std::fmt;
use std::io::Write;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("session error: {0}")]
    SessionError(String),
}

impl BootstrapError {
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            BootstrapError::AuthenticationFailed(_) => FailureReason::AuthenticationFailed,
            BootstrapError::Unreachable(_) | BootstrapError::SessionError(_) => {
                FailureReason::UnreachableTimeout
            }
        }
    }

    /// Errors of the channel itself, after which further commands are pointless.
    fn is_channel_failure(&self) -> bool {
        matches!(
            self,
            BootstrapError::AuthenticationFailed(_) | BootstrapError::Unreachable(_)
        )
    }
}

/// Private key material for the administrative user.
#[derive(Clone)]
pub struct SshCredential {
    pem: String,
}

impl SshCredential {
    /// Accepts a PEM/OpenSSH key as-is or base64 of one; told apart by the key header.
    pub fn from_material(raw: &str) -> Result<Self, BootstrapError> {
        let trimmed = raw.trim();
        if trimmed.starts_with("-----BEGIN") {
            return Ok(Self {
                pem: normalize_pem(trimmed),
            });
        }
        let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(compact.as_bytes())
            .map_err(|_| BootstrapError::AuthenticationFailed("SSH key is neither PEM nor base64".into()))?;
        let text = String::from_utf8(decoded)
            .map_err(|_| BootstrapError::AuthenticationFailed("decoded SSH key is not text".into()))?;
        if !text.trim_start().starts_with("-----BEGIN") {
            return Err(BootstrapError::AuthenticationFailed(
                "decoded SSH key has no PEM header".into(),
            ));
        }
        Ok(Self {
            pem: normalize_pem(text.trim()),
        })
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }
}

impl fmt::Debug for SshCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SshCredential(<redacted>)")
    }
}

// ssh refuses keys without a trailing newline.
fn normalize_pem(pem: &str) -> String {
    format!("{}\n", pem.replace("\r\n", "\n").trim_end())
}

/// One shell command, with optional stdin and a display form safe for logs.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub script: String,
    pub stdin: Option<String>,
    pub display: String,
}

impl RemoteCommand {
    pub fn new(script: impl Into<String>) -> Self {
        let script = script.into();
        Self {
            display: script.clone(),
            script,
            stdin: None,
        }
    }

    pub fn with_secret_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

impl fmt::Debug for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCommand")
            .field("display", &self.display)
            .field("stdin", &self.stdin.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[async_trait]
pub trait RemoteSession: Send {
    async fn exec(&mut self, command: &RemoteCommand) -> Result<CommandOutput, BootstrapError>;
}

#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(
        &self,
        address: &str,
        user: &str,
        credential: &SshCredential,
    ) -> Result<Box<dyn RemoteSession>, BootstrapError>;
}

/// Run `steps` in order over one session. Command-level failures are
/// recorded and the sequence continues; only a broken channel aborts.
pub async fn bootstrap(
    connector: &dyn RemoteConnector,
    address: &str,
    user: &str,
    credential: &SshCredential,
    steps: &[BootstrapStep],
) -> Result<Vec<BootstrapCommandResult>, BootstrapError> {
    let mut session = connector.connect(address, user, credential).await?;
    let mut results = Vec::with_capacity(steps.len());
    for step in steps {
        let command = step.to_command();
        tracing::info!("🔧 [Bootstrap] {} on {}: {}", step.label(), address, command.display);
        let result = match session.exec(&command).await {
            Ok(out) => BootstrapCommandResult::new(
                step.label(),
                command.display.clone(),
                out.stdout,
                out.stderr,
                out.exit_code,
            ),
            Err(e) if e.is_channel_failure() => {
                tracing::error!("❌ [Bootstrap] {} on {} aborted: {}", step.label(), address, e);
                return Err(e);
            }
            Err(e) => BootstrapCommandResult::new(
                step.label(),
                command.display.clone(),
                String::new(),
                e.to_string(),
                None,
            ),
        };
        if result.succeeded {
            tracing::info!("✅ [Bootstrap] {} done", step.label());
        } else {
            tracing::warn!(
                "⚠️ [Bootstrap] {} reported errors (exit={:?}): {}",
                step.label(),
                result.exit_code,
                tail(&result.stderr, 500)
            );
        }
        results.push(result);
    }
    Ok(results)
}

/// Poll until a trivial command goes through. Every error counts as "not yet",
/// including refused keys while cloud-init is still installing them.
pub async fn wait_for_reachable(
    connector: &dyn RemoteConnector,
    address: &str,
    user: &str,
    credential: &SshCredential,
    policy: WaitPolicy,
    cancel: &CancellationToken,
) -> Result<(), WaitError<BootstrapError>> {
    let last_error: Mutex<Option<String>> = Mutex::new(None);
    let probe = RemoteCommand::new("echo ready");
    let outcome = wait_until(policy, cancel, || {
        let last_error = &last_error;
        let probe = &probe;
        async move {
            let attempt = async {
                let mut session = connector.connect(address, user, credential).await?;
                session.exec(probe).await
            };
            match attempt.await {
                Ok(_) => Ok::<bool, BootstrapError>(true),
                Err(e) => {
                    tracing::info!("⏳ [Bootstrap] {} not reachable yet: {}", address, e);
                    *last_error.lock().unwrap_or_else(|p| p.into_inner()) = Some(e.to_string());
                    Ok(false)
                }
            }
        }
    })
    .await;
    if let Err(WaitError::Timeout { attempts, .. }) = &outcome {
        let last = last_error.lock().unwrap_or_else(|p| p.into_inner()).clone();
        tracing::error!(
            "❌ [Bootstrap] {} still unreachable after {} attempts (last error: {})",
            address,
            attempts,
            last.as_deref().unwrap_or("none")
        );
    }
    outcome
}

fn tail(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        return s.trim().to_string();
    }
    s.chars().skip(count - max_chars).collect::<String>().trim().to_string()
}

// --- typed steps ---

/// Single-quote for POSIX sh.
pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapStep {
    UpdatePackageIndex,
    InstallRuntime,
    StartRuntime,
    GrantRuntimeAccess { user: String },
    TrustInsecureRegistry { registry: String },
    RegistryLogin {
        registry: String,
        username: String,
        password: String,
    },
    RunContainer {
        name: String,
        image: String,
        ports: PortSet,
    },
    ListRunningContainers,
}

impl BootstrapStep {
    pub fn label(&self) -> &'static str {
        match self {
            BootstrapStep::UpdatePackageIndex => "update_package_index",
            BootstrapStep::InstallRuntime => "install_runtime",
            BootstrapStep::StartRuntime => "start_runtime",
            BootstrapStep::GrantRuntimeAccess { .. } => "grant_runtime_access",
            BootstrapStep::TrustInsecureRegistry { .. } => "trust_insecure_registry",
            BootstrapStep::RegistryLogin { .. } => "registry_login",
            BootstrapStep::RunContainer { .. } => "run_container",
            BootstrapStep::ListRunningContainers => "list_running_containers",
        }
    }

    pub fn to_command(&self) -> RemoteCommand {
        match self {
            BootstrapStep::UpdatePackageIndex => RemoteCommand::new("sudo apt-get update -y"),
            BootstrapStep::InstallRuntime => RemoteCommand::new(
                "sudo DEBIAN_FRONTEND=noninteractive apt-get install -y docker.io",
            ),
            BootstrapStep::StartRuntime => RemoteCommand::new("sudo systemctl start docker"),
            BootstrapStep::GrantRuntimeAccess { user } => {
                RemoteCommand::new(format!("sudo usermod -a -G docker {}", sh_quote(user)))
            }
            BootstrapStep::TrustInsecureRegistry { registry } => {
                let daemon = serde_json::json!({ "insecure-registries": [registry] }).to_string();
                RemoteCommand::new(format!(
                    "sudo mkdir -p /etc/docker && echo {} | sudo tee /etc/docker/daemon.json && sudo systemctl restart docker",
                    sh_quote(&daemon)
                ))
            }
            BootstrapStep::RegistryLogin {
                registry,
                username,
                password,
            } => RemoteCommand::new(format!(
                "sudo docker login -u {} --password-stdin {}",
                sh_quote(username),
                sh_quote(registry)
            ))
            .with_secret_stdin(format!("{}\n", password)),
            BootstrapStep::RunContainer { name, image, ports } => {
                let mut script = format!("sudo docker run -d --name {}", sh_quote(name));
                for mapping in port_mappings(ports) {
                    script.push_str(" -p ");
                    script.push_str(&mapping);
                }
                script.push(' ');
                script.push_str(&sh_quote(image));
                RemoteCommand::new(script)
            }
            BootstrapStep::ListRunningContainers => {
                RemoteCommand::new("sudo docker ps --format '{{.Names}}'")
            }
        }
    }
}

/// Host:container mappings, one per exposed port. Only one container port
/// can own host port 80: the image's own port 80 when it exposes one, else
/// the lowest port. The rest keep their number on the host.
pub fn port_mappings(ports: &PortSet) -> Vec<String> {
    let primary = if ports.contains(WORKLOAD_HOST_PORT) {
        Some(WORKLOAD_HOST_PORT)
    } else {
        ports.iter().next()
    };
    ports
        .iter()
        .map(|port| {
            let host = if Some(port) == primary { WORKLOAD_HOST_PORT } else { port };
            format!("{}:{}", host, port)
        })
        .collect()
}

/// Registry the runtime bootstrap configures on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeRegistry {
    /// `host[:port]`
    pub address: String,
    pub insecure: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Runtime install sequence for `user`, in execution order.
pub fn runtime_plan(user: &str, registry: Option<&RuntimeRegistry>) -> Vec<BootstrapStep> {
    let mut steps = vec![
        BootstrapStep::UpdatePackageIndex,
        BootstrapStep::InstallRuntime,
        BootstrapStep::StartRuntime,
        BootstrapStep::GrantRuntimeAccess {
            user: user.to_string(),
        },
    ];
    if let Some(registry) = registry {
        if registry.insecure {
            steps.push(BootstrapStep::TrustInsecureRegistry {
                registry: registry.address.clone(),
            });
        }
        if let (Some(username), Some(password)) = (&registry.username, &registry.password) {
            steps.push(BootstrapStep::RegistryLogin {
                registry: registry.address.clone(),
                username: username.clone(),
                password: password.clone(),
            });
        }
    }
    steps
}

// --- ssh CLI ---

pub struct SshCliConnector {
    command_timeout: Duration,
    connect_timeout_s: u64,
}

impl SshCliConnector {
    pub fn new(command_timeout: Duration) -> Self {
        Self {
            command_timeout,
            connect_timeout_s: 10,
        }
    }
}

#[async_trait]
impl RemoteConnector for SshCliConnector {
    async fn connect(
        &self,
        address: &str,
        user: &str,
        credential: &SshCredential,
    ) -> Result<Box<dyn RemoteSession>, BootstrapError> {
        // tempfile creates the key with 0600 on unix, which ssh requires.
        let mut key_file = tempfile::NamedTempFile::new()
            .map_err(|e| BootstrapError::SessionError(format!("cannot stage key: {}", e)))?;
        key_file
            .write_all(credential.pem().as_bytes())
            .and_then(|_| key_file.flush())
            .map_err(|e| BootstrapError::SessionError(format!("cannot stage key: {}", e)))?;
        let clean = address.split('/').next().unwrap_or(address).trim();
        Ok(Box::new(SshCliSession {
            target: format!("{}@{}", user, clean),
            key_file,
            command_timeout: self.command_timeout,
            connect_timeout_s: self.connect_timeout_s,
        }))
    }
}

struct SshCliSession {
    target: String,
    key_file: tempfile::NamedTempFile,
    command_timeout: Duration,
    connect_timeout_s: u64,
}

#[async_trait]
impl RemoteSession for SshCliSession {
    async fn exec(&mut self, command: &RemoteCommand) -> Result<CommandOutput, BootstrapError> {
        let mut child = Command::new("ssh")
            .arg("-i")
            .arg(self.key_file.path())
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_s))
            .arg(&self.target)
            .arg(&command.script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BootstrapError::SessionError(format!("ssh spawn failed: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Some(input) = &command.stdin {
                stdin
                    .write_all(input.as_bytes())
                    .await
                    .map_err(|e| BootstrapError::SessionError(format!("ssh stdin: {}", e)))?;
            }
        }

        let output = match tokio::time::timeout(self.command_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(BootstrapError::SessionError(format!("ssh wait failed: {}", e))),
            Err(_) => {
                return Err(BootstrapError::SessionError(format!(
                    "command timed out after {}s",
                    self.command_timeout.as_secs()
                )))
            }
        };
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code();

        // 255 is ssh's own failure, not the remote command's.
        if exit_code == Some(255) {
            return Err(classify_ssh_failure(&stderr));
        }
        Ok(CommandOutput {
            stdout,
            stderr: strip_ssh_noise(&stderr),
            exit_code,
        })
    }
}

fn classify_ssh_failure(stderr: &str) -> BootstrapError {
    let lower = stderr.to_ascii_lowercase();
    let detail = stderr.trim().to_string();
    if lower.contains("permission denied") || lower.contains("too many authentication failures") {
        BootstrapError::AuthenticationFailed(detail)
    } else if [
        "connection refused",
        "timed out",
        "no route to host",
        "could not resolve",
        "network is unreachable",
        "connection closed",
        "connection reset",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
    {
        BootstrapError::Unreachable(detail)
    } else {
        BootstrapError::SessionError(detail)
    }
}

/// Drop the host-key warning that `UserKnownHostsFile=/dev/null` triggers on every call.
fn strip_ssh_noise(stderr: &str) -> String {
    stderr
        .lines()
        .filter(|line| !line.starts_with("Warning: Permanently added"))
        .collect::<Vec<_>>()
        .join("\n")
}
