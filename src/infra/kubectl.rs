//! Cluster control plane operations, backed by `kubectl`
//!
//! Every invocation passes the cluster kubeconfig explicitly. Readiness
//! waits are bounded by the timeout the caller supplies.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{run_command, InfraError};

/// Upstream Argo CD install kustomization
pub const GITOPS_CONTROLLER_SOURCE: &str =
    "https://github.com/argoproj/argo-cd//manifests/cluster-install?ref=v2.9.3";
pub const GITOPS_NAMESPACE: &str = "argocd";

pub const VAULT_NAMESPACE: &str = "vault";
pub const VAULT_POD: &str = "vault-0";
pub const VAULT_PORT: u16 = 8200;
/// Secret holding the vault root token and unseal key
pub const VAULT_UNSEAL_SECRET: &str = "vault-unseal-secret";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const PORT_FORWARD_READY_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// SBIO: Pure data structures
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "deployment",
            WorkloadKind::StatefulSet => "statefulset",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named workload found in the cluster
#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    pub kind: WorkloadKind,
    pub name: String,
    pub namespace: String,
}

/// Opaque secret to create during bootstrap
#[derive(Clone, PartialEq)]
pub struct SecretSpec {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub data: BTreeMap<String, String>,
}

impl fmt::Debug for SecretSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretSpec")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("labels", &self.labels)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SecretSpec {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels: BTreeMap::new(),
            data: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Pod port to forward to localhost
#[derive(Debug, Clone, PartialEq)]
pub struct PortForwardTarget {
    pub namespace: String,
    pub pod: String,
    pub local_port: u16,
    pub remote_port: u16,
}

impl PortForwardTarget {
    pub fn vault() -> Self {
        Self {
            namespace: VAULT_NAMESPACE.to_string(),
            pod: VAULT_POD.to_string(),
            local_port: VAULT_PORT,
            remote_port: VAULT_PORT,
        }
    }

    pub fn local_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.local_port)
    }
}

/// Output of `vault operator init -format=json`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VaultInit {
    pub root_token: String,
    #[serde(rename = "unseal_keys_b64")]
    pub unseal_keys: Vec<String>,
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

pub fn namespace_manifest(name: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": name }
    })
}

pub fn secret_manifest(spec: &SecretSpec) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": "Opaque",
        "metadata": {
            "name": spec.name,
            "namespace": spec.namespace,
            "labels": spec.labels,
        },
        "stringData": spec.data,
    })
}

/// Names printed by `-o jsonpath={.items[*].metadata.name}`
pub fn parse_workload_names(output: &str) -> Vec<String> {
    output.split_whitespace().map(str::to_string).collect()
}

pub fn parse_vault_init(output: &str) -> Result<VaultInit, InfraError> {
    let init: VaultInit =
        serde_json::from_str(output).map_err(|e| InfraError::Parse(format!("vault init: {}", e)))?;
    if init.root_token.is_empty() || init.unseal_keys.is_empty() {
        return Err(InfraError::Parse(
            "vault init returned no root token or unseal keys".to_string(),
        ));
    }
    Ok(init)
}

/// Reads `initialized` from `vault status -format=json`
pub fn parse_vault_initialized(output: &str) -> Result<bool, InfraError> {
    let status: Value = serde_json::from_str(output)
        .map_err(|e| InfraError::Parse(format!("vault status: {}", e)))?;
    status
        .get("initialized")
        .and_then(Value::as_bool)
        .ok_or_else(|| InfraError::Parse("vault status has no 'initialized' field".to_string()))
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Create namespaces and the secrets the platform needs before gitops
    async fn bootstrap_secrets(
        &self,
        namespaces: &[String],
        secrets: &[SecretSpec],
    ) -> Result<(), InfraError>;

    /// Apply backed-up TLS secret manifests; returns how many were applied
    async fn restore_tls_secrets(&self, dir: &Path) -> Result<usize, InfraError>;

    async fn install_gitops_controller(&self) -> Result<(), InfraError>;

    async fn apply_manifest(&self, path: &Path) -> Result<(), InfraError>;

    /// Poll for a workload matching `key=value` until `timeout`
    async fn find_workload(
        &self,
        kind: WorkloadKind,
        key: &str,
        value: &str,
        namespace: &str,
        timeout: Duration,
    ) -> Result<Workload, InfraError>;

    async fn wait_ready(&self, workload: &Workload, timeout: Duration) -> Result<(), InfraError>;

    /// Initialize and unseal vault, keeping the keys in a cluster secret
    async fn initialize_vault(&self) -> Result<(), InfraError>;

    async fn vault_root_token(&self) -> Result<String, InfraError>;

    /// Forward a pod port until `stop` fires or its sender is dropped.
    /// Returns once the forward is accepting connections.
    async fn open_port_forward(
        &self,
        target: &PortForwardTarget,
        stop: oneshot::Receiver<()>,
    ) -> Result<(), InfraError>;
}

// ============================================================================
// SBIO: I/O implementation (kubectl CLI)
// ============================================================================

pub struct KubectlControlPlane {
    kubectl: PathBuf,
    kubeconfig: PathBuf,
    gitops_controller_source: String,
    poll_interval: Duration,
}

impl KubectlControlPlane {
    pub fn new(kubectl: impl Into<PathBuf>, kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            kubectl: kubectl.into(),
            kubeconfig: kubeconfig.into(),
            gitops_controller_source: GITOPS_CONTROLLER_SOURCE.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_gitops_controller_source(mut self, source: impl Into<String>) -> Self {
        self.gitops_controller_source = source.into();
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.kubectl);
        cmd.arg("--kubeconfig").arg(&self.kubeconfig);
        cmd
    }

    async fn kubectl(&self, args: &[&str]) -> Result<String, InfraError> {
        let description = format!("kubectl {}", args.join(" "));
        run_command(self.command().args(args), &description, None).await
    }

    async fn apply_value(&self, manifest: &Value) -> Result<(), InfraError> {
        let body = serde_json::to_vec(manifest).map_err(|e| InfraError::Parse(e.to_string()))?;
        run_command(
            self.command().args(["apply", "-f", "-"]),
            "kubectl apply -f -",
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn vault_exec(&self, args: &[&str], description: &str) -> Result<String, InfraError> {
        let mut cmd = self.command();
        cmd.args(["exec", "-n", VAULT_NAMESPACE, VAULT_POD, "--", "vault"])
            .args(args);
        run_command(&mut cmd, description, None).await
    }
}

#[async_trait]
impl ControlPlane for KubectlControlPlane {
    async fn bootstrap_secrets(
        &self,
        namespaces: &[String],
        secrets: &[SecretSpec],
    ) -> Result<(), InfraError> {
        for ns in namespaces {
            self.apply_value(&namespace_manifest(ns)).await?;
            debug!("namespace {} ready", ns);
        }
        for secret in secrets {
            self.apply_value(&secret_manifest(secret)).await?;
            info!("created secret {}/{}", secret.namespace, secret.name);
        }
        Ok(())
    }

    async fn restore_tls_secrets(&self, dir: &Path) -> Result<usize, InfraError> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();

        for file in &files {
            let path = file.to_string_lossy();
            self.kubectl(&["apply", "-f", &path]).await?;
            info!("restored tls secret from {}", path);
        }
        Ok(files.len())
    }

    async fn install_gitops_controller(&self) -> Result<(), InfraError> {
        info!("applying gitops controller from {}", self.gitops_controller_source);
        self.kubectl(&[
            "apply",
            "-n",
            GITOPS_NAMESPACE,
            "-k",
            &self.gitops_controller_source,
        ])
        .await?;
        Ok(())
    }

    async fn apply_manifest(&self, path: &Path) -> Result<(), InfraError> {
        self.kubectl(&["apply", "-f", &path.to_string_lossy()]).await?;
        Ok(())
    }

    async fn find_workload(
        &self,
        kind: WorkloadKind,
        key: &str,
        value: &str,
        namespace: &str,
        timeout: Duration,
    ) -> Result<Workload, InfraError> {
        let selector = format!("{}={}", key, value);
        let deadline = Instant::now() + timeout;

        loop {
            match self
                .kubectl(&[
                    "get",
                    kind.as_str(),
                    "-n",
                    namespace,
                    "-l",
                    &selector,
                    "-o",
                    "jsonpath={.items[*].metadata.name}",
                ])
                .await
            {
                Ok(out) => {
                    if let Some(name) = parse_workload_names(&out).into_iter().next() {
                        info!("found {} {}/{}", kind, namespace, name);
                        return Ok(Workload {
                            kind,
                            name,
                            namespace: namespace.to_string(),
                        });
                    }
                }
                Err(e) => debug!("{} lookup failed: {}", kind, e),
            }

            if Instant::now() >= deadline {
                return Err(InfraError::Timeout {
                    what: format!("{} {} in namespace {}", kind, selector, namespace),
                    timeout,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn wait_ready(&self, workload: &Workload, timeout: Duration) -> Result<(), InfraError> {
        let target = format!("{}/{}", workload.kind, workload.name);
        let timeout_arg = format!("--timeout={}s", timeout.as_secs());
        self.kubectl(&[
            "rollout",
            "status",
            &target,
            "-n",
            &workload.namespace,
            &timeout_arg,
        ])
        .await
        .map_err(|e| match e {
            InfraError::CommandFailed { message, .. } if message.contains("timed out") => {
                InfraError::Timeout {
                    what: format!("{} in namespace {}", target, workload.namespace),
                    timeout,
                }
            }
            other => other,
        })?;
        info!("{} is ready", target);
        Ok(())
    }

    async fn initialize_vault(&self) -> Result<(), InfraError> {
        // `vault status` exits 2 while sealed
        let mut status_cmd = self.command();
        status_cmd.args([
            "exec",
            "-n",
            VAULT_NAMESPACE,
            VAULT_POD,
            "--",
            "sh",
            "-c",
            "vault status -format=json || true",
        ]);
        let status = run_command(&mut status_cmd, "vault status", None).await?;
        if parse_vault_initialized(&status).unwrap_or(false) {
            info!("vault already initialized");
            return Ok(());
        }

        let output = self
            .vault_exec(
                &[
                    "operator",
                    "init",
                    "-format=json",
                    "-key-shares=1",
                    "-key-threshold=1",
                ],
                "vault operator init",
            )
            .await?;
        let init = parse_vault_init(&output)?;

        let secret = SecretSpec::new(VAULT_UNSEAL_SECRET, VAULT_NAMESPACE)
            .with_data("root-token", init.root_token.clone())
            .with_data("unseal-key-0", init.unseal_keys[0].clone());
        self.apply_value(&secret_manifest(&secret)).await?;

        self.vault_exec(
            &["operator", "unseal", &init.unseal_keys[0]],
            "vault operator unseal <key>",
        )
        .await?;
        info!("vault initialized and unsealed");
        Ok(())
    }

    async fn vault_root_token(&self) -> Result<String, InfraError> {
        let token = self
            .kubectl(&[
                "get",
                "secret",
                VAULT_UNSEAL_SECRET,
                "-n",
                VAULT_NAMESPACE,
                "-o",
                r#"go-template={{index .data "root-token" | base64decode}}"#,
            ])
            .await?;
        let token = token.trim().to_string();
        if token.is_empty() {
            return Err(InfraError::Parse("vault root token is empty".to_string()));
        }
        Ok(token)
    }

    async fn open_port_forward(
        &self,
        target: &PortForwardTarget,
        mut stop: oneshot::Receiver<()>,
    ) -> Result<(), InfraError> {
        let pod = format!("pod/{}", target.pod);
        let ports = format!("{}:{}", target.local_port, target.remote_port);
        let mut child = self
            .command()
            .args(["port-forward", "-n", &target.namespace, &pod, &ports])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| InfraError::Parse("port-forward has no stdout".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let ready = tokio::time::timeout(PORT_FORWARD_READY_TIMEOUT, async {
            while let Some(line) = lines.next_line().await? {
                if line.starts_with("Forwarding from") {
                    return Ok::<bool, std::io::Error>(true);
                }
            }
            Ok(false)
        })
        .await;

        match ready {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                return Err(InfraError::CommandFailed {
                    command: format!("kubectl port-forward {} {}", pod, ports),
                    message: "exited before forwarding".to_string(),
                })
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(InfraError::Timeout {
                    what: format!("port-forward to {}", pod),
                    timeout: PORT_FORWARD_READY_TIMEOUT,
                })
            }
        }
        info!(
            "port-forward {}/{} {} open",
            target.namespace, target.pod, ports
        );

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => debug!("port-forward: {}", line),
                        _ => {
                            warn!("port-forward exited before it was closed");
                            break;
                        }
                    },
                }
            }
            let _ = child.kill().await;
            debug!("port-forward closed");
        });
        Ok(())
    }
}

// ============================================================================
// SBIO: Mock implementation for testing (no I/O)
// ============================================================================

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Records every call by operation name; `fail_on` makes one op fail
    #[derive(Default)]
    pub struct MockControlPlane {
        pub calls: Mutex<Vec<String>>,
        pub fail_on: Mutex<Option<String>>,
        pub restored: Mutex<usize>,
        pub tunnel_stop: Mutex<Option<oneshot::Receiver<()>>>,
    }

    impl MockControlPlane {
        pub fn failing_on(op: &str) -> Self {
            let mock = Self::default();
            *mock.fail_on.lock().unwrap() = Some(op.to_string());
            mock
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        /// True once the tunnel's stop channel was signalled or dropped
        pub fn tunnel_closed(&self) -> bool {
            match self.tunnel_stop.lock().unwrap().as_mut() {
                Some(rx) => !matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)),
                None => false,
            }
        }

        fn record(&self, op: &str) -> Result<(), InfraError> {
            self.calls.lock().unwrap().push(op.to_string());
            if self.fail_on.lock().unwrap().as_deref() == Some(op) {
                return Err(InfraError::CommandFailed {
                    command: format!("kubectl {}", op),
                    message: format!("{} failed", op),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ControlPlane for MockControlPlane {
        async fn bootstrap_secrets(
            &self,
            _namespaces: &[String],
            _secrets: &[SecretSpec],
        ) -> Result<(), InfraError> {
            self.record("bootstrap_secrets")
        }

        async fn restore_tls_secrets(&self, dir: &Path) -> Result<usize, InfraError> {
            self.record("restore_tls_secrets")?;
            let count = std::fs::read_dir(dir)?.count();
            *self.restored.lock().unwrap() += count;
            Ok(count)
        }

        async fn install_gitops_controller(&self) -> Result<(), InfraError> {
            self.record("install_gitops_controller")
        }

        async fn apply_manifest(&self, _path: &Path) -> Result<(), InfraError> {
            self.record("apply_manifest")
        }

        async fn find_workload(
            &self,
            kind: WorkloadKind,
            _key: &str,
            value: &str,
            namespace: &str,
            _timeout: Duration,
        ) -> Result<Workload, InfraError> {
            self.record(&format!("find_workload:{}", value))?;
            Ok(Workload {
                kind,
                name: value.to_string(),
                namespace: namespace.to_string(),
            })
        }

        async fn wait_ready(
            &self,
            workload: &Workload,
            _timeout: Duration,
        ) -> Result<(), InfraError> {
            self.record(&format!("wait_ready:{}", workload.name))
        }

        async fn initialize_vault(&self) -> Result<(), InfraError> {
            self.record("initialize_vault")
        }

        async fn vault_root_token(&self) -> Result<String, InfraError> {
            self.record("vault_root_token")?;
            Ok("hvs.mock-root".to_string())
        }

        async fn open_port_forward(
            &self,
            _target: &PortForwardTarget,
            stop: oneshot::Receiver<()>,
        ) -> Result<(), InfraError> {
            self.record("open_port_forward")?;
            *self.tunnel_stop.lock().unwrap() = Some(stop);
            Ok(())
        }
    }
}
