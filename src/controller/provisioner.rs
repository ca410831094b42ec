//! The provisioning run
//!
//! [`Provisioner::run`] walks [`PIPELINE`] in order. Before each stage it
//! checks for cancellation and renews the cluster lease; marker stages whose
//! marker is already set are skipped, and a marker is only written while the
//! lease is still ours. The first failing stage stops the run: `in_progress`
//! is cleared, the lease is released and the error is returned with the
//! stage that produced it. A run that lost its lease touches neither. Nothing
//! is retried here.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::{ErrorKind, ProvisionError, StageError};
use super::stage::{Outcome, ProvisionReport, StageId, Step, PIPELINE};
use crate::config::{ClusterDefinition, GitProvider, ProviderConfig, Settings, Workspace};
use crate::dns::{LivenessPolicy, LivenessProber, TxtResolver};
use crate::gitops::{remote_url, template_tokens, GitWorkspace, BOT_KEY_FILE};
use crate::infra::kubectl::{GITOPS_NAMESPACE, VAULT_NAMESPACE};
use crate::infra::{
    ControlPlane, InfraError, PortForwardTarget, SecretSpec, Terraform, TerraformRun,
    ToolInstaller, TunnelGuard, WorkloadKind,
};
use crate::objectstore::{StateStoreCredentials, StateStoreDetails};
use crate::provider::CloudProvider;
use crate::store::{ClusterStatus, RecordField, RecordStore, StoreError};
use crate::telemetry::{
    transmit, TelemetryEvent, TelemetrySink, METRIC_MGMT_CLUSTER_INSTALL_COMPLETED,
};

pub const PLATFORM_NAMESPACE: &str = "platform";

const NAME_LABEL: &str = "app.kubernetes.io/name";
const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

const GITOPS_SERVER_TIMEOUT: Duration = Duration::from_secs(120);
const VAULT_FIND_TIMEOUT: Duration = Duration::from_secs(60);
const VAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);
const CONSOLE_FIND_TIMEOUT: Duration = Duration::from_secs(600);
const CONSOLE_READY_TIMEOUT: Duration = Duration::from_secs(120);

/// Everything a run talks to
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn RecordStore>,
    pub provider: Arc<dyn CloudProvider>,
    pub resolver: Arc<dyn TxtResolver>,
    pub tools: Arc<dyn ToolInstaller>,
    pub git: Arc<dyn GitWorkspace>,
    pub terraform: Arc<dyn Terraform>,
    pub control_plane: Arc<dyn ControlPlane>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

/// Lease holder identity: hostname plus a per-process suffix
pub fn lease_holder() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}-{}", host, Uuid::new_v4().simple())
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// Environment variable terraform's git provider reads its token from
pub fn git_token_env(provider: GitProvider) -> &'static str {
    match provider {
        GitProvider::Github => "GITHUB_TOKEN",
        GitProvider::Gitlab => "GITLAB_TOKEN",
    }
}

/// Backend credentials and bucket location shared by every stack
pub fn with_state_store(
    run: TerraformRun,
    credentials: &StateStoreCredentials,
    details: &StateStoreDetails,
) -> TerraformRun {
    run.with_env("AWS_ACCESS_KEY_ID", credentials.access_key_id.clone())
        .with_env("AWS_SECRET_ACCESS_KEY", credentials.secret_access_key.clone())
        .with_var("state_store_bucket", details.name.clone())
        .with_var("state_store_endpoint", details.hostname.clone())
}

fn with_provider_credentials(run: TerraformRun, provider: &ProviderConfig) -> TerraformRun {
    match provider {
        ProviderConfig::Vultr { api_key } => run.with_env("VULTR_API_KEY", api_key.clone()),
        ProviderConfig::Digitalocean {
            token,
            spaces_key,
            spaces_secret,
        } => run
            .with_env("DIGITALOCEAN_TOKEN", token.clone())
            .with_env("SPACES_ACCESS_KEY_ID", spaces_key.clone())
            .with_env("SPACES_SECRET_ACCESS_KEY", spaces_secret.clone()),
    }
}

pub fn git_terraform_run(
    definition: &ClusterDefinition,
    workspace: &Workspace,
    credentials: &StateStoreCredentials,
    details: &StateStoreDetails,
) -> TerraformRun {
    let public_key = workspace.ssh_dir().join(format!("{}.pub", BOT_KEY_FILE));
    let run = TerraformRun::new(workspace.terraform_dir(definition.git_provider.as_str()))
        .with_var("git_owner", definition.git_owner.clone())
        .with_var("bot_public_key_path", public_key.display().to_string())
        .with_env(git_token_env(definition.git_provider), definition.git_token.clone());
    with_state_store(run, credentials, details)
}

pub fn cluster_terraform_run(
    definition: &ClusterDefinition,
    workspace: &Workspace,
    credentials: &StateStoreCredentials,
    details: &StateStoreDetails,
) -> TerraformRun {
    let run = TerraformRun::new(workspace.terraform_dir(definition.provider_name()))
        .with_var("cluster_name", definition.cluster_name.clone())
        .with_var("region", definition.region.clone())
        .with_var("node_type", definition.node_type.clone())
        .with_var("node_count", definition.node_count.to_string())
        .with_var("kubeconfig_path", workspace.kubeconfig().display().to_string());
    let run = with_provider_credentials(run, &definition.provider);
    with_state_store(run, credentials, details)
}

/// Terraform run of a stack that configures vault through the tunnel
pub fn vault_terraform_run(
    workspace: &Workspace,
    stack: &str,
    vault: &VaultAccess,
    credentials: &StateStoreCredentials,
    details: &StateStoreDetails,
) -> TerraformRun {
    let run = TerraformRun::new(workspace.terraform_dir(stack))
        .with_var("vault_addr", vault.addr.clone())
        .with_var("vault_token", vault.token.clone())
        .with_env("VAULT_ADDR", vault.addr.clone())
        .with_env("VAULT_TOKEN", vault.token.clone());
    with_state_store(run, credentials, details)
}

/// Secrets the platform needs before the gitops controller syncs
pub fn bootstrap_secret_specs(
    definition: &ClusterDefinition,
    bot_private_key: &str,
    credentials: &StateStoreCredentials,
    details: &StateStoreDetails,
) -> Vec<SecretSpec> {
    vec![
        SecretSpec::new("gitops-repository", GITOPS_NAMESPACE)
            .with_label("argocd.argoproj.io/secret-type", "repository")
            .with_data("type", "git")
            .with_data(
                "url",
                remote_url(definition.git_provider, &definition.git_owner),
            )
            .with_data("sshPrivateKey", bot_private_key),
        SecretSpec::new("state-store-credentials", VAULT_NAMESPACE)
            .with_data("AWS_ACCESS_KEY_ID", credentials.access_key_id.clone())
            .with_data("AWS_SECRET_ACCESS_KEY", credentials.secret_access_key.clone())
            .with_data("bucket", details.name.clone())
            .with_data("endpoint", details.hostname.clone()),
        SecretSpec::new("platform-config", PLATFORM_NAMESPACE)
            .with_data("cluster_name", definition.cluster_name.clone())
            .with_data("domain_name", definition.domain_name.clone())
            .with_data("admin_email", definition.admin_email.clone()),
    ]
}

/// Registry application manifest inside the gitops repository
pub fn registry_manifest_path(workspace: &Workspace, cluster_name: &str) -> PathBuf {
    workspace
        .gitops_dir()
        .join("registry")
        .join(cluster_name)
        .join("registry.yaml")
}

// ============================================================================
// Run state
// ============================================================================

/// Address and token of the forwarded vault
#[derive(Clone)]
pub struct VaultAccess {
    pub addr: String,
    pub token: String,
}

struct RunContext<'a> {
    definition: &'a ClusterDefinition,
    workspace: Workspace,
    /// Held in memory only; refetched from the provider on resume
    state_store: Option<(StateStoreCredentials, StateStoreDetails)>,
    vault: Option<VaultAccess>,
}

type StageFailure = (StageId, StageError);

async fn dir_has_entries(dir: &Path) -> Result<bool, InfraError> {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => Ok(entries.next_entry().await?.is_some()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct Provisioner {
    deps: Collaborators,
    settings: Settings,
    holder: String,
}

impl Provisioner {
    pub fn new(deps: Collaborators, settings: Settings) -> Self {
        Self {
            deps,
            settings,
            holder: lease_holder(),
        }
    }

    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Provision (or resume provisioning) the cluster described by
    /// `definition`
    pub async fn run(
        &self,
        definition: &ClusterDefinition,
        cancel: &CancellationToken,
    ) -> Result<ProvisionReport, ProvisionError> {
        let name = definition.cluster_name.as_str();
        let mut report = ProvisionReport::new(name);

        let started = Instant::now();
        if let Err(source) = self.init(definition, cancel).await {
            // Nothing acquired yet, so nothing to reset
            error!(cluster = %name, stage = %StageId::Init, kind = %source.kind(), "{}", source);
            return Err(ProvisionError::Stage {
                stage: StageId::Init,
                source,
            });
        }
        report.push(StageId::Init, Outcome::Completed, started.elapsed());

        let mut ctx = RunContext {
            definition,
            workspace: self.settings.workspace(name),
            state_store: None,
            vault: None,
        };

        match self.run_steps(&mut ctx, cancel, &mut report).await {
            Ok(()) => {
                self.release_lease(name).await;
                info!(
                    cluster = %name,
                    completed = report.completed(),
                    skipped = report.skipped(),
                    "cluster provisioned in {:?}",
                    report.total_duration()
                );
                self.send_completion(name).await;
                Ok(report)
            }
            Err((stage, source)) => Err(self.fail(name, stage, source).await),
        }
    }

    async fn init(
        &self,
        definition: &ClusterDefinition,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }
        let name = definition.cluster_name.as_str();
        match self.deps.store.get_record(name).await {
            Ok(record) => {
                info!(cluster = %name, id = %record.id, status = %record.status, "resuming existing cluster record");
            }
            Err(StoreError::NotFound(_)) => {
                let record = self.deps.store.create_record(definition).await?;
                info!(cluster = %name, id = %record.id, "created cluster record");
            }
            Err(e) => return Err(e.into()),
        }

        let lease = self
            .deps
            .store
            .acquire_lease(name, &self.holder, self.settings.lease_ttl())
            .await?;
        debug!(cluster = %name, holder = %lease.holder, expires_at = %lease.expires_at, "lease acquired");
        Ok(())
    }

    async fn run_steps(
        &self,
        ctx: &mut RunContext<'_>,
        cancel: &CancellationToken,
        report: &mut ProvisionReport,
    ) -> Result<(), StageFailure> {
        for step in PIPELINE {
            match step {
                Step::Stage(stage) => self.run_stage(*stage, ctx, cancel, report).await?,
                Step::Tunnel(enclosed) => self.run_tunnel(enclosed, ctx, cancel, report).await?,
            }
        }
        Ok(())
    }

    async fn run_stage(
        &self,
        stage: StageId,
        ctx: &mut RunContext<'_>,
        cancel: &CancellationToken,
        report: &mut ProvisionReport,
    ) -> Result<(), StageFailure> {
        let definition = ctx.definition;
        let name = definition.cluster_name.as_str();
        let fail = |e: StageError| (stage, e);

        if cancel.is_cancelled() {
            return Err(fail(StageError::Cancelled));
        }
        self.deps
            .store
            .renew_lease(name, &self.holder, self.settings.lease_ttl())
            .await
            .map_err(|e| fail(e.into()))?;

        if let Some(marker) = stage.marker() {
            let record = self
                .deps
                .store
                .get_record(name)
                .await
                .map_err(|e| fail(e.into()))?;
            if record.flag(marker) == Some(true) {
                info!(cluster = %name, stage = %stage, "already done, skipping");
                report.push(stage, Outcome::Skipped, Duration::ZERO);
                return Ok(());
            }
        }

        info!(cluster = %name, stage = %stage, "starting");
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StageError::Cancelled),
            result = self.execute(stage, ctx, cancel) => result,
        };
        result.map_err(fail)?;

        if let Some(marker) = stage.marker() {
            // The lease may have expired and been taken while the stage ran
            self.deps
                .store
                .renew_lease(name, &self.holder, self.settings.lease_ttl())
                .await
                .map_err(|e| fail(e.into()))?;
            self.deps
                .store
                .update_field(name, marker.as_str(), json!(true))
                .await
                .map_err(|e| fail(e.into()))?;
        }

        let elapsed = started.elapsed();
        info!(cluster = %name, stage = %stage, "done in {:?}", elapsed);
        report.push(stage, Outcome::Completed, elapsed);
        Ok(())
    }

    /// Run `enclosed` with the vault port-forward open. The tunnel is only
    /// opened when at least one enclosed stage still has work to do.
    async fn run_tunnel(
        &self,
        enclosed: &[StageId],
        ctx: &mut RunContext<'_>,
        cancel: &CancellationToken,
        report: &mut ProvisionReport,
    ) -> Result<(), StageFailure> {
        let definition = ctx.definition;
        let name = definition.cluster_name.as_str();
        let Some(first) = enclosed.first().copied() else {
            return Ok(());
        };

        let record = self
            .deps
            .store
            .get_record(name)
            .await
            .map_err(|e| (first, e.into()))?;
        let pending = enclosed
            .iter()
            .copied()
            .find(|s| s.marker().and_then(|m| record.flag(m)) != Some(true));

        let Some(first_pending) = pending else {
            for stage in enclosed {
                self.run_stage(*stage, ctx, cancel, report).await?;
            }
            return Ok(());
        };

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StageError::Cancelled),
            opened = self.open_vault_tunnel() => opened,
        };
        let (mut tunnel, access) = opened.map_err(|e| (first_pending, e))?;
        info!(cluster = %name, "vault tunnel open at {}", access.addr);

        ctx.vault = Some(access);
        let mut result = Ok(());
        for stage in enclosed {
            result = self.run_stage(*stage, ctx, cancel, report).await;
            if result.is_err() {
                break;
            }
        }
        ctx.vault = None;
        tunnel.close();
        result
    }

    async fn open_vault_tunnel(&self) -> Result<(TunnelGuard, VaultAccess), StageError> {
        let control_plane = self.deps.control_plane.as_ref();
        let tunnel = TunnelGuard::open(control_plane, PortForwardTarget::vault()).await?;
        let token = control_plane.vault_root_token().await?;
        let access = VaultAccess {
            addr: tunnel.target().local_url(),
            token,
        };
        Ok((tunnel, access))
    }

    async fn execute(
        &self,
        stage: StageId,
        ctx: &mut RunContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        let definition = ctx.definition;
        let name = definition.cluster_name.as_str();
        let store = self.deps.store.as_ref();
        let control_plane = self.deps.control_plane.as_ref();

        match stage {
            // Runs before the loop
            StageId::Init => Ok(()),

            StageId::MarkInProgress => {
                store
                    .update_field(name, RecordField::InProgress.as_str(), json!(true))
                    .await?;
                if store.get_record(name).await?.status == ClusterStatus::Provisioned {
                    debug!(cluster = %name, "already provisioned, keeping status");
                    return Ok(());
                }
                store
                    .update_field(
                        name,
                        RecordField::Status.as_str(),
                        json!(ClusterStatus::Provisioning.as_str()),
                    )
                    .await?;
                Ok(())
            }

            StageId::DownloadTools => {
                self.deps
                    .tools
                    .download_tools(
                        definition.git_provider,
                        &definition.git_owner,
                        &ctx.workspace.tools_dir(),
                    )
                    .await?;
                Ok(())
            }

            StageId::DomainLiveness => {
                let prober = LivenessProber::new(
                    self.deps.provider.as_ref(),
                    self.deps.resolver.as_ref(),
                    LivenessPolicy::from_settings(&self.settings),
                );
                prober.probe(&definition.domain_name, cancel).await?;
                Ok(())
            }

            StageId::StateStoreCredentials => {
                let bucket = definition.state_store_bucket();
                let (credentials, details) =
                    self.deps.provider.create_state_store(&bucket).await?;
                let value = serde_json::to_value(&details).map_err(StoreError::from)?;
                store
                    .update_field(name, RecordField::StateStoreDetails.as_str(), value)
                    .await?;
                info!(cluster = %name, bucket = %details.name, hostname = %details.hostname, "state store ready");
                ctx.state_store = Some((credentials, details));
                Ok(())
            }

            StageId::GitInit => {
                let remote = remote_url(definition.git_provider, &definition.git_owner);
                self.deps
                    .git
                    .init(
                        &ctx.workspace.gitops_dir(),
                        self.settings.gitops_template_dir.as_deref(),
                        &remote,
                    )
                    .await?;
                Ok(())
            }

            StageId::BotInit => {
                let key = self.deps.git.initialize_bot(&ctx.workspace.ssh_dir()).await?;
                info!(cluster = %name, "bot key at {}", key.private_key_path.display());
                Ok(())
            }

            StageId::RepositoryPrep => {
                let tokens = template_tokens(definition, &definition.state_store_bucket());
                let rendered = self
                    .deps
                    .git
                    .prepare(&ctx.workspace.gitops_dir(), &tokens)
                    .await?;
                debug!(cluster = %name, files = rendered, "rendered gitops template");
                Ok(())
            }

            StageId::RunGitTerraform => {
                let (credentials, details) = self.state_store(ctx).await?;
                let run = git_terraform_run(definition, &ctx.workspace, &credentials, &details);
                self.deps.terraform.apply(&run).await?;
                Ok(())
            }

            StageId::RepositoryPush => {
                let key = ctx.workspace.ssh_dir().join(BOT_KEY_FILE);
                self.deps
                    .git
                    .push(&ctx.workspace.gitops_dir(), &key)
                    .await?;
                Ok(())
            }

            StageId::CreateCluster => {
                let (credentials, details) = self.state_store(ctx).await?;
                let run =
                    cluster_terraform_run(definition, &ctx.workspace, &credentials, &details);
                self.deps.terraform.apply(&run).await?;
                Ok(())
            }

            StageId::Settle => {
                let delay = self.settings.settle_delay();
                info!(cluster = %name, "waiting {:?} for the cluster to settle", delay);
                tokio::time::sleep(delay).await;
                Ok(())
            }

            StageId::ClusterSecretsBootstrap => {
                let (credentials, details) = self.state_store(ctx).await?;
                let key_path = ctx.workspace.ssh_dir().join(BOT_KEY_FILE);
                let private_key = tokio::fs::read_to_string(&key_path)
                    .await
                    .map_err(InfraError::from)?;
                let namespaces: Vec<String> =
                    [GITOPS_NAMESPACE, VAULT_NAMESPACE, PLATFORM_NAMESPACE]
                        .iter()
                        .map(|n| n.to_string())
                        .collect();
                let secrets =
                    bootstrap_secret_specs(definition, &private_key, &credentials, &details);
                control_plane
                    .bootstrap_secrets(&namespaces, &secrets)
                    .await?;
                Ok(())
            }

            StageId::TlsRestore => {
                let dir = ctx.workspace.ssl_backup_dir().join("secrets");
                if !dir_has_entries(&dir).await? {
                    debug!(cluster = %name, "no TLS backup in {}", dir.display());
                    return Ok(());
                }
                let restored = control_plane.restore_tls_secrets(&dir).await?;
                info!(cluster = %name, restored, "restored TLS secrets");
                Ok(())
            }

            StageId::InstallGitopsController => {
                control_plane.install_gitops_controller().await?;
                Ok(())
            }

            StageId::InitializeGitopsController => {
                let server = control_plane
                    .find_workload(
                        WorkloadKind::Deployment,
                        NAME_LABEL,
                        "argocd-server",
                        GITOPS_NAMESPACE,
                        GITOPS_SERVER_TIMEOUT,
                    )
                    .await?;
                control_plane
                    .wait_ready(&server, GITOPS_SERVER_TIMEOUT)
                    .await?;
                Ok(())
            }

            StageId::DeployRegistryApp => {
                let manifest = registry_manifest_path(&ctx.workspace, name);
                control_plane.apply_manifest(&manifest).await?;
                Ok(())
            }

            StageId::WaitForSecretsVault => {
                let vault = control_plane
                    .find_workload(
                        WorkloadKind::StatefulSet,
                        INSTANCE_LABEL,
                        "vault",
                        VAULT_NAMESPACE,
                        VAULT_FIND_TIMEOUT,
                    )
                    .await?;
                control_plane.wait_ready(&vault, VAULT_READY_TIMEOUT).await?;
                Ok(())
            }

            StageId::InitializeSecretsVault => {
                control_plane.initialize_vault().await?;
                Ok(())
            }

            StageId::RunVaultTerraform => self.apply_vault_stack(ctx, "vault").await,

            StageId::RunUsersTerraform => self.apply_vault_stack(ctx, "users").await,

            StageId::WaitForConsoleReady => {
                let console = control_plane
                    .find_workload(
                        WorkloadKind::Deployment,
                        INSTANCE_LABEL,
                        "console",
                        PLATFORM_NAMESPACE,
                        CONSOLE_FIND_TIMEOUT,
                    )
                    .await?;
                control_plane
                    .wait_ready(&console, CONSOLE_READY_TIMEOUT)
                    .await?;
                Ok(())
            }

            StageId::MarkProvisioned => {
                store
                    .update_field(
                        name,
                        RecordField::Status.as_str(),
                        json!(ClusterStatus::Provisioned.as_str()),
                    )
                    .await?;
                store
                    .update_field(name, RecordField::InProgress.as_str(), json!(false))
                    .await?;
                Ok(())
            }
        }
    }

    async fn apply_vault_stack(
        &self,
        ctx: &mut RunContext<'_>,
        stack: &str,
    ) -> Result<(), StageError> {
        let vault = ctx
            .vault
            .clone()
            .ok_or_else(|| StageError::MissingState("vault tunnel is not open".to_string()))?;
        let (credentials, details) = self.state_store(ctx).await?;
        let run = vault_terraform_run(&ctx.workspace, stack, &vault, &credentials, &details);
        self.deps.terraform.apply(&run).await?;
        Ok(())
    }

    /// State store access for this run, fetched once per process
    async fn state_store(
        &self,
        ctx: &mut RunContext<'_>,
    ) -> Result<(StateStoreCredentials, StateStoreDetails), StageError> {
        if let Some(state_store) = &ctx.state_store {
            return Ok(state_store.clone());
        }
        let name = ctx.definition.cluster_name.as_str();
        let record = self.deps.store.get_record(name).await?;
        let details = record.state_store_details.ok_or_else(|| {
            StageError::MissingState(format!("cluster {} has no state store details", name))
        })?;
        info!(cluster = %name, bucket = %details.name, "fetching state store credentials");
        let credentials = self.deps.provider.state_store_credentials(&details).await?;
        ctx.state_store = Some((credentials.clone(), details.clone()));
        Ok((credentials, details))
    }

    async fn fail(&self, name: &str, stage: StageId, source: StageError) -> ProvisionError {
        error!(cluster = %name, stage = %stage, kind = %source.kind(), "{}", source);
        if source.kind() == ErrorKind::LeaseHeld {
            // Another run owns the record now; its in_progress is not ours to clear
            warn!(cluster = %name, holder = %self.holder, "lease lost, leaving record untouched");
            return ProvisionError::Stage { stage, source };
        }
        let reset = self
            .deps
            .store
            .update_field(name, RecordField::InProgress.as_str(), json!(false))
            .await;
        self.release_lease(name).await;

        match reset {
            Ok(()) => ProvisionError::Stage { stage, source },
            Err(reset) => {
                error!(cluster = %name, "could not clear in_progress: {}", reset);
                ProvisionError::Reset {
                    stage,
                    source,
                    reset,
                }
            }
        }
    }

    async fn release_lease(&self, name: &str) {
        if let Err(e) = self.deps.store.release_lease(name, &self.holder).await {
            warn!(cluster = %name, "could not release lease: {}", e);
        }
    }

    async fn send_completion(&self, name: &str) {
        match self.deps.store.get_record(name).await {
            Ok(record) => transmit(
                record.use_telemetry,
                self.deps.telemetry.as_ref(),
                TelemetryEvent::for_record(METRIC_MGMT_CLUSTER_INSTALL_COMPLETED, &record),
            ),
            Err(e) => warn!(cluster = %name, "skipping telemetry: {}", e),
        }
        self.deps.telemetry.close().await;
    }
}
