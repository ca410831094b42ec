//! Stage descriptors
//!
//! The pipeline is data: an ordered list of [`Step`]s naming [`StageId`]s.
//! Each stage optionally maps to a completion marker on the cluster record;
//! marker stages are skipped on resume once their marker is set.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::store::RecordField;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageId {
    Init,
    MarkInProgress,
    DownloadTools,
    DomainLiveness,
    StateStoreCredentials,
    GitInit,
    BotInit,
    RepositoryPrep,
    RunGitTerraform,
    RepositoryPush,
    CreateCluster,
    Settle,
    ClusterSecretsBootstrap,
    TlsRestore,
    InstallGitopsController,
    InitializeGitopsController,
    DeployRegistryApp,
    WaitForSecretsVault,
    InitializeSecretsVault,
    RunVaultTerraform,
    RunUsersTerraform,
    WaitForConsoleReady,
    MarkProvisioned,
}

impl StageId {
    pub fn name(&self) -> &'static str {
        match self {
            StageId::Init => "init",
            StageId::MarkInProgress => "mark-in-progress",
            StageId::DownloadTools => "download-tools",
            StageId::DomainLiveness => "domain-liveness",
            StageId::StateStoreCredentials => "state-store-credentials",
            StageId::GitInit => "git-init",
            StageId::BotInit => "bot-init",
            StageId::RepositoryPrep => "repository-prep",
            StageId::RunGitTerraform => "run-git-terraform",
            StageId::RepositoryPush => "repository-push",
            StageId::CreateCluster => "create-cluster",
            StageId::Settle => "settle",
            StageId::ClusterSecretsBootstrap => "cluster-secrets-bootstrap",
            StageId::TlsRestore => "tls-restore",
            StageId::InstallGitopsController => "install-gitops-controller",
            StageId::InitializeGitopsController => "initialize-gitops-controller",
            StageId::DeployRegistryApp => "deploy-registry-app",
            StageId::WaitForSecretsVault => "wait-for-secrets-vault",
            StageId::InitializeSecretsVault => "initialize-secrets-vault",
            StageId::RunVaultTerraform => "run-vault-terraform",
            StageId::RunUsersTerraform => "run-users-terraform",
            StageId::WaitForConsoleReady => "wait-for-console-ready",
            StageId::MarkProvisioned => "mark-provisioned",
        }
    }

    /// Record field that marks this stage complete, if it has one
    pub fn marker(&self) -> Option<RecordField> {
        let field = match self {
            StageId::DownloadTools => RecordField::InstallToolsCheck,
            StageId::DomainLiveness => RecordField::DomainLivenessCheck,
            StageId::StateStoreCredentials => RecordField::StateStoreCredsCheck,
            StageId::GitInit => RecordField::GitInitCheck,
            StageId::BotInit => RecordField::KbotSetupCheck,
            StageId::RepositoryPrep => RecordField::GitopsReadyCheck,
            StageId::RunGitTerraform => RecordField::GitTerraformApplyCheck,
            StageId::RepositoryPush => RecordField::GitopsPushedCheck,
            StageId::CreateCluster => RecordField::CloudTerraformApplyCheck,
            StageId::ClusterSecretsBootstrap => RecordField::ClusterSecretsCreatedCheck,
            StageId::InstallGitopsController => RecordField::ArgocdInstallCheck,
            StageId::InitializeGitopsController => RecordField::ArgocdInitializeCheck,
            StageId::DeployRegistryApp => RecordField::ArgocdCreateRegistryCheck,
            StageId::InitializeSecretsVault => RecordField::VaultInitializedCheck,
            StageId::RunVaultTerraform => RecordField::VaultTerraformApplyCheck,
            StageId::RunUsersTerraform => RecordField::UsersTerraformApplyCheck,
            StageId::Init
            | StageId::MarkInProgress
            | StageId::Settle
            | StageId::TlsRestore
            | StageId::WaitForSecretsVault
            | StageId::WaitForConsoleReady
            | StageId::MarkProvisioned => return None,
        };
        Some(field)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One entry of the pipeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    Stage(StageId),
    /// Stages that need the vault port-forward open while they run
    Tunnel(&'static [StageId]),
}

/// Everything after `init`, in execution order
pub const PIPELINE: &[Step] = &[
    Step::Stage(StageId::MarkInProgress),
    Step::Stage(StageId::DownloadTools),
    Step::Stage(StageId::DomainLiveness),
    Step::Stage(StageId::StateStoreCredentials),
    Step::Stage(StageId::GitInit),
    Step::Stage(StageId::BotInit),
    Step::Stage(StageId::RepositoryPrep),
    Step::Stage(StageId::RunGitTerraform),
    Step::Stage(StageId::RepositoryPush),
    Step::Stage(StageId::CreateCluster),
    Step::Stage(StageId::Settle),
    Step::Stage(StageId::ClusterSecretsBootstrap),
    Step::Stage(StageId::TlsRestore),
    Step::Stage(StageId::InstallGitopsController),
    Step::Stage(StageId::InitializeGitopsController),
    Step::Stage(StageId::DeployRegistryApp),
    Step::Stage(StageId::WaitForSecretsVault),
    Step::Stage(StageId::InitializeSecretsVault),
    Step::Tunnel(&[StageId::RunVaultTerraform, StageId::RunUsersTerraform]),
    Step::Stage(StageId::WaitForConsoleReady),
    Step::Stage(StageId::MarkProvisioned),
];

/// Every stage in execution order, `init` included
pub fn all_stages() -> Vec<StageId> {
    let mut stages = vec![StageId::Init];
    for step in PIPELINE {
        match step {
            Step::Stage(stage) => stages.push(*stage),
            Step::Tunnel(enclosed) => stages.extend_from_slice(enclosed),
        }
    }
    stages
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Completed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub stage: StageId,
    pub outcome: Outcome,
    pub duration: Duration,
}

/// What a successful run did, stage by stage
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvisionReport {
    pub cluster_name: String,
    pub stages: Vec<StageOutcome>,
}

impl ProvisionReport {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            stages: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, stage: StageId, outcome: Outcome, duration: Duration) {
        self.stages.push(StageOutcome {
            stage,
            outcome,
            duration,
        });
    }

    pub fn outcome(&self, stage: StageId) -> Option<Outcome> {
        self.stages
            .iter()
            .find(|s| s.stage == stage)
            .map(|s| s.outcome)
    }

    pub fn completed(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.outcome == Outcome::Completed)
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.stages.len() - self.completed()
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }
}
