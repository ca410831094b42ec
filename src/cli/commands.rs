//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return Results, I/O is handled by caller

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::definition::is_valid_cluster_name;
use crate::config::settings::default_settings_path;
use crate::config::{load_definition_file, load_settings, ClusterDefinition, ConfigError, Settings};
use crate::controller::{Collaborators, ProvisionError, ProvisionReport, Provisioner};
use crate::dns::{LivenessError, LivenessPolicy, LivenessProber, SystemResolver};
use crate::gitops::GitCli;
use crate::infra::{HttpToolInstaller, KubectlControlPlane, TerraformCli};
use crate::objectstore::{
    export_cluster_record, import_cluster_record, ObjectStore, ObjectStoreError, S3ObjectStore,
    StateStoreCredentials, StateStoreDetails,
};
use crate::provider::{
    build_provider, probe_apex_content, CloudProvider, ProviderDeps, ProviderError,
};
use crate::store::{
    ClusterRecord, Environment, EnvironmentUpdate, FileRecordStore, RecordStore, StoreError,
};
use crate::telemetry::build_sink;

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Liveness error: {0}")]
    Liveness(#[from] LivenessError),

    #[error("Object storage error: {0}")]
    ObjectStore(#[from] ObjectStoreError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

/// Outcome of the `probe` command
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub domain: String,
    pub live: bool,
    pub apex_content: Option<bool>,
}

// ============================================================================
// Wiring (real implementations of every collaborator)
// ============================================================================

/// Load settings from `path`, or the default location
pub fn load_cli_settings(path: Option<&Path>) -> CommandResult<Settings> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_settings_path);
    Ok(load_settings(&path)?)
}

pub async fn open_store(settings: &Settings) -> CommandResult<Arc<dyn RecordStore>> {
    let store = FileRecordStore::open(&settings.store_dir).await?;
    Ok(Arc::new(store))
}

pub fn provider_deps(settings: &Settings) -> ProviderDeps {
    ProviderDeps {
        resolver: Arc::new(SystemResolver::new(settings.backup_resolver)),
        object_store: Arc::new(S3ObjectStore::new()),
        liveness: LivenessPolicy::from_settings(settings),
    }
}

pub fn provider_for(
    settings: &Settings,
    definition: &ClusterDefinition,
) -> Arc<dyn CloudProvider> {
    build_provider(&definition.provider, &definition.region, provider_deps(settings))
}

/// Real collaborators for provisioning `definition`
pub fn collaborators(
    settings: &Settings,
    definition: &ClusterDefinition,
    store: Arc<dyn RecordStore>,
) -> Collaborators {
    let deps = provider_deps(settings);
    let workspace = settings.workspace(&definition.cluster_name);
    Collaborators {
        store,
        provider: build_provider(&definition.provider, &definition.region, deps.clone()),
        resolver: deps.resolver,
        tools: Arc::new(HttpToolInstaller::new(settings.home_dir.join("cache"))),
        git: Arc::new(GitCli::new()),
        terraform: Arc::new(TerraformCli::new()),
        control_plane: Arc::new(KubectlControlPlane::new(
            workspace.tools_dir().join("kubectl"),
            workspace.kubeconfig(),
        )),
        telemetry: build_sink(settings),
    }
}

// ============================================================================
// Cluster commands
// ============================================================================

pub async fn create_cluster(
    settings: &Settings,
    definition_path: &Path,
    cancel: &CancellationToken,
) -> CommandResult<ProvisionReport> {
    let definition = load_definition_file(definition_path)?;
    let store = open_store(settings).await?;
    let collaborators = collaborators(settings, &definition, store);
    let provisioner = Provisioner::new(collaborators, settings.clone());
    info!(
        cluster = %definition.cluster_name,
        provider = %definition.provider_name(),
        holder = %provisioner.holder(),
        "provisioning"
    );
    Ok(provisioner.run(&definition, cancel).await?)
}

pub async fn get_cluster(store: &dyn RecordStore, name: &str) -> CommandResult<ClusterRecord> {
    Ok(store.get_record(name).await?)
}

/// All records, sorted by cluster name
pub async fn list_clusters(store: &dyn RecordStore) -> CommandResult<Vec<ClusterRecord>> {
    let mut records = store.list_records().await?;
    records.sort_by(|a, b| a.cluster_name.cmp(&b.cluster_name));
    Ok(records)
}

pub async fn delete_cluster(store: &dyn RecordStore, id: &str) -> CommandResult<()> {
    store.delete_record(id).await?;
    info!(id = %id, "deleted cluster record");
    Ok(())
}

// ============================================================================
// Environment commands
// ============================================================================

/// All environments, sorted by name
pub async fn list_environments(store: &dyn RecordStore) -> CommandResult<Vec<Environment>> {
    let mut environments = store.list_environments().await?;
    environments.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(environments)
}

pub async fn get_environment(store: &dyn RecordStore, name: &str) -> CommandResult<Environment> {
    Ok(store.get_environment(name).await?)
}

pub async fn create_environment(
    store: &dyn RecordStore,
    name: &str,
    color: &str,
    description: &str,
) -> CommandResult<Environment> {
    let environment = store
        .insert_environment(Environment::new(name, color, description)?)
        .await?;
    info!(environment = %environment.name, id = %environment.id, "created environment");
    Ok(environment)
}

pub async fn update_environment(
    store: &dyn RecordStore,
    id: &str,
    update: &EnvironmentUpdate,
) -> CommandResult<Environment> {
    if update.is_empty() {
        return Err(StoreError::InvalidInput("nothing to update".to_string()).into());
    }
    Ok(store.update_environment(id, update).await?)
}

pub async fn delete_environment(store: &dyn RecordStore, id: &str) -> CommandResult<()> {
    store.delete_environment(id).await?;
    info!(id = %id, "deleted environment");
    Ok(())
}

// ============================================================================
// Provider commands
// ============================================================================

pub async fn probe_domain(
    provider: &dyn CloudProvider,
    settings: &Settings,
    domain: &str,
    apex: bool,
    cancel: &CancellationToken,
) -> CommandResult<ProbeResult> {
    let resolver = SystemResolver::new(settings.backup_resolver);
    let prober = LivenessProber::new(provider, &resolver, LivenessPolicy::from_settings(settings));
    let live = match prober.probe(domain, cancel).await {
        Ok(()) => true,
        Err(LivenessError::DomainNotLive { .. }) => false,
        Err(e) => return Err(e.into()),
    };
    let apex_content = if apex {
        Some(probe_apex_content(domain).await)
    } else {
        None
    };
    Ok(ProbeResult {
        domain: domain.to_string(),
        live,
        apex_content,
    })
}

// ============================================================================
// Backup commands
// ============================================================================

/// Bucket location given on the command line; the bucket name doubles as id
pub fn bucket_location(
    bucket: &str,
    hostname: &str,
    access_key_id: &str,
    secret_access_key: &str,
) -> (StateStoreCredentials, StateStoreDetails) {
    (
        StateStoreCredentials {
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
        },
        StateStoreDetails {
            id: bucket.to_string(),
            name: bucket.to_string(),
            hostname: hostname.trim_start_matches("https://").to_string(),
        },
    )
}

/// Scratch directory for backup transfers
pub fn scratch_dir(settings: &Settings) -> PathBuf {
    settings.home_dir.join("backups")
}

pub async fn backup_cluster(
    store: &dyn RecordStore,
    object_store: &dyn ObjectStore,
    credentials: &StateStoreCredentials,
    details: &StateStoreDetails,
    name: &str,
    scratch: &Path,
) -> CommandResult<String> {
    let record = store.get_record(name).await?;
    let key = export_cluster_record(object_store, credentials, details, &record, scratch).await?;
    Ok(key)
}

/// Fetch a record export and write it into the local store, replacing any
/// local record of the same name that no run currently holds
pub async fn restore_cluster(
    store: &dyn RecordStore,
    object_store: &dyn ObjectStore,
    credentials: &StateStoreCredentials,
    details: &StateStoreDetails,
    name: &str,
    scratch: &Path,
) -> CommandResult<ClusterRecord> {
    if !is_valid_cluster_name(name) {
        return Err(StoreError::InvalidInput(format!("invalid cluster name '{}'", name)).into());
    }
    let mut record =
        import_cluster_record(object_store, credentials, details, name, scratch).await?;
    if record.cluster_name != name {
        return Err(ObjectStoreError::Parse(format!(
            "export for {} holds cluster {}",
            name, record.cluster_name
        ))
        .into());
    }
    // A lease in the export belongs to whichever host made it
    record.lease = None;
    store.restore_record(record.clone()).await?;
    info!(cluster = %name, id = %record.id, "restored cluster record");
    Ok(record)
}
