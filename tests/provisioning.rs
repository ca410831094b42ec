//! End-to-end provisioning runs against a file-backed record store
//!
//! Every external system is replaced by one in-process fake that logs the
//! calls it receives, so these tests see the orchestrator exactly as a
//! caller of the public API would.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use clusterforge::config::{ClusterDefinition, GitProvider, Settings};
use clusterforge::controller::{Collaborators, ErrorKind, Outcome, Provisioner, StageId};
use clusterforge::dns::{DnsError, TxtResolver};
use clusterforge::gitops::{BotKey, GitError, GitWorkspace, BOT_KEY_FILE};
use clusterforge::infra::{
    ControlPlane, InfraError, PortForwardTarget, SecretSpec, Terraform, TerraformRun,
    ToolInstaller, Workload, WorkloadKind,
};
use clusterforge::objectstore::{StateStoreCredentials, StateStoreDetails};
use clusterforge::provider::{CloudProvider, DnsRecord, ProviderError};
use clusterforge::store::{ClusterStatus, FileRecordStore, RecordStore};
use clusterforge::telemetry::{TelemetryEvent, TelemetrySink};

const DEFINITION: &str = r#"
cluster_name: mgmt
domain_name: example.com
admin_email: ops@example.com
git_provider: github
git_owner: acme
git_token: token
region: ewr
node_type: vc2-4c-8gb
provider:
  type: vultr
  api_key: key
"#;

/// One fake for every collaborator, sharing a call log
#[derive(Default)]
struct World {
    log: Mutex<Vec<String>>,
    fail_on: Mutex<Option<String>>,
    records: Mutex<Vec<DnsRecord>>,
    tunnel_stop: Mutex<Option<oneshot::Receiver<()>>>,
    events: Mutex<Vec<String>>,
    terraform_vars: Mutex<Vec<BTreeMap<String, String>>>,
}

impl World {
    /// Record `op`; true when the test asked for it to fail
    fn hit(&self, op: &str) -> bool {
        self.log.lock().unwrap().push(op.to_string());
        self.fail_on.lock().unwrap().as_deref() == Some(op)
    }

    fn fail(&self, op: &str) {
        *self.fail_on.lock().unwrap() = Some(op.to_string());
    }

    fn heal(&self) {
        *self.fail_on.lock().unwrap() = None;
        self.log.lock().unwrap().clear();
    }

    fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn infra_failure(op: &str) -> InfraError {
        InfraError::CommandFailed {
            command: op.to_string(),
            message: "injected".to_string(),
        }
    }
}

#[async_trait]
impl CloudProvider for World {
    fn name(&self) -> &'static str {
        "vultr"
    }

    async fn test_domain_liveness(&self, _domain: &str) -> Result<bool, ProviderError> {
        Ok(true)
    }

    async fn list_dns_records(&self, _domain: &str) -> Result<Vec<DnsRecord>, ProviderError> {
        if self.hit("list_dns_records") {
            return Err(ProviderError::Http("injected".to_string()));
        }
        Ok(self.records.lock().unwrap().clone())
    }

    async fn create_dns_record(
        &self,
        _domain: &str,
        record: &DnsRecord,
    ) -> Result<DnsRecord, ProviderError> {
        if self.hit("create_dns_record") {
            return Err(ProviderError::Api {
                status: 400,
                message: "injected".to_string(),
            });
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(record.clone())
    }

    async fn get_domain_info(&self, domain: &str) -> Result<String, ProviderError> {
        Ok(domain.to_string())
    }

    async fn list_domains(&self) -> Result<Vec<String>, ProviderError> {
        Ok(vec!["example.com".to_string()])
    }

    async fn list_regions(&self) -> Result<Vec<String>, ProviderError> {
        Ok(vec!["ewr".to_string()])
    }

    async fn list_instance_types(&self, _region: &str) -> Result<Vec<String>, ProviderError> {
        Ok(vec!["vc2-4c-8gb".to_string()])
    }

    async fn create_state_store(
        &self,
        bucket: &str,
    ) -> Result<(StateStoreCredentials, StateStoreDetails), ProviderError> {
        if self.hit("create_state_store") {
            return Err(ProviderError::StateStoreNotReady("injected".to_string()));
        }
        Ok((
            StateStoreCredentials {
                access_key_id: "AK".to_string(),
                secret_access_key: "SK".to_string(),
            },
            StateStoreDetails {
                id: "os-1".to_string(),
                name: bucket.to_string(),
                hostname: "ewr1.vultrobjects.com".to_string(),
            },
        ))
    }

    async fn state_store_credentials(
        &self,
        _details: &StateStoreDetails,
    ) -> Result<StateStoreCredentials, ProviderError> {
        if self.hit("state_store_credentials") {
            return Err(ProviderError::NotFound("os-1".to_string()));
        }
        Ok(StateStoreCredentials {
            access_key_id: "AK".to_string(),
            secret_access_key: "SK".to_string(),
        })
    }
}

#[async_trait]
impl TxtResolver for World {
    async fn lookup_txt(&self, fqdn: &str) -> Result<Vec<String>, DnsError> {
        if self.hit("lookup_txt") {
            return Err(DnsError::Lookup {
                name: fqdn.to_string(),
                message: "injected".to_string(),
            });
        }
        Ok(vec!["domain record propagated".to_string()])
    }
}

#[async_trait]
impl ToolInstaller for World {
    async fn download_tools(
        &self,
        _git_provider: GitProvider,
        _git_owner: &str,
        _tools_dir: &Path,
    ) -> Result<(), InfraError> {
        if self.hit("download_tools") {
            return Err(Self::infra_failure("download_tools"));
        }
        Ok(())
    }
}

#[async_trait]
impl GitWorkspace for World {
    async fn init(
        &self,
        _repo_dir: &Path,
        _template_dir: Option<&Path>,
        _remote: &str,
    ) -> Result<(), GitError> {
        if self.hit("git_init") {
            return Err(GitError::Template("injected".to_string()));
        }
        Ok(())
    }

    async fn initialize_bot(&self, ssh_dir: &Path) -> Result<BotKey, GitError> {
        if self.hit("initialize_bot") {
            return Err(GitError::Template("injected".to_string()));
        }
        Ok(BotKey {
            private_key_path: ssh_dir.join(BOT_KEY_FILE),
            public_key: "ssh-ed25519 AAAA bot".to_string(),
        })
    }

    async fn prepare(
        &self,
        _repo_dir: &Path,
        tokens: &BTreeMap<String, String>,
    ) -> Result<usize, GitError> {
        if self.hit("prepare") {
            return Err(GitError::Template("injected".to_string()));
        }
        Ok(tokens.len())
    }

    async fn push(&self, _repo_dir: &Path, _ssh_key: &Path) -> Result<(), GitError> {
        if self.hit("push") {
            return Err(GitError::Template("injected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Terraform for World {
    async fn apply(&self, run: &TerraformRun) -> Result<(), InfraError> {
        let stack = run
            .working_dir
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let op = format!("apply:{}", stack);
        if self.hit(&op) {
            return Err(Self::infra_failure(&op));
        }
        self.terraform_vars
            .lock()
            .unwrap()
            .push(run.variables.clone());
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for World {
    async fn bootstrap_secrets(
        &self,
        _namespaces: &[String],
        _secrets: &[SecretSpec],
    ) -> Result<(), InfraError> {
        if self.hit("bootstrap_secrets") {
            return Err(Self::infra_failure("bootstrap_secrets"));
        }
        Ok(())
    }

    async fn restore_tls_secrets(&self, _dir: &Path) -> Result<usize, InfraError> {
        if self.hit("restore_tls_secrets") {
            return Err(Self::infra_failure("restore_tls_secrets"));
        }
        Ok(1)
    }

    async fn install_gitops_controller(&self) -> Result<(), InfraError> {
        if self.hit("install_gitops_controller") {
            return Err(Self::infra_failure("install_gitops_controller"));
        }
        Ok(())
    }

    async fn apply_manifest(&self, _path: &Path) -> Result<(), InfraError> {
        if self.hit("apply_manifest") {
            return Err(Self::infra_failure("apply_manifest"));
        }
        Ok(())
    }

    async fn find_workload(
        &self,
        kind: WorkloadKind,
        _key: &str,
        value: &str,
        namespace: &str,
        _timeout: Duration,
    ) -> Result<Workload, InfraError> {
        let op = format!("find_workload:{}", value);
        if self.hit(&op) {
            return Err(InfraError::Timeout {
                what: op,
                timeout: Duration::from_secs(1),
            });
        }
        Ok(Workload {
            kind,
            name: value.to_string(),
            namespace: namespace.to_string(),
        })
    }

    async fn wait_ready(&self, workload: &Workload, _timeout: Duration) -> Result<(), InfraError> {
        let op = format!("wait_ready:{}", workload.name);
        if self.hit(&op) {
            return Err(InfraError::Timeout {
                what: op,
                timeout: Duration::from_secs(1),
            });
        }
        Ok(())
    }

    async fn initialize_vault(&self) -> Result<(), InfraError> {
        if self.hit("initialize_vault") {
            return Err(Self::infra_failure("initialize_vault"));
        }
        Ok(())
    }

    async fn vault_root_token(&self) -> Result<String, InfraError> {
        if self.hit("vault_root_token") {
            return Err(Self::infra_failure("vault_root_token"));
        }
        Ok("root-token".to_string())
    }

    async fn open_port_forward(
        &self,
        _target: &PortForwardTarget,
        stop: oneshot::Receiver<()>,
    ) -> Result<(), InfraError> {
        if self.hit("open_port_forward") {
            return Err(Self::infra_failure("open_port_forward"));
        }
        *self.tunnel_stop.lock().unwrap() = Some(stop);
        Ok(())
    }
}

#[async_trait]
impl TelemetrySink for World {
    fn transmit(&self, event: TelemetryEvent) {
        self.events.lock().unwrap().push(event.event);
    }

    async fn close(&self) {}
}

struct Harness {
    _home: TempDir,
    settings: Settings,
    world: Arc<World>,
    definition: ClusterDefinition,
}

impl Harness {
    fn new() -> Self {
        let home = TempDir::new().unwrap();
        let settings = Settings {
            home_dir: home.path().to_path_buf(),
            store_dir: home.path().join("clusters"),
            settle_delay_secs: 0,
            ..Default::default()
        };
        let ssh_dir = settings.workspace("mgmt").ssh_dir();
        std::fs::create_dir_all(&ssh_dir).unwrap();
        std::fs::write(ssh_dir.join(BOT_KEY_FILE), "private key\n").unwrap();

        Self {
            _home: home,
            settings,
            world: Arc::new(World::default()),
            definition: ClusterDefinition::from_str(DEFINITION).unwrap(),
        }
    }

    /// A fresh store handle, as a new process would open it
    async fn store(&self) -> Arc<FileRecordStore> {
        Arc::new(FileRecordStore::open(&self.settings.store_dir).await.unwrap())
    }

    async fn provisioner(&self, holder: &str) -> Provisioner {
        let deps = Collaborators {
            store: self.store().await,
            provider: self.world.clone(),
            resolver: self.world.clone(),
            tools: self.world.clone(),
            git: self.world.clone(),
            terraform: self.world.clone(),
            control_plane: self.world.clone(),
            telemetry: self.world.clone(),
        };
        Provisioner::new(deps, self.settings.clone()).with_holder(holder)
    }
}

#[tokio::test]
async fn test_full_run_persists_a_provisioned_record() {
    let h = Harness::new();
    let report = h
        .provisioner("host-a")
        .await
        .run(&h.definition, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.skipped(), 0);
    assert_eq!(report.outcome(StageId::MarkProvisioned), Some(Outcome::Completed));

    let record = h.store().await.get_record("mgmt").await.unwrap();
    assert_eq!(record.status, ClusterStatus::Provisioned);
    assert!(!record.in_progress);
    assert!(record.lease.is_none());
    assert!(record.vault_terraform_apply_check);
    assert_eq!(
        record.state_store_details.map(|d| d.name),
        Some("mgmt-state-store".to_string())
    );

    let calls = h.world.calls();
    let pos = |op: &str| calls.iter().position(|c| c == op).unwrap();
    assert!(pos("download_tools") < pos("create_dns_record"));
    assert!(pos("apply:github") < pos("push"));
    assert!(pos("push") < pos("apply:vultr"));
    assert!(pos("initialize_vault") < pos("open_port_forward"));
    assert!(pos("open_port_forward") < pos("apply:vault"));
    assert!(pos("apply:users") < pos("find_workload:console"));

    assert_eq!(
        *h.world.events.lock().unwrap(),
        vec!["mgmt_cluster_install_completed".to_string()]
    );

    let mut stop = h.world.tunnel_stop.lock().unwrap().take().unwrap();
    assert!(stop.try_recv().is_ok());
}

#[tokio::test]
async fn test_failed_run_resumes_in_a_new_process() {
    let h = Harness::new();
    h.world.fail("apply:vultr");

    let err = h
        .provisioner("host-a")
        .await
        .run(&h.definition, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.stage(), StageId::CreateCluster);
    assert_eq!(err.kind(), ErrorKind::ExternalCallFailed);

    let record = h.store().await.get_record("mgmt").await.unwrap();
    assert!(!record.in_progress);
    assert!(record.gitops_pushed_check);
    assert!(!record.cloud_terraform_apply_check);
    assert!(record.lease.is_none());

    h.world.heal();
    let report = h
        .provisioner("host-b")
        .await
        .run(&h.definition, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome(StageId::DownloadTools), Some(Outcome::Skipped));
    assert_eq!(report.outcome(StageId::RepositoryPush), Some(Outcome::Skipped));
    assert_eq!(report.outcome(StageId::CreateCluster), Some(Outcome::Completed));

    let calls = h.world.calls();
    assert!(!calls.contains(&"download_tools".to_string()));
    assert!(!calls.contains(&"create_state_store".to_string()));
    // Credentials are looked up again from the persisted details
    assert!(calls.contains(&"state_store_credentials".to_string()));
    assert_eq!(
        h.store().await.get_record("mgmt").await.unwrap().status,
        ClusterStatus::Provisioned
    );
}

#[tokio::test]
async fn test_second_holder_is_refused_while_lease_is_live() {
    let h = Harness::new();
    let store = h.store().await;
    store.create_record(&h.definition).await.unwrap();
    store
        .acquire_lease("mgmt", "host-a", Duration::from_secs(3600))
        .await
        .unwrap();

    let err = h
        .provisioner("host-b")
        .await
        .run(&h.definition, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.stage(), StageId::Init);
    assert_eq!(err.kind(), ErrorKind::LeaseHeld);
    assert!(h.world.calls().is_empty());

    let record = store.get_record("mgmt").await.unwrap();
    assert_eq!(record.lease.map(|l| l.holder), Some("host-a".to_string()));
}

#[tokio::test]
async fn test_vault_stacks_receive_tunnel_address() {
    let h = Harness::new();
    h.provisioner("host-a")
        .await
        .run(&h.definition, &CancellationToken::new())
        .await
        .unwrap();

    let vars = h.world.terraform_vars.lock().unwrap();
    let vault_runs: Vec<_> = vars
        .iter()
        .filter(|v| v.contains_key("vault_addr"))
        .collect();
    assert_eq!(vault_runs.len(), 2);
    for run in vault_runs {
        assert_eq!(run["vault_addr"], "http://127.0.0.1:8200");
        assert_eq!(run["vault_token"], "root-token");
    }
}
