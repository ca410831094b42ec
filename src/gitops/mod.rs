//! GitOps repository workspace
//!
//! The gitops repository is seeded from a template directory, rendered with
//! the cluster's values, and pushed to the git provider with the bot key.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{ClusterDefinition, GitProvider};
use crate::infra::{run_command, InfraError};

pub const GITOPS_REPO_NAME: &str = "gitops";
pub const DEFAULT_BRANCH: &str = "main";
pub const BOT_KEY_FILE: &str = "id_ed25519";
pub const BOT_KEY_COMMENT: &str = "clusterforge-bot";

#[derive(Error, Debug)]
pub enum GitError {
    #[error("Git command failed: {0}")]
    Command(#[from] InfraError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Template error: {0}")]
    Template(String),
}

/// The bot's SSH identity used to push the gitops repository
#[derive(Debug, Clone, PartialEq)]
pub struct BotKey {
    pub private_key_path: PathBuf,
    pub public_key: String,
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// SSH remote of the gitops repository
pub fn remote_url(provider: GitProvider, owner: &str) -> String {
    format!("git@{}:{}/{}.git", provider.ssh_host(), owner, GITOPS_REPO_NAME)
}

/// Placeholder tokens substituted into the gitops template
pub fn template_tokens(
    definition: &ClusterDefinition,
    state_store_bucket: &str,
) -> BTreeMap<String, String> {
    let mut tokens = BTreeMap::new();
    let mut put = |k: &str, v: String| {
        tokens.insert(format!("<{}>", k), v);
    };
    put("CLUSTER_NAME", definition.cluster_name.clone());
    put("DOMAIN_NAME", definition.domain_name.clone());
    put("ADMIN_EMAIL", definition.admin_email.clone());
    put("GIT_PROVIDER", definition.git_provider.to_string());
    put("GIT_OWNER", definition.git_owner.clone());
    put(
        "GITOPS_REPO_URL",
        remote_url(definition.git_provider, &definition.git_owner),
    );
    put("CLOUD_PROVIDER", definition.provider_name().to_string());
    put("CLOUD_REGION", definition.region.clone());
    put("NODE_TYPE", definition.node_type.clone());
    put("NODE_COUNT", definition.node_count.to_string());
    put("STATE_STORE_BUCKET", state_store_bucket.to_string());
    tokens
}

/// Replace every token occurrence in `content`
pub fn render_tokens(content: &str, tokens: &BTreeMap<String, String>) -> String {
    tokens
        .iter()
        .fold(content.to_string(), |acc, (token, value)| acc.replace(token, value))
}

/// Copy the tree under `src` into `dst`; returns the number of files copied
async fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<usize> {
    let mut copied = 0;
    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), target));
            } else {
                tokio::fs::copy(entry.path(), &target).await?;
                copied += 1;
            }
        }
    }
    Ok(copied)
}

async fn render_dir(dir: &Path, tokens: &BTreeMap<String, String>) -> std::io::Result<usize> {
    let mut rendered = 0;
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                if entry.file_name() != ".git" {
                    pending.push(path);
                }
                continue;
            }
            // Binary files are left alone
            let Ok(content) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            let output = render_tokens(&content, tokens);
            if output != content {
                tokio::fs::write(&path, output).await?;
                rendered += 1;
            }
        }
    }
    Ok(rendered)
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait GitWorkspace: Send + Sync {
    /// Seed `repo_dir` from the template and point it at `remote`
    async fn init(
        &self,
        repo_dir: &Path,
        template_dir: Option<&Path>,
        remote: &str,
    ) -> Result<(), GitError>;

    /// Create the bot SSH key pair, reusing an existing one
    async fn initialize_bot(&self, ssh_dir: &Path) -> Result<BotKey, GitError>;

    /// Render template tokens; returns how many files changed
    async fn prepare(
        &self,
        repo_dir: &Path,
        tokens: &BTreeMap<String, String>,
    ) -> Result<usize, GitError>;

    async fn push(&self, repo_dir: &Path, ssh_key: &Path) -> Result<(), GitError>;
}

// ============================================================================
// SBIO: I/O implementation (git and ssh-keygen CLIs)
// ============================================================================

pub struct GitCli {
    git: PathBuf,
    ssh_keygen: PathBuf,
}

impl GitCli {
    pub fn new() -> Self {
        Self {
            git: PathBuf::from("git"),
            ssh_keygen: PathBuf::from("ssh-keygen"),
        }
    }

    async fn git(&self, repo_dir: &Path, args: &[&str]) -> Result<String, GitError> {
        let mut cmd = Command::new(&self.git);
        cmd.current_dir(repo_dir).args(args);
        Ok(run_command(&mut cmd, &format!("git {}", args.join(" ")), None).await?)
    }
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GitWorkspace for GitCli {
    async fn init(
        &self,
        repo_dir: &Path,
        template_dir: Option<&Path>,
        remote: &str,
    ) -> Result<(), GitError> {
        tokio::fs::create_dir_all(repo_dir).await?;
        if let Some(template) = template_dir {
            let copied = copy_dir(template, repo_dir).await?;
            debug!("copied {} template files from {}", copied, template.display());
        }

        if !tokio::fs::try_exists(repo_dir.join(".git")).await? {
            self.git(repo_dir, &["init", "-b", DEFAULT_BRANCH]).await?;
        }
        // Replace any stale remote from an earlier attempt
        let _ = self.git(repo_dir, &["remote", "remove", "origin"]).await;
        self.git(repo_dir, &["remote", "add", "origin", remote]).await?;
        info!("initialized gitops repository at {}", repo_dir.display());
        Ok(())
    }

    async fn initialize_bot(&self, ssh_dir: &Path) -> Result<BotKey, GitError> {
        tokio::fs::create_dir_all(ssh_dir).await?;
        let private_key_path = ssh_dir.join(BOT_KEY_FILE);
        let public_key_path = ssh_dir.join(format!("{}.pub", BOT_KEY_FILE));

        if !tokio::fs::try_exists(&private_key_path).await? {
            let key_path = private_key_path.to_string_lossy().to_string();
            let mut cmd = Command::new(&self.ssh_keygen);
            cmd.args(["-t", "ed25519", "-N", "", "-C", BOT_KEY_COMMENT, "-f", &key_path]);
            run_command(&mut cmd, "ssh-keygen -t ed25519", None).await?;
            info!("created bot ssh key {}", key_path);
        }

        let public_key = tokio::fs::read_to_string(&public_key_path)
            .await?
            .trim()
            .to_string();
        Ok(BotKey {
            private_key_path,
            public_key,
        })
    }

    async fn prepare(
        &self,
        repo_dir: &Path,
        tokens: &BTreeMap<String, String>,
    ) -> Result<usize, GitError> {
        if !tokio::fs::try_exists(repo_dir).await? {
            return Err(GitError::Template(format!(
                "gitops repository {} does not exist",
                repo_dir.display()
            )));
        }
        let rendered = render_dir(repo_dir, tokens).await?;
        info!("rendered {} gitops files", rendered);
        Ok(rendered)
    }

    async fn push(&self, repo_dir: &Path, ssh_key: &Path) -> Result<(), GitError> {
        self.git(repo_dir, &["add", "-A"]).await?;
        let status = self.git(repo_dir, &["status", "--porcelain"]).await?;
        if !status.trim().is_empty() {
            self.git(
                repo_dir,
                &[
                    "-c",
                    "user.name=clusterforge-bot",
                    "-c",
                    "user.email=bot@clusterforge.local",
                    "commit",
                    "-m",
                    "initial gitops commit",
                ],
            )
            .await?;
        }

        let ssh_command = format!(
            "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new",
            ssh_key.display()
        );
        let mut cmd = Command::new(&self.git);
        cmd.current_dir(repo_dir)
            .env("GIT_SSH_COMMAND", ssh_command)
            .args(["push", "-u", "origin", DEFAULT_BRANCH]);
        run_command(&mut cmd, "git push -u origin main", None).await?;
        info!("pushed gitops repository");
        Ok(())
    }
}

// ============================================================================
// SBIO: Mock implementation for testing (no I/O)
// ============================================================================
