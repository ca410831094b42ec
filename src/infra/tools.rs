//! Local CLI tool installation
//!
//! Downloads the kubectl and argocd binaries a cluster workspace needs.
//! Downloads are cached by URL hash so re-running a workspace, or creating
//! a second one, does not fetch the same release twice. Cache entries and
//! installed binaries are renamed into place once complete, so an
//! interrupted download never leaves a truncated file under the final name.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use super::InfraError;
use crate::config::GitProvider;

pub const KUBECTL_VERSION: &str = "v1.28.4";
pub const ARGOCD_VERSION: &str = "v2.9.3";

/// A binary to place in the tools directory
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDownload {
    pub name: &'static str,
    pub url: String,
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// Map Rust's target names to the names release artifacts use
pub fn release_platform(os: &str, arch: &str) -> (String, String) {
    let arch = match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    (os.to_string(), arch.to_string())
}

pub fn tool_downloads(os: &str, arch: &str) -> Vec<ToolDownload> {
    vec![
        ToolDownload {
            name: "kubectl",
            url: format!(
                "https://dl.k8s.io/release/{}/bin/{}/{}/kubectl",
                KUBECTL_VERSION, os, arch
            ),
        },
        ToolDownload {
            name: "argocd",
            url: format!(
                "https://github.com/argoproj/argo-cd/releases/download/{}/argocd-{}-{}",
                ARGOCD_VERSION, os, arch
            ),
        },
    ]
}

/// Deterministic cache location for a download URL
pub fn cache_path_for_url(url: &str, cache_dir: &Path) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let hash_str = format!("{:x}", hasher.finalize());
    cache_dir.join(&hash_str[..16])
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait ToolInstaller: Send + Sync {
    async fn download_tools(
        &self,
        git_provider: GitProvider,
        git_owner: &str,
        tools_dir: &Path,
    ) -> Result<(), InfraError>;
}

// ============================================================================
// SBIO: I/O implementation (HTTP downloads)
// ============================================================================

pub struct HttpToolInstaller {
    client: reqwest::Client,
    cache_dir: PathBuf,
}

impl HttpToolInstaller {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::new(),
            cache_dir: cache_dir.into(),
        }
    }

    async fn download_file(&self, url: &str, dest: &Path) -> Result<(), InfraError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| InfraError::Download(e.to_string()))?;

        if !response.status().is_success() {
            return Err(InfraError::Download(format!(
                "HTTP {} for {}",
                response.status(),
                url
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| InfraError::Download(e.to_string()))?;

        write_atomically(dest, &bytes).await
    }
}

/// Sibling of `dest` used while its content is being written
fn partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.{}.part", name, Uuid::new_v4().simple()))
}

/// `dest` is either absent or holds all of `bytes`
async fn write_atomically(dest: &Path, bytes: &[u8]) -> Result<(), InfraError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = partial_path(dest);
    tokio::fs::write(&partial, bytes).await?;
    persist(&partial, dest).await
}

async fn copy_atomically(src: &Path, dest: &Path) -> Result<(), InfraError> {
    let partial = partial_path(dest);
    tokio::fs::copy(src, &partial).await?;
    persist(&partial, dest).await
}

async fn persist(partial: &Path, dest: &Path) -> Result<(), InfraError> {
    if let Err(e) = tokio::fs::rename(partial, dest).await {
        let _ = tokio::fs::remove_file(partial).await;
        return Err(e.into());
    }
    debug!("wrote {}", dest.display());
    Ok(())
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<(), InfraError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<(), InfraError> {
    Ok(())
}

#[async_trait]
impl ToolInstaller for HttpToolInstaller {
    async fn download_tools(
        &self,
        git_provider: GitProvider,
        git_owner: &str,
        tools_dir: &Path,
    ) -> Result<(), InfraError> {
        info!(
            git_provider = %git_provider,
            git_owner = %git_owner,
            "installing dependencies into {}",
            tools_dir.display()
        );
        tokio::fs::create_dir_all(tools_dir).await?;

        let (os, arch) = release_platform(std::env::consts::OS, std::env::consts::ARCH);
        for tool in tool_downloads(&os, &arch) {
            let cached = cache_path_for_url(&tool.url, &self.cache_dir);
            if !tokio::fs::try_exists(&cached).await? {
                info!("downloading {} from {}", tool.name, tool.url);
                self.download_file(&tool.url, &cached).await?;
            }
            let dest = tools_dir.join(tool.name);
            copy_atomically(&cached, &dest).await?;
            make_executable(&dest).await?;
        }

        info!("download dependencies `{}` complete", tools_dir.display());
        Ok(())
    }
}

// ============================================================================
// SBIO: Mock implementation for testing (no I/O)
// ============================================================================

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct MockToolInstaller {
        pub call_count: AtomicUsize,
        pub fail: AtomicBool,
    }

    impl MockToolInstaller {
        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ToolInstaller for MockToolInstaller {
        async fn download_tools(
            &self,
            _git_provider: GitProvider,
            _git_owner: &str,
            _tools_dir: &Path,
        ) -> Result<(), InfraError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(InfraError::Download("HTTP 503 for kubectl".to_string()));
            }
            Ok(())
        }
    }
}
