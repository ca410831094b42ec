//! Terraform runner

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use super::{run_command, InfraError};

/// One `terraform apply` of a module directory
#[derive(Clone, Default)]
pub struct TerraformRun {
    pub working_dir: PathBuf,
    pub variables: BTreeMap<String, String>,
    /// Process environment, e.g. backend credentials
    pub env: BTreeMap<String, String>,
}

impl fmt::Debug for TerraformRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerraformRun")
            .field("working_dir", &self.working_dir)
            .field("variables", &self.variables.keys().collect::<Vec<_>>())
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TerraformRun {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Arguments of the apply invocation
    pub fn apply_args(&self) -> Vec<String> {
        let mut args = vec![
            "apply".to_string(),
            "-auto-approve".to_string(),
            "-input=false".to_string(),
        ];
        for (key, value) in &self.variables {
            args.push("-var".to_string());
            args.push(format!("{}={}", key, value));
        }
        args
    }
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait Terraform: Send + Sync {
    /// `terraform init` then `terraform apply -auto-approve`
    async fn apply(&self, run: &TerraformRun) -> Result<(), InfraError>;
}

// ============================================================================
// SBIO: I/O implementation (terraform CLI)
// ============================================================================

pub struct TerraformCli {
    binary: PathBuf,
}

impl TerraformCli {
    /// Use `terraform` from PATH
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("terraform"),
        }
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, dir: &Path, run: &TerraformRun) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.current_dir(dir).envs(&run.env);
        cmd
    }
}

impl Default for TerraformCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Terraform for TerraformCli {
    async fn apply(&self, run: &TerraformRun) -> Result<(), InfraError> {
        let dir = &run.working_dir;
        info!("terraform init in {}", dir.display());
        run_command(
            self.command(dir, run).args(["init", "-input=false"]),
            &format!("terraform init ({})", dir.display()),
            None,
        )
        .await?;

        info!("terraform apply in {}", dir.display());
        run_command(
            self.command(dir, run).args(run.apply_args()),
            &format!("terraform apply ({})", dir.display()),
            None,
        )
        .await?;
        info!("terraform apply in {} complete", dir.display());
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

    /// Records every run; fails runs whose directory ends with `fail_stack`
    #[derive(Default)]
    pub struct MockTerraform {
        pub runs: Mutex<Vec<TerraformRun>>,
        pub fail_stack: Mutex<Option<String>>,
    }

    impl MockTerraform {
        pub fn stacks(&self) -> Vec<String> {
            self.runs
                .lock()
                .unwrap()
                .iter()
                .filter_map(|r| r.working_dir.file_name())
                .map(|n| n.to_string_lossy().to_string())
                .collect()
        }
    }

    #[async_trait]
    impl Terraform for MockTerraform {
        async fn apply(&self, run: &TerraformRun) -> Result<(), InfraError> {
            self.runs.lock().unwrap().push(run.clone());
            let fail = self.fail_stack.lock().unwrap().clone();
            match fail {
                Some(stack) if run.working_dir.ends_with(&stack) => {
                    Err(InfraError::CommandFailed {
                        command: format!("terraform apply ({})", run.working_dir.display()),
                        message: format!("Error: creating {} resources", stack),
                    })
                }
                _ => Ok(()),
            }
        }
    }
}
