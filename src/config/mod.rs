pub mod definition;
pub mod settings;

pub use definition::{ClusterDefinition, GitProvider, ProviderConfig};
pub use settings::{load_settings, parse_settings, Settings, Workspace};

use std::path::Path;
use thiserror::Error;

/// Errors while parsing or validating a cluster definition
#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("Failed to parse definition: {0}")]
    Parse(String),

    #[error("Invalid definition: {0}")]
    Invalid(String),

    #[error("Environment expansion failed: {0}")]
    EnvExpansion(String),
}

/// Errors for file I/O operations (separate from pure parsing errors)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Invalid settings: {0}")]
    Settings(String),
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load and parse a cluster definition file from disk.
pub fn load_definition_file(path: &Path) -> Result<ClusterDefinition, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let definition = ClusterDefinition::from_str(&content)?;
    Ok(definition)
}
