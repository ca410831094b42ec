//! Deployment environments (development, staging, production, ...)
//!
//! Environments are labels the platform offers to workloads. They live next
//! to cluster records in the same store and are keyed by a unique name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::StoreError;
use crate::config::definition::is_valid_cluster_name;

// ============================================================================
// SBIO: Pure data structures
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub description: String,
    pub creation_timestamp: DateTime<Utc>,
}

/// Partial update; `None` leaves the field as it is
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl EnvironmentUpdate {
    pub fn is_empty(&self) -> bool {
        self.color.is_none() && self.description.is_none()
    }
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

impl Environment {
    /// New environment with a fresh id, after checking the name
    pub fn new(
        name: &str,
        color: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Self, StoreError> {
        check_environment_name(name)?;
        Ok(Self {
            id: Uuid::new_v4().simple().to_string(),
            name: name.to_string(),
            color: color.into(),
            description: description.into(),
            creation_timestamp: Utc::now(),
        })
    }

    pub fn apply(&mut self, update: &EnvironmentUpdate) {
        if let Some(color) = &update.color {
            self.color = color.clone();
        }
        if let Some(description) = &update.description {
            self.description = description.clone();
        }
    }
}

/// Environment names follow the same label rules as cluster names
pub fn check_environment_name(name: &str) -> Result<(), StoreError> {
    if !is_valid_cluster_name(name) {
        return Err(StoreError::InvalidInput(format!(
            "invalid environment name '{}'",
            name
        )));
    }
    Ok(())
}
