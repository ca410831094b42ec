//! CLI module for clusterforge
//!
//! Subcommands:
//! - `clusterforge create` - Provision (or resume provisioning) a cluster
//! - `clusterforge get` / `list` / `delete` - Inspect cluster records
//! - `clusterforge domains` / `regions` / `instance-types` / `probe` - Provider capabilities
//! - `clusterforge backup` / `restore` - Copy a cluster record through the state store
//! - `clusterforge env` - Manage deployment environments

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

#[derive(Parser, Debug)]
#[command(name = "clusterforge")]
#[command(about = "Provision a GitOps-managed Kubernetes platform, resumably")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to settings file (default: ~/.clusterforge/config)
    #[arg(long, global = true, env = "CLUSTERFORGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to a .env file for loading credentials
    #[arg(long, value_name = "FILE", global = true)]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision a cluster, resuming from its record if one exists
    Create(CreateArgs),

    /// Show one cluster record
    Get(GetArgs),

    /// List cluster records
    List,

    /// Delete a cluster record by id
    Delete(DeleteArgs),

    /// List DNS zones known to the provider
    Domains(ProviderArgs),

    /// List provider regions
    Regions(ProviderArgs),

    /// List instance types available in a region
    InstanceTypes(InstanceTypesArgs),

    /// Run the domain liveness probe
    Probe(ProbeArgs),

    /// Upload a cluster record to the state store bucket
    Backup(BucketArgs),

    /// Download a cluster record from the state store bucket
    Restore(BucketArgs),

    /// Manage deployment environments
    #[command(subcommand)]
    Env(EnvCommands),
}

#[derive(Subcommand, Debug)]
pub enum EnvCommands {
    /// List environments
    List,

    /// Show one environment
    Get(EnvNameArgs),

    /// Create an environment
    Create(EnvCreateArgs),

    /// Change an environment's color or description
    Update(EnvUpdateArgs),

    /// Delete an environment by id
    Delete(DeleteArgs),
}

#[derive(Parser, Debug)]
pub struct EnvNameArgs {
    /// Environment name
    pub name: String,
}

#[derive(Parser, Debug)]
pub struct EnvCreateArgs {
    /// Environment name (lowercase letters, digits and '-')
    pub name: String,

    #[arg(long, default_value = "")]
    pub color: String,

    #[arg(long, default_value = "")]
    pub description: String,
}

#[derive(Parser, Debug)]
pub struct EnvUpdateArgs {
    /// Environment id (32 hex characters)
    pub id: String,

    #[arg(long)]
    pub color: Option<String>,

    #[arg(long)]
    pub description: Option<String>,
}

/// Arguments for the create command
#[derive(Parser, Debug)]
pub struct CreateArgs {
    /// Path to the cluster definition (YAML or JSON)
    pub definition: PathBuf,
}

#[derive(Parser, Debug)]
pub struct GetArgs {
    /// Cluster name
    pub name: String,
}

#[derive(Parser, Debug)]
pub struct DeleteArgs {
    /// Record id (32 hex characters)
    pub id: String,
}

/// Provider credentials come from a cluster definition
#[derive(Parser, Debug)]
pub struct ProviderArgs {
    #[arg(short, long, env = "CLUSTERFORGE_DEFINITION")]
    pub definition: PathBuf,
}

#[derive(Parser, Debug)]
pub struct InstanceTypesArgs {
    #[arg(short, long, env = "CLUSTERFORGE_DEFINITION")]
    pub definition: PathBuf,

    #[arg(long)]
    pub region: String,
}

#[derive(Parser, Debug)]
pub struct ProbeArgs {
    /// Domain to probe (default: the definition's domain)
    pub domain: Option<String>,

    #[arg(short, long, env = "CLUSTERFORGE_DEFINITION")]
    pub definition: PathBuf,

    /// Also report whether the apex already serves content
    #[arg(long)]
    pub apex: bool,
}

/// Where a cluster record export lives
#[derive(Parser, Debug)]
pub struct BucketArgs {
    /// Cluster name
    pub name: String,

    /// State store bucket name
    #[arg(long)]
    pub bucket: String,

    /// S3 endpoint hostname, without scheme
    #[arg(long)]
    pub hostname: String,

    #[arg(long, env = "STATE_STORE_ACCESS_KEY_ID", hide_env_values = true)]
    pub access_key_id: String,

    #[arg(long, env = "STATE_STORE_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub secret_access_key: String,
}
