use std::process;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use clusterforge::cli::{
    backup_cluster, bucket_location, create_cluster, create_environment, delete_cluster,
    delete_environment, format_environment_detail, format_environment_list, format_probe_result,
    format_record_detail, format_record_list, format_report, format_string_list, get_cluster,
    get_environment, list_clusters, list_environments, load_cli_settings, open_store,
    probe_domain, provider_for, restore_cluster, scratch_dir, update_environment, BucketArgs, Cli,
    Commands, EnvCommands,
};
use clusterforge::config::{load_definition_file, Settings};
use clusterforge::objectstore::{S3ObjectStore, StateStoreCredentials, StateStoreDetails};
use clusterforge::store::EnvironmentUpdate;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = cli.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    let settings = match load_cli_settings(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load settings: {}", e);
            process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current operation");
            signal.cancel();
        }
    });

    if let Err(e) = run(cli.command, &settings, &cancel).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(
    command: Commands,
    settings: &Settings,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    match command {
        Commands::Create(args) => {
            let report = create_cluster(settings, &args.definition, cancel).await?;
            print!("{}", format_report(&report));
        }
        Commands::Get(args) => {
            let store = open_store(settings).await?;
            let record = get_cluster(store.as_ref(), &args.name).await?;
            print!("{}", format_record_detail(&record));
        }
        Commands::List => {
            let store = open_store(settings).await?;
            let records = list_clusters(store.as_ref()).await?;
            print!("{}", format_record_list(&records));
        }
        Commands::Delete(args) => {
            let store = open_store(settings).await?;
            delete_cluster(store.as_ref(), &args.id).await?;
            println!("Deleted cluster record {}", args.id);
        }
        Commands::Domains(args) => {
            let definition = load_definition_file(&args.definition)?;
            let domains = provider_for(settings, &definition).list_domains().await?;
            print!("{}", format_string_list("DOMAIN", &domains));
        }
        Commands::Regions(args) => {
            let definition = load_definition_file(&args.definition)?;
            let regions = provider_for(settings, &definition).list_regions().await?;
            print!("{}", format_string_list("REGION", &regions));
        }
        Commands::InstanceTypes(args) => {
            let definition = load_definition_file(&args.definition)?;
            let types = provider_for(settings, &definition)
                .list_instance_types(&args.region)
                .await?;
            print!("{}", format_string_list("INSTANCE TYPE", &types));
        }
        Commands::Probe(args) => {
            let definition = load_definition_file(&args.definition)?;
            let domain = args
                .domain
                .clone()
                .unwrap_or_else(|| definition.domain_name.clone());
            let provider = provider_for(settings, &definition);
            let result =
                probe_domain(provider.as_ref(), settings, &domain, args.apex, cancel).await?;
            print!("{}", format_probe_result(&result));
        }
        Commands::Backup(args) => {
            let store = open_store(settings).await?;
            let (credentials, details) = location(&args);
            let key = backup_cluster(
                store.as_ref(),
                &S3ObjectStore::new(),
                &credentials,
                &details,
                &args.name,
                &scratch_dir(settings),
            )
            .await
            .with_context(|| format!("backing up cluster {}", args.name))?;
            println!("Uploaded {} to bucket {}", key, details.name);
        }
        Commands::Restore(args) => {
            let store = open_store(settings).await?;
            let (credentials, details) = location(&args);
            let record = restore_cluster(
                store.as_ref(),
                &S3ObjectStore::new(),
                &credentials,
                &details,
                &args.name,
                &scratch_dir(settings),
            )
            .await
            .with_context(|| format!("restoring cluster {}", args.name))?;
            info!(cluster = %record.cluster_name, "restore complete");
            println!("Restored cluster record {} ({})", record.cluster_name, record.id);
        }
        Commands::Env(command) => {
            let store = open_store(settings).await?;
            match command {
                EnvCommands::List => {
                    let environments = list_environments(store.as_ref()).await?;
                    print!("{}", format_environment_list(&environments));
                }
                EnvCommands::Get(args) => {
                    let environment = get_environment(store.as_ref(), &args.name).await?;
                    print!("{}", format_environment_detail(&environment));
                }
                EnvCommands::Create(args) => {
                    let environment = create_environment(
                        store.as_ref(),
                        &args.name,
                        &args.color,
                        &args.description,
                    )
                    .await?;
                    println!("Created environment {} ({})", environment.name, environment.id);
                }
                EnvCommands::Update(args) => {
                    let update = EnvironmentUpdate {
                        color: args.color,
                        description: args.description,
                    };
                    let environment = update_environment(store.as_ref(), &args.id, &update).await?;
                    print!("{}", format_environment_detail(&environment));
                }
                EnvCommands::Delete(args) => {
                    delete_environment(store.as_ref(), &args.id).await?;
                    println!("Deleted environment {}", args.id);
                }
            }
        }
    }
    Ok(())
}

fn location(args: &BucketArgs) -> (StateStoreCredentials, StateStoreDetails) {
    bucket_location(
        &args.bucket,
        &args.hostname,
        &args.access_key_id,
        &args.secret_access_key,
    )
}
