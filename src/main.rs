//! azstore -- command-line client for blob and data lake storage.
//!
//! Every command runs under one cancellation token; Ctrl-C cancels it, which
//! stops in-flight chunk transfers and ACL batches at the next await point.

use std::path::PathBuf;
use std::sync::Arc;

use azstore::acl::{parse_acl, parse_remove_acl, AccessControlChanges, AclChangeMode};
use azstore::config::{load_config, Config};
use azstore::StorageError;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Command-line arguments for azstore.
#[derive(Parser, Debug)]
#[command(name = "azstore", version, about = "Blob and data lake storage client")]
struct Cli {
    /// Path to the YAML configuration file. Without one, the account and
    /// credentials come from the environment.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the account name.
    #[arg(short, long)]
    account: Option<String>,

    /// Record client metrics and print them in Prometheus text format when
    /// the command finishes.
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a blob container.
    CreateContainer { name: String },

    /// Delete a blob container.
    DeleteContainer { name: String },

    /// Upload a local file as a block blob.
    Upload {
        container: String,
        blob: String,
        file: PathBuf,
        /// Chunk size in bytes; 0 picks one automatically.
        #[arg(long)]
        chunk_size: Option<u64>,
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Download a blob (or a byte range of it) to a local file.
    Download {
        container: String,
        blob: String,
        file: PathBuf,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long)]
        count: Option<u64>,
        #[arg(long)]
        chunk_size: Option<u64>,
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Change the ACL of a data lake path and everything below it.
    SetAcl {
        file_system: String,
        path: String,
        /// Entries, e.g. `user::rwx,group::r-x,other::---`. For `remove`,
        /// entries without permissions, e.g. `user:<oid>,mask`.
        acl: String,
        #[arg(long, default_value = "set")]
        mode: String,
        #[arg(long)]
        batch_size: Option<u32>,
        #[arg(long)]
        max_batches: Option<u32>,
        /// Resume from a token printed by an earlier run.
        #[arg(long)]
        continuation: Option<String>,
        /// Keep going past per-path failures.
        #[arg(long)]
        continue_on_failure: bool,
    },
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Received SIGINT, cancelling");
                token.cancel();
            }
            Err(e) => warn!("failed to install Ctrl-C handler: {}", e),
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    if let Some(account) = &cli.account {
        config.account.name = account.clone();
    }

    init_tracing(&config);
    if cli.metrics {
        azstore::metrics::init_metrics()?;
        azstore::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }
    if let Some(path) = &cli.config {
        info!("Loaded configuration from {}", path.display());
    }

    let client = config.build_client()?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let mut transfer = config.transfer.clone();
    transfer.on_progress = Some(Arc::new(|bytes: u64| {
        info!("transferred {} bytes", bytes);
    }));

    match cli.command {
        Command::CreateContainer { name } => {
            client.container(&name).create(&cancel).await?;
            println!("created container {}", name);
        }
        Command::DeleteContainer { name } => {
            client.container(&name).delete(&cancel).await?;
            println!("deleted container {}", name);
        }
        Command::Upload {
            container,
            blob,
            file,
            chunk_size,
            concurrency,
        } => {
            if let Some(size) = chunk_size {
                transfer.chunk_size = size;
            }
            if let Some(n) = concurrency {
                transfer.max_concurrency = n;
            }
            let bytes = client
                .container(&container)
                .blob(&blob)
                .upload_file(&file, &transfer, &cancel)
                .await?;
            println!("uploaded {} bytes to {}/{}", bytes, container, blob);
        }
        Command::Download {
            container,
            blob,
            file,
            offset,
            count,
            chunk_size,
            concurrency,
        } => {
            if let Some(size) = chunk_size {
                transfer.chunk_size = size;
            }
            if let Some(n) = concurrency {
                transfer.max_concurrency = n;
            }
            let bytes = client
                .container(&container)
                .blob(&blob)
                .download_to_file(&file, offset, count, &transfer, &cancel)
                .await?;
            println!("downloaded {} bytes to {}", bytes, file.display());
        }
        Command::SetAcl {
            file_system,
            path,
            acl,
            mode,
            batch_size,
            max_batches,
            continuation,
            continue_on_failure,
        } => {
            let mode: AclChangeMode = mode.parse()?;
            let mut options = config.acl.clone();
            if batch_size.is_some() {
                options.batch_size = batch_size;
            }
            if max_batches.is_some() {
                options.max_batches = max_batches;
            }
            if continuation.is_some() {
                options.continuation_token = continuation;
            }
            options.continue_on_failure |= continue_on_failure;
            options.on_progress = Some(Arc::new(|changes: &AccessControlChanges| {
                for failure in &changes.batch_failures {
                    warn!("failed to change {}: {}", failure.name, failure.error_message);
                }
                info!(
                    "ACL progress: dirs={} files={} failures={}",
                    changes.aggregate_counters.changed_directories_count,
                    changes.aggregate_counters.changed_files_count,
                    changes.aggregate_counters.failed_changes_count
                );
            }));

            let target = client.file_system(&file_system).path(&path);
            let outcome = match mode {
                AclChangeMode::Set => {
                    target
                        .set_access_control_recursive(&parse_acl(&acl)?, &options, &cancel)
                        .await
                }
                AclChangeMode::Modify => {
                    target
                        .update_access_control_recursive(&parse_acl(&acl)?, &options, &cancel)
                        .await
                }
                AclChangeMode::Remove => {
                    target
                        .remove_access_control_recursive(&parse_remove_acl(&acl)?, &options, &cancel)
                        .await
                }
            };

            let result = match outcome {
                Ok(r) => r,
                Err(StorageError::AclChangeFailed {
                    source,
                    continuation_token: Some(token),
                }) => {
                    eprintln!("resume with --continuation {}", token);
                    return Err((*source).into());
                }
                Err(e) => return Err(e.into()),
            };
            println!(
                "changed {} directories and {} files, {} failures",
                result.counters.changed_directories_count,
                result.counters.changed_files_count,
                result.counters.failed_changes_count
            );
            if let Some(token) = result.continuation_token {
                println!("more paths remain; resume with --continuation {}", token);
            }
        }
    }

    if let Some(text) = azstore::metrics::render_metrics() {
        print!("{}", text);
    }
    Ok(())
}
