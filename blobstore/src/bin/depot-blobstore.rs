use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use depot_blobstore::blobstore::BlobStore;
use depot_blobstore::composition::{
    with_registry, Composition, DeserializeWithRegistry, ServiceBuilder, REG,
};
use depot_blobstore::{
    BlobHeaders, BlobId, BLOB_NAME_HEADER, CREATED_BY_HEADER, TEMPORARY_BLOB_HEADER,
};
use futures::TryStreamExt;
use tracing::{info, Level};

type BlobStoreConfigs =
    HashMap<String, DeserializeWithRegistry<Box<dyn ServiceBuilder<Output = dyn BlobStore>>>>;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Whether to log in JSON
    #[arg(long)]
    json: bool,

    #[arg(long)]
    log_level: Option<Level>,

    /// Composition of blob stores, in TOML or JSON (by file extension).
    #[arg(long, env = "DEPOT_BLOBSTORE_CONFIG")]
    config: PathBuf,

    /// The store of the composition to operate on.
    #[arg(long, env = "DEPOT_BLOBSTORE_STORE", default_value = "default")]
    store: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stores a file as a new blob, printing its id.
    Put {
        #[clap(value_name = "PATH")]
        path: PathBuf,

        /// Mark the blob temporary, to be promoted or cleaned up later.
        #[arg(long)]
        temp: bool,

        /// Blob name, defaults to the file name.
        #[arg(long)]
        name: Option<String>,
    },
    /// Writes the contents of a blob to stdout.
    Get {
        id: String,

        #[arg(long)]
        include_deleted: bool,
    },
    /// Prints whether a live blob exists.
    Exists { id: String },
    /// Soft-deletes a blob, or purges it with --hard.
    Delete {
        id: String,

        #[arg(long)]
        hard: bool,

        #[arg(long, default_value = "deleted by depot-blobstore")]
        reason: String,
    },
    /// Lists all blob ids, soft-deleted ones included.
    Ls,
    /// Makes a temporary blob permanent.
    Promote { id: String },
    /// Prints the operation metrics accumulated by this invocation.
    Metrics,
}

fn load_configs(path: &Path) -> Result<BlobStoreConfigs, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let configs = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => with_registry(&REG, || serde_json::from_str(&contents))?,
        _ => with_registry(&REG, || toml::from_str(&contents))?,
    };
    Ok(configs)
}

async fn run(
    blob_store: &Arc<dyn BlobStore>,
    command: Commands,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Put { path, temp, name } => {
            let name = name
                .or_else(|| {
                    path.file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                })
                .unwrap_or_default();

            let mut headers = BlobHeaders::from([
                (BLOB_NAME_HEADER.to_string(), name),
                (CREATED_BY_HEADER.to_string(), "depot-blobstore".to_string()),
            ]);
            if temp {
                headers.insert(TEMPORARY_BLOB_HEADER.to_string(), "true".to_string());
            }

            let mut file = tokio::fs::File::open(&path).await?;
            let blob = blob_store.create(&mut file, headers).await?;
            info!(blob.id = %blob.id(), blob.size = blob.metrics().size, "stored blob");
            println!("{}", blob.id());
        }
        Commands::Get {
            id,
            include_deleted,
        } => {
            let id = BlobId::new(id);
            let blob = blob_store
                .get(&id, include_deleted)
                .await?
                .ok_or_else(|| depot_blobstore::Error::NotFound(id.clone()))?;

            let mut reader = blob.open_read().await?;
            tokio::io::copy(&mut reader, &mut tokio::io::stdout()).await?;
        }
        Commands::Exists { id } => {
            println!("{}", blob_store.exists(&BlobId::new(id)).await?);
        }
        Commands::Delete { id, hard, reason } => {
            let id = BlobId::new(id);
            let deleted = if hard {
                blob_store.delete_hard(&id).await?
            } else {
                blob_store.delete(&id, &reason).await?
            };
            println!("{}", deleted);
        }
        Commands::Ls => {
            let mut ids = blob_store.blob_id_stream();
            while let Some(id) = ids.try_next().await? {
                println!("{}", id);
            }
        }
        Commands::Promote { id } => {
            let id = BlobId::new(id);
            let blob = blob_store
                .get(&id, false)
                .await?
                .ok_or_else(|| depot_blobstore::Error::NotFound(id.clone()))?;
            if !blob.is_temporary() {
                info!(blob.id = %id, "blob is already permanent");
            }

            let promoted = blob_store
                .make_blob_permanent(&blob, blob.headers().clone())
                .await?;
            println!("{}", promoted.id());
        }
        Commands::Metrics => {
            let delta = blob_store.operation_metrics_delta();
            println!("{}", serde_json::to_string_pretty(&delta)?);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    depot_tracing::TracingBuilder::default()
        .level(cli.log_level.unwrap_or(Level::INFO))
        .json(cli.json)
        .build()?;

    let composition = Composition::<dyn BlobStore>::from_configs(load_configs(&cli.config)?);
    let blob_store = composition.build(&cli.store).await?;

    let res = run(&blob_store, cli.command).await;
    blob_store.stop().await?;
    res
}
