mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use strongroom::config::StrongroomConfig;
use strongroom::storage::SourceKind;

#[derive(Parser)]
#[command(name = "strongroom", version, about = "Encrypted multi-tenant memory store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a config file with fresh keys and create the database
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Check database health and tenant isolation
    Doctor,
    /// Print fresh key material as environment variables
    Keygen,
    /// Embed and store a chunk of text
    Index {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        document: String,
        #[arg(long, default_value = "api")]
        source: SourceKind,
        /// JSON metadata sealed alongside the text
        #[arg(long)]
        metadata: Option<String>,
        #[arg(long)]
        chunk_index: Option<u32>,
        /// Expire the chunk after this many seconds
        #[arg(long)]
        ttl: Option<u64>,
        text: String,
    },
    /// Search a tenant's chunks
    Query {
        #[arg(long)]
        tenant: String,
        #[arg(short, long, default_value_t = 5)]
        k: usize,
        /// Re-score candidates with the cross-encoder
        #[arg(long)]
        rerank: bool,
        text: String,
    },
    /// Print a document's chunks in order
    Summarize {
        #[arg(long)]
        tenant: String,
        document: String,
    },
    /// Extract references, dates, emails and names from a document
    Entities {
        #[arg(long)]
        tenant: String,
        document: String,
    },
    /// Delete a chunk
    Delete {
        #[arg(long)]
        tenant: String,
        chunk_id: String,
    },
    /// Show a tenant's audit trail
    Audit {
        #[arg(long)]
        tenant: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Delete expired chunks across all tenants
    Purge,
    /// Compare sealed vector backups with stored vectors
    Verify {
        #[arg(long)]
        tenant: String,
    },
    /// Manage the local models
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the embedding model and cross-encoder to ~/.strongroom/models/
    Download,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config (for log level)
    let config = StrongroomConfig::load()?;

    // Log to stderr so stdout stays clean for JSON output.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Init { force } => cli::init::init(force)?,
        Command::Doctor => cli::doctor::doctor(&config)?,
        Command::Keygen => cli::init::keygen(),
        Command::Index {
            tenant,
            document,
            source,
            metadata,
            chunk_index,
            ttl,
            text,
        } => {
            let metadata = metadata
                .map(|m| serde_json::from_str(&m))
                .transpose()
                .map_err(|e| anyhow::anyhow!("--metadata is not valid JSON: {e}"))?;
            cli::ops::index(
                &config,
                cli::ops::IndexArgs {
                    tenant,
                    document,
                    source,
                    metadata,
                    chunk_index,
                    ttl,
                    text,
                },
            )
            .await?
        }
        Command::Query {
            tenant,
            k,
            rerank,
            text,
        } => cli::ops::query(&config, &tenant, &text, k, rerank).await?,
        Command::Summarize { tenant, document } => {
            cli::ops::summarize(&config, &tenant, &document).await?
        }
        Command::Entities { tenant, document } => {
            cli::ops::entities(&config, &tenant, &document).await?
        }
        Command::Delete { tenant, chunk_id } => cli::ops::delete(&config, &tenant, &chunk_id).await?,
        Command::Audit { tenant, limit } => cli::ops::audit(&config, &tenant, limit).await?,
        Command::Purge => cli::ops::purge(&config).await?,
        Command::Verify { tenant } => cli::ops::verify(&config, &tenant).await?,
        Command::Model { action } => match action {
            ModelAction::Download => cli::model_download(&config).await?,
        },
    }

    Ok(())
}
