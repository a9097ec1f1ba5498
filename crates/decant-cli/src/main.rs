use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use decant_core::{CompiledConfig, MappingConfig};
use decant_import::{SchemaManager, DEFAULT_FETCH_LIMIT};
use decant_storage::{DocumentStore, JsonlDocumentStore, MemoryStore, PgStore, RelationalStore};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "decant")]
#[command(about = "Decant documents from schema-less dumps into relational tables")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Prepare destination tables and import documents.
    Run(RunArgs),
    /// Compile the mapping file and list what it declares.
    Validate {
        /// Mapping configuration file.
        #[arg(long)]
        mapping: PathBuf,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Mapping configuration file.
    #[arg(long)]
    mapping: PathBuf,
    /// Dump root holding `<db>/<collection>.jsonl` files; the `db` comes
    /// from the mapping file.
    #[arg(long)]
    source: PathBuf,
    /// Destination connection string; falls back to DATABASE_URL. Without
    /// either, rows land in an in-memory store (dry run).
    #[arg(long)]
    dest: Option<String>,
    /// Restrict the run to these destination tables (repeatable).
    #[arg(long = "table")]
    tables: Vec<String>,
    /// Documents fetched per source per run.
    #[arg(long, default_value_t = DEFAULT_FETCH_LIMIT)]
    limit: usize,
    /// Write the full JSON report here.
    #[arg(long)]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Commands::Run(args) => run(args).await,
        Commands::Validate { mapping } => validate(&mapping),
    }
}

fn load_compiled(path: &Path) -> Result<CompiledConfig> {
    MappingConfig::from_path(path)
        .with_context(|| format!("loading {}", path.display()))?
        .compile()
        .context("compiling mapping configuration")
}

fn validate(mapping: &Path) -> Result<()> {
    let compiled = load_compiled(mapping)?;
    println!("db: {}", compiled.db);
    for (name, value_type) in &compiled.converters {
        println!("converter {name}: {value_type:?} -> key");
    }
    for table in &compiled.mappings {
        println!(
            "table {}: {} column(s), {} source(s), refresh={}",
            table.name(),
            table.table.columns.len(),
            table.sources.len(),
            table.refresh
        );
    }
    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    let compiled = load_compiled(&args.mapping)?;
    let documents: Arc<dyn DocumentStore> =
        Arc::new(JsonlDocumentStore::new(args.source.join(&compiled.db)));

    let dest = args
        .dest
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());
    let relational: Arc<dyn RelationalStore> = match &dest {
        Some(url) => Arc::new(
            PgStore::connect(url)
                .await
                .context("connecting to destination store")?,
        ),
        None => {
            eprintln!("no destination configured; dry run into an in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let mut manager = SchemaManager::new(compiled, relational, documents);
    manager.select(&args.tables)?;
    let report = manager.run(args.limit).await?;

    println!(
        "import complete: run_id={} documents={} inserted={} rejected={}",
        report.run_id,
        report.total_documents(),
        report.total_inserted(),
        report.total_rejected()
    );
    for mapping in &report.mappings {
        println!(
            "  {}: documents={} inserted={} rejected={} skipped={}",
            mapping.table, mapping.documents, mapping.inserted, mapping.rejected, mapping.skipped
        );
    }

    if let Some(path) = &args.report {
        let bytes = serde_json::to_vec_pretty(&report).context("serializing report")?;
        std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}
