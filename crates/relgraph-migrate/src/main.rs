//! CLI entry point for the relgraph migration engine.
//!
//! Results (descriptor, mapping, plan, reports) go to stdout; logs go to
//! stderr as JSON.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use relgraph_checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use relgraph_core::{MappingConfig, SchemaDescriptor};
use relgraph_graph::{GraphClient, GraphStore, MemoryGraph};
use relgraph_source::{SourceStore, SqliteSource};

use relgraph_migrate::{
    GraphMapper, IntegrityAuditor, MigrationExecutor, MigrationPlan, ResumeFrom, SchemaAnalyzer,
    Settings,
};

#[derive(Parser)]
#[command(name = "relgraph")]
#[command(about = "Migrate a relational database into a property graph")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file prefix (default: relgraph).
    #[arg(short, long, default_value = "relgraph", global = true)]
    config: String,

    /// Override the source database path.
    #[arg(long, global = true)]
    source: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Introspect the source and print the schema descriptor as JSON Lines.
    Analyze,
    /// Print a suggested mapping configuration (YAML) for the source schema.
    Suggest,
    /// Validate a mapping file and print the ordered migration plan.
    Plan {
        #[arg(short, long)]
        mapping: PathBuf,
    },
    /// Execute a mapping file against the target graph.
    Run {
        #[arg(short, long)]
        mapping: PathBuf,
        /// Write to an in-memory graph instead of Neo4j.
        #[arg(long)]
        dry_run: bool,
        /// Continue each rule from its last checkpoint.
        #[arg(long, conflicts_with = "from_offset")]
        resume: bool,
        /// Start every rule at this row offset.
        #[arg(long)]
        from_offset: Option<u64>,
        /// Rows per batch (default from `[migration]`).
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Compare source and graph for every rule of a mapping file.
    Audit {
        #[arg(short, long)]
        mapping: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load(&cli.config)?;
    if let Some(path) = &cli.source {
        settings.source.path = path.clone();
    }

    let source: Arc<dyn SourceStore> = Arc::new(SqliteSource::open(&settings.source)?);

    match cli.command {
        Command::Analyze => {
            let descriptor = analyze(&source, &settings).await?;
            print!("{}", descriptor.to_jsonl()?);
        }
        Command::Suggest => {
            let descriptor = analyze(&source, &settings).await?;
            let mapping = GraphMapper::new().suggest_rules(&descriptor);
            print!("{}", mapping.to_yaml()?);
        }
        Command::Plan { ref mapping } => {
            let plan = load_plan(&source, &settings, mapping).await?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Command::Run {
            ref mapping,
            dry_run,
            resume,
            from_offset,
            batch_size,
        } => {
            let plan = load_plan(&source, &settings, mapping).await?;

            let (graph, checkpoints): (Arc<dyn GraphStore>, Arc<dyn CheckpointStore>) = if dry_run {
                (Arc::new(MemoryGraph::new()), Arc::new(MemoryCheckpointStore::new()))
            } else {
                let graph = GraphClient::connect(&settings.neo4j).await?;
                tracing::info!("Connected to Neo4j");
                (
                    Arc::new(graph),
                    Arc::new(FileCheckpointStore::new(&settings.migration.checkpoint_dir)?),
                )
            };

            let resume_from = match (resume, from_offset) {
                (true, _) => Some(ResumeFrom::Checkpoint),
                (false, Some(n)) => Some(ResumeFrom::Offset(n)),
                (false, None) => None,
            };
            let batch_size = batch_size.unwrap_or(settings.migration.batch_size);

            let executor =
                MigrationExecutor::new(source, graph, checkpoints, settings.migration.clone())
                    .dry_run(dry_run);
            let cancel = executor.cancel_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupt received, stopping at the next batch boundary");
                    cancel.cancel();
                }
            });

            let report = executor.run(&plan, batch_size, resume_from).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.succeeded() {
                anyhow::bail!("Migration did not complete; rerun with --resume to continue");
            }
        }
        Command::Audit { ref mapping } => {
            let plan = load_plan(&source, &settings, mapping).await?;
            let graph = GraphClient::connect(&settings.neo4j).await?;
            let auditor = IntegrityAuditor::new(source, Arc::new(graph), settings.audit.clone());
            let report = auditor.audit(&plan).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

async fn analyze(
    source: &Arc<dyn SourceStore>,
    settings: &Settings,
) -> anyhow::Result<SchemaDescriptor> {
    let analyzer = SchemaAnalyzer::new(source.clone(), settings.analyzer.clone());
    Ok(analyzer.analyze().await?)
}

async fn load_plan(
    source: &Arc<dyn SourceStore>,
    settings: &Settings,
    mapping: &Path,
) -> anyhow::Result<MigrationPlan> {
    let input = std::fs::read_to_string(mapping)?;
    let config = MappingConfig::from_yaml(&input)?;
    let descriptor = analyze(source, settings).await?;
    Ok(GraphMapper::new().build_plan(&descriptor, &config)?)
}
