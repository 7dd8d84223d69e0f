//! kgraph CLI - Command-line interface
//!
//! Usage:
//!   kgraph ingest <file> [--workers N] [--strict] [--no-schema-evolution]
//!   kgraph stats
//!   kgraph show <entity> [--depth N]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kgraph_core::{AppConfig, Graph, LoggingConfig, NodeRef};
use kgraph_extractor::llm::create_llm_client;
use kgraph_extractor::llm_extractor::{LlmExtractor, LlmSchemaAdvisor};
use kgraph_pipeline::{Pipeline, ProgressEvent, ShutdownMode, TaskStatus};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kgraph")]
#[command(about = "Incremental knowledge graph construction")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Graph snapshot path (overrides storage.graph_path)
    #[arg(long, global = true)]
    graph: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract statements from a file (one per line) into the graph
    Ingest {
        /// Input file
        file: PathBuf,

        /// Number of extraction workers
        #[arg(long)]
        workers: Option<usize>,

        /// Abort a statement's merge on its first failed item
        #[arg(long)]
        strict: bool,

        /// Never extend the schema
        #[arg(long)]
        no_schema_evolution: bool,
    },
    /// Print graph statistics
    Stats,
    /// Show an entity and its neighbourhood
    Show {
        /// Entity name or node id
        entity: String,

        /// Traversal depth
        #[arg(long, default_value_t = 1)]
        depth: usize,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    // The `kgraph` target prefix covers every workspace crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("kgraph={}", logging.level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json_format {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::default(),
    };
    Ok(config.with_env_override()?)
}

/// Load the saved graph, or start from the configured schema
fn open_graph(config: &AppConfig, path: &Path) -> anyhow::Result<Graph> {
    if path.exists() {
        let graph = Graph::load(path)
            .with_context(|| format!("failed to load graph from {}", path.display()))?;
        return Ok(graph);
    }

    tracing::info!(path = %path.display(), "no saved graph, starting from configured schema");
    let system = config.schema.clone().into_system()?;
    Ok(Graph::with_seed_entities(system))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    init_tracing(&config.logging);

    if let Some(graph) = cli.graph {
        config.storage.graph_path = graph;
    }
    let graph_path = config.storage.graph_path.clone();

    match cli.command {
        Commands::Ingest {
            file,
            workers,
            strict,
            no_schema_evolution,
        } => {
            if let Some(workers) = workers {
                config.pipeline.extraction_workers = workers;
            }
            config.pipeline.strict_merge |= strict;
            config.pipeline.schema_evolution &= !no_schema_evolution;
            ingest(&config, &file, &graph_path).await?;
        }
        Commands::Stats => {
            let graph = open_graph(&config, &graph_path)?;
            let stats = graph.stats();
            println!("Graph: {}", graph_path.display());
            println!("  classes:       {}", stats.class_count);
            println!("  entities:      {}", stats.entity_count);
            println!("  class nodes:   {}", stats.class_node_count);
            println!("  relationships: {}", stats.relationship_count);
        }
        Commands::Show { entity, depth } => {
            let graph = open_graph(&config, &graph_path)?;
            show(&graph, &entity, depth)?;
        }
    }

    Ok(())
}

async fn ingest(config: &AppConfig, file: &Path, graph_path: &Path) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let statements: Vec<&str> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    let graph = open_graph(config, graph_path)?;
    let client = create_llm_client(&config.llm)?;
    tracing::info!(provider = ?config.llm.provider, statements = statements.len(), "ingesting");

    let extractor = LlmExtractor::new(client.clone()).with_check(config.llm.check_extraction);
    let pipeline = Pipeline::builder(graph, Arc::new(extractor))
        .with_advisor(Arc::new(LlmSchemaAdvisor::new(client)))
        .with_config(config.pipeline.clone())
        .with_observer(|event: &ProgressEvent| {
            tracing::info!(
                task_id = %event.task_id,
                stage = %event.stage,
                progress = event.percentage,
                "{}",
                event.message
            );
        })
        .start()?;

    let ids = statements
        .iter()
        .map(|statement| pipeline.submit(*statement))
        .collect::<Result<Vec<_>, _>>()?;

    let mode = tokio::select! {
        _ = pipeline.wait_idle() => ShutdownMode::Drain,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted, cancelling outstanding statements");
            ShutdownMode::Cancel
        }
    };

    let mut failed = 0;
    for (id, statement) in ids.iter().zip(&statements) {
        let Ok(report) = pipeline.status(*id) else {
            continue;
        };
        if report.status == TaskStatus::Failed {
            failed += 1;
            eprintln!(
                "failed: {statement}: {}",
                report.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    let stats = pipeline.statistics();

    let graph = pipeline.shutdown(mode).await?;
    graph
        .save(graph_path)
        .with_context(|| format!("failed to save graph to {}", graph_path.display()))?;

    println!(
        "{} statements, {} failed; graph now has {} entities and {} relationships",
        ids.len(),
        failed,
        graph.entity_count(),
        graph.relationship_count()
    );
    tracing::debug!(tasks = ?stats.tasks_by_status, "task summary");
    Ok(())
}

fn show(graph: &Graph, id: &str, depth: usize) -> anyhow::Result<()> {
    let node = graph
        .resolve_node(id)
        .with_context(|| format!("no entity or node named '{id}'"))?;

    if let NodeRef::Entity { name } = &node {
        if let Some(entity) = graph.get_entity(name) {
            println!("{}", entity.name);
            if !entity.description.is_empty() {
                println!("  {}", entity.description);
            }
            for instance in &entity.classes {
                println!("  [{}]", instance.class_name);
                for (property, value) in &instance.properties {
                    println!("    {property} = {}", value.as_deref().unwrap_or("-"));
                }
            }
        }
    } else {
        println!("{}", node.id());
    }

    let view = graph.node_graph();
    let outgoing = view.outgoing(&node.id());
    if !outgoing.is_empty() {
        println!("Edges:");
        for (target, edge) in outgoing {
            println!("  -> {} ({edge:?})", target.id());
        }
    }

    println!("Within {depth} hop(s):");
    for neighbour in view.neighbourhood(&node.id(), depth) {
        println!("  {}", neighbour.id());
    }
    Ok(())
}
