use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use cost_event_store::{
    config::Config,
    storage::{
        metrics, sort_by_timestamp, Cancellation, InMemoryEngine, StorageConfig,
        StorageConfigBuilder, StorageManager,
    },
    telemetry,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "cost-event-store")]
#[command(about = "Time-partitioned cost event store", long_about = None, version)]
struct Cli {
    /// Search engine backend
    #[arg(long, value_enum, default_value_t = EngineKind::Meilisearch)]
    engine: EngineKind,

    /// Engine endpoint, replacing the configured ones
    #[arg(short, long, env = "OVERRIDE_STORAGE_ENDPOINT")]
    endpoint: Option<String>,

    /// Query this partition instead of the current one
    #[arg(short, long)]
    partition: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EngineKind {
    Meilisearch,
    Memory,
}

#[derive(Subcommand)]
enum Commands {
    /// Keep partitions rotating and ingest newline-delimited events from stdin
    Serve,

    /// Ingest newline-delimited events from a file ("-" for stdin)
    Ingest {
        #[arg(value_name = "FILE", default_value = "-")]
        path: String,
    },

    /// Per-resource-type summary of one execution
    Summary {
        #[arg(short = 'x', long)]
        execution_id: String,

        /// Extra `key=value` filter on detected resources
        #[arg(short, long = "filter", value_parser = parse_filter)]
        filters: Vec<(String, String)>,
    },

    /// List executions
    Executions {
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },

    /// Detected resources of one type within one execution
    Resources {
        #[arg(short = 't', long)]
        resource_type: String,

        #[arg(short = 'x', long)]
        execution_id: String,

        #[arg(short, long = "filter", value_parser = parse_filter)]
        filters: Vec<(String, String)>,

        /// Free-text search
        #[arg(short, long, default_value = "")]
        search: String,
    },

    /// Cost per execution for one resource type, oldest first
    Trends {
        #[arg(short = 't', long)]
        resource_type: String,

        #[arg(short, long = "filter", value_parser = parse_filter)]
        filters: Vec<(String, String)>,

        /// Keep only the most recent points
        #[arg(short, long, default_value = "30")]
        limit: usize,
    },

    /// Tag values observed within one execution
    Tags {
        #[arg(short = 'x', long)]
        execution_id: String,
    },

    /// Inspect or remove partitions
    Partitions {
        #[command(subcommand)]
        action: PartitionAction,
    },
}

#[derive(Subcommand)]
enum PartitionAction {
    /// List partitions
    List,

    /// Delete a partition
    Delete {
        #[arg(value_name = "PARTITION")]
        name: String,
    },
}

fn parse_filter(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected key=value, got {:?}", raw)),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Cancellation tripped by Ctrl-C
fn ctrl_c_cancellation() -> Cancellation {
    let (handle, cancel) = Cancellation::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            handle.cancel();
        }
    });
    cancel
}

async fn open_storage(engine: EngineKind, config: StorageConfig) -> anyhow::Result<StorageManager> {
    let storage = match engine {
        EngineKind::Meilisearch => StorageManager::connect(config).await,
        EngineKind::Memory => {
            let config = StorageConfigBuilder::new()
                .index_prefix(config.index_prefix)
                .search_limit(config.search_limit)
                .without_delays()
                .build();
            StorageManager::new(Arc::new(InMemoryEngine::new()), config).await
        }
    };
    storage.context("Failed to initialize storage")
}

async fn ingest_lines<R>(storage: &Arc<StorageManager>, reader: R) -> anyhow::Result<(u64, u64)>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut handles = Vec::new();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let storage = storage.clone();
        handles.push(tokio::spawn(async move { storage.save(&line).await }));
    }

    let outcomes = futures::future::join_all(handles).await;
    let stored = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, Ok(true)))
        .count() as u64;
    Ok((stored, outcomes.len() as u64 - stored))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load().unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {}", e);
        eprintln!("Using default configuration");
        Config::default()
    });
    telemetry::init(&config.observability);

    if let Some(endpoints) = &cli.endpoint {
        config.apply_endpoint_override(endpoints);
    }

    tracing::info!("Starting cost event store v{}", env!("CARGO_PKG_VERSION"));

    let storage = Arc::new(open_storage(cli.engine, config.storage).await?);
    let cancel = ctrl_c_cancellation();
    let partition = match &cli.partition {
        Some(name) => name.clone(),
        None => storage
            .current_partition()
            .context("No current partition")?,
    };
    let queries = storage.queries();

    match cli.command {
        Commands::Serve => {
            tracing::info!(partition = %partition, "Reading events from stdin");
            let stdin = BufReader::new(tokio::io::stdin());
            tokio::select! {
                result = ingest_lines(&storage, stdin) => {
                    let (stored, dropped) = result?;
                    tracing::info!(stored, dropped, "Input closed");
                }
                _ = cancel.cancelled() => {}
            }
            print!("{}", metrics::gather_text());
        }

        Commands::Ingest { path } => {
            let (stored, dropped) = if path == "-" {
                ingest_lines(&storage, BufReader::new(tokio::io::stdin())).await?
            } else {
                let file = tokio::fs::File::open(&path)
                    .await
                    .with_context(|| format!("Failed to open {}", path))?;
                ingest_lines(&storage, BufReader::new(file)).await?
            };
            println!("stored {} events, dropped {}", stored, dropped);
        }

        Commands::Summary {
            execution_id,
            filters,
        } => {
            let filters: HashMap<_, _> = filters.into_iter().collect();
            match queries
                .get_summary_in(&partition, &execution_id, &filters, &cancel)
                .await
            {
                Ok(summary) => print_json(&summary)?,
                Err(e) => {
                    print_json(&e.partial)?;
                    bail!(e);
                }
            }
        }

        Commands::Executions { limit } => {
            let executions = queries
                .get_executions_in(&partition, limit, &cancel)
                .await?;
            print_json(&executions)?;
        }

        Commands::Resources {
            resource_type,
            execution_id,
            filters,
            search,
        } => {
            let filters: HashMap<_, _> = filters.into_iter().collect();
            let resources = queries
                .get_resources_in(&partition, &resource_type, &execution_id, &filters, &search, &cancel)
                .await?;
            print_json(&resources)?;
        }

        Commands::Trends {
            resource_type,
            filters,
            limit,
        } => {
            let filters: HashMap<_, _> = filters.into_iter().collect();
            let mut points = queries
                .get_resource_trends_in(&partition, &resource_type, &filters, limit, &cancel)
                .await?;
            sort_by_timestamp(&mut points);
            let skip = points.len().saturating_sub(limit);
            print_json(&points[skip..])?;
        }

        Commands::Tags { execution_id } => {
            let tags = queries
                .get_execution_tags_in(&partition, &execution_id, &cancel)
                .await?;
            print_json(&tags)?;
        }

        Commands::Partitions { action } => match action {
            PartitionAction::List => {
                for name in storage.client().list_partitions().await? {
                    let marker = if Some(&name) == storage.current_partition().as_ref() {
                        "*"
                    } else {
                        " "
                    };
                    println!("{} {}", marker, name);
                }
            }
            PartitionAction::Delete { name } => {
                if Some(&name) == storage.current_partition().as_ref() {
                    bail!("Refusing to delete the current partition {}", name);
                }
                if storage.client().delete_partition(&name).await? {
                    println!("deleted {}", name);
                } else {
                    println!("{} does not exist", name);
                }
            }
        },
    }

    storage.shutdown();
    Ok(())
}
