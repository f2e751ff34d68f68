use clap::{Parser, Subcommand};
use repodex_embed::FastEmbedProvider;
use repodex_retriever::RetrieverError;
use repodex_retriever::config::{INDEX_DIR_NAME, RetrieverConfig};
use repodex_retriever::retrieval::file_tree::FileTree;
use repodex_retriever::retrieval::indexing_engine::{IndexingEngine, IngestRequest};
use repodex_retriever::retrieval::progress::{BufferedIngestLog, JsonLinesSink, TracingObserver};
use repodex_retriever::retrieval::query::QueryEngine;
use repodex_retriever::status::HealthChecker;
use repodex_retriever::storage::registry::RepositoryRegistry;
use repodex_retriever::storage::sqlite_store::IndexStore;
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Index repositories for semantic search and query the index.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Index database file, overriding the configured one
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Index a repository directory, registering it on first use
    Ingest {
        path: PathBuf,
        /// Repository name used on first registration
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Rank a repository's chunks against a text
    Query {
        /// Repository name, path or id
        repository: String,
        text: String,
        /// Number of results
        #[arg(short, long, allow_negative_numbers = true)]
        limit: Option<i64>,
    },
    /// List registered repositories
    Repos,
    /// Show the indexed files of a repository as a tree
    Files { repository: String },
    /// Count rows and orphaned records
    Check,
    /// Remove orphaned records
    Repair,
    /// Report problems inside one repository
    Validate { repository: String },
    /// Delete a repository and everything indexed for it
    Delete { repository: String },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        match e.downcast_ref::<RetrieverError>() {
            Some(err) => eprintln!("Error ({:?}): {err}", err.kind()),
            None => eprintln!("Error: {e:#}"),
        }
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = RetrieverConfig::load(args.config.as_deref())?;
    let db_path = args
        .db
        .clone()
        .unwrap_or_else(|| config.storage.database_path.clone());
    let store = IndexStore::open(&db_path, &config.storage).await?;

    match args.command {
        Commands::Ingest { path, name } => {
            let provider = Arc::new(FastEmbedProvider::new(config.embedding.clone()));
            let engine = IndexingEngine::new(store, provider, &config);

            let cancel = engine.cancel_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, finishing files in progress");
                    cancel.cancel();
                }
            });

            let log = JsonLinesSink::open(&path.join(INDEX_DIR_NAME).join("ingest.log"))?;
            let observer = (
                TracingObserver,
                BufferedIngestLog::new(log, 64, Duration::from_secs(2)),
            );

            let mut request = IngestRequest::new(path);
            if let Some(name) = name {
                request = request.with_name(name);
            }
            let summary = engine.ingest(request, &observer).await?;

            if args.json {
                print_json(&summary)?;
            } else {
                println!(
                    "Indexed {} files ({} chunks), skipped {}, failed {}, removed {} in {:.2}s{}",
                    summary.files_processed,
                    summary.total_chunks,
                    summary.files_skipped,
                    summary.files_failed,
                    summary.files_removed,
                    summary.duration.as_secs_f64(),
                    if summary.cancelled { " (cancelled)" } else { "" }
                );
                for failure in &summary.failures {
                    println!(
                        "  failed {} ({:?}): {}",
                        failure.path.display(),
                        failure.kind,
                        failure.message
                    );
                }
            }
        }
        Commands::Query {
            repository,
            text,
            limit,
        } => {
            let provider = Arc::new(FastEmbedProvider::new(config.embedding.clone()));
            let engine = QueryEngine::new(store, provider, config.query.clone());
            let results = engine.query(&text, &repository, limit).await?;

            if args.json {
                print_json(&results)?;
            } else if results.is_empty() {
                println!("No results");
            } else {
                for (rank, result) in results.iter().enumerate() {
                    println!(
                        "{}. {}:{}-{} [chunk {}, {}] score {:.4}",
                        rank + 1,
                        result.file_path,
                        result.line_start + 1,
                        result.line_end,
                        result.chunk_index,
                        result.language.as_deref().unwrap_or(result.file_type.as_str()),
                        result.score
                    );
                    for line in result.content.lines().take(6) {
                        println!("    {line}");
                    }
                }
            }
        }
        Commands::Repos => {
            let repositories = RepositoryRegistry::new(store).list().await?;
            if args.json {
                print_json(&repositories)?;
            } else {
                for repo in &repositories {
                    let ingested = repo
                        .last_ingested_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string());
                    println!(
                        "{}  {}  {}  (ingested: {})",
                        repo.name,
                        repo.id,
                        repo.path.display(),
                        ingested
                    );
                }
            }
        }
        Commands::Files { repository } => {
            let repo = RepositoryRegistry::new(store.clone())
                .require(&repository)
                .await?;
            let files = store.list_files(&repo.id).await?;

            if args.json {
                print_json(&files)?;
            } else {
                println!("{}/", repo.path.display());
                for entry in FileTree::from_records(&repo.path, &files).entries() {
                    let indent = "  ".repeat(entry.depth + 1);
                    match entry.file {
                        Some(file) => println!(
                            "{indent}{} [{}{}] {} bytes",
                            entry.name,
                            file.file_type,
                            file.language
                                .as_deref()
                                .map(|l| format!(", {l}"))
                                .unwrap_or_default(),
                            file.size_bytes
                        ),
                        None => println!("{indent}{}/", entry.name),
                    }
                }
            }
        }
        Commands::Check => {
            let checker =
                HealthChecker::new(store).with_timeout(config.ingest.store_timeout());
            let report = checker.check().await?;
            if args.json {
                print_json(&report)?;
            } else {
                println!(
                    "repositories {}, files {}, chunks {}, embeddings {}",
                    report.stats.repositories,
                    report.stats.files,
                    report.stats.chunks,
                    report.stats.embeddings
                );
                println!(
                    "orphaned files {}, chunks {}, embeddings {}",
                    report.orphan_files, report.orphan_chunks, report.orphan_embeddings
                );
                match &report.probe_error {
                    Some(error) => println!("database probe failed: {error}"),
                    None => println!("database probe ok"),
                }
                println!("{}", if report.healthy { "healthy" } else { "UNHEALTHY" });
            }
        }
        Commands::Repair => {
            let checker =
                HealthChecker::new(store).with_timeout(config.ingest.store_timeout());
            let report = checker.repair().await?;
            if args.json {
                print_json(&report)?;
            } else {
                println!(
                    "Removed {} rows ({} embeddings, {} chunks, {} files)",
                    report.rows_removed(),
                    report.embeddings_removed,
                    report.chunks_removed,
                    report.files_removed
                );
            }
        }
        Commands::Validate { repository } => {
            let checker =
                HealthChecker::new(store)
                .with_expected_dimension(config.embedding.dimension)
                .with_timeout(config.ingest.store_timeout());
            let issues = checker.validate_repository(&repository).await?;
            if args.json {
                print_json(&issues)?;
            } else if issues.is_empty() {
                println!("No issues found");
            } else {
                for issue in &issues {
                    println!("- {issue}");
                }
            }
        }
        Commands::Delete { repository } => {
            let registry = RepositoryRegistry::new(store);
            let repo = registry.require(&repository).await?;
            let removed = registry.delete(&repo.id).await?;
            if args.json {
                print_json(&removed)?;
            } else {
                println!(
                    "Deleted repository {} ({} files, {} chunks, {} embeddings)",
                    repo.name, removed.files, removed.chunks, removed.embeddings
                );
            }
        }
    }

    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
