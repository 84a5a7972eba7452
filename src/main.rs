//! CLI entry point for vecscope.
//!
//! Loads JSONL datasets into a vector store and runs index builds,
//! similarity search, 3-D projection and clustering against it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use serde_json::json;

use vecscope::build::{BuildHandle, BuildTarget};
use vecscope::display::{
    BuildProgress, create_cluster_table, create_projection_table, create_search_table,
};
use vecscope::io::{DatasetError, ExitCode, load_store};
use vecscope::{BuildCoordinator, BuildError, BuildResult, Settings, VectorError, VectorStore};

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Vector analysis toolkit
#[derive(Parser)]
#[command(
    name = "vecscope",
    version = env!("CARGO_PKG_VERSION"),
    about = "Nearest-neighbor search, 3-D projection and clustering over embedding datasets",
    next_line_help = true,
    styles = clap_cargo_style()
)]
struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Set up .vecscope directory with default configuration")]
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    #[command(about = "Display active settings")]
    Config,

    #[command(about = "Build the nearest-neighbor index for a dataset")]
    Build {
        /// JSONL dataset, one {"id", "vector"} object per line
        dataset: PathBuf,

        /// Candidate list size during construction
        #[arg(long)]
        ef_construction: Option<usize>,

        /// Write the built index to this file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Skip the artifact cache
        #[arg(long)]
        no_cache: bool,
    },

    #[command(about = "Find the nearest neighbors of a stored id or a literal vector")]
    Search {
        dataset: PathBuf,

        /// Query with the vector stored under this id
        #[arg(long, conflicts_with = "vector", required_unless_present = "vector")]
        id: Option<String>,

        /// Comma-separated query vector
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        vector: Option<Vec<f32>>,

        #[arg(short, long, default_value_t = 10)]
        k: usize,

        /// Search-time candidate list size
        #[arg(long)]
        ef: Option<usize>,

        /// Drop hits scoring below this similarity
        #[arg(long)]
        threshold: Option<f32>,

        /// Use a previously exported index instead of building one
        #[arg(long)]
        index: Option<PathBuf>,

        /// Output JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    #[command(about = "Project a dataset onto its top three principal axes")]
    Project {
        dataset: PathBuf,

        /// Write the projection as JSON to this file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Number of points to print
        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long)]
        no_cache: bool,
    },

    #[command(about = "Group a dataset into clusters with cosine K-means")]
    Cluster {
        dataset: PathBuf,

        /// Cluster count; suggested from the dataset size when omitted
        #[arg(short, long)]
        k: Option<usize>,

        /// Seed for reproducible clustering
        #[arg(long)]
        seed: Option<u64>,

        /// Restrict clustering to these comma-separated ids
        #[arg(long, value_delimiter = ',')]
        ids: Option<Vec<String>>,

        /// Output JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match load_settings(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(ExitCode::ConfigError.into());
        }
    };

    let level = if cli.verbose {
        "debug"
    } else {
        settings.logging.level.as_str()
    };
    vecscope::logging::init(level);
    configure_thread_pool(settings.build.parallel_threads);

    let code = match run(cli.command, settings).await {
        Ok(code) => code,
        Err(e) => {
            match e.downcast_ref::<BuildError>() {
                Some(build_error) => eprintln!("{}", build_error.report()),
                None => eprintln!("Error: {e:#}"),
            }
            exit_code_for(&e)
        }
    };
    std::process::exit(code.into());
}

fn load_settings(path: Option<&Path>) -> Result<Settings, Box<figment::Error>> {
    match path {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
}

fn configure_thread_pool(threads: usize) {
    if let Err(e) = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
    {
        tracing::debug!("rayon pool already configured: {e}");
    }
}

fn exit_code_for(error: &anyhow::Error) -> ExitCode {
    if let Some(e) = error.downcast_ref::<BuildError>() {
        ExitCode::from_build_error(e)
    } else if let Some(e) = error.downcast_ref::<VectorError>() {
        ExitCode::from_vector_error(e)
    } else if let Some(e) = error.downcast_ref::<DatasetError>() {
        match e {
            DatasetError::Io(_) => ExitCode::IoError,
            DatasetError::Parse { .. } => ExitCode::InputError,
        }
    } else {
        ExitCode::GeneralError
    }
}

async fn run(command: Commands, settings: Settings) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Init { force } => {
            let path = Settings::init_config_file(force)
                .map_err(|e| anyhow::anyhow!("{e}"))
                .context("could not write configuration")?;
            println!("Created configuration file at: {}", path.display());
            println!("Edit this file to customize your settings.");
            Ok(ExitCode::Success)
        }

        Commands::Config => {
            let rendered = toml::to_string_pretty(&settings)?;
            println!("{rendered}");
            Ok(ExitCode::Success)
        }

        Commands::Build {
            dataset,
            ef_construction,
            output,
            no_cache,
        } => {
            let store = load_dataset(&dataset)?;
            let coordinator = BuildCoordinator::new(&settings);
            let mut params = coordinator.index().params();
            if let Some(ef_construction) = ef_construction {
                params = params.with_ef_construction(ef_construction);
            }
            let options = coordinator
                .options()
                .with_cache(settings.cache.enabled && !no_cache);

            let stats = follow(coordinator.start_index_build_with(store, params, options)).await?;
            println!("{stats}");

            if let Some(output) = output {
                let bytes = coordinator.index().export()?;
                std::fs::write(&output, &bytes)
                    .with_context(|| format!("could not write {}", output.display()))?;
                println!("Exported index to {} ({} bytes)", output.display(), bytes.len());
            }
            Ok(ExitCode::Success)
        }

        Commands::Search {
            dataset,
            id,
            vector,
            k,
            ef,
            threshold,
            index,
            json,
        } => {
            let store = load_dataset(&dataset)?;
            let coordinator = BuildCoordinator::new(&settings);

            match index {
                Some(path) => {
                    let bytes = std::fs::read(&path)
                        .with_context(|| format!("could not read {}", path.display()))?;
                    coordinator.index().try_import(&bytes)?;
                }
                None => {
                    follow(coordinator.start_index_build(Arc::clone(&store), coordinator.options()))
                        .await?;
                }
            }
            if let Some(ef) = ef {
                coordinator.index().set_ef_search(ef);
            }

            let query = match (&id, vector) {
                (Some(id), _) => match store.get(id) {
                    Some(v) => v.to_vec(),
                    None => {
                        eprintln!("No vector stored under '{id}'");
                        return Ok(ExitCode::NotFound);
                    }
                },
                (None, Some(vector)) => vector,
                (None, None) => anyhow::bail!("either --id or --vector is required"),
            };

            let hits = match threshold {
                Some(threshold) => coordinator
                    .index()
                    .search_with_threshold(&query, k, threshold),
                None => coordinator.search(&query, k),
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else if hits.is_empty() {
                println!("No results");
            } else {
                println!("{}", create_search_table(&hits));
            }
            Ok(ExitCode::from_results(&hits))
        }

        Commands::Project {
            dataset,
            output,
            limit,
            no_cache,
        } => {
            let store = load_dataset(&dataset)?;
            let coordinator = BuildCoordinator::new(&settings);
            let options = coordinator
                .options()
                .with_cache(settings.cache.enabled && !no_cache);

            follow(coordinator.start_projection(store, options)).await?;
            let projection = coordinator
                .projection()
                .context("projection build finished without a result")?;

            println!("{}", create_projection_table(&projection, limit));
            if let Some(output) = output {
                std::fs::write(&output, projection.to_json()?)
                    .with_context(|| format!("could not write {}", output.display()))?;
                println!("Wrote projection to {}", output.display());
            }
            Ok(ExitCode::Success)
        }

        Commands::Cluster {
            dataset,
            k,
            seed,
            ids,
            json,
        } => {
            let mut store = load_dataset(&dataset)?;
            if let Some(ids) = ids {
                let subset = store.subset(ids.iter().map(String::as_str));
                if subset.len() < ids.len() {
                    tracing::warn!(
                        requested = ids.len(),
                        found = subset.len(),
                        "some requested ids are not in the dataset"
                    );
                }
                store = Arc::new(subset);
            }

            let coordinator = BuildCoordinator::new(&settings);
            let mut config = coordinator.kmeans_config();
            if let Some(k) = k {
                config = config.with_k(k);
            }
            if seed.is_some() {
                config = config.with_seed(seed);
            }

            let result = follow(coordinator.start_clustering(
                Arc::clone(&store),
                config,
                coordinator.options(),
            ))
            .await?;
            let ids: Vec<&str> = store.ids().iter().map(String::as_str).collect();

            if json {
                let assignments: Vec<_> = ids
                    .iter()
                    .zip(&result.labels)
                    .map(|(id, label)| json!({ "id": id, "cluster": label }))
                    .collect();
                let output = json!({
                    "k": result.k(),
                    "iterations": result.iterations,
                    "converged": result.converged,
                    "inertia": result.inertia,
                    "assignments": assignments,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("{}", create_cluster_table(&result, &ids, 5));
            }
            Ok(ExitCode::Success)
        }
    }
}

fn load_dataset(path: &Path) -> anyhow::Result<Arc<VectorStore>> {
    let (store, report) = load_store(path)?;
    if report.has_warnings() {
        eprintln!(
            "Repaired {} padded, {} truncated, {} non-finite; dropped {}",
            report.padded,
            report.truncated,
            report.non_finite_fixed,
            report.dropped()
        );
    }
    tracing::info!(
        vectors = store.len(),
        dimension = store.dimension(),
        "dataset loaded"
    );
    Ok(Arc::new(store))
}

/// Renders progress and cancels the build on Ctrl-C.
async fn follow<T>(mut handle: BuildHandle<T>) -> BuildResult<T> {
    let target: BuildTarget = handle.target();
    let token = handle.cancel_token();

    let renderer = handle.take_progress().map(|events| {
        tokio::spawn(async move {
            let mut progress = BuildProgress::new();
            progress.follow(events).await;
            progress.finish();
        })
    });
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling {target} build...");
            token.cancel();
        }
    });

    let result = handle.wait().await;
    interrupt.abort();
    if let Some(renderer) = renderer {
        let _ = renderer.await;
    }
    result
}
