use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use replicar::config::ReplicarConfig;
use replicar::pipeline::{
    build_graph, declare_stage, parse_manifest_file, parser, validate_manifest, Driver,
    FsObjectStore, LocalHost, LockStore, RunConfig, RunStatus, ToolchainBackend,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "replicar")]
#[command(version, about = "Reproducible pipelines for computational research", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    /// Manifest path (defaults to the configured one)
    #[arg(short, long, global = true)]
    manifest: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile environments and execute stale stages
    Run {
        /// Only run these stages (and nothing downstream of others)
        #[arg(short, long)]
        stage: Vec<String>,

        /// Ignore lock records and rerun everything
        #[arg(short, long)]
        force: bool,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Parse the manifest, check the schema, and build the graph
    Validate,

    /// Show per-stage lock status
    Status,

    /// Merge one stage definition into the manifest
    Declare {
        /// YAML snippet file with exactly one `name: stage` entry
        snippet: PathBuf,
    },
}

fn init_tracing(verbose: bool, debug: bool) {
    let level = if debug {
        "debug"
    } else if verbose {
        "info"
    } else {
        "warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.debug);

    let config = ReplicarConfig::load(Path::new("."))?;
    let manifest_path = cli
        .manifest
        .unwrap_or_else(|| config.paths.manifest.clone());

    match cli.command {
        Commands::Run { stage, force, json } => {
            cmd_run(&manifest_path, &config, stage, force, json).await
        }
        Commands::Validate => cmd_validate(&manifest_path),
        Commands::Status => cmd_status(&manifest_path),
        Commands::Declare { snippet } => cmd_declare(&manifest_path, &snippet),
    }
}

async fn cmd_run(
    manifest_path: &Path,
    config: &ReplicarConfig,
    stages: Vec<String>,
    force: bool,
    json: bool,
) -> Result<()> {
    let backend = ToolchainBackend::new(config.paths.envs.clone());
    let host = LocalHost::new();
    let store = FsObjectStore::new(config.paths.objects.clone());

    // Ctrl-C stops between stages; spawned children are killed on drop
    let interrupt = Arc::new(AtomicBool::new(false));
    {
        let flag = interrupt.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                flag.store(true, Ordering::SeqCst);
            }
        });
    }

    let driver = Driver::new(&backend, &host)
        .with_store(&store)
        .with_interrupt(interrupt);

    let run_config = RunConfig {
        manifest_path: manifest_path.to_path_buf(),
        stage_filter: if stages.is_empty() { None } else { Some(stages) },
        force,
    };

    let report = driver.run(&run_config).await?;

    if json {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report.render_text());
    }

    if !report.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_validate(manifest_path: &Path) -> Result<()> {
    let manifest = parse_manifest_file(manifest_path)?;
    validate_manifest(&manifest)?;
    let graph = build_graph(&manifest)?;

    println!(
        "{} {} — {} environments, {} stages, {} nodes",
        "OK".green().bold(),
        manifest.name,
        manifest.environments.len(),
        manifest.stages.len(),
        graph.nodes.len()
    );
    println!("execution order: {}", graph.topo_order.join(" → "));
    Ok(())
}

fn cmd_status(manifest_path: &Path) -> Result<()> {
    let manifest = parse_manifest_file(manifest_path)?;
    validate_manifest(&manifest)?;
    let graph = build_graph(&manifest)?;
    let locks = LockStore::for_manifest(manifest_path);

    println!("Manifest: {} ({})", manifest.name, manifest_path.display());
    println!("{}", "-".repeat(60));
    for key in &graph.topo_order {
        match locks.load_stage(key)? {
            Some(record) => {
                let status = match record.status {
                    RunStatus::Succeeded => "SUCCEEDED".green(),
                    RunStatus::Failed => "FAILED".red(),
                    RunStatus::Running => "RUNNING".yellow(),
                };
                let duration = record
                    .duration_seconds
                    .map(|d| format!("{:.1}s", d))
                    .unwrap_or_else(|| "-".to_string());
                println!("  {:24} {:12} {}", key, status, duration);
            }
            None => println!("  {:24} {:12}", key, "NOT RUN".dimmed()),
        }
    }
    Ok(())
}

fn cmd_declare(manifest_path: &Path, snippet_path: &Path) -> Result<()> {
    let snippet = std::fs::read_to_string(snippet_path)
        .with_context(|| format!("failed to read {}", snippet_path.display()))?;
    let (name, stage) = parser::parse_stage_snippet(&snippet)?;

    let manifest = parse_manifest_file(manifest_path)?;
    let merged = declare_stage(&manifest, &name, stage)?;

    // The merge is pure; this is the one write
    std::fs::write(manifest_path, parser::render_manifest(&merged)?)
        .with_context(|| format!("failed to write {}", manifest_path.display()))?;

    println!("{} stage '{}' declared", "OK".green().bold(), name);
    Ok(())
}
