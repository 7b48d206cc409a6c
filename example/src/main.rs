use anyhow::{Context, Result};
use buildflow::{BuildExecutor, DispatchMode, ExecutorConfig, GraphSpec, Report};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::Level;

#[derive(Parser)]
#[command(name = "buildflow-demo", version, about = "Run a YAML-described build graph")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute every action in a build file
    Run {
        /// Build file listing the actions
        build: PathBuf,

        /// Executor configuration (YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Start actions from a polling driver instead of a worker pool
        #[arg(long)]
        manual: bool,

        /// Poll interval for manual dispatch, in milliseconds
        #[arg(long, default_value_t = 100)]
        poll_ms: u64,

        /// Stop starting new actions after the first failure
        #[arg(long)]
        stop_on_error: bool,

        /// Maximum number of concurrent actions
        #[arg(short = 'j', long)]
        jobs: Option<usize>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Load a build file and check its graph without running anything
    Validate {
        build: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set default tracing subscriber")?;

    match cli.command {
        Commands::Run {
            build,
            config,
            manual,
            poll_ms,
            stop_on_error,
            jobs,
            json,
        } => {
            let mut config = match config {
                Some(path) => ExecutorConfig::from_yaml_file(&path)
                    .with_context(|| format!("failed to load config: {}", path.display()))?,
                None => ExecutorConfig::default(),
            };
            if manual {
                config.dispatch = DispatchMode::Manual {
                    poll_interval_ms: poll_ms,
                };
            }
            if stop_on_error {
                config.stop_on_error = true;
            }
            if let Some(jobs) = jobs {
                config.max_parallel_actions = jobs;
            }
            config.validate().context("invalid configuration")?;

            let report = run(&build, config).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_summary(&report);
            }
            if !report.success {
                std::process::exit(1);
            }
        }
        Commands::Validate { build } => {
            let graph = load(&build)?;
            println!("{}: {} actions, no cycles", build.display(), graph.len());
        }
    }

    Ok(())
}

fn load(build: &Path) -> Result<buildflow::ActionGraph> {
    let base_dir = build
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    GraphSpec::from_yaml_file(build)
        .and_then(|spec| spec.into_graph(base_dir))
        .with_context(|| format!("failed to load build file: {}", build.display()))
}

async fn run(build: &Path, config: ExecutorConfig) -> Result<Report> {
    let graph = load(build)?;
    let executor = BuildExecutor::new(config);

    let cancel = executor.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, cancelling running actions");
            cancel.cancel();
        }
    });

    executor
        .execute(graph)
        .await
        .context("build execution failed")
}

fn print_summary(report: &Report) {
    for record in report.failures() {
        eprintln!("FAILED {}: {}", record.name, record.error.as_deref().unwrap_or("unknown error"));
        for line in &record.output {
            eprintln!("    {}", line);
        }
    }
    println!(
        "{} actions: {} succeeded, {} failed, {} cancelled, {} skipped ({} cached) in {:.2?}",
        report.total,
        report.succeeded,
        report.failed,
        report.cancelled,
        report.skipped,
        report.cache_hits,
        report.elapsed()
    );
}
