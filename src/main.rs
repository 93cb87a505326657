use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::info;

use pinflow::config::Config;
use pinflow::dependencies::{assemble_injection, load_manifest, DependencyFetcher};
use pinflow::logging::{init_logging, LogConfig};
use pinflow::runtime::{build_script, run_worker, Launcher};
use pinflow::Error;

#[derive(Parser)]
#[command(name = "pinflow")]
#[command(about = "Run workflows with their integrations in an isolated worker", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a workflow
    Start {
        /// Path to the workflow script
        #[arg(short, long)]
        workflow: PathBuf,
        /// Path to the JSON dependency manifest
        #[arg(short, long)]
        dependencies: PathBuf,
        /// External base URL for webhooks
        #[arg(short, long)]
        external_url: Option<String>,
        /// Print the assembled script instead of starting the worker
        #[arg(long)]
        dry_run: bool,
    },
    /// Run as the isolated worker (internal)
    #[command(hide = true)]
    Worker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging(&LogConfig::default());

    let cli = Cli::parse();
    let config = Config::load();

    let code = match cli.command {
        Commands::Start {
            workflow,
            dependencies,
            external_url,
            dry_run,
        } => match cmd_start(config, &workflow, &dependencies, external_url, dry_run).await {
            Ok(code) => code,
            Err(e) if e.is_fatal_before_start() => {
                eprintln!("! {}", e);
                1
            }
            Err(e) => return Err(e.into()),
        },
        Commands::Worker => run_worker(config).await?,
    };

    std::process::exit(code);
}

async fn cmd_start(
    mut config: Config,
    workflow: &Path,
    dependencies: &Path,
    external_url: Option<String>,
    dry_run: bool,
) -> pinflow::Result<i32> {
    if external_url.is_some() {
        config.runtime.external_url = external_url;
    }

    let workflow_code = std::fs::read_to_string(workflow).map_err(|e| {
        Error::Config(format!(
            "Failed to read workflow '{}': {}",
            workflow.display(),
            e
        ))
    })?;

    let manifest = load_manifest(dependencies)?;
    if manifest.is_empty() {
        return Err(Error::Config(format!(
            "Workflow '{}' does not have any dependencies associated with it.",
            workflow.display()
        )));
    }

    info!(
        "Start workflow {} ({} dependencies)",
        workflow.display(),
        manifest.len()
    );

    let fetcher = DependencyFetcher::new(config.runtime.token.clone())?;
    let dependencies = fetcher.fetch_all(manifest).await?;
    let injection = assemble_injection(&dependencies)?;
    let external_url = config.runtime.external_url.as_deref();
    let script = build_script(&workflow_code, &injection, external_url)?;

    if dry_run {
        println!("{}", script);
        return Ok(0);
    }

    Launcher::current_exe()?
        .external_url(external_url)
        .run(script)
        .await
}
