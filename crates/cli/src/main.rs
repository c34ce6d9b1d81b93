//! vcsmirror command-line driver.
//!
//! Bootstraps a mirror, replays new upstream history into it and inspects
//! the state store.

mod signals;
mod status;
mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vcsmirror_core::config::SAMPLE_CONFIG;
use vcsmirror_core::db::Database;
use vcsmirror_core::engine::StopReason;
use vcsmirror_core::errors::SyncError;
use vcsmirror_core::{build_source, build_target, CancelFlag, Changeset, Config, Hooks, SyncEngine};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Mirror the history of a Subversion, darcs or CVS repository into git.
#[derive(Parser, Debug)]
#[command(name = "vcsmirror", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "vcsmirror.toml")]
    config: PathBuf,

    /// Log at debug level regardless of the configured level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check out the upstream tree and import it as the first commit.
    Bootstrap {
        /// Upstream revision to start from (INITIAL, HEAD or a backend token).
        #[arg(short, long)]
        revision: Option<String>,
    },

    /// Fetch new upstream changesets and replay everything pending.
    Update {
        /// Run a single fetch/apply cycle instead of repeating until
        /// upstream has nothing new.
        #[arg(long)]
        once: bool,
    },

    /// Show the replay state, cursor and pending queue.
    Status {
        /// Print machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show recent apply log entries.
    Log {
        /// Maximum number of entries to show.
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Write a sample configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./vcsmirror.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", style::error(&format!("Error: {:#}", e)));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { output } => {
            init_logging("warn", cli.verbose);
            cmd_init(&output)
        }
        Commands::Validate => {
            init_logging("warn", cli.verbose);
            cmd_validate(&cli.config)
        }
        command => {
            let config = Config::load_and_validate(&cli.config)
                .with_context(|| format!("failed to load {}", cli.config.display()))?;
            init_logging(&config.project.log_level, cli.verbose);

            match command {
                Commands::Bootstrap { revision } => {
                    cmd_bootstrap(&config, revision.as_deref()).await
                }
                Commands::Update { once } => cmd_update(&config, once).await,
                Commands::Status { json } => {
                    let db = open_database(&config)?;
                    status::run_status(&config, &db, json)
                }
                Commands::Log { limit } => {
                    let db = open_database(&config)?;
                    status::run_log(&db, limit)
                }
                Commands::Init { .. } | Commands::Validate => Ok(()),
            }
        }
    }
}

fn init_logging(level: &str, verbose: bool) {
    let level = if verbose { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

// ---------------------------------------------------------------------------
// Engine helpers
// ---------------------------------------------------------------------------

fn open_database(config: &Config) -> Result<Database> {
    let path = config.state_path();
    Database::open(&path).with_context(|| format!("failed to open state store {}", path.display()))
}

fn build_engine(config: &Config, cancel: CancelFlag) -> Result<SyncEngine> {
    let db = open_database(config)?;
    let hooks = Hooks {
        applied: Some(Box::new(|cs: &Changeset| {
            println!(
                "{}",
                style::success(&format!(
                    "{} by {} ({} entries)",
                    cs.revision(),
                    cs.author(),
                    cs.entries().len()
                ))
            );
        })),
        ..Default::default()
    };
    Ok(SyncEngine::new(
        db,
        build_source(config),
        build_target(config),
        config.replay_options(),
    )
    .with_hooks(hooks)
    .with_cancel_flag(cancel))
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

async fn cmd_bootstrap(config: &Config, revision: Option<&str>) -> Result<()> {
    let revision = revision.unwrap_or(&config.source.revision);
    let engine = build_engine(config, signals::setup_signal_handlers())?;

    println!(
        "Bootstrapping {} from {}{} at {}...",
        config.project.root.display(),
        config.source.repository,
        config.source.module,
        revision
    );
    let initial = engine
        .bootstrap(Some(revision))
        .await
        .context("bootstrap failed")?;

    println!(
        "{}",
        style::success(&format!(
            "imported revision {} by {}",
            initial.revision(),
            initial.author()
        ))
    );
    Ok(())
}

async fn cmd_update(config: &Config, once: bool) -> Result<()> {
    let engine = build_engine(config, signals::setup_signal_handlers())?;

    let mut total_applied = 0;
    let mut total_commits = 0;
    loop {
        let report = match engine.run_cycle().await {
            Ok(report) => report,
            Err(SyncError::Cancelled(revision)) => {
                println!(
                    "{}",
                    style::warn(&format!("interrupted; {revision} and later stay queued"))
                );
                anyhow::bail!("update cancelled");
            }
            Err(e) => return Err(e).context("update failed"),
        };
        total_applied += report.applied;
        total_commits += report.commits;

        match &report.stopped {
            Some(StopReason::Conflict { revision, paths }) => {
                println!(
                    "{}",
                    style::warn(&format!("conflicts while applying {revision}:"))
                );
                for path in paths {
                    println!("    {path}");
                }
                println!(
                    "Resolve them in {} and run `vcsmirror update` again.",
                    config.project.root.display()
                );
                anyhow::bail!("replay paused on conflicts");
            }
            Some(StopReason::Vetoed { revision }) => {
                println!("{}", style::warn(&format!("stopped before {revision}")));
                break;
            }
            None => {}
        }
        if once || report.applied == 0 {
            break;
        }
    }

    if total_applied == 0 {
        println!("{}", style::dim("Already up to date."));
    } else {
        println!(
            "{}",
            style::success(&format!(
                "{total_applied} changesets applied, {total_commits} commits"
            ))
        );
    }
    Ok(())
}

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, SAMPLE_CONFIG).context("failed to write config file")?;

    println!("Sample configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Point [source] at the upstream repository and module");
    println!("  2. Set [project] root to the directory that will hold the mirror");
    println!("  3. Validate with: vcsmirror validate --config {}", output.display());
    println!("  4. Import with:   vcsmirror bootstrap --config {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let config = Config::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    match config.validate() {
        Ok(()) => println!("  [OK] All required fields are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("Configuration summary:");
    println!("  Source        : {} {}", config.source.kind, config.source.repository);
    println!("  Module        : {}", config.source.module);
    println!("  Start revision: {}", config.source.revision);
    println!("  Working dir   : {}", config.project.root.display());
    println!("  State store   : {}", config.state_path().display());
    println!(
        "  Git remote    : {}",
        config.target.repository.as_deref().unwrap_or("none")
    );
    println!("  Exclude       : {}", config.replay.exclude.join(", "));
    println!();
    println!("Configuration is valid.");
    Ok(())
}
