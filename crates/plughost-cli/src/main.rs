//! plughost CLI - load, exercise and unload plugin modules.

mod clean;
mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "plughost")]
#[command(about = "Load plugin modules into isolated contexts and unload them again")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a project module, then unload it and report the outcome
    Run {
        /// Path to the project module
        project: PathBuf,

        /// Bridge configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Start in editor mode, loading the tooling API module
        #[arg(long)]
        editor: bool,

        /// Tooling module to load after the project (editor mode only)
        #[arg(long, requires = "editor")]
        tooling: Option<PathBuf>,

        /// Give up on unloading after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Remove stale shadow copies
    CleanShadow {
        /// Shadow copy directory (defaults to the configured one)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Remove every copy, not only old ones
        #[arg(long)]
        all: bool,

        /// Age in seconds after which a copy counts as stale
        #[arg(long, default_value = "3600")]
        max_age_secs: u64,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            project,
            config,
            editor,
            tooling,
            timeout_ms,
        } => {
            let options = run::RunOptions {
                config,
                editor,
                tooling,
                timeout_ms,
            };
            run::execute(&project, &options)?;
        }

        Commands::CleanShadow {
            dir,
            all,
            max_age_secs,
        } => clean::execute(dir, all, max_age_secs)?,
    }

    Ok(())
}
