use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

mod completion;
mod config;
mod dispatch;
mod metadata;
mod render;
mod session;

use dispatch::run_cli;

const LOG_ENV: &str = "TOOLNEST_LOG";

#[derive(Parser, Debug)]
#[command(name = "toolnest")]
#[command(version)]
#[command(about = "Keeps a local toolchain directory in sync with a remote SDK catalog", long_about = None)]
struct Cli {
    /// Install root (defaults to TOOLNEST_ROOT, then the per-user location).
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Catalog URL or local path; overrides the config file and TOOLNEST_CATALOG_URL.
    #[arg(long, global = true)]
    catalog_url: Option<String>,
    /// Debug logging on stderr.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the plan, ask for confirmation, then apply it.
    Interactive,
    /// Reconcile against the catalog and apply every action.
    Sync {
        /// Apply without asking.
        #[arg(short, long)]
        yes: bool,
        /// Print the plan and stop.
        #[arg(long)]
        dry_run: bool,
    },
    Install {
        name: String,
        /// Version requirement the catalog entry must satisfy.
        #[arg(long = "version", value_name = "PIN")]
        version_pin: Option<String>,
        /// Reinstall even when up to date and discard any cached artifact.
        #[arg(long)]
        force: bool,
    },
    /// Upgrade installed packages whose catalog version differs.
    Update {
        name: Option<String>,
        #[arg(long = "version", value_name = "PIN", requires = "name")]
        version_pin: Option<String>,
        /// Print pending upgrades without applying them.
        #[arg(long)]
        check: bool,
    },
    Remove {
        name: String,
    },
    List,
    /// Regenerate the environment file and print its path.
    Env,
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliCompletionShell {
    Bash,
    Zsh,
    Fish,
    Powershell,
}

impl From<CliCompletionShell> for Shell {
    fn from(value: CliCompletionShell) -> Self {
        match value {
            CliCompletionShell::Bash => Shell::Bash,
            CliCompletionShell::Zsh => Shell::Zsh,
            CliCompletionShell::Fish => Shell::Fish,
            CliCompletionShell::Powershell => Shell::PowerShell,
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
