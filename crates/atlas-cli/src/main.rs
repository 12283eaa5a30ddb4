//! Atlas Codex CLI — entry point.

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use atlas_cli::commands;
use atlas_cli::error::{error_report, exit_code};
use atlas_cli::GlobalOptions;
use atlas_core::ProcessingMode;

#[derive(Parser)]
#[command(
    name = "atlas",
    about = "Atlas Codex — evidence-first extraction decisions over HTML documents",
    version
)]
struct Cli {
    /// Path to pipeline config JSON.
    /// Also reads from ATLAS_CONFIG env var.
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Path to the learning log (JSONL).
    /// Also reads from ATLAS_LEARNING_FILE env var.
    #[arg(long, global = true)]
    learning_file: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect evidence for a contract from an HTML document.
    Collect {
        #[arg(long)]
        html: PathBuf,

        #[arg(long)]
        contract: PathBuf,

        /// Domain used for adaptive selector memory, saved next to the
        /// learning log.
        #[arg(long)]
        domain: Option<String>,
    },

    /// Apply strict or soft mode to a JSON array of entities.
    Process {
        #[arg(long)]
        entities: PathBuf,

        #[arg(long)]
        contract: PathBuf,

        /// strict or soft. Defaults to the config.
        #[arg(long)]
        mode: Option<ProcessingMode>,

        /// Soft-mode demotion threshold in [0, 1].
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Plan a task and print the preflight report.
    Plan {
        #[arg(long)]
        task: PathBuf,

        #[arg(long)]
        contract: PathBuf,
    },

    /// Run one full attempt and record its outcome.
    Run {
        #[arg(long)]
        task: PathBuf,

        #[arg(long)]
        html: PathBuf,

        #[arg(long)]
        contract: PathBuf,

        #[arg(long)]
        mode: Option<ProcessingMode>,
    },

    /// Print aggregate learning statistics.
    Stats,

    /// Surface repeated label patterns and promotion proposals.
    Discover {
        #[arg(long)]
        html: PathBuf,

        #[arg(long)]
        contract: PathBuf,

        /// Propose candidates seen at least this often. Without it,
        /// candidates are listed for manual curation only.
        #[arg(long)]
        min_occurrences: Option<usize>,

        /// Print the contract version the proposals would produce.
        #[arg(long)]
        apply: bool,
    },

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   atlas completions bash > ~/.local/share/bash-completion/completions/atlas
    ///   atlas completions zsh > ~/.zfunc/_atlas
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let opts = GlobalOptions {
        config: cli.config,
        learning_file: cli.learning_file,
    };

    let outcome = match cli.command {
        Commands::Collect {
            html,
            contract,
            domain,
        } => commands::collect::execute(&opts, &html, &contract, domain.as_deref()),

        Commands::Process {
            entities,
            contract,
            mode,
            threshold,
        } => commands::process::execute(&opts, &entities, &contract, mode, threshold),

        Commands::Plan { task, contract } => commands::plan::execute(&opts, &task, &contract).await,

        Commands::Run {
            task,
            html,
            contract,
            mode,
        } => commands::run::execute(&opts, &task, &html, &contract, mode).await,

        Commands::Stats => commands::stats::execute(&opts),

        Commands::Discover {
            html,
            contract,
            min_occurrences,
            apply,
        } => commands::discover::execute(&opts, &html, &contract, min_occurrences, apply),

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "atlas", &mut std::io::stdout());
            return;
        }
    };

    match outcome.and_then(|value| Ok(serde_json::to_string_pretty(&value)?)) {
        Ok(out) => println!("{out}"),
        Err(e) => {
            tracing::error!("{e:#}");
            let report = error_report(&e);
            println!(
                "{}",
                serde_json::to_string_pretty(&report).unwrap_or_else(|_| report.to_string())
            );
            std::process::exit(exit_code(&e));
        }
    }
}
