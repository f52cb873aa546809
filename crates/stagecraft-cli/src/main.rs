mod commands;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use commands::{exit_code_for, EXIT_FAILURE, EXIT_SUCCESS};
use stagecraft_core::{install_signal_handler, StageEngine};
use stagecraft_schema::{parse_config_file, OwnerToken, CONFIG_FILE_NAME};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "stagecraft",
    version,
    about = "Crash-safe staged dependency mutations for live codebases"
)]
struct Cli {
    /// Path to the site configuration file.
    #[arg(long, short = 'c', default_value = CONFIG_FILE_NAME, global = true)]
    config: PathBuf,

    /// Owner token identifying this caller (defaults to user@host).
    #[arg(long, global = true)]
    owner: Option<String>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Claim the site and copy the live codebase into a new stage.
    Create {
        /// Metadata to attach to the stage, as key=value (repeatable).
        #[arg(long = "meta", value_name = "KEY=VALUE")]
        meta: Vec<String>,
    },
    /// Require packages inside the current stage.
    Require {
        /// Runtime requirements, `vendor/name[:constraint]`.
        packages: Vec<String>,
        /// Development requirements (repeatable).
        #[arg(long, value_name = "PACKAGE")]
        dev: Vec<String>,
    },
    /// Copy the staged codebase over the live one.
    Apply,
    /// Discard the current stage and release the site.
    Destroy,
    /// Run the site status check.
    Status {
        /// Ignore any cached run and check now.
        #[arg(long, default_value_t = false)]
        refresh: bool,
    },
    /// Show the current stage of the site.
    Inspect,
    /// Show or clear the failure marker left by an interrupted apply.
    Marker {
        #[command(subcommand)]
        action: MarkerAction,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Debug, Subcommand)]
enum MarkerAction {
    /// Print the marker, exiting 5 while one exists.
    Show,
    /// Remove the marker once the live codebase has been repaired.
    Clear,
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("STAGECRAFT_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(exit_code_for(&msg))
        }
    }
}

fn run(cli: Cli) -> Result<u8, String> {
    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "stagecraft", &mut std::io::stdout());
        return Ok(EXIT_SUCCESS);
    }

    let config = parse_config_file(&cli.config).map_err(|e| {
        format!("config error: {}: {e}", cli.config.display())
    })?;

    if matches!(cli.command, Commands::Require { .. })
        && std::env::var("STAGECRAFT_SKIP_PREREQS").as_deref() != Ok("1")
    {
        let missing = stagecraft_runtime::check_executables(&[config.executor.program.clone()]);
        if !missing.is_empty() {
            eprintln!("error: {}", stagecraft_runtime::format_missing(&missing));
            return Ok(EXIT_FAILURE);
        }
    }

    let engine = StageEngine::open(config).map_err(|e| e.to_string())?;
    let owner = OwnerToken::new(cli.owner.unwrap_or_else(commands::default_owner));
    let json = cli.json;

    match cli.command {
        Commands::Create { meta } => commands::create::run(&engine, &owner, &meta, json),
        Commands::Require { packages, dev } => {
            commands::require::run(&engine, &owner, &packages, &dev, json)
        }
        Commands::Apply => commands::apply::run(&engine, &owner, json),
        Commands::Destroy => commands::destroy::run(&engine, &owner, json),
        Commands::Status { refresh } => commands::status::run(&engine, refresh, json),
        Commands::Inspect => commands::inspect::run(&engine, json),
        Commands::Marker { action } => match action {
            MarkerAction::Show => commands::marker::show(&engine, json),
            MarkerAction::Clear => commands::marker::clear(&engine, json),
        },
        Commands::Completions { .. } => Ok(EXIT_SUCCESS),
    }
}
