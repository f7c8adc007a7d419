use clap::{Parser, Subcommand};
use colored::Colorize;
use std::process::ExitCode;

mod commands;

use commands::{GlobalArgs, WaitArgs};

#[derive(Parser)]
#[command(name = "lanshim")]
#[command(about = "Host network shim for services on a bridged LAN segment", long_about = None)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration without touching the host
    Validate {
        /// Print the validated topology as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create the shim and routes, then register the boot-time unit
    Install,

    /// Create the shim and routes (run by the boot-time unit)
    Apply,

    /// Remove the routes and the shim, leaving the unit registered
    Remove,

    /// Unregister the unit, then remove the routes and the shim
    Uninstall,

    /// Unregister the unit only; the shim stays up
    Unregister,

    /// Show the shim, its routes and the unit
    Status {
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Wait for a service to become reachable
    Wait(WaitArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = lanshim_core::init_observability(cli.global.verbose) {
        eprintln!("warning: logging unavailable: {}", e);
    }

    let result = match cli.command {
        Commands::Validate { json } => commands::status::validate(&cli.global, json).await,
        Commands::Install => commands::provision::install(&cli.global).await,
        Commands::Apply => commands::provision::apply(&cli.global).await,
        Commands::Remove => commands::provision::remove(&cli.global).await,
        Commands::Uninstall => commands::provision::uninstall(&cli.global).await,
        Commands::Unregister => commands::provision::unregister(&cli.global).await,
        Commands::Status { json } => commands::status::status(&cli.global, json).await,
        Commands::Wait(args) => commands::wait::wait(&cli.global, &args).await,
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {:#}", "✗".red().bold(), e);
            ExitCode::from(commands::exit_code_for(&e))
        }
    }
}
