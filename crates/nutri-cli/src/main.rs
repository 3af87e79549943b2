//! # nutri CLI entry point
//!
//! Parses command-line arguments and dispatches to subcommand handlers.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use nutri_cli::formula::{run_formula, FormulaArgs};
use nutri_cli::password::{run_password, PasswordArgs};
use nutri_cli::roles::{run_roles, RolesArgs};
use nutri_cli::token::{run_token, TokenArgs};

/// Nutri practice backend operator tools.
#[derive(Parser, Debug)]
#[command(name = "nutri", version, about, long_about = None)]
struct Cli {
    /// Enable verbose output. Repeat for more verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Hash or verify a password.
    Password(PasswordArgs),

    /// Mint or inspect an access token.
    Token(TokenArgs),

    /// Print the role/permission matrix.
    Roles(RolesArgs),

    /// Check or evaluate a measure formula.
    Formula(FormulaArgs),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Password(args) => run_password(&args),
        Commands::Token(args) => run_token(&args),
        Commands::Roles(args) => run_roles(&args),
        Commands::Formula(args) => run_formula(&args),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}
