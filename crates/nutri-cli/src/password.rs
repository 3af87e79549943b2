//! # Password Subcommand
//!
//! Produces hashes in the format stored on user records, for seeding
//! accounts by hand. Passwords are read from stdin so they stay out of
//! shell history.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use nutri_core::password::DEFAULT_ITERATIONS;
use nutri_core::{hash_password, verify_password, PasswordPolicy};

/// Arguments for the `nutri password` subcommand.
#[derive(Args, Debug)]
pub struct PasswordArgs {
    #[command(subcommand)]
    pub command: PasswordCommand,
}

/// Password subcommands.
#[derive(Subcommand, Debug)]
pub enum PasswordCommand {
    /// Hash a password read from stdin.
    Hash {
        /// PBKDF2 iteration count.
        #[arg(long, default_value_t = DEFAULT_ITERATIONS)]
        iterations: u32,
        /// Skip the length policy check.
        #[arg(long)]
        no_policy: bool,
    },

    /// Check a password read from stdin against a stored hash.
    Verify {
        /// Stored hash string.
        #[arg(long)]
        hash: String,
    },
}

/// Execute the password subcommand.
pub fn run_password(args: &PasswordArgs) -> Result<u8> {
    let password = crate::read_stdin_line()?;
    match &args.command {
        PasswordCommand::Hash {
            iterations,
            no_policy,
        } => {
            println!("{}", cmd_hash(&password, *iterations, !no_policy)?);
            Ok(0)
        }
        PasswordCommand::Verify { hash } => cmd_verify(&password, hash),
    }
}

fn cmd_hash(password: &str, iterations: u32, check_policy: bool) -> Result<String> {
    if check_policy {
        PasswordPolicy::default()
            .check(password)
            .context("password rejected")?;
    }
    tracing::debug!(iterations, "hashing password");
    Ok(hash_password(password, iterations.max(1)))
}

fn cmd_verify(password: &str, hash: &str) -> Result<u8> {
    if verify_password(password, hash).context("malformed hash")? {
        println!("OK: password matches");
        Ok(0)
    } else {
        println!("FAIL: password does not match");
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify() {
        let hash = cmd_hash("Sup3r-Secret", 1_000, true).unwrap();
        assert_eq!(cmd_verify("Sup3r-Secret", &hash).unwrap(), 0);
        assert_eq!(cmd_verify("wrong-password", &hash).unwrap(), 1);
    }

    #[test]
    fn policy_rejects_short_passwords() {
        assert!(cmd_hash("short", 1_000, true).is_err());
        assert!(cmd_hash("short", 1_000, false).is_ok());
    }

    #[test]
    fn malformed_hash_is_an_error() {
        assert!(cmd_verify("anything", "not-a-hash").is_err());
    }
}
