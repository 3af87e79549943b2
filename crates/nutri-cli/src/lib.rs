//! # nutri-cli — Operator CLI for the Nutri Practice Backend
//!
//! ## Subcommands
//!
//! - `nutri password` — Hash and verify passwords in the stored format.
//! - `nutri token` — Mint and inspect development access tokens.
//! - `nutri roles` — Print the role/permission matrix, optionally from YAML.
//! - `nutri formula` — Check and evaluate measure formulas.
//!
//! Handlers return a process exit code: `0` on success, `1` when a check
//! fails. Errors (unreadable files, bad arguments) surface as `anyhow`
//! errors and also exit with `1`.

pub mod formula;
pub mod password;
pub mod roles;
pub mod token;

use std::io::BufRead;

use anyhow::{bail, Context, Result};

/// Read a single line from stdin, without the trailing newline.
pub(crate) fn read_stdin_line() -> Result<String> {
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read from stdin")?;
    let line = line.trim_end_matches(['\r', '\n']).to_string();
    if line.is_empty() {
        bail!("no input on stdin");
    }
    Ok(line)
}
