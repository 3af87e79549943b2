//! # Token Subcommand
//!
//! Mints and inspects access tokens signed with the server's `JWT_SECRET`.
//! Tokens only authenticate users that exist and are active on the target
//! server; the role claim is informational.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Subcommand};
use nutri_api::token::{self, TokenError};
use nutri_core::{RoleName, UserId};
use uuid::Uuid;

/// Arguments for the `nutri token` subcommand.
#[derive(Args, Debug)]
pub struct TokenArgs {
    /// Environment variable holding the signing secret.
    #[arg(long, default_value = "JWT_SECRET", global = true)]
    pub secret_env: String,

    #[command(subcommand)]
    pub command: TokenCommand,
}

/// Token subcommands.
#[derive(Subcommand, Debug)]
pub enum TokenCommand {
    /// Issue a token for a user.
    Mint {
        /// User ID (UUID).
        #[arg(long)]
        user_id: Uuid,
        /// Role recorded in the claims.
        #[arg(long, default_value = RoleName::DIETITIAN)]
        role: String,
        /// Lifetime in seconds.
        #[arg(long, default_value_t = 3600)]
        ttl: i64,
    },

    /// Verify a token and print its claims.
    Inspect {
        /// The token.
        #[arg(value_name = "TOKEN")]
        token: String,
    },
}

/// Execute the token subcommand.
pub fn run_token(args: &TokenArgs) -> Result<u8> {
    let secret = std::env::var(&args.secret_env)
        .with_context(|| format!("{} is not set", args.secret_env))?;
    if secret.trim().is_empty() {
        bail!("{} is empty", args.secret_env);
    }
    match &args.command {
        TokenCommand::Mint { user_id, role, ttl } => {
            println!("{}", cmd_mint(&secret, *user_id, role, *ttl)?);
            Ok(0)
        }
        TokenCommand::Inspect { token } => cmd_inspect(&secret, token),
    }
}

fn cmd_mint(secret: &str, user_id: Uuid, role: &str, ttl: i64) -> Result<String> {
    if ttl <= 0 {
        bail!("ttl must be positive");
    }
    let role = RoleName::new(role).context("invalid role name")?;
    let token = token::issue(secret, UserId::from_uuid(user_id), role.as_str(), Utc::now(), ttl)?;
    tracing::info!(%user_id, role = role.as_str(), ttl, "token issued");
    Ok(token)
}

fn cmd_inspect(secret: &str, raw: &str) -> Result<u8> {
    match token::verify(secret, raw.trim(), Utc::now()) {
        Ok(claims) => {
            let json = serde_json::json!({
                "sub": claims.sub,
                "role": claims.role,
                "iat": claims.iat,
                "exp": claims.exp,
                "jti": claims.jti,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
            Ok(0)
        }
        Err(e @ (TokenError::Expired | TokenError::BadSignature)) => {
            println!("FAIL: {e}");
            Ok(1)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-signing-secret";

    #[test]
    fn minted_token_inspects_ok() {
        let user = Uuid::new_v4();
        let token = cmd_mint(SECRET, user, "assistant", 60).unwrap();
        let claims = token::verify(SECRET, &token, Utc::now()).unwrap();
        assert_eq!(claims.sub, UserId::from_uuid(user));
        assert_eq!(claims.role, "ASSISTANT");
        assert_eq!(cmd_inspect(SECRET, &token).unwrap(), 0);
    }

    #[test]
    fn wrong_secret_fails_inspection() {
        let token = cmd_mint(SECRET, Uuid::new_v4(), "VIEWER", 60).unwrap();
        assert_eq!(cmd_inspect("other-secret", &token).unwrap(), 1);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(cmd_mint(SECRET, Uuid::new_v4(), "VIEWER", 0).is_err());
        assert!(cmd_mint(SECRET, Uuid::new_v4(), "not a role!", 60).is_err());
        assert!(cmd_inspect(SECRET, "garbage").is_err());
    }
}
