//! # nutri-api — Binary Entry Point
//!
//! Starts the Axum HTTP server. Binds to `PORT` (default 8080).

use nutri_api::ai::{AiClient, AiConfig};
use nutri_api::config::AppConfig;
use nutri_api::mail::{MailConfig, Mailer};
use nutri_api::state::AppState;
use nutri_core::RoleTable;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured tracing. LOG_FORMAT=json switches to JSON lines.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = AppConfig::from_env();
    let port = config.port;

    // Role table: YAML file when RBAC_CONFIG is set, built-in otherwise.
    let roles = match &config.rbac_config {
        Some(path) => {
            let yaml = std::fs::read_to_string(path).map_err(|e| {
                tracing::error!(path = %path, "cannot read role configuration: {e}");
                e
            })?;
            let table = RoleTable::from_yaml(&yaml).map_err(|e| {
                tracing::error!(path = %path, "invalid role configuration: {e}");
                e
            })?;
            tracing::info!(path = %path, "role table loaded");
            table
        }
        None => RoleTable::builtin(),
    };

    // Initialize database pool (optional; absent means in-memory only).
    let db_pool = nutri_api::db::init_pool().await.map_err(|e| {
        tracing::error!("Database initialization failed: {e}");
        e
    })?;

    let ai = match AiConfig::from_env() {
        Ok(ai_config) => match AiClient::new(ai_config) {
            Ok(client) => {
                tracing::info!(model = client.model(), "AI provider configured");
                Some(client)
            }
            Err(e) => {
                tracing::error!("Failed to create AI client: {e}");
                return Err(e.into());
            }
        },
        Err(e) => {
            tracing::warn!("AI provider not configured: {e}. Follow-up drafting will return 503.");
            None
        }
    };

    let mailer = match MailConfig::from_env() {
        Ok(mail_config) => Mailer::relay(mail_config)?,
        Err(e) => {
            tracing::warn!("Mail relay not configured: {e}. Emails are logged only.");
            Mailer::log_only()
        }
    };

    let state = AppState::with_config(config, roles, db_pool)
        .with_ai(ai)
        .with_mailer(mailer);

    // Hydrate in-memory stores from database (if connected).
    state.hydrate_from_db().await.map_err(|e| {
        tracing::error!("Database hydration failed: {e}");
        e
    })?;

    state.bootstrap_admin().await.map_err(|e| {
        tracing::error!("Administrator bootstrap failed: {e}");
        e
    })?;

    nutri_api::scheduler::spawn(state.clone());

    let app = nutri_api::app(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Nutri API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
