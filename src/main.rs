//! # aicoding-provision - bootstrap for the AI coding platform database
//!
//! Creates the application user (`readWrite` on the target database) and the
//! single-field indexes on `ai_problems`, then lets operators verify the
//! result or probe the server.
//!
//! ## Environment Variables
//!
//! - `DATABASE_URL` or `MONGODB_URL`: MongoDB connection string, used when
//!   `--url` is absent
//! - `RUST_LOG`: log filter (defaults to `info`)

use std::process::ExitCode;

use tracing::error;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub mod cli;
pub mod db;
pub mod errors;
pub mod models;
pub mod provision;
#[cfg(test)]
mod testing;
pub mod verify;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_level(true)
                .with_target(false),
        )
        .init();

    match cli::handle_cli().await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "provisioning aborted");
            eprintln!("Error: {e}");
            if e.is_duplicate_user() {
                eprintln!("   The database looks provisioned already.");
                eprintln!("   Run `verify`, or pass --skip-existing-user");
            }
            ExitCode::FAILURE
        }
    }
}
