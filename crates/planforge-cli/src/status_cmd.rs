//! `planforge status` command: one-shot poll of a generation request.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use planforge_core::cache::RequestCache;
use planforge_core::orchestrator::OrchestratorConfig;
use planforge_core::status::{StatusResponse, get_status};

/// Run the status command for one request ID.
///
/// A CLI invocation has no process-local cache to consult, so this reads
/// straight through to the ledger.
pub async fn run_status(pool: &PgPool, request_id_str: &str) -> Result<()> {
    let request_id = Uuid::parse_str(request_id_str)
        .with_context(|| format!("invalid request ID: {request_id_str}"))?;

    let cache = RequestCache::new();
    let config = OrchestratorConfig::default();
    let response = get_status(pool, &cache, &config, request_id).await?;

    match response {
        StatusResponse::NotFound => {
            println!("Request {request_id}: not found (unknown or expired)");
        }
        StatusResponse::InProgress {
            progress,
            phase,
            message,
        } => {
            println!("Request {request_id}: in progress");
            println!("  {progress}% [{phase}] {message}");
        }
        StatusResponse::Complete { result_ref, .. } => {
            println!("Request {request_id}: complete");
            println!("  result: {result_ref}");
        }
        StatusResponse::Error { error } => {
            println!("Request {request_id}: failed");
            println!("  error: {error}");
        }
    }

    Ok(())
}
