mod adapters;
mod config;
mod serve_cmd;
mod status_cmd;
#[cfg(test)]
mod test_util;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use planforge_core::cache::RequestCache;
use planforge_core::orchestrator::OrchestratorConfig;
use planforge_db::pool;

use config::PlanforgeConfig;

#[derive(Parser)]
#[command(name = "planforge", about = "Workout plan generation orchestrator")]
struct Cli {
    /// Database URL (overrides PLANFORGE_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a planforge config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/planforge")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the planforge database (requires config file or env vars)
    DbInit,
    /// Run the HTTP server: SSE generation stream + polling endpoint
    Serve {
        /// Bind address (overrides the config file)
        #[arg(long)]
        bind: Option<String>,
        /// Port (overrides the config file)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Show the status of a generation request
    Status {
        /// Request ID to poll
        request_id: String,
    },
}

/// Execute the `planforge init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        server: config::ServerSection::default(),
        generator: None,
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  server = {}:{}", cfg.server.bind, cfg.server.port);
    println!();
    println!("Next: run `planforge db-init` to create and migrate the database,");
    println!("then set [generator] command in the config file before `planforge serve`.");

    Ok(())
}

/// Execute the `planforge db-init` command: create database and run
/// migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = PlanforgeConfig::resolve(cli_db_url)?;

    println!("Initializing planforge database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool).await?;
    db_pool.close().await;

    println!("planforge db-init complete.");
    Ok(())
}

/// Execute the `planforge serve` command.
async fn cmd_serve(
    cli_db_url: Option<&str>,
    bind: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let resolved = PlanforgeConfig::resolve(cli_db_url)?;
    let generator_cfg = resolved.generator.as_ref().context(
        "no [generator] section configured; set generator.command in the config file",
    )?;

    let db_pool = pool::create_pool(&resolved.db_config).await?;

    let state = serve_cmd::AppState {
        pool: db_pool.clone(),
        cache: Arc::new(RequestCache::new()),
        profiles: Arc::new(adapters::PgProfileStore::new(db_pool.clone())),
        generator: Arc::new(adapters::CommandGenerator::new(generator_cfg)),
        config: OrchestratorConfig::default(),
    };

    let bind = bind.unwrap_or_else(|| resolved.server.bind.clone());
    let port = port.unwrap_or(resolved.server.port);

    let result = serve_cmd::run_serve(state, &bind, port).await;
    db_pool.close().await;
    result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve { bind, port } => {
            cmd_serve(cli.database_url.as_deref(), bind, port).await?;
        }
        Commands::Status { request_id } => {
            let resolved = PlanforgeConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool, &request_id).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
