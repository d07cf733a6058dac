use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use chat_vault::{config::Config, run_server, telemetry, SchemaMigrator, StoreError};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "chat-vault", version, about = "Chat conversation store with HTTP API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Migrate the database, then serve the HTTP API (default)
    Serve {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Reconcile the schema and exit
    Migrate {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        backup_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let mut cfg = Config::from_env()?;

    match cli.command {
        None => {
            run_server(cfg).await?;
            Ok(ExitCode::SUCCESS)
        }
        Some(Command::Serve { db, host, port }) => {
            if let Some(db) = db {
                cfg.db_path = db;
            }
            if let Some(host) = host {
                cfg.api_host = host;
            }
            if let Some(port) = port {
                cfg.api_port = port;
            }
            run_server(cfg).await?;
            Ok(ExitCode::SUCCESS)
        }
        Some(Command::Migrate { db, backup_dir }) => {
            telemetry::init_tracing();
            if let Some(db) = db {
                cfg.db_path = db;
            }
            if backup_dir.is_some() {
                cfg.backup_dir = backup_dir;
            }
            tokio::task::spawn_blocking(move || migrate(&cfg)).await?
        }
    }
}

fn migrate(cfg: &Config) -> anyhow::Result<ExitCode> {
    if let Some(parent) = cfg.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut conn = rusqlite::Connection::open(&cfg.db_path)
        .with_context(|| format!("Failed to open {}", cfg.db_path.display()))?;

    let result = SchemaMigrator::new(&mut conn)
        .with_backup(&cfg.db_path, cfg.backup_dir.as_deref())
        .reconcile();

    match result {
        Ok(report) => {
            println!("{}", report);
            Ok(ExitCode::SUCCESS)
        }
        Err(StoreError::Migration(report)) => {
            eprintln!("{}", report);
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e).context("Migration aborted"),
    }
}
