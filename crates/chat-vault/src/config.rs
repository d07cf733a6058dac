use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

use crate::chat_db::{DatabaseOptions, CANONICAL_MODEL};

const DEFAULT_MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub backup_dir: Option<PathBuf>,
    pub default_model: String,
    pub pool_size: u32,
    pub api_host: String,
    pub api_port: u16,
    /// Empty means any origin
    pub allowed_origins: Vec<String>,
    pub request_timeout_seconds: u64,
    pub max_body_bytes: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let db_path = PathBuf::from(env::var("CHAT_DB_PATH").unwrap_or_else(|_| "database/chats.db".into()));
        let backup_dir = env::var("BACKUP_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            db_path,
            backup_dir,
            default_model: env::var("DEFAULT_MODEL").unwrap_or_else(|_| CANONICAL_MODEL.into()),
            pool_size: parse_var("DB_POOL_SIZE", 8)?,
            api_host: env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            api_port: parse_var("API_PORT", 8080)?,
            allowed_origins: parse_origins(&env::var("ALLOWED_ORIGINS").unwrap_or_default()),
            request_timeout_seconds: parse_var("REQUEST_TIMEOUT_SECONDS", 30)?,
            max_body_bytes: parse_var("MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES)?,
        })
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Database: {}", self.db_path.display());
        info!("- Backup Dir: {}", self.backup_dir().display());
        info!("- Default Model: {}", self.default_model);
        info!("- Pool Size: {}", self.pool_size);
        info!("- API: {}:{}", self.api_host, self.api_port);
        if self.allowed_origins.is_empty() {
            info!("- CORS: any origin");
        } else {
            info!("- CORS: {}", self.allowed_origins.join(", "));
        }
        info!("- Request Timeout: {}s", self.request_timeout_seconds);
        info!("- Max Body: {} bytes", self.max_body_bytes);
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("Invalid API address {}:{}", self.api_host, self.api_port))
    }

    /// Directory that receives pre-migration snapshots
    pub fn backup_dir(&self) -> &Path {
        match &self.backup_dir {
            Some(dir) => dir,
            None => self.db_path.parent().unwrap_or_else(|| Path::new(".")),
        }
    }

    pub fn database_options(&self) -> DatabaseOptions {
        DatabaseOptions {
            path: self.db_path.clone(),
            backup_dir: self.backup_dir.clone(),
            default_model: self.default_model.clone(),
            pool_size: self.pool_size,
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a number, got '{}'", name, raw)),
        _ => Ok(default),
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(String::from)
        .collect()
}
