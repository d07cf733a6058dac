//! State shared by every HTTP handler

use std::sync::Arc;

use crate::chat_db::ChatDatabase;
use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<ChatDatabase>,
    /// Read-only after startup
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(db: ChatDatabase, config: Config) -> Self {
        Self {
            db: Arc::new(db),
            config: Arc::new(config),
        }
    }
}

#[cfg(test)]
impl AppState {
    /// State over a private in-memory database
    pub(crate) fn in_memory() -> Self {
        let config = Config {
            db_path: ":memory:".into(),
            backup_dir: None,
            default_model: crate::chat_db::CANONICAL_MODEL.to_string(),
            pool_size: 1,
            api_host: "127.0.0.1".to_string(),
            api_port: 0,
            allowed_origins: vec![],
            request_timeout_seconds: 30,
            max_body_bytes: 1024 * 1024,
        };
        Self::new(ChatDatabase::new_in_memory().unwrap(), config)
    }
}
