pub mod chat_db;
pub mod config;
pub mod telemetry;
pub mod utils;

#[cfg(feature = "server")]
pub mod api;
#[cfg(feature = "server")]
pub mod metrics;
#[cfg(feature = "server")]
pub mod server;
#[cfg(feature = "server")]
pub mod shared_state;

// Public API exports
pub use chat_db::{
    ChatDatabase, Conversation, ConversationStore, ConversationSummary, DatabaseOptions, ErrorKind,
    Message, MigrationReport, Outcome, SchemaMigrator, StoreError, StoreResult,
};
pub use config::Config;

#[cfg(feature = "server")]
pub use server::{build_router, run_server};
