//! Durable key/value storage for plugin state.
//!
//! Keys at the store layer are composite (`<pipeline>^<user_key>`); the
//! pipeline prefix is added by [`crate::plugin::PluginContext`] before a call
//! reaches the store. A [`CheckpointSweeper`] removes entries that belong to
//! pipelines which no longer exist.

pub mod key;
pub mod store;
pub mod sweeper;

pub use key::{composite_key, split_composite_key, KEY_SEPARATOR};
pub use store::CheckpointStore;
pub use sweeper::{CheckpointSweeper, RetentionPolicy};

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint store is not initialized")]
    NotInitialized,

    #[error("invalid checkpoint key {0:?}: user keys may not contain '^'")]
    InvalidKey(String),

    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("checkpoint connection lock poisoned")]
    Poisoned,

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CheckpointError>;
