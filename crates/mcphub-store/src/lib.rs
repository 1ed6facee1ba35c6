//! # mcphub-store
//!
//! Persistence for server descriptors.
//!
//! The supervisor only sees the [`ServerStore`] trait. Two backends ship:
//! an in-memory map for tests and ephemeral runs, and SQLite for everything
//! else.

mod memory;
mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use mcphub_core::config::{StoreBackend, StoreConfig};
use mcphub_core::{Scope, ServerDescriptor, ServerId};
use thiserror::Error;

pub use memory::MemoryServerStore;
pub use sqlite::SqliteServerStore;

/// Errors that can occur during storage operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Server not found: {0}")]
    NotFound(String),

    #[error("A server named '{name}' already exists in scope '{scope}'")]
    Duplicate { scope: String, name: String },

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Repository of server descriptors.
#[async_trait]
pub trait ServerStore: Send + Sync {
    /// Descriptors in one scope, ordered by name.
    async fn list(&self, scope: &Scope) -> Result<Vec<ServerDescriptor>>;

    /// Every descriptor, ordered by scope then name.
    async fn list_all(&self) -> Result<Vec<ServerDescriptor>>;

    /// Descriptor by id.
    async fn get(&self, id: ServerId) -> Result<Option<ServerDescriptor>>;

    /// Descriptor by name within a scope.
    async fn find_by_name(&self, scope: &Scope, name: &str) -> Result<Option<ServerDescriptor>>;

    /// Insert a new descriptor. Fails with `Duplicate` if the name is taken.
    async fn insert(&self, descriptor: &ServerDescriptor) -> Result<()>;

    /// Replace an existing descriptor.
    async fn update(&self, descriptor: &ServerDescriptor) -> Result<()>;

    /// Remove a descriptor. Returns whether it existed.
    async fn delete(&self, id: ServerId) -> Result<bool>;
}

/// Open the backend selected by `config`.
pub fn open(config: &StoreConfig) -> Result<Arc<dyn ServerStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryServerStore::new())),
        StoreBackend::Sqlite => Ok(Arc::new(SqliteServerStore::open(config.database_path())?)),
    }
}
