//! The Store (spec.md §4.1): a single-process key/value facade over two
//! interchangeable backends. Backend choice is invisible to every caller
//! above this layer (spec.md §9 "Polymorphic Store" — one trait, two
//! concrete types, no class hierarchy).

mod lsm;
mod relational;
pub mod secrets;

use crate::models::{
    BlockedHash, Book, MetadataFieldState, Operation, Series, Setting,
};
use async_trait::async_trait;
use thiserror::Error;

pub use lsm::LsmStore;
pub use relational::RelationalStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("not found")]
    NotFound,
}

/// Collection-specific typed operations. Implementations must provide:
/// atomicity across a conceptual row, durability before ack, and a
/// strictly-increasing `updated_at` per mutation (spec.md §4.1 "Contract").
#[async_trait]
pub trait Store: Send + Sync {
    async fn put_book(&self, book: Book) -> Result<(), StoreError>;
    async fn get_book(&self, id: &str) -> Result<Option<Book>, StoreError>;
    async fn get_book_by_hash(&self, hash: &str) -> Result<Option<Book>, StoreError>;
    async fn get_book_by_path(&self, path: &str) -> Result<Option<Book>, StoreError>;
    async fn list_books(&self) -> Result<Vec<Book>, StoreError>;
    async fn delete_book(&self, id: &str) -> Result<(), StoreError>;

    async fn put_author(&self, author: crate::models::Author) -> Result<(), StoreError>;
    async fn get_author_by_name(
        &self,
        folded_name: &str,
    ) -> Result<Option<crate::models::Author>, StoreError>;
    async fn list_authors(&self) -> Result<Vec<crate::models::Author>, StoreError>;

    async fn put_series(&self, series: Series) -> Result<(), StoreError>;
    async fn get_series_by_name(&self, folded_name: &str) -> Result<Option<Series>, StoreError>;
    async fn list_series(&self) -> Result<Vec<Series>, StoreError>;

    async fn put_setting(&self, setting: Setting) -> Result<(), StoreError>;
    async fn get_setting(&self, key: &str) -> Result<Option<Setting>, StoreError>;
    async fn list_settings(&self) -> Result<Vec<Setting>, StoreError>;

    async fn put_operation(&self, operation: Operation) -> Result<(), StoreError>;
    async fn get_operation(&self, id: &str) -> Result<Option<Operation>, StoreError>;
    async fn list_operations(&self) -> Result<Vec<Operation>, StoreError>;
    async fn delete_operation(&self, id: &str) -> Result<(), StoreError>;

    async fn block_hash(&self, blocked: BlockedHash) -> Result<(), StoreError>;
    async fn is_hash_blocked(&self, hash: &str) -> Result<bool, StoreError>;
    async fn unblock_hash(&self, hash: &str) -> Result<(), StoreError>;
    async fn list_blocked_hashes(&self) -> Result<Vec<BlockedHash>, StoreError>;

    async fn put_metadata_field(&self, state: MetadataFieldState) -> Result<(), StoreError>;
    async fn get_metadata_field(
        &self,
        book_id: &str,
        field: &str,
    ) -> Result<Option<MetadataFieldState>, StoreError>;
    async fn list_metadata_fields(
        &self,
        book_id: &str,
    ) -> Result<Vec<MetadataFieldState>, StoreError>;
}

/// Normalises a user-configured backend alias: `sqlite3` -> `sqlite`, empty
/// -> the default (`lsm`). Runs once at startup (spec.md §4.1 "Failure
/// model").
pub fn normalize_backend_alias(raw: &str) -> String {
    match raw.trim().to_lowercase().as_str() {
        "" => "lsm".to_string(),
        "sqlite3" => "sqlite".to_string(),
        other => other.to_string(),
    }
}

/// Opens the configured backend. Store initialisation failure is fatal
/// (spec.md §4.1 "Failure model"): callers should abort startup on `Err`.
pub async fn open(backend: &str, data_dir: &std::path::Path) -> Result<Box<dyn Store>, StoreError> {
    match normalize_backend_alias(backend).as_str() {
        "sqlite" => {
            let store = RelationalStore::open(data_dir).await?;
            Ok(Box::new(store))
        }
        _ => {
            let store = LsmStore::open(data_dir)?;
            Ok(Box::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_sqlite3_alias() {
        assert_eq!(normalize_backend_alias("sqlite3"), "sqlite");
        assert_eq!(normalize_backend_alias("SQLite3"), "sqlite");
    }

    #[test]
    fn normalizes_empty_alias_to_default() {
        assert_eq!(normalize_backend_alias(""), "lsm");
        assert_eq!(normalize_backend_alias("   "), "lsm");
    }

    #[test]
    fn leaves_other_aliases_untouched() {
        assert_eq!(normalize_backend_alias("lsm"), "lsm");
    }
}
