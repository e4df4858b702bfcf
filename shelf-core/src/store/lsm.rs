//! Embedded LSM backend (default), built on `fjall`
//! (other_examples/manifests/fjall-rs-lsm-tree). One partition per
//! collection plus secondary-index partitions mapping `file_hash`/`file_path`
//! -> book id, kept in sync inside a single `fjall::Batch` per mutation so
//! the index update is atomic with the row write (spec.md §4.1 "Contract").

use super::StoreError;
use crate::models::{Author, BlockedHash, Book, MetadataFieldState, Operation, Series, Setting};
use async_trait::async_trait;
use chrono::Utc;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use std::path::Path;

fn backend_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Ensures `updated_at` is strictly greater than whatever was already
/// persisted for this row, so a clock that hasn't ticked (or ticked
/// backwards) never produces a non-increasing timestamp.
fn bump_updated_at(previous: Option<chrono::DateTime<Utc>>, candidate: chrono::DateTime<Utc>) -> chrono::DateTime<Utc> {
    match previous {
        Some(prev) if candidate <= prev => prev + chrono::Duration::microseconds(1),
        _ => candidate,
    }
}

pub struct LsmStore {
    keyspace: Keyspace,
    books: PartitionHandle,
    books_by_hash: PartitionHandle,
    books_by_path: PartitionHandle,
    authors: PartitionHandle,
    authors_by_name: PartitionHandle,
    series: PartitionHandle,
    series_by_name: PartitionHandle,
    settings: PartitionHandle,
    operations: PartitionHandle,
    blocked_hashes: PartitionHandle,
    metadata_fields: PartitionHandle,
}

impl LsmStore {
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let keyspace = Config::new(data_dir.join("lsm")).open().map_err(backend_err)?;
        let opts = PartitionCreateOptions::default();
        let books = keyspace.open_partition("books", opts.clone()).map_err(backend_err)?;
        let books_by_hash = keyspace
            .open_partition("books_by_hash", opts.clone())
            .map_err(backend_err)?;
        let books_by_path = keyspace
            .open_partition("books_by_path", opts.clone())
            .map_err(backend_err)?;
        let authors = keyspace.open_partition("authors", opts.clone()).map_err(backend_err)?;
        let authors_by_name = keyspace
            .open_partition("authors_by_name", opts.clone())
            .map_err(backend_err)?;
        let series = keyspace.open_partition("series", opts.clone()).map_err(backend_err)?;
        let series_by_name = keyspace
            .open_partition("series_by_name", opts.clone())
            .map_err(backend_err)?;
        let settings = keyspace.open_partition("settings", opts.clone()).map_err(backend_err)?;
        let operations = keyspace
            .open_partition("operations", opts.clone())
            .map_err(backend_err)?;
        let blocked_hashes = keyspace
            .open_partition("blocked_hashes", opts.clone())
            .map_err(backend_err)?;
        let metadata_fields = keyspace
            .open_partition("metadata_fields", opts)
            .map_err(backend_err)?;

        Ok(Self {
            keyspace,
            books,
            books_by_hash,
            books_by_path,
            authors,
            authors_by_name,
            series,
            series_by_name,
            settings,
            operations,
            blocked_hashes,
            metadata_fields,
        })
    }

    fn persist(&self) -> Result<(), StoreError> {
        self.keyspace
            .persist(fjall::PersistMode::SyncAll)
            .map_err(backend_err)
    }
}

#[async_trait]
impl super::Store for LsmStore {
    async fn put_book(&self, mut book: Book) -> Result<(), StoreError> {
        let previous = self
            .books
            .get(book.id.as_bytes())
            .map_err(backend_err)?
            .map(|raw| decode::<Book>(&raw))
            .transpose()?;
        book.updated_at = bump_updated_at(previous.as_ref().map(|b| b.updated_at), book.updated_at);

        let mut batch = self.keyspace.batch();
        if let Some(prev) = &previous {
            if prev.file_hash != book.file_hash {
                batch.remove(&self.books_by_hash, prev.file_hash.as_bytes());
            }
            if prev.file_path != book.file_path {
                batch.remove(&self.books_by_path, prev.file_path.as_bytes());
            }
        }
        batch.insert(&self.books_by_hash, book.file_hash.as_bytes(), book.id.as_bytes());
        batch.insert(&self.books_by_path, book.file_path.as_bytes(), book.id.as_bytes());
        batch.insert(&self.books, book.id.as_bytes(), encode(&book)?);
        batch.commit().map_err(backend_err)?;
        self.persist()
    }

    async fn get_book(&self, id: &str) -> Result<Option<Book>, StoreError> {
        match self.books.get(id.as_bytes()).map_err(backend_err)? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    async fn get_book_by_hash(&self, hash: &str) -> Result<Option<Book>, StoreError> {
        let Some(id) = self.books_by_hash.get(hash.as_bytes()).map_err(backend_err)? else {
            return Ok(None);
        };
        let id = String::from_utf8_lossy(&id).to_string();
        self.get_book(&id).await
    }

    async fn get_book_by_path(&self, path: &str) -> Result<Option<Book>, StoreError> {
        let Some(id) = self.books_by_path.get(path.as_bytes()).map_err(backend_err)? else {
            return Ok(None);
        };
        let id = String::from_utf8_lossy(&id).to_string();
        self.get_book(&id).await
    }

    async fn list_books(&self) -> Result<Vec<Book>, StoreError> {
        let mut out = Vec::new();
        for kv in self.books.iter() {
            let (_, raw) = kv.map_err(backend_err)?;
            out.push(decode(&raw)?);
        }
        Ok(out)
    }

    async fn delete_book(&self, id: &str) -> Result<(), StoreError> {
        if let Some(book) = self.get_book(id).await? {
            let mut batch = self.keyspace.batch();
            batch.remove(&self.books, id.as_bytes());
            batch.remove(&self.books_by_hash, book.file_hash.as_bytes());
            batch.remove(&self.books_by_path, book.file_path.as_bytes());
            batch.commit().map_err(backend_err)?;
            self.persist()?;
        }
        Ok(())
    }

    async fn put_author(&self, mut author: Author) -> Result<(), StoreError> {
        let folded = Author::fold_key(&author.name);
        let previous = self
            .authors
            .get(author.id.as_bytes())
            .map_err(backend_err)?
            .map(|raw| decode::<Author>(&raw))
            .transpose()?;
        author.updated_at = bump_updated_at(previous.map(|a| a.updated_at), author.updated_at);
        let mut batch = self.keyspace.batch();
        batch.insert(&self.authors_by_name, folded.as_bytes(), author.id.as_bytes());
        batch.insert(&self.authors, author.id.as_bytes(), encode(&author)?);
        batch.commit().map_err(backend_err)?;
        self.persist()
    }

    async fn get_author_by_name(&self, folded_name: &str) -> Result<Option<Author>, StoreError> {
        let Some(id) = self
            .authors_by_name
            .get(folded_name.as_bytes())
            .map_err(backend_err)?
        else {
            return Ok(None);
        };
        match self.authors.get(&id).map_err(backend_err)? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    async fn list_authors(&self) -> Result<Vec<Author>, StoreError> {
        let mut out = Vec::new();
        for kv in self.authors.iter() {
            let (_, raw) = kv.map_err(backend_err)?;
            out.push(decode(&raw)?);
        }
        Ok(out)
    }

    async fn put_series(&self, mut series: Series) -> Result<(), StoreError> {
        let folded = Series::fold_key(&series.name);
        let previous = self
            .series
            .get(series.id.as_bytes())
            .map_err(backend_err)?
            .map(|raw| decode::<Series>(&raw))
            .transpose()?;
        series.updated_at = bump_updated_at(previous.map(|s| s.updated_at), series.updated_at);
        let mut batch = self.keyspace.batch();
        batch.insert(&self.series_by_name, folded.as_bytes(), series.id.as_bytes());
        batch.insert(&self.series, series.id.as_bytes(), encode(&series)?);
        batch.commit().map_err(backend_err)?;
        self.persist()
    }

    async fn get_series_by_name(&self, folded_name: &str) -> Result<Option<Series>, StoreError> {
        let Some(id) = self
            .series_by_name
            .get(folded_name.as_bytes())
            .map_err(backend_err)?
        else {
            return Ok(None);
        };
        match self.series.get(&id).map_err(backend_err)? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    async fn list_series(&self) -> Result<Vec<Series>, StoreError> {
        let mut out = Vec::new();
        for kv in self.series.iter() {
            let (_, raw) = kv.map_err(backend_err)?;
            out.push(decode(&raw)?);
        }
        Ok(out)
    }

    async fn put_setting(&self, mut setting: Setting) -> Result<(), StoreError> {
        let previous = self
            .settings
            .get(setting.key.as_bytes())
            .map_err(backend_err)?
            .map(|raw| decode::<Setting>(&raw))
            .transpose()?;
        setting.updated_at = bump_updated_at(previous.map(|s| s.updated_at), setting.updated_at);
        self.settings
            .insert(setting.key.as_bytes(), encode(&setting)?)
            .map_err(backend_err)?;
        self.persist()
    }

    async fn get_setting(&self, key: &str) -> Result<Option<Setting>, StoreError> {
        match self.settings.get(key.as_bytes()).map_err(backend_err)? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    async fn list_settings(&self) -> Result<Vec<Setting>, StoreError> {
        let mut out = Vec::new();
        for kv in self.settings.iter() {
            let (_, raw) = kv.map_err(backend_err)?;
            out.push(decode(&raw)?);
        }
        Ok(out)
    }

    async fn put_operation(&self, mut operation: Operation) -> Result<(), StoreError> {
        let previous = self
            .operations
            .get(operation.id.as_bytes())
            .map_err(backend_err)?
            .map(|raw| decode::<Operation>(&raw))
            .transpose()?;
        operation.updated_at = bump_updated_at(previous.map(|o| o.updated_at), operation.updated_at);
        self.operations
            .insert(operation.id.as_bytes(), encode(&operation)?)
            .map_err(backend_err)?;
        self.persist()
    }

    async fn get_operation(&self, id: &str) -> Result<Option<Operation>, StoreError> {
        match self.operations.get(id.as_bytes()).map_err(backend_err)? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    async fn list_operations(&self) -> Result<Vec<Operation>, StoreError> {
        let mut out = Vec::new();
        for kv in self.operations.iter() {
            let (_, raw) = kv.map_err(backend_err)?;
            out.push(decode(&raw)?);
        }
        Ok(out)
    }

    async fn delete_operation(&self, id: &str) -> Result<(), StoreError> {
        self.operations.remove(id.as_bytes()).map_err(backend_err)?;
        self.persist()
    }

    async fn block_hash(&self, blocked: BlockedHash) -> Result<(), StoreError> {
        self.blocked_hashes
            .insert(blocked.hash.as_bytes(), encode(&blocked)?)
            .map_err(backend_err)?;
        self.persist()
    }

    async fn is_hash_blocked(&self, hash: &str) -> Result<bool, StoreError> {
        Ok(self.blocked_hashes.get(hash.as_bytes()).map_err(backend_err)?.is_some())
    }

    async fn unblock_hash(&self, hash: &str) -> Result<(), StoreError> {
        self.blocked_hashes.remove(hash.as_bytes()).map_err(backend_err)?;
        self.persist()
    }

    async fn list_blocked_hashes(&self) -> Result<Vec<BlockedHash>, StoreError> {
        let mut out = Vec::new();
        for kv in self.blocked_hashes.iter() {
            let (_, raw) = kv.map_err(backend_err)?;
            out.push(decode(&raw)?);
        }
        Ok(out)
    }

    async fn put_metadata_field(&self, mut state: MetadataFieldState) -> Result<(), StoreError> {
        let key = MetadataFieldState::key(&state.book_id, &state.field);
        let previous = self
            .metadata_fields
            .get(key.as_bytes())
            .map_err(backend_err)?
            .map(|raw| decode::<MetadataFieldState>(&raw))
            .transpose()?;
        state.updated_at = bump_updated_at(previous.map(|s| s.updated_at), state.updated_at);
        self.metadata_fields
            .insert(key.as_bytes(), encode(&state)?)
            .map_err(backend_err)?;
        self.persist()
    }

    async fn get_metadata_field(
        &self,
        book_id: &str,
        field: &str,
    ) -> Result<Option<MetadataFieldState>, StoreError> {
        let key = MetadataFieldState::key(book_id, field);
        match self.metadata_fields.get(key.as_bytes()).map_err(backend_err)? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    async fn list_metadata_fields(
        &self,
        book_id: &str,
    ) -> Result<Vec<MetadataFieldState>, StoreError> {
        let prefix = format!("{book_id}::");
        let mut out = Vec::new();
        for kv in self.metadata_fields.prefix(prefix.as_bytes()) {
            let (_, raw) = kv.map_err(backend_err)?;
            out.push(decode(&raw)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn tmp_store() -> LsmStore {
        let dir = tempfile::tempdir().unwrap();
        LsmStore::open(dir.keep().as_path()).unwrap()
    }

    #[tokio::test]
    async fn round_trips_a_book_and_indexes_it() {
        let store = tmp_store();
        let book = Book::new(
            "The Hobbit".into(),
            "J.R.R. Tolkien".into(),
            "/import/hobbit.mp3".into(),
            "deadbeef".into(),
        );
        let id = book.id.clone();
        store.put_book(book).await.unwrap();

        let fetched = store.get_book(&id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "The Hobbit");

        let by_hash = store.get_book_by_hash("deadbeef").await.unwrap().unwrap();
        assert_eq!(by_hash.id, id);

        let by_path = store.get_book_by_path("/import/hobbit.mp3").await.unwrap().unwrap();
        assert_eq!(by_path.id, id);
    }

    #[tokio::test]
    async fn updated_at_is_strictly_increasing() {
        let store = tmp_store();
        let mut book = Book::new(
            "Dune".into(),
            "Frank Herbert".into(),
            "/import/dune.mp3".into(),
            "aaaa".into(),
        );
        let stamp = book.updated_at;
        store.put_book(book.clone()).await.unwrap();

        book.updated_at = stamp; // simulate a caller that didn't bump the clock
        store.put_book(book.clone()).await.unwrap();

        let fetched = store.get_book(&book.id).await.unwrap().unwrap();
        assert!(fetched.updated_at > stamp);
    }

    #[tokio::test]
    async fn blocked_hash_list_roundtrips() {
        let store = tmp_store();
        store
            .block_hash(BlockedHash {
                hash: "cafebabe".into(),
                reason: "known bad rip".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        assert!(store.is_hash_blocked("cafebabe").await.unwrap());
        store.unblock_hash("cafebabe").await.unwrap();
        assert!(!store.is_hash_blocked("cafebabe").await.unwrap());
    }
}
