//! The organize half of the scan/organize pipeline (spec.md §4.5
//! "Organize", "Version grouping", "Operation-level concurrency").
//! Destination-path rendering follows the teacher's `sanitize_path_component`
//! convention in `util.rs`; per-book locking is new to this crate but
//! mirrors the `tokens: Mutex<HashMap<..>>` shape the operation manager
//! already uses for per-operation cancellation tokens.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

use crate::fileop::{self, FileOpError, LayoutStrategy};
use crate::models::{Book, LibraryState};
use crate::store::{Store, StoreError};
use crate::util::sanitize_path_component;

#[derive(Debug, Error)]
pub enum OrganizeError {
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("file-op error: {0}")]
    FileOp(#[from] FileOpError),
    #[error("book {0} not found")]
    BookNotFound(String),
    #[error("book {0} is not in the import state")]
    NotImportable(String),
    #[error("book {0} is already being organized by another operation")]
    Busy(String),
    #[error("book content hash {0} is blocked and cannot be organized")]
    HashBlocked(String),
}

/// How a duplicate-content organize request should be resolved (spec.md
/// §4.5 "Duplicate detection"): surfaced as an operation log line the UI
/// answers with a follow-up decision, represented here as a value the
/// caller already decided on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    Skip,
    LinkAsVersion,
}

pub struct OrganizeConfig {
    pub library_root: PathBuf,
    pub folder_naming_pattern: String,
    pub file_naming_pattern: String,
    pub layout_strategy: LayoutStrategy,
    pub create_backups: bool,
    pub backup_root: PathBuf,
}

/// The result of organizing a single book.
#[derive(Debug, Clone)]
pub enum OrganizeOutcome {
    Placed { destination: PathBuf },
    SkippedDuplicate { of_book_id: String },
    LinkedAsVersion { of_book_id: String, version_group_id: String },
}

/// Fills in a naming pattern's `{token}` placeholders from a Book's
/// resolved metadata (spec.md §4.5: "compute the destination path from
/// the folder- and file-naming patterns using the book's resolved
/// metadata"). Unrecognised tokens are left as-is so a misconfigured
/// pattern is visible rather than silently swallowed.
pub fn render_pattern(pattern: &str, book: &Book) -> String {
    let series_name = book.series_name.clone().unwrap_or_default();
    let series_position = book
        .series_position
        .map(|p| if p.fract() == 0.0 { format!("{p:.0}") } else { format!("{p:.2}") })
        .unwrap_or_default();

    let rendered = pattern
        .replace("{author}", &sanitize_path_component(&book.author_name))
        .replace("{title}", &sanitize_path_component(&book.title))
        .replace("{series}", &sanitize_path_component(&series_name))
        .replace("{series_position}", &series_position);
    rendered
}

/// Computes the final destination path for `book` under `config`,
/// resolving collisions via [`fileop::collision_free_path`] (spec.md §4.5,
/// §4.4 "Placement invariants").
pub fn destination_for(book: &Book, config: &OrganizeConfig) -> PathBuf {
    let folder = render_pattern(&config.folder_naming_pattern, book);
    let extension = Path::new(&book.file_path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_string();
    let file_stem = render_pattern(&config.file_naming_pattern, book);
    let file_name = if extension.is_empty() {
        file_stem
    } else {
        format!("{file_stem}.{extension}")
    };

    let candidate = config.library_root.join(folder).join(file_name);
    fileop::collision_free_path(&candidate, |p| p.exists())
}

/// Owns per-book locks so overlapping organize requests for the same book
/// are rejected instead of racing (spec.md §4.5 "Operation-level
/// concurrency").
#[derive(Default)]
pub struct OrganizeManager {
    locks: std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl OrganizeManager {
    pub fn new() -> Self {
        OrganizeManager::default()
    }

    fn lock_for(&self, book_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(book_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Organizes a single book: computes its destination, invokes the
    /// file-op engine, handles duplicate content, and promotes the book to
    /// `organized` on success (spec.md §4.5 "Organize"). When
    /// `confirm_version_match` is set, a book whose resolved title+author
    /// match an already-organized book case-folded -- even though their
    /// content hashes differ -- is placed as usual and then linked into
    /// that book's version group (spec.md §4.5 "Version grouping": "the
    /// user confirms").
    pub async fn organize_book(
        &self,
        store: &Arc<dyn Store>,
        book_id: &str,
        operation_id: &str,
        config: &OrganizeConfig,
        duplicate_policy: DuplicatePolicy,
        confirm_version_match: bool,
    ) -> Result<OrganizeOutcome, OrganizeError> {
        let lock = self.lock_for(book_id);
        let _guard = lock
            .try_lock()
            .map_err(|_| OrganizeError::Busy(book_id.to_string()))?;

        let mut book = store
            .get_book(book_id)
            .await?
            .ok_or_else(|| OrganizeError::BookNotFound(book_id.to_string()))?;
        if book.library_state != LibraryState::Import {
            return Err(OrganizeError::NotImportable(book_id.to_string()));
        }
        if store.is_hash_blocked(&book.file_hash).await? {
            return Err(OrganizeError::HashBlocked(book.file_hash.clone()));
        }

        if let Some(existing) = find_duplicate(store, &book).await? {
            return match duplicate_policy {
                DuplicatePolicy::Skip => Ok(OrganizeOutcome::SkippedDuplicate { of_book_id: existing.id }),
                DuplicatePolicy::LinkAsVersion => {
                    let group_id = link_as_version(store, &mut book, &existing).await?;
                    Ok(OrganizeOutcome::LinkedAsVersion { of_book_id: existing.id, version_group_id: group_id })
                }
            };
        }

        let destination = destination_for(&book, config);
        let placed = fileop::place(
            Path::new(&book.file_path),
            &destination,
            config.layout_strategy,
            config.create_backups,
            &config.backup_root,
            operation_id,
        )?;

        book.library_state = LibraryState::Organized;
        book.file_path = placed.destination.to_string_lossy().to_string();
        book.organized_file_hash = Some(placed.hash);
        book.updated_at = chrono::Utc::now();

        if confirm_version_match {
            if let Some(existing) = find_version_match(store, &book).await? {
                let group_id = link_as_version(store, &mut book, &existing).await?;
                info!(book_id, destination = %placed.destination.display(), version_group_id = %group_id, "organized book as new version");
                return Ok(OrganizeOutcome::LinkedAsVersion { of_book_id: existing.id, version_group_id: group_id });
            }
        }

        store.put_book(book).await?;
        info!(book_id, destination = %placed.destination.display(), "organized book");
        Ok(OrganizeOutcome::Placed { destination: placed.destination })
    }
}

/// Finds an already-organized Book with the same content hash (spec.md
/// §4.5 "Duplicate detection": "Two files with equal content hash are
/// duplicates").
async fn find_duplicate(store: &Arc<dyn Store>, book: &Book) -> Result<Option<Book>, StoreError> {
    match store.get_book_by_hash(&book.file_hash).await? {
        Some(existing) if existing.id != book.id && existing.library_state == LibraryState::Organized => {
            Ok(Some(existing))
        }
        _ => Ok(None),
    }
}

/// Finds an already-organized Book whose resolved title+author match `book`
/// case-folded and trimmed, despite a differing `original_file_hash` (spec.md
/// §4.5 "Version grouping": "original_file_hash values differ but ...
/// resolved title + author are equal (case-folded, trimmed)"). Callers are
/// responsible for only reaching this when the user has confirmed the
/// match; this function itself performs no confirmation.
async fn find_version_match(store: &Arc<dyn Store>, book: &Book) -> Result<Option<Book>, StoreError> {
    let key = book.version_key();
    Ok(store
        .list_books()
        .await?
        .into_iter()
        .find(|candidate| {
            candidate.id != book.id
                && candidate.library_state == LibraryState::Organized
                && candidate.original_file_hash != book.original_file_hash
                && candidate.version_key() == key
        }))
}

/// Groups `book` with `existing` under a shared `version_group_id` (spec.md
/// §4.5 "Version grouping"). Called either when `book` and `existing` share
/// an identical content hash (duplicate-as-version, via [`find_duplicate`])
/// or when their resolved title+author match case-folded despite differing
/// content hashes (via [`find_version_match`], after the caller has
/// confirmed the match with the user). The primary-version bit defaults to
/// whichever book was added first.
async fn link_as_version(store: &Arc<dyn Store>, book: &mut Book, existing: &Book) -> Result<String, StoreError> {
    let group_id = existing.version_group_id.clone().unwrap_or_else(|| existing.id.clone());

    if existing.version_group_id.is_none() {
        let mut existing = existing.clone();
        existing.version_group_id = Some(group_id.clone());
        existing.is_primary_version = true;
        existing.updated_at = chrono::Utc::now();
        store.put_book(existing).await?;
    }

    book.version_group_id = Some(group_id.clone());
    book.is_primary_version = false;
    book.updated_at = chrono::Utc::now();
    store.put_book(book.clone()).await?;
    Ok(group_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LsmStore;
    use std::fs;

    fn sample_config(library_root: &Path, backup_root: &Path) -> OrganizeConfig {
        OrganizeConfig {
            library_root: library_root.to_path_buf(),
            folder_naming_pattern: "{author}/{title}".to_string(),
            file_naming_pattern: "{title}".to_string(),
            layout_strategy: LayoutStrategy::Copy,
            create_backups: false,
            backup_root: backup_root.to_path_buf(),
        }
    }

    #[test]
    fn render_pattern_substitutes_author_and_title() {
        let book = Book::new("The Hobbit".into(), "J.R.R. Tolkien".into(), "/x/a.mp3".into(), "h1".into());
        let rendered = render_pattern("{author}/{title}", &book);
        assert_eq!(rendered, "J.R.R. Tolkien/The Hobbit");
    }

    #[test]
    fn destination_for_appends_source_extension() {
        let dir = tempfile::tempdir().unwrap();
        let book = Book::new("The Hobbit".into(), "Tolkien".into(), "/import/a.m4b".into(), "h1".into());
        let config = sample_config(dir.path(), dir.path());
        let destination = destination_for(&book, &config);
        assert_eq!(destination, dir.path().join("Tolkien").join("The Hobbit.m4b"));
    }

    #[tokio::test]
    async fn organize_book_places_file_and_marks_organized() {
        let data_dir = tempfile::tempdir().unwrap();
        let library_root = tempfile::tempdir().unwrap();
        let import_dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(LsmStore::open(data_dir.path()).unwrap());

        let source = import_dir.path().join("a.mp3");
        fs::write(&source, b"audio bytes").unwrap();
        let hash = fileop::hash_file(&source).unwrap();
        let mut book = Book::new("The Hobbit".into(), "Tolkien".into(), source.to_string_lossy().to_string(), hash);
        book.id = "book-1".to_string();
        store.put_book(book).await.unwrap();

        let manager = OrganizeManager::new();
        let config = sample_config(library_root.path(), library_root.path());
        let outcome = manager
            .organize_book(&store, "book-1", "op-1", &config, DuplicatePolicy::Skip, false)
            .await
            .unwrap();

        assert!(matches!(outcome, OrganizeOutcome::Placed { .. }));
        let organized = store.get_book("book-1").await.unwrap().unwrap();
        assert_eq!(organized.library_state, LibraryState::Organized);
        assert!(organized.organized_file_hash.is_some());
    }

    #[tokio::test]
    async fn organize_book_rejects_non_import_state() {
        let data_dir = tempfile::tempdir().unwrap();
        let library_root = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(LsmStore::open(data_dir.path()).unwrap());

        let mut book = Book::new("X".into(), "Y".into(), "/a.mp3".into(), "h1".into());
        book.id = "book-1".to_string();
        book.library_state = LibraryState::Organized;
        store.put_book(book).await.unwrap();

        let manager = OrganizeManager::new();
        let config = sample_config(library_root.path(), library_root.path());
        let result = manager.organize_book(&store, "book-1", "op-1", &config, DuplicatePolicy::Skip, false).await;
        assert!(matches!(result, Err(OrganizeError::NotImportable(_))));
    }

    #[tokio::test]
    async fn organize_book_rejects_blocked_hash() {
        let data_dir = tempfile::tempdir().unwrap();
        let library_root = tempfile::tempdir().unwrap();
        let import_dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(LsmStore::open(data_dir.path()).unwrap());

        let source = import_dir.path().join("a.mp3");
        fs::write(&source, b"audio bytes").unwrap();
        let hash = fileop::hash_file(&source).unwrap();
        store
            .block_hash(crate::models::BlockedHash { hash: hash.clone(), reason: "dmca".into(), created_at: chrono::Utc::now() })
            .await
            .unwrap();

        let mut book = Book::new("X".into(), "Y".into(), source.to_string_lossy().to_string(), hash);
        book.id = "book-1".to_string();
        store.put_book(book).await.unwrap();

        let manager = OrganizeManager::new();
        let config = sample_config(library_root.path(), library_root.path());
        let result = manager.organize_book(&store, "book-1", "op-1", &config, DuplicatePolicy::Skip, false).await;
        assert!(matches!(result, Err(OrganizeError::HashBlocked(_))));
    }

    #[tokio::test]
    async fn duplicate_with_skip_policy_leaves_book_in_import_state() {
        let data_dir = tempfile::tempdir().unwrap();
        let library_root = tempfile::tempdir().unwrap();
        let import_dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(LsmStore::open(data_dir.path()).unwrap());

        let source = import_dir.path().join("a.mp3");
        fs::write(&source, b"shared bytes").unwrap();
        let hash = fileop::hash_file(&source).unwrap();

        let mut existing = Book::new("Existing".into(), "Author".into(), "/lib/existing.mp3".into(), hash.clone());
        existing.id = "book-existing".to_string();
        existing.library_state = LibraryState::Organized;
        store.put_book(existing).await.unwrap();

        let mut book = Book::new("New".into(), "Author".into(), source.to_string_lossy().to_string(), hash);
        book.id = "book-new".to_string();
        store.put_book(book).await.unwrap();

        let manager = OrganizeManager::new();
        let config = sample_config(library_root.path(), library_root.path());
        let outcome = manager
            .organize_book(&store, "book-new", "op-1", &config, DuplicatePolicy::Skip, false)
            .await
            .unwrap();

        assert!(matches!(outcome, OrganizeOutcome::SkippedDuplicate { .. }));
        let book = store.get_book("book-new").await.unwrap().unwrap();
        assert_eq!(book.library_state, LibraryState::Import);
    }

    #[tokio::test]
    async fn duplicate_with_link_policy_shares_version_group() {
        let data_dir = tempfile::tempdir().unwrap();
        let library_root = tempfile::tempdir().unwrap();
        let import_dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(LsmStore::open(data_dir.path()).unwrap());

        let source = import_dir.path().join("a.mp3");
        fs::write(&source, b"shared bytes").unwrap();
        let hash = fileop::hash_file(&source).unwrap();

        let mut existing = Book::new("Existing".into(), "Author".into(), "/lib/existing.mp3".into(), hash.clone());
        existing.id = "book-existing".to_string();
        existing.library_state = LibraryState::Organized;
        store.put_book(existing).await.unwrap();

        let mut book = Book::new("New".into(), "Author".into(), source.to_string_lossy().to_string(), hash);
        book.id = "book-new".to_string();
        store.put_book(book).await.unwrap();

        let manager = OrganizeManager::new();
        let config = sample_config(library_root.path(), library_root.path());
        let outcome = manager
            .organize_book(&store, "book-new", "op-1", &config, DuplicatePolicy::LinkAsVersion, false)
            .await
            .unwrap();

        let group_id = match outcome {
            OrganizeOutcome::LinkedAsVersion { version_group_id, .. } => version_group_id,
            other => panic!("expected LinkedAsVersion, got {other:?}"),
        };

        let linked = store.get_book("book-new").await.unwrap().unwrap();
        let primary = store.get_book("book-existing").await.unwrap().unwrap();
        assert_eq!(linked.version_group_id, Some(group_id.clone()));
        assert!(!linked.is_primary_version);
        assert_eq!(primary.version_group_id, Some(group_id));
        assert!(primary.is_primary_version);
    }

    #[tokio::test]
    async fn confirmed_title_author_match_links_version_group_despite_differing_hash() {
        let data_dir = tempfile::tempdir().unwrap();
        let library_root = tempfile::tempdir().unwrap();
        let import_dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(LsmStore::open(data_dir.path()).unwrap());

        let mut existing = Book::new("The Hobbit".into(), "J.R.R. Tolkien".into(), "/lib/existing.mp3".into(), "hash-v1".into());
        existing.id = "book-existing".to_string();
        existing.library_state = LibraryState::Organized;
        store.put_book(existing).await.unwrap();

        let source = import_dir.path().join("remaster.flac");
        fs::write(&source, b"different remaster bytes").unwrap();
        let hash = fileop::hash_file(&source).unwrap();
        let mut book = Book::new(
            "  the hobbit  ".into(),
            " j.r.r. tolkien ".into(),
            source.to_string_lossy().to_string(),
            hash,
        );
        book.id = "book-new".to_string();
        store.put_book(book).await.unwrap();

        let manager = OrganizeManager::new();
        let config = sample_config(library_root.path(), library_root.path());
        let outcome = manager
            .organize_book(&store, "book-new", "op-1", &config, DuplicatePolicy::Skip, true)
            .await
            .unwrap();

        let group_id = match outcome {
            OrganizeOutcome::LinkedAsVersion { version_group_id, .. } => version_group_id,
            other => panic!("expected LinkedAsVersion, got {other:?}"),
        };

        let linked = store.get_book("book-new").await.unwrap().unwrap();
        let primary = store.get_book("book-existing").await.unwrap().unwrap();
        assert_eq!(linked.library_state, LibraryState::Organized);
        assert!(linked.organized_file_hash.is_some());
        assert_eq!(linked.version_group_id, Some(group_id.clone()));
        assert!(!linked.is_primary_version);
        assert_eq!(primary.version_group_id, Some(group_id));
        assert!(primary.is_primary_version);
    }

    #[tokio::test]
    async fn unconfirmed_title_author_match_places_book_without_linking() {
        let data_dir = tempfile::tempdir().unwrap();
        let library_root = tempfile::tempdir().unwrap();
        let import_dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(LsmStore::open(data_dir.path()).unwrap());

        let mut existing = Book::new("The Hobbit".into(), "J.R.R. Tolkien".into(), "/lib/existing.mp3".into(), "hash-v1".into());
        existing.id = "book-existing".to_string();
        existing.library_state = LibraryState::Organized;
        store.put_book(existing).await.unwrap();

        let source = import_dir.path().join("remaster.flac");
        fs::write(&source, b"different remaster bytes").unwrap();
        let hash = fileop::hash_file(&source).unwrap();
        let mut book = Book::new("The Hobbit".into(), "J.R.R. Tolkien".into(), source.to_string_lossy().to_string(), hash);
        book.id = "book-new".to_string();
        store.put_book(book).await.unwrap();

        let manager = OrganizeManager::new();
        let config = sample_config(library_root.path(), library_root.path());
        let outcome = manager
            .organize_book(&store, "book-new", "op-1", &config, DuplicatePolicy::Skip, false)
            .await
            .unwrap();

        assert!(matches!(outcome, OrganizeOutcome::Placed { .. }));
        let book = store.get_book("book-new").await.unwrap().unwrap();
        assert!(book.version_group_id.is_none());
    }
}
