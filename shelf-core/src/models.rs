//! Core entities (spec.md §3): Book, Author, Series, MetadataFieldState,
//! Setting, Operation, BlockedHash. Follows the teacher's `db/models.rs`
//! convention: string UUID ids, `chrono::DateTime<Utc>` timestamps, and
//! `serde` derives on everything that is persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LibraryState {
    Import,
    Organized,
    Deleted,
}

impl LibraryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LibraryState::Import => "import",
            LibraryState::Organized => "organized",
            LibraryState::Deleted => "deleted",
        }
    }
}

/// The logical audiobook (spec.md §3 "Book"). Owned by the file-op engine,
/// the scan/organize pipeline, and the metadata provenance engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    pub id: String,
    pub title: String,
    pub author_name: String,
    pub series_name: Option<String>,
    pub series_position: Option<f64>,
    pub file_path: String,
    /// Hash of the current bytes at `file_path`.
    pub file_hash: String,
    /// Hash recorded at first import; never changes afterwards.
    pub original_file_hash: String,
    /// Hash recorded after the last successful organize.
    pub organized_file_hash: Option<String>,
    pub library_state: LibraryState,
    pub marked_for_deletion_at: Option<DateTime<Utc>>,
    pub version_group_id: Option<String>,
    pub is_primary_version: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Book {
    pub fn new(title: String, author_name: String, file_path: String, file_hash: String) -> Self {
        let now = Utc::now();
        Book {
            id: new_id(),
            title,
            author_name,
            series_name: None,
            series_position: None,
            file_path,
            original_file_hash: file_hash.clone(),
            file_hash,
            organized_file_hash: None,
            library_state: LibraryState::Import,
            marked_for_deletion_at: None,
            version_group_id: None,
            is_primary_version: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// The case-folded, trimmed key used for version-group eligibility
    /// (spec.md §4.5 "Version grouping").
    pub fn version_key(&self) -> String {
        format!(
            "{}::{}",
            self.title.trim().to_lowercase(),
            self.author_name.trim().to_lowercase()
        )
    }
}

/// Deduplicated by case-folded name (spec.md §3 "Author, Series").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Author {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Author {
    pub fn fold_key(name: &str) -> String {
        name.trim().to_lowercase()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Series {
    pub id: String,
    pub name: String,
    pub author_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Series {
    pub fn fold_key(name: &str) -> String {
        name.trim().to_lowercase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingType {
    String,
    Bool,
    Int,
    Json,
}

/// A typed key/value configuration row (spec.md §3 "Setting"). Owned by the
/// settings layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub value: String,
    pub setting_type: SettingType,
    pub is_secret: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationType {
    Scan,
    Organize,
    FetchMetadata,
    ItunesImport,
    ItunesWriteBack,
    Backup,
    Restore,
    Purge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// A structured operation log line (SPEC_FULL.md §11: richer than a bare
/// string so a future UI can color-code severity).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationLogLine {
    pub level: LogLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// A named long-running operation (spec.md §3 "Operation", §4.7). Owned by
/// the operation manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub operation_type: OperationType,
    pub status: OperationStatus,
    pub progress: u64,
    pub total: u64,
    pub message: Option<String>,
    pub folder_path: Option<String>,
    pub error: Option<String>,
    pub log_lines: Vec<OperationLogLine>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    pub fn new(operation_type: OperationType, folder_path: Option<String>) -> Self {
        let now = Utc::now();
        Operation {
            id: new_id(),
            operation_type,
            status: OperationStatus::Pending,
            progress: 0,
            total: 0,
            message: None,
            folder_path,
            error: None,
            log_lines: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A content hash the user has forbidden from ever being re-imported
/// (spec.md §3 "BlockedHash"). Owned by the file-op engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedHash {
    pub hash: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Which of the four provenance slots supplied a field's effective value
/// (spec.md §4.6). Mirrors `effective_source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvenanceSource {
    File,
    Fetched,
    Stored,
    Override,
}

impl ProvenanceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvenanceSource::File => "file",
            ProvenanceSource::Fetched => "fetched",
            ProvenanceSource::Stored => "stored",
            ProvenanceSource::Override => "override",
        }
    }
}

/// The four-slot provenance record for a single (BookID, field) pair
/// (spec.md §3 "MetadataFieldState", §4.6). Each slot is `Option<String>`
/// rather than a sentinel (SPEC_FULL.md §9 "Provenance as tagged values"):
/// absence and presence-with-empty-string are distinct. Owned by the
/// metadata provenance engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataFieldState {
    pub book_id: String,
    pub field: String,
    pub file_value: Option<String>,
    pub fetched_value: Option<String>,
    pub stored_value: Option<String>,
    pub override_value: Option<String>,
    pub override_locked: bool,
    pub updated_at: DateTime<Utc>,
}

impl MetadataFieldState {
    pub fn new(book_id: String, field: String) -> Self {
        MetadataFieldState {
            book_id,
            field,
            file_value: None,
            fetched_value: None,
            stored_value: None,
            override_value: None,
            override_locked: false,
            updated_at: Utc::now(),
        }
    }

    /// The composite key used by the Store (`{book_id}::{field}`).
    pub fn key(book_id: &str, field: &str) -> String {
        format!("{book_id}::{field}")
    }

    /// Resolves the effective value per the fixed hierarchy
    /// `override > stored > fetched > file`, skipping absent slots
    /// (spec.md §4.6). Returns `(value, source)`, or `(None, None)` when
    /// every slot is empty.
    pub fn effective(&self) -> (Option<&str>, Option<ProvenanceSource>) {
        if let Some(v) = self.override_value.as_deref() {
            return (Some(v), Some(ProvenanceSource::Override));
        }
        if let Some(v) = self.stored_value.as_deref() {
            return (Some(v), Some(ProvenanceSource::Stored));
        }
        if let Some(v) = self.fetched_value.as_deref() {
            return (Some(v), Some(ProvenanceSource::Fetched));
        }
        if let Some(v) = self.file_value.as_deref() {
            return (Some(v), Some(ProvenanceSource::File));
        }
        (None, None)
    }
}
