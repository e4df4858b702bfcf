//! Relational backend (opt-in, safety-flagged per spec.md §4.1), following
//! the teacher's `sqlx`-over-SQLite convention in `db/models.rs`: TEXT ids,
//! one table per collection, `chrono::DateTime<Utc>` columns.

use super::StoreError;
use crate::models::{
    Author, BlockedHash, Book, LibraryState, MetadataFieldState, Operation, OperationStatus,
    OperationType, Series, Setting, SettingType,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

fn backend_err(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

pub struct RelationalStore {
    pool: SqlitePool,
}

impl RelationalStore {
    pub async fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("shelf.sqlite");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(backend_err)?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS books (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                author_name TEXT NOT NULL,
                series_name TEXT,
                series_position REAL,
                file_path TEXT NOT NULL UNIQUE,
                file_hash TEXT NOT NULL UNIQUE,
                original_file_hash TEXT NOT NULL,
                organized_file_hash TEXT,
                library_state TEXT NOT NULL,
                marked_for_deletion_at TEXT,
                version_group_id TEXT,
                is_primary_version INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_books_hash ON books(file_hash);
            CREATE INDEX IF NOT EXISTS idx_books_path ON books(file_path);

            CREATE TABLE IF NOT EXISTS authors (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                folded_name TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS series (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                folded_name TEXT NOT NULL UNIQUE,
                author_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                setting_type TEXT NOT NULL,
                is_secret INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS operations (
                id TEXT PRIMARY KEY,
                operation_type TEXT NOT NULL,
                status TEXT NOT NULL,
                progress INTEGER NOT NULL,
                total INTEGER NOT NULL,
                message TEXT,
                folder_path TEXT,
                error TEXT,
                log_lines TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS blocked_hashes (
                hash TEXT PRIMARY KEY,
                reason TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS metadata_fields (
                book_id TEXT NOT NULL,
                field TEXT NOT NULL,
                file_value TEXT,
                fetched_value TEXT,
                stored_value TEXT,
                override_value TEXT,
                override_locked INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (book_id, field)
            );
            "#,
        )
        .execute(pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }
}

fn parse_dt(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn library_state_from_str(s: &str) -> LibraryState {
    match s {
        "organized" => LibraryState::Organized,
        "deleted" => LibraryState::Deleted,
        _ => LibraryState::Import,
    }
}

fn row_to_book(row: &sqlx::sqlite::SqliteRow) -> Result<Book, StoreError> {
    Ok(Book {
        id: row.try_get("id").map_err(backend_err)?,
        title: row.try_get("title").map_err(backend_err)?,
        author_name: row.try_get("author_name").map_err(backend_err)?,
        series_name: row.try_get("series_name").map_err(backend_err)?,
        series_position: row.try_get("series_position").map_err(backend_err)?,
        file_path: row.try_get("file_path").map_err(backend_err)?,
        file_hash: row.try_get("file_hash").map_err(backend_err)?,
        original_file_hash: row.try_get("original_file_hash").map_err(backend_err)?,
        organized_file_hash: row.try_get("organized_file_hash").map_err(backend_err)?,
        library_state: library_state_from_str(&row.try_get::<String, _>("library_state").map_err(backend_err)?),
        marked_for_deletion_at: row
            .try_get::<Option<String>, _>("marked_for_deletion_at")
            .map_err(backend_err)?
            .map(|s| parse_dt(&s))
            .transpose()?,
        version_group_id: row.try_get("version_group_id").map_err(backend_err)?,
        is_primary_version: row.try_get::<i64, _>("is_primary_version").map_err(backend_err)? != 0,
        created_at: parse_dt(&row.try_get::<String, _>("created_at").map_err(backend_err)?)?,
        updated_at: parse_dt(&row.try_get::<String, _>("updated_at").map_err(backend_err)?)?,
    })
}

#[async_trait]
impl super::Store for RelationalStore {
    async fn put_book(&self, mut book: Book) -> Result<(), StoreError> {
        let previous = sqlx::query("SELECT updated_at FROM books WHERE id = ?")
            .bind(&book.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        if let Some(row) = previous {
            let prev_updated = parse_dt(&row.try_get::<String, _>("updated_at").map_err(backend_err)?)?;
            if book.updated_at <= prev_updated {
                book.updated_at = prev_updated + chrono::Duration::microseconds(1);
            }
        }

        sqlx::query(
            r#"
            INSERT INTO books (
                id, title, author_name, series_name, series_position, file_path, file_hash,
                original_file_hash, organized_file_hash, library_state, marked_for_deletion_at,
                version_group_id, is_primary_version, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                author_name = excluded.author_name,
                series_name = excluded.series_name,
                series_position = excluded.series_position,
                file_path = excluded.file_path,
                file_hash = excluded.file_hash,
                original_file_hash = excluded.original_file_hash,
                organized_file_hash = excluded.organized_file_hash,
                library_state = excluded.library_state,
                marked_for_deletion_at = excluded.marked_for_deletion_at,
                version_group_id = excluded.version_group_id,
                is_primary_version = excluded.is_primary_version,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&book.id)
        .bind(&book.title)
        .bind(&book.author_name)
        .bind(&book.series_name)
        .bind(book.series_position)
        .bind(&book.file_path)
        .bind(&book.file_hash)
        .bind(&book.original_file_hash)
        .bind(&book.organized_file_hash)
        .bind(book.library_state.as_str())
        .bind(book.marked_for_deletion_at.map(|d| d.to_rfc3339()))
        .bind(&book.version_group_id)
        .bind(book.is_primary_version as i64)
        .bind(book.created_at.to_rfc3339())
        .bind(book.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn get_book(&self, id: &str) -> Result<Option<Book>, StoreError> {
        let row = sqlx::query("SELECT * FROM books WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        row.as_ref().map(row_to_book).transpose()
    }

    async fn get_book_by_hash(&self, hash: &str) -> Result<Option<Book>, StoreError> {
        let row = sqlx::query("SELECT * FROM books WHERE file_hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        row.as_ref().map(row_to_book).transpose()
    }

    async fn get_book_by_path(&self, path: &str) -> Result<Option<Book>, StoreError> {
        let row = sqlx::query("SELECT * FROM books WHERE file_path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        row.as_ref().map(row_to_book).transpose()
    }

    async fn list_books(&self) -> Result<Vec<Book>, StoreError> {
        let rows = sqlx::query("SELECT * FROM books ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter().map(row_to_book).collect()
    }

    async fn delete_book(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM books WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn put_author(&self, author: Author) -> Result<(), StoreError> {
        let folded = Author::fold_key(&author.name);
        sqlx::query(
            r#"INSERT INTO authors (id, name, folded_name, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET name = excluded.name, folded_name = excluded.folded_name, updated_at = excluded.updated_at"#,
        )
        .bind(&author.id)
        .bind(&author.name)
        .bind(&folded)
        .bind(author.created_at.to_rfc3339())
        .bind(author.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn get_author_by_name(&self, folded_name: &str) -> Result<Option<Author>, StoreError> {
        let row = sqlx::query("SELECT * FROM authors WHERE folded_name = ?")
            .bind(folded_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        row.map(|r| {
            Ok(Author {
                id: r.try_get("id").map_err(backend_err)?,
                name: r.try_get("name").map_err(backend_err)?,
                created_at: parse_dt(&r.try_get::<String, _>("created_at").map_err(backend_err)?)?,
                updated_at: parse_dt(&r.try_get::<String, _>("updated_at").map_err(backend_err)?)?,
            })
        })
        .transpose()
    }

    async fn list_authors(&self) -> Result<Vec<Author>, StoreError> {
        let rows = sqlx::query("SELECT * FROM authors ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter()
            .map(|r| {
                Ok(Author {
                    id: r.try_get("id").map_err(backend_err)?,
                    name: r.try_get("name").map_err(backend_err)?,
                    created_at: parse_dt(&r.try_get::<String, _>("created_at").map_err(backend_err)?)?,
                    updated_at: parse_dt(&r.try_get::<String, _>("updated_at").map_err(backend_err)?)?,
                })
            })
            .collect()
    }

    async fn put_series(&self, series: Series) -> Result<(), StoreError> {
        let folded = Series::fold_key(&series.name);
        sqlx::query(
            r#"INSERT INTO series (id, name, folded_name, author_id, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET name = excluded.name, folded_name = excluded.folded_name,
                   author_id = excluded.author_id, updated_at = excluded.updated_at"#,
        )
        .bind(&series.id)
        .bind(&series.name)
        .bind(&folded)
        .bind(&series.author_id)
        .bind(series.created_at.to_rfc3339())
        .bind(series.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn get_series_by_name(&self, folded_name: &str) -> Result<Option<Series>, StoreError> {
        let row = sqlx::query("SELECT * FROM series WHERE folded_name = ?")
            .bind(folded_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        row.map(|r| {
            Ok(Series {
                id: r.try_get("id").map_err(backend_err)?,
                name: r.try_get("name").map_err(backend_err)?,
                author_id: r.try_get("author_id").map_err(backend_err)?,
                created_at: parse_dt(&r.try_get::<String, _>("created_at").map_err(backend_err)?)?,
                updated_at: parse_dt(&r.try_get::<String, _>("updated_at").map_err(backend_err)?)?,
            })
        })
        .transpose()
    }

    async fn list_series(&self) -> Result<Vec<Series>, StoreError> {
        let rows = sqlx::query("SELECT * FROM series ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter()
            .map(|r| {
                Ok(Series {
                    id: r.try_get("id").map_err(backend_err)?,
                    name: r.try_get("name").map_err(backend_err)?,
                    author_id: r.try_get("author_id").map_err(backend_err)?,
                    created_at: parse_dt(&r.try_get::<String, _>("created_at").map_err(backend_err)?)?,
                    updated_at: parse_dt(&r.try_get::<String, _>("updated_at").map_err(backend_err)?)?,
                })
            })
            .collect()
    }

    async fn put_setting(&self, setting: Setting) -> Result<(), StoreError> {
        let type_str = match setting.setting_type {
            SettingType::String => "string",
            SettingType::Bool => "bool",
            SettingType::Int => "int",
            SettingType::Json => "json",
        };
        sqlx::query(
            r#"INSERT INTO settings (key, value, setting_type, is_secret, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(key) DO UPDATE SET value = excluded.value, setting_type = excluded.setting_type,
                   is_secret = excluded.is_secret, updated_at = excluded.updated_at"#,
        )
        .bind(&setting.key)
        .bind(&setting.value)
        .bind(type_str)
        .bind(setting.is_secret as i64)
        .bind(setting.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<Setting>, StoreError> {
        let row = sqlx::query("SELECT * FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        row.map(row_to_setting).transpose()
    }

    async fn list_settings(&self) -> Result<Vec<Setting>, StoreError> {
        let rows = sqlx::query("SELECT * FROM settings")
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.into_iter().map(row_to_setting).collect()
    }

    async fn put_operation(&self, operation: Operation) -> Result<(), StoreError> {
        let log_lines = serde_json::to_string(&operation.log_lines)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"INSERT INTO operations (
                id, operation_type, status, progress, total, message, folder_path, error,
                log_lines, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status, progress = excluded.progress, total = excluded.total,
                message = excluded.message, error = excluded.error, log_lines = excluded.log_lines,
                updated_at = excluded.updated_at"#,
        )
        .bind(&operation.id)
        .bind(format!("{:?}", operation.operation_type).to_lowercase())
        .bind(format!("{:?}", operation.status).to_lowercase())
        .bind(operation.progress as i64)
        .bind(operation.total as i64)
        .bind(&operation.message)
        .bind(&operation.folder_path)
        .bind(&operation.error)
        .bind(log_lines)
        .bind(operation.created_at.to_rfc3339())
        .bind(operation.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn get_operation(&self, id: &str) -> Result<Option<Operation>, StoreError> {
        let row = sqlx::query("SELECT * FROM operations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        row.map(row_to_operation).transpose()
    }

    async fn list_operations(&self) -> Result<Vec<Operation>, StoreError> {
        let rows = sqlx::query("SELECT * FROM operations ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.into_iter().map(row_to_operation).collect()
    }

    async fn delete_operation(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM operations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn block_hash(&self, blocked: BlockedHash) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO blocked_hashes (hash, reason, created_at) VALUES (?, ?, ?)
               ON CONFLICT(hash) DO UPDATE SET reason = excluded.reason"#,
        )
        .bind(&blocked.hash)
        .bind(&blocked.reason)
        .bind(blocked.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn is_hash_blocked(&self, hash: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 as present FROM blocked_hashes WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(row.is_some())
    }

    async fn unblock_hash(&self, hash: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM blocked_hashes WHERE hash = ?")
            .bind(hash)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn list_blocked_hashes(&self) -> Result<Vec<BlockedHash>, StoreError> {
        let rows = sqlx::query("SELECT * FROM blocked_hashes ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.into_iter()
            .map(|r| {
                Ok(BlockedHash {
                    hash: r.try_get("hash").map_err(backend_err)?,
                    reason: r.try_get("reason").map_err(backend_err)?,
                    created_at: parse_dt(&r.try_get::<String, _>("created_at").map_err(backend_err)?)?,
                })
            })
            .collect()
    }

    async fn put_metadata_field(&self, state: MetadataFieldState) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO metadata_fields (
                book_id, field, file_value, fetched_value, stored_value, override_value,
                override_locked, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(book_id, field) DO UPDATE SET
                file_value = excluded.file_value,
                fetched_value = excluded.fetched_value,
                stored_value = excluded.stored_value,
                override_value = excluded.override_value,
                override_locked = excluded.override_locked,
                updated_at = excluded.updated_at"#,
        )
        .bind(&state.book_id)
        .bind(&state.field)
        .bind(&state.file_value)
        .bind(&state.fetched_value)
        .bind(&state.stored_value)
        .bind(&state.override_value)
        .bind(state.override_locked as i64)
        .bind(state.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn get_metadata_field(
        &self,
        book_id: &str,
        field: &str,
    ) -> Result<Option<MetadataFieldState>, StoreError> {
        let row = sqlx::query("SELECT * FROM metadata_fields WHERE book_id = ? AND field = ?")
            .bind(book_id)
            .bind(field)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        row.map(row_to_metadata_field).transpose()
    }

    async fn list_metadata_fields(
        &self,
        book_id: &str,
    ) -> Result<Vec<MetadataFieldState>, StoreError> {
        let rows = sqlx::query("SELECT * FROM metadata_fields WHERE book_id = ?")
            .bind(book_id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.into_iter().map(row_to_metadata_field).collect()
    }
}

fn row_to_metadata_field(row: sqlx::sqlite::SqliteRow) -> Result<MetadataFieldState, StoreError> {
    Ok(MetadataFieldState {
        book_id: row.try_get("book_id").map_err(backend_err)?,
        field: row.try_get("field").map_err(backend_err)?,
        file_value: row.try_get("file_value").map_err(backend_err)?,
        fetched_value: row.try_get("fetched_value").map_err(backend_err)?,
        stored_value: row.try_get("stored_value").map_err(backend_err)?,
        override_value: row.try_get("override_value").map_err(backend_err)?,
        override_locked: row.try_get::<i64, _>("override_locked").map_err(backend_err)? != 0,
        updated_at: parse_dt(&row.try_get::<String, _>("updated_at").map_err(backend_err)?)?,
    })
}

fn row_to_setting(row: sqlx::sqlite::SqliteRow) -> Result<Setting, StoreError> {
    let type_str: String = row.try_get("setting_type").map_err(backend_err)?;
    let setting_type = match type_str.as_str() {
        "bool" => SettingType::Bool,
        "int" => SettingType::Int,
        "json" => SettingType::Json,
        _ => SettingType::String,
    };
    Ok(Setting {
        key: row.try_get("key").map_err(backend_err)?,
        value: row.try_get("value").map_err(backend_err)?,
        setting_type,
        is_secret: row.try_get::<i64, _>("is_secret").map_err(backend_err)? != 0,
        updated_at: parse_dt(&row.try_get::<String, _>("updated_at").map_err(backend_err)?)?,
    })
}

fn row_to_operation(row: sqlx::sqlite::SqliteRow) -> Result<Operation, StoreError> {
    let op_type: String = row.try_get("operation_type").map_err(backend_err)?;
    let status: String = row.try_get("status").map_err(backend_err)?;
    let log_lines_raw: String = row.try_get("log_lines").map_err(backend_err)?;
    Ok(Operation {
        id: row.try_get("id").map_err(backend_err)?,
        operation_type: operation_type_from_str(&op_type),
        status: operation_status_from_str(&status),
        progress: row.try_get::<i64, _>("progress").map_err(backend_err)? as u64,
        total: row.try_get::<i64, _>("total").map_err(backend_err)? as u64,
        message: row.try_get("message").map_err(backend_err)?,
        folder_path: row.try_get("folder_path").map_err(backend_err)?,
        error: row.try_get("error").map_err(backend_err)?,
        log_lines: serde_json::from_str(&log_lines_raw)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        created_at: parse_dt(&row.try_get::<String, _>("created_at").map_err(backend_err)?)?,
        updated_at: parse_dt(&row.try_get::<String, _>("updated_at").map_err(backend_err)?)?,
    })
}

fn operation_type_from_str(s: &str) -> OperationType {
    match s {
        "organize" => OperationType::Organize,
        "fetchmetadata" | "fetch-metadata" => OperationType::FetchMetadata,
        "itunesimport" | "itunes-import" => OperationType::ItunesImport,
        "ituneswriteback" | "itunes-write-back" => OperationType::ItunesWriteBack,
        "backup" => OperationType::Backup,
        "restore" => OperationType::Restore,
        "purge" => OperationType::Purge,
        _ => OperationType::Scan,
    }
}

fn operation_status_from_str(s: &str) -> OperationStatus {
    match s {
        "running" => OperationStatus::Running,
        "completed" => OperationStatus::Completed,
        "failed" => OperationStatus::Failed,
        "cancelled" => OperationStatus::Cancelled,
        _ => OperationStatus::Pending,
    }
}

impl FromStr for SettingType {
    type Err = StoreError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "bool" => SettingType::Bool,
            "int" => SettingType::Int,
            "json" => SettingType::Json,
            _ => SettingType::String,
        })
    }
}
