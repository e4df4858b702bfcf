//! The metadata provenance engine (spec.md §4.6). Tracks four value slots
//! per (book, field) pair and resolves an effective value by the fixed
//! hierarchy `override > stored > fetched > file`, grounded on the
//! teacher's layered metadata-source handling in
//! `bae-core/src/metadata_replicator.rs`.

use crate::models::{MetadataFieldState, ProvenanceSource};
use crate::store::{Store, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum ProvenanceError {
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

/// One field's full provenance view, returned by `get` (spec.md §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldView {
    pub file: Option<String>,
    pub fetched: Option<String>,
    pub stored: Option<String>,
    #[serde(rename = "override")]
    pub override_value: Option<String>,
    pub override_locked: bool,
    pub effective_value: Option<String>,
    pub effective_source: String,
}

impl From<&MetadataFieldState> for FieldView {
    fn from(state: &MetadataFieldState) -> Self {
        let (value, source) = state.effective();
        FieldView {
            file: state.file_value.clone(),
            fetched: state.fetched_value.clone(),
            stored: state.stored_value.clone(),
            override_value: state.override_value.clone(),
            override_locked: state.override_locked,
            effective_value: value.map(str::to_string),
            effective_source: source.map(|s| s.as_str().to_string()).unwrap_or_default(),
        }
    }
}

/// A single external-source fetch result, keyed by field name
/// (SPEC_FULL.md §4.6, grounded on `musicbrainz_parser.rs`'s fetch-result
/// shape).
pub type FetchedFields = HashMap<String, String>;

/// The metadata provenance engine (spec.md §4.6). Owns per-book
/// serialisation of bulk refreshes: while `refresh_from_api` runs for a
/// book, no other mutation of that book's provenance may commit (spec.md
/// §4.6 "Concurrency contract").
pub struct ProvenanceEngine {
    store: Arc<dyn Store>,
    book_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProvenanceEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        ProvenanceEngine {
            store,
            book_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, book_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.book_locks.lock().await;
        locks
            .entry(book_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load(&self, book_id: &str, field: &str) -> Result<MetadataFieldState, ProvenanceError> {
        Ok(self
            .store
            .get_metadata_field(book_id, field)
            .await?
            .unwrap_or_else(|| MetadataFieldState::new(book_id.to_string(), field.to_string())))
    }

    /// `Get(bookID)`: every tracked field's full provenance view.
    pub async fn get(&self, book_id: &str) -> Result<HashMap<String, FieldView>, ProvenanceError> {
        let states = self.store.list_metadata_fields(book_id).await?;
        Ok(states.iter().map(|s| (s.field.clone(), FieldView::from(s))).collect())
    }

    /// `ApplyOverride(bookID, field, value, locked?)`.
    pub async fn apply_override(
        &self,
        book_id: &str,
        field: &str,
        value: String,
        locked: bool,
    ) -> Result<FieldView, ProvenanceError> {
        let guard = self.lock_for(book_id).await;
        let _held = guard.lock().await;
        let mut state = self.load(book_id, field).await?;
        state.override_value = Some(value);
        state.override_locked = locked;
        state.updated_at = chrono::Utc::now();
        self.store.put_metadata_field(state.clone()).await?;
        Ok(FieldView::from(&state))
    }

    /// `ClearOverride(bookID, field)`.
    pub async fn clear_override(&self, book_id: &str, field: &str) -> Result<FieldView, ProvenanceError> {
        let guard = self.lock_for(book_id).await;
        let _held = guard.lock().await;
        let mut state = self.load(book_id, field).await?;
        state.override_value = None;
        state.override_locked = false;
        state.updated_at = chrono::Utc::now();
        self.store.put_metadata_field(state.clone()).await?;
        Ok(FieldView::from(&state))
    }

    /// `Unlock(bookID, field)`: clears `override_locked` without clearing
    /// the value.
    pub async fn unlock(&self, book_id: &str, field: &str) -> Result<FieldView, ProvenanceError> {
        let guard = self.lock_for(book_id).await;
        let _held = guard.lock().await;
        let mut state = self.load(book_id, field).await?;
        state.override_locked = false;
        state.updated_at = chrono::Utc::now();
        self.store.put_metadata_field(state.clone()).await?;
        Ok(FieldView::from(&state))
    }

    /// `RefreshFromAPI(bookID, source)`: updates `fetched_value` for every
    /// field the source returned. Fields with `override_locked = true`
    /// retain their effective value (the override); other fields recompute.
    /// Serialised per-book so readers never see a partial merge (spec.md
    /// §4.6 "Concurrency contract").
    pub async fn refresh_from_api(
        &self,
        book_id: &str,
        fields: FetchedFields,
    ) -> Result<HashMap<String, FieldView>, ProvenanceError> {
        let guard = self.lock_for(book_id).await;
        let _held = guard.lock().await;

        let mut out = HashMap::new();
        for (field, value) in fields {
            let mut state = self.load(book_id, &field).await?;
            state.fetched_value = Some(value);
            state.updated_at = chrono::Utc::now();
            self.store.put_metadata_field(state.clone()).await?;
            out.insert(field, FieldView::from(&state));
        }
        Ok(out)
    }

    /// `CommitStored(bookID, field, value)`: writes the baseline used after
    /// a successful organize with write-back metadata enabled.
    pub async fn commit_stored(
        &self,
        book_id: &str,
        field: &str,
        value: String,
    ) -> Result<FieldView, ProvenanceError> {
        let guard = self.lock_for(book_id).await;
        let _held = guard.lock().await;
        let mut state = self.load(book_id, field).await?;
        state.stored_value = Some(value);
        state.updated_at = chrono::Utc::now();
        self.store.put_metadata_field(state.clone()).await?;
        Ok(FieldView::from(&state))
    }

    /// Records the raw tag value read off the file itself. Distinct from
    /// the other setters because it is the lowest-priority slot and is
    /// normally only ever written once, at first scan.
    pub async fn set_file_value(
        &self,
        book_id: &str,
        field: &str,
        value: String,
    ) -> Result<FieldView, ProvenanceError> {
        let guard = self.lock_for(book_id).await;
        let _held = guard.lock().await;
        let mut state = self.load(book_id, field).await?;
        state.file_value = Some(value);
        state.updated_at = chrono::Utc::now();
        self.store.put_metadata_field(state.clone()).await?;
        Ok(FieldView::from(&state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LsmStore;

    async fn engine() -> ProvenanceEngine {
        let dir = tempfile::tempdir().unwrap();
        ProvenanceEngine::new(Arc::new(LsmStore::open(dir.keep().as_path()).unwrap()))
    }

    #[tokio::test]
    async fn override_wins_over_every_other_slot() {
        // Scenario 1 from spec.md §8.
        let engine = engine().await;
        let book_id = "book-1";
        engine
            .set_file_value(book_id, "title", "C".to_string())
            .await
            .unwrap();
        let mut state = engine.load(book_id, "title").await.unwrap();
        state.fetched_value = Some("B".to_string());
        state.stored_value = Some("A".to_string());
        engine.store.put_metadata_field(state).await.unwrap();

        let view = engine
            .apply_override(book_id, "title", "D".to_string(), false)
            .await
            .unwrap();
        assert_eq!(view.effective_value.as_deref(), Some("D"));
        assert_eq!(view.effective_source, "override");
    }

    #[tokio::test]
    async fn locked_override_survives_refresh_from_api() {
        // Scenario 1, second half: RefreshFromAPI updates fetched but the
        // locked override keeps winning.
        let engine = engine().await;
        let book_id = "book-1";
        engine
            .apply_override(book_id, "title", "D".to_string(), true)
            .await
            .unwrap();

        let mut fetched = FetchedFields::new();
        fetched.insert("title".to_string(), "E".to_string());
        engine.refresh_from_api(book_id, fetched).await.unwrap();

        let view = engine.get(book_id).await.unwrap();
        let title = &view["title"];
        assert_eq!(title.fetched.as_deref(), Some("E"));
        assert_eq!(title.effective_value.as_deref(), Some("D"));
        assert_eq!(title.effective_source, "override");
    }

    #[tokio::test]
    async fn clear_override_falls_back_to_stored() {
        let engine = engine().await;
        let book_id = "book-2";
        engine
            .commit_stored(book_id, "author", "Stored Author".to_string())
            .await
            .unwrap();
        engine
            .apply_override(book_id, "author", "Override Author".to_string(), false)
            .await
            .unwrap();
        let view = engine.clear_override(book_id, "author").await.unwrap();
        assert_eq!(view.effective_value.as_deref(), Some("Stored Author"));
        assert_eq!(view.effective_source, "stored");
    }

    #[tokio::test]
    async fn unlock_keeps_value_but_allows_future_overwrite() {
        let engine = engine().await;
        let book_id = "book-3";
        let view = engine
            .apply_override(book_id, "genre", "Fantasy".to_string(), true)
            .await
            .unwrap();
        assert!(view.override_locked);
        let view = engine.unlock(book_id, "genre").await.unwrap();
        assert!(!view.override_locked);
        assert_eq!(view.override_value.as_deref(), Some("Fantasy"));
    }

    #[tokio::test]
    async fn empty_state_has_no_effective_value() {
        let engine = engine().await;
        let view = engine.get("nonexistent-book").await.unwrap();
        assert!(view.is_empty());
    }
}
