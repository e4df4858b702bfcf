//! The scan half of the scan/organize pipeline (spec.md §4.5 "Scan").
//! Walks configured import roots, hashes candidate files with bounded
//! concurrency, and reconciles them against existing Books. Progress
//! dispatch follows the teacher's `import/service.rs` pattern of driving a
//! `futures::stream::StreamExt` pipeline rather than hand-rolled task
//! bookkeeping.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use regex::Regex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{Event, EventBus};
use crate::fileop::{self, FileOpError};
use crate::models::Book;
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("invalid exclude pattern {0:?}: {1}")]
    InvalidPattern(String, regex::Error),
}

/// Configuration for one scan pass (spec.md §4.5 "Scan").
pub struct ScanConfig {
    pub import_roots: Vec<PathBuf>,
    pub supported_extensions: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub exclusion_marker_name: String,
    pub concurrent_scans: u32,
}

/// Running counters reported as `scan.progress` events (spec.md §4.5:
/// "Produce progress events `{scanned, matched, new, errors}` at bounded
/// intervals").
#[derive(Debug, Default, Clone, Copy)]
pub struct ScanSummary {
    pub scanned: u64,
    pub matched: u64,
    pub new: u64,
    pub errors: u64,
}

struct Counters {
    scanned: AtomicU64,
    matched: AtomicU64,
    new: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ScanSummary {
        ScanSummary {
            scanned: self.scanned.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            new: self.new.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Recursively lists candidate files under `root`, skipping any directory
/// that contains the zero-byte exclusion marker sentinel (spec.md §4.5:
/// "the per-folder `excluded` marker (a zero-byte sentinel file written by
/// the UI)") and any path matched by an exclude pattern, keeping only
/// files whose extension is in the supported whitelist.
fn walk_candidates(
    root: &Path,
    supported_extensions: &[String],
    exclude_patterns: &[Regex],
    exclusion_marker_name: &str,
) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        if dir.join(exclusion_marker_name).is_file() {
            continue;
        }
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "failed to read directory during scan");
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let path_str = path.to_string_lossy();
            if exclude_patterns.iter().any(|re| re.is_match(&path_str)) {
                continue;
            }
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(_) => continue,
            };
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_lowercase();
                if supported_extensions.iter().any(|allowed| allowed.to_lowercase() == ext) {
                    out.push(path);
                }
            }
        }
    }
    Ok(out)
}

/// Runs one scan pass over every configured import root, reporting
/// progress via `events` as files complete and finalising with a full
/// [`ScanSummary`] (spec.md §4.5 "Scan"). Observes `cancellation` at file
/// boundaries: in-flight hashing for a file always runs to completion, no
/// new file starts once cancellation is observed (spec.md §4.5
/// "Cancellation").
pub async fn run_scan(
    store: Arc<dyn Store>,
    events: &EventBus,
    operation_id: &str,
    cancellation: CancellationToken,
    config: &ScanConfig,
) -> Result<ScanSummary, ScanError> {
    let exclude_patterns: Vec<Regex> = config
        .exclude_patterns
        .iter()
        .map(|p| Regex::new(p).map_err(|e| ScanError::InvalidPattern(p.clone(), e)))
        .collect::<Result<_, _>>()?;

    let mut candidates = Vec::new();
    for root in &config.import_roots {
        match walk_candidates(root, &config.supported_extensions, &exclude_patterns, &config.exclusion_marker_name) {
            Ok(mut found) => candidates.append(&mut found),
            Err(e) => warn!(root = %root.display(), error = %e, "failed to walk import root"),
        }
    }

    let concurrency = config.concurrent_scans.max(1).min(num_cpus::get() as u32) as usize;
    let counters = Arc::new(Counters {
        scanned: AtomicU64::new(0),
        matched: AtomicU64::new(0),
        new: AtomicU64::new(0),
        errors: AtomicU64::new(0),
    });
    let total = candidates.len() as u64;

    let results = stream::iter(candidates.into_iter())
        .map(|path| {
            let store = store.clone();
            let counters = counters.clone();
            let cancellation = cancellation.clone();
            async move {
                if cancellation.is_cancelled() {
                    return;
                }
                match reconcile_one(&store, &path).await {
                    Ok(matched) => {
                        counters.scanned.fetch_add(1, Ordering::Relaxed);
                        if matched {
                            counters.matched.fetch_add(1, Ordering::Relaxed);
                        } else {
                            counters.new.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(e) => {
                        counters.scanned.fetch_add(1, Ordering::Relaxed);
                        counters.errors.fetch_add(1, Ordering::Relaxed);
                        warn!(path = %path.display(), error = %e, "failed to reconcile scanned file");
                    }
                }
            }
        })
        .buffer_unordered(concurrency);

    tokio::pin!(results);
    let mut processed = 0u64;
    while results.next().await.is_some() {
        processed += 1;
        if processed % 25 == 0 || processed == total {
            let snapshot = counters.snapshot();
            events.publish(Event::ScanProgress {
                operation_id: operation_id.to_string(),
                scanned: snapshot.scanned,
                matched: snapshot.matched,
                new: snapshot.new,
                errors: snapshot.errors,
            });
        }
    }

    let summary = counters.snapshot();
    debug!(?summary, "scan pass complete");
    Ok(summary)
}

/// Hashes `path` and either updates the matching Book (by hash or path) or
/// creates a new one in `import` state (spec.md §4.5 "Scan"). Returns
/// `true` if an existing Book was matched, `false` if a new one was
/// created.
async fn reconcile_one(store: &Arc<dyn Store>, path: &Path) -> Result<bool, ScanOneError> {
    let hash = fileop::hash_file(path)?;
    let path_str = path.to_string_lossy().to_string();

    if let Some(mut book) = store.get_book_by_hash(&hash).await? {
        if book.file_path != path_str {
            book.file_path = path_str;
            book.updated_at = chrono::Utc::now();
            store.put_book(book).await?;
        }
        return Ok(true);
    }

    if let Some(mut book) = store.get_book_by_path(&path_str).await? {
        if book.file_hash != hash {
            book.file_hash = hash;
            book.updated_at = chrono::Utc::now();
            store.put_book(book).await?;
        }
        return Ok(true);
    }

    let guessed_title = path.file_stem().and_then(|s| s.to_str()).unwrap_or("Unknown").to_string();
    let book = Book::new(guessed_title, "Unknown".to_string(), path_str, hash);
    store.put_book(book).await?;
    Ok(false)
}

#[derive(Debug, Error)]
enum ScanOneError {
    #[error(transparent)]
    FileOp(#[from] FileOpError),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl std::fmt::Display for ScanOneError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanOneError::FileOp(e) => write!(f, "{e}"),
            ScanOneError::Storage(e) => write!(f, "{e}"),
        }
    }
}
