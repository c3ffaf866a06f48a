//! Reconcile a registry with a directory of images.
//!
//! A pass enumerates the source, embeds new or moved files *before* taking
//! the registry lock, then takes the lock once, lists the source again and
//! drops records whose file is gone in that listing, inserts the fresh
//! records and flushes. Unchanged files (same key and same source path) are
//! never re-embedded, and a file that fails to embed never causes its
//! existing record to be removed. Name hints also rename the subject of
//! records already enrolled.

use crate::cache::RegistryCache;
use crate::engine::EngineHandle;
use crate::error::{RegistryError, Result};
use facereg_core::{resolve_with_hints, EnrollmentRecord, FaceError, NameHint, Registry};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// File extensions treated as images, compared case-insensitively.
pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

/// One eligible file found under a source directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    /// Path relative to the source root, `/`-separated.
    pub key: String,
    pub path: PathBuf,
    pub subject: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub added: usize,
    pub removed: usize,
    pub total: usize,
    /// Existing keys re-embedded because their file moved, or renamed by a hint.
    #[serde(skip_serializing_if = "is_zero")]
    pub updated: usize,
    /// Files that produced no record (no face, unreadable, extractor error).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Recursively list image files under `root` in a stable order.
pub fn scan_source(root: &Path, hints: &[NameHint]) -> Result<Vec<SourceImage>> {
    let root = match root.canonicalize() {
        Ok(root) if root.is_dir() => root,
        _ => return Err(FaceError::SourceNotFound(root.display().to_string()).into()),
    };

    let mut images = Vec::new();
    for entry in WalkDir::new(&root).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() || !is_image_file(entry.path()) {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(&root) else {
            continue;
        };
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let subject = resolve_with_hints(&key, hints);
        images.push(SourceImage {
            key,
            path: entry.path().to_path_buf(),
            subject,
        });
    }
    Ok(images)
}

/// Read a file and embed it on the engine thread, abandoning on cancel.
pub(crate) async fn embed_file(
    engine: &EngineHandle,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<facereg_core::Embedding>> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            FaceError::SourceNotFound(path.display().to_string()).into()
        } else {
            RegistryError::io(path, e)
        }
    })?;
    tokio::select! {
        _ = cancel.cancelled() => Err(RegistryError::Cancelled),
        faces = engine.extract(bytes) => faces,
    }
}

async fn list_source(source: &Path, hints: &[NameHint]) -> Result<Vec<SourceImage>> {
    let source = source.to_path_buf();
    let hints = hints.to_vec();
    tokio::task::spawn_blocking(move || scan_source(&source, &hints)).await?
}

/// Run one sync pass of registry `name` against `source`.
pub async fn sync_registry(
    cache: &RegistryCache,
    engine: &EngineHandle,
    name: &str,
    source: &Path,
    hints: &[NameHint],
    cancel: &CancellationToken,
) -> Result<SyncReport> {
    let expected = list_source(source, hints).await?;

    let snapshot: HashMap<String, PathBuf> = {
        let guard = cache.lock(name).await?;
        guard
            .records()
            .map(|r| (r.image_key.clone(), r.source_path.clone()))
            .collect()
    };

    let mut fresh = Vec::new();
    let mut report = SyncReport::default();

    for image in &expected {
        if snapshot.get(&image.key) == Some(&image.path) {
            continue;
        }
        if cancel.is_cancelled() {
            return Err(RegistryError::Cancelled);
        }

        let outcome = embed_file(engine, &image.path, cancel).await.and_then(|faces| {
            EnrollmentRecord::new(&image.key, &image.subject, &image.path, faces).map_err(Into::into)
        });
        match outcome {
            Ok(record) => fresh.push(record),
            Err(e @ (RegistryError::Cancelled | RegistryError::WorkerClosed)) => return Err(e),
            Err(e) if e.is_no_face() => {
                tracing::warn!(registry = name, key = %image.key, "no face detected; skipping");
                report.skipped.push(image.key.clone());
            }
            Err(e) => {
                tracing::warn!(registry = name, key = %image.key, error = %e, "failed to embed; skipping");
                report.skipped.push(image.key.clone());
            }
        }
    }

    let mut guard = cache.lock(name).await?;
    if cancel.is_cancelled() {
        return Err(RegistryError::Cancelled);
    }

    // Enrolls that finished while we were embedding wrote their files first,
    // so only a listing taken under the lock sees them.
    let listing = list_source(source, hints).await?;
    let current: HashMap<&str, &SourceImage> = listing.iter().map(|i| (i.key.as_str(), i)).collect();

    let removals: Vec<String> = guard
        .keys()
        .filter(|k| !current.contains_key(k))
        .map(str::to_string)
        .collect();

    // Keep only files still in place that no concurrent enroll has stored.
    fresh.retain(|r| {
        current
            .get(r.image_key.as_str())
            .is_some_and(|image| image.path == r.source_path)
            && guard
                .get(&r.image_key)
                .map_or(true, |existing| existing.source_path != r.source_path)
    });

    let dim = engine.dim().or_else(|| {
        guard
            .records()
            .filter(|r| current.contains_key(r.image_key.as_str()))
            .find_map(|r| r.dim())
            .or_else(|| fresh.first().and_then(|r| r.dim()))
    });
    fresh.retain(|r| {
        let ok = r.dim() == dim;
        if !ok {
            tracing::warn!(
                registry = name,
                key = %r.image_key,
                expected = ?dim,
                found = ?r.dim(),
                "embedding dimension mismatch; skipping"
            );
            report.skipped.push(r.image_key.clone());
        }
        ok
    });

    let relabeled = relabel_hinted(&guard, &listing, hints, &fresh);
    for record in &relabeled {
        tracing::debug!(registry = name, key = %record.image_key, subject = %record.subject_name, "subject renamed by hint");
    }
    fresh.extend(relabeled);

    let inserting = fresh.len();
    let applied = cache.store().apply(&mut guard, &removals, fresh).await?;

    report.added = applied.added;
    report.updated = inserting - applied.added;
    report.removed = applied.removed;
    report.total = guard.len();

    tracing::info!(
        registry = name,
        source = %source.display(),
        added = report.added,
        updated = report.updated,
        removed = report.removed,
        skipped = report.skipped.len(),
        total = report.total,
        "sync complete"
    );
    Ok(report)
}

/// Existing records of unchanged files whose hinted subject differs from
/// the stored one, with the subject rewritten. Embeddings are reused.
fn relabel_hinted(
    registry: &Registry,
    listing: &[SourceImage],
    hints: &[NameHint],
    fresh: &[EnrollmentRecord],
) -> Vec<EnrollmentRecord> {
    if hints.is_empty() {
        return Vec::new();
    }
    let pending: HashSet<&str> = fresh.iter().map(|r| r.image_key.as_str()).collect();
    listing
        .iter()
        .filter(|image| !pending.contains(image.key.as_str()))
        .filter(|image| hints.iter().any(|h| h.matches(&image.key)))
        .filter_map(|image| {
            let record = registry.get(&image.key)?;
            (record.source_path == image.path && record.subject_name != image.subject).then(|| {
                let mut record = record.clone();
                record.subject_name = image.subject.clone();
                record
            })
        })
        .collect()
}
