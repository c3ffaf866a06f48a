//! The operations a front end (daemon or CLI) exposes, over one shared
//! cache and extraction engine.

use crate::batch::{batch_recognize, BatchReport, UploadedFile};
use crate::cache::{RegistryCache, RegistryGuard};
use crate::engine::EngineHandle;
use crate::error::{RegistryError, Result};
use crate::store::{validate_name, RegistryStore};
use crate::sync::{is_image_file, sync_registry, SyncReport};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use facereg_core::{
    resolve_subject, CosineMatcher, Embedding, EnrollmentRecord, FaceError, MatchCandidate,
    MatchQuery, Matcher, NameHint, Probe,
};
use serde::Serialize;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Where registries live and where their images come from.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub registries_dir: PathBuf,
    /// Image source of the default registry.
    pub images_dir: PathBuf,
    /// Parent of one image directory per named dataset registry.
    pub datasets_dir: PathBuf,
    pub default_registry: String,
    pub threshold: f32,
    pub top_k: usize,
}

impl RegistryConfig {
    /// Standard layout under one data directory.
    pub fn under(data_dir: &Path) -> Self {
        Self {
            registries_dir: data_dir.join("registries"),
            images_dir: data_dir.join("images"),
            datasets_dir: data_dir.join("datasets"),
            default_registry: "default".into(),
            threshold: 0.40,
            top_k: 5,
        }
    }

    /// Image source directory for a (validated) registry name.
    pub fn source_for(&self, registry: &str) -> PathBuf {
        if registry == self.default_registry {
            self.images_dir.clone()
        } else {
            self.datasets_dir.join(registry)
        }
    }
}

/// An image named by the caller.
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// Key relative to the registry's image source.
    Key(String),
    /// Any readable file.
    Path(PathBuf),
    /// Raw bytes supplied inline.
    Upload(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct EnrollRequest {
    pub registry: Option<String>,
    pub image: ImageSource,
    pub subject_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollOutcome {
    pub registry: String,
    /// True when the key was not enrolled before.
    pub added: bool,
    pub image_key: String,
    pub subject_name: String,
    pub embedding_count: usize,
}

#[derive(Debug, Clone)]
pub struct MatchRequest {
    pub registry: Option<String>,
    pub probe: ImageSource,
    pub threshold: Option<f32>,
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchOutcome {
    pub registry: String,
    pub probe: String,
    pub matches: Vec<MatchCandidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrolledSummary {
    pub image_key: String,
    pub subject_name: String,
    pub embedding_count: usize,
    pub enrolled_at: DateTime<Utc>,
}

/// Where an enrolled image ends up in the registry's source directory.
enum Placement {
    InSource { key: String },
    Copy { file_name: String },
    Upload { stem: String },
}

pub struct FaceRegistry {
    config: RegistryConfig,
    cache: RegistryCache,
    engine: EngineHandle,
    matcher: CosineMatcher,
}

impl FaceRegistry {
    pub fn new(config: RegistryConfig, engine: EngineHandle) -> Self {
        let store = RegistryStore::new(&config.registries_dir).with_dim(engine.dim());
        let cache = RegistryCache::new(store);
        Self {
            config,
            cache,
            engine,
            matcher: CosineMatcher,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Name of the extractor serving this registry.
    pub fn model(&self) -> &str {
        self.engine.model()
    }

    /// False when this registry was built over an offline engine.
    pub fn models_loaded(&self) -> bool {
        self.engine.is_running()
    }

    /// Registries touched since startup.
    pub fn loaded_registries(&self) -> Vec<String> {
        self.cache.names()
    }

    fn resolve_name(&self, requested: Option<&str>) -> Result<String> {
        let name = requested
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.config.default_registry);
        validate_name(name)?;
        Ok(name.to_string())
    }

    fn query(&self, threshold: Option<f32>, top_k: Option<usize>) -> MatchQuery {
        MatchQuery {
            threshold: threshold.unwrap_or(self.config.threshold),
            top_k: top_k.unwrap_or(self.config.top_k),
        }
    }

    async fn extract(&self, bytes: Vec<u8>, cancel: &CancellationToken) -> Result<Vec<Embedding>> {
        tokio::select! {
            _ = cancel.cancelled() => Err(RegistryError::Cancelled),
            faces = self.engine.extract(bytes) => faces,
        }
    }

    /// Embed one image and store it. Nothing is written when no face is found.
    pub async fn enroll(&self, req: EnrollRequest, cancel: &CancellationToken) -> Result<EnrollOutcome> {
        let name = self.resolve_name(req.registry.as_deref())?;
        let source_dir = self.config.source_for(&name);
        let explicit = req
            .subject_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        let (bytes, placement) = match req.image {
            ImageSource::Key(key) => {
                let key = normalize_key(&key)?;
                if !is_image_file(Path::new(&key)) {
                    return Err(RegistryError::InvalidRequest(format!("{key} is not a supported image file")));
                }
                let bytes = read_image(&source_dir.join(&key)).await?;
                (bytes, Placement::InSource { key })
            }
            ImageSource::Path(path) => {
                if !is_image_file(&path) {
                    return Err(RegistryError::InvalidRequest(format!(
                        "{} is not a supported image file",
                        path.display()
                    )));
                }
                let bytes = read_image(&path).await?;
                match key_within(&source_dir, &path) {
                    Some(key) => (bytes, Placement::InSource { key }),
                    None => {
                        let file_name = path
                            .file_name()
                            .map(|f| f.to_string_lossy().into_owned())
                            .ok_or_else(|| RegistryError::InvalidRequest("path has no file name".into()))?;
                        (bytes, Placement::Copy { file_name })
                    }
                }
            }
            ImageSource::Upload(bytes) => {
                let person = explicit.ok_or_else(|| {
                    RegistryError::InvalidRequest("a person name is required for uploaded images".into())
                })?;
                (bytes, Placement::Upload { stem: file_stem_for(person) })
            }
        };

        let faces = self.extract(bytes.clone(), cancel).await?;
        if faces.is_empty() {
            tracing::info!(registry = %name, "no face detected; nothing enrolled");
            return Err(FaceError::NoFaceDetected.into());
        }

        let mut guard = self.cache.lock(&name).await?;
        if cancel.is_cancelled() {
            return Err(RegistryError::Cancelled);
        }

        let (key, subject, written) = match placement {
            Placement::InSource { key } => {
                let subject = resolve_subject(&key, explicit);
                (key, subject, None)
            }
            Placement::Copy { file_name } => {
                let (key, written) = place_copy(&source_dir, &file_name, &bytes).await?;
                (key, resolve_subject(&file_name, explicit), written)
            }
            Placement::Upload { stem } => {
                let key = place_upload(&source_dir, &stem, &bytes, &guard).await?;
                let written = Some(source_dir.join(&key));
                // The same name a later rebuild from the file would give.
                let subject = resolve_subject(&key, None);
                (key, subject, written)
            }
        };

        let source_path = canonical_dir(&source_dir).await?.join(&key);
        let outcome = self.store_record(&mut guard, &name, &key, subject, source_path, faces).await;
        if outcome.is_err() {
            if let Some(path) = written {
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
        outcome
    }

    async fn store_record(
        &self,
        guard: &mut RegistryGuard,
        name: &str,
        key: &str,
        subject: String,
        source_path: PathBuf,
        faces: Vec<Embedding>,
    ) -> Result<EnrollOutcome> {
        let record = EnrollmentRecord::new(key, subject, source_path, faces)?;
        let subject_name = record.subject_name.clone();
        let embedding_count = record.embeddings.len();
        let added = self.cache.store().put(guard, record).await?;

        tracing::info!(registry = name, key, subject = %subject_name, faces = embedding_count, added, "enrolled");
        Ok(EnrollOutcome {
            registry: name.to_string(),
            added,
            image_key: key.to_string(),
            subject_name,
            embedding_count,
        })
    }

    /// Rank the registry's records against a probe.
    ///
    /// A probe inside the registry's image source is matched by key: the
    /// registry is synced first and the probe's own record is excluded.
    pub async fn match_probe(&self, req: MatchRequest, cancel: &CancellationToken) -> Result<MatchOutcome> {
        let name = self.resolve_name(req.registry.as_deref())?;
        let query = self.query(req.threshold, req.top_k);
        let source_dir = self.config.source_for(&name);

        let (label, bytes) = match req.probe {
            ImageSource::Key(key) => {
                return self.match_enrolled(&name, normalize_key(&key)?, query, cancel).await;
            }
            ImageSource::Path(path) => match key_within(&source_dir, &path) {
                Some(key) => return self.match_enrolled(&name, key, query, cancel).await,
                None => (path.display().to_string(), read_image(&path).await?),
            },
            ImageSource::Upload(bytes) => ("upload".to_string(), bytes),
        };
        let faces = self.extract(bytes, cancel).await?;

        let guard = self.cache.lock(&name).await?;
        let matches = self.matcher.rank(Probe::new(&faces), &guard, query)?;
        tracing::debug!(registry = %name, probe = %label, matches = matches.len(), "matched");
        Ok(MatchOutcome {
            registry: name,
            probe: label,
            matches,
        })
    }

    async fn match_enrolled(
        &self,
        name: &str,
        key: String,
        query: MatchQuery,
        cancel: &CancellationToken,
    ) -> Result<MatchOutcome> {
        let source_dir = self.config.source_for(name);
        let path = source_dir.join(&key);
        if !is_image_file(&path) {
            return Err(RegistryError::InvalidRequest(format!("{key} is not a supported image file")));
        }
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(FaceError::SourceNotFound(path.display().to_string()).into());
        }

        let report = sync_registry(&self.cache, &self.engine, name, &source_dir, &[], cancel).await?;

        let guard = self.cache.lock(name).await?;
        let Some(record) = self.cache.store().get(&guard, &key) else {
            drop(guard);
            if report.skipped.contains(&key) {
                // Surface why the probe could not be enrolled.
                let faces = self.extract(read_image(&path).await?, cancel).await?;
                if faces.is_empty() {
                    return Err(FaceError::NoFaceDetected.into());
                }
                let expected = match self.engine.dim() {
                    Some(dim) => Some(dim),
                    None => self.cache.lock(name).await?.dim(),
                };
                if let (Some(expected), Some(found)) = (expected, faces.first().map(Embedding::dim)) {
                    if expected != found {
                        return Err(FaceError::DimensionMismatch { expected, found }.into());
                    }
                }
            }
            return Err(FaceError::ProbeOwnRecordMissing(key).into());
        };

        let matches = self
            .matcher
            .rank(Probe::new(&record.embeddings).with_key(&key), &guard, query)?;
        tracing::debug!(registry = name, probe = %key, matches = matches.len(), "matched");
        Ok(MatchOutcome {
            registry: name.to_string(),
            probe: key,
            matches,
        })
    }

    /// Sync a registry against its image source, or against `source` if given.
    pub async fn sync(
        &self,
        registry: Option<&str>,
        source: Option<&Path>,
        hints: &[NameHint],
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let name = self.resolve_name(registry)?;
        let source = source
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.source_for(&name));
        sync_registry(&self.cache, &self.engine, &name, &source, hints, cancel).await
    }

    pub async fn list(&self, registry: Option<&str>) -> Result<Vec<EnrolledSummary>> {
        let name = self.resolve_name(registry)?;
        let guard = self.cache.lock(&name).await?;
        Ok(self
            .cache
            .store()
            .list_all(&guard)
            .into_iter()
            .map(|r| EnrolledSummary {
                image_key: r.image_key.clone(),
                subject_name: r.subject_name.clone(),
                embedding_count: r.embeddings.len(),
                enrolled_at: r.enrolled_at,
            })
            .collect())
    }

    /// Drop one record. The image file itself is left in place.
    pub async fn remove(&self, registry: Option<&str>, image_key: &str) -> Result<bool> {
        let name = self.resolve_name(registry)?;
        let mut guard = self.cache.lock(&name).await?;
        let removed = self.cache.store().remove(&mut guard, image_key).await?;
        tracing::info!(registry = %name, key = image_key, removed, "remove");
        Ok(removed)
    }

    /// Write uploaded images into a dataset's directory, then sync it.
    pub async fn upload_dataset(
        &self,
        registry: &str,
        files: &[UploadedFile],
        hints: &[NameHint],
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let name = self.resolve_name(Some(registry))?;
        let dir = self.config.source_for(&name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| RegistryError::io(&dir, e))?;

        let mut written = 0;
        for file in files {
            let Some(base) = sanitize_file_name(&file.name) else {
                tracing::warn!(registry = %name, file = %file.name, "skipping upload with unusable name");
                continue;
            };
            let path = dir.join(&base);
            tokio::fs::write(&path, &file.data)
                .await
                .map_err(|e| RegistryError::io(&path, e))?;
            written += 1;
        }
        tracing::info!(registry = %name, written, "dataset files written");

        sync_registry(&self.cache, &self.engine, &name, &dir, hints, cancel).await
    }

    pub async fn batch_recognize(
        &self,
        registry: Option<&str>,
        probes: &[UploadedFile],
        threshold: Option<f32>,
        top_k: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let name = self.resolve_name(registry)?;
        let source = self.config.source_for(&name);
        tokio::fs::create_dir_all(&source)
            .await
            .map_err(|e| RegistryError::io(&source, e))?;
        batch_recognize(
            &self.cache,
            &self.engine,
            &self.matcher,
            &name,
            &source,
            probes,
            self.query(threshold, top_k),
            cancel,
        )
        .await
    }
}

/// Run `fut` under a deadline; on expiry, cancel `token` and report `Cancelled`.
pub async fn with_deadline<T, F>(deadline: Duration, token: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(deadline_secs = deadline.as_secs(), "operation deadline exceeded");
            token.cancel();
            Err(RegistryError::Cancelled)
        }
    }
}

/// Decode base64 image data, accepting a `data:<mime>;base64,` prefix.
pub fn decode_image_data(data: &str) -> Result<Vec<u8>> {
    let data = data.trim();
    let payload = match data.split_once(',') {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };
    Ok(base64::engine::general_purpose::STANDARD.decode(payload)?)
}

async fn read_image(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            FaceError::SourceNotFound(path.display().to_string()).into()
        } else {
            RegistryError::io(path, e)
        }
    })
}

async fn canonical_dir(dir: &Path) -> Result<PathBuf> {
    tokio::fs::canonicalize(dir)
        .await
        .map_err(|e| RegistryError::io(dir, e))
}

/// Validate a caller-supplied key: relative, no `..`, `/`-separated.
fn normalize_key(key: &str) -> Result<String> {
    let unified = key.trim().replace('\\', "/");
    let mut parts = Vec::new();
    for component in Path::new(&unified).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => {
                return Err(RegistryError::InvalidRequest(format!(
                    "image key {key:?} must be a relative path inside the image source"
                )))
            }
        }
    }
    if parts.is_empty() {
        return Err(RegistryError::InvalidRequest("empty image key".into()));
    }
    Ok(parts.join("/"))
}

/// Key of `path` relative to `dir`, if the file lies inside it.
fn key_within(dir: &Path, path: &Path) -> Option<String> {
    let dir = dir.canonicalize().ok()?;
    let path = path.canonicalize().ok()?;
    let relative = path.strip_prefix(&dir).ok()?;
    let key = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    (!key.is_empty()).then_some(key)
}

fn file_stem_for(person: &str) -> String {
    person
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Basename of an uploaded file, if it is a usable image name.
fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next()?.trim();
    if base.is_empty() || base == "." || base == ".." || !is_image_file(Path::new(base)) {
        return None;
    }
    Some(base.to_string())
}

/// Copy an outside file into the source directory under a free name.
///
/// A file with identical bytes already in place is reused.
async fn place_copy(dir: &Path, file_name: &str, bytes: &[u8]) -> Result<(String, Option<PathBuf>)> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| RegistryError::io(dir, e))?;

    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{ext}")),
        _ => (file_name, String::new()),
    };

    for n in 1.. {
        let candidate = if n == 1 {
            file_name.to_string()
        } else {
            format!("{stem}_{n}{ext}")
        };
        let path = dir.join(&candidate);
        match tokio::fs::read(&path).await {
            Ok(existing) if existing == bytes => return Ok((candidate, None)),
            Ok(_) => continue,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::write(&path, bytes)
                    .await
                    .map_err(|e| RegistryError::io(&path, e))?;
                return Ok((candidate, Some(path)));
            }
            Err(e) => return Err(RegistryError::io(&path, e)),
        }
    }
    unreachable!("unbounded candidate search")
}

/// Write uploaded bytes as `<stem>_<unix>.jpg`. On collision the timestamp
/// is bumped, so the key always resolves back to `stem`.
async fn place_upload(dir: &Path, stem: &str, bytes: &[u8], registry: &RegistryGuard) -> Result<String> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| RegistryError::io(dir, e))?;

    let now = Utc::now().timestamp();
    for n in 0.. {
        let key = format!("{stem}_{}.jpg", now + n);
        let path = dir.join(&key);
        if registry.contains(&key) || tokio::fs::try_exists(&path).await.unwrap_or(true) {
            continue;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| RegistryError::io(&path, e))?;
        return Ok(key);
    }
    unreachable!("unbounded candidate search")
}
