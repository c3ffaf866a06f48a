//! Durable registry storage: one JSON file per named registry.
//!
//! Every mutation is flushed before it becomes visible in memory. Files are
//! replaced atomically (write to a temp file, fsync, rename), so a crash or
//! cancelled flush leaves the previous version intact.
//!
//! The store does not arbitrate concurrency; callers hold the registry's
//! lock (see [`RegistryCache`](crate::cache::RegistryCache)).

use crate::error::{RegistryError, Result};
use facereg_core::{EnrollmentRecord, FaceError, Registry};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Current on-disk format version.
pub const STORE_VERSION: u32 = 1;
const MAX_NAME_LEN: usize = 64;

#[derive(Serialize)]
struct PersistedRef<'a> {
    version: u32,
    records: &'a IndexMap<String, EnrollmentRecord>,
}

/// Records are kept as raw JSON until validated one at a time, so a single
/// bad entry cannot fail the whole load.
#[derive(Deserialize)]
#[serde(untagged)]
enum Persisted {
    Versioned {
        version: u32,
        records: IndexMap<String, serde_json::Value>,
    },
    /// Versionless `imageKey -> record` map written by earlier tooling.
    Legacy(IndexMap<String, serde_json::Value>),
}

/// Registry names become file names, so they are restricted to a safe charset.
pub fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(RegistryError::InvalidName(name.to_string()))
    }
}

/// Counts from one flushed batch of mutations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Applied {
    pub added: usize,
    pub removed: usize,
}

pub struct RegistryStore {
    root: PathBuf,
    /// Embedding dimension of the active extractor, when known.
    dim: Option<usize>,
}

impl RegistryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dim: None,
        }
    }

    /// Validate records against a fixed embedding dimension on load and insert.
    /// Without one, a registry's first record sets its dimension.
    pub fn with_dim(mut self, dim: Option<usize>) -> Self {
        self.dim = dim;
        self
    }

    pub fn dim(&self) -> Option<usize> {
        self.dim
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }

    /// Load a registry. A missing, unreadable or unparsable file yields an
    /// empty registry; only an invalid name is an error.
    pub async fn load(&self, name: &str) -> Result<Registry> {
        validate_name(name)?;
        let path = self.path_for(name);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(registry = name, path = %path.display(), "no registry file; starting empty");
                return Ok(Registry::empty(name));
            }
            Err(e) => {
                tracing::warn!(registry = name, path = %path.display(), error = %e, "registry file unreadable; starting empty");
                return Ok(Registry::empty(name));
            }
        };

        match decode(name, &bytes, self.dim) {
            Ok(registry) => {
                tracing::info!(registry = name, records = registry.len(), "registry loaded");
                Ok(registry)
            }
            Err(e) => {
                tracing::warn!(registry = name, path = %path.display(), error = %e, "registry store corrupt; starting empty");
                Ok(Registry::empty(name))
            }
        }
    }

    /// Flush the whole registry to disk.
    pub async fn save(&self, registry: &Registry) -> Result<()> {
        validate_name(&registry.name)?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| RegistryError::io(&self.root, e))?;

        let bytes = serde_json::to_vec_pretty(&PersistedRef {
            version: STORE_VERSION,
            records: registry.as_map(),
        })?;

        let path = self.path_for(&registry.name);
        let tmp = path.with_extension("json.tmp");

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| RegistryError::io(&tmp, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| RegistryError::io(&tmp, e))?;
        file.sync_all()
            .await
            .map_err(|e| RegistryError::io(&tmp, e))?;
        drop(file);

        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| RegistryError::io(&path, e))?;

        tracing::debug!(registry = %registry.name, records = registry.len(), bytes = bytes.len(), "registry flushed");
        Ok(())
    }

    pub fn get<'r>(&self, registry: &'r Registry, image_key: &str) -> Option<&'r EnrollmentRecord> {
        registry.get(image_key)
    }

    pub fn list_all<'r>(&self, registry: &'r Registry) -> Vec<&'r EnrollmentRecord> {
        registry.records().collect()
    }

    /// Insert or overwrite one record and flush. Returns true for a new key.
    pub async fn put(&self, registry: &mut Registry, record: EnrollmentRecord) -> Result<bool> {
        let applied = self.apply(registry, &[], vec![record]).await?;
        Ok(applied.added == 1)
    }

    /// Remove one record and flush. Returns false (without flushing) if absent.
    pub async fn remove(&self, registry: &mut Registry, image_key: &str) -> Result<bool> {
        let applied = self.apply(registry, &[image_key.to_string()], Vec::new()).await?;
        Ok(applied.removed == 1)
    }

    /// Apply removals then insertions as one batch with a single flush.
    ///
    /// All-or-nothing: `registry` is only updated once the new state is on
    /// disk. `added` counts new keys; overwrites are applied but not counted.
    pub async fn apply(
        &self,
        registry: &mut Registry,
        removals: &[String],
        insertions: Vec<EnrollmentRecord>,
    ) -> Result<Applied> {
        let mut next = registry.clone();
        let mut applied = Applied::default();

        for key in removals {
            if next.remove(key).is_some() {
                applied.removed += 1;
            }
        }

        let inserting = !insertions.is_empty();
        for record in insertions {
            let dim = record.validate()?;
            match (self.dim, next.dim()) {
                (Some(expected), _) if dim != expected => {
                    return Err(FaceError::DimensionMismatch { expected, found: dim }.into());
                }
                (None, Some(expected)) if dim != expected => {
                    let overwrites_only_record = next.len() == 1 && next.contains(&record.image_key);
                    if !overwrites_only_record {
                        return Err(FaceError::DimensionMismatch { expected, found: dim }.into());
                    }
                }
                _ => {}
            }
            if next.insert(record) {
                applied.added += 1;
            }
        }

        if applied.removed == 0 && !inserting {
            return Ok(applied);
        }

        self.save(&next).await?;
        *registry = next;
        Ok(applied)
    }
}

fn decode(name: &str, bytes: &[u8], fixed_dim: Option<usize>) -> std::result::Result<Registry, FaceError> {
    let records = match serde_json::from_slice::<Persisted>(bytes)
        .map_err(|e| FaceError::StoreCorrupt(e.to_string()))?
    {
        Persisted::Versioned { version, records } if version == STORE_VERSION => records,
        Persisted::Versioned { version, .. } => {
            return Err(FaceError::StoreCorrupt(format!(
                "unsupported store version {version}"
            )))
        }
        Persisted::Legacy(records) => records,
    };

    let mut registry = Registry::empty(name);
    for (key, value) in records {
        let mut record: EnrollmentRecord = match serde_json::from_value(value) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(registry = name, key = %key, error = %e, "skipping unparsable record");
                continue;
            }
        };
        // The map key is authoritative.
        record.image_key = key;

        let dim = match record.validate() {
            Ok(dim) => dim,
            Err(e) => {
                tracing::warn!(registry = name, key = %record.image_key, error = %e, "skipping invalid record");
                continue;
            }
        };
        if let Some(expected) = fixed_dim.or_else(|| registry.dim()) {
            if dim != expected {
                tracing::warn!(
                    registry = name,
                    key = %record.image_key,
                    expected,
                    found = dim,
                    "skipping record with mismatched embedding dimension"
                );
                continue;
            }
        }
        registry.insert(record);
    }
    Ok(registry)
}
