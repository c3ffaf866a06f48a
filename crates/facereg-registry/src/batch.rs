//! Recognize a whole probe set against one registry.
//!
//! The registry is synced once up front, every distinct probe is embedded
//! exactly once, and every probe yields exactly one report row whatever
//! happens to it.

use crate::cache::RegistryCache;
use crate::engine::EngineHandle;
use crate::error::{RegistryError, Result};
use crate::sync::{sync_registry, SyncReport};
use facereg_core::{Embedding, MatchCandidate, MatchQuery, Matcher, NameHint, Probe};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub const NO_FACE: &str = "NO_FACE";
pub const NO_MATCH: &str = "NO_MATCH";
pub const ERROR: &str = "ERROR";
const CSV_HEADER: &str = "probeName,matchedSubject,similarity";

/// A named image supplied by the caller.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ProbeOutcome {
    Matched { matches: Vec<MatchCandidate> },
    NoMatch,
    NoFace,
    #[serde(rename_all = "camelCase")]
    Failed { kind: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRow {
    pub probe: String,
    #[serde(flatten)]
    pub outcome: ProbeOutcome,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub sync: SyncReport,
    pub rows: Vec<BatchRow>,
}

impl BatchReport {
    /// One line per probe: best match, or a `NO_FACE` / `NO_MATCH` / `ERROR` sentinel.
    pub fn to_csv(&self) -> String {
        let mut out = String::from(CSV_HEADER);
        out.push('\n');
        for row in &self.rows {
            let (subject, similarity) = match &row.outcome {
                ProbeOutcome::Matched { matches } => match matches.first() {
                    Some(best) => (best.subject_name.as_str(), format!("{:.4}", best.similarity)),
                    None => (NO_MATCH, String::new()),
                },
                ProbeOutcome::NoMatch => (NO_MATCH, String::new()),
                ProbeOutcome::NoFace => (NO_FACE, String::new()),
                ProbeOutcome::Failed { .. } => (ERROR, String::new()),
            };
            let _ = writeln!(out, "{},{},{}", csv_field(&row.probe), csv_field(subject), similarity);
        }
        out
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Result of embedding one distinct probe image.
enum Extracted {
    Faces(Vec<Embedding>),
    Failed { kind: String, message: String },
}

#[allow(clippy::too_many_arguments)]
pub async fn batch_recognize<M: Matcher>(
    cache: &RegistryCache,
    engine: &EngineHandle,
    matcher: &M,
    name: &str,
    source: &Path,
    probes: &[UploadedFile],
    query: MatchQuery,
    cancel: &CancellationToken,
) -> Result<BatchReport> {
    let sync = sync_registry(cache, engine, name, source, &[] as &[NameHint], cancel).await?;

    // Identical bytes are embedded once, however many probes share them.
    let mut slot_of: HashMap<&[u8], usize> = HashMap::new();
    let mut extracted: Vec<Extracted> = Vec::new();
    let mut slots = Vec::with_capacity(probes.len());

    for probe in probes {
        if let Some(&slot) = slot_of.get(probe.data.as_slice()) {
            slots.push(slot);
            continue;
        }
        if cancel.is_cancelled() {
            return Err(RegistryError::Cancelled);
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(RegistryError::Cancelled),
            faces = engine.extract(probe.data.clone()) => faces,
        };
        let entry = match outcome {
            Ok(faces) => Extracted::Faces(faces),
            Err(RegistryError::WorkerClosed) => return Err(RegistryError::WorkerClosed),
            Err(e) => {
                tracing::warn!(registry = name, probe = %probe.name, error = %e, "probe extraction failed");
                Extracted::Failed {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                }
            }
        };
        slot_of.insert(probe.data.as_slice(), extracted.len());
        slots.push(extracted.len());
        extracted.push(entry);
    }

    let guard = cache.lock(name).await?;
    let rows = probes
        .iter()
        .zip(slots)
        .map(|(probe, slot)| {
            let outcome = match &extracted[slot] {
                Extracted::Faces(faces) => {
                    match matcher.rank(Probe::new(faces).with_key(&probe.name), &guard, query) {
                        Ok(matches) if matches.is_empty() => ProbeOutcome::NoMatch,
                        Ok(matches) => ProbeOutcome::Matched { matches },
                        Err(facereg_core::FaceError::NoFaceDetected) => ProbeOutcome::NoFace,
                        Err(e) => {
                            tracing::warn!(registry = name, probe = %probe.name, error = %e, "probe match failed");
                            ProbeOutcome::Failed {
                                kind: e.kind().to_string(),
                                message: e.to_string(),
                            }
                        }
                    }
                }
                Extracted::Failed { kind, message } => ProbeOutcome::Failed {
                    kind: kind.clone(),
                    message: message.clone(),
                },
            };
            BatchRow {
                probe: probe.name.clone(),
                outcome,
            }
        })
        .collect::<Vec<_>>();
    drop(guard);

    tracing::info!(
        registry = name,
        probes = probes.len(),
        distinct = extracted.len(),
        matched = rows.iter().filter(|r| matches!(r.outcome, ProbeOutcome::Matched { .. })).count(),
        "batch recognition complete"
    );
    Ok(BatchReport { sync, rows })
}
