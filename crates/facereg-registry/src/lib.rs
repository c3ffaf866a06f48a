//! facereg-registry — durable named registries of face embeddings.
//!
//! Each registry is one JSON file, cached in memory behind its own async
//! lock. Extraction runs on a dedicated thread; sync and batch recognition
//! embed outside the lock and apply their changes in one atomic flush.

pub mod batch;
pub mod cache;
pub mod engine;
pub mod error;
pub mod registry;
pub mod store;
pub mod sync;

pub use batch::{BatchReport, BatchRow, ProbeOutcome, UploadedFile};
pub use cache::{RegistryCache, RegistryGuard};
pub use engine::{spawn_engine, EngineHandle};
pub use error::{RegistryError, Result};
pub use registry::{
    decode_image_data, with_deadline, EnrollOutcome, EnrollRequest, EnrolledSummary, FaceRegistry,
    ImageSource, MatchOutcome, MatchRequest, RegistryConfig,
};
pub use store::{validate_name, RegistryStore};
pub use sync::{scan_source, sync_registry, SyncReport};
