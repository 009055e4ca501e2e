//! sidmap core library.
//!
//! Maps Windows security identifiers to Unix uids and gids and back:
//! well-known identities, a TTL mapping cache, administrator name rules,
//! ephemeral id allocation, directory lookups, and the two-pass resolution
//! engine that ties them together.

pub mod config;
pub mod db;
pub mod directory;
pub mod engine;
pub mod ephemeral;
pub mod errors;
pub mod models;
pub mod nameservice;
pub mod rules;
pub mod service;
pub mod sid;
pub mod wellknown;

// Re-exports for convenience.
pub use config::AppConfig;
pub use engine::{Engine, EngineSettings, WorkerContext};
pub use errors::{CoreError, MapError};
pub use models::{Identity, IdKind, IdType, MappingRequest, MappingResult};
pub use service::{Batch, WorkerPool};
pub use sid::Sid;
