//! Model artifact store: streaming downloads over a durable cache

mod cache;
mod download;
mod types;

pub use cache::{ModelCache, OBJECT_STORE, SCHEMA_VERSION, STORE_NAME};
pub use download::{ModelFetcher, ModelStore, ProgressFn};
pub use types::{
    AbortHandle, AbortSignal, CachedInfo, LoadProgress, LoadStage, LoadedModels, ModelArtifact,
    StoreError, abort_pair,
};
