//! Interactive SAM2 point-prompt segmentation pipeline
//!
//! A user marks foreground/background points on a captured frame; the
//! pipeline runs a two-stage ONNX model (image encoder + prompt decoder) on
//! a background compute thread and produces ranked candidate masks, with
//! iterative refinement feeding each round's selected mask into the next.
//!
//! Layering, leaves first: [`capability`] probes the GPU, [`store`] loads
//! model artifacts through a durable cache, [`tensor`] holds the pure
//! raster/tensor helpers, [`engine`] owns the ONNX sessions and embedding
//! cache, [`worker`] runs the engine off-thread behind a FIFO protocol,
//! [`provider`] adds the lifecycle state machine and session state, and
//! [`orchestrator`] turns editor commands into events.

pub mod capability;
pub mod config;
pub mod engine;
pub mod external;
pub mod orchestrator;
pub mod protocol;
pub mod provider;
pub mod store;
pub mod tensor;
pub mod worker;

#[cfg(any(test, feature = "test-util"))]
pub mod test_utils;

// Re-export commonly used types
pub use capability::{GpuCapabilities, probe_gpu};
pub use config::Config;
pub use engine::{MaskCandidate, PointLabel, PromptPoint, SegmentationOutput};
pub use external::{MaskCanvas, SelectionSink, ViewportRenderer};
pub use orchestrator::Orchestrator;
pub use protocol::{EditorCommand, SamEvent};
pub use provider::{
    ProviderError, ProviderState, SegmentationProvider, SegmentationRequest,
};
pub use store::{ModelFetcher, ModelStore};
