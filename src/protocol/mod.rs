//! Typed message sets: editor commands/events and the worker protocol

mod messages;
mod worker;

pub use messages::{EditorCommand, SamEvent, SegmentStats};
pub use worker::{RequestKind, WorkerRequest, WorkerResponse, WorkerStatus};
