//! Model store types and error definitions

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

/// Errors that can occur while loading model artifacts
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("download failed: {0}")]
    Network(String),

    #[error("server returned HTTP {status} for {url}")]
    Http { status: u16, url: String },

    #[error("download aborted")]
    Aborted,

    #[error("cache error: {0}")]
    Cache(#[from] std::io::Error),
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        StoreError::Network(e.to_string())
    }
}

/// Stage reported in load progress events
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadStage {
    Encoder,
    Decoder,
    Initializing,
}

/// A single progress tick: overall bytes across both artifacts
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LoadProgress {
    pub loaded: u64,
    pub total: u64,
    pub stage: LoadStage,
}

/// One downloadable model artifact
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    /// Cache key (`encoder` or `decoder`)
    pub key: &'static str,
    pub url: String,
    /// Expected size, used for progress estimation before headers arrive
    pub expected_bytes: u64,
}

/// Byte sizes of the cached artifacts
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CachedInfo {
    pub encoder_bytes: u64,
    pub decoder_bytes: u64,
}

/// Both artifacts, ready to hand to the engine
pub struct LoadedModels {
    pub encoder: Vec<u8>,
    pub decoder: Vec<u8>,
}

/// Cooperative cancellation signal for long-running loads.
///
/// Cloned receivers all observe the same flag; the handle flips it once.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

/// The aborting side of an [`AbortSignal`]
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

/// Create a connected abort handle/signal pair.
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx }, AbortSignal { rx })
}

impl AbortSignal {
    /// Signal that never fires; for callers that do not need cancellation.
    pub fn never() -> Self {
        abort_pair().1
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the abort fires. Pending forever if the handle is kept
    /// alive without firing; resolves immediately if already aborted.
    pub async fn cancelled(&mut self) {
        // Err means the handle dropped without aborting; park forever so
        // select! branches on real work instead.
        if self.rx.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl AbortHandle {
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_pair_flag() {
        let (handle, signal) = abort_pair();
        assert!(!signal.is_aborted());
        handle.abort();
        assert!(signal.is_aborted());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_after_abort() {
        let (handle, mut signal) = abort_pair();
        handle.abort();
        // Must not hang
        signal.cancelled().await;
    }

    #[test]
    fn test_never_signal() {
        assert!(!AbortSignal::never().is_aborted());
    }
}
