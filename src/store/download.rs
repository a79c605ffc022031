//! Model artifact loading: durable cache first, then streaming HTTP
//!
//! Progress is reported as one overall byte counter across both artifacts:
//! `loaded = encoder_so_far` while the encoder streams, then
//! `encoder_total + decoder_so_far`. The counter is monotone and ends equal
//! to the reported total.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::cache::ModelCache;
use super::types::{
    AbortSignal, CachedInfo, LoadProgress, LoadStage, LoadedModels, ModelArtifact, StoreError,
};
use crate::config::ModelConfig;

/// Progress callback invoked on every chunk
pub type ProgressFn = Arc<dyn Fn(LoadProgress) + Send + Sync>;

/// Reject bodies that exceed the expected artifact size by this factor.
const SIZE_GUARD_FACTOR: u64 = 4;

/// Source of model artifacts.
///
/// The HTTP-backed [`ModelStore`] is the production implementation; tests
/// substitute an in-memory fetcher.
#[async_trait]
pub trait ModelFetcher: Send + Sync {
    /// True when both artifacts are present in the durable cache.
    async fn is_cached(&self) -> bool;

    /// Cached artifact sizes, if both are present.
    async fn cached_info(&self) -> Option<CachedInfo>;

    /// Load both artifacts, emitting progress and honoring the abort signal.
    async fn load_all(
        &self,
        on_progress: ProgressFn,
        abort: AbortSignal,
    ) -> Result<LoadedModels, StoreError>;

    /// Drop cached artifacts.
    async fn clear_cache(&self) -> Result<(), StoreError>;

    /// Sum of expected artifact sizes, for UI estimation.
    fn total_expected_bytes(&self) -> u64;
}

/// HTTP + on-disk-cache model store
pub struct ModelStore {
    client: reqwest::Client,
    cache: ModelCache,
    encoder: ModelArtifact,
    decoder: ModelArtifact,
}

impl ModelStore {
    /// Open the store over the configured cache directory.
    pub async fn open(config: &ModelConfig) -> Result<Self, StoreError> {
        let cache = ModelCache::open(&config.cache_dir).await?;
        Ok(Self {
            client: reqwest::Client::new(),
            cache,
            encoder: ModelArtifact {
                key: "encoder",
                url: config.encoder_url.clone(),
                expected_bytes: config.encoder_expected_bytes,
            },
            decoder: ModelArtifact {
                key: "decoder",
                url: config.decoder_url.clone(),
                expected_bytes: config.decoder_expected_bytes,
            },
        })
    }

    /// Fetch one artifact. `base` is the byte count already accounted for by
    /// earlier stages; `rest` is the expected size of stages still to come.
    async fn fetch_stage(
        &self,
        artifact: &ModelArtifact,
        stage: LoadStage,
        base: u64,
        rest: u64,
        on_progress: &ProgressFn,
        abort: &AbortSignal,
    ) -> Result<Vec<u8>, StoreError> {
        if abort.is_aborted() {
            return Err(StoreError::Aborted);
        }

        // Cache first; cache failures fall back to the network.
        match self.cache.get(artifact.key).await {
            Ok(Some(bytes)) => {
                let len = bytes.len() as u64;
                on_progress(LoadProgress {
                    loaded: base + len,
                    total: base + len + rest,
                    stage,
                });
                return Ok(bytes);
            }
            Ok(None) => {}
            Err(e) => warn!("cache read for {} failed, downloading: {}", artifact.key, e),
        }

        info!("downloading {} from {}", artifact.key, artifact.url);
        let response = self.client.get(&artifact.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Http {
                status: status.as_u16(),
                url: artifact.url.clone(),
            });
        }

        let stage_total = response.content_length().unwrap_or(artifact.expected_bytes);
        if artifact.expected_bytes > 0 && stage_total > artifact.expected_bytes * SIZE_GUARD_FACTOR
        {
            return Err(StoreError::Network(format!(
                "{} body is {} bytes, expected around {}",
                artifact.key, stage_total, artifact.expected_bytes
            )));
        }

        let mut bytes: Vec<u8> = Vec::with_capacity(stage_total as usize);
        let mut stream = response.bytes_stream();
        let mut abort = abort.clone();
        loop {
            tokio::select! {
                _ = abort.cancelled() => return Err(StoreError::Aborted),
                chunk = stream.next() => match chunk {
                    None => break,
                    Some(Ok(chunk)) => {
                        bytes.extend_from_slice(&chunk);
                        let loaded = base + bytes.len() as u64;
                        on_progress(LoadProgress {
                            loaded,
                            total: (base + stage_total.max(bytes.len() as u64) + rest).max(loaded),
                            stage,
                        });
                    }
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }

        // Best-effort write-back; a failing cache never fails the load.
        if let Err(e) = self.cache.put(artifact.key, &bytes).await {
            warn!("cache write for {} failed: {}", artifact.key, e);
        }

        debug!("loaded {} ({} bytes)", artifact.key, bytes.len());
        Ok(bytes)
    }
}

#[async_trait]
impl ModelFetcher for ModelStore {
    async fn is_cached(&self) -> bool {
        matches!(self.cache.size(self.encoder.key).await, Ok(Some(_)))
            && matches!(self.cache.size(self.decoder.key).await, Ok(Some(_)))
    }

    async fn cached_info(&self) -> Option<CachedInfo> {
        let encoder_bytes = self.cache.size(self.encoder.key).await.ok()??;
        let decoder_bytes = self.cache.size(self.decoder.key).await.ok()??;
        Some(CachedInfo {
            encoder_bytes,
            decoder_bytes,
        })
    }

    async fn load_all(
        &self,
        on_progress: ProgressFn,
        abort: AbortSignal,
    ) -> Result<LoadedModels, StoreError> {
        let encoder = self
            .fetch_stage(
                &self.encoder,
                LoadStage::Encoder,
                0,
                self.decoder.expected_bytes,
                &on_progress,
                &abort,
            )
            .await?;

        let base = encoder.len() as u64;
        let decoder = self
            .fetch_stage(
                &self.decoder,
                LoadStage::Decoder,
                base,
                0,
                &on_progress,
                &abort,
            )
            .await?;

        // Final tick pins loaded == total regardless of header accuracy
        let total = base + decoder.len() as u64;
        on_progress(LoadProgress {
            loaded: total,
            total,
            stage: LoadStage::Decoder,
        });

        Ok(LoadedModels { encoder, decoder })
    }

    async fn clear_cache(&self) -> Result<(), StoreError> {
        self.cache.clear().await
    }

    fn total_expected_bytes(&self) -> u64 {
        self.encoder.expected_bytes + self.decoder.expected_bytes
    }
}
