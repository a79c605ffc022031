//! Per-image embedding cache with LRU eviction
//!
//! Embeddings are a few megabytes per image; the cache caps how many are
//! held. IndexMap keeps insertion order, so the least recently used entry is
//! always at index 0: touching an entry removes and re-inserts it at the end.

use indexmap::IndexMap;
use tracing::debug;

/// A raw float tensor with its shape
#[derive(Debug, Clone)]
pub struct TensorData {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorData {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self { shape, data }
    }
}

/// Encoder outputs cached for one image id
#[derive(Debug, Clone)]
pub struct ImageEmbeddings {
    pub image_embed: TensorData,
    /// High-resolution feature maps in decoder slot order (0, 1)
    pub high_res: Vec<TensorData>,
}

/// LRU cache of encoder outputs keyed by image id
pub struct EmbeddingCache {
    entries: IndexMap<String, ImageEmbeddings>,
    max_size: usize,
}

impl EmbeddingCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: IndexMap::with_capacity(max_size.max(1)),
            max_size: max_size.max(1),
        }
    }

    /// Look up embeddings, refreshing their LRU position on hit.
    pub fn get(&mut self, image_id: &str) -> Option<&ImageEmbeddings> {
        if let Some(entry) = self.entries.shift_remove(image_id) {
            self.entries.insert(image_id.to_string(), entry);
        }
        self.entries.get(image_id)
    }

    pub fn contains(&self, image_id: &str) -> bool {
        self.entries.contains_key(image_id)
    }

    /// Insert embeddings, evicting the oldest entry when full.
    pub fn insert(&mut self, image_id: String, embeddings: ImageEmbeddings) {
        if !self.entries.contains_key(&image_id)
            && self.entries.len() >= self.max_size
            && let Some((evicted, _)) = self.entries.shift_remove_index(0)
        {
            debug!("evicted embeddings for image {}", evicted);
        }
        self.entries.insert(image_id, embeddings);
    }

    pub fn remove(&mut self, image_id: &str) {
        self.entries.shift_remove(image_id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
