use crate::core::Result;
use candle_core::Tensor;

/// Per-request key/value store, owned by exactly one generation.
pub trait KVCache: Send + Sync {
    /// Appends `key`/`value` for `layer` and returns the full cached tensors.
    fn update(&mut self, layer: usize, key: &Tensor, value: &Tensor) -> Result<(Tensor, Tensor)>;
    fn get(&self, layer: usize) -> Option<CacheEntry>;
    /// Number of positions already cached.
    fn len(&self) -> usize;
    fn capacity(&self) -> usize;
    fn reset(&mut self);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remaining(&self) -> usize {
        self.capacity().saturating_sub(self.len())
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: Tensor,
    pub value: Tensor,
}

impl CacheEntry {
    pub fn new(key: Tensor, value: Tensor) -> Self {
        Self { key, value }
    }
}
