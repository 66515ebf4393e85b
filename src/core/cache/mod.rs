pub mod traits;

pub use traits::{CacheEntry, KVCache};

use crate::core::{Result, VlmError};
use candle_core::Tensor;

/// Append-only causal cache. Keys and values grow along `seq_dim`.
pub struct CausalKVCache {
    layers: Vec<Option<CacheEntry>>,
    seq_dim: usize,
    max_seq_len: usize,
    seq_len: usize,
}

impl CausalKVCache {
    pub fn new(layer_count: usize, seq_dim: usize, max_seq_len: usize) -> Self {
        Self {
            layers: vec![None; layer_count],
            seq_dim,
            max_seq_len,
            seq_len: 0,
        }
    }

    pub fn seq_dim(&self) -> usize {
        self.seq_dim
    }
}

impl KVCache for CausalKVCache {
    fn update(&mut self, layer: usize, key: &Tensor, value: &Tensor) -> Result<(Tensor, Tensor)> {
        if layer >= self.layers.len() {
            return Err(VlmError::InvalidConfig(format!(
                "cache has {} layers, got update for layer {}",
                self.layers.len(),
                layer
            )));
        }

        let incoming = key.dim(self.seq_dim)?;
        let (key, value) = match &self.layers[layer] {
            Some(entry) => (
                Tensor::cat(&[&entry.key, key], self.seq_dim)?,
                Tensor::cat(&[&entry.value, value], self.seq_dim)?,
            ),
            None => (key.clone(), value.clone()),
        };

        let total = key.dim(self.seq_dim)?;
        if total > self.max_seq_len {
            return Err(VlmError::ContextOverflow {
                requested: total,
                capacity: self.max_seq_len,
            });
        }

        if layer == 0 {
            self.seq_len += incoming;
        }
        self.layers[layer] = Some(CacheEntry::new(key.clone(), value.clone()));

        Ok((key, value))
    }

    fn get(&self, layer: usize) -> Option<CacheEntry> {
        self.layers.get(layer).cloned().flatten()
    }

    fn len(&self) -> usize {
        self.seq_len
    }

    fn capacity(&self) -> usize {
        self.max_seq_len
    }

    fn reset(&mut self) {
        self.layers.iter_mut().for_each(|l| *l = None);
        self.seq_len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_causal_cache_appends_along_seq_dim() {
        let mut cache = CausalKVCache::new(2, 0, 16);
        let k = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();

        cache.update(0, &k, &k).unwrap();
        cache.update(1, &k, &k).unwrap();
        assert_eq!(cache.len(), 3);

        let one = Tensor::ones((1, 4), DType::F32, &Device::Cpu).unwrap();
        let (key, _) = cache.update(0, &one, &one).unwrap();
        assert_eq!(key.dims(), &[4, 4]);
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.remaining(), 12);

        cache.reset();
        assert!(cache.is_empty());
        assert!(cache.get(0).is_none());
    }

    #[test]
    fn test_causal_cache_overflow() {
        let mut cache = CausalKVCache::new(1, 0, 2);
        let k = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let err = cache.update(0, &k, &k).unwrap_err();
        assert!(matches!(err, VlmError::ContextOverflow { requested: 3, capacity: 2 }));
    }
}
