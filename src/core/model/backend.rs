use super::registry::ArchitectureFamily;
use super::{ModelConfig, VisionLanguageModel};
use crate::core::{Result, VlmError};
use candle_core::Device;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

pub type BackendCreator =
    Arc<dyn Fn(&ModelConfig, &Path, &Device) -> Result<Box<dyn VisionLanguageModel>> + Send + Sync>;

/// Maps architecture families to the code that builds their weights. Owned
/// by the caller; there is no process-wide instance.
pub struct BackendRegistry {
    creators: RwLock<HashMap<ArchitectureFamily, BackendCreator>>,
    aliases: RwLock<HashMap<ArchitectureFamily, ArchitectureFamily>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            creators: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
        }
    }

    pub fn register<F>(&self, family: ArchitectureFamily, creator: F)
    where
        F: Fn(&ModelConfig, &Path, &Device) -> Result<Box<dyn VisionLanguageModel>> + Send + Sync + 'static,
    {
        self.creators.write().insert(family, Arc::new(creator));
    }

    /// Serve `alias` with the backend registered for `target`.
    pub fn register_alias(&self, alias: ArchitectureFamily, target: ArchitectureFamily) {
        self.aliases.write().insert(alias, target);
    }

    pub fn get(&self, family: ArchitectureFamily) -> Option<BackendCreator> {
        let creators = self.creators.read();
        if let Some(creator) = creators.get(&family) {
            return Some(Arc::clone(creator));
        }

        let aliases = self.aliases.read();
        aliases
            .get(&family)
            .and_then(|target| creators.get(target))
            .map(Arc::clone)
    }

    pub fn create(&self, config: &ModelConfig, model_dir: &Path, device: &Device) -> Result<Box<dyn VisionLanguageModel>> {
        let creator = self
            .get(config.family)
            .ok_or_else(|| VlmError::MissingBackend(config.family.to_string()))?;
        creator(config, model_dir, device)
    }

    pub fn families(&self) -> Vec<ArchitectureFamily> {
        self.creators.read().keys().copied().collect()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::registry;
    use crate::testing::TinyVlm;

    #[test]
    fn test_registry() {
        let backends = BackendRegistry::new();
        backends.register(ArchitectureFamily::Llava, |config, _dir, device| {
            Ok(Box::new(TinyVlm::new(config, device)?) as Box<dyn VisionLanguageModel>)
        });
        backends.register_alias(ArchitectureFamily::BunnyLlama, ArchitectureFamily::Llava);

        assert!(backends.get(ArchitectureFamily::Llava).is_some());
        assert!(backends.get(ArchitectureFamily::BunnyLlama).is_some());
        assert!(backends.get(ArchitectureFamily::Gemma3).is_none());

        let config = registry::defaults(ArchitectureFamily::Gemma3);
        let err = backends
            .create(&config, Path::new("."), &Device::Cpu)
            .err()
            .unwrap();
        assert!(matches!(err, VlmError::MissingBackend(ref f) if f == "gemma3"));
    }
}
