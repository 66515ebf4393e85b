use std::env;
use std::path::PathBuf;

pub const DEFAULT_MAX_TOKENS: usize = 256;

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub model_paths: Vec<PathBuf>,
    pub hub_cache: PathBuf,
    pub max_tokens: usize,
    pub temperature: f32,
    pub proxy: Option<String>,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self {
            model_paths: env::var("VLM_MODELS")
                .unwrap_or_else(|_| "~/.cache/vlm/models".to_string())
                .split(':')
                .filter(|p| !p.is_empty())
                .map(expand_home)
                .collect(),
            hub_cache: hub_cache_dir(),
            max_tokens: env::var("VLM_MAX_TOKENS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: env::var("VLM_TEMPERATURE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
            proxy: env::var("VLM_PROXY")
                .or_else(|_| env::var("HTTPS_PROXY"))
                .ok()
                .filter(|p| !p.is_empty()),
        }
    }

    /// Directories searched for `org/name` model ids, in order.
    pub fn search_roots(&self) -> Vec<PathBuf> {
        let mut roots = self.model_paths.clone();
        roots.push(self.hub_cache.clone());
        roots
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn hub_cache_dir() -> PathBuf {
    if let Ok(cache) = env::var("HF_HUB_CACHE") {
        return expand_home(&cache);
    }
    match env::var("HF_HOME") {
        Ok(home) => expand_home(&home).join("hub"),
        Err(_) => expand_home("~/.cache/huggingface/hub"),
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/models"), home.join("models"));
        }
    }

    #[test]
    fn test_search_roots_end_with_hub_cache() {
        let config = EnvConfig {
            model_paths: vec![PathBuf::from("/a"), PathBuf::from("/b")],
            hub_cache: PathBuf::from("/hub"),
            max_tokens: 1,
            temperature: 0.0,
            proxy: None,
        };
        assert_eq!(
            config.search_roots(),
            vec![PathBuf::from("/a"), PathBuf::from("/b"), PathBuf::from("/hub")]
        );
    }
}
