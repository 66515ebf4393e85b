use crate::core::{Result, VlmError};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;

/// Which linear layers an adapter targets.
#[derive(Debug, Clone)]
pub enum TargetMatcher {
    Any,
    /// Module-name suffixes such as `q_proj` or `self_attn.o_proj`.
    Suffixes(Vec<String>),
    /// Full-match pattern over the dotted module name.
    Pattern(Regex),
}

impl TargetMatcher {
    pub fn suffixes<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TargetMatcher::Suffixes(names.into_iter().map(Into::into).collect())
    }

    pub fn pattern(pattern: &str) -> Result<Self> {
        let anchored = format!("^(?:{pattern})$");
        Regex::new(&anchored)
            .map(TargetMatcher::Pattern)
            .map_err(|e| VlmError::InvalidConfig(format!("bad target pattern {pattern:?}: {e}")))
    }

    pub fn matches(&self, module: &str) -> bool {
        match self {
            TargetMatcher::Any => true,
            TargetMatcher::Suffixes(suffixes) => suffixes.iter().any(|s| is_dotted_suffix(module, s)),
            TargetMatcher::Pattern(re) => re.is_match(module),
        }
    }
}

/// True when `suffix` equals `name` or names its trailing dotted components.
pub(crate) fn is_dotted_suffix(name: &str, suffix: &str) -> bool {
    name == suffix
        || (name.len() > suffix.len()
            && name.ends_with(suffix)
            && name.as_bytes()[name.len() - suffix.len() - 1] == b'.')
}

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub rank: usize,
    pub alpha: f64,
    pub use_rslora: bool,
    pub targets: TargetMatcher,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TargetModules {
    List(Vec<String>),
    Pattern(String),
}

#[derive(Deserialize)]
struct PeftConfig {
    r: usize,
    lora_alpha: f64,
    #[serde(default)]
    target_modules: Option<TargetModules>,
    #[serde(default)]
    use_rslora: bool,
}

#[derive(Deserialize)]
struct MlxParameters {
    rank: usize,
    #[serde(default)]
    alpha: Option<f64>,
    #[serde(default)]
    scale: Option<f64>,
    #[serde(default)]
    keys: Option<Vec<String>>,
}

impl AdapterConfig {
    pub fn new(rank: usize, alpha: f64) -> Self {
        Self {
            rank,
            alpha,
            use_rslora: false,
            targets: TargetMatcher::Any,
        }
    }

    pub fn with_targets(mut self, targets: TargetMatcher) -> Self {
        self.targets = targets;
        self
    }

    pub fn with_rslora(mut self, use_rslora: bool) -> Self {
        self.use_rslora = use_rslora;
        self
    }

    /// alpha / r, or alpha / sqrt(r) for rank-stabilized adapters.
    pub fn scale(&self) -> f64 {
        if self.rank == 0 {
            return 0.0;
        }
        if self.use_rslora {
            self.alpha / (self.rank as f64).sqrt()
        } else {
            self.alpha / self.rank as f64
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&serde_json::from_str(&text)?)
    }

    /// Accepts PEFT `adapter_config.json` and mlx `lora_parameters` layouts.
    pub fn from_json(value: &Value) -> Result<Self> {
        if let Some(params) = value.get("lora_parameters") {
            let params: MlxParameters = serde_json::from_value(params.clone())?;
            // mlx stores the effective scale directly
            let alpha = match (params.alpha, params.scale) {
                (Some(alpha), _) => alpha,
                (None, Some(scale)) => scale * params.rank as f64,
                (None, None) => params.rank as f64,
            };
            let targets = match params.keys {
                Some(keys) => TargetMatcher::suffixes(keys),
                None => TargetMatcher::Any,
            };
            return Ok(Self::new(params.rank, alpha).with_targets(targets));
        }

        let peft: PeftConfig = serde_json::from_value(value.clone())?;
        if peft.r == 0 {
            return Err(VlmError::InvalidConfig("adapter rank must be positive".into()));
        }
        let targets = match peft.target_modules {
            Some(TargetModules::List(names)) if !names.is_empty() => TargetMatcher::suffixes(names),
            Some(TargetModules::Pattern(p)) => TargetMatcher::pattern(&p)?,
            _ => match value.get("layer").and_then(Value::as_str) {
                Some(p) => TargetMatcher::pattern(p)?,
                None => TargetMatcher::Any,
            },
        };
        Ok(Self::new(peft.r, peft.lora_alpha)
            .with_targets(targets)
            .with_rslora(peft.use_rslora))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use serde_json::json;

    #[test]
    fn test_peft_config() {
        let config = AdapterConfig::from_json(&json!({
            "r": 8,
            "lora_alpha": 16,
            "target_modules": ["q_proj", "v_proj"],
        }))
        .unwrap();
        assert_eq!(config.rank, 8);
        assert_relative_eq!(config.scale(), 2.0);
        assert!(config.targets.matches("model.layers.3.self_attn.q_proj"));
        assert!(!config.targets.matches("model.layers.3.self_attn.k_proj"));
        assert!(!config.targets.matches("model.layers.3.self_attn.xq_proj"));
    }

    #[test]
    fn test_rslora_scale() {
        let config = AdapterConfig::new(16, 32.0).with_rslora(true);
        assert_relative_eq!(config.scale(), 8.0);
    }

    #[test]
    fn test_regex_targets() {
        let config = AdapterConfig::from_json(&json!({
            "r": 4,
            "lora_alpha": 4,
            "target_modules": r"model\.layers\.\d+\.mlp\.(gate|up)_proj",
        }))
        .unwrap();
        assert!(config.targets.matches("model.layers.12.mlp.up_proj"));
        assert!(!config.targets.matches("model.layers.12.mlp.down_proj"));
        assert!(!config.targets.matches("vision.model.layers.1.mlp.up_proj"));
    }

    #[test]
    fn test_mlx_config() {
        let config = AdapterConfig::from_json(&json!({
            "num_layers": 8,
            "lora_parameters": {"rank": 8, "scale": 20.0, "keys": ["self_attn.q_proj"]},
        }))
        .unwrap();
        assert_relative_eq!(config.scale(), 20.0);
        assert!(config.targets.matches("model.layers.0.self_attn.q_proj"));
    }

    #[test]
    fn test_zero_rank_rejected() {
        let err = AdapterConfig::from_json(&json!({"r": 0, "lora_alpha": 8})).unwrap_err();
        assert!(matches!(err, VlmError::InvalidConfig(_)));
    }
}
