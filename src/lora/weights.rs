use super::config::AdapterConfig;
use crate::core::{Result, VlmError};
use candle_core::{DType, Device, Tensor};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::debug;

const PEFT_CONFIG: &str = "adapter_config.json";
const PEFT_WEIGHTS: &str = "adapter_model.safetensors";
const MLX_WEIGHTS: &str = "adapters.safetensors";
const PEFT_PREFIX: &str = "base_model.model.";

/// Low-rank factors for one linear layer: `a` is `[rank, in]`, `b` is `[out, rank]`.
#[derive(Debug, Clone)]
pub struct LayerAdapter {
    pub a: Tensor,
    pub b: Tensor,
}

impl LayerAdapter {
    pub fn new(a: Tensor, b: Tensor) -> Result<Self> {
        let (rank_a, _) = a.dims2()?;
        let (_, rank_b) = b.dims2()?;
        if rank_a != rank_b {
            return Err(VlmError::ShapeMismatch {
                layer: "lora_B".into(),
                expected: vec![b.dim(0)?, rank_a],
                actual: b.dims().to_vec(),
            });
        }
        Ok(Self { a, b })
    }

    pub fn rank(&self) -> usize {
        self.a.dims()[0]
    }

    pub fn in_features(&self) -> usize {
        self.a.dims()[1]
    }

    pub fn out_features(&self) -> usize {
        self.b.dims()[0]
    }

    /// `scale * B·A`, shaped like the base weight `[out, in]`.
    pub fn delta(&self, scale: f64) -> Result<Tensor> {
        Ok(self.b.matmul(&self.a)?.affine(scale, 0.0)?)
    }
}

/// A loaded adapter: per-layer factors keyed by dotted module name.
#[derive(Debug, Clone)]
pub struct LoraWeights {
    pub name: String,
    pub config: AdapterConfig,
    pub layers: BTreeMap<String, LayerAdapter>,
}

enum KeyLayout {
    Peft,
    Mlx,
}

impl LoraWeights {
    /// Loads a PEFT or mlx adapter directory.
    pub fn load(dir: &Path, device: &Device) -> Result<Self> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "adapter".to_string());
        let config = AdapterConfig::from_file(&dir.join(PEFT_CONFIG))?;

        let (path, layout) = if dir.join(PEFT_WEIGHTS).exists() {
            (dir.join(PEFT_WEIGHTS), KeyLayout::Peft)
        } else if dir.join(MLX_WEIGHTS).exists() {
            (dir.join(MLX_WEIGHTS), KeyLayout::Mlx)
        } else {
            return Err(VlmError::InvalidConfig(format!(
                "no adapter weights in {}",
                dir.display()
            )));
        };

        let tensors = candle_core::safetensors::load(&path, device)?;
        debug!(adapter = %name, tensors = tensors.len(), "loaded adapter tensors");
        match layout {
            KeyLayout::Peft => Self::from_peft_tensors(name, config, tensors),
            KeyLayout::Mlx => Self::from_mlx_tensors(name, config, tensors),
        }
    }

    pub fn from_peft_tensors(name: impl Into<String>, config: AdapterConfig, tensors: HashMap<String, Tensor>) -> Result<Self> {
        let mut pairs = Pairs::default();
        for (key, tensor) in tensors {
            let key = key.strip_prefix(PEFT_PREFIX).unwrap_or(&key);
            let key = key.replace(".default.weight", ".weight");
            if let Some(module) = key.strip_suffix(".lora_A.weight") {
                pairs.a(module, tensor);
            } else if let Some(module) = key.strip_suffix(".lora_B.weight") {
                pairs.b(module, tensor);
            }
        }
        Self::assemble(name.into(), config, pairs)
    }

    /// mlx stores `lora_a` as `[in, rank]` and `lora_b` as `[rank, out]`.
    pub fn from_mlx_tensors(name: impl Into<String>, config: AdapterConfig, tensors: HashMap<String, Tensor>) -> Result<Self> {
        let mut pairs = Pairs::default();
        for (key, tensor) in tensors {
            if let Some(module) = key.strip_suffix(".lora_a") {
                pairs.a(module, tensor.t()?.contiguous()?);
            } else if let Some(module) = key.strip_suffix(".lora_b") {
                pairs.b(module, tensor.t()?.contiguous()?);
            }
        }
        Self::assemble(name.into(), config, pairs)
    }

    fn assemble(name: String, config: AdapterConfig, pairs: Pairs) -> Result<Self> {
        let mut layers = BTreeMap::new();
        for (module, (a, b)) in pairs.0 {
            if !config.targets.matches(&module) {
                continue;
            }
            let (a, b) = match (a, b) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(VlmError::InvalidConfig(format!(
                        "adapter layer {module} is missing a factor"
                    )))
                }
            };
            let adapter = LayerAdapter::new(a.to_dtype(DType::F32)?, b.to_dtype(DType::F32)?)
                .map_err(|e| match e {
                    VlmError::ShapeMismatch { expected, actual, .. } => VlmError::ShapeMismatch {
                        layer: module.clone(),
                        expected,
                        actual,
                    },
                    other => other,
                })?;
            layers.insert(module, adapter);
        }
        if layers.is_empty() {
            return Err(VlmError::InvalidConfig(format!("adapter {name} has no target layers")));
        }
        Ok(Self { name, config, layers })
    }

    pub fn scale(&self) -> f64 {
        self.config.scale()
    }
}

#[derive(Default)]
struct Pairs(BTreeMap<String, (Option<Tensor>, Option<Tensor>)>);

impl Pairs {
    fn a(&mut self, module: &str, t: Tensor) {
        self.0.entry(module.to_string()).or_default().0 = Some(t);
    }

    fn b(&mut self, module: &str, t: Tensor) {
        self.0.entry(module.to_string()).or_default().1 = Some(t);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::TargetMatcher;

    fn ones(shape: (usize, usize)) -> Tensor {
        Tensor::ones(shape, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_peft_keys() {
        let mut tensors = HashMap::new();
        tensors.insert("base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight".to_string(), ones((2, 8)));
        tensors.insert("base_model.model.model.layers.0.self_attn.q_proj.lora_B.default.weight".to_string(), ones((6, 2)));
        tensors.insert("base_model.model.model.layers.0.mlp.up_proj.lora_A.weight".to_string(), ones((2, 8)));
        tensors.insert("base_model.model.model.layers.0.mlp.up_proj.lora_B.weight".to_string(), ones((6, 2)));

        let config = AdapterConfig::new(2, 4.0).with_targets(TargetMatcher::suffixes(["q_proj"]));
        let weights = LoraWeights::from_peft_tensors("test", config, tensors).unwrap();
        assert_eq!(weights.layers.len(), 1);
        let layer = &weights.layers["model.layers.0.self_attn.q_proj"];
        assert_eq!((layer.rank(), layer.in_features(), layer.out_features()), (2, 8, 6));
    }

    #[test]
    fn test_mlx_keys_transposed() {
        let mut tensors = HashMap::new();
        tensors.insert("model.layers.1.self_attn.v_proj.lora_a".to_string(), ones((8, 4)));
        tensors.insert("model.layers.1.self_attn.v_proj.lora_b".to_string(), ones((4, 6)));
        let weights = LoraWeights::from_mlx_tensors("mlx", AdapterConfig::new(4, 4.0), tensors).unwrap();
        let layer = &weights.layers["model.layers.1.self_attn.v_proj"];
        assert_eq!(layer.a.dims(), &[4, 8]);
        assert_eq!(layer.b.dims(), &[6, 4]);
    }

    #[test]
    fn test_missing_factor() {
        let mut tensors = HashMap::new();
        tensors.insert("m.q_proj.lora_A.weight".to_string(), ones((2, 8)));
        let err = LoraWeights::from_peft_tensors("x", AdapterConfig::new(2, 2.0), tensors).unwrap_err();
        assert!(matches!(err, VlmError::InvalidConfig(_)));
    }

    #[test]
    fn test_rank_disagreement() {
        let mut tensors = HashMap::new();
        tensors.insert("m.q_proj.lora_A.weight".to_string(), ones((2, 8)));
        tensors.insert("m.q_proj.lora_B.weight".to_string(), ones((6, 3)));
        let err = LoraWeights::from_peft_tensors("x", AdapterConfig::new(2, 2.0), tensors).unwrap_err();
        match err {
            VlmError::ShapeMismatch { layer, .. } => assert_eq!(layer, "m.q_proj"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_load_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(PEFT_CONFIG),
            r#"{"r": 2, "lora_alpha": 2, "target_modules": ["o_proj"]}"#,
        )
        .unwrap();
        let mut tensors = HashMap::new();
        tensors.insert("base_model.model.layers.0.o_proj.lora_A.weight".to_string(), ones((2, 4)));
        tensors.insert("base_model.model.layers.0.o_proj.lora_B.weight".to_string(), ones((4, 2)));
        candle_core::safetensors::save(&tensors, dir.path().join(PEFT_WEIGHTS)).unwrap();

        let weights = LoraWeights::load(dir.path(), &Device::Cpu).unwrap();
        assert!(weights.layers.contains_key("layers.0.o_proj"));
        assert_eq!(weights.scale(), 1.0);
    }
}
