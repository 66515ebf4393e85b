//! Low-rank adapters applied onto a loaded model's linear layers.
//!
//! `Fused` folds the delta into the base weight once. `Dynamic` registers
//! the factors beside the base weight and adds their contribution on every
//! forward call, so adapters can be swapped without reloading.

pub mod config;
pub mod linear;
pub mod weights;

pub use config::{AdapterConfig, TargetMatcher};
pub use linear::LoraLinear;
pub use weights::{LayerAdapter, LoraWeights};

use crate::core::{Result, VisionLanguageModel, VlmError};
use config::is_dotted_suffix;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoraMode {
    Fused,
    #[default]
    Dynamic,
}

impl FromStr for LoraMode {
    type Err = VlmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fused" | "fuse" => Ok(LoraMode::Fused),
            "dynamic" => Ok(LoraMode::Dynamic),
            other => Err(VlmError::InvalidConfig(format!("unknown adapter mode: {other}"))),
        }
    }
}

/// Finds the adapter layer for a model module. Checkpoint prefixes differ
/// between exporters, so either name may be a dotted suffix of the other.
fn find_layer<'a>(weights: &'a LoraWeights, module: &str) -> Option<&'a LayerAdapter> {
    weights.layers.get(module).or_else(|| {
        weights
            .layers
            .iter()
            .find(|(key, _)| is_dotted_suffix(module, key) || is_dotted_suffix(key, module))
            .map(|(_, layer)| layer)
    })
}

/// Applies `weights` onto the model's adapter targets and returns the
/// patched module names. Shapes are checked on every layer before any
/// layer is touched, so a mismatch leaves the model unchanged.
pub fn apply(model: &mut dyn VisionLanguageModel, weights: &LoraWeights, mode: LoraMode) -> Result<Vec<String>> {
    let scale = weights.scale();
    let mut targets = model.lora_targets();

    let mut matched = Vec::new();
    for (i, (module, linear)) in targets.iter().enumerate() {
        if let Some(layer) = find_layer(weights, module) {
            linear.check_shape(layer)?;
            matched.push((i, layer));
        }
    }
    if matched.is_empty() {
        return Err(VlmError::InvalidConfig(format!(
            "adapter {} matches none of {} target layers",
            weights.name,
            targets.len()
        )));
    }

    let mut patched = Vec::with_capacity(matched.len());
    for (i, layer) in matched {
        let (module, linear) = &mut targets[i];
        match mode {
            LoraMode::Fused => linear.fuse(layer, scale)?,
            LoraMode::Dynamic => {
                linear.add_adapter(weights.name.clone(), layer.clone(), scale)?;
                linear.set_active(Some(&weights.name))?;
            }
        }
        patched.push(module.clone());
    }
    info!(adapter = %weights.name, ?mode, layers = patched.len(), scale, "applied adapter");
    Ok(patched)
}

/// Switches every layer that carries `name` to it, or disables dynamic
/// adapters with `None`. Returns the number of layers switched.
pub fn set_active_adapter(model: &mut dyn VisionLanguageModel, name: Option<&str>) -> Result<usize> {
    let mut switched = 0;
    for (_, linear) in model.lora_targets() {
        match name {
            Some(n) if linear.has_adapter(n) => {
                linear.set_active(Some(n))?;
                switched += 1;
            }
            Some(_) => linear.set_active(None)?,
            None => {
                linear.set_active(None)?;
                switched += 1;
            }
        }
    }
    if let (Some(n), 0) = (name, switched) {
        return Err(VlmError::InvalidConfig(format!("adapter {n} is not loaded")));
    }
    Ok(switched)
}
