use super::weights::LayerAdapter;
use crate::core::{Result, VlmError};
use candle_core::quantized::{GgmlDType, QMatMul, QTensor};
use candle_core::{Module, Tensor};
use candle_nn::Linear;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

enum Base {
    Dense(Linear),
    Quantized {
        weight: Arc<QTensor>,
        matmul: QMatMul,
        bias: Option<Tensor>,
    },
}

struct Registered {
    adapter: LayerAdapter,
    scale: f64,
}

/// Linear layer with optional low-rank adapters.
///
/// ```text
/// y = base(x) + scale * (x @ A^T @ B^T)
/// ```
///
/// Several adapters can be registered; at most one is active. Fusing folds
/// an adapter into the base weight and cannot be undone.
pub struct LoraLinear {
    name: String,
    base: Base,
    out_features: usize,
    in_features: usize,
    adapters: BTreeMap<String, Registered>,
    active: Option<String>,
}

impl LoraLinear {
    /// `weight` is `[out, in]`.
    pub fn dense(name: impl Into<String>, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let (out_features, in_features) = weight.dims2()?;
        Ok(Self {
            name: name.into(),
            base: Base::Dense(Linear::new(weight, bias)),
            out_features,
            in_features,
            adapters: BTreeMap::new(),
            active: None,
        })
    }

    pub fn quantized(name: impl Into<String>, weight: Arc<QTensor>, bias: Option<Tensor>) -> Result<Self> {
        let (out_features, in_features) = weight.shape().dims2()?;
        let matmul = QMatMul::from_arc(weight.clone())?;
        Ok(Self {
            name: name.into(),
            base: Base::Quantized { weight, matmul, bias },
            out_features,
            in_features,
            adapters: BTreeMap::new(),
            active: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self.base, Base::Quantized { .. })
    }

    pub fn quantized_dtype(&self) -> Option<GgmlDType> {
        match &self.base {
            Base::Quantized { weight, .. } => Some(weight.dtype()),
            Base::Dense(_) => None,
        }
    }

    pub fn active_adapter(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn adapter_names(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }

    pub fn has_adapter(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Fails with `ShapeMismatch` unless B·A has this layer's `[out, in]` shape.
    pub fn check_shape(&self, adapter: &LayerAdapter) -> Result<()> {
        let actual = [adapter.out_features(), adapter.in_features()];
        if actual != [self.out_features, self.in_features] {
            return Err(VlmError::ShapeMismatch {
                layer: self.name.clone(),
                expected: vec![self.out_features, self.in_features],
                actual: actual.to_vec(),
            });
        }
        Ok(())
    }

    pub fn add_adapter(&mut self, name: impl Into<String>, adapter: LayerAdapter, scale: f64) -> Result<()> {
        self.check_shape(&adapter)?;
        self.adapters.insert(name.into(), Registered { adapter, scale });
        Ok(())
    }

    pub fn remove_adapter(&mut self, name: &str) -> bool {
        if self.active.as_deref() == Some(name) {
            self.active = None;
        }
        self.adapters.remove(name).is_some()
    }

    pub fn set_active(&mut self, name: Option<&str>) -> Result<()> {
        match name {
            Some(n) if !self.adapters.contains_key(n) => Err(VlmError::InvalidConfig(format!(
                "adapter {n} is not registered on {}",
                self.name
            ))),
            _ => {
                self.active = name.map(str::to_string);
                Ok(())
            }
        }
    }

    /// Folds `scale * B·A` into the base weight. A quantized base is
    /// dequantized one layer at a time and re-quantized to its original type.
    pub fn fuse(&mut self, adapter: &LayerAdapter, scale: f64) -> Result<()> {
        self.check_shape(adapter)?;
        self.base = match &self.base {
            Base::Dense(linear) => {
                let weight = linear.weight();
                let delta = adapter.delta(scale)?.to_dtype(weight.dtype())?;
                Base::Dense(Linear::new((weight + delta)?, linear.bias().cloned()))
            }
            Base::Quantized { weight, bias, .. } => {
                let dtype = weight.dtype();
                let device = adapter.a.device();
                let fused = {
                    let scratch = weight.dequantize(device)?;
                    let delta = adapter.delta(scale)?.to_dtype(scratch.dtype())?;
                    (scratch + delta)?
                };
                let requantized = Arc::new(QTensor::quantize(&fused, dtype)?);
                drop(fused);
                let matmul = QMatMul::from_arc(requantized.clone())?;
                Base::Quantized {
                    weight: requantized,
                    matmul,
                    bias: bias.clone(),
                }
            }
        };
        debug!(layer = %self.name, quantized = self.is_quantized(), "fused adapter");
        Ok(())
    }

    /// Dense copy of the current base weight. Only for inspection.
    pub fn weight(&self) -> Result<Tensor> {
        match &self.base {
            Base::Dense(linear) => Ok(linear.weight().clone()),
            Base::Quantized { weight, .. } => Ok(weight.dequantize(&candle_core::Device::Cpu)?),
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = match &self.base {
            Base::Dense(linear) => linear.forward(x)?,
            Base::Quantized { matmul, bias, .. } => {
                let y = matmul.forward(x)?;
                match bias {
                    Some(b) => y.broadcast_add(b)?,
                    None => y,
                }
            }
        };
        let Some(registered) = self.active.as_ref().and_then(|n| self.adapters.get(n)) else {
            return Ok(y);
        };
        let lora = low_rank(x, &registered.adapter, registered.scale)?;
        Ok((y + lora.to_dtype(y.dtype())?)?)
    }
}

fn low_rank(x: &Tensor, adapter: &LayerAdapter, scale: f64) -> Result<Tensor> {
    let dims = x.dims();
    let features = dims[dims.len() - 1];
    let rows = x.elem_count() / features.max(1);
    let x2 = x.reshape((rows, features))?.to_dtype(adapter.a.dtype())?;
    let out = x2
        .matmul(&adapter.a.t()?)?
        .matmul(&adapter.b.t()?)?
        .affine(scale, 0.0)?;
    let mut shape = dims.to_vec();
    let last = shape.len() - 1;
    shape[last] = adapter.out_features();
    Ok(out.reshape(shape)?)
}

impl std::fmt::Debug for LoraLinear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoraLinear")
            .field("name", &self.name)
            .field("shape", &(self.out_features, self.in_features))
            .field("quantized", &self.quantized_dtype())
            .field("adapters", &self.adapter_names())
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn ramp(rows: usize, cols: usize, step: f32) -> Tensor {
        let data: Vec<f32> = (0..rows * cols).map(|i| ((i % 7) as f32 - 3.0) * step).collect();
        Tensor::from_vec(data, (rows, cols), &Device::Cpu).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b).unwrap().abs().unwrap().flatten_all().unwrap().max(0).unwrap().to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_fused_matches_dynamic_dense() {
        let weight = ramp(4, 3, 0.5);
        let adapter = LayerAdapter::new(ramp(2, 3, 0.1), ramp(4, 2, 0.2)).unwrap();
        let x = ramp(5, 3, 0.3);

        let mut dynamic = LoraLinear::dense("o_proj", weight.clone(), None).unwrap();
        dynamic.add_adapter("a", adapter.clone(), 2.0).unwrap();
        dynamic.set_active(Some("a")).unwrap();

        let mut fused = LoraLinear::dense("o_proj", weight, None).unwrap();
        fused.fuse(&adapter, 2.0).unwrap();

        let y_dynamic = dynamic.forward(&x).unwrap();
        let y_fused = fused.forward(&x).unwrap();
        assert!(max_abs_diff(&y_dynamic, &y_fused) < 1e-5);
    }

    #[test]
    fn test_dynamic_keeps_base_weight() {
        let weight = ramp(4, 3, 0.5);
        let adapter = LayerAdapter::new(ramp(2, 3, 0.1), ramp(4, 2, 0.2)).unwrap();
        let x = ramp(2, 3, 0.3);
        let mut layer = LoraLinear::dense("o_proj", weight.clone(), None).unwrap();
        let base = layer.forward(&x).unwrap();

        layer.add_adapter("a", adapter, 1.0).unwrap();
        layer.set_active(Some("a")).unwrap();
        assert!(max_abs_diff(&layer.forward(&x).unwrap(), &base) > 1e-3);

        layer.set_active(None).unwrap();
        assert!(max_abs_diff(&layer.forward(&x).unwrap(), &base) < 1e-6);
        assert!(max_abs_diff(&layer.weight().unwrap(), &weight) < 1e-6);
    }

    #[test]
    fn test_shape_mismatch() {
        let mut layer = LoraLinear::dense("q_proj", ramp(4, 3, 0.5), None).unwrap();
        let adapter = LayerAdapter::new(ramp(2, 5, 0.1), ramp(4, 2, 0.2)).unwrap();
        let err = layer.add_adapter("a", adapter.clone(), 1.0).unwrap_err();
        match err {
            VlmError::ShapeMismatch { layer, expected, actual } => {
                assert_eq!(layer, "q_proj");
                assert_eq!(expected, vec![4, 3]);
                assert_eq!(actual, vec![4, 5]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(layer.fuse(&adapter, 1.0).is_err());
    }

    #[test]
    fn test_unknown_active_adapter() {
        let mut layer = LoraLinear::dense("q_proj", ramp(4, 3, 0.5), None).unwrap();
        assert!(layer.set_active(Some("missing")).is_err());
    }

    #[test]
    fn test_quantized_fuse_stays_quantized() {
        let weight = ramp(32, 64, 0.05);
        let q = QTensor::quantize(&weight, GgmlDType::Q8_0).unwrap();
        let adapter = LayerAdapter::new(ramp(4, 64, 0.01), ramp(32, 4, 0.01)).unwrap();
        let x = ramp(3, 64, 0.02);

        let mut dynamic = LoraLinear::quantized("mlp.up_proj", Arc::new(q), None).unwrap();
        dynamic.add_adapter("a", adapter.clone(), 1.0).unwrap();
        dynamic.set_active(Some("a")).unwrap();

        let q = QTensor::quantize(&weight, GgmlDType::Q8_0).unwrap();
        let mut fused = LoraLinear::quantized("mlp.up_proj", Arc::new(q), None).unwrap();
        fused.fuse(&adapter, 1.0).unwrap();

        assert_eq!(fused.quantized_dtype(), Some(GgmlDType::Q8_0));
        let y_dynamic = dynamic.forward(&x).unwrap();
        let y_fused = fused.forward(&x).unwrap();
        assert_eq!(y_fused.dtype(), DType::F32);
        assert!(max_abs_diff(&y_dynamic, &y_fused) < 0.05);
    }
}
