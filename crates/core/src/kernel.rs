//! Kernel storage: a trainable float variable, or int8 values plus a scale.

use parking_lot::Mutex;

use candle_core::{DType, Device, Tensor, Var};

use qdense_common::{QDenseError, Result};

use crate::plan::AxisPlan;
use crate::quantize::{abs_max_codes, dequantize, Int8Tensor};

/// The layer's kernel in one of its two representations.
pub enum KernelTensor {
    Float(Var),
    Int8(QuantizedKernel),
}

impl KernelTensor {
    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Int8(_))
    }

    pub fn dims(&self) -> &[usize] {
        match self {
            Self::Float(v) => v.dims(),
            Self::Int8(q) => q.values.dims(),
        }
    }

    /// Quantize a float kernel. An int8 kernel is an error, not a no-op.
    pub fn quantize(&self, plan: &AxisPlan) -> Result<QuantizedKernel> {
        match self {
            Self::Float(v) => QuantizedKernel::quantize(v.as_tensor(), plan),
            Self::Int8(_) => Err(QDenseError::AlreadyQuantized),
        }
    }
}

/// Int8 kernel values and their scale.
///
/// The scale is stored already rearranged into the output layout (see
/// [`crate::plan::OperandAxes::align`]), which is also how it is persisted.
/// The float carrier the contraction consumes is built per call unless
/// [`QuantizedKernel::cache_codes`] pins it until
/// [`QuantizedKernel::clear_cache`].
pub struct QuantizedKernel {
    values: Int8Tensor,
    scale: Tensor,
    /// Inference cache: `Some(codes)` only when set via `cache_codes`.
    cache: Mutex<Option<Tensor>>,
}

impl QuantizedKernel {
    pub fn new(values: Int8Tensor, scale: Tensor, plan: &AxisPlan) -> Result<Self> {
        if values.dims().len() != plan.weight.transpose.len() {
            return Err(QDenseError::ShapeMismatch(format!(
                "kernel values have rank {}, the equation's weight has rank {}",
                values.dims().len(),
                plan.weight.transpose.len()
            )));
        }
        let expected = plan.weight.scale_shape(values.dims());
        if scale.dims() != expected.as_slice() {
            return Err(QDenseError::ShapeMismatch(format!(
                "kernel scale has shape {:?}, kernel {:?} needs {:?}",
                scale.dims(),
                values.dims(),
                expected
            )));
        }
        Ok(Self {
            values,
            scale,
            cache: Mutex::new(None),
        })
    }

    /// Placeholder state for a layer built directly in int8: zero values and
    /// unit scale, meant to be overwritten by a load.
    pub fn zeros(kernel_shape: &[usize], plan: &AxisPlan, dtype: DType, device: &Device) -> Result<Self> {
        let scale = Tensor::ones(plan.weight.scale_shape(kernel_shape), dtype, device)?;
        Self::new(Int8Tensor::zeros(kernel_shape), scale, plan)
    }

    /// Abs-max quantize `kernel` over the axes the contraction reduces.
    pub fn quantize(kernel: &Tensor, plan: &AxisPlan) -> Result<Self> {
        let (codes, scale) = abs_max_codes(kernel, &plan.weight.reduced)?;
        let values = Int8Tensor::from_codes(&codes)?;
        let scale = plan.weight.align(&scale)?;
        Self::new(values, scale, plan)
    }

    pub fn values(&self) -> &Int8Tensor {
        &self.values
    }

    /// Scale in output layout.
    pub fn scale(&self) -> &Tensor {
        &self.scale
    }

    /// Float kernel reconstructed in the kernel's own layout.
    pub fn dequantize(&self, plan: &AxisPlan) -> Result<Tensor> {
        let scale = plan.weight.unalign(&self.scale)?;
        dequantize(&self.codes()?, &scale)
    }

    /// Integer values on an `F64` carrier, exact for any int8 contraction
    /// length this layer will see. Taken from the cache when one is pinned,
    /// otherwise built for this call only.
    pub fn codes(&self) -> Result<Tensor> {
        if let Some(ref codes) = *self.cache.lock() {
            return Ok(codes.clone());
        }
        self.values.to_tensor(DType::F64, self.scale.device())
    }

    /// Pin the `F64` carrier so repeated forwards skip rebuilding it. Costs
    /// eight bytes per kernel element until [`QuantizedKernel::clear_cache`].
    pub fn cache_codes(&self) -> Result<()> {
        let codes = self.values.to_tensor(DType::F64, self.scale.device())?;
        self.cache.lock().replace(codes);
        Ok(())
    }

    pub fn clear_cache(&self) {
        self.cache.lock().take();
    }

    pub fn is_cached(&self) -> bool {
        self.cache.lock().is_some()
    }

    /// Fold a float update into the kernel and requantize.
    ///
    /// Dequantize, add, quantize again: lossy, and the scale is recomputed
    /// from the merged values.
    pub fn merge(&self, delta: &Tensor, plan: &AxisPlan) -> Result<Self> {
        let merged = (self.dequantize(plan)? + delta.to_dtype(self.scale.dtype())?)?;
        tracing::info!(
            kernel = ?self.values.dims(),
            "requantizing kernel with merged adapter; this is lossy"
        );
        Self::quantize(&merged, plan)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn quantize_stores_aligned_scale() {
        let dev = Device::Cpu;
        let plan = AxisPlan::analyze("abc,cd->abd", 3).unwrap();
        let w = Tensor::randn(0f32, 1., (16, 8), &dev).unwrap();
        let q = QuantizedKernel::quantize(&w, &plan).unwrap();
        assert_eq!(q.values().dims(), &[16, 8]);
        assert_eq!(q.scale().dims(), &[1, 1, 8]);

        let back = q.dequantize(&plan).unwrap();
        assert_eq!(back.dims(), &[16, 8]);
        assert!(max_abs_diff(&back, &w) < 0.05);
    }

    #[test]
    fn codes_are_only_cached_on_request() {
        let dev = Device::Cpu;
        let plan = AxisPlan::analyze("ab,bc->ac", 2).unwrap();
        let w = Tensor::randn(0f32, 1., (4, 3), &dev).unwrap();
        let q = QuantizedKernel::quantize(&w, &plan).unwrap();
        let codes = q.codes().unwrap();
        assert_eq!(codes.dtype(), DType::F64);
        assert!(!q.is_cached());

        q.cache_codes().unwrap();
        assert!(q.is_cached());
        let cached: Vec<Vec<f64>> = q.codes().unwrap().to_vec2().unwrap();
        assert_eq!(cached, codes.to_vec2::<f64>().unwrap());
        q.clear_cache();
        assert!(!q.is_cached());
    }

    #[test]
    fn second_quantize_is_rejected() {
        let dev = Device::Cpu;
        let plan = AxisPlan::analyze("ab,bc->ac", 2).unwrap();
        let var = Var::randn(0f32, 1., (4, 3), &dev).unwrap();
        let kernel = KernelTensor::Float(var);
        let q = kernel.quantize(&plan).unwrap();
        let kernel = KernelTensor::Int8(q);
        assert!(kernel.is_quantized());
        assert!(matches!(kernel.quantize(&plan), Err(QDenseError::AlreadyQuantized)));
    }

    #[test]
    fn scale_shape_is_checked() {
        let dev = Device::Cpu;
        let plan = AxisPlan::analyze("ab,bc->ac", 2).unwrap();
        let scale = Tensor::ones((4, 1), DType::F32, &dev).unwrap();
        assert!(matches!(
            QuantizedKernel::new(Int8Tensor::zeros(&[4, 3]), scale, &plan),
            Err(QDenseError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn values_rank_is_checked() {
        let dev = Device::Cpu;
        let plan = AxisPlan::analyze("abc,cd->abd", 3).unwrap();
        let scale = Tensor::ones((1, 1, 3), DType::F32, &dev).unwrap();
        assert!(matches!(
            QuantizedKernel::new(Int8Tensor::zeros(&[4]), scale, &plan),
            Err(QDenseError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn merge_adds_delta_before_requantizing() {
        let dev = Device::Cpu;
        let plan = AxisPlan::analyze("ab,bc->ac", 2).unwrap();
        let w = Tensor::randn(0f32, 1., (8, 4), &dev).unwrap();
        let delta = Tensor::randn(0f32, 0.5, (8, 4), &dev).unwrap();
        let q = QuantizedKernel::quantize(&w, &plan).unwrap();
        let merged = q.merge(&delta, &plan).unwrap();
        let expected = (&w + &delta).unwrap();
        assert!(max_abs_diff(&merged.dequantize(&plan).unwrap(), &expected) < 0.1);
    }

    #[test]
    fn zeros_has_unit_scale() {
        let plan = AxisPlan::analyze("abc,cd->abd", 3).unwrap();
        let q = QuantizedKernel::zeros(&[6, 5], &plan, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(q.scale().dims(), &[1, 1, 5]);
        assert!(q.values().as_slice().iter().all(|&v| v == 0));
    }
}
