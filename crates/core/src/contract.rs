//! Int8 einsum with a hand-written input gradient.
//!
//! ```text
//! forward:  y  = einsum(eq, q(x), Wq) / (align(s_x) · s_w)
//! backward: dx = einsum(reciprocal_eq, dy, dequantize(Wq, s_w))
//! ```
//!
//! The rounding in `q(x)` has zero derivative almost everywhere, so candle's
//! autodiff cannot be used directly. [`QuantizedEinsum`] is registered as a
//! [`CustomOp1`] over the input; the kernel and its scale are captured
//! constants and never receive a gradient.

use std::sync::Arc;

use candle_core::{CpuStorage, CustomOp1, DType, Device, DeviceLocation, Layout, Shape, Tensor};

use qdense_common::{QDenseError, Result};

use crate::einsum::einsum;
use crate::kernel::QuantizedKernel;
use crate::plan::AxisPlan;
use crate::quantize::{abs_max_codes, dequantize};

/// Forward/backward pair for one quantized contraction.
#[derive(Clone)]
pub struct QuantizedEinsum {
    plan: Arc<AxisPlan>,
    /// Kernel values on an `F64` carrier.
    kernel_codes: Tensor,
    /// Kernel scale in output layout.
    kernel_scale: Tensor,
}

impl QuantizedEinsum {
    pub fn new(plan: Arc<AxisPlan>, kernel: &QuantizedKernel) -> Result<Self> {
        Ok(Self {
            plan,
            kernel_codes: kernel.codes()?,
            kernel_scale: kernel.scale().clone(),
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let plan = &self.plan;
        let (x_codes, x_scale) = abs_max_codes(x, &plan.input.reduced)?;
        let acc = einsum(
            &plan.equation(),
            &x_codes.to_dtype(DType::F64)?,
            &self.kernel_codes,
        )?;
        let descale = plan
            .input
            .align(&x_scale)?
            .broadcast_mul(&self.kernel_scale.to_dtype(x.dtype())?)?;
        Ok(acc.to_dtype(x.dtype())?.broadcast_div(&descale)?)
    }

    /// Input gradient for an upstream gradient `grad` of the output.
    pub fn backward(&self, x: &Tensor, grad: &Tensor) -> Result<Tensor> {
        let plan = &self.plan;
        let kernel_scale = plan.weight.unalign(&self.kernel_scale)?;
        let kernel = dequantize(&self.kernel_codes, &kernel_scale)?.to_dtype(grad.dtype())?;

        // Input labels that reach neither the output nor the weight were
        // summed away; their gradient is the same along the whole axis.
        let kept: String = plan
            .input_spec
            .chars()
            .filter(|&c| plan.output_spec.contains(c) || plan.weight_spec.contains(c))
            .collect();
        if kept.len() == plan.input_spec.len() {
            return einsum(&plan.reciprocal_equation, grad, &kernel);
        }
        let equation = format!("{},{}->{}", plan.output_spec, plan.weight_spec, kept);
        let mut dx = einsum(&equation, grad, &kernel)?;
        for (axis, label) in plan.input_spec.chars().enumerate() {
            if !kept.contains(label) {
                dx = dx.unsqueeze(axis)?;
            }
        }
        Ok(dx.broadcast_as(x.shape())?.contiguous()?)
    }
}

fn host_tensor(storage: &CpuStorage, layout: &Layout) -> candle_core::Result<Tensor> {
    let (start, end) = layout
        .contiguous_offsets()
        .ok_or_else(|| candle_core::Error::Msg("quantized einsum needs a contiguous input".into()))?;
    match storage {
        CpuStorage::F32(data) => {
            Tensor::from_slice(&data[start..end], layout.shape().clone(), &Device::Cpu)
        }
        CpuStorage::F64(data) => {
            Tensor::from_slice(&data[start..end], layout.shape().clone(), &Device::Cpu)
        }
        _ => candle_core::bail!("quantized einsum supports f32 and f64 inputs only"),
    }
}

impl CustomOp1 for QuantizedEinsum {
    fn name(&self) -> &'static str {
        "quantized-einsum"
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> candle_core::Result<(CpuStorage, Shape)> {
        let x = host_tensor(storage, layout)?;
        let y = self.forward(&x).map_err(QDenseError::into_candle)?;
        let shape = y.shape().clone();
        let flat = y.flatten_all()?;
        let out = match y.dtype() {
            DType::F32 => CpuStorage::F32(flat.to_vec1()?),
            DType::F64 => CpuStorage::F64(flat.to_vec1()?),
            dtype => candle_core::bail!("unexpected quantized einsum output dtype {dtype:?}"),
        };
        Ok((out, shape))
    }

    fn bwd(&self, arg: &Tensor, _res: &Tensor, grad_res: &Tensor) -> candle_core::Result<Option<Tensor>> {
        let dx = self.backward(arg, grad_res).map_err(QDenseError::into_candle)?;
        Ok(Some(dx))
    }
}

/// [`QuantizedEinsum`] only has a host kernel.
pub fn check_device(location: DeviceLocation) -> Result<()> {
    match location {
        DeviceLocation::Cpu => Ok(()),
        other => Err(QDenseError::UnsupportedDevice(format!(
            "{other:?}; the quantized contraction runs on the CPU only"
        ))),
    }
}

/// Quantize `x` on the fly and contract it with an int8 kernel.
pub fn quantized_contract(x: &Tensor, kernel: &QuantizedKernel, plan: &Arc<AxisPlan>) -> Result<Tensor> {
    check_device(x.device().location())?;
    if x.rank() != plan.input_spec.len() {
        return Err(QDenseError::ShapeMismatch(format!(
            "input of shape {:?} does not match input spec '{}'",
            x.dims(),
            plan.input_spec
        )));
    }
    let op = QuantizedEinsum::new(Arc::clone(plan), kernel)?;
    Ok(x.contiguous()?.apply_op1(op)?)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Var;

    fn rel_err(a: &Tensor, b: &Tensor) -> f32 {
        let num: f32 = (a - b).unwrap().sqr().unwrap().sum_all().unwrap().to_scalar().unwrap();
        let den: f32 = b.sqr().unwrap().sum_all().unwrap().to_scalar().unwrap();
        (num / den.max(1e-12)).sqrt()
    }

    fn setup(equation: &str, x_shape: &[usize], w_shape: &[usize]) -> (Arc<AxisPlan>, Tensor, Tensor, QuantizedKernel) {
        let dev = Device::Cpu;
        let plan = Arc::new(AxisPlan::analyze(equation, x_shape.len()).unwrap());
        let x = Tensor::randn(0f32, 1., x_shape, &dev).unwrap();
        let w = Tensor::randn(0f32, 1., w_shape, &dev).unwrap();
        let kernel = QuantizedKernel::quantize(&w, &plan).unwrap();
        (plan, x, w, kernel)
    }

    #[test]
    fn dense_contraction_tracks_float() {
        let (plan, x, w, kernel) = setup("ab,bc->ac", &[8, 32], &[32, 16]);
        let y = quantized_contract(&x, &kernel, &plan).unwrap();
        let expected = x.matmul(&w).unwrap();
        assert_eq!(y.dims(), &[8, 16]);
        assert!(rel_err(&y, &expected) < 2e-2);
    }

    #[test]
    fn sequence_contraction_tracks_float() {
        let (plan, x, w, kernel) = setup("abc,cd->abd", &[2, 5, 24], &[24, 12]);
        let y = quantized_contract(&x, &kernel, &plan).unwrap();
        let expected = einsum("abc,cd->abd", &x, &w).unwrap();
        assert_eq!(y.dims(), &[2, 5, 12]);
        assert!(rel_err(&y, &expected) < 2e-2);
    }

    #[test]
    fn overflow_on_both_operands_descales_correctly() {
        let (plan, x, w, kernel) = setup("abc,bcd->ad", &[5, 3, 4], &[3, 4, 7]);
        let y = quantized_contract(&x, &kernel, &plan).unwrap();
        let expected = einsum("abc,bcd->ad", &x, &w).unwrap();
        assert_eq!(y.dims(), &[5, 7]);
        assert!(rel_err(&y, &expected) < 2e-2);
    }

    #[test]
    fn f64_input_stays_f64() {
        let dev = Device::Cpu;
        let plan = Arc::new(AxisPlan::analyze("ab,bc->ac", 2).unwrap());
        let w = Tensor::randn(0f64, 1., (6, 3), &dev).unwrap();
        let kernel = QuantizedKernel::quantize(&w, &plan).unwrap();
        let x = Tensor::randn(0f64, 1., (4, 6), &dev).unwrap();
        let y = quantized_contract(&x, &kernel, &plan).unwrap();
        assert_eq!(y.dtype(), DType::F64);
    }

    #[test]
    fn input_gradient_uses_dequantized_kernel() {
        let (plan, x, _w, kernel) = setup("abc,cd->abd", &[2, 3, 8], &[8, 5]);
        let x = Var::from_tensor(&x).unwrap();
        let upstream = Tensor::randn(0f32, 1., (2, 3, 5), &Device::Cpu).unwrap();

        let y = quantized_contract(x.as_tensor(), &kernel, &plan).unwrap();
        let loss = (y * &upstream).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        let dx = grads.get(x.as_tensor()).unwrap();

        let deq = kernel.dequantize(&plan).unwrap();
        let expected = einsum(&plan.reciprocal_equation, &upstream, &deq).unwrap();
        assert_eq!(dx.dims(), &[2, 3, 8]);
        assert!(rel_err(dx, &expected) < 1e-5);
    }

    #[test]
    fn gradient_broadcasts_over_summed_input_axes() {
        // `b` reaches neither the output nor the weight.
        let (plan, x, _w, kernel) = setup("abc,cd->ad", &[2, 3, 4], &[4, 5]);
        let x = Var::from_tensor(&x).unwrap();
        let y = quantized_contract(x.as_tensor(), &kernel, &plan).unwrap();
        let grads = y.sum_all().unwrap().backward().unwrap();
        let dx = grads.get(x.as_tensor()).unwrap();
        assert_eq!(dx.dims(), &[2, 3, 4]);

        let rows: Vec<Vec<Vec<f32>>> = dx.to_vec3().unwrap();
        for batch in rows {
            assert_eq!(batch[0], batch[1]);
            assert_eq!(batch[1], batch[2]);
        }
    }

    /// `<einsum(eq, x, w), g> == <x, einsum(reciprocal, g, w)>` for random
    /// tensors: the reciprocal equation is the adjoint of the forward one.
    #[test]
    fn reciprocal_equation_is_the_adjoint() {
        let dev = Device::Cpu;
        for (eq, xs, ws) in [
            ("ab,bc->ac", vec![4, 6], vec![6, 3]),
            ("abc,cd->abd", vec![2, 3, 4], vec![4, 5]),
            ("abc,cde->abde", vec![2, 3, 4], vec![4, 2, 3]),
            ("abcd,cde->abe", vec![2, 3, 4, 5], vec![4, 5, 6]),
            ("ab,bcd->acd", vec![3, 4], vec![4, 2, 5]),
        ] {
            let plan = AxisPlan::analyze(eq, xs.len()).unwrap();
            let x = Tensor::randn(0f64, 1., xs.as_slice(), &dev).unwrap();
            let w = Tensor::randn(0f64, 1., ws.as_slice(), &dev).unwrap();
            let y = einsum(eq, &x, &w).unwrap();
            let g = Tensor::randn(0f64, 1., y.dims(), &dev).unwrap();
            let lhs: f64 = (&y * &g).unwrap().sum_all().unwrap().to_scalar().unwrap();
            let dx = einsum(&plan.reciprocal_equation, &g, &w).unwrap();
            let rhs: f64 = (&x * &dx).unwrap().sum_all().unwrap().to_scalar().unwrap();
            assert!((lhs - rhs).abs() < 1e-9 * lhs.abs().max(1.0), "{eq}");
        }
    }

    #[test]
    fn only_the_cpu_is_supported() {
        assert!(check_device(DeviceLocation::Cpu).is_ok());
        for location in [
            DeviceLocation::Cuda { gpu_id: 0 },
            DeviceLocation::Metal { gpu_id: 1 },
        ] {
            assert!(matches!(
                check_device(location),
                Err(QDenseError::UnsupportedDevice(_))
            ));
        }
    }

    #[test]
    fn wrong_rank_is_rejected() {
        let (plan, _x, _w, kernel) = setup("ab,bc->ac", &[2, 3], &[3, 4]);
        let x = Tensor::zeros((2, 2, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            quantized_contract(&x, &kernel, &plan),
            Err(QDenseError::ShapeMismatch(_))
        ));
    }
}
