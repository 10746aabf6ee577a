//! `EinsumDense`: a dense layer whose contraction is an einsum equation.
//!
//! ```text
//! y = activation( einsum(equation, x, W) + bias )
//! ```
//!
//! The kernel starts as a trainable float variable. [`EinsumDense::quantize`]
//! swaps it, once, for int8 values plus a scale, after which the forward pass
//! quantizes the input on the fly and runs [`quantized_contract`]. A LoRA
//! adapter can sit on top of either representation; it always runs in float.
//!
//! # Thread safety
//!
//! The int8 code cache lives behind a [`parking_lot::Mutex`], so the layer is
//! `Send + Sync`. It stays empty unless [`EinsumDense::cache_quantized`] is
//! called.
//!
//! # Devices
//!
//! Int8 layers run on the CPU only; a quantized build or `quantize` on any
//! other device fails with [`QDenseError::UnsupportedDevice`]. `quantize`, `enable_lora` and `load_own_variables` take
//! `&mut self`.

use std::sync::Arc;

use candle_core::{DType, Device, Module, Tensor, Var};

use qdense_common::{EinsumDenseConfig, QDenseError, QuantizationMode, Result};

use crate::activation;
use crate::contract::{check_device, quantized_contract};
use crate::einsum::einsum;
use crate::equation::{analyze_shapes, EinsumShapes, ParsedEquation};
use crate::init::variable;
use crate::kernel::{KernelTensor, QuantizedKernel};
use crate::lora::LoraAdapter;
use crate::plan::AxisPlan;
use crate::quantize::Int8Tensor;
use crate::store::{WeightStore, BIAS_KEY, KERNEL_KEY, KERNEL_SCALE_KEY};

pub struct EinsumDense {
    config: EinsumDenseConfig,
    equation: ParsedEquation,
    input_shape: Vec<usize>,
    shapes: EinsumShapes,
    plan: Arc<AxisPlan>,
    kernel: KernelTensor,
    bias: Option<Var>,
    lora: Option<LoraAdapter>,
    device: Device,
}

impl EinsumDense {
    /// Build the layer for inputs of `input_shape` (batch dimension first).
    ///
    /// Under a quantized dtype policy the kernel is created directly as int8
    /// zeros with a unit scale, ready for [`EinsumDense::load_own_variables`].
    pub fn new(config: EinsumDenseConfig, input_shape: &[usize], device: &Device) -> Result<Self> {
        let equation = ParsedEquation::parse(&config.equation)?;
        let known: Vec<Option<usize>> = input_shape.iter().map(|&d| Some(d)).collect();
        let shapes = analyze_shapes(
            &equation,
            config.bias_axes.as_deref(),
            &known,
            &config.output_shape.dims(),
        )?;
        let plan = Arc::new(AxisPlan::from_parsed(&equation, input_shape.len())?);
        let dtype = config.dtype.compute_dtype();

        let kernel = match config.dtype.quantization_mode() {
            Some(QuantizationMode::Int8) => {
                check_device(device.location())?;
                KernelTensor::Int8(QuantizedKernel::zeros(
                    &shapes.kernel_shape,
                    &plan,
                    dtype,
                    device,
                )?)
            }
            None => KernelTensor::Float(variable(
                config.kernel_initializer,
                &shapes.kernel_shape,
                dtype,
                device,
            )?),
        };
        let bias = shapes
            .bias_shape
            .as_ref()
            .map(|shape| variable(config.bias_initializer, shape, dtype, device))
            .transpose()?;

        tracing::debug!(
            equation = %config.equation,
            policy = %config.dtype,
            kernel = ?shapes.kernel_shape,
            bias = ?shapes.bias_shape,
            output = ?shapes.output_shape,
            "built einsum dense layer"
        );

        let mut config = config;
        // A zero rank in a config means no adapter.
        let lora_rank = config.lora_rank.take().filter(|&rank| rank > 0);
        let mut layer = Self {
            config,
            equation,
            input_shape: input_shape.to_vec(),
            shapes,
            plan,
            kernel,
            bias,
            lora: None,
            device: device.clone(),
        };
        if let Some(rank) = lora_rank {
            layer.enable_lora(rank)?;
        }
        Ok(layer)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        if x.rank() != self.input_shape.len() {
            return Err(QDenseError::ShapeMismatch(format!(
                "layer built for inputs of rank {} ({:?}), got shape {:?}",
                self.input_shape.len(),
                self.input_shape,
                x.dims()
            )));
        }
        let x = x.to_dtype(self.compute_dtype())?;
        let equation = self.plan.equation();

        let mut y = match &self.kernel {
            KernelTensor::Float(w) => {
                let w = match &self.lora {
                    Some(lora) => (w.as_tensor() + lora.delta()?)?,
                    None => w.as_tensor().clone(),
                };
                einsum(&equation, &x, &w)?
            }
            KernelTensor::Int8(q) => {
                let y = quantized_contract(&x, q, &self.plan)?;
                match &self.lora {
                    Some(lora) => (y + einsum(&equation, &x, &lora.delta()?)?)?,
                    None => y,
                }
            }
        };
        if let Some(bias) = &self.bias {
            y = y.broadcast_add(bias.as_tensor())?;
        }
        activation::apply(self.config.activation, &y)
    }

    /// The effective float kernel: dense or dequantized, plus the adapter.
    pub fn kernel(&self) -> Result<Tensor> {
        let base = match &self.kernel {
            KernelTensor::Float(w) => w.as_tensor().clone(),
            KernelTensor::Int8(q) => q.dequantize(&self.plan)?,
        };
        match &self.lora {
            Some(lora) => Ok((base + lora.delta()?)?),
            None => Ok(base),
        }
    }

    // ── One-way transitions ─────────────────────────────────────────────────

    /// Attach a rank-`rank` adapter and freeze the base kernel.
    pub fn enable_lora(&mut self, rank: usize) -> Result<()> {
        if self.lora.is_some() {
            return Err(QDenseError::LoraAlreadyEnabled);
        }
        let lora = LoraAdapter::new(self.kernel.dims(), rank, self.compute_dtype(), &self.device)?;
        tracing::info!(rank, kernel = ?self.kernel.dims(), "enabled LoRA adapter");
        self.lora = Some(lora);
        self.config.lora_rank = Some(rank);
        Ok(())
    }

    /// Replace the float kernel with its int8 quantization.
    ///
    /// Quantizes the base kernel only; an enabled adapter stays separate.
    /// Fails with [`QDenseError::AlreadyQuantized`] on an int8 layer, leaving
    /// it untouched.
    pub fn quantize(&mut self, mode: QuantizationMode) -> Result<()> {
        check_device(self.device.location())?;
        let quantized = match mode {
            QuantizationMode::Int8 => self.kernel.quantize(&self.plan)?,
        };
        self.kernel = KernelTensor::Int8(quantized);
        self.config.dtype = self.config.dtype.quantized(mode);
        tracing::info!(
            equation = %self.config.equation,
            policy = %self.config.dtype,
            input_reduced = ?self.plan.input.reduced,
            kernel_reduced = ?self.plan.weight.reduced,
            "quantized kernel"
        );
        Ok(())
    }

    /// Pin the int8 kernel's float carrier for repeated inference. A no-op
    /// on a float layer.
    pub fn cache_quantized(&self) -> Result<()> {
        if let KernelTensor::Int8(q) = &self.kernel {
            q.cache_codes()?;
        }
        Ok(())
    }

    /// Clear the inference cache (call before training resumes).
    pub fn clear_cache(&self) {
        if let KernelTensor::Int8(q) = &self.kernel {
            q.clear_cache();
        }
    }

    /// Variables an optimizer may update.
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = Vec::new();
        if let (KernelTensor::Float(w), None) = (&self.kernel, &self.lora) {
            vars.push(w.clone());
        }
        if let Some(bias) = &self.bias {
            vars.push(bias.clone());
        }
        if let Some(lora) = &self.lora {
            vars.extend(lora.vars());
        }
        vars
    }

    // ── Persistence ─────────────────────────────────────────────────────────

    /// Write `"0"` kernel, `"1"` bias and, when int8, `"2"` kernel scale.
    ///
    /// Variables are snapshotted, not aliased. An adapter is merged into the
    /// saved kernel; for an int8 kernel this dequantizes, adds and
    /// requantizes, which loses precision.
    pub fn save_own_variables(&self, store: &mut impl WeightStore) -> Result<()> {
        match &self.kernel {
            KernelTensor::Float(w) => {
                let kernel = match &self.lora {
                    Some(lora) => (w.as_tensor() + lora.delta()?)?,
                    None => w.as_tensor().copy()?,
                };
                store.put(KERNEL_KEY, kernel);
            }
            KernelTensor::Int8(q) => {
                let merged;
                let q = match &self.lora {
                    Some(lora) => {
                        merged = q.merge(&lora.delta()?, &self.plan)?;
                        &merged
                    }
                    None => q,
                };
                store.put(KERNEL_KEY, q.values().to_storage(&self.device)?);
                store.put(KERNEL_SCALE_KEY, q.scale().clone());
            }
        }
        if let Some(bias) = &self.bias {
            store.put(BIAS_KEY, bias.as_tensor().copy()?);
        }
        Ok(())
    }

    /// Restore variables written by [`EinsumDense::save_own_variables`].
    ///
    /// Everything is validated before anything is assigned. Adapter matrices
    /// are zeroed, since their contribution is already in the saved kernel.
    pub fn load_own_variables(&mut self, store: &impl WeightStore) -> Result<()> {
        let dtype = self.compute_dtype();
        let kernel = store.require(KERNEL_KEY)?;
        check_shape(KERNEL_KEY, kernel, &self.shapes.kernel_shape)?;

        let bias = match &self.bias {
            Some(var) => {
                let t = store.require(BIAS_KEY)?;
                check_shape(BIAS_KEY, t, var.dims())?;
                Some(t.to_dtype(dtype)?)
            }
            None => None,
        };

        let mut float_kernel = None;
        let mut int8_kernel = None;
        match &self.kernel {
            KernelTensor::Float(_) => {
                if !kernel.dtype().is_float() {
                    return Err(QDenseError::InvalidArgument(format!(
                        "float layer cannot load a {:?} kernel",
                        kernel.dtype()
                    )));
                }
                float_kernel = Some(kernel.to_dtype(dtype)?);
            }
            KernelTensor::Int8(_) => {
                if kernel.dtype() != DType::U8 {
                    return Err(QDenseError::InvalidArgument(format!(
                        "int8 layer expects U8 kernel bytes, got {:?}",
                        kernel.dtype()
                    )));
                }
                let values = Int8Tensor::from_storage(kernel)?;
                let scale = store.require(KERNEL_SCALE_KEY)?.to_dtype(dtype)?;
                int8_kernel = Some(QuantizedKernel::new(values, scale, &self.plan)?);
            }
        }

        if let (KernelTensor::Float(w), Some(t)) = (&self.kernel, &float_kernel) {
            w.set(t)?;
        }
        if let Some(q) = int8_kernel {
            self.kernel = KernelTensor::Int8(q);
        }
        if let (Some(var), Some(t)) = (&self.bias, bias) {
            var.set(&t)?;
        }
        if let Some(lora) = &self.lora {
            lora.reset()?;
        }
        tracing::info!(
            policy = %self.config.dtype,
            lora = self.lora.is_some(),
            "loaded layer variables"
        );
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    /// Live configuration: reflects `quantize` and `enable_lora`.
    pub fn config(&self) -> &EinsumDenseConfig {
        &self.config
    }

    pub fn equation(&self) -> &ParsedEquation {
        &self.equation
    }

    pub fn axis_plan(&self) -> &AxisPlan {
        &self.plan
    }

    pub fn kernel_shape(&self) -> &[usize] {
        &self.shapes.kernel_shape
    }

    pub fn bias_shape(&self) -> Option<&[usize]> {
        self.shapes.bias_shape.as_deref()
    }

    /// Full output shape, batch dimension included.
    pub fn output_shape(&self) -> &[Option<usize>] {
        &self.shapes.output_shape
    }

    pub fn bias(&self) -> Option<&Var> {
        self.bias.as_ref()
    }

    pub fn lora(&self) -> Option<&LoraAdapter> {
        self.lora.as_ref()
    }

    pub fn lora_enabled(&self) -> bool {
        self.lora.is_some()
    }

    pub fn is_quantized(&self) -> bool {
        self.kernel.is_quantized()
    }

    /// Int8 values and output-layout scale, when quantized.
    pub fn quantized_kernel(&self) -> Option<&QuantizedKernel> {
        match &self.kernel {
            KernelTensor::Int8(q) => Some(q),
            KernelTensor::Float(_) => None,
        }
    }

    pub fn compute_dtype(&self) -> DType {
        self.config.dtype.compute_dtype()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

fn check_shape(key: &str, t: &Tensor, expected: &[usize]) -> Result<()> {
    if t.dims() != expected {
        return Err(QDenseError::ShapeMismatch(format!(
            "stored variable '{key}' has shape {:?}, layer expects {expected:?}",
            t.dims()
        )));
    }
    Ok(())
}

impl Module for EinsumDense {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        EinsumDense::forward(self, xs).map_err(QDenseError::into_candle)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
