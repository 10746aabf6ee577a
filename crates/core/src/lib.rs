//! # qdense-core: einsum-dense layers with post-training int8 quantization
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`einsum`] | two-operand `einsum`, `transpose`, `expand_dims`, `squeeze` over candle |
//! | [`equation`] | equation grammar, ellipsis expansion, kernel/bias/output shape inference |
//! | [`plan`] | `AxisPlan`: reduced axes and scale alignment for the int8 path |
//! | [`quantize`] | abs-max int8 codec, `Int8Tensor` |
//! | [`kernel`] | `KernelTensor` (float or int8), `QuantizedKernel` |
//! | [`contract`] | `quantized_contract` with its hand-written input gradient |
//! | [`lora`] | `LoraAdapter` |
//! | [`init`] | glorot / he / constant initialisers |
//! | [`activation`] | pointwise activations |
//! | [`store`] | `WeightStore`, safetensors-backed `TensorStore` |
//! | [`linear`] | `EinsumDense` |
//!
//! ## Design principles
//!
//! 1. **Everything is candle.** The custom gradient is a `CustomOp1`; the
//!    rest is ordinary differentiable tensor ops.
//! 2. **One-way transitions fail loudly.** A second `quantize` or
//!    `enable_lora` is an error, and a failed call leaves the layer as it was.
//! 3. **Scales live in output layout.** Descaling is one broadcasting multiply.

pub mod activation;
pub mod contract;
pub mod einsum;
pub mod equation;
pub mod init;
pub mod kernel;
pub mod linear;
pub mod lora;
pub mod plan;
pub mod quantize;
pub mod store;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use contract::{quantized_contract, QuantizedEinsum};
pub use equation::{analyze_shapes, EinsumShapes, EllipsisSide, ParsedEquation};
pub use kernel::{KernelTensor, QuantizedKernel};
pub use linear::EinsumDense;
pub use lora::LoraAdapter;
pub use plan::{AxisPlan, OperandAxes};
pub use quantize::{abs_max_quantize, dequantize, Int8Tensor, QuantizedTensor};
pub use store::{TensorStore, WeightStore};
