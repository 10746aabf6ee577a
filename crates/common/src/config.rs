//! Layer configuration for `EinsumDense`.
//!
//! Serialised as JSON alongside the weights. Every optional field has a
//! `#[serde(default)]`, so `{"equation": "ab,bc->ac", "output_shape": 64}` is
//! a complete config.

use std::fmt;
use std::str::FromStr;

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::error::{QDenseError, Result};

/// Configuration for one einsum-dense layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EinsumDenseConfig {
    /// Einsum equation: `ab,bc->ac`, `...ab,bc->...ac` or `ab...,bc->ac...`.
    pub equation: String,
    /// Expected output shape, excluding the batch dimension and any elided
    /// dimensions. `null` marks a dimension taken from the input.
    pub output_shape: OutputShape,
    /// Output labels that carry a bias, e.g. `"c"`.
    #[serde(default)]
    pub bias_axes: Option<String>,
    #[serde(default)]
    pub activation: Activation,
    #[serde(default = "default_kernel_initializer")]
    pub kernel_initializer: Initializer,
    #[serde(default = "default_bias_initializer")]
    pub bias_initializer: Initializer,
    /// Enable a low-rank adapter of this rank right after build.
    #[serde(default)]
    pub lora_rank: Option<usize>,
    /// Dtype policy, e.g. `"float32"` or `"int8_from_float32"`.
    #[serde(default)]
    pub dtype: DTypePolicy,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_kernel_initializer() -> Initializer {
    Initializer::GlorotUniform
}
fn default_bias_initializer() -> Initializer {
    Initializer::Zeros
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl EinsumDenseConfig {
    /// Minimal config: float32, linear activation, no bias.
    pub fn new(equation: impl Into<String>, output_shape: impl Into<OutputShape>) -> Self {
        Self {
            equation: equation.into(),
            output_shape: output_shape.into(),
            bias_axes: None,
            activation: Activation::default(),
            kernel_initializer: default_kernel_initializer(),
            bias_initializer: default_bias_initializer(),
            lora_rank: None,
            dtype: DTypePolicy::default(),
        }
    }

    pub fn with_bias_axes(mut self, bias_axes: impl Into<String>) -> Self {
        self.bias_axes = Some(bias_axes.into());
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_dtype(mut self, dtype: DTypePolicy) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_lora_rank(mut self, rank: usize) -> Self {
        self.lora_rank = Some(rank);
        self
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

/// Partial output shape: a single size or a list of (possibly unknown) sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputShape {
    Scalar(usize),
    Dims(Vec<Option<usize>>),
}

impl OutputShape {
    pub fn dims(&self) -> Vec<Option<usize>> {
        match self {
            Self::Scalar(d) => vec![Some(*d)],
            Self::Dims(dims) => dims.clone(),
        }
    }
}

impl From<usize> for OutputShape {
    fn from(d: usize) -> Self {
        Self::Scalar(d)
    }
}

impl From<Vec<Option<usize>>> for OutputShape {
    fn from(dims: Vec<Option<usize>>) -> Self {
        Self::Dims(dims)
    }
}

impl From<&[usize]> for OutputShape {
    fn from(dims: &[usize]) -> Self {
        Self::Dims(dims.iter().map(|&d| Some(d)).collect())
    }
}

/// Pointwise activation applied after the bias.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
    Gelu,
    Silu,
    Tanh,
    Sigmoid,
    Softmax,
}

/// Weight initialiser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initializer {
    /// `U(-l, l)` with `l = sqrt(6 / (fan_in + fan_out))`.
    GlorotUniform,
    /// `U(-l, l)` with `l = sqrt(6 / fan_in)`.
    HeUniform,
    Zeros,
    Ones,
}

// ── Dtype policy ────────────────────────────────────────────────────────────

/// Floating-point compute dtype.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FloatDType {
    #[default]
    Float32,
    Float64,
}

impl FloatDType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Self::Float32 => DType::F32,
            Self::Float64 => DType::F64,
        }
    }
}

impl FromStr for FloatDType {
    type Err = QDenseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "float32" => Ok(Self::Float32),
            "float64" => Ok(Self::Float64),
            other => Err(QDenseError::UnsupportedDType(other.to_string())),
        }
    }
}

/// Post-training quantization scheme. Only dynamic int8 is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantizationMode {
    Int8,
}

impl QuantizationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Int8 => "int8",
        }
    }
}

impl FromStr for QuantizationMode {
    type Err = QDenseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "int8" => Ok(Self::Int8),
            other => Err(QDenseError::UnsupportedQuantizationMode(other.to_string())),
        }
    }
}

impl fmt::Display for QuantizationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Variable and compute dtype of a layer.
///
/// Serialised as a string: `"float32"` or `"int8_from_float32"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DTypePolicy {
    Float(FloatDType),
    Quantized {
        mode: QuantizationMode,
        source: FloatDType,
    },
}

impl Default for DTypePolicy {
    fn default() -> Self {
        Self::Float(FloatDType::default())
    }
}

impl DTypePolicy {
    /// Dtype used for activations, bias and scales.
    pub fn compute_dtype(&self) -> DType {
        match self {
            Self::Float(f) => f.dtype(),
            Self::Quantized { source, .. } => source.dtype(),
        }
    }

    pub fn quantization_mode(&self) -> Option<QuantizationMode> {
        match self {
            Self::Float(_) => None,
            Self::Quantized { mode, .. } => Some(*mode),
        }
    }

    /// The policy a float layer switches to after `quantize(mode)`.
    pub fn quantized(&self, mode: QuantizationMode) -> Self {
        match self {
            Self::Float(source) => Self::Quantized {
                mode,
                source: *source,
            },
            Self::Quantized { source, .. } => Self::Quantized {
                mode,
                source: *source,
            },
        }
    }
}

impl fmt::Display for DTypePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(d) => f.write_str(d.as_str()),
            Self::Quantized { mode, source } => write!(f, "{}_from_{}", mode, source.as_str()),
        }
    }
}

impl FromStr for DTypePolicy {
    type Err = QDenseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once("_from_") {
            Some((mode, source)) => Ok(Self::Quantized {
                mode: mode.parse()?,
                source: source.parse()?,
            }),
            None => Ok(Self::Float(s.parse()?)),
        }
    }
}

impl TryFrom<String> for DTypePolicy {
    type Error = QDenseError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<DTypePolicy> for String {
    fn from(policy: DTypePolicy) -> Self {
        policy.to_string()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
