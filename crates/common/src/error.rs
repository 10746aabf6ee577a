//! Error types shared by every qdense crate.

use thiserror::Error;

/// Result type alias for qdense operations.
pub type Result<T> = std::result::Result<T, QDenseError>;

/// Errors raised while analysing equations, quantizing kernels or moving
/// weights in and out of a store.
///
/// Every failure is deterministic for a given input; nothing here is worth
/// retrying.
#[derive(Error, Debug)]
pub enum QDenseError {
    /// The equation matches none of the supported grammars, or is internally
    /// inconsistent (duplicate labels, output label with no source).
    #[error("invalid einsum equation '{equation}': {reason}")]
    InvalidEquation { equation: String, reason: String },

    /// Two shapes disagree where they must match.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A bias axis that is not part of the output spec.
    #[error("bias dimension '{axis}' was requested, but is not part of the output spec '{output_spec}'")]
    InvalidBiasAxis { axis: char, output_spec: String },

    /// A weight label whose size cannot be taken from the input or output.
    #[error(
        "weight dimension '{label}' did not have a match in either the input spec \
         '{input_spec}' or the output spec '{output_spec}'; the weight must be fully specified"
    )]
    UnresolvedWeightDim {
        label: char,
        input_spec: String,
        output_spec: String,
    },

    /// `quantize` was called on a layer whose kernel is already int8.
    #[error("`quantize` can only be done once per layer")]
    AlreadyQuantized,

    /// `enable_lora` was called on a layer that already carries an adapter.
    #[error("lora is already enabled; this can only be done once per layer")]
    LoraAlreadyEnabled,

    /// A quantization mode other than the implemented one.
    #[error("unsupported quantization mode '{0}'; expected 'int8'")]
    UnsupportedQuantizationMode(String),

    /// A dtype the operation cannot handle.
    #[error("unsupported dtype: {0}")]
    UnsupportedDType(String),

    /// A device the int8 contraction has no kernel for.
    #[error("unsupported device for int8 layers: {0}")]
    UnsupportedDevice(String),

    /// A caller-supplied argument outside its valid range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A weight-store key that should exist but does not.
    #[error("missing weight '{0}' in store")]
    MissingWeight(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl QDenseError {
    /// Shorthand for [`QDenseError::InvalidEquation`].
    pub fn equation(equation: &str, reason: impl Into<String>) -> Self {
        Self::InvalidEquation {
            equation: equation.to_string(),
            reason: reason.into(),
        }
    }

    /// Convert into a candle error, for code running inside candle callbacks
    /// (custom ops, `Module::forward`).
    pub fn into_candle(self) -> candle_core::Error {
        match self {
            Self::Tensor(e) => e,
            other => candle_core::Error::Msg(other.to_string()),
        }
    }
}
