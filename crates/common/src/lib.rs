//! # qdense-common: shared types
//!
//! Types shared across every crate in the workspace:
//!
//! * **[`EinsumDenseConfig`]**: layer configuration (serialised as JSON).
//! * **[`DTypePolicy`]** / **[`QuantizationMode`]**: float vs. int8 layers.
//! * **[`QDenseError`]**: the error taxonomy, with the [`Result`] alias.

pub mod config;
pub mod error;

pub use config::{
    Activation, DTypePolicy, EinsumDenseConfig, FloatDType, Initializer, OutputShape,
    QuantizationMode,
};
pub use error::{QDenseError, Result};
