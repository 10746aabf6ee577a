//! Quantisation primitives: symmetric abs-max int8.
//!
//! ```text
//! scale  = 127 / (max(|x|) over axes + ε)      (size 1 on every reduced axis)
//! values = clip(round(x · scale), -127, 127)
//! x̂      = values / scale
//! ```
//!
//! There is no zero-point: zero maps to zero exactly, and the round-trip
//! error of any element is at most half a step, `max|x| / 254`, of its group.

use candle_core::{DType, Device, Tensor};

use qdense_common::{QDenseError, Result};

/// Largest int8 magnitude used. The range is symmetric, so -128 is unused.
pub const INT8_MAX: f64 = 127.0;

/// Added to the group max before dividing, so all-zero groups stay finite.
pub const EPSILON: f64 = 1e-7;

// ── Int8 storage ────────────────────────────────────────────────────────────

/// Dense int8 tensor held on the host, one byte per element.
///
/// candle has no `i8` dtype, so the values are materialised into a float
/// carrier for contraction ([`Int8Tensor::to_tensor`]) and persisted as their
/// two's-complement bytes in a `U8` tensor ([`Int8Tensor::to_storage`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Int8Tensor {
    data: Vec<i8>,
    dims: Vec<usize>,
}

impl Int8Tensor {
    pub fn zeros(dims: &[usize]) -> Self {
        Self {
            data: vec![0; dims.iter().product()],
            dims: dims.to_vec(),
        }
    }

    /// Take integer codes produced by [`abs_max_codes`].
    pub fn from_codes(codes: &Tensor) -> Result<Self> {
        let flat: Vec<f64> = codes.flatten_all()?.to_dtype(DType::F64)?.to_vec1()?;
        let data = flat
            .into_iter()
            .map(|v| checked_i8(v.round() as i64))
            .collect::<Result<Vec<i8>>>()?;
        Ok(Self {
            data,
            dims: codes.dims().to_vec(),
        })
    }

    /// Read back the `U8` bytes written by [`Int8Tensor::to_storage`].
    /// The byte `0x80` (-128) is outside the symmetric range and rejected.
    pub fn from_storage(t: &Tensor) -> Result<Self> {
        if t.dtype() != DType::U8 {
            return Err(QDenseError::UnsupportedDType(format!(
                "int8 values are stored as U8 bytes, got {:?}",
                t.dtype()
            )));
        }
        let flat: Vec<u8> = t.flatten_all()?.to_vec1()?;
        let data = flat
            .into_iter()
            .map(|b| checked_i8(b as i8 as i64))
            .collect::<Result<Vec<i8>>>()?;
        Ok(Self {
            data,
            dims: t.dims().to_vec(),
        })
    }

    pub fn to_storage(&self, device: &Device) -> Result<Tensor> {
        let data: Vec<u8> = self.data.iter().map(|&v| v as u8).collect();
        Ok(Tensor::from_vec(data, self.dims.clone(), device)?)
    }

    /// Float tensor holding the integer values exactly.
    pub fn to_tensor(&self, dtype: DType, device: &Device) -> Result<Tensor> {
        let data: Vec<f64> = self.data.iter().map(|&v| v as f64).collect();
        Ok(Tensor::from_vec(data, self.dims.clone(), device)?.to_dtype(dtype)?)
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn as_slice(&self) -> &[i8] {
        &self.data
    }
}

fn checked_i8(v: i64) -> Result<i8> {
    if v.abs() > INT8_MAX as i64 {
        return Err(QDenseError::InvalidArgument(format!(
            "int8 value {v} outside [-127, 127]"
        )));
    }
    Ok(v as i8)
}

/// Int8 values plus the keep-dims scale they were quantized with.
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    pub values: Int8Tensor,
    /// Operand layout, size 1 on every reduced axis.
    pub scale: Tensor,
}

impl QuantizedTensor {
    pub fn dequantize(&self) -> Result<Tensor> {
        let values = self
            .values
            .to_tensor(self.scale.dtype(), self.scale.device())?;
        dequantize(&values, &self.scale)
    }
}

// ── Abs-max quantisation ────────────────────────────────────────────────────

/// `127 / (max(|x|) + ε)` over `axes`, keeping reduced axes as size 1.
pub fn abs_max_scale(x: &Tensor, axes: &[usize]) -> Result<Tensor> {
    let mut max_abs = x.abs()?;
    for &axis in axes {
        max_abs = max_abs.max_keepdim(axis)?;
    }
    Ok(max_abs.affine(1.0, EPSILON)?.recip()?.affine(INT8_MAX, 0.0)?)
}

/// Quantize to integer codes held in `x`'s dtype. Returns `(codes, scale)`.
///
/// This is the form the forward pass wants: the codes feed straight into a
/// contraction without a trip through host memory.
pub fn abs_max_codes(x: &Tensor, axes: &[usize]) -> Result<(Tensor, Tensor)> {
    let scale = abs_max_scale(x, axes)?;
    let codes = x
        .broadcast_mul(&scale)?
        .round()?
        .clamp(-INT8_MAX, INT8_MAX)?;
    Ok((codes, scale))
}

/// Quantize `x` to int8 over `axes`.
pub fn abs_max_quantize(x: &Tensor, axes: &[usize]) -> Result<QuantizedTensor> {
    let (codes, scale) = abs_max_codes(x, axes)?;
    Ok(QuantizedTensor {
        values: Int8Tensor::from_codes(&codes)?,
        scale,
    })
}

/// `values / scale`, broadcasting the keep-dims scale.
pub fn dequantize(values: &Tensor, scale: &Tensor) -> Result<Tensor> {
    Ok(values.to_dtype(scale.dtype())?.broadcast_div(scale)?)
}

// ── Tests ───────────────────────────────────────────────────────────────────
