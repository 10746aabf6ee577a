//! Low-rank adapter over a frozen kernel.
//!
//! For a kernel of shape `(..., n)`:
//!
//! ```text
//! A : (..., rank)   he-uniform
//! B : (rank, n)     zeros
//! Δ = A @ B         same shape as the kernel
//! ```
//!
//! `B` starts at zero, so enabling an adapter does not change the layer's
//! output until training moves it.

use candle_core::{DType, Device, Tensor, Var};

use qdense_common::{Initializer, QDenseError, Result};

use crate::init::variable;

pub struct LoraAdapter {
    rank: usize,
    a: Var,
    b: Var,
}

impl LoraAdapter {
    pub fn new(kernel_shape: &[usize], rank: usize, dtype: DType, device: &Device) -> Result<Self> {
        if rank == 0 {
            return Err(QDenseError::InvalidArgument(
                "LoRA rank must be positive".to_string(),
            ));
        }
        let Some((&out_dim, lead)) = kernel_shape.split_last() else {
            return Err(QDenseError::InvalidArgument(
                "LoRA needs a kernel of rank at least 2".to_string(),
            ));
        };
        if lead.is_empty() {
            return Err(QDenseError::InvalidArgument(format!(
                "LoRA needs a kernel of rank at least 2, got {kernel_shape:?}"
            )));
        }
        let a_shape: Vec<usize> = lead.iter().copied().chain([rank]).collect();
        let a = variable(Initializer::HeUniform, &a_shape, dtype, device)?;
        let b = variable(Initializer::Zeros, &[rank, out_dim], dtype, device)?;
        Ok(Self { rank, a, b })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn a(&self) -> &Var {
        &self.a
    }

    pub fn b(&self) -> &Var {
        &self.b
    }

    /// `A @ B`, shaped like the kernel.
    pub fn delta(&self) -> Result<Tensor> {
        Ok(self.a.as_tensor().broadcast_matmul(self.b.as_tensor())?)
    }

    pub fn vars(&self) -> Vec<Var> {
        vec![self.a.clone(), self.b.clone()]
    }

    /// Zero both matrices, once their product has been merged elsewhere.
    pub fn reset(&self) -> Result<()> {
        self.a.set(&self.a.zeros_like()?)?;
        self.b.set(&self.b.zeros_like()?)?;
        Ok(())
    }
}
