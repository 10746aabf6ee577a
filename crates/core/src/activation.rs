//! Pointwise activations applied after the bias.
//!
//! | Activation | Formula |
//! |------------|---------|
//! | linear     | x |
//! | relu       | max(0, x) |
//! | gelu       | x · Φ(x) (exact, erf form) |
//! | silu       | x · σ(x) |
//! | tanh       | tanh(x) |
//! | sigmoid    | σ(x) |
//! | softmax    | over the last axis |

use candle_core::{Tensor, D};

use qdense_common::{Activation, Result};

pub fn apply(activation: Activation, x: &Tensor) -> Result<Tensor> {
    let y = match activation {
        Activation::Linear => x.clone(),
        Activation::Relu => x.relu()?,
        Activation::Gelu => x.gelu_erf()?,
        Activation::Silu => x.silu()?,
        Activation::Tanh => x.tanh()?,
        Activation::Sigmoid => candle_nn::ops::sigmoid(x)?,
        Activation::Softmax => candle_nn::ops::softmax(x, D::Minus1)?,
    };
    Ok(y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn values(activation: Activation) -> Vec<f32> {
        let x = Tensor::new(&[-2.0f32, 0.0, 3.0], &Device::Cpu).unwrap();
        apply(activation, &x).unwrap().to_vec1().unwrap()
    }

    #[test]
    fn linear_and_relu() {
        assert_eq!(values(Activation::Linear), vec![-2.0, 0.0, 3.0]);
        assert_eq!(values(Activation::Relu), vec![0.0, 0.0, 3.0]);
    }

    #[test]
    fn sigmoid_midpoint() {
        let v = values(Activation::Sigmoid);
        assert!((v[1] - 0.5).abs() < 1e-6);
        assert!(v[0] < 0.5 && v[2] > 0.5);
    }

    #[test]
    fn softmax_sums_to_one() {
        let v = values(Activation::Softmax);
        assert!((v.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn gelu_and_silu_vanish_at_zero() {
        assert_eq!(values(Activation::Gelu)[1], 0.0);
        assert_eq!(values(Activation::Silu)[1], 0.0);
        assert!((values(Activation::Tanh)[2] - 3.0f32.tanh()).abs() < 1e-6);
    }
}
