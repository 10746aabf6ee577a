//! Variable initialisation from an [`Initializer`] choice.

use candle_core::{DType, Device, Var};
use candle_nn::Init;

use qdense_common::{Initializer, Result};

/// `(fan_in, fan_out)` with the receptive-field rule: for rank > 2 every
/// axis before the last two multiplies both fans.
pub fn compute_fans(shape: &[usize]) -> (f64, f64) {
    match shape {
        [] => (1.0, 1.0),
        [n] => (*n as f64, *n as f64),
        [fan_in, fan_out] => (*fan_in as f64, *fan_out as f64),
        [receptive @ .., fan_in, fan_out] => {
            let r: usize = receptive.iter().product();
            ((fan_in * r) as f64, (fan_out * r) as f64)
        }
    }
}

pub fn init_for(initializer: Initializer, shape: &[usize]) -> Init {
    let (fan_in, fan_out) = compute_fans(shape);
    match initializer {
        Initializer::GlorotUniform => {
            let limit = (6.0 / (fan_in + fan_out).max(1.0)).sqrt();
            Init::Uniform {
                lo: -limit,
                up: limit,
            }
        }
        Initializer::HeUniform => {
            let limit = (6.0 / fan_in.max(1.0)).sqrt();
            Init::Uniform {
                lo: -limit,
                up: limit,
            }
        }
        Initializer::Zeros => Init::Const(0.),
        Initializer::Ones => Init::Const(1.),
    }
}

/// New variable of `shape` drawn from `initializer`.
pub fn variable(initializer: Initializer, shape: &[usize], dtype: DType, device: &Device) -> Result<Var> {
    Ok(init_for(initializer, shape).var(shape.to_vec(), dtype, device)?)
}
