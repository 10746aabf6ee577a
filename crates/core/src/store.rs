//! Keyed tensor slots for persisting layer variables.
//!
//! A layer writes its own variables under positional keys: `"0"` kernel,
//! `"1"` bias, `"2"` kernel scale (int8 only). [`TensorStore`] keeps them in
//! memory and round-trips them through a safetensors file.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};

use qdense_common::{QDenseError, Result};

pub const KERNEL_KEY: &str = "0";
pub const BIAS_KEY: &str = "1";
pub const KERNEL_SCALE_KEY: &str = "2";

pub trait WeightStore {
    fn put(&mut self, key: &str, tensor: Tensor);
    fn get(&self, key: &str) -> Option<&Tensor>;

    fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Like [`WeightStore::get`], but a missing key is an error.
    fn require(&self, key: &str) -> Result<&Tensor> {
        self.get(key)
            .ok_or_else(|| QDenseError::MissingWeight(key.to_string()))
    }
}

impl WeightStore for HashMap<String, Tensor> {
    fn put(&mut self, key: &str, tensor: Tensor) {
        self.insert(key.to_string(), tensor);
    }

    fn get(&self, key: &str) -> Option<&Tensor> {
        HashMap::get(self, key)
    }
}

/// In-memory store with safetensors IO.
#[derive(Debug, Default, Clone)]
pub struct TensorStore {
    tensors: HashMap<String, Tensor>,
}

impl TensorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path, device)?;
        tracing::debug!(path = %path.display(), count = tensors.len(), "loaded weight store");
        Ok(Self { tensors })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        candle_core::safetensors::save(&self.tensors, path)?;
        tracing::debug!(path = %path.display(), count = self.tensors.len(), "saved weight store");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

impl WeightStore for TensorStore {
    fn put(&mut self, key: &str, tensor: Tensor) {
        self.tensors.insert(key.to_string(), tensor);
    }

    fn get(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }
}
