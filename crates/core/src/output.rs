//! Result of one forward call.

use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::error::{FashionVilError, Result};

pub const SCORES: &str = "scores";
pub const TARGETS: &str = "targets";

/// Named output tensors plus named scalar losses.
#[derive(Debug, Clone, Default)]
pub struct ModelOutput {
    tensors: BTreeMap<String, Tensor>,
    losses: BTreeMap<String, Tensor>,
}

impl ModelOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, tensor: Tensor) -> Self {
        self.tensors.insert(key.into(), tensor);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(key.into(), tensor);
    }

    pub fn insert_loss(&mut self, key: impl Into<String>, loss: Tensor) {
        self.losses.insert(key.into(), loss);
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    pub fn scores(&self) -> Option<&Tensor> {
        self.get(SCORES)
    }

    pub fn targets(&self) -> Option<&Tensor> {
        self.get(TARGETS)
    }

    pub fn losses(&self) -> &BTreeMap<String, Tensor> {
        &self.losses
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Sum of all losses, or `None` when the head produced none.
    pub fn total_loss(&self) -> Result<Option<Tensor>> {
        let mut total: Option<Tensor> = None;
        for loss in self.losses.values() {
            total = Some(match total {
                None => loss.clone(),
                Some(acc) => (acc + loss).map_err(FashionVilError::from)?,
            });
        }
        Ok(total)
    }
}
