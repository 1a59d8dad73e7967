//! Batched sample container handed to the model.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::error::{FashionVilError, Result};

/// A batch of named tensors plus an optional task name.
///
/// Every tensor carries a leading batch dimension. Sequence fields
/// (`input_ids`, `segment_ids`, `input_mask`) are `[batch, len]` and feature
/// fields (`image`, `ref_image`, `tar_image`) are `[batch, len, dim]` once
/// encoded. Heads may store derived masks back into the list.
#[derive(Debug, Clone, Default)]
pub struct SampleList {
    fields: HashMap<String, Tensor>,
    task: Option<String>,
}

impl SampleList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, tensor: Tensor) -> Self {
        self.fields.insert(key.into(), tensor);
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.fields.insert(key.into(), tensor)
    }

    pub fn get(&self, key: &str) -> Result<&Tensor> {
        self.fields
            .get(key)
            .ok_or_else(|| FashionVilError::MissingField(key.to_string()))
    }

    pub fn get_opt(&self, key: &str) -> Option<&Tensor> {
        self.fields.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Result<Tensor> {
        self.fields
            .remove(key)
            .ok_or_else(|| FashionVilError::MissingField(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn task(&self) -> Option<&str> {
        self.task.as_deref()
    }

    /// Field names in sorted order.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.fields.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// `(batch, tokens, dim)` of a feature field.
    pub fn feature_dims(&self, key: &str) -> Result<(usize, usize, usize)> {
        let tensor = self.get(key)?;
        tensor.dims3().map_err(|_| FashionVilError::ShapeMismatch {
            field: key.to_string(),
            expected: "[batch, tokens, dim]".into(),
            actual: tensor.dims().to_vec(),
        })
    }

    /// Apply a fallible transform to one field in place.
    pub fn map_field<F>(&mut self, key: &str, f: F) -> Result<()>
    where
        F: FnOnce(Tensor) -> Result<Tensor>,
    {
        let tensor = self.remove(key)?;
        let mapped = f(tensor)?;
        self.fields.insert(key.to_string(), mapped);
        Ok(())
    }

    /// Collapse extra leading dimensions of the named fields into the batch
    /// dimension.
    pub fn flatten(&mut self, sequence_fields: &[&str], feature_fields: &[&str]) -> Result<()> {
        for key in sequence_fields {
            self.map_field(key, |t| transform_to_batch_sequence(&t))?;
        }
        for key in feature_fields {
            self.map_field(key, |t| transform_to_batch_sequence_dim(&t))?;
        }
        Ok(())
    }
}

/// `[..., len]` to `[N, len]`. Rank-2 (and lower) tensors are returned as is.
pub fn transform_to_batch_sequence(tensor: &Tensor) -> Result<Tensor> {
    let dims = tensor.dims();
    if dims.len() <= 2 {
        return Ok(tensor.clone());
    }
    let len = dims[dims.len() - 1];
    let rows: usize = dims[..dims.len() - 1].iter().product();
    Ok(tensor.reshape((rows, len))?)
}

/// `[..., len, dim]` to `[N, len, dim]`. Rank-3 (and lower) tensors are
/// returned as is.
pub fn transform_to_batch_sequence_dim(tensor: &Tensor) -> Result<Tensor> {
    let dims = tensor.dims();
    if dims.len() <= 3 {
        return Ok(tensor.clone());
    }
    let len = dims[dims.len() - 2];
    let dim = dims[dims.len() - 1];
    let rows: usize = dims[..dims.len() - 2].iter().product();
    Ok(tensor.reshape((rows, len, dim))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn missing_field_is_reported_by_name() {
        let samples = SampleList::new();
        match samples.get("ref_image") {
            Err(FashionVilError::MissingField(name)) => assert_eq!(name, "ref_image"),
            other => panic!("expected MissingField, got {other:?}"),
        }
    }

    #[test]
    fn flatten_collapses_leading_dims() {
        let device = Device::Cpu;
        let mut samples = SampleList::new()
            .with("input_ids", Tensor::zeros((2, 3, 5), DType::U32, &device).unwrap())
            .with("segment_ids", Tensor::zeros((6, 5), DType::U32, &device).unwrap())
            .with("image", Tensor::zeros((2, 3, 4, 8), DType::F32, &device).unwrap());

        samples
            .flatten(&["input_ids", "segment_ids"], &["image"])
            .unwrap();

        assert_eq!(samples.get("input_ids").unwrap().dims(), &[6, 5]);
        assert_eq!(samples.get("segment_ids").unwrap().dims(), &[6, 5]);
        assert_eq!(samples.get("image").unwrap().dims(), &[6, 4, 8]);
    }

    #[test]
    fn flatten_fails_on_missing_field() {
        let mut samples = SampleList::new();
        assert!(matches!(
            samples.flatten(&["input_ids"], &[]),
            Err(FashionVilError::MissingField(_))
        ));
    }

    #[test]
    fn feature_dims_rejects_sequences() {
        let samples = SampleList::new().with(
            "image",
            Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap(),
        );
        assert!(matches!(
            samples.feature_dims("image"),
            Err(FashionVilError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn task_and_keys() {
        let samples = SampleList::new()
            .with("b", Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap())
            .with("a", Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap())
            .with_task("itm");
        assert_eq!(samples.keys(), vec!["a", "b"]);
        assert_eq!(samples.task(), Some("itm"));
        assert_eq!(samples.len(), 2);
    }
}
