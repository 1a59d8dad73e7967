//! Losses computed inside the heads.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::ops::log_softmax;

/// Label value skipped by [`masked_cross_entropy`].
pub const IGNORE_INDEX: i64 = -1;

/// Cross-entropy over `[n, classes]` logits and `[n]` class ids.
pub fn cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    candle_nn::loss::cross_entropy(logits, &labels.to_dtype(DType::U32)?)
}

/// Cross-entropy that skips rows labelled [`IGNORE_INDEX`].
///
/// `logits` is `[n, classes]`, `labels` is `[n]` of any integer dtype. When
/// every row is ignored the loss is zero.
pub fn masked_cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let labels = labels.to_dtype(DType::I64)?;
    let keep = labels.ge(0i64)?;
    let safe_labels = keep
        .where_cond(&labels, &labels.zeros_like()?)?
        .to_dtype(DType::U32)?;

    let log_probs = log_softmax(logits, D::Minus1)?;
    let picked = log_probs
        .gather(&safe_labels.unsqueeze(1)?.contiguous()?, 1)?
        .squeeze(1)?;

    let keep = keep.to_dtype(log_probs.dtype())?;
    let total = (picked.neg()? * &keep)?.sum_all()?;
    let count = keep.sum_all()?.clamp(1.0, f64::MAX)?;
    total.div(&count)
}

/// Symmetric in-batch contrastive loss between two `[n, d]` embedding sets.
///
/// Row `i` of `left` is the positive for row `i` of `right`; every other row
/// of the batch is a negative.
pub fn contrastive_loss(left: &Tensor, right: &Tensor, temperature: f64) -> Result<Tensor> {
    let logits = left.matmul(&right.t()?)?.affine(1.0 / temperature, 0.0)?;
    let n = left.dim(0)?;
    let labels = Tensor::arange(0u32, n as u32, left.device())?;

    let forward = candle_nn::loss::cross_entropy(&logits, &labels)?;
    let backward = candle_nn::loss::cross_entropy(&logits.t()?.contiguous()?, &labels)?;
    (forward + backward)? * 0.5
}
