//! Small building blocks shared by the heads.

use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::{layer_norm, linear, Init, LayerNorm, Linear, VarBuilder};

/// Initial value of the learned scale in [`NormalizationLayer`].
pub const DEFAULT_NORMALIZE_SCALE: f64 = 4.0;

/// L2 normalization with a learned scalar scale.
///
/// `y = s * x / ||x||`, reduced over the last dimension.
pub struct NormalizationLayer {
    norm_s: Tensor,
}

impl NormalizationLayer {
    pub fn new(vb: VarBuilder) -> Result<Self> {
        let norm_s = vb.get_with_hints(1, "norm_s", Init::Const(DEFAULT_NORMALIZE_SCALE))?;
        Ok(Self { norm_s })
    }
}

impl Module for NormalizationLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let norm = xs
            .sqr()?
            .sum_keepdim(D::Minus1)?
            .sqrt()?
            .clamp(1e-12, f64::MAX)?;
        xs.broadcast_div(&norm)?.broadcast_mul(&self.norm_s)
    }
}

/// Dense + tanh over the first token.
pub struct Pooler {
    dense: Linear,
}

impl Pooler {
    pub fn new(hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        let dense = linear(hidden_size, hidden_size, vb.pp("dense"))?;
        Ok(Self { dense })
    }
}

impl Module for Pooler {
    fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let first = hidden_states.narrow(1, 0, 1)?.squeeze(1)?;
        self.dense.forward(&first)?.tanh()
    }
}

/// Dense + GELU + LayerNorm, the transform in front of BERT prediction heads.
pub struct PredictionHeadTransform {
    dense: Linear,
    layer_norm: LayerNorm,
}

impl PredictionHeadTransform {
    pub fn new(hidden_size: usize, layer_norm_eps: f64, vb: VarBuilder) -> Result<Self> {
        let dense = linear(hidden_size, hidden_size, vb.pp("dense"))?;
        let layer_norm = layer_norm(hidden_size, layer_norm_eps, vb.pp("LayerNorm"))?;
        Ok(Self { dense, layer_norm })
    }
}

impl Module for PredictionHeadTransform {
    fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let hidden_states = self.dense.forward(hidden_states)?.gelu_erf()?;
        self.layer_norm.forward(&hidden_states)
    }
}

/// Unweighted mean over the token dimension: `[b, l, h] -> [b, h]`.
pub fn mean_over_tokens(hidden_states: &Tensor) -> Result<Tensor> {
    hidden_states.mean(1)
}

/// Mean over the tokens the mask keeps: `[b, l, h] x [b, l] -> [b, h]`.
pub fn masked_mean(hidden_states: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let mask = mask
        .to_dtype(hidden_states.dtype())?
        .unsqueeze(2)?
        .broadcast_as(hidden_states.shape())?;
    let summed = (hidden_states * &mask)?.sum(1)?;
    let counts = mask.sum(1)?.clamp(1e-9, f64::MAX)?;
    summed.broadcast_div(&counts)
}

/// Select one token per row: `[b, l, h] x [b] -> [b, h]`.
pub fn gather_tokens(hidden_states: &Tensor, positions: &Tensor) -> Result<Tensor> {
    let (batch, _seq, hidden) = hidden_states.dims3()?;
    let index = positions
        .to_dtype(DType::U32)?
        .reshape((batch, 1, 1))?
        .broadcast_as((batch, 1, hidden))?
        .contiguous()?;
    hidden_states.contiguous()?.gather(&index, 1)?.squeeze(1)
}

/// The last `count` tokens of a sequence: `[b, l, h] -> [b, count, h]`.
pub fn trailing_tokens(hidden_states: &Tensor, count: usize) -> Result<Tensor> {
    let seq_len = hidden_states.dim(1)?;
    if count > seq_len {
        return Err(candle_core::Error::Msg(format!(
            "cannot take the last {count} tokens of a {seq_len}-token sequence"
        )));
    }
    hidden_states.narrow(1, seq_len - count, count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn normalization_layer_scales_unit_vectors() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = NormalizationLayer::new(vb).unwrap();

        let x = Tensor::new(&[[3f32, 4.0], [0.0, 2.0]], &device).unwrap();
        let y: Vec<Vec<f32>> = norm.forward(&x).unwrap().to_vec2().unwrap();
        // 4 * (0.6, 0.8) and 4 * (0, 1)
        assert!((y[0][0] - 2.4).abs() < 1e-5);
        assert!((y[0][1] - 3.2).abs() < 1e-5);
        assert!((y[1][1] - 4.0).abs() < 1e-5);
    }

    #[test]
    fn normalization_layer_handles_zero_vectors() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = NormalizationLayer::new(vb).unwrap();

        let x = Tensor::zeros((2, 3), DType::F32, &device).unwrap();
        let y: Vec<Vec<f32>> = norm.forward(&x).unwrap().to_vec2().unwrap();
        assert!(y.iter().flatten().all(|v| v.is_finite()));
    }

    #[test]
    fn masked_mean_ignores_padding() {
        let device = Device::Cpu;
        let hidden = Tensor::new(&[[[1f32, 1.0], [3.0, 3.0], [100.0, 100.0]]], &device).unwrap();
        let mask = Tensor::new(&[[1u32, 1, 0]], &device).unwrap();
        let pooled: Vec<Vec<f32>> = masked_mean(&hidden, &mask).unwrap().to_vec2().unwrap();
        assert_eq!(pooled, vec![vec![2.0, 2.0]]);
    }

    #[test]
    fn mean_over_tokens_counts_everything() {
        let device = Device::Cpu;
        let hidden = Tensor::new(&[[[1f32], [2.0], [6.0]]], &device).unwrap();
        let pooled: Vec<Vec<f32>> = mean_over_tokens(&hidden).unwrap().to_vec2().unwrap();
        assert_eq!(pooled, vec![vec![3.0]]);
    }

    #[test]
    fn gather_tokens_picks_one_row_per_sample() {
        let device = Device::Cpu;
        let hidden = Tensor::new(
            &[[[0f32, 0.0], [1.0, 1.0]], [[2.0, 2.0], [3.0, 3.0]]],
            &device,
        )
        .unwrap();
        let positions = Tensor::new(&[1u32, 0], &device).unwrap();
        let picked: Vec<Vec<f32>> = gather_tokens(&hidden, &positions)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(picked, vec![vec![1.0, 1.0], vec![2.0, 2.0]]);
    }

    #[test]
    fn trailing_tokens_slices_the_end() {
        let device = Device::Cpu;
        let hidden = Tensor::arange(0f32, 6.0, &device)
            .unwrap()
            .reshape((1, 6, 1))
            .unwrap();
        let tail: Vec<f32> = trailing_tokens(&hidden, 2)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(tail, vec![4.0, 5.0]);
        assert!(trailing_tokens(&hidden, 7).is_err());
    }

    #[test]
    fn pooler_and_transform_shapes() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let pooler = Pooler::new(8, vb.pp("pooler")).unwrap();
        let transform = PredictionHeadTransform::new(8, 1e-12, vb.pp("transform")).unwrap();

        let hidden = Tensor::ones((2, 5, 8), DType::F32, &device).unwrap();
        assert_eq!(pooler.forward(&hidden).unwrap().dims(), &[2, 8]);
        assert_eq!(transform.forward(&hidden).unwrap().dims(), &[2, 5, 8]);
    }
}
