//! The joint vision-language encoder the heads are built on.
//!
//! Heads talk to the backbone only through [`JointEncoder`]. The concrete
//! encoder is [`VisualBert`]; tests substitute a recording mock.

mod visual_bert;

pub use visual_bert::VisualBert;

use candle_core::{DType, Result, Tensor};

/// Embeddings returned by every [`JointEncoder`] call.
///
/// The two auxiliary slots are backbone-specific extras. Heads never read
/// them.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// `[batch, seq, hidden]`, one row per input token (prompt tokens included).
    pub embeddings: Tensor,
    pub auxiliary: (Option<Tensor>, Option<Tensor>),
}

impl EncoderOutput {
    pub fn new(embeddings: Tensor) -> Self {
        Self {
            embeddings,
            auxiliary: (None, None),
        }
    }
}

/// Contract between the heads and the joint encoder.
///
/// Every `attention_mask` is `[batch, seq]` with ones on tokens to attend
/// to, where `seq` counts prompt tokens (if a prompt is passed), then text
/// tokens, then visual tokens. Prompts are `[1, prompt_len, hidden]` and are
/// shared across the batch.
pub trait JointEncoder: Send + Sync {
    /// Encode visual tokens alone.
    fn get_image_embedding(
        &self,
        image: &Tensor,
        visual_type_ids: &Tensor,
        attention_mask: &Tensor,
        prompt: Option<&Tensor>,
    ) -> Result<EncoderOutput>;

    /// Encode text tokens alone.
    fn get_text_embedding(
        &self,
        input_ids: &Tensor,
        segment_ids: &Tensor,
        attention_mask: &Tensor,
    ) -> Result<EncoderOutput>;

    /// Encode text followed by visual tokens.
    fn get_joint_embedding(
        &self,
        input_ids: &Tensor,
        segment_ids: &Tensor,
        image: &Tensor,
        visual_type_ids: &Tensor,
        attention_mask: &Tensor,
        prompt: Option<&Tensor>,
    ) -> Result<EncoderOutput>;

    fn hidden_size(&self) -> usize;
}

/// Turn a `[batch, seq]` keep-mask into an additive `[batch, 1, 1, seq]`
/// bias: 0 where attended, -10000 where masked.
pub fn extended_attention_mask(attention_mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let mask = attention_mask.to_dtype(dtype)?.unsqueeze(1)?.unsqueeze(2)?;
    (mask.ones_like()? - mask)? * -10000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn extended_mask_values() {
        let device = Device::Cpu;
        let mask = Tensor::new(&[[1u32, 1, 0]], &device).unwrap();
        let ext = extended_attention_mask(&mask, DType::F32).unwrap();
        assert_eq!(ext.dims(), &[1, 1, 1, 3]);
        let values: Vec<f32> = ext.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![0.0, 0.0, -10000.0]);
    }
}
