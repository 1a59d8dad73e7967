use candle_core::{DType, Device, Tensor};

use crate::config::{BertConfig, FashionVilConfig, HeadType};
use crate::sample::SampleList;

/// A tiny BERT config (1 layer, 16 hidden, 2 heads) for CPU tests.
pub fn tiny_bert_config() -> BertConfig {
    BertConfig {
        hidden_size: 16,
        num_attention_heads: 2,
        num_hidden_layers: 1,
        intermediate_size: 32,
        vocab_size: 50,
        max_position_embeddings: 32,
        type_vocab_size: 2,
        visual_embedding_dim: 8,
        layer_norm_eps: 1e-12,
    }
}

/// A tiny model config for `head_type` that takes precomputed 8-d visual
/// features.
pub fn tiny_fashionvil_config(head_type: HeadType) -> FashionVilConfig {
    FashionVilConfig {
        training_head_type: head_type.as_str().to_string(),
        direct_features_input: true,
        bert: tiny_bert_config(),
        ..Default::default()
    }
}

fn text_fields(samples: SampleList, batch: usize, text_len: usize) -> SampleList {
    let device = Device::Cpu;
    let ids: Vec<u32> = (0..batch * text_len).map(|i| (i % 7) as u32 + 1).collect();
    samples
        .with(
            "input_ids",
            Tensor::from_vec(ids, (batch, text_len), &device).expect("input_ids"),
        )
        .with(
            "segment_ids",
            Tensor::zeros((batch, text_len), DType::U32, &device).expect("segment_ids"),
        )
        .with(
            "input_mask",
            Tensor::ones((batch, text_len), DType::U32, &device).expect("input_mask"),
        )
}

fn features(batch: usize, visual_len: usize, dim: usize, offset: f64) -> Tensor {
    Tensor::arange(0f32, (batch * visual_len * dim) as f32, &Device::Cpu)
        .and_then(|t| t.reshape((batch, visual_len, dim)))
        .and_then(|t| t.affine(0.01, offset))
        .expect("features")
}

/// Text plus an `image` feature field, as the classification, contrastive
/// and pretraining heads expect.
pub fn image_text_batch(batch: usize, text_len: usize, visual_len: usize, dim: usize) -> SampleList {
    text_fields(SampleList::new(), batch, text_len).with("image", features(batch, visual_len, dim, 0.0))
}

/// Text plus `ref_image` and `tar_image` feature fields.
pub fn composition_batch(
    batch: usize,
    text_len: usize,
    visual_len: usize,
    dim: usize,
) -> SampleList {
    text_fields(SampleList::new(), batch, text_len)
        .with("ref_image", features(batch, visual_len, dim, 0.0))
        .with("tar_image", features(batch, visual_len, dim, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_configs_are_valid() {
        for head_type in HeadType::ALL {
            let cfg = tiny_fashionvil_config(head_type);
            assert_eq!(cfg.validate().unwrap(), head_type);
        }
    }

    #[test]
    fn batches_have_expected_fields() {
        let samples = composition_batch(2, 5, 3, 8);
        assert_eq!(
            samples.keys(),
            vec!["input_ids", "input_mask", "ref_image", "segment_ids", "tar_image"]
        );
        assert_eq!(samples.feature_dims("tar_image").unwrap(), (2, 3, 8));
    }
}
