//! End-to-end checks of `FashionVil` through its public API.

use candle_core::{DType, Device, Tensor};
use fashionvil_core::config::{BertConfig, ImageEncoderType, PatchGridParams};
use fashionvil_core::heads::NUM_PROMPT_TOKENS;
use fashionvil_core::{FashionVil, FashionVilConfig, FashionVilError, HeadType, OptimizerConfig, SampleList};

const HIDDEN: usize = 16;
const VISUAL_DIM: usize = 8;

fn tiny_config(head_type: HeadType) -> FashionVilConfig {
    FashionVilConfig {
        training_head_type: head_type.as_str().to_string(),
        direct_features_input: true,
        bert: BertConfig {
            hidden_size: HIDDEN,
            num_attention_heads: 2,
            num_hidden_layers: 2,
            intermediate_size: 32,
            vocab_size: 64,
            max_position_embeddings: 64,
            type_vocab_size: 2,
            visual_embedding_dim: VISUAL_DIM,
            layer_norm_eps: 1e-12,
        },
        ..Default::default()
    }
}

fn text(batch: usize, len: usize) -> SampleList {
    let device = Device::Cpu;
    let ids: Vec<u32> = (0..batch * len).map(|i| (i % 60) as u32 + 2).collect();
    SampleList::new()
        .with("input_ids", Tensor::from_vec(ids, (batch, len), &device).unwrap())
        .with("segment_ids", Tensor::zeros((batch, len), DType::U32, &device).unwrap())
        .with("input_mask", Tensor::ones((batch, len), DType::U32, &device).unwrap())
}

fn features(batch: usize, tokens: usize) -> Tensor {
    Tensor::randn(0f32, 1.0, (batch, tokens, VISUAL_DIM), &Device::Cpu).unwrap()
}

#[test]
fn composition_with_prompt_and_bypass_runs_on_visual_bert() {
    for (enable_prompt, bypass) in [(false, false), (true, false), (true, true), (false, true)] {
        let mut cfg = tiny_config(HeadType::Composition);
        cfg.enable_prompt = enable_prompt;
        cfg.bypass_transformer = bypass;
        let model = FashionVil::build(cfg, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(
            model.prefix_prompts().map(|p| p.dims().to_vec()),
            enable_prompt.then(|| vec![1, NUM_PROMPT_TOKENS, HIDDEN])
        );

        let samples = text(3, 7)
            .with("ref_image", features(3, 4))
            .with("tar_image", features(3, 4));
        let out = model.forward(samples).unwrap();
        let scores = out.scores().unwrap();
        let targets = out.targets().unwrap();
        assert_eq!(scores.dims(), &[3, HIDDEN]);
        assert_eq!(scores.dims(), targets.dims());
    }
}

#[test]
fn composition_requires_both_images() {
    let model = FashionVil::build(tiny_config(HeadType::Composition), DType::F32, &Device::Cpu).unwrap();
    let samples = text(2, 5).with("ref_image", features(2, 4));
    match model.forward(samples) {
        Err(FashionVilError::MissingField(name)) => assert_eq!(name, "tar_image"),
        other => panic!("expected MissingField, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn candidate_lists_are_flattened_into_the_batch() {
    let model = FashionVil::build(tiny_config(HeadType::Contrastive), DType::F32, &Device::Cpu).unwrap();
    let device = Device::Cpu;
    let samples = SampleList::new()
        .with("input_ids", Tensor::ones((2, 3, 5), DType::U32, &device).unwrap())
        .with("segment_ids", Tensor::zeros((2, 3, 5), DType::U32, &device).unwrap())
        .with("input_mask", Tensor::ones((2, 3, 5), DType::U32, &device).unwrap())
        .with(
            "image",
            Tensor::randn(0f32, 1.0, (2, 3, 4, VISUAL_DIM), &device).unwrap(),
        );
    let out = model.forward(samples).unwrap();
    assert_eq!(out.scores().unwrap().dims(), &[6, HIDDEN]);
    assert_eq!(out.targets().unwrap().dims(), &[6, HIDDEN]);
}

#[test]
fn pretraining_objectives_report_their_losses() {
    let model = FashionVil::build(tiny_config(HeadType::Pretraining), DType::F32, &Device::Cpu).unwrap();
    let device = Device::Cpu;
    let labels = Tensor::new(&[[-1i64, 5, -1, -1], [3, -1, -1, -1]], &device).unwrap();

    let mlm = text(2, 4)
        .with("image", features(2, 3))
        .with("lm_label_ids", labels)
        .with_task("mlm");
    let out = model.forward(mlm).unwrap();
    assert_eq!(out.scores().unwrap().dims(), &[2, 4, 64]);
    assert!(out.losses().contains_key("mlm_loss"));

    let itm = text(2, 4)
        .with("image", features(2, 3))
        .with("is_correct", Tensor::new(&[0u32, 1], &device).unwrap())
        .with_task("itm");
    let out = model.forward(itm).unwrap();
    assert_eq!(out.scores().unwrap().dims(), &[2, 2]);
    assert!(out.total_loss().unwrap().is_some());

    let itc = text(2, 4).with("image", features(2, 3)).with_task("itc");
    let out = model.forward(itc).unwrap();
    assert!(out.losses().contains_key("itc_loss"));
}

#[test]
fn classification_scores_per_label() {
    let mut cfg = tiny_config(HeadType::Classification);
    cfg.num_labels = 7;
    let model = FashionVil::build(cfg, DType::F32, &Device::Cpu).unwrap();
    let out = model
        .forward(text(4, 6).with("image", features(4, 2)))
        .unwrap();
    assert_eq!(out.scores().unwrap().dims(), &[4, 7]);
}

#[test]
fn patch_grid_encoder_feeds_raw_pixels() {
    let mut cfg = tiny_config(HeadType::Contrastive);
    cfg.direct_features_input = false;
    cfg.image_encoder.encoder_type = ImageEncoderType::PatchGrid;
    cfg.image_encoder.params = PatchGridParams {
        image_size: 16,
        patch_size: 4,
        num_channels: 3,
        hidden_size: VISUAL_DIM,
        intermediate_size: 16,
        num_attention_heads: 2,
        num_hidden_layers: 1,
        layer_norm_eps: 1e-5,
    };
    let model = FashionVil::build(cfg, DType::F32, &Device::Cpu).unwrap();
    let pixels = Tensor::randn(0f32, 1.0, (2, 3, 16, 16), &Device::Cpu).unwrap();
    let out = model.forward(text(2, 5).with("image", pixels)).unwrap();
    assert_eq!(out.scores().unwrap().dims(), &[2, HIDDEN]);

    let groups = model.parameter_groups(&OptimizerConfig::default()).unwrap();
    assert!((groups[0].lr - 20.0 * groups[1].lr).abs() < 1e-12);
}

#[test]
fn invalid_config_is_rejected_before_build() {
    let mut cfg = tiny_config(HeadType::Classification);
    cfg.num_labels = 0;
    assert!(matches!(
        FashionVil::build(cfg, DType::F32, &Device::Cpu),
        Err(FashionVilError::InvalidConfig(_))
    ));
}
