//! Model and optimizer configuration.
//!
//! `FashionVilConfig` mirrors the keys of the model section of a run config.
//! It is deserialized once, validated once by [`FashionVilConfig::validate`],
//! and never mutated afterwards. The head type is kept as the raw string from
//! the file so that an unknown value surfaces as a build error rather than a
//! parse error.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FashionVilError, Result};

/// Learning-rate multiplier applied to the image encoder parameter group.
pub const IMAGE_ENCODER_LR_MULTIPLIER: f64 = 20.0;

/// The task head a model is built around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeadType {
    Pretraining,
    Classification,
    Composition,
    Contrastive,
}

impl HeadType {
    pub const ALL: [HeadType; 4] = [
        HeadType::Pretraining,
        HeadType::Classification,
        HeadType::Composition,
        HeadType::Contrastive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HeadType::Pretraining => "pretraining",
            HeadType::Classification => "classification",
            HeadType::Composition => "composition",
            HeadType::Contrastive => "contrastive",
        }
    }
}

impl FromStr for HeadType {
    type Err = FashionVilError;

    fn from_str(s: &str) -> Result<Self> {
        HeadType::ALL
            .into_iter()
            .find(|head| head.as_str() == s)
            .ok_or_else(|| FashionVilError::UnsupportedHeadType(s.to_string()))
    }
}

impl fmt::Display for HeadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the classification head reduces the joint sequence to one vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolerStrategy {
    /// Dense + tanh over the first token.
    #[default]
    Default,
    /// Mean over the unmasked text tokens.
    Mean,
    /// The token two positions before the end of the text.
    Vqa,
}

/// Objectives available to the pretraining head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PretrainingTask {
    /// Masked language modelling.
    Mlm,
    /// Image-text matching.
    Itm,
    /// Image-text contrastive alignment.
    Itc,
}

impl PretrainingTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            PretrainingTask::Mlm => "mlm",
            PretrainingTask::Itm => "itm",
            PretrainingTask::Itc => "itc",
        }
    }
}

impl FromStr for PretrainingTask {
    type Err = FashionVilError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mlm" => Ok(PretrainingTask::Mlm),
            "itm" => Ok(PretrainingTask::Itm),
            "itc" => Ok(PretrainingTask::Itc),
            other => Err(FashionVilError::UnsupportedTask(other.to_string())),
        }
    }
}

/// Shape of the BERT-style joint encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BertConfig {
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    pub type_vocab_size: usize,
    /// Width of the features handed over by the image encoder.
    pub visual_embedding_dim: usize,
    pub layer_norm_eps: f64,
}

impl Default for BertConfig {
    fn default() -> Self {
        // bert-base-uncased
        Self {
            hidden_size: 768,
            num_attention_heads: 12,
            num_hidden_layers: 12,
            intermediate_size: 3072,
            vocab_size: 30522,
            max_position_embeddings: 512,
            type_vocab_size: 2,
            visual_embedding_dim: 2048,
            layer_norm_eps: 1e-12,
        }
    }
}

impl BertConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("hidden_size", self.hidden_size),
            ("num_attention_heads", self.num_attention_heads),
            ("num_hidden_layers", self.num_hidden_layers),
            ("intermediate_size", self.intermediate_size),
            ("vocab_size", self.vocab_size),
            ("max_position_embeddings", self.max_position_embeddings),
            ("type_vocab_size", self.type_vocab_size),
            ("visual_embedding_dim", self.visual_embedding_dim),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(FashionVilError::InvalidConfig(format!(
                    "bert.{name} must be greater than zero"
                )));
            }
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(FashionVilError::InvalidConfig(format!(
                "bert.hidden_size ({}) must be divisible by bert.num_attention_heads ({})",
                self.hidden_size, self.num_attention_heads
            )));
        }
        Ok(())
    }
}

/// Image encoder variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageEncoderType {
    /// Features arrive precomputed; the encoder passes them through.
    Identity,
    /// Patch-grid transformer over raw pixels.
    #[default]
    PatchGrid,
}

/// Parameters of the patch-grid image encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchGridParams {
    pub image_size: usize,
    pub patch_size: usize,
    pub num_channels: usize,
    /// Output width; must match `bert.visual_embedding_dim`.
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    pub layer_norm_eps: f64,
}

impl Default for PatchGridParams {
    fn default() -> Self {
        // 224px input, 7x7 grid of 2048-d features
        Self {
            image_size: 224,
            patch_size: 32,
            num_channels: 3,
            hidden_size: 2048,
            intermediate_size: 4096,
            num_attention_heads: 16,
            num_hidden_layers: 2,
            layer_norm_eps: 1e-5,
        }
    }
}

impl PatchGridParams {
    pub fn grid_side(&self) -> usize {
        self.image_size / self.patch_size
    }

    pub fn num_patches(&self) -> usize {
        self.grid_side() * self.grid_side()
    }

    pub fn validate(&self) -> Result<()> {
        if self.patch_size == 0 || self.image_size < self.patch_size {
            return Err(FashionVilError::InvalidConfig(format!(
                "image_encoder.params: image_size ({}) must be at least patch_size ({}) and patch_size non-zero",
                self.image_size, self.patch_size
            )));
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(FashionVilError::InvalidConfig(format!(
                "image_encoder.params.hidden_size ({}) must be divisible by num_attention_heads ({})",
                self.hidden_size, self.num_attention_heads
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageEncoderConfig {
    #[serde(rename = "type", default)]
    pub encoder_type: ImageEncoderType,
    #[serde(default)]
    pub params: PatchGridParams,
}

fn default_true() -> bool {
    true
}

fn default_num_labels() -> usize {
    2
}

fn default_pretraining_tasks() -> Vec<PretrainingTask> {
    vec![
        PretrainingTask::Mlm,
        PretrainingTask::Itm,
        PretrainingTask::Itc,
    ]
}

fn default_itc_temperature() -> f64 {
    0.07
}

/// Configuration of a FashionViL model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FashionVilConfig {
    pub training_head_type: String,
    #[serde(default)]
    pub enable_prompt: bool,
    #[serde(default)]
    pub bypass_transformer: bool,
    #[serde(default = "default_true")]
    pub special_visual_initialize: bool,
    #[serde(default)]
    pub freeze_base: bool,
    #[serde(default)]
    pub direct_features_input: bool,
    #[serde(default)]
    pub image_encoder: ImageEncoderConfig,
    #[serde(default)]
    pub bert: BertConfig,
    #[serde(default = "default_num_labels")]
    pub num_labels: usize,
    #[serde(default)]
    pub pooler_strategy: PoolerStrategy,
    #[serde(default = "default_pretraining_tasks")]
    pub pretraining_tasks: Vec<PretrainingTask>,
    #[serde(default = "default_itc_temperature")]
    pub itc_temperature: f64,
}

impl Default for FashionVilConfig {
    fn default() -> Self {
        Self {
            training_head_type: HeadType::Pretraining.as_str().to_string(),
            enable_prompt: false,
            bypass_transformer: false,
            special_visual_initialize: true,
            freeze_base: false,
            direct_features_input: false,
            image_encoder: ImageEncoderConfig::default(),
            bert: BertConfig::default(),
            num_labels: default_num_labels(),
            pooler_strategy: PoolerStrategy::default(),
            pretraining_tasks: default_pretraining_tasks(),
            itc_temperature: default_itc_temperature(),
        }
    }
}

impl FashionVilConfig {
    /// Parse the configured head type.
    pub fn head_type(&self) -> Result<HeadType> {
        self.training_head_type.parse()
    }

    /// The image encoder that will actually be built. Direct feature input
    /// always means pass-through.
    pub fn effective_image_encoder(&self) -> ImageEncoderType {
        if self.direct_features_input {
            ImageEncoderType::Identity
        } else {
            self.image_encoder.encoder_type
        }
    }

    /// Check every structural invariant and resolve the head type.
    pub fn validate(&self) -> Result<HeadType> {
        let head_type = self.head_type()?;
        self.bert.validate()?;

        if self.effective_image_encoder() == ImageEncoderType::PatchGrid {
            let params = &self.image_encoder.params;
            params.validate()?;
            if params.hidden_size != self.bert.visual_embedding_dim {
                return Err(FashionVilError::InvalidConfig(format!(
                    "image_encoder.params.hidden_size ({}) must equal bert.visual_embedding_dim ({})",
                    params.hidden_size, self.bert.visual_embedding_dim
                )));
            }
        }

        match head_type {
            HeadType::Classification if self.num_labels == 0 => {
                return Err(FashionVilError::InvalidConfig(
                    "num_labels must be greater than zero".into(),
                ));
            }
            HeadType::Pretraining if self.pretraining_tasks.is_empty() => {
                return Err(FashionVilError::InvalidConfig(
                    "pretraining_tasks must name at least one task".into(),
                ));
            }
            _ => {}
        }
        if !(self.itc_temperature.is_finite() && self.itc_temperature > 0.0) {
            return Err(FashionVilError::InvalidConfig(format!(
                "itc_temperature must be positive and finite, got {}",
                self.itc_temperature
            )));
        }
        Ok(head_type)
    }
}

/// `optimizer.params` section of a run config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerParams {
    pub lr: f64,
    pub weight_decay: f64,
    pub eps: f64,
}

impl Default for OptimizerParams {
    fn default() -> Self {
        Self {
            lr: 1e-5,
            weight_decay: 1e-4,
            eps: 1e-8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub params: OptimizerParams,
}
