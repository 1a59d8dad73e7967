//! Text-guided image retrieval.
//!
//! The reference image and the modification text are encoded jointly; the
//! visual slice of that sequence, mean pooled, must land next to the pooled
//! target image in the normalized space.

use candle_core::{Module, Tensor};
use candle_nn::{Init, VarBuilder};

use super::{cat_masks, ones_mask, zero_type_ids, TaskHead};
use crate::backbone::JointEncoder;
use crate::config::FashionVilConfig;
use crate::error::{FashionVilError, Result};
use crate::layers::{mean_over_tokens, trailing_tokens, NormalizationLayer};
use crate::output::{ModelOutput, SCORES, TARGETS};
use crate::sample::SampleList;

/// Number of learned prefix prompt tokens.
pub const NUM_PROMPT_TOKENS: usize = 10;

pub struct CompositionHead {
    backbone: Box<dyn JointEncoder>,
    norm_layer: NormalizationLayer,
    prefix_prompts: Option<Tensor>,
    bypass_transformer: bool,
}

impl CompositionHead {
    pub fn new(
        cfg: &FashionVilConfig,
        backbone: Box<dyn JointEncoder>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let norm_layer = NormalizationLayer::new(vb.pp("norm_layer"))?;
        let prefix_prompts = if cfg.enable_prompt {
            Some(vb.get_with_hints(
                (1, NUM_PROMPT_TOKENS, backbone.hidden_size()),
                "prefix_prompts",
                Init::Const(0.0),
            )?)
        } else {
            None
        };
        Ok(Self {
            backbone,
            norm_layer,
            prefix_prompts,
            bypass_transformer: cfg.bypass_transformer,
        })
    }

    pub fn prefix_prompts(&self) -> Option<&Tensor> {
        self.prefix_prompts.as_ref()
    }

    fn prompt_len(&self) -> Option<usize> {
        self.prefix_prompts.as_ref().map(|_| NUM_PROMPT_TOKENS)
    }

    /// The prompt handed to the image-only path; bypassing drops it.
    fn image_prompt(&self) -> Option<&Tensor> {
        if self.bypass_transformer {
            None
        } else {
            self.prefix_prompts.as_ref()
        }
    }
}

impl TaskHead for CompositionHead {
    fn flatten_for_bert(&self, samples: &mut SampleList) -> Result<()> {
        samples.flatten(&["input_ids", "segment_ids"], &["ref_image", "tar_image"])
    }

    fn add_post_flatten_params(&self, samples: &mut SampleList) -> Result<()> {
        let (batch, visual_len, _) = samples.feature_dims("ref_image")?;
        let (tar_batch, tar_len, _) = samples.feature_dims("tar_image")?;
        if (tar_batch, tar_len) != (batch, visual_len) {
            return Err(FashionVilError::ShapeMismatch {
                field: "tar_image".into(),
                expected: format!("[{batch}, {visual_len}, _]"),
                actual: samples.get("tar_image")?.dims().to_vec(),
            });
        }
        let device = samples.get("ref_image")?.device().clone();

        samples.insert(
            "tar_visual_embeddings_type",
            zero_type_ids(batch, visual_len, &device)?,
        );
        samples.insert(
            "ref_visual_embeddings_type",
            zero_type_ids(batch, visual_len, &device)?,
        );

        let input_mask = samples.get("input_mask")?;
        let visual_ones = ones_mask(batch, visual_len, &device)?;
        let comp_attention_mask = match self.prompt_len() {
            None => cat_masks(&[input_mask, &visual_ones])?,
            Some(prompt_len) => {
                let prompt_ones = ones_mask(batch, prompt_len, &device)?;
                cat_masks(&[&prompt_ones, input_mask, &visual_ones])?
            }
        };
        samples.insert("comp_attention_mask", comp_attention_mask);

        let visual_attention_len = match self.prompt_len() {
            Some(prompt_len) if !self.bypass_transformer => prompt_len + visual_len,
            _ => visual_len,
        };
        samples.insert(
            "visual_attention_mask",
            ones_mask(batch, visual_attention_len, &device)?,
        );
        Ok(())
    }

    fn run(&self, samples: &SampleList) -> Result<ModelOutput> {
        let tar_image = samples.get("tar_image")?;
        let tar_embeddings = self
            .backbone
            .get_image_embedding(
                tar_image,
                samples.get("tar_visual_embeddings_type")?,
                samples.get("visual_attention_mask")?,
                self.image_prompt(),
            )?
            .embeddings;
        let tar_embeddings = self.norm_layer.forward(&mean_over_tokens(&tar_embeddings)?)?;

        let comp_embeddings = self
            .backbone
            .get_joint_embedding(
                samples.get("input_ids")?,
                samples.get("segment_ids")?,
                samples.get("ref_image")?,
                samples.get("ref_visual_embeddings_type")?,
                samples.get("comp_attention_mask")?,
                self.prefix_prompts.as_ref(),
            )?
            .embeddings;
        let num_visual_tokens = tar_image.dim(1)?;
        let comp_embeddings = trailing_tokens(&comp_embeddings, num_visual_tokens)?;
        let comp_embeddings = self.norm_layer.forward(&mean_over_tokens(&comp_embeddings)?)?;

        Ok(ModelOutput::new()
            .with(SCORES, comp_embeddings)
            .with(TARGETS, tar_embeddings))
    }
}
