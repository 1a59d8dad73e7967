//! Image/text retrieval in a shared normalized space.

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use super::{ones_mask, zero_type_ids, TaskHead};
use crate::backbone::JointEncoder;
use crate::config::FashionVilConfig;
use crate::error::Result;
use crate::layers::{masked_mean, mean_over_tokens, NormalizationLayer};
use crate::output::{ModelOutput, SCORES, TARGETS};
use crate::sample::SampleList;

pub struct ContrastiveHead {
    backbone: Box<dyn JointEncoder>,
    norm_layer: NormalizationLayer,
}

impl ContrastiveHead {
    pub fn new(
        _cfg: &FashionVilConfig,
        backbone: Box<dyn JointEncoder>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let norm_layer = NormalizationLayer::new(vb.pp("norm_layer"))?;
        Ok(Self {
            backbone,
            norm_layer,
        })
    }
}

pub(crate) const FLATTEN_SEQUENCE: [&str; 3] = ["input_ids", "segment_ids", "input_mask"];

/// Adds `visual_embeddings_type` and `visual_attention_mask` for the `image`
/// field.
pub(crate) fn add_visual_params(samples: &mut SampleList) -> Result<()> {
    let (batch, visual_len, _) = samples.feature_dims("image")?;
    let device = samples.get("image")?.device().clone();
    samples.insert(
        "visual_embeddings_type",
        zero_type_ids(batch, visual_len, &device)?,
    );
    samples.insert(
        "visual_attention_mask",
        ones_mask(batch, visual_len, &device)?,
    );
    Ok(())
}

/// Normalized `(image, text)` embeddings, each `[batch, hidden]`.
///
/// The image side is mean pooled over every visual token, the text side over
/// the tokens `input_mask` keeps.
pub(crate) fn image_text_embeddings(
    backbone: &dyn JointEncoder,
    norm_layer: &NormalizationLayer,
    samples: &SampleList,
) -> Result<(Tensor, Tensor)> {
    let visual = backbone
        .get_image_embedding(
            samples.get("image")?,
            samples.get("visual_embeddings_type")?,
            samples.get("visual_attention_mask")?,
            None,
        )?
        .embeddings;
    let visual = norm_layer.forward(&mean_over_tokens(&visual)?)?;

    let input_mask = samples.get("input_mask")?;
    let text = backbone
        .get_text_embedding(
            samples.get("input_ids")?,
            samples.get("segment_ids")?,
            input_mask,
        )?
        .embeddings;
    let text = norm_layer.forward(&masked_mean(&text, input_mask)?)?;
    Ok((visual, text))
}

impl TaskHead for ContrastiveHead {
    fn flatten_for_bert(&self, samples: &mut SampleList) -> Result<()> {
        samples.flatten(&FLATTEN_SEQUENCE, &["image"])
    }

    fn add_post_flatten_params(&self, samples: &mut SampleList) -> Result<()> {
        add_visual_params(samples)
    }

    fn run(&self, samples: &SampleList) -> Result<ModelOutput> {
        let (visual, text) = image_text_embeddings(self.backbone.as_ref(), &self.norm_layer, samples)?;
        Ok(ModelOutput::new().with(SCORES, visual).with(TARGETS, text))
    }
}
