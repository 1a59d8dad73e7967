//! Task heads.
//!
//! Every head owns the backbone and runs the same three steps on a batch:
//! 1. `flatten_for_bert`: collapse extra leading dimensions into the batch
//! 2. `add_post_flatten_params`: derive type ids and attention masks
//! 3. `run`: call the backbone and assemble the output dict
//!
//! [`Head`] is the closed set of heads a model can be built with, resolved
//! once from the configured [`HeadType`].

mod classification;
mod composition;
mod contrastive;
mod pretraining;

pub use classification::ClassificationHead;
pub use composition::{CompositionHead, NUM_PROMPT_TOKENS};
pub use contrastive::ContrastiveHead;
pub use pretraining::PretrainingHead;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::backbone::{JointEncoder, VisualBert};
use crate::config::{FashionVilConfig, HeadType};
use crate::error::Result;
use crate::output::ModelOutput;
use crate::sample::SampleList;

/// Prefix under which every head registers its backbone.
pub const BACKBONE_PREFIX: &str = "bert";

/// The per-task pipeline shared by all heads.
pub trait TaskHead: Send + Sync {
    fn flatten_for_bert(&self, samples: &mut SampleList) -> Result<()>;

    fn add_post_flatten_params(&self, samples: &mut SampleList) -> Result<()>;

    fn run(&self, samples: &SampleList) -> Result<ModelOutput>;

    fn forward(&self, mut samples: SampleList) -> Result<ModelOutput> {
        self.flatten_for_bert(&mut samples)?;
        self.add_post_flatten_params(&mut samples)?;
        self.run(&samples)
    }
}

/// One head per supported task.
pub enum Head {
    Pretraining(PretrainingHead),
    Classification(ClassificationHead),
    Composition(CompositionHead),
    Contrastive(ContrastiveHead),
}

impl Head {
    /// Build the head for `head_type` on a fresh [`VisualBert`] registered
    /// under `bert.` in `vb`.
    pub fn new(head_type: HeadType, cfg: &FashionVilConfig, vb: VarBuilder) -> Result<Self> {
        let backbone = VisualBert::new(&cfg.bert, cfg.bypass_transformer, vb.pp(BACKBONE_PREFIX))?;
        Self::with_backbone(head_type, cfg, Box::new(backbone), vb)
    }

    /// Build the head for `head_type` around an existing backbone.
    pub fn with_backbone(
        head_type: HeadType,
        cfg: &FashionVilConfig,
        backbone: Box<dyn JointEncoder>,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(match head_type {
            HeadType::Pretraining => Self::Pretraining(PretrainingHead::new(cfg, backbone, vb)?),
            HeadType::Classification => {
                Self::Classification(ClassificationHead::new(cfg, backbone, vb)?)
            }
            HeadType::Composition => Self::Composition(CompositionHead::new(cfg, backbone, vb)?),
            HeadType::Contrastive => Self::Contrastive(ContrastiveHead::new(cfg, backbone, vb)?),
        })
    }

    pub fn head_type(&self) -> HeadType {
        match self {
            Self::Pretraining(_) => HeadType::Pretraining,
            Self::Classification(_) => HeadType::Classification,
            Self::Composition(_) => HeadType::Composition,
            Self::Contrastive(_) => HeadType::Contrastive,
        }
    }

    /// The learned prefix prompt, present only on a prompted composition head.
    pub fn prefix_prompts(&self) -> Option<&Tensor> {
        match self {
            Self::Composition(head) => head.prefix_prompts(),
            _ => None,
        }
    }

    fn as_task(&self) -> &dyn TaskHead {
        match self {
            Self::Pretraining(head) => head,
            Self::Classification(head) => head,
            Self::Composition(head) => head,
            Self::Contrastive(head) => head,
        }
    }

    pub fn forward(&self, samples: SampleList) -> Result<ModelOutput> {
        self.as_task().forward(samples)
    }
}

/// All-ones `[batch, len]` mask.
pub(crate) fn ones_mask(batch: usize, len: usize, device: &Device) -> Result<Tensor> {
    Ok(Tensor::ones((batch, len), DType::U32, device)?)
}

/// All-zeros `[batch, len]` type ids.
pub(crate) fn zero_type_ids(batch: usize, len: usize, device: &Device) -> Result<Tensor> {
    Ok(Tensor::zeros((batch, len), DType::U32, device)?)
}

/// Concatenate masks along the sequence dimension as `u32`.
pub(crate) fn cat_masks(masks: &[&Tensor]) -> Result<Tensor> {
    let masks = masks
        .iter()
        .map(|mask| mask.to_dtype(DType::U32))
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Tensor::cat(&masks, 1)?)
}

/// `cat(input_mask, ones(batch, visual_len))`, the mask of a text+image
/// sequence without prompt.
pub(crate) fn joint_mask(input_mask: &Tensor, visual_len: usize) -> Result<Tensor> {
    let batch = input_mask.dim(0)?;
    let visual = ones_mask(batch, visual_len, input_mask.device())?;
    cat_masks(&[input_mask, &visual])
}
