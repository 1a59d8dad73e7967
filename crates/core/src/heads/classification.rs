//! Category prediction from the joint image+text sequence.

use candle_core::{DType, Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

use super::{joint_mask, zero_type_ids, TaskHead};
use crate::backbone::JointEncoder;
use crate::config::{FashionVilConfig, PoolerStrategy};
use crate::error::Result;
use crate::layers::{gather_tokens, masked_mean, Pooler, PredictionHeadTransform};
use crate::losses::cross_entropy;
use crate::output::{ModelOutput, SCORES};
use crate::sample::SampleList;

/// Name of the loss added when the batch carries `targets`.
pub const CLASSIFICATION_LOSS: &str = "classification_loss";

pub struct ClassificationHead {
    backbone: Box<dyn JointEncoder>,
    pooler: Pooler,
    transform: PredictionHeadTransform,
    classifier: Linear,
    strategy: PoolerStrategy,
    num_labels: usize,
}

impl ClassificationHead {
    pub fn new(
        cfg: &FashionVilConfig,
        backbone: Box<dyn JointEncoder>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let hidden = backbone.hidden_size();
        let pooler = Pooler::new(hidden, vb.pp("pooler"))?;
        let vb_cls = vb.pp("classifier");
        let transform = PredictionHeadTransform::new(hidden, cfg.bert.layer_norm_eps, vb_cls.pp(0))?;
        let classifier = linear(hidden, cfg.num_labels, vb_cls.pp(1))?;
        Ok(Self {
            backbone,
            pooler,
            transform,
            classifier,
            strategy: cfg.pooler_strategy,
            num_labels: cfg.num_labels,
        })
    }

    /// Reduce `[b, l_t + l_v, h]` to `[b, h]`.
    fn pool(&self, sequence: &Tensor, input_mask: &Tensor) -> Result<Tensor> {
        let pooled = match self.strategy {
            PoolerStrategy::Default => self.pooler.forward(sequence)?,
            PoolerStrategy::Mean => {
                let text_len = input_mask.dim(1)?;
                masked_mean(&sequence.narrow(1, 0, text_len)?, input_mask)?
            }
            PoolerStrategy::Vqa => {
                // second to last text token; [SEP] sits at the very end
                let index = input_mask
                    .to_dtype(DType::F32)?
                    .sum(1)?
                    .affine(1.0, -2.0)?
                    .clamp(0.0, f64::MAX)?
                    .to_dtype(DType::U32)?;
                gather_tokens(sequence, &index)?
            }
        };
        Ok(pooled)
    }
}

impl TaskHead for ClassificationHead {
    fn flatten_for_bert(&self, samples: &mut SampleList) -> Result<()> {
        samples.flatten(&["input_ids", "segment_ids"], &["image"])
    }

    fn add_post_flatten_params(&self, samples: &mut SampleList) -> Result<()> {
        let (batch, visual_len, _) = samples.feature_dims("image")?;
        let device = samples.get("image")?.device().clone();
        samples.insert(
            "visual_embeddings_type",
            zero_type_ids(batch, visual_len, &device)?,
        );
        let attention_mask = joint_mask(samples.get("input_mask")?, visual_len)?;
        samples.insert("attention_mask", attention_mask);
        Ok(())
    }

    fn run(&self, samples: &SampleList) -> Result<ModelOutput> {
        let sequence = self
            .backbone
            .get_joint_embedding(
                samples.get("input_ids")?,
                samples.get("segment_ids")?,
                samples.get("image")?,
                samples.get("visual_embeddings_type")?,
                samples.get("attention_mask")?,
                None,
            )?
            .embeddings;

        let pooled = self.pool(&sequence, samples.get("input_mask")?)?;
        let logits = self
            .classifier
            .forward(&self.transform.forward(&pooled)?)?
            .reshape(((), self.num_labels))?;

        let mut output = ModelOutput::new();
        if let Some(targets) = samples.get_opt("targets") {
            let loss = cross_entropy(&logits, &targets.flatten_all()?)?;
            output.insert_loss(CLASSIFICATION_LOSS, loss);
        }
        output.insert(SCORES, logits);
        Ok(output)
    }
}
