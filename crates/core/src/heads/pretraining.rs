//! Pretraining objectives: masked language modelling, image-text matching
//! and image-text contrastive alignment.
//!
//! One head carries every objective's parameters. Each batch runs exactly one
//! objective, named by the batch task; batches without a task run the first
//! configured objective.

use candle_core::{Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

use super::contrastive::{add_visual_params, image_text_embeddings, FLATTEN_SEQUENCE};
use super::{joint_mask, TaskHead};
use crate::backbone::JointEncoder;
use crate::config::{FashionVilConfig, PretrainingTask};
use crate::error::{FashionVilError, Result};
use crate::layers::{NormalizationLayer, Pooler, PredictionHeadTransform};
use crate::losses::{contrastive_loss, cross_entropy, masked_cross_entropy};
use crate::output::{ModelOutput, SCORES, TARGETS};
use crate::sample::SampleList;

pub const MLM_LOSS: &str = "mlm_loss";
pub const ITM_LOSS: &str = "itm_loss";
pub const ITC_LOSS: &str = "itc_loss";

// ─── Prediction Heads ────────────────────────────────────────────────────────

/// Transform + decoder back to the vocabulary.
struct LmPredictionHead {
    transform: PredictionHeadTransform,
    decoder: Linear,
}

impl LmPredictionHead {
    fn new(cfg: &FashionVilConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.bert.hidden_size;
        Ok(Self {
            transform: PredictionHeadTransform::new(hidden, cfg.bert.layer_norm_eps, vb.pp("transform"))?,
            decoder: linear(hidden, cfg.bert.vocab_size, vb.pp("decoder"))?,
        })
    }
}

impl Module for LmPredictionHead {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.decoder.forward(&self.transform.forward(xs)?)
    }
}

// ─── Head ────────────────────────────────────────────────────────────────────

pub struct PretrainingHead {
    backbone: Box<dyn JointEncoder>,
    lm_head: LmPredictionHead,
    pooler: Pooler,
    itm_head: Linear,
    norm_layer: NormalizationLayer,
    tasks: Vec<PretrainingTask>,
    itc_temperature: f64,
}

impl PretrainingHead {
    pub fn new(
        cfg: &FashionVilConfig,
        backbone: Box<dyn JointEncoder>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let hidden = backbone.hidden_size();
        Ok(Self {
            lm_head: LmPredictionHead::new(cfg, vb.pp("cls").pp("predictions"))?,
            pooler: Pooler::new(hidden, vb.pp("pooler"))?,
            itm_head: linear(hidden, 2, vb.pp("itm_head"))?,
            norm_layer: NormalizationLayer::new(vb.pp("norm_layer"))?,
            tasks: cfg.pretraining_tasks.clone(),
            itc_temperature: cfg.itc_temperature,
            backbone,
        })
    }

    /// The objective this batch runs.
    pub fn select_task(&self, samples: &SampleList) -> Result<PretrainingTask> {
        match samples.task() {
            Some(name) => {
                let task: PretrainingTask = name.parse()?;
                if self.tasks.contains(&task) {
                    Ok(task)
                } else {
                    Err(FashionVilError::UnsupportedTask(name.to_string()))
                }
            }
            None => self
                .tasks
                .first()
                .copied()
                .ok_or_else(|| FashionVilError::UnsupportedTask("<none>".into())),
        }
    }

    fn joint_sequence(&self, samples: &SampleList) -> Result<Tensor> {
        Ok(self
            .backbone
            .get_joint_embedding(
                samples.get("input_ids")?,
                samples.get("segment_ids")?,
                samples.get("image")?,
                samples.get("visual_embeddings_type")?,
                samples.get("attention_mask")?,
                None,
            )?
            .embeddings)
    }

    fn run_mlm(&self, samples: &SampleList) -> Result<ModelOutput> {
        let sequence = self.joint_sequence(samples)?;
        let (batch, text_len) = samples.get("input_ids")?.dims2()?;
        let text = sequence.narrow(1, 0, text_len)?;
        let scores = self.lm_head.forward(&text)?;

        let mut output = ModelOutput::new();
        if let Some(labels) = samples.get_opt("lm_label_ids") {
            let vocab = scores.dim(2)?;
            let logits = scores.reshape((batch * text_len, vocab))?;
            let loss = masked_cross_entropy(&logits, &labels.flatten_all()?)?;
            output.insert_loss(MLM_LOSS, loss);
        }
        output.insert(SCORES, scores);
        Ok(output)
    }

    fn run_itm(&self, samples: &SampleList) -> Result<ModelOutput> {
        let sequence = self.joint_sequence(samples)?;
        let scores = self.itm_head.forward(&self.pooler.forward(&sequence)?)?;

        let mut output = ModelOutput::new();
        if let Some(is_correct) = samples.get_opt("is_correct") {
            let loss = cross_entropy(&scores, &is_correct.flatten_all()?)?;
            output.insert_loss(ITM_LOSS, loss);
        }
        output.insert(SCORES, scores);
        Ok(output)
    }

    fn run_itc(&self, samples: &SampleList) -> Result<ModelOutput> {
        let (visual, text) = image_text_embeddings(self.backbone.as_ref(), &self.norm_layer, samples)?;
        let loss = contrastive_loss(&visual, &text, self.itc_temperature)?;

        let mut output = ModelOutput::new().with(SCORES, visual).with(TARGETS, text);
        output.insert_loss(ITC_LOSS, loss);
        Ok(output)
    }
}

impl TaskHead for PretrainingHead {
    fn flatten_for_bert(&self, samples: &mut SampleList) -> Result<()> {
        samples.flatten(&FLATTEN_SEQUENCE, &["image"])?;
        if samples.contains("lm_label_ids") {
            samples.flatten(&["lm_label_ids"], &[])?;
        }
        Ok(())
    }

    fn add_post_flatten_params(&self, samples: &mut SampleList) -> Result<()> {
        add_visual_params(samples)?;
        let visual_len = samples.get("image")?.dim(1)?;
        let attention_mask = joint_mask(samples.get("input_mask")?, visual_len)?;
        samples.insert("attention_mask", attention_mask);
        Ok(())
    }

    fn run(&self, samples: &SampleList) -> Result<ModelOutput> {
        match self.select_task(samples)? {
            PretrainingTask::Mlm => self.run_mlm(samples),
            PretrainingTask::Itm => self.run_itm(samples),
            PretrainingTask::Itc => self.run_itc(samples),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeadType;
    use crate::losses::IGNORE_INDEX;
    use crate::testing::{image_text_batch, tiny_fashionvil_config, EncoderCall, RecordingEncoder};
    use candle_core::{DType, Device};

    fn build(tasks: Vec<PretrainingTask>) -> (PretrainingHead, crate::testing::CallLog) {
        let mut cfg = tiny_fashionvil_config(HeadType::Pretraining);
        cfg.pretraining_tasks = tasks;
        let (encoder, log) = RecordingEncoder::new(cfg.bert.hidden_size);
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let head = PretrainingHead::new(&cfg, Box::new(encoder), vb).unwrap();
        (head, log)
    }

    fn all_tasks() -> Vec<PretrainingTask> {
        vec![PretrainingTask::Mlm, PretrainingTask::Itm, PretrainingTask::Itc]
    }

    #[test]
    fn batch_task_selects_objective() {
        let (head, _log) = build(all_tasks());
        let samples = image_text_batch(1, 3, 2, 8);
        assert_eq!(head.select_task(&samples).unwrap(), PretrainingTask::Mlm);
        let samples = samples.with_task("itc");
        assert_eq!(head.select_task(&samples).unwrap(), PretrainingTask::Itc);
    }

    #[test]
    fn unknown_or_unconfigured_task_fails() {
        let (head, _log) = build(vec![PretrainingTask::Itm]);
        let samples = image_text_batch(1, 3, 2, 8).with_task("mpfr");
        assert!(matches!(
            head.forward(samples),
            Err(FashionVilError::UnsupportedTask(_))
        ));
        let samples = image_text_batch(1, 3, 2, 8).with_task("mlm");
        assert!(matches!(
            head.forward(samples),
            Err(FashionVilError::UnsupportedTask(_))
        ));
    }

    #[test]
    fn mlm_scores_cover_text_tokens() {
        let (head, log) = build(all_tasks());
        let device = Device::Cpu;
        let labels = Tensor::new(&[[IGNORE_INDEX, 5, IGNORE_INDEX], [IGNORE_INDEX; 3]], &device).unwrap();
        let samples = image_text_batch(2, 3, 2, 8)
            .with("lm_label_ids", labels)
            .with_task("mlm");
        let out = head.forward(samples).unwrap();

        let vocab = tiny_fashionvil_config(HeadType::Pretraining).bert.vocab_size;
        assert_eq!(out.scores().unwrap().dims(), &[2, 3, vocab]);
        let loss: f32 = out.losses()[MLM_LOSS].to_scalar().unwrap();
        // zero decoder, one kept label
        assert!((loss - (vocab as f32).ln()).abs() < 1e-3);
        assert_eq!(
            log.calls(),
            vec![EncoderCall::Joint {
                mask_len: 3 + 2,
                prompt_len: None
            }]
        );
    }

    #[test]
    fn itm_scores_are_two_way() {
        let (head, _log) = build(all_tasks());
        let device = Device::Cpu;
        let samples = image_text_batch(2, 3, 2, 8)
            .with("is_correct", Tensor::new(&[1u32, 0], &device).unwrap())
            .with_task("itm");
        let out = head.forward(samples).unwrap();
        assert_eq!(out.scores().unwrap().dims(), &[2, 2]);
        assert!(out.losses().contains_key(ITM_LOSS));
    }

    #[test]
    fn itc_always_reports_a_loss() {
        let (head, log) = build(all_tasks());
        let samples = image_text_batch(2, 3, 2, 8).with_task("itc");
        let out = head.forward(samples).unwrap();
        assert_eq!(out.scores().unwrap().dims(), &[2, 16]);
        assert_eq!(out.targets().unwrap().dims(), &[2, 16]);
        let loss: f32 = out.losses()[ITC_LOSS].to_scalar().unwrap();
        assert!(loss.is_finite());
        assert_eq!(log.calls().len(), 2);
    }
}
