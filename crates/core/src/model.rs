//! The top-level FashionViL model.
//!
//! A model is an image encoder plus one task head. Each keeps its variables
//! in its own [`VarMap`], which is what the two optimizer parameter groups
//! and the two checkpoint prefixes are cut along.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::MutexGuard;

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};

use crate::config::{
    FashionVilConfig, HeadType, ImageEncoderType, OptimizerConfig, IMAGE_ENCODER_LR_MULTIPLIER,
};
use crate::error::{FashionVilError, Result};
use crate::heads::{Head, BACKBONE_PREFIX};
use crate::image_encoder::ImageEncoder;
use crate::output::ModelOutput;
use crate::sample::SampleList;

/// Checkpoint prefix of the image encoder variables.
pub const IMAGE_ENCODER_PREFIX: &str = "image_encoder";
/// Checkpoint prefix of the head variables, backbone included.
pub const MODEL_PREFIX: &str = "model";

/// Text embedding tables copied onto their visual counterparts at build time.
const VISUAL_INIT_PAIRS: [(&str, &str); 2] = [
    (
        "bert.embeddings.token_type_embeddings.weight",
        "bert.embeddings.token_type_embeddings_visual.weight",
    ),
    (
        "bert.embeddings.position_embeddings.weight",
        "bert.embeddings.position_embeddings_visual.weight",
    ),
];

/// Variables sharing one learning rate.
pub struct ParamGroup {
    pub name: &'static str,
    pub params: Vec<Var>,
    pub lr: f64,
}

impl ParamGroup {
    pub fn num_parameters(&self) -> usize {
        self.params.iter().map(|var| var.elem_count()).sum()
    }

    /// AdamW over this group, at the group's learning rate.
    pub fn adamw(&self, params: ParamsAdamW) -> Result<AdamW> {
        let params = ParamsAdamW {
            lr: self.lr,
            ..params
        };
        Ok(AdamW::new(self.params.clone(), params)?)
    }
}

/// Keys that did not line up while loading a checkpoint.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    /// Live variables the file had no tensor for.
    pub missing: Vec<String>,
    /// Tensors in the file no variable claimed.
    pub unexpected: Vec<String>,
}

pub struct FashionVil {
    config: FashionVilConfig,
    head_type: HeadType,
    image_encoder: ImageEncoder,
    head: Head,
    image_encoder_vars: VarMap,
    head_vars: VarMap,
    dtype: DType,
    device: Device,
}

impl FashionVil {
    /// Validate `config`, then build the image encoder and the configured
    /// head with freshly initialized variables.
    pub fn build(config: FashionVilConfig, dtype: DType, device: &Device) -> Result<Self> {
        let head_type = config.validate()?;

        let image_encoder_vars = VarMap::new();
        let image_encoder = ImageEncoder::new(
            &config,
            VarBuilder::from_varmap(&image_encoder_vars, dtype, device),
        )?;

        let head_vars = VarMap::new();
        let head = Head::new(
            head_type,
            &config,
            VarBuilder::from_varmap(&head_vars, dtype, device),
        )?;

        let model = Self {
            config,
            head_type,
            image_encoder,
            head,
            image_encoder_vars,
            head_vars,
            dtype,
            device: device.clone(),
        };

        if model.config.special_visual_initialize {
            model.initialize_visual_from_text()?;
        }
        if model.config.freeze_base {
            let frozen: usize = model
                .named_vars(&model.head_vars)?
                .iter()
                .filter(|(name, _)| is_backbone_var(name))
                .map(|(_, var)| var.elem_count())
                .sum();
            tracing::debug!(parameters = frozen, "froze backbone parameters");
        }

        tracing::info!(
            head = %model.head_type,
            image_encoder = ?model.image_encoder.kind(),
            prompt = model.head.prefix_prompts().is_some(),
            parameters = model.num_parameters()?,
            "built FashionViL model"
        );
        Ok(model)
    }

    pub fn config(&self) -> &FashionVilConfig {
        &self.config
    }

    pub fn head_type(&self) -> HeadType {
        self.head_type
    }

    pub fn head(&self) -> &Head {
        &self.head
    }

    pub fn image_encoder(&self) -> &ImageEncoder {
        &self.image_encoder
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn prefix_prompts(&self) -> Option<&Tensor> {
        self.head.prefix_prompts()
    }

    /// Encode the batch images, then run the head.
    pub fn forward(&self, mut samples: SampleList) -> Result<ModelOutput> {
        let image_fields: &[&str] = match self.head_type {
            HeadType::Composition => &["ref_image", "tar_image"],
            _ => &["image"],
        };
        for field in image_fields {
            samples.map_field(field, |image| Ok(self.image_encoder.forward(&image)?))?;
        }
        self.head.forward(samples)
    }

    /// Trainable parameters across both variable maps.
    pub fn num_parameters(&self) -> Result<usize> {
        Ok(self
            .parameter_groups(&OptimizerConfig::default())?
            .iter()
            .map(ParamGroup::num_parameters)
            .sum())
    }

    /// The two optimizer groups: the image encoder at
    /// [`IMAGE_ENCODER_LR_MULTIPLIER`] times the base rate, then everything
    /// else at the base rate. Frozen backbone variables are left out.
    pub fn parameter_groups(&self, optimizer: &OptimizerConfig) -> Result<Vec<ParamGroup>> {
        let lr = optimizer.params.lr;
        let image_encoder = self
            .named_vars(&self.image_encoder_vars)?
            .into_iter()
            .map(|(_, var)| var)
            .collect();
        let model = self
            .named_vars(&self.head_vars)?
            .into_iter()
            .filter(|(name, _)| !(self.config.freeze_base && is_backbone_var(name)))
            .map(|(_, var)| var)
            .collect();

        Ok(vec![
            ParamGroup {
                name: IMAGE_ENCODER_PREFIX,
                params: image_encoder,
                lr: lr * IMAGE_ENCODER_LR_MULTIPLIER,
            },
            ParamGroup {
                name: MODEL_PREFIX,
                params: model,
                lr,
            },
        ])
    }

    /// One AdamW per parameter group, sharing `optimizer.params` apart from
    /// the learning rate.
    pub fn optimizers(&self, optimizer: &OptimizerConfig) -> Result<Vec<AdamW>> {
        let params = ParamsAdamW {
            weight_decay: optimizer.params.weight_decay,
            eps: optimizer.params.eps,
            ..Default::default()
        };
        self.parameter_groups(optimizer)?
            .iter()
            .map(|group| group.adamw(params.clone()))
            .collect()
    }

    /// Write every variable to one safetensors file.
    pub fn save_checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        for (prefix, varmap) in self.var_maps() {
            for (name, var) in self.named_vars(varmap)? {
                tensors.insert(format!("{prefix}.{name}"), var.as_tensor().clone());
            }
        }
        candle_core::safetensors::save(&tensors, path)
            .map_err(|e| FashionVilError::Checkpoint(format!("{}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), tensors = tensors.len(), "saved checkpoint");
        Ok(())
    }

    /// Copy the tensors of a checkpoint into the live variables.
    ///
    /// Keys that match nothing are reported and logged, never fatal. A
    /// matching key with the wrong shape is an error, and then no variable
    /// is touched.
    pub fn load_checkpoint(&self, path: impl AsRef<Path>) -> Result<LoadReport> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, &self.device)
            .map_err(|e| FashionVilError::Checkpoint(format!("{}: {e}", path.display())))?;

        let mut report = LoadReport::default();
        let mut claimed = HashSet::new();
        let mut updates = Vec::new();
        for (prefix, varmap) in self.var_maps() {
            for (name, var) in self.named_vars(varmap)? {
                let key = format!("{prefix}.{name}");
                match tensors.get(&key) {
                    Some(tensor) => {
                        if tensor.shape() != var.shape() {
                            return Err(FashionVilError::Checkpoint(format!(
                                "{key}: expected shape {:?}, got {:?}",
                                var.dims(),
                                tensor.dims()
                            )));
                        }
                        let converted = tensor.to_dtype(var.dtype())?;
                        updates.push((var, converted));
                        claimed.insert(key);
                    }
                    None => report.missing.push(key),
                }
            }
        }
        for (var, tensor) in &updates {
            var.set(tensor)?;
        }
        report.loaded = updates.len();
        report.unexpected = tensors
            .keys()
            .filter(|key| !claimed.contains(*key))
            .cloned()
            .collect();
        report.unexpected.sort();

        if !report.missing.is_empty() {
            tracing::warn!(keys = ?report.missing, "checkpoint is missing keys");
        }
        if !report.unexpected.is_empty() {
            tracing::warn!(keys = ?report.unexpected, "checkpoint has unexpected keys");
        }
        tracing::info!(path = %path.display(), loaded = report.loaded, "loaded checkpoint");
        Ok(report)
    }

    fn var_maps(&self) -> [(&'static str, &VarMap); 2] {
        [
            (IMAGE_ENCODER_PREFIX, &self.image_encoder_vars),
            (MODEL_PREFIX, &self.head_vars),
        ]
    }

    /// `(name, var)` pairs sorted by name.
    fn named_vars(&self, varmap: &VarMap) -> Result<Vec<(String, Var)>> {
        let mut vars: Vec<(String, Var)> = lock_vars(varmap)?
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }

    /// Start the visual token-type and position tables from the text ones.
    fn initialize_visual_from_text(&self) -> Result<()> {
        let vars = lock_vars(&self.head_vars)?;
        for (text, visual) in VISUAL_INIT_PAIRS {
            let source = vars
                .get(text)
                .ok_or_else(|| FashionVilError::MissingField(text.to_string()))?;
            let target = vars
                .get(visual)
                .ok_or_else(|| FashionVilError::MissingField(visual.to_string()))?;
            target.set(source.as_tensor())?;
        }
        tracing::debug!("initialized visual embeddings from text embeddings");
        Ok(())
    }

    /// Whether images enter as raw pixels.
    pub fn takes_pixels(&self) -> bool {
        self.image_encoder.kind() == ImageEncoderType::PatchGrid
    }
}

fn is_backbone_var(name: &str) -> bool {
    name.strip_prefix(BACKBONE_PREFIX)
        .is_some_and(|rest| rest.starts_with('.'))
}

fn lock_vars(varmap: &VarMap) -> Result<MutexGuard<'_, HashMap<String, Var>>> {
    varmap
        .data()
        .lock()
        .map_err(|_| FashionVilError::Checkpoint("variable map lock poisoned".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BertConfig;
    use crate::heads::NUM_PROMPT_TOKENS;
    use crate::output::{SCORES, TARGETS};
    use crate::testing::{composition_batch, tiny_fashionvil_config};

    fn tiny(head_type: HeadType) -> FashionVil {
        FashionVil::build(tiny_fashionvil_config(head_type), DType::F32, &Device::Cpu).unwrap()
    }

    fn var(model: &FashionVil, name: &str) -> Tensor {
        lock_vars(&model.head_vars).unwrap()[name].as_tensor().clone()
    }

    #[test]
    fn unknown_head_type_fails_build() {
        let mut cfg = tiny_fashionvil_config(HeadType::Composition);
        cfg.training_head_type = "unknown".into();
        match FashionVil::build(cfg, DType::F32, &Device::Cpu) {
            Err(FashionVilError::UnsupportedHeadType(name)) => assert_eq!(name, "unknown"),
            Err(other) => panic!("expected UnsupportedHeadType, got {other:?}"),
            Ok(_) => panic!("expected UnsupportedHeadType"),
        }
    }

    #[test]
    fn prompt_has_bert_base_width() {
        let mut cfg = tiny_fashionvil_config(HeadType::Composition);
        cfg.enable_prompt = true;
        cfg.bert = BertConfig {
            num_hidden_layers: 1,
            intermediate_size: 32,
            vocab_size: 50,
            max_position_embeddings: 32,
            visual_embedding_dim: 8,
            ..BertConfig::default()
        };
        let model = FashionVil::build(cfg, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(
            model.prefix_prompts().unwrap().dims(),
            &[1, NUM_PROMPT_TOKENS, 768]
        );

        let without = tiny(HeadType::Composition);
        assert!(without.prefix_prompts().is_none());
    }

    #[test]
    fn two_groups_with_boosted_image_encoder_rate() {
        let mut cfg = tiny_fashionvil_config(HeadType::Contrastive);
        cfg.direct_features_input = false;
        cfg.image_encoder.params = crate::config::PatchGridParams {
            image_size: 16,
            patch_size: 8,
            num_channels: 3,
            hidden_size: 8,
            intermediate_size: 16,
            num_attention_heads: 2,
            num_hidden_layers: 1,
            layer_norm_eps: 1e-5,
        };
        let model = FashionVil::build(cfg, DType::F32, &Device::Cpu).unwrap();
        assert!(model.takes_pixels());

        let optimizer = OptimizerConfig::default();
        let groups = model.parameter_groups(&optimizer).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, IMAGE_ENCODER_PREFIX);
        assert_eq!(groups[1].name, MODEL_PREFIX);
        assert!((groups[0].lr / groups[1].lr - 20.0).abs() < 1e-9);
        assert!(groups[0].num_parameters() > 0);
        assert!(groups[1].num_parameters() > 0);
        assert_eq!(model.optimizers(&optimizer).unwrap().len(), 2);
    }

    #[test]
    fn identity_encoder_yields_an_empty_first_group() {
        let model = tiny(HeadType::Classification);
        let groups = model.parameter_groups(&OptimizerConfig::default()).unwrap();
        assert_eq!(groups.len(), 2);
        assert!(groups[0].params.is_empty());
    }

    #[test]
    fn freeze_base_drops_backbone_variables() {
        let model = tiny(HeadType::Contrastive);
        let all = model.parameter_groups(&OptimizerConfig::default()).unwrap()[1].params.len();

        let mut cfg = tiny_fashionvil_config(HeadType::Contrastive);
        cfg.freeze_base = true;
        let frozen = FashionVil::build(cfg, DType::F32, &Device::Cpu).unwrap();
        let groups = frozen.parameter_groups(&OptimizerConfig::default()).unwrap();
        // only norm_layer.norm_s survives
        assert_eq!(groups[1].params.len(), 1);
        assert!(all > 1);
    }

    #[test]
    fn special_visual_initialize_copies_text_tables() {
        let model = tiny(HeadType::Composition);
        for (text, visual) in VISUAL_INIT_PAIRS {
            let diff: f32 = (var(&model, text) - var(&model, visual))
                .unwrap()
                .abs()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_scalar()
                .unwrap();
            assert_eq!(diff, 0.0, "{visual} differs from {text}");
        }

        let mut cfg = tiny_fashionvil_config(HeadType::Composition);
        cfg.special_visual_initialize = false;
        let model = FashionVil::build(cfg, DType::F32, &Device::Cpu).unwrap();
        let (text, visual) = VISUAL_INIT_PAIRS[1];
        let diff: f32 = (var(&model, text) - var(&model, visual))
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff > 0.0);
    }

    #[test]
    fn composition_forward_matches_widths() {
        let mut cfg = tiny_fashionvil_config(HeadType::Composition);
        cfg.enable_prompt = true;
        let model = FashionVil::build(cfg, DType::F32, &Device::Cpu).unwrap();
        let out = model.forward(composition_batch(2, 5, 3, 8)).unwrap();
        assert_eq!(out.get(SCORES).unwrap().dims(), &[2, 16]);
        assert_eq!(out.get(TARGETS).unwrap().dims(), &[2, 16]);
    }

    #[test]
    fn checkpoint_round_trip_reproduces_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fashionvil.safetensors");

        let mut cfg = tiny_fashionvil_config(HeadType::Composition);
        cfg.enable_prompt = true;
        let trained = FashionVil::build(cfg.clone(), DType::F32, &Device::Cpu).unwrap();
        trained.save_checkpoint(&path).unwrap();

        let fresh = FashionVil::build(cfg, DType::F32, &Device::Cpu).unwrap();
        let report = fresh.load_checkpoint(&path).unwrap();
        assert!(report.missing.is_empty());
        assert!(report.unexpected.is_empty());
        assert!(report.loaded > 0);

        let a: Vec<Vec<f32>> = trained
            .forward(composition_batch(2, 5, 3, 8))
            .unwrap()
            .scores()
            .unwrap()
            .to_vec2()
            .unwrap();
        let b: Vec<Vec<f32>> = fresh
            .forward(composition_batch(2, 5, 3, 8))
            .unwrap()
            .scores()
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn checkpoint_from_another_head_reports_key_mismatches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("contrastive.safetensors");
        tiny(HeadType::Contrastive).save_checkpoint(&path).unwrap();

        let report = tiny(HeadType::Classification).load_checkpoint(&path).unwrap();
        assert!(report.missing.iter().any(|k| k.starts_with("model.classifier")));
        assert_eq!(report.unexpected, vec!["model.norm_layer.norm_s".to_string()]);
    }

    #[test]
    fn wrong_shape_checkpoint_leaves_variables_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad_shape.safetensors");

        let source = tiny(HeadType::Contrastive);
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        for (name, var) in source.named_vars(&source.head_vars).unwrap() {
            tensors.insert(format!("{MODEL_PREFIX}.{name}"), var.as_tensor().clone());
        }
        // sorts after every bert.* key, so the good keys are seen first
        tensors.insert(
            format!("{MODEL_PREFIX}.norm_layer.norm_s"),
            Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let target = tiny(HeadType::Contrastive);
        let before: Vec<(String, Vec<f32>)> = target
            .named_vars(&target.head_vars)
            .unwrap()
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().flatten_all().unwrap().to_vec1().unwrap()))
            .collect();

        match target.load_checkpoint(&path) {
            Err(FashionVilError::Checkpoint(msg)) => assert!(msg.contains("norm_layer.norm_s")),
            Err(other) => panic!("expected Checkpoint, got {other:?}"),
            Ok(_) => panic!("expected a shape error"),
        }

        let after: Vec<(String, Vec<f32>)> = target
            .named_vars(&target.head_vars)
            .unwrap()
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().flatten_all().unwrap().to_vec1().unwrap()))
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn missing_checkpoint_file_is_a_checkpoint_error() {
        let model = tiny(HeadType::Contrastive);
        assert!(matches!(
            model.load_checkpoint("/nonexistent/fashionvil.safetensors"),
            Err(FashionVilError::Checkpoint(_))
        ));
    }

    #[test]
    fn backbone_prefix_match_is_exact() {
        assert!(is_backbone_var("bert.embeddings.word_embeddings.weight"));
        assert!(!is_backbone_var("bertish.weight"));
        assert!(!is_backbone_var("norm_layer.norm_s"));
    }
}
