//! VisualBERT-style joint encoder.
//!
//! A BERT encoder whose input sequence is text tokens followed by projected
//! visual tokens:
//! - Text: word + absolute position + segment embeddings
//! - Visual: linear projection of region/grid features + visual segment
//!   embeddings + visual position embeddings (all positions zero)
//! - One shared LayerNorm over the concatenated sequence
//! - Bidirectional attention with an additive padding mask
//! - Optional learned prefix prompt prepended after the embedding layer
//!
//! Weight paths follow the HuggingFace/MMF layout under `bert.`:
//! - `embeddings.{word,position,token_type}_embeddings.weight`
//! - `embeddings.{token_type,position}_embeddings_visual.weight`
//! - `embeddings.projection.{weight,bias}`
//! - `encoder.layer.{i}.{attention,intermediate,output}.*`

use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, VarBuilder};

use super::{extended_attention_mask, EncoderOutput, JointEncoder};
use crate::config::BertConfig;

// ─── Embeddings ──────────────────────────────────────────────────────────────

struct VisualBertEmbeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    projection: Linear,
    token_type_embeddings_visual: Embedding,
    position_embeddings_visual: Embedding,
    layer_norm: LayerNorm,
    max_position_embeddings: usize,
}

impl VisualBertEmbeddings {
    fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.hidden_size;
        Ok(Self {
            word_embeddings: embedding(cfg.vocab_size, hidden, vb.pp("word_embeddings"))?,
            position_embeddings: embedding(
                cfg.max_position_embeddings,
                hidden,
                vb.pp("position_embeddings"),
            )?,
            token_type_embeddings: embedding(
                cfg.type_vocab_size,
                hidden,
                vb.pp("token_type_embeddings"),
            )?,
            projection: linear(cfg.visual_embedding_dim, hidden, vb.pp("projection"))?,
            token_type_embeddings_visual: embedding(
                cfg.type_vocab_size,
                hidden,
                vb.pp("token_type_embeddings_visual"),
            )?,
            position_embeddings_visual: embedding(
                cfg.max_position_embeddings,
                hidden,
                vb.pp("position_embeddings_visual"),
            )?,
            layer_norm: layer_norm(hidden, cfg.layer_norm_eps, vb.pp("LayerNorm"))?,
            max_position_embeddings: cfg.max_position_embeddings,
        })
    }

    /// Text embeddings before normalization.
    fn text(&self, input_ids: &Tensor, segment_ids: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len) = input_ids.dims2()?;
        if seq_len > self.max_position_embeddings {
            return Err(candle_core::Error::Msg(format!(
                "text length {seq_len} exceeds max_position_embeddings {}",
                self.max_position_embeddings
            )));
        }
        let word_emb = self.word_embeddings.forward(input_ids)?;

        let position_ids = Tensor::arange(0u32, seq_len as u32, input_ids.device())?
            .unsqueeze(0)?
            .expand((batch_size, seq_len))?
            .contiguous()?;
        let pos_emb = self.position_embeddings.forward(&position_ids)?;
        let type_emb = self.token_type_embeddings.forward(segment_ids)?;

        (word_emb + pos_emb)?.add(&type_emb)
    }

    /// Visual embeddings before normalization.
    fn visual(&self, image: &Tensor, visual_type_ids: &Tensor) -> Result<Tensor> {
        let (batch_size, num_tokens, _dim) = image.dims3()?;
        let projected = self.projection.forward(image)?;
        let type_emb = self.token_type_embeddings_visual.forward(visual_type_ids)?;

        let position_ids = Tensor::zeros((batch_size, num_tokens), DType::U32, image.device())?;
        let pos_emb = self.position_embeddings_visual.forward(&position_ids)?;

        (projected + type_emb)?.add(&pos_emb)
    }

    fn normalize(&self, embeddings: &Tensor) -> Result<Tensor> {
        self.layer_norm.forward(embeddings)
    }
}

// ─── Self-Attention ──────────────────────────────────────────────────────────

struct BertSelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl BertSelfAttention {
    fn new(hidden_size: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let head_dim = hidden_size / num_heads;
        Ok(Self {
            query: linear(hidden_size, hidden_size, vb.pp("query"))?,
            key: linear(hidden_size, hidden_size, vb.pp("key"))?,
            value: linear(hidden_size, hidden_size, vb.pp("value"))?,
            num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn split_heads(&self, xs: &Tensor, batch_size: usize, seq_len: usize) -> Result<Tensor> {
        xs.reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(&self, hidden_states: &Tensor, mask_bias: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, _hidden_size) = hidden_states.dims3()?;

        let q = self.split_heads(&self.query.forward(hidden_states)?, batch_size, seq_len)?;
        let k = self.split_heads(&self.key.forward(hidden_states)?, batch_size, seq_len)?;
        let v = self.split_heads(&self.value.forward(hidden_states)?, batch_size, seq_len)?;

        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * self.scale)?;
        let scores = scores.broadcast_add(mask_bias)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;

        probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch_size, seq_len, self.num_heads * self.head_dim))
    }
}

/// Dense + residual + LayerNorm, used after attention and after the FFN.
struct BertResidualOutput {
    dense: Linear,
    layer_norm: LayerNorm,
}

impl BertResidualOutput {
    fn new(in_dim: usize, hidden_size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            dense: linear(in_dim, hidden_size, vb.pp("dense"))?,
            layer_norm: layer_norm(hidden_size, eps, vb.pp("LayerNorm"))?,
        })
    }

    fn forward(&self, hidden_states: &Tensor, residual: &Tensor) -> Result<Tensor> {
        let hidden_states = self.dense.forward(hidden_states)?;
        self.layer_norm.forward(&(hidden_states + residual)?)
    }
}

// ─── Encoder Layer ──────────────────────────────────────────────────────────

struct BertLayer {
    self_attention: BertSelfAttention,
    attention_output: BertResidualOutput,
    intermediate: Linear,
    output: BertResidualOutput,
}

impl BertLayer {
    fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let eps = cfg.layer_norm_eps;
        let attention = vb.pp("attention");
        Ok(Self {
            self_attention: BertSelfAttention::new(
                cfg.hidden_size,
                cfg.num_attention_heads,
                attention.pp("self"),
            )?,
            attention_output: BertResidualOutput::new(
                cfg.hidden_size,
                cfg.hidden_size,
                eps,
                attention.pp("output"),
            )?,
            intermediate: linear(
                cfg.hidden_size,
                cfg.intermediate_size,
                vb.pp("intermediate").pp("dense"),
            )?,
            output: BertResidualOutput::new(
                cfg.intermediate_size,
                cfg.hidden_size,
                eps,
                vb.pp("output"),
            )?,
        })
    }

    fn forward(&self, hidden_states: &Tensor, mask_bias: &Tensor) -> Result<Tensor> {
        let attn = self.self_attention.forward(hidden_states, mask_bias)?;
        let attn = self.attention_output.forward(&attn, hidden_states)?;
        let intermediate = self.intermediate.forward(&attn)?.gelu_erf()?;
        self.output.forward(&intermediate, &attn)
    }
}

struct BertEncoder {
    layers: Vec<BertLayer>,
}

impl BertEncoder {
    fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| BertLayer::new(cfg, vb.pp(format!("layer.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    fn forward(&self, mut hidden_states: Tensor, mask_bias: &Tensor) -> Result<Tensor> {
        for layer in &self.layers {
            hidden_states = layer.forward(&hidden_states, mask_bias)?;
        }
        Ok(hidden_states)
    }
}

// ─── Joint Encoder ──────────────────────────────────────────────────────────

/// BERT encoder over text and visual tokens.
pub struct VisualBert {
    embeddings: VisualBertEmbeddings,
    encoder: BertEncoder,
    hidden_size: usize,
    bypass_transformer: bool,
}

impl VisualBert {
    /// Build the encoder. `vb` should already point at the `bert` prefix.
    ///
    /// With `bypass_transformer`, image-only calls skip the transformer
    /// layers and return the normalized visual embeddings directly.
    pub fn new(cfg: &BertConfig, bypass_transformer: bool, vb: VarBuilder) -> Result<Self> {
        let embeddings = VisualBertEmbeddings::new(cfg, vb.pp("embeddings"))?;
        let encoder = BertEncoder::new(cfg, vb.pp("encoder"))?;
        Ok(Self {
            embeddings,
            encoder,
            hidden_size: cfg.hidden_size,
            bypass_transformer,
        })
    }

    /// Prepend the prompt, check the mask and run the transformer.
    fn encode(
        &self,
        embeddings: Tensor,
        attention_mask: &Tensor,
        prompt: Option<&Tensor>,
    ) -> Result<EncoderOutput> {
        let embeddings = match prompt {
            Some(prompt) => prepend_prompt(&embeddings, prompt)?,
            None => embeddings,
        };
        let (batch_size, seq_len, _) = embeddings.dims3()?;
        let (mask_batch, mask_len) = attention_mask.dims2()?;
        if mask_batch != batch_size || mask_len != seq_len {
            return Err(candle_core::Error::Msg(format!(
                "attention mask shape [{mask_batch}, {mask_len}] does not match sequence [{batch_size}, {seq_len}]"
            )));
        }

        let mask_bias = extended_attention_mask(attention_mask, embeddings.dtype())?;
        let hidden_states = self.encoder.forward(embeddings.clone(), &mask_bias)?;
        Ok(EncoderOutput {
            embeddings: hidden_states,
            auxiliary: (Some(embeddings), None),
        })
    }
}

/// `[1, p, h]` prompt broadcast over the batch and placed before `xs`.
fn prepend_prompt(xs: &Tensor, prompt: &Tensor) -> Result<Tensor> {
    let (batch_size, _, hidden) = xs.dims3()?;
    let (_, prompt_len, _) = prompt.dims3()?;
    let prompt = prompt
        .to_dtype(xs.dtype())?
        .broadcast_as((batch_size, prompt_len, hidden))?
        .contiguous()?;
    Tensor::cat(&[&prompt, xs], 1)
}

impl JointEncoder for VisualBert {
    fn get_image_embedding(
        &self,
        image: &Tensor,
        visual_type_ids: &Tensor,
        attention_mask: &Tensor,
        prompt: Option<&Tensor>,
    ) -> Result<EncoderOutput> {
        let visual = self.embeddings.visual(image, visual_type_ids)?;
        let visual = self.embeddings.normalize(&visual)?;
        if self.bypass_transformer {
            return Ok(EncoderOutput::new(visual));
        }
        self.encode(visual, attention_mask, prompt)
    }

    fn get_text_embedding(
        &self,
        input_ids: &Tensor,
        segment_ids: &Tensor,
        attention_mask: &Tensor,
    ) -> Result<EncoderOutput> {
        let text = self.embeddings.text(input_ids, segment_ids)?;
        let text = self.embeddings.normalize(&text)?;
        self.encode(text, attention_mask, None)
    }

    fn get_joint_embedding(
        &self,
        input_ids: &Tensor,
        segment_ids: &Tensor,
        image: &Tensor,
        visual_type_ids: &Tensor,
        attention_mask: &Tensor,
        prompt: Option<&Tensor>,
    ) -> Result<EncoderOutput> {
        let text = self.embeddings.text(input_ids, segment_ids)?;
        let visual = self.embeddings.visual(image, visual_type_ids)?;
        let joint = Tensor::cat(&[&text, &visual], 1)?;
        let joint = self.embeddings.normalize(&joint)?;
        self.encode(joint, attention_mask, prompt)
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}
