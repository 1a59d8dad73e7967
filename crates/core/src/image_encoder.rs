//! Image encoders that turn images into visual token sequences.
//!
//! Two variants:
//! - `Identity`: the batch already holds `[..., tokens, dim]` features.
//! - `PatchGrid`: a small pre-norm ViT over raw `[batch, channels, h, w]`
//!   pixels that emits one token per grid cell (no class token), the same
//!   grid a ResNet backbone would produce.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Embedding, LayerNorm, Linear, VarBuilder};

use crate::config::{FashionVilConfig, ImageEncoderType, PatchGridParams};

// ─── Patch Embedding ─────────────────────────────────────────────────────────

struct PatchEmbedding {
    proj: Conv2d,
}

impl PatchEmbedding {
    fn new(cfg: &PatchGridParams, vb: VarBuilder) -> Result<Self> {
        let proj = candle_nn::conv2d(
            cfg.num_channels,
            cfg.hidden_size,
            cfg.patch_size,
            Conv2dConfig {
                stride: cfg.patch_size,
                padding: 0,
                dilation: 1,
                groups: 1,
                cudnn_fwd_algo: None,
            },
            vb.pp("patch_embedding"),
        )?;
        Ok(Self { proj })
    }

    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        // [b, c, h, w] -> [b, hidden, gh, gw] -> [b, gh*gw, hidden]
        self.proj.forward(pixel_values)?.flatten(2, 3)?.transpose(1, 2)
    }
}

// ─── Transformer Layer ───────────────────────────────────────────────────────

struct GridAttention {
    qkv: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl GridAttention {
    fn new(cfg: &PatchGridParams, vb: VarBuilder) -> Result<Self> {
        let head_dim = cfg.hidden_size / cfg.num_attention_heads;
        Ok(Self {
            qkv: candle_nn::linear(cfg.hidden_size, 3 * cfg.hidden_size, vb.pp("qkv"))?,
            out_proj: candle_nn::linear(cfg.hidden_size, cfg.hidden_size, vb.pp("out_proj"))?,
            num_heads: cfg.num_attention_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, hidden) = hidden_states.dims3()?;

        // [b, s, 3, heads, hd] -> [3, b, heads, s, hd]
        let qkv = self
            .qkv
            .forward(hidden_states)?
            .reshape((batch_size, seq_len, 3, self.num_heads, self.head_dim))?
            .permute((2, 0, 3, 1, 4))?;
        let q = qkv.get(0)?.contiguous()?;
        let k = qkv.get(1)?.contiguous()?;
        let v = qkv.get(2)?.contiguous()?;

        let attn = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * self.scale)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch_size, seq_len, hidden))?;
        self.out_proj.forward(&out)
    }
}

struct GridEncoderLayer {
    attention: GridAttention,
    fc1: Linear,
    fc2: Linear,
    norm1: LayerNorm,
    norm2: LayerNorm,
}

impl GridEncoderLayer {
    fn new(cfg: &PatchGridParams, vb: VarBuilder) -> Result<Self> {
        let mlp = vb.pp("mlp");
        Ok(Self {
            attention: GridAttention::new(cfg, vb.pp("attn"))?,
            fc1: candle_nn::linear(cfg.hidden_size, cfg.intermediate_size, mlp.pp("fc1"))?,
            fc2: candle_nn::linear(cfg.intermediate_size, cfg.hidden_size, mlp.pp("fc2"))?,
            norm1: candle_nn::layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("norm1"))?,
            norm2: candle_nn::layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("norm2"))?,
        })
    }

    fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let attn = self.attention.forward(&self.norm1.forward(hidden_states)?)?;
        let hidden_states = (hidden_states + attn)?;

        let mlp = self.fc1.forward(&self.norm2.forward(&hidden_states)?)?.gelu_erf()?;
        let mlp = self.fc2.forward(&mlp)?;
        hidden_states + mlp
    }
}

// ─── Encoders ────────────────────────────────────────────────────────────────

/// Pre-norm transformer over a grid of image patches.
pub struct PatchGridEncoder {
    patch_embedding: PatchEmbedding,
    position_embedding: Embedding,
    layers: Vec<GridEncoderLayer>,
    post_layernorm: LayerNorm,
    params: PatchGridParams,
}

impl PatchGridEncoder {
    pub fn new(params: &PatchGridParams, vb: VarBuilder) -> Result<Self> {
        params
            .validate()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let patch_embedding = PatchEmbedding::new(params, vb.clone())?;
        let position_embedding = candle_nn::embedding(
            params.num_patches(),
            params.hidden_size,
            vb.pp("position_embedding"),
        )?;
        let vb_layers = vb.pp("layers");
        let layers = (0..params.num_hidden_layers)
            .map(|i| GridEncoderLayer::new(params, vb_layers.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let post_layernorm = candle_nn::layer_norm(
            params.hidden_size,
            params.layer_norm_eps,
            vb.pp("post_layernorm"),
        )?;
        Ok(Self {
            patch_embedding,
            position_embedding,
            layers,
            post_layernorm,
            params: params.clone(),
        })
    }

    pub fn params(&self) -> &PatchGridParams {
        &self.params
    }

    /// `[b, c, h, w]` pixels to `[b, grid*grid, hidden]` tokens.
    pub fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let (_, _, height, width) = pixel_values.dims4()?;
        if height != self.params.image_size || width != self.params.image_size {
            return Err(candle_core::Error::Msg(format!(
                "expected {0}x{0} images, got {height}x{width}",
                self.params.image_size
            )));
        }
        let mut hidden_states = self.patch_embedding.forward(pixel_values)?;

        let seq_len = hidden_states.dim(1)?;
        let position_ids = Tensor::arange(0u32, seq_len as u32, pixel_values.device())?;
        let positions = self.position_embedding.forward(&position_ids)?;
        hidden_states = hidden_states.broadcast_add(&positions)?;

        for layer in &self.layers {
            hidden_states = layer.forward(&hidden_states)?;
        }
        self.post_layernorm.forward(&hidden_states)
    }
}

/// The image encoder selected by configuration.
pub enum ImageEncoder {
    Identity,
    PatchGrid(PatchGridEncoder),
}

impl ImageEncoder {
    /// Build the encoder `cfg` asks for. Direct feature input always yields
    /// the identity encoder.
    pub fn new(cfg: &FashionVilConfig, vb: VarBuilder) -> Result<Self> {
        match cfg.effective_image_encoder() {
            ImageEncoderType::Identity => Ok(Self::Identity),
            ImageEncoderType::PatchGrid => Ok(Self::PatchGrid(PatchGridEncoder::new(
                &cfg.image_encoder.params,
                vb,
            )?)),
        }
    }

    pub fn kind(&self) -> ImageEncoderType {
        match self {
            Self::Identity => ImageEncoderType::Identity,
            Self::PatchGrid(_) => ImageEncoderType::PatchGrid,
        }
    }

    /// Visual tokens per image, when fixed by the encoder.
    pub fn num_output_tokens(&self) -> Option<usize> {
        match self {
            Self::Identity => None,
            Self::PatchGrid(encoder) => Some(encoder.params().num_patches()),
        }
    }
}

impl Module for ImageEncoder {
    fn forward(&self, image: &Tensor) -> Result<Tensor> {
        match self {
            // leading candidate dims are flattened later by the head
            Self::Identity if image.rank() >= 3 => Ok(image.clone()),
            Self::Identity => Err(candle_core::Error::Msg(format!(
                "expected [batch, tokens, dim] features, got {:?}",
                image.dims()
            ))),
            Self::PatchGrid(encoder) => encoder.forward(image),
        }
    }
}
