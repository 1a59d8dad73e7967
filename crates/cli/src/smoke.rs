//! Synthetic batches for exercising a freshly built model end to end.

use candle_core::{DType, Tensor};
use fashionvil_core::image_encoder::ImageEncoder;
use fashionvil_core::{FashionVil, HeadType, SampleList};

/// Shape of a synthetic batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchShape {
    pub batch: usize,
    pub text_len: usize,
    /// Visual tokens per image; ignored when the encoder fixes it.
    pub visual_len: usize,
}

/// Random images (pixels or features, whichever the model takes) for `model`.
fn images(model: &FashionVil, shape: BatchShape) -> candle_core::Result<Tensor> {
    let device = model.device();
    let images = match model.image_encoder() {
        ImageEncoder::PatchGrid(encoder) => {
            let params = encoder.params();
            Tensor::randn(
                0f32,
                1.0,
                (shape.batch, params.num_channels, params.image_size, params.image_size),
                device,
            )
        }
        ImageEncoder::Identity => Tensor::randn(
            0f32,
            1.0,
            (shape.batch, shape.visual_len, model.config().bert.visual_embedding_dim),
            device,
        ),
    }?;
    images.to_dtype(model.dtype())
}

/// A batch carrying every field the model's head reads, plus labels.
pub fn synthetic_batch(
    model: &FashionVil,
    shape: BatchShape,
    task: Option<&str>,
) -> candle_core::Result<SampleList> {
    let device = model.device();
    let BatchShape {
        batch, text_len, ..
    } = shape;
    let vocab = model.config().bert.vocab_size as u32;

    let ids: Vec<u32> = (0..batch * text_len)
        .map(|i| (i as u32 * 31 + 7) % vocab)
        .collect();
    let mut samples = SampleList::new()
        .with("input_ids", Tensor::from_vec(ids, (batch, text_len), device)?)
        .with("segment_ids", Tensor::zeros((batch, text_len), DType::U32, device)?)
        .with("input_mask", Tensor::ones((batch, text_len), DType::U32, device)?);

    match model.head_type() {
        HeadType::Composition => {
            samples.insert("ref_image", images(model, shape)?);
            samples.insert("tar_image", images(model, shape)?);
        }
        HeadType::Classification => {
            samples.insert("image", images(model, shape)?);
            let labels: Vec<u32> = (0..batch)
                .map(|i| (i % model.config().num_labels) as u32)
                .collect();
            samples.insert("targets", Tensor::from_vec(labels, batch, device)?);
        }
        HeadType::Contrastive => {
            samples.insert("image", images(model, shape)?);
        }
        HeadType::Pretraining => {
            samples.insert("image", images(model, shape)?);
            // predict the first token of every caption, ignore the rest
            let labels: Vec<i64> = (0..batch * text_len)
                .map(|i| if i % text_len == 0 { 1 } else { -1 })
                .collect();
            samples.insert("lm_label_ids", Tensor::from_vec(labels, (batch, text_len), device)?);
            let is_correct: Vec<u32> = (0..batch).map(|i| (i % 2) as u32).collect();
            samples.insert("is_correct", Tensor::from_vec(is_correct, batch, device)?);
        }
    }
    Ok(match task {
        Some(task) => samples.with_task(task),
        None => samples,
    })
}
