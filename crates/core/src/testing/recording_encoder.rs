use std::sync::{Arc, Mutex};

use candle_core::{DType, Tensor};

use crate::backbone::{EncoderOutput, JointEncoder};

/// One call made against a [`RecordingEncoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderCall {
    Image {
        mask_len: usize,
        prompt_len: Option<usize>,
    },
    Text {
        mask_len: usize,
    },
    Joint {
        mask_len: usize,
        prompt_len: Option<usize>,
    },
}

/// Shared handle on the calls a [`RecordingEncoder`] has seen.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<EncoderCall>>>,
}

impl CallLog {
    pub fn calls(&self) -> Vec<EncoderCall> {
        self.calls.lock().expect("call log poisoned").clone()
    }

    fn push(&self, call: EncoderCall) {
        self.calls.lock().expect("call log poisoned").push(call);
    }
}

/// A mock backbone that records the mask and prompt lengths it receives.
///
/// Every call returns ones of shape `[batch, mask_len, hidden]`, so the
/// output always lines up with the attention mask the head built.
pub struct RecordingEncoder {
    hidden_size: usize,
    log: CallLog,
}

impl RecordingEncoder {
    pub fn new(hidden_size: usize) -> (Self, CallLog) {
        let log = CallLog::default();
        (
            Self {
                hidden_size,
                log: log.clone(),
            },
            log,
        )
    }

    fn output(&self, attention_mask: &Tensor) -> candle_core::Result<EncoderOutput> {
        let (batch, mask_len) = attention_mask.dims2()?;
        let embeddings = Tensor::ones(
            (batch, mask_len, self.hidden_size),
            DType::F32,
            attention_mask.device(),
        )?;
        Ok(EncoderOutput::new(embeddings))
    }
}

fn prompt_len(prompt: Option<&Tensor>) -> candle_core::Result<Option<usize>> {
    prompt.map(|p| p.dim(1)).transpose()
}

impl JointEncoder for RecordingEncoder {
    fn get_image_embedding(
        &self,
        _image: &Tensor,
        _visual_type_ids: &Tensor,
        attention_mask: &Tensor,
        prompt: Option<&Tensor>,
    ) -> candle_core::Result<EncoderOutput> {
        self.log.push(EncoderCall::Image {
            mask_len: attention_mask.dim(1)?,
            prompt_len: prompt_len(prompt)?,
        });
        self.output(attention_mask)
    }

    fn get_text_embedding(
        &self,
        _input_ids: &Tensor,
        _segment_ids: &Tensor,
        attention_mask: &Tensor,
    ) -> candle_core::Result<EncoderOutput> {
        self.log.push(EncoderCall::Text {
            mask_len: attention_mask.dim(1)?,
        });
        self.output(attention_mask)
    }

    fn get_joint_embedding(
        &self,
        _input_ids: &Tensor,
        _segment_ids: &Tensor,
        _image: &Tensor,
        _visual_type_ids: &Tensor,
        attention_mask: &Tensor,
        prompt: Option<&Tensor>,
    ) -> candle_core::Result<EncoderOutput> {
        self.log.push(EncoderCall::Joint {
            mask_len: attention_mask.dim(1)?,
            prompt_len: prompt_len(prompt)?,
        });
        self.output(attention_mask)
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn output_follows_mask_length() {
        let (encoder, log) = RecordingEncoder::new(4);
        let mask = Tensor::ones((2, 7), DType::U32, &Device::Cpu).unwrap();
        let ids = Tensor::zeros((2, 7), DType::U32, &Device::Cpu).unwrap();

        let out = encoder.get_text_embedding(&ids, &ids, &mask).unwrap();
        assert_eq!(out.embeddings.dims(), &[2, 7, 4]);
        assert_eq!(log.calls(), vec![EncoderCall::Text { mask_len: 7 }]);
    }
}
