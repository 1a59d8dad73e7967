//! Shared test utilities for fashionvil-core.
//!
//! This module provides a recording mock backbone, tiny model
//! configurations and ready-made sample batches for the head tests.

mod recording_encoder;
mod tiny_config;

pub use recording_encoder::{CallLog, EncoderCall, RecordingEncoder};
pub use tiny_config::{composition_batch, image_text_batch, tiny_bert_config, tiny_fashionvil_config};
