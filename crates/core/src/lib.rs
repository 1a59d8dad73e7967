//! FashionViL task heads and model on candle.
//!
//! A [`FashionVil`] model pairs an image encoder with one task head built on
//! a shared VisualBERT-style joint encoder. Batches go in as a
//! [`SampleList`] and come out as a [`ModelOutput`].

pub mod backbone;
pub mod config;
pub mod error;
pub mod heads;
pub mod image_encoder;
pub mod layers;
pub mod losses;
pub mod model;
pub mod output;
pub mod sample;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{FashionVilConfig, HeadType, OptimizerConfig};
pub use error::{FashionVilError, Result};
pub use model::{FashionVil, LoadReport, ParamGroup};
pub use output::ModelOutput;
pub use sample::SampleList;
