//! Expressive speech-to-speech translation core library.
//!
//! - Audio front-end (decode, resample to 44.1 kHz, truncate, WAV output)
//! - Kaldi-style filter banks with utterance and global normalization
//! - Translator / vocoder seams and an ONNX Runtime backend
//! - The request pipeline used by the CLI and the HTTP form

pub mod assets;
pub mod audio;
pub mod card;
pub mod constants;
pub mod fbank;
pub mod features;
pub mod lang;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod pipeline;
pub mod stats;
pub mod translator;
pub mod vocoder;

pub use assets::{ModelAssets, ModelContext};
pub use pipeline::{Pipeline, PipelineError, Translation};
