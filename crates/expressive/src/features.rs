//! Feature extraction: decode → filter bank → standardize → collate.

use ndarray::{Array2, Array3, Axis, s};
use thiserror::Error;

use crate::audio::{AudioError, decode_bytes};
use crate::constants::{NUM_MEL_BINS, PAD_VALUE};
use crate::fbank::{FbankComputer, FbankConfig};
use crate::stats::GcmvnStats;

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error(transparent)]
    Audio(#[from] AudioError),
    #[error(
        "audio too short for feature extraction: {frames} frame(s), need at least 2 ({samples} samples at {sample_rate_hz} Hz)"
    )]
    TooShort {
        frames: usize,
        samples: usize,
        sample_rate_hz: u32,
    },
    #[error("audio must be preprocessed to {expected} Hz, got {got} Hz")]
    SampleRate { expected: u32, got: u32 },
    #[error("cannot collate an empty batch")]
    EmptyBatch,
    #[error("feature dimension mismatch: expected {expected}, got {got}")]
    DimMismatch { expected: usize, got: usize },
}

/// Spectral variants of one utterance, all `[frames, bins]`.
#[derive(Debug, Clone, PartialEq)]
pub struct FbankOutput {
    /// Standardized per utterance.
    pub fbank: Array2<f32>,
    /// Standardized with the global gcmvn statistics.
    pub gcmvn_fbank: Array2<f32>,
    pub sample_rate_hz: u32,
}

/// Subtract the per-bin mean and divide by the per-bin (unbiased) std over time.
pub fn standardize_in_place(fbank: &mut Array2<f32>) {
    let n = fbank.nrows();
    if n == 0 {
        return;
    }
    let Some(mean) = fbank.mean_axis(Axis(0)) else {
        return;
    };
    let ddof = if n > 1 { 1.0 } else { 0.0 };
    let std = fbank.std_axis(Axis(0), ddof);
    for mut row in fbank.rows_mut() {
        for ((v, m), s) in row.iter_mut().zip(mean.iter()).zip(std.iter()) {
            *v = (*v - m) / s;
        }
    }
}

/// Build both standardized variants from a raw filter bank.
pub fn normalize_fbank(
    raw: &Array2<f32>,
    stats: &GcmvnStats,
    sample_rate_hz: u32,
) -> Result<FbankOutput, FeatureError> {
    if raw.ncols() != stats.mean.len() {
        return Err(FeatureError::DimMismatch {
            expected: stats.mean.len(),
            got: raw.ncols(),
        });
    }

    let mut fbank = raw.clone();
    standardize_in_place(&mut fbank);

    let mut gcmvn_fbank = raw.clone();
    for mut row in gcmvn_fbank.rows_mut() {
        for ((v, m), s) in row.iter_mut().zip(stats.mean.iter()).zip(stats.std.iter()) {
            *v = (*v - m) / s;
        }
    }

    Ok(FbankOutput {
        fbank,
        gcmvn_fbank,
        sample_rate_hz,
    })
}

/// Padded batch of sequences: `seqs` is `[batch, frames, bins]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceBatch {
    pub seqs: Array3<f32>,
    pub seq_lens: Vec<usize>,
}

impl SequenceBatch {
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.seqs.len_of(Axis(0))
    }

    #[must_use]
    pub fn max_len(&self) -> usize {
        self.seqs.len_of(Axis(1))
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.seqs.len_of(Axis(2))
    }
}

/// Batch of both feature variants, as handed to the collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureBatch {
    pub fbank: SequenceBatch,
    pub gcmvn_fbank: SequenceBatch,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Collater {
    pub pad_value: f32,
    pub pad_to_multiple: usize,
}

impl Default for Collater {
    fn default() -> Self {
        Self {
            pad_value: PAD_VALUE,
            pad_to_multiple: 1,
        }
    }
}

impl Collater {
    /// Stack `[frames, bins]` sequences into a padded `[batch, frames, bins]` batch.
    pub fn collate_seqs(&self, seqs: &[&Array2<f32>]) -> Result<SequenceBatch, FeatureError> {
        let first = seqs.first().ok_or(FeatureError::EmptyBatch)?;
        let dim = first.ncols();
        if let Some(bad) = seqs.iter().find(|s| s.ncols() != dim) {
            return Err(FeatureError::DimMismatch {
                expected: dim,
                got: bad.ncols(),
            });
        }

        let seq_lens: Vec<usize> = seqs.iter().map(|s| s.nrows()).collect();
        let mut max_len = seq_lens.iter().copied().max().unwrap_or(0);
        let multiple = self.pad_to_multiple.max(1);
        if max_len % multiple != 0 {
            max_len += multiple - max_len % multiple;
        }

        let mut out = Array3::from_elem((seqs.len(), max_len, dim), self.pad_value);
        for (b, seq) in seqs.iter().enumerate() {
            out.slice_mut(s![b, ..seq.nrows(), ..]).assign(*seq);
        }

        Ok(SequenceBatch {
            seqs: out,
            seq_lens,
        })
    }

    pub fn collate(&self, examples: &[FbankOutput]) -> Result<FeatureBatch, FeatureError> {
        let fbank: Vec<&Array2<f32>> = examples.iter().map(|e| &e.fbank).collect();
        let gcmvn: Vec<&Array2<f32>> = examples.iter().map(|e| &e.gcmvn_fbank).collect();
        Ok(FeatureBatch {
            fbank: self.collate_seqs(&fbank)?,
            gcmvn_fbank: self.collate_seqs(&gcmvn)?,
        })
    }
}

/// Turns preprocessed audio bytes into a single-example [`FeatureBatch`].
#[derive(Debug)]
pub struct FeatureExtractor {
    fbank: FbankComputer,
    stats: GcmvnStats,
    collater: Collater,
}

impl FeatureExtractor {
    #[must_use]
    pub fn new(sample_rate_hz: u32, stats: GcmvnStats) -> Self {
        Self {
            fbank: FbankComputer::new(FbankConfig::default(), sample_rate_hz),
            stats,
            collater: Collater::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> &GcmvnStats {
        &self.stats
    }

    /// Compute the normalized filter banks of one clip. The clip must already
    /// be at the extractor's rate (see [`crate::audio::preprocess_audio`]).
    pub fn features(&self, bytes: Vec<u8>) -> Result<FbankOutput, FeatureError> {
        let wave = decode_bytes(bytes, None)?;
        if wave.sample_rate_hz != self.fbank.sample_rate_hz() {
            return Err(FeatureError::SampleRate {
                expected: self.fbank.sample_rate_hz(),
                got: wave.sample_rate_hz,
            });
        }

        let raw = self.fbank.compute(&wave);
        debug_assert_eq!(raw.ncols(), NUM_MEL_BINS);
        if raw.nrows() < 2 {
            return Err(FeatureError::TooShort {
                frames: raw.nrows(),
                samples: wave.frames(),
                sample_rate_hz: wave.sample_rate_hz,
            });
        }

        normalize_fbank(&raw, &self.stats, wave.sample_rate_hz)
    }

    /// Decode, featurize and collate one clip into a batch of one.
    pub fn extract(&self, bytes: Vec<u8>) -> Result<FeatureBatch, FeatureError> {
        let example = self.features(bytes)?;
        let batch = self.collater.collate(std::slice::from_ref(&example))?;
        tracing::debug!(
            frames = batch.fbank.max_len(),
            bins = batch.fbank.dim(),
            "extracted features"
        );
        Ok(batch)
    }
}
