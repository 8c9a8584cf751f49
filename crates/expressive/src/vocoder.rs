//! Speech synthesizer invoker: units + prosody features → waveform.

use ndarray::{Array2, ArrayView2, s};

use crate::features::SequenceBatch;

/// One waveform per batch example, `[channels, samples]`, at `sample_rate_hz`.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchedSpeechOutput {
    pub units: Vec<Vec<i64>>,
    pub audio_wavs: Vec<Array2<f32>>,
    pub sample_rate_hz: u32,
}

pub trait UnitVocoder: Send + Sync {
    fn predict(
        &self,
        units: &[Vec<i64>],
        tgt_lang: &str,
        prosody_input: &SequenceBatch,
    ) -> anyhow::Result<BatchedSpeechOutput>;
}

/// A single-utterance expressive vocoder model.
pub trait ProsodyVocoderModel: Send + Sync {
    fn output_sample_rate_hz(&self) -> u32;

    /// `units` and `durations` have equal length; `prosody` is `[frames, bins]`.
    fn synthesize(
        &self,
        units: &[i64],
        durations: &[i64],
        tgt_lang: &str,
        prosody: ArrayView2<'_, f32>,
    ) -> anyhow::Result<Array2<f32>>;
}

/// Shift unit ids past the control symbols, append EOS and collapse repeats.
///
/// Returns `(units, durations)`. Durations count repeats at twice the unit
/// frame rate; the trailing EOS gets duration 0.
#[must_use]
pub fn prepare_units(units: &[i64], offset: i64, eos_id: i64) -> (Vec<i64>, Vec<i64>) {
    let mut out_units: Vec<i64> = Vec::with_capacity(units.len() + 1);
    let mut durations: Vec<i64> = Vec::with_capacity(units.len() + 1);

    for u in units.iter().map(|u| u + offset).chain(std::iter::once(eos_id)) {
        match out_units.last() {
            Some(&last) if last == u => {
                if let Some(d) = durations.last_mut() {
                    *d += 1;
                }
            }
            _ => {
                out_units.push(u);
                durations.push(1);
            }
        }
    }

    if let Some(d) = durations.last_mut() {
        *d = 0;
    }
    for d in &mut durations {
        *d *= 2;
    }
    (out_units, durations)
}

/// Drives a [`ProsodyVocoderModel`] example by example.
#[derive(Debug, Clone)]
pub struct PretsselGenerator<M> {
    model: M,
    unit_offset: i64,
    unit_eos_id: i64,
}

impl<M: ProsodyVocoderModel> PretsselGenerator<M> {
    pub fn new(model: M, unit_offset: i64, unit_eos_id: i64) -> Self {
        Self {
            model,
            unit_offset,
            unit_eos_id,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }
}

impl<M: ProsodyVocoderModel> UnitVocoder for PretsselGenerator<M> {
    fn predict(
        &self,
        units: &[Vec<i64>],
        tgt_lang: &str,
        prosody_input: &SequenceBatch,
    ) -> anyhow::Result<BatchedSpeechOutput> {
        anyhow::ensure!(
            units.len() == prosody_input.batch_size(),
            "got {} unit sequence(s) for a prosody batch of {}",
            units.len(),
            prosody_input.batch_size()
        );

        let mut audio_wavs = Vec::with_capacity(units.len());
        for (i, u) in units.iter().enumerate() {
            let (prepared, durations) = prepare_units(u, self.unit_offset, self.unit_eos_id);
            let len = prosody_input.seq_lens[i];
            let prosody = prosody_input.seqs.slice(s![i, ..len, ..]);
            let wav = self.model.synthesize(&prepared, &durations, tgt_lang, prosody)?;
            audio_wavs.push(wav);
        }

        Ok(BatchedSpeechOutput {
            units: units.to_vec(),
            audio_wavs,
            sample_rate_hz: self.model.output_sample_rate_hz(),
        })
    }
}

/// Synthesize the translated units of a batch.
pub fn synthesize(
    vocoder: &dyn UnitVocoder,
    units: &[Vec<i64>],
    tgt_lang: &str,
    prosody_input: &SequenceBatch,
) -> anyhow::Result<BatchedSpeechOutput> {
    let out = vocoder.predict(units, tgt_lang, prosody_input)?;
    anyhow::ensure!(out.sample_rate_hz > 0, "vocoder reported a zero sample rate");
    anyhow::ensure!(
        out.audio_wavs.len() == units.len(),
        "vocoder returned {} waveform(s) for {} unit sequence(s)",
        out.audio_wavs.len(),
        units.len()
    );
    Ok(out)
}
