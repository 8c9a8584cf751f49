//! ONNX Runtime backend for the translator and the vocoder.
//!
//! Graph contract (names are fixed by the export):
//!
//! translator inputs: `fbank` f32 `[B, T, 80]`, `fbank_lens` i64 `[B]`,
//! `prosody_fbank` f32 `[B, T, 80]`, `prosody_lens` i64 `[B]`, `tgt_lang` i64 `[1]`,
//! `{text,unit}_beam_size`, `{text,unit}_max_len_a`, `{text,unit}_max_len_b` i64 `[1]`
//! (`-1` for unconstrained), `unit_ngram_filtering` i64 `[1]`, `duration_factor` f32 `[1]`.
//! Outputs: `text_tokens` i64 `[B, L]`, `units` i64 `[B, U]`, both right-padded.
//!
//! vocoder inputs: `units` i64 `[1, N]`, `durations` i64 `[1, N]`, `tgt_lang` i64 `[1]`,
//! `prosody_fbank` f32 `[1, T, 80]`. Output: `waveform` f32 `[1, C, S]` or `[1, S]`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use ndarray::{Array2, ArrayView2};
use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;
use tokenizers::Tokenizer;

use crate::assets::ModelAssets;
use crate::features::SequenceBatch;
use crate::translator::{
    GenerationOptions, SpeechTranslator, TranslationOutput, TranslationRequest,
};
use crate::vocoder::{PretsselGenerator, ProsodyVocoderModel};

/// Whether a CUDA device is usable by ONNX Runtime.
pub fn accelerator_available() -> bool {
    CUDAExecutionProvider::default().is_available().unwrap_or(false)
}

fn open_session(path: &Path, use_accelerator: bool) -> Result<Session> {
    let mut builder = Session::builder()
        .map_err(|e| anyhow!("failed to create session builder: {e}"))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| anyhow!("failed to set optimization level: {e}"))?;
    if use_accelerator {
        builder = builder
            .with_execution_providers([CUDAExecutionProvider::default().build()])
            .map_err(|e| anyhow!("failed to register CUDA execution provider: {e}"))?;
    }
    builder
        .commit_from_file(path)
        .map_err(|e| anyhow!("failed to load {}: {e}", path.display()))
}

fn scalar_i64(v: i64) -> Result<Tensor<i64>> {
    Tensor::from_array(([1usize], vec![v])).map_err(|e| anyhow!("failed to create tensor: {e}"))
}

fn batch_tensor(batch: &SequenceBatch) -> Result<(Tensor<f32>, Tensor<i64>)> {
    let (b, t, d) = batch.seqs.dim();
    let data: Vec<f32> = batch.seqs.as_standard_layout().iter().copied().collect();
    let seqs = Tensor::from_array(([b, t, d], data))
        .map_err(|e| anyhow!("failed to create feature tensor: {e}"))?;
    let lens: Vec<i64> = batch.seq_lens.iter().map(|&l| l as i64).collect();
    let lens = Tensor::from_array(([b], lens))
        .map_err(|e| anyhow!("failed to create length tensor: {e}"))?;
    Ok((seqs, lens))
}

fn max_len_inputs(opts: &GenerationOptions) -> (i64, i64) {
    opts.soft_max_seq_len.unwrap_or((-1, -1))
}

fn lang_id(ids: &BTreeMap<String, i64>, code: &str) -> Result<i64> {
    ids.get(code)
        .copied()
        .with_context(|| format!("model card has no token for language {code:?}"))
}

/// Split a right-padded `[B, L]` output into per-row sequences, stopping at
/// the first pad or EOS.
fn unpad_rows(shape: &[i64], data: &[i64], pad_id: i64, eos_id: i64) -> Result<Vec<Vec<i64>>> {
    anyhow::ensure!(shape.len() == 2, "expected a [batch, len] output, got shape {shape:?}");
    let rows = usize::try_from(shape[0]).context("negative batch dimension")?;
    let cols = usize::try_from(shape[1]).context("negative length dimension")?;
    anyhow::ensure!(data.len() == rows * cols, "output data does not match its shape");

    Ok((0..rows)
        .map(|r| {
            data[r * cols..(r + 1) * cols]
                .iter()
                .copied()
                .take_while(|&id| id != pad_id && id != eos_id)
                .collect()
        })
        .collect())
}

pub struct OnnxTranslator {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    lang_ids: BTreeMap<String, i64>,
    text_pad_id: i64,
    text_eos_id: i64,
    unit_pad_id: i64,
    unit_eos_id: i64,
}

impl OnnxTranslator {
    pub fn load(assets: &ModelAssets, use_accelerator: bool) -> Result<Self> {
        let card = &assets.card.translator;
        let session = open_session(&assets.translator_graph_path(), use_accelerator)
            .context("load translator graph")?;
        let tokenizer = Tokenizer::from_file(assets.text_tokenizer_path())
            .map_err(anyhow::Error::msg)
            .context("load text tokenizer")?;
        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            lang_ids: card.lang_ids.clone(),
            text_pad_id: card.text_pad_id,
            text_eos_id: card.text_eos_id,
            unit_pad_id: card.unit_pad_id,
            unit_eos_id: card.unit_eos_id,
        })
    }
}

impl SpeechTranslator for OnnxTranslator {
    fn predict(&self, request: &TranslationRequest<'_>) -> Result<TranslationOutput> {
        anyhow::ensure!(
            request.src_lang.is_none(),
            "the exported translator detects the source language itself"
        );
        let settings = request.settings;
        let (fbank, fbank_lens) = batch_tensor(request.input)?;
        let (prosody, prosody_lens) = batch_tensor(request.prosody_input)?;
        let (text_a, text_b) = max_len_inputs(&settings.text);
        let (unit_a, unit_b) = max_len_inputs(&settings.unit);
        let duration_factor = Tensor::from_array(([1usize], vec![settings.duration_factor]))
            .map_err(|e| anyhow!("failed to create tensor: {e}"))?;

        let inputs = ort::inputs![
            "fbank" => fbank,
            "fbank_lens" => fbank_lens,
            "prosody_fbank" => prosody,
            "prosody_lens" => prosody_lens,
            "tgt_lang" => scalar_i64(lang_id(&self.lang_ids, request.tgt_lang)?)?,
            "text_beam_size" => scalar_i64(settings.text.beam_size as i64)?,
            "text_max_len_a" => scalar_i64(text_a)?,
            "text_max_len_b" => scalar_i64(text_b)?,
            "unit_beam_size" => scalar_i64(settings.unit.beam_size as i64)?,
            "unit_max_len_a" => scalar_i64(unit_a)?,
            "unit_max_len_b" => scalar_i64(unit_b)?,
            "unit_ngram_filtering" => scalar_i64(i64::from(settings.unit_ngram_filtering))?,
            "duration_factor" => duration_factor,
        ];

        let (text_rows, unit_rows) = {
            let mut session = self
                .session
                .lock()
                .map_err(|_| anyhow!("translator session lock poisoned"))?;
            let outputs = session
                .run(inputs)
                .map_err(|e| anyhow!("translator inference failed: {e}"))?;

            let text = outputs
                .get("text_tokens")
                .context("missing 'text_tokens' in translator outputs")?;
            let (shape, data) = text
                .try_extract_tensor::<i64>()
                .map_err(|e| anyhow!("failed to extract text tokens: {e}"))?;
            let text_rows = unpad_rows(shape, data, self.text_pad_id, self.text_eos_id)?;

            let units = outputs
                .get("units")
                .context("missing 'units' in translator outputs")?;
            let (shape, data) = units
                .try_extract_tensor::<i64>()
                .map_err(|e| anyhow!("failed to extract units: {e}"))?;
            let unit_rows = unpad_rows(shape, data, self.unit_pad_id, self.unit_eos_id)?;
            (text_rows, unit_rows)
        };

        let texts = text_rows
            .iter()
            .map(|row| {
                let ids: Vec<u32> = row.iter().filter_map(|&id| u32::try_from(id).ok()).collect();
                self.tokenizer
                    .decode(&ids, true)
                    .map_err(anyhow::Error::msg)
                    .context("decode text tokens")
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(TranslationOutput {
            texts,
            units: unit_rows,
        })
    }
}

pub struct OnnxVocoder {
    session: Mutex<Session>,
    lang_ids: BTreeMap<String, i64>,
    sample_rate_hz: u32,
}

impl OnnxVocoder {
    pub fn load(assets: &ModelAssets, use_accelerator: bool) -> Result<Self> {
        let card = &assets.card.vocoder;
        let session = open_session(&assets.vocoder_graph_path(), use_accelerator)
            .context("load vocoder graph")?;
        Ok(Self {
            session: Mutex::new(session),
            lang_ids: card.lang_ids.clone(),
            sample_rate_hz: card.sample_rate,
        })
    }
}

impl ProsodyVocoderModel for OnnxVocoder {
    fn output_sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }

    fn synthesize(
        &self,
        units: &[i64],
        durations: &[i64],
        tgt_lang: &str,
        prosody: ArrayView2<'_, f32>,
    ) -> Result<Array2<f32>> {
        anyhow::ensure!(units.len() == durations.len(), "units/durations length mismatch");
        let n = units.len();
        let units = Tensor::from_array(([1usize, n], units.to_vec()))
            .map_err(|e| anyhow!("failed to create units tensor: {e}"))?;
        let durations = Tensor::from_array(([1usize, n], durations.to_vec()))
            .map_err(|e| anyhow!("failed to create durations tensor: {e}"))?;
        let (t, d) = prosody.dim();
        let prosody_data: Vec<f32> = prosody.as_standard_layout().iter().copied().collect();
        let prosody = Tensor::from_array(([1usize, t, d], prosody_data))
            .map_err(|e| anyhow!("failed to create prosody tensor: {e}"))?;

        let inputs = ort::inputs![
            "units" => units,
            "durations" => durations,
            "tgt_lang" => scalar_i64(lang_id(&self.lang_ids, tgt_lang)?)?,
            "prosody_fbank" => prosody,
        ];

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("vocoder session lock poisoned"))?;
        let outputs = session
            .run(inputs)
            .map_err(|e| anyhow!("vocoder inference failed: {e}"))?;
        let wav = outputs
            .get("waveform")
            .context("missing 'waveform' in vocoder outputs")?;
        let (shape, data) = wav
            .try_extract_tensor::<f32>()
            .map_err(|e| anyhow!("failed to extract waveform: {e}"))?;

        let samples = shape.last().copied().unwrap_or(0).max(0) as usize;
        anyhow::ensure!(samples > 0, "vocoder produced an empty waveform");
        let channels = data.len() / samples;
        Array2::from_shape_vec((channels, samples), data.to_vec()).context("reshape waveform")
    }
}

/// Load both collaborators from a resolved checkpoint directory.
pub fn load_models(
    assets: &ModelAssets,
    use_accelerator: bool,
) -> Result<(OnnxTranslator, PretsselGenerator<OnnxVocoder>)> {
    let translator = OnnxTranslator::load(assets, use_accelerator)?;
    let vocoder = OnnxVocoder::load(assets, use_accelerator)?;
    let generator = PretsselGenerator::new(
        vocoder,
        assets.card.vocoder.unit_offset,
        assets.card.vocoder.unit_eos_id,
    );
    Ok((translator, generator))
}

#[cfg(test)]
mod tests {
    use super::unpad_rows;

    #[test]
    fn unpad_rows_stops_at_pad_or_eos() {
        let rows = unpad_rows(&[2, 4], &[5, 6, 3, 0, 7, 0, 0, 0], 0, 3).expect("rows");
        assert_eq!(rows, vec![vec![5, 6], vec![7]]);
    }

    #[test]
    fn unpad_rows_checks_shape() {
        assert!(unpad_rows(&[2], &[1, 2], 0, 3).is_err());
        assert!(unpad_rows(&[2, 2], &[1, 2, 3], 0, 3).is_err());
    }
}
