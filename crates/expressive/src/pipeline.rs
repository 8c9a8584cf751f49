//! Request handler: uploaded clip + target language name → translated speech.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::assets::ModelContext;
use crate::audio::{AudioError, Waveform, preprocess_audio, write_wav};
use crate::features::FeatureError;
use crate::lang::UnknownLanguage;
use crate::translator::translate;
use crate::vocoder::synthesize;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    UnknownLanguage(#[from] UnknownLanguage),
    #[error("failed to read input audio: {0}")]
    Audio(#[from] AudioError),
    #[error("failed to extract features: {0}")]
    Features(#[from] FeatureError),
    #[error("model inference failed: {0:#}")]
    Model(anyhow::Error),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl PipelineError {
    /// Whether the request itself was at fault (bad language or unreadable audio).
    #[must_use]
    pub fn is_input_error(&self) -> bool {
        !matches!(self, Self::Model(_) | Self::Io { .. })
    }
}

/// Result of one `run`.
#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    /// WAV file at the synthesizer's sample rate. Left on disk for the caller.
    pub audio_path: PathBuf,
    pub sample_rate_hz: u32,
    pub text: String,
    /// User-facing notices, e.g. input truncation.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    ctx: Arc<ModelContext>,
    output_dir: PathBuf,
}

impl Pipeline {
    pub fn new(ctx: Arc<ModelContext>) -> Self {
        Self {
            ctx,
            output_dir: std::env::temp_dir(),
        }
    }

    /// Write translated audio under `dir` instead of the system temp directory.
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn context(&self) -> &ModelContext {
        &self.ctx
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Translate the clip at `audio_path` into `target_language` (display name).
    ///
    /// The input file is rewritten in place as preprocessed 44.1 kHz WAV.
    pub fn run(
        &self,
        audio_path: impl AsRef<Path>,
        target_language: &str,
    ) -> Result<Translation, PipelineError> {
        let audio_path = audio_path.as_ref();
        let span = tracing::info_span!("run", target_language, input = %audio_path.display());
        let _enter = span.enter();
        let started = Instant::now();

        let tgt_lang = self.ctx.languages.code_for(target_language)?;

        let t0 = Instant::now();
        let report = preprocess_audio(audio_path)?;
        let preprocess_ms = t0.elapsed().as_millis();

        let bytes = std::fs::read(audio_path).map_err(|source| PipelineError::Io {
            path: audio_path.to_path_buf(),
            source,
        })?;

        let t0 = Instant::now();
        let batch = self.ctx.features.extract(bytes)?;
        let features_ms = t0.elapsed().as_millis();

        let t0 = Instant::now();
        let translated = translate(
            self.ctx.translator.as_ref(),
            &batch,
            tgt_lang,
            &self.ctx.settings,
        )
        .map_err(PipelineError::Model)?;
        let translate_ms = t0.elapsed().as_millis();

        let t0 = Instant::now();
        let speech = synthesize(
            self.ctx.vocoder.as_ref(),
            &translated.units,
            tgt_lang,
            &batch.gcmvn_fbank,
        )
        .map_err(PipelineError::Model)?;
        let synth_ms = t0.elapsed().as_millis();

        let wav = speech
            .audio_wavs
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Model(anyhow::anyhow!("vocoder returned no audio")))?;
        let out = Waveform::new(speech.sample_rate_hz, wav);
        let audio_out = self.write_output(&out)?;

        let text = translated.texts.into_iter().next().unwrap_or_default();
        tracing::info!(
            preprocess_ms,
            features_ms,
            translate_ms,
            synth_ms,
            total_ms = started.elapsed().as_millis(),
            frames = report.frames,
            output = %audio_out.display(),
            "translation finished"
        );

        Ok(Translation {
            audio_path: audio_out,
            sample_rate_hz: out.sample_rate_hz,
            text,
            warnings: report.warnings,
        })
    }

    fn write_output(&self, wave: &Waveform) -> Result<PathBuf, PipelineError> {
        let io_err = |source: std::io::Error| PipelineError::Io {
            path: self.output_dir.clone(),
            source,
        };
        std::fs::create_dir_all(&self.output_dir).map_err(io_err)?;
        let tmp = tempfile::Builder::new()
            .prefix("expressive-")
            .suffix(".wav")
            .tempfile_in(&self.output_dir)
            .map_err(io_err)?;
        // Dropping `tmp` on error removes the partial file.
        write_wav(tmp.path(), wave)?;
        let (_, path) = tmp.keep().map_err(|e| io_err(e.error))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ndarray::Array2;

    use super::*;
    use crate::audio::{decode_file, write_wav};
    use crate::features::SequenceBatch;
    use crate::stats::GcmvnStats;
    use crate::translator::{SpeechTranslator, TranslationOutput, TranslationRequest};
    use crate::vocoder::{BatchedSpeechOutput, UnitVocoder};

    struct Fixed;

    impl SpeechTranslator for Fixed {
        fn predict(&self, request: &TranslationRequest<'_>) -> anyhow::Result<TranslationOutput> {
            Ok(TranslationOutput {
                texts: vec![format!("[{}]", request.tgt_lang)],
                units: vec![vec![1, 2, 3]],
            })
        }
    }

    impl UnitVocoder for Fixed {
        fn predict(
            &self,
            units: &[Vec<i64>],
            _tgt_lang: &str,
            _prosody_input: &SequenceBatch,
        ) -> anyhow::Result<BatchedSpeechOutput> {
            Ok(BatchedSpeechOutput {
                units: units.to_vec(),
                audio_wavs: vec![Array2::zeros((1, 1_600))],
                sample_rate_hz: 16_000,
            })
        }
    }

    fn pipeline(out: &Path) -> Pipeline {
        let ctx = ModelContext::new(Arc::new(Fixed), Arc::new(Fixed), GcmvnStats::identity());
        Pipeline::new(Arc::new(ctx)).with_output_dir(out)
    }

    fn tone(path: &Path) {
        let samples = Array2::from_shape_fn((1, 8_000), |(_, i)| (i as f32 * 0.05).sin() * 0.3);
        write_wav(path, &Waveform::new(16_000, samples)).expect("write input");
    }

    #[test]
    fn run_writes_output_at_vocoder_rate() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let input = tmp.path().join("in.wav");
        tone(&input);

        let out = pipeline(&tmp.path().join("out")).run(&input, "German").expect("run");
        assert_eq!(out.text, "[deu]");
        assert!(out.warnings.is_empty());
        assert!(out.audio_path.starts_with(tmp.path().join("out")));
        let wav = decode_file(&out.audio_path).expect("decode output");
        assert_eq!(wav.sample_rate_hz, 16_000);
        assert_eq!(wav.frames(), 1_600);
    }

    #[test]
    fn unknown_language_fails_before_touching_the_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let input = tmp.path().join("in.wav");
        tone(&input);
        let before = std::fs::read(&input).expect("read");

        let err = pipeline(tmp.path()).run(&input, "Klingon").expect_err("should fail");
        assert!(matches!(err, PipelineError::UnknownLanguage(_)));
        assert!(err.is_input_error());
        assert_eq!(std::fs::read(&input).expect("read"), before);
    }
}
