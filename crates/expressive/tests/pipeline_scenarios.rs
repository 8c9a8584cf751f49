use std::path::Path;
use std::sync::{Arc, Mutex};

use expressive::audio::{Waveform, decode_file, too_long_warning, write_wav};
use expressive::constants::MAX_INPUT_AUDIO_SAMPLES;
use expressive::features::SequenceBatch;
use expressive::stats::GcmvnStats;
use expressive::translator::{SpeechTranslator, TranslationOutput, TranslationRequest};
use expressive::vocoder::{BatchedSpeechOutput, UnitVocoder};
use expressive::{ModelContext, Pipeline, PipelineError};
use ndarray::Array2;

/// Deterministic stand-in: text depends on the target language and the input
/// features, units on the number of input frames.
#[derive(Default)]
struct MockTranslator {
    input_frames: Mutex<Vec<usize>>,
}

impl SpeechTranslator for MockTranslator {
    fn predict(&self, request: &TranslationRequest<'_>) -> anyhow::Result<TranslationOutput> {
        let frames = request.input.seq_lens[0];
        self.input_frames.lock().expect("lock").push(frames);
        let checksum: f64 = request.input.seqs.iter().map(|v| f64::from(*v).abs()).sum();
        Ok(TranslationOutput {
            texts: vec![format!("{} {frames} {checksum:.3}", request.tgt_lang)],
            units: vec![(0..(frames / 4) as i64).map(|i| i % 7).collect()],
        })
    }
}

struct MockVocoder;

const VOCODER_RATE_HZ: u32 = 16_000;

impl UnitVocoder for MockVocoder {
    fn predict(
        &self,
        units: &[Vec<i64>],
        _tgt_lang: &str,
        prosody_input: &SequenceBatch,
    ) -> anyhow::Result<BatchedSpeechOutput> {
        let audio_wavs = units
            .iter()
            .map(|u| {
                Array2::from_shape_fn((1, 320 * u.len().max(1)), |(_, i)| {
                    (i as f32 * 0.01).sin() * 0.1
                })
            })
            .collect();
        assert_eq!(prosody_input.batch_size(), units.len());
        Ok(BatchedSpeechOutput {
            units: units.to_vec(),
            audio_wavs,
            sample_rate_hz: VOCODER_RATE_HZ,
        })
    }
}

fn pipeline(out_dir: &Path) -> (Pipeline, Arc<MockTranslator>) {
    let translator = Arc::new(MockTranslator::default());
    let ctx = ModelContext::new(
        translator.clone(),
        Arc::new(MockVocoder),
        GcmvnStats::identity(),
    );
    (Pipeline::new(Arc::new(ctx)).with_output_dir(out_dir), translator)
}

fn write_tone(path: &Path, sample_rate_hz: u32, secs: f32) {
    let frames = (sample_rate_hz as f32 * secs) as usize;
    let samples = Array2::from_shape_fn((1, frames), |(_, i)| {
        let t = i as f32 / sample_rate_hz as f32;
        0.3 * (2.0 * std::f32::consts::PI * 330.0 * t).sin()
    });
    write_wav(path, &Waveform::new(sample_rate_hz, samples)).expect("write input");
}

fn outputs_in(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

#[test]
fn french_request_yields_text_and_readable_audio() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let input = tmp.path().join("clip.wav");
    write_tone(&input, 22_050, 3.0);
    let out_dir = tmp.path().join("out");
    let (pipeline, _) = pipeline(&out_dir);

    let result = pipeline.run(&input, "French").expect("run");
    assert!(result.text.starts_with("fra "), "{}", result.text);
    assert!(result.warnings.is_empty());
    assert_eq!(result.sample_rate_hz, VOCODER_RATE_HZ);

    let wav = decode_file(&result.audio_path).expect("read output wav");
    assert_eq!(wav.sample_rate_hz, VOCODER_RATE_HZ);
    assert!(wav.frames() > 0);

    let preprocessed = decode_file(&input).expect("read preprocessed input");
    assert_eq!(preprocessed.sample_rate_hz, 44_100);
    assert!((preprocessed.duration_secs() - 3.0).abs() < 0.01);
}

#[test]
fn long_spanish_request_is_truncated_before_feature_extraction() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let input = tmp.path().join("long.wav");
    write_tone(&input, 44_100, 90.0);
    let (pipeline, translator) = pipeline(&tmp.path().join("out"));

    let result = pipeline.run(&input, "Spanish").expect("run");
    assert_eq!(result.warnings, vec![too_long_warning()]);
    assert!(result.text.starts_with("spa "));

    let preprocessed = decode_file(&input).expect("read preprocessed input");
    assert_eq!(preprocessed.frames(), MAX_INPUT_AUDIO_SAMPLES);

    // 25 ms windows every 10 ms over exactly 60 s at 44.1 kHz.
    let frames = translator.input_frames.lock().expect("lock");
    assert_eq!(*frames, vec![5_998]);
}

#[test]
fn empty_file_fails_to_decode_and_writes_nothing() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let input = tmp.path().join("empty.mp3");
    std::fs::write(&input, b"").expect("write empty");
    let out_dir = tmp.path().join("out");
    let (pipeline, translator) = pipeline(&out_dir);

    let err = pipeline.run(&input, "French").expect_err("should fail");
    assert!(matches!(err, PipelineError::Audio(_)), "{err}");
    assert!(err.is_input_error());
    assert_eq!(outputs_in(&out_dir), 0);
    assert!(translator.input_frames.lock().expect("lock").is_empty());
}

#[test]
fn unknown_language_is_a_lookup_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let input = tmp.path().join("clip.wav");
    write_tone(&input, 16_000, 1.0);
    let (pipeline, _) = pipeline(&tmp.path().join("out"));

    let err = pipeline.run(&input, "fra").expect_err("codes are not display names");
    assert!(matches!(err, PipelineError::UnknownLanguage(_)));
}

#[test]
fn same_input_gives_same_text() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (pipeline, _) = pipeline(&tmp.path().join("out"));

    let mut texts = Vec::new();
    for i in 0..2 {
        let input = tmp.path().join(format!("clip{i}.wav"));
        write_tone(&input, 48_000, 2.0);
        texts.push(pipeline.run(&input, "Mandarin Chinese").expect("run").text);
    }
    assert_eq!(texts[0], texts[1]);
    assert!(texts[0].starts_with("cmn "));
}
