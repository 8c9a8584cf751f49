//! Translation invoker: the seam in front of the speech translator.

use crate::constants::{BEAM_SIZE, DURATION_FACTOR, UNIT_SOFT_MAX_SEQ_LEN};
use crate::features::{FeatureBatch, SequenceBatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Speech-to-speech translation.
    S2st,
}

impl Task {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::S2st => "S2ST",
        }
    }
}

/// Beam search settings for one generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationOptions {
    pub beam_size: usize,
    /// `(a, b)` caps the output at `a * source_len + b`; `None` leaves it unconstrained.
    pub soft_max_seq_len: Option<(i64, i64)>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TranslationSettings {
    pub text: GenerationOptions,
    pub unit: GenerationOptions,
    pub unit_ngram_filtering: bool,
    pub duration_factor: f32,
}

impl Default for TranslationSettings {
    fn default() -> Self {
        Self {
            text: GenerationOptions {
                beam_size: BEAM_SIZE,
                soft_max_seq_len: None,
            },
            unit: GenerationOptions {
                beam_size: BEAM_SIZE,
                soft_max_seq_len: Some(UNIT_SOFT_MAX_SEQ_LEN),
            },
            unit_ngram_filtering: false,
            duration_factor: DURATION_FACTOR,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TranslationRequest<'a> {
    pub input: &'a SequenceBatch,
    pub task: Task,
    pub tgt_lang: &'a str,
    /// `None` lets the translator detect the source language.
    pub src_lang: Option<&'a str>,
    pub settings: &'a TranslationSettings,
    pub prosody_input: &'a SequenceBatch,
}

/// Text and discrete units, one entry per batch example.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TranslationOutput {
    pub texts: Vec<String>,
    pub units: Vec<Vec<i64>>,
}

pub trait SpeechTranslator: Send + Sync {
    fn predict(&self, request: &TranslationRequest<'_>) -> anyhow::Result<TranslationOutput>;
}

/// Run the translator on the self-standardized features, conditioning on the
/// gcmvn features.
pub fn translate(
    translator: &dyn SpeechTranslator,
    batch: &FeatureBatch,
    tgt_lang: &str,
    settings: &TranslationSettings,
) -> anyhow::Result<TranslationOutput> {
    let request = TranslationRequest {
        input: &batch.fbank,
        task: Task::S2st,
        tgt_lang,
        src_lang: None,
        settings,
        prosody_input: &batch.gcmvn_fbank,
    };
    let out = translator.predict(&request)?;
    anyhow::ensure!(
        out.texts.len() == batch.fbank.batch_size() && out.units.len() == batch.fbank.batch_size(),
        "translator returned {} text(s) and {} unit sequence(s) for a batch of {}",
        out.texts.len(),
        out.units.len(),
        batch.fbank.batch_size()
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use ndarray::Array3;

    use super::*;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<(String, Option<String>, TranslationSettings, f32, f32)>>,
    }

    impl SpeechTranslator for Recording {
        fn predict(&self, request: &TranslationRequest<'_>) -> anyhow::Result<TranslationOutput> {
            assert_eq!(request.task, Task::S2st);
            self.seen.lock().expect("lock").push((
                request.tgt_lang.to_string(),
                request.src_lang.map(str::to_string),
                *request.settings,
                request.input.seqs[[0, 0, 0]],
                request.prosody_input.seqs[[0, 0, 0]],
            ));
            Ok(TranslationOutput {
                texts: vec!["bonjour".into()],
                units: vec![vec![1, 2, 3]],
            })
        }
    }

    fn batch() -> FeatureBatch {
        let one = |v: f32| SequenceBatch {
            seqs: Array3::from_elem((1, 2, 80), v),
            seq_lens: vec![2],
        };
        FeatureBatch {
            fbank: one(1.0),
            gcmvn_fbank: one(2.0),
        }
    }

    #[test]
    fn default_settings_match_the_demo() {
        let s = TranslationSettings::default();
        assert_eq!(s.text.beam_size, 5);
        assert_eq!(s.text.soft_max_seq_len, None);
        assert_eq!(s.unit.beam_size, 5);
        assert_eq!(s.unit.soft_max_seq_len, Some((25, 50)));
        assert!(!s.unit_ngram_filtering);
        assert_eq!(s.duration_factor, 1.0);
        assert_eq!(Task::S2st.as_str(), "S2ST");
    }

    #[test]
    fn translate_routes_features_and_settings() {
        let t = Recording::default();
        let out = translate(&t, &batch(), "fra", &TranslationSettings::default()).expect("translate");
        assert_eq!(out.texts, vec!["bonjour".to_string()]);

        let seen = t.seen.lock().expect("lock");
        let (lang, src, settings, input, prosody) = &seen[0];
        assert_eq!(lang, "fra");
        assert_eq!(*src, None);
        assert_eq!(*settings, TranslationSettings::default());
        assert_eq!(*input, 1.0);
        assert_eq!(*prosody, 2.0);
    }

    #[test]
    fn translate_rejects_mismatched_batch() {
        struct Empty;
        impl SpeechTranslator for Empty {
            fn predict(&self, _: &TranslationRequest<'_>) -> anyhow::Result<TranslationOutput> {
                Ok(TranslationOutput::default())
            }
        }
        assert!(translate(&Empty, &batch(), "fra", &TranslationSettings::default()).is_err());
    }
}
