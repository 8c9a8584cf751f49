//! Model card (`expressive.json`) parsing.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::lang::LANGUAGES;

#[derive(Debug, Clone, Deserialize)]
pub struct ModelCard {
    pub name: String,
    pub translator: TranslatorCard,
    pub vocoder: VocoderCard,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranslatorCard {
    /// ONNX graph file, relative to the checkpoint directory.
    pub graph: String,
    /// `tokenizers` JSON file for the text decoder vocabulary.
    pub text_tokenizer: String,
    pub text_pad_id: i64,
    pub text_eos_id: i64,
    pub unit_pad_id: i64,
    pub unit_eos_id: i64,
    /// Target-language token ids, keyed by language code.
    pub lang_ids: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VocoderCard {
    pub graph: String,
    /// safetensors file holding `gcmvn_mean` / `gcmvn_std`.
    pub gcmvn_stats: String,
    pub sample_rate: u32,
    pub unit_eos_id: i64,
    /// Number of control symbols in front of the unit embedding table.
    #[serde(default = "default_unit_offset")]
    pub unit_offset: i64,
    pub lang_ids: BTreeMap<String, i64>,
}

fn default_unit_offset() -> i64 {
    4
}

impl ModelCard {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let card: Self = serde_json::from_str(json).context("parse expressive.json")?;
        card.validate()?;
        Ok(card)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let json = std::fs::read_to_string(path_ref)
            .with_context(|| format!("read {}", path_ref.display()))?;
        Self::from_json_str(&json)
    }

    /// Files the card refers to, relative to the checkpoint directory.
    pub fn asset_files(&self) -> [&str; 4] {
        [
            self.translator.graph.as_str(),
            self.translator.text_tokenizer.as_str(),
            self.vocoder.graph.as_str(),
            self.vocoder.gcmvn_stats.as_str(),
        ]
    }

    pub fn validate(&self) -> Result<()> {
        for file in self.asset_files() {
            anyhow::ensure!(!file.trim().is_empty(), "asset file names must not be empty");
            anyhow::ensure!(
                !Path::new(file).is_absolute() && !file.contains(".."),
                "asset file {file:?} must stay inside the checkpoint directory"
            );
        }
        anyhow::ensure!(self.vocoder.sample_rate > 0, "vocoder sample_rate must be > 0");
        anyhow::ensure!(self.vocoder.unit_offset >= 0, "vocoder unit_offset must be >= 0");

        for (code, name) in LANGUAGES {
            anyhow::ensure!(
                self.translator.lang_ids.contains_key(code),
                "translator has no token for {name} ({code})"
            );
            anyhow::ensure!(
                self.vocoder.lang_ids.contains_key(code),
                "vocoder has no token for {name} ({code})"
            );
        }
        Ok(())
    }
}
