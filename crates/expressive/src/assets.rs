//! Checkpoint directory resolution and asset loading.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::card::ModelCard;
use crate::constants::AUDIO_SAMPLE_RATE_HZ;
use crate::features::FeatureExtractor;
use crate::lang::LanguageTable;
use crate::stats::GcmvnStats;
use crate::translator::{SpeechTranslator, TranslationSettings};
use crate::vocoder::UnitVocoder;

pub const CARD_FILE: &str = "expressive.json";
pub const DEFAULT_HUB_REPO: &str = "meta-private/SeamlessExpressive";

/// Everything read from the checkpoint directory before the models are built.
#[derive(Debug, Clone)]
pub struct ModelAssets {
    pub dir: PathBuf,
    pub card: ModelCard,
    pub gcmvn: GcmvnStats,
}

fn card_path(dir: &Path) -> PathBuf {
    dir.join(CARD_FILE)
}

impl ModelAssets {
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let card = ModelCard::from_path(card_path(dir)).context("load expressive.json")?;
        for file in card.asset_files() {
            let path = dir.join(file);
            anyhow::ensure!(path.is_file(), "missing checkpoint file {}", path.display());
        }
        let gcmvn = GcmvnStats::load(dir.join(&card.vocoder.gcmvn_stats))
            .with_context(|| format!("load {}", card.vocoder.gcmvn_stats))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            card,
            gcmvn,
        })
    }

    pub fn translator_graph_path(&self) -> PathBuf {
        self.dir.join(&self.card.translator.graph)
    }

    pub fn text_tokenizer_path(&self) -> PathBuf {
        self.dir.join(&self.card.translator.text_tokenizer)
    }

    pub fn vocoder_graph_path(&self) -> PathBuf {
        self.dir.join(&self.card.vocoder.graph)
    }
}

/// Shared, read-only state every request runs against.
pub struct ModelContext {
    pub translator: Arc<dyn SpeechTranslator>,
    pub vocoder: Arc<dyn UnitVocoder>,
    pub features: FeatureExtractor,
    pub languages: LanguageTable,
    pub settings: TranslationSettings,
}

impl ModelContext {
    pub fn new(
        translator: Arc<dyn SpeechTranslator>,
        vocoder: Arc<dyn UnitVocoder>,
        gcmvn: GcmvnStats,
    ) -> Self {
        Self {
            translator,
            vocoder,
            features: FeatureExtractor::new(AUDIO_SAMPLE_RATE_HZ, gcmvn),
            languages: LanguageTable,
            settings: TranslationSettings::default(),
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: TranslationSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Load the ONNX collaborators described by `assets`.
    #[cfg(feature = "onnx")]
    pub fn from_assets(assets: &ModelAssets, use_accelerator: bool) -> Result<Self> {
        let (translator, vocoder) = crate::onnx::load_models(assets, use_accelerator)?;
        Ok(Self::new(
            Arc::new(translator),
            Arc::new(vocoder),
            assets.gcmvn.clone(),
        ))
    }
}

impl std::fmt::Debug for ModelContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelContext")
            .field("features", &self.features)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Source of checkpoint files when the local directory is absent.
pub trait CheckpointSource {
    /// Fetch `file` and return a local path to it.
    fn fetch(&self, file: &str) -> Result<PathBuf>;
}

/// A model repository on the Hugging Face hub.
#[derive(Debug, Clone)]
pub struct HubRepo {
    pub repo_id: String,
}

impl HubRepo {
    pub fn new(repo_id: impl Into<String>) -> Self {
        Self {
            repo_id: repo_id.into(),
        }
    }
}

impl CheckpointSource for HubRepo {
    fn fetch(&self, file: &str) -> Result<PathBuf> {
        use hf_hub::{Repo, RepoType, api::sync::Api};

        let api = Api::new().context("initialize hub client")?;
        let repo = api.repo(Repo::new(self.repo_id.clone(), RepoType::Model));
        repo.get(file)
            .with_context(|| format!("download {file} from {}", self.repo_id))
    }
}

/// Use `dir` when it exists, otherwise download the card and every file it
/// lists into it. Files are staged next to `dir` and moved in once complete.
pub fn resolve_checkpoints(dir: &Path, source: &dyn CheckpointSource) -> Result<PathBuf> {
    if dir.exists() {
        tracing::info!(dir = %dir.display(), "using local checkpoints");
        return Ok(dir.to_path_buf());
    }

    let parent = dir
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .with_context(|| format!("create {}", parent.display()))?;
    let staging = tempfile::Builder::new()
        .prefix(".checkpoints-")
        .tempdir_in(parent)
        .with_context(|| format!("create staging directory in {}", parent.display()))?;

    tracing::info!(dir = %dir.display(), "checkpoints not found locally, downloading");
    let fetched_card = source.fetch(CARD_FILE)?;
    let card = ModelCard::from_path(&fetched_card)?;
    std::fs::copy(&fetched_card, staging.path().join(CARD_FILE))
        .with_context(|| format!("copy {CARD_FILE}"))?;

    for file in card.asset_files() {
        let fetched = source.fetch(file)?;
        let target = staging.path().join(file);
        if let Some(p) = target.parent() {
            std::fs::create_dir_all(p).with_context(|| format!("create {}", p.display()))?;
        }
        std::fs::copy(&fetched, &target).with_context(|| format!("copy {file}"))?;
        tracing::debug!(file, "fetched checkpoint file");
    }

    let staged = staging.keep();
    std::fs::rename(&staged, dir)
        .with_context(|| format!("move checkpoints into {}", dir.display()))?;
    Ok(dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;
    use std::cell::RefCell;
    use std::path::{Path, PathBuf};

    use anyhow::Result;
    use safetensors::tensor::{Dtype, View, serialize_to_file};

    use super::*;
    use crate::card::tests::CARD_JSON;
    use crate::constants::NUM_MEL_BINS;

    struct TestTensor(Vec<u8>, Vec<usize>);

    impl View for TestTensor {
        fn dtype(&self) -> Dtype {
            Dtype::F32
        }
        fn shape(&self) -> &[usize] {
            &self.1
        }
        fn data(&self) -> Cow<'_, [u8]> {
            Cow::Borrowed(&self.0)
        }
        fn data_len(&self) -> usize {
            self.0.len()
        }
    }

    fn tensor(v: f32) -> TestTensor {
        let bytes = std::iter::repeat_n(v, NUM_MEL_BINS)
            .flat_map(f32::to_le_bytes)
            .collect();
        TestTensor(bytes, vec![NUM_MEL_BINS])
    }

    fn write_fixture_checkpoints(dir: &Path) {
        std::fs::create_dir_all(dir).expect("mkdir");
        std::fs::write(dir.join(CARD_FILE), CARD_JSON).expect("write card");
        for f in ["translator.onnx", "tokenizer.json", "vocoder.onnx"] {
            std::fs::write(dir.join(f), b"stub").expect("write stub");
        }
        serialize_to_file(
            vec![("gcmvn_mean", tensor(0.5)), ("gcmvn_std", tensor(2.0))],
            &None,
            &dir.join("gcmvn_stats.safetensors"),
        )
        .expect("write safetensors");
    }

    #[test]
    fn loads_assets_from_checkpoint_dir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_fixture_checkpoints(tmp.path());

        let assets = ModelAssets::load_from_dir(tmp.path()).expect("assets");
        assert_eq!(assets.gcmvn.mean, vec![0.5; NUM_MEL_BINS]);
        assert_eq!(assets.vocoder_graph_path(), tmp.path().join("vocoder.onnx"));
    }

    #[test]
    fn missing_graph_is_reported() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_fixture_checkpoints(tmp.path());
        std::fs::remove_file(tmp.path().join("translator.onnx")).expect("rm");

        let err = ModelAssets::load_from_dir(tmp.path()).expect_err("should fail");
        assert!(err.to_string().contains("translator.onnx"), "{err}");
    }

    struct DirSource {
        root: PathBuf,
        fetched: RefCell<Vec<String>>,
    }

    impl CheckpointSource for DirSource {
        fn fetch(&self, file: &str) -> Result<PathBuf> {
            self.fetched.borrow_mut().push(file.to_string());
            Ok(self.root.join(file))
        }
    }

    #[test]
    fn resolve_downloads_when_missing_and_reuses_afterwards() {
        let remote = tempfile::tempdir().expect("tempdir");
        write_fixture_checkpoints(remote.path());
        let local = tempfile::tempdir().expect("tempdir");
        let target = local.path().join("models");

        let source = DirSource {
            root: remote.path().to_path_buf(),
            fetched: RefCell::new(Vec::new()),
        };
        let dir = resolve_checkpoints(&target, &source).expect("resolve");
        assert_eq!(dir, target);
        assert_eq!(source.fetched.borrow().len(), 5);
        ModelAssets::load_from_dir(&dir).expect("assets after download");

        let again = resolve_checkpoints(&target, &source).expect("resolve again");
        assert_eq!(again, target);
        assert_eq!(source.fetched.borrow().len(), 5);
    }
}
