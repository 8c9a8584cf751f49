#![cfg(feature = "onnx")]

use std::sync::Arc;

use expressive::audio::{Waveform, decode_file, write_wav};
use expressive::{ModelAssets, ModelContext, Pipeline};
use ndarray::Array2;

/// Optional integration test.
///
/// Run locally with:
/// `EXPRESSIVE_CHECKPOINTS=/path/to/models cargo test -p expressive --test e2e_model_env -- --nocapture`
#[test]
fn checkpoints_env_smoke() {
    let Some(dir) = std::env::var_os("EXPRESSIVE_CHECKPOINTS") else {
        eprintln!("skipping: EXPRESSIVE_CHECKPOINTS is not set");
        return;
    };

    let assets = ModelAssets::load_from_dir(&dir).expect("load assets");
    assert!(assets.card.vocoder.sample_rate > 0);
    for code in ["eng", "fra", "deu", "ita", "cmn", "spa"] {
        assert!(assets.card.translator.lang_ids.contains_key(code), "{code}");
    }

    let ctx = ModelContext::from_assets(&assets, false).expect("load models");
    let tmp = tempfile::tempdir().expect("tempdir");
    let input = tmp.path().join("input.wav");
    let samples = Array2::from_shape_fn((1, 44_100 * 2), |(_, i)| {
        (i as f32 * 2.0 * std::f32::consts::PI * 220.0 / 44_100.0).sin() * 0.2
    });
    write_wav(&input, &Waveform::new(44_100, samples)).expect("write input");

    let out = Pipeline::new(Arc::new(ctx))
        .with_output_dir(tmp.path())
        .run(&input, "French")
        .expect("run");
    let wav = decode_file(&out.audio_path).expect("read output");
    assert_eq!(wav.sample_rate_hz, assets.card.vocoder.sample_rate);
    eprintln!("text: {}", out.text);
}
