use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use expressive::assets::{HubRepo, ModelAssets, ModelContext, resolve_checkpoints};
use expressive::lang::LanguageTable;
use expressive::pipeline::Pipeline;

mod config;
mod logging;
mod page;
mod server;

use config::{Args, Command};
use server::{AppState, ServerConfig};

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init_logging(&args.log_config())?;

    match args.command.clone().unwrap_or(Command::Serve) {
        Command::Serve => serve(&args),
        Command::Translate {
            audio,
            target_language,
            output,
        } => translate(&args, &audio, &target_language, output.as_deref()),
        Command::InspectModel => inspect_model(&args),
    }
}

fn load_assets(args: &Args) -> Result<ModelAssets> {
    let dir = resolve_checkpoints(&args.checkpoints_path, &HubRepo::new(&args.hub_repo))
        .context("resolve checkpoints")?;
    ModelAssets::load_from_dir(&dir).context("load model assets")
}

/// Returns the context and whether an accelerator is in use.
#[cfg(feature = "onnx")]
fn load_context(args: &Args) -> Result<(ModelContext, bool)> {
    let assets = load_assets(args)?;
    let accelerator = expressive::onnx::accelerator_available();
    tracing::info!(accelerator, dir = %assets.dir.display(), "loading models");
    let ctx = ModelContext::from_assets(&assets, accelerator).context("load models")?;
    Ok((ctx, accelerator))
}

#[cfg(not(feature = "onnx"))]
fn load_context(_args: &Args) -> Result<(ModelContext, bool)> {
    anyhow::bail!("built without an inference backend; enable the `onnx` feature")
}

fn serve(args: &Args) -> Result<()> {
    let (ctx, accelerator) = load_context(args)?;
    let cache = args.cache_examples && accelerator;
    if args.cache_examples && !accelerator {
        tracing::warn!("example caching needs an accelerator; examples will run on demand");
    }

    let state = Arc::new(AppState::new(
        Arc::new(ctx),
        ServerConfig {
            assets_dir: args.assets_dir.clone(),
            show_duplicate_button: args.show_duplicate_button,
            space_id: args.space_id.clone(),
            ..ServerConfig::default()
        },
    )?);

    let runtime = tokio::runtime::Runtime::new().context("start tokio runtime")?;
    runtime.block_on(async {
        if cache {
            server::cache_examples(&state).await?;
        }
        server::serve(state, args.bind).await
    })
}

fn translate(
    args: &Args,
    audio: &Path,
    target_language: &str,
    output: Option<&Path>,
) -> Result<()> {
    // Fail on a bad language before loading anything.
    LanguageTable.code_for(target_language)?;
    let (ctx, _) = load_context(args)?;

    // Preprocessing rewrites its input, so work on a copy.
    let extension = audio
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    let input = tempfile::Builder::new()
        .prefix("expressive-input-")
        .suffix(&extension)
        .tempfile()
        .context("create input copy")?;
    std::fs::copy(audio, input.path())
        .with_context(|| format!("copy {}", audio.display()))?;

    let result = Pipeline::new(Arc::new(ctx))
        .run(input.path(), target_language)
        .context("translate")?;
    for warning in &result.warnings {
        eprintln!("warning: {warning}");
    }

    let audio_out = match output {
        Some(dst) => {
            std::fs::copy(&result.audio_path, dst)
                .with_context(|| format!("write {}", dst.display()))?;
            dst.to_path_buf()
        }
        None => result.audio_path,
    };
    eprintln!("audio: {}", audio_out.display());
    println!("{}", result.text);
    Ok(())
}

fn inspect_model(args: &Args) -> Result<()> {
    let assets = load_assets(args)?;
    let card = &assets.card;
    let std_min = assets.gcmvn.std.iter().copied().fold(f32::INFINITY, f32::min);
    eprintln!(
        "model ok: name={} vocoder_sample_rate={} unit_offset={} gcmvn_bins={} gcmvn_std_min={std_min:.4}",
        card.name,
        card.vocoder.sample_rate,
        card.vocoder.unit_offset,
        assets.gcmvn.mean.len(),
    );
    for code in LanguageTable.codes() {
        eprintln!(
            "  {code}: translator_token={} vocoder_lang={}",
            card.translator.lang_ids[code], card.vocoder.lang_ids[code]
        );
    }
    Ok(())
}
