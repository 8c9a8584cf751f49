use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use expressive::assets::DEFAULT_HUB_REPO;
use expressive::lang::DEFAULT_TARGET_LANGUAGE;

use crate::logging::LogConfig;

#[derive(Debug, Parser)]
#[command(name = "expressive")]
#[command(about = "Expressive speech-to-speech translation demo", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Checkpoint directory. Downloaded from --hub-repo when it does not exist.
    #[arg(
        long,
        env = "CHECKPOINTS_PATH",
        default_value = "/home/user/app/models",
        global = true
    )]
    pub checkpoints_path: PathBuf,

    /// Model repository used to populate a missing checkpoint directory.
    #[arg(long, default_value = DEFAULT_HUB_REPO, global = true)]
    pub hub_repo: String,

    /// Show the "Duplicate Space" button on the form page.
    #[arg(
        long,
        env = "SHOW_DUPLICATE_BUTTON",
        value_parser = parse_env_flag,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_value = "0",
        default_missing_value = "1",
        global = true
    )]
    pub show_duplicate_button: bool,

    /// Space id the duplicate button points at.
    #[arg(long, env = "SPACE_ID", global = true)]
    pub space_id: Option<String>,

    /// Precompute the example rows at startup. Only honoured with an accelerator.
    #[arg(
        long,
        env = "CACHE_EXAMPLES",
        value_parser = parse_env_flag,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_value = "0",
        default_missing_value = "1",
        global = true
    )]
    pub cache_examples: bool,

    /// Directory holding the example input clips.
    #[arg(long, default_value = "assets", global = true)]
    pub assets_dir: PathBuf,

    #[arg(long, default_value = "0.0.0.0:7860", global = true)]
    pub bind: SocketAddr,

    /// Default log filter; `RUST_LOG` takes precedence.
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, default_value_t = false, global = true)]
    pub log_json: bool,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Serve the browser form and the `run` API (default).
    Serve,
    /// Translate one clip and print the text.
    Translate {
        /// Input speech (mp3, wav, flac or ogg). Left untouched.
        #[arg(long)]
        audio: PathBuf,

        #[arg(long, default_value = DEFAULT_TARGET_LANGUAGE)]
        target_language: String,

        /// Where to copy the translated WAV. Defaults to a temp file.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Validate the checkpoint directory without loading the models.
    InspectModel,
}

impl Args {
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level.clone(),
            json_format: self.log_json,
        }
    }
}

/// Environment flags are on only when set to exactly `1`.
fn parse_env_flag(value: &str) -> Result<bool, String> {
    Ok(value.trim() == "1")
}
