use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "reelforge")]
#[command(author, version, about = "Media timeline assembly over supervised ffmpeg pipelines")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Find silent intervals in a media file
    FindSilence {
        /// File to scan
        #[arg(required = true)]
        input: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Mix an overlay under a main track, swelling it during silences
    Duck {
        /// Main media file
        #[arg(required = true)]
        main: PathBuf,

        /// Overlay audio (e.g. music)
        #[arg(required = true)]
        overlay: PathBuf,

        /// Where to write the result
        #[arg(short, long, required = true)]
        output: PathBuf,

        /// Treat the main media as audio-only
        #[arg(long)]
        audio_only: bool,
    },

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}
