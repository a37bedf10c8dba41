mod cli;

use reelforge::{
    channel::VideoChannel,
    config,
    process::Process,
    timeline::{Layer, Overlay},
};
use reelforge_av::{ChannelKind, SilenceDetector, ToolRegistry};
use reelforge_common::Worker;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use std::path::Path;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "reelforge=trace,reelforge_av=trace,reelforge_common=trace".to_string()
        } else {
            "reelforge=debug,reelforge_av=debug,reelforge_common=debug".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::FindSilence { input, json } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(find_silence(&input, cli.config.as_deref(), json))
        }
        Commands::Duck {
            main,
            overlay,
            output,
            audio_only,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(duck(
                &main,
                &overlay,
                &output,
                !audio_only,
                cli.config.as_deref(),
            ))
        }
        Commands::CheckTools => check_tools(cli.config.as_deref()),
        Commands::Validate { config } => validate_config(config.as_deref().or(cli.config.as_deref())),
        Commands::Version => {
            println!("reelforge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn find_silence(input: &Path, config_path: Option<&Path>, json: bool) -> Result<()> {
    if !input.exists() {
        anyhow::bail!("File does not exist: {:?}", input);
    }

    let config = config::load_config_or_default(config_path)?;
    let tools = ToolRegistry::discover(&config.tools);
    let settings = config.process_settings(tools.ffmpeg()?);

    let root = Worker::root("main").with_timeout(settings.timeout);
    let detector = SilenceDetector::new(&settings.ffmpeg, settings.silence)
        .with_timeouts(settings.command_timeout, settings.limit)
        .with_termination(settings.termination);
    let silence = detector
        .find_silence(&root, input, None, false)
        .await
        .with_context(|| format!("Failed to find silence in {:?}", input))?;
    root.join_children(settings.limit, settings.timeout).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&silence)?);
    } else {
        println!("Silence in {}: {} interval(s)", input.display(), silence.len());
        for interval in &silence {
            match interval.end_at {
                Some(end_at) => println!(
                    "  {:.3} - {:.3} ({:.3}s)",
                    interval.start_at,
                    end_at,
                    end_at - interval.start_at
                ),
                None => println!("  {:.3} - end", interval.start_at),
            }
        }
    }

    Ok(())
}

async fn duck(
    main: &Path,
    overlay: &Path,
    output: &Path,
    with_video: bool,
    config_path: Option<&Path>,
) -> Result<()> {
    for path in [main, overlay] {
        if !path.exists() {
            anyhow::bail!("Input file does not exist: {:?}", path);
        }
    }

    let config = config::load_config_or_default(config_path)?;
    let tools = ToolRegistry::discover(&config.tools);
    let settings = config.process_settings(tools.ffmpeg()?);
    let root = Worker::root("main").with_timeout(settings.timeout);

    let mut process = Process::new(settings.clone());
    let main_reel = process.input(main, with_video, true);
    let overlay_reel = process.input(overlay, false, true);
    let video: Option<VideoChannel> = with_video.then(|| config.output.video.clone());
    process
        .output(output, video, Some(config.output.audio.clone()))?
        .roll(Layer::new(main_reel))?
        .overlay(Overlay::new(overlay_reel).duck(ChannelKind::Audio))?;

    tracing::info!("Ducking {:?} under {:?} into {:?}", overlay, main, output);
    process
        .run(&root)
        .await
        .with_context(|| format!("Failed to duck {:?} under {:?}", overlay, main))?;
    root.join_children(settings.limit, settings.timeout).await?;

    println!("Output: {}", output.display());
    Ok(())
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    println!("Checking external tools...\n");

    let config = config::load_config_or_default(config_path)?;
    let tools = ToolRegistry::discover(&config.tools).check_all();
    let mut all_ok = true;

    for tool in &tools {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Install them to enable all features.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            config
        }
        None => {
            println!("No config file specified, using defaults");
            config::Config::default()
        }
    };

    println!(
        "  Timeouts: command {}s, worker {}s, limit {}",
        config.timeouts.command_secs,
        config.timeouts.worker_secs,
        config
            .timeouts
            .limit_secs
            .map_or_else(|| "none".to_string(), |l| format!("{l}s"))
    );
    println!(
        "  Termination: {} graceful attempt(s)",
        config.termination.term_attempts
    );
    println!(
        "  Silence: {}dB for {}s",
        config.silence.noise, config.silence.duration
    );
    println!(
        "  Output video: {} @ {} fps",
        config.output.video.resolution, config.output.video.fps
    );
    println!("  Output audio: {} Hz", config.output.audio.sampling_freq);

    Ok(())
}
