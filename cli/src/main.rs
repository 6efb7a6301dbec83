use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use evamark_core::{NativeEngine, OutputPaths, Pipeline};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "evamark",
    version,
    about = "Stream a video through the eva detection engine and overlay the results",
    long_about = None
)]
struct Cli {
    /// Input video file. When omitted, raw video bytes are read from stdin
    /// and buffered to a temporary file (the decoder needs random access).
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Shared library exposing the eva_* inference ABI.
    #[arg(long, default_value = "./libinfer.so")]
    engine_lib: PathBuf,

    /// Directory receiving video.mp4 (silent, annotated) and
    /// video_with_audio.mp4 (final deliverable).
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    std::fs::create_dir_all(&cli.output_dir).with_context(|| {
        format!(
            "could not create output directory: {}",
            cli.output_dir.display()
        )
    })?;
    let outputs = OutputPaths::in_dir(&cli.output_dir);

    // Engine first: without it there is no point touching the input.
    let engine = NativeEngine::load(&cli.engine_lib)
        .with_context(|| format!("failed to initialise engine: {}", cli.engine_lib.display()))?;

    // Keeps the temp file alive until the run finishes.
    let _stdin_buffer;
    let input = match cli.input {
        Some(path) => path,
        None => {
            let buffered = buffer_stdin().context("failed to buffer stdin to temporary file")?;
            let path = buffered.path().to_path_buf();
            _stdin_buffer = buffered;
            path
        }
    };

    info!("input  : {}", input.display());
    info!("engine : {}", cli.engine_lib.display());
    info!("output : {}", cli.output_dir.display());

    let pb = spinner("Annotating video…");

    let mut pipeline = Pipeline::new(engine);
    let summary = pipeline.run(&input, &outputs)?;

    pb.finish_with_message("Done.");
    info!(
        "processed {} frames, {} detections → {}",
        summary.frames,
        summary.detections,
        summary.with_audio.display()
    );
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Spool stdin into a named temp file so libav can seek in it.
fn buffer_stdin() -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("evamark-input-")
        .suffix(".mp4")
        .tempfile()
        .context("could not create temporary file")?;

    let stdin = io::stdin();
    let bytes = io::copy(&mut stdin.lock(), file.as_file_mut())
        .context("could not read video bytes from stdin")?;
    file.flush().ok();

    if bytes == 0 {
        anyhow::bail!("stdin was empty: pipe a video file in, or pass --input");
    }
    info!("buffered {bytes} bytes from stdin");
    Ok(file)
}

fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed_precise}]")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}
