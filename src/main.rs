//! CLI entry point for qtrk
//!
//! Replays raw camera frames through the queued tracker:
//! - `track`: schedule every ROI of every frame, write results as JSON lines
//! - `check-config`: load and validate a tracker configuration
//!
//! # Usage
//!
//! ```bash
//! qtrk track --config config/tracker.toml --frames run.raw \
//!     --frame-width 1024 --frame-height 768 --pixel-type u16 \
//!     --rois rois.json --zlut zlut.json --out results.jsonl --sort
//! ```
//!
//! Frames are read back to back, each `frame_width * bpp` bytes per row with no
//! padding. `rois.json` is an array of `{"x": .., "y": ..}` corners; ROI `i` is
//! tracked as bead `i`.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use qtrk::logging::{self, LogFormat, LoggingConfig};
use qtrk::{
    JobInfo, LocalizationResult, PixelDataType, QueuedTracker, Roi, TrackerConfig, ZlutTable,
};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "qtrk")]
#[command(about = "Queued multi-threaded bead tracker", long_about = None)]
struct Cli {
    /// Emit JSON log lines instead of the pretty format
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Track beads in a raw frame file
    Track(TrackArgs),

    /// Validate a tracker configuration file
    CheckConfig {
        /// Path to the TOML configuration
        config: PathBuf,
    },
}

#[derive(clap::Args)]
struct TrackArgs {
    /// Tracker configuration (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Raw frame file, frames stored back to back
    #[arg(long)]
    frames: PathBuf,

    /// Frame width in pixels
    #[arg(long)]
    frame_width: usize,

    /// Frame height in pixels
    #[arg(long)]
    frame_height: usize,

    /// Pixel format of the frame file
    #[arg(long, value_enum, default_value = "u8")]
    pixel_type: PixelArg,

    /// JSON array of ROI corners
    #[arg(long)]
    rois: PathBuf,

    /// JSON ZLUT; enables z estimation
    #[arg(long)]
    zlut: Option<PathBuf>,

    /// Output file for JSON-line results (stdout if omitted)
    #[arg(long)]
    out: Option<PathBuf>,

    /// Sort each polled batch by job id
    #[arg(long)]
    sort: bool,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum PixelArg {
    U8,
    U16,
    F32,
}

impl From<PixelArg> for PixelDataType {
    fn from(arg: PixelArg) -> Self {
        match arg {
            PixelArg::U8 => PixelDataType::U8,
            PixelArg::U16 => PixelDataType::U16,
            PixelArg::F32 => PixelDataType::F32,
        }
    }
}

/// On-disk ZLUT layout.
#[derive(Deserialize)]
struct ZlutFile {
    num_beads: usize,
    planes: usize,
    radial_steps: usize,
    data: Vec<f32>,
    #[serde(default)]
    plane_weights: Option<Vec<f32>>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Track(args) => track(args, cli.json_logs),
        Commands::CheckConfig { config } => check_config(&config, cli.json_logs),
    }
}

fn load_config(path: Option<&Path>) -> Result<TrackerConfig> {
    let config = match path {
        Some(path) => TrackerConfig::load_from(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => TrackerConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn init_logging(config: &TrackerConfig, json: bool) -> Result<()> {
    let mut logging_config = LoggingConfig::from_tracker_config(config)?;
    if json {
        logging_config = logging_config.with_format(LogFormat::Json);
    }
    logging::init(logging_config)?;
    Ok(())
}

fn check_config(path: &Path, json_logs: bool) -> Result<()> {
    let config = load_config(Some(path))?;
    init_logging(&config, json_logs)?;
    info!(
        width = config.width,
        height = config.height,
        threads = config.worker_count(),
        max_queue_size = config.max_queue_size,
        "Configuration valid"
    );
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse {}", path.display()))
}

fn track(args: TrackArgs, json_logs: bool) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    init_logging(&config, json_logs)?;

    let rois: Vec<Roi> = read_json(&args.rois)?;
    if rois.is_empty() {
        bail!("{} contains no ROIs", args.rois.display());
    }

    let data_type = PixelDataType::from(args.pixel_type);
    let Some((pitch, frame_bytes)) = args
        .frame_width
        .checked_mul(data_type.bytes_per_pixel())
        .and_then(|pitch| Some((pitch, pitch.checked_mul(args.frame_height)?)))
    else {
        bail!(
            "Frame of {}x{} {} pixels is too large",
            args.frame_width,
            args.frame_height,
            data_type
        );
    };
    if frame_bytes == 0 {
        bail!("Frame size must be non-zero");
    }

    let tracker = QueuedTracker::new(config.clone())?;

    let mut template = JobInfo::default();
    if let Some(path) = &args.zlut {
        let zlut: ZlutFile = read_json(path)?;
        tracker.set_zlut_table(ZlutTable::from_data(
            zlut.data,
            zlut.num_beads,
            zlut.planes,
            zlut.radial_steps,
            zlut.plane_weights,
        )?)?;
        template = template.with_z();
    }

    let mut output: Box<dyn Write> = match &args.out {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(std::io::stdout().lock())),
    };

    let mut frames = BufReader::new(
        File::open(&args.frames)
            .with_context(|| format!("Failed to open {}", args.frames.display()))?,
    );

    tracker.start()?;
    info!(
        rois = rois.len(),
        frame_width = args.frame_width,
        frame_height = args.frame_height,
        %data_type,
        threads = tracker.num_threads(),
        "Tracking started"
    );

    let started = Instant::now();
    let backoff = config.idle_backoff();
    let mut frame = vec![0u8; frame_bytes];
    let mut frame_index: u32 = 0;
    let mut written = 0usize;

    loop {
        match frames.read_exact(&mut frame) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err).context("Failed to read frame"),
        }

        while tracker.is_queue_filled() {
            written += write_results(&tracker, &mut output, args.sort)?;
            std::thread::sleep(backoff);
        }

        // ROI index is the bead index
        tracker.schedule_frame(
            &frame,
            pitch,
            args.frame_width,
            args.frame_height,
            &rois,
            data_type,
            JobInfo {
                frame: frame_index,
                ..template
            },
        )?;

        debug!(frame = frame_index, "Frame scheduled");
        frame_index += 1;
        written += write_results(&tracker, &mut output, args.sort)?;
    }

    tracker.flush();
    if !tracker.wait_idle(Duration::from_secs(60)) {
        warn!(pending = tracker.job_count(), "Timed out waiting for jobs to finish");
    }
    tracker.stop();
    written += write_results(&tracker, &mut output, args.sort)?;
    output.flush()?;

    info!(
        frames = frame_index,
        results = written,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Tracking finished"
    );
    Ok(())
}

fn write_results(tracker: &QueuedTracker, output: &mut dyn Write, sort: bool) -> Result<usize> {
    let results: Vec<LocalizationResult> = tracker.poll_finished(usize::MAX, sort);
    for result in &results {
        serde_json::to_writer(&mut *output, result)?;
        output.write_all(b"\n")?;
    }
    Ok(results.len())
}
