//! Command-line front end for the capture pipeline
//!
//! `capture` drives a browser-hosted animation into a video and/or snapshot
//! files, `pipe` streams frames from a line-protocol subprocess into the
//! encoder, and `frame-worker` serves that same line protocol on this
//! process's own streams so the channel has a trivially runnable counterpart
//! for tests and manual poking.

use clap::{Args, Parser, Subcommand, ValueEnum};
use log::info;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use framereel::{ChannelCommand, EncodeConfig, EncoderSink, FramePlan, StreamAssignment};

#[derive(Parser)]
#[command(
    name = "framereel",
    version,
    about = "Capture animation frames and stream them into a video encoder"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive a browser-hosted animation and encode its frames
    #[cfg(feature = "cdp")]
    Capture(CaptureArgs),
    /// Stream frames from a line-protocol subprocess into the encoder
    Pipe(PipeArgs),
    /// Serve the line protocol on this process's own streams
    FrameWorker(FrameWorkerArgs),
}

#[cfg(feature = "cdp")]
#[derive(Args)]
struct CaptureArgs {
    /// Page that hosts the animation
    url: String,

    /// JSON value handed to the page's setup call
    #[arg(long)]
    scene: Option<String>,

    /// Fail unless the page reports exactly this source identifier
    #[arg(long)]
    expect_source: Option<String>,

    /// Record this many seconds of the animation
    #[arg(long, conflicts_with = "slurp")]
    seconds: Option<f64>,

    /// Render every frame the page advertises
    #[arg(long)]
    slurp: bool,

    /// Also write a standalone snapshot at this position; repeatable
    #[arg(long = "snapshot", value_name = "T")]
    snapshots: Vec<f64>,

    /// Frames per second of the finished video
    #[arg(long, default_value_t = 60.0)]
    fps: f64,

    /// Directory that receives the video and snapshots
    #[arg(long, default_value = "output")]
    out: PathBuf,

    /// Viewport width in CSS pixels
    #[arg(long, default_value_t = 1920)]
    width: u32,

    /// Viewport height in CSS pixels
    #[arg(long, default_value_t = 1080)]
    height: u32,

    /// Skip this many leading video frames to resume an interrupted run
    #[arg(long, default_value_t = 0)]
    start_at: usize,
}

#[derive(Args)]
struct PipeArgs {
    /// Program that serves frames over the line protocol
    program: String,

    /// Arguments for the frame program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Which of the subprocess's streams carries the status lines
    #[arg(long, value_enum, default_value = "stdout")]
    control_stream: ControlStream,

    /// Record this many seconds of frames
    #[arg(long)]
    seconds: f64,

    /// Frames per second of the finished video
    #[arg(long, default_value_t = 60.0)]
    fps: f64,

    /// Directory that receives the video
    #[arg(long, default_value = "output")]
    out: PathBuf,

    /// Skip this many leading frames to resume an interrupted run
    #[arg(long, default_value_t = 0)]
    start_at: usize,
}

#[derive(Args)]
struct FrameWorkerArgs {
    /// Which of this process's streams carries the status lines
    #[arg(long, value_enum, default_value = "stdout")]
    control_stream: ControlStream,

    /// Ask for a retry on the first delivery of every Nth request
    #[arg(long, value_name = "N")]
    flaky_every: Option<u64>,

    /// Answer outside the protocol vocabulary, for exercising violation
    /// handling
    #[arg(long)]
    rude: bool,

    /// Exit after this many confirmed requests
    #[arg(long, value_name = "N")]
    exit_after: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ControlStream {
    Stdout,
    Stderr,
}

impl From<ControlStream> for StreamAssignment {
    fn from(stream: ControlStream) -> Self {
        match stream {
            ControlStream::Stdout => StreamAssignment::ControlOnStdout,
            ControlStream::Stderr => StreamAssignment::ControlOnStderr,
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        // The worker blocks on stdin, so it runs without a runtime.
        Command::FrameWorker(args) => frame_worker(&args),
        command => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(run(command))
        }
    }
}

async fn run(command: Command) -> anyhow::Result<()> {
    match command {
        #[cfg(feature = "cdp")]
        Command::Capture(args) => run_capture(args).await,
        Command::Pipe(args) => run_pipe(args).await,
        Command::FrameWorker(_) => unreachable!("handled before the runtime starts"),
    }
}

#[cfg(feature = "cdp")]
async fn run_capture(args: CaptureArgs) -> anyhow::Result<()> {
    use framereel::{
        CaptureRequest, CdpProvider, Pipeline, PipelineConfig, SceneTarget, SurfaceConfig,
        Viewport,
    };

    if !args.slurp && args.seconds.is_none() && args.snapshots.is_empty() {
        anyhow::bail!("nothing to capture; pass --seconds, --slurp, or --snapshot");
    }

    let mut target = SceneTarget::new(&args.url);
    if let Some(scene) = &args.scene {
        target = target.with_scene(serde_json::from_str(scene)?);
    }
    if let Some(source) = &args.expect_source {
        target = target.expecting(source);
    }

    let mut request = CaptureRequest::new(target).starting_at(args.start_at);
    if args.slurp {
        request = request.slurp();
    } else if let Some(seconds) = args.seconds {
        request = request.with_duration(seconds);
    }
    if !args.snapshots.is_empty() {
        request = request.with_snapshots(args.snapshots.clone());
    }

    let surface_config = SurfaceConfig {
        viewport: Viewport {
            width: args.width,
            height: args.height,
        },
        ..Default::default()
    };
    let pipeline_config = PipelineConfig {
        frame_rate: args.fps,
        snapshot_dir: args.out.clone(),
        ..Default::default()
    };

    let video = args.out.join(format!("{}.mp4", now_millis()));
    let encoder = EncoderSink::new(EncodeConfig::new(args.fps, video))?;
    let mut pipeline = Pipeline::new(CdpProvider::new(surface_config), pipeline_config, encoder);

    let report = pipeline.run(&[request]).await?;
    info!(
        "Encoded {} frames and wrote {} snapshots in {:.1} seconds",
        report.frames_encoded,
        report.snapshots_written,
        report.elapsed.as_secs_f64()
    );
    if let Some(abort) = report.aborted_at {
        // Only a video-pass offset is meaningful to --start-at; a snapshot
        // abort leaves the encoded video complete.
        match abort.resume_offset() {
            Some(offset) => anyhow::bail!("run aborted; resume with --start-at {}", offset),
            None => anyhow::bail!(
                "run aborted during the snapshot pass of request {}; the encoded video is complete",
                abort.request
            ),
        }
    }
    Ok(())
}

async fn run_pipe(args: PipeArgs) -> anyhow::Result<()> {
    let command = ChannelCommand::new(&args.program).args(args.args.clone());
    let plan = FramePlan::Duration {
        seconds: args.seconds,
        frame_rate: args.fps,
    };

    let output = args.out.join(format!("{}.mp4", now_millis()));
    let encoder = EncoderSink::new(EncodeConfig::new(args.fps, output))?;

    let report = framereel::run_piped(
        command,
        args.control_stream.into(),
        &plan,
        args.start_at,
        encoder,
    )
    .await?;
    info!(
        "Encoded {} frames in {:.1} seconds",
        report.frames_encoded,
        report.elapsed.as_secs_f64()
    );
    Ok(())
}

/// Serve the line protocol: one request per stdin line, one status line per
/// request on the control stream, and a deterministic payload block (the hex
/// SHA-256 of the request line) on the data stream for each confirmed
/// request. Exits when stdin closes, which is the protocol's graceful
/// shutdown.
fn frame_worker(args: &FrameWorkerArgs) -> anyhow::Result<()> {
    use sha2::{Digest, Sha256};

    let stdout = io::stdout().lock();
    let stderr = io::stderr().lock();
    let (mut control, mut data): (Box<dyn Write>, Box<dyn Write>) = match args.control_stream {
        ControlStream::Stdout => (Box::new(stdout), Box::new(stderr)),
        ControlStream::Stderr => (Box::new(stderr), Box::new(stdout)),
    };

    let mut seen = 0u64;
    let mut confirmed = 0u64;
    let mut retry_owed: Option<String> = None;

    for line in io::stdin().lock().lines() {
        let line = line?;

        if args.rude {
            writeln!(control, "no thanks")?;
            control.flush()?;
            continue;
        }

        if retry_owed.as_deref() == Some(line.as_str()) {
            retry_owed = None;
        } else {
            seen += 1;
            if let Some(n) = args.flaky_every {
                if n > 0 && seen % n == 0 {
                    retry_owed = Some(line.clone());
                    writeln!(control, "please try again")?;
                    control.flush()?;
                    continue;
                }
            }
        }

        // Payload first, then the confirmation, matching the temporal
        // ordering the protocol correlates by.
        let digest = Sha256::digest(line.as_bytes());
        writeln!(data, "{}", hex::encode(digest))?;
        data.flush()?;
        writeln!(control, "success")?;
        control.flush()?;

        confirmed += 1;
        if let Some(n) = args.exit_after {
            if confirmed >= n {
                break;
            }
        }
    }
    Ok(())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
