//! Pipeline orchestration: sequence, render, encode, shut down
//!
//! The pipeline drives one encoder session through any number of capture
//! requests. Encoder writes are awaited one at a time because byte order in
//! the encoder's input is frame order in the finished file; standalone
//! snapshot writes are the only fire-and-forget work, and they are joined
//! before the run is declared over. Shutdown is unconditional: however a run
//! ends, the encoder is closed and pending writes are drained, so the output
//! file is always finalized with whatever was produced.

use crate::channel::{ChannelCommand, StreamAssignment, SubprocessChannel};
use crate::encoder::{EncoderSink, FrameSink};
use crate::error::{Error, Result};
use crate::recovery::{RecoveryPolicy, Session};
use crate::sequencer::{check_duration, check_frame_rate, check_normalized, FramePlan};
use crate::surface::SurfaceProvider;
use crate::{RenderResult, SceneTarget};
use futures::future::join_all;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

/// Where a run is in its lifecycle. Transitions are owned by [`Pipeline`];
/// `Closed` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Initializing,
    Rendering,
    Draining,
    Closed,
    Aborted,
}

/// The video half of a capture request.
#[derive(Debug, Clone)]
pub enum VideoPass {
    /// Sample the animation evenly across this many seconds
    Duration(f64),
    /// Render every frame the page's capabilities advertise
    Slurp,
}

/// One scene's worth of work: which page to drive, what to record from it,
/// and where to pick up if this is a resumed run.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub target: SceneTarget,
    pub video: Option<VideoPass>,
    /// Normalized positions written as standalone snapshot files
    pub snapshots: Vec<f64>,
    /// Leading video frames to skip when resuming an interrupted run
    pub start_at: usize,
}

impl CaptureRequest {
    pub fn new(target: SceneTarget) -> Self {
        Self {
            target,
            video: None,
            snapshots: Vec::new(),
            start_at: 0,
        }
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.video = Some(VideoPass::Duration(seconds));
        self
    }

    pub fn slurp(mut self) -> Self {
        self.video = Some(VideoPass::Slurp);
        self
    }

    pub fn with_snapshots(mut self, positions: Vec<f64>) -> Self {
        self.snapshots = positions;
        self
    }

    pub fn starting_at(mut self, offset: usize) -> Self {
        self.start_at = offset;
        self
    }

    /// Everything checkable without capabilities, checked before any remote
    /// call is issued.
    fn validate(&self, frame_rate: f64) -> Result<()> {
        match &self.video {
            Some(VideoPass::Duration(seconds)) => {
                check_duration(*seconds)?;
                check_frame_rate(frame_rate)?;
            }
            Some(VideoPass::Slurp) => check_frame_rate(frame_rate)?,
            None => {}
        }
        for t in &self.snapshots {
            check_normalized(*t)?;
        }
        Ok(())
    }
}

/// Run-wide settings shared by every request.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Frames per second, for both sequencing and the encoder
    pub frame_rate: f64,
    /// Log progress every this many encoded frames; 0 disables it
    pub progress_every: usize,
    /// Directory that receives standalone snapshot files
    pub snapshot_dir: PathBuf,
    pub recovery: RecoveryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_rate: 60.0,
            progress_every: 60,
            snapshot_dir: PathBuf::from("output"),
            recovery: RecoveryPolicy::default(),
        }
    }
}

/// Which half of a request a run gave up in.
///
/// The distinction matters for resuming: a video offset feeds `start_at`,
/// which skips leading *video* frames. Feeding it a snapshot offset would
/// silently truncate the re-encoded video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortedPass {
    Video,
    Snapshot,
}

/// Where a run gave up: which request, which of its passes, and the offset
/// within that pass's sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortPoint {
    /// Index of the failing request in the slice given to `run`
    pub request: usize,
    pub pass: AbortedPass,
    /// Offset within the interrupted pass's own sequence
    pub offset: usize,
}

impl AbortPoint {
    /// The offset to resume the video pass from, when that is what was
    /// interrupted. A snapshot-pass abort has no video offset to skip to;
    /// the encoded video is already complete.
    pub fn resume_offset(&self) -> Option<usize> {
        match self.pass {
            AbortedPass::Video => Some(self.offset),
            AbortedPass::Snapshot => None,
        }
    }
}

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub frames_encoded: u64,
    pub snapshots_written: u64,
    pub snapshot_failures: u64,
    /// Where the first unrenderable frame stopped the run.
    /// `None` means the run completed.
    pub aborted_at: Option<AbortPoint>,
    pub elapsed: Duration,
}

impl RunReport {
    fn empty() -> Self {
        Self {
            frames_encoded: 0,
            snapshots_written: 0,
            snapshot_failures: 0,
            aborted_at: None,
            elapsed: Duration::ZERO,
        }
    }
}

/// Millisecond timestamps for snapshot names. Two frames can land inside one
/// millisecond, so the clock bumps past its last answer rather than reuse it.
#[derive(Debug, Default)]
struct StampClock {
    last: u64,
}

impl StampClock {
    fn next(&mut self) -> u64 {
        self.advance(now_millis())
    }

    fn advance(&mut self, now: u64) -> u64 {
        self.last = now.max(self.last + 1);
        self.last
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Drives capture requests through a policy-wrapped surface into one frame
/// sink. A pipeline runs once; afterwards it is `Closed` or `Aborted` and
/// refuses further work.
pub struct Pipeline<P: SurfaceProvider, S: FrameSink = EncoderSink> {
    session: Session<P>,
    config: PipelineConfig,
    sink: S,
    state: PipelineState,
    stamps: StampClock,
}

impl<P: SurfaceProvider, S: FrameSink> Pipeline<P, S> {
    pub fn new(provider: P, config: PipelineConfig, sink: S) -> Self {
        let session = Session::new(provider, config.recovery.clone());
        Self {
            session,
            config,
            sink,
            state: PipelineState::Idle,
            stamps: StampClock::default(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Run every request, in order, into the shared sink, then shut down.
    ///
    /// An unrenderable frame ends the loop early and is reported through
    /// [`RunReport::aborted_at`] rather than an error; errors are reserved
    /// for the fatal classes (bad configuration, source mismatch, encoder or
    /// spawn trouble). Shutdown happens on every path.
    pub async fn run(&mut self, requests: &[CaptureRequest]) -> Result<RunReport> {
        if self.state != PipelineState::Idle {
            return Err(Error::Config("pipeline has already run".into()));
        }
        for request in requests {
            request.validate(self.config.frame_rate)?;
        }

        let started = Instant::now();
        let mut report = RunReport::empty();
        let mut pending: Vec<JoinHandle<bool>> = Vec::new();
        self.state = PipelineState::Initializing;

        let outcome = self.drive(requests, started, &mut pending, &mut report).await;

        // Shutdown runs the same way no matter how the loop ended.
        self.state = PipelineState::Draining;
        let closed = self.sink.close().await;
        self.session.close().await;
        info!(
            "Waiting for {} pending writes after {:.1} seconds",
            pending.len(),
            started.elapsed().as_secs_f64()
        );
        for joined in join_all(pending).await {
            match joined {
                Ok(true) => report.snapshots_written += 1,
                Ok(false) => report.snapshot_failures += 1,
                Err(e) => {
                    warn!("Snapshot task failed to finish: {}", e);
                    report.snapshot_failures += 1;
                }
            }
        }
        report.elapsed = started.elapsed();

        self.state = if outcome.is_err() || report.aborted_at.is_some() {
            PipelineState::Aborted
        } else {
            PipelineState::Closed
        };
        outcome?;
        closed?;
        info!("Run finished in {:.1} seconds", report.elapsed.as_secs_f64());
        Ok(report)
    }

    async fn drive(
        &mut self,
        requests: &[CaptureRequest],
        started: Instant,
        pending: &mut Vec<JoinHandle<bool>>,
        report: &mut RunReport,
    ) -> Result<()> {
        for (request_index, request) in requests.iter().enumerate() {
            self.state = PipelineState::Initializing;
            let capabilities = self.session.initialize(request.target.clone()).await?;
            self.state = PipelineState::Rendering;

            if let Some(video) = &request.video {
                let plan = match video {
                    VideoPass::Duration(seconds) => FramePlan::Duration {
                        seconds: *seconds,
                        frame_rate: self.config.frame_rate,
                    },
                    VideoPass::Slurp => FramePlan::Slurp {
                        frame_rate: self.config.frame_rate,
                    },
                };
                let sequence = plan.sequence(Some(&capabilities), request.start_at)?;
                let total = sequence.total();
                let mut offset = sequence.start_offset();
                for position in sequence {
                    let image = match self.session.render(position).await {
                        RenderResult::Success(image) => image,
                        RenderResult::Failure(reason) => {
                            warn!(
                                "Unrenderable frame {} at offset {} of {}: {}",
                                position, offset, total, reason
                            );
                            info!("Rerun with a start offset of {} to pick up from here", offset);
                            report.aborted_at = Some(AbortPoint {
                                request: request_index,
                                pass: AbortedPass::Video,
                                offset,
                            });
                            return Ok(());
                        }
                    };
                    self.sink.write(&image).await?;
                    report.frames_encoded += 1;
                    offset += 1;
                    if self.config.progress_every > 0 && offset % self.config.progress_every == 0 {
                        info!(
                            "Frame {}/{} ({:.0}%) after {:.1} seconds",
                            offset,
                            total,
                            100.0 * offset as f64 / total as f64,
                            started.elapsed().as_secs_f64()
                        );
                    }
                }
            }

            if !request.snapshots.is_empty() {
                let sequence = FramePlan::Positions(request.snapshots.clone()).sequence(None, 0)?;
                let total = sequence.total();
                let mut done = 0;
                for position in sequence {
                    let image = match self.session.render(position).await {
                        RenderResult::Success(image) => image,
                        RenderResult::Failure(reason) => {
                            // The video pass for this request already
                            // finished; no start offset applies here.
                            warn!(
                                "Unrenderable snapshot {} ({} of {}): {}",
                                position, done, total, reason
                            );
                            report.aborted_at = Some(AbortPoint {
                                request: request_index,
                                pass: AbortedPass::Snapshot,
                                offset: done,
                            });
                            return Ok(());
                        }
                    };
                    let path = self
                        .config
                        .snapshot_dir
                        .join(format!("{}.png", self.stamps.next()));
                    pending.push(tokio::spawn(write_snapshot(path, image)));
                    done += 1;
                }
            }
        }
        Ok(())
    }
}

/// One fire-and-forget snapshot write. Failures are reported, never fatal.
async fn write_snapshot(path: PathBuf, image: Vec<u8>) -> bool {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("Could not create {}: {}", parent.display(), e);
                return false;
            }
        }
    }
    match tokio::fs::write(&path, &image).await {
        Ok(()) => {
            debug!("Wrote {}", path.display());
            true
        }
        Err(e) => {
            warn!("Snapshot write {} failed: {}", path.display(), e);
            false
        }
    }
}

/// Capture from a line-protocol subprocess instead of a browser.
///
/// The encoder's input is handed to the channel as its data sink, so
/// confirmed frames flow from the subprocess straight into the encoder; this
/// side only sends one request line per position. Channel failures are fatal
/// here, but shutdown still runs first so the encoder finalizes whatever
/// already arrived.
pub async fn run_piped(
    command: ChannelCommand,
    assignment: StreamAssignment,
    plan: &FramePlan,
    start_at: usize,
    mut encoder: EncoderSink,
) -> Result<RunReport> {
    let started = Instant::now();
    let sequence = plan.sequence(None, start_at)?;
    let total = sequence.total();
    let progress_every = PipelineConfig::default().progress_every;

    let input = encoder.take_input().await?;
    let mut channel = SubprocessChannel::new(command, assignment, Box::new(input));

    let mut report = RunReport::empty();
    let mut offset = sequence.start_offset();
    let mut outcome = Ok(());
    for position in sequence {
        let line = position.wire_value().to_string();
        if let Err(e) = channel.make_request(&line, position).await {
            warn!(
                "Frame source failed at {} (offset {} of {}): {}",
                position, offset, total, e
            );
            info!("Rerun with a start offset of {} to pick up from here", offset);
            outcome = Err(e);
            break;
        }
        report.frames_encoded += 1;
        offset += 1;
        if progress_every > 0 && offset % progress_every == 0 {
            info!(
                "Frame {}/{} ({:.0}%) after {:.1} seconds",
                offset,
                total,
                100.0 * offset as f64 / total as f64,
                started.elapsed().as_secs_f64()
            );
        }
    }

    channel.close();
    let drained = channel.wait_for_done().await;
    // The channel still parks the encoder's input as its data sink; dropping
    // it is what lets the encoder see end of stream and finalize the file.
    drop(channel);
    let closed = encoder.close().await;

    report.elapsed = started.elapsed();
    outcome?;
    drained?;
    closed?;
    info!("Run finished in {:.1} seconds", report.elapsed.as_secs_f64());
    Ok(report)
}
