//! Streaming video encoder sink backed by an ffmpeg subprocess
//!
//! Frames are piped into ffmpeg's input in write order and the byte order in
//! that stream is the frame order of the finished file, so writes are awaited
//! one at a time and never reordered.

use crate::error::{Error, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

/// Where the pipeline sends finished frames.
///
/// Writes carry ordering: the bytes of call `n` land in the stream before the
/// bytes of call `n + 1`, and `close` finalizes whatever was written.
#[async_trait]
pub trait FrameSink: Send {
    async fn write(&mut self, image: &[u8]) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Fixed parameters for one encoding session (one output file).
#[derive(Debug, Clone)]
pub struct EncodeConfig {
    /// Frames per second of the finished video
    pub frame_rate: f64,
    /// Where the finished file lands
    pub output: PathBuf,
    /// Encoder executable, resolved on PATH by default
    pub ffmpeg: String,
}

impl EncodeConfig {
    pub fn new(frame_rate: f64, output: impl Into<PathBuf>) -> Self {
        Self {
            frame_rate,
            output: output.into(),
            ffmpeg: "ffmpeg".to_string(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.frame_rate.is_finite() && self.frame_rate > 0.0) {
            return Err(Error::Config(format!(
                "frame rate should be a positive number, got {}",
                self.frame_rate
            )));
        }
        if self.output.as_os_str().is_empty() {
            return Err(Error::Config("output path is empty".into()));
        }
        Ok(())
    }

    /// Argument list up to, but not including, the output path.
    fn video_args(&self) -> Vec<String> {
        let fps = self.frame_rate.to_string();
        vec![
            "-loglevel".into(),
            "warning".into(),
            "-framerate".into(),
            fps.clone(),
            "-f".into(),
            "image2pipe".into(),
            "-i".into(),
            "-".into(),
            "-c:v".into(),
            "libx264".into(),
            "-r".into(),
            fps,
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-colorspace".into(),
            "bt709".into(),
            "-color_primaries".into(),
            "bt709".into(),
            "-color_trc".into(),
            "bt709".into(),
            "-movflags".into(),
            "+faststart".into(),
        ]
    }
}

/// Owns one encoder subprocess for the lifetime of one output file.
///
/// The process starts on the first [`write`](Self::write) and
/// [`close`](Self::close) is the only way to get a finalized, playable file.
/// Skipping `close` typically leaves a truncated file behind.
pub struct EncoderSink {
    config: EncodeConfig,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stderr_pump: Option<JoinHandle<()>>,
    input_taken: bool,
    closed: bool,
    frames: u64,
}

impl EncoderSink {
    /// Validate the configuration and prepare a sink. No process is spawned
    /// until the first write, so a sink that is never used costs nothing.
    pub fn new(config: EncodeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            child: None,
            stdin: None,
            stderr_pump: None,
            input_taken: false,
            closed: false,
            frames: 0,
        })
    }

    /// Append one image to the video. Callers must await each write before
    /// issuing the next; there is no reordering buffer.
    pub async fn write(&mut self, image: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::Encoder("write after close".into()));
        }
        if self.input_taken {
            return Err(Error::Encoder(
                "input stream was handed off, direct writes are unavailable".into(),
            ));
        }
        self.spawn_if_required().await?;
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Encoder("encoder input is gone".into()))?;
        stdin.write_all(image).await?;
        self.frames += 1;
        Ok(())
    }

    /// Start the encoder if needed and hand its raw input stream to the
    /// caller, for runs where another process produces the image stream
    /// directly. Afterwards [`write`](Self::write) is refused and
    /// [`close`](Self::close) only waits for the encoder to finish.
    pub async fn take_input(&mut self) -> Result<ChildStdin> {
        if self.closed {
            return Err(Error::Encoder("take_input after close".into()));
        }
        self.spawn_if_required().await?;
        let stdin = self
            .stdin
            .take()
            .ok_or_else(|| Error::Encoder("encoder input already taken".into()))?;
        self.input_taken = true;
        Ok(stdin)
    }

    async fn spawn_if_required(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.config.output.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut child = Command::new(&self.config.ffmpeg)
            .args(self.config.video_args())
            .arg(&self.config.output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(Error::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Encoder("encoder stdin was not piped".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Encoder("encoder stderr was not piped".into()))?;

        // ffmpeg runs at -loglevel warning, so anything it says is worth
        // surfacing.
        self.stderr_pump = Some(tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = line.trim();
                        if !text.is_empty() {
                            warn!("ffmpeg: {}", text);
                        }
                    }
                    Err(e) => {
                        warn!("Error reading encoder stderr: {}", e);
                        break;
                    }
                }
            }
        }));

        self.stdin = Some(stdin);
        self.child = Some(child);
        debug!(
            "Started {} writing {}",
            self.config.ffmpeg,
            self.config.output.display()
        );
        Ok(())
    }

    /// Half-close the encoder's input and wait for it to finalize the file.
    ///
    /// Idempotent, and a no-op when nothing was ever written: no process is
    /// spawned and no file is created.
    pub async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.stdin = None;
        let mut child = match self.child.take() {
            Some(child) => child,
            None => return Ok(()),
        };
        let status = child.wait().await?;
        if let Some(pump) = self.stderr_pump.take() {
            let _ = pump.await;
        }
        if !status.success() {
            return Err(Error::Encoder(format!("ffmpeg exited with {}", status)));
        }
        if self.input_taken {
            info!("Encoder finished {}", self.config.output.display());
        } else {
            info!(
                "Encoded {} frames into {}",
                self.frames,
                self.config.output.display()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl FrameSink for EncoderSink {
    async fn write(&mut self, image: &[u8]) -> Result<()> {
        EncoderSink::write(self, image).await
    }

    async fn close(&mut self) -> Result<()> {
        EncoderSink::close(self).await
    }
}
