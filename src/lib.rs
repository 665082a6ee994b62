//! Framereel
//!
//! Drives a browser-hosted animation through its frames over the Chrome
//! DevTools Protocol, captures each frame, and streams the captures in strict
//! order into an ffmpeg subprocess to produce a finished video. A restartable
//! line-protocol subprocess channel covers the same job when the frame source
//! is a cooperating external process instead of a page.
//!
//! # Features
//!
//! - **CDP Backend** (default): drives a headless Chrome via the
//!   `headless_chrome` crate
//! - **Failure Recovery**: per-frame retry, then full session
//!   reinitialization, then a clean abort with a resumable offset
//! - **Graceful Shutdown**: the encoder and every pending snapshot write are
//!   finalized no matter how a run ends
//!
//! # Example
//!
//! ```no_run
//! use framereel::{
//!     CaptureRequest, EncodeConfig, EncoderSink, Pipeline, PipelineConfig, SceneTarget,
//! };
//!
//! # #[cfg(feature = "cdp")]
//! # async fn run() -> framereel::Result<()> {
//! let target = SceneTarget::new("http://localhost:5173/tangent-line-2.html");
//! let request = CaptureRequest::new(target).with_duration(17.0);
//!
//! let provider = framereel::CdpProvider::new(Default::default());
//! let encoder = EncoderSink::new(EncodeConfig::new(60.0, "output/tangent.mp4"))?;
//! let mut pipeline = Pipeline::new(provider, PipelineConfig::default(), encoder);
//! let report = pipeline.run(&[request]).await?;
//! println!("Encoded {} frames", report.frames_encoded);
//! # Ok(())
//! # }
//! ```

use serde::Deserialize;

pub mod error;
pub use error::{Error, Result};

// Synchronous CDP client; one worker thread owns it (see `surface`)
#[cfg(feature = "cdp")]
pub mod cdp;

pub mod channel;
pub mod encoder;
pub mod pipeline;
pub mod recovery;
pub mod sequencer;
pub mod surface;

pub use channel::{ChannelCommand, ControlResponse, DataSink, StreamAssignment, SubprocessChannel};
pub use encoder::{EncodeConfig, EncoderSink, FrameSink};
pub use pipeline::{
    run_piped, AbortPoint, AbortedPass, CaptureRequest, Pipeline, PipelineConfig, PipelineState,
    RunReport, VideoPass,
};
pub use recovery::{RecoveryPolicy, Session};
pub use sequencer::{FramePlan, FramePosition, FrameSequence};
pub use surface::{RenderSurface, SurfaceProvider};
#[cfg(feature = "cdp")]
pub use surface::{CdpProvider, CdpSurface};

/// Viewport dimensions, in CSS pixels.
///
/// Captures come back at `viewport × devicePixelRatio` device pixels, so the
/// raster is usually larger than what is requested here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

/// Configuration for a browser surface session.
#[derive(Debug, Clone)]
pub struct SurfaceConfig {
    /// Viewport dimensions
    pub viewport: Viewport,
    /// Timeout for individual CDP operations in milliseconds
    pub timeout_ms: u64,
    /// Time to let the page settle after navigation, in milliseconds
    pub settle_ms: u64,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            viewport: Viewport::default(),
            timeout_ms: 30000,
            settle_ms: 500,
        }
    }
}

/// Which page to drive and how to set it up.
#[derive(Debug, Clone)]
pub struct SceneTarget {
    /// Page that hosts the animation
    pub url: String,
    /// Opaque JSON-friendly value handed to the page's setup call, so one
    /// page can implement several scenes
    pub scene: Option<serde_json::Value>,
    /// When set, the reported source identifier must match exactly
    pub expect_source: Option<String>,
}

impl SceneTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            scene: None,
            expect_source: None,
        }
    }

    pub fn with_scene(mut self, scene: serde_json::Value) -> Self {
        self.scene = Some(scene);
        self
    }

    pub fn expecting(mut self, source: impl Into<String>) -> Self {
        self.expect_source = Some(source.into());
        self
    }
}

/// What the page reported from its setup call.
///
/// The page answers with a JSON object in camelCase; `devicePixelRatio` may
/// be omitted and defaults to 1.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderCapabilities {
    /// Identifies which program/scene is actually loaded
    pub source_identifier: String,
    /// Device pixels per CSS pixel of the capture
    #[serde(default = "default_pixel_ratio")]
    pub device_pixel_ratio: f64,
    /// How the page addresses its frames
    pub frame_domain: FrameDomain,
}

fn default_pixel_ratio() -> f64 {
    1.0
}

/// The frame addressing scheme a page declares. Exactly one form is present.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FrameDomain {
    /// The page thinks in time and reports its total duration
    #[serde(rename_all = "camelCase")]
    Seconds { duration_seconds: f64 },
    /// The page thinks in discrete frames and reports its inclusive range
    #[serde(rename_all = "camelCase")]
    Index { first_frame: i64, last_frame: i64 },
}

/// Outcome of one policy-wrapped render.
///
/// Failure is a value, never a panic or error escaping the recovery
/// boundary, so the orchestrator can make shutdown decisions uniformly.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderResult {
    /// Raw image bytes for the requested position
    Success(Vec<u8>),
    /// The position could not be rendered and the run should wind down
    Failure(String),
}
