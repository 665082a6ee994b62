//! Frame sequencing: turns a capture request into an ordered run of positions

use crate::error::{Error, Result};
use crate::{FrameDomain, RenderCapabilities};
use std::fmt;

/// A single frame to request from the remote surface.
///
/// Exactly one representation is active per session, chosen by the plan and
/// the capabilities the surface reported at initialization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FramePosition {
    /// Progress through the animation, 0 at the start and 1 at the end
    Normalized(f64),
    /// Absolute time offset, for surfaces that report a duration
    Seconds(f64),
    /// Discrete frame number, for surfaces that report an index range
    FrameIndex(i64),
}

impl FramePosition {
    /// The bare number sent to the surface. The surface knows its own domain,
    /// so no tag travels with it.
    pub fn wire_value(&self) -> f64 {
        match self {
            FramePosition::Normalized(t) => *t,
            FramePosition::Seconds(s) => *s,
            FramePosition::FrameIndex(n) => *n as f64,
        }
    }
}

impl fmt::Display for FramePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramePosition::Normalized(t) => write!(f, "t={}", t),
            FramePosition::Seconds(s) => write!(f, "{}s", s),
            FramePosition::FrameIndex(n) => write!(f, "frame {}", n),
        }
    }
}

/// How to derive the ordered set of frame positions for one pass.
#[derive(Debug, Clone)]
pub enum FramePlan {
    /// Explicit normalized positions, rendered in the given order
    Positions(Vec<f64>),
    /// Sample progress evenly so a fixed duration is covered end to end
    Duration { seconds: f64, frame_rate: f64 },
    /// Render everything the capabilities advertise
    Slurp { frame_rate: f64 },
}

impl FramePlan {
    /// Validate the plan and produce its sequence.
    ///
    /// All input checking happens here, so a bad request fails before any
    /// remote call is issued. `capabilities` is only consulted by
    /// [`FramePlan::Slurp`]; `start_at` skips that many leading positions to
    /// resume an interrupted run.
    pub fn sequence(
        &self,
        capabilities: Option<&RenderCapabilities>,
        start_at: usize,
    ) -> Result<FrameSequence> {
        match self {
            FramePlan::Positions(ts) => {
                for t in ts {
                    check_normalized(*t)?;
                }
                Ok(FrameSequence::new(Mode::Positions(ts.clone()), ts.len(), start_at))
            }
            FramePlan::Duration { seconds, frame_rate } => {
                check_duration(*seconds)?;
                check_frame_rate(*frame_rate)?;
                let count = (seconds * frame_rate).ceil() as usize;
                Ok(FrameSequence::new(Mode::Even, count, start_at))
            }
            FramePlan::Slurp { frame_rate } => {
                let caps = capabilities.ok_or_else(|| {
                    Error::Config("slurp requires an initialized surface".into())
                })?;
                match &caps.frame_domain {
                    FrameDomain::Seconds { duration_seconds } => {
                        check_duration(*duration_seconds)?;
                        check_frame_rate(*frame_rate)?;
                        // The surface renders up to, not through, its duration.
                        let bound = duration_seconds * frame_rate - 1.0;
                        let count = if bound <= 0.0 { 0 } else { bound.ceil() as usize };
                        Ok(FrameSequence::new(
                            Mode::BySeconds { frame_rate: *frame_rate },
                            count,
                            start_at,
                        ))
                    }
                    FrameDomain::Index { first_frame, last_frame } => {
                        if last_frame < first_frame {
                            return Err(Error::Config(format!(
                                "frame range is reversed: [{}, {}]",
                                first_frame, last_frame
                            )));
                        }
                        let count = (last_frame - first_frame + 1) as usize;
                        Ok(FrameSequence::new(
                            Mode::ByIndex { first: *first_frame },
                            count,
                            start_at,
                        ))
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
enum Mode {
    Positions(Vec<f64>),
    Even,
    BySeconds { frame_rate: f64 },
    ByIndex { first: i64 },
}

/// A validated, finite, ordered run of frame positions.
///
/// Positions are computed lazily as the iterator advances. `total()` counts
/// the whole run including any skipped prefix, so progress and resume offsets
/// stay meaningful across restarts.
#[derive(Debug)]
pub struct FrameSequence {
    mode: Mode,
    next: usize,
    total: usize,
    start: usize,
}

impl FrameSequence {
    fn new(mode: Mode, total: usize, start_at: usize) -> Self {
        Self {
            mode,
            next: start_at.min(total),
            total,
            start: start_at.min(total),
        }
    }

    /// Number of positions in the full run, ignoring the start offset.
    pub fn total(&self) -> usize {
        self.total
    }

    /// The offset this sequence was resumed from (0 for a fresh run).
    pub fn start_offset(&self) -> usize {
        self.start
    }

    fn position_at(&self, i: usize) -> FramePosition {
        match &self.mode {
            Mode::Positions(ts) => FramePosition::Normalized(ts[i]),
            Mode::Even => {
                if self.total <= 1 {
                    FramePosition::Normalized(0.0)
                } else {
                    FramePosition::Normalized(i as f64 / (self.total as f64 - 1.0))
                }
            }
            Mode::BySeconds { frame_rate } => FramePosition::Seconds(i as f64 / frame_rate),
            Mode::ByIndex { first } => FramePosition::FrameIndex(first + i as i64),
        }
    }
}

impl Iterator for FrameSequence {
    type Item = FramePosition;

    fn next(&mut self) -> Option<FramePosition> {
        if self.next >= self.total {
            return None;
        }
        let pos = self.position_at(self.next);
        self.next += 1;
        Some(pos)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for FrameSequence {}

pub(crate) fn check_normalized(t: f64) -> Result<()> {
    if !(t.is_finite() && (0.0..=1.0).contains(&t)) {
        return Err(Error::Config(format!(
            "t should be between 0 and 1, inclusive, got {}",
            t
        )));
    }
    Ok(())
}

pub(crate) fn check_duration(seconds: f64) -> Result<()> {
    if !(seconds.is_finite() && seconds >= 0.0) {
        return Err(Error::Config(format!(
            "duration should be a non-negative number of seconds, got {}",
            seconds
        )));
    }
    Ok(())
}

pub(crate) fn check_frame_rate(frame_rate: f64) -> Result<()> {
    if !(frame_rate.is_finite() && frame_rate > 0.0) {
        return Err(Error::Config(format!(
            "frame rate should be a positive number, got {}",
            frame_rate
        )));
    }
    Ok(())
}
