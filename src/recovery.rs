//! Graduated failure recovery around the render surface
//!
//! Remote surfaces get into persistent bad states that a same-session retry
//! cannot fix; only a fresh session reliably recovers. One render request
//! therefore escalates: try, retry once, then tear the session down, pause,
//! launch a new one and try a final time. After that the surface is treated
//! as permanently failed for the rest of the run and every further request
//! fails immediately without touching the remote side again.

use crate::error::{Error, Result};
use crate::sequencer::FramePosition;
use crate::surface::{RenderSurface, SurfaceProvider};
use crate::{RenderCapabilities, RenderResult, SceneTarget};
use log::{debug, warn};
use std::time::Duration;

/// Tunables for the escalation ladder.
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    /// How long to wait before launching a replacement session.
    pub reinit_pause: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            reinit_pause: Duration::from_secs(2),
        }
    }
}

/// A policy-wrapped surface session.
///
/// Owns the provider, the current surface, and the scene it was initialized
/// with, so it can rebuild the whole session from scratch during recovery.
/// Past [`render`](Self::render), failure is a value: the method never
/// returns an error, only [`RenderResult::Failure`], which callers treat as
/// the end of the run.
pub struct Session<P: SurfaceProvider> {
    provider: P,
    policy: RecoveryPolicy,
    surface: Option<P::Surface>,
    target: Option<SceneTarget>,
    capabilities: Option<RenderCapabilities>,
    wedged: bool,
}

impl<P: SurfaceProvider> Session<P> {
    pub fn new(provider: P, policy: RecoveryPolicy) -> Self {
        Self {
            provider,
            policy,
            surface: None,
            target: None,
            capabilities: None,
            wedged: false,
        }
    }

    /// Launch a surface if none is live and initialize it for `target`.
    ///
    /// Reuses the running session when called again for another scene, the
    /// way one browser serves several pages in a row. A declared
    /// `expect_source` that disagrees with what the page reports is a fatal
    /// [`Error::SourceMismatch`], never retried: the wrong scene is loaded,
    /// which no amount of reinitialization fixes.
    pub async fn initialize(&mut self, target: SceneTarget) -> Result<RenderCapabilities> {
        if self.wedged {
            return Err(Error::RemoteInit(
                "render surface already failed permanently this run".into(),
            ));
        }
        if self.surface.is_none() {
            let fresh = self.provider.launch().await?;
            self.surface = Some(fresh);
        }
        let surface = self
            .surface
            .as_mut()
            .ok_or_else(|| Error::RemoteInit("surface launch produced nothing".into()))?;
        let capabilities = surface.initialize(&target).await?;
        check_source(&target, &capabilities)?;
        self.capabilities = Some(capabilities.clone());
        self.target = Some(target);
        Ok(capabilities)
    }

    /// What the current scene reported at initialization.
    pub fn capabilities(&self) -> Option<&RenderCapabilities> {
        self.capabilities.as_ref()
    }

    /// Render one position with full escalation.
    pub async fn render(&mut self, position: FramePosition) -> RenderResult {
        if self.wedged {
            return RenderResult::Failure(
                "render surface already failed permanently this run".into(),
            );
        }

        let first = match self.try_render(position).await {
            Ok(image) => return RenderResult::Success(image),
            Err(e) => e,
        };
        warn!("Render at {} failed: {}; retrying once", position, first);

        let second = match self.try_render(position).await {
            Ok(image) => return RenderResult::Success(image),
            Err(e) => e,
        };
        warn!(
            "Retry at {} failed: {}; reinitializing the surface",
            position, second
        );

        match self.reinitialize_and_render(position).await {
            Ok(image) => RenderResult::Success(image),
            Err(last) => {
                warn!(
                    "Render at {} failed even after reinitialization: {}",
                    position, last
                );
                self.wedged = true;
                RenderResult::Failure(last.to_string())
            }
        }
    }

    /// Whether the permanent-failure latch has tripped.
    pub fn is_wedged(&self) -> bool {
        self.wedged
    }

    async fn try_render(&mut self, position: FramePosition) -> Result<Vec<u8>> {
        let surface = self
            .surface
            .as_mut()
            .ok_or_else(|| Error::RemoteRender("render requested before initialize".into()))?;
        surface.render_frame(position).await
    }

    async fn reinitialize_and_render(&mut self, position: FramePosition) -> Result<Vec<u8>> {
        let target = self
            .target
            .clone()
            .ok_or_else(|| Error::RemoteRender("render requested before initialize".into()))?;

        if let Some(mut old) = self.surface.take() {
            if let Err(e) = old.close().await {
                debug!("Old surface refused to close: {}", e);
            }
        }
        tokio::time::sleep(self.policy.reinit_pause).await;

        let fresh = self.provider.launch().await?;
        let surface = self.surface.insert(fresh);
        let capabilities = surface.initialize(&target).await?;
        check_source(&target, &capabilities)?;
        self.capabilities = Some(capabilities);
        self.try_render(position).await
    }

    /// Tear down the current surface, if any. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if let Some(mut surface) = self.surface.take() {
            if let Err(e) = surface.close().await {
                warn!("Surface close failed: {}", e);
            }
        }
    }
}

fn check_source(target: &SceneTarget, capabilities: &RenderCapabilities) -> Result<()> {
    if let Some(expected) = &target.expect_source {
        if *expected != capabilities.source_identifier {
            return Err(Error::SourceMismatch {
                expected: expected.clone(),
                actual: capabilities.source_identifier.clone(),
            });
        }
    }
    Ok(())
}
