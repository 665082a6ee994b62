//! Remote render surface: the async seam over a page that draws frames
//!
//! A surface is initialized once per scene with an opaque selector, reports
//! its capabilities, and then renders one frame position at a time. The
//! production backend drives a page over CDP; the traits exist so the
//! recovery layer can launch fresh sessions and tests can script fakes.

use crate::error::Result;
use crate::sequencer::FramePosition;
use crate::{RenderCapabilities, SceneTarget};
use async_trait::async_trait;

/// One session with a remote, stateful drawing surface.
///
/// `render_frame` must not be called before `initialize` has succeeded for
/// the current session; callers get whatever the page does otherwise.
#[async_trait]
pub trait RenderSurface: Send {
    /// Point the surface at a scene and read back what it can render.
    async fn initialize(&mut self, target: &SceneTarget) -> Result<RenderCapabilities>;

    /// Ask the surface to show one position and capture the raster.
    async fn render_frame(&mut self, position: FramePosition) -> Result<Vec<u8>>;

    /// Tear the session down. Best-effort; a failed close is logged, not
    /// propagated, by callers that are already winding down.
    async fn close(&mut self) -> Result<()>;
}

/// Launches fresh surface sessions.
///
/// The recovery policy goes through this when it discards a wedged session,
/// so a provider must be able to launch more than once.
#[async_trait]
pub trait SurfaceProvider: Send {
    type Surface: RenderSurface;

    async fn launch(&self) -> Result<Self::Surface>;
}

#[cfg(feature = "cdp")]
pub use backend::{CdpProvider, CdpSurface};

#[cfg(feature = "cdp")]
mod backend {
    use super::{RenderSurface, SurfaceProvider};
    use crate::cdp::{self, CdpClient};
    use crate::error::{Error, Result};
    use crate::sequencer::FramePosition;
    use crate::{RenderCapabilities, SceneTarget, SurfaceConfig};
    use async_trait::async_trait;
    use log::info;
    use std::sync::mpsc::{self, Sender};
    use std::thread;
    use tokio::sync::oneshot;

    enum Command {
        Goto(String, oneshot::Sender<Result<()>>),
        CallJson(String, oneshot::Sender<Result<serde_json::Value>>),
        Screenshot(oneshot::Sender<Result<Vec<u8>>>),
        Close(oneshot::Sender<Result<()>>),
    }

    /// CDP-backed render surface.
    ///
    /// The synchronous `headless_chrome` client lives on a dedicated worker
    /// thread that executes one command at a time; this handle sends commands
    /// in over a channel and awaits each reply on a oneshot, so async callers
    /// never block on the browser and access stays strictly serialized.
    pub struct CdpSurface {
        cmd_tx: Sender<Command>,
    }

    impl CdpSurface {
        /// Launch a browser on a fresh worker thread.
        pub async fn launch(config: SurfaceConfig) -> Result<Self> {
            let (cmd_tx, cmd_rx) = mpsc::channel::<Command>();
            let (init_tx, init_rx) = oneshot::channel::<Result<()>>();

            thread::spawn(move || {
                let client = match CdpClient::launch(config) {
                    Ok(client) => client,
                    Err(err) => {
                        let _ = init_tx.send(Err(err));
                        return;
                    }
                };
                let _ = init_tx.send(Ok(()));

                while let Ok(cmd) = cmd_rx.recv() {
                    match cmd {
                        Command::Goto(url, resp) => {
                            let _ = resp.send(client.load_url(&url));
                        }
                        Command::CallJson(expr, resp) => {
                            let _ = resp.send(client.call_json(&expr));
                        }
                        Command::Screenshot(resp) => {
                            let _ = resp.send(client.screenshot());
                        }
                        Command::Close(resp) => {
                            // Dropping the client closes the browser.
                            let _ = resp.send(Ok(()));
                            break;
                        }
                    }
                }
            });

            init_rx
                .await
                .map_err(|_| Error::RemoteInit("Browser worker died during launch".into()))??;
            Ok(Self { cmd_tx })
        }

        async fn goto(&self, url: &str) -> Result<()> {
            let (tx, rx) = oneshot::channel();
            let _ = self.cmd_tx.send(Command::Goto(url.to_string(), tx));
            rx.await.map_err(|_| worker_gone())?
        }

        async fn call_json(&self, expression: String) -> Result<serde_json::Value> {
            let (tx, rx) = oneshot::channel();
            let _ = self.cmd_tx.send(Command::CallJson(expression, tx));
            rx.await.map_err(|_| worker_gone())?
        }

        async fn screenshot(&self) -> Result<Vec<u8>> {
            let (tx, rx) = oneshot::channel();
            let _ = self.cmd_tx.send(Command::Screenshot(tx));
            rx.await.map_err(|_| worker_gone())?
        }
    }

    fn worker_gone() -> Error {
        Error::Cdp("Browser worker is gone".into())
    }

    #[async_trait]
    impl RenderSurface for CdpSurface {
        async fn initialize(&mut self, target: &SceneTarget) -> Result<RenderCapabilities> {
            self.goto(&target.url).await?;

            let scene = target.scene.clone().unwrap_or(serde_json::Value::Null);
            let expr = cdp::init_expression(&scene)?;
            let value = self
                .call_json(expr)
                .await
                .map_err(|e| Error::RemoteInit(format!("Setup call failed: {}", e)))?;
            let text = value.as_str().ok_or_else(|| {
                Error::RemoteInit(format!("Setup call returned a non-string: {}", value))
            })?;
            let capabilities: RenderCapabilities = serde_json::from_str(text)
                .map_err(|e| Error::RemoteInit(format!("Unparseable capabilities: {}", e)))?;

            info!(
                "Capturing {:?} at {}x device pixel ratio",
                capabilities.source_identifier, capabilities.device_pixel_ratio
            );
            Ok(capabilities)
        }

        async fn render_frame(&mut self, position: FramePosition) -> Result<Vec<u8>> {
            let expr = cdp::render_expression(position.wire_value());
            self.call_json(expr)
                .await
                .map_err(|e| Error::RemoteRender(format!("Render call at {} failed: {}", position, e)))?;
            self.screenshot()
                .await
                .map_err(|e| Error::RemoteRender(format!("Screenshot at {} failed: {}", position, e)))
        }

        async fn close(&mut self) -> Result<()> {
            let (tx, rx) = oneshot::channel();
            let _ = self.cmd_tx.send(Command::Close(tx));
            rx.await.map_err(|_| worker_gone())?
        }
    }

    /// Launches [`CdpSurface`] sessions from one shared configuration.
    #[derive(Debug, Clone, Default)]
    pub struct CdpProvider {
        config: SurfaceConfig,
    }

    impl CdpProvider {
        pub fn new(config: SurfaceConfig) -> Self {
            Self { config }
        }
    }

    #[async_trait]
    impl SurfaceProvider for CdpProvider {
        type Surface = CdpSurface;

        async fn launch(&self) -> Result<CdpSurface> {
            CdpSurface::launch(self.config.clone()).await
        }
    }
}
