//! Chrome DevTools Protocol client for the capture surface
//!
//! This is the synchronous half of the CDP backend: it launches a headless
//! Chrome, keeps one tab, and exposes the three operations the capture
//! surface needs. A dedicated worker thread in `surface` owns the instance
//! and serializes access to it.

use crate::error::{Error, Result};
use crate::SurfaceConfig;
use base64::Engine as Base64Engine;
use headless_chrome::browser::tab::Tab;
use headless_chrome::protocol::cdp::Page;
use headless_chrome::{Browser, LaunchOptions};
use log::debug;
use std::sync::Arc;
use std::time::Duration;

/// A headless Chrome instance with a single tab.
pub struct CdpClient {
    // Dropping the browser shuts Chrome down, so it stays alive here even
    // though only the tab is used after launch.
    _browser: Browser,
    tab: Arc<Tab>,
    config: SurfaceConfig,
}

impl CdpClient {
    /// Launch a browser sized to the configured viewport.
    ///
    /// The viewport is in CSS pixels; captures come back at
    /// `viewport × devicePixelRatio` device pixels.
    pub fn launch(config: SurfaceConfig) -> Result<Self> {
        let launch_options = LaunchOptions::default_builder()
            .headless(true)
            .window_size(Some((config.viewport.width, config.viewport.height)))
            .build()
            .map_err(|e| Error::RemoteInit(format!("Failed to build launch options: {}", e)))?;

        let browser = Browser::new(launch_options)
            .map_err(|e| Error::RemoteInit(format!("Failed to launch browser: {}", e)))?;

        let tab = browser
            .new_tab()
            .map_err(|e| Error::RemoteInit(format!("Failed to create tab: {}", e)))?;

        tab.set_default_timeout(Duration::from_millis(config.timeout_ms));

        Ok(Self {
            _browser: browser,
            tab,
            config,
        })
    }

    /// Navigate the tab and let the page settle before anything is evaluated.
    pub fn load_url(&self, url: &str) -> Result<()> {
        self.tab
            .navigate_to(url)
            .map_err(|e| Error::RemoteInit(format!("Navigation failed: {}", e)))?;

        self.tab
            .wait_until_navigated()
            .map_err(|e| Error::RemoteInit(format!("Wait for navigation failed: {}", e)))?;

        std::thread::sleep(Duration::from_millis(self.config.settle_ms));
        debug!("Loaded {}", url);
        Ok(())
    }

    /// Evaluate an expression in the page, awaiting it if it is a promise,
    /// and return its JSON value.
    pub fn call_json(&self, expression: &str) -> Result<serde_json::Value> {
        let result = self
            .tab
            .evaluate(expression, true)
            .map_err(|e| Error::Cdp(format!("Evaluation failed: {}", e)))?;

        result
            .value
            .ok_or_else(|| Error::Cdp("No value returned from evaluation".into()))
    }

    /// Capture the tab's current visual state as a PNG.
    pub fn screenshot(&self) -> Result<Vec<u8>> {
        self.tab
            .capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, None, true)
            .map_err(|e| Error::Cdp(format!("Screenshot failed: {}", e)))
    }
}

/// Expression invoking the page's `initializeCapture` global.
///
/// The scene selector is embedded base64-encoded so arbitrary strings survive
/// the trip through the evaluated source, and the reply comes back as a JSON
/// string so it round-trips losslessly through CDP.
pub fn init_expression(scene: &serde_json::Value) -> Result<String> {
    let json = serde_json::to_string(scene)
        .map_err(|e| Error::RemoteInit(format!("Scene selector is not JSON friendly: {}", e)))?;
    let b64 = base64::engine::general_purpose::STANDARD.encode(json);
    Ok(format!(
        r#"(async () => JSON.stringify(await initializeCapture(JSON.parse(atob("{}")))))()"#,
        b64
    ))
}

/// Expression invoking the page's `renderFrame` global for one position.
pub fn render_expression(position: f64) -> String {
    format!(r#"(async () => {{ await renderFrame({}); return true; }})()"#, position)
}
