use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType, InsertTextParams,
    MouseButton as CdpMouseButton,
};
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, Viewport};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::layout::Point;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::agent::AgentError;
use crate::computer::{ActionExecutor, ImageFormat, MouseButton, ScreenCapture, ScrollDirection};
use crate::geometry::ScreenRegion;

/// Pixels per scroll "click".
const SCROLL_STEP: i32 = 100;
const MOVE_STEPS: u32 = 10;

#[derive(Clone, Debug)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub viewport: (u32, u32),
    pub start_url: Option<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: None,
            viewport: (1280, 800),
            start_url: None,
        }
    }
}

/// A Chromium page driven over CDP, used as both the screen and the input
/// device. Clones share the same page.
#[derive(Clone)]
pub struct ChromiumDesktop {
    page: Page,
    _browser: Arc<OxideBrowser>,
    viewport: (u32, u32),
    pointer: Arc<Mutex<(i32, i32)>>,
}

fn computer_err(e: impl std::fmt::Display) -> AgentError {
    AgentError::Computer(e.to_string())
}

impl ChromiumDesktop {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // Unique profile per launch; Chromium refuses to share a locked profile dir.
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("deskhand-profile-{}-{}", std::process::id(), ts));
        std::fs::create_dir_all(&profile_dir)?;
        builder = builder
            .user_data_dir(profile_dir)
            .window_size(cfg.viewport.0, cfg.viewport.1)
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        info!(headless = cfg.headless, "chromium launched");
        Self::attach(browser, cfg).await
    }

    /// Attaches to an already running Chromium at its DevTools websocket URL.
    pub async fn connect(ws_url: &str, cfg: BrowserConfig) -> Result<Self> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url).await?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        info!(url = ws_url, "connected to chromium");
        Self::attach(browser, cfg).await
    }

    async fn attach(browser: OxideBrowser, cfg: BrowserConfig) -> Result<Self> {
        let url = cfg.start_url.as_deref().unwrap_or("about:blank");
        let page = browser.new_page(url).await?;
        if let Some(ua) = cfg.user_agent {
            page.set_user_agent(ua).await?;
        }
        let desktop = Self {
            page,
            _browser: Arc::new(browser),
            viewport: cfg.viewport,
            pointer: Arc::new(Mutex::new((0, 0))),
        };
        desktop.apply_viewport().await?;
        Ok(desktop)
    }

    // Screenshots fail with a zero-sized viewport.
    async fn apply_viewport(&self) -> Result<()> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(self.viewport.0 as i64)
            .height(self.viewport.1 as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(params).await?;
        Ok(())
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    pub async fn url(&self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    fn set_pointer(&self, x: i32, y: i32) {
        if let Ok(mut p) = self.pointer.lock() {
            *p = (x, y);
        }
    }

    fn pointer(&self) -> (i32, i32) {
        self.pointer.lock().map(|p| *p).unwrap_or_default()
    }

    async fn move_to(&self, x: i32, y: i32) -> Result<()> {
        self.page
            .move_mouse(Point {
                x: x as f64,
                y: y as f64,
            })
            .await?;
        self.set_pointer(x, y);
        Ok(())
    }

    async fn mouse_event(
        &self,
        kind: DispatchMouseEventType,
        x: i32,
        y: i32,
        button: CdpMouseButton,
        click_count: i64,
    ) -> Result<()> {
        let cmd = DispatchMouseEventParams::builder()
            .r#type(kind)
            .x(x as f64)
            .y(y as f64)
            .button(button)
            .click_count(click_count)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(cmd).await?;
        Ok(())
    }

    async fn evaluate(&self, expression: String) -> Result<()> {
        let eval = EvaluateParams::builder()
            .expression(expression)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(eval).await?;
        Ok(())
    }

    async fn glide(&self, x: i32, y: i32, duration: Duration) -> Result<()> {
        if duration.is_zero() {
            return self.move_to(x, y).await;
        }
        let (sx, sy) = self.pointer();
        let pause = duration / MOVE_STEPS;
        for step in 1..=MOVE_STEPS {
            let t = step as f64 / MOVE_STEPS as f64;
            let px = sx + ((x - sx) as f64 * t).round() as i32;
            let py = sy + ((y - sy) as f64 * t).round() as i32;
            self.move_to(px, py).await?;
            sleep(pause).await;
        }
        Ok(())
    }

    async fn click_at(&self, x: i32, y: i32, button: MouseButton, clicks: u32) -> Result<()> {
        let btn = match button {
            MouseButton::Left => CdpMouseButton::Left,
            MouseButton::Right => CdpMouseButton::Right,
            MouseButton::Middle => CdpMouseButton::Middle,
        };
        self.move_to(x, y).await?;
        for n in 1..=clicks.max(1) as i64 {
            self.mouse_event(DispatchMouseEventType::MousePressed, x, y, btn.clone(), n)
                .await?;
            self.mouse_event(DispatchMouseEventType::MouseReleased, x, y, btn.clone(), n)
                .await?;
        }
        Ok(())
    }

    async fn insert_text(&self, text: &str, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            self.page
                .execute(InsertTextParams {
                    text: text.to_string(),
                })
                .await?;
            return Ok(());
        }
        for ch in text.chars() {
            self.page
                .execute(InsertTextParams {
                    text: ch.to_string(),
                })
                .await?;
            sleep(interval).await;
        }
        Ok(())
    }

    async fn key(&self, key: &str) -> Result<()> {
        let k = dom_key(key);
        let js = format!(
            r#"
            (function() {{
              const el = document.activeElement || document.body;
              const opts = {{key: {k}, code: {k}, bubbles: true}};
              el.dispatchEvent(new KeyboardEvent("keydown", opts));
              el.dispatchEvent(new KeyboardEvent("keyup", opts));
            }})()
        "#,
            k = json!(k)
        );
        self.evaluate(js).await
    }

    async fn scroll_by(&self, direction: ScrollDirection, amount: i32, at: Option<(i32, i32)>) -> Result<()> {
        if let Some((x, y)) = at {
            self.move_to(x, y).await?;
        }
        let px = amount * SCROLL_STEP;
        let (dx, dy) = match direction {
            ScrollDirection::Up => (0, -px),
            ScrollDirection::Down => (0, px),
            ScrollDirection::Left => (-px, 0),
            ScrollDirection::Right => (px, 0),
        };
        self.evaluate(format!("window.scrollBy({dx}, {dy});")).await
    }

    async fn screenshot(&self, region: Option<ScreenRegion>, format: ImageFormat) -> Result<Vec<u8>> {
        match self.page.screenshot(screenshot_params(region, format)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("0 width") || msg.contains("0 height") {
                    debug!("zero-sized viewport, forcing metrics and retrying");
                    self.apply_viewport().await?;
                    sleep(Duration::from_millis(50)).await;
                    return Ok(self.page.screenshot(screenshot_params(region, format)).await?);
                }
                Err(anyhow!(e))
            }
        }
    }
}

fn screenshot_params(region: Option<ScreenRegion>, format: ImageFormat) -> ScreenshotParams {
    let builder = ScreenshotParams::builder().format(match format {
        ImageFormat::Png => CaptureScreenshotFormat::Png,
        ImageFormat::Jpeg => CaptureScreenshotFormat::Jpeg,
    });
    match region {
        Some(r) => builder
            .clip(Viewport {
                x: r.x as f64,
                y: r.y as f64,
                width: r.width as f64,
                height: r.height as f64,
                scale: 1.0,
            })
            .build(),
        None => builder.build(),
    }
}

/// DOM `KeyboardEvent.key` for the lowercase names the model uses.
fn dom_key(key: &str) -> String {
    let named = match key.to_ascii_lowercase().as_str() {
        "enter" | "return" => "Enter",
        "tab" => "Tab",
        "escape" | "esc" => "Escape",
        "backspace" => "Backspace",
        "delete" | "del" => "Delete",
        "space" => " ",
        "up" | "arrowup" => "ArrowUp",
        "down" | "arrowdown" => "ArrowDown",
        "left" | "arrowleft" => "ArrowLeft",
        "right" | "arrowright" => "ArrowRight",
        "home" => "Home",
        "end" => "End",
        "pageup" => "PageUp",
        "pagedown" => "PageDown",
        _ => return key.to_string(),
    };
    named.to_string()
}

#[async_trait]
impl ActionExecutor for ChromiumDesktop {
    async fn mouse_move(&self, x: i32, y: i32, duration: Duration) -> Result<Value, AgentError> {
        self.glide(x, y, duration).await.map_err(computer_err)?;
        Ok(json!({ "x": x, "y": y }))
    }

    async fn click(&self, x: i32, y: i32, button: MouseButton, clicks: u32) -> Result<Value, AgentError> {
        self.click_at(x, y, button, clicks).await.map_err(computer_err)?;
        Ok(json!({ "x": x, "y": y, "button": button.as_str(), "clicks": clicks }))
    }

    async fn type_text(&self, text: &str, interval: Duration) -> Result<Value, AgentError> {
        self.insert_text(text, interval).await.map_err(computer_err)?;
        Ok(json!({ "text": text, "length": text.chars().count() }))
    }

    async fn press_key(&self, key: &str) -> Result<Value, AgentError> {
        self.key(key).await.map_err(computer_err)?;
        Ok(json!({ "key": key }))
    }

    async fn scroll(
        &self,
        direction: ScrollDirection,
        amount: i32,
        at: Option<(i32, i32)>,
    ) -> Result<Value, AgentError> {
        self.scroll_by(direction, amount, at).await.map_err(computer_err)?;
        Ok(json!({ "direction": direction.as_str(), "amount": amount }))
    }

    async fn mouse_position(&self) -> Result<(i32, i32), AgentError> {
        Ok(self.pointer())
    }

    async fn screen_size(&self) -> Result<(u32, u32), AgentError> {
        Ok(self.viewport)
    }
}

#[async_trait]
impl ScreenCapture for ChromiumDesktop {
    async fn capture(
        &self,
        region: Option<ScreenRegion>,
        format: ImageFormat,
    ) -> Result<Vec<u8>, AgentError> {
        self.screenshot(region, format).await.map_err(computer_err)
    }

    async fn screen_size(&self) -> Result<(u32, u32), AgentError> {
        Ok(self.viewport)
    }
}
