use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::fs as async_fs;

use crate::agent::AgentError;
use crate::geometry::ScreenRegion;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

impl MouseButton {
    pub fn as_str(&self) -> &'static str {
        match self {
            MouseButton::Left => "left",
            MouseButton::Right => "right",
            MouseButton::Middle => "middle",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrollDirection::Up => "up",
            ScrollDirection::Down => "down",
            ScrollDirection::Left => "left",
            ScrollDirection::Right => "right",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn media_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    pub width: u32,
    pub height: u32,
    pub region: Option<ScreenRegion>,
    pub format: ImageFormat,
}

#[derive(Clone, Debug)]
pub struct Capture {
    pub bytes: Vec<u8>,
    pub metadata: CaptureMetadata,
}

// ========================= Pluggable Subsystems =========================

/// Pointer and keyboard injection. Mutating operations return a small JSON
/// description of what was done.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn mouse_move(&self, x: i32, y: i32, duration: Duration) -> Result<Value, AgentError>;
    async fn click(&self, x: i32, y: i32, button: MouseButton, clicks: u32) -> Result<Value, AgentError>;
    async fn double_click(&self, x: i32, y: i32) -> Result<Value, AgentError> {
        self.click(x, y, MouseButton::Left, 2).await
    }
    async fn type_text(&self, text: &str, interval: Duration) -> Result<Value, AgentError>;
    async fn press_key(&self, key: &str) -> Result<Value, AgentError>;
    async fn scroll(
        &self,
        direction: ScrollDirection,
        amount: i32,
        at: Option<(i32, i32)>,
    ) -> Result<Value, AgentError>;
    async fn mouse_position(&self) -> Result<(i32, i32), AgentError>;
    async fn screen_size(&self) -> Result<(u32, u32), AgentError>;
}

#[async_trait]
pub trait ScreenCapture: Send + Sync {
    /// Encoded image bytes of `region`, or of the whole screen.
    async fn capture(
        &self,
        region: Option<ScreenRegion>,
        format: ImageFormat,
    ) -> Result<Vec<u8>, AgentError>;

    async fn screen_size(&self) -> Result<(u32, u32), AgentError>;

    async fn capture_base64(
        &self,
        region: Option<ScreenRegion>,
        format: ImageFormat,
    ) -> Result<String, AgentError> {
        Ok(B64.encode(self.capture(region, format).await?))
    }

    async fn capture_with_metadata(
        &self,
        region: Option<ScreenRegion>,
        format: ImageFormat,
    ) -> Result<Capture, AgentError> {
        let bytes = self.capture(region, format).await?;
        let (width, height) = match region {
            Some(r) => (r.width, r.height),
            None => self.screen_size().await?,
        };
        Ok(Capture {
            bytes,
            metadata: CaptureMetadata {
                width,
                height,
                region,
                format,
            },
        })
    }
}

/// Receives every screenshot the agent takes. `step` is `None` for the
/// screenshot that seeds the conversation.
#[async_trait]
pub trait ScreenshotSink: Send + Sync {
    async fn save(&self, run_id: &str, step: Option<usize>, image_base64: &str) -> Result<(), AgentError>;
}

// ========================= Defaults & Helpers =========================

pub struct DiskScreenshotSink {
    base_dir: PathBuf,
}

impl DiskScreenshotSink {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self {
            base_dir: base.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl ScreenshotSink for DiskScreenshotSink {
    async fn save(&self, run_id: &str, step: Option<usize>, image_base64: &str) -> Result<(), AgentError> {
        let dir = self.base_dir.join(run_id);
        async_fs::create_dir_all(&dir)
            .await
            .map_err(|e| AgentError::Storage(format!("create_dir: {}", e)))?;
        let png = B64
            .decode(image_base64)
            .map_err(|e| AgentError::Storage(format!("b64 decode: {}", e)))?;
        let name = match step {
            Some(s) => format!("step_{:03}.png", s),
            None => "start.png".to_string(),
        };
        async_fs::write(dir.join(name), &png)
            .await
            .map_err(|e| AgentError::Storage(format!("write: {}", e)))?;
        Ok(())
    }
}

// 1x1 transparent PNG
const BLANK_PNG_B64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";

/// Desktop that accepts every action without touching anything and always
/// shows a blank screen. Handy for wiring hooks and tools before pointing the
/// agent at a real screen.
pub struct NoopDesktop {
    size: (u32, u32),
    actions: AtomicUsize,
}

impl NoopDesktop {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: (width, height),
            actions: AtomicUsize::new(0),
        }
    }

    /// Number of mutating actions received so far.
    pub fn action_count(&self) -> usize {
        self.actions.load(Ordering::SeqCst)
    }

    fn record(&self, data: Value) -> Result<Value, AgentError> {
        self.actions.fetch_add(1, Ordering::SeqCst);
        Ok(data)
    }
}

impl Default for NoopDesktop {
    fn default() -> Self {
        Self::new(1280, 800)
    }
}

#[async_trait]
impl ActionExecutor for NoopDesktop {
    async fn mouse_move(&self, x: i32, y: i32, _duration: Duration) -> Result<Value, AgentError> {
        self.record(json!({ "x": x, "y": y }))
    }

    async fn click(&self, x: i32, y: i32, button: MouseButton, clicks: u32) -> Result<Value, AgentError> {
        self.record(json!({ "x": x, "y": y, "button": button.as_str(), "clicks": clicks }))
    }

    async fn type_text(&self, text: &str, _interval: Duration) -> Result<Value, AgentError> {
        self.record(json!({ "text": text, "length": text.chars().count() }))
    }

    async fn press_key(&self, key: &str) -> Result<Value, AgentError> {
        self.record(json!({ "key": key }))
    }

    async fn scroll(
        &self,
        direction: ScrollDirection,
        amount: i32,
        _at: Option<(i32, i32)>,
    ) -> Result<Value, AgentError> {
        self.record(json!({ "direction": direction.as_str(), "amount": amount }))
    }

    async fn mouse_position(&self) -> Result<(i32, i32), AgentError> {
        Ok((0, 0))
    }

    async fn screen_size(&self) -> Result<(u32, u32), AgentError> {
        Ok(self.size)
    }
}

#[async_trait]
impl ScreenCapture for NoopDesktop {
    async fn capture(
        &self,
        _region: Option<ScreenRegion>,
        _format: ImageFormat,
    ) -> Result<Vec<u8>, AgentError> {
        B64.decode(BLANK_PNG_B64)
            .map_err(|e| AgentError::Computer(format!("blank png: {}", e)))
    }

    async fn screen_size(&self) -> Result<(u32, u32), AgentError> {
        Ok(self.size)
    }
}
