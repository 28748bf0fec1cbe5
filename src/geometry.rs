use serde::{Deserialize, Serialize};

/// Rectangle on the screen, in pixels. Used both for the capture area and the
/// region inside which coordinate-bearing actions are allowed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenRegion {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl ScreenRegion {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Inclusive on all four edges: a point on `x + width` is inside.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        let (x, y) = (x as i64, y as i64);
        let left = self.x as i64;
        let top = self.y as i64;
        left <= x && x <= left + self.width as i64 && top <= y && y <= top + self.height as i64
    }

    pub fn center(&self) -> (i32, i32) {
        (
            self.x + (self.width / 2) as i32,
            self.y + (self.height / 2) as i32,
        )
    }

    /// Grows the region by `padding` on every side. The origin never goes negative.
    pub fn expand(&self, padding: u32) -> Self {
        Self {
            x: (self.x - padding as i32).max(0),
            y: (self.y - padding as i32).max(0),
            width: self.width + 2 * padding,
            height: self.height + 2 * padding,
        }
    }
}

pub fn scale_point(x: i32, y: i32, from: (u32, u32), to: (u32, u32)) -> (i32, i32) {
    let sx = to.0 as f64 / from.0 as f64;
    let sy = to.1 as f64 / from.1 as f64;
    ((x as f64 * sx) as i32, (y as f64 * sy) as i32)
}

pub fn normalize_point(x: i32, y: i32, resolution: (u32, u32)) -> (f64, f64) {
    (x as f64 / resolution.0 as f64, y as f64 / resolution.1 as f64)
}

pub fn denormalize_point(nx: f64, ny: f64, resolution: (u32, u32)) -> (i32, i32) {
    ((nx * resolution.0 as f64) as i32, (ny * resolution.1 as f64) as i32)
}

/// Half-open screen bounds, unlike [`ScreenRegion::contains`].
pub fn on_screen(x: i32, y: i32, screen: (u32, u32)) -> bool {
    x >= 0 && y >= 0 && (x as i64) < screen.0 as i64 && (y as i64) < screen.1 as i64
}

pub fn clamp_to_screen(x: i32, y: i32, screen: (u32, u32)) -> (i32, i32) {
    let max_x = screen.0.saturating_sub(1) as i32;
    let max_y = screen.1.saturating_sub(1) as i32;
    (x.clamp(0, max_x), y.clamp(0, max_y))
}
