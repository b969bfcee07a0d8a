use std::time::Duration;

use rand::Rng;

use crate::config::ChaosConfig;

pub const DEFAULT_WANDER_RADIUS: f64 = 100.0;
/// One jitter step per frame at 60 fps.
pub const FRAME_INTERVAL: Duration = Duration::from_micros(16_667);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Jitters a displayed pointer around the real one.
#[derive(Debug, Clone, Copy)]
pub struct CursorWander {
    radius: f64,
}

impl Default for CursorWander {
    fn default() -> Self {
        Self::new(DEFAULT_WANDER_RADIUS)
    }
}

impl CursorWander {
    pub fn new(radius: f64) -> Self {
        Self {
            radius: if radius.is_finite() { radius.abs() } else { 0.0 },
        }
    }

    /// Largest offset on either axis for the current config.
    pub fn reach(&self, config: &ChaosConfig) -> f64 {
        if !config.cursor_active() {
            return 0.0;
        }
        self.radius * config.intensity()
    }

    /// Displayed position for one frame; the real position when inactive.
    pub fn offset(&self, real: Point, config: &ChaosConfig, rng: &mut impl Rng) -> Point {
        let reach = self.reach(config);
        if reach == 0.0 {
            return real;
        }

        let dx = (rng.gen::<f64>() - 0.5) * reach * 2.0;
        let dy = (rng.gen::<f64>() - 0.5) * reach * 2.0;
        Point::new(real.x + dx, real.y + dy)
    }
}
