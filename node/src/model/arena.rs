use super::{Side, Vec2};
use rand::Rng;

/// Arena geometry and speeds. Ratios are relative to the arena size.
#[derive(Debug, Clone, PartialEq)]
pub struct ArenaConfig {
    pub width: f64,
    pub height: f64,
    /// Paddle size for LEFT/RIGHT paddles; swapped for UP/DOWN.
    pub paddle_ratio: Vec2,
    pub paddle_padding: f64,
    /// Fraction of the arena's long axis a paddle covers per second.
    pub paddle_speed_ratio: f64,
    pub ball_ratio: f64,
    /// Fraction of the arena width the ball covers per second.
    pub ball_speed_ratio: f64,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            width: 800.0,
            height: 600.0,
            paddle_ratio: Vec2::new(0.02, 0.2),
            paddle_padding: 0.02,
            paddle_speed_ratio: 1.0,
            ball_ratio: 0.02,
            ball_speed_ratio: 0.5,
        }
    }
}

impl ArenaConfig {
    pub fn with_size(width: f64, height: f64) -> Self {
        Self {
            width,
            height,
            ..Self::default()
        }
    }

    pub fn center(&self) -> Vec2 {
        Vec2::new(self.width / 2.0, self.height / 2.0)
    }

    pub fn paddle_size(&self, side: Side) -> Vec2 {
        let ratio = if side.slides_vertically() {
            self.paddle_ratio
        } else {
            Vec2::new(self.paddle_ratio.y, self.paddle_ratio.x)
        };
        Vec2::new(self.width * ratio.x, self.height * ratio.y)
    }

    /// Centre of a freshly joined paddle.
    pub fn paddle_home(&self, side: Side) -> Vec2 {
        let size = self.paddle_size(side);
        match side {
            Side::Left => Vec2::new(self.width * self.paddle_padding + size.x / 2.0, self.height / 2.0),
            Side::Right => Vec2::new(
                self.width - (self.width * self.paddle_padding + size.x / 2.0),
                self.height / 2.0,
            ),
            Side::Up => Vec2::new(self.width / 2.0, self.height * self.paddle_padding + size.y / 2.0),
            Side::Down => Vec2::new(
                self.width / 2.0,
                self.height - (self.height * self.paddle_padding + size.y / 2.0),
            ),
        }
    }

    pub fn paddle_speed(&self, side: Side) -> f64 {
        let axis = if side.slides_vertically() { self.height } else { self.width };
        axis * self.paddle_speed_ratio
    }

    pub fn ball_size(&self) -> Vec2 {
        let edge = self.width.min(self.height) * self.ball_ratio;
        Vec2::new(edge, edge)
    }

    pub fn ball_speed(&self) -> f64 {
        self.width * self.ball_speed_ratio
    }

    /// Random diagonal velocity for a ball leaving the centre.
    pub fn launch_velocity(&self) -> Vec2 {
        let mut rng = rand::thread_rng();
        let speed = self.ball_speed();
        let sx = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
        let sy = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
        Vec2::new(sx * speed, sy * speed * self.height / self.width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paddle_home_positions() {
        let arena = ArenaConfig::default();

        let left = arena.paddle_home(Side::Left);
        let right = arena.paddle_home(Side::Right);
        assert_eq!(left.y, 300.0);
        assert_eq!(right.y, 300.0);
        assert!((left.x - (800.0 - right.x)).abs() < 1e-9);

        let up = arena.paddle_home(Side::Up);
        assert_eq!(up.x, 400.0);
        assert!(up.y < 300.0);
    }

    #[test]
    fn test_paddle_size_rotates_for_horizontal_paddles() {
        let arena = ArenaConfig::default();
        assert_eq!(arena.paddle_size(Side::Left), Vec2::new(16.0, 120.0));
        assert_eq!(arena.paddle_size(Side::Up), Vec2::new(160.0, 12.0));
    }
}
