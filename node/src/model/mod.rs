//! Minimal Pong simulation: arena geometry, paddles, ball.

mod arena;
mod direction;
mod pong;

pub use arena::ArenaConfig;
pub use direction::{Direction, Side};
pub use pong::{Ball, Paddle, Pong};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}
