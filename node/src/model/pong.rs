use super::{ArenaConfig, Direction, Side, Vec2};
use crate::cluster::GameDocument;
use crate::event::{BallState, GameSnapshot, PaddleState};

#[derive(Debug, Clone, PartialEq)]
pub struct Paddle {
    pub side: Side,
    /// Centre of the paddle.
    pub position: Vec2,
    pub size: Vec2,
    pub direction: Direction,
}

impl Paddle {
    pub fn new(side: Side, arena: &ArenaConfig) -> Self {
        Self {
            side,
            position: arena.paddle_home(side),
            size: arena.paddle_size(side),
            direction: Direction::None,
        }
    }

    fn slide(&mut self, dt: f64, arena: &ArenaConfig) {
        let (dx, dy) = self.side.axis_vector(self.direction);
        let speed = arena.paddle_speed(self.side);
        self.position.x += f64::from(dx) * speed * dt;
        self.position.y += f64::from(dy) * speed * dt;

        let half = Vec2::new(self.size.x / 2.0, self.size.y / 2.0);
        self.position.x = self.position.x.clamp(half.x, arena.width - half.x);
        self.position.y = self.position.y.clamp(half.y, arena.height - half.y);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ball {
    /// Centre of the ball.
    pub position: Vec2,
    pub velocity: Vec2,
    pub size: Vec2,
}

impl Ball {
    pub fn centered(arena: &ArenaConfig) -> Self {
        Self {
            position: arena.center(),
            velocity: Vec2::ZERO,
            size: arena.ball_size(),
        }
    }

    /// Moves the ball by `dt` seconds and reflects it off walls and paddles.
    pub fn advance<'a>(
        &mut self,
        dt: f64,
        arena: &ArenaConfig,
        paddles: impl IntoIterator<Item = &'a Paddle>,
    ) {
        self.position.x += self.velocity.x * dt;
        self.position.y += self.velocity.y * dt;

        let half = Vec2::new(self.size.x / 2.0, self.size.y / 2.0);
        if self.position.x - half.x < 0.0 {
            self.position.x = half.x;
            self.velocity.x = self.velocity.x.abs();
        } else if self.position.x + half.x > arena.width {
            self.position.x = arena.width - half.x;
            self.velocity.x = -self.velocity.x.abs();
        }
        if self.position.y - half.y < 0.0 {
            self.position.y = half.y;
            self.velocity.y = self.velocity.y.abs();
        } else if self.position.y + half.y > arena.height {
            self.position.y = arena.height - half.y;
            self.velocity.y = -self.velocity.y.abs();
        }

        for paddle in paddles {
            let reach_x = half.x + paddle.size.x / 2.0;
            let reach_y = half.y + paddle.size.y / 2.0;
            let overlaps = (self.position.x - paddle.position.x).abs() <= reach_x
                && (self.position.y - paddle.position.y).abs() <= reach_y;
            if !overlaps {
                continue;
            }
            match paddle.side {
                Side::Left => self.velocity.x = self.velocity.x.abs(),
                Side::Right => self.velocity.x = -self.velocity.x.abs(),
                Side::Up => self.velocity.y = self.velocity.y.abs(),
                Side::Down => self.velocity.y = -self.velocity.y.abs(),
            }
        }
    }
}

/// Authoritative (coordinator) or mirrored (terminal) game state.
#[derive(Debug, Clone)]
pub struct Pong {
    config: ArenaConfig,
    paddles: Vec<Paddle>,
    pub ball: Ball,
}

impl Pong {
    pub fn new(config: ArenaConfig) -> Self {
        let ball = Ball::centered(&config);
        Self {
            config,
            paddles: Vec::new(),
            ball,
        }
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    pub fn paddles(&self) -> &[Paddle] {
        &self.paddles
    }

    pub fn paddle(&self, side: Side) -> Option<&Paddle> {
        self.paddles.iter().find(|p| p.side == side)
    }

    pub fn has_paddle(&self, side: Side) -> bool {
        self.paddle(side).is_some()
    }

    /// Adds a paddle at its home position. Returns false if the side is taken.
    pub fn add_paddle(&mut self, side: Side) -> bool {
        if self.has_paddle(side) {
            return false;
        }
        self.paddles.push(Paddle::new(side, &self.config));
        true
    }

    pub fn remove_paddle(&mut self, side: Side) -> bool {
        let before = self.paddles.len();
        self.paddles.retain(|p| p.side != side);
        self.paddles.len() != before
    }

    /// Sets the movement a paddle keeps applying until the next call.
    pub fn move_paddle(&mut self, side: Side, direction: Direction) -> bool {
        match self.paddles.iter_mut().find(|p| p.side == side) {
            Some(paddle) => {
                paddle.direction = direction;
                true
            }
            None => false,
        }
    }

    /// Re-centres the ball and launches it diagonally in a random direction.
    pub fn reset_ball(&mut self) {
        self.ball = Ball {
            position: self.config.center(),
            velocity: self.config.launch_velocity(),
            size: self.config.ball_size(),
        };
    }

    pub fn update(&mut self, dt: f64) {
        for paddle in &mut self.paddles {
            paddle.slide(dt, &self.config);
        }
        self.ball.advance(dt, &self.config, &self.paddles);
    }

    pub fn snapshot(&self) -> GameSnapshot {
        GameSnapshot {
            ball: BallState {
                x: self.ball.position.x,
                y: self.ball.position.y,
                vx: self.ball.velocity.x,
                vy: self.ball.velocity.y,
            },
            paddles: self
                .paddles
                .iter()
                .map(|p| PaddleState {
                    side: p.side,
                    x: p.position.x,
                    y: p.position.y,
                    direction: p.direction,
                })
                .collect(),
        }
    }

    /// Replaces paddles and ball with the snapshot's values.
    pub fn apply_snapshot(&mut self, snapshot: &GameSnapshot) {
        self.ball.position = Vec2::new(snapshot.ball.x, snapshot.ball.y);
        self.ball.velocity = Vec2::new(snapshot.ball.vx, snapshot.ball.vy);
        self.paddles = snapshot
            .paddles
            .iter()
            .map(|state| Paddle {
                side: state.side,
                position: Vec2::new(state.x, state.y),
                size: self.config.paddle_size(state.side),
                direction: state.direction,
            })
            .collect();
    }

    /// Replaces paddles and ball with the canonical document's values.
    pub fn apply_document(&mut self, document: &GameDocument) {
        self.ball.position = document.ball.position;
        self.ball.velocity = document.ball.velocity;
        self.paddles = document
            .players
            .iter()
            .filter_map(|player| {
                let side = player.direction.side()?;
                Some(Paddle {
                    side,
                    position: Vec2::new(player.x, player.y),
                    size: self.config.paddle_size(side),
                    direction: Direction::None,
                })
            })
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_paddle_rejects_taken_side() {
        let mut pong = Pong::new(ArenaConfig::default());
        assert!(pong.add_paddle(Side::Left));
        assert!(!pong.add_paddle(Side::Left));
        assert!(pong.add_paddle(Side::Right));
        assert_eq!(pong.paddles().len(), 2);

        assert!(pong.remove_paddle(Side::Left));
        assert!(!pong.remove_paddle(Side::Left));
        assert_eq!(pong.paddles().len(), 1);
    }

    #[test]
    fn test_reset_ball_centres_and_launches() {
        let mut pong = Pong::new(ArenaConfig::default());
        pong.reset_ball();
        assert_eq!(pong.ball.position, Vec2::new(400.0, 300.0));
        assert!(pong.ball.velocity.x != 0.0 && pong.ball.velocity.y != 0.0);
    }

    #[test]
    fn test_update_zero_dt_keeps_state() {
        let mut pong = Pong::new(ArenaConfig::default());
        pong.add_paddle(Side::Left);
        pong.reset_ball();
        let before = pong.snapshot();

        pong.update(0.0);
        assert_eq!(pong.snapshot(), before);
    }

    #[test]
    fn test_paddle_moves_while_direction_is_set() {
        let mut pong = Pong::new(ArenaConfig::default());
        pong.add_paddle(Side::Left);
        let start = pong.paddle(Side::Left).unwrap().position.y;

        pong.move_paddle(Side::Left, Direction::Up);
        pong.update(0.1);
        let moved = pong.paddle(Side::Left).unwrap().position.y;
        assert!(moved < start);

        pong.move_paddle(Side::Left, Direction::None);
        pong.update(0.1);
        assert_eq!(pong.paddle(Side::Left).unwrap().position.y, moved);
    }

    #[test]
    fn test_paddle_stays_inside_arena() {
        let mut pong = Pong::new(ArenaConfig::default());
        pong.add_paddle(Side::Right);
        pong.move_paddle(Side::Right, Direction::Down);
        pong.update(10.0);

        let paddle = pong.paddle(Side::Right).unwrap();
        assert_eq!(paddle.position.y, 600.0 - paddle.size.y / 2.0);
    }

    #[test]
    fn test_ball_bounces_off_wall() {
        let arena = ArenaConfig::default();
        let mut ball = Ball::centered(&arena);
        ball.position = Vec2::new(400.0, 595.0);
        ball.velocity = Vec2::new(0.0, 100.0);

        ball.advance(0.1, &arena, std::iter::empty::<&Paddle>());
        assert!(ball.velocity.y < 0.0);
        assert!(ball.position.y + ball.size.y / 2.0 <= 600.0);
    }

    #[test]
    fn test_ball_bounces_off_paddle() {
        let arena = ArenaConfig::default();
        let paddle = Paddle::new(Side::Left, &arena);
        let mut ball = Ball::centered(&arena);
        ball.position = Vec2::new(paddle.position.x + 20.0, paddle.position.y);
        ball.velocity = Vec2::new(-200.0, 0.0);

        ball.advance(0.05, &arena, [&paddle]);
        assert!(ball.velocity.x > 0.0);
    }

    #[test]
    fn test_apply_snapshot_overwrites_everything() {
        let mut authority = Pong::new(ArenaConfig::default());
        authority.add_paddle(Side::Left);
        authority.add_paddle(Side::Right);
        authority.reset_ball();
        authority.update(0.25);

        let mut mirror = Pong::new(ArenaConfig::default());
        mirror.add_paddle(Side::Up);
        mirror.apply_snapshot(&authority.snapshot());

        assert_eq!(mirror.snapshot(), authority.snapshot());
        assert!(!mirror.has_paddle(Side::Up));
    }
}
