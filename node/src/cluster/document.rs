use crate::event::{DomainEvent, EventBody, JoinPayload, MovePayload};
use crate::model::{ArenaConfig, Ball, Direction, Paddle, Side, Vec2};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameStatus {
    #[default]
    Waiting,
    Playing,
    Paused,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerEntry {
    pub player_id: String,
    /// Centre of the player's paddle.
    pub x: f64,
    pub y: f64,
    /// Side the player defends.
    pub direction: Direction,
}

impl PlayerEntry {
    pub fn side(&self) -> Option<Side> {
        self.direction.side()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BallDoc {
    pub position: Vec2,
    pub velocity: Vec2,
}

/// The single shared game record of the leaderless architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameDocument {
    pub game_id: String,
    pub players: Vec<PlayerEntry>,
    pub ball: BallDoc,
    pub game_state: GameStatus,
    /// Set by the leader once this revision passed validation.
    #[serde(default)]
    pub approved: bool,
}

impl GameDocument {
    /// No players, ball resting at the centre.
    pub fn empty(game_id: impl Into<String>, arena: &ArenaConfig) -> Self {
        Self {
            game_id: game_id.into(),
            players: Vec::new(),
            ball: BallDoc {
                position: arena.center(),
                velocity: Vec2::ZERO,
            },
            game_state: GameStatus::Waiting,
            approved: false,
        }
    }

    pub fn player(&self, player_id: &str) -> Option<&PlayerEntry> {
        self.players.iter().find(|p| p.player_id == player_id)
    }
}

/// How the leader folds log events into the canonical document.
#[derive(Debug, Clone)]
pub struct DocumentRules {
    pub arena: ArenaConfig,
    /// Players the document accepts.
    pub capacity: usize,
    /// Distance a paddle moves per PADDLE_MOVE.
    pub paddle_step: f64,
}

impl DocumentRules {
    pub fn new(arena: ArenaConfig, capacity: usize, paddle_step: f64) -> Self {
        Self {
            arena,
            capacity,
            paddle_step,
        }
    }

    /// Applies one event. TIME_ELAPSED only counts when `leader_id` sent it.
    pub fn apply(&self, document: &mut GameDocument, event: &DomainEvent, leader_id: &str) {
        match &event.body {
            EventBody::PlayerJoin(join) => self.join(document, &event.player_id, join),
            EventBody::PlayerLeave => self.leave(document, &event.player_id),
            EventBody::PaddleMove(movement) => self.shift(document, &event.player_id, movement),
            EventBody::GameStart => document.game_state = GameStatus::Playing,
            EventBody::GameOver => document.game_state = GameStatus::Ended,
            EventBody::TimeElapsed(tick) => {
                if event.player_id != leader_id {
                    debug!("Ignoring TIME_ELAPSED from non-leader {}", event.player_id);
                    return;
                }
                self.advance(document, tick.dt);
            }
        }
    }

    fn join(&self, document: &mut GameDocument, player_id: &str, join: &JoinPayload) {
        if document.player(player_id).is_some() {
            return;
        }
        if document.players.iter().any(|p| p.side() == Some(join.side)) {
            warn!("Player {} cannot join: {} is taken", player_id, join.side);
            return;
        }
        if document.players.len() >= self.capacity {
            warn!("Player {} cannot join: game is full", player_id);
            return;
        }

        let home = self.arena.paddle_home(join.side);
        document.players.push(PlayerEntry {
            player_id: player_id.to_string(),
            x: join.x.unwrap_or(home.x),
            y: join.y.unwrap_or(home.y),
            direction: join.side.into(),
        });

        if document.game_state == GameStatus::Waiting && document.players.len() == self.capacity {
            document.game_state = GameStatus::Playing;
            document.ball = BallDoc {
                position: self.arena.center(),
                velocity: self.arena.launch_velocity(),
            };
        }
    }

    fn leave(&self, document: &mut GameDocument, player_id: &str) {
        document.players.retain(|p| p.player_id != player_id);
        if document.players.is_empty() {
            document.game_state = GameStatus::Waiting;
            document.ball = BallDoc {
                position: self.arena.center(),
                velocity: Vec2::ZERO,
            };
        }
    }

    fn shift(&self, document: &mut GameDocument, player_id: &str, movement: &MovePayload) {
        let Some(player) = document.players.iter_mut().find(|p| p.player_id == player_id) else {
            debug!("Ignoring move from unknown player {}", player_id);
            return;
        };
        let Some(side) = player.side() else {
            return;
        };
        let size = self.arena.paddle_size(side);
        let step = movement.paddle_index;
        player.x = (player.x + f64::from(step.x) * self.paddle_step)
            .clamp(size.x / 2.0, self.arena.width - size.x / 2.0);
        player.y = (player.y + f64::from(step.y) * self.paddle_step)
            .clamp(size.y / 2.0, self.arena.height - size.y / 2.0);
    }

    fn advance(&self, document: &mut GameDocument, dt: f64) {
        if document.game_state != GameStatus::Playing {
            return;
        }
        let paddles: Vec<Paddle> = document
            .players
            .iter()
            .filter_map(|player| {
                let side = player.side()?;
                Some(Paddle {
                    side,
                    position: Vec2::new(player.x, player.y),
                    size: self.arena.paddle_size(side),
                    direction: Direction::None,
                })
            })
            .collect();
        let mut ball = Ball {
            position: document.ball.position,
            velocity: document.ball.velocity,
            size: self.arena.ball_size(),
        };
        ball.advance(dt, &self.arena, &paddles);
        document.ball.position = ball.position;
        document.ball.velocity = ball.velocity;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventFactory, GameSnapshot};

    fn rules() -> DocumentRules {
        DocumentRules::new(ArenaConfig::default(), 2, 10.0)
    }

    #[test]
    fn test_duplicate_join_yields_one_entry() {
        let rules = rules();
        let mut document = GameDocument::empty("g", &rules.arena);
        let alice = EventFactory::new("g", "alice");

        rules.apply(&mut document, &alice.join(Side::Left, None), "leader");
        rules.apply(&mut document, &alice.join(Side::Left, None), "leader");

        assert_eq!(document.players.len(), 1);
        assert_eq!(document.game_state, GameStatus::Waiting);
    }

    #[test]
    fn test_full_game_starts_playing() {
        let rules = rules();
        let mut document = GameDocument::empty("g", &rules.arena);
        let alice = EventFactory::new("g", "alice");
        let bob = EventFactory::new("g", "bob");
        let carol = EventFactory::new("g", "carol");

        rules.apply(&mut document, &alice.join(Side::Left, None), "leader");
        rules.apply(&mut document, &bob.join(Side::Right, Some(Vec2::new(780.0, 100.0))), "leader");
        rules.apply(&mut document, &carol.join(Side::Up, None), "leader");

        assert_eq!(document.players.len(), 2);
        assert_eq!(document.game_state, GameStatus::Playing);
        assert_ne!(document.ball.velocity, Vec2::ZERO);
        let bob_entry = document.player("bob").unwrap();
        assert_eq!((bob_entry.x, bob_entry.y), (780.0, 100.0));
        assert_eq!(bob_entry.direction, Direction::Right);
    }

    #[test]
    fn test_move_applies_axis_delta() {
        let rules = rules();
        let mut document = GameDocument::empty("g", &rules.arena);
        let alice = EventFactory::new("g", "alice");
        rules.apply(&mut document, &alice.join(Side::Left, None), "leader");
        let before = document.player("alice").unwrap().clone();

        rules.apply(&mut document, &alice.paddle_move(Side::Left, Direction::Down), "leader");

        let after = document.player("alice").unwrap();
        assert_eq!(after.x, before.x);
        assert_eq!(after.y, before.y + 10.0);
    }

    #[test]
    fn test_time_elapsed_only_from_leader() {
        let rules = rules();
        let mut document = GameDocument::empty("g", &rules.arena);
        document.game_state = GameStatus::Playing;
        document.ball.velocity = Vec2::new(100.0, 0.0);

        let stranger = EventFactory::new("g", "bob");
        rules.apply(&mut document, &stranger.time_elapsed(1.0, GameSnapshot::default()), "leader");
        assert_eq!(document.ball.position, Vec2::new(400.0, 300.0));

        let leader = EventFactory::new("g", "leader");
        rules.apply(&mut document, &leader.time_elapsed(1.0, GameSnapshot::default()), "leader");
        assert_eq!(document.ball.position, Vec2::new(500.0, 300.0));
    }

    #[test]
    fn test_ball_reflects_off_wall() {
        let rules = rules();
        let mut document = GameDocument::empty("g", &rules.arena);
        document.game_state = GameStatus::Playing;
        document.ball.position = Vec2::new(400.0, 595.0);
        document.ball.velocity = Vec2::new(0.0, 100.0);

        let leader = EventFactory::new("g", "leader");
        rules.apply(&mut document, &leader.time_elapsed(0.1, GameSnapshot::default()), "leader");

        assert!(document.ball.velocity.y < 0.0);
        assert!(document.ball.position.y <= 600.0);
    }

    #[test]
    fn test_last_leave_resets_to_waiting() {
        let rules = rules();
        let mut document = GameDocument::empty("g", &rules.arena);
        let alice = EventFactory::new("g", "alice");
        let bob = EventFactory::new("g", "bob");
        rules.apply(&mut document, &alice.join(Side::Left, None), "leader");
        rules.apply(&mut document, &bob.join(Side::Right, None), "leader");

        rules.apply(&mut document, &alice.leave(), "leader");
        assert_eq!(document.game_state, GameStatus::Playing);
        rules.apply(&mut document, &bob.leave(), "leader");

        assert!(document.players.is_empty());
        assert_eq!(document.game_state, GameStatus::Waiting);
        assert_eq!(document.ball.velocity, Vec2::ZERO);
    }
}
