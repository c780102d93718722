//! Domain events exchanged between terminals, coordinators and cluster peers.

pub mod codec;
mod schema;

use crate::model::{Direction, Side, Vec2};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    PlayerJoin,
    PlayerLeave,
    PaddleMove,
    GameStart,
    GameOver,
    TimeElapsed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinPayload {
    pub side: Side,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
}

/// Unit step along a paddle's axis, each component in {-1, 0, 1}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AxisVector {
    pub x: i8,
    pub y: i8,
}

impl From<(i8, i8)> for AxisVector {
    fn from((x, y): (i8, i8)) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovePayload {
    pub direction: Direction,
    pub paddle_index: AxisVector,
}

impl MovePayload {
    pub fn for_side(side: Side, direction: Direction) -> Self {
        Self {
            direction: direction.as_move(),
            paddle_index: side.axis_vector(direction).into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BallState {
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaddleState {
    pub side: Side,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub direction: Direction,
}

/// Full simulation state carried by TIME_ELAPSED.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GameSnapshot {
    pub ball: BallState,
    #[serde(default)]
    pub paddles: Vec<PaddleState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeElapsedPayload {
    pub dt: f64,
    pub game_state: GameSnapshot,
}

/// Kind-specific part of an event; the payload shape always matches the kind.
#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    PlayerJoin(JoinPayload),
    PlayerLeave,
    PaddleMove(MovePayload),
    GameStart,
    GameOver,
    TimeElapsed(TimeElapsedPayload),
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            EventBody::PlayerJoin(_) => EventKind::PlayerJoin,
            EventBody::PlayerLeave => EventKind::PlayerLeave,
            EventBody::PaddleMove(_) => EventKind::PaddleMove,
            EventBody::GameStart => EventKind::GameStart,
            EventBody::GameOver => EventKind::GameOver,
            EventBody::TimeElapsed(_) => EventKind::TimeElapsed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawEvent")]
pub struct DomainEvent {
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub game_id: String,
    pub player_id: String,
    pub body: EventBody,
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    event_id: String,
    event_type: EventKind,
    timestamp: u64,
    game_id: String,
    player_id: String,
    #[serde(default)]
    payload: Option<Value>,
}

impl TryFrom<RawEvent> for DomainEvent {
    type Error = serde_json::Error;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        let payload = raw.payload.unwrap_or(Value::Null);
        let body = match raw.event_type {
            EventKind::PlayerJoin => EventBody::PlayerJoin(serde_json::from_value(payload)?),
            EventKind::PlayerLeave => EventBody::PlayerLeave,
            EventKind::PaddleMove => EventBody::PaddleMove(serde_json::from_value(payload)?),
            EventKind::GameStart => EventBody::GameStart,
            EventKind::GameOver => EventBody::GameOver,
            EventKind::TimeElapsed => EventBody::TimeElapsed(serde_json::from_value(payload)?),
        };
        Ok(Self {
            id: raw.event_id,
            timestamp: raw.timestamp,
            game_id: raw.game_id,
            player_id: raw.player_id,
            body,
        })
    }
}

impl Serialize for DomainEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct EmptyPayload {}

        #[derive(Serialize)]
        #[serde(untagged)]
        enum WirePayload<'a> {
            Join(&'a JoinPayload),
            Move(&'a MovePayload),
            TimeElapsed(&'a TimeElapsedPayload),
            Empty(EmptyPayload),
        }

        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct WireEvent<'a> {
            event_id: &'a str,
            event_type: EventKind,
            timestamp: u64,
            game_id: &'a str,
            player_id: &'a str,
            payload: WirePayload<'a>,
        }

        let payload = match &self.body {
            EventBody::PlayerJoin(p) => WirePayload::Join(p),
            EventBody::PaddleMove(p) => WirePayload::Move(p),
            EventBody::TimeElapsed(p) => WirePayload::TimeElapsed(p),
            EventBody::PlayerLeave | EventBody::GameStart | EventBody::GameOver => {
                WirePayload::Empty(EmptyPayload {})
            }
        };

        WireEvent {
            event_id: &self.id,
            event_type: self.kind(),
            timestamp: self.timestamp,
            game_id: &self.game_id,
            player_id: &self.player_id,
            payload,
        }
        .serialize(serializer)
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Stamps events with a fresh id, the current time and this origin's ids.
#[derive(Debug, Clone)]
pub struct EventFactory {
    game_id: String,
    player_id: String,
}

impl EventFactory {
    pub fn new(game_id: impl Into<String>, player_id: impl Into<String>) -> Self {
        Self {
            game_id: game_id.into(),
            player_id: player_id.into(),
        }
    }

    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    pub fn create(&self, body: EventBody) -> DomainEvent {
        DomainEvent {
            id: Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            game_id: self.game_id.clone(),
            player_id: self.player_id.clone(),
            body,
        }
    }

    pub fn join(&self, side: Side, position: Option<Vec2>) -> DomainEvent {
        self.create(EventBody::PlayerJoin(JoinPayload {
            side,
            x: position.map(|p| p.x),
            y: position.map(|p| p.y),
        }))
    }

    pub fn leave(&self) -> DomainEvent {
        self.create(EventBody::PlayerLeave)
    }

    pub fn paddle_move(&self, side: Side, direction: Direction) -> DomainEvent {
        self.create(EventBody::PaddleMove(MovePayload::for_side(side, direction)))
    }

    pub fn time_elapsed(&self, dt: f64, game_state: GameSnapshot) -> DomainEvent {
        self.create(EventBody::TimeElapsed(TimeElapsedPayload { dt, game_state }))
    }

    pub fn game_over(&self) -> DomainEvent {
        self.create(EventBody::GameOver)
    }
}
