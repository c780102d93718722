use crate::model::Side;
use jsonschema::{Draft, JSONSchema};
use once_cell::sync::Lazy;
use serde_json::{json, Value};

fn event_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "Pong game event",
        "type": "object",
        "properties": {
            "eventId": { "type": "string", "minLength": 1 },
            "eventType": {
                "type": "string",
                "enum": ["PLAYER_JOIN", "PLAYER_LEAVE", "PADDLE_MOVE", "GAME_START", "GAME_OVER", "TIME_ELAPSED"]
            },
            "timestamp": { "type": "integer", "minimum": 0 },
            "gameId": { "type": "string" },
            "playerId": { "type": "string" },
            "payload": { "type": "object" }
        },
        "required": ["eventId", "eventType", "timestamp", "gameId", "playerId"],
        "allOf": [
            {
                "if": { "properties": { "eventType": { "const": "PLAYER_JOIN" } } },
                "then": {
                    "required": ["payload"],
                    "properties": {
                        "payload": {
                            "properties": {
                                "side": { "enum": ["LEFT", "RIGHT", "UP", "DOWN"] },
                                "x": { "type": "number" },
                                "y": { "type": "number" }
                            },
                            "required": ["side"]
                        }
                    }
                }
            },
            {
                "if": { "properties": { "eventType": { "const": "PADDLE_MOVE" } } },
                "then": {
                    "required": ["payload"],
                    "properties": {
                        "payload": {
                            "properties": {
                                "direction": { "enum": ["UP", "DOWN", "NONE"] },
                                "paddleIndex": {
                                    "type": "object",
                                    "properties": {
                                        "x": { "type": "integer", "enum": [-1, 0, 1] },
                                        "y": { "type": "integer", "enum": [-1, 0, 1] }
                                    },
                                    "required": ["x", "y"]
                                }
                            },
                            "required": ["direction", "paddleIndex"]
                        }
                    }
                }
            },
            {
                "if": { "properties": { "eventType": { "const": "TIME_ELAPSED" } } },
                "then": {
                    "required": ["payload"],
                    "properties": {
                        "payload": {
                            "properties": {
                                "dt": { "type": "number", "minimum": 0 },
                                "gameState": {
                                    "type": "object",
                                    "properties": {
                                        "ball": {
                                            "type": "object",
                                            "properties": {
                                                "x": { "type": "number" },
                                                "y": { "type": "number" },
                                                "vx": { "type": "number" },
                                                "vy": { "type": "number" }
                                            },
                                            "required": ["x", "y", "vx", "vy"]
                                        },
                                        "paddles": {
                                            "type": "array",
                                            "items": {
                                                "type": "object",
                                                "properties": {
                                                    "side": { "enum": ["LEFT", "RIGHT", "UP", "DOWN"] },
                                                    "x": { "type": "number" },
                                                    "y": { "type": "number" },
                                                    "direction": { "enum": ["NONE", "LEFT", "UP", "RIGHT", "DOWN"] }
                                                },
                                                "required": ["side", "x", "y"]
                                            }
                                        }
                                    },
                                    "required": ["ball"]
                                }
                            },
                            "required": ["dt", "gameState"]
                        }
                    }
                }
            }
        ]
    })
}

fn document_schema() -> Value {
    let point = json!({
        "type": "object",
        "properties": {
            "x": { "type": "number" },
            "y": { "type": "number" }
        },
        "required": ["x", "y"]
    });

    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "Canonical Pong game document",
        "type": "object",
        "properties": {
            "gameId": { "type": "string" },
            "players": {
                "type": "array",
                "minItems": 0,
                "maxItems": Side::ALL.len(),
                "items": {
                    "type": "object",
                    "properties": {
                        "playerId": { "type": "string" },
                        "x": { "type": "number" },
                        "y": { "type": "number" },
                        "direction": { "enum": ["NONE", "LEFT", "UP", "RIGHT", "DOWN"] }
                    },
                    "required": ["playerId", "x", "y", "direction"]
                }
            },
            "ball": {
                "type": "object",
                "properties": {
                    "position": point.clone(),
                    "velocity": point
                },
                "required": ["position", "velocity"]
            },
            "gameState": { "enum": ["waiting", "playing", "paused", "ended"] },
            "approved": { "type": "boolean" }
        },
        "required": ["gameId", "players", "ball", "gameState"]
    })
}

fn compile(schema: Value) -> JSONSchema {
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema)
        .expect("built-in schema must compile")
}

pub(crate) static EVENT_SCHEMA: Lazy<JSONSchema> = Lazy::new(|| compile(event_schema()));

pub(crate) static DOCUMENT_SCHEMA: Lazy<JSONSchema> = Lazy::new(|| compile(document_schema()));
