use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Edge of the arena a paddle defends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Left,
    Right,
    Up,
    Down,
}

impl Side {
    pub const ALL: [Side; 4] = [Side::Left, Side::Right, Side::Up, Side::Down];

    /// Left and right paddles slide along the y axis.
    pub fn slides_vertically(self) -> bool {
        matches!(self, Side::Left | Side::Right)
    }

    /// Unit vector along this paddle's axis for a requested movement.
    ///
    /// UP/LEFT map to the negative end of the axis, DOWN/RIGHT to the positive end.
    pub fn axis_vector(self, direction: Direction) -> (i8, i8) {
        let step = match direction {
            Direction::Up | Direction::Left => -1,
            Direction::Down | Direction::Right => 1,
            Direction::None => 0,
        };
        if self.slides_vertically() {
            (0, step)
        } else {
            (step, 0)
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Side::Left => "LEFT",
            Side::Right => "RIGHT",
            Side::Up => "UP",
            Side::Down => "DOWN",
        };
        f.write_str(name)
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LEFT" => Ok(Side::Left),
            "RIGHT" => Ok(Side::Right),
            "UP" => Ok(Side::Up),
            "DOWN" => Ok(Side::Down),
            other => Err(format!("unknown side: {}", other)),
        }
    }
}

/// Movement or orientation, including the absence of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    #[default]
    None,
    Left,
    Up,
    Right,
    Down,
}

impl Direction {
    /// Collapses a movement to the UP/DOWN/NONE vocabulary used by PADDLE_MOVE.
    pub fn as_move(self) -> Direction {
        match self {
            Direction::Up | Direction::Left => Direction::Up,
            Direction::Down | Direction::Right => Direction::Down,
            Direction::None => Direction::None,
        }
    }

    pub fn side(self) -> Option<Side> {
        match self {
            Direction::Left => Some(Side::Left),
            Direction::Right => Some(Side::Right),
            Direction::Up => Some(Side::Up),
            Direction::Down => Some(Side::Down),
            Direction::None => None,
        }
    }
}

impl From<Side> for Direction {
    fn from(side: Side) -> Self {
        match side {
            Side::Left => Direction::Left,
            Side::Right => Direction::Right,
            Side::Up => Direction::Up,
            Side::Down => Direction::Down,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_vector_follows_paddle_orientation() {
        assert_eq!(Side::Left.axis_vector(Direction::Up), (0, -1));
        assert_eq!(Side::Right.axis_vector(Direction::Down), (0, 1));
        assert_eq!(Side::Up.axis_vector(Direction::Up), (-1, 0));
        assert_eq!(Side::Down.axis_vector(Direction::Right), (1, 0));
        assert_eq!(Side::Left.axis_vector(Direction::None), (0, 0));
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(serde_json::to_string(&Side::Left).unwrap(), "\"LEFT\"");
        assert_eq!(serde_json::to_string(&Direction::None).unwrap(), "\"NONE\"");
        assert_eq!("right".parse::<Side>().unwrap(), Side::Right);
        assert!("NONE".parse::<Side>().is_err());
    }

    #[test]
    fn test_as_move_collapses_horizontal() {
        assert_eq!(Direction::Left.as_move(), Direction::Up);
        assert_eq!(Direction::Right.as_move(), Direction::Down);
        assert_eq!(Direction::None.as_move(), Direction::None);
    }
}
