use super::InputSource;
use crate::event::{DomainEvent, EventFactory, GameSnapshot};
use crate::model::{Direction, Side};
use async_trait::async_trait;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::warn;

/// Emits a TIME_ELAPSED event every period. The first event has `dt == 0`.
///
/// The snapshot it carries is empty; the sink that advances the simulation
/// fills in the real one.
pub struct Ticker {
    interval: Interval,
    last: Option<Instant>,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval,
            last: None,
        }
    }
}

#[async_trait]
impl InputSource for Ticker {
    async fn next_event(&mut self, factory: &EventFactory) -> Option<DomainEvent> {
        self.interval.tick().await;
        let now = Instant::now();
        let dt = self
            .last
            .map(|last| now.duration_since(last).as_secs_f64())
            .unwrap_or(0.0);
        self.last = Some(now);
        Some(factory.time_elapsed(dt, GameSnapshot::default()))
    }
}

/// A local input transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Press(Direction),
    Release,
    Quit,
}

impl FromStr for Input {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" | "w" => Ok(Input::Press(Direction::Up)),
            "down" | "s" => Ok(Input::Press(Direction::Down)),
            "left" | "a" => Ok(Input::Press(Direction::Left)),
            "right" | "d" => Ok(Input::Press(Direction::Right)),
            "" | "stop" | "release" => Ok(Input::Release),
            "quit" | "q" | "exit" => Ok(Input::Quit),
            other => Err(format!("unknown input: {}", other)),
        }
    }
}

/// Turns raw inputs into at most one PADDLE_MOVE per change of direction.
#[derive(Debug)]
struct EdgeTrigger {
    side: Side,
    current: Direction,
    finished: bool,
}

impl EdgeTrigger {
    fn new(side: Side) -> Self {
        Self {
            side,
            current: Direction::None,
            finished: false,
        }
    }

    /// `None` when the input repeats the current state.
    fn apply(&mut self, input: Input, factory: &EventFactory) -> Option<DomainEvent> {
        let next = match input {
            Input::Quit => {
                self.finished = true;
                return Some(factory.leave());
            }
            Input::Release => Direction::None,
            Input::Press(direction) => direction,
        };
        if next == self.current {
            return None;
        }
        self.current = next;
        Some(factory.paddle_move(self.side, next))
    }
}

/// Paddle input fed through a channel. Closing the channel counts as quitting.
pub struct ChannelInput {
    rx: mpsc::UnboundedReceiver<Input>,
    edge: EdgeTrigger,
}

impl ChannelInput {
    pub fn new(side: Side, rx: mpsc::UnboundedReceiver<Input>) -> Self {
        Self {
            rx,
            edge: EdgeTrigger::new(side),
        }
    }

    pub fn channel(side: Side) -> (mpsc::UnboundedSender<Input>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(side, rx))
    }
}

#[async_trait]
impl InputSource for ChannelInput {
    async fn next_event(&mut self, factory: &EventFactory) -> Option<DomainEvent> {
        while !self.edge.finished {
            let input = self.rx.recv().await.unwrap_or(Input::Quit);
            if let Some(event) = self.edge.apply(input, factory) {
                return Some(event);
            }
        }
        None
    }
}

/// Paddle input read line by line from stdin.
pub struct StdinInput {
    lines: Lines<BufReader<Stdin>>,
    edge: EdgeTrigger,
}

impl StdinInput {
    pub fn new(side: Side) -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
            edge: EdgeTrigger::new(side),
        }
    }
}

#[async_trait]
impl InputSource for StdinInput {
    async fn next_event(&mut self, factory: &EventFactory) -> Option<DomainEvent> {
        while !self.edge.finished {
            let input = match self.lines.next_line().await {
                Ok(Some(line)) => match line.parse::<Input>() {
                    Ok(input) => input,
                    Err(e) => {
                        warn!("{}", e);
                        continue;
                    }
                },
                Ok(None) => Input::Quit,
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    Input::Quit
                }
            };
            if let Some(event) = self.edge.apply(input, factory) {
                return Some(event);
            }
        }
        None
    }
}
