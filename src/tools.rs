use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::error::ChimeError;
use crate::net::protocol::{FunctionCall, FunctionDeclaration, FunctionResponse};

pub const SHOW_DIRECTION: &str = "show_direction";

/// Declarations sent in the session setup.
#[must_use]
pub fn manifest() -> Vec<FunctionDeclaration> {
    vec![FunctionDeclaration {
        name: SHOW_DIRECTION.to_string(),
        description: "Show the user a direction cue. Must be called before answering \
                      any question about direction or location."
            .to_string(),
        parameters: json!({
            "type": "OBJECT",
            "properties": {
                "direction": {
                    "type": "STRING",
                    "enum": ["left", "right"],
                    "description": "Which way to point."
                }
            },
            "required": ["direction"]
        }),
    }]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Left,
    Right,
}

impl Direction {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
        }
    }
}

/// What the visualization is currently showing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DirectionSignal {
    Left,
    Right,
    #[default]
    None,
}

impl From<Direction> for DirectionSignal {
    fn from(d: Direction) -> Self {
        match d {
            Direction::Left => Self::Left,
            Direction::Right => Self::Right,
        }
    }
}

impl fmt::Display for DirectionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Left => "left",
            Self::Right => "right",
            Self::None => "none",
        })
    }
}

#[derive(Debug, Clone)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub direction: Direction,
    pub issued_at: DateTime<Utc>,
    /// Session generation the call arrived on.
    pub generation: u64,
}

/// What the orchestrator must do in response to one function call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolAction {
    /// Send this response now.
    Respond(FunctionResponse),
    /// Arm a timer for `id`; call [`ToolCallHandler::expire`] when it fires.
    Schedule { id: String, after: Duration },
    /// Nothing to send.
    Ignore,
}

/// Outcome of a timer firing.
#[derive(Debug, Clone, PartialEq)]
pub struct Expired {
    pub response: FunctionResponse,
    pub generation: u64,
}

/// Runs the `show_direction` tool.
///
/// A valid call raises the signal. Its response is held until the display
/// period has elapsed and the signal is lowered. Invalid calls are answered
/// at once and never touch the signal.
pub struct ToolCallHandler {
    signal: DirectionSignal,
    /// Call whose direction is currently shown.
    owner: Option<String>,
    pending: HashMap<String, PendingToolCall>,
    display: Duration,
}

impl ToolCallHandler {
    #[must_use]
    pub fn new(display: Duration) -> Self {
        Self {
            signal: DirectionSignal::None,
            owner: None,
            pending: HashMap::new(),
            display,
        }
    }

    #[must_use]
    pub const fn signal(&self) -> DirectionSignal {
        self.signal
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Handle one function call received on session `generation`.
    pub fn handle(&mut self, call: &FunctionCall, generation: u64) -> ToolAction {
        if call.name != SHOW_DIRECTION {
            let err = ChimeError::Protocol(format!("unknown function '{}'", call.name));
            tracing::warn!("ignoring tool call {}: {err}", call.id);
            return ToolAction::Ignore;
        }

        if self.pending.contains_key(&call.id) {
            tracing::warn!("duplicate tool call id {}, ignoring", call.id);
            return ToolAction::Ignore;
        }

        let direction = match parse_direction(&call.args) {
            Ok(d) => d,
            Err(reason) => {
                tracing::warn!("invalid {} call {}: {reason}", call.name, call.id);
                return ToolAction::Respond(FunctionResponse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    response: json!({ "error": reason }),
                });
            }
        };

        self.signal = direction.into();
        self.owner = Some(call.id.clone());
        self.pending.insert(
            call.id.clone(),
            PendingToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                direction,
                issued_at: Utc::now(),
                generation,
            },
        );
        tracing::info!("showing direction {} for call {}", direction.as_str(), call.id);

        ToolAction::Schedule {
            id: call.id.clone(),
            after: self.display,
        }
    }

    /// Timer for `id` fired: lower the signal if `id` still owns it, then
    /// hand back the response.
    ///
    /// Returns `None` if the call is unknown or was already answered.
    pub fn expire(&mut self, id: &str) -> Option<Expired> {
        let call = self.pending.remove(id)?;
        if self.owner.as_deref() == Some(id) {
            self.owner = None;
            self.signal = DirectionSignal::None;
        }

        let elapsed = Utc::now() - call.issued_at;
        tracing::debug!(
            "direction cue for call {id} ended after {}ms",
            elapsed.num_milliseconds()
        );

        Some(Expired {
            response: FunctionResponse {
                id: call.id,
                name: call.name,
                response: json!({ "result": "ok", "direction": call.direction.as_str() }),
            },
            generation: call.generation,
        })
    }
}

fn parse_direction(args: &Value) -> Result<Direction, String> {
    let raw = args
        .get("direction")
        .ok_or_else(|| "missing required argument 'direction'".to_string())?;
    let s = raw
        .as_str()
        .ok_or_else(|| format!("'direction' must be a string, got {raw}"))?;
    Direction::parse(s).ok_or_else(|| format!("invalid direction '{s}', expected left or right"))
}
