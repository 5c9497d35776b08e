use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

impl MouseButton {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "left" | "l" | "primary" => Some(Self::Left),
            "right" | "r" | "secondary" => Some(Self::Right),
            "middle" | "m" | "wheel" => Some(Self::Middle),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
            Self::Middle => "middle",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Left => "left",
            Self::Right => "right",
        }
    }
}

/// One operation the model can ask for.
///
/// `Done` and `Failed` are declarations by the model and are never sent to the
/// host. `Unparsable` is produced by the parser when the reply could not be
/// understood; it is kept distinct from `Failed` so the orchestrator can tell a
/// confused model apart from one that gave up.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Move { x: i32, y: i32 },
    Click { x: i32, y: i32, button: MouseButton, double: bool },
    TypeText { text: String },
    KeyPress { key: String },
    Hotkey { keys: Vec<String> },
    Scroll { direction: ScrollDirection, amount: u32 },
    Wait { ms: u64 },
    Done { message: String },
    Failed { reason: String },
    Unparsable { reason: String },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Move { .. } => "move",
            Action::Click { .. } => "click",
            Action::TypeText { .. } => "type_text",
            Action::KeyPress { .. } => "key_press",
            Action::Hotkey { .. } => "hotkey",
            Action::Scroll { .. } => "scroll",
            Action::Wait { .. } => "wait",
            Action::Done { .. } => "done",
            Action::Failed { .. } => "failed",
            Action::Unparsable { .. } => "unparsable",
        }
    }

    /// True for the variants that map onto a host input event.
    pub fn is_executable(&self) -> bool {
        !matches!(
            self,
            Action::Done { .. } | Action::Failed { .. } | Action::Unparsable { .. }
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Move { x, y } => write!(f, "move({x}, {y})"),
            Action::Click { x, y, button, double } => {
                let verb = if *double { "double_click" } else { "click" };
                if *button == MouseButton::Left {
                    write!(f, "{verb}({x}, {y})")
                } else {
                    write!(f, "{verb}({x}, {y}, button={})", button.as_str())
                }
            }
            Action::TypeText { text } => write!(f, "type_text({text:?})"),
            Action::KeyPress { key } => write!(f, "key_press({key})"),
            Action::Hotkey { keys } => write!(f, "hotkey({})", keys.join(", ")),
            Action::Scroll { direction, amount } => {
                write!(f, "scroll({}, {amount})", direction.as_str())
            }
            Action::Wait { ms } => write!(f, "wait({}s)", *ms as f64 / 1000.0),
            Action::Done { message } => write!(f, "done({message:?})"),
            Action::Failed { reason } => write!(f, "failed({reason:?})"),
            Action::Unparsable { reason } => write!(f, "unparsable({reason:?})"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Continuing,
    Completed,
    Failed,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continuing => "continuing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// A model reply after parsing. The status is always derived from the action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParsedResponse {
    pub thought: String,
    pub action: Action,
    pub status: ResponseStatus,
}

impl ParsedResponse {
    pub fn new(thought: impl Into<String>, action: Action) -> Self {
        let status = match &action {
            Action::Done { .. } => ResponseStatus::Completed,
            Action::Failed { .. } | Action::Unparsable { .. } => ResponseStatus::Failed,
            _ => ResponseStatus::Continuing,
        };
        Self { thought: thought.into(), action, status }
    }

    pub fn unparsable(thought: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(thought, Action::Unparsable { reason: reason.into() })
    }

    pub fn is_unparsable(&self) -> bool {
        matches!(self.action, Action::Unparsable { .. })
    }
}
