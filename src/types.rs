use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::warn;

/// Circuit breaker defaults. Overridable through `AgentConfig`.
pub const MAX_STEPS_PER_TASK: u32 = 25;
pub const MAX_ATTEMPTS_PER_STEP: u32 = 3;
pub const MAX_TASK_DURATION_SECS: u64 = 300;
pub const LABEL_MAX_CHARS: usize = 100;
pub const PAGE_TEXT_MAX_CHARS: usize = 1500;

/// Opaque reference to a page node, minted by one scan generation.
///
/// The page tags the node with `token`; a later scan re-tags every node it
/// finds, so a handle from an older generation stops resolving instead of
/// silently pointing at whatever now sits at the same position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementHandle {
    pub generation: u64,
    pub token: String,
}

impl ElementHandle {
    pub fn new(generation: u64, slot: usize) -> Self {
        Self {
            generation,
            token: format!("{generation}:{slot}"),
        }
    }
}

impl fmt::Display for ElementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

/// Structural classification of a scanned element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementKind {
    Button,
    Link,
    Input,
    Clickable,
    Pointer,
    Role(String),
    Unknown,
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementKind::Button => f.write_str("button"),
            ElementKind::Link => f.write_str("link"),
            ElementKind::Input => f.write_str("input"),
            ElementKind::Clickable => f.write_str("clickable"),
            ElementKind::Pointer => f.write_str("pointer"),
            ElementKind::Role(role) => f.write_str(role),
            ElementKind::Unknown => f.write_str("unknown"),
        }
    }
}

/// One visible interactive element. `index` is only meaningful inside the
/// scan generation recorded in `handle`.
#[derive(Debug, Clone)]
pub struct InteractiveElement {
    pub index: usize,
    pub text: String,
    pub id: Option<String>,
    pub class_name: Option<String>,
    pub tag: String,
    pub kind: ElementKind,
    pub active: bool,
    pub rect: Rect,
    pub handle: ElementHandle,
}

impl InteractiveElement {
    pub fn first_class(&self) -> Option<&str> {
        self.class_name
            .as_deref()
            .and_then(|c| c.split_whitespace().next())
    }
}

/// Action kinds the oracle may propose. Anything else is kept verbatim so the
/// executor can report it back as unrecognized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionKind {
    Click,
    Hover,
    ForceOpen,
    Type,
    Wait,
    ClickByText,
    Error,
    None,
    Other(String),
}

impl From<String> for ActionKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "click" => ActionKind::Click,
            "hover" => ActionKind::Hover,
            "forceOpen" => ActionKind::ForceOpen,
            "type" => ActionKind::Type,
            "wait" => ActionKind::Wait,
            "clickByText" => ActionKind::ClickByText,
            "error" => ActionKind::Error,
            "none" => ActionKind::None,
            _ => ActionKind::Other(value),
        }
    }
}

impl From<ActionKind> for String {
    fn from(kind: ActionKind) -> Self {
        kind.as_str().to_string()
    }
}

impl ActionKind {
    pub fn as_str(&self) -> &str {
        match self {
            ActionKind::Click => "click",
            ActionKind::Hover => "hover",
            ActionKind::ForceOpen => "forceOpen",
            ActionKind::Type => "type",
            ActionKind::Wait => "wait",
            ActionKind::ClickByText => "clickByText",
            ActionKind::Error => "error",
            ActionKind::None => "none",
            ActionKind::Other(raw) => raw,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single action proposed by the oracle. Field names follow the oracle's
/// JSON contract so the same shape round-trips through the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDecision {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(
        rename = "buttonIndex",
        default,
        deserialize_with = "lenient_count",
        skip_serializing_if = "Option::is_none"
    )]
    pub index: Option<usize>,
    #[serde(rename = "searchText", default, skip_serializing_if = "Option::is_none")]
    pub search_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(
        rename = "duration",
        default,
        deserialize_with = "lenient_count",
        skip_serializing_if = "Option::is_none"
    )]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub reasoning: String,
}

impl ActionDecision {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            index: None,
            search_text: None,
            text: None,
            duration_ms: None,
            reasoning: String::new(),
        }
    }

    pub fn click(index: usize) -> Self {
        Self {
            index: Some(index),
            ..Self::new(ActionKind::Click)
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    /// Target as shown in history: the index when present, else the search text.
    pub fn target_label(&self) -> Option<String> {
        self.index
            .map(|i| i.to_string())
            .or_else(|| self.search_text.clone())
    }
}

/// Counts written by the oracle may be numbers, numeric strings or junk.
/// Anything but a non-negative whole number reads as absent, which fails the
/// step that needed it rather than the whole reply.
fn lenient_count<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64>,
{
    let raw = Value::deserialize(deserializer)?;
    let count = match &raw {
        Value::Null => return Ok(None),
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
                .map(|f| f as u64)
        }),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    match count.and_then(|c| T::try_from(c).ok()) {
        Some(count) => Ok(Some(count)),
        None => {
            warn!(value = %raw, "ignoring invalid count in action");
            Ok(None)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    Clicked { label: String },
    AlreadyClicked { label: String },
    Hovered { label: String },
    ForcedOpen { label: String },
    Typed { text: String },
    Waited { duration_ms: u64 },
    Assumed { note: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(flatten)]
    pub outcome: ActionOutcome,
}

impl ActionResult {
    pub fn ok(outcome: ActionOutcome) -> Self {
        Self {
            success: true,
            outcome,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            outcome: ActionOutcome::Failed {
                error: error.into(),
            },
        }
    }

    /// Stand-in result for an action whose execution was cut short by a
    /// navigation it most likely caused.
    pub fn assumed_after_navigation() -> Self {
        Self::ok(ActionOutcome::Assumed {
            note: "Action resulted from interrupted navigation; success assumed.".to_string(),
        })
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            ActionOutcome::Failed { error } => Some(error),
            _ => None,
        }
    }

    pub fn note(&self) -> Option<String> {
        match &self.outcome {
            ActionOutcome::Assumed { note } => Some(note.clone()),
            ActionOutcome::AlreadyClicked { label } => {
                Some(format!("\"{label}\" was already clicked; skipped"))
            }
            ActionOutcome::Failed { error } => Some(error.clone()),
            _ => None,
        }
    }
}
