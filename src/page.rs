//! The host page as seen by the agent.
//!
//! Everything that touches a live document goes through [`Page`]. The
//! scanner, executor and stabilizer only ever see raw facts and handles, so
//! the same logic runs against Chrome (see `chrome`) or a scripted page in
//! tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PageError;
use crate::types::{ElementHandle, Rect};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

/// Raw facts about one discovered node, before any filtering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannedNode {
    /// Position in the deduplicated discovery order.
    pub slot: usize,
    /// DOM tag name, upper case.
    pub tag: String,
    pub id: Option<String>,
    pub class_name: Option<String>,
    pub role: Option<String>,
    pub input_type: Option<String>,
    pub aria_label: Option<String>,
    pub title: Option<String>,
    pub alt: Option<String>,
    pub placeholder: Option<String>,
    pub value: Option<String>,
    /// Text of a `<label for=...>` pointing at this radio/checkbox.
    pub label_text: Option<String>,
    /// Text of the first child node only.
    pub direct_text: Option<String>,
    pub text_content: Option<String>,
    pub has_onclick: bool,
    pub pointer_cursor: bool,
    pub checked: bool,
    pub selected: bool,
    pub aria_checked: Option<String>,
    pub aria_selected: Option<String>,
    pub rect: Rect,
    pub display: String,
    pub visibility: String,
    pub opacity: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Discovery {
    pub viewport: Viewport,
    pub nodes: Vec<ScannedNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageIdentity {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
}

/// Which node a synthetic event is fired at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTarget {
    Element,
    Parent,
}

/// A synthetic interaction signal. `primary` is a mouse event type; the
/// optional `secondary` is its pointer-event twin, delivered best-effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyntheticEvent {
    pub target: EventTarget,
    pub primary: &'static str,
    pub secondary: Option<&'static str>,
}

impl SyntheticEvent {
    /// A mouse event paired with the matching pointer event, if one exists.
    pub const fn dual(primary: &'static str, secondary: &'static str) -> Self {
        Self {
            target: EventTarget::Element,
            primary,
            secondary: Some(secondary),
        }
    }

    pub const fn on_parent(primary: &'static str, secondary: &'static str) -> Self {
        Self {
            target: EventTarget::Parent,
            primary,
            secondary: Some(secondary),
        }
    }
}

/// What actually reached the page for one [`SyntheticEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    Full,
    PrimaryOnly,
    NoTarget,
}

/// Structural neighbors touched by a force-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Parent,
    Grandparent,
    FollowingSiblings,
    /// Nodes named by the element's `aria-controls`.
    Controlled,
}

/// Mutation feed used by the stabilizer.
#[async_trait]
pub trait ChangeSource: Send {
    /// Resolves when the next change is observed; `None` once the source is
    /// closed and will never report again.
    async fn next_change(&mut self) -> Option<()>;
}

#[async_trait]
pub trait Page: Send + Sync {
    async fn identity(&self) -> Result<PageIdentity, PageError>;

    /// Enumerate candidate nodes: everything matching `selector` plus every
    /// node with a pointer cursor, deduplicated, in that order. Each node is
    /// tagged for `generation` so its handle resolves until the next scan.
    async fn discover(&self, selector: &str, generation: u64) -> Result<Discovery, PageError>;

    /// Visible headings and paragraph-like text, in document order.
    async fn text_blocks(&self) -> Result<Vec<String>, PageError>;

    async fn highlight(&self, handle: &ElementHandle) -> Result<(), PageError>;

    async fn dispatch(
        &self,
        handle: &ElementHandle,
        event: SyntheticEvent,
    ) -> Result<Delivery, PageError>;

    async fn focus(&self, handle: &ElementHandle) -> Result<(), PageError>;

    async fn native_click(&self, handle: &ElementHandle) -> Result<(), PageError>;

    /// Replace the field's value and fire its input/change notifications.
    async fn commit_text(&self, handle: &ElementHandle, text: &str) -> Result<(), PageError>;

    async fn relatives(
        &self,
        handle: &ElementHandle,
        relation: Relation,
    ) -> Result<Vec<ElementHandle>, PageError>;

    /// Force the node into an open/visible presentation.
    async fn reveal(&self, handle: &ElementHandle, classes: &[&str]) -> Result<(), PageError>;

    async fn observe_changes(&self) -> Result<Box<dyn ChangeSource>, PageError>;
}
