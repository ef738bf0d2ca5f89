//! Element inventory scanner.
//!
//! The page only reports raw facts about candidate nodes; visibility,
//! labelling and active-state detection happen here so they behave the same
//! on every backend.

use std::collections::HashSet;

use tracing::debug;

use crate::error::PageError;
use crate::page::{Page, ScannedNode, Viewport};
use crate::types::{ElementHandle, ElementKind, InteractiveElement, LABEL_MAX_CHARS};

/// Structural, semantic, ARIA and attribute patterns that mark a node as
/// interactive. Pointer-cursor nodes are added on top of these by the page.
pub const INTERACTIVE_SELECTOR: &str = concat!(
    "button, input[type='button'], input[type='submit'], input[type='reset'], ",
    "input[type='image'], input[type='radio'], input[type='checkbox'], ",
    "input[type='text'], input[type='search'], input[type='email'], ",
    "input[type='password'], input:not([type]), label, a, ",
    "[role='button'], [role='link'], [role='menuitem'], [role='option'], [role='tab'], ",
    "[role='checkbox'], [role='radio'], [role='switch'], select, textarea, ",
    "[onclick], [ng-click], [v-on\\:click], [x-on\\:click], [data-action], [data-click], ",
    "div[class*='button'], div[class*='btn'], span[class*='button'], span[class*='btn'], ",
    "div[class*='clickable'], span[class*='clickable'], div[class*='click'], span[class*='click'], ",
    "[class*='item'], [class*='row'], li[role='menuitem'], li[role='option'], ",
    "ul[class*='menu'] > li, ol[class*='menu'] > li, ",
    "[tabindex='0'], [tabindex='1'], [tabindex='2'], [tabindex='3'], [tabindex='4'], [tabindex='5'], ",
    ".menu > *, .dropdown > *, .list > *, .options > *, ",
    "[class*='menu'] > *, [class*='dropdown'] > *, [class*='option'] > *, ",
    "[id*='menu'] > *, [id*='dropdown'] > *"
);

const ACTIVE_CLASSES: [&str; 4] = ["active", "selected", "checked", "on"];

/// Minimum opacity for a node to count as visible.
const MIN_OPACITY: f64 = 0.01;

/// Owns the scan generation counter. Every call to [`Scanner::scan`] starts a
/// new generation, invalidating handles from earlier scans.
#[derive(Debug)]
pub struct Scanner {
    generation: u64,
    label_cap: usize,
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new(LABEL_MAX_CHARS)
    }
}

impl Scanner {
    pub fn new(label_cap: usize) -> Self {
        Self {
            generation: 0,
            label_cap,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn scan<P: Page + ?Sized>(
        &mut self,
        page: &P,
    ) -> Result<Vec<InteractiveElement>, PageError> {
        self.generation += 1;
        let discovery = page.discover(INTERACTIVE_SELECTOR, self.generation).await?;
        let found = discovery.nodes.len();
        let elements = build_inventory(
            discovery.nodes,
            discovery.viewport,
            self.generation,
            self.label_cap,
        );
        debug!(
            generation = self.generation,
            found,
            visible = elements.len(),
            "scanned interactive elements"
        );
        Ok(elements)
    }
}

/// Filter, label and index discovered nodes. Indices are assigned in
/// discovery order over the accepted nodes, so they always run `0..n`.
pub fn build_inventory(
    nodes: Vec<ScannedNode>,
    viewport: Viewport,
    generation: u64,
    label_cap: usize,
) -> Vec<InteractiveElement> {
    let mut seen = HashSet::new();
    let mut elements = Vec::new();

    for node in nodes {
        if !seen.insert(node.slot) {
            continue;
        }
        if !is_visible(&node) || is_container(&node, viewport) {
            continue;
        }

        let mut text = truncate_label(&resolve_label(&node), label_cap);
        let active = is_active(&node);
        if active {
            text = if is_toggle_input(&node) {
                format!("(SELECTED) {text}")
            } else {
                format!("{text} [ACTIVE]")
            };
        }

        elements.push(InteractiveElement {
            index: elements.len(),
            kind: classify(&node),
            handle: ElementHandle::new(generation, node.slot),
            text,
            active,
            id: node.id.filter(|id| !id.is_empty()),
            class_name: node.class_name.filter(|c| !c.trim().is_empty()),
            tag: node.tag,
            rect: node.rect,
        });
    }

    elements
}

fn is_visible(node: &ScannedNode) -> bool {
    node.rect.width > 0.0
        && node.rect.height > 0.0
        && node.display != "none"
        && node.visibility != "hidden"
        && node.opacity > MIN_OPACITY
}

/// Nodes spanning most of the viewport are layout containers, not controls.
fn is_container(node: &ScannedNode, viewport: Viewport) -> bool {
    node.rect.width > viewport.width * 0.9 && node.rect.height > viewport.height * 0.5
}

fn is_toggle_input(node: &ScannedNode) -> bool {
    node.tag == "INPUT"
        && matches!(node.input_type.as_deref(), Some("radio") | Some("checkbox"))
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Display text by precedence: accessible label, title, alt, placeholder,
/// form value, associated label, direct text, full text, then an identifier.
pub fn resolve_label(node: &ScannedNode) -> String {
    let toggle_label = if is_toggle_input(node) {
        non_empty(&node.label_text)
    } else {
        None
    };

    non_empty(&node.aria_label)
        .or_else(|| non_empty(&node.title))
        .or_else(|| non_empty(&node.alt))
        .or_else(|| non_empty(&node.placeholder))
        .or_else(|| non_empty(&node.value))
        .or(toggle_label)
        .or_else(|| non_empty(&node.direct_text))
        .or_else(|| non_empty(&node.text_content))
        .unwrap_or_else(|| fallback_label(node))
}

fn fallback_label(node: &ScannedNode) -> String {
    if let Some(id) = non_empty(&node.id) {
        return format!("#{id}");
    }
    if let Some(class) = node
        .class_name
        .as_deref()
        .and_then(|c| c.split_whitespace().next())
    {
        return format!(".{class}");
    }
    node.tag.to_lowercase()
}

fn truncate_label(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text.to_string();
    }
    let kept: String = text.chars().take(cap.saturating_sub(3)).collect();
    format!("{kept}...")
}

fn is_active(node: &ScannedNode) -> bool {
    let has_class = node
        .class_name
        .as_deref()
        .map(|c| c.split_whitespace().any(|cls| ACTIVE_CLASSES.contains(&cls)))
        .unwrap_or(false);

    node.checked
        || node.selected
        || node.aria_checked.as_deref() == Some("true")
        || node.aria_selected.as_deref() == Some("true")
        || has_class
}

fn classify(node: &ScannedNode) -> ElementKind {
    match node.tag.as_str() {
        "BUTTON" => ElementKind::Button,
        "A" => ElementKind::Link,
        "INPUT" => ElementKind::Input,
        _ if node.has_onclick => ElementKind::Clickable,
        _ if node.pointer_cursor => ElementKind::Pointer,
        _ => match non_empty(&node.role) {
            Some(role) => ElementKind::Role(role),
            None => ElementKind::Unknown,
        },
    }
}

/// Collapse page text blocks into a bounded, de-duplicated digest for the
/// oracle prompt. Fragments shorter than three characters are dropped.
pub fn condense_text(blocks: &[String], cap: usize) -> String {
    let mut seen = HashSet::new();
    let mut out = String::new();

    for block in blocks {
        let line = block.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.chars().count() < 3 || !seen.insert(line.clone()) {
            continue;
        }
        let used = out.chars().count();
        let sep = usize::from(!out.is_empty());
        if used + sep >= cap {
            break;
        }
        if sep == 1 {
            out.push('\n');
        }
        out.extend(line.chars().take(cap - used - sep));
    }

    out
}
