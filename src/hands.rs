//! Action executor: performs one oracle decision against the page.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::ExecutorTiming;
use crate::error::{ExecutorError, PageError};
use crate::page::{Delivery, Page, Relation, SyntheticEvent};
use crate::scanner::Scanner;
use crate::types::{ActionDecision, ActionKind, ActionOutcome, ActionResult, InteractiveElement};

/// Class names added by a force-open.
pub const OPEN_CLASSES: [&str; 7] = [
    "open", "active", "show", "visible", "expanded", "selected", "toggled",
];

const PARENT_ENTER: SyntheticEvent = SyntheticEvent::on_parent("mouseenter", "pointerenter");

const APPROACH: [SyntheticEvent; 4] = [
    SyntheticEvent::dual("mousemove", "pointermove"),
    SyntheticEvent::dual("mouseenter", "pointerenter"),
    SyntheticEvent::dual("mouseover", "pointerover"),
    SyntheticEvent::dual("mousemove", "pointermove"),
];

const PRESS: [SyntheticEvent; 2] = [
    SyntheticEvent::dual("mousedown", "pointerdown"),
    SyntheticEvent::dual("mouseup", "pointerup"),
];

const NEIGHBORHOOD: [Relation; 4] = [
    Relation::Parent,
    Relation::Grandparent,
    Relation::FollowingSiblings,
    Relation::Controlled,
];

/// Identity used by the duplicate-click guard: the element id when there is
/// one, otherwise tag, scan-time position and class.
pub fn fingerprint(element: &InteractiveElement) -> String {
    match &element.id {
        Some(id) => format!("id:{id}"),
        None => format!(
            "{}:{:.0}:{:.0}:{}",
            element.tag,
            element.rect.left,
            element.rect.top,
            element.class_name.as_deref().unwrap_or_default()
        ),
    }
}

/// First element whose label contains `needle`, case-insensitively.
pub fn find_by_text(inventory: &[InteractiveElement], needle: &str) -> Option<usize> {
    let needle = needle.to_lowercase();
    inventory
        .iter()
        .position(|e| e.text.to_lowercase().contains(&needle))
}

/// First element whose label contains every whitespace-separated word of
/// `needle`, in any order.
pub fn find_by_words(inventory: &[InteractiveElement], needle: &str) -> Option<usize> {
    let needle = needle.to_lowercase();
    let words: Vec<&str> = needle.split_whitespace().collect();
    if words.is_empty() {
        return None;
    }
    inventory.iter().position(|e| {
        let text = e.text.to_lowercase();
        words.iter().all(|w| text.contains(w))
    })
}

pub struct ActionExecutor {
    clicked: HashSet<String>,
    timing: ExecutorTiming,
}

impl ActionExecutor {
    pub fn new(timing: ExecutorTiming) -> Self {
        Self {
            clicked: HashSet::new(),
            timing,
        }
    }

    /// Drop the duplicate-click memory. Called on every new goal and after
    /// the page reloads.
    pub fn forget_clicks(&mut self) {
        if !self.clicked.is_empty() {
            debug!(count = self.clicked.len(), "click memory cleared");
        }
        self.clicked.clear();
    }

    pub fn was_clicked(&self, element: &InteractiveElement) -> bool {
        self.clicked.contains(&fingerprint(element))
    }

    /// Run one decision. Target problems come back as failed results; only
    /// a navigation away from the page is an error, because the action's
    /// outcome can no longer be observed here.
    pub async fn execute<P: Page + ?Sized>(
        &mut self,
        page: &P,
        scanner: &mut Scanner,
        decision: &ActionDecision,
        inventory: &mut Vec<InteractiveElement>,
    ) -> Result<ActionResult, ExecutorError> {
        info!(kind = %decision.kind, index = ?decision.index, "executing action");

        let outcome = match &decision.kind {
            ActionKind::Click => self.click_at(page, scanner, decision, inventory).await,
            ActionKind::Hover => self.hover_at(page, scanner, decision, inventory).await,
            ActionKind::ForceOpen => self.force_open_at(page, scanner, decision, inventory).await,
            ActionKind::ClickByText => self.click_by_text(page, scanner, decision, inventory).await,
            ActionKind::Type => self.type_at(page, scanner, decision, inventory).await,
            ActionKind::Wait => {
                let requested = decision.duration_ms.unwrap_or(self.timing.default_wait_ms);
                let duration_ms = requested.min(self.timing.max_wait_ms);
                if duration_ms < requested {
                    warn!(requested, duration_ms, "wait clamped");
                }
                info!(duration_ms, "explicit wait");
                sleep(Duration::from_millis(duration_ms)).await;
                Ok(ActionResult::ok(ActionOutcome::Waited { duration_ms }))
            }
            ActionKind::Error => Ok(ActionResult::failed(if decision.reasoning.is_empty() {
                "oracle reported an error".to_string()
            } else {
                decision.reasoning.clone()
            })),
            other => Ok(ActionResult::failed(format!(
                "unrecognized action type: {other}"
            ))),
        };

        match outcome {
            Ok(result) => {
                if let Some(error) = result.error() {
                    warn!(kind = %decision.kind, "action failed: {}", error);
                }
                Ok(result)
            }
            Err(PageError::Navigated) => {
                info!(kind = %decision.kind, "page navigated during action");
                Err(ExecutorError::NavigatedAway)
            }
            Err(e) => {
                warn!(kind = %decision.kind, "action failed: {}", e);
                Ok(ActionResult::failed(e.to_string()))
            }
        }
    }

    async fn target<P: Page + ?Sized>(
        page: &P,
        scanner: &mut Scanner,
        decision: &ActionDecision,
        inventory: &mut Vec<InteractiveElement>,
    ) -> Result<Result<InteractiveElement, ActionResult>, PageError> {
        if inventory.is_empty() {
            *inventory = scanner.scan(page).await?;
        }
        let Some(index) = decision.index else {
            return Ok(Err(ActionResult::failed(format!(
                "{} action requires a valid buttonIndex",
                decision.kind
            ))));
        };
        match inventory.get(index) {
            Some(element) => Ok(Ok(element.clone())),
            None => Ok(Err(ActionResult::failed(format!(
                "element index {index} is out of range ({} available)",
                inventory.len()
            )))),
        }
    }

    async fn click_at<P: Page + ?Sized>(
        &mut self,
        page: &P,
        scanner: &mut Scanner,
        decision: &ActionDecision,
        inventory: &mut Vec<InteractiveElement>,
    ) -> Result<ActionResult, PageError> {
        match Self::target(page, scanner, decision, inventory).await? {
            Ok(element) => self.click(page, &element).await,
            Err(failure) => Ok(failure),
        }
    }

    async fn click<P: Page + ?Sized>(
        &mut self,
        page: &P,
        element: &InteractiveElement,
    ) -> Result<ActionResult, PageError> {
        let label = element.text.clone();
        if self.was_clicked(element) {
            info!(index = element.index, label = %label, "already clicked, skipping");
            return Ok(ActionResult::ok(ActionOutcome::AlreadyClicked { label }));
        }

        info!(index = element.index, label = %label, "clicking");
        self.interact(page, element, true).await?;
        self.clicked.insert(fingerprint(element));
        sleep(Duration::from_millis(self.timing.click_follow_ms)).await;
        Ok(ActionResult::ok(ActionOutcome::Clicked { label }))
    }

    async fn hover_at<P: Page + ?Sized>(
        &mut self,
        page: &P,
        scanner: &mut Scanner,
        decision: &ActionDecision,
        inventory: &mut Vec<InteractiveElement>,
    ) -> Result<ActionResult, PageError> {
        let element = match Self::target(page, scanner, decision, inventory).await? {
            Ok(element) => element,
            Err(failure) => return Ok(failure),
        };

        info!(index = element.index, label = %element.text, "hovering");
        self.interact(page, &element, false).await?;
        sleep(Duration::from_millis(self.timing.hover_follow_ms)).await;
        Ok(ActionResult::ok(ActionOutcome::Hovered {
            label: element.text,
        }))
    }

    /// Highlight, approach, focus and optionally press. Secondary pointer
    /// events are best effort.
    async fn interact<P: Page + ?Sized>(
        &self,
        page: &P,
        element: &InteractiveElement,
        press: bool,
    ) -> Result<(), PageError> {
        let handle = &element.handle;
        page.highlight(handle).await?;
        sleep(Duration::from_millis(self.timing.settle_ms)).await;

        Self::fire(page, element, PARENT_ENTER).await?;
        for event in APPROACH {
            Self::fire(page, element, event).await?;
        }
        page.focus(handle).await?;

        if press {
            sleep(Duration::from_millis(self.timing.press_delay_ms)).await;
            for event in PRESS {
                Self::fire(page, element, event).await?;
            }
            page.native_click(handle).await?;
        }
        Ok(())
    }

    async fn fire<P: Page + ?Sized>(
        page: &P,
        element: &InteractiveElement,
        event: SyntheticEvent,
    ) -> Result<(), PageError> {
        match page.dispatch(&element.handle, event).await? {
            Delivery::Full => {}
            Delivery::PrimaryOnly => {
                debug!(index = element.index, event = event.primary, "secondary event unsupported")
            }
            Delivery::NoTarget => {
                debug!(index = element.index, event = event.primary, "no node to receive event")
            }
        }
        Ok(())
    }

    async fn force_open_at<P: Page + ?Sized>(
        &mut self,
        page: &P,
        scanner: &mut Scanner,
        decision: &ActionDecision,
        inventory: &mut Vec<InteractiveElement>,
    ) -> Result<ActionResult, PageError> {
        let element = match Self::target(page, scanner, decision, inventory).await? {
            Ok(element) => element,
            Err(failure) => return Ok(failure),
        };

        info!(index = element.index, label = %element.text, "forcing open");
        page.reveal(&element.handle, &OPEN_CLASSES).await?;

        for relation in NEIGHBORHOOD {
            let relatives = match page.relatives(&element.handle, relation).await {
                Ok(relatives) => relatives,
                Err(PageError::Navigated) => return Err(PageError::Navigated),
                Err(e) => {
                    debug!(?relation, "skipping neighbors: {}", e);
                    continue;
                }
            };
            for relative in &relatives {
                match page.reveal(relative, &OPEN_CLASSES).await {
                    Ok(()) => {}
                    Err(PageError::Navigated) => return Err(PageError::Navigated),
                    Err(e) => debug!(?relation, "could not reveal neighbor: {}", e),
                }
            }
        }

        sleep(Duration::from_millis(self.timing.force_open_follow_ms)).await;
        Ok(ActionResult::ok(ActionOutcome::ForcedOpen {
            label: element.text,
        }))
    }

    /// Substring match, then the same after a fresh scan, then an all-words
    /// match. Each stage runs once.
    async fn click_by_text<P: Page + ?Sized>(
        &mut self,
        page: &P,
        scanner: &mut Scanner,
        decision: &ActionDecision,
        inventory: &mut Vec<InteractiveElement>,
    ) -> Result<ActionResult, PageError> {
        let needle = decision.search_text.as_deref().unwrap_or_default().trim();
        if needle.is_empty() {
            return Ok(ActionResult::failed("clickByText action requires searchText"));
        }

        let mut found = find_by_text(inventory, needle);
        if found.is_none() {
            debug!(needle, "no match in current inventory, rescanning");
            *inventory = scanner.scan(page).await?;
            found = find_by_text(inventory, needle);
        }
        if found.is_none() {
            found = find_by_words(inventory, needle);
            if let Some(i) = found {
                debug!(needle, index = i, "relaxed match");
            }
        }

        match found {
            Some(i) => {
                let element = inventory[i].clone();
                info!(needle, index = i, label = %element.text, "matched by text");
                self.click(page, &element).await
            }
            None => Ok(ActionResult::failed(format!(
                "no element matching \"{needle}\""
            ))),
        }
    }

    async fn type_at<P: Page + ?Sized>(
        &mut self,
        page: &P,
        scanner: &mut Scanner,
        decision: &ActionDecision,
        inventory: &mut Vec<InteractiveElement>,
    ) -> Result<ActionResult, PageError> {
        let Some(text) = decision.text.as_deref() else {
            return Ok(ActionResult::failed("type action requires text"));
        };
        let element = match Self::target(page, scanner, decision, inventory).await? {
            Ok(element) => element,
            Err(failure) => return Ok(failure),
        };

        info!(index = element.index, text, "typing");
        page.highlight(&element.handle).await?;
        page.focus(&element.handle).await?;
        page.commit_text(&element.handle, text).await?;
        Ok(ActionResult::ok(ActionOutcome::Typed {
            text: text.to_string(),
        }))
    }
}
