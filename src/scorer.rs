//! Relevance ranking for the oracle prompt.
//!
//! The executor always acts on the full inventory; only the prompt is
//! trimmed to the best `cap` elements, presented back in document order.

use crate::types::InteractiveElement;

const PRIORITY_KEYWORDS: &[&str] = &[
    "cart", "basket", "login", "log in", "sign", "account", "profile", "language", "english",
    "italiano", "menu", "category", "search", "home", "orders", "wishlist", "list", "settings",
    "preferences", "country", "register", "address", "shipping", "carrello", "accedi",
    "profilo", "lingua", "categoria", "cerca", "ordini", "impostazioni", "paese", "iscriviti",
];

const NOISE_KEYWORDS: &[&str] = &[
    "sponsored", "advertisement", "pubblicità", "cookie", "privacy", "track", "analytics",
];

const CANONICAL_TAGS: [&str; 3] = ["A", "BUTTON", "INPUT"];

/// Elements discovered before this position get a small bonus; headers and
/// navigation tend to come first in document order.
const EARLY_POSITION: usize = 200;

pub fn score(element: &InteractiveElement) -> i32 {
    let text = element.text.to_lowercase();
    let id = element.id.as_deref().unwrap_or_default().to_lowercase();
    let class = element.class_name.as_deref().unwrap_or_default().to_lowercase();
    let mentions = |kw: &&str| text.contains(*kw) || id.contains(*kw) || class.contains(*kw);

    let mut score = 0;
    let len = text.chars().count();
    if len < 2 {
        score -= 10;
    }
    if len > 100 {
        score -= 5;
    }
    if PRIORITY_KEYWORDS.iter().any(mentions) {
        score += 10;
    }
    if NOISE_KEYWORDS.iter().any(mentions) {
        score -= 20;
    }
    if CANONICAL_TAGS.contains(&element.tag.as_str()) {
        score += 3;
    }
    if element.id.is_some() {
        score += 2;
    }
    if element.index < EARLY_POSITION {
        score += 1;
    }
    score
}

/// Top `cap` elements by score, returned in ascending index order.
pub fn rank(inventory: &[InteractiveElement], cap: usize) -> Vec<&InteractiveElement> {
    let mut scored: Vec<(i32, &InteractiveElement)> =
        inventory.iter().map(|e| (score(e), e)).collect();
    // Stable sort keeps document order among equal scores.
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.truncate(cap);

    let mut top: Vec<&InteractiveElement> = scored.into_iter().map(|(_, e)| e).collect();
    top.sort_by_key(|e| e.index);
    top
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ElementHandle, ElementKind, Rect};

    fn element(index: usize, tag: &str, text: &str) -> InteractiveElement {
        InteractiveElement {
            index,
            text: text.to_string(),
            id: None,
            class_name: None,
            tag: tag.to_string(),
            kind: ElementKind::Unknown,
            active: false,
            rect: Rect::default(),
            handle: ElementHandle::new(1, index),
        }
    }

    #[test]
    fn keywords_and_tags_raise_the_score() {
        let plain = element(300, "DIV", "Lorem ipsum");
        let cart = element(300, "A", "View cart");
        assert_eq!(score(&plain), 0);
        assert_eq!(score(&cart), 13);
    }

    #[test]
    fn noise_and_empty_text_are_penalised() {
        let banner = element(0, "BUTTON", "Accept cookie policy");
        let empty = element(0, "SPAN", "");
        assert!(score(&banner) < 0);
        assert_eq!(score(&empty), -9);
    }

    #[test]
    fn identifiers_count_in_class_and_id() {
        let mut by_class = element(500, "DIV", "≡");
        by_class.class_name = Some("main-menu toggle".into());
        let mut by_id = element(500, "DIV", "icon");
        by_id.id = Some("account-link".into());
        assert_eq!(score(&by_class), 0);
        assert_eq!(score(&by_id), 12);
    }

    #[test]
    fn rank_truncates_then_restores_document_order() {
        let inventory = vec![
            element(0, "DIV", "filler"),
            element(1, "A", "Login"),
            element(2, "SPAN", ""),
            element(3, "BUTTON", "Search"),
            element(4, "DIV", "Sponsored"),
        ];
        let top: Vec<usize> = rank(&inventory, 3).iter().map(|e| e.index).collect();
        assert_eq!(top, vec![0, 1, 3]);
    }

    #[test]
    fn rank_keeps_everything_under_the_cap() {
        let inventory = vec![element(0, "A", "Home"), element(1, "A", "Orders")];
        assert_eq!(rank(&inventory, 100).len(), 2);
    }
}
