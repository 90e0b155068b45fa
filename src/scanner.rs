use std::collections::HashSet;

use tracing::{debug, warn};

use crate::dom::{Document, NodeId};
use crate::selector::Selector;

/// Set on every post the engine has handled.
pub const PROCESSED_ATTR: &str = "data-fb-reader-processed";
pub const LOADING_LABEL: &str = "Loading...";
const LOADING_STATE: &str = "loading-state";

/// Structural patterns for feed posts, most reliable first.
pub const FEED_SELECTORS: &[&str] = &[
    r#"[role="article"][aria-posinset]"#,
    r#"[data-pagelet*="FeedUnit"]"#,
    r#"[data-testid*="post"]"#,
    r#"[role="article"]"#,
    r#"div[data-testid="post_container"]"#,
    r#"div[data-testid="post_message"]"#,
    r#"[data-testid="post_message"]"#,
    r#"div[data-testid="post"]"#,
    r#"div[data-testid="story"]"#,
    r#"div[data-testid="feed_story"]"#,
    r#"div[data-testid="feed_story_container"]"#,
    r#"div[role="article"]"#,
    r#"div[data-testid*="story"]"#,
    r#"div[data-testid*="feed"]"#,
];

#[derive(Debug, Clone)]
pub struct FeedScanner {
    patterns: Vec<String>,
}

impl Default for FeedScanner {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl FeedScanner {
    pub fn new(extra: &[String]) -> Self {
        let patterns = FEED_SELECTORS
            .iter()
            .map(|s| s.to_string())
            .chain(extra.iter().cloned())
            .collect();
        Self { patterns }
    }

    /// Unhandled, fully rendered candidates ordered by feed position.
    pub fn scan(&self, doc: &Document) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for selector in self.selectors() {
            for node in doc.query_all(&selector) {
                if seen.insert(node) {
                    found.push(node);
                }
            }
        }

        let total = found.len();
        found.retain(|node| !doc.has_attr(*node, PROCESSED_ATTR) && !is_loading(doc, *node));
        found.sort_by_key(|node| feed_position(doc, *node));
        debug!(total, unprocessed = found.len(), "scanned feed");
        found
    }

    /// Whether an added node is, sits inside, or contains a feed post.
    pub fn is_feed_item(&self, doc: &Document, node: NodeId) -> bool {
        if !doc.is_element(node) {
            return false;
        }
        let selectors = self.selectors();
        selectors
            .iter()
            .any(|s| doc.closest(node, s).is_some())
            || selectors
                .iter()
                .any(|s| !doc.query_within(node, s).is_empty())
    }

    fn selectors(&self) -> Vec<Selector> {
        self.patterns
            .iter()
            .filter_map(|pattern| match Selector::parse(pattern) {
                Ok(selector) => Some(selector),
                Err(err) => {
                    warn!(selector = %pattern, error = %err, "selector failed");
                    None
                }
            })
            .collect()
    }
}

/// Posts still showing a skeleton are skipped until they render.
pub fn is_loading(doc: &Document, node: NodeId) -> bool {
    doc.attr(node, "aria-label") == Some(LOADING_LABEL)
        || doc
            .find_descendant(node, |n| {
                doc.attr(n, "aria-label") == Some(LOADING_LABEL)
                    || doc.attr(n, "data-visualcompletion") == Some(LOADING_STATE)
            })
            .is_some()
}

/// `aria-posinset` read with integer-prefix semantics; absent or
/// unparsable positions sort as 0.
pub fn feed_position(doc: &Document, node: NodeId) -> i64 {
    doc.attr(node, "aria-posinset")
        .map(leading_int)
        .unwrap_or(0)
}

fn leading_int(raw: &str) -> i64 {
    let trimmed = raw.trim_start();
    let (sign, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end]
        .parse::<i64>()
        .map(|n| sign * n)
        .unwrap_or(0)
}
