use std::fmt;

use serde::{Deserialize, Serialize};

use crate::decorate;
use crate::dom::{truncate_chars, Document, NodeId};

/// Prefix of the synthetic position/length key.
pub const FALLBACK_PREFIX: &str = "item_";
/// Prefix shared by generic feed-unit pagelets; reused across many posts.
pub const GENERIC_UNIT_PREFIX: &str = "FeedUnit_";
/// Prefix of the ids the page links from a post to its accessible label.
pub const ARIA_LINK_PREFIX: &str = "_r_";
pub const CONTENT_MARKER: &str = "pfbid";
pub const PERMALINK_MARKER: &str = "permalink";

const POST_MESSAGE_TESTID: &str = "post_message";
const MESSAGE_ANCHOR_CHARS: usize = 50;
const FALLBACK_TEXT_CHARS: usize = 100;
const MIN_TRUSTED_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(String);

impl PostId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn trust(&self) -> Trust {
        classify(&self.0)
    }

    pub fn is_trusted(&self) -> bool {
        self.trust() == Trust::Trusted
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PostId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trust {
    Trusted,
    Fallback,
}

impl Trust {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trust::Trusted => "trusted",
            Trust::Fallback => "fallback",
        }
    }
}

/// Which resolution strategy produced an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    AriaLabelledBy,
    AriaPosition,
    TestId,
    Pagelet,
    DataFt,
    PostLink,
    PermalinkLink,
    StoryLink,
    MessageText,
    Synthetic,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::AriaLabelledBy => "aria_labelledby",
            Source::AriaPosition => "aria_position",
            Source::TestId => "test_id",
            Source::Pagelet => "pagelet",
            Source::DataFt => "data_ft",
            Source::PostLink => "post_link",
            Source::PermalinkLink => "permalink_link",
            Source::StoryLink => "story_link",
            Source::MessageText => "message_text",
            Source::Synthetic => "synthetic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub id: PostId,
    pub source: Source,
}

impl Resolution {
    pub fn trust(&self) -> Trust {
        // A synthetic key stays fallback even if it happens to pass the rules.
        match self.source {
            Source::Synthetic => Trust::Fallback,
            _ => self.id.trust(),
        }
    }
}

type Strategy = fn(&Document, NodeId) -> Option<String>;

/// Ordered strategies; the first non-empty answer wins.
const STRATEGIES: &[(Source, Strategy)] = &[
    (Source::AriaLabelledBy, labelled_by),
    (Source::AriaPosition, aria_position),
    (Source::TestId, test_id),
    (Source::Pagelet, pagelet),
    (Source::DataFt, data_ft),
    (Source::PostLink, post_link),
    (Source::PermalinkLink, permalink_link),
    (Source::StoryLink, story_link),
    (Source::MessageText, message_text),
];

/// Derives the best available identifier for a candidate post.
pub fn resolve(doc: &Document, node: NodeId) -> Resolution {
    STRATEGIES
        .iter()
        .find_map(|(source, strategy)| {
            strategy(doc, node).map(|id| Resolution {
                id: PostId(id),
                source: *source,
            })
        })
        .unwrap_or_else(|| Resolution {
            id: PostId(synthetic_key(doc, node)),
            source: Source::Synthetic,
        })
}

/// Decides whether an identifier is specific enough to drive persistent
/// hide decisions.
pub fn classify(id: &str) -> Trust {
    let passes_exclusions = !id.is_empty()
        && !id.starts_with(FALLBACK_PREFIX)
        && !id.starts_with(GENERIC_UNIT_PREFIX)
        && !id.contains('{')
        && !id.contains('}')
        && long_enough(id)
        && !id.contains("undefined");
    let specific = id.starts_with("http")
        || id.contains(CONTENT_MARKER)
        || id.contains(PERMALINK_MARKER)
        || id.starts_with(ARIA_LINK_PREFIX)
        || is_numeric(id);

    if passes_exclusions && specific {
        Trust::Trusted
    } else {
        Trust::Fallback
    }
}

fn is_numeric(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())
}

// Numeric position ids are accepted from five digits; everything else needs
// more than five characters.
fn long_enough(id: &str) -> bool {
    let len = id.chars().count();
    len > MIN_TRUSTED_LEN || (len == MIN_TRUSTED_LEN && is_numeric(id))
}

fn labelled_by(doc: &Document, node: NodeId) -> Option<String> {
    attr_value(doc, node, "aria-labelledby")
}

fn test_id(doc: &Document, node: NodeId) -> Option<String> {
    attr_value(doc, node, "data-testid")
}

fn pagelet(doc: &Document, node: NodeId) -> Option<String> {
    attr_value(doc, node, "data-pagelet")
}

fn data_ft(doc: &Document, node: NodeId) -> Option<String> {
    attr_value(doc, node, "data-ft")
}

fn post_link(doc: &Document, node: NodeId) -> Option<String> {
    link_containing(doc, node, "/posts/")
}

fn permalink_link(doc: &Document, node: NodeId) -> Option<String> {
    link_containing(doc, node, "/permalink/")
}

fn story_link(doc: &Document, node: NodeId) -> Option<String> {
    link_containing(doc, node, "/story.php")
}

fn attr_value(doc: &Document, node: NodeId, name: &str) -> Option<String> {
    doc.attr(node, name)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn aria_position(doc: &Document, node: NodeId) -> Option<String> {
    let posinset = doc.attr(node, "aria-posinset").filter(|v| !v.is_empty())?;
    let described = doc
        .attr(node, "aria-describedby")
        .filter(|v| !v.is_empty())
        .map(|v| v.split(' ').next().unwrap_or_default());
    Some(match described {
        Some(desc) => format!("pos_{posinset}_desc_{desc}"),
        None => format!("pos_{posinset}"),
    })
}

fn link_containing(doc: &Document, node: NodeId, needle: &str) -> Option<String> {
    let link = doc.find_descendant(node, |n| {
        doc.tag(n) == Some("a") && doc.attr(n, "href").is_some_and(|h| h.contains(needle))
    })?;
    doc.href(link).filter(|h| !h.is_empty())
}

fn message_text(doc: &Document, node: NodeId) -> Option<String> {
    let message = doc.find_descendant(node, |n| {
        doc.attr(n, "data-testid") == Some(POST_MESSAGE_TESTID)
    })?;
    let text = page_text(doc, message);
    let anchor = truncate_chars(&text, MESSAGE_ANCHOR_CHARS);
    (!anchor.is_empty()).then(|| anchor.to_string())
}

// Text the page itself rendered; our markers must not feed back into ids.
fn page_text(doc: &Document, node: NodeId) -> String {
    doc.text_content_excluding(node, |n| decorate::is_marker(doc, n))
}

fn synthetic_key(doc: &Document, node: NodeId) -> String {
    let text = page_text(doc, node);
    let len = truncate_chars(&text, FALLBACK_TEXT_CHARS).chars().count();
    let position = doc
        .element_index(node)
        .map(|idx| idx as i64)
        .unwrap_or(-1);
    format!("{FALLBACK_PREFIX}{position}_{len}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{NodeSnapshot, PageSnapshot};

    fn page(yaml: &str) -> (Document, NodeId) {
        let snapshot = PageSnapshot::parse(yaml).unwrap();
        let doc = Document::from_snapshot(&snapshot);
        let post = doc.element_children(doc.body()).last().unwrap();
        (doc, post)
    }

    #[test]
    fn classify_follows_trust_rules() {
        assert_eq!(classify("12345"), Trust::Trusted);
        assert_eq!(classify("https://site/posts/99"), Trust::Trusted);
        assert_eq!(classify("_r_abc_"), Trust::Trusted);
        assert_eq!(classify("story:pfbid02xyz"), Trust::Trusted);
        assert_eq!(classify("group-permalink-7"), Trust::Trusted);

        assert_eq!(classify("pos_3"), Trust::Fallback);
        assert_eq!(classify("item_7_42"), Trust::Fallback);
        assert_eq!(classify("FeedUnit_12345"), Trust::Fallback);
        assert_eq!(classify("https://x/{id}"), Trust::Fallback);
        assert_eq!(classify("https://x/undefined"), Trust::Fallback);
        assert_eq!(classify("1234"), Trust::Fallback);
        assert_eq!(classify("_r_1"), Trust::Fallback);
        assert_eq!(classify(""), Trust::Fallback);
        assert_eq!(classify("post_container"), Trust::Fallback);
    }

    #[test]
    fn labelledby_wins_over_everything() {
        let (doc, post) = page(
            r#"
url: https://www.facebook.com/
body:
  children:
    - attrs: { role: article, aria-labelledby: "_r_1f_", aria-posinset: "4", data-testid: post }
      children:
        - tag: a
          attrs: { href: "/x/posts/1" }
"#,
        );
        let resolved = resolve(&doc, post);
        assert_eq!(resolved.id.as_str(), "_r_1f_");
        assert_eq!(resolved.source, Source::AriaLabelledBy);
        assert_eq!(resolved.trust(), Trust::Trusted);
    }

    #[test]
    fn aria_position_uses_first_describedby_token() {
        let (doc, post) = page(
            r#"
url: https://www.facebook.com/
body:
  children:
    - attrs: { role: article, aria-posinset: "4", aria-describedby: "_r_a_ _r_b_" }
"#,
        );
        let resolved = resolve(&doc, post);
        assert_eq!(resolved.id.as_str(), "pos_4_desc__r_a_");
        assert_eq!(resolved.source, Source::AriaPosition);
    }

    #[test]
    fn links_resolve_to_absolute_permalinks() {
        let (doc, post) = page(
            r#"
url: https://www.facebook.com/
body:
  children:
    - tag: section
      children:
        - tag: a
          attrs: { href: "/profile/1" }
        - tag: a
          attrs: { href: "/groups/7/permalink/991/" }
"#,
        );
        let resolved = resolve(&doc, post);
        assert_eq!(
            resolved.id.as_str(),
            "https://www.facebook.com/groups/7/permalink/991/"
        );
        assert_eq!(resolved.source, Source::PermalinkLink);
        assert_eq!(resolved.trust(), Trust::Trusted);
    }

    #[test]
    fn message_text_is_truncated_anchor() {
        let long = "x".repeat(80);
        let yaml = format!(
            r#"
url: https://www.facebook.com/
body:
  children:
    - tag: section
      children:
        - attrs: {{ data-testid: post_message }}
          text: "{long}"
"#
        );
        let (doc, post) = page(&yaml);
        let resolved = resolve(&doc, post);
        assert_eq!(resolved.source, Source::MessageText);
        assert_eq!(resolved.id.as_str().len(), 50);
    }

    #[test]
    fn synthetic_key_uses_sibling_index_and_text_length() {
        let (mut doc, _) = page(
            r#"
url: https://www.facebook.com/
body:
  children:
    - tag: span
    - tag: section
      text: "hello"
"#,
        );
        let post = doc.element_children(doc.body()).nth(1).unwrap();
        let resolved = resolve(&doc, post);
        assert_eq!(resolved.id.as_str(), "item_1_5");
        assert_eq!(resolved.trust(), Trust::Fallback);

        let detached = doc
            .insert_snapshot(doc.body(), &NodeSnapshot::default())
            .unwrap();
        doc.remove(detached).unwrap();
        assert_eq!(resolve(&doc, detached).id.as_str(), "item_-1_0");
    }

    #[test]
    fn empty_attributes_fall_through() {
        let (doc, post) = page(
            r#"
url: https://www.facebook.com/
body:
  children:
    - attrs: { aria-labelledby: "", data-pagelet: "FeedUnit_2" }
"#,
        );
        let resolved = resolve(&doc, post);
        assert_eq!(resolved.id.as_str(), "FeedUnit_2");
        assert_eq!(resolved.source, Source::Pagelet);
        assert_eq!(resolved.trust(), Trust::Fallback);
    }
}
