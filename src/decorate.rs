use std::time::Duration;

use tracing::{debug, info, warn};

use crate::dismissals::DismissalSet;
use crate::dom::{Document, DomError, NodeId};
use crate::identity::{self, Resolution, Trust};
use crate::scanner::PROCESSED_ATTR;
use crate::scheduler::{Task, Timers};
use crate::storage::KeyValueStore;

pub const MARKER_CLASS: &str = "fb-reader-checkmark";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerStyle {
    pub glyph: String,
    pub title: String,
}

impl Default for MarkerStyle {
    fn default() -> Self {
        Self {
            glyph: "\u{2713}".into(),
            title: "Mark as read".into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecorateError {
    #[error("post {0} is no longer attached to the page")]
    Disconnected(NodeId),
    #[error(transparent)]
    Dom(#[from] DomError),
}

/// A marker the engine attached to a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoration {
    pub host: NodeId,
    pub marker: NodeId,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    AlreadyProcessed,
    Retired(Resolution),
    Decorated(Decoration),
}

#[derive(Debug, Clone)]
pub struct Decorator {
    style: MarkerStyle,
    fade_out: Duration,
}

impl Decorator {
    pub fn new(style: MarkerStyle, fade_out: Duration) -> Self {
        Self { style, fade_out }
    }

    /// Handles one candidate: hide it if already dismissed, otherwise attach a
    /// marker. The processed attribute is set first so a post that fails
    /// halfway is never retried.
    pub fn handle(
        &self,
        doc: &mut Document,
        dismissed: &DismissalSet,
        node: NodeId,
        timers: &mut Timers,
    ) -> Result<Outcome, DecorateError> {
        if doc.has_attr(node, PROCESSED_ATTR) {
            return Ok(Outcome::AlreadyProcessed);
        }
        doc.set_attr(node, PROCESSED_ATTR, "true")?;
        if !doc.is_connected(node) {
            return Err(DecorateError::Disconnected(node));
        }

        let resolution = identity::resolve(doc, node);
        let trust = resolution.trust();
        if trust == Trust::Trusted && dismissed.contains(&resolution.id) {
            info!(id = %resolution.id, "hiding previously dismissed post");
            self.retire(doc, node, timers)?;
            return Ok(Outcome::Retired(resolution));
        }

        let marker = self.attach_marker(doc, node)?;
        debug!(
            id = %resolution.id,
            trust = trust.as_str(),
            source = resolution.source.as_str(),
            "marker added"
        );
        Ok(Outcome::Decorated(Decoration {
            host: node,
            marker,
            resolution,
        }))
    }

    /// Marker click: commit trusted ids, then retire the post either way.
    pub fn activate(
        &self,
        doc: &mut Document,
        dismissed: &mut DismissalSet,
        kv: &dyn KeyValueStore,
        decoration: &Decoration,
        timers: &mut Timers,
    ) -> Result<(), DecorateError> {
        let id = &decoration.resolution.id;
        info!(%id, "marker clicked");
        if decoration.resolution.trust() == Trust::Trusted && dismissed.insert(id.clone()) {
            if let Err(err) = dismissed.persist(kv) {
                warn!(%id, error = ?err, "failed to save dismissed post");
            }
        }
        match doc.remove(decoration.marker) {
            Ok(()) | Err(DomError::Detached(_)) => {}
            Err(err) => return Err(err.into()),
        }
        self.retire(doc, decoration.host, timers)
    }

    /// Fades the post out, then hides it once the fade window passes. The
    /// node itself stays in the page.
    pub fn retire(
        &self,
        doc: &mut Document,
        node: NodeId,
        timers: &mut Timers,
    ) -> Result<(), DecorateError> {
        let transition = format!("opacity {}s ease-out", self.fade_out.as_secs_f64());
        doc.set_style(node, "transition", &transition)?;
        doc.set_style(node, "opacity", "0")?;
        timers.schedule(self.fade_out, Task::FinishRetire(node));
        Ok(())
    }

    fn attach_marker(&self, doc: &mut Document, host: NodeId) -> Result<NodeId, DomError> {
        let marker = doc.create_element("div");
        doc.set_attr(marker, "class", MARKER_CLASS)?;
        doc.set_attr(marker, "title", &self.style.title)?;
        let glyph = doc.create_text(&self.style.glyph);
        doc.append_child(marker, glyph)?;
        doc.set_style(marker, "position", "absolute")?;
        doc.set_style(marker, "top", "10px")?;
        doc.set_style(marker, "right", "10px")?;
        doc.set_style(marker, "z-index", "9999")?;

        // Only a static host needs a positioning context; anything else the
        // page chose is left alone.
        if doc.computed_position(host) == "static" {
            doc.set_style_important(host, "position", "relative")?;
        }
        doc.append_child(host, marker)?;
        Ok(marker)
    }
}

pub fn finish_retire(doc: &mut Document, node: NodeId) {
    if let Err(err) = doc.set_style(node, "display", "none") {
        warn!(%node, error = %err, "could not hide post");
    }
}

/// Reverts the style overrides a retirement applied.
pub fn restore(doc: &mut Document, node: NodeId) -> Result<(), DomError> {
    for property in ["transition", "opacity", "display"] {
        doc.remove_style(node, property)?;
    }
    Ok(())
}

pub fn is_marker(doc: &Document, node: NodeId) -> bool {
    doc.attr(node, "class")
        .is_some_and(|class| class.split_ascii_whitespace().any(|c| c == MARKER_CLASS))
}

/// Removes every marker and processed attribute from the page. Returns how
/// many markers were removed.
pub fn strip(doc: &mut Document) -> usize {
    let nodes = doc.descendants(doc.root());
    let mut removed = 0;
    for node in nodes {
        if is_marker(doc, node) && doc.remove(node).is_ok() {
            removed += 1;
        } else if doc.has_attr(node, PROCESSED_ATTR) {
            let _ = doc.remove_attr(node, PROCESSED_ATTR);
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::PageSnapshot;
    use crate::identity::PostId;
    use crate::storage::{MemoryStore, DISMISSED_KEY};
    use serde_json::json;

    const PAGE: &str = r#"
url: https://x/
body:
  children:
    - attrs: { role: article, aria-posinset: "1" }
      children:
        - tag: a
          attrs: { href: "https://x/posts/1" }
    - attrs: { role: article }
      text: "anonymous"
"#;

    fn setup() -> (Document, NodeId, NodeId) {
        let doc = Document::from_snapshot(&PageSnapshot::parse(PAGE).unwrap());
        let posts: Vec<_> = doc.element_children(doc.body()).collect();
        (doc, posts[0], posts[1])
    }

    fn decorator() -> Decorator {
        Decorator::new(MarkerStyle::default(), Duration::from_millis(300))
    }

    fn markers(doc: &Document, host: NodeId) -> usize {
        doc.element_children(host)
            .filter(|n| is_marker(doc, *n))
            .count()
    }

    #[test]
    fn decorates_new_post_once() {
        let (mut doc, post, _) = setup();
        let mut timers = Timers::new();
        let dismissed = DismissalSet::new();
        let d = decorator();

        let outcome = d.handle(&mut doc, &dismissed, post, &mut timers).unwrap();
        let Outcome::Decorated(decoration) = outcome else {
            panic!("expected a marker");
        };
        assert_eq!(decoration.resolution.id.as_str(), "pos_1");
        assert_eq!(doc.attr(post, PROCESSED_ATTR), Some("true"));
        assert_eq!(doc.attr(decoration.marker, "title"), Some("Mark as read"));
        assert_eq!(doc.text_content(decoration.marker), "\u{2713}");
        assert_eq!(doc.computed_position(post), "relative");
        assert!(doc.style_is_important(post, "position"));

        let again = d.handle(&mut doc, &dismissed, post, &mut timers).unwrap();
        assert_eq!(again, Outcome::AlreadyProcessed);
        assert_eq!(markers(&doc, post), 1);
    }

    #[test]
    fn leaves_non_static_position_alone() {
        let (mut doc, post, _) = setup();
        doc.set_style(post, "position", "sticky").unwrap();
        let mut timers = Timers::new();
        decorator()
            .handle(&mut doc, &DismissalSet::new(), post, &mut timers)
            .unwrap();
        assert_eq!(doc.computed_position(post), "sticky");
        assert!(!doc.style_is_important(post, "position"));
    }

    #[test]
    fn retires_trusted_dismissed_post_without_marker() {
        let (mut doc, post, _) = setup();
        doc.set_attr(post, "aria-labelledby", "_r_9a_").unwrap();
        let mut dismissed = DismissalSet::new();
        dismissed.insert(PostId::new("_r_9a_"));
        let mut timers = Timers::new();

        let outcome = decorator()
            .handle(&mut doc, &dismissed, post, &mut timers)
            .unwrap();
        assert!(matches!(outcome, Outcome::Retired(_)));
        assert_eq!(markers(&doc, post), 0);
        assert_eq!(doc.style(post, "opacity"), Some("0"));
        assert_eq!(
            timers.pop_due(Duration::from_secs(1)).map(|(_, t)| t),
            Some(Task::FinishRetire(post))
        );
        assert_eq!(timers.now(), Duration::from_millis(300));
    }

    #[test]
    fn fallback_id_in_corrupted_set_is_not_retired() {
        let (mut doc, post, _) = setup();
        let kv = MemoryStore::with_value(DISMISSED_KEY, json!(["pos_1"]));
        let dismissed = DismissalSet::read(&kv).unwrap();
        assert!(dismissed.contains(&PostId::new("pos_1")));
        let mut timers = Timers::new();

        let outcome = decorator()
            .handle(&mut doc, &dismissed, post, &mut timers)
            .unwrap();
        assert!(matches!(outcome, Outcome::Decorated(_)));
        assert_eq!(doc.style(post, "opacity"), None);
        assert!(timers.is_empty());
    }

    #[test]
    fn activation_commits_only_trusted_ids() {
        let (mut doc, _, anon) = setup();
        let kv = MemoryStore::new();
        let mut dismissed = DismissalSet::new();
        let mut timers = Timers::new();
        let d = decorator();

        let Outcome::Decorated(decoration) =
            d.handle(&mut doc, &dismissed, anon, &mut timers).unwrap()
        else {
            panic!("expected a marker");
        };
        assert_eq!(decoration.resolution.trust(), Trust::Fallback);
        d.activate(&mut doc, &mut dismissed, &kv, &decoration, &mut timers)
            .unwrap();
        assert!(dismissed.is_empty());
        assert_eq!(kv.snapshot(DISMISSED_KEY), None);
        assert_eq!(doc.style(anon, "opacity"), Some("0"));
        assert!(!doc.is_connected(decoration.marker));
    }

    #[test]
    fn activation_persists_trusted_id() {
        let (mut doc, post, _) = setup();
        doc.set_attr(post, "aria-labelledby", "_r_9a_").unwrap();
        let kv = MemoryStore::new();
        let mut dismissed = DismissalSet::new();
        let mut timers = Timers::new();
        let d = decorator();

        let Outcome::Decorated(decoration) =
            d.handle(&mut doc, &dismissed, post, &mut timers).unwrap()
        else {
            panic!("expected a marker");
        };
        d.activate(&mut doc, &mut dismissed, &kv, &decoration, &mut timers)
            .unwrap();
        assert_eq!(kv.snapshot(DISMISSED_KEY), Some(json!(["_r_9a_"])));
    }

    #[test]
    fn storage_failure_still_retires() {
        let (mut doc, post, _) = setup();
        doc.set_attr(post, "aria-labelledby", "_r_9a_").unwrap();
        let kv = MemoryStore::new();
        kv.fail_writes(true);
        let mut dismissed = DismissalSet::new();
        let mut timers = Timers::new();
        let d = decorator();

        let Outcome::Decorated(decoration) =
            d.handle(&mut doc, &dismissed, post, &mut timers).unwrap()
        else {
            panic!("expected a marker");
        };
        d.activate(&mut doc, &mut dismissed, &kv, &decoration, &mut timers)
            .unwrap();
        assert_eq!(dismissed.len(), 1);
        assert_eq!(doc.style(post, "opacity"), Some("0"));
    }

    #[test]
    fn detached_post_is_marked_and_reported() {
        let (mut doc, post, _) = setup();
        doc.remove(post).unwrap();
        let mut timers = Timers::new();
        let err = decorator()
            .handle(&mut doc, &DismissalSet::new(), post, &mut timers)
            .unwrap_err();
        assert!(matches!(err, DecorateError::Disconnected(_)));
        assert!(doc.has_attr(post, PROCESSED_ATTR));
    }

    #[test]
    fn strip_and_restore_revert_page_changes() {
        let (mut doc, post, anon) = setup();
        let mut timers = Timers::new();
        let d = decorator();
        d.handle(&mut doc, &DismissalSet::new(), post, &mut timers)
            .unwrap();
        d.handle(&mut doc, &DismissalSet::new(), anon, &mut timers)
            .unwrap();
        d.retire(&mut doc, anon, &mut timers).unwrap();
        finish_retire(&mut doc, anon);

        assert_eq!(strip(&mut doc), 2);
        restore(&mut doc, anon).unwrap();
        assert!(!doc.has_attr(post, PROCESSED_ATTR));
        assert!(!doc.has_attr(anon, PROCESSED_ATTR));
        assert_eq!(markers(&doc, post), 0);
        assert_eq!(doc.style(anon, "display"), None);
        assert_eq!(doc.style(anon, "opacity"), None);
    }
}
