use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use feedmark::decorate;
use feedmark::dom::{Document, NodeId, NodeSnapshot, PageSnapshot};
use feedmark::identity::Trust;
use feedmark::messages::{MessageError, Request, Response};
use feedmark::scanner::PROCESSED_ATTR;
use feedmark::selector::Selector;
use feedmark::session::{Action, Controller, Settings, State};
use feedmark::storage::{self, KeyValueStore, MemoryStore, Store, DISMISSED_KEY};
use serde_json::json;
use tempfile::tempdir;

const FIXTURE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/feed.yaml");

fn page() -> Document {
    let snapshot = PageSnapshot::load(Path::new(FIXTURE)).expect("fixture loads");
    Document::from_snapshot(&snapshot)
}

fn visit(kv: Arc<dyn KeyValueStore>) -> Controller {
    let mut controller = Controller::new(page(), kv, Settings::default());
    controller.start();
    controller.advance(Duration::from_secs(2));
    controller
}

fn host_of(controller: &Controller, id: &str) -> NodeId {
    controller
        .journal()
        .iter()
        .find(|post| post.id().is_some_and(|p| p.as_str() == id))
        .map(|post| post.node)
        .unwrap_or_else(|| panic!("{id} was not handled"))
}

fn feed_node(doc: &Document) -> NodeId {
    let feed = Selector::parse(r#"[role="feed"]"#).unwrap();
    doc.query_all(&feed)[0]
}

fn sqlite(dir: &Path) -> Arc<Store> {
    Arc::new(
        Store::open(storage::Options {
            path: Some(dir.join("state.db")),
        })
        .unwrap(),
    )
}

#[test]
fn first_visit_marks_every_rendered_post() {
    let controller = visit(Arc::new(MemoryStore::new()));

    let ids: Vec<_> = controller
        .journal()
        .iter()
        .map(|post| post.id().unwrap().to_string())
        .collect();
    assert_eq!(
        ids,
        [
            "FeedUnit_4",
            "https://www.facebook.com/alice/posts/pfbid02abc",
            "_r_3k_",
            "pos_2",
        ]
    );
    let trusts: Vec<_> = controller.journal().iter().map(|p| p.trust()).collect();
    assert_eq!(
        trusts,
        [
            Some(Trust::Fallback),
            Some(Trust::Trusted),
            Some(Trust::Trusted),
            Some(Trust::Fallback),
        ]
    );
    assert_eq!(controller.markers().len(), 4);

    let doc = controller.document();
    let skeleton = doc
        .descendants(doc.root())
        .into_iter()
        .find(|n| doc.attr(*n, "aria-label") == Some("Loading..."))
        .unwrap();
    assert!(!doc.has_attr(skeleton, PROCESSED_ATTR));
    assert!(controller.marker_for(skeleton).is_none());
}

#[test]
fn trusted_dismissal_persists_across_visits() {
    let dir = tempdir().unwrap();
    let store = sqlite(dir.path());

    let mut first = visit(store.clone());
    let host = host_of(&first, "_r_3k_");
    first.click(first.marker_for(host).unwrap()).unwrap();
    assert_eq!(first.document().style(host, "opacity"), Some("0"));
    first.advance(Duration::from_millis(300));
    assert_eq!(first.document().style(host, "display"), Some("none"));
    assert!(first.document().is_connected(host));
    first.stop();

    assert_eq!(store.get(DISMISSED_KEY).unwrap(), Some(json!(["_r_3k_"])));

    let second = visit(store);
    let host = host_of(&second, "_r_3k_");
    let entry = second.journal().iter().find(|p| p.node == host).unwrap();
    assert_eq!(entry.action, Action::Retired);
    assert!(second.marker_for(host).is_none());
}

#[test]
fn fallback_dismissal_only_hides_for_this_visit() {
    let store = Arc::new(MemoryStore::new());

    let mut first = visit(store.clone());
    let host = host_of(&first, "pos_2");
    first.click(first.marker_for(host).unwrap()).unwrap();
    first.advance(Duration::from_millis(300));
    assert_eq!(first.document().style(host, "display"), Some("none"));
    assert_eq!(store.snapshot(DISMISSED_KEY), None);

    let second = visit(store);
    let host = host_of(&second, "pos_2");
    assert!(second.marker_for(host).is_some());
}

#[test]
fn legacy_fallback_ids_are_purged_on_load() {
    let store = Arc::new(MemoryStore::with_value(
        DISMISSED_KEY,
        json!(["item_0_12", "_r_3k_", "FeedUnit_7"]),
    ));
    let controller = visit(store.clone());
    assert_eq!(controller.dismissed().unwrap().len(), 1);
    assert_eq!(store.snapshot(DISMISSED_KEY), Some(json!(["_r_3k_"])));
}

#[test]
fn infinite_scroll_batches_collapse_into_one_scan() {
    let mut controller = visit(Arc::new(MemoryStore::new()));
    assert_eq!(controller.scan_count(), 1);
    let feed = feed_node(controller.document());

    for n in 10..16 {
        let post = NodeSnapshot {
            attrs: [
                ("role".to_string(), "article".to_string()),
                ("aria-posinset".to_string(), n.to_string()),
                ("aria-labelledby".to_string(), format!("_r_{n}x_")),
            ]
            .into_iter()
            .collect(),
            ..NodeSnapshot::default()
        };
        controller.document_mut().insert_snapshot(feed, &post).unwrap();
        controller.advance(Duration::from_millis(100));
    }
    assert_eq!(controller.scan_count(), 1);
    controller.advance(Duration::from_millis(500));
    assert_eq!(controller.scan_count(), 2);
    assert_eq!(controller.journal().len(), 10);
    assert_eq!(controller.journal()[4].id().unwrap().as_str(), "_r_10x_");
}

#[test]
fn skeleton_is_handled_once_it_renders() {
    let mut controller = visit(Arc::new(MemoryStore::new()));
    let doc = controller.document_mut();
    let skeleton = doc
        .descendants(doc.root())
        .into_iter()
        .find(|n| doc.attr(*n, "aria-label") == Some("Loading..."))
        .unwrap();
    doc.remove_attr(skeleton, "aria-label").unwrap();
    let link = doc.create_element("a");
    doc.set_attr(link, "href", "/bob/posts/pfbid09xyz").unwrap();
    doc.append_child(skeleton, link).unwrap();

    controller.advance(Duration::from_millis(500));
    let last = controller.journal().last().unwrap();
    assert_eq!(last.node, skeleton);
    assert_eq!(last.id().unwrap().as_str(), "pos_3");
}

#[test]
fn navigation_reinitializes_after_settle() {
    let store = Arc::new(MemoryStore::new());
    let mut controller = visit(store.clone());
    let host = host_of(&controller, "_r_3k_");
    let marker = controller.marker_for(host).unwrap();

    controller
        .document_mut()
        .navigate("https://www.facebook.com/groups/feed/");
    controller.advance(Duration::from_millis(1));
    assert_eq!(controller.state(), State::Stopped);
    assert!(matches!(
        controller.deliver(Request::Refresh),
        Err(MessageError::NotReady)
    ));

    controller.advance(Duration::from_secs(1));
    assert_eq!(controller.state(), State::Observing);

    // Markers from before the navigation still work on the new session.
    controller.click(marker).unwrap();
    assert_eq!(store.snapshot(DISMISSED_KEY), Some(json!(["_r_3k_"])));
}

#[test]
fn clear_then_refresh_restores_hidden_posts() {
    let store = Arc::new(MemoryStore::new());
    let mut controller = visit(store.clone());
    let host = host_of(&controller, "_r_3k_");
    controller.click(controller.marker_for(host).unwrap()).unwrap();
    controller.advance(Duration::from_millis(300));

    assert_eq!(
        controller.deliver(Request::GetCheckedItemsCount).unwrap(),
        Some(Response::Count { count: 1 })
    );
    assert_eq!(
        controller.deliver(Request::ClearCheckedItems).unwrap(),
        Some(Response::success())
    );
    assert_eq!(
        controller.deliver(Request::Refresh).unwrap(),
        Some(Response::success())
    );

    let doc = controller.document();
    assert_eq!(doc.style(host, "display"), None);
    assert_eq!(doc.style(host, "opacity"), None);
    assert!(controller.marker_for(host).is_some());
    let markers = doc
        .descendants(doc.root())
        .into_iter()
        .filter(|n| decorate::is_marker(doc, *n))
        .count();
    assert_eq!(markers, 4);
}

#[test]
fn storage_outage_leaves_page_usable() {
    let store = Arc::new(MemoryStore::new());
    store.fail_reads(true);
    store.fail_writes(true);
    let mut controller = visit(store.clone());
    assert!(controller.dismissed().unwrap().is_empty());

    let host = host_of(&controller, "_r_3k_");
    controller.click(controller.marker_for(host).unwrap()).unwrap();
    controller.advance(Duration::from_millis(300));
    assert_eq!(controller.document().style(host, "display"), Some("none"));
    assert!(controller
        .dismissed()
        .unwrap()
        .contains(&"_r_3k_".into()));
}
