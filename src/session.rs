use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::background;
use crate::config::Config;
use crate::decorate::{self, DecorateError, Decoration, Decorator, MarkerStyle, Outcome};
use crate::dismissals::DismissalSet;
use crate::dom::{Document, NodeId};
use crate::identity::{self, PostId, Resolution, Trust};
use crate::messages::{MessageError, Request, Response};
use crate::scanner::FeedScanner;
use crate::scheduler::{Task, TimerId, Timers};
use crate::storage::KeyValueStore;
use crate::watcher::MutationWatcher;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no active session")]
    NotRunning,
    #[error("marker {0} is not attached by this page")]
    UnknownMarker(NodeId),
    #[error(transparent)]
    Decorate(#[from] DecorateError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Loading,
    Observing,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Decorated,
    Retired,
    Failed,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Decorated => "decorated",
            Action::Retired => "retired",
            Action::Failed => "failed",
        }
    }
}

/// One post a scan cycle handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandledPost {
    pub node: NodeId,
    pub resolution: Option<Resolution>,
    pub action: Action,
}

impl HandledPost {
    pub fn id(&self) -> Option<&PostId> {
        self.resolution.as_ref().map(|r| &r.id)
    }

    pub fn trust(&self) -> Option<Trust> {
        self.resolution.as_ref().map(Resolution::trust)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub startup_delay: Duration,
    pub debounce: Duration,
    pub fade_out: Duration,
    pub navigation_settle: Duration,
    pub marker: MarkerStyle,
    pub extra_selectors: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for Settings {
    fn from(cfg: &Config) -> Self {
        Self {
            startup_delay: cfg.timing.startup_delay,
            debounce: cfg.timing.debounce,
            fade_out: cfg.timing.fade_out,
            navigation_settle: cfg.timing.navigation_settle,
            marker: cfg.marker.style(),
            extra_selectors: cfg.scanner.extra_selectors.clone(),
        }
    }
}

/// Per-page instance. Discarded on navigation and rebuilt from storage.
struct Session {
    dismissed: DismissalSet,
    scanner: FeedScanner,
    watcher: MutationWatcher,
    decorator: Decorator,
    startup: Option<TimerId>,
    filters: Value,
    debug_settings: Value,
}

/// Owns the page, the timers and the current session, and routes every
/// event (mutations, timers, clicks, messages) to it.
pub struct Controller {
    doc: Document,
    kv: Arc<dyn KeyValueStore>,
    settings: Settings,
    timers: Timers,
    state: State,
    session: Option<Session>,
    current_url: String,
    reinit: Option<TimerId>,
    decorations: HashMap<NodeId, Decoration>,
    retired: HashSet<NodeId>,
    journal: Vec<HandledPost>,
    scans: usize,
}

impl Controller {
    pub fn new(doc: Document, kv: Arc<dyn KeyValueStore>, settings: Settings) -> Self {
        let current_url = doc.url().to_string();
        Self {
            doc,
            kv,
            settings,
            timers: Timers::new(),
            state: State::Uninitialized,
            session: None,
            current_url,
            reinit: None,
            decorations: HashMap::new(),
            retired: HashSet::new(),
            journal: Vec::new(),
            scans: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    /// Host-side access: render posts, navigate.
    pub fn document_mut(&mut self) -> &mut Document {
        &mut self.doc
    }

    pub fn now(&self) -> Duration {
        self.timers.now()
    }

    pub fn dismissed(&self) -> Option<&DismissalSet> {
        self.session.as_ref().map(|s| &s.dismissed)
    }

    pub fn journal(&self) -> &[HandledPost] {
        &self.journal
    }

    pub fn scan_count(&self) -> usize {
        self.scans
    }

    pub fn pending_debounce(&self) -> Option<TimerId> {
        self.session.as_ref().and_then(|s| s.watcher.pending())
    }

    pub fn filters(&self) -> Option<&Value> {
        self.session.as_ref().map(|s| &s.filters)
    }

    pub fn debug_settings(&self) -> Option<&Value> {
        self.session.as_ref().map(|s| &s.debug_settings)
    }

    /// Marker currently attached to `host`, if any.
    pub fn marker_for(&self, host: NodeId) -> Option<NodeId> {
        self.decorations
            .values()
            .find(|d| d.host == host && self.doc.is_connected(d.marker))
            .map(|d| d.marker)
    }

    pub fn markers(&self) -> Vec<&Decoration> {
        let mut markers: Vec<_> = self.decorations.values().collect();
        markers.sort_by_key(|d| d.marker);
        markers
    }

    pub fn start(&mut self) {
        if self.session.is_some() {
            return;
        }
        info!(url = %self.doc.url(), "initializing");
        self.set_state(State::Loading);

        let mut dismissed = DismissalSet::new();
        dismissed.reload(self.kv.as_ref());

        let mut watcher = MutationWatcher::new(self.settings.debounce);
        watcher.observe();
        let startup = self
            .timers
            .schedule(self.settings.startup_delay, Task::StartupScan);

        self.session = Some(Session {
            dismissed,
            scanner: FeedScanner::new(&self.settings.extra_selectors),
            watcher,
            decorator: Decorator::new(self.settings.marker.clone(), self.settings.fade_out),
            startup: Some(startup),
            filters: Value::Null,
            debug_settings: Value::Null,
        });
        self.current_url = self.doc.url().to_string();
        self.set_state(State::Observing);
    }

    /// Teardown: disconnects the observer and cancels every pending timer the
    /// session owns.
    pub fn stop(&mut self) {
        if let Some(reinit) = self.reinit.take() {
            self.timers.cancel(reinit);
        }
        self.teardown_session();
    }

    /// Runs the event loop for `by` of virtual time.
    pub fn advance(&mut self, by: Duration) {
        let until = self.timers.now() + by;
        loop {
            self.pump();
            match self.timers.pop_due(until) {
                Some((id, task)) => self.dispatch(id, task),
                None => break,
            }
        }
        self.timers.advance_to(until);
    }

    /// Runs until no timer is left.
    pub fn run_until_idle(&mut self) {
        loop {
            self.pump();
            let Some(deadline) = self.timers.next_deadline() else {
                break;
            };
            let by = deadline.saturating_sub(self.timers.now());
            self.advance(by);
        }
    }

    /// Delivers pending page mutations to the URL check and the watcher.
    pub fn pump(&mut self) {
        let records = self.doc.take_mutations();
        if self.doc.url() != self.current_url {
            self.on_navigation();
        }
        if records.is_empty() {
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.watcher.on_mutations(
                &self.doc,
                &session.scanner,
                &records,
                &mut self.timers,
            );
        }
    }

    /// One scan cycle right now. Returns how many posts were handled.
    pub fn scan(&mut self) -> usize {
        let Some(session) = self.session.as_mut() else {
            return 0;
        };
        if !session.watcher.begin_scan() {
            debug!("scan already in flight");
            return 0;
        }
        self.scans += 1;

        let candidates = session.scanner.scan(&self.doc);
        info!(count = candidates.len(), "found feed items");
        let mut handled = 0;
        for node in candidates {
            let entry = match session.decorator.handle(
                &mut self.doc,
                &session.dismissed,
                node,
                &mut self.timers,
            ) {
                Ok(Outcome::AlreadyProcessed) => continue,
                Ok(Outcome::Retired(resolution)) => {
                    self.retired.insert(node);
                    HandledPost {
                        node,
                        resolution: Some(resolution),
                        action: Action::Retired,
                    }
                }
                Ok(Outcome::Decorated(decoration)) => {
                    let resolution = decoration.resolution.clone();
                    self.decorations.insert(decoration.marker, decoration);
                    HandledPost {
                        node,
                        resolution: Some(resolution),
                        action: Action::Decorated,
                    }
                }
                Err(err) => {
                    warn!(%node, error = %err, "error processing feed item");
                    HandledPost {
                        node,
                        resolution: None,
                        action: Action::Failed,
                    }
                }
            };
            handled += 1;
            self.journal.push(entry);
        }

        // Our own marker insertions land while the guard is held and are
        // dropped like any other in-flight batch.
        let own = self.doc.take_mutations();
        session
            .watcher
            .on_mutations(&self.doc, &session.scanner, &own, &mut self.timers);
        session.watcher.end_scan();
        handled
    }

    /// Marker activation.
    pub fn click(&mut self, marker: NodeId) -> Result<(), SessionError> {
        let session = self.session.as_mut().ok_or(SessionError::NotRunning)?;
        let decoration = self
            .decorations
            .remove(&marker)
            .ok_or(SessionError::UnknownMarker(marker))?;
        session.decorator.activate(
            &mut self.doc,
            &mut session.dismissed,
            self.kv.as_ref(),
            &decoration,
            &mut self.timers,
        )?;
        self.retired.insert(decoration.host);
        Ok(())
    }

    /// Reloads dismissals and re-handles every post from scratch.
    pub fn refresh(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.dismissed.reload(self.kv.as_ref());

        let removed = decorate::strip(&mut self.doc);
        self.decorations.clear();

        // Posts that stay dismissed keep their overrides so they do not
        // flash back in before the rescan retires them again.
        let doc = &mut self.doc;
        let dismissed = &session.dismissed;
        self.retired.retain(|node| {
            let resolution = identity::resolve(doc, *node);
            if resolution.trust() == Trust::Trusted && dismissed.contains(&resolution.id) {
                return true;
            }
            if let Err(err) = decorate::restore(doc, *node) {
                warn!(%node, error = %err, "could not restore post");
            }
            false
        });
        info!(removed, "refreshing feed");
        self.scan();
    }

    pub fn deliver(&mut self, request: Request) -> Result<Option<Response>, MessageError> {
        let Some(session) = self.session.as_mut() else {
            let err = MessageError::NotReady;
            warn!(?request, status = err.status(), "message arrived with no active session");
            return Err(err);
        };
        match request {
            Request::Refresh => {
                self.refresh();
                Ok(Some(Response::success()))
            }
            Request::UpdateFilters { filters } => {
                debug!(%filters, "filters updated");
                session.filters = filters;
                Ok(None)
            }
            Request::UpdateDebugSettings { debug_settings } => {
                debug!(%debug_settings, "debug settings updated");
                session.debug_settings = debug_settings;
                Ok(None)
            }
            Request::GetCheckedItemsCount | Request::ClearCheckedItems => {
                background::handle(self.kv.as_ref(), &request).map_err(MessageError::Storage)
            }
        }
    }

    fn dispatch(&mut self, id: TimerId, task: Task) {
        match task {
            Task::StartupScan => {
                let current = self
                    .session
                    .as_mut()
                    .is_some_and(|s| s.startup.take() == Some(id));
                if current {
                    self.scan();
                }
            }
            Task::DebouncedScan => {
                if let Some(session) = self.session.as_mut() {
                    session.watcher.timer_fired(id);
                    self.scan();
                }
            }
            Task::FinishRetire(node) => {
                if self.retired.contains(&node) {
                    decorate::finish_retire(&mut self.doc, node);
                }
            }
            Task::Reinitialize => {
                if self.reinit == Some(id) {
                    self.reinit = None;
                    self.start();
                }
            }
        }
    }

    fn on_navigation(&mut self) {
        info!(from = %self.current_url, to = %self.doc.url(), "URL changed, reinitializing");
        self.current_url = self.doc.url().to_string();
        self.teardown_session();
        if let Some(previous) = self.reinit.take() {
            self.timers.cancel(previous);
        }
        self.reinit = Some(
            self.timers
                .schedule(self.settings.navigation_settle, Task::Reinitialize),
        );
    }

    fn teardown_session(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.watcher.disconnect(&mut self.timers);
        if let Some(startup) = session.startup.take() {
            self.timers.cancel(startup);
        }
        self.set_state(State::Stopped);
    }

    fn set_state(&mut self, next: State) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "session state");
            self.state = next;
        }
    }
}
