use anyhow::{Context, Result};
use indexmap::IndexSet;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::identity::{PostId, Trust};
use crate::storage::{KeyValueStore, DISMISSED_KEY};

/// Ids of posts the user dismissed, in dismissal order.
///
/// Only trusted ids are ever committed. Entries written by older builds that
/// fail classification are purged on load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DismissalSet {
    ids: IndexSet<PostId>,
}

impl DismissalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &PostId) -> bool {
        self.ids.contains(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PostId> {
        self.ids.iter()
    }

    /// Adds a trusted id. Fallback ids are refused and `false` is returned.
    pub fn insert(&mut self, id: PostId) -> bool {
        if id.trust() != Trust::Trusted {
            return false;
        }
        self.ids.insert(id)
    }

    /// Drops every entry that does not classify as trusted and returns them.
    pub fn purge_untrusted(&mut self) -> Vec<PostId> {
        let mut removed = Vec::new();
        self.ids.retain(|id| {
            let keep = id.is_trusted();
            if !keep {
                removed.push(id.clone());
            }
            keep
        });
        removed
    }

    /// Reads the persisted list. A missing key is an empty set.
    pub fn read(kv: &dyn KeyValueStore) -> Result<Self> {
        let Some(value) = kv.get(DISMISSED_KEY).context("dismissals: read")? else {
            return Ok(Self::default());
        };
        let ids = match value {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(PostId::new(s)),
                    other => {
                        debug!(entry = %other, "dismissals: skipping non-string entry");
                        None
                    }
                })
                .collect(),
            Value::Null => IndexSet::new(),
            other => anyhow::bail!("dismissals: expected a list, found {other}"),
        };
        Ok(Self { ids })
    }

    pub fn persist(&self, kv: &dyn KeyValueStore) -> Result<()> {
        let list = self
            .ids
            .iter()
            .map(|id| Value::String(id.as_str().to_string()))
            .collect();
        kv.set(DISMISSED_KEY, Value::Array(list))
            .context("dismissals: write")
    }

    /// Loads from storage and purges invalid entries, re-persisting when any
    /// were removed. On a read failure the current set is kept.
    pub fn reload(&mut self, kv: &dyn KeyValueStore) {
        match Self::read(kv) {
            Ok(loaded) => {
                *self = loaded;
                info!(count = self.len(), "loaded dismissed posts");
            }
            Err(err) => {
                warn!(error = ?err, "keeping in-memory dismissals after read failure");
            }
        }

        let removed = self.purge_untrusted();
        if removed.is_empty() {
            return;
        }
        for id in &removed {
            info!(%id, "removing invalid dismissed id");
        }
        info!(count = removed.len(), "cleaned up invalid dismissed ids");
        if let Err(err) = self.persist(kv) {
            warn!(error = ?err, "failed to persist cleaned dismissals");
        }
    }
}
