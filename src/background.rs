use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use crate::messages::{Request, Response};
use crate::storage::{KeyValueStore, DISMISSED_KEY};

/// Number of entries in the persisted list, counted as stored.
pub fn dismissed_count(kv: &dyn KeyValueStore) -> Result<usize> {
    let stored = kv
        .get(DISMISSED_KEY)
        .context("background: count dismissed posts")?;
    Ok(match stored {
        Some(Value::Array(items)) => items.len(),
        None | Some(Value::Null) => 0,
        Some(other) => {
            warn!(value = %other, "dismissed posts are not stored as a list");
            0
        }
    })
}

/// Forgets every dismissed post. Pages show them again on their next refresh.
pub fn clear_dismissed(kv: &dyn KeyValueStore) -> Result<()> {
    kv.remove(DISMISSED_KEY)
        .context("background: clear dismissed posts")?;
    info!("cleared dismissed posts");
    Ok(())
}

/// Answers the requests the background worker owns; anything else is not
/// ours and gets no reply.
pub fn handle(kv: &dyn KeyValueStore, request: &Request) -> Result<Option<Response>> {
    match request {
        Request::GetCheckedItemsCount => Ok(Some(Response::Count {
            count: dismissed_count(kv)?,
        })),
        Request::ClearCheckedItems => {
            clear_dismissed(kv)?;
            Ok(Some(Response::success()))
        }
        _ => Ok(None),
    }
}
