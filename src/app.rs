use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::background;
use crate::config::Config;
use crate::dom::{Document, PageSnapshot};
use crate::session::{Controller, HandledPost, Settings};
use crate::storage::{self, KeyValueStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Replay a page snapshot, optionally clicking the markers of `dismiss`.
    Scan { page: PathBuf, dismiss: Vec<String> },
    Count,
    Clear,
}

pub fn run(cfg: &Config, command: Command) -> Result<()> {
    let store: Arc<dyn KeyValueStore> = Arc::new(
        storage::Store::open(storage::Options {
            path: cfg.storage.path.clone(),
        })
        .context("open storage")?,
    );

    match command {
        Command::Scan { page, dismiss } => {
            for line in scan_page(cfg, store, &page, &dismiss)? {
                println!("{line}");
            }
        }
        Command::Count => {
            println!("{}", background::dismissed_count(store.as_ref())?);
        }
        Command::Clear => {
            background::clear_dismissed(store.as_ref())?;
            println!("cleared");
        }
    }
    Ok(())
}

/// Loads the page, lets the controller settle, then clicks the marker of
/// every id in `dismiss`. Returns one report line per handled post.
pub fn scan_page(
    cfg: &Config,
    store: Arc<dyn KeyValueStore>,
    page: &Path,
    dismiss: &[String],
) -> Result<Vec<String>> {
    let snapshot = PageSnapshot::load(page)?;
    let mut controller = Controller::new(
        Document::from_snapshot(&snapshot),
        store,
        Settings::from(cfg),
    );
    controller.start();
    controller.run_until_idle();

    let mut lines: Vec<String> = controller.journal().iter().map(report_line).collect();

    for id in dismiss {
        let Some(decoration) = controller
            .markers()
            .into_iter()
            .find(|d| d.resolution.id.as_str() == id.as_str())
            .cloned()
        else {
            bail!("no marked post with id {id} on {}", page.display());
        };
        controller.click(decoration.marker)?;
        lines.push(format!(
            "dismissed\t{}\t{}",
            decoration.resolution.trust().as_str(),
            decoration.resolution.id
        ));
    }
    controller.run_until_idle();
    controller.stop();
    info!(handled = controller.journal().len(), "page replay finished");
    Ok(lines)
}

pub fn report_line(post: &HandledPost) -> String {
    match post.resolution.as_ref() {
        Some(resolution) => format!(
            "{}\t{}\t{}",
            post.action.as_str(),
            resolution.trust().as_str(),
            resolution.id
        ),
        None => format!("{}\t-\t{}", post.action.as_str(), post.node),
    }
}
