use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::page_file::{WriteOutcome, write_snapshot};
use crate::store::ContentStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pages: usize,
    pub written: Vec<PathBuf>,
    pub current: usize,
    pub request_count: usize,
}

/// Write the live snapshot of every page under `dir`, without history.
///
/// Files whose `updatedAt` header already matches the store are skipped
/// unless `force` is set.
pub fn sync_pages<S: ContentStore>(store: &mut S, dir: &Path, force: bool) -> Result<SyncReport> {
    let pages = store.list_pages().context("failed to list pages")?;
    let mut report = SyncReport {
        pages: pages.len(),
        ..SyncReport::default()
    };

    for page in &pages {
        let outcome = write_snapshot(dir, page, !force)
            .with_context(|| format!("failed to write {}", page.display_key()))?;
        match outcome {
            WriteOutcome::Written(path) => {
                tracing::info!(page = %page.display_key(), file = %path.display(), "wrote page");
                report.written.push(path);
            }
            WriteOutcome::Current(path) => {
                tracing::debug!(file = %path.display(), "page file already current");
                report.current += 1;
            }
        }
    }
    report.request_count = store.request_count();
    Ok(report)
}
