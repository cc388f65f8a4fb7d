use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::error::MirrorError;
use crate::history::{HistoryChain, Transition, TransitionKind};
use crate::page_file::{file_path, snapshot_file_path, write_snapshot};
use crate::store::ContentStore;
use crate::tree::TreeIndex;
use crate::vcs::{CommitRequest, VersionControl};
use crate::watermark::{WatermarkRecord, WatermarkStore, merge_records, watermark_of};

/// Commit trailer naming the transition a commit replays.
pub const TRANSITION_TRAILER: &str = "Wiki-Transition";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Watermark file name, relative to the mirror root.
    pub watermark_file: PathBuf,
    pub collation_locale: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Bootstrap,
    Resume,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub mode: RunMode,
    pub pages: usize,
    pub transitions: usize,
    pub commits: usize,
    pub created: usize,
    pub edits: usize,
    pub metadata_edits: usize,
    pub moves: usize,
    pub ghosts: usize,
    /// Transitions whose effect was already in the working tree.
    pub already_applied: usize,
    pub previous_watermark: Option<DateTime<Utc>>,
    pub watermark: Option<DateTime<Utc>>,
    pub pruned_directories: usize,
    /// Live pages whose mirrored file is absent after the run.
    pub missing_files: Vec<PathBuf>,
    pub request_count: usize,
}

/// Replay every unseen page transition as a commit in the working tree of `vcs`.
///
/// The watermark is written last: a run that fails midway leaves it untouched
/// and the next run replays from the previous point.
pub fn reconcile_with<S: ContentStore, V: VersionControl>(
    store: &mut S,
    vcs: &mut V,
    options: &ReconcileOptions,
    mut progress: Option<&mut dyn FnMut(u8)>,
) -> Result<ReconcileReport> {
    let root = vcs.root().to_path_buf();
    let watermark_store = WatermarkStore::new(root.join(&options.watermark_file));

    let (mode, existing) = match watermark_store.load()? {
        None => {
            if !vcs.is_repository() {
                tracing::info!(root = %root.display(), "initializing mirror repository");
                vcs.init()?;
            }
            (RunMode::Bootstrap, Vec::new())
        }
        Some(records) => {
            if !vcs.is_repository() {
                return Err(MirrorError::RepositoryMissing { root }.into());
            }
            (RunMode::Resume, records)
        }
    };
    let previous_watermark = watermark_of(&existing);
    if let Some(watermark) = previous_watermark {
        tracing::info!(%watermark, "resuming after watermark");
    }
    // Commits made by a run that stopped before saving the watermark.
    let committed_keys = vcs.trailer_values(TRANSITION_TRAILER)?;

    let pages = store.list_pages().context("failed to list pages")?;
    let tree = TreeIndex::<PathBuf>::new(&options.collation_locale)?;
    let mut report = ReconcileReport {
        mode,
        pages: pages.len(),
        transitions: 0,
        commits: 0,
        created: 0,
        edits: 0,
        metadata_edits: 0,
        moves: 0,
        ghosts: 0,
        already_applied: 0,
        previous_watermark,
        watermark: previous_watermark,
        pruned_directories: 0,
        missing_files: Vec::new(),
        request_count: 0,
    };
    let mut ticker = ProgressTicker::new(pages.len());
    let mut replayed = Vec::new();

    for (index, page) in pages.into_iter().enumerate() {
        if let Some(callback) = progress.as_deref_mut() {
            ticker.tick(index, callback);
        }
        let key = page.display_key();
        tree.insert(
            &format!("/{}/{}", page.locale, page.path),
            snapshot_file_path(&root, &page)?,
        );

        let history = store
            .page_history(page.id)
            .with_context(|| format!("failed to fetch history of {key}"))?;
        let chain = HistoryChain::build(page, history)?;
        let transitions = chain
            .transitions_after(store, previous_watermark)
            .with_context(|| format!("failed to classify history of {key}"))?;

        for transition in transitions {
            let committed = if committed_keys.contains(&transition.replay_key()) {
                tracing::debug!(page = %transition.display_key(), version = ?transition.version_id, "already committed");
                false
            } else {
                apply_transition(vcs, &root, &transition)?
            };
            report.transitions += 1;
            match transition.kind {
                TransitionKind::Initial => report.created += 1,
                TransitionKind::Edited => report.edits += 1,
                TransitionKind::MetadataEdited => report.metadata_edits += 1,
                TransitionKind::Moved { .. } => report.moves += 1,
                TransitionKind::Ghost => report.ghosts += 1,
            }
            if committed {
                report.commits += 1;
            } else if !transition.is_ghost() {
                report.already_applied += 1;
            }
            replayed.push(WatermarkRecord::from(&transition));
        }
    }
    if let Some(callback) = progress.as_deref_mut() {
        ticker.finish(callback);
    }

    report.pruned_directories = prune_empty_directories(&root)?;
    for node in tree.bound_nodes() {
        if let Some(file) = node.payload()
            && !file.exists()
        {
            tracing::warn!(page = %node.path(), file = %file.display(), "mirrored file is missing");
            report.missing_files.push(file.clone());
        }
    }

    if mode == RunMode::Bootstrap || !replayed.is_empty() {
        let records = merge_records(existing, replayed);
        report.watermark = watermark_of(&records);
        watermark_store.save(&records)?;
    }
    report.request_count = store.request_count();
    tracing::info!(
        pages = report.pages,
        transitions = report.transitions,
        commits = report.commits,
        ghosts = report.ghosts,
        "reconciliation finished"
    );
    Ok(report)
}

/// Apply one transition to the working tree. Returns whether a commit was made.
fn apply_transition<V: VersionControl>(vcs: &mut V, root: &Path, transition: &Transition) -> Result<bool> {
    let key = transition.display_key();
    let snapshot = &transition.snapshot;

    let message = match &transition.kind {
        TransitionKind::Ghost => {
            tracing::debug!(page = %key, version = ?transition.version_id, "no observable change");
            return Ok(false);
        }
        TransitionKind::Initial | TransitionKind::Edited | TransitionKind::MetadataEdited => {
            let written = write_snapshot(root, snapshot, false)
                .with_context(|| format!("failed to mirror {key}"))?;
            vcs.add(written.path())?;
            // A content type change moves the page to another extension.
            let stale = file_path(
                root,
                &transition.locale,
                transition.path(),
                transition.source_content_type(),
            )?;
            if stale != written.path() && stale.exists() {
                vcs.remove(&stale)?;
            }
            let verb = match transition.kind {
                TransitionKind::Initial => "create",
                TransitionKind::MetadataEdited => "update metadata of",
                _ => "update",
            };
            format!("{verb} {key}")
        }
        TransitionKind::Moved {
            from,
            to,
            content_changed,
            metadata_changed,
        } => {
            let locale = &transition.locale;
            let old_file = file_path(root, locale, from, transition.source_content_type())?;
            let new_file = file_path(root, locale, to, &snapshot.content_type)?;
            if old_file.exists() && new_file.exists() {
                tracing::debug!(page = %key, "already relocated, dropping the stale source");
                vcs.remove(&old_file)?;
            } else if old_file.exists() {
                if let Some(parent) = new_file.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("failed to create {}", parent.display()))?;
                }
                vcs.rename(&old_file, &new_file)?;
            } else if new_file.exists() {
                tracing::debug!(page = %key, "already relocated");
            } else {
                return Err(MirrorError::MissingMovedFile {
                    page: format!("{locale}/{from}"),
                    file: old_file,
                }
                .into());
            }
            // The header names the path, so the file is rewritten after every move.
            write_snapshot(root, snapshot, false)
                .with_context(|| format!("failed to mirror {key}"))?;
            vcs.add(&new_file)?;
            let mut message = format!("move {locale}/{from} -> {locale}/{to}");
            if *content_changed || *metadata_changed {
                message.push_str(" and update");
            }
            message
        }
    };

    if !vcs.has_staged_changes()? {
        tracing::debug!(page = %key, "already current");
        return Ok(false);
    }
    let request = CommitRequest::new(message, transition.version_date)
        .with_author(transition.author_name.clone(), transition.author_id)
        .with_trailer(TRANSITION_TRAILER, transition.replay_key());
    vcs.commit(&request)
        .with_context(|| format!("failed to commit {key}"))?;
    tracing::info!(page = %key, kind = transition.kind.label(), date = %transition.version_date, "committed");
    Ok(true)
}

/// Remove directories left empty by moves. The root and `.git` are kept.
pub fn prune_empty_directories(root: &Path) -> Result<usize> {
    if !root.is_dir() {
        return Ok(0);
    }
    let mut directories = Vec::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".git");
    for entry in walker {
        let entry = entry.with_context(|| format!("failed to scan {}", root.display()))?;
        if entry.file_type().is_dir() {
            directories.push(entry.into_path());
        }
    }
    // Deepest first so parents emptied by this pass are removed too.
    directories.sort_by_key(|path| std::cmp::Reverse(path.components().count()));

    let mut removed = 0;
    for directory in directories {
        let is_empty = fs::read_dir(&directory)
            .with_context(|| format!("failed to read {}", directory.display()))?
            .next()
            .is_none();
        if is_empty {
            fs::remove_dir(&directory)
                .with_context(|| format!("failed to remove {}", directory.display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Turns page enumeration into 10% progress steps.
struct ProgressTicker {
    total: usize,
    next_step: u8,
}

impl ProgressTicker {
    fn new(total: usize) -> Self {
        Self { total, next_step: 0 }
    }

    fn tick(&mut self, index: usize, callback: &mut dyn FnMut(u8)) {
        if self.total == 0 {
            return;
        }
        let percent = (index * 100 / self.total).min(100) as u8;
        while self.next_step <= percent && self.next_step < 100 {
            callback(self.next_step);
            self.next_step += 10;
        }
    }

    fn finish(&mut self, callback: &mut dyn FnMut(u8)) {
        if self.next_step <= 100 {
            callback(100);
            self.next_step = 110;
        }
    }
}
