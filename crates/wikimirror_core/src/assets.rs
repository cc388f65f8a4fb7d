use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::reconcile::prune_empty_directories;
use crate::store::{Asset, ContentStore};
use crate::vcs::{CommitRequest, VersionControl};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetReport {
    pub folders: usize,
    pub downloaded: usize,
    pub current: usize,
    pub deleted: usize,
    pub request_count: usize,
}

/// Bring `asset_root` in line with the remote asset tree: download assets whose
/// remote update time differs from the local mtime, delete local files the
/// store no longer lists.
pub fn mirror_assets_with<S: ContentStore>(store: &mut S, asset_root: &Path) -> Result<AssetReport> {
    fs::create_dir_all(asset_root)
        .with_context(|| format!("failed to create {}", asset_root.display()))?;
    let mut leftovers = local_files(asset_root)?;
    let mut report = AssetReport::default();

    mirror_folder(store, asset_root, 0, &mut Vec::new(), &mut leftovers, &mut report)?;

    for stale in leftovers {
        fs::remove_file(&stale).with_context(|| format!("failed to delete {}", stale.display()))?;
        tracing::info!(file = %stale.display(), "deleted asset no longer present remotely");
        report.deleted += 1;
    }
    prune_empty_directories(asset_root)?;
    report.request_count = store.request_count();
    Ok(report)
}

fn mirror_folder<S: ContentStore>(
    store: &mut S,
    asset_root: &Path,
    folder_id: i64,
    stack: &mut Vec<String>,
    leftovers: &mut BTreeSet<PathBuf>,
    report: &mut AssetReport,
) -> Result<()> {
    report.folders += 1;
    let assets = store
        .list_assets(folder_id)
        .with_context(|| format!("failed to list assets of /{}", stack.join("/")))?;
    for asset in assets {
        let remote_path = remote_path(stack, &asset.filename);
        let local = local_path(asset_root, stack, &asset.filename)?;
        leftovers.remove(&local);
        if is_current(&local, &asset)? {
            report.current += 1;
            continue;
        }
        let bytes = store
            .fetch_asset_bytes(&remote_path)
            .with_context(|| format!("failed to download asset {remote_path}"))?;
        write_asset(&local, &bytes, asset.updated_at)?;
        tracing::info!(asset = %remote_path, bytes = bytes.len(), "downloaded asset");
        report.downloaded += 1;
    }

    let folders = store
        .list_asset_folders(folder_id)
        .with_context(|| format!("failed to list asset folders of /{}", stack.join("/")))?;
    for folder in folders {
        check_segment(&folder.name)?;
        stack.push(folder.name);
        mirror_folder(store, asset_root, folder.id, stack, leftovers, report)?;
        stack.pop();
    }
    Ok(())
}

/// Commit whatever the asset pass changed under `asset_root`.
pub fn commit_assets<V: VersionControl>(vcs: &mut V, asset_root: &Path, date: DateTime<Utc>) -> Result<bool> {
    if !asset_root.exists() {
        return Ok(false);
    }
    vcs.add(asset_root)?;
    if !vcs.has_staged_changes()? {
        return Ok(false);
    }
    vcs.commit(&CommitRequest::new("update assets", date))?;
    Ok(true)
}

fn remote_path(stack: &[String], filename: &str) -> String {
    stack
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(filename))
        .collect::<Vec<_>>()
        .join("/")
}

fn local_path(asset_root: &Path, stack: &[String], filename: &str) -> Result<PathBuf> {
    check_segment(filename)?;
    let mut path = asset_root.to_path_buf();
    path.extend(stack);
    path.push(filename);
    Ok(path)
}

fn check_segment(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        bail!("asset name {name:?} cannot be mirrored");
    }
    Ok(())
}

fn local_files(asset_root: &Path) -> Result<BTreeSet<PathBuf>> {
    let mut files = BTreeSet::new();
    for entry in WalkDir::new(asset_root) {
        let entry = entry.with_context(|| format!("failed to scan {}", asset_root.display()))?;
        if entry.file_type().is_file() {
            files.insert(entry.into_path());
        }
    }
    Ok(files)
}

/// Timestamp equality at second resolution is the only change signal.
fn is_current(local: &Path, asset: &Asset) -> Result<bool> {
    if !local.is_file() {
        return Ok(false);
    }
    let modified = fs::metadata(local)
        .and_then(|metadata| metadata.modified())
        .with_context(|| format!("failed to read mtime of {}", local.display()))?;
    Ok(DateTime::<Utc>::from(modified).timestamp() == asset.updated_at.timestamp())
}

fn write_asset(local: &Path, bytes: &[u8], updated_at: DateTime<Utc>) -> Result<()> {
    if let Some(parent) = local.parent() {
        fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(local, bytes).with_context(|| format!("failed to write {}", local.display()))?;
    File::options()
        .write(true)
        .open(local)
        .and_then(|file| file.set_modified(SystemTime::from(updated_at)))
        .with_context(|| format!("failed to set mtime of {}", local.display()))
}
