use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use chrono::{DateTime, TimeZone, Utc};
use walkdir::WalkDir;

use crate::store::{
    Asset, AssetFolder, ContentStore, CreatedPage, HistoryEntry, PageSnapshot, PageWriter, StoreError,
    StoreResult,
};
use crate::vcs::{CommitRequest, VersionControl};

/// Noon UTC on the given day of January 2024.
pub(crate) fn date(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0)
        .single()
        .expect("valid test date")
}

pub(crate) fn page(id: i64, path: &str, content: &str, updated_at: DateTime<Utc>) -> PageSnapshot {
    PageSnapshot {
        id,
        path: path.to_string(),
        locale: "fr".to_string(),
        title: format!("Page {id}"),
        description: String::new(),
        content_type: "markdown".to_string(),
        tags: Vec::new(),
        is_published: true,
        is_private: false,
        private_ns: None,
        created_at: Some(date(1)),
        updated_at: Some(updated_at),
        version_id: None,
        version_date: None,
        action: None,
        content: content.to_string(),
    }
}

pub(crate) fn record(version_id: i64, version_date: DateTime<Utc>, action: &str) -> HistoryEntry {
    HistoryEntry {
        version_id,
        version_date,
        author_id: Some(1),
        author_name: Some("admin".to_string()),
        action_type: action.to_string(),
        value_before: None,
        value_after: None,
    }
}

pub(crate) fn asset(id: i64, filename: &str, updated_at: DateTime<Utc>) -> Asset {
    Asset {
        id,
        filename: filename.to_string(),
        ext: filename
            .rsplit_once('.')
            .map(|(_, ext)| format!(".{ext}"))
            .unwrap_or_default(),
        kind: "IMAGE".to_string(),
        mime: "image/png".to_string(),
        file_size: 4,
        created_at: updated_at,
        updated_at,
    }
}

/// In-memory content store.
#[derive(Debug, Default)]
pub(crate) struct MockStore {
    pub pages: Vec<PageSnapshot>,
    pub histories: HashMap<i64, Vec<HistoryEntry>>,
    pub versions: HashMap<(i64, i64), PageSnapshot>,
    pub folders: HashMap<i64, Vec<AssetFolder>>,
    pub assets: HashMap<i64, Vec<Asset>>,
    pub blobs: HashMap<String, Vec<u8>>,
    pub request_count: usize,
    pub version_requests: usize,
    pub downloads: Vec<String>,
    pub unreachable: bool,
    pub created: Vec<PageSnapshot>,
}

impl MockStore {
    /// Register a live page with its trail, newest first.
    pub fn add_page(&mut self, page: PageSnapshot, history: Vec<HistoryEntry>) {
        self.histories.insert(page.id, history);
        self.pages.push(page);
    }

    pub fn add_version(&mut self, mut snapshot: PageSnapshot, version_id: i64) {
        snapshot.version_id = Some(version_id);
        snapshot.version_date = snapshot.updated_at;
        self.versions.insert((snapshot.id, version_id), snapshot);
    }

    pub fn add_folder(&mut self, parent_id: i64, id: i64, name: &str) {
        self.folders.entry(parent_id).or_default().push(AssetFolder {
            id,
            name: name.to_string(),
            slug: name.to_lowercase(),
        });
    }

    pub fn add_asset(&mut self, folder_id: i64, remote_path: &str, asset: Asset, bytes: &[u8]) {
        self.assets.entry(folder_id).or_default().push(asset);
        self.blobs.insert(remote_path.to_string(), bytes.to_vec());
    }

    fn request(&mut self) -> StoreResult<()> {
        self.request_count += 1;
        if self.unreachable {
            return Err(StoreError::Transport {
                endpoint: "mock".to_string(),
                status: Some(503),
                message: "HTTP 503 Service Unavailable".to_string(),
            });
        }
        Ok(())
    }
}

impl ContentStore for MockStore {
    fn list_pages(&mut self) -> StoreResult<Vec<PageSnapshot>> {
        self.request()?;
        Ok(self.pages.clone())
    }

    fn page_history(&mut self, page_id: i64) -> StoreResult<Vec<HistoryEntry>> {
        self.request()?;
        Ok(self.histories.get(&page_id).cloned().unwrap_or_default())
    }

    fn historical_snapshot(&mut self, page_id: i64, version_id: i64) -> StoreResult<PageSnapshot> {
        self.request()?;
        self.version_requests += 1;
        self.versions
            .get(&(page_id, version_id))
            .cloned()
            .ok_or_else(|| StoreError::Application {
                message: format!("version {version_id} of page {page_id} not found"),
            })
    }

    fn list_asset_folders(&mut self, parent_id: i64) -> StoreResult<Vec<AssetFolder>> {
        self.request()?;
        Ok(self.folders.get(&parent_id).cloned().unwrap_or_default())
    }

    fn list_assets(&mut self, folder_id: i64) -> StoreResult<Vec<Asset>> {
        self.request()?;
        Ok(self.assets.get(&folder_id).cloned().unwrap_or_default())
    }

    fn fetch_asset_bytes(&mut self, path: &str) -> StoreResult<Vec<u8>> {
        self.request()?;
        self.downloads.push(path.to_string());
        self.blobs
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::Transport {
                endpoint: path.to_string(),
                status: Some(404),
                message: "HTTP 404 Not Found".to_string(),
            })
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

impl PageWriter for MockStore {
    fn create_page(&mut self, page: &PageSnapshot) -> StoreResult<CreatedPage> {
        self.request()?;
        if self
            .pages
            .iter()
            .any(|live| live.locale == page.locale && live.path == page.path)
        {
            return Err(StoreError::Application {
                message: "Cannot create this page because an entry already exists at the same path. [PageDuplicateCreate/6002]".to_string(),
            });
        }
        let id = self.pages.iter().map(|live| live.id).max().unwrap_or(0) + 1;
        let updated_at = Some(date(28));
        self.pages.push(PageSnapshot {
            id,
            created_at: updated_at,
            updated_at,
            ..page.clone()
        });
        self.created.push(page.clone());
        Ok(CreatedPage { id, updated_at })
    }
}

/// Version control double operating on the real filesystem. It stages by
/// comparing file bytes with the last committed bytes.
#[derive(Debug)]
pub(crate) struct RecordingVcs {
    root: PathBuf,
    committed: BTreeMap<PathBuf, Vec<u8>>,
    staged: BTreeMap<PathBuf, Option<Vec<u8>>>,
    pub renames: Vec<(PathBuf, PathBuf)>,
    pub removals: Vec<PathBuf>,
    pub commits: Vec<CommitRequest>,
    pub inits: usize,
    pub fail_commits: bool,
}

impl RecordingVcs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            committed: BTreeMap::new(),
            staged: BTreeMap::new(),
            renames: Vec::new(),
            removals: Vec::new(),
            commits: Vec::new(),
            inits: 0,
            fail_commits: false,
        }
    }

    pub fn commit_messages(&self) -> Vec<&str> {
        self.commits
            .iter()
            .map(|commit| commit.message.as_str())
            .collect()
    }

    fn stage_file(&mut self, path: &Path) -> Result<()> {
        let current = if path.is_file() { Some(fs::read(path)?) } else { None };
        if self.committed.get(path) == current.as_ref() {
            self.staged.remove(path);
        } else {
            self.staged.insert(path.to_path_buf(), current);
        }
        Ok(())
    }
}

impl VersionControl for RecordingVcs {
    fn root(&self) -> &Path {
        &self.root
    }

    fn is_repository(&self) -> bool {
        self.root.join(".git").is_dir()
    }

    fn init(&mut self) -> Result<()> {
        fs::create_dir_all(self.root.join(".git"))?;
        self.inits += 1;
        Ok(())
    }

    fn add(&mut self, path: &Path) -> Result<()> {
        let mut files = self
            .committed
            .keys()
            .filter(|known| known.starts_with(path))
            .cloned()
            .collect::<Vec<_>>();
        if path.is_dir() {
            for entry in WalkDir::new(path) {
                let entry = entry?;
                if entry.file_type().is_file() {
                    files.push(entry.into_path());
                }
            }
        } else {
            files.push(path.to_path_buf());
        }
        for file in files {
            self.stage_file(&file)?;
        }
        Ok(())
    }

    fn rename(&mut self, from: &Path, to: &Path) -> Result<()> {
        if !from.is_file() {
            bail!("rename source {} is missing", from.display());
        }
        if to.exists() {
            bail!("destination exists, source={}, destination={}", from.display(), to.display());
        }
        fs::rename(from, to)?;
        self.renames.push((from.to_path_buf(), to.to_path_buf()));
        self.stage_file(from)?;
        self.stage_file(to)?;
        Ok(())
    }

    fn remove(&mut self, path: &Path) -> Result<()> {
        if path.exists() {
            fs::remove_file(path)?;
        }
        self.removals.push(path.to_path_buf());
        self.stage_file(path)
    }

    fn has_staged_changes(&mut self) -> Result<bool> {
        Ok(!self.staged.is_empty())
    }

    fn commit(&mut self, request: &CommitRequest) -> Result<()> {
        if self.fail_commits {
            return Err(crate::error::MirrorError::Vcs {
                command: format!("git commit -m {}", request.message),
                status: Some(1),
                stderr: "simulated failure".to_string(),
            }
            .into());
        }
        for (path, content) in std::mem::take(&mut self.staged) {
            match content {
                Some(bytes) => {
                    self.committed.insert(path, bytes);
                }
                None => {
                    self.committed.remove(&path);
                }
            }
        }
        self.commits.push(request.clone());
        Ok(())
    }

    fn trailer_values(&mut self, key: &str) -> Result<HashSet<String>> {
        Ok(self
            .commits
            .iter()
            .flat_map(|commit| commit.trailers.iter())
            .filter(|(name, _)| name == key)
            .map(|(_, value)| value.clone())
            .collect())
    }
}
