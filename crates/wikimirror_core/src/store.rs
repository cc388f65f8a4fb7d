use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// One state of a wiki page: the live page, or a stored historical version of it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageSnapshot {
    pub id: i64,
    pub path: String,
    pub locale: String,
    pub title: String,
    pub description: String,
    pub content_type: String,
    pub tags: Vec<String>,
    pub is_published: bool,
    pub is_private: bool,
    pub private_ns: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version_id: Option<i64>,
    pub version_date: Option<DateTime<Utc>>,
    /// Action label the store attached to a historical version (`moved`, `updated`, ...).
    pub action: Option<String>,
    pub content: String,
}

impl PageSnapshot {
    pub fn metadata_equal(&self, other: &Self) -> bool {
        self.title == other.title
            && self.description == other.description
            && tag_set(&self.tags) == tag_set(&other.tags)
    }

    pub fn content_equal(&self, other: &Self) -> bool {
        self.content == other.content
    }

    pub fn is_markdown(&self) -> bool {
        self.content_type == "markdown"
    }

    pub fn display_key(&self) -> String {
        format!("{}/{}", self.locale, self.path)
    }
}

fn tag_set(tags: &[String]) -> BTreeSet<&str> {
    tags.iter().map(String::as_str).collect()
}

/// Raw history record as delivered by the store, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub version_id: i64,
    pub version_date: DateTime<Utc>,
    pub author_id: Option<i64>,
    pub author_name: Option<String>,
    pub action_type: String,
    pub value_before: Option<String>,
    pub value_after: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetFolder {
    pub id: i64,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub id: i64,
    pub filename: String,
    pub ext: String,
    pub kind: String,
    pub mime: String,
    pub file_size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request to {endpoint} failed: {message}")]
    Transport {
        endpoint: String,
        status: Option<u16>,
        message: String,
    },
    #[error("content store error: {message}")]
    Application { message: String },
    #[error("unexpected {context} payload: {message}")]
    Decode { context: String, message: String },
}

impl StoreError {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Decode failures count as application errors: the request went through
    /// but the answer is not usable.
    pub fn is_application(&self) -> bool {
        matches!(self, Self::Application { .. } | Self::Decode { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Read side of the remote wiki consumed by the mirror.
pub trait ContentStore {
    /// Every page, complete with content, in the store's enumeration order.
    fn list_pages(&mut self) -> StoreResult<Vec<PageSnapshot>>;
    /// History trail of one page, newest first.
    fn page_history(&mut self, page_id: i64) -> StoreResult<Vec<HistoryEntry>>;
    fn historical_snapshot(&mut self, page_id: i64, version_id: i64) -> StoreResult<PageSnapshot>;
    /// Folder id 0 is the implicit asset root.
    fn list_asset_folders(&mut self, parent_id: i64) -> StoreResult<Vec<AssetFolder>>;
    fn list_assets(&mut self, folder_id: i64) -> StoreResult<Vec<Asset>>;
    fn fetch_asset_bytes(&mut self, path: &str) -> StoreResult<Vec<u8>>;
    fn request_count(&self) -> usize;
}

/// Page the store created from a locally authored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedPage {
    pub id: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Write side, used only to publish locally authored pages.
pub trait PageWriter: ContentStore {
    fn create_page(&mut self, page: &PageSnapshot) -> StoreResult<CreatedPage>;
}
