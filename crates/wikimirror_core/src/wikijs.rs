use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Url;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::config::MirrorConfig;
use crate::store::{
    Asset, AssetFolder, ContentStore, CreatedPage, HistoryEntry, PageSnapshot, PageWriter, StoreError,
    StoreResult,
};

const LIST_PAGES_QUERY: &str = r#"{pages {
  list(orderBy: PATH) {
    id path title locale description contentType
    isPublished isPrivate privateNS createdAt updatedAt tags
}}}"#;

const PAGE_CONTENT_QUERY: &str = r#"query ($id: Int!) {pages {
  single(id: $id) { content }
}}"#;

const PAGE_HISTORY_QUERY: &str = r#"query ($id: Int!, $offsetPage: Int, $offsetSize: Int) {pages {
  history(id: $id, offsetPage: $offsetPage, offsetSize: $offsetSize) {
    trail { versionId versionDate authorId authorName actionType valueBefore valueAfter }
    total
}}}"#;

/// Trail records requested per history page.
const HISTORY_PAGE_SIZE: usize = 100;

const CREATE_PAGE_MUTATION: &str = r#"mutation ($content: String!, $description: String!, $editor: String!, $isPrivate: Boolean!, $isPublished: Boolean!, $locale: String!, $path: String!, $publishEndDate: Date, $publishStartDate: Date, $scriptCss: String, $scriptJs: String, $tags: [String]!, $title: String!) {pages {
  create(content: $content, description: $description, editor: $editor, isPrivate: $isPrivate, isPublished: $isPublished, locale: $locale, path: $path, publishEndDate: $publishEndDate, publishStartDate: $publishStartDate, scriptCss: $scriptCss, scriptJs: $scriptJs, tags: $tags, title: $title) {
    responseResult { succeeded errorCode slug message }
    page { id updatedAt }
}}}"#;

const PAGE_VERSION_QUERY: &str = r#"query ($pageId: Int!, $versionId: Int!) {pages {
  version(pageId: $pageId, versionId: $versionId) {
    action authorId authorName content contentType createdAt versionDate
    description isPrivate isPublished locale pageId path tags title versionId
}}}"#;

const ASSET_FOLDERS_QUERY: &str = r#"query ($parentFolderId: Int!) {assets {
  folders(parentFolderId: $parentFolderId) { id name slug }
}}"#;

const ASSET_LIST_QUERY: &str = r#"query ($folderId: Int!, $kind: AssetKind!) {assets {
  list(folderId: $folderId, kind: $kind) {
    id filename ext kind mime fileSize createdAt updatedAt
}}}"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiJsClientConfig {
    /// Site root; GraphQL lives at `<api_url>/graphql`.
    pub api_url: String,
    pub api_key: Option<String>,
    pub user_agent: String,
    /// `None` blocks until the server answers.
    pub timeout_ms: Option<u64>,
}

impl WikiJsClientConfig {
    pub fn from_config(config: &MirrorConfig) -> Self {
        Self {
            api_url: config.api_url_owned().unwrap_or_default(),
            api_key: config.api_key(),
            user_agent: config.user_agent(),
            timeout_ms: config.timeout_ms(),
        }
    }
}

/// Blocking Wiki.js GraphQL client. Every call is a single attempt.
pub struct WikiJsClient {
    client: Client,
    config: WikiJsClientConfig,
    graphql_url: Url,
    request_count: usize,
}

impl WikiJsClient {
    pub fn new(config: WikiJsClientConfig) -> Result<Self> {
        let base = Url::parse(config.api_url.trim())
            .with_context(|| format!("invalid Wiki.js URL: {:?}", config.api_url))?;
        let graphql_url = join_segments(&base, &["graphql"])
            .with_context(|| format!("Wiki.js URL cannot carry a path: {base}"))?;
        let client = Client::builder()
            .timeout(config.timeout_ms.map(Duration::from_millis))
            .build()
            .context("failed to build Wiki.js HTTP client")?;
        Ok(Self {
            client,
            config,
            graphql_url,
            request_count: 0,
        })
    }

    fn query<T: DeserializeOwned>(&mut self, query: &str, variables: Value, pointer: &str) -> StoreResult<T> {
        self.request_count += 1;
        let endpoint = self.graphql_url.to_string();
        let mut request = self
            .client
            .post(self.graphql_url.clone())
            .header("User-Agent", self.config.user_agent.clone())
            .json(&json!({ "query": query, "variables": variables }));
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().map_err(|error| StoreError::Transport {
            endpoint: endpoint.clone(),
            status: None,
            message: error.to_string(),
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Transport {
                endpoint,
                status: Some(status.as_u16()),
                message: format!("HTTP {status}"),
            });
        }
        let payload: Value = response.json().map_err(|error| StoreError::Decode {
            context: pointer.to_string(),
            message: error.to_string(),
        })?;
        extract(payload, pointer)
    }

    fn page_content(&mut self, page_id: i64) -> StoreResult<String> {
        let single: PageContent =
            self.query(PAGE_CONTENT_QUERY, json!({ "id": page_id }), "/data/pages/single")?;
        Ok(single.content.unwrap_or_default())
    }
}

impl ContentStore for WikiJsClient {
    fn list_pages(&mut self) -> StoreResult<Vec<PageSnapshot>> {
        let items: Vec<PageListItem> = self.query(LIST_PAGES_QUERY, json!({}), "/data/pages/list")?;
        tracing::info!(pages = items.len(), "listed pages");
        let mut pages = Vec::with_capacity(items.len());
        for item in items {
            let content = self.page_content(item.id)?;
            pages.push(item.into_snapshot(content));
        }
        Ok(pages)
    }

    fn page_history(&mut self, page_id: i64) -> StoreResult<Vec<HistoryEntry>> {
        let trail = collect_trail(HISTORY_PAGE_SIZE, |offset_page| {
            self.query(
                PAGE_HISTORY_QUERY,
                json!({
                    "id": page_id,
                    "offsetPage": offset_page,
                    "offsetSize": HISTORY_PAGE_SIZE,
                }),
                "/data/pages/history",
            )
        })?;
        Ok(trail.into_iter().map(HistoryEntry::from).collect())
    }

    fn historical_snapshot(&mut self, page_id: i64, version_id: i64) -> StoreResult<PageSnapshot> {
        let version: PageVersion = self.query(
            PAGE_VERSION_QUERY,
            json!({ "pageId": page_id, "versionId": version_id }),
            "/data/pages/version",
        )?;
        Ok(version.into())
    }

    fn list_asset_folders(&mut self, parent_id: i64) -> StoreResult<Vec<AssetFolder>> {
        let folders: Vec<AssetFolderItem> = self.query(
            ASSET_FOLDERS_QUERY,
            json!({ "parentFolderId": parent_id }),
            "/data/assets/folders",
        )?;
        Ok(folders
            .into_iter()
            .map(|folder| AssetFolder {
                id: folder.id,
                name: folder.name,
                slug: folder.slug.unwrap_or_default(),
            })
            .collect())
    }

    fn list_assets(&mut self, folder_id: i64) -> StoreResult<Vec<Asset>> {
        let assets: Vec<AssetItem> = self.query(
            ASSET_LIST_QUERY,
            json!({ "folderId": folder_id, "kind": "ALL" }),
            "/data/assets/list",
        )?;
        Ok(assets.into_iter().map(Asset::from).collect())
    }

    fn fetch_asset_bytes(&mut self, path: &str) -> StoreResult<Vec<u8>> {
        self.request_count += 1;
        let base = Url::parse(self.config.api_url.trim()).map_err(|error| StoreError::Transport {
            endpoint: self.config.api_url.clone(),
            status: None,
            message: error.to_string(),
        })?;
        let segments = path.split('/').filter(|segment| !segment.is_empty()).collect::<Vec<_>>();
        let url = join_segments(&base, &segments).ok_or_else(|| StoreError::Transport {
            endpoint: base.to_string(),
            status: None,
            message: "URL cannot carry a path".to_string(),
        })?;
        let endpoint = url.to_string();

        let mut request = self
            .client
            .get(url)
            .header("User-Agent", self.config.user_agent.clone());
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().map_err(|error| StoreError::Transport {
            endpoint: endpoint.clone(),
            status: None,
            message: error.to_string(),
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Transport {
                endpoint,
                status: Some(status.as_u16()),
                message: format!("HTTP {status}"),
            });
        }
        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|error| StoreError::Transport {
                endpoint,
                status: Some(status.as_u16()),
                message: error.to_string(),
            })
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

impl PageWriter for WikiJsClient {
    fn create_page(&mut self, page: &PageSnapshot) -> StoreResult<CreatedPage> {
        let created: CreateResult = self.query(
            CREATE_PAGE_MUTATION,
            create_variables(page),
            "/data/pages/create",
        )?;
        let page = created.page.ok_or_else(|| StoreError::Application {
            message: format!("creating {} returned no page", page.display_key()),
        })?;
        Ok(CreatedPage {
            id: page.id,
            updated_at: page.updated_at,
        })
    }
}

fn create_variables(page: &PageSnapshot) -> Value {
    json!({
        "content": page.content,
        "description": page.description,
        "editor": page.content_type,
        "isPrivate": page.is_private,
        "isPublished": page.is_published,
        "locale": page.locale,
        "path": page.path,
        "publishEndDate": "",
        "publishStartDate": "",
        "scriptCss": "",
        "scriptJs": "",
        "tags": page.tags,
        "title": page.title,
    })
}

/// Fetch trail pages until the reported total is reached. Without a total,
/// a short page ends the trail; an empty page always does.
fn collect_trail<F>(page_size: usize, mut fetch: F) -> StoreResult<Vec<TrailItem>>
where
    F: FnMut(usize) -> StoreResult<PageHistory>,
{
    let mut trail = Vec::new();
    let mut offset_page = 0;
    loop {
        let page = fetch(offset_page)?;
        let received = page.trail.len();
        trail.extend(page.trail);
        let complete = match page.total {
            Some(total) => trail.len() >= total,
            None => received < page_size,
        };
        if received == 0 || complete {
            return Ok(trail);
        }
        offset_page += 1;
    }
}

fn join_segments(base: &Url, segments: &[&str]) -> Option<Url> {
    let mut url = base.clone();
    {
        let mut path = url.path_segments_mut().ok()?;
        path.pop_if_empty();
        path.extend(segments);
    }
    Some(url)
}

/// Reject GraphQL `errors` and failed `responseResult` blocks, then decode the
/// value at `pointer`.
fn extract<T: DeserializeOwned>(payload: Value, pointer: &str) -> StoreResult<T> {
    check_payload(&payload)?;
    let value = payload.pointer(pointer).cloned().ok_or_else(|| StoreError::Decode {
        context: pointer.to_string(),
        message: "field is missing".to_string(),
    })?;
    if value.is_null() {
        return Err(StoreError::Application {
            message: format!("{pointer} is null"),
        });
    }
    serde_json::from_value(value).map_err(|error| StoreError::Decode {
        context: pointer.to_string(),
        message: error.to_string(),
    })
}

fn check_payload(payload: &Value) -> StoreResult<()> {
    if let Some(errors) = payload.get("errors").and_then(Value::as_array)
        && !errors.is_empty()
    {
        let messages = errors
            .iter()
            .map(|error| {
                error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string()
            })
            .collect::<Vec<_>>();
        return Err(StoreError::Application {
            message: messages.join("; "),
        });
    }
    if let Some(result) = find_response_result(payload)
        && !result.succeeded
    {
        return Err(StoreError::Application {
            message: format!(
                "{} [{}/{}]",
                result.message.unwrap_or_else(|| "request failed".to_string()),
                result.slug.unwrap_or_default(),
                result.error_code.unwrap_or_default()
            ),
        });
    }
    Ok(())
}

fn find_response_result(value: &Value) -> Option<ResponseResult> {
    match value {
        Value::Object(map) => {
            if let Some(result) = map.get("responseResult") {
                return serde_json::from_value(result.clone()).ok();
            }
            map.values().find_map(find_response_result)
        }
        Value::Array(items) => items.iter().find_map(find_response_result),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseResult {
    succeeded: bool,
    error_code: Option<i64>,
    slug: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageListItem {
    id: i64,
    path: String,
    locale: String,
    title: Option<String>,
    description: Option<String>,
    content_type: Option<String>,
    #[serde(default)]
    is_published: bool,
    #[serde(default)]
    is_private: bool,
    #[serde(rename = "privateNS")]
    private_ns: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    tags: Option<Vec<String>>,
}

impl PageListItem {
    fn into_snapshot(self, content: String) -> PageSnapshot {
        PageSnapshot {
            id: self.id,
            path: self.path,
            locale: self.locale,
            title: self.title.unwrap_or_default(),
            description: self.description.unwrap_or_default(),
            content_type: self.content_type.unwrap_or_default(),
            tags: self.tags.unwrap_or_default(),
            is_published: self.is_published,
            is_private: self.is_private,
            private_ns: self.private_ns,
            created_at: self.created_at,
            updated_at: self.updated_at,
            version_id: None,
            version_date: None,
            action: None,
            content,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PageContent {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageHistory {
    #[serde(default)]
    trail: Vec<TrailItem>,
    #[serde(default)]
    total: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct CreateResult {
    page: Option<CreatedPageItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedPageItem {
    id: i64,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrailItem {
    version_id: i64,
    version_date: DateTime<Utc>,
    author_id: Option<i64>,
    author_name: Option<String>,
    action_type: String,
    value_before: Option<String>,
    value_after: Option<String>,
}

impl From<TrailItem> for HistoryEntry {
    fn from(item: TrailItem) -> Self {
        Self {
            version_id: item.version_id,
            version_date: item.version_date,
            author_id: item.author_id,
            author_name: item.author_name,
            action_type: item.action_type,
            value_before: item.value_before,
            value_after: item.value_after,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageVersion {
    action: Option<String>,
    content: Option<String>,
    content_type: Option<String>,
    created_at: Option<DateTime<Utc>>,
    version_date: Option<DateTime<Utc>>,
    description: Option<String>,
    #[serde(default)]
    is_private: bool,
    #[serde(default)]
    is_published: bool,
    locale: String,
    page_id: i64,
    path: String,
    tags: Option<Vec<String>>,
    title: Option<String>,
    version_id: i64,
}

impl From<PageVersion> for PageSnapshot {
    fn from(version: PageVersion) -> Self {
        Self {
            id: version.page_id,
            path: version.path,
            locale: version.locale,
            title: version.title.unwrap_or_default(),
            description: version.description.unwrap_or_default(),
            content_type: version.content_type.unwrap_or_default(),
            tags: version.tags.unwrap_or_default(),
            is_published: version.is_published,
            is_private: version.is_private,
            private_ns: None,
            created_at: version.created_at,
            updated_at: version.version_date,
            version_id: Some(version.version_id),
            version_date: version.version_date,
            action: version.action,
            content: version.content.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AssetFolderItem {
    id: i64,
    name: String,
    slug: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssetItem {
    id: i64,
    filename: String,
    #[serde(default)]
    ext: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    mime: String,
    #[serde(default)]
    file_size: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AssetItem> for Asset {
    fn from(item: AssetItem) -> Self {
        Self {
            id: item.id,
            filename: item.filename,
            ext: item.ext,
            kind: item.kind,
            mime: item.mime,
            file_size: item.file_size,
            created_at: item.created_at,
            updated_at: item.updated_at,
        }
    }
}
