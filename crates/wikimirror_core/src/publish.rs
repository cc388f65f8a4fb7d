use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::page_file::import;
use crate::store::{CreatedPage, PageWriter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateReport {
    pub file: PathBuf,
    /// `locale/path` of the new page.
    pub key: String,
    pub page: CreatedPage,
    pub request_count: usize,
}

/// Publish a locally authored page file as a new wiki page.
///
/// Files carrying a page id are mirrored copies of existing pages and are
/// refused before any request is made.
pub fn create_page_from_file<W: PageWriter>(store: &mut W, file: &Path) -> Result<CreateReport> {
    let text = fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))?;
    let mut page = import(&text).with_context(|| format!("failed to parse {}", file.display()))?;
    page.path = page.path.trim_matches('/').to_string();
    let key = page.display_key();

    if page.id != 0 {
        bail!("{} is a mirrored copy of page {} and cannot be created again", file.display(), page.id);
    }
    if page.locale.trim().is_empty() || page.path.is_empty() {
        bail!("{} has no locale or path", file.display());
    }
    if page.title.trim().is_empty() {
        bail!("{} has no title", file.display());
    }
    if page.content_type.is_empty() {
        page.content_type = "markdown".to_string();
    }

    let created = store
        .create_page(&page)
        .with_context(|| format!("failed to create {key}"))?;
    tracing::info!(page = %key, id = created.id, "created page");
    Ok(CreateReport {
        file: file.to_path_buf(),
        key,
        page: created,
        request_count: store.request_count(),
    })
}
