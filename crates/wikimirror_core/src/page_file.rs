use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::store::PageSnapshot;

/// Line separating the header block from the page content.
pub const HEADER_RULE: &str = "--------------------------------------------------";

const KEY_TITLE: &str = "title";
const KEY_LOCALE: &str = "locale";
const KEY_PATH: &str = "path";
const KEY_DESCRIPTION: &str = "description";
const KEY_TAGS: &str = "tags";
const KEY_CREATED_AT: &str = "createdAt";
const KEY_UPDATED_AT: &str = "updatedAt";
const KEY_ID: &str = "id";
const KEY_VERSION_ID: &str = "versionId";
const KEY_VERSION_DATE: &str = "versionDate";
const KEY_PUBLISHED: &str = "isPublished";
const KEY_PRIVATE: &str = "isPrivate";
const KEY_PRIVATE_NS: &str = "privateNS";
const KEY_CONTENT_TYPE: &str = "contentType";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(PathBuf),
    /// The file on disk already carries the snapshot's `updatedAt`.
    Current(PathBuf),
}

impl WriteOutcome {
    pub fn path(&self) -> &Path {
        match self {
            Self::Written(path) | Self::Current(path) => path,
        }
    }
}

pub fn export(snapshot: &PageSnapshot) -> String {
    let fields: [(&str, String); 14] = [
        (KEY_TITLE, escape_scalar(&snapshot.title)),
        (KEY_LOCALE, escape_scalar(&snapshot.locale)),
        (KEY_PATH, escape_scalar(&snapshot.path)),
        (KEY_DESCRIPTION, escape_scalar(&snapshot.description)),
        (KEY_TAGS, format_tags(&snapshot.tags)),
        (KEY_CREATED_AT, format_date(snapshot.created_at)),
        (KEY_UPDATED_AT, format_date(snapshot.updated_at)),
        (KEY_ID, snapshot.id.to_string()),
        (
            KEY_VERSION_ID,
            snapshot
                .version_id
                .map(|value| value.to_string())
                .unwrap_or_default(),
        ),
        (KEY_VERSION_DATE, format_date(snapshot.version_date)),
        (KEY_PUBLISHED, snapshot.is_published.to_string()),
        (KEY_PRIVATE, snapshot.is_private.to_string()),
        (KEY_PRIVATE_NS, format_private_ns(snapshot.private_ns.as_deref())),
        (KEY_CONTENT_TYPE, escape_scalar(&snapshot.content_type)),
    ];

    let mut output = String::new();
    for (key, value) in fields {
        output.push_str(key);
        output.push_str(": ");
        output.push_str(&value);
        output.push('\n');
    }
    output.push_str(HEADER_RULE);
    output.push('\n');
    let body = snapshot.content.trim_end();
    if !body.is_empty() {
        output.push_str(body);
        output.push('\n');
    }
    output
}

/// Parse a mirrored page file back into a snapshot.
///
/// Missing or placeholder ids parse as 0 and missing dates as `None`, so
/// locally authored files (see [`template`]) are accepted.
pub fn import(text: &str) -> Result<PageSnapshot> {
    let mut snapshot = PageSnapshot::default();
    let mut rest = text;
    let mut found_rule = false;

    while !rest.is_empty() {
        let (line, remainder) = match rest.find('\n') {
            Some(position) => (&rest[..position], &rest[position + 1..]),
            None => (rest, ""),
        };
        rest = remainder;
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line == HEADER_RULE {
            found_rule = true;
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            bail!("malformed header line: {line}");
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        apply_header_field(&mut snapshot, key.trim(), value)?;
    }

    if !found_rule {
        bail!("page file has no header delimiter line");
    }
    snapshot.content = rest.trim_end().to_string();
    Ok(snapshot)
}

fn apply_header_field(snapshot: &mut PageSnapshot, key: &str, value: &str) -> Result<()> {
    match key {
        KEY_TITLE => snapshot.title = unescape_scalar(value),
        KEY_LOCALE => snapshot.locale = unescape_scalar(value),
        KEY_PATH => snapshot.path = unescape_scalar(value),
        KEY_DESCRIPTION => snapshot.description = unescape_scalar(value),
        KEY_TAGS => snapshot.tags = parse_tags(value)?,
        KEY_CREATED_AT => snapshot.created_at = parse_date(KEY_CREATED_AT, value)?,
        KEY_UPDATED_AT => snapshot.updated_at = parse_date(KEY_UPDATED_AT, value)?,
        KEY_ID => snapshot.id = parse_id(KEY_ID, value)?.unwrap_or(0),
        KEY_VERSION_ID => snapshot.version_id = parse_id(KEY_VERSION_ID, value)?,
        KEY_VERSION_DATE => snapshot.version_date = parse_date(KEY_VERSION_DATE, value)?,
        KEY_PUBLISHED => snapshot.is_published = parse_flag(value),
        KEY_PRIVATE => snapshot.is_private = parse_flag(value),
        KEY_PRIVATE_NS => snapshot.private_ns = parse_private_ns(value),
        KEY_CONTENT_TYPE => snapshot.content_type = unescape_scalar(value),
        // Older mirrors also carried `pageId`; the header is otherwise closed.
        _ => {}
    }
    Ok(())
}

pub fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "markdown" => ".md",
        _ => ".txt",
    }
}

/// `<root>/<locale>/<path segments><extension>`.
pub fn file_path(root: &Path, locale: &str, page_path: &str, content_type: &str) -> Result<PathBuf> {
    check_segment(locale, locale, page_path)?;
    let segments = page_path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>();
    let Some((last, parents)) = segments.split_last() else {
        bail!("page {locale}/{page_path} has an empty path");
    };

    let mut output = root.join(locale);
    for segment in parents {
        check_segment(segment, locale, page_path)?;
        output.push(segment);
    }
    check_segment(last, locale, page_path)?;
    output.push(format!("{last}{}", extension_for(content_type)));
    Ok(output)
}

pub fn snapshot_file_path(root: &Path, snapshot: &PageSnapshot) -> Result<PathBuf> {
    file_path(root, &snapshot.locale, &snapshot.path, &snapshot.content_type)
}

fn check_segment(segment: &str, locale: &str, page_path: &str) -> Result<()> {
    if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
        bail!("page {locale}/{page_path} resolves outside the mirror (segment {segment:?})");
    }
    Ok(())
}

/// Write the snapshot at its mirror path. With `check_current`, an existing
/// file whose `updatedAt` header equals the snapshot's is left untouched.
pub fn write_snapshot(root: &Path, snapshot: &PageSnapshot, check_current: bool) -> Result<WriteOutcome> {
    let path = snapshot_file_path(root, snapshot)?;
    if check_current
        && snapshot.updated_at.is_some()
        && path.exists()
        && read_updated_at(&path)? == snapshot.updated_at
    {
        return Ok(WriteOutcome::Current(path));
    }
    write_text(&path, &export(snapshot))?;
    Ok(WriteOutcome::Written(path))
}

/// Read only the `updatedAt` header field of a mirrored file.
pub fn read_updated_at(path: &Path) -> Result<Option<DateTime<Utc>>> {
    let text = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    for line in text.lines() {
        if line == HEADER_RULE {
            break;
        }
        if let Some((key, value)) = line.split_once(':')
            && key.trim() == KEY_UPDATED_AT
        {
            return parse_date(KEY_UPDATED_AT, value.trim())
                .with_context(|| format!("invalid header in {}", path.display()));
        }
    }
    Ok(None)
}

/// Write an empty, locally authored page file. Returns `None` when a file
/// already exists at the target path.
pub fn template(root: &Path, locale: &str, page_path: &str, content_type: &str) -> Result<Option<PathBuf>> {
    let path = file_path(root, locale, page_path, content_type)?;
    if path.exists() {
        return Ok(None);
    }
    let title = page_path
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(page_path)
        .to_string();
    let snapshot = PageSnapshot {
        path: page_path.trim_matches('/').to_string(),
        locale: locale.to_string(),
        title,
        content_type: content_type.to_string(),
        is_published: true,
        ..PageSnapshot::default()
    };
    write_text(&path, &export(&snapshot))?;
    Ok(Some(path))
}

fn write_text(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

fn format_date(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|date| date.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        .unwrap_or_default()
}

fn parse_date(key: &str, value: &str) -> Result<Option<DateTime<Utc>>> {
    let value = value.trim();
    if is_placeholder(value) {
        return Ok(None);
    }
    let parsed = DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid {key} date: {value}"))?;
    Ok(Some(parsed.with_timezone(&Utc)))
}

fn parse_id(key: &str, value: &str) -> Result<Option<i64>> {
    let value = value.trim();
    if is_placeholder(value) {
        return Ok(None);
    }
    let parsed = value
        .parse::<i64>()
        .with_context(|| format!("invalid {key}: {value}"))?;
    Ok(Some(parsed))
}

fn parse_flag(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

fn is_placeholder(value: &str) -> bool {
    matches!(value, "" | "-" | "None" | "null")
}

/// `None` is written empty. Values that would read back as a placeholder, or
/// that start with a quote, are wrapped in single quotes.
fn format_private_ns(value: Option<&str>) -> String {
    match value {
        None => String::new(),
        Some(value) if is_placeholder(value.trim()) || value.starts_with('\'') => {
            format!("'{}'", escape_scalar(value))
        }
        Some(value) => escape_scalar(value),
    }
}

fn parse_private_ns(value: &str) -> Option<String> {
    if is_placeholder(value.trim()) {
        return None;
    }
    let inner = value
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
        .unwrap_or(value);
    Some(unescape_scalar(inner))
}

fn escape_scalar(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    for character in value.chars() {
        match character {
            '\\' => output.push_str("\\\\"),
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            other => output.push(other),
        }
    }
    output
}

fn unescape_scalar(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let mut characters = value.chars();
    while let Some(character) = characters.next() {
        if character != '\\' {
            output.push(character);
            continue;
        }
        match characters.next() {
            Some('n') => output.push('\n'),
            Some('r') => output.push('\r'),
            Some(other) => output.push(other),
            None => output.push('\\'),
        }
    }
    output
}

fn format_tags(tags: &[String]) -> String {
    let quoted = tags
        .iter()
        .map(|tag| {
            let mut output = String::from("'");
            for character in tag.chars() {
                match character {
                    '\\' => output.push_str("\\\\"),
                    '\'' => output.push_str("\\'"),
                    '\n' => output.push_str("\\n"),
                    other => output.push(other),
                }
            }
            output.push('\'');
            output
        })
        .collect::<Vec<_>>();
    format!("[{}]", quoted.join(", "))
}

fn parse_tags(value: &str) -> Result<Vec<String>> {
    let value = value.trim();
    if is_placeholder(value) {
        return Ok(Vec::new());
    }
    let Some(inner) = value.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) else {
        bail!("tags must be a bracketed list: {value}");
    };

    let mut tags = Vec::new();
    let mut characters = inner.chars().peekable();
    loop {
        while characters.next_if(|character| character.is_whitespace() || *character == ',').is_some() {}
        match characters.next() {
            None => break,
            Some('\'') => {}
            Some(other) => bail!("unexpected {other:?} in tags: {value}"),
        }
        let mut tag = String::new();
        let mut closed = false;
        while let Some(character) = characters.next() {
            match character {
                '\\' => match characters.next() {
                    Some('n') => tag.push('\n'),
                    Some(escaped) => tag.push(escaped),
                    None => bail!("dangling escape in tags: {value}"),
                },
                '\'' => {
                    closed = true;
                    break;
                }
                other => tag.push(other),
            }
        }
        if !closed {
            bail!("unterminated tag in: {value}");
        }
        tags.push(tag);
    }
    Ok(tags)
}
