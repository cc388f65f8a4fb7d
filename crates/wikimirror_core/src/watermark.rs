use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::history::Transition;

/// One replayed transition as persisted in the watermark file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatermarkRecord {
    pub version_id: Option<i64>,
    pub version_date: DateTime<Utc>,
    #[serde(default)]
    pub author_id: Option<i64>,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub action_type: String,
    #[serde(default)]
    pub value_before: Option<String>,
    #[serde(default)]
    pub value_after: Option<String>,
    pub locale: String,
    pub path: String,
    pub page_id: i64,
    /// Classified kind; absent in files written by older mirrors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl From<&Transition> for WatermarkRecord {
    fn from(transition: &Transition) -> Self {
        Self {
            version_id: transition.version_id,
            version_date: transition.version_date,
            author_id: transition.author_id,
            author_name: transition.author_name.clone(),
            action_type: transition.action_type.clone(),
            value_before: transition.value_before.clone(),
            value_after: transition.value_after.clone(),
            locale: transition.locale.clone(),
            path: transition.path().to_string(),
            page_id: transition.page_id,
            kind: Some(transition.kind.label().to_string()),
        }
    }
}

/// JSON array of replayed transitions kept at the mirror root.
#[derive(Debug, Clone)]
pub struct WatermarkStore {
    path: PathBuf,
}

impl WatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Records in file order, or `None` when no watermark was ever written.
    pub fn load(&self) -> Result<Option<Vec<WatermarkRecord>>> {
        if !self.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let records = serde_json::from_str::<Vec<WatermarkRecord>>(&content)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        Ok(Some(records))
    }

    /// Replace the file in one rename so a crash never leaves a truncated watermark.
    pub fn save(&self, records: &[WatermarkRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let serialized =
            serde_json::to_string_pretty(records).context("failed to serialize watermark records")?;
        let staging = staging_path(&self.path);
        fs::write(&staging, format!("{serialized}\n"))
            .with_context(|| format!("failed to write {}", staging.display()))?;
        fs::rename(&staging, &self.path).with_context(|| {
            format!(
                "failed to move {} over {}",
                staging.display(),
                self.path.display()
            )
        })
    }
}

/// Date of the last record: the resumption point.
pub fn watermark_of(records: &[WatermarkRecord]) -> Option<DateTime<Utc>> {
    records.last().map(|record| record.version_date)
}

/// Append `added` after `existing` and order by date, keeping insertion order
/// among equal dates.
pub fn merge_records(existing: Vec<WatermarkRecord>, added: Vec<WatermarkRecord>) -> Vec<WatermarkRecord> {
    let mut merged = existing;
    merged.extend(added);
    merged.sort_by_key(|record| record.version_date);
    merged
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::{WatermarkRecord, WatermarkStore, merge_records, watermark_of};
    use crate::testing::date;

    fn record(page_id: i64, day: u32) -> WatermarkRecord {
        WatermarkRecord {
            version_id: Some(i64::from(day)),
            version_date: date(day),
            author_id: Some(1),
            author_name: Some("admin".to_string()),
            action_type: "edit".to_string(),
            value_before: None,
            value_after: None,
            locale: "fr".to_string(),
            path: format!("page-{page_id}"),
            page_id,
            kind: Some("edited".to_string()),
        }
    }

    #[test]
    fn absent_file_has_no_watermark() {
        let temp = tempdir().expect("tempdir");
        let store = WatermarkStore::new(temp.path().join("history.json"));
        assert!(!store.exists());
        assert!(store.load().expect("load").is_none());
    }

    #[test]
    fn save_then_load_keeps_records_and_order() {
        let temp = tempdir().expect("tempdir");
        let store = WatermarkStore::new(temp.path().join("history.json"));
        let records = vec![record(1, 1), record(2, 3)];
        store.save(&records).expect("save");

        let loaded = store.load().expect("load").expect("records");
        assert_eq!(loaded, records);
        assert_eq!(watermark_of(&loaded), Some(date(3)));
        assert!(!temp.path().join("history.json.tmp").exists());
    }

    #[test]
    fn file_uses_camel_case_keys() {
        let temp = tempdir().expect("tempdir");
        let store = WatermarkStore::new(temp.path().join("history.json"));
        store.save(&[record(7, 2)]).expect("save");
        let raw = fs::read_to_string(store.path()).expect("read");
        for key in ["versionId", "versionDate", "authorName", "actionType", "pageId"] {
            assert!(raw.contains(key), "missing {key} in {raw}");
        }
    }

    #[test]
    fn loads_records_without_optional_fields() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("history.json");
        fs::write(
            &path,
            r#"[{"versionId": 12, "versionDate": "2024-11-08T02:20:13.890Z", "locale": "fr", "path": "home", "pageId": 3}]"#,
        )
        .expect("write");
        let loaded = WatermarkStore::new(&path)
            .load()
            .expect("load")
            .expect("records");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].page_id, 3);
        assert_eq!(loaded[0].kind, None);
    }

    #[test]
    fn merge_orders_by_date() {
        let merged = merge_records(vec![record(1, 2), record(1, 5)], vec![record(2, 3), record(3, 1)]);
        let days = merged
            .iter()
            .map(|record| record.version_date)
            .collect::<Vec<_>>();
        assert_eq!(days, vec![date(1), date(2), date(3), date(5)]);
        assert_eq!(watermark_of(&merged), Some(date(5)));
    }
}
