use std::cell::OnceCell;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use similar::TextDiff;

use crate::error::MirrorError;
use crate::store::{ContentStore, HistoryEntry, PageSnapshot};

/// Action label attached by the store to a trail record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawAction {
    Initial,
    Edit,
    Move,
}

impl RawAction {
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "initial" => Some(Self::Initial),
            "edit" => Some(Self::Edit),
            "move" => Some(Self::Move),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Edit => "edit",
            Self::Move => "move",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionKind {
    Initial,
    Edited,
    MetadataEdited,
    Moved {
        from: String,
        to: String,
        content_changed: bool,
        metadata_changed: bool,
    },
    Ghost,
}

impl TransitionKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Edited => "edited",
            Self::MetadataEdited => "metadata-edited",
            Self::Moved { .. } => "moved",
            Self::Ghost => "ghost",
        }
    }
}

/// One link of a page's chronological chain.
#[derive(Debug)]
pub struct ChainEntry {
    /// `None` for the synthetic entry standing for the live page.
    pub version_id: Option<i64>,
    pub version_date: DateTime<Utc>,
    pub author_id: Option<i64>,
    pub author_name: Option<String>,
    /// `None` for the synthetic entry, which carries no store label.
    pub raw_action: Option<RawAction>,
    pub value_before: Option<String>,
    pub value_after: Option<String>,
    snapshot: OnceCell<PageSnapshot>,
}

impl ChainEntry {
    pub fn is_current(&self) -> bool {
        self.version_id.is_none()
    }

    fn from_record(record: HistoryEntry, page: &PageSnapshot) -> Result<Self, MirrorError> {
        let raw_action =
            RawAction::parse(&record.action_type).ok_or_else(|| MirrorError::UnknownAction {
                page: page.display_key(),
                label: record.action_type.clone(),
            })?;
        Ok(Self {
            version_id: Some(record.version_id),
            version_date: record.version_date,
            author_id: record.author_id,
            author_name: record.author_name,
            raw_action: Some(raw_action),
            value_before: record.value_before,
            value_after: record.value_after,
            snapshot: OnceCell::new(),
        })
    }

    fn explicit_move(&self) -> Option<(&str, &str)> {
        if self.raw_action != Some(RawAction::Move) {
            return None;
        }
        match (self.value_before.as_deref(), self.value_after.as_deref()) {
            (Some(before), Some(after)) if !before.is_empty() && !after.is_empty() && before != after => {
                Some((before, after))
            }
            _ => None,
        }
    }
}

/// A classified history entry, ready for replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub page_id: i64,
    pub locale: String,
    pub version_id: Option<i64>,
    pub version_date: DateTime<Utc>,
    pub author_id: Option<i64>,
    pub author_name: Option<String>,
    /// Store label, or `current` for the live page.
    pub action_type: String,
    pub value_before: Option<String>,
    pub value_after: Option<String>,
    pub kind: TransitionKind,
    /// State to mirror; its path is where the page lives after this transition.
    pub snapshot: PageSnapshot,
    /// Content type the page had before this transition, if it had a predecessor.
    pub previous_content_type: Option<String>,
}

impl Transition {
    pub fn path(&self) -> &str {
        &self.snapshot.path
    }

    pub fn display_key(&self) -> String {
        format!("{}/{}", self.locale, self.snapshot.path)
    }

    pub fn is_ghost(&self) -> bool {
        self.kind == TransitionKind::Ghost
    }

    /// Stable identity of the transition: page id and version date. The live
    /// entry keeps its key once it becomes a stored version, since the store
    /// dates that version at the page's last update.
    pub fn replay_key(&self) -> String {
        format!(
            "{}@{}",
            self.page_id,
            self.version_date.to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }

    /// Content type to locate the file the page occupied before this transition.
    pub fn source_content_type(&self) -> &str {
        self.previous_content_type
            .as_deref()
            .unwrap_or(&self.snapshot.content_type)
    }
}

/// Chronological chain of one page's history, oldest first, ending (usually)
/// with the live page. Snapshots are fetched on first access only.
#[derive(Debug)]
pub struct HistoryChain {
    page: PageSnapshot,
    entries: Vec<ChainEntry>,
}

impl HistoryChain {
    /// `records` come newest first, as the store delivers them.
    pub fn build(page: PageSnapshot, records: Vec<HistoryEntry>) -> Result<Self, MirrorError> {
        let latest_record = records.iter().map(|record| record.version_date).max();
        let current_date = page
            .updated_at
            .or(latest_record)
            .unwrap_or_default();

        let mut entries = Vec::with_capacity(records.len() + 1);
        entries.push(ChainEntry {
            version_id: None,
            version_date: current_date,
            author_id: None,
            author_name: None,
            raw_action: None,
            value_before: None,
            value_after: None,
            snapshot: OnceCell::from(page.clone()),
        });
        for record in records {
            entries.push(ChainEntry::from_record(record, &page)?);
        }
        entries.reverse();
        // Stable: entries sharing a date keep their trail order.
        entries.sort_by_key(|entry| entry.version_date);

        Ok(Self { page, entries })
    }

    pub fn page(&self) -> &PageSnapshot {
        &self.page
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, index: usize) -> Option<&ChainEntry> {
        self.entries.get(index)
    }

    pub fn previous(&self, index: usize) -> Option<&ChainEntry> {
        index.checked_sub(1).and_then(|previous| self.entries.get(previous))
    }

    pub fn next(&self, index: usize) -> Option<&ChainEntry> {
        self.entries.get(index + 1)
    }

    pub fn latest_date(&self) -> Option<DateTime<Utc>> {
        self.entries.last().map(|entry| entry.version_date)
    }

    /// Fetch the stored version behind a history entry.
    ///
    /// The synthetic current entry has none; asking for it is an error.
    pub fn historical_snapshot<S: ContentStore>(&self, store: &mut S, index: usize) -> Result<PageSnapshot> {
        let entry = self.entry_at(index)?;
        let Some(version_id) = entry.version_id else {
            return Err(MirrorError::NoStoredVersion {
                page: self.page.display_key(),
            }
            .into());
        };
        store
            .historical_snapshot(self.page.id, version_id)
            .with_context(|| {
                format!(
                    "failed to fetch version {version_id} of {}",
                    self.page.display_key()
                )
            })
    }

    /// Snapshot of an entry: the live page for the current entry, the stored
    /// version otherwise.
    pub fn resolve<S: ContentStore>(&self, store: &mut S, index: usize) -> Result<&PageSnapshot> {
        let entry = self.entry_at(index)?;
        if let Some(snapshot) = entry.snapshot.get() {
            return Ok(snapshot);
        }
        let snapshot = self.historical_snapshot(store, index)?;
        Ok(entry.snapshot.get_or_init(|| snapshot))
    }

    /// Classify every entry in order. Only transitions dated strictly after
    /// `watermark` are returned, but every entry is classified since the
    /// page location is carried from one transition to the next.
    pub fn transitions_after<S: ContentStore>(
        &self,
        store: &mut S,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<Vec<Transition>> {
        if let (Some(watermark), Some(latest)) = (watermark, self.latest_date())
            && latest <= watermark
        {
            return Ok(Vec::new());
        }

        let mut output = Vec::new();
        let mut location: Option<String> = None;
        for index in 0..self.entries.len() {
            let (kind, path) = self.classify_at(store, index, location.as_deref())?;
            let entry = self.entry_at(index)?;
            if watermark.is_none_or(|watermark| entry.version_date > watermark) {
                let mut snapshot = self.resolve(store, index)?.clone();
                snapshot.path = path.clone();
                let previous_content_type = match index.checked_sub(1) {
                    Some(previous) => Some(self.resolve(store, previous)?.content_type.clone()),
                    None => None,
                };
                output.push(Transition {
                    page_id: self.page.id,
                    locale: self.page.locale.clone(),
                    version_id: entry.version_id,
                    version_date: entry.version_date,
                    author_id: entry.author_id,
                    author_name: entry.author_name.clone(),
                    action_type: entry
                        .raw_action
                        .map_or("current", RawAction::as_str)
                        .to_string(),
                    value_before: entry.value_before.clone(),
                    value_after: entry.value_after.clone(),
                    kind,
                    snapshot,
                    previous_content_type,
                });
            }
            location = Some(path);
        }
        Ok(output)
    }

    /// Every transition of the chain.
    pub fn transitions<S: ContentStore>(&self, store: &mut S) -> Result<Vec<Transition>> {
        self.transitions_after(store, None)
    }

    /// Classify one entry given where the page sat after its predecessor.
    /// Returns the kind and the page path after the transition.
    fn classify_at<S: ContentStore>(
        &self,
        store: &mut S,
        index: usize,
        location: Option<&str>,
    ) -> Result<(TransitionKind, String)> {
        let current_path = self.resolve(store, index)?.path.clone();
        let Some(location) = location.filter(|_| index > 0) else {
            return Ok((TransitionKind::Initial, current_path));
        };

        let destination = self.move_destination(store, index, location)?;
        let current = self.resolve(store, index)?;
        let previous = self.resolve(store, index - 1)?;
        let content_changed = !current.content_equal(previous);
        let metadata_changed = !current.metadata_equal(previous);

        if let Some(to) = destination {
            return Ok((
                TransitionKind::Moved {
                    from: location.to_string(),
                    to: to.clone(),
                    content_changed,
                    metadata_changed,
                },
                to,
            ));
        }

        let kind = if content_changed {
            TransitionKind::Edited
        } else if metadata_changed {
            TransitionKind::MetadataEdited
        } else {
            TransitionKind::Ghost
        };
        Ok((kind, location.to_string()))
    }

    /// Where the page moves to at `index`, if it moves at all.
    ///
    /// `location` is where the predecessor left the page: the destination of
    /// its move when it moved, else the location one entry further back. A
    /// predecessor whose stored action says `moved`, or whose `move` label
    /// carries no usable paths, still holds the pre-move path, so the page is
    /// compared against that earlier location rather than the predecessor's
    /// own path. A move filed against the wrong entry is then replayed once.
    ///
    /// 1. the entry's own label is `move` with distinct before/after paths;
    /// 2. otherwise the resolved path differs from `location`.
    fn move_destination<S: ContentStore>(
        &self,
        store: &mut S,
        index: usize,
        location: &str,
    ) -> Result<Option<String>> {
        if let Some((_, after)) = self.entry_at(index)?.explicit_move() {
            return Ok((after != location).then(|| after.to_string()));
        }
        let current_path = &self.resolve(store, index)?.path;
        Ok((current_path != location).then(|| current_path.clone()))
    }

    fn entry_at(&self, index: usize) -> Result<&ChainEntry> {
        self.entries
            .get(index)
            .with_context(|| format!("{} has no history entry {index}", self.page.display_key()))
    }
}

/// Unified diff between two contents, for display.
pub fn content_diff(before: &str, after: &str, before_label: &str, after_label: &str) -> String {
    TextDiff::from_lines(before, after)
        .unified_diff()
        .context_radius(3)
        .header(before_label, after_label)
        .to_string()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{HistoryChain, TransitionKind, content_diff};
    use crate::error::MirrorError;
    use crate::store::PageSnapshot;
    use crate::testing::{MockStore, date, page, record};

    #[test]
    fn chain_is_chronological_and_ends_with_current_entry() {
        let live = page(1, "home", "v3", date(3));
        let records = vec![record(12, date(2), "edit"), record(11, date(1), "initial")];
        let chain = HistoryChain::build(live, records).expect("chain");

        assert_eq!(chain.len(), 3);
        let ids = (0..chain.len())
            .map(|index| chain.entry(index).and_then(|entry| entry.version_id))
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![Some(11), Some(12), None]);
        assert!(chain.previous(0).is_none());
        assert_eq!(chain.previous(1).and_then(|entry| entry.version_id), Some(11));
        assert_eq!(chain.next(1).and_then(|entry| entry.version_id), None);
        assert!(chain.next(1).is_some_and(|entry| entry.is_current()));
        assert!(chain.next(2).is_none());
    }

    #[test]
    fn snapshots_are_fetched_once() {
        let mut store = MockStore::default();
        store.add_version(page(1, "home", "v1", date(1)), 11);
        let chain = HistoryChain::build(
            page(1, "home", "v2", date(2)),
            vec![record(11, date(1), "initial")],
        )
        .expect("chain");

        chain.resolve(&mut store, 0).expect("resolve");
        chain.resolve(&mut store, 0).expect("resolve again");
        chain.transitions(&mut store).expect("transitions");
        assert_eq!(store.version_requests, 1);
    }

    #[test]
    fn current_entry_has_no_stored_version() {
        let mut store = MockStore::default();
        let chain = HistoryChain::build(page(1, "home", "v1", date(1)), Vec::new()).expect("chain");
        let current = chain
            .resolve(&mut store, 0)
            .expect("current resolves to live page");
        assert_eq!(current.content, "v1");

        let error = chain
            .historical_snapshot(&mut store, 0)
            .expect_err("must fail");
        assert!(matches!(
            error.downcast_ref::<MirrorError>(),
            Some(MirrorError::NoStoredVersion { .. })
        ));
        assert_eq!(store.version_requests, 0);
    }

    #[test]
    fn unknown_action_label_is_fatal() {
        let error = HistoryChain::build(
            page(1, "home", "v1", date(2)),
            vec![record(11, date(1), "teleport")],
        )
        .expect_err("must fail");
        assert!(matches!(error, MirrorError::UnknownAction { ref label, .. } if label == "teleport"));
        assert!(error.to_string().contains("fr/home"));
    }

    #[test]
    fn classifies_initial_edit_metadata_and_ghost() {
        let mut store = MockStore::default();
        store.add_version(page(1, "home", "v1", date(1)), 11);
        store.add_version(page(1, "home", "v2", date(2)), 12);
        let mut retitled = page(1, "home", "v2", date(3));
        retitled.title = "Accueil".to_string();
        store.add_version(retitled.clone(), 13);

        let mut live = retitled;
        live.updated_at = Some(date(4));
        let chain = HistoryChain::build(
            live,
            vec![
                record(13, date(3), "edit"),
                record(12, date(2), "edit"),
                record(11, date(1), "initial"),
            ],
        )
        .expect("chain");

        let kinds = chain
            .transitions(&mut store)
            .expect("transitions")
            .into_iter()
            .map(|transition| transition.kind)
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                TransitionKind::Initial,
                TransitionKind::Edited,
                TransitionKind::MetadataEdited,
                TransitionKind::Ghost,
            ]
        );
    }

    #[test]
    fn explicit_move_label_wins() {
        let mut store = MockStore::default();
        store.add_version(page(1, "old/place", "v1", date(1)), 11);
        let mut moving = page(1, "old/place", "v1", date(2));
        moving.action = Some("moved".to_string());
        store.add_version(moving, 12);

        let mut move_record = record(12, date(2), "move");
        move_record.value_before = Some("old/place".to_string());
        move_record.value_after = Some("new/place".to_string());

        let chain = HistoryChain::build(
            page(1, "new/place", "v1", date(3)),
            vec![move_record, record(11, date(1), "initial")],
        )
        .expect("chain");
        let transitions = chain.transitions(&mut store).expect("transitions");

        assert_eq!(
            transitions[1].kind,
            TransitionKind::Moved {
                from: "old/place".to_string(),
                to: "new/place".to_string(),
                content_changed: false,
                metadata_changed: false,
            }
        );
        assert_eq!(transitions[1].path(), "new/place");
        // The live page already sits where the move left it.
        assert_eq!(transitions[2].kind, TransitionKind::Ghost);
    }

    #[test]
    fn mislabelled_move_is_detected_from_predecessor_action() {
        let mut store = MockStore::default();
        store.add_version(page(1, "a", "v1", date(1)), 11);
        let mut moved = page(1, "a", "v1", date(2));
        moved.action = Some("moved".to_string());
        store.add_version(moved, 12);

        // Trail labels the move record as a plain edit.
        let chain = HistoryChain::build(
            page(1, "b", "v1", date(3)),
            vec![record(12, date(2), "edit"), record(11, date(1), "initial")],
        )
        .expect("chain");
        let transitions = chain.transitions(&mut store).expect("transitions");

        assert_eq!(transitions.len(), 3);
        assert_eq!(transitions[1].kind, TransitionKind::Ghost);
        assert_eq!(
            transitions[2].kind,
            TransitionKind::Moved {
                from: "a".to_string(),
                to: "b".to_string(),
                content_changed: false,
                metadata_changed: false,
            }
        );
    }

    #[test]
    fn uninformative_move_label_looks_one_entry_further_back() {
        let mut store = MockStore::default();
        store.add_version(page(1, "a", "v1", date(1)), 11);
        store.add_version(page(1, "a", "v1", date(2)), 12);

        let mut bare_move = record(12, date(2), "move");
        bare_move.value_before = None;
        bare_move.value_after = None;

        let mut live = page(1, "b", "v2", date(3));
        live.title = "B".to_string();
        let chain = HistoryChain::build(live, vec![bare_move, record(11, date(1), "initial")])
            .expect("chain");
        let transitions = chain.transitions(&mut store).expect("transitions");

        assert_eq!(
            transitions[2].kind,
            TransitionKind::Moved {
                from: "a".to_string(),
                to: "b".to_string(),
                content_changed: true,
                metadata_changed: true,
            }
        );
    }

    #[test]
    fn move_filed_against_the_wrong_entry_is_replayed_once() {
        let mut store = MockStore::default();
        store.add_version(page(1, "a", "v1", date(1)), 11);
        // Stored as `moved` but still at the pre-move path.
        let mut moved = page(1, "a", "v1", date(2));
        moved.action = Some("moved".to_string());
        store.add_version(moved, 12);
        store.add_version(page(1, "b", "v1", date(3)), 13);
        store.add_version(page(1, "b", "v2", date(4)), 14);

        let chain = HistoryChain::build(
            page(1, "b", "v3", date(5)),
            vec![
                record(14, date(4), "edit"),
                record(13, date(3), "edit"),
                record(12, date(2), "initial"),
                record(11, date(1), "initial"),
            ],
        )
        .expect("chain");
        let transitions = chain.transitions(&mut store).expect("transitions");

        let moves = transitions
            .iter()
            .filter(|transition| matches!(transition.kind, TransitionKind::Moved { .. }))
            .count();
        assert_eq!(moves, 1);
        assert_eq!(transitions[1].kind, TransitionKind::Ghost);
        assert_eq!(transitions[1].path(), "a");
        assert!(matches!(
            &transitions[2].kind,
            TransitionKind::Moved { from, to, .. } if from == "a" && to == "b"
        ));
        assert_eq!(transitions[3].kind, TransitionKind::Edited);
        assert_eq!(transitions[4].kind, TransitionKind::Edited);
        assert!(transitions[3..].iter().all(|transition| transition.path() == "b"));
    }

    #[test]
    fn explicit_move_is_not_replayed_again_from_the_stale_stored_path() {
        let mut store = MockStore::default();
        store.add_version(page(1, "a", "v1", date(1)), 11);
        store.add_version(page(1, "a", "v1", date(2)), 12);
        store.add_version(page(1, "b", "v2", date(3)), 13);
        let mut move_record = record(12, date(2), "move");
        move_record.value_before = Some("a".to_string());
        move_record.value_after = Some("b".to_string());

        let chain = HistoryChain::build(
            page(1, "b", "v2", date(4)),
            vec![record(13, date(3), "edit"), move_record, record(11, date(1), "initial")],
        )
        .expect("chain");
        let kinds = chain
            .transitions(&mut store)
            .expect("transitions")
            .into_iter()
            .map(|transition| transition.kind.label())
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec!["initial", "moved", "edited", "ghost"]);
    }

    #[test]
    fn transitions_carry_replay_key_and_previous_content_type() {
        let mut store = MockStore::default();
        store.add_version(page(1, "home", "v1", date(1)), 11);
        let mut live = page(1, "home", "<p>v2</p>", date(2));
        live.content_type = "html".to_string();
        let chain = HistoryChain::build(live, vec![record(11, date(1), "initial")]).expect("chain");

        let transitions = chain.transitions(&mut store).expect("transitions");
        assert_eq!(transitions[0].previous_content_type, None);
        assert_eq!(transitions[0].source_content_type(), "markdown");
        assert_eq!(transitions[1].previous_content_type.as_deref(), Some("markdown"));
        assert_eq!(transitions[1].snapshot.content_type, "html");
        assert_eq!(transitions[0].replay_key(), "1@2024-01-01T12:00:00.000Z");
        assert_eq!(transitions[1].replay_key(), "1@2024-01-02T12:00:00.000Z");
    }

    #[test]
    fn out_of_range_entry_is_an_error() {
        let mut store = MockStore::default();
        let chain = HistoryChain::build(page(1, "home", "v1", date(1)), Vec::new()).expect("chain");
        let error = chain.resolve(&mut store, 3).expect_err("must fail");
        assert!(error.to_string().contains("fr/home"));
        assert!(chain.historical_snapshot(&mut store, 3).is_err());
        assert_eq!(store.request_count, 0);
    }

    #[test]
    fn transitions_after_watermark_skip_older_entries() {
        let mut store = MockStore::default();
        store.add_version(page(1, "home", "v1", date(1)), 11);
        store.add_version(page(1, "home", "v2", date(2)), 12);
        let chain = HistoryChain::build(
            page(1, "home", "v3", date(3)),
            vec![record(12, date(2), "edit"), record(11, date(1), "initial")],
        )
        .expect("chain");

        let after = chain
            .transitions_after(&mut store, Some(date(2)))
            .expect("transitions");
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].version_id, None);
        assert_eq!(after[0].action_type, "current");
        assert_eq!(after[0].kind, TransitionKind::Edited);
    }

    #[test]
    fn fully_reconciled_page_fetches_nothing() {
        let mut store = MockStore::default();
        store.add_version(page(1, "home", "v1", date(1)), 11);
        let chain = HistoryChain::build(
            page(1, "home", "v2", date(2)),
            vec![record(11, date(1), "initial")],
        )
        .expect("chain");

        let after = chain
            .transitions_after(&mut store, Some(date(2)))
            .expect("transitions");
        assert!(after.is_empty());
        assert_eq!(store.version_requests, 0);
    }

    #[test]
    fn equal_dates_keep_trail_order() {
        let when = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let chain = HistoryChain::build(
            PageSnapshot {
                updated_at: Some(when),
                ..page(1, "home", "v3", when)
            },
            vec![record(12, when, "edit"), record(11, when, "initial")],
        )
        .expect("chain");
        let ids = (0..chain.len())
            .map(|index| chain.entry(index).and_then(|entry| entry.version_id))
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![Some(11), Some(12), None]);
    }

    #[test]
    fn diff_marks_changed_lines() {
        let diff = content_diff("a\nb\n", "a\nc\n", "before", "after");
        assert!(diff.contains("--- before"));
        assert!(diff.contains("+++ after"));
        assert!(diff.contains("-b"));
        assert!(diff.contains("+c"));
    }
}
