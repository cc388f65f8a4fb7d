use std::rc::Rc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};

use crate::history::{HistoryChain, TransitionKind, content_diff};
use crate::store::{ContentStore, PageSnapshot};
use crate::tree::{TreeIndex, TreeNode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSummary {
    pub id: i64,
    pub title: String,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeLine {
    pub depth: usize,
    pub path: String,
    pub name: String,
    pub is_folder: bool,
    pub page: Option<PageSummary>,
}

/// Tree of live pages keyed by `/<locale>/<path>`.
pub fn page_tree(pages: &[PageSnapshot], collation_locale: &str) -> Result<TreeIndex<PageSummary>> {
    let tree = TreeIndex::new(collation_locale)?;
    for page in pages {
        tree.insert(
            &format!("/{}/{}", page.locale, page.path),
            PageSummary {
                id: page.id,
                title: page.title.clone(),
                content_type: page.content_type.clone(),
            },
        );
    }
    Ok(tree)
}

/// Flatten the subtree under `start`, folders before leaves at every level.
pub fn tree_lines(tree: &TreeIndex<PageSummary>, start: &str) -> Result<Vec<TreeLine>> {
    let wanted = normalize_tree_path(start);
    let node = tree.find(&wanted);
    if node.path() != wanted {
        bail!("nothing is mirrored at {wanted}");
    }
    let mut lines = Vec::new();
    collect_lines(tree, &node, 0, &mut lines);
    Ok(lines)
}

fn collect_lines(
    tree: &TreeIndex<PageSummary>,
    node: &Rc<TreeNode<PageSummary>>,
    depth: usize,
    lines: &mut Vec<TreeLine>,
) {
    lines.push(TreeLine {
        depth,
        path: node.path(),
        name: if node.is_root() {
            "/".to_string()
        } else {
            node.name().to_string()
        },
        is_folder: node.is_folder(),
        page: node.payload().map(|summary| summary.clone()),
    });
    let children = tree
        .folder_children(node)
        .into_iter()
        .chain(tree.leaf_children(node));
    for child in children {
        collect_lines(tree, &child, depth + 1, lines);
    }
}

fn normalize_tree_path(path: &str) -> String {
    let segments = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>();
    format!("/{}", segments.join("/"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryLine {
    pub version_id: Option<i64>,
    pub date: DateTime<Utc>,
    pub author: Option<String>,
    pub action_type: String,
    pub tag: &'static str,
    pub path: String,
    pub moved_from: Option<String>,
    /// Unified diff against the previous transition, when asked for and non-empty.
    pub diff: Option<String>,
}

/// Classified chain of one live page, oldest first.
pub fn page_history_lines<S: ContentStore>(
    store: &mut S,
    locale: &str,
    path: &str,
    with_diff: bool,
) -> Result<Vec<HistoryLine>> {
    let wanted = path.trim_matches('/');
    let page = store
        .list_pages()
        .context("failed to list pages")?
        .into_iter()
        .find(|page| page.locale == locale && page.path == wanted);
    let Some(page) = page else {
        bail!("no live page at {locale}/{wanted}");
    };
    let key = page.display_key();
    let history = store
        .page_history(page.id)
        .with_context(|| format!("failed to fetch history of {key}"))?;
    let chain = HistoryChain::build(page, history)?;
    let transitions = chain
        .transitions(store)
        .with_context(|| format!("failed to classify history of {key}"))?;

    let mut lines = Vec::with_capacity(transitions.len());
    let mut previous: Option<(String, String)> = None;
    for transition in &transitions {
        let label = transition
            .version_id
            .map_or_else(|| "current".to_string(), |id| format!("version {id}"));
        let diff = match &previous {
            Some((before_label, before)) if with_diff && *before != transition.snapshot.content => {
                Some(content_diff(
                    before,
                    &transition.snapshot.content,
                    before_label,
                    &label,
                ))
            }
            _ => None,
        };
        let moved_from = match &transition.kind {
            TransitionKind::Moved { from, .. } => Some(from.clone()),
            _ => None,
        };
        lines.push(HistoryLine {
            version_id: transition.version_id,
            date: transition.version_date,
            author: transition.author_name.clone(),
            action_type: transition.action_type.clone(),
            tag: transition.kind.label(),
            path: transition.path().to_string(),
            moved_from,
            diff,
        });
        previous = Some((label, transition.snapshot.content.clone()));
    }
    Ok(lines)
}
