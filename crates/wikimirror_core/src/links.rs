use anyhow::{Context, Result};

use crate::store::ContentStore;
use crate::tree::TreeIndex;

/// Link targets with these extensions point at assets, not pages.
const ASSET_EXTENSIONS: [&str; 9] = [
    ".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp", ".ods", ".pdf", ".zip",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokenLink {
    /// `locale/path` of the page holding the link.
    pub source: String,
    pub target: String,
    pub line: String,
    /// Live pages whose last segment contains the target's last segment.
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkReport {
    pub pages: usize,
    pub links: usize,
    pub broken: Vec<BrokenLink>,
    pub request_count: usize,
}

/// Scan every live page for markdown links to pages that do not exist.
pub fn check_links<S: ContentStore>(store: &mut S, collation_locale: &str) -> Result<LinkReport> {
    let pages = store.list_pages().context("failed to list pages")?;
    let tree = TreeIndex::<String>::new(collation_locale)?;
    for page in &pages {
        tree.insert(&format!("/{}/{}", page.locale, page.path), page.display_key());
    }

    let mut report = LinkReport {
        pages: pages.len(),
        ..LinkReport::default()
    };
    for page in &pages {
        let folder = parent_path(&format!("/{}/{}", page.locale, page.path));
        for line in page.content.lines() {
            for raw in link_targets(line) {
                report.links += 1;
                let Some(target) = page_target(raw) else {
                    continue;
                };
                let candidates = if let Some(absolute) = target.strip_prefix('/') {
                    vec![
                        format!("/{}/{absolute}", page.locale),
                        format!("/{absolute}"),
                    ]
                } else {
                    vec![format!("{folder}/{target}")]
                };
                if candidates.iter().any(|candidate| is_live_page(&tree, candidate)) {
                    continue;
                }
                tracing::debug!(page = %page.display_key(), target, "broken link");
                report.broken.push(BrokenLink {
                    source: page.display_key(),
                    target: target.to_string(),
                    line: line.trim().to_string(),
                    suggestions: suggestions(&tree, target),
                });
            }
        }
    }
    report.request_count = store.request_count();
    Ok(report)
}

/// Targets of `[label](target "title")` links on one line.
pub fn link_targets(line: &str) -> Vec<&str> {
    let mut targets = Vec::new();
    let mut rest = line;
    while let Some(start) = rest.find("](") {
        let after = &rest[start + 2..];
        let Some(end) = after.find(')') else {
            break;
        };
        targets.push(after[..end].split_whitespace().next().unwrap_or(""));
        rest = &after[end + 1..];
    }
    targets
}

/// The page part of a link target; `None` for external, anchor-only and asset links.
fn page_target(raw: &str) -> Option<&str> {
    if raw.contains("://") || raw.starts_with("mailto:") || raw.starts_with("tel:") {
        return None;
    }
    let target = raw.split(['#', '?']).next().unwrap_or("").trim_end_matches('/');
    if target.is_empty() {
        return None;
    }
    let last = target.rsplit('/').next().unwrap_or(target).to_lowercase();
    if ASSET_EXTENSIONS.iter().any(|extension| last.ends_with(extension)) {
        return None;
    }
    Some(target)
}

fn is_live_page(tree: &TreeIndex<String>, path: &str) -> bool {
    let wanted = normalize(path);
    let node = tree.find(&wanted);
    node.path() == wanted && node.payload().is_some()
}

fn suggestions(tree: &TreeIndex<String>, target: &str) -> Vec<String> {
    let name = target.rsplit('/').next().unwrap_or(target);
    if name.is_empty() || name == "." || name == ".." {
        return Vec::new();
    }
    tree.bound_nodes()
        .into_iter()
        .filter(|node| node.name().contains(name))
        .filter_map(|node| node.payload().map(|key| key.clone()))
        .collect()
}

fn parent_path(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => parent.to_string(),
        _ => String::new(),
    }
}

/// Resolve `.` and `..` segments of an absolute slash path.
fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            name => segments.push(name),
        }
    }
    format!("/{}", segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::{check_links, link_targets, normalize};
    use crate::testing::{MockStore, date, page};
    use crate::tree::DEFAULT_COLLATION_LOCALE;

    #[test]
    fn extracts_every_link_target_on_a_line() {
        assert_eq!(
            link_targets("voir [a](/maison) et [b](garage \"Garage\") puis [c](https://x.org)"),
            vec!["/maison", "garage", "https://x.org"]
        );
        assert!(link_targets("pas de lien (ici)").is_empty());
        assert!(link_targets("[coupé](/maison").is_empty());
    }

    #[test]
    fn normalizes_relative_segments() {
        assert_eq!(normalize("/fr/maison/./../garage"), "/fr/garage");
        assert_eq!(normalize("/fr/../../x"), "/x");
    }

    #[test]
    fn reports_only_links_to_missing_pages() {
        let mut store = MockStore::default();
        store.add_page(
            page(
                1,
                "maison",
                "[ok](/maison/garage)\n[locale](/fr/maison)\n[relatif](maison/garage#porte)\n[photo](/photos/porte.JPG)\n[web](https://wiki.example.org/x)\n[ancre](#haut)\n[perdu](/maison/grenier)",
                date(1),
            ),
            Vec::new(),
        );
        store.add_page(page(2, "maison/garage", "[retour](../maison)\n[voisin](cave)", date(1)), Vec::new());
        store.add_page(page(3, "maison/cave-voutee", "", date(1)), Vec::new());

        let report = check_links(&mut store, DEFAULT_COLLATION_LOCALE).expect("check");

        assert_eq!(report.pages, 3);
        assert_eq!(report.links, 9);
        let broken = report
            .broken
            .iter()
            .map(|link| (link.source.as_str(), link.target.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            broken,
            vec![("fr/maison", "/maison/grenier"), ("fr/maison/garage", "cave")]
        );
        assert_eq!(report.broken[0].line, "[perdu](/maison/grenier)");
        assert!(report.broken[0].suggestions.is_empty());
        assert_eq!(report.broken[1].suggestions, vec!["fr/maison/cave-voutee".to_string()]);
    }

    #[test]
    fn store_failure_is_reported() {
        let mut store = MockStore {
            unreachable: true,
            ..MockStore::default()
        };
        let error = check_links(&mut store, DEFAULT_COLLATION_LOCALE).expect_err("must fail");
        assert!(format!("{error:#}").contains("failed to list pages"));
    }
}
