use std::cell::{Ref, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use anyhow::{Result, anyhow};
use icu::collator::{Collator, CollatorOptions};
use icu::locid::Locale;

pub const DEFAULT_COLLATION_LOCALE: &str = "fr-FR";

/// A node of the path tree. Children are owned by their parent; the parent
/// link is only used to walk upwards.
pub struct TreeNode<T> {
    name: String,
    parent: Weak<TreeNode<T>>,
    children: RefCell<HashMap<String, Rc<TreeNode<T>>>>,
    payload: RefCell<Option<T>>,
}

impl<T> TreeNode<T> {
    fn new_root() -> Rc<Self> {
        Rc::new(Self {
            name: String::new(),
            parent: Weak::new(),
            children: RefCell::new(HashMap::new()),
            payload: RefCell::new(None),
        })
    }

    fn new_child(parent: &Rc<Self>, name: &str) -> Rc<Self> {
        Rc::new(Self {
            name: name.to_string(),
            parent: Rc::downgrade(parent),
            children: RefCell::new(HashMap::new()),
            payload: RefCell::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<Rc<Self>> {
        self.parent.upgrade()
    }

    pub fn is_root(&self) -> bool {
        self.parent.upgrade().is_none()
    }

    pub fn is_folder(&self) -> bool {
        !self.children.borrow().is_empty()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.borrow().is_empty()
    }

    pub fn child(&self, name: &str) -> Option<Rc<Self>> {
        self.children.borrow().get(name).cloned()
    }

    pub fn payload(&self) -> Option<Ref<'_, T>> {
        Ref::filter_map(self.payload.borrow(), Option::as_ref).ok()
    }

    /// Absolute slash path of the node, `/` for the root.
    pub fn path(&self) -> String {
        let mut names = vec![self.name.clone()];
        let mut cursor = self.parent.upgrade();
        while let Some(node) = cursor {
            if node.is_root() {
                break;
            }
            names.push(node.name.clone());
            cursor = node.parent.upgrade();
        }
        if self.is_root() {
            return "/".to_string();
        }
        names.reverse();
        format!("/{}", names.join("/"))
    }
}

impl<T> fmt::Debug for TreeNode<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TreeNode")
            .field("path", &self.path())
            .field("children", &self.children.borrow().len())
            .field("bound", &self.payload.borrow().is_some())
            .finish()
    }
}

/// Slash-path namespace over a flat list of remote items.
///
/// Trees are built once per run and never patched: when the remote state is
/// assumed to have changed a new index is built.
pub struct TreeIndex<T> {
    root: Rc<TreeNode<T>>,
    collator: Collator,
}

impl<T> TreeIndex<T> {
    pub fn new(collation_locale: &str) -> Result<Self> {
        let locale: Locale = collation_locale
            .parse()
            .map_err(|error| anyhow!("invalid collation locale {collation_locale}: {error:?}"))?;
        let collator = Collator::try_new(&locale.into(), CollatorOptions::new())
            .map_err(|error| anyhow!("no collation data for {collation_locale}: {error:?}"))?;
        Ok(Self {
            root: TreeNode::new_root(),
            collator,
        })
    }

    pub fn root(&self) -> Rc<TreeNode<T>> {
        Rc::clone(&self.root)
    }

    /// Bind `payload` at `path`, creating every missing intermediate folder.
    pub fn insert(&self, path: &str, payload: T) -> Rc<TreeNode<T>> {
        let mut node = Rc::clone(&self.root);
        for segment in segments(path) {
            let existing = node.child(segment);
            node = match existing {
                Some(child) => child,
                None => {
                    let child = TreeNode::new_child(&node, segment);
                    node.children
                        .borrow_mut()
                        .insert(segment.to_string(), Rc::clone(&child));
                    child
                }
            };
        }
        *node.payload.borrow_mut() = Some(payload);
        node
    }

    pub fn find(&self, path: &str) -> Rc<TreeNode<T>> {
        self.find_from(&self.root, path)
    }

    /// Resolve `path` from `start` (or from the root when it begins with `/`).
    ///
    /// Never fails: resolution stops at the deepest node reached, so callers
    /// compare the returned node's `path()` with what they asked for.
    pub fn find_from(&self, start: &Rc<TreeNode<T>>, path: &str) -> Rc<TreeNode<T>> {
        let mut node = if path.starts_with('/') {
            Rc::clone(&self.root)
        } else {
            Rc::clone(start)
        };
        for segment in segments(path) {
            let next = match segment {
                "." => continue,
                ".." => node.parent(),
                name => node.child(name),
            };
            match next {
                Some(next) => node = next,
                None if segment == ".." => continue,
                None => break,
            }
        }
        node
    }

    /// Children in locale-aware order.
    pub fn children(&self, node: &TreeNode<T>) -> Vec<Rc<TreeNode<T>>> {
        let mut children = node.children.borrow().values().cloned().collect::<Vec<_>>();
        children.sort_by(|left, right| self.collator.compare(&left.name, &right.name));
        children
    }

    pub fn folder_children(&self, node: &TreeNode<T>) -> Vec<Rc<TreeNode<T>>> {
        self.children(node)
            .into_iter()
            .filter(|child| child.is_folder())
            .collect()
    }

    pub fn leaf_children(&self, node: &TreeNode<T>) -> Vec<Rc<TreeNode<T>>> {
        self.children(node)
            .into_iter()
            .filter(|child| child.is_leaf())
            .collect()
    }

    /// Every node carrying a payload, depth first in collated order.
    pub fn bound_nodes(&self) -> Vec<Rc<TreeNode<T>>> {
        let mut output = Vec::new();
        self.collect_bound(&self.root, &mut output);
        output
    }

    fn collect_bound(&self, node: &Rc<TreeNode<T>>, output: &mut Vec<Rc<TreeNode<T>>>) {
        if node.payload.borrow().is_some() {
            output.push(Rc::clone(node));
        }
        for child in self.children(node) {
            self.collect_bound(&child, output);
        }
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}
