//! Wildcard-aware permission trie
//!
//! Permissions are dot-separated (`chat.color.red`). A node's value is the
//! default for everything below it unless a deeper node overrides it, so
//! `chat.*` (stored on the `chat` node) configures `chat.color.red` until
//! `chat.color.red` itself says otherwise. The root value is the overall
//! default. Lookups are case-insensitive.

use std::collections::HashMap;

/// Separator between permission segments
const SEPARATOR: char = '.';

/// Wildcard segment, stripped when building the tree
const WILDCARD: &str = "*";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Node {
    value: i32,
    children: HashMap<String, Node>,
}

/// Immutable permission trie built from a flat permission map
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeTree {
    root: Node,
}

impl NodeTree {
    /// Build a tree from `permission -> value` pairs with `default_value` at the root
    ///
    /// Trailing `*` segments address the parent node, so `a.*` and `a` set
    /// the same node and a bare `*` sets the root. When two entries land on
    /// one node the larger magnitude wins; on equal magnitude the explicit
    /// form beats the wildcard form. Zero values are ignored.
    pub fn of<I, K>(values: I, default_value: i32) -> Self
    where
        I: IntoIterator<Item = (K, i32)>,
        K: AsRef<str>,
    {
        let mut entries: Vec<(Vec<String>, bool, i32)> = values
            .into_iter()
            .filter(|(_, value)| *value != 0)
            .map(|(permission, value)| {
                let permission = permission.as_ref().to_lowercase();
                let mut segments: Vec<String> =
                    permission.split(SEPARATOR).map(str::to_string).collect();
                let mut wildcard = false;
                while segments.last().map(String::as_str) == Some(WILDCARD) {
                    segments.pop();
                    wildcard = true;
                }
                (segments, !wildcard, value)
            })
            .collect();
        // Wildcard forms first so an explicit entry of equal weight lands last
        entries.sort();

        let mut root = Node {
            value: default_value,
            children: HashMap::new(),
        };
        for (segments, _, value) in entries {
            let mut node = &mut root;
            for segment in segments {
                node = node.children.entry(segment).or_default();
            }
            if node.value == 0 || value.abs() >= node.value.abs() {
                node.value = value;
            }
        }

        Self { root }
    }

    /// Resolve `permission`: the deepest node on its path with a non-zero value wins
    ///
    /// Returns 0 when nothing on the path, root included, is set.
    pub fn get(&self, permission: &str) -> i32 {
        self.resolve(permission, self.root.value)
    }

    /// Like [`get`](Self::get) but ignoring the root value
    ///
    /// Used when several trees are consulted in priority order and their
    /// defaults only apply once none of them configures the permission.
    pub fn get_explicit(&self, permission: &str) -> i32 {
        self.resolve(permission, 0)
    }

    fn resolve(&self, permission: &str, mut value: i32) -> i32 {
        let permission = permission.to_lowercase();
        let mut node = &self.root;

        for segment in permission.split(SEPARATOR) {
            match node.children.get(segment) {
                Some(child) => {
                    node = child;
                    if node.value != 0 {
                        value = node.value;
                    }
                }
                None => break,
            }
        }
        value
    }

    /// Value at the root, applied to anything not otherwise configured
    pub fn default_value(&self) -> i32 {
        self.root.value
    }

    /// Flatten back into explicitly set `permission -> value` entries
    ///
    /// The root value is not included.
    pub fn as_map(&self) -> HashMap<String, i32> {
        let mut out = HashMap::new();
        let mut stack: Vec<(String, &Node)> = self
            .root
            .children
            .iter()
            .map(|(name, node)| (name.clone(), node))
            .collect();

        while let Some((path, node)) = stack.pop() {
            if node.value != 0 {
                out.insert(path.clone(), node.value);
            }
            for (name, child) in &node.children {
                stack.push((format!("{}{}{}", path, SEPARATOR, name), child));
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.root.value == 0 && self.root.children.is_empty()
    }
}
