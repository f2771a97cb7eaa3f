//! Static hosts table
//!
//! A domain trie keyed segment-wise (split on `.`), stored reversed so
//! the TLD sits at the root. Two wildcard segments are honored at
//! insertion time:
//!
//! - `*` matches exactly one segment (`*.example.com` matches
//!   `mail.example.com` but not `example.com` or `a.b.example.com`)
//! - `+` matches the domain itself and any number of leading segments
//!   (`+.example.com` matches `example.com`, `mail.example.com`,
//!   `a.b.example.com`)
//!
//! `search` returns the data at the longest matching node. Inserts with
//! the same key overwrite. The trie is immutable once published;
//! hot-reload installs a fresh trie by pointer swap.

use std::collections::HashMap;

const WILDCARD: &str = "*";
const SUFFIX_WILDCARD: &str = "+";

#[derive(Debug, Clone)]
struct Node<T> {
    children: HashMap<String, Node<T>>,
    data: Option<T>,
}

impl<T> Node<T> {
    fn new() -> Self {
        Self {
            children: HashMap::new(),
            data: None,
        }
    }
}

/// Domain trie with wildcard support
#[derive(Debug, Clone)]
pub struct DomainTrie<T> {
    root: Node<T>,
    len: usize,
}

impl<T: Clone> DomainTrie<T> {
    /// Create an empty trie
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: Node::new(),
            len: 0,
        }
    }

    /// Insert a domain pattern
    ///
    /// Returns `false` (and inserts nothing) when the pattern is not a
    /// valid domain: empty segments, or wildcards in a non-leading
    /// position.
    pub fn insert(&mut self, domain: &str, data: T) -> bool {
        let Some(parts) = split_valid(domain) else {
            return false;
        };

        if parts[0] == SUFFIX_WILDCARD {
            // `+.example.com` covers the bare domain too
            self.insert_parts(&parts[1..], data.clone());
        }
        self.insert_parts(&parts, data);
        true
    }

    fn insert_parts(&mut self, parts: &[&str], data: T) {
        let mut node = &mut self.root;
        for part in parts.iter().rev() {
            node = node
                .children
                .entry((*part).to_string())
                .or_insert_with(Node::new);
        }
        if node.data.is_none() {
            self.len += 1;
        }
        node.data = Some(data);
    }

    /// Look up the longest matching pattern for `domain`
    #[must_use]
    pub fn search(&self, domain: &str) -> Option<&T> {
        let parts = split_valid(domain)?;
        if parts[0] == WILDCARD || parts[0] == SUFFIX_WILDCARD {
            return None;
        }
        Self::search_node(&self.root, &parts)
    }

    fn search_node<'a>(node: &'a Node<T>, parts: &[&str]) -> Option<&'a T> {
        if parts.is_empty() {
            return node.data.as_ref();
        }

        let part = parts[parts.len() - 1];
        let rest = &parts[..parts.len() - 1];

        if let Some(child) = node.children.get(part) {
            if let Some(data) = Self::search_node(child, rest) {
                return Some(data);
            }
        }
        if let Some(child) = node.children.get(WILDCARD) {
            if let Some(data) = Self::search_node(child, rest) {
                return Some(data);
            }
        }
        // `+` swallows every remaining segment
        node.children
            .get(SUFFIX_WILDCARD)
            .and_then(|child| child.data.as_ref())
    }

    /// Number of stored patterns
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the trie holds no patterns
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T: Clone> Default for DomainTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a domain into segments, rejecting empty segments and wildcards
/// placed anywhere but the leading position.
fn split_valid(domain: &str) -> Option<Vec<&str>> {
    if domain.is_empty() {
        return None;
    }
    let parts: Vec<&str> = domain.split('.').collect();
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            return None;
        }
        if i > 0 && (*part == WILDCARD || *part == SUFFIX_WILDCARD) {
            return None;
        }
    }
    Some(parts)
}
