use std::collections::HashMap;

/// Character trie over package names.
///
/// A rule ending in `*` marks the node before the `*` as a wildcard: any name
/// reaching that node matches, whatever follows. Other rules mark their final
/// node as a leaf, which matches only when the name ends exactly there.
#[derive(Clone, Debug, Default)]
pub struct PackageTrie {
    root: Node,
    rules: usize,
}

#[derive(Clone, Debug, Default)]
struct Node {
    children: HashMap<char, Node>,
    leaf: bool,
    wildcard: bool,
}

impl PackageTrie {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rule: &str) {
        self.rules += 1;
        let (prefix, wildcard) = match rule.strip_suffix('*') {
            Some(prefix) => (prefix, true),
            None => (rule, false),
        };
        let mut node = &mut self.root;
        for ch in prefix.chars() {
            node = node.children.entry(ch).or_default();
        }
        if wildcard {
            node.wildcard = true;
        } else {
            node.leaf = true;
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        let mut node = &self.root;
        if node.wildcard {
            return true;
        }
        for ch in name.chars() {
            let Some(next) = node.children.get(&ch) else {
                return false;
            };
            node = next;
            if node.wildcard {
                return true;
            }
        }
        node.leaf
    }

    pub fn matches_any<S: AsRef<str>>(&self, names: &[S]) -> bool {
        !self.is_empty() && names.iter().any(|name| self.matches(name.as_ref()))
    }

    /// Number of rules inserted (duplicates included).
    pub fn len(&self) -> usize {
        self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules == 0
    }
}

impl<'a> FromIterator<&'a str> for PackageTrie {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut trie = Self::new();
        for rule in iter {
            trie.insert(rule);
        }
        trie
    }
}
