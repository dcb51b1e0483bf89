//! Trie of interned path components with an inode-to-path index.
//!
//! The table is built once by the startup scan and queried during log
//! emission to turn swept inode numbers back into source-relative paths.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt as _;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use rustc_hash::FxHashMap;
use tracing::trace;

use super::tokens::{TokenId, TokenTable};

const SEPARATOR: u8 = b'/';

/// One component of a path. Children are owned through `Arc`; the parent
/// back reference is a `Weak` so the trie has no ownership cycle. Nodes are
/// never relinked once created.
pub struct MonikerNode {
    token: TokenId,
    parent: Weak<MonikerNode>,
    children: RwLock<FxHashMap<TokenId, Arc<MonikerNode>>>,
}

impl MonikerNode {
    fn root() -> Arc<Self> {
        Arc::new(Self {
            // The root's token is meaningless; it is never part of a path.
            token: 0,
            parent: Weak::new(),
            children: RwLock::new(FxHashMap::default()),
        })
    }

    /// The child for `token`, created if absent. An optimistic shared probe
    /// precedes the exclusive insert, which tolerates losing the race to a
    /// concurrent insert of the same child.
    pub fn child(self: &Arc<Self>, token: TokenId) -> Arc<MonikerNode> {
        {
            let children = self
                .children
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(child) = children.get(&token) {
                return Arc::clone(child);
            }
        }

        let mut children = self
            .children
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(children.entry(token).or_insert_with(|| {
            Arc::new(MonikerNode {
                token,
                parent: Arc::downgrade(self),
                children: RwLock::new(FxHashMap::default()),
            })
        }))
    }

    pub fn token(&self) -> TokenId {
        self.token
    }

    /// Component IDs from the top of the trie down to this node. The root
    /// contributes nothing.
    pub fn path(&self) -> Vec<TokenId> {
        let mut tokens = Vec::new();
        let mut parent = self.parent.upgrade();
        if parent.is_some() {
            tokens.push(self.token);
        }
        while let Some(node) = parent {
            parent = node.parent.upgrade();
            if parent.is_some() {
                tokens.push(node.token);
            }
        }
        tokens.reverse();
        tokens
    }

    fn clear(&self) {
        self.children
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// The trie root plus an index from source inode number to the terminal
/// node of that inode's path.
pub struct MonikerTable {
    root: Arc<MonikerNode>,
    terminals: RwLock<FxHashMap<u64, Arc<MonikerNode>>>,
    tokens: TokenTable,
}

impl MonikerTable {
    /// A table whose root entry maps `root_node_id` to the synthetic
    /// `<root>` moniker.
    pub fn new(root_node_id: u64) -> Self {
        let table = Self {
            root: MonikerNode::root(),
            terminals: RwLock::new(FxHashMap::default()),
            tokens: TokenTable::new(),
        };
        table.insert(root_node_id, "<root>");
        table
    }

    /// Record `ino` as reachable at `path` (separator-delimited, relative to
    /// the source root). Empty components are skipped. Returns true iff the
    /// terminal index did not previously contain `ino`; a repeated insert
    /// leaves the existing entry untouched.
    pub fn insert(&self, ino: u64, path: impl AsRef<OsStr>) -> bool {
        // The terminal lock is held across tokenize, descend, and record so
        // an observer sees the whole path or none of it.
        let mut terminals = self
            .terminals
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let mut node = Arc::clone(&self.root);
        for component in components(path.as_ref()) {
            let (token, _) = self.tokens.get_or_insert(component);
            node = node.child(token);
        }

        use std::collections::hash_map::Entry;
        match terminals.entry(ino) {
            Entry::Vacant(slot) => {
                slot.insert(node);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Inode churn is not reflected in the index; see DESIGN.md.
    pub fn remove(&self, _ino: u64) -> bool {
        false
    }

    /// The separator-joined path recorded for `ino`, or `None` when the
    /// inode has no entry or one of its components cannot be resolved.
    pub fn resolve(&self, ino: u64) -> Option<OsString> {
        let node = {
            let terminals = self
                .terminals
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(terminals.get(&ino)?)
        };

        let mut result = OsString::new();
        for (i, token) in node.path().into_iter().enumerate() {
            let component = self.tokens.reverse(token)?;
            if i > 0 {
                result.push(OsStr::from_bytes(&[SEPARATOR]));
            }
            result.push(&component);
        }
        trace!(ino, path = ?result, "resolved moniker");
        Some(result)
    }

    /// Number of terminal entries.
    pub fn len(&self) -> usize {
        self.terminals
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every terminal entry and all trie children.
    pub fn clear(&self) {
        let mut terminals = self
            .terminals
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        terminals.clear();
        self.root.clear();
    }
}

fn components(path: &OsStr) -> impl Iterator<Item = &OsStr> {
    path.as_bytes()
        .split(|b| *b == SEPARATOR)
        .filter(|c| !c.is_empty())
        .map(OsStr::from_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(table: &MonikerTable, ino: u64) -> Option<String> {
        table
            .resolve(ino)
            .map(|p| p.to_string_lossy().into_owned())
    }

    #[test]
    fn insert_and_resolve_paths() {
        let table = MonikerTable::new(0);

        assert!(table.insert(1, "a"));
        assert!(table.insert(2, "a/b0"));
        assert!(table.insert(3, "a/b1"));
        assert!(table.insert(4, "a/b1/c0"));

        assert_eq!(resolved(&table, 1).as_deref(), Some("a"));
        assert_eq!(resolved(&table, 2).as_deref(), Some("a/b0"));
        assert_eq!(resolved(&table, 3).as_deref(), Some("a/b1"));
        assert_eq!(resolved(&table, 4).as_deref(), Some("a/b1/c0"));
        assert_eq!(resolved(&table, 99), None, "inode 99 was never inserted");
    }

    #[test]
    fn root_id_resolves_to_root_moniker() {
        let table = MonikerTable::new(7);
        assert_eq!(resolved(&table, 7).as_deref(), Some("<root>"));
    }

    #[test]
    fn node_chain_reconstructs_in_order() {
        let root = MonikerNode::root();
        let node = root
            .child(8)
            .child(6)
            .child(7)
            .child(5)
            .child(3)
            .child(0)
            .child(9);
        assert_eq!(node.path(), vec![8, 6, 7, 5, 3, 0, 9]);
        assert_eq!(root.path(), Vec::<TokenId>::new(), "root path is empty");
    }

    #[test]
    fn child_is_idempotent() {
        let root = MonikerNode::root();
        let a = root.child(42);
        let b = root.child(42);
        assert!(Arc::ptr_eq(&a, &b), "same token must yield the same node");
    }

    #[test]
    fn repeated_insert_leaves_index_unchanged() {
        let table = MonikerTable::new(0);
        assert!(table.insert(1, "x/y"));
        let before = table.len();
        assert!(!table.insert(1, "x/y"), "second insert reports existing");
        assert_eq!(table.len(), before, "no new terminal entries");
        assert_eq!(resolved(&table, 1).as_deref(), Some("x/y"));
    }

    #[test]
    fn empty_components_are_skipped() {
        let table = MonikerTable::new(0);
        assert!(table.insert(5, "/a//b/"));
        assert_eq!(resolved(&table, 5).as_deref(), Some("a/b"));
    }

    #[test]
    fn same_path_under_two_inodes() {
        let table = MonikerTable::new(0);
        assert!(table.insert(1, "dir/file"));
        assert!(table.insert(2, "dir/file"), "distinct inode is a new entry");
        assert_eq!(resolved(&table, 1).as_deref(), Some("dir/file"));
        assert_eq!(resolved(&table, 2).as_deref(), Some("dir/file"));
    }

    #[test]
    fn clear_empties_the_table() {
        let table = MonikerTable::new(0);
        table.insert(1, "a/b/c");
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.resolve(1), None);
        assert_eq!(table.resolve(0), None, "the root entry is gone too");
    }

    #[test]
    fn remove_is_a_stub() {
        let table = MonikerTable::new(0);
        table.insert(1, "a");
        assert!(!table.remove(1));
        assert_eq!(resolved(&table, 1).as_deref(), Some("a"));
    }

    #[test]
    fn concurrent_inserts_are_all_resolvable() {
        let table = std::sync::Arc::new(MonikerTable::new(0));
        let mut handles = Vec::new();
        for t in 0..4 {
            let table = std::sync::Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                for i in 0..250u64 {
                    let ino = 1 + t * 250 + i;
                    table.insert(ino, format!("shard{t}/dir{}/f{i}", i % 7));
                }
            }));
        }
        for h in handles {
            h.join().expect("worker panicked");
        }
        for t in 0..4u64 {
            for i in 0..250u64 {
                let ino = 1 + t * 250 + i;
                assert_eq!(
                    resolved(&table, ino).as_deref(),
                    Some(format!("shard{t}/dir{}/f{i}", i % 7).as_str()),
                    "inode {ino} must resolve to the path it was inserted with"
                );
            }
        }
    }
}
