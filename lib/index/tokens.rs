//! Append-only interner for path components.

use std::ffi::{OsStr, OsString};
use std::sync::{PoisonError, RwLock};

use rustc_hash::FxHashMap;

/// Dense ID for an interned path component. IDs are monotonic from zero in
/// first-seen order.
pub type TokenId = u64;

#[derive(Default)]
struct Tables {
    forward: FxHashMap<Box<OsStr>, TokenId>,
    reverse: Vec<Box<OsStr>>,
}

/// Maps path components to dense integer IDs and back.
///
/// Components are never removed; both directions live until process exit.
#[derive(Default)]
pub struct TokenTable {
    tables: RwLock<Tables>,
}

impl TokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the ID for `component` and whether this call interned it.
    ///
    /// The ID is taken from the reverse sequence length only after the
    /// duplicate check, under the same writer lock, so the observed ID
    /// sequence has no gaps even when concurrent callers race on the same
    /// component.
    pub fn get_or_insert(&self, component: &OsStr) -> (TokenId, bool) {
        let mut tables = self
            .tables
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(&id) = tables.forward.get(component) {
            return (id, false);
        }

        let id = tables.reverse.len() as TokenId;
        let owned: Box<OsStr> = component.into();
        tables.reverse.push(owned.clone());
        tables.forward.insert(owned, id);
        (id, true)
    }

    /// The component interned under `id`, or `None` if `id` was never issued.
    pub fn reverse(&self, id: TokenId) -> Option<OsString> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let index = usize::try_from(id).ok()?;
        tables.reverse.get(index).map(|c| c.as_ref().to_owned())
    }

    /// Number of distinct components interned so far.
    pub fn len(&self) -> usize {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .reverse
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
