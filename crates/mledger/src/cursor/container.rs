//! Cursor container
//!
//! Keeps a ledger's cursors ordered by one tracked position so the slowest
//! one is found in O(log n). The ledger keeps two of these: every cursor by
//! mark-delete position (trimming) and the active cursors by their cache
//! eviction position.

use mledger_common::Position;
use std::collections::{BTreeSet, HashMap};

/// Slowest-position change reported by [`ManagedCursorContainer::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlowestChange {
    pub old: Option<Position>,
    pub new: Option<Position>,
}

impl SlowestChange {
    #[must_use]
    pub fn changed(&self) -> bool {
        self.old != self.new
    }
}

/// Named items ordered by a position.
#[derive(Debug)]
pub struct ManagedCursorContainer<C> {
    items: HashMap<String, (Position, C)>,
    order: BTreeSet<(Position, String)>,
}

impl<C> Default for ManagedCursorContainer<C> {
    fn default() -> Self {
        Self {
            items: HashMap::new(),
            order: BTreeSet::new(),
        }
    }
}

impl<C: Clone> ManagedCursorContainer<C> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `name` at `position`.
    pub fn add(&mut self, name: &str, position: Position, item: C) -> SlowestChange {
        let old = self.slowest_position();
        if let Some((prev, _)) = self.items.remove(name) {
            self.order.remove(&(prev, name.to_string()));
        }
        self.items.insert(name.to_string(), (position, item));
        self.order.insert((position, name.to_string()));
        SlowestChange {
            old,
            new: self.slowest_position(),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<C> {
        let (position, item) = self.items.remove(name)?;
        self.order.remove(&(position, name.to_string()));
        Some(item)
    }

    /// Move `name` to `position`. Returns `None` when it is not tracked.
    pub fn update(&mut self, name: &str, position: Position) -> Option<SlowestChange> {
        let old = self.slowest_position();
        let entry = self.items.get_mut(name)?;
        if entry.0 != position {
            self.order.remove(&(entry.0, name.to_string()));
            entry.0 = position;
            self.order.insert((position, name.to_string()));
        }
        Some(SlowestChange {
            old,
            new: self.slowest_position(),
        })
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<C> {
        self.items.get(name).map(|(_, item)| item.clone())
    }

    #[must_use]
    pub fn position(&self, name: &str) -> Option<Position> {
        self.items.get(name).map(|(p, _)| *p)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.items.contains_key(name)
    }

    #[must_use]
    pub fn slowest_position(&self) -> Option<Position> {
        self.order.iter().next().map(|(p, _)| *p)
    }

    #[must_use]
    pub fn slowest(&self) -> Option<(String, C)> {
        let (_, name) = self.order.iter().next()?;
        self.items
            .get(name)
            .map(|(_, item)| (name.clone(), item.clone()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items in ascending position order
    #[must_use]
    pub fn items(&self) -> Vec<C> {
        self.order
            .iter()
            .filter_map(|(_, name)| self.items.get(name).map(|(_, item)| item.clone()))
            .collect()
    }

    /// Names in ascending position order
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.order.iter().map(|(_, name)| name.clone()).collect()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.order.clear();
    }
}
