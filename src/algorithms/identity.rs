use crate::models::{EntityKind, IdentityBinding};
use std::collections::HashMap;

/// Dense index space for one entity kind.
#[derive(Debug, Clone, Default)]
struct IdSpace {
    by_id: HashMap<String, usize>,
    by_index: Vec<String>,
}

impl IdSpace {
    fn resolve_or_create(&mut self, external_id: &str) -> (usize, bool) {
        if let Some(&index) = self.by_id.get(external_id) {
            return (index, false);
        }
        let index = self.by_index.len();
        self.by_id.insert(external_id.to_string(), index);
        self.by_index.push(external_id.to_string());
        (index, true)
    }
}

/// Bidirectional mapping between external ids and dense row indices.
///
/// Indices are handed out consecutively from zero in first-seen order and are
/// never reassigned.
#[derive(Debug, Clone, Default)]
pub struct IdentityIndex {
    users: IdSpace,
    items: IdSpace,
}

impl IdentityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds an index from ordered id lists; position is the dense index.
    /// Returns `None` if either list contains a duplicate.
    pub fn from_ordered(users: Vec<String>, items: Vec<String>) -> Option<Self> {
        let mut index = Self::new();
        for id in users {
            if !index.resolve_or_create(EntityKind::User, &id).1 {
                return None;
            }
        }
        for id in items {
            if !index.resolve_or_create(EntityKind::Item, &id).1 {
                return None;
            }
        }
        Some(index)
    }

    fn space(&self, kind: EntityKind) -> &IdSpace {
        match kind {
            EntityKind::User => &self.users,
            EntityKind::Item => &self.items,
        }
    }

    fn space_mut(&mut self, kind: EntityKind) -> &mut IdSpace {
        match kind {
            EntityKind::User => &mut self.users,
            EntityKind::Item => &mut self.items,
        }
    }

    pub fn resolve_or_create(&mut self, kind: EntityKind, external_id: &str) -> (usize, bool) {
        self.space_mut(kind).resolve_or_create(external_id)
    }

    pub fn lookup(&self, kind: EntityKind, external_id: &str) -> Option<usize> {
        self.space(kind).by_id.get(external_id).copied()
    }

    pub fn reverse_lookup(&self, kind: EntityKind, index: usize) -> Option<&str> {
        self.space(kind).by_index.get(index).map(String::as_str)
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        self.space(kind).by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.by_index.is_empty() && self.items.by_index.is_empty()
    }

    /// External ids in index order.
    pub fn ids(&self, kind: EntityKind) -> &[String] {
        &self.space(kind).by_index
    }

    pub fn bindings(&self, kind: EntityKind) -> Vec<IdentityBinding> {
        self.bindings_from(kind, 0)
    }

    /// Bindings with `index >= start`, in index order.
    pub fn bindings_from(&self, kind: EntityKind, start: usize) -> Vec<IdentityBinding> {
        self.space(kind)
            .by_index
            .iter()
            .enumerate()
            .skip(start)
            .map(|(index, external_id)| IdentityBinding {
                external_id: external_id.clone(),
                index,
            })
            .collect()
    }
}
