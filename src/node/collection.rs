//! Ordered collections of entity nodes
//!
//! An [`EntityList`] holds the live items of a child collection plus the
//! side-list of removed-but-not-yet-purged items. Removing an item that is
//! not new marks it deleted and parks it on the deleted list so the
//! persistence pass can still see it; re-adding an item found on a deleted
//! list anywhere within the same aggregate undoes the deletion.

use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::errors::AttachError;
use crate::node::{
    compute_meta, descendants, root_of, touch, ChangeEvent, Node, NodeInner, ParentLink,
};
use crate::property::PropertyValue;
use crate::sync;

pub(crate) struct ListState {
    pub(crate) items: Vec<Node>,
    pub(crate) deleted: Vec<Node>,
    /// The collection's owning node. Items get this same link as their
    /// parent: children are parented to the node, not the collection.
    pub(crate) parent: Option<ParentLink>,
}

pub(crate) struct ListInner {
    pub(crate) state: RwLock<ListState>,
}

/// An ordered collection of entity nodes with deletion tracking.
///
/// Handles are cheap to clone and share the underlying collection.
#[derive(Clone)]
pub struct EntityList {
    pub(crate) inner: Arc<ListInner>,
}

impl EntityList {
    pub(crate) fn new(parent: Option<ParentLink>) -> Self {
        EntityList {
            inner: Arc::new(ListInner {
                state: RwLock::new(ListState {
                    items: Vec::new(),
                    deleted: Vec::new(),
                    parent,
                }),
            }),
        }
    }

    /// Append an entity to the collection.
    ///
    /// Rejects duplicates, busy items and items belonging to a different
    /// aggregate root. The item becomes a child of the collection's owning
    /// node; if it was parked on a deleted list anywhere within the same
    /// aggregate, the deletion is undone. Items that are not new are marked
    /// modified, since collection membership is a persistent change.
    pub fn add(&self, item: Node) -> Result<(), AttachError> {
        if compute_meta(&item.inner).is_busy {
            return Err(AttachError::Busy);
        }
        {
            let state = sync::read(&self.inner.state);
            if state.items.iter().any(|n| n == &item) {
                return Err(AttachError::Duplicate);
            }
        }

        let link = sync::read(&self.inner.state).parent.clone();
        let owner = link.as_ref().and_then(|l| l.node.upgrade());

        if let Some(owner) = &owner {
            let my_root = root_of(owner);
            let attached = sync::read(&item.inner.state).parent.is_some();
            if attached && !Arc::ptr_eq(&root_of(&item.inner), &my_root) {
                return Err(AttachError::CrossAggregate);
            }
            // a same-aggregate move: pull the item off whichever deleted
            // list it sits on and revert the pending deletion
            if recover_deleted(&my_root, &item) {
                let mut state = sync::write(&item.inner.state);
                state.deleted = false;
            }
        }

        {
            let mut state = sync::write(&item.inner.state);
            state.parent = link.clone();
            state.child = true;
            if !state.new {
                state.marked_modified = true;
            }
        }
        {
            let mut state = sync::write(&self.inner.state);
            state.items.push(item.clone());
        }
        debug!(item = item.uid(), "added to collection");

        // refresh the item's cached aggregate before the owner reads it
        touch(&item.inner, None);
        if let Some(owner) = owner {
            let slot = link.map(|l| l.slot).unwrap_or_default();
            touch(&owner, Some(ChangeEvent::structure(item.uid(), &slot)));
        }
        Ok(())
    }

    /// Population path used during hydration and restore: no checks, no
    /// child marking, no notifications
    pub(crate) fn add_relaxed(&self, item: Node) {
        let link = sync::read(&self.inner.state).parent.clone();
        {
            let mut state = sync::write(&item.inner.state);
            state.parent = link;
            state.child = true;
        }
        let mut state = sync::write(&self.inner.state);
        state.items.push(item);
    }

    pub(crate) fn park_deleted(&self, item: Node) {
        let link = sync::read(&self.inner.state).parent.clone();
        {
            let mut state = sync::write(&item.inner.state);
            state.parent = link;
            state.child = true;
        }
        let mut state = sync::write(&self.inner.state);
        state.deleted.push(item);
    }

    /// Remove an entity from the collection.
    ///
    /// Rejects items with in-flight rule executions. A new item is simply
    /// dropped; an existing one is marked deleted and parked on the deleted
    /// list for the next persistence pass.
    pub fn remove(&self, item: &Node) -> Result<(), AttachError> {
        if compute_meta(&item.inner).is_busy {
            return Err(AttachError::Busy);
        }
        let removed = {
            let mut state = sync::write(&self.inner.state);
            let at = state
                .items
                .iter()
                .position(|n| n == item)
                .ok_or(AttachError::NotFound)?;
            state.items.remove(at)
        };

        let keep = {
            let mut state = sync::write(&removed.inner.state);
            if state.new {
                false
            } else {
                state.deleted = true;
                true
            }
        };
        if keep {
            let mut state = sync::write(&self.inner.state);
            state.deleted.push(removed.clone());
        }
        debug!(item = removed.uid(), parked = keep, "removed from collection");

        touch(&removed.inner, None);
        let (owner, slot) = self.owner();
        if let Some(owner) = owner {
            touch(&owner, Some(ChangeEvent::structure(removed.uid(), &slot)));
        }
        Ok(())
    }

    /// The live items, in insertion order
    pub fn items(&self) -> Vec<Node> {
        sync::read(&self.inner.state).items.clone()
    }

    /// Items removed but not yet purged
    pub fn deleted(&self) -> Vec<Node> {
        sync::read(&self.inner.state).deleted.clone()
    }

    /// Union enumeration for persistence: live items followed by deleted
    /// ones, so a single pass can handle inserts, updates and deletes
    pub fn iter_all(&self) -> Vec<Node> {
        let state = sync::read(&self.inner.state);
        state
            .items
            .iter()
            .chain(state.deleted.iter())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        sync::read(&self.inner.state).items.len()
    }

    pub fn is_empty(&self) -> bool {
        sync::read(&self.inner.state).items.is_empty()
    }

    pub fn get(&self, at: usize) -> Option<Node> {
        sync::read(&self.inner.state).items.get(at).cloned()
    }

    pub fn contains(&self, item: &Node) -> bool {
        sync::read(&self.inner.state).items.iter().any(|n| n == item)
    }

    /// Drop the deleted list after a successful persistence pass
    pub fn purge_deleted(&self) {
        {
            let mut state = sync::write(&self.inner.state);
            state.deleted.clear();
        }
        let (owner, _) = self.owner();
        if let Some(owner) = owner {
            touch(&owner, None);
        }
    }

    /// Any live item modified, or removals pending
    pub fn is_modified(&self) -> bool {
        let (_, modified, _) = self.aggregate();
        modified
    }

    /// Every live item valid
    pub fn is_valid(&self) -> bool {
        let (valid, _, _) = self.aggregate();
        valid
    }

    /// Any item, live or deleted, with in-flight rule executions
    pub fn is_busy(&self) -> bool {
        let (_, _, busy) = self.aggregate();
        busy
    }

    /// (valid, modified, busy) contribution of this collection to the
    /// owning node's meta-state, from the items' cached aggregates
    pub(crate) fn aggregate(&self) -> (bool, bool, bool) {
        let state = sync::read(&self.inner.state);
        let mut valid = true;
        let mut modified = !state.deleted.is_empty();
        let mut busy = false;
        for item in &state.items {
            let meta = item.cached_meta();
            valid &= meta.is_valid;
            modified |= meta.is_modified;
            busy |= meta.is_busy;
        }
        for item in &state.deleted {
            busy |= item.cached_meta().is_busy;
        }
        (valid, modified, busy)
    }

    fn owner(&self) -> (Option<Arc<NodeInner>>, String) {
        let link = sync::read(&self.inner.state).parent.clone();
        match link {
            Some(link) => (link.node.upgrade(), link.slot),
            None => (None, String::new()),
        }
    }
}

/// Search every collection reachable from `root` for `item` parked on a
/// deleted list; detach it from there when found
fn recover_deleted(root: &Arc<NodeInner>, item: &Node) -> bool {
    for node in descendants(root) {
        let lists: Vec<EntityList> = {
            let state = sync::read(&node.state);
            state
                .props
                .iter()
                .filter_map(|prop| match &prop.value {
                    PropertyValue::List(list) => Some(list.clone()),
                    _ => None,
                })
                .collect()
        };
        for list in lists {
            let mut state = sync::write(&list.inner.state);
            if let Some(at) = state.deleted.iter().position(|n| n == item) {
                state.deleted.remove(at);
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AttachError;
    use crate::node::{prop, Blueprint};

    fn order() -> Blueprint {
        let line = Blueprint::entity("Line").property(prop("sku"));
        Blueprint::entity("Order")
            .property(prop("number"))
            .list("lines", line)
    }

    fn line() -> Blueprint {
        Blueprint::entity("Line").property(prop("sku"))
    }

    #[test]
    fn added_items_become_children_of_the_owning_node() {
        let root = order().fetch();
        let lines = root.list("lines").unwrap();
        let item = line().fetch();

        lines.add(item.clone()).unwrap();
        assert!(lines.contains(&item));
        assert!(item.is_child());
        assert_eq!(item.parent().unwrap(), root);
        assert_eq!(item.root(), root);
    }

    #[test]
    fn duplicates_are_rejected() {
        let root = order().fetch();
        let lines = root.list("lines").unwrap();
        let item = line().fetch();

        lines.add(item.clone()).unwrap();
        assert_eq!(lines.add(item), Err(AttachError::Duplicate));
        assert_eq!(lines.len(), 1);
    }

    #[test]
    fn cross_aggregate_items_are_rejected() {
        let root1 = order().fetch();
        let root2 = order().fetch();
        let item = line().fetch();
        root1.list("lines").unwrap().add(item.clone()).unwrap();

        let lines2 = root2.list("lines").unwrap();
        assert_eq!(lines2.add(item), Err(AttachError::CrossAggregate));
        assert!(lines2.is_empty());
    }

    #[test]
    fn removing_a_new_item_drops_it() {
        let root = order().fetch();
        let lines = root.list("lines").unwrap();
        let item = line().fetch();
        item.mark_new();

        lines.add(item.clone()).unwrap();
        lines.remove(&item).unwrap();
        assert!(lines.is_empty());
        assert!(lines.deleted().is_empty());
        assert!(!item.is_deleted());
    }

    #[test]
    fn removing_an_existing_item_parks_it_for_deletion() {
        let root = order().fetch();
        let lines = root.list("lines").unwrap();
        let item = line().fetch();

        lines.add(item.clone()).unwrap();
        lines.remove(&item).unwrap();

        assert!(lines.is_empty());
        assert_eq!(lines.deleted().len(), 1);
        assert!(item.is_deleted());
        // pending removals count as modification of the collection
        assert!(lines.is_modified());
        assert!(root.is_modified());
        assert_eq!(lines.iter_all().len(), 1);
    }

    #[test]
    fn re_adding_a_removed_item_undoes_the_deletion() {
        let root = order().fetch();
        let lines = root.list("lines").unwrap();
        let item = line().fetch();

        lines.add(item.clone()).unwrap();
        lines.remove(&item).unwrap();
        lines.add(item.clone()).unwrap();

        assert!(lines.contains(&item));
        assert!(!item.is_deleted());
        assert!(lines.deleted().is_empty());
    }

    #[test]
    fn existing_items_are_marked_modified_on_attach() {
        let root = order().fetch();
        let lines = root.list("lines").unwrap();
        let item = line().fetch();

        lines.add(item.clone()).unwrap();
        assert!(item.is_marked_modified());
        assert!(root.is_modified());
    }

    #[test]
    fn purge_clears_the_deleted_list() {
        let root = order().fetch();
        let lines = root.list("lines").unwrap();
        let item = line().fetch();
        lines.add(item.clone()).unwrap();
        lines.remove(&item).unwrap();

        lines.purge_deleted();
        assert!(lines.deleted().is_empty());
        assert!(!lines.is_modified());
    }

    #[test]
    fn removing_an_absent_item_is_an_error() {
        let root = order().fetch();
        let lines = root.list("lines").unwrap();
        assert_eq!(lines.remove(&line().fetch()), Err(AttachError::NotFound));
    }
}
