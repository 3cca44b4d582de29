//! In-memory action DAG.
//!
//! Built from the persisted edge set and queried with plain traversals, so
//! reachability never touches storage.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::action::ActionId;

#[derive(Debug, Clone, Default)]
pub struct ActionGraph {
    children: BTreeMap<ActionId, Vec<ActionId>>,
    parents: BTreeMap<ActionId, BTreeSet<ActionId>>,
}

impl ActionGraph {
    /// Build from `(parent, child)` pairs. Children keep their input order.
    pub fn from_edges(edges: impl IntoIterator<Item = (ActionId, ActionId)>) -> Self {
        let mut graph = Self::default();
        for (parent, child) in edges {
            graph.add_edge(parent, child);
        }
        graph
    }

    pub fn add_edge(&mut self, parent: ActionId, child: ActionId) {
        self.children.entry(parent).or_default().push(child);
        self.parents.entry(child).or_default().insert(parent);
    }

    pub fn children(&self, id: ActionId) -> &[ActionId] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_parents(&self, id: ActionId) -> bool {
        self.parents.get(&id).is_some_and(|p| !p.is_empty())
    }

    /// Every action from which `id` is reachable, excluding `id` itself.
    pub fn ancestors(&self, id: ActionId) -> BTreeSet<ActionId> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            if let Some(parents) = self.parents.get(&current) {
                for &p in parents {
                    if p != id && seen.insert(p) {
                        queue.push_back(p);
                    }
                }
            }
        }
        seen
    }

    /// Whether giving `parent` the child list `children` (replacing its
    /// current one) would close a cycle.
    pub fn would_cycle(&self, parent: ActionId, children: &[ActionId]) -> bool {
        if children.contains(&parent) {
            return true;
        }
        let mut without = self.clone();
        without.remove_children(parent);
        let ancestors = without.ancestors(parent);
        children.iter().any(|c| ancestors.contains(c))
    }

    fn remove_children(&mut self, parent: ActionId) {
        if let Some(children) = self.children.remove(&parent) {
            for c in children {
                if let Some(ps) = self.parents.get_mut(&c) {
                    ps.remove(&parent);
                }
            }
        }
    }
}
