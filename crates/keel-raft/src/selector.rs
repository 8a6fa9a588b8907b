//! Leader-aware server selection for client routing.
//!
//! A [`NodeSelectorManager`] owns the authoritative `(leader, servers)` pair
//! and a set of child [`NodeSelector`]s. Children iterate a selection
//! derived from their strategy; when the leader changes (or a send observes
//! a stale hint) `reset_all` installs the new view in every child. The
//! child set is copy-on-write: resets iterate a snapshot, so iteration
//! never observes a partial update and tolerates concurrent registration
//! and removal.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use crate::types::NodeId;

/// How a selector orders candidate servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// The current leader only; empty when none is known.
    Leader,
    /// Non-leader servers, in configuration order.
    Followers,
    /// Leader first, then followers.
    Any,
    /// Leader then followers; an exhausted iteration restarts once.
    AnyWithFallback,
}

impl SelectionStrategy {
    fn select(self, leader: Option<&NodeId>, servers: &[NodeId]) -> Vec<NodeId> {
        match self {
            SelectionStrategy::Leader => leader.into_iter().cloned().collect(),
            SelectionStrategy::Followers => servers
                .iter()
                .filter(|s| Some(*s) != leader)
                .cloned()
                .collect(),
            SelectionStrategy::Any | SelectionStrategy::AnyWithFallback => {
                let mut selection: Vec<NodeId> = leader.into_iter().cloned().collect();
                selection.extend(
                    servers
                        .iter()
                        .filter(|s| Some(*s) != leader)
                        .cloned(),
                );
                selection
            }
        }
    }
}

#[derive(Clone)]
struct RoutingView {
    leader: Option<NodeId>,
    servers: Arc<Vec<NodeId>>,
}

struct ManagerInner {
    view: Mutex<RoutingView>,
    selectors: Mutex<Vec<Weak<SelectorInner>>>,
}

/// Owns the authoritative routing view and its child selectors.
#[derive(Clone)]
pub struct NodeSelectorManager {
    inner: Arc<ManagerInner>,
}

impl Default for NodeSelectorManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeSelectorManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                view: Mutex::new(RoutingView {
                    leader: None,
                    servers: Arc::new(Vec::new()),
                }),
                selectors: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The current cluster leader, if known.
    pub fn leader(&self) -> Option<NodeId> {
        self.inner.view.lock().leader.clone()
    }

    /// The current server list.
    pub fn servers(&self) -> Arc<Vec<NodeId>> {
        self.inner.view.lock().servers.clone()
    }

    /// Creates a new selector seeded with the current view.
    pub fn create_selector(&self, strategy: SelectionStrategy) -> NodeSelector {
        let view = self.inner.view.lock().clone();
        let selector = Arc::new(SelectorInner {
            strategy,
            manager: Arc::downgrade(&self.inner),
            state: Mutex::new(SelectorState::from_view(strategy, &view)),
        });
        self.inner.selectors.lock().push(Arc::downgrade(&selector));
        NodeSelector { inner: selector }
    }

    /// Re-derives every child selector from the current view.
    pub fn reset_all(&self) {
        let view = self.inner.view.lock().clone();
        self.notify(&view);
    }

    /// Installs a new `(leader, servers)` pair and resets every child.
    pub fn reset_all_with(&self, leader: Option<NodeId>, servers: Vec<NodeId>) {
        let view = RoutingView {
            leader,
            servers: Arc::new(servers),
        };
        *self.inner.view.lock() = view.clone();
        self.notify(&view);
    }

    fn notify(&self, view: &RoutingView) {
        // Iterate a snapshot so children may register or drop concurrently.
        let snapshot: Vec<Weak<SelectorInner>> = self.inner.selectors.lock().clone();
        for weak in snapshot {
            if let Some(selector) = weak.upgrade() {
                selector.install(view);
            }
        }
    }

    fn prune(&self) {
        self.inner
            .selectors
            .lock()
            .retain(|weak| weak.strong_count() > 0);
    }
}

struct SelectorState {
    selection: Vec<NodeId>,
    position: usize,
    restarted: bool,
    view: RoutingView,
}

impl SelectorState {
    fn from_view(strategy: SelectionStrategy, view: &RoutingView) -> Self {
        Self {
            selection: strategy.select(view.leader.as_ref(), &view.servers),
            position: 0,
            restarted: false,
            view: view.clone(),
        }
    }
}

struct SelectorInner {
    strategy: SelectionStrategy,
    manager: Weak<ManagerInner>,
    state: Mutex<SelectorState>,
}

impl SelectorInner {
    fn install(&self, view: &RoutingView) {
        *self.state.lock() = SelectorState::from_view(self.strategy, view);
    }
}

/// An ordered pass over candidate servers for one request.
pub struct NodeSelector {
    inner: Arc<SelectorInner>,
}

impl NodeSelector {
    /// The leader according to this selector's current view.
    pub fn leader(&self) -> Option<NodeId> {
        self.inner.state.lock().view.leader.clone()
    }

    /// Restarts iteration from the manager's current view.
    pub fn reset(&mut self) {
        if let Some(manager) = self.inner.manager.upgrade() {
            let view = manager.view.lock().clone();
            self.inner.install(&view);
        }
    }

    /// Installs an explicit `(leader, servers)` view, e.g. from a response
    /// that revealed fresher routing than the manager has.
    pub fn reset_with(&mut self, leader: Option<NodeId>, servers: Vec<NodeId>) {
        self.inner.install(&RoutingView {
            leader,
            servers: Arc::new(servers),
        });
    }
}

impl Iterator for NodeSelector {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let mut state = self.inner.state.lock();
        if state.position >= state.selection.len() {
            let restart = self.inner.strategy == SelectionStrategy::AnyWithFallback
                && !state.restarted
                && !state.selection.is_empty();
            if !restart {
                return None;
            }
            state.restarted = true;
            state.position = 0;
        }
        let item = state.selection[state.position].clone();
        state.position += 1;
        Some(item)
    }
}

impl Drop for NodeSelector {
    fn drop(&mut self) {
        if let Some(manager) = self.inner.manager.upgrade() {
            NodeSelectorManager { inner: manager }.prune();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(ids: &[&str]) -> Vec<NodeId> {
        ids.iter().map(|id| NodeId::new(*id)).collect()
    }

    fn manager_with(leader: Option<&str>, servers: &[&str]) -> NodeSelectorManager {
        let manager = NodeSelectorManager::new();
        manager.reset_all_with(leader.map(NodeId::new), nodes(servers));
        manager
    }

    #[test]
    fn test_leader_strategy() {
        let manager = manager_with(Some("n2"), &["n1", "n2", "n3"]);
        let selector = manager.create_selector(SelectionStrategy::Leader);
        assert_eq!(selector.collect::<Vec<_>>(), nodes(&["n2"]));

        let manager = manager_with(None, &["n1", "n2"]);
        let selector = manager.create_selector(SelectionStrategy::Leader);
        assert_eq!(selector.count(), 0);
    }

    #[test]
    fn test_followers_strategy() {
        let manager = manager_with(Some("n2"), &["n1", "n2", "n3"]);
        let selector = manager.create_selector(SelectionStrategy::Followers);
        assert_eq!(selector.collect::<Vec<_>>(), nodes(&["n1", "n3"]));
    }

    #[test]
    fn test_any_strategy_orders_leader_first() {
        let manager = manager_with(Some("n2"), &["n1", "n2", "n3"]);
        let selector = manager.create_selector(SelectionStrategy::Any);
        assert_eq!(selector.collect::<Vec<_>>(), nodes(&["n2", "n1", "n3"]));
    }

    #[test]
    fn test_fallback_restarts_once() {
        let manager = manager_with(Some("n1"), &["n1", "n2"]);
        let mut selector = manager.create_selector(SelectionStrategy::AnyWithFallback);

        // First pass.
        assert_eq!(selector.next(), Some(NodeId::new("n1")));
        assert_eq!(selector.next(), Some(NodeId::new("n2")));
        // Restarted pass.
        assert_eq!(selector.next(), Some(NodeId::new("n1")));
        assert_eq!(selector.next(), Some(NodeId::new("n2")));
        // Exhausted for good.
        assert_eq!(selector.next(), None);
    }

    #[test]
    fn test_reset_all_updates_children() {
        let manager = manager_with(Some("n1"), &["n1", "n2"]);
        let mut selector = manager.create_selector(SelectionStrategy::Leader);
        assert_eq!(selector.next(), Some(NodeId::new("n1")));

        manager.reset_all_with(Some(NodeId::new("n2")), nodes(&["n1", "n2"]));
        assert_eq!(selector.next(), Some(NodeId::new("n2")));
        assert_eq!(selector.leader(), Some(NodeId::new("n2")));
    }

    #[test]
    fn test_dropping_selector_deregisters_it() {
        let manager = manager_with(Some("n1"), &["n1"]);
        let selector = manager.create_selector(SelectionStrategy::Any);
        assert_eq!(manager.inner.selectors.lock().len(), 1);

        drop(selector);
        // A later selector triggers pruning of the dead registration.
        let _other = manager.create_selector(SelectionStrategy::Any);
        manager.reset_all();
        manager.prune();
        assert_eq!(manager.inner.selectors.lock().len(), 1);
    }

    #[test]
    fn test_reset_during_iteration_is_complete_not_partial() {
        let manager = manager_with(Some("n1"), &["n1", "n2", "n3"]);
        let mut selector = manager.create_selector(SelectionStrategy::Any);
        assert_eq!(selector.next(), Some(NodeId::new("n1")));

        // The reset replaces the whole selection atomically.
        manager.reset_all_with(Some(NodeId::new("n3")), nodes(&["n3", "n4"]));
        let rest: Vec<_> = selector.collect();
        assert_eq!(rest, nodes(&["n3", "n4"]));
    }
}
