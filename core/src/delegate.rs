//! Delegate dispatchers and their listeners.
//!
//! A node declares a dispatcher at link time and broadcasts on it; other nodes
//! bind listeners to it. Broadcasting is a synchronous fan-out within the
//! current call. The runtime iterates a snapshot taken before dispatch and
//! re-checks [`DelegateHub::is_bound`] before each call, so a listener that is
//! unbound mid-broadcast is skipped rather than re-entered.

use crate::handle::{DefinitionId, FrameId, NodeIndex, StateIndex};
use serde::{Deserialize, Serialize};

/// Dispatcher slot, unique within one definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DelegateId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u32);

/// The node activation a listener calls back into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerOwner {
    pub frame_id: FrameId,
    pub state: Option<StateIndex>,
    pub node: NodeIndex,
}

#[derive(Debug, Clone)]
struct Listener {
    id: ListenerId,
    tree: DefinitionId,
    delegate: DelegateId,
    owner: ListenerOwner,
}

#[derive(Debug, Default)]
pub struct DelegateHub {
    listeners: Vec<Listener>,
    next_id: u32,
}

impl DelegateHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `owner` to a dispatcher. Binding the same owner twice returns the
    /// existing listener.
    pub fn bind(&mut self, tree: DefinitionId, delegate: DelegateId, owner: ListenerOwner) -> ListenerId {
        if let Some(existing) = self
            .listeners
            .iter()
            .find(|l| l.tree == tree && l.delegate == delegate && l.owner == owner)
        {
            return existing.id;
        }
        let id = ListenerId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.listeners.push(Listener {
            id,
            tree,
            delegate,
            owner,
        });
        id
    }

    pub fn unbind(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| l.id != id);
        before != self.listeners.len()
    }

    /// Unbinds every listener of `owner` from `delegate`.
    pub fn unbind_owner(&mut self, tree: DefinitionId, delegate: DelegateId, owner: ListenerOwner) -> bool {
        let before = self.listeners.len();
        self.listeners
            .retain(|l| !(l.tree == tree && l.delegate == delegate && l.owner == owner));
        before != self.listeners.len()
    }

    /// Drops listeners whose owner matches `predicate`. Returns how many.
    pub fn remove_where(&mut self, predicate: impl Fn(&ListenerOwner) -> bool) -> usize {
        let before = self.listeners.len();
        self.listeners.retain(|l| !predicate(&l.owner));
        before - self.listeners.len()
    }

    /// Listeners currently bound to a dispatcher, in bind order.
    pub fn snapshot(&self, tree: DefinitionId, delegate: DelegateId) -> Vec<(ListenerId, ListenerOwner)> {
        self.listeners
            .iter()
            .filter(|l| l.tree == tree && l.delegate == delegate)
            .map(|l| (l.id, l.owner))
            .collect()
    }

    pub fn is_bound(&self, id: ListenerId) -> bool {
        self.listeners.iter().any(|l| l.id == id)
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
    }
}
