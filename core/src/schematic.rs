use crate::definition::TreeDefinition;
use crate::handle::{DefinitionId, StateIndex};
use crate::state::{Priority, SelectionBehavior, StateKind, TransitionTarget, TransitionTrigger};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The static view of a compiled tree.
///
/// `TreeSchematic` lists states, nodes and transitions by their stable IDs,
/// so debuggers can display a definition and tooling can diff two builds of
/// the same tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TreeSchematic {
    pub id: Option<DefinitionId>,
    pub name: String,
    pub states: Vec<StateEntry>,
    pub nodes: Vec<NodeEntry>,
    pub edges: Vec<Edge>,
}

impl TreeSchematic {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn from_definition(tree: &TreeDefinition) -> Self {
        let id_of = |index: StateIndex| tree.state(index).map(|s| s.id);

        let states = tree
            .states()
            .iter()
            .map(|state| StateEntry {
                id: state.id,
                name: state.name.clone(),
                kind: state.kind,
                parent: state.parent.and_then(id_of),
                selection: state.selection,
                enabled: state.enabled,
                tasks: state
                    .tasks
                    .iter()
                    .filter_map(|n| tree.node(n).map(|n| n.id))
                    .collect(),
            })
            .collect();

        let nodes = tree
            .nodes()
            .iter()
            .map(|node| NodeEntry {
                id: node.id,
                name: node.name.clone(),
                role: node.kind.kind_name().to_string(),
                type_name: node.kind.base().type_name().to_string(),
                enabled: node.enabled,
            })
            .collect();

        let mut edges: Vec<Edge> = tree
            .transitions()
            .iter()
            .filter_map(|t| {
                Some(Edge {
                    id: Some(t.id),
                    from: id_of(t.source)?,
                    to: match t.target {
                        TransitionTarget::State(target) => EdgeTarget::State(id_of(target)?),
                        other => EdgeTarget::Terminal(other.to_string()),
                    },
                    kind: EdgeKind::Transition {
                        trigger: t.trigger,
                        priority: t.priority,
                    },
                })
            })
            .collect();

        edges.extend(tree.states().iter().filter_map(|state| {
            let target = state
                .linked_state
                .and_then(id_of)
                .map(EdgeTarget::State)
                .or_else(|| state.linked_asset.map(EdgeTarget::Asset))?;
            Some(Edge {
                id: None,
                from: state.id,
                to: target,
                kind: EdgeKind::Link,
            })
        }));

        Self {
            id: Some(tree.id()),
            name: tree.name().to_string(),
            states,
            nodes,
            edges,
        }
    }

    pub fn state(&self, id: Uuid) -> Option<&StateEntry> {
        self.states.iter().find(|s| s.id == id)
    }

    /// Stable IDs present in `self` but missing from `other`.
    pub fn removed_since(&self, other: &TreeSchematic) -> Vec<Uuid> {
        let ids = |s: &TreeSchematic| -> Vec<Uuid> {
            s.states
                .iter()
                .map(|s| s.id)
                .chain(s.nodes.iter().map(|n| n.id))
                .chain(s.edges.iter().filter_map(|e| e.id))
                .collect()
        };
        let theirs = ids(other);
        ids(self).into_iter().filter(|id| !theirs.contains(id)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub id: Uuid,
    pub name: String,
    pub kind: StateKind,
    pub parent: Option<Uuid>,
    pub selection: SelectionBehavior,
    pub enabled: bool,
    pub tasks: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: Uuid,
    pub name: String,
    pub role: String,
    pub type_name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EdgeTarget {
    State(Uuid),
    Asset(DefinitionId),
    Terminal(String), // "(Succeeded)", "(Failed)", ...
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EdgeKind {
    Transition {
        trigger: TransitionTrigger,
        priority: Priority,
    },
    Link,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Transition ID; links have none.
    pub id: Option<Uuid>,
    pub from: Uuid,
    pub to: EdgeTarget,
    pub kind: EdgeKind,
}
