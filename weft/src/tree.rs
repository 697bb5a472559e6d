//! Derivation trees as index arenas.
//!
//! Every output statement carries a tree recording which rule filled which
//! slot. Nodes live in a flat `Vec` and refer to each other by [`NodeId`],
//! so a tree serializes compactly and clones are plain memcpys of the
//! arena. Rules are recorded by their canonical text, which is the rule
//! identity shared with the trained models.
//!
//! Variable reuse installs a [`NodeKind::Phantom`] leaf in the consuming
//! slot: the statistics passes see that a variable of the given type was
//! consumed there without tying the two statements' trees together.

use serde::{Deserialize, Serialize};

/// Index of a node within one [`DerivationTree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Synthetic root; never appears in ancestor chains.
    Root,
    /// A rule expansion, identified by canonical rule text.
    Rule { rule: String },
    /// A reused variable standing in for a subtree, recorded by name and
    /// registered type.
    Phantom { name: String, var_type: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    /// Owning node and the slot this node fills in it.
    pub parent: Option<(NodeId, u32)>,
    /// One entry per slot; `None` until the slot is filled.
    pub children: Vec<Option<NodeId>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivationTree {
    nodes: Vec<Node>,
}

impl DerivationTree {
    pub const ROOT: NodeId = NodeId(0);

    pub fn new() -> Self {
        DerivationTree {
            nodes: vec![Node {
                kind: NodeKind::Root,
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    /// Number of nodes, the root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: the root is created with the tree.
    pub fn is_empty(&self) -> bool {
        false
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    fn attach(&mut self, parent: NodeId, slot: u32, child: NodeId) {
        let children = &mut self.nodes[parent.0 as usize].children;
        if children.len() <= slot as usize {
            children.resize(slot as usize + 1, None);
        }
        debug_assert!(children[slot as usize].is_none(), "slot filled twice");
        children[slot as usize] = Some(child);
    }

    /// Record a rule expansion filling `slot` of `parent`. The new node
    /// starts with `slot_count` empty child slots.
    pub fn add_rule_node(
        &mut self,
        parent: NodeId,
        slot: u32,
        rule_text: &str,
        slot_count: usize,
    ) -> NodeId {
        let id = self.push(Node {
            kind: NodeKind::Rule {
                rule: rule_text.to_string(),
            },
            parent: Some((parent, slot)),
            children: vec![None; slot_count],
        });
        self.attach(parent, slot, id);
        id
    }

    /// Record a reused variable filling `slot` of `parent`.
    pub fn add_phantom(&mut self, parent: NodeId, slot: u32, name: &str, var_type: &str) -> NodeId {
        let id = self.push(Node {
            kind: NodeKind::Phantom {
                name: name.to_string(),
                var_type: var_type.to_string(),
            },
            parent: Some((parent, slot)),
            children: Vec::new(),
        });
        self.attach(parent, slot, id);
        id
    }

    /// Empty a slot so a failed expansion can be retried. The old subtree
    /// stays in the arena unreferenced.
    pub fn clear_slot(&mut self, parent: NodeId, slot: u32) {
        if let Some(entry) = self.nodes[parent.0 as usize]
            .children
            .get_mut(slot as usize)
        {
            *entry = None;
        }
    }

    /// Canonical rule texts of `id`'s ancestors, nearest first, excluding
    /// the root and capped at `max` entries.
    pub fn ancestor_chain(&self, id: NodeId, max: usize) -> Vec<&str> {
        let mut chain = Vec::new();
        let mut cursor = self.node(id).parent;
        while let Some((parent, _)) = cursor {
            if chain.len() >= max {
                break;
            }
            let node = self.node(parent);
            match &node.kind {
                NodeKind::Root => break,
                NodeKind::Rule { rule } => chain.push(rule.as_str()),
                // Phantoms are leaves and cannot be ancestors.
                NodeKind::Phantom { .. } => break,
            }
            cursor = node.parent;
        }
        chain
    }

    /// Iterate all node ids in arena order (root included).
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    /// Ids of every node below `id`, in no particular order.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.node(id).children.iter().flatten().copied().collect();
        while let Some(next) = stack.pop() {
            stack.extend(self.node(next).children.iter().flatten().copied());
            out.push(next);
        }
        out
    }

    /// Like [`ancestor_chain`](Self::ancestor_chain), but the walk stops
    /// once `stop` has been included, so the chain never reaches outside
    /// `stop`'s subtree.
    pub fn chain_within(&self, id: NodeId, stop: NodeId, max: usize) -> Vec<&str> {
        let mut chain = Vec::new();
        let mut cursor = self.node(id).parent;
        while let Some((parent, _)) = cursor {
            if chain.len() >= max {
                break;
            }
            let node = self.node(parent);
            match &node.kind {
                NodeKind::Root => break,
                NodeKind::Rule { rule } => chain.push(rule.as_str()),
                NodeKind::Phantom { .. } => break,
            }
            if parent == stop {
                break;
            }
            cursor = node.parent;
        }
        chain
    }
}

impl Default for DerivationTree {
    fn default() -> Self {
        Self::new()
    }
}
