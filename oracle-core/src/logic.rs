//! Logic graph definitions.
//!
//! Nodes are declared in independent tables (items, regions, dungeons, ...)
//! and merged into a single [`Registry`] before being handed to the item
//! placement solver. A node may declare its parents inline instead of by
//! name; [`flatten`] gives each of those a name of its own.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{RandomiserError, Result};

/// How a node combines its parents, and what role it plays in routing.
///
/// `Slot` types are item slots; `Step` types are milestones for routing.
/// Slots count as steps too. `Hard` types are relationships a player isn't
/// expected to use, only considered when checking for softlocks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Root,
    And,
    Or,
    AndSlot,
    OrSlot,
    AndStep,
    OrStep,
    HardAnd,
    HardOr,
}

impl NodeType {
    pub fn is_root(self) -> bool {
        self == NodeType::Root
    }

    pub fn is_and(self) -> bool {
        matches!(
            self,
            NodeType::And | NodeType::AndSlot | NodeType::AndStep | NodeType::HardAnd
        )
    }

    pub fn is_or(self) -> bool {
        matches!(
            self,
            NodeType::Or | NodeType::OrSlot | NodeType::OrStep | NodeType::HardOr
        )
    }

    pub fn is_slot(self) -> bool {
        matches!(self, NodeType::AndSlot | NodeType::OrSlot)
    }

    pub fn is_step(self) -> bool {
        self.is_slot() || matches!(self, NodeType::AndStep | NodeType::OrStep)
    }

    pub fn is_hard(self) -> bool {
        matches!(self, NodeType::HardAnd | NodeType::HardOr)
    }
}

/// A reference from a node to one of its requirements.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Parent {
    NameRef(String),
    Inline(Box<Node>),
}

impl Parent {
    pub fn name(&self) -> Option<&str> {
        match self {
            Parent::NameRef(name) => Some(name.as_str()),
            Parent::Inline(_) => None,
        }
    }
}

impl From<&str> for Parent {
    fn from(name: &str) -> Self {
        Parent::NameRef(name.to_string())
    }
}

impl From<String> for Parent {
    fn from(name: String) -> Self {
        Parent::NameRef(name)
    }
}

impl From<Node> for Parent {
    fn from(node: Node) -> Self {
        Parent::Inline(Box::new(node))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "type")]
    pub kind: NodeType,
    #[serde(default)]
    pub parents: Vec<Parent>,
}

macro_rules! node_ctor {
    ($($(#[$doc:meta])* $name:ident => $kind:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            pub fn $name<I, P>(parents: I) -> Node
            where
                I: IntoIterator<Item = P>,
                P: Into<Parent>,
            {
                Node::new(NodeType::$kind, parents)
            }
        )*
    };
}

impl Node {
    pub fn new<I, P>(kind: NodeType, parents: I) -> Node
    where
        I: IntoIterator<Item = P>,
        P: Into<Parent>,
    {
        Node {
            kind,
            parents: parents.into_iter().map(Into::into).collect(),
        }
    }

    /// A fixed entry point. Always satisfied.
    pub fn root() -> Node {
        Node {
            kind: NodeType::Root,
            parents: Vec::new(),
        }
    }

    node_ctor! {
        and => And,
        or => Or,
        and_slot => AndSlot,
        or_slot => OrSlot,
        and_step => AndStep,
        or_step => OrStep,
        /// Wraps a single hard requirement.
        hard => HardAnd,
        hard_and => HardAnd,
        hard_or => HardOr,
    }

    /// Names of parents that are references. Inline parents are skipped.
    pub fn parent_names(&self) -> impl Iterator<Item = &str> {
        self.parents.iter().filter_map(Parent::name)
    }

    fn has_inline(&self) -> bool {
        self.parents.iter().any(|p| matches!(p, Parent::Inline(_)))
    }
}

/// One authored group of node definitions.
pub type NodeTable = BTreeMap<String, Node>;

/// All nodes for one build, keyed by unique name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Registry {
    nodes: BTreeMap<String, Node>,
}

impl Registry {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.nodes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// True once no node has an inline parent.
    pub fn is_flat(&self) -> bool {
        !self.nodes.values().any(Node::has_inline)
    }

    pub fn slots(&self) -> impl Iterator<Item = &str> {
        self.iter()
            .filter(|(_, node)| node.kind.is_slot())
            .map(|(name, _)| name)
    }

    /// Check that a flattened registry is well formed: every reference
    /// resolves, roots have no parents, and nothing is left inline.
    pub fn validate(&self) -> Result<()> {
        for (name, node) in &self.nodes {
            if node.kind.is_root() && !node.parents.is_empty() {
                return Err(RandomiserError::RootWithParents(name.clone()));
            }
            for parent in &node.parents {
                match parent {
                    Parent::NameRef(p) if !self.nodes.contains_key(p) => {
                        return Err(RandomiserError::UnknownParent {
                            node: name.clone(),
                            parent: p.clone(),
                        });
                    }
                    Parent::NameRef(_) => {}
                    Parent::Inline(_) => {
                        return Err(RandomiserError::InlineParent(name.clone()));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Union the given tables. Any name defined in more than one table is an
/// error and no registry is produced.
pub fn merge<I>(tables: I) -> Result<Registry>
where
    I: IntoIterator<Item = NodeTable>,
{
    let mut nodes = BTreeMap::new();
    for table in tables {
        for (name, node) in table {
            if nodes.contains_key(&name) {
                return Err(RandomiserError::DuplicateKey(name));
            }
            nodes.insert(name, node);
        }
    }
    Ok(Registry { nodes })
}

/// Give every inline parent a registry entry of its own and replace it with
/// a reference.
///
/// The n-th inline parent of node `owner` becomes `"{owner} {n}"`, counting
/// from 1. Inline nodes nested inside those are picked up on the next pass
/// and named after their new owner, so the result is the same regardless of
/// iteration order. A generated name that already exists is an error.
pub fn flatten(mut registry: Registry) -> Result<Registry> {
    let mut passes = 0;
    loop {
        let mut discovered: Vec<(String, Node)> = Vec::new();

        for (name, node) in registry.nodes.iter_mut() {
            let mut sub_id = 0;
            for parent in node.parents.iter_mut() {
                if !matches!(parent, Parent::Inline(_)) {
                    continue;
                }
                sub_id += 1;
                let sub_name = format!("{} {}", name, sub_id);
                if let Parent::Inline(inner) =
                    std::mem::replace(parent, Parent::NameRef(sub_name.clone()))
                {
                    discovered.push((sub_name, *inner));
                }
            }
        }

        if discovered.is_empty() {
            break;
        }
        passes += 1;
        debug!(pass = passes, added = discovered.len(), "flatten pass");

        for (name, node) in discovered {
            if registry.nodes.contains_key(&name) {
                return Err(RandomiserError::DuplicateKey(name));
            }
            registry.nodes.insert(name, node);
        }
    }

    Ok(registry)
}

/// Merge, flatten and validate: the registry a build hands to the solver.
pub fn build_registry<I>(tables: I) -> Result<Registry>
where
    I: IntoIterator<Item = NodeTable>,
{
    let merged = merge(tables)?;
    let authored = merged.len();
    let registry = flatten(merged)?;
    registry.validate()?;
    info!(
        nodes = registry.len(),
        inline = registry.len() - authored,
        slots = registry.slots().count(),
        "logic registry built"
    );
    Ok(registry)
}
