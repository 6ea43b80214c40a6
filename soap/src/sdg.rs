//! Symbolic kernel graph (SDG)
//!
//! The graph consumed by the analysis: nodes are computational regions (a loop
//! nest with a single statement body), edges carry the arrays flowing from a
//! producing region to a consuming one. Frontends build it; the analysis only
//! requires that it forms exactly one weakly-connected component.
//!
//! Graphs can also be loaded from JSON:
//!
//! ```json
//! {
//!   "name": "gemm",
//!   "regions": [{
//!     "name": "mm",
//!     "loops": [{"name": "i", "extent": "N"}, {"name": "j", "extent": "N"},
//!               {"name": "k", "extent": "N"}],
//!     "reads":  [{"array": "A", "access": "i*k"}, {"array": "B", "access": "k*j"},
//!                {"array": "C", "access": "i*j"}],
//!     "writes": [{"array": "C", "access": "i*j"}]
//!   }]
//! }
//! ```
//!
//! When `edges` is omitted, producer/consumer edges are derived from the
//! region order with [`KernelGraph::connect_by_dataflow`].

use crate::access::{AccessError, AccessTerm, ArrayAccesses};
use crate::expr::SymExpr;
use petgraph::algo::{connected_components, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::unionfind::UnionFind;
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use thiserror::Error;

pub type RegionId = usize;

/// Structural errors of a kernel graph
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("kernel graph '{graph}' has no regions")]
    Empty { graph: String },

    /// More than one weakly-connected component
    #[error("kernel graph '{graph}' has {} weakly-connected components: {}", .components.len(), format_components(.components))]
    Disconnected {
        graph: String,
        components: Vec<Vec<String>>,
    },

    #[error("edge references unknown region {index}")]
    UnknownRegion { index: RegionId },

    #[error("region '{region}' accesses {array}[{iterator}] but declares no loop '{iterator}'")]
    UndeclaredIterator {
        region: String,
        array: String,
        iterator: String,
    },

    #[error("region '{region}' declares loop '{iterator}' twice")]
    DuplicateLoop { region: String, iterator: String },

    #[error("kernel graph '{graph}' contains a cycle")]
    Cycle { graph: String },

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("invalid kernel graph JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_components(components: &[Vec<String>]) -> String {
    components
        .iter()
        .map(|c| format!("{{{}}}", c.join(", ")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// One loop of a region's nest
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoopVar {
    pub name: String,
    pub extent: SymExpr,
}

/// An array reference inside a region body
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArrayRef {
    pub array: String,
    pub access: AccessTerm,
}

fn default_ops() -> u32 {
    1
}

/// A computational region: a loop nest around one statement
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    pub loops: Vec<LoopVar>,
    #[serde(default)]
    pub reads: Vec<ArrayRef>,
    #[serde(default)]
    pub writes: Vec<ArrayRef>,
    /// Arithmetic operations executed per iteration point
    #[serde(default = "default_ops")]
    pub ops_per_iter: u32,
}

impl Region {
    pub fn new(name: impl Into<String>) -> Self {
        Region {
            name: name.into(),
            loops: Vec::new(),
            reads: Vec::new(),
            writes: Vec::new(),
            ops_per_iter: 1,
        }
    }

    pub fn with_loop(mut self, name: impl Into<String>, extent: SymExpr) -> Self {
        self.loops.push(LoopVar {
            name: name.into(),
            extent,
        });
        self
    }

    pub fn read(mut self, array: impl Into<String>, access: &str) -> Result<Self, AccessError> {
        self.reads.push(ArrayRef {
            array: array.into(),
            access: AccessTerm::parse(access)?,
        });
        Ok(self)
    }

    pub fn write(mut self, array: impl Into<String>, access: &str) -> Result<Self, AccessError> {
        self.writes.push(ArrayRef {
            array: array.into(),
            access: AccessTerm::parse(access)?,
        });
        Ok(self)
    }

    pub fn with_ops(mut self, ops_per_iter: u32) -> Self {
        self.ops_per_iter = ops_per_iter;
        self
    }

    /// Iterator names in nest order.
    pub fn variables(&self) -> Vec<String> {
        self.loops.iter().map(|l| l.name.clone()).collect()
    }

    pub fn extents(&self) -> Vec<SymExpr> {
        self.loops.iter().map(|l| l.extent.clone()).collect()
    }

    pub fn reads_array(&self, array: &str) -> bool {
        self.reads.iter().any(|r| r.array == array)
    }

    pub fn writes_array(&self, array: &str) -> bool {
        self.writes.iter().any(|w| w.array == array)
    }

    /// Every array referenced by the region, with its access terms.
    pub fn accesses(&self) -> ArrayAccesses {
        let mut accesses = ArrayAccesses::new();
        for r in self.reads.iter().chain(self.writes.iter()) {
            accesses.insert(&r.array, r.access.clone());
        }
        accesses
    }

    /// Loops must be unique and every accessed iterator must be a loop.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut seen = BTreeSet::new();
        for l in &self.loops {
            if !seen.insert(l.name.as_str()) {
                return Err(GraphError::DuplicateLoop {
                    region: self.name.clone(),
                    iterator: l.name.clone(),
                });
            }
        }
        for r in self.reads.iter().chain(self.writes.iter()) {
            for it in r.access.iterators() {
                if !seen.contains(it.as_str()) {
                    return Err(GraphError::UndeclaredIterator {
                        region: self.name.clone(),
                        array: r.array.clone(),
                        iterator: it.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Array carried by a dependence edge
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEdge {
    pub array: String,
}

/// On-disk form of a [`KernelGraph`]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphFile {
    pub name: String,
    pub regions: Vec<Region>,
    #[serde(default)]
    pub edges: Vec<EdgeRecord>,
}

/// An edge of a [`GraphFile`], by region index
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub from: RegionId,
    pub to: RegionId,
    pub array: String,
}

/// Symbolic kernel graph
///
/// Region ids are node indices of the underlying graph; regions are never
/// removed, so ids are dense and follow insertion order.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "GraphFile", into = "GraphFile")]
pub struct KernelGraph {
    pub name: String,
    graph: DiGraph<Region, DataEdge>,
}

impl TryFrom<GraphFile> for KernelGraph {
    type Error = GraphError;

    fn try_from(file: GraphFile) -> Result<Self, Self::Error> {
        let mut graph = KernelGraph::new(file.name);
        for region in file.regions {
            graph.add_region(region)?;
        }
        for edge in file.edges {
            graph.add_edge(edge.from, edge.to, edge.array)?;
        }
        Ok(graph)
    }
}

impl From<KernelGraph> for GraphFile {
    fn from(graph: KernelGraph) -> Self {
        let edges = graph
            .edges()
            .map(|(from, to, edge)| EdgeRecord {
                from,
                to,
                array: edge.array.clone(),
            })
            .collect();
        let (nodes, _) = graph.graph.into_nodes_edges();
        GraphFile {
            name: graph.name,
            regions: nodes.into_iter().map(|node| node.weight).collect(),
            edges,
        }
    }
}

impl PartialEq for KernelGraph {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.regions().eq(other.regions())
            && self.edges().eq(other.edges())
    }
}

impl KernelGraph {
    pub fn new(name: impl Into<String>) -> Self {
        KernelGraph {
            name: name.into(),
            graph: DiGraph::new(),
        }
    }

    /// Add a validated region and return its id.
    pub fn add_region(&mut self, region: Region) -> Result<RegionId, GraphError> {
        region.validate()?;
        Ok(self.graph.add_node(region).index())
    }

    /// Add a dependence edge unless an equal one exists.
    ///
    /// A region reusing its own output is not a dependence; self edges are
    /// ignored.
    pub fn add_edge(
        &mut self,
        from: RegionId,
        to: RegionId,
        array: impl Into<String>,
    ) -> Result<(), GraphError> {
        for index in [from, to] {
            if index >= self.graph.node_count() {
                return Err(GraphError::UnknownRegion { index });
            }
        }
        if from == to {
            return Ok(());
        }
        let edge = DataEdge { array: array.into() };
        let (a, b) = (NodeIndex::new(from), NodeIndex::new(to));
        let exists = self
            .graph
            .edges_connecting(a, b)
            .any(|existing| *existing.weight() == edge);
        if !exists {
            self.graph.add_edge(a, b, edge);
        }
        Ok(())
    }

    /// Add a read-after-write edge for every array written by a region and
    /// read by a later one.
    pub fn connect_by_dataflow(&mut self) {
        let mut found = Vec::new();
        for (from, producer) in self.regions().enumerate() {
            for (to, consumer) in self.regions().enumerate().skip(from + 1) {
                for w in &producer.writes {
                    if consumer.reads_array(&w.array) {
                        found.push((from, to, w.array.clone()));
                    }
                }
            }
        }
        for (from, to, array) in found {
            let (a, b) = (NodeIndex::new(from), NodeIndex::new(to));
            if !self.graph.edges_connecting(a, b).any(|e| e.weight().array == array) {
                self.graph.add_edge(a, b, DataEdge { array });
            }
        }
    }

    /// Regions in id order.
    pub fn regions(&self) -> impl Iterator<Item = &Region> + '_ {
        self.graph.node_weights()
    }

    pub fn region(&self, id: RegionId) -> Option<&Region> {
        self.graph.node_weight(NodeIndex::new(id))
    }

    /// `(from, to, edge)` in insertion order.
    pub fn edges(&self) -> impl Iterator<Item = (RegionId, RegionId, &DataEdge)> + '_ {
        self.graph
            .edge_references()
            .map(|e| (e.source().index(), e.target().index(), e.weight()))
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Weakly-connected components, each sorted, ordered by smallest member.
    pub fn weak_components(&self) -> Vec<Vec<RegionId>> {
        let mut sets = UnionFind::new(self.len());
        for edge in self.graph.edge_references() {
            sets.union(edge.source().index(), edge.target().index());
        }
        let mut components: Vec<Vec<RegionId>> = Vec::new();
        let mut slot_of_label: BTreeMap<usize, usize> = BTreeMap::new();
        for (id, label) in sets.into_labeling().into_iter().enumerate() {
            match slot_of_label.get(&label) {
                Some(&slot) => components[slot].push(id),
                None => {
                    slot_of_label.insert(label, components.len());
                    components.push(vec![id]);
                }
            }
        }
        components
    }

    /// The analysis precondition: exactly one weakly-connected component.
    pub fn check_connected(&self) -> Result<(), GraphError> {
        if self.is_empty() {
            return Err(GraphError::Empty {
                graph: self.name.clone(),
            });
        }
        if connected_components(&self.graph) != 1 {
            return Err(GraphError::Disconnected {
                graph: self.name.clone(),
                components: self
                    .weak_components()
                    .iter()
                    .map(|c| {
                        c.iter()
                            .filter_map(|&id| self.region(id))
                            .map(|r| r.name.clone())
                            .collect()
                    })
                    .collect(),
            });
        }
        Ok(())
    }

    /// Kernel execution order.
    ///
    /// Regions are ordered by dependence depth (longest edge path from a
    /// source); regions at equal depth keep insertion order.
    pub fn topological_order(&self) -> Result<Vec<RegionId>, GraphError> {
        let sorted = toposort(&self.graph, None).map_err(|_| GraphError::Cycle {
            graph: self.name.clone(),
        })?;
        let mut depth = vec![0usize; self.len()];
        for node in sorted {
            let next = depth[node.index()] + 1;
            for edge in self.graph.edges(node) {
                let target = edge.target().index();
                depth[target] = depth[target].max(next);
            }
        }
        let mut order: Vec<RegionId> = (0..self.len()).collect();
        order.sort_by_key(|&id| depth[id]);
        Ok(order)
    }

    /// Parse and validate a graph. Missing edges are derived from dataflow.
    pub fn from_json(text: &str) -> Result<Self, GraphError> {
        let mut graph: KernelGraph = serde_json::from_str(text)?;
        if graph.graph.edge_count() == 0 {
            graph.connect_by_dataflow();
        }
        Ok(graph)
    }

    pub fn from_file(path: &Path) -> Result<Self, GraphError> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String, GraphError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n() -> SymExpr {
        SymExpr::sym("N")
    }

    fn producer_consumer() -> KernelGraph {
        let mut graph = KernelGraph::new("two_mm");
        let first = Region::new("tmp")
            .with_loop("i", n())
            .with_loop("j", n())
            .with_loop("k", n())
            .read("A", "i*k")
            .unwrap()
            .read("B", "k*j")
            .unwrap()
            .write("T", "i*j")
            .unwrap();
        let second = Region::new("out")
            .with_loop("i", n())
            .with_loop("j", n())
            .read("T", "i*j")
            .unwrap()
            .write("D", "i*j")
            .unwrap();
        graph.add_region(first).unwrap();
        graph.add_region(second).unwrap();
        graph
    }

    #[test]
    fn test_dataflow_edges() {
        let mut graph = producer_consumer();
        assert_eq!(graph.edges().count(), 0);
        graph.connect_by_dataflow();
        let t = DataEdge {
            array: "T".to_string(),
        };
        assert_eq!(graph.edges().collect::<Vec<_>>(), vec![(0, 1, &t)]);
        graph.connect_by_dataflow();
        graph.add_edge(0, 1, "T").unwrap();
        assert_eq!(graph.edges().count(), 1, "edges are not duplicated");
        graph.add_edge(1, 1, "D").unwrap();
        assert_eq!(graph.edges().count(), 1, "self edges are ignored");
    }

    #[test]
    fn test_disconnected_graph_is_reported() {
        let graph = producer_consumer();
        match graph.check_connected() {
            Err(GraphError::Disconnected { graph, components }) => {
                assert_eq!(graph, "two_mm");
                assert_eq!(components, vec![vec!["tmp".to_string()], vec!["out".to_string()]]);
            }
            other => panic!("expected Disconnected, got {:?}", other),
        }
    }

    #[test]
    fn test_connected_graph_passes() {
        let mut graph = producer_consumer();
        graph.connect_by_dataflow();
        assert!(graph.check_connected().is_ok());
        assert_eq!(graph.weak_components(), vec![vec![0, 1]]);
    }

    #[test]
    fn test_empty_graph_is_rejected() {
        let graph = KernelGraph::new("nothing");
        assert!(matches!(graph.check_connected(), Err(GraphError::Empty { .. })));
    }

    #[test]
    fn test_undeclared_iterator() {
        let region = Region::new("bad")
            .with_loop("i", n())
            .read("A", "i*j")
            .unwrap();
        let mut graph = KernelGraph::new("g");
        assert!(matches!(
            graph.add_region(region),
            Err(GraphError::UndeclaredIterator { ref iterator, .. }) if iterator == "j"
        ));
    }

    #[test]
    fn test_topological_order_follows_edges() {
        let mut graph = KernelGraph::new("chain");
        for name in ["a", "b", "c"] {
            let region = Region::new(name)
                .with_loop("i", n())
                .read("X", "i")
                .unwrap();
            graph.add_region(region).unwrap();
        }
        graph.add_edge(2, 0, "X").unwrap();
        graph.add_edge(0, 1, "X").unwrap();
        assert_eq!(graph.topological_order().unwrap(), vec![2, 0, 1]);

        graph.add_edge(1, 2, "X").unwrap();
        assert!(matches!(graph.topological_order(), Err(GraphError::Cycle { .. })));
    }

    #[test]
    fn test_independent_regions_keep_insertion_order() {
        let mut graph = KernelGraph::new("diamond");
        for name in ["a", "b", "c", "d"] {
            let region = Region::new(name)
                .with_loop("i", n())
                .read("X", "i")
                .unwrap();
            graph.add_region(region).unwrap();
        }
        graph.add_edge(3, 1, "X").unwrap();
        graph.add_edge(3, 2, "X").unwrap();
        graph.add_edge(2, 0, "X").unwrap();
        assert_eq!(graph.topological_order().unwrap(), vec![3, 1, 2, 0]);
        assert_eq!(graph.weak_components(), vec![vec![0, 1, 2, 3]]);
    }

    #[test]
    fn test_json_edge_to_unknown_region() {
        let text = r#"{
            "name": "dangling",
            "regions": [{"name": "p", "loops": [{"name": "i", "extent": "N"}]}],
            "edges": [{"from": 0, "to": 3, "array": "A"}]
        }"#;
        let err = KernelGraph::from_json(text).unwrap_err();
        assert!(err.to_string().contains("unknown region 3"), "{}", err);
    }

    #[test]
    fn test_json_loading_derives_edges() {
        let text = r#"{
            "name": "two",
            "regions": [
                {"name": "p", "loops": [{"name": "i", "extent": "N"}],
                 "reads": [{"array": "A", "access": "i"}],
                 "writes": [{"array": "B", "access": "i"}]},
                {"name": "c", "loops": [{"name": "i", "extent": 64}],
                 "reads": [{"array": "B", "access": "i"}],
                 "writes": [{"array": "C", "access": "i"}], "ops_per_iter": 2}
            ]
        }"#;
        let graph = KernelGraph::from_json(text).unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.edges().count(), 1);
        let consumer = graph.region(1).unwrap();
        assert_eq!(consumer.loops[0].extent, SymExpr::num(64));
        assert_eq!(consumer.ops_per_iter, 2);
        assert!(graph.check_connected().is_ok());

        let back = KernelGraph::from_json(&graph.to_json().unwrap()).unwrap();
        assert_eq!(back, graph);
    }
}
