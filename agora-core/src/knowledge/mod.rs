//! Shared knowledge graph
//!
//! Typed nodes and edges that agents read and write as a common fact base.
//! The graph is handed around as a [`SharedKnowledgeGraph`] and guards its
//! structure with a reader/writer lock: queries run concurrently with each
//! other, mutations are exclusive. Each call is atomic on its own; callers
//! needing several calls to be consistent must serialize their own access.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{AgoraError, Result};

/// Property map carried by nodes and edges
pub type Properties = HashMap<String, Value>;

/// Graph handle shared between agents
pub type SharedKnowledgeGraph = Arc<KnowledgeGraph>;

/// Node in the knowledge graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeNode {
    /// Unique id within the graph
    pub id: String,

    /// Type label, e.g. `analysis` or `research`
    pub node_type: String,

    #[serde(default)]
    pub properties: Properties,

    pub created_at: DateTime<Utc>,
}

impl KnowledgeNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            properties: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Add a property
    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Get a property
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }
}

/// Directed, typed edge between two existing nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEdge {
    pub source: String,
    pub target: String,
    pub edge_type: String,

    #[serde(default)]
    pub properties: Properties,
}

impl KnowledgeEdge {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        edge_type: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            edge_type: edge_type.into(),
            properties: HashMap::new(),
        }
    }

    /// Add a property
    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

type Predicate = Arc<dyn Fn(&Properties) -> bool + Send + Sync>;

/// Node filter used by [`KnowledgeGraph::query`]
#[derive(Clone, Default)]
pub struct QueryPattern {
    node_type: Option<String>,
    predicate: Option<Predicate>,
    limit: Option<usize>,
}

impl fmt::Debug for QueryPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryPattern")
            .field("node_type", &self.node_type)
            .field("predicate", &self.predicate.is_some())
            .field("limit", &self.limit)
            .finish()
    }
}

impl QueryPattern {
    /// Match every node
    pub fn new() -> Self {
        Self::default()
    }

    /// Match nodes of one type
    pub fn of_type(node_type: impl Into<String>) -> Self {
        Self::new().node_type(node_type)
    }

    pub fn node_type(mut self, node_type: impl Into<String>) -> Self {
        self.node_type = Some(node_type.into());
        self
    }

    /// Keep nodes whose properties satisfy `predicate`
    pub fn predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Properties) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Return at most `limit` nodes
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, node: &KnowledgeNode) -> bool {
        self.node_type
            .as_deref()
            .is_none_or(|wanted| node.node_type == wanted)
            && self
                .predicate
                .as_ref()
                .is_none_or(|predicate| predicate(&node.properties))
    }
}

#[derive(Debug, Default)]
struct GraphInner {
    /// Nodes in insertion order
    nodes: Vec<KnowledgeNode>,
    index: HashMap<String, usize>,
    edges: Vec<KnowledgeEdge>,
    /// node id -> positions in `edges` where it is the source
    outgoing: HashMap<String, Vec<usize>>,
}

impl GraphInner {
    fn node(&self, id: &str) -> Option<&KnowledgeNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }
}

/// Serializable copy of the whole graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<KnowledgeNode>,
    pub edges: Vec<KnowledgeEdge>,
}

/// Typed node/edge store, see the module docs for the locking contract
#[derive(Debug, Default)]
pub struct KnowledgeGraph {
    inner: RwLock<GraphInner>,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a graph ready to be shared
    pub fn shared() -> SharedKnowledgeGraph {
        Arc::new(Self::new())
    }

    /// Rebuild a graph from a snapshot, validating it like individual inserts
    pub fn from_snapshot(snapshot: GraphSnapshot) -> Result<Self> {
        let graph = Self::new();
        for node in snapshot.nodes {
            graph.add_node(node)?;
        }
        for edge in snapshot.edges {
            graph.add_edge(edge)?;
        }
        Ok(graph)
    }

    /// Insert a node; fails if the id is taken
    pub fn add_node(&self, node: KnowledgeNode) -> Result<()> {
        let mut inner = self.write();
        if inner.index.contains_key(&node.id) {
            return Err(AgoraError::DuplicateNode(node.id));
        }
        tracing::debug!(node_id = %node.id, node_type = %node.node_type, "Added knowledge node");
        let position = inner.nodes.len();
        inner.index.insert(node.id.clone(), position);
        inner.nodes.push(node);
        Ok(())
    }

    /// Insert an edge; fails without modifying the graph if an endpoint is missing
    pub fn add_edge(&self, edge: KnowledgeEdge) -> Result<()> {
        let mut inner = self.write();
        let missing = [&edge.source, &edge.target]
            .into_iter()
            .find(|id| !inner.index.contains_key(id.as_str()))
            .cloned();
        if let Some(missing) = missing {
            return Err(AgoraError::DanglingReference {
                source_id: edge.source,
                target_id: edge.target,
                missing,
            });
        }

        let position = inner.edges.len();
        inner
            .outgoing
            .entry(edge.source.clone())
            .or_default()
            .push(position);
        inner.edges.push(edge);
        Ok(())
    }

    /// Merge `properties` into an existing node; returns false if absent
    pub fn update_properties(&self, id: &str, properties: Properties) -> bool {
        let mut inner = self.write();
        let Some(&position) = inner.index.get(id) else {
            return false;
        };
        inner.nodes[position].properties.extend(properties);
        true
    }

    /// Nodes matching `pattern`, in insertion order
    pub fn query(&self, pattern: &QueryPattern) -> Vec<KnowledgeNode> {
        let inner = self.read();
        let matching = inner.nodes.iter().filter(|node| pattern.matches(node));
        match pattern.limit {
            Some(limit) => matching.take(limit).cloned().collect(),
            None => matching.cloned().collect(),
        }
    }

    /// Look up a node by id
    pub fn get_node(&self, id: &str) -> Option<KnowledgeNode> {
        self.read().node(id).cloned()
    }

    /// Whether a node with `id` exists
    pub fn contains_node(&self, id: &str) -> bool {
        self.read().index.contains_key(id)
    }

    /// Outgoing edges of `id`
    pub fn edges_from(&self, id: &str) -> Vec<KnowledgeEdge> {
        let inner = self.read();
        inner
            .outgoing
            .get(id)
            .map(|positions| positions.iter().map(|&i| inner.edges[i].clone()).collect())
            .unwrap_or_default()
    }

    /// Targets of the outgoing edges of `id`, optionally of one edge type
    pub fn neighbors(&self, id: &str, edge_type: Option<&str>) -> Vec<KnowledgeNode> {
        let inner = self.read();
        let Some(positions) = inner.outgoing.get(id) else {
            return Vec::new();
        };
        positions
            .iter()
            .map(|&i| &inner.edges[i])
            .filter(|edge| edge_type.is_none_or(|wanted| edge.edge_type == wanted))
            .filter_map(|edge| inner.node(&edge.target).cloned())
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.read().nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.read().edges.len()
    }

    /// Copy the graph for serialization
    pub fn snapshot(&self) -> GraphSnapshot {
        let inner = self.read();
        GraphSnapshot {
            nodes: inner.nodes.clone(),
            edges: inner.edges.clone(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, GraphInner> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, GraphInner> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_graph() -> KnowledgeGraph {
        let graph = KnowledgeGraph::new();
        graph
            .add_node(KnowledgeNode::new("research_1", "research").with_property("topic", json!("graphs")))
            .unwrap();
        graph
            .add_node(
                KnowledgeNode::new("analysis_1", "analysis")
                    .with_property("score", json!(0.9))
                    .with_property("topic", json!("graphs")),
            )
            .unwrap();
        graph
            .add_node(KnowledgeNode::new("analysis_2", "analysis").with_property("score", json!(0.4)))
            .unwrap();
        graph
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let graph = sample_graph();
        let err = graph
            .add_node(KnowledgeNode::new("research_1", "research"))
            .unwrap_err();
        assert!(matches!(err, AgoraError::DuplicateNode(id) if id == "research_1"));
        assert_eq!(graph.node_count(), 3);
    }

    #[test]
    fn test_dangling_edge_leaves_graph_unmodified() {
        let graph = sample_graph();
        let before = graph.snapshot();

        let err = graph
            .add_edge(KnowledgeEdge::new("research_1", "missing", "supports"))
            .unwrap_err();
        assert!(matches!(
            err,
            AgoraError::DanglingReference { ref missing, .. } if missing == "missing"
        ));

        let err = graph
            .add_edge(KnowledgeEdge::new("ghost", "analysis_1", "supports"))
            .unwrap_err();
        assert!(matches!(err, AgoraError::DanglingReference { .. }));

        assert_eq!(graph.snapshot(), before);
        assert_eq!(graph.edge_count(), 0);
        assert!(graph.edges_from("research_1").is_empty());
    }

    #[test]
    fn test_query_by_type_predicate_and_limit() {
        let graph = sample_graph();

        let analyses = graph.query(&QueryPattern::of_type("analysis"));
        assert_eq!(analyses.len(), 2);
        assert_eq!(analyses[0].id, "analysis_1");

        let strong = graph.query(&QueryPattern::of_type("analysis").predicate(|props| {
            props.get("score").and_then(Value::as_f64).is_some_and(|s| s > 0.5)
        }));
        assert_eq!(strong.len(), 1);
        assert_eq!(strong[0].id, "analysis_1");

        let about_graphs = graph.query(
            &QueryPattern::new().predicate(|props| props.get("topic") == Some(&json!("graphs"))),
        );
        assert_eq!(about_graphs.len(), 2);

        let limited = graph.query(&QueryPattern::new().limit(1));
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, "research_1");

        assert!(graph.query(&QueryPattern::of_type("nothing")).is_empty());
    }

    #[test]
    fn test_neighbors_follow_edge_types() {
        let graph = sample_graph();
        graph
            .add_edge(KnowledgeEdge::new("research_1", "analysis_1", "analyzed_by"))
            .unwrap();
        graph
            .add_edge(KnowledgeEdge::new("research_1", "analysis_2", "cites"))
            .unwrap();

        assert_eq!(graph.neighbors("research_1", None).len(), 2);
        let analyzed = graph.neighbors("research_1", Some("analyzed_by"));
        assert_eq!(analyzed.len(), 1);
        assert_eq!(analyzed[0].id, "analysis_1");
        assert!(graph.neighbors("analysis_1", None).is_empty());
    }

    #[test]
    fn test_update_properties_merges() {
        let graph = sample_graph();
        let mut update = Properties::new();
        update.insert("score".to_string(), json!(0.95));
        assert!(graph.update_properties("analysis_1", update.clone()));
        assert!(!graph.update_properties("ghost", update));

        let node = graph.get_node("analysis_1").unwrap();
        assert_eq!(node.property("score"), Some(&json!(0.95)));
        assert_eq!(node.property("topic"), Some(&json!("graphs")));
    }

    #[test]
    fn test_snapshot_rebuild() {
        let graph = sample_graph();
        graph
            .add_edge(KnowledgeEdge::new("analysis_1", "research_1", "derived_from"))
            .unwrap();

        let json = serde_json::to_string(&graph.snapshot()).unwrap();
        let snapshot: GraphSnapshot = serde_json::from_str(&json).unwrap();
        let rebuilt = KnowledgeGraph::from_snapshot(snapshot).unwrap();

        assert_eq!(rebuilt.node_count(), 3);
        assert_eq!(rebuilt.neighbors("analysis_1", None)[0].id, "research_1");
    }

    #[test]
    fn test_concurrent_writers_on_shared_graph() {
        let graph = KnowledgeGraph::shared();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let graph = Arc::clone(&graph);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        graph
                            .add_node(KnowledgeNode::new(format!("n_{t}_{i}"), "fact"))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(graph.node_count(), 400);
    }
}
