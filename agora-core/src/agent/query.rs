//! QUERY payloads an agent can answer

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::Agent;
use crate::knowledge::QueryPattern;

/// Read-only question answered from an agent's memory or knowledge graph.
///
/// Wire shapes:
///
/// - `{"key": "task_42"}`: memory lookup, short-term first
/// - `{"node_id": "analysis_1"}`: single knowledge node
/// - `{"node_type": "analysis", "properties": {...}, "limit": 5}`: node
///   query, every field optional, `properties` matched by equality
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AgentQuery {
    Memory {
        key: String,
    },
    Node {
        node_id: String,
    },
    Nodes {
        #[serde(default)]
        node_type: Option<String>,
        #[serde(default)]
        properties: Option<Map<String, Value>>,
        #[serde(default)]
        limit: Option<usize>,
    },
}

impl AgentQuery {
    pub(crate) fn answer(&self, agent: &Agent) -> Value {
        match self {
            AgentQuery::Memory { key } => {
                let value = agent.recall(key);
                json!({
                    "key": key,
                    "found": value.is_some(),
                    "value": value,
                })
            }
            AgentQuery::Node { node_id } => {
                let node = agent.knowledge().and_then(|graph| graph.get_node(node_id));
                json!({
                    "node_id": node_id,
                    "found": node.is_some(),
                    "node": node,
                })
            }
            AgentQuery::Nodes {
                node_type,
                properties,
                limit,
            } => {
                let Some(graph) = agent.knowledge() else {
                    return json!({ "nodes": [] });
                };

                let mut pattern = QueryPattern::new();
                if let Some(node_type) = node_type {
                    pattern = pattern.node_type(node_type.clone());
                }
                if let Some(expected) = properties.clone() {
                    pattern = pattern.predicate(move |props| {
                        expected.iter().all(|(k, v)| props.get(k) == Some(v))
                    });
                }
                if let Some(limit) = limit {
                    pattern = pattern.limit(*limit);
                }
                json!({ "nodes": graph.query(&pattern) })
            }
        }
    }
}
