//! Workflow graph contract.
//!
//! Registered operations appear in the external workflow graph as node
//! templates. The graph calls back into the host through [`NodeHandlers`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::BoxFuture;
use crate::bridge::WorkflowNode;
use crate::error::HostError;

/// Failure reported by the workflow graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("workflow graph rejected '{key}': {message}")]
pub struct GraphError {
    /// Node key.
    pub key: String,
    /// Description of the problem.
    pub message: String,
}

/// Shape of a node published for an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTemplate {
    /// Operation name.
    pub name: String,
    /// Classification tags (`op`, `plugin`, execution kind).
    pub tags: Vec<String>,
    /// Operation key, used as the node type.
    #[serde(rename = "type")]
    pub op_key: String,
    /// UI description shown on the node.
    pub init: String,
}

/// Executes a node and returns its output node, if any.
pub type NodeHandler =
    Arc<dyn Fn(WorkflowNode) -> BoxFuture<'static, Result<Option<WorkflowNode>, HostError>> + Send + Sync>;

/// Fire-and-forget update callback.
pub type UpdateHandler = Arc<dyn Fn(WorkflowNode) + Send + Sync>;

/// Callbacks attached to a published node.
#[derive(Clone)]
pub struct NodeHandlers {
    /// Runs the operation.
    pub execute: NodeHandler,
    /// Pushes incremental updates, debounced by the host.
    pub update: Option<UpdateHandler>,
}

impl fmt::Debug for NodeHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandlers")
            .field("update", &self.update.is_some())
            .finish_non_exhaustive()
    }
}

/// External workflow graph engine.
pub trait WorkflowGraph: Send + Sync {
    /// Publishes a node template.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphError`] when the graph rejects the template.
    fn add_node(&self, template: NodeTemplate, handlers: NodeHandlers) -> Result<(), GraphError>;

    /// Withdraws the node published under `op_key`.
    fn remove_node(&self, op_key: &str);
}
