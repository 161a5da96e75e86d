//! Translation between plugin call shapes and workflow nodes.
//!
//! Plugins receive and return a flat call record carrying provenance fields
//! (`_op`, `_source_op`, `_workflow_id`, `_transfer`, `_variables`) next to
//! `config` and `data`. The workflow graph works with `{data, target}` nodes
//! whose `target` carries the same provenance merged into the payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::repository::is_truthy;

const VARIABLES: &str = "_variables";
const OP: &str = "_op";
const SOURCE_OP: &str = "_source_op";
const TRANSFER: &str = "_transfer";
const WORKFLOW_ID: &str = "_workflow_id";

/// Provenance keys carried on node targets.
pub const PROVENANCE_KEYS: [&str; 5] = [VARIABLES, OP, SOURCE_OP, TRANSFER, WORKFLOW_ID];

/// Where a payload came from within a workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Workflow variables.
    #[serde(rename = "_variables", default)]
    pub variables: Value,
    /// Operation that produced the payload.
    #[serde(rename = "_op", default)]
    pub op: Value,
    /// Operation that fed `op`.
    #[serde(rename = "_source_op", default)]
    pub source_op: Value,
    /// Whether the payload may be transferred rather than copied.
    #[serde(rename = "_transfer", default)]
    pub transfer: Value,
    /// Workflow run id.
    #[serde(rename = "_workflow_id", default)]
    pub workflow_id: Value,
}

impl Provenance {
    fn read(source: &Map<String, Value>) -> Self {
        let field = |key: &str| source.get(key).cloned().unwrap_or(Value::Null);
        Self {
            variables: truthy_or(source.get(VARIABLES), Value::Null),
            op: field(OP),
            source_op: field(SOURCE_OP),
            transfer: field(TRANSFER),
            workflow_id: field(WORKFLOW_ID),
        }
    }
}

/// Argument record passed to a plugin's `run` or `update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginCall {
    /// Provenance of the payload.
    #[serde(flatten)]
    pub provenance: Provenance,
    /// Operation configuration.
    #[serde(default)]
    pub config: Value,
    /// Payload.
    #[serde(default)]
    pub data: Value,
    /// Payload name, when translated from a node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Payload type, when translated from a node.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl PluginCall {
    /// Converts the call into the JSON record handed to the sandbox.
    #[must_use]
    pub fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// A workflow node as exchanged with the graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Node configuration.
    #[serde(default)]
    pub data: Value,
    /// Node payload, including provenance.
    #[serde(default)]
    pub target: Value,
}

fn truthy_or(value: Option<&Value>, default: Value) -> Value {
    value.filter(|present| is_truthy(present)).cloned().unwrap_or(default)
}

fn text_or_empty(source: &Map<String, Value>, key: &str) -> String {
    source
        .get(key)
        .filter(|value| is_truthy(value))
        .map(|value| match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default()
}

/// Translates a plugin result into a workflow node.
///
/// Returns `None` for a falsy result, or for an object target with four or
/// fewer keys once provenance has been added.
#[must_use]
pub fn plugin_to_workflow(result: &Value) -> Option<WorkflowNode> {
    if !is_truthy(result) {
        return None;
    }
    let fields = result.as_object();
    let field = |key: &str| fields.and_then(|map| map.get(key));

    let typed = field("type").is_some_and(is_truthy) && field("data").is_some_and(is_truthy);
    let (data, mut target) = if typed {
        let mut target = field("data").cloned().unwrap_or(Value::Null);
        if let Value::Object(map) = &mut target {
            map.insert("name".into(), truthy_or(field("name"), Value::String(String::new())));
            map.insert("type".into(), truthy_or(field("type"), Value::String(String::new())));
        }
        (field("config").cloned().unwrap_or(Value::Null), target)
    } else {
        (Value::Null, result.clone())
    };

    if !is_truthy(&target) {
        target = Value::Object(Map::new());
    }
    if let Value::Array(items) = &target {
        let selected = field("select")
            .and_then(Value::as_u64)
            .and_then(|index| usize::try_from(index).ok())
            .and_then(|index| items.get(index))
            .filter(|item| is_truthy(item))
            .cloned();
        if let Some(item) = selected {
            target = item;
        }
    }

    if let Value::Object(map) = &mut target {
        map.insert(VARIABLES.into(), truthy_or(field(VARIABLES), Value::Object(Map::new())));
        map.insert(WORKFLOW_ID.into(), truthy_or(field(WORKFLOW_ID), Value::Null));
        map.insert(OP.into(), truthy_or(field(OP), Value::Null));
        map.insert(SOURCE_OP.into(), truthy_or(field(SOURCE_OP), Value::Null));
        map.insert(TRANSFER.into(), truthy_or(field(TRANSFER), Value::Bool(false)));
        if map.len() <= 4 {
            return None;
        }
    }
    Some(WorkflowNode { data, target })
}

/// Translates a workflow node into the call record for a plugin.
///
/// Provenance is moved from the node's target onto the call.
#[must_use]
pub fn workflow_to_plugin(node: WorkflowNode) -> PluginCall {
    let mut target = if is_truthy(&node.target) {
        node.target
    } else {
        Value::Object(Map::new())
    };
    let (provenance, name, kind) = match &mut target {
        Value::Object(map) => {
            let provenance = Provenance::read(map);
            let name = text_or_empty(map, "name");
            let kind = text_or_empty(map, "type");
            for key in PROVENANCE_KEYS {
                map.remove(key);
            }
            (provenance, name, kind)
        }
        _ => (Provenance::default(), String::new(), String::new()),
    };
    PluginCall {
        provenance,
        config: node.data,
        data: target,
        name: Some(name),
        kind: Some(kind),
    }
}

/// Projects a call record down to the fields a plugin handler may see.
#[must_use]
pub fn filter_for_plugin(call: &Value) -> Option<PluginCall> {
    if !is_truthy(call) {
        return None;
    }
    let empty = Map::new();
    let map = call.as_object().unwrap_or(&empty);
    Some(PluginCall {
        provenance: Provenance::read(map),
        config: map.get("config").cloned().unwrap_or(Value::Null),
        data: map.get("data").cloned().unwrap_or(Value::Null),
        name: None,
        kind: None,
    })
}

#[cfg(test)]
mod tests;
