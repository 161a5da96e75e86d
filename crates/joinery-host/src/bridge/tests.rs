//! Tests for the call/node translations.

use rstest::rstest;
use serde_json::{Value, json};

use super::*;

#[rstest]
#[case(Value::Null)]
#[case(json!(false))]
#[case(json!(""))]
fn falsy_results_produce_no_node(#[case] result: Value) {
    assert!(plugin_to_workflow(&result).is_none());
}

#[test]
fn typed_result_moves_data_into_target() {
    let result = json!({
        "type": "image/png",
        "name": "cells",
        "data": {"size": 3},
        "config": {"scale": 2},
        "_op": "Segment"
    });
    let node = plugin_to_workflow(&result).expect("node");
    assert_eq!(node.data, json!({"scale": 2}));
    assert_eq!(node.target["size"], 3);
    assert_eq!(node.target["name"], "cells");
    assert_eq!(node.target["type"], "image/png");
    assert_eq!(node.target["_op"], "Segment");
    assert_eq!(node.target["_variables"], json!({}));
    assert_eq!(node.target["_transfer"], false);
    assert_eq!(node.target["_workflow_id"], Value::Null);
}

#[test]
fn untyped_result_becomes_the_target() {
    let node = plugin_to_workflow(&json!({"value": 1})).expect("node");
    assert_eq!(node.data, Value::Null);
    assert_eq!(node.target["value"], 1);
}

#[test]
fn select_picks_an_array_element() {
    let result = json!({"type": "list", "data": [{"a": 1}, {"b": 2}], "select": 1});
    let node = plugin_to_workflow(&result).expect("node");
    assert_eq!(node.target["b"], 2);
    assert!(node.target.get("a").is_none());
}

#[test]
fn scalar_targets_pass_through() {
    let result = json!({"type": "text", "data": "hello"});
    let node = plugin_to_workflow(&result).expect("node");
    assert_eq!(node.target, json!("hello"));
}

#[test]
fn provenance_round_trips_for_object_targets() {
    let call = json!({
        "_op": "Threshold",
        "_source_op": "Load",
        "_workflow_id": "wf_1",
        "_transfer": true,
        "payload": {"x": 1}
    });
    let node = plugin_to_workflow(&call).expect("node");
    let back = workflow_to_plugin(node);
    assert_eq!(back.provenance.op, json!("Threshold"));
    assert_eq!(back.provenance.source_op, json!("Load"));
    assert_eq!(back.provenance.workflow_id, json!("wf_1"));
    assert_eq!(back.provenance.transfer, json!(true));
    assert_eq!(back.data, json!({"payload": {"x": 1}}));
}

#[test]
fn workflow_to_plugin_strips_provenance_from_target() {
    let node = WorkflowNode {
        data: json!({"threshold": 0.5}),
        target: json!({
            "name": "cells",
            "type": "image",
            "_op": "Load",
            "_variables": {},
            "_transfer": false,
            "_source_op": null,
            "_workflow_id": "wf"
        }),
    };
    let call = workflow_to_plugin(node);
    assert_eq!(call.config, json!({"threshold": 0.5}));
    assert_eq!(call.name.as_deref(), Some("cells"));
    assert_eq!(call.kind.as_deref(), Some("image"));
    assert_eq!(call.provenance.variables, json!({}));
    assert_eq!(call.data, json!({"name": "cells", "type": "image"}));
}

#[test]
fn empty_node_yields_empty_call() {
    let call = workflow_to_plugin(WorkflowNode::default());
    assert_eq!(call.data, json!({}));
    assert_eq!(call.name.as_deref(), Some(""));
}

#[test]
fn filter_keeps_only_visible_fields() {
    let call = json!({
        "_op": "Show",
        "config": {"a": 1},
        "data": {"b": 2},
        "plugin": "internal",
        "id": "window_1"
    });
    let filtered = filter_for_plugin(&call).expect("filtered").into_value();
    let mut keys: Vec<_> = filtered.as_object().expect("object").keys().cloned().collect();
    keys.sort();
    assert_eq!(
        keys,
        ["_op", "_source_op", "_transfer", "_variables", "_workflow_id", "config", "data"]
    );
    assert!(filter_for_plugin(&Value::Null).is_none());
}
