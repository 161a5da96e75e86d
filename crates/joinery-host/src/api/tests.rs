//! Tests for the host API exposed to sandboxes.

use std::sync::Arc;

use rstest::{fixture, rstest};
use serde_json::{Value, json};

use super::*;
use crate::backend::ApiMember;
use crate::engine::EngineList;
use crate::parser::{ParseOverrides, parse_plugin_source};
use crate::store::KeyValueStore;
use crate::tests::support::{PluginSource, Script, TestHost, engine_url, mock_engine, serving_engine};

#[fixture]
fn host() -> TestHost {
    TestHost::new()
}

async fn api_for(host: &TestHost, source: PluginSource) -> HostApi {
    let name = source.config().name;
    host.controller()
        .load(source.config())
        .await
        .expect("plugin should load");
    host.factory.api_for(&name).expect("api handed to sandbox")
}

#[test]
fn config_keys_are_scoped_by_plugin() {
    assert_eq!(config_key("Counter", "threshold"), "config_Counter_threshold");
}

#[rstest]
#[tokio::test]
async fn api_is_bound_to_its_instance(host: TestHost) {
    let api = api_for(&host, PluginSource::new("Counter", "web-worker")).await;
    let caller = api.caller().expect("caller");
    assert_eq!(caller.name(), "Counter");
}

#[rstest]
#[tokio::test]
async fn unloaded_caller_is_unavailable(host: TestHost) {
    let api = api_for(&host, PluginSource::new("Counter", "web-worker")).await;
    host.controller().unload("Counter", false).await;
    let error = api
        .register(OperationDescriptor::named("Late"))
        .expect_err("caller is gone");
    assert!(matches!(error, HostError::CallerUnavailable));
}

#[rstest]
#[tokio::test]
async fn register_and_unregister_act_for_the_caller(host: TestHost) {
    let api = api_for(&host, PluginSource::new("Counter", "web-worker")).await;
    let key = api
        .register(OperationDescriptor::named("Reset"))
        .expect("registration");
    assert_eq!(key, "Counter/Reset");
    assert!(host.graph.keys().contains(&key));

    api.unregister(Some("Reset")).expect("unregister");
    assert!(!host.graph.keys().contains(&key));
    assert!(host.graph.keys().contains(&"Counter".to_owned()));
}

#[rstest]
#[tokio::test]
async fn call_plugin_reaches_exported_functions(host: TestHost) {
    let script = Script {
        functions: ["count".to_owned()].into_iter().collect(),
        ..Script::default()
    };
    host.factory.script("Counter", script);
    api_for(&host, PluginSource::new("Counter", "web-worker")).await;
    let caller = api_for(&host, PluginSource::new("Caller", "web-worker")).await;

    let result = caller
        .call_plugin("Counter", "count", vec![json!(3)])
        .await
        .expect("call");
    assert_eq!(result, json!({"function": "count", "payload": 3}));

    let unexported = caller
        .call_plugin("Counter", "reset", Vec::new())
        .await
        .expect_err("reset is not exported");
    assert!(matches!(unexported, HostError::FunctionUnavailable { .. }));

    let missing = caller
        .call_plugin("Ghost", "count", Vec::new())
        .await
        .expect_err("no such plugin");
    assert_eq!(missing.to_string(), "plugin with type Ghost not found.");
}

#[rstest]
#[tokio::test]
async fn run_plugin_defaults_a_null_payload(host: TestHost) {
    api_for(&host, PluginSource::new("Counter", "web-worker")).await;
    let caller = api_for(&host, PluginSource::new("Caller", "web-worker")).await;

    let result = caller
        .run_plugin("Counter", Value::Null)
        .await
        .expect("run");
    assert_eq!(result, json!({}));

    let target = api_for_name(&host, "Counter");
    assert!(target.get_plugin("Counter").is_ok_and(|api| api.exposes(ApiMember::Run)));
}

fn api_for_name(host: &TestHost, name: &str) -> HostApi {
    host.factory.api_for(name).expect("api handed to sandbox")
}

#[rstest]
#[tokio::test]
async fn settings_round_trip_through_the_store(host: TestHost) {
    let api = api_for(&host, PluginSource::new("Counter", "web-worker")).await;

    api.set_config("threshold", json!(3)).await.expect("store");
    assert_eq!(api.get_config("threshold").await.expect("read"), Some(json!(3)));
    let doc = host
        .config_store
        .get("config_Counter_threshold")
        .await
        .expect("stored document");
    assert_eq!(doc, json!({"_id": "config_Counter_threshold", "value": 3}));

    api.set_config("threshold", Value::Null).await.expect("delete");
    assert_eq!(api.get_config("threshold").await.expect("read"), None);
    api.set_config("never_set", json!(false))
        .await
        .expect("deleting a missing setting is fine");
}

#[rstest]
#[tokio::test]
async fn underscore_names_read_config_fields(host: TestHost) {
    let api = api_for(&host, PluginSource::new("Counter", "web-worker")).await;

    let version = api.get_config("_version").await.expect("read");
    assert_eq!(version, Some(json!("0.1.0")));
    let error = api
        .set_config("_name", json!("Other"))
        .await
        .expect_err("config fields are readonly");
    assert_eq!(
        error.to_string(),
        "'name' is a readonly field defined in <config> block, please avoid using it"
    );

    api.set_config("_scratch", json!(1))
        .await
        .expect("unknown fields are plain settings");
    assert_eq!(api.get_config("_scratch").await.expect("read"), Some(json!(1)));
}

#[rstest]
#[tokio::test]
async fn attachments_are_read_by_name(host: TestHost) {
    let code = format!(
        "{}<attachment name=\"weights\">0.5 0.25</attachment>\n",
        PluginSource::new("Model", "web-worker").render()
    );
    let config = parse_plugin_source(&code, &ParseOverrides::default()).expect("parse");
    host.controller().load(config).await.expect("load");
    let api = api_for_name(&host, "Model");

    let weights = api.get_attachment("weights").expect("caller");
    assert_eq!(weights.as_deref().map(str::trim), Some("0.5 0.25"));
    assert_eq!(api.get_attachment("bias").expect("caller"), None);
}

#[rstest]
#[tokio::test]
async fn messages_and_logs_go_to_the_right_channel(host: TestHost) {
    let api = api_for(&host, PluginSource::new("Counter", "web-worker")).await;
    api.show_message("hello", None).expect("message");
    api.log("counted to three");
    api.error("count overflow");

    assert!(host.messages.contains("hello"));
    let caller = api.caller().expect("caller");
    assert!(caller.log_history().contains(&"counted to three".to_owned()));
    let started = host.factory.started_for("Counter");
    assert_eq!(started.first().expect("sandbox").sandbox.errors(), ["count overflow"]);
}

#[rstest]
#[tokio::test]
async fn file_urls_come_from_the_callers_engine() {
    let engines = Arc::new(EngineList::new(vec![serving_engine("local")]));
    let host = TestHost::with_engines(engines);
    let api = api_for(&host, PluginSource::new("Trainer", "native-python")).await;

    let url = api
        .get_file_url(json!({"path": "/data/a.png"}))
        .await
        .expect("file url");
    assert_eq!(url, format!("{}/file/served", engine_url("local")));
}

#[rstest]
#[tokio::test]
async fn file_operations_can_name_an_engine() {
    let engines = Arc::new(EngineList::new(vec![
        Arc::new(mock_engine("idle", true)) as Arc<dyn Engine>,
        serving_engine("remote"),
    ]));
    let host = TestHost::with_engines(engines);
    let api = api_for(&host, PluginSource::new("Counter", "web-worker")).await;

    let url = api
        .get_file_url(json!({"path": "/data/a.png", "engine": engine_url("remote")}))
        .await
        .expect("file url");
    assert_eq!(url, format!("{}/file/served", engine_url("remote")));
}

#[rstest]
#[tokio::test]
async fn file_operations_without_an_engine_are_reported(host: TestHost) {
    let api = api_for(&host, PluginSource::new("Counter", "web-worker")).await;
    let error = api
        .get_file_url(json!({"path": "/data/a.png"}))
        .await
        .expect_err("no engine");
    assert!(matches!(error, HostError::Engine(_)));
    assert!(host.messages.contains("Please specify an engine"));
}

#[rstest]
#[tokio::test]
async fn file_path_requests_need_a_url(host: TestHost) {
    let api = api_for(&host, PluginSource::new("Counter", "web-worker")).await;
    let error = api
        .get_file_path(json!({"path": "/data/a.png"}))
        .await
        .expect_err("url is required");
    assert!(error.to_string().contains("`url`"));
}
