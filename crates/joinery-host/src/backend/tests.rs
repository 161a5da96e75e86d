//! Tests for execution kinds, the backend registry and connection signals.

use rstest::rstest;

use super::*;

struct NeverFactory;

impl BackendFactory for NeverFactory {
    fn instantiate(&self, _spec: InstanceSpec) -> Result<Instantiation, BackendError> {
        Err(BackendError::new("not used"))
    }
}

#[rstest]
#[case("window", PluginKind::Window)]
#[case("web-worker", PluginKind::WebWorker)]
#[case("iframe", PluginKind::Iframe)]
#[case("web-python", PluginKind::WebPython)]
#[case("web-python-window", PluginKind::WebPythonWindow)]
#[case("native-python", PluginKind::NativePython)]
#[case("collection", PluginKind::Collection)]
fn kinds_parse_from_declared_type(#[case] declared: &str, #[case] expected: PluginKind) {
    assert_eq!(declared.parse::<PluginKind>().ok(), Some(expected));
    assert_eq!(expected.to_string(), declared);
}

#[test]
fn kind_classification() {
    assert!(PluginKind::Window.is_window());
    assert!(PluginKind::WebPythonWindow.is_window());
    assert!(!PluginKind::WebWorker.is_window());
    assert!(PluginKind::NativePython.is_native());
    assert_eq!(PluginKind::NativePython.workflow_tag(), "python");
}

#[test]
fn registry_reports_supported_kinds() {
    let registry = BackendRegistry::new().with(PluginKind::WebWorker, Arc::new(NeverFactory));
    assert!(registry.supports("web-worker"));
    assert!(registry.supports("collection"));
    assert!(!registry.supports("window"));
    assert!(!registry.supports("python"));
    assert!(registry.factory(PluginKind::WebWorker).is_some());
    assert!(registry.factory(PluginKind::Window).is_none());
}

#[tokio::test]
async fn connection_signal_reports_success() {
    let (notifier, signal) = connection_channel();
    notifier.connected();
    assert!(signal.wait().await.is_ok());
}

#[tokio::test]
async fn connection_signal_reports_failure_reason() {
    let (notifier, signal) = connection_channel();
    notifier.failed(BackendError::new("engine refused"));
    let err = signal.wait().await.expect_err("failure");
    assert_eq!(err.message(), "engine refused");
}

#[tokio::test]
async fn dropped_notifier_is_a_failure() {
    let (notifier, signal) = connection_channel();
    drop(notifier);
    assert!(signal.wait().await.is_err());
}

#[tokio::test]
async fn ready_signal_resolves_immediately() {
    assert!(ConnectionSignal::ready().wait().await.is_ok());
}

#[test]
fn api_members_parse_from_function_names() {
    assert_eq!("setup".parse::<ApiMember>().ok(), Some(ApiMember::Setup));
    assert!("export".parse::<ApiMember>().is_err());
}
