//! Tests for plugin reference parsing and source resolution.

use std::sync::Arc;

use rstest::{fixture, rstest};
use serde_json::json;

use super::*;
use crate::fetch::MemoryFetcher;

const MANIFEST_URL: &str =
    "https://raw.githubusercontent.com/oeway/ImJoy-Plugins/master/manifest.imjoy.json";
const IMAGE_WINDOW_URI: &str =
    "https://raw.githubusercontent.com/oeway/ImJoy-Plugins/master/repository/Image Window.imjoy.html";

#[fixture]
fn fetcher() -> Arc<MemoryFetcher> {
    let fetcher = Arc::new(MemoryFetcher::new());
    fetcher.insert(
        MANIFEST_URL,
        json!({
            "name": "ImJoy Repository",
            "uri_root": "/repository/",
            "plugins": [{"name": "Image Window"}, {"name": "Empty"}],
        })
        .to_string(),
    );
    fetcher.insert(IMAGE_WINDOW_URI, "<config lang=\"json\">{}</config>");
    fetcher.insert(
        "https://raw.githubusercontent.com/oeway/ImJoy-Plugins/master/repository/Empty.imjoy.html",
        "  ",
    );
    fetcher
}

fn resolver(fetcher: &Arc<MemoryFetcher>) -> ReferenceResolver {
    ReferenceResolver::new(Arc::clone(fetcher) as Arc<dyn SourceFetcher>)
}

#[rstest]
#[case::scoped(
    "oeway/ImJoy-Plugins:Image Window",
    PluginReference::Scoped {
        repository: "oeway/ImJoy-Plugins".to_owned(),
        repository_tag: None,
        plugin: "Image Window".to_owned(),
        tag: None,
    }
)]
#[case::scoped_tags(
    "oeway/ImJoy-Plugins@stable:Image Window@dev",
    PluginReference::Scoped {
        repository: "oeway/ImJoy-Plugins".to_owned(),
        repository_tag: Some("stable".to_owned()),
        plugin: "Image Window".to_owned(),
        tag: Some("dev".to_owned()),
    }
)]
#[case::named("Image Window@dev", PluginReference::Named { name: "Image Window".to_owned(), tag: Some("dev".to_owned()) })]
#[case::named_plain("Image Window", PluginReference::Named { name: "Image Window".to_owned(), tag: None })]
#[case::uri_tag(
    "https://example.org/p/Demo.imjoy.html@gpu",
    PluginReference::Uri { uri: "https://example.org/p/Demo.imjoy.html".to_owned(), tag: Some("gpu".to_owned()) }
)]
#[case::github_blob(
    "https://github.com/oeway/ImJoy-Plugins/blob/master/repository/Demo.imjoy.html",
    PluginReference::Uri {
        uri: "https://raw.githubusercontent.com/oeway/ImJoy-Plugins/master/repository/Demo.imjoy.html".to_owned(),
        tag: None,
    }
)]
fn parses_references(#[case] reference: &str, #[case] expected: PluginReference) {
    let parsed: PluginReference = reference.parse().expect("reference should parse");
    assert_eq!(parsed, expected);
}

#[rstest]
fn rejects_scoped_reference_without_plugin_name() {
    let err = "oeway/ImJoy-Plugins:"
        .parse::<PluginReference>()
        .expect_err("empty plugin name should fail");
    assert!(err.to_string().contains("REPO_NAME:PLUGIN_NAME"));
}

#[rstest]
#[tokio::test]
async fn resolves_scoped_reference_through_manifest(fetcher: Arc<MemoryFetcher>) {
    let source = resolver(&fetcher)
        .resolve("oeway/ImJoy-Plugins:Image Window@dev", &[])
        .await
        .expect("scoped reference should resolve");
    assert_eq!(source.uri, IMAGE_WINDOW_URI);
    assert_eq!(source.tag.as_deref(), Some("dev"));
    assert_eq!(source.scope.len(), 2);
    let requested = fetcher.requests();
    let last = requested.last().expect("source should be requested");
    assert!(last.starts_with(&format!("{IMAGE_WINDOW_URI}?")), "cache buster expected: {last}");
}

#[rstest]
#[tokio::test]
async fn reports_plugin_missing_from_manifest(fetcher: Arc<MemoryFetcher>) {
    let err = resolver(&fetcher)
        .resolve("oeway/ImJoy-Plugins:Nothing", &[])
        .await
        .expect_err("unknown plugin should fail");
    assert_eq!(err.to_string(), "plugin not found oeway/ImJoy-Plugins:Nothing");
}

#[rstest]
#[tokio::test]
async fn resolves_name_within_scope(fetcher: Arc<MemoryFetcher>) {
    let scope = vec![ManifestEntry::new("Image Window", IMAGE_WINDOW_URI)];
    let source = resolver(&fetcher)
        .resolve("Image Window", &scope)
        .await
        .expect("name in scope should resolve");
    assert_eq!(source.code, "<config lang=\"json\">{}</config>");
    assert_eq!(source.scope, scope);
}

#[rstest]
#[tokio::test]
async fn reports_name_missing_from_scope(fetcher: Arc<MemoryFetcher>) {
    let err = resolver(&fetcher)
        .resolve("Ghost", &[])
        .await
        .expect_err("unknown name should fail");
    assert_eq!(err.to_string(), "Plugin \"Ghost\" cannot be found in the repository.");
}

#[rstest]
#[tokio::test]
async fn rejects_uri_without_plugin_suffix(fetcher: Arc<MemoryFetcher>) {
    let err = resolver(&fetcher)
        .resolve("https://example.org/plugin.js", &[])
        .await
        .expect_err("wrong suffix should fail");
    assert!(matches!(err, HostError::Resolution { .. }));
    assert!(fetcher.requests().is_empty());
}

#[rstest]
#[tokio::test]
async fn rejects_empty_source(fetcher: Arc<MemoryFetcher>) {
    let err = resolver(&fetcher)
        .resolve("oeway/ImJoy-Plugins:Empty", &[])
        .await
        .expect_err("empty source should fail");
    assert!(matches!(err, HostError::Fetch(FetchError::Empty { .. })));
}

#[rstest]
#[case::raw_without_query("https://raw.githubusercontent.com/a/b/master/X.imjoy.html", true)]
#[case::gist("https://gist.githubusercontent.com/a/1/raw/X.imjoy.html", true)]
#[case::raw_with_query("https://raw.githubusercontent.com/a/b/master/X.imjoy.html?v=1", false)]
#[case::other_host("https://example.org/X.imjoy.html", false)]
fn busts_cache_for_raw_hosts(#[case] uri: &str, #[case] busted: bool) {
    let result = cache_busted(uri);
    assert_eq!(result != uri, busted);
    assert!(result.starts_with(uri));
}
