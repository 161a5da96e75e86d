//! Top-level block scanner for plugin source files.
//!
//! A plugin source is a sequence of HTML-like blocks (`<config>`,
//! `<script>`, `<docs>`, ...). Only top-level blocks of the known kinds are
//! recognised; their bodies are kept verbatim.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static OPENING_TAG: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"<(config|script|link|window|style|docs|attachment)(\s[^>]*)?>").ok()
});

static ATTRIBUTE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r#"([\w-]+)\s*=\s*"([^"]*)""#).ok());

/// A single block with its attributes and raw content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Attributes declared on the opening tag.
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    /// Text between the opening and closing tags.
    #[serde(default)]
    pub content: String,
}

impl Block {
    /// Returns the attribute `name`, if declared.
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }
}

/// Blocks of a plugin source grouped by kind, in source order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Components {
    pub config: Vec<Block>,
    pub script: Vec<Block>,
    pub link: Vec<Block>,
    pub window: Vec<Block>,
    pub style: Vec<Block>,
    pub docs: Vec<Block>,
    pub attachment: Vec<Block>,
}

impl Components {
    fn bucket(&mut self, kind: &str) -> Option<&mut Vec<Block>> {
        match kind {
            "config" => Some(&mut self.config),
            "script" => Some(&mut self.script),
            "link" => Some(&mut self.link),
            "window" => Some(&mut self.window),
            "style" => Some(&mut self.style),
            "docs" => Some(&mut self.docs),
            "attachment" => Some(&mut self.attachment),
            _ => None,
        }
    }
}

/// Splits `source` into its top-level blocks.
///
/// An opening tag without a matching closing tag is ignored, as is anything
/// nested inside a recognised block.
pub(crate) fn parse_components(source: &str) -> Components {
    let mut components = Components::default();
    let (Some(opening), Some(attribute)) = (OPENING_TAG.as_ref(), ATTRIBUTE.as_ref()) else {
        return components;
    };

    let mut cursor = 0;
    while let Some(rest) = source.get(cursor..) {
        let Some(captures) = opening.captures(rest) else {
            break;
        };
        let (Some(whole), Some(kind)) = (captures.get(0), captures.get(1)) else {
            break;
        };
        let body_start = cursor + whole.end();
        let closing = format!("</{}>", kind.as_str());
        let Some(body_len) = source.get(body_start..).and_then(|body| body.find(&closing)) else {
            cursor = body_start;
            continue;
        };

        let attrs = captures
            .get(2)
            .map(|raw| {
                attribute
                    .captures_iter(raw.as_str())
                    .filter_map(|pair| Some((pair.get(1)?.as_str(), pair.get(2)?.as_str())))
                    .map(|(key, value)| (key.to_owned(), value.to_owned()))
                    .collect()
            })
            .unwrap_or_default();
        let content = source
            .get(body_start..body_start + body_len)
            .unwrap_or_default()
            .to_owned();
        if let Some(bucket) = components.bucket(kind.as_str()) {
            bucket.push(Block { attrs, content });
        }
        cursor = body_start + body_len + closing.len();
    }
    components
}
