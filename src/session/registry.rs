//! Model registry extraction.
//!
//! The upstream page embeds its model catalogue as an `initialModels` array
//! inside framework payload scripts, usually as JSON escaped into a string
//! literal. The extractor recovers that array and keys it by public name.

use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use serde_json::{Map, Value};

const MARKER: &str = "initialModels";

static SCRIPT_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("script").expect("invalid script selector"));

/// Producer of the `name → descriptor` map sent to the controller.
pub trait RegistrySource: Send + Sync {
    /// `None` when `markup` carries no registry.
    fn extract(&self, markup: &str) -> Option<Map<String, Value>>;
}

/// Registry source reading the page-embedded model list.
#[derive(Debug, Clone, Default)]
pub struct PageRegistryExtractor;

impl PageRegistryExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl RegistrySource for PageRegistryExtractor {
    fn extract(&self, markup: &str) -> Option<Map<String, Value>> {
        let document = Html::parse_document(markup);
        let from_scripts = document
            .select(&SCRIPT_SELECTOR)
            .map(|script| script.text().collect::<String>())
            .filter(|text| text.contains(MARKER))
            .find_map(|text| models_from_text(&text));

        from_scripts.or_else(|| {
            let decoded = html_escape::decode_html_entities(markup);
            models_from_text(&decoded)
        })
    }
}

/// Locates the marker in `text`, unescaping a string-literal context first.
fn models_from_text(text: &str) -> Option<Map<String, Value>> {
    let position = text.find(MARKER)?;
    let escaped = text[..position].ends_with("\\\"");
    let source = if escaped {
        unescape_literal(&text[position..])
    } else {
        text[position..].to_string()
    };

    let start = source.find('[')?;
    let array = balanced_array(&source[start..])?;
    let Value::Array(models) = serde_json::from_str::<Value>(array).ok()? else {
        return None;
    };

    let registry: Map<String, Value> = models
        .into_iter()
        .filter_map(|model| {
            let name = model.get("publicName")?.as_str()?.to_string();
            Some((name, model))
        })
        .collect();
    (!registry.is_empty()).then_some(registry)
}

/// One level of JavaScript string-literal escaping.
fn unescape_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => break,
        }
    }
    out
}

/// Prefix of `text` holding one complete JSON array, skipping brackets
/// inside strings.
fn balanced_array(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (index, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' | '{' => depth += 1,
            ']' | '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[..=index]);
                }
            }
            _ => {}
        }
    }
    None
}
