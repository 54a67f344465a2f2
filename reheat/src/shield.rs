//! Placeholders for content the parser or the serializer would damage.
//!
//! - `<noscript>` blocks before the body are swapped for comment
//!   placeholders ahead of parsing, when the parser configuration would
//!   otherwise reshuffle the head around them.
//! - `{{mustache}}` tokens in URI attributes under `<template>` are swapped
//!   for plain placeholders before serialization, so the serializer's
//!   percent-escaping leaves them alone.
//!
//! Every placeholder embeds a per-document [`Salt`].

use std::borrow::Cow;
use std::fmt;

use encoding_rs::Encoding;
use indexmap::IndexMap;
use indextree::NodeId;
use rand::RngCore;
use tendril::StrTendril;

use crate::dom::Tree;
use crate::pattern::BytePattern;
use crate::query::{Hit, Query};
use crate::structure;

/// Template token fragments, longest and most specific first.
pub const TEMPLATE_TOKENS: [&str; 7] = ["{{{", "}}}", "{{#", "{{^", "{{/", "{{", "}}"];

/// Attributes whose template tokens get protected.
pub const TEMPLATE_ATTRIBUTE_QUERY: &str = ".//*/@src | .//*/@href | .//*/@action";

static NOSCRIPT: BytePattern = BytePattern::new(r"(?is-u)<noscript(?:\s[^>]*)?>.*?</noscript\s*>");

/// Random text mixed into placeholders so they cannot match real content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Salt(String);

impl Salt {
    pub fn generate(rng: &mut impl RngCore) -> Self {
        Salt(format!("{:016x}", rng.next_u64()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Placeholder markup and the raw bytes it replaced, before the source
/// encoding is known.
pub type RawPlaceholders = IndexMap<String, Vec<u8>>;

/// Insertion-ordered placeholder to original markup.
#[derive(Clone, Debug, Default)]
pub struct PlaceholderMap {
    entries: IndexMap<String, String>,
}

impl PlaceholderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode raw originals with the encoding the rest of the input had.
    pub fn decode(raw: RawPlaceholders, encoding: &'static Encoding) -> Self {
        let entries = raw
            .into_iter()
            .map(|(placeholder, bytes)| {
                let (text, _) = encoding.decode_without_bom_handling(&bytes);
                (placeholder, text.into_owned())
            })
            .collect();
        Self { entries }
    }

    pub fn insert(&mut self, placeholder: String, original: String) {
        self.entries.insert(placeholder, original);
    }

    pub fn get(&self, placeholder: &str) -> Option<&str> {
        self.entries.get(placeholder).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Put every original back in place of its placeholder.
    pub fn restore<'a>(&self, html: &'a str) -> Cow<'a, str> {
        let mut html = Cow::Borrowed(html);
        for (placeholder, original) in &self.entries {
            if html.contains(placeholder.as_str()) {
                html = Cow::Owned(html.replace(placeholder.as_str(), original));
            }
        }
        html
    }
}

/// Replace every `<noscript>` element in front of the body with a comment
/// placeholder. Noscripts spelled inside comments or raw-text elements are
/// text and stay as they are.
pub fn isolate_noscript<'a>(html: &'a [u8], salt: &Salt) -> (Cow<'a, [u8]>, RawPlaceholders) {
    let mut raw = RawPlaceholders::new();
    let body_at = structure::body_start(html).map_or(html.len(), |tag| tag.start);
    let found = structure::markup_matches(&NOSCRIPT, &html[..body_at]);
    if found.is_empty() {
        return (Cow::Borrowed(html), raw);
    }

    let mut out = Vec::with_capacity(html.len());
    let mut copied = 0;
    for span in found {
        let placeholder = format!("<!--_reheat_ns{}_{}_-->", raw.len(), salt);
        out.extend_from_slice(&html[copied..span.start]);
        out.extend_from_slice(placeholder.as_bytes());
        raw.insert(placeholder, html[span.clone()].to_vec());
        copied = span.end;
    }
    out.extend_from_slice(&html[copied..]);

    debug!(count = raw.len(), "isolated noscript elements");
    (Cow::Owned(out), raw)
}

/// Template tokens swapped out of a tree, with what is needed to undo it.
#[derive(Debug, Default)]
pub struct TemplateShield {
    /// Placeholder for each entry of [`TEMPLATE_TOKENS`].
    placeholders: Vec<String>,
    /// Attribute values as they were before protection.
    originals: Vec<(NodeId, String, StrTendril)>,
}

impl TemplateShield {
    /// Swap template tokens in URI attributes under every `<template>`.
    pub fn protect(tree: &mut Tree, salt: &Salt) -> Self {
        let mut shield = TemplateShield {
            placeholders: (0..TEMPLATE_TOKENS.len())
                .map(|i| format!("_reheat_tpl{i}_{salt}_"))
                .collect(),
            originals: Vec::new(),
        };

        let templates = tree.elements_by_tag(tree.document, "template");
        if templates.is_empty() {
            return shield;
        }
        let query = match TEMPLATE_ATTRIBUTE_QUERY.parse::<Query>() {
            Ok(query) => query,
            Err(_) => return shield,
        };

        for template in templates {
            for hit in query.evaluate(tree, template) {
                let Hit::Attribute { element, name } = hit else {
                    continue;
                };
                let Some(value) = tree.attr(element, &name) else {
                    continue;
                };
                let replaced = shield.swap_tokens(value);
                if replaced != value {
                    let original = StrTendril::from(value);
                    tree.set_attr(element, &name, &replaced);
                    shield.originals.push((element, name, original));
                }
            }
        }

        if shield.replaced() {
            trace!(attributes = shield.originals.len(), "protected template tokens");
        }
        shield
    }

    fn swap_tokens(&self, value: &str) -> String {
        let mut value = value.to_string();
        for (token, placeholder) in TEMPLATE_TOKENS.iter().zip(&self.placeholders) {
            if value.contains(token) {
                value = value.replace(token, placeholder);
            }
        }
        value
    }

    /// Whether any token was swapped.
    pub fn replaced(&self) -> bool {
        !self.originals.is_empty()
    }

    /// Put the tokens back into serialized output.
    pub fn restore<'a>(&self, html: &'a str) -> Cow<'a, str> {
        if !self.replaced() {
            return Cow::Borrowed(html);
        }
        let mut html = html.to_string();
        for (token, placeholder) in TEMPLATE_TOKENS.iter().zip(&self.placeholders) {
            if html.contains(placeholder.as_str()) {
                html = html.replace(placeholder.as_str(), token);
            }
        }
        Cow::Owned(html)
    }

    /// Put the original attribute values back into the tree.
    pub fn revert(self, tree: &mut Tree) {
        for (element, name, original) in self.originals.into_iter().rev() {
            if let Some(elem) = tree.element_mut(element) {
                elem.attrs.insert(name, original);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::{SerializeOptions, serialize};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn salt() -> Salt {
        Salt::generate(&mut StdRng::seed_from_u64(7))
    }

    #[test]
    fn salts_are_hex_and_seed_dependent() {
        let a = salt();
        assert_eq!(a.as_str().len(), 16);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a, salt());
        assert_ne!(a, Salt::generate(&mut StdRng::seed_from_u64(8)));
    }

    #[test]
    fn noscript_before_body_is_isolated() {
        let salt = salt();
        let html = b"<head><noscript><img src=x></noscript></head><body><noscript>keep</noscript></body>";
        let (isolated, raw) = isolate_noscript(html, &salt);
        let placeholder = format!("<!--_reheat_ns0_{salt}_-->");

        assert_eq!(raw.len(), 1);
        assert_eq!(raw[placeholder.as_str()], b"<noscript><img src=x></noscript>".to_vec());
        let expected =
            format!("<head>{placeholder}</head><body><noscript>keep</noscript></body>");
        assert_eq!(&*isolated, expected.as_bytes());

        let map = PlaceholderMap::decode(raw, encoding_rs::UTF_8);
        let restored = map.restore(std::str::from_utf8(&isolated).expect("utf-8"));
        assert_eq!(restored.as_bytes(), &html[..]);
    }

    #[test]
    fn noscript_and_body_lookalikes_in_raw_text_are_left_alone() {
        let salt = salt();
        let html = br#"<head><!-- <noscript>x</noscript> --><script>"<body>"</script><noscript><img src=x></noscript></head><body></body>"#;
        let (isolated, raw) = isolate_noscript(html, &salt);
        let placeholder = format!("<!--_reheat_ns0_{salt}_-->");

        assert_eq!(raw.len(), 1);
        let expected = format!(
            r#"<head><!-- <noscript>x</noscript> --><script>"<body>"</script>{placeholder}</head><body></body>"#
        );
        assert_eq!(&*isolated, expected.as_bytes());
    }

    #[test]
    fn nothing_to_isolate_borrows() {
        let (isolated, raw) = isolate_noscript(b"<head></head><body></body>", &salt());
        assert!(matches!(isolated, Cow::Borrowed(_)));
        assert!(raw.is_empty());
    }

    #[test]
    fn raw_originals_decode_with_source_encoding() {
        let mut raw = RawPlaceholders::new();
        raw.insert("<!--p-->".to_string(), b"<noscript>\xe9</noscript>".to_vec());
        let map = PlaceholderMap::decode(raw, encoding_rs::WINDOWS_1252);
        assert_eq!(map.get("<!--p-->"), Some("<noscript>é</noscript>"));
    }

    fn template_tree() -> (Tree, NodeId, NodeId) {
        let mut tree = Tree::new();
        let html = tree.create_element("html", []);
        let body = tree.create_element("body", []);
        let template = tree.create_element("template", [("type", "amp-mustache")]);
        let link = tree.create_element(
            "a",
            [("href", "{{#x}}/{{{raw}}}{{/x}}"), ("title", "{{t}}")],
        );
        let outside = tree.create_element("a", [("href", "{{kept}}")]);
        tree.append(tree.document, html);
        tree.append(html, body);
        tree.append(body, template);
        tree.append(template, link);
        tree.append(body, outside);
        (tree, link, outside)
    }

    #[test]
    fn template_tokens_survive_serialization() {
        let (mut tree, link, outside) = template_tree();
        let shield = TemplateShield::protect(&mut tree, &salt());
        assert!(shield.replaced());
        assert!(!tree.attr(link, "href").unwrap_or_default().contains('{'));
        assert_eq!(tree.attr(link, "title"), Some("{{t}}"));
        assert_eq!(tree.attr(outside, "href"), Some("{{kept}}"));

        let html = serialize(&tree, link, &SerializeOptions::default());
        assert_eq!(
            shield.restore(&html),
            "<a href=\"{{#x}}/{{{raw}}}{{/x}}\" title=\"{{t}}\"></a>"
        );

        shield.revert(&mut tree);
        assert_eq!(tree.attr(link, "href"), Some("{{#x}}/{{{raw}}}{{/x}}"));
    }

    #[test]
    fn no_templates_no_replacement() {
        let mut tree = Tree::new();
        let html = tree.create_element("html", []);
        let a = tree.create_element("a", [("href", "{{x}}")]);
        tree.append(tree.document, html);
        tree.append(html, a);

        let shield = TemplateShield::protect(&mut tree, &salt());
        assert!(!shield.replaced());
        assert_eq!(shield.restore("_reheat_tpl5_x_"), "_reheat_tpl5_x_");
    }
}
