//! HTML serializer for the arena tree.
//!
//! Follows HTML5 serialization rules:
//!
//! - Void elements never get end tags
//! - Text content is escaped (`&`, `<`, `>`)
//! - Attribute values are escaped and double-quoted
//! - Raw text elements (script, style, ...) are not escaped
//! - RCDATA elements (title, textarea) escape only `&` and `<`
//! - Foreign content (SVG/MathML) uses self-closing syntax when empty
//!
//! It also carries two engine limitations the document facade works around:
//! URI attributes get unsafe characters percent-escaped (which mangles
//! `{{template}}` tokens), and documents without a UTF-8 declaration in
//! their head get every non-ASCII character written as a character reference.

use std::fmt::Write;

use indextree::NodeId;

use crate::dom::{ElementData, Namespace, NodeKind, Tree};

/// Options for serialization.
#[derive(Clone, Debug)]
pub struct SerializeOptions {
    /// Percent-escape `{ } | \ ^ `` ` `` in `href`, `src` and `action` (default: true)
    pub escape_uri_attributes: bool,
}

impl Default for SerializeOptions {
    fn default() -> Self {
        Self {
            escape_uri_attributes: true,
        }
    }
}

impl SerializeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leave URI attribute values as they are.
    pub fn no_uri_escaping(mut self) -> Self {
        self.escape_uri_attributes = false;
        self
    }
}

/// HTML5 void elements - these never have end tags.
pub const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "basefont", "bgsound", "br", "col", "embed", "frame", "hr", "img", "input",
    "keygen", "link", "meta", "param", "source", "track", "wbr",
];

/// Raw text elements - content is not escaped.
const RAW_TEXT_ELEMENTS: &[&str] = &[
    "script", "style", "xmp", "iframe", "noembed", "noframes", "plaintext",
];

/// RCDATA elements - only `&` and `<` are escaped.
const RCDATA_ELEMENTS: &[&str] = &["title", "textarea"];

/// Attributes holding URIs.
const URI_ATTRIBUTES: &[&str] = &["href", "src", "action"];

pub fn is_void_element(tag: &str) -> bool {
    VOID_ELEMENTS.iter().any(|v| v.eq_ignore_ascii_case(tag))
}

/// Serialize a node (document, element, text or comment) and its subtree.
pub fn serialize(tree: &Tree, node: NodeId, options: &SerializeOptions) -> String {
    let mut out = String::new();
    let mut ser = Serializer::new(tree, &mut out, options);
    ser.write_node(node, Context::Normal);
    out
}

/// Serialize the children of a node, without the node itself.
pub fn serialize_children(tree: &Tree, node: NodeId, options: &SerializeOptions) -> String {
    let mut out = String::new();
    let mut ser = Serializer::new(tree, &mut out, options);
    let context = ser.child_context(node);
    for child in tree.children(node) {
        ser.write_node(child, context);
    }
    out
}

/// How text children of the element being written are escaped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Context {
    Normal,
    Raw,
    Rcdata,
}

struct Serializer<'a, W: Write> {
    tree: &'a Tree,
    out: &'a mut W,
    options: &'a SerializeOptions,
    ascii_only: bool,
}

impl<'a, W: Write> Serializer<'a, W> {
    fn new(tree: &'a Tree, out: &'a mut W, options: &'a SerializeOptions) -> Self {
        Self {
            tree,
            out,
            options,
            ascii_only: !tree.declares_utf8(),
        }
    }

    fn child_context(&self, node: NodeId) -> Context {
        let Some(tag) = self.tree.tag(node) else {
            return Context::Normal;
        };
        if self.tree.get(node).ns != Namespace::Html {
            Context::Normal
        } else if RAW_TEXT_ELEMENTS.contains(&tag)
            || (tag == "noscript" && self.tree.scripting_enabled)
        {
            Context::Raw
        } else if RCDATA_ELEMENTS.contains(&tag) {
            Context::Rcdata
        } else {
            Context::Normal
        }
    }

    fn write_char(&mut self, c: char) {
        if self.ascii_only && !c.is_ascii() {
            let _ = write!(self.out, "&#{};", c as u32);
        } else {
            let _ = self.out.write_char(c);
        }
    }

    fn write_text(&mut self, text: &str, context: Context) {
        match context {
            Context::Raw => {
                let _ = self.out.write_str(text);
            }
            Context::Rcdata => {
                for c in text.chars() {
                    match c {
                        '&' => {
                            let _ = self.out.write_str("&amp;");
                        }
                        '<' => {
                            let _ = self.out.write_str("&lt;");
                        }
                        _ => self.write_char(c),
                    }
                }
            }
            Context::Normal => {
                for c in text.chars() {
                    match c {
                        '&' => {
                            let _ = self.out.write_str("&amp;");
                        }
                        '<' => {
                            let _ = self.out.write_str("&lt;");
                        }
                        '>' => {
                            let _ = self.out.write_str("&gt;");
                        }
                        _ => self.write_char(c),
                    }
                }
            }
        }
    }

    fn write_attr(&mut self, name: &str, value: &str) {
        let _ = write!(self.out, " {}=\"", name);
        let escape_uri = self.options.escape_uri_attributes
            && URI_ATTRIBUTES.iter().any(|a| a.eq_ignore_ascii_case(name));
        for c in value.chars() {
            match c {
                '&' => {
                    let _ = self.out.write_str("&amp;");
                }
                '"' => {
                    let _ = self.out.write_str("&quot;");
                }
                '<' => {
                    let _ = self.out.write_str("&lt;");
                }
                '>' => {
                    let _ = self.out.write_str("&gt;");
                }
                '{' | '}' | '|' | '\\' | '^' | '`' if escape_uri => {
                    let _ = write!(self.out, "%{:02X}", c as u32);
                }
                _ => self.write_char(c),
            }
        }
        let _ = self.out.write_char('"');
    }

    fn write_node(&mut self, node: NodeId, context: Context) {
        let tree = self.tree;
        match &tree.get(node).kind {
            NodeKind::Document => {
                if let Some(doctype) = &tree.doctype {
                    let _ = write!(self.out, "<!DOCTYPE {}>", &**doctype);
                }
                for child in tree.children(node) {
                    self.write_node(child, Context::Normal);
                }
            }
            NodeKind::Element(elem) => self.write_element(node, elem),
            NodeKind::Text(text) => self.write_text(text, context),
            NodeKind::Comment(text) => {
                let _ = write!(self.out, "<!--{}-->", &**text);
            }
        }
    }

    fn write_element(&mut self, node: NodeId, elem: &ElementData) {
        let tree = self.tree;
        let tag = elem.tag.as_ref();
        let is_foreign = tree.get(node).ns != Namespace::Html;

        let _ = write!(self.out, "<{}", tag);
        for (name, value) in &elem.attrs {
            self.write_attr(name, value);
        }

        if !is_foreign && is_void_element(tag) {
            let _ = self.out.write_char('>');
            return;
        }

        if is_foreign && tree.children(node).next().is_none() {
            let _ = self.out.write_str("/>");
            return;
        }

        let _ = self.out.write_char('>');
        let context = self.child_context(node);
        for child in tree.children(node) {
            self.write_node(child, context);
        }
        let _ = write!(self.out, "</{}>", tag);
    }
}
