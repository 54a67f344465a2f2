//! HTML5 parser using html5ever's TreeSink.
//!
//! Builds a [`Tree`] using html5ever's tree construction algorithm, which
//! recovers from any malformed input the way browsers do. This is the
//! "underlying parser" the document facade wraps: it decodes bytes on its
//! own terms (a meta prescan, windows-1252 when nothing is declared) and it
//! reports parse errors either into a capture buffer or to the log.

use std::borrow::Cow;
use std::cell::RefCell;

use html5ever::tree_builder::{
    ElemName, ElementFlags, NodeOrText, QuirksMode, TreeBuilderOpts, TreeSink,
};
use html5ever::{
    Attribute, LocalName, Namespace as HtmlNamespace, ParseOpts, QualName, parse_document,
};
use indexmap::IndexMap;
use indextree::{Arena, NodeId};
use tendril::{StrTendril, TendrilSink};

use crate::dom::{ElementData, Namespace, NodeData, NodeKind, Tree};
use crate::pattern::BytePattern;

/// How many leading bytes are scanned for a charset declaration.
pub(crate) const PRESCAN_LIMIT: usize = 1024;

static PRESCAN_CHARSET: BytePattern =
    BytePattern::new(r#"(?i-u)<meta\s[^>]*?charset\s*=\s*["']?\s*([a-zA-Z0-9_:.\-]+)"#);

/// Options forwarded to html5ever.
#[derive(Clone, Debug, Default)]
pub struct ParseOptions {
    /// Parse as if scripting were enabled. When true, `<noscript>` content is
    /// kept as raw text; when false (the default) it is parsed as markup.
    pub scripting_enabled: bool,
}

impl ParseOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse with scripting enabled.
    pub fn scripting(mut self, enabled: bool) -> Self {
        self.scripting_enabled = enabled;
        self
    }
}

/// Result of a parse call.
#[derive(Debug)]
pub struct ParseOutcome {
    pub tree: Tree,
    /// False when the parser could not produce a root element.
    pub success: bool,
    /// Parse errors collected while error capture was on.
    pub errors: Vec<Cow<'static, str>>,
}

/// The html5ever-backed parser.
#[derive(Debug, Default)]
pub struct HtmlParser {
    capture_errors: bool,
}

impl HtmlParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle error capture, returning the previous setting so callers can
    /// restore it once they are done.
    pub fn set_capture_errors(&mut self, capture: bool) -> bool {
        std::mem::replace(&mut self.capture_errors, capture)
    }

    pub fn captures_errors(&self) -> bool {
        self.capture_errors
    }

    /// With scripting disabled, html5ever's "in head noscript" mode closes the
    /// head as soon as `<noscript>` holds anything but metadata, dragging the
    /// rest of the head into the body. Callers have to shield head noscripts
    /// from the parser in that configuration.
    pub fn needs_noscript_isolation(&self, options: &ParseOptions) -> bool {
        !options.scripting_enabled
    }

    /// Parse raw bytes into a tree.
    pub fn parse(&self, html: &[u8], options: &ParseOptions) -> ParseOutcome {
        let text = decode_input(html);
        let sink = ArenaSink::new(self.capture_errors, options.scripting_enabled);
        let opts = ParseOpts {
            tree_builder: TreeBuilderOpts {
                scripting_enabled: options.scripting_enabled,
                ..Default::default()
            },
            ..Default::default()
        };
        let (tree, errors) = parse_document(sink, opts).one(StrTendril::from(text.as_ref()));
        let success = tree.root().is_some();
        trace!(success, errors = errors.len(), "parsed document");
        ParseOutcome {
            tree,
            success,
            errors,
        }
    }
}

/// Decode input bytes the way the parser sees them: a declared charset in the
/// first kilobyte wins, otherwise windows-1252.
fn decode_input(html: &[u8]) -> Cow<'_, str> {
    let head = &html[..html.len().min(PRESCAN_LIMIT)];
    let declared = PRESCAN_CHARSET
        .get()
        .and_then(|re| re.captures(head))
        .and_then(|caps| caps.get(1))
        .and_then(|label| encoding_rs::Encoding::for_label(label.as_bytes()));
    let encoding = declared.unwrap_or(encoding_rs::WINDOWS_1252);
    trace!(encoding = encoding.name(), "parser input encoding");
    let (text, _, had_errors) = encoding.decode(html);
    if had_errors {
        warn!(encoding = encoding.name(), "input contained malformed byte sequences");
    }
    text
}

/// Owned element name wrapper
#[derive(Debug, Clone)]
pub struct OwnedElemName(QualName);

impl ElemName for OwnedElemName {
    fn ns(&self) -> &HtmlNamespace {
        &self.0.ns
    }

    fn local_name(&self) -> &LocalName {
        &self.0.local
    }
}

/// TreeSink implementation for building the arena tree
struct ArenaSink {
    /// Our arena - wrapped in RefCell for interior mutability
    arena: RefCell<Arena<NodeData>>,

    /// Document node (parent of `<html>`)
    document: NodeId,

    /// DOCTYPE encountered during parse
    doctype: RefCell<Option<StrTendril>>,

    capture_errors: bool,
    errors: RefCell<Vec<Cow<'static, str>>>,
    scripting_enabled: bool,
}

impl ArenaSink {
    fn new(capture_errors: bool, scripting_enabled: bool) -> Self {
        let mut arena = Arena::new();
        let document = arena.new_node(NodeData {
            kind: NodeKind::Document,
            ns: Namespace::Html,
        });

        ArenaSink {
            arena: RefCell::new(arena),
            document,
            doctype: RefCell::new(None),
            capture_errors,
            errors: RefCell::new(Vec::new()),
            scripting_enabled,
        }
    }
}

impl TreeSink for ArenaSink {
    type Handle = NodeId;
    type Output = (Tree, Vec<Cow<'static, str>>);
    type ElemName<'a>
        = OwnedElemName
    where
        Self: 'a;

    fn finish(self) -> Self::Output {
        let tree = Tree {
            arena: self.arena.into_inner(),
            document: self.document,
            doctype: self.doctype.into_inner(),
            scripting_enabled: self.scripting_enabled,
        };
        (tree, self.errors.into_inner())
    }

    fn parse_error(&self, msg: Cow<'static, str>) {
        if self.capture_errors {
            self.errors.borrow_mut().push(msg);
        } else {
            warn!(%msg, "html parse error");
        }
    }

    fn get_document(&self) -> Self::Handle {
        self.document
    }

    fn set_quirks_mode(&self, _mode: QuirksMode) {
        // Quirks mode does not affect the tree we keep
    }

    fn same_node(&self, a: &Self::Handle, b: &Self::Handle) -> bool {
        a == b
    }

    fn elem_name<'a>(&'a self, target: &'a Self::Handle) -> OwnedElemName {
        let arena = self.arena.borrow();
        let node = arena[*target].get();

        if let NodeKind::Element(elem) = &node.kind {
            OwnedElemName(QualName {
                prefix: None,
                ns: HtmlNamespace::from(node.ns.url()),
                local: LocalName::from(elem.tag.as_ref()),
            })
        } else {
            OwnedElemName(QualName {
                prefix: None,
                ns: HtmlNamespace::from(Namespace::Html.url()),
                local: LocalName::from(""),
            })
        }
    }

    fn create_element(
        &self,
        name: QualName,
        attrs: Vec<Attribute>,
        _flags: ElementFlags,
    ) -> Self::Handle {
        let tag = StrTendril::from(name.local.as_ref());
        let ns = Namespace::from_url(name.ns.as_ref());

        let mut attr_map = IndexMap::with_capacity(attrs.len());
        for attr in attrs {
            let key = match &attr.name.prefix {
                Some(prefix) => format!("{}:{}", prefix.as_ref(), attr.name.local.as_ref()),
                None => attr.name.local.to_string(),
            };
            attr_map.entry(key).or_insert(attr.value);
        }

        self.arena.borrow_mut().new_node(NodeData {
            kind: NodeKind::Element(ElementData {
                tag,
                attrs: attr_map,
            }),
            ns,
        })
    }

    fn create_comment(&self, text: StrTendril) -> Self::Handle {
        self.arena.borrow_mut().new_node(NodeData {
            kind: NodeKind::Comment(text),
            ns: Namespace::Html,
        })
    }

    fn create_pi(&self, _target: StrTendril, _data: StrTendril) -> Self::Handle {
        // Processing instructions - create empty comment
        self.arena.borrow_mut().new_node(NodeData {
            kind: NodeKind::Comment(StrTendril::new()),
            ns: Namespace::Html,
        })
    }

    fn append(&self, parent: &Self::Handle, child: NodeOrText<Self::Handle>) {
        let mut arena = self.arena.borrow_mut();
        match child {
            NodeOrText::AppendNode(node) => {
                parent.append(node, &mut arena);
            }
            NodeOrText::AppendText(text) => {
                // Merge with a preceding text node, like html5ever's own sinks
                let last_child_id = parent.children(&arena).next_back();

                if let Some(last_child) = last_child_id
                    && let NodeKind::Text(existing) = &mut arena[last_child].get_mut().kind
                {
                    existing.push_tendril(&text);
                    return;
                }

                let text_node = arena.new_node(NodeData {
                    kind: NodeKind::Text(text),
                    ns: Namespace::Html,
                });
                parent.append(text_node, &mut arena);
            }
        }
    }

    fn append_before_sibling(&self, sibling: &Self::Handle, new_node: NodeOrText<Self::Handle>) {
        let mut arena = self.arena.borrow_mut();
        match new_node {
            NodeOrText::AppendNode(node) => {
                sibling.insert_before(node, &mut arena);
            }
            NodeOrText::AppendText(text) => {
                let text_node = arena.new_node(NodeData {
                    kind: NodeKind::Text(text),
                    ns: Namespace::Html,
                });
                sibling.insert_before(text_node, &mut arena);
            }
        }
    }

    fn append_based_on_parent_node(
        &self,
        element: &Self::Handle,
        prev_element: &Self::Handle,
        child: NodeOrText<Self::Handle>,
    ) {
        let has_parent = self.arena.borrow()[*element].parent().is_some();
        if has_parent {
            self.append_before_sibling(element, child);
        } else {
            self.append(prev_element, child);
        }
    }

    fn append_doctype_to_document(
        &self,
        name: StrTendril,
        _public_id: StrTendril,
        _system_id: StrTendril,
    ) {
        *self.doctype.borrow_mut() = Some(name);
    }

    fn get_template_contents(&self, target: &Self::Handle) -> Self::Handle {
        // Template contents live directly under the <template> element so
        // queries and serialization see them as ordinary children.
        *target
    }

    fn add_attrs_if_missing(&self, target: &Self::Handle, attrs: Vec<Attribute>) {
        let mut arena = self.arena.borrow_mut();
        if let NodeKind::Element(elem) = &mut arena[*target].get_mut().kind {
            for attr in attrs {
                elem.attrs
                    .entry(attr.name.local.to_string())
                    .or_insert(attr.value);
            }
        }
    }

    fn remove_from_parent(&self, target: &Self::Handle) {
        target.detach(&mut self.arena.borrow_mut());
    }

    fn reparent_children(&self, node: &Self::Handle, new_parent: &Self::Handle) {
        let mut arena = self.arena.borrow_mut();
        let children: Vec<NodeId> = node.children(&arena).collect();
        for child in children {
            child.detach(&mut arena);
            new_parent.append(child, &mut arena);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(html: &str) -> ParseOutcome {
        HtmlParser::new().parse(html.as_bytes(), &ParseOptions::default())
    }

    #[test]
    fn test_parse_simple_html() {
        let outcome = parse("<html><body><p>Hello</p></body></html>");
        assert!(outcome.success);
        let tree = outcome.tree;

        let root = tree.root().expect("should have root");
        assert_eq!(tree.tag(root), Some("html"));

        let body = tree.child_element(root, "body").expect("should have body");
        let p = tree.children(body).next().expect("body should have child");
        assert_eq!(tree.tag(p), Some("p"));

        let text = tree.children(p).next().expect("p should have text");
        match &tree.get(text).kind {
            NodeKind::Text(t) => assert_eq!(t.as_ref(), "Hello"),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_doctype_and_attributes() {
        let outcome = parse(r#"<!DOCTYPE html><div class="container" id="main">Content</div>"#);
        let tree = outcome.tree;
        assert_eq!(tree.doctype.as_deref(), Some("html"));

        let div = tree.elements_by_tag(tree.document, "div")[0];
        let elem = tree.element(div).expect("div is an element");
        let names: Vec<_> = elem.attrs.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["class", "id"]);
        assert_eq!(elem.attr("id"), Some("main"));
    }

    #[test]
    fn test_template_children_are_direct() {
        let tree = parse("<body><template><a href=\"x\">go</a></template></body>").tree;
        let template = tree.elements_by_tag(tree.document, "template")[0];
        let first = tree.children(template).next().expect("template has content");
        assert_eq!(tree.tag(first), Some("a"));
    }

    #[test]
    fn test_noscript_is_markup_without_scripting() {
        let tree = parse("<body><noscript><img src=\"a.png\"></noscript></body>").tree;
        assert_eq!(tree.elements_by_tag(tree.document, "img").len(), 1);

        let scripted = HtmlParser::new().parse(
            b"<body><noscript><img src=\"a.png\"></noscript></body>",
            &ParseOptions::new().scripting(true),
        );
        assert!(scripted.tree.elements_by_tag(scripted.tree.document, "img").is_empty());
        assert!(scripted.tree.scripting_enabled);
    }

    #[test]
    fn test_error_capture_toggle() {
        let mut parser = HtmlParser::new();
        let html = b"<p>unclosed <b>bold</p></i>";

        let previous = parser.set_capture_errors(true);
        assert!(!previous);
        let outcome = parser.parse(html, &ParseOptions::default());
        assert!(!outcome.errors.is_empty());
        assert!(parser.set_capture_errors(previous));

        let outcome = parser.parse(html, &ParseOptions::default());
        assert!(outcome.errors.is_empty());
        assert!(outcome.success);
    }

    #[test]
    fn test_undeclared_bytes_decode_as_windows_1252() {
        let tree = HtmlParser::new()
            .parse(b"<p>caf\xe9</p>", &ParseOptions::default())
            .tree;
        let p = tree.elements_by_tag(tree.document, "p")[0];
        let text = tree.children(p).next().expect("text");
        match &tree.get(text).kind {
            NodeKind::Text(t) => assert_eq!(t.as_ref(), "café"),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[test]
    fn test_declared_utf8_is_honoured() {
        let html = "<meta charset=\"utf-8\"><p>café</p>";
        let tree = HtmlParser::new()
            .parse(html.as_bytes(), &ParseOptions::default())
            .tree;
        let p = tree.elements_by_tag(tree.document, "p")[0];
        let text = tree.children(p).next().expect("text");
        match &tree.get(text).kind {
            NodeKind::Text(t) => assert_eq!(t.as_ref(), "café"),
            other => panic!("expected text, got {other:?}"),
        }
    }
}
