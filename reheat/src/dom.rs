//! Arena-based document tree.
//!
//! The tree produced by [`crate::parser`] and consumed by every structural
//! repair in this crate:
//! - **indextree Arena**: all nodes in one contiguous arena, addressed by `NodeId`
//! - **Detached nodes stay addressable**: relocating a node is a detach + reinsert
//! - **StrTendril strings**: tags, attribute values and text share the parse buffer

use indexmap::IndexMap;
use indextree::{Arena, NodeId};
use tendril::StrTendril;

/// What goes in each arena slot
#[derive(Debug, Clone)]
pub struct NodeData {
    pub kind: NodeKind,
    pub ns: Namespace,
}

/// Node types
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Document root (invisible, parent of `<html>`)
    Document,
    /// Element with tag and attributes
    Element(ElementData),
    /// Text content
    Text(StrTendril),
    /// HTML comment
    Comment(StrTendril),
}

/// Element data (tag + attributes)
#[derive(Debug, Clone)]
pub struct ElementData {
    /// Tag name, lowercase for HTML elements
    pub tag: StrTendril,

    /// Attributes in source order. Keys carry their namespace prefix
    /// (`xlink:href`) so they serialize back the way they were written.
    pub attrs: IndexMap<String, StrTendril>,
}

impl ElementData {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(|v| v.as_ref())
    }
}

/// XML namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Html,
    Svg,
    MathMl,
}

impl Namespace {
    pub fn from_url(url: &str) -> Self {
        match url {
            "http://www.w3.org/2000/svg" => Namespace::Svg,
            "http://www.w3.org/1998/Math/MathML" => Namespace::MathMl,
            _ => Namespace::Html,
        }
    }

    pub fn url(&self) -> &'static str {
        match self {
            Namespace::Html => "http://www.w3.org/1999/xhtml",
            Namespace::Svg => "http://www.w3.org/2000/svg",
            Namespace::MathMl => "http://www.w3.org/1998/Math/MathML",
        }
    }
}

/// A parsed document: the arena plus the bits that live outside it.
#[derive(Debug, Clone)]
pub struct Tree {
    /// THE tree - all nodes live here, attached or not
    pub arena: Arena<NodeData>,

    /// Document node (parent of the root element and any top-level comments)
    pub document: NodeId,

    /// DOCTYPE name if present (usually "html")
    pub doctype: Option<StrTendril>,

    /// Whether the tree was built with scripting enabled, which decides if
    /// `<noscript>` holds raw text or markup.
    pub scripting_enabled: bool,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    /// An empty tree holding only the document node.
    pub fn new() -> Self {
        let mut arena = Arena::new();
        let document = arena.new_node(NodeData {
            kind: NodeKind::Document,
            ns: Namespace::Html,
        });
        Self {
            arena,
            document,
            doctype: None,
            scripting_enabled: false,
        }
    }

    /// Get immutable reference to node data
    pub fn get(&self, id: NodeId) -> &NodeData {
        self.arena[id].get()
    }

    /// Get mutable reference to node data
    pub fn get_mut(&mut self, id: NodeId) -> &mut NodeData {
        self.arena[id].get_mut()
    }

    /// Whether `id` refers to a live node of this arena.
    pub fn contains(&self, id: NodeId) -> bool {
        self.arena.get(id).is_some_and(|node| !node.is_removed())
    }

    /// Element data, if the node is an element.
    pub fn element(&self, id: NodeId) -> Option<&ElementData> {
        match &self.get(id).kind {
            NodeKind::Element(elem) => Some(elem),
            _ => None,
        }
    }

    pub fn element_mut(&mut self, id: NodeId) -> Option<&mut ElementData> {
        match &mut self.get_mut(id).kind {
            NodeKind::Element(elem) => Some(elem),
            _ => None,
        }
    }

    /// Tag name, if the node is an element.
    pub fn tag(&self, id: NodeId) -> Option<&str> {
        self.element(id).map(|elem| elem.tag.as_ref())
    }

    /// True if the node is an element with the given tag.
    pub fn is_element_named(&self, id: NodeId, tag: &str) -> bool {
        self.tag(id).is_some_and(|t| t.eq_ignore_ascii_case(tag))
    }

    /// The root element (usually `<html>`), if there is one.
    pub fn root(&self) -> Option<NodeId> {
        self.document
            .children(&self.arena)
            .find(|&id| self.element(id).is_some())
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.arena[id].parent()
    }

    /// Iterate children of a node
    pub fn children(&self, id: NodeId) -> impl DoubleEndedIterator<Item = NodeId> + '_ {
        id.children(&self.arena)
    }

    /// The node itself followed by its parent, grandparent and so on.
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        id.ancestors(&self.arena)
    }

    /// The node itself followed by all its descendants, in document order.
    pub fn descendants(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        id.descendants(&self.arena)
    }

    /// First child element of `parent` with the given tag.
    pub fn child_element(&self, parent: NodeId, tag: &str) -> Option<NodeId> {
        self.children(parent)
            .find(|&id| self.is_element_named(id, tag))
    }

    /// All elements with the given tag under `scope` (scope excluded), in document order.
    pub fn elements_by_tag(&self, scope: NodeId, tag: &str) -> Vec<NodeId> {
        self.descendants(scope)
            .skip(1)
            .filter(|&id| self.is_element_named(id, tag))
            .collect()
    }

    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.element(id).and_then(|elem| elem.attr(name))
    }

    /// Set an attribute, keeping its position if it already exists.
    pub fn set_attr(&mut self, id: NodeId, name: &str, value: &str) {
        if let Some(elem) = self.element_mut(id) {
            elem.attrs
                .insert(name.to_string(), StrTendril::from(value));
        }
    }

    pub fn remove_attr(&mut self, id: NodeId, name: &str) -> Option<StrTendril> {
        self.element_mut(id)
            .and_then(|elem| elem.attrs.shift_remove(name))
    }

    /// Create a detached HTML element.
    pub fn create_element<'a, I>(&mut self, tag: &str, attrs: I) -> NodeId
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let attrs = attrs
            .into_iter()
            .map(|(k, v)| (k.to_string(), StrTendril::from(v)))
            .collect();
        self.arena.new_node(NodeData {
            kind: NodeKind::Element(ElementData {
                tag: StrTendril::from(tag),
                attrs,
            }),
            ns: Namespace::Html,
        })
    }

    /// Create a detached text node.
    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.arena.new_node(NodeData {
            kind: NodeKind::Text(StrTendril::from(text)),
            ns: Namespace::Html,
        })
    }

    /// Create a detached comment node.
    pub fn create_comment(&mut self, text: &str) -> NodeId {
        self.arena.new_node(NodeData {
            kind: NodeKind::Comment(StrTendril::from(text)),
            ns: Namespace::Html,
        })
    }

    /// Move `child` (detaching it first) to the end of `parent`.
    pub fn append(&mut self, parent: NodeId, child: NodeId) {
        child.detach(&mut self.arena);
        parent.append(child, &mut self.arena);
    }

    /// Move `child` (detaching it first) to the front of `parent`.
    pub fn prepend(&mut self, parent: NodeId, child: NodeId) {
        child.detach(&mut self.arena);
        parent.prepend(child, &mut self.arena);
    }

    /// Move `node` (detaching it first) right before `sibling`.
    pub fn insert_before(&mut self, sibling: NodeId, node: NodeId) {
        node.detach(&mut self.arena);
        sibling.insert_before(node, &mut self.arena);
    }

    /// Move `node` (detaching it first) right after `sibling`.
    pub fn insert_after(&mut self, sibling: NodeId, node: NodeId) {
        node.detach(&mut self.arena);
        sibling.insert_after(node, &mut self.arena);
    }

    /// Unlink a node (and its subtree) from its parent. It stays addressable.
    pub fn detach(&mut self, id: NodeId) {
        id.detach(&mut self.arena);
    }

    /// Unlink a node and free it together with its subtree.
    pub fn remove(&mut self, id: NodeId) {
        id.remove_subtree(&mut self.arena);
    }

    /// Whether the head carries a UTF-8 charset declaration, either as
    /// `<meta charset>` or as an http-equiv content-type.
    pub fn declares_utf8(&self) -> bool {
        let Some(head) = self.root().and_then(|root| self.child_element(root, "head")) else {
            return false;
        };
        self.children(head)
            .filter(|&id| self.is_element_named(id, "meta"))
            .any(|meta| {
                if let Some(charset) = self.attr(meta, "charset") {
                    return is_utf8_label(charset);
                }
                let is_content_type = self
                    .attr(meta, "http-equiv")
                    .is_some_and(|v| v.trim().eq_ignore_ascii_case("content-type"));
                is_content_type
                    && self
                        .attr(meta, "content")
                        .and_then(charset_param)
                        .is_some_and(is_utf8_label)
            })
    }
}

/// True for the labels that name UTF-8.
pub fn is_utf8_label(label: &str) -> bool {
    let label = label.trim();
    label.eq_ignore_ascii_case("utf-8") || label.eq_ignore_ascii_case("utf8")
}

/// Extract the `charset=` parameter of a content-type value.
pub fn charset_param(content: &str) -> Option<&str> {
    let lower = content.to_ascii_lowercase();
    let start = lower.find("charset=")? + "charset=".len();
    let rest = &content[start..];
    let rest = rest.trim_start_matches(['"', '\'']);
    let end = rest
        .find(|c: char| c == ';' || c == '"' || c == '\'' || c.is_whitespace())
        .unwrap_or(rest.len());
    let value = &rest[..end];
    (!value.is_empty()).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skeleton() -> (Tree, NodeId, NodeId, NodeId) {
        let mut tree = Tree::new();
        let html = tree.create_element("html", []);
        let head = tree.create_element("head", []);
        let body = tree.create_element("body", []);
        tree.append(tree.document, html);
        tree.append(html, head);
        tree.append(html, body);
        (tree, html, head, body)
    }

    #[test]
    fn test_root_and_child_lookup() {
        let (tree, html, head, body) = skeleton();
        assert_eq!(tree.root(), Some(html));
        assert_eq!(tree.child_element(html, "head"), Some(head));
        assert_eq!(tree.child_element(html, "BODY"), Some(body));
    }

    #[test]
    fn test_prepend_and_insert_before_move_nodes() {
        let (mut tree, _html, head, body) = skeleton();
        let p = tree.create_element("p", []);
        let div = tree.create_element("div", [("class", "x")]);
        tree.append(head, p);
        tree.prepend(body, p);
        tree.insert_before(p, div);

        assert_eq!(tree.children(head).count(), 0);
        let kids: Vec<_> = tree.children(body).collect();
        assert_eq!(kids, vec![div, p]);
        assert_eq!(tree.attr(div, "class"), Some("x"));
    }

    #[test]
    fn test_attribute_order_is_kept_on_update() {
        let (mut tree, _html, _head, body) = skeleton();
        let a = tree.create_element("a", [("href", "/"), ("id", "x")]);
        tree.append(body, a);
        tree.set_attr(a, "href", "/new");
        let names: Vec<_> = tree
            .element(a)
            .map(|e| e.attrs.keys().cloned().collect())
            .unwrap_or_default();
        assert_eq!(names, vec!["href".to_string(), "id".to_string()]);
        assert_eq!(tree.remove_attr(a, "id").as_deref(), Some("x"));
    }

    #[test]
    fn test_elements_by_tag_excludes_scope() {
        let (mut tree, _html, _head, body) = skeleton();
        let outer = tree.create_element("div", []);
        let inner = tree.create_element("div", []);
        tree.append(body, outer);
        tree.append(outer, inner);
        assert_eq!(tree.elements_by_tag(outer, "div"), vec![inner]);
        assert_eq!(tree.elements_by_tag(body, "div"), vec![outer, inner]);
    }

    #[test]
    fn test_declares_utf8() {
        let (mut tree, _html, head, _body) = skeleton();
        assert!(!tree.declares_utf8());

        let meta = tree.create_element(
            "meta",
            [("http-equiv", "Content-Type"), ("content", "text/html; charset=UTF-8")],
        );
        tree.append(head, meta);
        assert!(tree.declares_utf8());

        tree.detach(meta);
        let meta = tree.create_element("meta", [("charset", "iso-8859-1")]);
        tree.append(head, meta);
        assert!(!tree.declares_utf8());
    }

    #[test]
    fn test_removed_nodes_are_no_longer_contained() {
        let (mut tree, _html, _head, body) = skeleton();
        let p = tree.create_element("p", []);
        let text = tree.create_text("x");
        tree.append(body, p);
        tree.append(p, text);

        tree.remove(p);
        assert!(!tree.contains(p));
        assert!(!tree.contains(text));
        assert!(tree.contains(body));
        assert_eq!(tree.children(body).count(), 0);
    }

    #[test]
    fn test_charset_param() {
        assert_eq!(charset_param("text/html; charset=utf-8"), Some("utf-8"));
        assert_eq!(charset_param("text/html;CHARSET=\"Shift_JIS\""), Some("Shift_JIS"));
        assert_eq!(charset_param("text/html"), None);
    }
}
