//! The document facade: load markup, hand out the tree, save it back.
//!
//! Loading runs the markup through every text-level rewrite before it
//! reaches the parser:
//!
//! 1. bind attributes and void pairing ([`crate::syntax::encode`])
//! 2. root/head/body completion ([`crate::structure::normalize_text`])
//! 3. head `<noscript>` isolation, when the parser configuration needs it
//! 4. charset detection and removal of conflicting declarations
//! 5. conversion to UTF-8
//! 6. a transitional UTF-8 `<meta>` right after `<head>`
//!
//! Saving temporarily protects template tokens and re-adds the transitional
//! tag, serializes, and undoes every rewrite on the resulting string. The
//! tree is left exactly as it was, so saving twice gives the same output.

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use indextree::NodeId;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::dom::{NodeKind, Tree};
use crate::encoding::{self, EncodingValue, TransitionalSite};
use crate::error::{Error, Result};
use crate::parser::{HtmlParser, ParseOptions};
use crate::query::QueryHelper;
use crate::serialize::{self, SerializeOptions};
use crate::shield::{self, PlaceholderMap, RawPlaceholders, Salt, TemplateShield};
use crate::structure::{self, HeadPolicy, MetadataOnly, Sections};
use crate::syntax;

/// Construction-time settings of a [`Document`].
#[derive(Clone, Debug)]
pub struct DocumentOptions {
    /// Encoding assumed when the markup declares none (default: auto-detect).
    pub encoding: EncodingValue,
    /// XML-declaration-style version string (default: `1.0`).
    pub version: String,
    /// Seed for placeholder salts. `None` seeds from the OS.
    pub seed: Option<u64>,
    /// Serializer settings used by [`Document::save`].
    pub serialize: SerializeOptions,
}

impl Default for DocumentOptions {
    fn default() -> Self {
        Self {
            encoding: EncodingValue::Auto,
            version: "1.0".to_string(),
            seed: None,
            serialize: SerializeOptions::default(),
        }
    }
}

impl DocumentOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encoding hint, e.g. `"ISO-8859-1"`; `""` or `"auto"` to detect.
    pub fn encoding(mut self, hint: &str) -> Self {
        self.encoding = EncodingValue::from_hint(hint);
        self
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    /// Deterministic salts, for tests and reproducible output.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn serialize(mut self, options: SerializeOptions) -> Self {
        self.serialize = options;
        self
    }
}

/// Per-load settings.
#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub parse: ParseOptions,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse with scripting enabled (`<noscript>` content becomes raw text).
    pub fn scripting(mut self, enabled: bool) -> Self {
        self.parse = self.parse.scripting(enabled);
        self
    }
}

/// Where a document is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Unloaded,
    /// `ok` is the parser's success flag.
    Loaded { ok: bool },
    Saved { ok: bool },
}

/// The names [`Document::resolve`] understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Accessor {
    Head,
    Body,
    Query,
}

impl FromStr for Accessor {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        match name {
            "head" => Ok(Accessor::Head),
            "body" => Ok(Accessor::Body),
            "query" => Ok(Accessor::Query),
            other => Err(Error::UnknownAccessor(other.to_string())),
        }
    }
}

/// What an [`Accessor`] resolves to.
#[derive(Debug)]
pub enum Handle<'a> {
    Head(Option<NodeId>),
    Body(Option<NodeId>),
    Query(QueryHelper<'a>),
}

/// Whether a save writes the node itself or only its children.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scope {
    Node,
    Children,
}

/// A loaded HTML document.
pub struct Document {
    tree: Tree,
    parser: HtmlParser,
    options: DocumentOptions,
    state: State,
    original_encoding: EncodingValue,
    head: Option<NodeId>,
    body: Option<NodeId>,
    noscript: PlaceholderMap,
    template_token_replaced: bool,
    salt: Salt,
    rng: StdRng,
    head_policy: Box<dyn HeadPolicy>,
    next_id: usize,
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("state", &self.state)
            .field("original_encoding", &self.original_encoding)
            .field("version", &self.options.version)
            .field("noscript_placeholders", &self.noscript.len())
            .field("template_token_replaced", &self.template_token_replaced)
            .finish_non_exhaustive()
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new(DocumentOptions::default())
    }
}

impl Document {
    pub fn new(options: DocumentOptions) -> Self {
        let mut rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let salt = Salt::generate(&mut rng);
        Self {
            tree: Tree::new(),
            parser: HtmlParser::new(),
            original_encoding: options.encoding.clone(),
            options,
            state: State::Unloaded,
            head: None,
            body: None,
            noscript: PlaceholderMap::new(),
            template_token_replaced: false,
            salt,
            rng,
            head_policy: Box::new(MetadataOnly),
            next_id: 0,
        }
    }

    /// Create a document with default options and load `html` into it.
    /// Check [`Document::is_loaded_ok`] for the outcome.
    pub fn from_html(html: &[u8], options: &LoadOptions) -> Self {
        let mut document = Self::default();
        document.load(html, options);
        document
    }

    /// Replace the policy deciding what may stay in the head.
    pub fn set_head_policy(&mut self, policy: impl HeadPolicy + 'static) {
        self.head_policy = Box::new(policy);
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Mutable tree access. Cached head/body handles are re-validated on
    /// their next use.
    pub fn tree_mut(&mut self) -> &mut Tree {
        &mut self.tree
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// True once a load succeeded.
    pub fn is_loaded_ok(&self) -> bool {
        matches!(
            self.state,
            State::Loaded { ok: true } | State::Saved { ok: true }
        )
    }

    /// The encoding the markup was converted from.
    pub fn original_encoding(&self) -> &EncodingValue {
        &self.original_encoding
    }

    pub fn version(&self) -> &str {
        &self.options.version
    }

    /// Whether the last save had to protect template tokens.
    pub fn template_tokens_replaced(&self) -> bool {
        self.template_token_replaced
    }

    /// Noscript placeholders recorded by the last load.
    pub fn noscript_placeholders(&self) -> &PlaceholderMap {
        &self.noscript
    }

    pub fn salt(&self) -> &Salt {
        &self.salt
    }

    fn reset(&mut self) {
        self.tree = Tree::new();
        self.head = None;
        self.body = None;
        self.noscript.clear();
        self.template_token_replaced = false;
        self.next_id = 0;
        self.salt = Salt::generate(&mut self.rng);
    }

    /// Parse `html` into this document, replacing any previous content.
    ///
    /// Returns the parser's success flag. The document is usable either way.
    pub fn load(&mut self, html: &[u8], options: &LoadOptions) -> bool {
        self.reset();

        let encoded = syntax::encode(html);
        let normalized = structure::normalize_text(&encoded);
        let (isolated, raw) = if self.parser.needs_noscript_isolation(&options.parse) {
            shield::isolate_noscript(&normalized, &self.salt)
        } else {
            (Cow::Borrowed(&*normalized), RawPlaceholders::new())
        };
        let (declared, stripped) = encoding::detect_and_strip(&isolated, &self.options.encoding);
        let adapted = encoding::adapt_encoding(&stripped, &declared);
        self.original_encoding = adapted.original.clone();
        self.noscript = PlaceholderMap::decode(raw, adapted.source);
        let prepared = encoding::insert_transitional(&adapted.html);
        trace!(
            bytes = prepared.len(),
            encoding = %self.original_encoding,
            "prepared markup for parsing"
        );

        let previous = self.parser.set_capture_errors(true);
        let outcome = self.parser.parse(&prepared, &options.parse);
        self.parser.set_capture_errors(previous);
        if !outcome.errors.is_empty() {
            debug!(count = outcome.errors.len(), "discarding captured parse errors");
        }

        self.tree = outcome.tree;
        if outcome.success {
            encoding::remove_transitional(&mut self.tree);
        }
        self.state = State::Loaded {
            ok: outcome.success,
        };
        outcome.success
    }

    /// Load a body fragment, wrapped into a complete document.
    pub fn load_fragment(&mut self, fragment: &[u8], options: &LoadOptions) -> bool {
        let mut html = Vec::with_capacity(fragment.len() + 48);
        html.extend_from_slice(b"<html><head></head><body>");
        html.extend_from_slice(fragment);
        html.extend_from_slice(b"</body></html>");
        self.load(&html, options)
    }

    /// Serialize the whole document, or the subtree rooted at `node`.
    pub fn save(&mut self, node: Option<NodeId>) -> Result<String> {
        let target = node.unwrap_or(self.tree.document);
        self.render(target, Scope::Node)
    }

    /// Serialize the children of `node`, e.g. the body of a fragment.
    pub fn save_children(&mut self, node: NodeId) -> Result<String> {
        self.render(node, Scope::Children)
    }

    fn render(&mut self, target: NodeId, scope: Scope) -> Result<String> {
        if !self.tree.contains(target) {
            return Err(Error::ForeignNode);
        }

        let tokens = TemplateShield::protect(&mut self.tree, &self.salt);
        self.template_token_replaced = tokens.replaced();
        let transitional = encoding::attach_transitional(&mut self.tree);

        let site = transitional.map_or(TransitionalSite::Absent, |meta| {
            self.transitional_site(meta, target, scope)
        });
        let html = self.serialize_scoped(target, scope);

        if let Some(meta) = transitional {
            self.tree.remove(meta);
        }
        let html = encoding::strip_transitional(&html, site);
        let html = tokens.restore(&html).into_owned();
        tokens.revert(&mut self.tree);
        let html = self.noscript.restore(&html);
        let html = syntax::decode(&html).into_owned();

        if let State::Loaded { ok } = self.state {
            self.state = State::Saved { ok };
        }
        trace!(bytes = html.len(), "saved document");
        Ok(html)
    }

    /// Whether saving `target` writes the transitional tag, and where.
    fn transitional_site(&self, meta: NodeId, target: NodeId, scope: Scope) -> TransitionalSite {
        let Some(head) = self.tree.parent(meta) else {
            return TransitionalSite::Absent;
        };
        if scope == Scope::Children && head == target {
            TransitionalSite::Leading
        } else if self.tree.ancestors(head).any(|id| id == target) {
            TransitionalSite::AfterHeadStart
        } else {
            TransitionalSite::Absent
        }
    }

    fn serialize_scoped(&mut self, target: NodeId, scope: Scope) -> String {
        let is_text = matches!(self.tree.get(target).kind, NodeKind::Text(_));
        match (scope, is_text) {
            (Scope::Children, _) => {
                serialize::serialize_children(&self.tree, target, &self.options.serialize)
            }
            (Scope::Node, false) => {
                serialize::serialize(&self.tree, target, &self.options.serialize)
            }
            (Scope::Node, true) => self.serialize_between_markers(target),
        }
    }

    /// Text escaping depends on the parent, so a text node is serialized
    /// in place: bracket it with marker comments, write the whole document
    /// and cut out what lies between the markers.
    fn serialize_between_markers(&mut self, target: NodeId) -> String {
        let begin_text = format!("_reheat_begin_{}_", self.salt);
        let end_text = format!("_reheat_end_{}_", self.salt);
        let begin = self.tree.create_comment(&begin_text);
        let end = self.tree.create_comment(&end_text);
        self.tree.insert_before(target, begin);
        self.tree.insert_after(target, end);

        let options = &self.options.serialize;
        let whole = serialize::serialize(&self.tree, self.tree.document, options);
        self.tree.remove(begin);
        self.tree.remove(end);

        let begin_marker = format!("<!--{begin_text}-->");
        let end_marker = format!("<!--{end_text}-->");
        let extracted = whole.find(&begin_marker).and_then(|start| {
            let from = start + begin_marker.len();
            whole[from..]
                .find(&end_marker)
                .map(|len| whole[from..from + len].to_string())
        });
        extracted.unwrap_or_else(|| {
            debug!("text node is not attached to the document, serializing it alone");
            serialize::serialize(&self.tree, target, options)
        })
    }

    fn is_section(&self, id: NodeId, tag: &str) -> bool {
        self.tree.contains(id)
            && self.tree.is_element_named(id, tag)
            && self
                .tree
                .root()
                .is_some_and(|root| self.tree.parent(id) == Some(root))
    }

    fn find_section(&self, tag: &str) -> Option<NodeId> {
        self.tree
            .root()
            .and_then(|root| self.tree.child_element(root, tag))
    }

    fn section(&mut self, tag: &str) -> Option<NodeId> {
        if self.state == State::Unloaded {
            return None;
        }
        let cached = if tag == "head" { self.head } else { self.body };
        if let Some(id) = cached.filter(|&id| self.is_section(id, tag)) {
            return Some(id);
        }
        let found = match self.find_section(tag) {
            Some(id) => Some(id),
            None => {
                self.normalize_tree();
                self.find_section(tag)
            }
        };
        if tag == "head" {
            self.head = found;
        } else {
            self.body = found;
        }
        found
    }

    /// The head element, repairing the tree first if there is none.
    pub fn head(&mut self) -> Option<NodeId> {
        self.section("head")
    }

    /// The body element, repairing the tree first if there is none.
    pub fn body(&mut self) -> Option<NodeId> {
        self.section("body")
    }

    /// Ensure root, head and body exist and the head only holds what the
    /// head policy accepts.
    pub fn normalize_tree(&mut self) -> Sections {
        let sections = structure::normalize_tree(&mut self.tree, self.head_policy.as_ref());
        self.head = Some(sections.head);
        self.body = Some(sections.body);
        sections
    }

    /// Query helper scoped to the document node.
    pub fn query(&self) -> QueryHelper<'_> {
        QueryHelper::new(&self.tree, self.tree.document)
    }

    pub fn accessor(&mut self, accessor: Accessor) -> Handle<'_> {
        match accessor {
            Accessor::Head => Handle::Head(self.head()),
            Accessor::Body => Handle::Body(self.body()),
            Accessor::Query => Handle::Query(self.query()),
        }
    }

    /// Resolve an accessor by name. Unknown names are a caller bug and are
    /// reported as [`Error::UnknownAccessor`], never as a missing element.
    pub fn resolve(&mut self, name: &str) -> Result<Handle<'_>> {
        let accessor = name.parse::<Accessor>().inspect_err(|err| {
            error!(%err, "unknown accessor requested");
        })?;
        Ok(self.accessor(accessor))
    }

    /// The element's `id`, assigning an unused `prefix-N` when it has none.
    pub fn element_id(&mut self, node: NodeId, prefix: &str) -> Result<String> {
        if !self.tree.contains(node) || self.tree.element(node).is_none() {
            return Err(Error::ForeignNode);
        }
        if let Some(id) = self.tree.attr(node, "id").filter(|id| !id.is_empty()) {
            return Ok(id.to_string());
        }

        let taken: HashSet<&str> = self
            .tree
            .descendants(self.tree.document)
            .filter_map(|id| self.tree.attr(id, "id"))
            .collect();
        let mut candidate = format!("{prefix}-{}", self.next_id);
        while taken.contains(candidate.as_str()) {
            self.next_id += 1;
            candidate = format!("{prefix}-{}", self.next_id);
        }
        self.next_id += 1;

        self.tree.set_attr(node, "id", &candidate);
        Ok(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> Document {
        Document::new(DocumentOptions::new().seed(42))
    }

    #[test]
    fn unloaded_document() {
        let mut doc = seeded();
        assert_eq!(doc.state(), State::Unloaded);
        assert_eq!(doc.version(), "1.0");
        assert_eq!(doc.head(), None);
        assert_eq!(doc.body(), None);
        assert!(!doc.is_loaded_ok());
    }

    #[test]
    fn load_then_save_moves_through_states() {
        let mut doc = seeded();
        assert!(doc.load(b"<p>x</p>", &LoadOptions::default()));
        assert_eq!(doc.state(), State::Loaded { ok: true });
        doc.save(None).expect("save");
        assert_eq!(doc.state(), State::Saved { ok: true });
        assert!(doc.is_loaded_ok());
    }

    #[test]
    fn transitional_tag_does_not_survive_load() {
        let mut doc = seeded();
        doc.load(b"<head><title>t</title></head><p>x</p>", &LoadOptions::default());
        let head = doc.head().expect("head");
        let first = doc.tree().children(head).next().expect("title");
        assert_eq!(doc.tree().tag(first), Some("title"));
        assert!(!doc.tree().declares_utf8());
    }

    #[test]
    fn cached_sections_are_revalidated() {
        let mut doc = seeded();
        doc.load(b"<p>x</p>", &LoadOptions::default());
        let body = doc.body().expect("body");
        doc.tree_mut().remove(body);
        let rebuilt = doc.body().expect("body is recreated");
        assert_ne!(rebuilt, body);
        assert_eq!(doc.tree().parent(rebuilt), doc.tree().root());
    }

    #[test]
    fn resolve_known_and_unknown_accessors() {
        let mut doc = seeded();
        doc.load(b"<p>x</p>", &LoadOptions::default());
        assert!(matches!(doc.resolve("head"), Ok(Handle::Head(Some(_)))));
        assert!(matches!(doc.resolve("body"), Ok(Handle::Body(Some(_)))));
        match doc.resolve("query") {
            Ok(Handle::Query(query)) => {
                assert_eq!(query.elements("//p").expect("valid").len(), 1);
            }
            other => panic!("expected query handle, got {other:?}"),
        }
        match doc.resolve("footer") {
            Err(Error::UnknownAccessor(name)) => assert_eq!(name, "footer"),
            other => panic!("expected unknown accessor, got {other:?}"),
        }
    }

    #[test]
    fn element_ids_are_assigned_without_collisions() {
        let mut doc = seeded();
        doc.load(
            br#"<p id="x-0">a</p><p>b</p><p id="kept">c</p>"#,
            &LoadOptions::default(),
        );
        let ps = doc.query().elements("//p").expect("valid");
        assert_eq!(doc.element_id(ps[0], "x").expect("element"), "x-0");
        assert_eq!(doc.element_id(ps[1], "x").expect("element"), "x-1");
        assert_eq!(doc.element_id(ps[2], "x").expect("element"), "kept");
        assert_eq!(doc.element_id(ps[1], "x").expect("element"), "x-1");

        let text = doc.tree().children(ps[0]).next().expect("text");
        assert!(matches!(doc.element_id(text, "x"), Err(Error::ForeignNode)));
    }

    #[test]
    fn foreign_nodes_are_rejected() {
        let mut other = seeded();
        other.load(b"<p>a</p><p>b</p><p>c</p><p>d</p>", &LoadOptions::default());
        let far = other.query().elements("//p").expect("valid")[3];

        let mut doc = seeded();
        doc.load(b"<p>x</p>", &LoadOptions::default());
        assert!(matches!(doc.save(Some(far)), Err(Error::ForeignNode)));
    }

    #[test]
    fn text_nodes_save_with_their_parent_escaping() {
        let mut doc = seeded();
        doc.load(
            b"<head><script>if (a < b) {}</script></head><p>1 &lt; 2</p>",
            &LoadOptions::default(),
        );
        let script = doc.query().first("//script").expect("valid").expect("script");
        let code = doc.tree().children(script).next().expect("code");
        assert_eq!(doc.save(Some(code)).expect("save"), "if (a < b) {}");

        let p = doc.query().first("//p").expect("valid").expect("p");
        let text = doc.tree().children(p).next().expect("text");
        assert_eq!(doc.save(Some(text)).expect("save"), "1 &lt; 2");
        assert!(doc.tree().elements_by_tag(doc.tree().document, "p").len() == 1);
    }
}
