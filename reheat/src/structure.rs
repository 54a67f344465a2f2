//! Structural normalization: one root, one head, one body.
//!
//! [`normalize_text`] runs before parsing and makes the markup spell out the
//! `<html><head>…</head><body>…</body></html>` skeleton. [`normalize_tree`]
//! runs on a parsed tree and repairs whatever is still missing or misplaced.

use std::borrow::Cow;
use std::ops::Range;

use indextree::NodeId;
use regex::bytes::{Match, Regex};

use crate::dom::{NodeKind, Tree};
use crate::pattern::BytePattern;

/// The doctype every normalized document starts with.
pub const CANONICAL_DOCTYPE: &str = "<!DOCTYPE html>";

/// A doctype, possibly after leading whitespace and comments.
static LEADING_DOCTYPE: BytePattern =
    BytePattern::new(r"(?is-u)\A((?:\s|<!--.*?-->)*)<!doctype[^>]*>");
static ROOT_START: BytePattern = BytePattern::new(r"(?i-u)<html(?:\s[^>]*)?>");
static ROOT_END: BytePattern = BytePattern::new(r"(?i-u)</html\s*>");
static HEAD_START: BytePattern = BytePattern::new(r"(?i-u)<head(?:\s[^>]*)?>");
static HEAD_END: BytePattern = BytePattern::new(r"(?i-u)</head\s*>");
static BODY_START: BytePattern = BytePattern::new(r"(?i-u)<body(?:\s[^>]*)?>");

/// Comments and raw-text elements. A tag spelled inside one is text.
static OPAQUE: BytePattern = BytePattern::new(concat!(
    r"(?is-u)<!--.*?-->",
    r"|<script(?:\s[^>]*)?>.*?</script\s*>",
    r"|<style(?:\s[^>]*)?>.*?</style\s*>",
    r"|<title(?:\s[^>]*)?>.*?</title\s*>",
    r"|<textarea(?:\s[^>]*)?>.*?</textarea\s*>",
    r"|<template(?:\s[^>]*)?>.*?</template\s*>",
    r"|<xmp(?:\s[^>]*)?>.*?</xmp\s*>",
    r"|<iframe(?:\s[^>]*)?>.*?</iframe\s*>",
    r"|<noembed(?:\s[^>]*)?>.*?</noembed\s*>",
    r"|<noframes(?:\s[^>]*)?>.*?</noframes\s*>",
));

/// Decides which nodes may stay in the head.
///
/// Implemented for any `Fn(&Tree, NodeId) -> bool`, so a closure can be
/// passed wherever a policy is expected.
pub trait HeadPolicy {
    fn is_valid_head_element(&self, tree: &Tree, node: NodeId) -> bool;
}

impl<F> HeadPolicy for F
where
    F: Fn(&Tree, NodeId) -> bool,
{
    fn is_valid_head_element(&self, tree: &Tree, node: NodeId) -> bool {
        self(tree, node)
    }
}

/// Accepts metadata elements, comments and inter-element whitespace.
#[derive(Clone, Copy, Debug, Default)]
pub struct MetadataOnly;

impl MetadataOnly {
    pub const ELEMENTS: &'static [&'static str] = &[
        "title", "base", "link", "meta", "style", "script", "noscript", "template",
    ];
}

impl HeadPolicy for MetadataOnly {
    fn is_valid_head_element(&self, tree: &Tree, node: NodeId) -> bool {
        match &tree.get(node).kind {
            NodeKind::Element(elem) => Self::ELEMENTS
                .iter()
                .any(|tag| elem.tag.eq_ignore_ascii_case(tag)),
            NodeKind::Comment(_) => true,
            NodeKind::Text(text) => text.trim_ascii().is_empty(),
            NodeKind::Document => false,
        }
    }
}

/// Where the sections of a document sit in the markup.
#[derive(Debug, Default)]
struct Layout {
    /// Comments and whitespace in front of a dropped doctype.
    leading: Range<usize>,
    /// Offset where the content proper starts.
    start: usize,
    /// Root start tag span.
    root: Option<Range<usize>>,
    /// Start of the last root end tag, or the end of input.
    inner_end: usize,
    /// Complete head section span.
    head: Option<Range<usize>>,
    /// Body start tag offset. The section runs to the end of the root content.
    body: Option<usize>,
}

/// Rewrite markup so it spells out a root, a head and a body, prefixed with
/// the canonical doctype. Returns the input unchanged if a pattern is
/// unavailable.
pub fn normalize_text(html: &[u8]) -> Cow<'_, [u8]> {
    let Some(layout) = scan(html) else {
        return Cow::Borrowed(html);
    };
    trace!(
        root = layout.root.is_some(),
        head = layout.head.is_some(),
        body = layout.body.is_some(),
        "document layout"
    );

    let mut out = Vec::with_capacity(html.len() + 64);
    out.extend_from_slice(CANONICAL_DOCTYPE.as_bytes());
    out.extend_from_slice(&html[layout.leading.clone()]);

    let (inner, root_end): (Range<usize>, &[u8]) = match &layout.root {
        Some(tag) => {
            out.extend_from_slice(&html[layout.start..tag.end]);
            (tag.end..layout.inner_end, &html[layout.inner_end..])
        }
        None => {
            out.extend_from_slice(b"<html>");
            (layout.start..layout.inner_end, b"</html>")
        }
    };

    match (layout.head, layout.body) {
        (None, None) => {
            out.extend_from_slice(b"<head></head><body>");
            out.extend_from_slice(&html[inner]);
            out.extend_from_slice(b"</body>");
        }
        (Some(head), None) => {
            out.extend_from_slice(&html[inner.start..head.end]);
            out.extend_from_slice(b"<body>");
            out.extend_from_slice(&html[head.end..inner.end]);
            out.extend_from_slice(b"</body>");
        }
        (None, Some(body_start)) => {
            out.extend_from_slice(&html[inner.start..body_start]);
            out.extend_from_slice(b"<head></head>");
            out.extend_from_slice(&html[body_start..inner.end]);
        }
        (Some(_), Some(_)) => out.extend_from_slice(&html[inner]),
    }

    out.extend_from_slice(root_end);
    Cow::Owned(out)
}

/// Locate doctype, root, head and body, in that order. Tags inside
/// comments and raw-text elements are skipped, and a head only counts when
/// it starts before the first body start tag.
fn scan(html: &[u8]) -> Option<Layout> {
    let doctype = LEADING_DOCTYPE.get()?;
    let root_start = ROOT_START.get()?;
    let root_end = ROOT_END.get()?;
    let head_start = HEAD_START.get()?;
    let head_end = HEAD_END.get()?;
    let body_start = BODY_START.get()?;
    let opaque = Opaque::scan(html);

    let mut layout = Layout::default();
    if let Some(caps) = doctype.captures(html) {
        if let Some(leading) = caps.get(1) {
            layout.leading = leading.range();
        }
        layout.start = caps.get(0)?.end();
    }

    let inner_start = match opaque.find_at(root_start, html, layout.start) {
        Some(tag) => {
            layout.inner_end = opaque
                .find_last(root_end, html, tag.end())
                .map_or(html.len(), |m| m.start());
            layout.root = Some(tag.range());
            tag.end()
        }
        None => {
            layout.inner_end = html.len();
            layout.start
        }
    };
    let inner = &html[..layout.inner_end];

    let first_body = opaque.find_at(body_start, inner, inner_start).map(|m| m.start());
    layout.head = opaque
        .find_at(head_start, inner, inner_start)
        .filter(|start| first_body.is_none_or(|body| start.start() < body))
        .and_then(|start| {
            opaque
                .find_at(head_end, inner, start.end())
                .map(|end| start.start()..end.end())
        });
    layout.body = match &layout.head {
        Some(head) => opaque.find_at(body_start, inner, head.end).map(|m| m.start()),
        None => first_body,
    };

    Some(layout)
}

/// Byte spans that hold text rather than markup, in order.
#[derive(Debug, Default)]
struct Opaque(Vec<Range<usize>>);

impl Opaque {
    fn scan(html: &[u8]) -> Self {
        let spans = OPAQUE
            .get()
            .map(|re| re.find_iter(html).map(|m| m.range()).collect())
            .unwrap_or_default();
        Opaque(spans)
    }

    fn covering(&self, pos: usize) -> Option<&Range<usize>> {
        let i = self.0.partition_point(|span| span.end <= pos);
        self.0.get(i).filter(|span| span.start <= pos)
    }

    /// First match at or after `from` that starts outside every span.
    fn find_at<'h>(&self, re: &Regex, html: &'h [u8], mut from: usize) -> Option<Match<'h>> {
        loop {
            if from > html.len() {
                return None;
            }
            let found = re.find_at(html, from)?;
            match self.covering(found.start()) {
                Some(span) => from = span.end,
                None => return Some(found),
            }
        }
    }

    fn find_last<'h>(&self, re: &Regex, html: &'h [u8], from: usize) -> Option<Match<'h>> {
        let mut last = None;
        let mut at = from;
        while let Some(found) = self.find_at(re, html, at) {
            at = found.end().max(at + 1);
            last = Some(found);
        }
        last
    }

    fn find_all<'h>(&self, re: &Regex, html: &'h [u8]) -> Vec<Match<'h>> {
        let mut all = Vec::new();
        let mut at = 0;
        while let Some(found) = self.find_at(re, html, at) {
            at = found.end().max(at + 1);
            all.push(found);
        }
        all
    }
}

fn find_tag(pattern: &BytePattern, html: &[u8]) -> Option<Range<usize>> {
    let re = pattern.get()?;
    Opaque::scan(html).find_at(re, html, 0).map(|m| m.range())
}

/// The first root start tag that is markup, not text.
pub(crate) fn root_start(html: &[u8]) -> Option<Range<usize>> {
    find_tag(&ROOT_START, html)
}

/// The first head start tag that is markup, not text.
pub(crate) fn head_start(html: &[u8]) -> Option<Range<usize>> {
    find_tag(&HEAD_START, html)
}

/// The first body start tag that is markup, not text.
pub(crate) fn body_start(html: &[u8]) -> Option<Range<usize>> {
    find_tag(&BODY_START, html)
}

/// Every match of `pattern` in `html` that is markup, not text.
pub(crate) fn markup_matches(pattern: &BytePattern, html: &[u8]) -> Vec<Range<usize>> {
    let Some(re) = pattern.get() else {
        return Vec::new();
    };
    Opaque::scan(html)
        .find_all(re, html)
        .into_iter()
        .map(|m| m.range())
        .collect()
}

/// Handles to the three structural elements after [`normalize_tree`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sections {
    pub root: NodeId,
    pub head: NodeId,
    pub body: NodeId,
}

/// Make sure the tree has a root with a head and a body, then move nodes the
/// policy rejects out of the head (to the front of the body, order kept) and
/// hoist body-level `<style>` elements the policy accepts into the head.
pub fn normalize_tree(tree: &mut Tree, policy: &dyn HeadPolicy) -> Sections {
    let root = match tree.root() {
        Some(root) => root,
        None => {
            let root = tree.create_element("html", []);
            tree.append(tree.document, root);
            debug!("created missing root element");
            root
        }
    };

    let head = match tree.child_element(root, "head") {
        Some(head) => head,
        None => {
            let head = tree.create_element("head", []);
            tree.prepend(root, head);
            debug!("created missing head");
            head
        }
    };

    let body = match tree.child_element(root, "body") {
        Some(body) => body,
        None => {
            let body = tree.create_element("body", []);
            tree.append(root, body);
            debug!("created missing body");
            body
        }
    };

    // Back to front, so prepending keeps the original relative order.
    let head_children: Vec<NodeId> = tree.children(head).rev().collect();
    let mut relocated = 0usize;
    for child in head_children {
        if !policy.is_valid_head_element(tree, child) {
            tree.prepend(body, child);
            relocated += 1;
        }
    }

    let styles: Vec<NodeId> = tree
        .children(body)
        .filter(|&child| tree.is_element_named(child, "style"))
        .collect();
    let mut hoisted = 0usize;
    for style in styles {
        if policy.is_valid_head_element(tree, style) {
            tree.append(head, style);
            hoisted += 1;
        }
    }

    if relocated > 0 || hoisted > 0 {
        debug!(relocated, hoisted, "repaired head contents");
    }

    Sections { root, head, body }
}
