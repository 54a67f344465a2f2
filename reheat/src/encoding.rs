//! Source encoding detection and conversion.
//!
//! Everything the parser sees is UTF-8. Before parsing, the in-band charset
//! declarations are read (and removed when they name something else), the
//! bytes are converted, and a transitional `http-equiv` tag declaring UTF-8
//! is put at the top of the head so the parser's own prescan agrees.

use std::borrow::Cow;
use std::fmt;
use std::ops::Range;

use encoding_rs::Encoding;
use indextree::NodeId;

use crate::dom::{Tree, charset_param, is_utf8_label};
use crate::parser::PRESCAN_LIMIT;
use crate::pattern::{BytePattern, TextPattern};
use crate::structure;

/// Name of the encoding every loaded document ends up in.
pub const TARGET_ENCODING: &str = "UTF-8";

/// Meta tag inserted around parse and serialize to pin the parser to UTF-8.
pub const TRANSITIONAL_TAG: &str =
    r#"<meta http-equiv="content-type" content="text/html; charset=utf-8">"#;

/// Candidates tried, in order, when nothing declares an encoding.
pub const AUTO_DETECT_ORDER: &[&str] = &[
    "UTF-8",
    "EUC-JP",
    "eucJP-win",
    "JIS",
    "ISO-2022-JP",
    "ISO-8859-15",
    "ISO-8859-1",
    "ASCII",
];

/// Names that do not resolve as they are, and what they mean.
const ALIASES: &[(&str, &str)] = &[
    ("latin-1", "ISO-8859-1"),
    ("latin_1", "ISO-8859-1"),
    ("eucjp-win", "EUC-JP"),
    ("euc-jp-win", "EUC-JP"),
    ("jis", "ISO-2022-JP"),
    ("sjis-win", "Shift_JIS"),
    ("cp932", "Shift_JIS"),
    ("ascii", "windows-1252"),
];

static META_TAG: BytePattern = BytePattern::new(r"(?is-u)<meta(?:\s[^>]*)?>(?:\s*</meta\s*>)?");
static ATTRIBUTE: BytePattern = BytePattern::new(
    r#"(?s-u)\s([^\s"'>/=]+)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+)))?"#,
);
static SERIALIZED_HEAD_START: TextPattern = TextPattern::new(r"(?i)<head(?:\s[^>]*)?>");

/// An encoding as far as the adapter knows it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum EncodingValue {
    /// A charset name, as declared or passed in.
    Named(String),
    /// Not known yet; detect heuristically.
    #[default]
    Auto,
    /// The target encoding (UTF-8).
    Target,
}

impl EncodingValue {
    /// Interpret a user-supplied hint. Empty and `auto` mean [`EncodingValue::Auto`].
    pub fn from_hint(hint: &str) -> Self {
        let hint = hint.trim();
        if hint.is_empty() || hint.eq_ignore_ascii_case("auto") {
            Self::Auto
        } else if is_utf8_label(hint) {
            Self::Target
        } else {
            Self::Named(hint.to_string())
        }
    }

    pub fn is_target(&self) -> bool {
        match self {
            Self::Target => true,
            Self::Named(name) => is_utf8_label(name),
            Self::Auto => false,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Named(name) => name,
            Self::Auto => "auto",
            Self::Target => TARGET_ENCODING,
        }
    }
}

impl fmt::Display for EncodingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Resolve an encoding name to an `encoding_rs` encoding, through the alias
/// table first. Unknown names yield `None`.
pub fn sanitize(name: &str) -> Option<&'static Encoding> {
    let name = name.trim();
    let label = ALIASES
        .iter()
        .find(|(alias, _)| alias.eq_ignore_ascii_case(name))
        .map_or(name, |(_, canonical)| canonical);
    Encoding::for_label(label.as_bytes()).filter(|enc| *enc != encoding_rs::REPLACEMENT)
}

/// First candidate of [`AUTO_DETECT_ORDER`] that decodes `html` without errors.
pub fn auto_detect(html: &[u8]) -> Option<&'static Encoding> {
    AUTO_DETECT_ORDER.iter().find_map(|&candidate| {
        let valid = if candidate == "ASCII" {
            html.is_ascii()
        } else {
            let encoding = sanitize(candidate)?;
            encoding
                .decode_without_bom_handling_and_without_replacement(html)
                .is_some()
        };
        if !valid {
            return None;
        }
        trace!(candidate, "auto-detected encoding");
        sanitize(candidate)
    })
}

/// A meta tag found in the markup, with the value it declares.
struct Declaration {
    span: Range<usize>,
    charset: String,
}

/// Read the in-band charset declarations and decide on the source encoding.
///
/// The `hint` counts least, an `http-equiv` content-type declaration
/// overrides it, and a `<meta charset>` tag overrides both. When the
/// outcome is not UTF-8 the declaring tags are cut out of the markup.
pub fn detect_and_strip<'a>(
    html: &'a [u8],
    hint: &EncodingValue,
) -> (EncodingValue, Cow<'a, [u8]>) {
    let (Some(meta), Some(attribute)) = (META_TAG.get(), ATTRIBUTE.get()) else {
        return (hint.clone(), Cow::Borrowed(html));
    };

    let mut http_equiv: Option<Declaration> = None;
    let mut charset: Option<Declaration> = None;
    for tag in meta.find_iter(html) {
        if http_equiv.is_some() && charset.is_some() {
            break;
        }
        let attrs = tag_attributes(attribute, &tag.as_bytes()[5..]);
        let value = |name: &str| {
            attrs
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name.as_bytes()))
                .map(|(_, value)| String::from_utf8_lossy(value).trim().to_string())
        };

        if http_equiv.is_none()
            && value("http-equiv").is_some_and(|v| v.eq_ignore_ascii_case("content-type"))
            && let Some(declared) = value("content").as_deref().and_then(charset_param)
        {
            http_equiv = Some(Declaration {
                span: tag.range(),
                charset: declared.to_string(),
            });
        }
        if charset.is_none()
            && let Some(declared) = value("charset").filter(|v| !v.is_empty())
        {
            charset = Some(Declaration {
                span: tag.range(),
                charset: declared,
            });
        }
    }

    let mut encoding = hint.clone();
    for found in [&http_equiv, &charset].into_iter().flatten() {
        encoding = EncodingValue::from_hint(&found.charset);
    }
    debug!(%encoding, "declared encoding");

    if encoding.is_target() || (http_equiv.is_none() && charset.is_none()) {
        return (encoding, Cow::Borrowed(html));
    }

    let mut spans: Vec<Range<usize>> = [http_equiv, charset]
        .into_iter()
        .flatten()
        .map(|d| d.span)
        .collect();
    spans.sort_by_key(|span| span.start);
    spans.dedup();

    let mut out = Vec::with_capacity(html.len());
    let mut copied = 0;
    for span in spans {
        out.extend_from_slice(&html[copied..span.start]);
        copied = span.end;
    }
    out.extend_from_slice(&html[copied..]);
    (encoding, Cow::Owned(out))
}

fn tag_attributes<'h>(attribute: &regex::bytes::Regex, tag: &'h [u8]) -> Vec<(&'h [u8], &'h [u8])> {
    attribute
        .captures_iter(tag)
        .filter_map(|caps| {
            let name = caps.get(1)?.as_bytes();
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map_or(&b""[..], |m| m.as_bytes());
            Some((name, value))
        })
        .collect()
}

/// Markup converted to UTF-8, plus what it was converted from.
#[derive(Debug)]
pub struct Adapted<'a> {
    pub html: Cow<'a, [u8]>,
    /// The encoding the returned bytes were decoded from. Raw fragments cut
    /// out of the same input decode with it too.
    pub source: &'static Encoding,
    /// The encoding recorded as the document's original one.
    pub original: EncodingValue,
}

/// Convert `html` from `current` to UTF-8.
///
/// `Auto` runs [`auto_detect`] (falling back to the target). A name that
/// does not resolve skips conversion and is recorded as `Auto`. A failed
/// conversion keeps the original bytes.
pub fn adapt_encoding<'a>(html: &'a [u8], current: &EncodingValue) -> Adapted<'a> {
    let unchanged = |original: EncodingValue| Adapted {
        html: Cow::Borrowed(html),
        source: encoding_rs::UTF_8,
        original,
    };

    let encoding = match current {
        EncodingValue::Target => return unchanged(EncodingValue::Target),
        EncodingValue::Auto => match auto_detect(html) {
            Some(detected) => detected,
            None => return unchanged(EncodingValue::Target),
        },
        EncodingValue::Named(name) => match sanitize(name) {
            Some(encoding) => encoding,
            None => {
                warn!(encoding = %name, "unknown encoding, skipping conversion");
                return unchanged(EncodingValue::Auto);
            }
        },
    };

    let original = match current {
        EncodingValue::Named(name) => EncodingValue::Named(name.clone()),
        _ => EncodingValue::from_hint(encoding.name()),
    };
    if encoding == encoding_rs::UTF_8 {
        return unchanged(original);
    }

    match encoding.decode_without_bom_handling_and_without_replacement(html) {
        Some(text) => {
            debug!(from = encoding.name(), "converted input to UTF-8");
            Adapted {
                html: Cow::Owned(text.into_owned().into_bytes()),
                source: encoding,
                original,
            }
        }
        None => {
            warn!(from = encoding.name(), "conversion failed, keeping original bytes");
            unchanged(original)
        }
    }
}

/// Put [`TRANSITIONAL_TAG`] where the parser's charset prescan will see it.
///
/// That is right after the head start tag when it fits into the prescan
/// window. Otherwise the tag goes in front of the root start tag, or right
/// after the doctype; the tree builder still files it as the head's first
/// child.
pub fn insert_transitional(html: &[u8]) -> Cow<'_, [u8]> {
    let at = transitional_offset(html);
    trace!(at, "inserting transitional charset tag");

    let mut out = Vec::with_capacity(html.len() + TRANSITIONAL_TAG.len());
    out.extend_from_slice(&html[..at]);
    out.extend_from_slice(TRANSITIONAL_TAG.as_bytes());
    out.extend_from_slice(&html[at..]);
    Cow::Owned(out)
}

fn transitional_offset(html: &[u8]) -> usize {
    let fits = |at: usize| at + TRANSITIONAL_TAG.len() <= PRESCAN_LIMIT;
    if let Some(head) = structure::head_start(html)
        && fits(head.end)
    {
        return head.end;
    }
    if let Some(root) = structure::root_start(html)
        && fits(root.start)
    {
        return root.start;
    }
    let doctype = structure::CANONICAL_DOCTYPE.as_bytes();
    let has_doctype = html
        .get(..doctype.len())
        .is_some_and(|start| start.eq_ignore_ascii_case(doctype));
    if has_doctype { doctype.len() } else { 0 }
}

/// True if `node` is a meta element with exactly the transitional attributes.
fn is_transitional(tree: &Tree, node: NodeId) -> bool {
    let Some(elem) = tree.element(node) else {
        return false;
    };
    elem.tag.eq_ignore_ascii_case("meta")
        && elem.attrs.len() == 2
        && elem
            .attr("http-equiv")
            .is_some_and(|v| v.eq_ignore_ascii_case("content-type"))
        && elem
            .attr("content")
            .is_some_and(|v| v.eq_ignore_ascii_case("text/html; charset=utf-8"))
}

fn head_of(tree: &Tree) -> Option<NodeId> {
    tree.root().and_then(|root| tree.child_element(root, "head"))
}

/// Drop the transitional tag from a freshly parsed tree, if it is the
/// head's first child.
pub fn remove_transitional(tree: &mut Tree) -> bool {
    let Some(first) = head_of(tree).and_then(|head| tree.children(head).next()) else {
        return false;
    };
    if !is_transitional(tree, first) {
        return false;
    }
    tree.remove(first);
    trace!("removed transitional charset tag");
    true
}

/// Put a transitional tag node at the top of the head, for serialization.
pub fn attach_transitional(tree: &mut Tree) -> Option<NodeId> {
    let head = head_of(tree)?;
    let meta = tree.create_element(
        "meta",
        [
            ("http-equiv", "content-type"),
            ("content", "text/html; charset=utf-8"),
        ],
    );
    tree.prepend(head, meta);
    Some(meta)
}

/// Where an attached transitional tag shows up in serialized output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionalSite {
    /// Right after the head start tag (the head itself was written).
    AfterHeadStart,
    /// At the very start (only the head's children were written).
    Leading,
    /// Not written at all.
    Absent,
}

/// Remove the serialized transitional tag from `html`, looking for it only
/// where `site` says it was written.
pub fn strip_transitional(html: &str, site: TransitionalSite) -> Cow<'_, str> {
    let at = match site {
        TransitionalSite::Absent => None,
        TransitionalSite::Leading => html.starts_with(TRANSITIONAL_TAG).then_some(0),
        TransitionalSite::AfterHeadStart => SERIALIZED_HEAD_START.get().and_then(|re| {
            re.find_iter(html)
                .map(|m| m.end())
                .find(|&end| html[end..].starts_with(TRANSITIONAL_TAG))
        }),
    };
    match at {
        Some(at) => {
            let mut out = String::with_capacity(html.len());
            out.push_str(&html[..at]);
            out.push_str(&html[at + TRANSITIONAL_TAG.len()..]);
            Cow::Owned(out)
        }
        None => Cow::Borrowed(html),
    }
}
