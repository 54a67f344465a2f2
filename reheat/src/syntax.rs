//! Reversible rewrites for markup the parser cannot take as-is.
//!
//! Two pairs live here:
//!
//! - **Bind attributes**: `<amp-img [src]="url">` uses an attribute name the
//!   HTML attribute grammar rejects. [`encode`] renames such attributes to
//!   `data-reheat-bind-src`; [`decode`] turns them back into `[src]`.
//! - **Void pairing**: every void start tag gets an explicit end tag before
//!   parsing, and [`decode`] strips those end tags from the serialized output.
//!
//! Encoding runs on raw bytes because the source encoding is not known yet.
//! Decoding runs on the serialized UTF-8 string. If a pattern cannot be
//! compiled, the rewrite returns its input untouched.

use std::borrow::Cow;

use regex::bytes::Captures;

use crate::pattern::{BytePattern, TextPattern};

/// Prefix that stands in for the square brackets of a bind attribute.
pub const BIND_PREFIX: &str = "data-reheat-bind-";

/// Void elements that get an explicit end tag before parsing.
///
/// `br` is left out: the tree builder turns a stray `</br>` into a second
/// line break instead of dropping it.
pub const PAIRED_VOID_ELEMENTS: &[&str] = &[
    "area", "base", "basefont", "bgsound", "col", "embed", "frame", "hr", "img", "input",
    "keygen", "link", "meta", "param", "source", "track", "wbr",
];

/// A start tag carrying at least one `[name]` attribute.
static BIND_TAG: BytePattern =
    BytePattern::new(r"(?s-u)<([a-zA-Z0-9_\-]+)(\s[^>]*?\[[a-zA-Z0-9_\-]+\][^>]*)>");

/// One attribute token, anchored at the start of the remaining input.
static BIND_ATTR: BytePattern = BytePattern::new(
    r#"(?s-u)\A(?P<ws>\s+)(?:\[(?P<bound>[a-zA-Z0-9_\-]+)\]|(?P<name>[^\s"'>/=\[\]]+))(?P<value>\s*=\s*(?:"[^"]*"|'[^']*'|[^\s"'=<>`]+))?"#,
);

static VOID_START: BytePattern = BytePattern::new(
    r"(?i-u)<(area|base|basefont|bgsound|col|embed|frame|hr|img|input|keygen|link|meta|param|source|track|wbr)(?:[\s/][^>]*)?>",
);

static VOID_END: TextPattern = TextPattern::new(
    r"(?i)</(?:area|base|basefont|bgsound|br|col|embed|frame|hr|img|input|keygen|link|meta|param|source|track|wbr)\s*>",
);

static BIND_RESTORE: TextPattern = TextPattern::new(r"(\s)data-reheat-bind-([A-Za-z0-9_\-]+)");

/// Make raw markup parser-safe: rename bind attributes, then pair void tags.
pub fn encode(html: &[u8]) -> Cow<'_, [u8]> {
    match encode_bind(html) {
        Cow::Borrowed(html) => pair_void(html),
        Cow::Owned(bound) => Cow::Owned(pair_void(&bound).into_owned()),
    }
}

/// Undo [`encode`] on serialized output.
pub fn decode(html: &str) -> Cow<'_, str> {
    match decode_void(html) {
        Cow::Borrowed(html) => decode_bind(html),
        Cow::Owned(stripped) => Cow::Owned(decode_bind(&stripped).into_owned()),
    }
}

/// Rename `[name]` attributes to the reserved prefix form.
///
/// A tag whose attribute list does not parse completely is left alone.
pub fn encode_bind(html: &[u8]) -> Cow<'_, [u8]> {
    let Some(tag) = BIND_TAG.get() else {
        return Cow::Borrowed(html);
    };
    tag.replace_all(html, |caps: &Captures<'_>| {
        match rewrite_bind_attrs(&caps[2]) {
            Some(attrs) => {
                let mut out = Vec::with_capacity(caps[0].len() + 32);
                out.push(b'<');
                out.extend_from_slice(&caps[1]);
                out.extend_from_slice(&attrs);
                out.push(b'>');
                out
            }
            None => caps[0].to_vec(),
        }
    })
}

/// Re-emit an attribute list with bracketed names prefixed. `None` means
/// the list did not parse or held no bind attribute.
fn rewrite_bind_attrs(attrs: &[u8]) -> Option<Vec<u8>> {
    let attr = BIND_ATTR.get()?;
    let mut out = Vec::with_capacity(attrs.len() + 32);
    let mut rest = attrs;
    let mut rewrote = false;

    loop {
        let trimmed = rest.trim_ascii();
        if trimmed.is_empty() {
            out.extend_from_slice(rest);
            break;
        }
        if trimmed == b"/" {
            break;
        }

        let caps = attr.captures(rest)?;
        out.extend_from_slice(&caps["ws"]);
        if let Some(bound) = caps.name("bound") {
            out.extend_from_slice(BIND_PREFIX.as_bytes());
            out.extend_from_slice(bound.as_bytes());
            rewrote = true;
        } else if let Some(name) = caps.name("name") {
            out.extend_from_slice(name.as_bytes());
        }
        if let Some(value) = caps.name("value") {
            out.extend_from_slice(value.as_bytes());
        }
        rest = &rest[caps.get(0)?.end()..];
    }

    rewrote.then_some(out)
}

/// Append `</name>` after every void start tag not already followed by one.
pub fn pair_void(html: &[u8]) -> Cow<'_, [u8]> {
    let Some(start) = VOID_START.get() else {
        return Cow::Borrowed(html);
    };

    let mut out: Option<Vec<u8>> = None;
    let mut copied = 0;
    for caps in start.captures_iter(html) {
        let (Some(tag), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if closes_immediately(&html[tag.end()..], name.as_bytes()) {
            continue;
        }
        let buf = out.get_or_insert_with(|| Vec::with_capacity(html.len() + 64));
        buf.extend_from_slice(&html[copied..tag.end()]);
        buf.extend_from_slice(b"</");
        buf.extend_from_slice(name.as_bytes());
        buf.push(b'>');
        copied = tag.end();
    }

    match out {
        Some(mut buf) => {
            buf.extend_from_slice(&html[copied..]);
            trace!(added = buf.len() - html.len(), "paired void elements");
            Cow::Owned(buf)
        }
        None => Cow::Borrowed(html),
    }
}

fn closes_immediately(rest: &[u8], name: &[u8]) -> bool {
    let Some(rest) = rest.strip_prefix(b"</") else {
        return false;
    };
    if rest.len() < name.len() || !rest[..name.len()].eq_ignore_ascii_case(name) {
        return false;
    }
    rest[name.len()..].trim_ascii_start().first() == Some(&b'>')
}

/// Strip end tags of void elements, wherever they appear.
pub fn decode_void(html: &str) -> Cow<'_, str> {
    match VOID_END.get() {
        Some(re) => re.replace_all(html, ""),
        None => Cow::Borrowed(html),
    }
}

/// Turn prefixed attribute names back into `[name]`.
pub fn decode_bind(html: &str) -> Cow<'_, str> {
    match BIND_RESTORE.get() {
        Some(re) => re.replace_all(html, "${1}[${2}]"),
        None => Cow::Borrowed(html),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(bytes: Cow<'_, [u8]>) -> String {
        String::from_utf8(bytes.into_owned()).expect("ascii test input")
    }

    #[test]
    fn bind_attributes_get_prefixed() {
        let html = br#"<amp-img [src]="a.png" width=10 [class]='big'>"#;
        assert_eq!(
            text(encode_bind(html)),
            r#"<amp-img data-reheat-bind-src="a.png" width=10 data-reheat-bind-class='big'>"#
        );
    }

    #[test]
    fn bare_bind_attribute_and_unquoted_values() {
        let html = b"<input [disabled] [value]=on type=checkbox>";
        assert_eq!(
            text(encode_bind(html)),
            "<input data-reheat-bind-disabled data-reheat-bind-value=on type=checkbox>"
        );
    }

    #[test]
    fn unparsable_attribute_list_leaves_tag_alone() {
        let html = br#"<a [href]="x"y>link</a>"#;
        assert_eq!(text(encode_bind(html)), r#"<a [href]="x"y>link</a>"#);
    }

    #[test]
    fn brackets_inside_values_are_not_bind_attributes() {
        let html = br#"<a title="[x]" href="/">go</a>"#;
        assert_eq!(text(encode_bind(html)), r#"<a title="[x]" href="/">go</a>"#);
    }

    #[test]
    fn self_closing_slash_is_dropped() {
        let html = br#"<amp-img [src]="a.png" />"#;
        assert_eq!(text(encode_bind(html)), r#"<amp-img data-reheat-bind-src="a.png">"#);

        let html = br#"<a [href]="/docs/">docs</a>"#;
        assert_eq!(text(encode_bind(html)), r#"<a data-reheat-bind-href="/docs/">docs</a>"#);
    }

    #[test]
    fn void_tags_get_paired_once() {
        assert_eq!(
            text(pair_void(br#"<img src="a.png"><HR>"#)),
            r#"<img src="a.png"></img><HR></HR>"#
        );
        assert!(matches!(
            pair_void(br#"<img src="a.png"></IMG >"#),
            Cow::Borrowed(_)
        ));
        assert_eq!(
            text(pair_void(b"<basefont size=3><base href=/>")),
            "<basefont size=3></basefont><base href=/></base>"
        );
    }

    #[test]
    fn line_breaks_and_lookalikes_are_not_paired() {
        let html = b"<p>a<br>b<image><header></header></p>";
        assert!(matches!(pair_void(html), Cow::Borrowed(_)));
    }

    #[test]
    fn decode_strips_void_end_tags() {
        assert_eq!(
            decode_void("<img src=\"a.png\"></img><br></br ><p>x</p>"),
            "<img src=\"a.png\"><br><p>x</p>"
        );
    }

    #[test]
    fn decode_restores_bind_names() {
        assert_eq!(
            decode_bind("<a data-reheat-bind-href=\"x\" data-reheat-bind-hidden>"),
            "<a [href]=\"x\" [hidden]>"
        );
        assert_eq!(decode_bind("<p>data-reheat-bind-x</p>"), "<p>data-reheat-bind-x</p>");
    }

    #[test]
    fn encode_then_decode_restores_shorthand() {
        let source = r#"<amp-list [src]="state.items"><img src="a.png"><input [value]="v"></amp-list>"#;
        let encoded = text(encode(source.as_bytes()));
        assert_eq!(
            encoded,
            r#"<amp-list data-reheat-bind-src="state.items"><img src="a.png"></img><input data-reheat-bind-value="v"></input></amp-list>"#
        );
        assert_eq!(decode(&encoded), source);
    }
}
