//! Lazily compiled, process-wide regular expressions.
//!
//! Every pattern is compiled at most once, on first use, under a size limit.
//! A pattern that fails to build yields `None` and callers fall back to
//! returning their input unchanged.

use std::sync::OnceLock;

/// Upper bound on the compiled program size of any rewrite pattern.
const SIZE_LIMIT: usize = 1 << 20;

/// Regex flavours a [`Pattern`] can hold.
pub(crate) trait Compile: Sized {
    fn compile(source: &str) -> Result<Self, regex::Error>;
}

impl Compile for regex::Regex {
    fn compile(source: &str) -> Result<Self, regex::Error> {
        regex::RegexBuilder::new(source)
            .size_limit(SIZE_LIMIT)
            .build()
    }
}

impl Compile for regex::bytes::Regex {
    fn compile(source: &str) -> Result<Self, regex::Error> {
        regex::bytes::RegexBuilder::new(source)
            .size_limit(SIZE_LIMIT)
            .build()
    }
}

/// A regex source plus its memoized compilation result.
pub(crate) struct Pattern<R> {
    source: &'static str,
    compiled: OnceLock<Option<R>>,
}

/// Pattern over UTF-8 text (save side).
pub(crate) type TextPattern = Pattern<regex::Regex>;

/// Pattern over raw bytes of unknown encoding (load side).
pub(crate) type BytePattern = Pattern<regex::bytes::Regex>;

impl<R: Compile> Pattern<R> {
    pub(crate) const fn new(source: &'static str) -> Self {
        Self {
            source,
            compiled: OnceLock::new(),
        }
    }

    /// The compiled regex, or `None` if it could not be built.
    pub(crate) fn get(&self) -> Option<&R> {
        self.compiled
            .get_or_init(|| match R::compile(self.source) {
                Ok(re) => Some(re),
                Err(err) => {
                    warn!(pattern = self.source, %err, "pattern unavailable, rewrite disabled");
                    None
                }
            })
            .as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static GOOD: TextPattern = Pattern::new(r"a+b");
    static BAD: TextPattern = Pattern::new(r"(unclosed");
    static HUGE: BytePattern = Pattern::new(r"(?-u)(?:\w{1000}){1000}");

    #[test]
    fn compiles_once_and_matches() {
        let re = GOOD.get().expect("pattern should compile");
        assert!(re.is_match("xaab"));
        assert!(std::ptr::eq(re, GOOD.get().expect("memoized")));
    }

    #[test]
    fn broken_pattern_degrades_to_none() {
        assert!(BAD.get().is_none());
    }

    #[test]
    fn oversized_pattern_degrades_to_none() {
        assert!(HUGE.get().is_none());
    }
}
