//! HTML document adapter around html5ever.
//!
//! reheat loads arbitrary, possibly malformed HTML into an arena tree,
//! normalizes it into a strict `<html><head/><body/></html>` shape, and
//! saves it back without the damage a plain parse/serialize round trip does:
//! - **Bind attributes** (`[src]="…"`) and **void shorthand** (`<img>`) survive
//! - **Structure** is completed before parsing and repaired after it
//! - **Encodings** are detected, converted to UTF-8 and pinned for the parser
//! - **Template tokens** and **head noscripts** are shielded with salted placeholders
//!
//! # Example
//!
//! ```rust
//! use reheat::{Document, LoadOptions};
//!
//! let mut doc = Document::from_html(b"<p>hi<br>there</p>", &LoadOptions::default());
//! assert!(doc.is_loaded_ok());
//!
//! let body = doc.body().expect("normalized documents have a body");
//! assert_eq!(doc.tree().children(body).count(), 1);
//!
//! let html = doc.save(None).unwrap();
//! assert_eq!(
//!     html,
//!     "<!DOCTYPE html><html><head></head><body><p>hi<br>there</p></body></html>"
//! );
//! ```

#[macro_use]
mod tracing_macros;

pub mod document;
pub mod dom;
pub mod encoding;
mod error;
pub mod parser;
mod pattern;
pub mod query;
pub mod serialize;
pub mod shield;
pub mod structure;
pub mod syntax;

pub use document::{Accessor, Document, DocumentOptions, Handle, LoadOptions, State};
pub use dom::{ElementData, Namespace, NodeData, NodeKind, Tree};
pub use encoding::EncodingValue;
pub use error::{Error, Result};
pub use parser::{HtmlParser, ParseOptions, ParseOutcome};
pub use query::{Hit, Query, QueryHelper};
pub use serialize::SerializeOptions;
pub use structure::{HeadPolicy, MetadataOnly, Sections};

// Re-export types that appear in the public API
pub use indextree::NodeId;
pub use tendril::StrTendril;
