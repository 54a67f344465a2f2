//! A small path-expression language for selecting nodes and attributes.
//!
//! Supported syntax:
//!
//! - `a | b`: union of two paths
//! - `/html/body`, `//a`: absolute paths (from the document node)
//! - `./p`, `.//a`, `p/a`: paths relative to the context node
//! - `*` or a tag name as a step, `.` for the current node
//! - `@href` or `@*` as the final step, selecting attributes
//! - predicates: `[@id]`, `[@type='text']`, `[@src or @href]`
//!
//! Results come back deduplicated and in document order.

use std::collections::HashMap;
use std::str::FromStr;

use indextree::NodeId;
use smallvec::SmallVec;

use crate::dom::Tree;
use crate::error::{Error, Result};

/// One selected node or attribute.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Hit {
    Element(NodeId),
    Attribute { element: NodeId, name: String },
}

impl Hit {
    /// The element the hit belongs to.
    pub fn element(&self) -> NodeId {
        match self {
            Hit::Element(id) => *id,
            Hit::Attribute { element, .. } => *element,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Axis {
    Child,
    Descendant,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum NameTest {
    Any,
    Named(String),
}

impl NameTest {
    fn matches(&self, name: &str) -> bool {
        match self {
            NameTest::Any => true,
            NameTest::Named(expected) => expected.eq_ignore_ascii_case(name),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum AttrTest {
    Present(String),
    Equals(String, String),
}

#[derive(Clone, Debug)]
enum StepKind {
    /// Elements, filtered by every predicate (each an OR of attribute tests).
    Element {
        name: NameTest,
        predicates: Vec<Vec<AttrTest>>,
    },
    Attribute(NameTest),
    Current,
}

#[derive(Clone, Debug)]
struct Step {
    axis: Axis,
    kind: StepKind,
}

#[derive(Clone, Debug)]
struct Path {
    absolute: bool,
    steps: SmallVec<[Step; 4]>,
}

/// A parsed expression, reusable across trees and context nodes.
#[derive(Clone, Debug)]
pub struct Query {
    source: String,
    paths: Vec<Path>,
}

impl FromStr for Query {
    type Err = Error;

    fn from_str(expr: &str) -> Result<Self> {
        Query::parse(expr)
    }
}

impl Query {
    pub fn parse(expr: &str) -> Result<Self> {
        let mut parser = Parser { src: expr, pos: 0 };
        let mut paths = vec![parser.path()?];
        loop {
            parser.skip_ws();
            if parser.at_end() {
                break;
            }
            if !parser.eat("|") {
                return Err(parser.error("expected `|` or end of expression"));
            }
            paths.push(parser.path()?);
        }
        Ok(Query {
            source: expr.to_string(),
            paths,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against `tree`, with relative paths starting at `context`.
    pub fn evaluate(&self, tree: &Tree, context: NodeId) -> Vec<Hit> {
        let mut hits = Vec::new();
        for path in &self.paths {
            let start = if path.absolute { tree.document } else { context };
            evaluate_path(tree, start, path, &mut hits);
        }

        let order: HashMap<NodeId, usize> = tree
            .descendants(tree.document)
            .enumerate()
            .map(|(i, id)| (id, i))
            .collect();
        hits.sort_by_key(|hit| {
            let position = order.get(&hit.element()).copied().unwrap_or(usize::MAX);
            let attribute = match hit {
                Hit::Element(_) => 0,
                Hit::Attribute { element, name } => tree
                    .element(*element)
                    .and_then(|elem| elem.attrs.get_index_of(name.as_str()))
                    .map_or(usize::MAX, |i| i + 1),
            };
            (position, attribute)
        });
        hits.dedup();
        hits
    }
}

fn evaluate_path(tree: &Tree, start: NodeId, path: &Path, out: &mut Vec<Hit>) {
    let mut current: Vec<NodeId> = vec![start];

    for step in &path.steps {
        let candidates = |current: &[NodeId]| -> Vec<NodeId> {
            let mut next = Vec::new();
            for &node in current {
                match step.axis {
                    Axis::Child => next.extend(tree.children(node)),
                    Axis::Descendant => next.extend(tree.descendants(node).skip(1)),
                }
            }
            next
        };

        current = match &step.kind {
            StepKind::Current => match step.axis {
                Axis::Child => current,
                Axis::Descendant => {
                    let mut all = current.clone();
                    all.extend(candidates(&current));
                    all
                }
            },
            StepKind::Element { name, predicates } => candidates(&current)
                .into_iter()
                .filter(|&id| {
                    tree.element(id).is_some_and(|elem| {
                        name.matches(&elem.tag)
                            && predicates.iter().all(|any_of| {
                                any_of.iter().any(|test| match test {
                                    AttrTest::Present(attr) => elem.attr(attr).is_some(),
                                    AttrTest::Equals(attr, value) => {
                                        elem.attr(attr) == Some(value.as_str())
                                    }
                                })
                            })
                    })
                })
                .collect(),
            StepKind::Attribute(name) => {
                let owners = match step.axis {
                    Axis::Child => current,
                    Axis::Descendant => {
                        let mut all = current.clone();
                        all.extend(candidates(&current));
                        all
                    }
                };
                for owner in owners {
                    let Some(elem) = tree.element(owner) else {
                        continue;
                    };
                    for attr in elem.attrs.keys().filter(|attr| name.matches(attr)) {
                        out.push(Hit::Attribute {
                            element: owner,
                            name: attr.clone(),
                        });
                    }
                }
                return;
            }
        };

        let mut seen = std::collections::HashSet::with_capacity(current.len());
        current.retain(|id| seen.insert(*id));
    }

    out.extend(
        current
            .into_iter()
            .filter(|&id| tree.element(id).is_some())
            .map(Hit::Element),
    );
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn skip_ws(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn error(&self, reason: &str) -> Error {
        Error::Query {
            expr: self.src.to_string(),
            reason: format!("{reason} at offset {}", self.pos),
        }
    }

    fn name(&mut self) -> Option<&'a str> {
        let rest = self.rest();
        let len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':')))
            .unwrap_or(rest.len());
        if len == 0 {
            return None;
        }
        self.pos += len;
        Some(&rest[..len])
    }

    fn name_test(&mut self) -> Result<NameTest> {
        if self.eat("*") {
            return Ok(NameTest::Any);
        }
        match self.name() {
            Some(name) => Ok(NameTest::Named(name.to_string())),
            None => Err(self.error("expected a name or `*`")),
        }
    }

    fn path(&mut self) -> Result<Path> {
        self.skip_ws();
        let (absolute, mut axis) = if self.eat(".//") {
            (false, Axis::Descendant)
        } else if self.eat("./") {
            (false, Axis::Child)
        } else if self.eat("//") {
            (true, Axis::Descendant)
        } else if self.eat("/") {
            (true, Axis::Child)
        } else {
            (false, Axis::Child)
        };

        let mut steps = SmallVec::new();
        loop {
            let step = self.step(axis)?;
            let is_attribute = matches!(step.kind, StepKind::Attribute(_));
            steps.push(step);

            self.skip_ws();
            axis = if self.eat("//") {
                Axis::Descendant
            } else if self.eat("/") {
                Axis::Child
            } else {
                break;
            };
            if is_attribute {
                return Err(self.error("an attribute step must be the last step"));
            }
        }
        Ok(Path { absolute, steps })
    }

    fn step(&mut self, axis: Axis) -> Result<Step> {
        self.skip_ws();
        if self.eat("@") {
            let name = self.name_test()?;
            return Ok(Step {
                axis,
                kind: StepKind::Attribute(name),
            });
        }
        if self.eat(".") {
            return Ok(Step {
                axis,
                kind: StepKind::Current,
            });
        }

        let name = self.name_test()?;
        let mut predicates = Vec::new();
        while self.eat("[") {
            predicates.push(self.predicate()?);
            self.skip_ws();
            if !self.eat("]") {
                return Err(self.error("expected `]`"));
            }
        }
        Ok(Step {
            axis,
            kind: StepKind::Element { name, predicates },
        })
    }

    fn predicate(&mut self) -> Result<Vec<AttrTest>> {
        let mut any_of = Vec::new();
        loop {
            self.skip_ws();
            if !self.eat("@") {
                return Err(self.error("expected `@` in predicate"));
            }
            let Some(attr) = self.name() else {
                return Err(self.error("expected an attribute name"));
            };
            let attr = attr.to_string();
            self.skip_ws();
            if self.eat("=") {
                self.skip_ws();
                let value = self.literal()?;
                any_of.push(AttrTest::Equals(attr, value));
            } else {
                any_of.push(AttrTest::Present(attr));
            }

            self.skip_ws();
            let rest = self.rest();
            let is_or = rest.starts_with("or")
                && rest[2..]
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_whitespace() || c == '@');
            if !is_or {
                return Ok(any_of);
            }
            self.pos += 2;
        }
    }

    fn literal(&mut self) -> Result<String> {
        let quote = match self.rest().chars().next() {
            Some(q @ ('\'' | '"')) => q,
            _ => return Err(self.error("expected a quoted value")),
        };
        self.pos += 1;
        let rest = self.rest();
        match rest.find(quote) {
            Some(end) => {
                self.pos += end + 1;
                Ok(rest[..end].to_string())
            }
            None => Err(self.error("unterminated string")),
        }
    }
}

/// Query entry point bound to a tree and a context node.
#[derive(Clone, Copy, Debug)]
pub struct QueryHelper<'a> {
    tree: &'a Tree,
    context: NodeId,
}

impl<'a> QueryHelper<'a> {
    pub fn new(tree: &'a Tree, context: NodeId) -> Self {
        Self { tree, context }
    }

    /// The same helper, with relative paths starting at `node`.
    pub fn within(self, node: NodeId) -> Self {
        Self {
            context: node,
            ..self
        }
    }

    pub fn select(&self, expr: &str) -> Result<Vec<Hit>> {
        Ok(Query::parse(expr)?.evaluate(self.tree, self.context))
    }

    /// Only the element hits of `expr`.
    pub fn elements(&self, expr: &str) -> Result<Vec<NodeId>> {
        Ok(self
            .select(expr)?
            .into_iter()
            .filter_map(|hit| match hit {
                Hit::Element(id) => Some(id),
                Hit::Attribute { .. } => None,
            })
            .collect())
    }

    /// The first element hit of `expr`.
    pub fn first(&self, expr: &str) -> Result<Option<NodeId>> {
        Ok(self.elements(expr)?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// html > (head > title, body > (div#main > (a[href] p > a[href][title]) , template > img[src]))
    fn sample() -> (Tree, Vec<NodeId>) {
        let mut tree = Tree::new();
        let html = tree.create_element("html", []);
        let head = tree.create_element("head", []);
        let title = tree.create_element("title", []);
        let body = tree.create_element("body", []);
        let div = tree.create_element("div", [("id", "main"), ("class", "c")]);
        let a1 = tree.create_element("a", [("href", "/one")]);
        let p = tree.create_element("p", []);
        let a2 = tree.create_element("a", [("title", "t"), ("href", "/two")]);
        let template = tree.create_element("template", []);
        let img = tree.create_element("img", [("src", "x.png")]);
        tree.append(tree.document, html);
        tree.append(html, head);
        tree.append(head, title);
        tree.append(html, body);
        tree.append(body, div);
        tree.append(div, a1);
        tree.append(div, p);
        tree.append(p, a2);
        tree.append(body, template);
        tree.append(template, img);
        (tree, vec![html, head, title, body, div, a1, p, a2, template, img])
    }

    fn elements(tree: &Tree, context: NodeId, expr: &str) -> Vec<NodeId> {
        QueryHelper::new(tree, context)
            .elements(expr)
            .expect("valid expression")
    }

    #[test]
    fn absolute_and_descendant_paths() {
        let (tree, n) = sample();
        assert_eq!(elements(&tree, n[0], "/html/head/title"), vec![n[2]]);
        assert_eq!(elements(&tree, n[9], "//a"), vec![n[5], n[7]]);
        assert_eq!(elements(&tree, n[0], "/html/*"), vec![n[1], n[3]]);
    }

    #[test]
    fn relative_paths() {
        let (tree, n) = sample();
        assert_eq!(elements(&tree, n[4], "./a"), vec![n[5]]);
        assert_eq!(elements(&tree, n[4], ".//a"), vec![n[5], n[7]]);
        assert_eq!(elements(&tree, n[4], "p/a"), vec![n[7]]);
        assert_eq!(elements(&tree, n[4], "."), vec![n[4]]);
    }

    #[test]
    fn predicates() {
        let (tree, n) = sample();
        assert_eq!(elements(&tree, n[0], "//div[@id='main']"), vec![n[4]]);
        assert_eq!(elements(&tree, n[0], "//div[@id=\"other\"]"), Vec::<NodeId>::new());
        assert_eq!(elements(&tree, n[0], "//a[@title]"), vec![n[7]]);
        assert_eq!(elements(&tree, n[0], "//*[@src or @title]"), vec![n[7], n[9]]);
    }

    #[test]
    fn attribute_steps_and_unions_in_document_order() {
        let (tree, n) = sample();
        let hits = QueryHelper::new(&tree, n[3])
            .select(".//*/@src | .//*/@href")
            .expect("valid");
        assert_eq!(
            hits,
            vec![
                Hit::Attribute { element: n[5], name: "href".into() },
                Hit::Attribute { element: n[7], name: "href".into() },
                Hit::Attribute { element: n[9], name: "src".into() },
            ]
        );

        let all = QueryHelper::new(&tree, n[7]).select("@*").expect("valid");
        assert_eq!(
            all,
            vec![
                Hit::Attribute { element: n[7], name: "title".into() },
                Hit::Attribute { element: n[7], name: "href".into() },
            ]
        );
    }

    #[test]
    fn union_results_are_deduplicated() {
        let (tree, n) = sample();
        assert_eq!(elements(&tree, n[0], "//a | //p/a | //a"), vec![n[5], n[7]]);
    }

    #[test]
    fn malformed_expressions_are_errors() {
        for expr in ["", "//", "//a[", "//a[@x='y]", "@href/a", "//a ||", "//a[id]"] {
            match Query::parse(expr) {
                Err(Error::Query { expr: reported, .. }) => assert_eq!(reported, expr),
                other => panic!("expected query error for {expr:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn first_returns_earliest_match() {
        let (tree, n) = sample();
        let helper = QueryHelper::new(&tree, tree.document);
        assert_eq!(helper.first("//a").expect("valid"), Some(n[5]));
        assert_eq!(helper.within(n[6]).first(".//a").expect("valid"), Some(n[7]));
    }
}
