//! Minimal element tree over quick-xml events.
//!
//! Archive responses are small, so they are read into a tree once and then
//! queried by local element name, ignoring namespace prefixes.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    /// Position in document order, unique within one tree.
    pub id: usize,
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

fn local(name: &[u8]) -> String {
    let name = String::from_utf8_lossy(name);
    match name.rsplit_once(':') {
        Some((_, local)) => local.to_string(),
        None => name.into_owned(),
    }
}

fn start_element(e: &BytesStart<'_>, id: usize) -> Element {
    let attrs = e
        .attributes()
        .flatten()
        .map(|a| {
            let value = a
                .unescape_value()
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| String::from_utf8_lossy(&a.value).into_owned());
            (local(a.key.as_ref()), value)
        })
        .collect();
    Element {
        id,
        name: local(e.name().as_ref()),
        attrs,
        children: Vec::new(),
    }
}

/// Parse a document into a synthetic `#document` root holding the top-level
/// nodes.
pub fn parse(xml: &str) -> Result<Element, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    let mut next_id = 1;
    let mut stack = vec![Element {
        id: 0,
        name: "#document".into(),
        attrs: Vec::new(),
        children: Vec::new(),
    }];

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                stack.push(start_element(&e, next_id));
                next_id += 1;
            }
            Event::Empty(e) => {
                let el = start_element(&e, next_id);
                next_id += 1;
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(Node::Element(el));
                }
            }
            Event::End(_) => {
                // Unbalanced end tags are tolerated at the root.
                if stack.len() > 1
                    && let Some(done) = stack.pop()
                    && let Some(parent) = stack.last_mut()
                {
                    parent.children.push(Node::Element(done));
                }
            }
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map(|s| s.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&t).into_owned());
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(Node::Text(text));
                }
            }
            Event::CData(t) => {
                if let Some(parent) = stack.last_mut() {
                    parent
                        .children
                        .push(Node::Text(String::from_utf8_lossy(&t).into_owned()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    // Close anything left open by truncated markup.
    while stack.len() > 1 {
        if let Some(done) = stack.pop()
            && let Some(parent) = stack.last_mut()
        {
            parent.children.push(Node::Element(done));
        }
    }
    Ok(stack.remove(0))
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// All descendant elements named `name`, in document order.
    pub fn find_all<'a>(&'a self, name: &str) -> Vec<&'a Element> {
        let mut out = Vec::new();
        self.walk(&mut |el, _| {
            if el.name == name {
                out.push(el);
            }
        });
        out
    }

    pub fn find<'a>(&'a self, name: &str) -> Option<&'a Element> {
        self.find_all(name).into_iter().next()
    }

    /// Visit every descendant with its chain of ancestors (outermost first,
    /// starting at `self`).
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Element, &[&'a Element])) {
        let mut ancestors = vec![self];
        walk_inner(self, &mut ancestors, visit);
    }

    /// Concatenated text content of the element and its descendants.
    pub fn text(&self) -> String {
        let mut out = String::new();
        collect_text(self, &mut out);
        out
    }
}

fn walk_inner<'a>(
    el: &'a Element,
    ancestors: &mut Vec<&'a Element>,
    visit: &mut dyn FnMut(&'a Element, &[&'a Element]),
) {
    for child in el.child_elements() {
        visit(child, ancestors);
        ancestors.push(child);
        walk_inner(child, ancestors, visit);
        ancestors.pop();
    }
}

fn collect_text(el: &Element, out: &mut String) {
    for node in &el.children {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::Element(e) => collect_text(e, out),
        }
    }
}
