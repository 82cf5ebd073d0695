//! Table-of-contents parsing.
//!
//! The archive serves tables of contents in several unrelated shapes. Each
//! shape has a [`TocStrategy`] that first checks for its marker elements and
//! only then parses; [`parse_xml_toc`] tries them in a fixed order.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::CoreError;
use crate::xml::{self, Element};

/// One article line of a table of contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocLine {
    pub author: String,
    pub title: String,
    pub start_pages: Vec<u32>,
    pub end_pages: Vec<u32>,
}

/// One table-of-contents shape.
pub trait TocStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the document carries this shape's marker elements.
    fn matches(&self, doc: &Element) -> bool;

    fn parse(&self, doc: &Element) -> Vec<TocLine>;
}

/// Join the trimmed, non-empty texts of `elements` with `", "`.
fn concat(elements: &[&Element]) -> String {
    elements
        .iter()
        .map(|e| e.text().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

static PAGE_SEP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[,;&]|\s(?:et|and)\s").unwrap());

/// Split page text such as `"135-157, 160"` into start and end pages.
///
/// Components that are not plain numbers are skipped.
pub fn parse_pages(s: &str) -> (Vec<u32>, Vec<u32>) {
    let mut start_pages = Vec::new();
    let mut end_pages = Vec::new();
    for component in PAGE_SEP_RE.split(s) {
        let mut halves = component.splitn(2, '-');
        let start = halves.next().unwrap_or("").trim();
        if !start.is_empty() {
            match start.parse() {
                Ok(p) => start_pages.push(p),
                Err(_) => tracing::debug!(component, "skipping unparseable start page"),
            }
        }
        if let Some(end) = halves.next() {
            match end.trim().parse() {
                Ok(p) => end_pages.push(p),
                Err(_) => tracing::debug!(component, "skipping unparseable end page"),
            }
        }
    }
    (start_pages, end_pages)
}

static SPACES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"  +").unwrap());
static DASH_SPLIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?P<author>.+?)\.* - (?P<title>.+)").unwrap());
static DOT_SPLIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?P<author>.+)\. (?P<title>.+)").unwrap());

fn despace(s: &str) -> String {
    SPACES_RE.replace_all(s, " ").trim().to_string()
}

/// Guess author and title from one combined string.
///
/// Tries `"name - title"` then `"name. title"`. When neither fits, the whole
/// string is returned as both, leaving fuzzy scoring to sort it out.
pub fn try_split_author_title(combined: &str) -> (String, String) {
    let combined = combined.replace('\n', "");
    for re in [&*DASH_SPLIT_RE, &*DOT_SPLIT_RE] {
        if let Some(caps) = re.captures(&combined) {
            return (despace(&caps["author"]), despace(&caps["title"]));
        }
    }
    tracing::debug!(combined = %combined, "unable to split author and title");
    (combined.clone(), combined)
}

/// `<container><seg><title/><persName/></seg><xref/></container>` rows.
pub struct TitleXrefPersname;

impl TocStrategy for TitleXrefPersname {
    fn name(&self) -> &'static str {
        "title-xref-persname"
    }

    fn matches(&self, doc: &Element) -> bool {
        ["xref", "persName", "title"]
            .iter()
            .all(|name| doc.find(name).is_some())
    }

    fn parse(&self, doc: &Element) -> Vec<TocLine> {
        // Containers are the grandparents of titles; several titles may share one.
        let mut containers: Vec<&Element> = Vec::new();
        let mut seen = HashSet::new();
        doc.walk(&mut |el, ancestors| {
            if el.name == "title"
                && ancestors.len() >= 2
                && let Some(container) = ancestors.get(ancestors.len() - 2)
                && seen.insert(container.id)
            {
                containers.push(*container);
            }
        });

        containers
            .into_iter()
            .filter_map(|container| {
                let titles = container.find_all("title");
                let persnames = container.find_all("persName");
                let xrefs = container.find_all("xref");
                if titles.is_empty() || persnames.is_empty() || xrefs.is_empty() {
                    return None;
                }
                let (start_pages, end_pages) = parse_pages(&concat(&xrefs));
                Some(TocLine {
                    author: concat(&persnames),
                    title: concat(&titles),
                    start_pages,
                    end_pages,
                })
            })
            .collect()
    }
}

/// `<list><item><seg>Author. Title</seg><xref>12</xref></item></list>`.
pub struct ItemSeg;

impl TocStrategy for ItemSeg {
    fn name(&self) -> &'static str {
        "item-seg"
    }

    fn matches(&self, doc: &Element) -> bool {
        doc.find("item").is_some()
    }

    fn parse(&self, doc: &Element) -> Vec<TocLine> {
        doc.find_all("item")
            .into_iter()
            .map(|item| {
                let segs = item.find_all("seg");
                if segs.len() != 1 {
                    tracing::debug!(segs = segs.len(), "toc item without a single seg");
                }
                let (author, title) = try_split_author_title(&concat(&segs));
                let (start_pages, end_pages) = parse_pages(&concat(&item.find_all("xref")));
                TocLine {
                    author,
                    title,
                    start_pages,
                    end_pages,
                }
            })
            .collect()
    }
}

/// `<table><tr><td>author</td><td>title</td><td>pages</td></tr></table>`.
pub struct Tr;

impl TocStrategy for Tr {
    fn name(&self) -> &'static str {
        "tr"
    }

    fn matches(&self, doc: &Element) -> bool {
        doc.find("td").is_some()
    }

    fn parse(&self, doc: &Element) -> Vec<TocLine> {
        let mut lines = Vec::new();
        for row in doc.find_all("tr") {
            let tds = row.find_all("td");
            let &[author_td, title_td, pages_td] = tds.as_slice() else {
                tracing::debug!(cells = tds.len(), "skipping toc row");
                continue;
            };
            let (mut author, mut title, pages) = (
                concat(&[author_td]),
                concat(&[title_td]),
                concat(&[pages_td]),
            );
            if pages.is_empty() {
                tracing::debug!(author = %author, "skipping toc row without pages");
                continue;
            }
            if title.is_empty() {
                (author, title) = try_split_author_title(&author);
            }
            let (start_pages, end_pages) = parse_pages(&pages);
            lines.push(TocLine {
                author,
                title,
                start_pages,
                end_pages,
            });
        }
        lines
    }
}

/// Strategies in priority order.
pub fn strategies() -> [&'static dyn TocStrategy; 3] {
    [&TitleXrefPersname, &ItemSeg, &Tr]
}

/// Parse a table of contents with the first strategy whose markers are present.
pub fn parse_xml_toc(markup: &str) -> Result<Vec<TocLine>, CoreError> {
    let doc = xml::parse(markup).map_err(|e| CoreError::Parsing(format!("toc markup: {e}")))?;
    for strategy in strategies() {
        if strategy.matches(&doc) {
            let lines = strategy.parse(&doc);
            tracing::debug!(strategy = strategy.name(), lines = lines.len(), "parsed toc");
            return Ok(lines);
        }
    }
    Err(CoreError::UnrecognizedToc)
}
