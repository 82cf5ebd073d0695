//! Typed bibliographic records and their catalog query strings.

use serde::{Deserialize, Serialize};

/// One year, volume or issue number, or an explicit set of them.
///
/// A range is always stored expanded: 1919–1921 is `Many([1919, 1920, 1921])`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Numbers {
    One(i64),
    Many(Vec<i64>),
}

impl Numbers {
    /// Collapse a sorted, deduplicated list: one element becomes `One`.
    pub fn from_vec(mut values: Vec<i64>) -> Option<Self> {
        values.sort_unstable();
        values.dedup();
        match values.len() {
            0 => None,
            1 => Some(Numbers::One(values[0])),
            _ => Some(Numbers::Many(values)),
        }
    }

    /// Inclusive range, collapsing to `One` when `start == end`.
    pub fn range(start: i64, end: i64) -> Self {
        if start == end {
            Numbers::One(start)
        } else {
            Numbers::Many((start.min(end)..=start.max(end)).collect())
        }
    }

    pub fn values(&self) -> Vec<i64> {
        match self {
            Numbers::One(n) => vec![*n],
            Numbers::Many(v) => v.clone(),
        }
    }

    pub fn contains(&self, n: i64) -> bool {
        match self {
            Numbers::One(m) => *m == n,
            Numbers::Many(v) => v.contains(&n),
        }
    }

    pub fn first(&self) -> Option<i64> {
        match self {
            Numbers::One(n) => Some(*n),
            Numbers::Many(v) => v.first().copied(),
        }
    }
}

impl From<i64> for Numbers {
    fn from(n: i64) -> Self {
        Numbers::One(n)
    }
}

impl std::fmt::Display for Numbers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Numbers::One(n) => write!(f, "{n}"),
            Numbers::Many(v) => {
                let parts: Vec<String> = v.iter().map(i64::to_string).collect();
                write!(f, "{}", parts.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub title: String,
    pub journal_title: String,
    pub author: String,
    /// Logical page labels as printed, all arabic or all roman.
    pub pages: Vec<String>,
    pub year: Option<Numbers>,
    pub publisher: Option<String>,
    pub editor: Option<String>,
    pub volume: Option<Numbers>,
    pub number: Option<Numbers>,
    /// Physical page ordinals, filled in by resolution.
    pub physical_pages: Option<Vec<u32>>,
    pub ark: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub title: String,
    pub author: String,
    pub editor: Option<String>,
    pub year: Option<Numbers>,
    pub publisher: Option<String>,
    pub ark: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub title: String,
    pub author: String,
    pub editor: Option<String>,
    pub year: Option<Numbers>,
    pub publisher: Option<String>,
    pub ark: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Journal {
    pub journal_title: String,
    pub year: Option<Numbers>,
    pub publisher: Option<String>,
    pub volume: Option<Numbers>,
    pub number: Option<Numbers>,
    pub ark: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum BibliographicRecord {
    Article(Article),
    Book(Book),
    Collection(Collection),
    Journal(Journal),
}

/// Index names the catalog's search protocol accepts.
pub const VALID_QUERIES: &[&str] = &[
    "anywhere",
    "author",
    "title",
    "subject",
    "doctype",
    "recordtype",
    "status",
    "recordid",
    "persistentid",
    "ean",
    "isbn",
    "issn",
    "ismn",
    "isrc",
    "comref",
    "otherid",
    "abstract",
    "authorRole",
    "cote",
    "date",
    "dewey",
    "digitized",
    "FrenchNationalBibliography",
    "fuzzyIsbn",
    "isni",
    "language",
    "LegalDepositType",
    "LegalDepositDate",
    "local",
    "publicationdate",
    "publicationplace",
    "publisher",
    "serialtitle",
    "set",
    "technicaldata",
    "unimarc:doctype",
    "col2bib",
    "ens2bib",
    "rec2bib",
    "author2bib",
    "subject2bib",
    "work2bib",
    "creationdate",
    "lastmodificationdate",
];

/// Join `(index, value)` pairs into `bib.index all "value" and ...`.
pub fn assemble_query<'a>(fields: impl IntoIterator<Item = (&'a str, String)>) -> String {
    fields
        .into_iter()
        .map(|(k, v)| format!("bib.{k} all \"{v}\""))
        .collect::<Vec<_>>()
        .join(" and ")
}

impl BibliographicRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            BibliographicRecord::Article(_) => "article",
            BibliographicRecord::Book(_) => "book",
            BibliographicRecord::Collection(_) => "collection",
            BibliographicRecord::Journal(_) => "journal",
        }
    }

    /// The record the catalog actually holds: an article lives in its journal.
    pub fn source(&self) -> BibliographicRecord {
        match self {
            BibliographicRecord::Article(a) => BibliographicRecord::Journal(Journal {
                journal_title: a.journal_title.clone(),
                year: a.year.clone(),
                publisher: a.publisher.clone(),
                volume: a.volume.clone(),
                number: a.number.clone(),
                ark: a.ark.clone(),
            }),
            other => other.clone(),
        }
    }

    pub fn title(&self) -> &str {
        match self {
            BibliographicRecord::Article(a) => &a.title,
            BibliographicRecord::Book(b) => &b.title,
            BibliographicRecord::Collection(c) => &c.title,
            BibliographicRecord::Journal(j) => &j.journal_title,
        }
    }

    pub fn author(&self) -> Option<&str> {
        match self {
            BibliographicRecord::Article(a) => Some(&a.author),
            BibliographicRecord::Book(b) => Some(&b.author),
            BibliographicRecord::Collection(c) => Some(&c.author),
            BibliographicRecord::Journal(_) => None,
        }
    }

    pub fn year(&self) -> Option<&Numbers> {
        match self {
            BibliographicRecord::Article(a) => a.year.as_ref(),
            BibliographicRecord::Book(b) => b.year.as_ref(),
            BibliographicRecord::Collection(c) => c.year.as_ref(),
            BibliographicRecord::Journal(j) => j.year.as_ref(),
        }
    }

    pub fn ark(&self) -> Option<&str> {
        match self {
            BibliographicRecord::Article(a) => a.ark.as_deref(),
            BibliographicRecord::Book(b) => b.ark.as_deref(),
            BibliographicRecord::Collection(c) => c.ark.as_deref(),
            BibliographicRecord::Journal(j) => j.ark.as_deref(),
        }
    }

    /// Value of `recordtype` in catalog queries.
    fn record_type(&self) -> Option<&'static str> {
        match self {
            BibliographicRecord::Article(_) => None,
            BibliographicRecord::Journal(_) => Some("per"),
            BibliographicRecord::Book(_) => Some("mon"),
            BibliographicRecord::Collection(_) => Some("col"),
        }
    }

    /// Catalog query for [`source`](Self::source).
    ///
    /// Only whitelisted index names are emitted. A year set cannot be
    /// expressed with `all` and is left out.
    pub fn generate_query(&self) -> String {
        let source = self.source();
        let mut fields: Vec<(&str, String)> = Vec::new();
        let year = match source.year() {
            Some(Numbers::One(y)) => Some(y.to_string()),
            _ => None,
        };
        if let Some(y) = year {
            fields.push(("publicationdate", y));
        }
        let publisher = match &source {
            BibliographicRecord::Article(a) => a.publisher.clone(),
            BibliographicRecord::Book(b) => b.publisher.clone(),
            BibliographicRecord::Collection(c) => c.publisher.clone(),
            BibliographicRecord::Journal(j) => j.publisher.clone(),
        };
        if let Some(p) = publisher.filter(|p| !p.is_empty()) {
            fields.push(("publisher", p));
        }
        if !source.title().is_empty() {
            fields.push(("title", source.title().to_string()));
        }
        if let Some(author) = source.author().filter(|a| !a.is_empty()) {
            fields.push(("author", author.to_string()));
        }
        if let Some(rt) = source.record_type() {
            fields.push(("recordtype", rt.to_string()));
        }
        assemble_query(
            fields
                .into_iter()
                .filter(|(k, _)| VALID_QUERIES.contains(k)),
        )
    }
}
