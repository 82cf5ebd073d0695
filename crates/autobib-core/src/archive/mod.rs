//! The digitized-document archive the engine talks to.

pub mod gallica;
pub mod mock;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use autobib_pdf::UnscaledPageBounds;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::CoreError;
use crate::issue::PageMap;

pub use gallica::Gallica;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),
    /// Server returned 429 Too Many Requests.
    #[error("rate limited (429)")]
    RateLimited { retry_after: Option<Duration> },
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("empty response from {0}")]
    Empty(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<quick_xml::Error> for ArchiveError {
    fn from(e: quick_xml::Error) -> Self {
        ArchiveError::Malformed(e.to_string())
    }
}

/// Result of a lightweight availability check. Never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Available,
    /// The archive refuses or redirects delivery.
    Blocked,
    /// The probe itself failed (network, timeout, unexpected status).
    Failed(String),
}

impl ProbeOutcome {
    pub fn is_available(&self) -> bool {
        matches!(self, ProbeOutcome::Available)
    }
}

static ARK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"ark:/(?P<naan>\d+)/(?P<name>[A-Za-z0-9]+)").unwrap());

/// Archival Resource Key, `ark:/<naan>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ark {
    naan: String,
    name: String,
}

impl Ark {
    pub fn new(naan: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            naan: naan.into(),
            name: name.into(),
        }
    }

    /// Find the first `ark:/<naan>/<name>` in `s`, e.g. in a catalog URL.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let caps = ARK_RE
            .captures(s)
            .ok_or_else(|| CoreError::Parsing(format!("no ark identifier in {s:?}")))?;
        Ok(Self::new(&caps["naan"], &caps["name"]))
    }

    pub fn naan(&self) -> &str {
        &self.naan
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for Ark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ark:/{}/{}", self.naan, self.name)
    }
}

impl FromStr for Ark {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ark::parse(s)
    }
}

/// One raw catalog hit: Dublin Core element name → values in document order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawHit {
    pub fields: BTreeMap<String, Vec<String>>,
}

impl RawHit {
    pub fn all(&self, key: &str) -> &[String] {
        self.fields.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First value of a possibly multi-valued field.
    pub fn first(&self, key: &str) -> Option<&str> {
        self.all(key).first().map(String::as_str)
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.entry(key.into()).or_default().push(value.into());
    }
}

/// One page of search results.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    /// Total hits the archive reports for the query.
    pub total: usize,
    pub hits: Vec<RawHit>,
}

/// Descriptive metadata for one issue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OaiRecord {
    pub title: Option<String>,
    pub date: Option<String>,
    /// Free-text descriptions; the issue range is one of them.
    pub descriptions: Vec<String>,
}

pub type ArchiveFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ArchiveError>> + Send + 'a>>;
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = ProbeOutcome> + Send + 'a>>;

/// Everything the engine asks of the archive.
///
/// Implementations apply their own per-host rate limiting before every
/// request.
pub trait Archive: Send + Sync {
    /// One page of a structured search. `start` is 1-based.
    fn search<'a>(&'a self, query: &'a str, start: usize, count: usize) -> ArchiveFuture<'a, SearchPage>;

    /// Issues of the series published in `year`.
    fn issues<'a>(&'a self, series: &'a Ark, year: i64) -> ArchiveFuture<'a, Vec<Ark>>;

    fn oai_record<'a>(&'a self, issue: &'a Ark) -> ArchiveFuture<'a, OaiRecord>;

    fn pagination<'a>(&'a self, issue: &'a Ark) -> ArchiveFuture<'a, PageMap>;

    /// Table-of-contents markup, or `None` when the issue has none.
    fn toc<'a>(&'a self, issue: &'a Ark) -> ArchiveFuture<'a, Option<String>>;

    /// Plain-text transcription of physical page `page`.
    fn page_text<'a>(&'a self, issue: &'a Ark, page: u32) -> ArchiveFuture<'a, String>;

    fn ocr_bounds<'a>(&'a self, issue: &'a Ark, page: u32) -> ArchiveFuture<'a, UnscaledPageBounds>;

    /// Whether whole-document PDF delivery works for this identifier.
    fn delivery_probe<'a>(&'a self, issue: &'a Ark) -> ProbeFuture<'a>;

    /// Whether a single page's content can be fetched.
    fn page_probe<'a>(&'a self, issue: &'a Ark, page: u32) -> ProbeFuture<'a>;

    /// Write pages `start..start + count` as one PDF to `dest`.
    fn fetch_pdf<'a>(
        &'a self,
        issue: &'a Ark,
        start: u32,
        count: u32,
        dest: &'a Path,
    ) -> ArchiveFuture<'a, ()>;

    /// Encoded raster of one physical page.
    fn fetch_page_image<'a>(&'a self, issue: &'a Ark, page: u32) -> ArchiveFuture<'a, Vec<u8>>;
}
