//! Bibliography readers producing [`BibliographicRecord`]s.
//!
//! Two input formats are understood: BibTeX/BibLaTeX databases and RIS
//! exports. Only articles, books and collections are accepted; anything else
//! is a parse error so that a batch never silently drops an entry.

use std::path::Path;

use autobib_core::pages::deprettify;
use autobib_core::record::Numbers;
use autobib_core::{BibliographicRecord, CoreError};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

mod bibtex;
mod ris;

pub use bibtex::parse_bibtex;
pub use ris::parse_ris;

#[derive(Error, Debug)]
pub enum BibError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unable to parse: {0}")]
    Parsing(String),
    #[error("Unsupported entry type: {0}")]
    UnsupportedType(String),
    #[error("Input is not bibtex or ris: {0}")]
    UnknownFormat(String),
}

impl From<BibError> for CoreError {
    fn from(e: BibError) -> Self {
        CoreError::Parsing(e.to_string())
    }
}

/// Which reader to use for a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Bibtex,
    Ris,
}

impl InputFormat {
    /// Detect the format from the file extension.
    pub fn from_path(path: &Path) -> Result<Self, BibError> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "bib" | "bibtex" => Ok(InputFormat::Bibtex),
            "ris" => Ok(InputFormat::Ris),
            _ => Err(BibError::UnknownFormat(path.display().to_string())),
        }
    }
}

/// Read and parse a bibliography file, picking the reader by extension.
pub fn parse_path(path: &Path) -> Result<Vec<BibliographicRecord>, BibError> {
    let format = InputFormat::from_path(path)?;
    let content = std::fs::read_to_string(path)?;
    match format {
        InputFormat::Bibtex => {
            tracing::debug!(path = %path.display(), "detected bibtex");
            parse_bibtex(&content)
        }
        InputFormat::Ris => {
            tracing::debug!(path = %path.display(), "detected ris");
            parse_ris(&content)
        }
    }
}

static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{4}").unwrap());

/// First four-digit year in a `year` or `date` value.
pub(crate) fn parse_year(raw: &str) -> Option<Numbers> {
    YEAR_RE
        .find(raw)
        .and_then(|m| m.as_str().parse().ok())
        .map(Numbers::One)
}

/// Volume or issue: `24`, `3-4` or `1, 3`.
pub(crate) fn parse_numbers(raw: &str) -> Option<Numbers> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut values = Vec::new();
    for part in raw.split(',').map(str::trim) {
        let normalized = part.replace("--", "-").replace('–', "-");
        match normalized.split_once('-') {
            Some((a, b)) => {
                let (Ok(a), Ok(b)) = (a.trim().parse::<i64>(), b.trim().parse::<i64>()) else {
                    tracing::debug!(value = raw, "ignoring non-numeric range");
                    return None;
                };
                values.extend(a.min(b)..=a.max(b));
            }
            None => match part.parse::<i64>() {
                Ok(n) => values.push(n),
                Err(_) => {
                    tracing::debug!(value = raw, "ignoring non-numeric value");
                    return None;
                }
            },
        }
    }
    Numbers::from_vec(values)
}

/// Page labels from a `pages` value; roman ranges stay roman.
pub(crate) fn parse_pages(raw: &str) -> Vec<String> {
    deprettify(&raw.replace('\u{2014}', "-"))
}

/// `None` for empty strings.
pub(crate) fn non_empty(s: String) -> Option<String> {
    let s = s.trim().to_string();
    (!s.is_empty()).then_some(s)
}
