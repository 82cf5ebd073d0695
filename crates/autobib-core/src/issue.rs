//! One archival issue: its identifier, parsed description and page map.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::archive::Ark;
use crate::record::Numbers;

/// Ordered logical label → physical ordinal pairs, as the archive declares
/// them. Labels may repeat or jump around in front matter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMap {
    entries: Vec<(String, u32)>,
}

impl PageMap {
    pub fn new(entries: Vec<(String, u32)>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[(String, u32)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Physical ordinal of the first page printed as `label`.
    pub fn physical(&self, label: &str) -> Option<u32> {
        let label = label.trim();
        self.entries
            .iter()
            .find(|(l, _)| l.trim().eq_ignore_ascii_case(label))
            .map(|(_, p)| *p)
    }

    /// Physical ordinals for each label that the map knows, in order.
    pub fn physical_range(&self, labels: &[String]) -> Vec<u32> {
        labels.iter().filter_map(|l| self.physical(l)).collect()
    }

    /// Highest physical ordinal in the issue.
    pub fn last_physical(&self) -> Option<u32> {
        self.entries.iter().map(|(_, p)| *p).max()
    }

    /// Highest arabic label, i.e. the last printed page of the issue body.
    pub fn last_label(&self) -> Option<u32> {
        self.entries
            .iter()
            .filter_map(|(l, _)| l.trim().parse::<u32>().ok())
            .max()
    }
}

/// Volume, number and year parsed from an issue's free-text description.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueDescriptor {
    pub ark: Option<Ark>,
    pub year: Option<Numbers>,
    pub volume: Option<Numbers>,
    pub number: Option<Numbers>,
}

static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(\d{4})").unwrap());
static VOLUME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bT(\d+)").unwrap());
static NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bN(\d+)").unwrap());
static HALVES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"-\s*\d{4}").unwrap());

#[derive(Debug, Default)]
struct Half {
    year: Option<i64>,
    volume: Option<i64>,
    number: Option<i64>,
}

fn capture(re: &Regex, s: &str) -> Option<i64> {
    re.captures(s).and_then(|c| c[1].parse().ok())
}

fn parse_half(s: &str) -> Half {
    Half {
        year: capture(&YEAR_RE, s),
        volume: capture(&VOLUME_RE, s),
        number: capture(&NUMBER_RE, s),
    }
}

/// A field becomes a set only when both halves carry it and they differ.
fn combine(start: Option<i64>, end: Option<i64>) -> Option<Numbers> {
    match (start, end) {
        (Some(s), Some(e)) => Some(Numbers::range(s, e)),
        (Some(v), None) | (None, Some(v)) => Some(Numbers::One(v)),
        (None, None) => None,
    }
}

impl IssueDescriptor {
    /// Parse descriptions such as `"1922/10 (A4,T7,N37)-1923/03 (A4,T7,N42)."`.
    ///
    /// `T<n>` is the volume and `N<n>` the issue number. A range is split into
    /// halves and each field is expanded on its own.
    pub fn parse(description: &str) -> Self {
        let description = description.trim().trim_end_matches('.');
        if description.is_empty() {
            return Self::default();
        }
        let (start, end) = match HALVES_RE.find(description) {
            Some(m) => (
                parse_half(&description[..m.start()]),
                parse_half(&description[m.start() + 1..]),
            ),
            None => (parse_half(description), Half::default()),
        };
        Self {
            ark: None,
            year: combine(start.year, end.year),
            volume: combine(start.volume, end.volume),
            number: combine(start.number, end.number),
        }
    }

    pub fn with_ark(mut self, ark: Ark) -> Self {
        self.ark = Some(ark);
        self
    }
}
