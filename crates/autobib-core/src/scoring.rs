//! Field-by-field fuzzy comparison of a target record against a candidate.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::record::{BibliographicRecord, Numbers};

/// Strip diacritics, case-fold and collapse whitespace.
pub fn normalize(s: &str) -> String {
    let stripped: String = s
        .nfkd()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
        .collect();
    stripped
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized similarity ratio in `[0, 1]`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let (a, b) = (normalize(a), normalize(b));
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    rapidfuzz::fuzz::ratio(a.chars(), b.chars())
}

/// A comparable field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Number(i64),
    Numbers(Vec<i64>),
    Labels(Vec<String>),
}

impl From<&Numbers> for FieldValue {
    fn from(n: &Numbers) -> Self {
        match n {
            Numbers::One(v) => FieldValue::Number(*v),
            Numbers::Many(v) => FieldValue::Numbers(v.clone()),
        }
    }
}

fn push_text(out: &mut Vec<(&'static str, FieldValue)>, name: &'static str, value: &str) {
    if !value.trim().is_empty() {
        out.push((name, FieldValue::Text(value.to_string())));
    }
}

fn push_opt_text(out: &mut Vec<(&'static str, FieldValue)>, name: &'static str, value: &Option<String>) {
    if let Some(v) = value {
        push_text(out, name, v);
    }
}

fn push_numbers(out: &mut Vec<(&'static str, FieldValue)>, name: &'static str, value: &Option<Numbers>) {
    match value {
        Some(Numbers::Many(v)) if v.is_empty() => {}
        Some(n) => out.push((name, n.into())),
        None => {}
    }
}

/// The non-empty scorable fields of a record in a fixed order.
///
/// Archive identifiers and physical pages are bookkeeping, not evidence,
/// and are never compared.
pub fn fields(record: &BibliographicRecord) -> Vec<(&'static str, FieldValue)> {
    let mut out = Vec::new();
    match record {
        BibliographicRecord::Article(a) => {
            push_text(&mut out, "title", &a.title);
            push_text(&mut out, "journal_title", &a.journal_title);
            push_text(&mut out, "author", &a.author);
            if !a.pages.is_empty() {
                out.push(("pages", FieldValue::Labels(a.pages.clone())));
            }
            push_numbers(&mut out, "year", &a.year);
            push_opt_text(&mut out, "publisher", &a.publisher);
            push_opt_text(&mut out, "editor", &a.editor);
            push_numbers(&mut out, "volume", &a.volume);
            push_numbers(&mut out, "number", &a.number);
        }
        BibliographicRecord::Book(b) => {
            push_text(&mut out, "title", &b.title);
            push_text(&mut out, "author", &b.author);
            push_opt_text(&mut out, "editor", &b.editor);
            push_numbers(&mut out, "year", &b.year);
            push_opt_text(&mut out, "publisher", &b.publisher);
        }
        BibliographicRecord::Collection(c) => {
            push_text(&mut out, "title", &c.title);
            push_text(&mut out, "author", &c.author);
            push_opt_text(&mut out, "editor", &c.editor);
            push_numbers(&mut out, "year", &c.year);
            push_opt_text(&mut out, "publisher", &c.publisher);
        }
        BibliographicRecord::Journal(j) => {
            push_text(&mut out, "journal_title", &j.journal_title);
            push_numbers(&mut out, "year", &j.year);
            push_opt_text(&mut out, "publisher", &j.publisher);
            push_numbers(&mut out, "volume", &j.volume);
            push_numbers(&mut out, "number", &j.number);
        }
    }
    out
}

/// Score for a field the candidate does not have.
const MISSING: f64 = 0.5;

/// Score one field.
///
/// # Panics
///
/// On a combination of value types that cannot be compared, e.g. text
/// against a number. That is a bug in record construction.
pub fn score_field(name: &str, target: &FieldValue, candidate: Option<&FieldValue>) -> f64 {
    let Some(candidate) = candidate else {
        return MISSING;
    };
    match (target, candidate) {
        (FieldValue::Text(a), FieldValue::Text(b)) => similarity(a, b),
        (FieldValue::Number(a), FieldValue::Number(b)) => (a == b) as u8 as f64,
        (FieldValue::Number(a), FieldValue::Numbers(bs)) => bs.contains(a) as u8 as f64,
        (FieldValue::Numbers(a), FieldValue::Numbers(bs)) => {
            let present = a.iter().filter(|x| bs.contains(x)).count();
            present as f64 / a.len() as f64
        }
        (FieldValue::Numbers(a), FieldValue::Number(b)) => {
            if a.contains(b) {
                1.0 / a.len() as f64
            } else {
                0.0
            }
        }
        (FieldValue::Labels(a), FieldValue::Labels(bs)) => {
            let present = a.iter().filter(|x| bs.contains(x)).count();
            present as f64 / a.len() as f64
        }
        (t, c) => unreachable!("cannot compare field {name}: {t:?} against {c:?}"),
    }
}

/// Arithmetic mean of the per-field scores over the target's fields.
pub fn score(target: &BibliographicRecord, candidate: &BibliographicRecord) -> f64 {
    let target_fields = fields(target);
    if target_fields.is_empty() {
        return 0.0;
    }
    let candidate_fields = fields(candidate);
    let total: f64 = target_fields
        .iter()
        .map(|(name, value)| {
            let other = candidate_fields
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v);
            score_field(name, value, other)
        })
        .sum();
    total / target_fields.len() as f64
}

/// Ranking key for selecting the best of several matches.
///
/// Two keys are equal exactly when their scores are, regardless of which
/// records produced them.
#[derive(Debug, Clone, Copy)]
pub struct ScoreRank(pub f64);

impl PartialEq for ScoreRank {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScoreRank {}

impl PartialOrd for ScoreRank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoreRank {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// A target paired with a candidate and their score, computed once.
///
/// Matches are compared only through [`Match::rank`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Match {
    pub target: BibliographicRecord,
    pub candidate: BibliographicRecord,
    score: f64,
}

impl Match {
    pub fn new(target: BibliographicRecord, candidate: BibliographicRecord) -> Self {
        let score = score(&target, &candidate);
        Self {
            target,
            candidate,
            score,
        }
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn rank(&self) -> ScoreRank {
        ScoreRank(self.score)
    }
}

/// Sort best first. Ties keep their original order.
pub fn sort_best_first(matches: &mut [Match]) {
    matches.sort_by(|a, b| b.rank().cmp(&a.rank()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Article, Book, Journal};

    fn journal(title: &str, year: Numbers) -> BibliographicRecord {
        BibliographicRecord::Journal(Journal {
            journal_title: title.into(),
            year: Some(year),
            ..Default::default()
        })
    }

    #[test]
    fn normalize_strips_accents_and_case() {
        assert_eq!(normalize("  Ascétique   et MYSTIQUE "), "ascetique et mystique");
    }

    #[test]
    fn self_match_is_perfect() {
        let article = BibliographicRecord::Article(Article {
            title: "Pour lire saint Augustin".into(),
            journal_title: "La vie spirituelle".into(),
            author: "M.-D. Chenu".into(),
            pages: vec!["135".into(), "136".into()],
            year: Some(Numbers::One(1930)),
            volume: Some(Numbers::Many(vec![23, 24])),
            ..Default::default()
        });
        assert_eq!(score(&article, &article), 1.0);
        let j = journal("Revue", Numbers::range(1919, 1945));
        assert_eq!(score(&j, &j), 1.0);
    }

    #[test]
    fn missing_field_is_neutral() {
        let target = BibliographicRecord::Book(Book {
            title: "X".into(),
            author: String::new(),
            year: Some(Numbers::One(1930)),
            ..Default::default()
        });
        let candidate = BibliographicRecord::Book(Book {
            title: "X".into(),
            author: String::new(),
            ..Default::default()
        });
        assert_eq!(score(&target, &candidate), 0.75);
    }

    #[test]
    fn journal_title_prefix_with_year_range() {
        let target = journal("La vie spirituelle", Numbers::One(1930));
        let candidate = journal(
            "La vie spirituelle, ascétique et mystique",
            Numbers::range(1919, 1945),
        );
        assert!(score(&target, &candidate) > 0.7);
    }

    #[test]
    fn book_without_editor_on_candidate() {
        let target = BibliographicRecord::Book(Book {
            title: "Somme théologique".into(),
            author: "Thomas d'Aquin".into(),
            editor: Some("Vrin".into()),
            year: Some(Numbers::One(1925)),
            ..Default::default()
        });
        let candidate = BibliographicRecord::Book(Book {
            title: "Somme theologique".into(),
            author: "Thomas d'Aquin".into(),
            year: Some(Numbers::One(1925)),
            ..Default::default()
        });
        assert!(score(&target, &candidate) > 0.7);
    }

    #[test]
    fn number_rules() {
        let one = FieldValue::Number(7);
        assert_eq!(score_field("v", &one, Some(&FieldValue::Number(7))), 1.0);
        assert_eq!(score_field("v", &one, Some(&FieldValue::Number(8))), 0.0);
        assert_eq!(score_field("v", &one, Some(&FieldValue::Numbers(vec![6, 7]))), 1.0);
        assert_eq!(score_field("v", &one, Some(&FieldValue::Numbers(vec![1, 2]))), 0.0);
        assert_eq!(score_field("v", &one, None), 0.5);
    }

    #[test]
    fn set_rules() {
        let set = FieldValue::Numbers(vec![1922, 1923]);
        assert_eq!(score_field("y", &set, Some(&FieldValue::Numbers(vec![1923, 1924]))), 0.5);
        assert_eq!(score_field("y", &set, Some(&FieldValue::Number(1922))), 0.5);
        assert_eq!(score_field("y", &set, Some(&FieldValue::Number(1930))), 0.0);
    }

    #[test]
    #[should_panic(expected = "cannot compare field")]
    fn type_mismatch_panics() {
        score_field("x", &FieldValue::Text("a".into()), Some(&FieldValue::Number(1)));
    }

    #[test]
    fn equal_scores_rank_equal() {
        let a = Match::new(
            journal("A", Numbers::One(1900)),
            journal("A", Numbers::One(1900)),
        );
        let b = Match::new(
            journal("B", Numbers::One(1901)),
            journal("B", Numbers::One(1901)),
        );
        assert_ne!(a.candidate, b.candidate);
        assert_eq!(a.rank(), b.rank());
        assert_eq!(a.rank().cmp(&b.rank()), Ordering::Equal);
    }

    #[test]
    fn sort_puts_best_first() {
        let target = journal("La vie spirituelle", Numbers::One(1930));
        let mut matches = vec![
            Match::new(target.clone(), journal("Etudes", Numbers::One(1930))),
            Match::new(target.clone(), target.clone()),
        ];
        sort_best_first(&mut matches);
        assert_eq!(matches[0].score(), 1.0);
    }

    #[test]
    fn tied_matches_keep_input_order() {
        let mut matches = vec![
            Match::new(journal("A", Numbers::One(1900)), journal("A", Numbers::One(1900))),
            Match::new(journal("B", Numbers::One(1901)), journal("B", Numbers::One(1901))),
        ];
        sort_best_first(&mut matches);
        assert_eq!(matches[0].candidate, journal("A", Numbers::One(1900)));
        assert_eq!(matches[1].candidate, journal("B", Numbers::One(1901)));
    }
}
