use std::collections::HashMap;

use autobib_core::{Article, BibliographicRecord, Book, Collection};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{BibError, non_empty, parse_numbers, parse_pages, parse_year};

/// `TAG  - value`; the value may be empty (as on `ER  - `).
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([A-Z][A-Z0-9])  -(?: (.*))?$").unwrap());

/// Tags of one RIS record, in order of appearance.
#[derive(Debug, Default)]
struct RisRecord {
    fields: HashMap<String, Vec<String>>,
}

impl RisRecord {
    fn push(&mut self, tag: &str, value: &str) {
        self.fields
            .entry(tag.to_string())
            .or_default()
            .push(value.trim().to_string());
    }

    fn first(&self, tags: &[&str]) -> Option<String> {
        tags.iter()
            .filter_map(|t| self.fields.get(*t))
            .flat_map(|v| v.iter())
            .find(|v| !v.is_empty())
            .cloned()
    }

    fn all(&self, tags: &[&str]) -> Vec<String> {
        tags.iter()
            .filter_map(|t| self.fields.get(*t))
            .flat_map(|v| v.iter())
            .filter(|v| !v.is_empty())
            .cloned()
            .collect()
    }
}

/// Split RIS text into records. Lines that are not tags continue the
/// previous value.
fn read_records(content: &str) -> Vec<RisRecord> {
    let mut records = Vec::new();
    let mut current: Option<RisRecord> = None;
    let mut last_tag: Option<String> = None;

    for line in content.lines() {
        let line = line.trim_end_matches('\r');
        let trimmed = line.trim_start();
        let Some(caps) = TAG_RE.captures(trimmed) else {
            if let (Some(rec), Some(tag)) = (current.as_mut(), last_tag.as_deref()) {
                if let Some(v) = rec.fields.get_mut(tag).and_then(|v| v.last_mut()) {
                    if !trimmed.is_empty() {
                        v.push(' ');
                        v.push_str(trimmed.trim());
                    }
                }
            }
            continue;
        };
        let tag = &caps[1];
        let value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        match tag {
            "TY" => {
                if let Some(rec) = current.take() {
                    records.push(rec);
                }
                let mut rec = RisRecord::default();
                rec.push(tag, value);
                current = Some(rec);
            }
            "ER" => {
                if let Some(rec) = current.take() {
                    records.push(rec);
                }
            }
            _ => {
                if let Some(rec) = current.as_mut() {
                    rec.push(tag, value);
                }
            }
        }
        last_tag = Some(tag.to_string());
    }
    if let Some(rec) = current {
        records.push(rec);
    }
    records
}

/// Parse RIS records.
pub fn parse_ris(content: &str) -> Result<Vec<BibliographicRecord>, BibError> {
    let records = read_records(content);
    if records.is_empty() {
        return Err(BibError::Parsing("no RIS records found".into()));
    }
    records.iter().map(convert_record).collect()
}

fn convert_record(rec: &RisRecord) -> Result<BibliographicRecord, BibError> {
    let kind = rec.first(&["TY"]).unwrap_or_default();
    let title = rec.first(&["TI", "T1"]).unwrap_or_default();
    let author = rec.all(&["AU", "A1"]).join(" and ");
    let year = rec
        .first(&["PY", "Y1", "DA"])
        .and_then(|y| parse_year(&y));
    let publisher = rec.first(&["PB"]).and_then(non_empty);
    let editor = rec.first(&["ED", "A2"]).and_then(non_empty);

    let record = match kind.as_str() {
        "JOUR" | "ART" => BibliographicRecord::Article(Article {
            title,
            journal_title: rec.first(&["T2", "JO", "JF", "JA"]).unwrap_or_default(),
            author,
            pages: pages(rec),
            year,
            publisher,
            editor,
            volume: rec.first(&["VL"]).and_then(|v| parse_numbers(&v)),
            number: rec.first(&["IS"]).and_then(|n| parse_numbers(&n)),
            ..Default::default()
        }),
        "BOOK" => BibliographicRecord::Book(Book {
            title,
            author,
            editor,
            year,
            publisher,
            ..Default::default()
        }),
        "COLL" | "EDBOOK" => BibliographicRecord::Collection(Collection {
            title,
            author,
            editor,
            year,
            publisher,
            ..Default::default()
        }),
        other => return Err(BibError::UnsupportedType(other.to_string())),
    };
    Ok(record)
}

/// `SP`/`EP` as a range; `SP` alone may itself be a range.
fn pages(rec: &RisRecord) -> Vec<String> {
    match (rec.first(&["SP"]), rec.first(&["EP"])) {
        (Some(sp), Some(ep)) => parse_pages(&format!("{sp}-{ep}")),
        (Some(sp), None) => parse_pages(&sp),
        (None, Some(ep)) => parse_pages(&ep),
        (None, None) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autobib_core::record::Numbers;

    const BREMOND: &str = "
TY  - JOUR
TI  - HENRI BREMOND E IL MODERNISMO
AU  - Savignano, Armando
C1  - Full publication date: ottobre-dicembre 1982
DB  - JSTOR
EP  - 649
IS  - 4
PB  - Vita e Pensiero – Pubblicazioni dell’Università Cattolica del Sacro Cuore
PY  - 1982
SN  - 00356247, 18277926
SP  - 627
T2  - Rivista di Filosofia Neo-Scolastica
UR  - http://www.jstor.org/stable/43061043
VL  - 74
Y2  - 2021/05/07/
ER  -
    ";

    #[test]
    fn journal_article() {
        let records = parse_ris(BREMOND).unwrap();
        let expected = BibliographicRecord::Article(Article {
            title: "HENRI BREMOND E IL MODERNISMO".into(),
            journal_title: "Rivista di Filosofia Neo-Scolastica".into(),
            author: "Savignano, Armando".into(),
            pages: (627..=649).map(|p| p.to_string()).collect(),
            year: Some(Numbers::One(1982)),
            publisher: Some(
                "Vita e Pensiero – Pubblicazioni dell’Università Cattolica del Sacro Cuore".into(),
            ),
            volume: Some(Numbers::One(74)),
            number: Some(Numbers::One(4)),
            ..Default::default()
        });
        assert_eq!(records, vec![expected]);
    }

    #[test]
    fn unsupported_reference_type() {
        let err = parse_ris(&BREMOND.replace("TY  - JOUR", "TY  - ABST")).unwrap_err();
        assert!(matches!(err, BibError::UnsupportedType(ref t) if t == "ABST"));
    }

    #[test]
    fn nonsense_is_rejected() {
        let err = parse_ris("loadanonsensestring").unwrap_err();
        assert!(err.to_string().contains("Unable to parse"));
    }

    #[test]
    fn several_records_and_authors() {
        let ris = "TY  - BOOK\r\nTI  - Summa\r\nAU  - Thomas\r\nAU  - Anon\r\nER  - \r\n\
                   TY  - EDBOOK\r\nTI  - Mélanges\r\nED  - Chenu, M.-D.\r\nDA  - 1930/05\r\nER  - \r\n";
        let records = parse_ris(ris).unwrap();
        assert_eq!(records.len(), 2);
        match &records[0] {
            BibliographicRecord::Book(b) => assert_eq!(b.author, "Thomas and Anon"),
            other => panic!("expected book, got {other:?}"),
        }
        match &records[1] {
            BibliographicRecord::Collection(c) => {
                assert_eq!(c.editor.as_deref(), Some("Chenu, M.-D."));
                assert_eq!(c.year, Some(Numbers::One(1930)));
            }
            other => panic!("expected collection, got {other:?}"),
        }
    }

    #[test]
    fn continuation_lines_extend_the_value() {
        let ris = "TY  - JOUR\nTI  - A very long\n  title indeed\nT2  - Revue\nSP  - 10-12\nER  - \n";
        match &parse_ris(ris).unwrap()[0] {
            BibliographicRecord::Article(a) => {
                assert_eq!(a.title, "A very long title indeed");
                assert_eq!(a.pages, vec!["10", "11", "12"]);
            }
            other => panic!("expected article, got {other:?}"),
        }
    }
}
