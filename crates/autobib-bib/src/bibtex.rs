use autobib_core::{Article, BibliographicRecord, Book, Collection};
use biblatex::{Bibliography, Chunk, Entry, EntryType, Person, Spanned};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{BibError, non_empty, parse_numbers, parse_pages, parse_year};

/// Parse a BibTeX/BibLaTeX database.
///
/// A file the parser rejects as a whole is split at each `@` and the entries
/// are parsed one by one, keeping whatever survives.
pub fn parse_bibtex(content: &str) -> Result<Vec<BibliographicRecord>, BibError> {
    let bibliographies = match Bibliography::parse(content) {
        Ok(bib) => vec![bib],
        Err(e) => {
            tracing::debug!(error = ?e, "bibliography rejected, parsing entries individually");
            parse_individually(content)
        }
    };

    let entries: Vec<&Entry> = bibliographies.iter().flat_map(|b| b.iter()).collect();
    if entries.is_empty() {
        return Err(BibError::Parsing("no BibTeX entries found".into()));
    }
    entries.into_iter().map(convert_entry).collect()
}

fn parse_individually(content: &str) -> Vec<Bibliography> {
    static ENTRY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*@[a-zA-Z]").unwrap());

    let positions: Vec<usize> = ENTRY_RE.find_iter(content).map(|m| m.start()).collect();
    positions
        .iter()
        .enumerate()
        .filter_map(|(i, &start)| {
            let end = positions.get(i + 1).copied().unwrap_or(content.len());
            Bibliography::parse(&content[start..end]).ok()
        })
        .collect()
}

fn convert_entry(entry: &Entry) -> Result<BibliographicRecord, BibError> {
    let title = entry
        .title()
        .ok()
        .map(chunks_to_string)
        .unwrap_or_default();
    let author = authors(entry);
    let year = field(entry, "year")
        .or_else(|| field(entry, "date"))
        .and_then(|y| parse_year(&y));
    let publisher = field(entry, "publisher");
    let editor = field(entry, "editor");

    let record = match entry.entry_type {
        EntryType::Article => BibliographicRecord::Article(Article {
            title,
            journal_title: field(entry, "journaltitle")
                .or_else(|| field(entry, "journal"))
                .unwrap_or_default(),
            author,
            pages: field(entry, "pages")
                .map(|p| parse_pages(&p))
                .unwrap_or_default(),
            year,
            publisher,
            editor,
            volume: field(entry, "volume").and_then(|v| parse_numbers(&v)),
            number: field(entry, "number").and_then(|n| parse_numbers(&n)),
            ..Default::default()
        }),
        EntryType::Book => BibliographicRecord::Book(Book {
            title,
            author,
            editor,
            year,
            publisher,
            ..Default::default()
        }),
        EntryType::Collection => BibliographicRecord::Collection(Collection {
            title,
            author,
            editor,
            year,
            publisher,
            ..Default::default()
        }),
        EntryType::Unknown(ref name) => return Err(BibError::UnsupportedType(name.clone())),
        ref other => {
            return Err(BibError::UnsupportedType(
                format!("{other:?}").to_ascii_lowercase(),
            ));
        }
    };
    Ok(record)
}

fn field(entry: &Entry, key: &str) -> Option<String> {
    entry.get(key).map(chunks_to_string).and_then(non_empty)
}

/// Authors as "Given Family", joined with " and ".
fn authors(entry: &Entry) -> String {
    entry
        .author()
        .unwrap_or_default()
        .iter()
        .filter(|p| p.name != "others")
        .map(format_person)
        .filter(|a| !a.is_empty())
        .collect::<Vec<_>>()
        .join(" and ")
}

fn chunks_to_string(chunks: &[Spanned<Chunk>]) -> String {
    chunks
        .iter()
        .map(|c| match &c.v {
            Chunk::Normal(s) => s.as_str(),
            Chunk::Verbatim(s) => s.as_str(),
            Chunk::Math(s) => s.as_str(),
        })
        .collect::<Vec<_>>()
        .join("")
}

fn format_person(p: &Person) -> String {
    [
        p.given_name.as_str(),
        p.prefix.as_str(),
        p.name.as_str(),
        p.suffix.as_str(),
    ]
    .into_iter()
    .filter(|s| !s.is_empty())
    .collect::<Vec<_>>()
    .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use autobib_core::record::Numbers;

    fn augustin(entry_type: &str, pages: &str) -> String {
        format!(
            r#"
    @{entry_type}{{danielou30:_pour_augus,
      author =       {{Jean Daniélou}},
      title =        {{Pour lire saint Augustin}},
      journaltitle = {{La Vie spirituelle}},
      year =      1930,
      language =  {{french}},
      volume =    24,
      pages =     {pages}}}
    "#
        )
    }

    fn expected(pages: Vec<String>) -> BibliographicRecord {
        BibliographicRecord::Article(Article {
            title: "Pour lire saint Augustin".into(),
            journal_title: "La Vie spirituelle".into(),
            author: "Jean Daniélou".into(),
            pages,
            year: Some(Numbers::One(1930)),
            volume: Some(Numbers::One(24)),
            ..Default::default()
        })
    }

    #[test]
    fn article_with_page_range() {
        let records = parse_bibtex(&augustin("Article", "{135-57}")).unwrap();
        assert_eq!(records, vec![expected((135..=157).map(|p| p.to_string()).collect())]);
    }

    #[test]
    fn article_with_one_page() {
        let records = parse_bibtex(&augustin("Article", "12")).unwrap();
        assert_eq!(records, vec![expected(vec!["12".into()])]);
    }

    #[test]
    fn article_with_roman_pages() {
        let records = parse_bibtex(&augustin("Article", "{i-xi}")).unwrap();
        let roman = ["i", "ii", "iii", "iv", "v", "vi", "vii", "viii", "ix", "x", "xi"];
        assert_eq!(records, vec![expected(roman.iter().map(|s| s.to_string()).collect())]);
    }

    #[test]
    fn journal_field_is_accepted() {
        let bib = r#"@article{k, title = {T}, journal = {Revue thomiste}, author = {Garrigou-Lagrange, Réginald and others}}"#;
        match &parse_bibtex(bib).unwrap()[0] {
            BibliographicRecord::Article(a) => {
                assert_eq!(a.journal_title, "Revue thomiste");
                assert_eq!(a.author, "Réginald Garrigou-Lagrange");
            }
            other => panic!("expected article, got {other:?}"),
        }
    }

    #[test]
    fn book_and_collection() {
        let bib = r#"
@book{summa, title = {Summa theologiae}, author = {Thomas Aquinas}, publisher = {Marietti}, year = {1888}}
@collection{coll, title = {Mélanges}, editor = {Chenu, M.-D.}, date = {1930-05}}
"#;
        let records = parse_bibtex(bib).unwrap();
        assert_eq!(records.len(), 2);
        match &records[0] {
            BibliographicRecord::Book(b) => {
                assert_eq!(b.author, "Thomas Aquinas");
                assert_eq!(b.publisher.as_deref(), Some("Marietti"));
                assert_eq!(b.year, Some(Numbers::One(1888)));
            }
            other => panic!("expected book, got {other:?}"),
        }
        match &records[1] {
            BibliographicRecord::Collection(c) => {
                assert_eq!(c.title, "Mélanges");
                assert_eq!(c.year, Some(Numbers::One(1930)));
                assert!(c.editor.is_some());
            }
            other => panic!("expected collection, got {other:?}"),
        }
    }

    #[test]
    fn other_types_are_rejected() {
        let err = parse_bibtex(&augustin("inbook", "{i-xi}")).unwrap_err();
        assert!(matches!(err, BibError::UnsupportedType(_)));
        assert!(err.to_string().contains("Unsupported"));
    }

    #[test]
    fn nonsense_is_rejected() {
        let err = parse_bibtex("loadanonsensestring").unwrap_err();
        assert!(err.to_string().contains("Unable to parse"));
    }

    #[test]
    fn broken_entries_do_not_sink_the_file() {
        let bib = "@article{ok, title = {Good}, journal = {J}}\n@article{bad, title = {Unclosed\n";
        let records = parse_bibtex(bib).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title(), "Good");
    }
}
