//! Catalog search: query building lives on the record, this module turns raw
//! hits into scored candidates.

use crate::archive::{Archive, RawHit};
use crate::record::{BibliographicRecord, Book, Collection, Journal, Numbers};
use crate::scoring::{Match, normalize, sort_best_first};
use crate::{CoreError, MatchSettings};

/// Records requested per search page.
pub const PAGE_SIZE: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Journal,
    Book,
    Collection,
}

const TYPE_LABELS: &[(&str, Kind)] = &[
    ("publication en serie imprimee", Kind::Journal),
    ("printed serial", Kind::Journal),
    ("monographie imprimee", Kind::Book),
    ("printed monograph", Kind::Book),
    ("recueil", Kind::Collection),
    ("collection", Kind::Collection),
];

fn kind_of(hit: &RawHit) -> Option<Kind> {
    hit.all("type").iter().find_map(|label| {
        let label = normalize(label);
        TYPE_LABELS
            .iter()
            .find(|(known, _)| *known == label)
            .map(|(_, kind)| *kind)
    })
}

/// Expand `"1919-1945"`, `"1919, 1921"` or `"1930"` into years.
pub fn parse_years(date: &str) -> Option<Numbers> {
    let mut years = Vec::new();
    for part in date.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                if let (Ok(s), Ok(e)) = (start.trim().parse::<i64>(), end.trim().parse::<i64>()) {
                    years.extend(s.min(e)..=s.max(e));
                }
            }
            None => {
                if let Ok(y) = part.parse::<i64>() {
                    years.push(y);
                }
            }
        }
    }
    Numbers::from_vec(years)
}

/// Normalize a raw hit into a record of the same shape as the target.
///
/// Multi-valued fields contribute their first value; `type` is scanned for
/// the first label that names a known record kind. Hits with no known kind
/// yield `None`.
pub fn hit_to_candidate(hit: &RawHit) -> Option<BibliographicRecord> {
    let Some(kind) = kind_of(hit) else {
        tracing::debug!(types = ?hit.all("type"), "skipping hit of unknown type");
        return None;
    };
    let text = |key: &str| hit.first(key).map(str::to_string);
    let title = text("title").unwrap_or_default();
    let year = hit.first("date").and_then(parse_years);
    let publisher = text("publisher");
    let ark = text("identifier");
    let author = text("creator").unwrap_or_default();

    Some(match kind {
        Kind::Journal => BibliographicRecord::Journal(Journal {
            journal_title: title,
            year,
            publisher,
            ark,
            ..Default::default()
        }),
        Kind::Book => BibliographicRecord::Book(Book {
            title,
            author,
            year,
            publisher,
            ark,
            ..Default::default()
        }),
        Kind::Collection => BibliographicRecord::Collection(Collection {
            title,
            author,
            year,
            publisher,
            ark,
            ..Default::default()
        }),
    })
}

/// Search the catalog for `target`'s source and score every usable hit.
///
/// Paging stops after `give_up` hits, or as soon as at least
/// `early_stop_after` candidates are scored and one of them beats
/// `skip_threshold`. Results come back best first.
pub async fn search(
    archive: &dyn Archive,
    target: &BibliographicRecord,
    settings: &MatchSettings,
) -> Result<Vec<Match>, CoreError> {
    let source = target.source();
    let query = target.generate_query();
    tracing::info!(query = %query, "catalog search");

    let mut matches = Vec::new();
    let mut examined = 0;
    let mut start = 1;
    'pages: loop {
        let page = archive.search(&query, start, PAGE_SIZE).await?;
        if page.hits.is_empty() {
            break;
        }
        let fetched = page.hits.len();
        for hit in page.hits {
            examined += 1;
            if let Some(candidate) = hit_to_candidate(&hit) {
                matches.push(Match::new(source.clone(), candidate));
            }
            if matches.len() >= settings.early_stop_after
                && matches.iter().any(|m| m.score() > settings.skip_threshold)
            {
                tracing::debug!(examined, "good enough candidate found, stopping early");
                break 'pages;
            }
            if examined >= settings.give_up {
                tracing::debug!(examined, "giving up on catalog search");
                break 'pages;
            }
        }
        start += fetched;
        if start > page.total {
            break;
        }
    }

    sort_best_first(&mut matches);
    Ok(matches)
}
