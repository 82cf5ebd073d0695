//! Confirm an article's presence in an issue from the page transcriptions.

use crate::CoreError;
use crate::archive::{Archive, Ark};
use crate::issue::PageMap;
use crate::record::Article;
use crate::scoring::{normalize, similarity};

/// Largest edit distance tolerated when looking for the title.
pub const TITLE_MAX_DISTANCE: usize = 2;
/// Largest edit distance tolerated when looking for the author.
pub const AUTHOR_MAX_DISTANCE: usize = 5;
/// Minimum similarity between the author and the text it matched.
pub const AUTHOR_MIN_RATIO: f64 = 0.8;

/// An approximate occurrence of a pattern inside a text, in char offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuzzyMatch {
    pub start: usize,
    pub end: usize,
    pub distance: usize,
}

/// Best approximate occurrence of `needle` in `haystack` within `max_distance`
/// edits (Sellers' algorithm). Ties go to the leftmost match.
pub fn fuzzy_find(needle: &str, haystack: &str, max_distance: usize) -> Option<FuzzyMatch> {
    let pattern: Vec<char> = needle.chars().collect();
    let text: Vec<char> = haystack.chars().collect();
    if pattern.is_empty() {
        return None;
    }
    let m = pattern.len();

    // One DP column per text position; `*_start[i]` is where the alignment
    // ending at pattern row i began in the text.
    let mut prev: Vec<usize> = (0..=m).collect();
    let mut prev_start: Vec<usize> = vec![0; m + 1];
    let mut best: Option<FuzzyMatch> = None;

    for (j, &c) in text.iter().enumerate() {
        let mut cur = vec![0; m + 1];
        let mut cur_start = vec![j + 1; m + 1];
        for i in 1..=m {
            let substitution = prev[i - 1] + usize::from(pattern[i - 1] != c);
            let deletion = prev[i] + 1;
            let insertion = cur[i - 1] + 1;
            let (cost, origin) = if substitution <= deletion && substitution <= insertion {
                (substitution, prev_start[i - 1])
            } else if deletion <= insertion {
                (deletion, prev_start[i])
            } else {
                (insertion, cur_start[i - 1])
            };
            cur[i] = cost;
            cur_start[i] = origin;
        }
        if cur[m] <= max_distance && best.is_none_or(|b| cur[m] < b.distance) {
            best = Some(FuzzyMatch {
                start: cur_start[m],
                end: j + 1,
                distance: cur[m],
            });
        }
        prev = cur;
        prev_start = cur_start;
    }
    best
}

fn slice_chars(s: &str, start: usize, end: usize) -> String {
    s.chars().skip(start).take(end - start).collect()
}

fn title_on_page(title: &str, text: &str) -> bool {
    fuzzy_find(title, text, TITLE_MAX_DISTANCE).is_some()
}

fn author_on_page(author: &str, text: &str) -> bool {
    match fuzzy_find(author, text, AUTHOR_MAX_DISTANCE) {
        Some(m) => similarity(author, &slice_chars(text, m.start, m.end)) > AUTHOR_MIN_RATIO,
        None => false,
    }
}

/// Whether `target` starts in `issue`.
///
/// The title must appear on the page printed as the target's first page. The
/// author must appear on that page or on the one printed as its last page.
pub async fn confirm_in_issue(
    archive: &dyn Archive,
    issue: &Ark,
    pages: &PageMap,
    target: &Article,
) -> Result<bool, CoreError> {
    let Some(first_label) = target.pages.first() else {
        return Ok(false);
    };
    let Some(first_physical) = pages.physical(first_label) else {
        tracing::debug!(ark = %issue, page = %first_label, "first page not in page map");
        return Ok(false);
    };

    let first_text = normalize(&archive.page_text(issue, first_physical).await?);
    if !title_on_page(&normalize(&target.title), &first_text) {
        tracing::debug!(ark = %issue, "title not found on first page");
        return Ok(false);
    }

    let author = normalize(&target.author);
    if author_on_page(&author, &first_text) {
        return Ok(true);
    }

    let last_physical = target
        .pages
        .last()
        .filter(|last| *last != first_label)
        .and_then(|last| pages.physical(last));
    if let Some(last_physical) = last_physical {
        let last_text = normalize(&archive.page_text(issue, last_physical).await?);
        if author_on_page(&author, &last_text) {
            return Ok(true);
        }
    }
    tracing::debug!(ark = %issue, "author not found on first or last page");
    Ok(false)
}
