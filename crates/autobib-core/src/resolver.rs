//! Resolution: from a fuzzy article description to an issue identifier and
//! a physical page range.
//!
//! The engine runs through [`ResolutionState`]s:
//!
//! 1. the journal's series identifier is found through the catalog,
//! 2. issues published around the target year are enumerated,
//! 3. each issue yields article candidates from its table of contents or,
//!    without one, from an OCR check of the printed pages,
//! 4. the best candidate whose first page can actually be fetched wins.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::archive::{Archive, Ark};
use crate::cache::{CacheTable, key_for};
use crate::catalog::{self, parse_years};
use crate::context::RunContext;
use crate::issue::{IssueDescriptor, PageMap};
use crate::locate;
use crate::record::{Article, BibliographicRecord};
use crate::scoring::{Match, sort_best_first};
use crate::toc::{TocLine, parse_xml_toc};
use crate::{CoreError, MatchSettings};

/// Where a resolution currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionState {
    Unresolved,
    IssueCandidatesEnumerated,
    ArticleCandidatesScored,
    Resolved,
    Failed,
}

/// The outcome of a successful resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// The issue holding the article.
    pub ark: Ark,
    /// The winning candidate, with its logical and physical pages.
    pub candidate: Article,
    pub score: f64,
    pub physical_pages: Vec<u32>,
    #[serde(skip)]
    pub from_cache: bool,
}

impl Resolution {
    pub fn first_page(&self) -> Option<u32> {
        self.physical_pages.first().copied()
    }

    pub fn last_page(&self) -> Option<u32> {
        self.physical_pages.last().copied()
    }
}

/// Resolves one target against the archive held by a [`RunContext`].
pub struct Resolver<'a> {
    ctx: &'a RunContext,
    state: ResolutionState,
}

impl<'a> Resolver<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        Self {
            ctx,
            state: ResolutionState::Unresolved,
        }
    }

    pub fn state(&self) -> ResolutionState {
        self.state
    }

    fn transition(&mut self, next: ResolutionState) {
        tracing::debug!(from = ?self.state, to = ?next, "resolution state");
        self.state = next;
    }

    fn archive(&self) -> &dyn Archive {
        self.ctx.archive.as_ref()
    }

    fn matching(&self) -> &MatchSettings {
        &self.ctx.settings.matching
    }

    /// Resolve `target` to an issue and page range.
    ///
    /// Only articles can be resolved. Any failure leaves the resolver in
    /// [`ResolutionState::Failed`].
    pub async fn resolve(&mut self, target: &BibliographicRecord) -> Result<Resolution, CoreError> {
        let result = self.run(target).await;
        match &result {
            Ok(_) => self.transition(ResolutionState::Resolved),
            Err(e) => {
                tracing::info!(title = target.title(), error = %e, "resolution failed");
                self.transition(ResolutionState::Failed);
            }
        }
        result
    }

    async fn run(&mut self, target: &BibliographicRecord) -> Result<Resolution, CoreError> {
        let BibliographicRecord::Article(article) = target else {
            return Err(CoreError::UnsupportedRecordKind(target.kind()));
        };

        let match_key = key_for(target)?;
        if !self.ctx.settings.ignore_cache
            && let Some(mut cached) = self.ctx.cache.get::<Resolution>(CacheTable::Match, &match_key)
        {
            tracing::info!(ark = %cached.ark, "resolution served from cache");
            cached.from_cache = true;
            return Ok(cached);
        }

        let series = self.series_ark(target).await?;
        let issues = self.enumerate_issues(&series, article).await?;
        self.transition(ResolutionState::IssueCandidatesEnumerated);

        let candidates = self.score_issues(target, article, &issues).await?;
        self.transition(ResolutionState::ArticleCandidatesScored);

        let resolution = self.select(candidates).await?;
        self.ctx.cache.set(CacheTable::Match, &match_key, &resolution)?;
        tracing::info!(
            ark = %resolution.ark,
            score = resolution.score,
            first = ?resolution.first_page(),
            last = ?resolution.last_page(),
            "resolved"
        );
        Ok(resolution)
    }

    /// The journal's series identifier: given on the record, cached, or
    /// found through the catalog.
    async fn series_ark(&self, target: &BibliographicRecord) -> Result<Ark, CoreError> {
        let source = target.source();
        if let Some(given) = source.ark() {
            return Ark::parse(given);
        }

        let key = key_for(&source)?;
        if !self.ctx.settings.ignore_cache
            && let Some(ark) = self.ctx.cache.get::<Ark>(CacheTable::Ark, &key)
        {
            return Ok(ark);
        }

        let matches = catalog::search(self.archive(), target, self.matching()).await?;
        let min_confidence = self.matching().min_confidence;
        let ark = matches
            .iter()
            .filter(|m| m.score() >= min_confidence)
            .find_map(|m| m.candidate.ark().and_then(|a| Ark::parse(a).ok()))
            .ok_or_else(|| {
                CoreError::Matching(format!("no catalog record for {:?}", source.title()))
            })?;
        tracing::debug!(ark = %ark, "series identified");
        self.ctx.cache.set(CacheTable::Ark, &key, &ark)?;
        Ok(ark)
    }

    /// Issues of `series` published within a year of the target's years.
    ///
    /// Years whose lookup fails are skipped.
    async fn enumerate_issues(&self, series: &Ark, article: &Article) -> Result<Vec<Ark>, CoreError> {
        let years = candidate_years(article)
            .ok_or_else(|| CoreError::Matching("target has no year".into()))?;

        let mut issues: Vec<Ark> = Vec::new();
        let mut any_succeeded = false;
        for year in years {
            match self.archive().issues(series, year).await {
                Ok(found) => {
                    any_succeeded = true;
                    for issue in found {
                        if !issues.contains(&issue) {
                            issues.push(issue);
                        }
                    }
                }
                Err(e) => tracing::debug!(ark = %series, year, error = %e, "skipping year"),
            }
        }
        if !any_succeeded || issues.is_empty() {
            return Err(CoreError::Matching("no matching issues".into()));
        }
        tracing::debug!(ark = %series, issues = issues.len(), "issues enumerated");
        Ok(issues)
    }

    /// Candidates from every issue, best first, cut to `max_candidates`.
    async fn score_issues(
        &self,
        target: &BibliographicRecord,
        article: &Article,
        issues: &[Ark],
    ) -> Result<Vec<Match>, CoreError> {
        let settings = self.matching();
        let mut matches: Vec<Match> = Vec::new();
        for issue in issues {
            if let Some(candidate) = self.issue_candidate(issue, article).await? {
                matches.push(Match::new(
                    target.clone(),
                    BibliographicRecord::Article(candidate),
                ));
                sort_best_first(&mut matches);
            }
            if matches
                .first()
                .is_some_and(|m| m.score() > settings.skip_threshold)
            {
                tracing::debug!(ark = %issue, "good enough candidate found, stopping");
                break;
            }
        }
        matches.truncate(settings.max_candidates);
        Ok(matches)
    }

    /// At most one candidate for `issue`. Archive errors are fatal here.
    async fn issue_candidate(&self, issue: &Ark, article: &Article) -> Result<Option<Article>, CoreError> {
        let archive = self.archive();
        let oai = archive.oai_record(issue).await?;
        let mut descriptor = oai
            .descriptions
            .iter()
            .map(|d| IssueDescriptor::parse(d))
            .find(|d| d.year.is_some())
            .unwrap_or_default()
            .with_ark(issue.clone());
        if descriptor.year.is_none() {
            descriptor.year = oai.date.as_deref().and_then(parse_years);
        }
        let pages = archive.pagination(issue).await?;

        if self.matching().use_toc
            && let Some(markup) = archive.toc(issue).await?
        {
            let lines = parse_xml_toc(&markup)?;
            return Ok(toc_candidate(&lines, article, &descriptor, &pages));
        }

        if locate::confirm_in_issue(archive, issue, &pages, article).await? {
            tracing::debug!(ark = %issue, "article located by OCR");
            let mut candidate = merge_issue(article.clone(), &descriptor);
            candidate.physical_pages = Some(pages.physical_range(&article.pages));
            return Ok(Some(candidate));
        }
        Ok(None)
    }

    /// The best candidate above `min_confidence` whose first page can be fetched.
    async fn select(&self, candidates: Vec<Match>) -> Result<Resolution, CoreError> {
        let min_confidence = self.matching().min_confidence;
        for m in candidates {
            let score = m.score();
            if score < min_confidence {
                break;
            }
            let BibliographicRecord::Article(candidate) = m.candidate else {
                continue;
            };
            let Some(ark) = candidate.ark.as_deref().and_then(|a| Ark::parse(a).ok()) else {
                continue;
            };
            let physical_pages = candidate.physical_pages.clone().unwrap_or_default();
            let Some(&first) = physical_pages.first() else {
                tracing::debug!(ark = %ark, "candidate has no physical pages");
                continue;
            };
            let probe = self.archive().page_probe(&ark, first).await;
            if !probe.is_available() {
                tracing::info!(ark = %ark, page = first, ?probe, "candidate page not retrievable");
                continue;
            }
            return Ok(Resolution {
                ark,
                score,
                candidate,
                physical_pages,
                from_cache: false,
            });
        }
        Err(CoreError::Matching("unable to match".into()))
    }
}

/// Each target year ± 1, deduplicated and ascending.
fn candidate_years(article: &Article) -> Option<BTreeSet<i64>> {
    let years = article.year.as_ref()?;
    Some(
        years
            .values()
            .into_iter()
            .flat_map(|y| [y - 1, y, y + 1])
            .collect(),
    )
}

/// Fill the issue's year, volume and number into `article` where known.
fn merge_issue(mut article: Article, descriptor: &IssueDescriptor) -> Article {
    if let Some(year) = &descriptor.year {
        article.year = Some(year.clone());
    }
    if let Some(volume) = &descriptor.volume {
        article.volume = Some(volume.clone());
    }
    if let Some(number) = &descriptor.number {
        article.number = Some(number.clone());
    }
    article.ark = descriptor.ark.as_ref().map(Ark::to_string);
    article
}

/// The TOC entry starting on the target's first page, as a candidate.
///
/// It ends one page before the next entry starts, or on the issue's last
/// printed page.
fn toc_candidate(
    lines: &[TocLine],
    article: &Article,
    descriptor: &IssueDescriptor,
    pages: &PageMap,
) -> Option<Article> {
    let first: u32 = article.pages.first()?.trim().parse().ok()?;
    let idx = lines
        .iter()
        .position(|l| l.start_pages.first() == Some(&first))?;
    let line = &lines[idx];

    let end = lines
        .get(idx + 1)
        .and_then(|next| next.start_pages.first())
        .map(|s| s.saturating_sub(1))
        .filter(|e| *e >= first)
        .or_else(|| pages.last_label())
        .unwrap_or(first)
        .max(first);
    let labels: Vec<String> = (first..=end).map(|p| p.to_string()).collect();

    let candidate = Article {
        title: line.title.clone(),
        author: line.author.clone(),
        journal_title: article.journal_title.clone(),
        publisher: article.publisher.clone(),
        physical_pages: Some(pages.physical_range(&labels)),
        pages: labels,
        ..Default::default()
    };
    Some(merge_issue(candidate, descriptor))
}
