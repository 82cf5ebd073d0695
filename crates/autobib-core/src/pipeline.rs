//! One bibliography entry end to end: resolve, download, clean.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use autobib_pdf::{ProcessOptions, UnscaledPageBounds, process_pdf};
use serde::Serialize;

use crate::archive::Ark;
use crate::cache::CacheTable;
use crate::context::RunContext;
use crate::record::BibliographicRecord;
use crate::resolver::Resolver;
use crate::retrieval::Retriever;
use crate::scoring::normalize;
use crate::{CoreError, ProcessingSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Downloaded and cleaned.
    Processed,
    /// Downloaded; cleaning was not requested.
    Downloaded,
    /// No confident, retrievable match.
    Unmatched,
    /// Not an article.
    Unsupported,
    /// Anything else went wrong.
    Failed,
}

impl EntryStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, EntryStatus::Processed | EntryStatus::Downloaded)
    }
}

/// What happened to one entry, for the run report.
#[derive(Debug, Clone, Serialize)]
pub struct EntryOutcome {
    pub kind: &'static str,
    pub title: String,
    pub author: Option<String>,
    pub status: EntryStatus,
    pub output: Option<PathBuf>,
    pub ark: Option<String>,
    pub score: Option<f64>,
    pub error: Option<String>,
}

impl EntryOutcome {
    fn new(record: &BibliographicRecord, status: EntryStatus) -> Self {
        Self {
            kind: record.kind(),
            title: record.title().to_string(),
            author: record.author().filter(|a| !a.is_empty()).map(str::to_string),
            status,
            output: None,
            ark: None,
            score: None,
            error: None,
        }
    }

    pub(crate) fn cancelled(record: &BibliographicRecord) -> Self {
        Self {
            error: Some("cancelled".into()),
            ..Self::new(record, EntryStatus::Failed)
        }
    }

    fn failed(record: &BibliographicRecord, err: &CoreError) -> Self {
        let status = match err {
            CoreError::UnsupportedRecordKind(_) => EntryStatus::Unsupported,
            CoreError::Matching(_) => EntryStatus::Unmatched,
            _ => EntryStatus::Failed,
        };
        Self {
            error: Some(err.to_string()),
            ..Self::new(record, status)
        }
    }
}

/// Lowercase ASCII words joined by hyphens.
pub fn slugify(s: &str) -> String {
    let mut slug = String::with_capacity(s.len());
    for c in normalize(s).chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// `<outdir>/<slug of "author title">.pdf`, numbered until unused in `taken`.
pub fn generate_outf(outdir: &Path, record: &BibliographicRecord, taken: &mut HashSet<PathBuf>) -> PathBuf {
    let base = format!("{} {}", record.author().unwrap_or_default(), record.title());
    let mut outf = outdir.join(format!("{}.pdf", slugify(&base)));
    let mut i = 0;
    while taken.contains(&outf) {
        i += 1;
        outf = outdir.join(format!("{}.pdf", slugify(&format!("{base} {i}"))));
    }
    taken.insert(outf.clone());
    outf
}

/// `path` if free, else the first free `<stem>-<n>.<ext>`.
pub fn generate_filename(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (0..)
        .map(|n| path.with_file_name(format!("{stem}-{n}{ext}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

/// Archive OCR bounds for each page, cached per `(ark, page)`.
///
/// A page whose bounds cannot be fetched gets `None`.
pub async fn fetch_ocr_bounds(ctx: &RunContext, ark: &Ark, pages: &[u32]) -> Vec<Option<UnscaledPageBounds>> {
    let mut bounds = Vec::with_capacity(pages.len());
    for &page in pages {
        let key = format!("{ark}/f{page}");
        if let Some(cached) = ctx.cache.get::<UnscaledPageBounds>(CacheTable::OcrBounds, &key) {
            bounds.push(Some(cached));
            continue;
        }
        match ctx.archive.ocr_bounds(ark, page).await {
            Ok(b) => {
                if let Err(e) = ctx.cache.set(CacheTable::OcrBounds, &key, &b) {
                    tracing::warn!(error = %e, "failed to cache OCR bounds");
                }
                bounds.push(Some(b));
            }
            Err(e) => {
                tracing::debug!(ark = %ark, page, error = %e, "no OCR bounds");
                bounds.push(None);
            }
        }
    }
    bounds
}

/// Cleaner options for a download whose first page is the archive cover
/// unless it was suppressed or the pages came in as images.
///
/// `page_bounds` holds one entry per downloaded content page; it is shifted
/// past the cover so it stays indexed by input page.
fn clean_options(
    settings: &ProcessingSettings,
    via_images: bool,
    page_bounds: Vec<Option<UnscaledPageBounds>>,
) -> ProcessOptions {
    let cover_pages = usize::from(!settings.suppress_cover && !via_images);
    let mut ocr_bounds = Vec::new();
    if !page_bounds.is_empty() {
        ocr_bounds.resize(cover_pages, None);
        ocr_bounds.extend(page_bounds);
    }
    ProcessOptions {
        preserve_text: settings.preserve_text,
        equal_size: settings.equal_size,
        skip_existing: settings.skip_existing,
        cover_pages,
        suppress_pages: Vec::new(),
        ocr_bounds,
    }
}

async fn clean(raw: PathBuf, opts: ProcessOptions) -> Result<PathBuf, CoreError> {
    tokio::task::spawn_blocking(move || process_pdf(&raw, None, &opts))
        .await
        .map_err(|e| CoreError::Download(format!("cleaning task failed: {e}")))?
        .map_err(CoreError::from)
}

async fn remove_raw(raw: &Path) {
    if let Err(e) = tokio::fs::remove_file(raw).await {
        tracing::warn!(path = %raw.display(), error = %e, "could not delete raw download");
    }
}

/// Resolve, download and optionally clean one entry into `outf`.
///
/// Never fails: every error is recorded on the outcome.
pub async fn process_entry(ctx: &RunContext, record: &BibliographicRecord, outf: &Path) -> EntryOutcome {
    match run_entry(ctx, record, outf).await {
        Ok(outcome) => outcome,
        Err((err, partial)) => {
            tracing::warn!(title = record.title(), error = %err, "entry failed");
            let mut outcome = EntryOutcome::failed(record, &err);
            if let Some(partial) = partial {
                outcome.ark = partial.ark;
                outcome.score = partial.score;
            }
            outcome
        }
    }
}

struct Partial {
    ark: Option<String>,
    score: Option<f64>,
}

async fn run_entry(
    ctx: &RunContext,
    record: &BibliographicRecord,
    outf: &Path,
) -> Result<EntryOutcome, (CoreError, Option<Partial>)> {
    let resolution = Resolver::new(ctx).resolve(record).await.map_err(|e| (e, None))?;
    let partial = || {
        Some(Partial {
            ark: Some(resolution.ark.to_string()),
            score: Some(resolution.score),
        })
    };
    let (Some(first), Some(last)) = (resolution.first_page(), resolution.last_page()) else {
        return Err((CoreError::Matching("match has no physical pages".into()), partial()));
    };

    let download = Retriever::new(ctx)
        .download(&resolution.ark, first, last, outf)
        .await
        .map_err(|e| (e, partial()))?;

    let settings = &ctx.settings.processing;
    let mut outcome = EntryOutcome::new(record, EntryStatus::Downloaded);
    outcome.ark = Some(resolution.ark.to_string());
    outcome.score = Some(resolution.score);
    outcome.output = Some(download.path.clone());
    if !settings.post_process {
        return Ok(outcome);
    }

    // Bounds follow the downloaded pages, plates and unlabelled leaves included.
    let page_bounds = if settings.ocr_bounds && !download.via_images {
        let downloaded: Vec<u32> = (first..=last).collect();
        fetch_ocr_bounds(ctx, &resolution.ark, &downloaded).await
    } else {
        Vec::new()
    };
    let opts = clean_options(settings, download.via_images, page_bounds);
    let processed = clean(download.path.clone(), opts)
        .await
        .map_err(|e| (e, partial()))?;
    if settings.clean {
        remove_raw(&download.path).await;
    }
    outcome.status = EntryStatus::Processed;
    outcome.output = Some(processed);
    Ok(outcome)
}

/// Download a whole issue into `outf` and optionally clean it.
///
/// The archive's cover is handled as for single entries: stripped at
/// retrieval when `suppress_cover` is set, kept uncleaned otherwise.
/// Returns the final file.
pub async fn fetch_issue(ctx: &RunContext, ark: &Ark, outf: &Path) -> Result<PathBuf, CoreError> {
    let pages = ctx.archive.pagination(ark).await?;
    let last = pages
        .last_physical()
        .ok_or_else(|| CoreError::Matching(format!("{ark} has an empty page map")))?;
    tracing::info!(ark = %ark, pages = last, "fetching issue");

    let download = Retriever::new(ctx).download(ark, 1, last, outf).await?;

    let settings = &ctx.settings.processing;
    if !settings.post_process {
        return Ok(download.path);
    }
    let opts = clean_options(settings, download.via_images, Vec::new());
    let processed = clean(download.path.clone(), opts).await?;
    if settings.clean {
        remove_raw(&download.path).await;
    }
    Ok(processed)
}
