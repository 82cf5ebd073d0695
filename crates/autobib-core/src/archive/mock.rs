//! In-memory archive for tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use autobib_pdf::UnscaledPageBounds;

use super::{
    Archive, ArchiveError, ArchiveFuture, Ark, OaiRecord, ProbeFuture, ProbeOutcome, RawHit,
    SearchPage,
};
use crate::issue::PageMap;

/// What one `fetch_pdf` call does.
#[derive(Clone, Debug)]
pub enum ChunkResponse {
    /// Write the bytes produced by the PDF source.
    Pdf,
    /// Write a JPEG placeholder instead of a PDF.
    Placeholder,
    /// Simulate a 429.
    RateLimited { retry_after: Option<Duration> },
    /// Simulate a transport or server failure.
    Error(String),
}

type ChunkSource = Box<dyn Fn(u32, u32) -> Vec<u8> + Send + Sync>;
type ImageSource = Box<dyn Fn(u32) -> Vec<u8> + Send + Sync>;

/// A hand-rolled [`Archive`] serving canned data.
///
/// Lookups that have nothing registered fail with a 404 status error.
/// Chunk downloads follow a scripted sequence of [`ChunkResponse`]s, repeating
/// the last one once exhausted. Every method call is counted.
pub struct MockArchive {
    hits: Vec<RawHit>,
    issues: HashMap<(Ark, i64), Vec<Ark>>,
    oai: HashMap<Ark, OaiRecord>,
    pagination: HashMap<Ark, PageMap>,
    tocs: HashMap<Ark, String>,
    texts: HashMap<(Ark, u32), String>,
    bounds: HashMap<(Ark, u32), UnscaledPageBounds>,
    delivery: ProbeOutcome,
    page_probe: ProbeOutcome,
    chunk_script: Mutex<Vec<ChunkResponse>>,
    chunk_fallback: ChunkResponse,
    chunk_source: ChunkSource,
    image_source: ImageSource,
    calls: Mutex<HashMap<&'static str, usize>>,
    total_calls: AtomicUsize,
}

impl Default for MockArchive {
    fn default() -> Self {
        Self::new()
    }
}

impl MockArchive {
    pub fn new() -> Self {
        Self {
            hits: Vec::new(),
            issues: HashMap::new(),
            oai: HashMap::new(),
            pagination: HashMap::new(),
            tocs: HashMap::new(),
            texts: HashMap::new(),
            bounds: HashMap::new(),
            delivery: ProbeOutcome::Available,
            page_probe: ProbeOutcome::Available,
            chunk_script: Mutex::new(Vec::new()),
            chunk_fallback: ChunkResponse::Pdf,
            chunk_source: Box::new(|_, _| b"%PDF-1.5\n%%EOF\n".to_vec()),
            image_source: Box::new(|_| Vec::new()),
            calls: Mutex::new(HashMap::new()),
            total_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_hits(mut self, hits: Vec<RawHit>) -> Self {
        self.hits = hits;
        self
    }

    pub fn with_issues(mut self, series: &Ark, year: i64, issues: Vec<Ark>) -> Self {
        self.issues.insert((series.clone(), year), issues);
        self
    }

    pub fn with_oai(mut self, issue: &Ark, record: OaiRecord) -> Self {
        self.oai.insert(issue.clone(), record);
        self
    }

    pub fn with_pagination(mut self, issue: &Ark, map: PageMap) -> Self {
        self.pagination.insert(issue.clone(), map);
        self
    }

    pub fn with_toc(mut self, issue: &Ark, markup: impl Into<String>) -> Self {
        self.tocs.insert(issue.clone(), markup.into());
        self
    }

    pub fn with_text(mut self, issue: &Ark, page: u32, text: impl Into<String>) -> Self {
        self.texts.insert((issue.clone(), page), text.into());
        self
    }

    pub fn with_bounds(mut self, issue: &Ark, page: u32, bounds: UnscaledPageBounds) -> Self {
        self.bounds.insert((issue.clone(), page), bounds);
        self
    }

    pub fn with_delivery(mut self, outcome: ProbeOutcome) -> Self {
        self.delivery = outcome;
        self
    }

    pub fn with_page_probe(mut self, outcome: ProbeOutcome) -> Self {
        self.page_probe = outcome;
        self
    }

    /// Responses for successive `fetch_pdf` calls; the last one repeats.
    pub fn with_chunk_script(mut self, mut script: Vec<ChunkResponse>) -> Self {
        assert!(!script.is_empty(), "script must have at least one response");
        script.reverse();
        self.chunk_fallback = script[0].clone();
        self.chunk_script = Mutex::new(script);
        self
    }

    /// Bytes written for a successful chunk of `count` pages from `start`.
    pub fn with_chunk_source(mut self, source: impl Fn(u32, u32) -> Vec<u8> + Send + Sync + 'static) -> Self {
        self.chunk_source = Box::new(source);
        self
    }

    pub fn with_image_source(mut self, source: impl Fn(u32) -> Vec<u8> + Send + Sync + 'static) -> Self {
        self.image_source = Box::new(source);
        self
    }

    /// How many times `method` was called.
    pub fn calls(&self, method: &str) -> usize {
        self.calls
            .lock()
            .map(|c| c.get(method).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }

    fn record(&self, method: &'static str) {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(method).or_default() += 1;
        }
    }

    fn next_chunk(&self) -> ChunkResponse {
        match self.chunk_script.lock() {
            Ok(mut script) => script.pop().unwrap_or_else(|| self.chunk_fallback.clone()),
            Err(_) => self.chunk_fallback.clone(),
        }
    }
}

fn not_found(what: impl std::fmt::Display) -> ArchiveError {
    ArchiveError::Status {
        status: 404,
        url: format!("mock://{what}"),
    }
}

impl Archive for MockArchive {
    fn search<'a>(&'a self, _query: &'a str, start: usize, count: usize) -> ArchiveFuture<'a, SearchPage> {
        self.record("search");
        let from = start.saturating_sub(1).min(self.hits.len());
        let to = (from + count).min(self.hits.len());
        let page = SearchPage {
            total: self.hits.len(),
            hits: self.hits[from..to].to_vec(),
        };
        Box::pin(async move { Ok(page) })
    }

    fn issues<'a>(&'a self, series: &'a Ark, year: i64) -> ArchiveFuture<'a, Vec<Ark>> {
        self.record("issues");
        let result = self
            .issues
            .get(&(series.clone(), year))
            .cloned()
            .ok_or_else(|| not_found(format!("{series}/{year}")));
        Box::pin(async move { result })
    }

    fn oai_record<'a>(&'a self, issue: &'a Ark) -> ArchiveFuture<'a, OaiRecord> {
        self.record("oai_record");
        let result = self.oai.get(issue).cloned().ok_or_else(|| not_found(issue));
        Box::pin(async move { result })
    }

    fn pagination<'a>(&'a self, issue: &'a Ark) -> ArchiveFuture<'a, PageMap> {
        self.record("pagination");
        let result = self
            .pagination
            .get(issue)
            .cloned()
            .ok_or_else(|| not_found(issue));
        Box::pin(async move { result })
    }

    fn toc<'a>(&'a self, issue: &'a Ark) -> ArchiveFuture<'a, Option<String>> {
        self.record("toc");
        let result = self.tocs.get(issue).cloned();
        Box::pin(async move { Ok(result) })
    }

    fn page_text<'a>(&'a self, issue: &'a Ark, page: u32) -> ArchiveFuture<'a, String> {
        self.record("page_text");
        let result = self
            .texts
            .get(&(issue.clone(), page))
            .cloned()
            .ok_or_else(|| not_found(format!("{issue}/f{page}")));
        Box::pin(async move { result })
    }

    fn ocr_bounds<'a>(&'a self, issue: &'a Ark, page: u32) -> ArchiveFuture<'a, UnscaledPageBounds> {
        self.record("ocr_bounds");
        let result = self
            .bounds
            .get(&(issue.clone(), page))
            .copied()
            .ok_or_else(|| not_found(format!("{issue}/alto/{page}")));
        Box::pin(async move { result })
    }

    fn delivery_probe<'a>(&'a self, _issue: &'a Ark) -> ProbeFuture<'a> {
        self.record("delivery_probe");
        let outcome = self.delivery.clone();
        Box::pin(async move { outcome })
    }

    fn page_probe<'a>(&'a self, _issue: &'a Ark, _page: u32) -> ProbeFuture<'a> {
        self.record("page_probe");
        let outcome = self.page_probe.clone();
        Box::pin(async move { outcome })
    }

    fn fetch_pdf<'a>(
        &'a self,
        _issue: &'a Ark,
        start: u32,
        count: u32,
        dest: &'a Path,
    ) -> ArchiveFuture<'a, ()> {
        self.record("fetch_pdf");
        let response = self.next_chunk();
        Box::pin(async move {
            match response {
                ChunkResponse::Pdf => {
                    tokio::fs::write(dest, (self.chunk_source)(start, count)).await?;
                    Ok(())
                }
                ChunkResponse::Placeholder => {
                    tokio::fs::write(dest, [0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10, b'J', b'F', b'I', b'F']).await?;
                    Ok(())
                }
                ChunkResponse::RateLimited { retry_after } => {
                    Err(ArchiveError::RateLimited { retry_after })
                }
                ChunkResponse::Error(msg) => Err(ArchiveError::Malformed(msg)),
            }
        })
    }

    fn fetch_page_image<'a>(&'a self, _issue: &'a Ark, page: u32) -> ArchiveFuture<'a, Vec<u8>> {
        self.record("fetch_page_image");
        let bytes = (self.image_source)(page);
        Box::pin(async move {
            if bytes.is_empty() {
                return Err(ArchiveError::Empty(format!("mock://image/{page}")));
            }
            Ok(bytes)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ark() -> Ark {
        Ark::new("12148", "bpt6k1")
    }

    #[tokio::test]
    async fn unknown_lookups_are_not_found() {
        let mock = MockArchive::new();
        assert!(matches!(
            mock.oai_record(&ark()).await,
            Err(ArchiveError::Status { status: 404, .. })
        ));
        assert_eq!(mock.toc(&ark()).await.unwrap(), None);
        assert_eq!(mock.calls("oai_record"), 1);
        assert_eq!(mock.total_calls(), 2);
    }

    #[tokio::test]
    async fn search_pages_are_one_based() {
        let hits: Vec<RawHit> = (0..5)
            .map(|i| {
                let mut h = RawHit::default();
                h.push("title", format!("T{i}"));
                h
            })
            .collect();
        let mock = MockArchive::new().with_hits(hits);
        let page = mock.search("q", 4, 15).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.hits.len(), 2);
        assert_eq!(page.hits[0].first("title"), Some("T3"));
    }

    #[tokio::test]
    async fn chunk_script_repeats_last() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("x.pdf");
        let mock = MockArchive::new().with_chunk_script(vec![
            ChunkResponse::Error("boom".into()),
            ChunkResponse::Pdf,
        ]);
        assert!(mock.fetch_pdf(&ark(), 1, 1, &dest).await.is_err());
        assert!(mock.fetch_pdf(&ark(), 1, 1, &dest).await.is_ok());
        assert!(mock.fetch_pdf(&ark(), 1, 1, &dest).await.is_ok());
        assert_eq!(mock.calls("fetch_pdf"), 3);
    }
}
