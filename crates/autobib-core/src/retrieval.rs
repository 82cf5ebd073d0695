//! Resilient page-range download.
//!
//! Large ranges time out on the archive, so a range is fetched in chunks,
//! each retried with exponential back-off. The archive sometimes answers a
//! chunk request with an image placeholder instead of a PDF when it wants us
//! to slow down; that backs off on a separate counter and does not consume a
//! trial. When whole-document delivery is blocked, pages are fetched one by
//! one as images instead.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::archive::{Archive, ArchiveError, Ark, ProbeOutcome};
use crate::context::RunContext;
use crate::rate_limit::host_of;
use crate::{CoreError, RetrievalSettings};

/// Split the inclusive range `start..=end` into `(first, count)` blocks of
/// at most `size` pages.
pub fn generate_blocks(start: u32, end: u32, size: u32) -> Vec<(u32, u32)> {
    let size = size.max(1);
    let mut blocks = Vec::new();
    let mut first = start;
    while first <= end {
        let count = size.min(end - first + 1);
        blocks.push((first, count));
        match first.checked_add(size) {
            Some(next) => first = next,
            None => break,
        }
    }
    blocks
}

/// What a finished download produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    /// Pages came from the per-page image fallback.
    pub via_images: bool,
    /// The output already existed and nothing was fetched.
    pub already_present: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sniffed {
    Pdf,
    Image,
    Other,
}

fn sniff(head: &[u8]) -> Sniffed {
    const IMAGE_MAGIC: &[&[u8]] = &[b"\xFF\xD8\xFF", b"\x89PNG", b"GIF8"];
    if head.starts_with(b"%PDF") {
        Sniffed::Pdf
    } else if IMAGE_MAGIC.iter().any(|m| head.starts_with(m)) {
        Sniffed::Image
    } else {
        Sniffed::Other
    }
}

async fn sniff_file(path: &Path) -> Result<Sniffed, CoreError> {
    use tokio::io::AsyncReadExt;
    let mut head = [0u8; 8];
    let mut file = tokio::fs::File::open(path).await?;
    let n = file.read(&mut head).await?;
    Ok(sniff(&head[..n]))
}

/// `2^exponent` seconds.
fn backoff(exponent: u32) -> Duration {
    Duration::from_secs(1u64 << exponent.min(32))
}

/// Downloads page ranges through the archive held by a [`RunContext`].
pub struct Retriever<'a> {
    ctx: &'a RunContext,
    suppress_cover: bool,
}

impl<'a> Retriever<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        Self {
            ctx,
            suppress_cover: ctx.settings.processing.suppress_cover,
        }
    }

    fn archive(&self) -> &dyn Archive {
        self.ctx.archive.as_ref()
    }

    fn settings(&self) -> &RetrievalSettings {
        &self.ctx.settings.retrieval
    }

    /// Download physical pages `start..=end` of `ark` into `out`.
    ///
    /// An existing `out` is returned untouched. Partial files live in a
    /// temporary directory next to `out` that is removed on every exit path.
    pub async fn download(
        &self,
        ark: &Ark,
        start: u32,
        end: u32,
        out: &Path,
    ) -> Result<DownloadOutcome, CoreError> {
        if out.exists() {
            tracing::debug!(path = %out.display(), "output exists, not downloading");
            return Ok(DownloadOutcome {
                path: out.to_path_buf(),
                via_images: false,
                already_present: true,
            });
        }
        if end < start {
            return Err(CoreError::Download(format!("empty page range {start}..={end}")));
        }

        let parent = match out.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&parent).await?;
        let workdir = tempfile::Builder::new()
            .prefix(".autobib-")
            .tempdir_in(&parent)?;

        let via_images = match self.archive().delivery_probe(ark).await {
            ProbeOutcome::Available => false,
            ProbeOutcome::Blocked => {
                tracing::info!(ark = %ark, "PDF delivery blocked, falling back to page images");
                true
            }
            ProbeOutcome::Failed(reason) => {
                tracing::warn!(ark = %ark, reason = %reason, "delivery probe failed, trying PDF anyway");
                false
            }
        };

        let parts = if via_images {
            self.fetch_images(ark, start, end, workdir.path()).await?
        } else {
            self.fetch_chunks(ark, start, end, workdir.path()).await?
        };

        let suppress_cover = self.suppress_cover;
        let merged = workdir.path().join("merged.pdf");
        let merged_for_task = merged.clone();
        let pages = tokio::task::spawn_blocking(move || {
            autobib_pdf::merge_pdfs(&parts, &merged_for_task, |i| {
                !via_images && (i > 0 || suppress_cover)
            })
        })
        .await
        .map_err(|e| CoreError::Download(format!("merge task failed: {e}")))??;
        tokio::fs::rename(&merged, out).await?;

        tracing::info!(ark = %ark, pages, path = %out.display(), via_images, "downloaded");
        Ok(DownloadOutcome {
            path: out.to_path_buf(),
            via_images,
            already_present: false,
        })
    }

    async fn fetch_chunks(
        &self,
        ark: &Ark,
        start: u32,
        end: u32,
        dir: &Path,
    ) -> Result<Vec<PathBuf>, CoreError> {
        let blocks = generate_blocks(start, end, self.settings().chunk_size);
        let mut parts = Vec::with_capacity(blocks.len());
        for (i, (first, count)) in blocks.into_iter().enumerate() {
            let part = dir.join(format!("part-{i:04}.pdf"));
            self.fetch_chunk(ark, first, count, &part).await?;
            parts.push(part);
        }
        Ok(parts)
    }

    /// One chunk, retried up to `trials` times.
    ///
    /// Ordinary failures wait `2^(attempt+1)` seconds. Placeholders and 429s
    /// back off on their own counter, and a wait beyond
    /// `max_rate_limit_backoff` gives up.
    async fn fetch_chunk(&self, ark: &Ark, first: u32, count: u32, part: &Path) -> Result<(), CoreError> {
        let settings = self.settings();
        let host = host_of(&settings.base_url);
        let mut attempt: u32 = 0;
        let mut throttled: u32 = 0;

        loop {
            let fetched = tokio::time::timeout(
                settings.download_timeout,
                self.archive().fetch_pdf(ark, first, count, part),
            )
            .await;

            let failure = match fetched {
                Ok(Ok(())) => match sniff_file(part).await? {
                    Sniffed::Pdf => {
                        tracing::debug!(ark = %ark, first, count, "chunk fetched");
                        return Ok(());
                    }
                    Sniffed::Image => {
                        self.ctx.limiters.on_rate_limited(host);
                        self.throttle(ark, &mut throttled, None).await?;
                        continue;
                    }
                    Sniffed::Other => "response is not a PDF".to_string(),
                },
                Ok(Err(ArchiveError::RateLimited { retry_after })) => {
                    self.throttle(ark, &mut throttled, retry_after).await?;
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {:?}", settings.download_timeout),
            };

            attempt += 1;
            if attempt >= settings.trials {
                return Err(CoreError::Download(format!(
                    "pages {first}..{} of {ark} failed after {attempt} attempts: {failure}",
                    first + count - 1
                )));
            }
            let wait = backoff(attempt);
            tracing::warn!(ark = %ark, first, attempt, ?wait, error = %failure, "chunk failed, retrying");
            tokio::time::sleep(wait).await;
        }
    }

    async fn throttle(
        &self,
        ark: &Ark,
        throttled: &mut u32,
        retry_after: Option<Duration>,
    ) -> Result<(), CoreError> {
        *throttled += 1;
        let wait = backoff(*throttled).max(retry_after.unwrap_or_default());
        let ceiling = self.settings().max_rate_limit_backoff;
        if wait > ceiling {
            return Err(CoreError::Download(format!(
                "rate-limit back-off of {wait:?} exceeds {ceiling:?}"
            )));
        }
        tracing::warn!(ark = %ark, ?wait, "archive is throttling, backing off");
        tokio::time::sleep(wait).await;
        Ok(())
    }

    async fn fetch_images(
        &self,
        ark: &Ark,
        start: u32,
        end: u32,
        dir: &Path,
    ) -> Result<Vec<PathBuf>, CoreError> {
        let trials = self.settings().trials.max(1);
        let mut parts = Vec::new();
        for page in start..=end {
            let mut attempt = 0;
            let bytes = loop {
                match self.archive().fetch_page_image(ark, page).await {
                    Ok(bytes) => break bytes,
                    Err(e) => {
                        attempt += 1;
                        if attempt >= trials {
                            return Err(CoreError::Download(format!(
                                "page {page} of {ark} failed after {attempt} attempts: {e}"
                            )));
                        }
                        tracing::warn!(ark = %ark, page, attempt, error = %e, "page image failed, retrying");
                        tokio::time::sleep(backoff(attempt)).await;
                    }
                }
            };
            let pdf = tokio::task::spawn_blocking(move || autobib_pdf::image_to_pdf(&bytes))
                .await
                .map_err(|e| CoreError::Download(format!("image conversion task failed: {e}")))??;
            let part = dir.join(format!("page-{page:05}.pdf"));
            tokio::fs::write(&part, pdf).await?;
            parts.push(part);
        }
        Ok(parts)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use lopdf::{Document, Object, Stream, dictionary};

    use super::*;
    use crate::Settings;
    use crate::archive::mock::{ChunkResponse, MockArchive};

    /// A PDF with `pages` blank letter-size pages.
    fn blank_pdf(pages: u32) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let content_id = doc.add_object(Stream::new(dictionary! {}, Vec::new()));
        let kids: Vec<Object> = (0..pages)
            .map(|_| {
                doc.add_object(dictionary! {
                    "Type" => "Page",
                    "Parent" => pages_id,
                    "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
                    "Contents" => content_id,
                })
                .into()
            })
            .collect();
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => pages as i64,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        let mut out = Vec::new();
        doc.save_to(&mut out).unwrap();
        out
    }

    fn png() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(8, 12, image::Rgb([200, 200, 200]));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn ark() -> Ark {
        Ark::new("12148", "bpt6kB")
    }

    /// Every delivered chunk carries the archive's one-page cover.
    fn archive() -> MockArchive {
        MockArchive::new().with_chunk_source(|_, count| blank_pdf(count + 1))
    }

    fn ctx_with(settings: Settings, archive: MockArchive) -> (RunContext, Arc<MockArchive>) {
        let archive = Arc::new(archive);
        let ctx = RunContext::with_archive(settings, archive.clone()).unwrap();
        (ctx, archive)
    }

    fn small_chunks() -> Settings {
        let mut settings = Settings::default();
        settings.retrieval.chunk_size = 5;
        settings
    }

    fn page_count(path: &Path) -> usize {
        Document::load(path).unwrap().get_pages().len()
    }

    // ── generate_blocks ────────────────────────────────────────────────

    #[test]
    fn blocks_cover_inclusive_range() {
        assert_eq!(
            generate_blocks(0, 20, 5),
            vec![(0, 5), (5, 5), (10, 5), (15, 5), (20, 1)]
        );
    }

    #[test]
    fn single_short_block() {
        assert_eq!(generate_blocks(0, 3, 100), vec![(0, 4)]);
    }

    #[test]
    fn exact_multiple() {
        assert_eq!(generate_blocks(1, 10, 5), vec![(1, 5), (6, 5)]);
    }

    #[test]
    fn sniffing() {
        assert_eq!(sniff(b"%PDF-1.5"), Sniffed::Pdf);
        assert_eq!(sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), Sniffed::Image);
        assert_eq!(sniff(b"\x89PNG\r\n"), Sniffed::Image);
        assert_eq!(sniff(b"<html>"), Sniffed::Other);
        assert_eq!(sniff(b""), Sniffed::Other);
    }

    // ── download ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn chunks_merge_stripping_later_covers() {
        let (ctx, mock) = ctx_with(small_chunks(), archive());
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("article.pdf");
        let outcome = Retriever::new(&ctx).download(&ark(), 1, 12, &out).await.unwrap();
        assert!(!outcome.via_images);
        assert!(!outcome.already_present);
        assert_eq!(mock.calls("fetch_pdf"), 3);
        // 12 pages plus the first chunk's cover.
        assert_eq!(page_count(&out), 13);
        // Only the output remains.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn suppressed_cover_strips_first_chunk_too() {
        let mut settings = small_chunks();
        settings.processing.suppress_cover = true;
        let (ctx, _mock) = ctx_with(settings, archive());
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("article.pdf");
        Retriever::new(&ctx).download(&ark(), 1, 12, &out).await.unwrap();
        assert_eq!(page_count(&out), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn existing_output_is_left_alone() {
        let (ctx, mock) = ctx_with(small_chunks(), archive());
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("article.pdf");
        std::fs::write(&out, b"already here").unwrap();
        let outcome = Retriever::new(&ctx).download(&ark(), 1, 12, &out).await.unwrap();
        assert!(outcome.already_present);
        assert_eq!(mock.total_calls(), 0);
        assert_eq!(std::fs::read(&out).unwrap(), b"already here");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let archive = archive().with_chunk_script(vec![
            ChunkResponse::Error("reset".into()),
            ChunkResponse::Error("reset".into()),
            ChunkResponse::Pdf,
        ]);
        let (ctx, mock) = ctx_with(Settings::default(), archive);
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("a.pdf");
        Retriever::new(&ctx).download(&ark(), 1, 3, &out).await.unwrap();
        assert_eq!(mock.calls("fetch_pdf"), 3);
        assert_eq!(page_count(&out), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_trials_fail_and_clean_up() {
        let archive = archive().with_chunk_script(vec![ChunkResponse::Error("reset".into())]);
        let (ctx, mock) = ctx_with(Settings::default(), archive);
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("a.pdf");
        let err = Retriever::new(&ctx).download(&ark(), 1, 3, &out).await.unwrap_err();
        assert!(matches!(err, CoreError::Download(_)));
        assert_eq!(mock.calls("fetch_pdf"), 3);
        assert!(!out.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn placeholder_backs_off_without_using_a_trial() {
        let archive = archive().with_chunk_script(vec![
            ChunkResponse::Placeholder,
            ChunkResponse::Error("reset".into()),
            ChunkResponse::Error("reset".into()),
            ChunkResponse::Pdf,
        ]);
        let (ctx, mock) = ctx_with(Settings::default(), archive);
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("a.pdf");
        Retriever::new(&ctx).download(&ark(), 1, 3, &out).await.unwrap();
        assert_eq!(mock.calls("fetch_pdf"), 4);
        assert_eq!(ctx.limiters.get("gallica.bnf.fr").factor(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn back_off_ceiling_is_fatal() {
        let archive = archive().with_chunk_script(vec![ChunkResponse::RateLimited {
            retry_after: Some(Duration::from_secs(300)),
        }]);
        let (ctx, mock) = ctx_with(Settings::default(), archive);
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("a.pdf");
        let err = Retriever::new(&ctx).download(&ark(), 1, 3, &out).await.unwrap_err();
        assert!(matches!(err, CoreError::Download(m) if m.contains("back-off")));
        assert_eq!(mock.calls("fetch_pdf"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn endless_placeholders_hit_the_ceiling() {
        let archive = archive().with_chunk_script(vec![ChunkResponse::Placeholder]);
        let (ctx, mock) = ctx_with(Settings::default(), archive);
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("a.pdf");
        assert!(Retriever::new(&ctx).download(&ark(), 1, 3, &out).await.is_err());
        // Waits of 2, 4, ... 256 seconds, then 512 is refused.
        assert_eq!(mock.calls("fetch_pdf"), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_delivery_uses_page_images() {
        let archive = archive()
            .with_delivery(ProbeOutcome::Blocked)
            .with_image_source(|_| png());
        let (ctx, mock) = ctx_with(Settings::default(), archive);
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("a.pdf");
        let outcome = Retriever::new(&ctx).download(&ark(), 4, 6, &out).await.unwrap();
        assert!(outcome.via_images);
        assert_eq!(mock.calls("fetch_pdf"), 0);
        assert_eq!(mock.calls("fetch_page_image"), 3);
        assert_eq!(page_count(&out), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_page_images_give_up() {
        let archive = archive().with_delivery(ProbeOutcome::Blocked);
        let (ctx, mock) = ctx_with(Settings::default(), archive);
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("a.pdf");
        let err = Retriever::new(&ctx).download(&ark(), 4, 6, &out).await.unwrap_err();
        assert!(matches!(err, CoreError::Download(_)));
        assert_eq!(mock.calls("fetch_page_image"), 3);
    }
}
