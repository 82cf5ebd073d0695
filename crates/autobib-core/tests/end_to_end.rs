//! Whole entries through resolve → download → clean against a scripted archive.

use std::path::Path;
use std::sync::Arc;

use autobib_core::archive::mock::MockArchive;
use autobib_core::archive::{OaiRecord, RawHit};
use autobib_core::issue::PageMap;
use autobib_core::pipeline::{fetch_issue, process_entry};
use autobib_core::pool::run_batch;
use autobib_core::record::Numbers;
use autobib_core::{
    Archive, Article, Ark, BibliographicRecord, Book, EntryStatus, ProbeOutcome, RunContext,
    Settings,
};
use autobib_pdf::UnscaledPageBounds;
use lopdf::{Document, Object, ObjectId, Stream, dictionary};
use tokio_util::sync::CancellationToken;

// ── fixtures ───────────────────────────────────────────────────────────

const TOC: &str = r#"<TEI><list>
  <item><seg>R. Garrigou-Lagrange. - La contemplation</seg><xref>101</xref></item>
  <item><seg>M.-D. Chenu. Pour lire saint Augustin</seg><xref>135</xref></item>
  <item><seg>Chronique</seg><xref>158</xref></item>
</list></TEI>"#;

fn series() -> Ark {
    Ark::new("12148", "cb34406663m")
}

fn issue() -> Ark {
    Ark::new("12148", "bpt6k9616134r")
}

fn article() -> BibliographicRecord {
    BibliographicRecord::Article(Article {
        title: "Pour lire saint Augustin".into(),
        journal_title: "La vie spirituelle".into(),
        author: "M.-D. Chenu".into(),
        pages: (135..=157).map(|p| p.to_string()).collect(),
        year: Some(Numbers::One(1930)),
        ..Default::default()
    })
}

fn journal_hit() -> RawHit {
    let mut h = RawHit::default();
    h.push("identifier", "http://catalogue.bnf.fr/ark:/12148/cb34406663m");
    h.push("title", "La vie spirituelle, ascétique et mystique");
    h.push("date", "1919-1945");
    h.push("type", "publication en série imprimée");
    h
}

/// A PDF of `pages` empty letter-size pages.
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

/// A chunk as the archive delivers it: a vector cover page with no raster,
/// then `count` scanned pages. Each scan is a 200x300 gray image with a
/// black text block at (60, 80)-(140, 220), drawn at one point per pixel.
fn scanned_chunk(count: u32) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let cover_content = doc.add_object(Stream::new(dictionary! {}, b"0 0 m 612 792 l S".to_vec()));
    let mut kids: Vec<Object> = vec![
        doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Contents" => cover_content,
        })
        .into(),
    ];

    let mut pixels = image::GrayImage::from_pixel(200, 300, image::Luma([255]));
    for y in 80..220 {
        for x in 60..140 {
            pixels.put_pixel(x, y, image::Luma([0]));
        }
    }
    let image_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => 200,
            "Height" => 300,
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 8,
        },
        pixels.into_raw(),
    ));
    let content_id = doc.add_object(Stream::new(dictionary! {}, b"q 200 0 0 300 0 0 cm /Im0 Do Q".to_vec()));
    for _ in 0..count {
        kids.push(
            doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => vec![0.into(), 0.into(), 200.into(), 300.into()],
                "Resources" => dictionary! { "XObject" => dictionary! { "Im0" => image_id } },
                "Contents" => content_id,
            })
            .into(),
        );
    }
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Count" => kids.len() as i64,
            "Kids" => kids,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.compress();
    let mut out = Vec::new();
    doc.save_to(&mut out).unwrap();
    out
}

/// OCR geometry placing the text block at (60, 80)-(140, 220) on a 200x300 scan.
fn text_block_bounds() -> UnscaledPageBounds {
    UnscaledPageBounds {
        upper: (120, 160),
        lower: (280, 440),
        total_width: 400,
        total_height: 600,
    }
}

/// Labels 101..=200 on physical pages 107..=206.
fn continuous_pages() -> PageMap {
    PageMap::new((101..=200).map(|p| (p.to_string(), p + 6)).collect())
}

/// As [`continuous_pages`] but with an unnumbered plate on physical page 142,
/// between labels 135 and 136.
fn pages_with_plate() -> PageMap {
    let mut labels: Vec<(String, u32)> = (101..=135).map(|p| (p.to_string(), p + 6)).collect();
    labels.push(("NP".to_string(), 142));
    labels.extend((136..=200).map(|p| (p.to_string(), p + 7)));
    PageMap::new(labels)
}

/// A scanned page: white with a black text block.
fn page_image() -> Vec<u8> {
    let mut img = image::RgbImage::from_pixel(200, 300, image::Rgb([255, 255, 255]));
    for y in 80..220 {
        for x in 60..140 {
            img.put_pixel(x, y, image::Rgb([0, 0, 0]));
        }
    }
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

/// One matching issue; every chunk is delivered with a one-page cover.
fn archive() -> MockArchive {
    archive_with(continuous_pages())
}

fn archive_with(pages: PageMap) -> MockArchive {
    MockArchive::new()
        .with_hits(vec![journal_hit()])
        .with_issues(&series(), 1930, vec![issue()])
        .with_oai(
            &issue(),
            OaiRecord {
                title: Some("La Vie spirituelle".into()),
                date: Some("1930".into()),
                descriptions: vec!["1930/02 (A11,T22,N122).".into()],
            },
        )
        .with_pagination(&issue(), pages)
        .with_toc(&issue(), TOC)
        .with_chunk_source(|_, count| blank_pdf(count + 1))
}

fn download_only() -> Settings {
    let mut settings = Settings::default();
    settings.processing.post_process = false;
    settings
}

fn ctx(settings: Settings, archive: MockArchive) -> (Arc<RunContext>, Arc<MockArchive>) {
    let archive = Arc::new(archive);
    let ctx = RunContext::with_archive(settings, archive.clone() as Arc<dyn Archive>).unwrap();
    (Arc::new(ctx), archive)
}

fn page_count(path: &Path) -> usize {
    Document::load(path).unwrap().get_pages().len()
}

fn crop_box(doc: &Document, page_id: ObjectId) -> Option<Vec<f32>> {
    let page = doc.get_dictionary(page_id).unwrap();
    let crop = page.get(b"CropBox").ok()?.as_array().unwrap();
    Some(crop.iter().map(|v| v.as_float().unwrap()).collect())
}

// ── single entries ─────────────────────────────────────────────────────

#[tokio::test]
async fn article_is_downloaded_with_its_cover() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, mock) = ctx(download_only(), archive());
    let outf = dir.path().join("chenu.pdf");

    let outcome = process_entry(&ctx, &article(), &outf).await;
    assert_eq!(outcome.status, EntryStatus::Downloaded, "{:?}", outcome.error);
    assert_eq!(outcome.ark.as_deref(), Some("ark:/12148/bpt6k9616134r"));
    assert!(outcome.score.unwrap() > 0.9);
    assert_eq!(outcome.output.as_deref(), Some(outf.as_path()));
    // 23 article pages plus the archive's cover.
    assert_eq!(page_count(&outf), 24);
    assert_eq!(mock.calls("fetch_pdf"), 1);
}

#[tokio::test]
async fn suppressed_cover_is_stripped() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = download_only();
    settings.processing.suppress_cover = true;
    let (ctx, _mock) = ctx(settings, archive());
    let outf = dir.path().join("chenu.pdf");

    let outcome = process_entry(&ctx, &article(), &outf).await;
    assert_eq!(outcome.status, EntryStatus::Downloaded, "{:?}", outcome.error);
    assert_eq!(page_count(&outf), 23);
}

#[tokio::test]
async fn blocked_delivery_falls_back_to_images_and_cleans() {
    let dir = tempfile::tempdir().unwrap();
    let archive = archive()
        .with_delivery(ProbeOutcome::Blocked)
        .with_image_source(|_| page_image());
    let (ctx, mock) = ctx(Settings::default(), archive);
    let outf = dir.path().join("chenu.pdf");

    let outcome = process_entry(&ctx, &article(), &outf).await;
    assert_eq!(outcome.status, EntryStatus::Processed, "{:?}", outcome.error);
    let processed = outcome.output.unwrap();
    assert_eq!(processed, dir.path().join("processed-chenu.pdf"));
    assert_eq!(page_count(&processed), 23);
    // The raw download is removed once cleaned.
    assert!(!outf.exists());
    assert_eq!(mock.calls("fetch_pdf"), 0);
    assert_eq!(mock.calls("fetch_page_image"), 23);
    // No OCR geometry is requested for image pages.
    assert_eq!(mock.calls("ocr_bounds"), 0);
}

#[tokio::test]
async fn default_settings_clean_around_the_kept_cover() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = archive().with_chunk_source(|_, count| scanned_chunk(count));
    for page in 107..=206 {
        archive = archive.with_bounds(&issue(), page, text_block_bounds());
    }
    let (ctx, mock) = ctx(Settings::default(), archive);
    let outf = dir.path().join("chenu.pdf");

    let outcome = process_entry(&ctx, &article(), &outf).await;
    assert_eq!(outcome.status, EntryStatus::Processed, "{:?}", outcome.error);
    let processed = outcome.output.unwrap();
    assert_eq!(page_count(&processed), 24);
    assert_eq!(mock.calls("ocr_bounds"), 23);

    let doc = Document::load(&processed).unwrap();
    let pages: Vec<ObjectId> = doc.get_pages().into_values().collect();
    // The cover is only scaled to the cleaned page size.
    assert_eq!(crop_box(&doc, pages[0]), None);
    for page_id in &pages[1..] {
        assert_eq!(crop_box(&doc, *page_id), Some(vec![58.0, 76.0, 142.0, 224.0]));
    }
}

#[tokio::test]
async fn suppressed_cover_cleans_every_page() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.processing.suppress_cover = true;
    let archive = archive().with_chunk_source(|_, count| scanned_chunk(count));
    let (ctx, _mock) = ctx(settings, archive);
    let outf = dir.path().join("chenu.pdf");

    let outcome = process_entry(&ctx, &article(), &outf).await;
    assert_eq!(outcome.status, EntryStatus::Processed, "{:?}", outcome.error);
    let processed = outcome.output.unwrap();
    let doc = Document::load(&processed).unwrap();
    assert_eq!(doc.get_pages().len(), 23);
    // No OCR geometry is known, so every page falls back to ink detection.
    for page_id in doc.get_pages().values() {
        assert_eq!(crop_box(&doc, *page_id), Some(vec![50.0, 70.0, 150.0, 230.0]));
    }
}

#[tokio::test]
async fn ocr_bounds_follow_downloaded_pages_across_a_plate() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = archive_with(pages_with_plate()).with_chunk_source(|_, count| scanned_chunk(count));
    for page in (107..=207).filter(|p| *p != 142) {
        archive = archive.with_bounds(&issue(), page, text_block_bounds());
    }
    let (ctx, mock) = ctx(Settings::default(), archive);
    let outf = dir.path().join("chenu.pdf");

    let outcome = process_entry(&ctx, &article(), &outf).await;
    assert_eq!(outcome.status, EntryStatus::Processed, "{:?}", outcome.error);
    // Physical pages 141..=164, the plate included.
    assert_eq!(mock.calls("ocr_bounds"), 24);

    let processed = outcome.output.unwrap();
    let doc = Document::load(&processed).unwrap();
    let pages: Vec<ObjectId> = doc.get_pages().into_values().collect();
    assert_eq!(pages.len(), 25);
    let ocr_crop = Some(vec![58.0, 76.0, 142.0, 224.0]);
    assert_eq!(crop_box(&doc, pages[0]), None);
    assert_eq!(crop_box(&doc, pages[1]), ocr_crop);
    // The plate has no OCR geometry and is cropped to its ink.
    assert_eq!(crop_box(&doc, pages[2]), Some(vec![50.0, 70.0, 150.0, 230.0]));
    assert_eq!(crop_box(&doc, pages[3]), ocr_crop);
    assert_eq!(crop_box(&doc, pages[24]), ocr_crop);
}

#[tokio::test]
async fn second_run_hits_the_match_cache() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, mock) = ctx(download_only(), archive());

    let first = process_entry(&ctx, &article(), &dir.path().join("a.pdf")).await;
    assert_eq!(first.status, EntryStatus::Downloaded);
    let searches = mock.calls("search");

    let second = process_entry(&ctx, &article(), &dir.path().join("b.pdf")).await;
    assert_eq!(second.status, EntryStatus::Downloaded);
    assert_eq!(second.ark, first.ark);
    assert_eq!(mock.calls("search"), searches);
    assert_eq!(mock.calls("toc"), 1);
}

#[tokio::test]
async fn whole_issue_keeps_only_the_first_cover() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, mock) = ctx(download_only(), archive());
    let outf = dir.path().join("issue.pdf");

    let path = fetch_issue(&ctx, &issue(), &outf).await.unwrap();
    assert_eq!(path, outf);
    // Physical pages 1..=206 in chunks of 100, 100 and 6, plus one cover.
    assert_eq!(mock.calls("fetch_pdf"), 3);
    assert_eq!(page_count(&outf), 207);
}

// ── batches ────────────────────────────────────────────────────────────

#[tokio::test]
async fn batch_keeps_going_past_unsupported_entries() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, _mock) = ctx(download_only(), archive());
    let records = vec![
        article(),
        BibliographicRecord::Book(Book {
            title: "Summa theologiae".into(),
            author: "Thomas".into(),
            ..Default::default()
        }),
        article(),
    ];

    let outcomes = run_batch(records, dir.path(), ctx, |_| {}, CancellationToken::new()).await;
    let statuses: Vec<_> = outcomes.iter().map(|o| o.status).collect();
    assert_eq!(
        statuses,
        vec![EntryStatus::Downloaded, EntryStatus::Unsupported, EntryStatus::Downloaded]
    );
    let first = outcomes[0].output.clone().unwrap();
    let third = outcomes[2].output.clone().unwrap();
    assert_ne!(first, third);
    assert!(first.exists() && third.exists());
}
