//! Per-page cleaning of a downloaded scan.
//!
//! Each page's raster is located, the text block is found (from OCR bounds
//! when the archive supplied them, by ink detection otherwise) and the page
//! is either re-cropped or replaced by a filtered copy of that block. Leading
//! cover pages are left alone apart from being scaled to the cleaned size.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use image::{GrayImage, Luma, imageops};
use lopdf::{Document, ObjectId};

use crate::assemble::{page_box, save, scale_page, set_crop_box, set_raster_page};
use crate::{Bbox, PdfError, UnscaledPageBounds, crop_bounds, extract_image, filter_algorithm, ocr_crop_bounds};

/// Options for [`process_pdf`]. Page indices are zero-based positions in the
/// input document.
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Only move the crop box; keep the original content and OCR text layer.
    pub preserve_text: bool,
    /// Pad every page to the largest processed page.
    pub equal_size: bool,
    /// Leading pages that are a cover: not cleaned, only scaled to fit.
    pub cover_pages: usize,
    /// Pages dropped from the output.
    pub suppress_pages: Vec<usize>,
    /// Return an existing destination untouched.
    pub skip_existing: bool,
    /// OCR text-block bounds per input page, where known.
    pub ocr_bounds: Vec<Option<UnscaledPageBounds>>,
}

impl ProcessOptions {
    fn bounds_for(&self, index: usize) -> Option<UnscaledPageBounds> {
        self.ocr_bounds.get(index).copied().flatten()
    }
}

/// `processed-<name>` next to the input.
pub fn default_output_path(input: &Path) -> PathBuf {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "out.pdf".to_string());
    input.with_file_name(format!("processed-{name}"))
}

enum Cleaned {
    /// New crop box in user space.
    Crop([f32; 4]),
    /// Filtered raster plus points-per-pixel on each axis.
    Raster { img: GrayImage, scale: (f32, f32) },
}

impl Cleaned {
    fn size(&self) -> (f32, f32) {
        match self {
            Cleaned::Crop(b) => (b[2] - b[0], b[3] - b[1]),
            Cleaned::Raster { img, scale } => {
                (img.width() as f32 * scale.0, img.height() as f32 * scale.1)
            }
        }
    }

    fn pad_to(self, width: f32, height: f32) -> Self {
        match self {
            Cleaned::Crop(b) => {
                let dx = (width - (b[2] - b[0])).max(0.0) / 2.0;
                let dy = (height - (b[3] - b[1])).max(0.0) / 2.0;
                Cleaned::Crop([b[0] - dx, b[1] - dy, b[2] + dx, b[3] + dy])
            }
            Cleaned::Raster { img, scale } => {
                let tw = ((width / scale.0).round() as u32).max(img.width());
                let th = ((height / scale.1).round() as u32).max(img.height());
                let mut canvas = GrayImage::from_pixel(tw, th, Luma([255]));
                let ox = (tw - img.width()) / 2;
                let oy = (th - img.height()) / 2;
                imageops::overlay(&mut canvas, &img, ox as i64, oy as i64);
                Cleaned::Raster { img: canvas, scale }
            }
        }
    }
}

/// Clean a downloaded PDF and write the result.
///
/// Returns the destination path, which defaults to [`default_output_path`].
pub fn process_pdf(
    input: &Path,
    output: Option<&Path>,
    opts: &ProcessOptions,
) -> Result<PathBuf, PdfError> {
    let out = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_output_path(input));
    if opts.skip_existing && out.exists() {
        tracing::debug!(path = %out.display(), "output exists, skipping");
        return Ok(out);
    }

    let mut doc = Document::load(input)?;
    let pages: Vec<ObjectId> = doc.get_pages().into_values().collect();
    let suppressed: BTreeSet<usize> = opts.suppress_pages.iter().copied().collect();

    let covers: Vec<usize> = (0..opts.cover_pages.min(pages.len()))
        .filter(|i| !suppressed.contains(i))
        .collect();

    let mut cleaned = Vec::new();
    for (index, page_id) in pages.iter().enumerate() {
        if suppressed.contains(&index) || covers.contains(&index) {
            continue;
        }
        let result = clean_page(&doc, *page_id, opts.bounds_for(index), opts.preserve_text)
            .map_err(|e| match e {
                PdfError::Extraction(msg) => {
                    PdfError::Extraction(format!("page {}: {msg}", index + 1))
                }
                PdfError::Crop(msg) => PdfError::Crop(format!("page {}: {msg}", index + 1)),
                other => other,
            })?;
        cleaned.push((*page_id, result));
    }

    let (max_w, max_h) = cleaned.iter().fold((0f32, 0f32), |(w, h), (_, c)| {
        let (cw, ch) = c.size();
        (w.max(cw), h.max(ch))
    });

    for (page_id, page) in cleaned {
        let page = if opts.equal_size {
            page.pad_to(max_w, max_h)
        } else {
            page
        };
        match page {
            Cleaned::Crop(b) => set_crop_box(&mut doc, page_id, b)?,
            Cleaned::Raster { img, scale } => {
                let (w, h) = (img.width() as f32 * scale.0, img.height() as f32 * scale.1);
                set_raster_page(&mut doc, page_id, &img, w, h)?;
            }
        }
    }

    if max_w > 0.0 && max_h > 0.0 {
        for &index in &covers {
            scale_page(&mut doc, pages[index], max_w, max_h)?;
        }
    }

    if !suppressed.is_empty() {
        let numbers: Vec<u32> = suppressed
            .iter()
            .filter(|i| **i < pages.len())
            .map(|i| *i as u32 + 1)
            .collect();
        doc.delete_pages(&numbers);
    }

    doc.prune_objects();
    doc.compress();
    save(&mut doc, &out)?;
    tracing::info!(
        input = %input.display(),
        output = %out.display(),
        pages = doc.get_pages().len(),
        "processed PDF"
    );
    Ok(out)
}

fn clean_page(
    doc: &Document,
    page_id: ObjectId,
    bounds: Option<UnscaledPageBounds>,
    preserve_text: bool,
) -> Result<Cleaned, PdfError> {
    let extracted = extract_image(doc, page_id)?;
    let media = page_box(doc, page_id, b"MediaBox")?
        .ok_or_else(|| PdfError::Malformed("page without MediaBox".into()))?;
    let img = match extracted.decode() {
        Ok(img) => img,
        Err(PdfError::UnsupportedCodec(codec)) => {
            tracing::warn!(codec, ?page_id, "cannot decode page raster, keeping page uncropped");
            return Ok(Cleaned::Crop(media));
        }
        Err(e) => return Err(e),
    };
    let bbox = match bounds {
        Some(b) => ocr_crop_bounds(&img, &b),
        None => crop_bounds(&img),
    };
    if bbox.width() == 0 || bbox.height() == 0 {
        return Err(PdfError::Crop(format!("{bbox:?} on a {}x{} raster", img.width(), img.height())));
    }
    tracing::debug!(?bbox, ocr = bounds.is_some(), "crop bounds");

    let sx = (media[2] - media[0]) / img.width() as f32;
    let sy = (media[3] - media[1]) / img.height() as f32;

    if preserve_text {
        Ok(Cleaned::Crop(pixel_box_to_user(bbox, media, sx, sy)))
    } else {
        let cropped = img.crop_imm(bbox.left, bbox.upper, bbox.width(), bbox.height());
        Ok(Cleaned::Raster {
            img: filter_algorithm(&cropped),
            scale: (sx, sy),
        })
    }
}

/// Pixel rows count down from the top; PDF user space counts up from the bottom.
fn pixel_box_to_user(bbox: Bbox, media: [f32; 4], sx: f32, sy: f32) -> [f32; 4] {
    [
        media[0] + bbox.left as f32 * sx,
        media[3] - bbox.lower as f32 * sy,
        media[0] + bbox.right as f32 * sx,
        media[3] - bbox.upper as f32 * sy,
    ]
}
