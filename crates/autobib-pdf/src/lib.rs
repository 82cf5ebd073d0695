//! Page cleaning for scanned PDF documents.
//!
//! Gallica serves every page as a single embedded raster with an invisible
//! OCR text layer on top. This crate pulls those rasters back out without
//! resampling, works out where the printed text block sits, and writes a
//! new document that is either re-cropped (text layer kept) or rebuilt from
//! a filtered raster (text layer dropped).

pub mod assemble;
pub mod cleaner;
pub mod crop;
pub mod extract;
pub mod filter;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use assemble::{image_to_pdf, merge_pdfs};
pub use cleaner::{ProcessOptions, default_output_path, process_pdf};
pub use crop::{crop_bounds, ocr_crop_bounds};
pub use extract::{ExtractedImage, ImageKind, extract_image};
pub use filter::filter_algorithm;

#[derive(Error, Debug)]
pub enum PdfError {
    #[error("PDF error: {0}")]
    Lopdf(#[from] lopdf::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// No decodable raster was found on a page.
    #[error("extraction error: {0}")]
    Extraction(String),
    /// The computed crop box has no area.
    #[error("degenerate crop box: {0}")]
    Crop(String),
    /// The page raster uses a codec we can carry but not decode.
    #[error("cannot decode {0} image data")]
    UnsupportedCodec(&'static str),
    #[error("malformed PDF: {0}")]
    Malformed(String),
}

/// Pixel-space bounding box, `(left, upper)` inclusive and `(right, lower)`
/// exclusive, the same convention image crates use for crops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bbox {
    pub left: u32,
    pub upper: u32,
    pub right: u32,
    pub lower: u32,
}

impl Bbox {
    pub fn new(left: u32, upper: u32, right: u32, lower: u32) -> Self {
        Self {
            left,
            upper,
            right,
            lower,
        }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.lower.saturating_sub(self.upper)
    }

    /// Grow outward by `by` pixels on every side, clamped to a `width` x `height` canvas.
    pub fn grow(&self, by: u32, width: u32, height: u32) -> Self {
        Self {
            left: self.left.saturating_sub(by),
            upper: self.upper.saturating_sub(by),
            right: (self.right + by).min(width),
            lower: (self.lower + by).min(height),
        }
    }
}

/// Text-block geometry reported by the archive's OCR engine for one page.
///
/// Coordinates live on the OCR canvas (`total_width` x `total_height`), which
/// is not the resolution of the raster embedded in the delivered PDF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnscaledPageBounds {
    pub upper: (u32, u32),
    pub lower: (u32, u32),
    pub total_width: u32,
    pub total_height: u32,
}
