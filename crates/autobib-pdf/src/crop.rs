//! Crop box detection for scanned pages.
//!
//! Two strategies: a threshold heuristic that needs nothing but the raster,
//! and a refinement of the archive's OCR text block that hunts for ruled
//! lines or running heads just outside it.

use image::{DynamicImage, GrayImage};

use crate::{Bbox, UnscaledPageBounds};

/// Gray level separating ink from paper after autocontrast.
pub const THRESHOLD: u8 = 128;
/// Border ignored on every side to skip scanner-edge shadows.
pub const EDGE_MARGIN: u32 = 40;
/// Padding added around the detected foreground.
pub const GROW_BY: u32 = 10;

/// Stretch the gray range of `img` to the full 0..=255 scale.
pub fn autocontrast(img: &GrayImage) -> GrayImage {
    let (lo, hi) = img
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
    if hi <= lo {
        return img.clone();
    }
    let span = (hi - lo) as u32;
    let mut out = img.clone();
    for p in out.pixels_mut() {
        p[0] = ((p[0] - lo) as u32 * 255 / span) as u8;
    }
    out
}

/// Grayscale, autocontrast and binarize: ink is 0, paper is 255.
pub fn prepare_img(img: &DynamicImage, threshold: u8) -> GrayImage {
    let mut gray = autocontrast(&img.to_luma8());
    for p in gray.pixels_mut() {
        p[0] = if p[0] > threshold { 255 } else { 0 };
    }
    gray
}

/// Heuristic crop: bounding box of the ink inside the edge margin, grown by
/// [`GROW_BY`]. A page with no ink keeps its full extent.
pub fn crop_bounds(img: &DynamicImage) -> Bbox {
    let prepared = prepare_img(img, THRESHOLD);
    let (width, height) = prepared.dimensions();
    let margin = if width > 2 * EDGE_MARGIN && height > 2 * EDGE_MARGIN {
        EDGE_MARGIN
    } else {
        0
    };

    let mut found: Option<Bbox> = None;
    for y in margin..height - margin {
        for x in margin..width - margin {
            if prepared.get_pixel(x, y)[0] != 0 {
                continue;
            }
            found = Some(match found {
                None => Bbox::new(x, y, x + 1, y + 1),
                Some(b) => Bbox::new(
                    b.left.min(x),
                    b.upper.min(y),
                    b.right.max(x + 1),
                    b.lower.max(y + 1),
                ),
            });
        }
    }

    match found {
        Some(b) => b.grow(GROW_BY, width, height),
        None => Bbox::new(0, 0, width, height),
    }
}

/// Scale OCR bounds onto the raster and refine the top and bottom edges.
///
/// Within a window of 5% of the page height above and below the text block,
/// the row-mean gradient is scanned outward for a peak/trough pair beyond
/// mean ± 1.5·stddev. A pair found above moves the top edge up to it; a
/// trough/peak pair below moves the bottom edge down. Edges with no pair
/// stay where the OCR put them. The result is then stretched slightly.
pub fn ocr_crop_bounds(img: &DynamicImage, bounds: &UnscaledPageBounds) -> Bbox {
    let gray = img.to_luma8();
    let (width, height) = gray.dimensions();
    let xscale = width as f64 / bounds.total_width.max(1) as f64;
    let yscale = height as f64 / bounds.total_height.max(1) as f64;

    let x = (bounds.upper.0 as f64 * xscale).round() as i64;
    let y = (bounds.upper.1 as f64 * yscale).round() as i64;
    let text_width = ((bounds.lower.0 as f64 - bounds.upper.0 as f64) * xscale).round() as i64;
    let text_height = ((bounds.lower.1 as f64 - bounds.upper.1 as f64) * yscale).round() as i64;

    let gradient = gradient(&row_means(&gray));
    let n = gradient.len() as i64;
    let mean = gradient.iter().sum::<f64>() / n.max(1) as f64;
    let std = (gradient.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / n.max(1) as f64).sqrt();
    let upper_thresh = mean + 1.5 * std;
    let lower_thresh = mean - 1.5 * std;

    let search = (height as f64 * 0.05).round() as i64;
    let at = |i: i64| gradient[i as usize];

    // Walk upward from the row just above the text block.
    let mut up = 0;
    let mut peaked = false;
    for (offset, row) in (search_start(y - search)..y.min(n)).rev().enumerate() {
        let g = at(row);
        if !peaked && g >= upper_thresh {
            peaked = true;
        }
        if peaked && g <= lower_thresh {
            up = offset as i64;
            break;
        }
    }

    // Walk downward from the row just below it.
    let mut down = 0;
    let mut troughed = false;
    let below_start = (y + text_height).max(0);
    let below_end = (y - search + text_height + 2 * search).min(n);
    for (offset, row) in (below_start..below_end).enumerate() {
        let g = at(row);
        if !troughed && g <= lower_thresh {
            troughed = true;
        }
        if troughed && g >= upper_thresh {
            down = offset as i64;
            break;
        }
    }

    let top = y - up;
    let box_height = text_height + up + down;
    let stretch = (height as f64 * 0.005).round() as i64;

    let left = x - stretch;
    let upper = top - 2 * stretch;
    let right = left + text_width + 2 * stretch;
    let lower = upper + box_height + 4 * stretch;

    Bbox::new(
        clamp(left, width),
        clamp(upper, height),
        clamp(right, width),
        clamp(lower, height),
    )
}

fn search_start(row: i64) -> i64 {
    row.max(0)
}

fn clamp(v: i64, max: u32) -> u32 {
    v.clamp(0, max as i64) as u32
}

fn row_means(gray: &GrayImage) -> Vec<f64> {
    let (width, height) = gray.dimensions();
    (0..height)
        .map(|y| {
            let sum: u64 = (0..width).map(|x| gray.get_pixel(x, y)[0] as u64).sum();
            sum as f64 / width.max(1) as f64
        })
        .collect()
}

/// Second-order central differences inside, first-order at the ends.
fn gradient(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    if n < 2 {
        return vec![0.0; n];
    }
    (0..n)
        .map(|i| match i {
            0 => values[1] - values[0],
            i if i == n - 1 => values[n - 1] - values[n - 2],
            i => (values[i + 1] - values[i - 1]) / 2.0,
        })
        .collect()
}

#[cfg(test)]
pub(crate) fn fill_rect(img: &mut GrayImage, bbox: Bbox, value: u8) {
    for y in bbox.upper..bbox.lower.min(img.height()) {
        for x in bbox.left..bbox.right.min(img.width()) {
            img.put_pixel(x, y, image::Luma([value]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn page(width: u32, height: u32) -> GrayImage {
        GrayImage::from_pixel(width, height, Luma([255]))
    }

    #[test]
    fn autocontrast_stretches_range() {
        let mut img = page(2, 1);
        img.put_pixel(0, 0, Luma([100]));
        img.put_pixel(1, 0, Luma([200]));
        let out = autocontrast(&img);
        assert_eq!(out.get_pixel(0, 0)[0], 0);
        assert_eq!(out.get_pixel(1, 0)[0], 255);
    }

    #[test]
    fn heuristic_crop_grows_ink_box() {
        let mut img = page(200, 300);
        fill_rect(&mut img, Bbox::new(60, 80, 140, 220), 0);
        let bbox = crop_bounds(&DynamicImage::ImageLuma8(img));
        assert_eq!(bbox, Bbox::new(50, 70, 150, 230));
    }

    #[test]
    fn heuristic_crop_ignores_scanner_edge() {
        let mut img = page(200, 300);
        fill_rect(&mut img, Bbox::new(0, 0, 15, 300), 0);
        fill_rect(&mut img, Bbox::new(60, 80, 140, 220), 0);
        let bbox = crop_bounds(&DynamicImage::ImageLuma8(img));
        assert_eq!(bbox, Bbox::new(50, 70, 150, 230));
    }

    #[test]
    fn blank_page_keeps_full_extent() {
        let img = page(120, 90);
        assert_eq!(
            crop_bounds(&DynamicImage::ImageLuma8(img)),
            Bbox::new(0, 0, 120, 90)
        );
    }

    #[test]
    fn gradient_matches_central_differences() {
        assert_eq!(gradient(&[1.0, 2.0, 4.0, 7.0]), vec![1.0, 1.5, 2.5, 3.0]);
        assert!(gradient(&[]).is_empty());
    }

    fn ruled_page() -> GrayImage {
        // Text block rows 400..1600, a running-head rule at row 350.
        let mut img = page(1000, 2000);
        fill_rect(&mut img, Bbox::new(100, 400, 900, 1600), 0);
        fill_rect(&mut img, Bbox::new(0, 350, 1000, 351), 0);
        img
    }

    #[test]
    fn ocr_crop_extends_to_rule_above() {
        let bounds = UnscaledPageBounds {
            upper: (200, 800),
            lower: (1800, 3200),
            total_width: 2000,
            total_height: 4000,
        };
        let bbox = ocr_crop_bounds(&DynamicImage::ImageLuma8(ruled_page()), &bounds);
        assert_eq!(bbox, Bbox::new(90, 330, 910, 1620));
    }

    #[test]
    fn ocr_crop_without_rule_only_stretches() {
        let mut img = page(1000, 2000);
        fill_rect(&mut img, Bbox::new(100, 400, 900, 1600), 0);
        let bounds = UnscaledPageBounds {
            upper: (100, 400),
            lower: (900, 1600),
            total_width: 1000,
            total_height: 2000,
        };
        let bbox = ocr_crop_bounds(&DynamicImage::ImageLuma8(img), &bounds);
        assert_eq!(bbox, Bbox::new(90, 380, 910, 1620));
    }
}
