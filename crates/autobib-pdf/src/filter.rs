//! Crude binarization for rasterized output pages.

use image::{DynamicImage, GrayImage};

use crate::crop::autocontrast;

/// Bits of gray kept by the posterize step.
const POSTERIZE_BITS: u8 = 4;
/// Levels at or below this are treated as shadow and compressed.
const SHADOW: u8 = 80;
/// Levels at or above this are blown out to paper white.
const HIGHLIGHT: u8 = 180;

/// Posterize, remap so shadows darken and highlights turn white, then
/// autocontrast. Paper noise and bleed-through mostly vanish while text stays
/// solid.
pub fn filter_algorithm(img: &DynamicImage) -> GrayImage {
    let mut gray = img.to_luma8();
    for p in gray.pixels_mut() {
        p[0] = remap(posterize(p[0], POSTERIZE_BITS));
    }
    autocontrast(&gray)
}

fn posterize(value: u8, bits: u8) -> u8 {
    let mask = !(u8::MAX >> bits);
    value & mask
}

fn remap(value: u8) -> u8 {
    match value {
        v if v <= SHADOW => v / 2,
        v if v >= HIGHLIGHT => u8::MAX,
        v => {
            let span = (HIGHLIGHT - SHADOW) as u32;
            let lo = (SHADOW / 2) as u32;
            (lo + (v - SHADOW) as u32 * (u8::MAX as u32 - lo) / span) as u8
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn posterize_drops_low_bits() {
        assert_eq!(posterize(0b1011_0111, 4), 0b1011_0000);
        assert_eq!(posterize(255, 4), 240);
    }

    #[test]
    fn remap_is_monotonic_and_saturates() {
        let mapped: Vec<u8> = (0..=255u8).map(remap).collect();
        assert!(mapped.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(remap(0), 0);
        assert_eq!(remap(HIGHLIGHT), 255);
        assert_eq!(remap(SHADOW), SHADOW / 2);
    }

    #[test]
    fn filter_whitens_paper_and_keeps_ink() {
        let mut img = GrayImage::from_pixel(4, 1, Luma([200]));
        img.put_pixel(0, 0, Luma([20]));
        img.put_pixel(1, 0, Luma([195]));
        let out = filter_algorithm(&DynamicImage::ImageLuma8(img));
        assert_eq!(out.get_pixel(0, 0)[0], 0);
        assert_eq!(out.get_pixel(1, 0)[0], 255);
        assert_eq!(out.get_pixel(3, 0)[0], 255);
    }
}
