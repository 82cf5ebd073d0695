//! Pull the embedded page raster out of a PDF page without resampling.

use std::io::Cursor;

use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};

use crate::PdfError;

/// Container type of an extracted raster, named after the file extension it
/// would be saved with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// Lossless Flate data, reconstructed into pixels and re-encoded as PNG.
    Png,
    /// DCT (baseline JPEG) stream, copied verbatim.
    Jpg,
    /// JPX (JPEG 2000) stream, copied verbatim.
    Jp2,
    /// CCITT fax data wrapped in a TIFF header.
    Tiff,
}

impl ImageKind {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageKind::Png => "png",
            ImageKind::Jpg => "jpg",
            ImageKind::Jp2 => "jp2",
            ImageKind::Tiff => "tiff",
        }
    }

    fn from_filter(filter: &[u8]) -> Option<Self> {
        match filter {
            b"FlateDecode" => Some(ImageKind::Png),
            b"DCTDecode" => Some(ImageKind::Jpg),
            b"JPXDecode" => Some(ImageKind::Jp2),
            b"CCITTFaxDecode" => Some(ImageKind::Tiff),
            _ => None,
        }
    }
}

/// A page raster in its native encoding.
#[derive(Debug, Clone)]
pub struct ExtractedImage {
    pub kind: ImageKind,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl ExtractedImage {
    /// Decode into pixels for analysis.
    pub fn decode(&self) -> Result<DynamicImage, PdfError> {
        let format = match self.kind {
            ImageKind::Png => ImageFormat::Png,
            ImageKind::Jpg => ImageFormat::Jpeg,
            ImageKind::Tiff => ImageFormat::Tiff,
            ImageKind::Jp2 => return Err(PdfError::UnsupportedCodec("jp2")),
        };
        Ok(image::load_from_memory_with_format(&self.data, format)?)
    }
}

/// Extract the first usable raster from a page's XObject table.
///
/// Image XObjects with an unknown codec are skipped and the scan continues.
/// A page with no usable raster at all is an [`PdfError::Extraction`].
pub fn extract_image(doc: &Document, page_id: ObjectId) -> Result<ExtractedImage, PdfError> {
    let resources = match inherited(doc, page_id, b"Resources")? {
        Some(obj) => resolve(doc, obj)?.as_dict()?,
        None => return Err(PdfError::Extraction("No image found.".into())),
    };
    let xobjects = match resources.get(b"XObject") {
        Ok(obj) => resolve(doc, obj)?.as_dict()?,
        Err(_) => return Err(PdfError::Extraction("No image found.".into())),
    };

    for (name, obj) in xobjects.iter() {
        let Ok(stream) = resolve(doc, obj).and_then(Object::as_stream) else {
            continue;
        };
        if !matches!(stream.dict.get(b"Subtype").and_then(Object::as_name), Ok(b"Image")) {
            continue;
        }
        // Unfiltered samples are stored raw and rebuilt like Flate data.
        let kind = match stream_filter(&stream.dict) {
            None => ImageKind::Png,
            Some(filter) => match ImageKind::from_filter(filter) {
                Some(kind) => kind,
                None => {
                    tracing::debug!(
                        xobject = %String::from_utf8_lossy(name),
                        filter = %String::from_utf8_lossy(filter),
                        "skipping image with unsupported filter"
                    );
                    continue;
                }
            },
        };
        match build_image(doc, stream, kind) {
            Ok(img) => return Ok(img),
            Err(e) => {
                tracing::debug!(xobject = %String::from_utf8_lossy(name), error = %e, "skipping image");
            }
        }
    }

    Err(PdfError::Extraction("No image found.".into()))
}

fn build_image(doc: &Document, stream: &Stream, kind: ImageKind) -> Result<ExtractedImage, PdfError> {
    let width = dict_u32(&stream.dict, b"Width")?;
    let height = dict_u32(&stream.dict, b"Height")?;
    let data = match kind {
        ImageKind::Jpg | ImageKind::Jp2 => stream.content.clone(),
        ImageKind::Png => reconstruct_pixels(doc, stream, width, height)?,
        ImageKind::Tiff => {
            let params = stream
                .dict
                .get(b"DecodeParms")
                .ok()
                .and_then(|o| resolve(doc, o).ok())
                .and_then(|o| match o {
                    Object::Array(arr) => arr.first().and_then(|p| p.as_dict().ok()),
                    other => other.as_dict().ok(),
                });
            let k = params
                .and_then(|p| p.get(b"K").ok())
                .and_then(|o| o.as_i64().ok())
                .unwrap_or(0);
            let black_is_1 = params
                .and_then(|p| p.get(b"BlackIs1").ok())
                .and_then(|o| o.as_bool().ok())
                .unwrap_or(false);
            ccitt_to_tiff(&stream.content, width, height, k, black_is_1)
        }
    };
    Ok(ExtractedImage {
        kind,
        width,
        height,
        data,
    })
}

enum ColorSpace {
    Gray,
    Rgb,
    Indexed(Vec<u8>),
}

fn color_space(doc: &Document, dict: &Dictionary) -> Result<ColorSpace, PdfError> {
    let Ok(obj) = dict.get(b"ColorSpace") else {
        return Ok(ColorSpace::Gray);
    };
    match resolve(doc, obj)? {
        Object::Name(name) => match name.as_slice() {
            b"DeviceRGB" | b"CalRGB" => Ok(ColorSpace::Rgb),
            b"DeviceGray" | b"CalGray" => Ok(ColorSpace::Gray),
            other => Err(PdfError::Malformed(format!(
                "unsupported color space {}",
                String::from_utf8_lossy(other)
            ))),
        },
        Object::Array(arr) => {
            let family = arr.first().and_then(|o| o.as_name().ok()).unwrap_or_default();
            match family {
                b"ICCBased" => {
                    let n = arr
                        .get(1)
                        .and_then(|o| resolve(doc, o).ok())
                        .and_then(|o| o.as_stream().ok())
                        .and_then(|s| s.dict.get(b"N").ok())
                        .and_then(|o| o.as_i64().ok())
                        .unwrap_or(1);
                    Ok(if n == 3 { ColorSpace::Rgb } else { ColorSpace::Gray })
                }
                b"Indexed" => {
                    let lookup = arr
                        .get(3)
                        .map(|o| resolve(doc, o))
                        .transpose()?
                        .ok_or_else(|| PdfError::Malformed("indexed color space without lookup".into()))?;
                    let palette = match lookup {
                        Object::String(bytes, _) => bytes.clone(),
                        Object::Stream(s) => s.decompressed_content().unwrap_or_else(|_| s.content.clone()),
                        _ => return Err(PdfError::Malformed("bad indexed lookup".into())),
                    };
                    Ok(ColorSpace::Indexed(palette))
                }
                _ => Err(PdfError::Malformed("unsupported color space array".into())),
            }
        }
        _ => Err(PdfError::Malformed("bad color space".into())),
    }
}

/// Rebuild pixels from a Flate or unfiltered stream and store them as PNG.
fn reconstruct_pixels(
    doc: &Document,
    stream: &Stream,
    width: u32,
    height: u32,
) -> Result<Vec<u8>, PdfError> {
    let raw = match stream_filter(&stream.dict) {
        Some(_) => stream.decompressed_content()?,
        None => stream.content.clone(),
    };
    let bpc = stream
        .dict
        .get(b"BitsPerComponent")
        .and_then(Object::as_i64)
        .unwrap_or(8);

    let img = match (color_space(doc, &stream.dict)?, bpc) {
        (ColorSpace::Rgb, 8) => RgbImage::from_raw(width, height, raw)
            .map(DynamicImage::ImageRgb8)
            .ok_or_else(|| PdfError::Malformed("RGB buffer too short".into()))?,
        (ColorSpace::Gray, 8) => GrayImage::from_raw(width, height, raw)
            .map(DynamicImage::ImageLuma8)
            .ok_or_else(|| PdfError::Malformed("gray buffer too short".into()))?,
        (ColorSpace::Gray, 1) => DynamicImage::ImageLuma8(unpack_bits(&raw, width, height)?),
        (ColorSpace::Indexed(palette), 8) => {
            let mut rgb = Vec::with_capacity(raw.len() * 3);
            for &idx in &raw {
                let at = idx as usize * 3;
                match palette.get(at..at + 3) {
                    Some(px) => rgb.extend_from_slice(px),
                    None => rgb.extend_from_slice(&[0, 0, 0]),
                }
            }
            RgbImage::from_raw(width, height, rgb)
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(|| PdfError::Malformed("indexed buffer too short".into()))?
        }
        (_, bpc) => {
            return Err(PdfError::Malformed(format!(
                "unsupported bit depth {bpc}"
            )));
        }
    };

    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

/// Expand 1-bit rows (each padded to a whole byte) to 8-bit gray.
fn unpack_bits(raw: &[u8], width: u32, height: u32) -> Result<GrayImage, PdfError> {
    let row_bytes = (width as usize).div_ceil(8);
    if raw.len() < row_bytes * height as usize {
        return Err(PdfError::Malformed("bilevel buffer too short".into()));
    }
    Ok(GrayImage::from_fn(width, height, |x, y| {
        let byte = raw[y as usize * row_bytes + x as usize / 8];
        let bit = (byte >> (7 - (x % 8))) & 1;
        image::Luma([if bit == 1 { 255 } else { 0 }])
    }))
}

/// Wrap a raw CCITT stream in a single-strip little-endian TIFF.
fn ccitt_to_tiff(data: &[u8], width: u32, height: u32, k: i64, black_is_1: bool) -> Vec<u8> {
    const SHORT: u16 = 3;
    const LONG: u16 = 4;
    let compression = if k < 0 { 4 } else { 3 };
    let photometric = if black_is_1 { 1 } else { 0 };
    let entries: [(u16, u16, u32); 8] = [
        (256, LONG, width),
        (257, LONG, height),
        (258, SHORT, 1),
        (259, SHORT, compression),
        (262, SHORT, photometric),
        (273, LONG, 0), // patched below
        (278, LONG, height),
        (279, LONG, data.len() as u32),
    ];
    let data_offset = 8 + 2 + entries.len() as u32 * 12 + 4;

    let mut out = Vec::with_capacity(data_offset as usize + data.len());
    out.extend_from_slice(b"II");
    out.extend_from_slice(&42u16.to_le_bytes());
    out.extend_from_slice(&8u32.to_le_bytes());
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    for (tag, kind, value) in entries {
        let value = if tag == 273 { data_offset } else { value };
        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&kind.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        if kind == SHORT {
            out.extend_from_slice(&(value as u16).to_le_bytes());
            out.extend_from_slice(&[0, 0]);
        } else {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(data);
    out
}

fn stream_filter(dict: &Dictionary) -> Option<&[u8]> {
    match dict.get(b"Filter").ok()? {
        Object::Name(name) => Some(name.as_slice()),
        Object::Array(arr) => arr.last().and_then(|o| o.as_name().ok()),
        _ => None,
    }
}

fn dict_u32(dict: &Dictionary, key: &[u8]) -> Result<u32, PdfError> {
    dict.get(key)
        .and_then(Object::as_i64)
        .map(|v| v.max(0) as u32)
        .map_err(|_| {
            PdfError::Malformed(format!("image without /{}", String::from_utf8_lossy(key)))
        })
}

pub(crate) fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> Result<&'a Object, lopdf::Error> {
    match obj {
        Object::Reference(id) => doc.get_object(*id),
        other => Ok(other),
    }
}

/// Look up a page attribute, walking `/Parent` links for inherited values.
pub(crate) fn inherited<'a>(
    doc: &'a Document,
    page_id: ObjectId,
    key: &[u8],
) -> Result<Option<&'a Object>, PdfError> {
    let mut current = page_id;
    loop {
        let dict = doc.get_dictionary(current)?;
        if let Ok(value) = dict.get(key) {
            return Ok(Some(value));
        }
        match dict.get(b"Parent") {
            Ok(parent) => current = parent.as_reference()?,
            Err(_) => return Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::dictionary;
    use crate::assemble::tests_support::single_image_doc;

    #[test]
    fn extract_no_image() {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let page_id = doc.add_object(lopdf::dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 100.into(), 100.into()],
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(lopdf::dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
            }),
        );
        let err = extract_image(&doc, page_id).unwrap_err();
        assert!(err.to_string().contains("No image"));
    }

    #[test]
    fn extract_flate_gray_as_png() {
        let pixels: Vec<u8> = (0..(4 * 3)).map(|i| (i * 20) as u8).collect();
        let (doc, page_id) = single_image_doc(4, 3, "DeviceGray", "FlateDecode", &pixels);
        let img = extract_image(&doc, page_id).unwrap();
        assert_eq!(img.kind, ImageKind::Png);
        assert_eq!(img.kind.extension(), "png");
        let decoded = img.decode().unwrap().to_luma8();
        assert_eq!(decoded.dimensions(), (4, 3));
        assert_eq!(decoded.get_pixel(1, 0)[0], 20);
    }

    #[test]
    fn extract_unfiltered_gray_as_png() {
        let pixels: Vec<u8> = (0..(4 * 3)).map(|i| (i * 20) as u8).collect();
        let (doc, page_id) = single_image_doc(4, 3, "DeviceGray", "", &pixels);
        let img = extract_image(&doc, page_id).unwrap();
        assert_eq!(img.kind, ImageKind::Png);
        let decoded = img.decode().unwrap().to_luma8();
        assert_eq!(decoded.dimensions(), (4, 3));
        assert_eq!(decoded.into_raw(), pixels);
    }

    #[test]
    fn extract_jpeg_verbatim() {
        let gray = GrayImage::from_pixel(8, 8, image::Luma([200]));
        let mut jpeg = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(gray)
            .write_to(&mut jpeg, ImageFormat::Jpeg)
            .unwrap();
        let jpeg = jpeg.into_inner();
        let (doc, page_id) = single_image_doc(8, 8, "DeviceGray", "DCTDecode", &jpeg);
        let img = extract_image(&doc, page_id).unwrap();
        assert_eq!(img.kind, ImageKind::Jpg);
        assert_eq!(img.data, jpeg);
    }

    #[test]
    fn unknown_codec_is_skipped() {
        let (doc, page_id) = single_image_doc(2, 2, "DeviceGray", "JBIG2Decode", &[0; 4]);
        assert!(matches!(
            extract_image(&doc, page_id),
            Err(PdfError::Extraction(_))
        ));
    }

    #[test]
    fn jp2_is_carried_but_not_decoded() {
        let (doc, page_id) = single_image_doc(2, 2, "DeviceRGB", "JPXDecode", b"jp2 bytes");
        let img = extract_image(&doc, page_id).unwrap();
        assert_eq!(img.kind.extension(), "jp2");
        assert!(matches!(img.decode(), Err(PdfError::UnsupportedCodec("jp2"))));
    }

    #[test]
    fn ccitt_wrapper_has_tiff_header() {
        let tiff = ccitt_to_tiff(&[1, 2, 3], 16, 4, -1, false);
        assert_eq!(&tiff[..4], b"II*\0");
        assert_eq!(&tiff[tiff.len() - 3..], &[1, 2, 3]);
    }

    #[test]
    fn unpack_bilevel_rows() {
        let img = unpack_bits(&[0b1000_0000, 0b0100_0000], 2, 2).unwrap();
        assert_eq!(img.get_pixel(0, 0)[0], 255);
        assert_eq!(img.get_pixel(1, 0)[0], 0);
        assert_eq!(img.get_pixel(1, 1)[0], 255);
    }
}
