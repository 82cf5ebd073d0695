//! Building, merging and rewriting PDF page trees with lopdf.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::ZlibEncoder;
use image::{ColorType, GenericImageView, GrayImage};
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream, dictionary};

use crate::PdfError;
use crate::extract::inherited;

/// Page attributes that may live on an ancestor `/Pages` node.
const INHERITABLE: [&[u8]; 4] = [b"MediaBox", b"CropBox", b"Resources", b"Rotate"];

/// A fresh document with an empty page tree. Returns the document and the
/// id reserved for the `/Pages` root.
pub(crate) fn new_document() -> (Document, ObjectId) {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    (doc, pages_id)
}

/// Write the `/Pages` root and catalog for `kids`.
pub(crate) fn finish_document(doc: &mut Document, pages_id: ObjectId, kids: Vec<ObjectId>) {
    let count = kids.len() as i64;
    let kids: Vec<Object> = kids.into_iter().map(Object::Reference).collect();
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
}

pub(crate) fn save(doc: &mut Document, path: &Path) -> Result<(), PdfError> {
    let mut out = BufWriter::new(File::create(path)?);
    doc.save_to(&mut out)?;
    out.flush()?;
    Ok(())
}

/// Merge `parts` into `out` in order.
///
/// `strip_first(i)` decides whether the first page of part `i` is dropped,
/// which is how the archive's per-delivery cover pages are removed.
pub fn merge_pdfs(
    parts: &[PathBuf],
    out: &Path,
    strip_first: impl Fn(usize) -> bool,
) -> Result<usize, PdfError> {
    let mut docs = Vec::with_capacity(parts.len());
    for (i, part) in parts.iter().enumerate() {
        let mut doc = Document::load(part)?;
        flatten_inherited(&mut doc)?;
        if strip_first(i) && doc.get_pages().len() > 1 {
            doc.delete_pages(&[1]);
        } else if strip_first(i) {
            tracing::debug!(part = %part.display(), "single-page part, not stripping cover");
        }
        docs.push(doc);
    }
    let mut merged = merge_documents(docs)?;
    let pages = merged.get_pages().len();
    save(&mut merged, out)?;
    Ok(pages)
}

fn merge_documents(docs: Vec<Document>) -> Result<Document, PdfError> {
    let (mut merged, pages_id) = new_document();
    let mut next_id = merged.max_id + 1;
    let mut kids = Vec::new();
    let mut objects = BTreeMap::new();

    for mut doc in docs {
        doc.renumber_objects_with(next_id);
        next_id = doc.max_id + 1;
        let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
        for id in &page_ids {
            let mut page = doc.get_dictionary(*id)?.clone();
            page.set("Parent", pages_id);
            objects.insert(*id, Object::Dictionary(page));
            kids.push(*id);
        }
        for (id, obj) in doc.objects {
            if objects.contains_key(&id) {
                continue;
            }
            match type_name(&obj) {
                Some(b"Catalog") | Some(b"Pages") | Some(b"Page") | Some(b"Outlines")
                | Some(b"Outline") => {}
                _ => {
                    objects.insert(id, obj);
                }
            }
        }
    }

    merged.objects.extend(objects);
    merged.max_id = next_id;
    finish_document(&mut merged, pages_id, kids);
    merged.renumber_objects();
    merged.compress();
    Ok(merged)
}

fn type_name(obj: &Object) -> Option<&[u8]> {
    let dict = match obj {
        Object::Dictionary(d) => d,
        Object::Stream(s) => &s.dict,
        _ => return None,
    };
    dict.get(b"Type").and_then(Object::as_name).ok()
}

/// Copy inherited attributes down onto every page so pages can be moved
/// between trees.
fn flatten_inherited(doc: &mut Document) -> Result<(), PdfError> {
    let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
    for page_id in page_ids {
        let mut missing = Vec::new();
        {
            let page = doc.get_dictionary(page_id)?;
            for key in INHERITABLE {
                if page.has(key) {
                    continue;
                }
                if let Some(value) = inherited(doc, page_id, key)? {
                    missing.push((key, value.clone()));
                }
            }
        }
        let page = doc.get_object_mut(page_id)?.as_dict_mut()?;
        for (key, value) in missing {
            page.set(key.to_vec(), value);
        }
    }
    Ok(())
}

/// Wrap one encoded page image (JPEG, PNG, TIFF) in a single-page PDF at
/// 72 dpi. JPEGs are embedded verbatim; anything else is stored as Flate.
pub fn image_to_pdf(bytes: &[u8]) -> Result<Vec<u8>, PdfError> {
    let img = image::load_from_memory(bytes)?;
    let (width, height) = img.dimensions();
    let format = image::guess_format(bytes)?;

    let (color_space, filter, content) = if format == image::ImageFormat::Jpeg {
        let cs = match img.color() {
            ColorType::L8 | ColorType::L16 => "DeviceGray",
            _ => "DeviceRGB",
        };
        (cs, "DCTDecode", bytes.to_vec())
    } else {
        let rgb = img.to_rgb8();
        ("DeviceRGB", "FlateDecode", deflate(rgb.as_raw())?)
    };

    let (mut doc, pages_id) = new_document();
    let image_id = doc.add_object(
        Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => width as i64,
                "Height" => height as i64,
                "ColorSpace" => color_space,
                "BitsPerComponent" => 8,
                "Filter" => filter,
            },
            content,
        )
        .with_compression(false),
    );
    let page_id = add_image_page(&mut doc, pages_id, image_id, width as f32, height as f32)?;
    finish_document(&mut doc, pages_id, vec![page_id]);

    let mut out = Cursor::new(Vec::new());
    doc.save_to(&mut out)?;
    Ok(out.into_inner())
}

fn add_image_page(
    doc: &mut Document,
    pages_id: ObjectId,
    image_id: ObjectId,
    width_pt: f32,
    height_pt: f32,
) -> Result<ObjectId, PdfError> {
    let content_id = doc.add_object(Stream::new(
        Dictionary::new(),
        draw_image_ops(width_pt, height_pt)?,
    ));
    Ok(doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "MediaBox" => vec![0.into(), 0.into(), width_pt.into(), height_pt.into()],
        "Contents" => content_id,
        "Resources" => dictionary! {
            "XObject" => dictionary! { "Im0" => image_id },
        },
    }))
}

fn draw_image_ops(width_pt: f32, height_pt: f32) -> Result<Vec<u8>, PdfError> {
    let content = Content {
        operations: vec![
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    width_pt.into(),
                    0.into(),
                    0.into(),
                    height_pt.into(),
                    0.into(),
                    0.into(),
                ],
            ),
            Operation::new("Do", vec![Object::Name(b"Im0".to_vec())]),
            Operation::new("Q", vec![]),
        ],
    };
    Ok(content.encode()?)
}

pub(crate) fn deflate(raw: &[u8]) -> Result<Vec<u8>, PdfError> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(raw)?;
    Ok(enc.finish()?)
}

/// `[x0, y0, x1, y1]` of a page box, following inheritance.
pub(crate) fn page_box(doc: &Document, page_id: ObjectId, key: &[u8]) -> Result<Option<[f32; 4]>, PdfError> {
    let Some(obj) = inherited(doc, page_id, key)? else {
        return Ok(None);
    };
    let arr = crate::extract::resolve(doc, obj)?.as_array()?;
    if arr.len() != 4 {
        return Err(PdfError::Malformed(format!(
            "expected 4-element box, got {}",
            arr.len()
        )));
    }
    let mut out = [0f32; 4];
    for (slot, value) in out.iter_mut().zip(arr) {
        *slot = number(value)?;
    }
    Ok(Some(out))
}

fn number(obj: &Object) -> Result<f32, PdfError> {
    match obj {
        Object::Integer(i) => Ok(*i as f32),
        Object::Real(f) => Ok(*f),
        other => Err(PdfError::Malformed(format!("expected number, got {other:?}"))),
    }
}

fn box_object(b: [f32; 4]) -> Object {
    Object::Array(b.iter().map(|v| Object::Real(*v)).collect())
}

/// Restrict the visible area of a page without touching its content.
pub(crate) fn set_crop_box(doc: &mut Document, page_id: ObjectId, crop: [f32; 4]) -> Result<(), PdfError> {
    let media = page_box(doc, page_id, b"MediaBox")?.unwrap_or(crop);
    let media = [
        media[0].min(crop[0]),
        media[1].min(crop[1]),
        media[2].max(crop[2]),
        media[3].max(crop[3]),
    ];
    let page = doc.get_object_mut(page_id)?.as_dict_mut()?;
    page.set("MediaBox", box_object(media));
    page.set("CropBox", box_object(crop));
    Ok(())
}

/// Replace a page's content with a single gray raster drawn at
/// `width_pt` x `height_pt`.
pub(crate) fn set_raster_page(
    doc: &mut Document,
    page_id: ObjectId,
    img: &GrayImage,
    width_pt: f32,
    height_pt: f32,
) -> Result<(), PdfError> {
    let image_id = doc.add_object(
        Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => img.width() as i64,
                "Height" => img.height() as i64,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8,
                "Filter" => "FlateDecode",
            },
            deflate(img.as_raw())?,
        )
        .with_compression(false),
    );
    let content_id = doc.add_object(Stream::new(
        Dictionary::new(),
        draw_image_ops(width_pt, height_pt)?,
    ));
    let page = doc.get_object_mut(page_id)?.as_dict_mut()?;
    page.set(
        "MediaBox",
        box_object([0.0, 0.0, width_pt, height_pt]),
    );
    page.remove(b"CropBox");
    page.set("Contents", content_id);
    page.set(
        "Resources",
        dictionary! {
            "XObject" => dictionary! { "Im0" => image_id },
        },
    );
    Ok(())
}

/// Scale an existing page uniformly so it fits `width_pt` x `height_pt`.
pub(crate) fn scale_page(
    doc: &mut Document,
    page_id: ObjectId,
    width_pt: f32,
    height_pt: f32,
) -> Result<(), PdfError> {
    let visible = match page_box(doc, page_id, b"CropBox")? {
        Some(b) => b,
        None => page_box(doc, page_id, b"MediaBox")?
            .ok_or_else(|| PdfError::Malformed("page without MediaBox".into()))?,
    };
    let (w, h) = (visible[2] - visible[0], visible[3] - visible[1]);
    if w <= 0.0 || h <= 0.0 {
        return Err(PdfError::Malformed("empty page box".into()));
    }
    let s = (width_pt / w).min(height_pt / h);

    let prefix = Content {
        operations: vec![
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    s.into(),
                    0.into(),
                    0.into(),
                    s.into(),
                    (-visible[0] * s).into(),
                    (-visible[1] * s).into(),
                ],
            ),
        ],
    }
    .encode()?;
    let suffix = Content {
        operations: vec![Operation::new("Q", vec![])],
    }
    .encode()?;
    let prefix_id = doc.add_object(Stream::new(Dictionary::new(), prefix));
    let suffix_id = doc.add_object(Stream::new(Dictionary::new(), suffix));

    let page = doc.get_object_mut(page_id)?.as_dict_mut()?;
    let mut contents = vec![Object::Reference(prefix_id)];
    match page.get(b"Contents") {
        Ok(Object::Array(existing)) => contents.extend(existing.iter().cloned()),
        Ok(other) => contents.push(other.clone()),
        Err(_) => {}
    }
    contents.push(Object::Reference(suffix_id));
    page.set("Contents", contents);
    page.set("MediaBox", box_object([0.0, 0.0, w * s, h * s]));
    page.remove(b"CropBox");
    Ok(())
}
