use image::GenericImageView;
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use serde::{Deserialize, Serialize};

use crate::error::AnnotationError;
use crate::features::codec::SignatureImage;

/// Width, in page units, every embedded signature is scaled to.
pub const SIGNATURE_TARGET_WIDTH: f64 = 200.0;

const XOBJECT_PREFIX: &str = "ImSig";
// A4 portrait, used when neither the page nor its ancestors declare a MediaBox.
const FALLBACK_PAGE_SIZE: (f64, f64) = (595.0, 842.0);

/// Page-local position of a signature: bottom-left corner in page space, zero-based page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub x: f64,
    pub y: f64,
    pub page_index: i64,
}

impl Placement {
    pub fn new(x: f64, y: f64, page_index: i64) -> Self {
        Self { x, y, page_index }
    }

    /// Converts a top-left-origin position (as captured on screen) into page space,
    /// given the page height and the height the signature will be drawn at.
    pub fn from_top_left(
        x: f64,
        y_top: f64,
        page_height: f64,
        drawn_height: f64,
        page_index: i64,
    ) -> Self {
        Self {
            x,
            y: (page_height - y_top - drawn_height).max(0.0),
            page_index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width: f64,
    pub height: f64,
}

/// Size the signature is drawn at for an image of the given pixel dimensions.
pub fn scaled_size(pixel_width: u32, pixel_height: u32) -> (f64, f64) {
    let scale = SIGNATURE_TARGET_WIDTH / pixel_width as f64;
    (SIGNATURE_TARGET_WIDTH, pixel_height as f64 * scale)
}

/// Burns a raster signature into a page of a PDF and returns the re-serialized document.
///
/// The input bytes are parsed into a private working copy; nothing is emitted unless
/// every step succeeds.
pub fn annotate(
    document_bytes: &[u8],
    signature: &SignatureImage,
    placement: &Placement,
) -> Result<Vec<u8>, AnnotationError> {
    if !placement.x.is_finite() || !placement.y.is_finite() {
        return Err(AnnotationError::InvalidPlacement {
            x: placement.x,
            y: placement.y,
        });
    }
    let mut doc = load_document(document_bytes)?;
    let page_id = resolve_page(&doc, placement.page_index)?;

    let img = image::load_from_memory(&signature.bytes)
        .map_err(|e| AnnotationError::InvalidImage(e.to_string()))?;
    let (img_w, img_h) = img.dimensions();
    if img_w == 0 || img_h == 0 {
        return Err(AnnotationError::InvalidImage("image has no pixels".into()));
    }
    let image_id = embed_image(&mut doc, &img.to_rgba8());

    let name = attach_xobject(&mut doc, page_id, image_id)?;

    let (width, height) = scaled_size(img_w, img_h);
    let content = format!(
        "q {} 0 0 {} {} {} cm /{} Do Q",
        width, height, placement.x, placement.y, name
    );
    doc.add_page_contents(page_id, content.into_bytes())
        .map_err(|e| AnnotationError::MalformedDocument(format!("page contents: {e}")))?;

    let mut out = Vec::new();
    doc.save_to(&mut out)
        .map_err(|e| AnnotationError::Serialize(e.to_string()))?;
    log::debug!(
        "annotated page {} with {}x{}px signature as /{}",
        placement.page_index,
        img_w,
        img_h,
        name
    );
    Ok(out)
}

pub fn page_count(document_bytes: &[u8]) -> Result<usize, AnnotationError> {
    Ok(load_document(document_bytes)?.get_pages().len())
}

pub fn page_size(document_bytes: &[u8], page_index: i64) -> Result<PageSize, AnnotationError> {
    let doc = load_document(document_bytes)?;
    let page_id = resolve_page(&doc, page_index)?;
    let (width, height) = inherited(&doc, page_id, b"MediaBox")
        .and_then(|obj| media_box_size(&doc, obj))
        .unwrap_or(FALLBACK_PAGE_SIZE);
    Ok(PageSize { width, height })
}

fn load_document(bytes: &[u8]) -> Result<Document, AnnotationError> {
    Document::load_mem(bytes).map_err(|e| AnnotationError::MalformedDocument(e.to_string()))
}

fn resolve_page(doc: &Document, page_index: i64) -> Result<ObjectId, AnnotationError> {
    let pages = doc.get_pages();
    let page_count = pages.len();
    let out_of_range = AnnotationError::PageIndexOutOfRange {
        index: page_index,
        page_count,
    };
    if page_index < 0 || page_index as usize >= page_count {
        return Err(out_of_range);
    }
    // lopdf numbers pages from 1
    pages
        .get(&(page_index as u32 + 1))
        .copied()
        .ok_or(out_of_range)
}

fn embed_image(doc: &mut Document, rgba: &image::RgbaImage) -> ObjectId {
    let (img_w, img_h) = rgba.dimensions();
    let mut rgb = Vec::with_capacity((img_w * img_h * 3) as usize);
    let mut alpha = Vec::with_capacity((img_w * img_h) as usize);
    for pixel in rgba.pixels() {
        rgb.extend_from_slice(&pixel.0[..3]);
        alpha.push(pixel[3]);
    }

    let smask_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => img_w as i64,
            "Height" => img_h as i64,
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 8,
        },
        alpha,
    ));
    doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => img_w as i64,
            "Height" => img_h as i64,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
            "SMask" => smask_id,
        },
        rgb,
    ))
}

/// Registers the image under a fresh name in the page's XObject resources.
///
/// Resources inherited from the page tree or shared by reference with other pages are
/// copied onto this page first, so the new entry stays local to it.
fn attach_xobject(
    doc: &mut Document,
    page_id: ObjectId,
    image_id: ObjectId,
) -> Result<String, AnnotationError> {
    let invalid = |what: &str| AnnotationError::MalformedDocument(format!("{what} is not a dictionary"));

    let mut resources = match inherited(doc, page_id, b"Resources") {
        Some(Object::Dictionary(dict)) => dict.clone(),
        Some(Object::Reference(id)) => doc
            .get_object(*id)
            .and_then(|o| o.as_dict())
            .cloned()
            .map_err(|_| invalid("page resources"))?,
        Some(_) => return Err(invalid("page resources")),
        None => Dictionary::new(),
    };
    let mut xobjects = match resources.get(b"XObject") {
        Ok(Object::Dictionary(dict)) => dict.clone(),
        Ok(Object::Reference(id)) => doc
            .get_object(*id)
            .and_then(|o| o.as_dict())
            .cloned()
            .map_err(|_| invalid("xobject resources"))?,
        Ok(_) => return Err(invalid("xobject resources")),
        Err(_) => Dictionary::new(),
    };

    let name = free_xobject_name(&xobjects);
    xobjects.set(name.as_bytes().to_vec(), image_id);
    resources.set("XObject", Object::Dictionary(xobjects));
    doc.get_object_mut(page_id)
        .and_then(|o| o.as_dict_mut())
        .map_err(|_| invalid("page"))?
        .set("Resources", Object::Dictionary(resources));
    Ok(name)
}

fn free_xobject_name(xobjects: &Dictionary) -> String {
    (0..)
        .map(|n| match n {
            0 => XOBJECT_PREFIX.to_string(),
            n => format!("{XOBJECT_PREFIX}{n}"),
        })
        .find(|candidate| !xobjects.has(candidate.as_bytes()))
        .unwrap_or_else(|| XOBJECT_PREFIX.to_string())
}

/// Looks up a page attribute, following `Parent` links for inheritable keys.
fn inherited<'a>(doc: &'a Document, page_id: ObjectId, key: &[u8]) -> Option<&'a Object> {
    let mut current = Some(page_id);
    while let Some(id) = current {
        let dict = doc.get_object(id).and_then(|o| o.as_dict()).ok()?;
        if let Ok(value) = dict.get(key) {
            return Some(value);
        }
        current = dict.get(b"Parent").and_then(|p| p.as_reference()).ok();
    }
    None
}

fn media_box_size(doc: &Document, raw: &Object) -> Option<(f64, f64)> {
    let resolved = match raw {
        Object::Reference(id) => doc.get_object(*id).ok()?,
        other => other,
    };
    let arr = resolved.as_array().ok()?;
    if arr.len() != 4 {
        return None;
    }
    let llx = obj_to_f64(&arr[0])?;
    let lly = obj_to_f64(&arr[1])?;
    let urx = obj_to_f64(&arr[2])?;
    let ury = obj_to_f64(&arr[3])?;
    Some((urx - llx, ury - lly))
}

fn obj_to_f64(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(f) => Some((*f).into()),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::features::codec::encode_capture;

    /// Builds a document with `page_count` Letter pages, each carrying a little text.
    pub fn sample_pdf(page_count: usize) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id: ObjectId = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut page_ids: Vec<Object> = Vec::new();
        for n in 0..page_count {
            let text = format!("BT /F1 12 Tf 72 720 Td (Delivery note page {}) Tj ET", n + 1);
            let content_id = doc.add_object(Stream::new(dictionary! {}, text.into_bytes()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
                "Contents" => content_id,
                "Resources" => resources_id,
            });
            page_ids.push(page_id.into());
        }

        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => page_ids,
                "Count" => page_count as i64,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut buf = Vec::new();
        doc.save_to(&mut buf).expect("failed to save test PDF");
        buf
    }

    pub fn sample_signature(width: u32, height: u32) -> SignatureImage {
        let mut rgba = vec![0u8; (width * height * 4) as usize];
        for (i, px) in rgba.chunks_mut(4).enumerate() {
            if i % 3 == 0 {
                px.copy_from_slice(&[10, 20, 120, 255]);
            }
        }
        encode_capture(width, height, &rgba).expect("failed to encode test signature")
    }
}
