use std::io::Cursor;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use image::{DynamicImage, ImageFormat, ImageOutputFormat, RgbaImage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CaptureError, DecodeError};

pub const PNG_MIME: &str = "image/png";

/// Maps a byte buffer to the integer-array form written to the text-only store.
pub fn encode_for_storage(bytes: &[u8]) -> Value {
    Value::Array(bytes.iter().map(|b| Value::from(*b)).collect())
}

/// Inverse of [`encode_for_storage`].
///
/// A base64 string is accepted as well, so a store written with the compact
/// encoding stays readable.
pub fn decode_from_storage(stored: &Value) -> Result<Vec<u8>, DecodeError> {
    match stored {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                item.as_u64()
                    .and_then(|v| u8::try_from(v).ok())
                    .ok_or_else(|| DecodeError::ByteOutOfRange {
                        index,
                        value: item.to_string(),
                    })
            })
            .collect(),
        Value::String(text) => Ok(B64.decode(text.as_bytes())?),
        Value::Null => Err(DecodeError::UnsupportedShape("null")),
        Value::Bool(_) => Err(DecodeError::UnsupportedShape("bool")),
        Value::Number(_) => Err(DecodeError::UnsupportedShape("number")),
        Value::Object(_) => Err(DecodeError::UnsupportedShape("object")),
    }
}

/// Serde adapter for `Vec<u8>` fields persisted through the storage codec.
pub mod storage_bytes {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(bytes.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let value = Value::deserialize(deserializer)?;
        super::decode_from_storage(&value).map_err(D::Error::custom)
    }
}

/// Same as [`storage_bytes`] for optional fields; `null` and a missing field both decode to `None`.
pub mod storage_bytes_opt {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.collect_seq(bytes.iter()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<Value>::deserialize(deserializer)? {
            Some(value) => super::decode_from_storage(&value)
                .map(Some)
                .map_err(D::Error::custom),
            None => Ok(None),
        }
    }
}

/// Encoded raster image of a captured stroke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureImage {
    pub mime: String,
    #[serde(with = "storage_bytes")]
    pub bytes: Vec<u8>,
}

impl SignatureImage {
    pub fn png(bytes: Vec<u8>) -> Self {
        Self {
            mime: PNG_MIME.to_string(),
            bytes,
        }
    }

    /// Parses `data:<mime>;base64,<payload>` as produced by a canvas export.
    pub fn from_data_url(input: &str) -> Result<Self, CaptureError> {
        let rest = input
            .trim()
            .strip_prefix("data:")
            .ok_or_else(|| CaptureError::DataUrl("missing data: prefix".into()))?;
        let (header, payload) = rest
            .split_once(',')
            .ok_or_else(|| CaptureError::DataUrl("missing payload separator".into()))?;
        let mime = header
            .strip_suffix(";base64")
            .ok_or_else(|| CaptureError::DataUrl(format!("not base64 encoded: {header}")))?;
        if mime.is_empty() {
            return Err(CaptureError::DataUrl("empty mime type".into()));
        }
        let bytes = B64.decode(payload.trim().as_bytes())?;
        Ok(Self {
            mime: mime.to_string(),
            bytes,
        })
    }

    /// Accepts either a data url or bare base64; the mime tag of bare input is sniffed.
    pub fn from_base64(input: &str) -> Result<Self, CaptureError> {
        if input.trim_start().starts_with("data:") {
            return Self::from_data_url(input);
        }
        let bytes = B64.decode(input.trim().as_bytes())?;
        let mime = sniff_mime(&bytes).to_string();
        Ok(Self { mime, bytes })
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, B64.encode(&self.bytes))
    }

    /// Pixel size read from the image header.
    pub fn dimensions(&self) -> Result<(u32, u32), image::ImageError> {
        image::io::Reader::new(Cursor::new(&self.bytes))
            .with_guessed_format()?
            .into_dimensions()
    }
}

fn sniff_mime(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Png) => PNG_MIME,
        Ok(ImageFormat::Jpeg) => "image/jpeg",
        Ok(ImageFormat::WebP) => "image/webp",
        _ => "application/octet-stream",
    }
}

/// Encodes the RGBA pixels of a drawing surface as PNG.
pub fn encode_capture(width: u32, height: u32, rgba: &[u8]) -> Result<SignatureImage, CaptureError> {
    if width == 0 || height == 0 {
        return Err(CaptureError::Empty);
    }
    let expected = width as usize * height as usize * 4;
    if rgba.len() != expected {
        return Err(CaptureError::BufferSize {
            width,
            height,
            expected,
            actual: rgba.len(),
        });
    }
    let canvas = RgbaImage::from_raw(width, height, rgba.to_vec()).ok_or(CaptureError::BufferSize {
        width,
        height,
        expected,
        actual: rgba.len(),
    })?;
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(canvas).write_to(&mut out, ImageOutputFormat::Png)?;
    Ok(SignatureImage::png(out.into_inner()))
}
