use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The persistent medium refused a read or a write.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage io failed for key `{key}`: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("storage rejected write for key `{key}`: {reason}")]
    Rejected { key: String, reason: String },
    #[error("failed to encode records for key `{key}`: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Stored data could not be turned back into records or bytes.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("stored json is unreadable: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stored byte at position {index} is out of range: {value}")]
    ByteOutOfRange { index: usize, value: String },
    #[error("stored bytes are not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unsupported stored byte encoding: {0}")]
    UnsupportedShape(&'static str),
}

#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error("document is not a readable pdf: {0}")]
    MalformedDocument(String),
    #[error("page index {index} is out of range for a document of {page_count} pages")]
    PageIndexOutOfRange { index: i64, page_count: usize },
    #[error("signature position ({x}, {y}) is not a finite coordinate")]
    InvalidPlacement { x: f64, y: f64 },
    #[error("signature image is invalid: {0}")]
    InvalidImage(String),
    #[error("failed to serialize annotated document: {0}")]
    Serialize(String),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("canvas buffer holds {actual} bytes, expected {expected} for {width}x{height} rgba")]
    BufferSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("canvas has no pixels")]
    Empty,
    #[error("signature data is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unsupported data url: {0}")]
    DataUrl(String),
    #[error("image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Failure of a single push. Never surfaced past the sync coordinator.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no remote endpoint configured")]
    NotConfigured,
    #[error("transport failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("remote rejected record {id}: http {status}")]
    Rejected { id: uuid::Uuid, status: u16 },
    #[error("failed to build sync payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Annotation(#[from] AnnotationError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    /// Stable identifier handed to the host UI.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Persistence(_) => "persistence_failed",
            Error::Decode(_) => "stored_data_unreadable",
            Error::Annotation(AnnotationError::MalformedDocument(_)) => "pdf_parse_failed",
            Error::Annotation(AnnotationError::PageIndexOutOfRange { .. }) => "page_out_of_range",
            Error::Annotation(AnnotationError::InvalidPlacement { .. }) => "invalid_placement",
            Error::Annotation(AnnotationError::InvalidImage(_)) => "signature_image_invalid",
            Error::Annotation(AnnotationError::Serialize(_)) => "pdf_save_failed",
            Error::Capture(_) => "signature_decode_failed",
            Error::Config(_) => "invalid_config",
            Error::Task(_) => "task_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_distinguish_annotation_failures() {
        let out_of_range: Error = AnnotationError::PageIndexOutOfRange {
            index: 3,
            page_count: 2,
        }
        .into();
        let malformed: Error = AnnotationError::MalformedDocument("eof".into()).into();
        assert_eq!(out_of_range.code(), "page_out_of_range");
        assert_eq!(malformed.code(), "pdf_parse_failed");
        let placement: Error = AnnotationError::InvalidPlacement { x: f64::NAN, y: 0.0 }.into();
        assert_eq!(placement.code(), "invalid_placement");
        assert!(out_of_range.to_string().contains("2 pages"));
    }
}
