use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::features::codec::{storage_bytes, storage_bytes_opt, SignatureImage};
use crate::features::pdf::Placement;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Invoice,
    Receipt,
}

impl std::str::FromStr for DocumentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "invoice" => Ok(DocumentType::Invoice),
            "receipt" => Ok(DocumentType::Receipt),
            other => Err(format!("unknown_document_type:{other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Signature,
    PdfSignature,
}

/// Where a record stands with respect to the remote system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    InFlight,
    Synced,
}

/// Behaviour shared by both record kinds so one store and one sync loop serve both.
pub trait StoredRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: RecordKind;
    /// Namespaced key of the persisted sequence.
    const STORAGE_KEY: &'static str;

    fn id(&self) -> Uuid;
    fn document_id(&self) -> &str;
    fn created_at(&self) -> DateTime<Utc>;
    fn is_synced(&self) -> bool;
    fn mark_synced(&mut self);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureRecord {
    pub id: Uuid,
    pub document_id: String,
    pub document_type: DocumentType,
    pub signature_image: SignatureImage,
    pub created_at: DateTime<Utc>,
    pub synced: bool,
}

impl SignatureRecord {
    pub fn new(
        document_id: impl Into<String>,
        document_type: DocumentType,
        signature_image: SignatureImage,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id: document_id.into(),
            document_type,
            signature_image,
            created_at,
            synced: false,
        }
    }
}

impl StoredRecord for SignatureRecord {
    const KIND: RecordKind = RecordKind::Signature;
    const STORAGE_KEY: &'static str = "fieldsign.signatures";

    fn id(&self) -> Uuid {
        self.id
    }

    fn document_id(&self) -> &str {
        &self.document_id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn is_synced(&self) -> bool {
        self.synced
    }

    fn mark_synced(&mut self) {
        self.synced = true;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdfSignatureRecord {
    pub id: Uuid,
    pub document_id: String,
    pub signature_image: SignatureImage,
    pub created_at: DateTime<Utc>,
    pub synced: bool,
    #[serde(with = "storage_bytes")]
    pub original_document_bytes: Vec<u8>,
    #[serde(default, with = "storage_bytes_opt")]
    pub signed_document_bytes: Option<Vec<u8>>,
    pub placement: Placement,
}

impl PdfSignatureRecord {
    pub fn new(
        document_id: impl Into<String>,
        signature_image: SignatureImage,
        original_document_bytes: Vec<u8>,
        signed_document_bytes: Vec<u8>,
        placement: Placement,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id: document_id.into(),
            signature_image,
            created_at,
            synced: false,
            original_document_bytes,
            signed_document_bytes: Some(signed_document_bytes),
            placement,
        }
    }
}

impl StoredRecord for PdfSignatureRecord {
    const KIND: RecordKind = RecordKind::PdfSignature;
    const STORAGE_KEY: &'static str = "fieldsign.pdf_signatures";

    fn id(&self) -> Uuid {
        self.id
    }

    fn document_id(&self) -> &str {
        &self.document_id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn is_synced(&self) -> bool {
        self.synced
    }

    fn mark_synced(&mut self) {
        self.synced = true;
    }
}
