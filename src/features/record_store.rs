use std::marker::PhantomData;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{DecodeError, PersistenceError, Result};
use crate::features::codec::SignatureImage;
use crate::features::pdf::{self, Placement};
use crate::features::records::{
    DocumentType, PdfSignatureRecord, SignatureRecord, StoredRecord,
};
use crate::features::storage::KeyValueStore;

const QUARANTINE_SLOTS: usize = 64;

pub type SignatureStore = RecordStore<SignatureRecord>;
pub type PdfSignatureStore = RecordStore<PdfSignatureRecord>;

/// Append-only, insertion-ordered sequence of one record kind.
///
/// Every mutation rewrites the whole sequence under `R::STORAGE_KEY`; the async mutex
/// is held across the read-modify-write so concurrent appends cannot lose each other.
pub struct RecordStore<R> {
    backend: Arc<dyn KeyValueStore>,
    write_lock: Mutex<()>,
    last_decode_error: StdMutex<Option<String>>,
    _kind: PhantomData<fn() -> R>,
}

impl<R: StoredRecord> RecordStore<R> {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend,
            write_lock: Mutex::new(()),
            last_decode_error: StdMutex::new(None),
            _kind: PhantomData,
        }
    }

    pub fn storage_key(&self) -> &'static str {
        R::STORAGE_KEY
    }

    /// Key an unreadable payload is copied to before the store starts over. Slot 0 is
    /// `<key>.corrupt`; later, different payloads go to `<key>.corrupt.1`, `.2`, ...
    pub fn quarantine_key(&self, slot: usize) -> String {
        match slot {
            0 => format!("{}.corrupt", R::STORAGE_KEY),
            n => format!("{}.corrupt.{n}", R::STORAGE_KEY),
        }
    }

    pub async fn list(&self) -> Result<Vec<R>> {
        let _guard = self.write_lock.lock().await;
        Ok(self.load()?)
    }

    pub async fn list_unsynced(&self) -> Result<Vec<R>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|record| !record.is_synced())
            .collect())
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.list().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn unsynced_count(&self) -> Result<usize> {
        Ok(self.list_unsynced().await?.len())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<R>> {
        Ok(self.list().await?.into_iter().find(|record| record.id() == id))
    }

    /// Flips `synced` on the record with `id`. Unknown ids and already-synced records
    /// are left alone; the return value says whether anything was written.
    pub async fn mark_synced(&self, id: Uuid) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load()?;
        let Some(record) = records.iter_mut().find(|record| record.id() == id) else {
            log::debug!("mark_synced: {} not in {}", id, R::STORAGE_KEY);
            return Ok(false);
        };
        if record.is_synced() {
            return Ok(false);
        }
        record.mark_synced();
        self.persist(&records)?;
        Ok(true)
    }

    /// Problem met by the most recent decode of the persisted sequence, if it failed.
    pub fn last_decode_error(&self) -> Option<String> {
        self.last_decode_error
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
    }

    /// Appends the record produced by `build`, which receives the creation timestamp.
    pub(crate) async fn append_with(&self, build: impl FnOnce(DateTime<Utc>) -> R) -> Result<R> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load()?;
        // Never earlier than the last entry, even if the wall clock stepped back.
        let created_at = records
            .last()
            .map(|last| last.created_at().max(Utc::now()))
            .unwrap_or_else(Utc::now);
        let record = build(created_at);
        records.push(record.clone());
        self.persist(&records)?;
        log::info!(
            "stored {:?} {} for document {} ({} total)",
            R::KIND,
            record.id(),
            record.document_id(),
            records.len()
        );
        Ok(record)
    }

    fn load(&self) -> Result<Vec<R>, PersistenceError> {
        let Some(raw) = self.backend.read(R::STORAGE_KEY)? else {
            self.set_decode_error(None);
            return Ok(Vec::new());
        };
        match serde_json::from_str::<Vec<R>>(&raw) {
            Ok(records) => {
                self.set_decode_error(None);
                Ok(records)
            }
            Err(e) => {
                let problem = DecodeError::from(e);
                log::warn!(
                    "{} is unreadable, treating as empty: {}",
                    R::STORAGE_KEY,
                    problem
                );
                self.quarantine(&raw);
                self.set_decode_error(Some(problem.to_string()));
                Ok(Vec::new())
            }
        }
    }

    /// Keeps a copy of an unreadable payload in the first free quarantine slot. An
    /// identical copy already in a slot is left as is. Failures are only logged.
    fn quarantine(&self, raw: &str) {
        for slot in 0..QUARANTINE_SLOTS {
            let key = self.quarantine_key(slot);
            match self.backend.read(&key) {
                Ok(Some(existing)) if existing == raw => return,
                Ok(Some(_)) => continue,
                Ok(None) => {
                    match self.backend.write(&key, raw) {
                        Ok(()) => log::warn!("unreadable {} copied to {}", R::STORAGE_KEY, key),
                        Err(e) => log::warn!("could not quarantine {}: {}", R::STORAGE_KEY, e),
                    }
                    return;
                }
                Err(e) => {
                    log::warn!("could not quarantine {}: {}", R::STORAGE_KEY, e);
                    return;
                }
            }
        }
        log::warn!(
            "all {} quarantine slots of {} are taken, payload dropped",
            QUARANTINE_SLOTS,
            R::STORAGE_KEY
        );
    }

    fn set_decode_error(&self, problem: Option<String>) {
        if let Ok(mut slot) = self.last_decode_error.lock() {
            *slot = problem;
        }
    }

    fn persist(&self, records: &[R]) -> Result<(), PersistenceError> {
        let text = serde_json::to_string(records).map_err(|source| PersistenceError::Encode {
            key: R::STORAGE_KEY.to_string(),
            source,
        })?;
        self.backend.write(R::STORAGE_KEY, &text)
    }
}

impl RecordStore<SignatureRecord> {
    pub async fn append_signature(
        &self,
        document_id: &str,
        document_type: DocumentType,
        image: SignatureImage,
    ) -> Result<SignatureRecord> {
        self.append_with(|created_at| {
            SignatureRecord::new(document_id, document_type, image, created_at)
        })
        .await
    }
}

impl RecordStore<PdfSignatureRecord> {
    /// Annotates `original` and stores the result. Nothing is stored when annotation fails.
    pub async fn append_pdf_signature(
        &self,
        document_id: &str,
        original: Vec<u8>,
        image: SignatureImage,
        placement: Placement,
    ) -> Result<PdfSignatureRecord> {
        let (original, image, signed) = tokio::task::spawn_blocking(move || {
            let signed = pdf::annotate(&original, &image, &placement);
            (original, image, signed)
        })
        .await?;
        let signed = signed?;
        self.append_with(|created_at| {
            PdfSignatureRecord::new(document_id, image, original, signed, placement, created_at)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AnnotationError, Error};
    use crate::features::pdf::test_support::{sample_pdf, sample_signature};
    use crate::features::storage::{FileStore, MemoryStore};
    use tempfile::tempdir;

    struct RejectingStore;

    impl KeyValueStore for RejectingStore {
        fn read(&self, _key: &str) -> Result<Option<String>, PersistenceError> {
            Ok(None)
        }

        fn write(&self, key: &str, _value: &str) -> Result<(), PersistenceError> {
            Err(PersistenceError::Rejected {
                key: key.to_string(),
                reason: "quota exceeded".into(),
            })
        }
    }

    fn image() -> SignatureImage {
        SignatureImage::png(vec![0x89, b'P', b'N', b'G', 0, 0])
    }

    #[tokio::test]
    async fn appends_in_call_order_unsynced() {
        let store = SignatureStore::new(Arc::new(MemoryStore::new()));
        let mut ids = Vec::new();
        for n in 0..5 {
            let doc = format!("INV-{n}");
            ids.push(store.append_signature(&doc, DocumentType::Invoice, image()).await.unwrap().id);
        }
        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 5);
        assert_eq!(listed.iter().map(|r| r.id).collect::<Vec<_>>(), ids);
        assert!(listed.iter().all(|r| !r.synced));
        assert!(listed.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        assert_eq!(listed[0].signature_image, image());
    }

    #[tokio::test]
    async fn concurrent_appends_are_not_lost() {
        let store = Arc::new(SignatureStore::new(Arc::new(MemoryStore::new())));
        let handles: Vec<_> = (0..20)
            .map(|n| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .append_signature(&format!("R-{n}"), DocumentType::Receipt, image())
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.len().await.unwrap(), 20);
    }

    #[tokio::test]
    async fn mark_synced_is_idempotent() {
        let backend = Arc::new(MemoryStore::new());
        let store = SignatureStore::new(backend.clone());
        let first = store.append_signature("A", DocumentType::Invoice, image()).await.unwrap();
        store.append_signature("B", DocumentType::Invoice, image()).await.unwrap();

        assert!(store.mark_synced(first.id).await.unwrap());
        let after_once = backend.read(SignatureRecord::STORAGE_KEY).unwrap();
        assert!(!store.mark_synced(first.id).await.unwrap());
        assert_eq!(backend.read(SignatureRecord::STORAGE_KEY).unwrap(), after_once);

        assert!(!store.mark_synced(Uuid::new_v4()).await.unwrap());
        assert_eq!(store.unsynced_count().await.unwrap(), 1);
        assert!(store.get(first.id).await.unwrap().unwrap().synced);
    }

    #[tokio::test]
    async fn stores_are_independent() {
        let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let plain = SignatureStore::new(backend.clone());
        let pdfs = PdfSignatureStore::new(backend);
        plain.append_signature("A", DocumentType::Receipt, image()).await.unwrap();
        assert!(pdfs.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn rejected_write_propagates() {
        let store = SignatureStore::new(Arc::new(RejectingStore));
        let err = store
            .append_signature("A", DocumentType::Invoice, image())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Persistence(PersistenceError::Rejected { .. })));
    }

    #[tokio::test]
    async fn unreadable_payload_lists_empty_and_is_quarantined() {
        let backend = Arc::new(MemoryStore::new());
        backend.write(SignatureRecord::STORAGE_KEY, "{not json").unwrap();
        let store = SignatureStore::new(backend.clone());

        assert!(store.list().await.unwrap().is_empty());
        assert!(store.last_decode_error().is_some());
        assert_eq!(
            backend.read(&store.quarantine_key(0)).unwrap().as_deref(),
            Some("{not json")
        );

        store.append_signature("A", DocumentType::Invoice, image()).await.unwrap();
        assert_eq!(store.len().await.unwrap(), 1);
        assert_eq!(store.last_decode_error(), None);
    }

    #[tokio::test]
    async fn later_corruption_gets_its_own_quarantine_slot() {
        let backend = Arc::new(MemoryStore::new());
        let store = SignatureStore::new(backend.clone());
        backend.write(SignatureRecord::STORAGE_KEY, "first broken").unwrap();
        store.list().await.unwrap();
        store.list().await.unwrap();
        assert_eq!(backend.read(&store.quarantine_key(1)).unwrap(), None);

        store.append_signature("A", DocumentType::Invoice, image()).await.unwrap();
        backend.write(SignatureRecord::STORAGE_KEY, "second broken").unwrap();
        assert!(store.list().await.unwrap().is_empty());

        assert_eq!(
            backend.read(&store.quarantine_key(0)).unwrap().as_deref(),
            Some("first broken")
        );
        assert_eq!(
            backend.read(&store.quarantine_key(1)).unwrap().as_deref(),
            Some("second broken")
        );
    }

    /// Serves an unreadable payload and refuses every write.
    struct CorruptReadOnlyStore;

    impl KeyValueStore for CorruptReadOnlyStore {
        fn read(&self, key: &str) -> Result<Option<String>, PersistenceError> {
            Ok((key == SignatureRecord::STORAGE_KEY).then(|| "[{\"id\":".to_string()))
        }

        fn write(&self, key: &str, _value: &str) -> Result<(), PersistenceError> {
            Err(PersistenceError::Rejected {
                key: key.to_string(),
                reason: "read-only medium".into(),
            })
        }
    }

    #[tokio::test]
    async fn listing_survives_failed_quarantine() {
        let store = SignatureStore::new(Arc::new(CorruptReadOnlyStore));
        assert!(store.list().await.unwrap().is_empty());
        assert!(store.last_decode_error().is_some());
        assert_eq!(store.unsynced_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pdf_signature_keeps_exact_bytes_across_reload() {
        let dir = tempdir().unwrap();
        let source = sample_pdf(2);
        let signature = sample_signature(40, 10);
        let record = {
            let store = PdfSignatureStore::new(Arc::new(FileStore::open(dir.path()).unwrap()));
            store
                .append_pdf_signature("DN-1", source.clone(), signature.clone(), Placement::new(50.0, 700.0, 1))
                .await
                .unwrap()
        };

        let reopened = PdfSignatureStore::new(Arc::new(FileStore::open(dir.path()).unwrap()));
        let listed = reopened.list().await.unwrap();
        assert_eq!(listed, vec![record.clone()]);
        assert_eq!(listed[0].original_document_bytes, source);
        assert_eq!(listed[0].signature_image, signature);
        assert_eq!(pdf::page_count(listed[0].signed_document_bytes.as_ref().unwrap()).unwrap(), 2);
    }

    #[tokio::test]
    async fn non_finite_placement_is_refused_and_history_kept() {
        let store = PdfSignatureStore::new(Arc::new(MemoryStore::new()));
        for n in 0..2 {
            store
                .append_pdf_signature(&format!("DN-{n}"), sample_pdf(1), sample_signature(8, 4), Placement::new(1.0, 1.0, 0))
                .await
                .unwrap();
        }

        let err = store
            .append_pdf_signature("DN-nan", sample_pdf(1), sample_signature(8, 4), Placement::new(f64::NAN, 1.0, 0))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_placement");

        assert_eq!(store.len().await.unwrap(), 2);
        assert_eq!(store.last_decode_error(), None);
    }

    #[tokio::test]
    async fn failed_annotation_adds_nothing() {
        let store = PdfSignatureStore::new(Arc::new(MemoryStore::new()));
        store
            .append_pdf_signature("ok", sample_pdf(1), sample_signature(8, 4), Placement::new(0.0, 0.0, 0))
            .await
            .unwrap();
        let before = store.len().await.unwrap();

        let err = store
            .append_pdf_signature("bad", sample_pdf(1), sample_signature(8, 4), Placement::new(0.0, 0.0, 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Annotation(AnnotationError::PageIndexOutOfRange { index: 1, page_count: 1 })
        ));
        let err = store
            .append_pdf_signature("bad", b"%PDF-garbage".to_vec(), sample_signature(8, 4), Placement::new(0.0, 0.0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Annotation(AnnotationError::MalformedDocument(_))));

        assert_eq!(store.len().await.unwrap(), before);
    }
}
