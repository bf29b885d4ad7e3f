use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::features::codec::SignatureImage;
use crate::features::connectivity::Connectivity;
use crate::features::endpoint::RemoteEndpoint;
use crate::features::pdf::Placement;
use crate::features::record_store::{PdfSignatureStore, SignatureStore};
use crate::features::records::{DocumentType, PdfSignatureRecord, SignatureRecord};
use crate::features::storage::{FileStore, KeyValueStore};
use crate::features::sync::SyncCoordinator;

/// Owns every long-lived service of the signature core.
///
/// Call [`start`](Self::start) from inside a tokio runtime to begin reacting to
/// connectivity changes; [`shutdown`](Self::shutdown) or dropping the app undoes it.
pub struct SignatureApp {
    signatures: Arc<SignatureStore>,
    pdf_signatures: Arc<PdfSignatureStore>,
    connectivity: Connectivity,
    coordinator: SyncCoordinator,
}

impl SignatureApp {
    pub fn new(
        backend: Arc<dyn KeyValueStore>,
        endpoint: Arc<dyn RemoteEndpoint>,
        connectivity: Connectivity,
    ) -> Self {
        let signatures = Arc::new(SignatureStore::new(backend.clone()));
        let pdf_signatures = Arc::new(PdfSignatureStore::new(backend));
        let coordinator = SyncCoordinator::new(
            signatures.clone(),
            pdf_signatures.clone(),
            endpoint,
            connectivity.clone(),
        );
        Self {
            signatures,
            pdf_signatures,
            connectivity,
            coordinator,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let dir = config.resolved_storage_dir();
        let backend = Arc::new(FileStore::open(&dir)?);
        let endpoint = config.build_endpoint()?;
        log::info!("signature storage at {}", dir.display());
        Ok(Self::new(
            backend,
            endpoint,
            Connectivity::new(config.start_online),
        ))
    }

    pub fn start(&self) {
        self.coordinator.install();
    }

    pub fn shutdown(&self) {
        self.coordinator.shutdown();
    }

    /// Stores a standalone signature and kicks off a sync attempt.
    pub async fn save_signature(
        &self,
        document_id: &str,
        document_type: DocumentType,
        image: SignatureImage,
    ) -> Result<SignatureRecord> {
        let record = self
            .signatures
            .append_signature(document_id, document_type, image)
            .await?;
        self.coordinator.trigger();
        Ok(record)
    }

    /// Signs `original` at `placement`, stores the record and kicks off a sync attempt.
    pub async fn save_pdf_signature(
        &self,
        document_id: &str,
        original: Vec<u8>,
        image: SignatureImage,
        placement: Placement,
    ) -> Result<PdfSignatureRecord> {
        let record = self
            .pdf_signatures
            .append_pdf_signature(document_id, original, image, placement)
            .await?;
        self.coordinator.trigger_pdf();
        Ok(record)
    }

    pub fn signatures(&self) -> &SignatureStore {
        &self.signatures
    }

    pub fn pdf_signatures(&self) -> &PdfSignatureStore {
        &self.pdf_signatures
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::features::endpoint::SyncEnvelope;
    use crate::features::pdf::test_support::{sample_pdf, sample_signature};
    use crate::features::storage::MemoryStore;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::tempdir;

    struct AcceptAll;

    #[async_trait]
    impl RemoteEndpoint for AcceptAll {
        async fn push(&self, _envelope: &SyncEnvelope) -> Result<(), SyncError> {
            Ok(())
        }
    }

    async fn settle(app: &SignatureApp) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let plain = app.signatures().unsynced_count().await.unwrap();
                let pdf = app.pdf_signatures().unsynced_count().await.unwrap();
                if plain + pdf == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("records never synced");
    }

    #[tokio::test]
    async fn saves_sync_immediately_when_online() {
        let app = SignatureApp::new(
            Arc::new(MemoryStore::new()),
            Arc::new(AcceptAll),
            Connectivity::new(true),
        );
        app.start();
        app.save_signature("INV-1", DocumentType::Invoice, sample_signature(10, 5))
            .await
            .unwrap();
        app.save_pdf_signature("DN-1", sample_pdf(2), sample_signature(400, 100), Placement::new(50.0, 700.0, 0))
            .await
            .unwrap();
        settle(&app).await;
        app.shutdown();
    }

    #[tokio::test]
    async fn offline_saves_wait_for_reconnect() {
        let app = SignatureApp::new(
            Arc::new(MemoryStore::new()),
            Arc::new(AcceptAll),
            Connectivity::new(false),
        );
        app.start();
        for n in 0..3 {
            app.save_signature(&format!("R-{n}"), DocumentType::Receipt, sample_signature(4, 4))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(app.signatures().list_unsynced().await.unwrap().len(), 3);

        app.connectivity().set_online(true);
        settle(&app).await;
    }

    #[tokio::test]
    async fn failed_pdf_save_reports_and_stores_nothing() {
        let app = SignatureApp::new(
            Arc::new(MemoryStore::new()),
            Arc::new(AcceptAll),
            Connectivity::new(true),
        );
        let err = app
            .save_pdf_signature("DN-2", sample_pdf(1), sample_signature(4, 4), Placement::new(0.0, 0.0, -1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "page_out_of_range");
        assert!(app.pdf_signatures().is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn from_config_persists_under_storage_dir() {
        let dir = tempdir().unwrap();
        let config = Config {
            storage_dir: Some(dir.path().to_path_buf()),
            ..Config::default()
        };
        {
            let app = SignatureApp::from_config(&config).unwrap();
            app.save_signature("INV-7", DocumentType::Invoice, sample_signature(4, 4))
                .await
                .unwrap();
        }
        let reopened = SignatureApp::from_config(&config).unwrap();
        let listed = reopened.signatures().list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].document_id, "INV-7");
        assert!(!listed[0].synced);
    }
}
