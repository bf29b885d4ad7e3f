use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::features::connectivity::Connectivity;
use crate::features::endpoint::{RemoteEndpoint, SyncEnvelope};
use crate::features::record_store::{PdfSignatureStore, RecordStore, SignatureStore};
use crate::features::records::{StoredRecord, SyncState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
    NothingPending,
    AllInFlight,
    StoreUnavailable,
}

/// Outcome of one sync attempt over one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncReport {
    pub attempted: usize,
    pub acknowledged: usize,
    pub failed: usize,
    /// Unsynced records left alone because another attempt is pushing them.
    pub busy: usize,
    pub skipped: Option<SkipReason>,
}

impl SyncReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct InFlight {
    ids: Mutex<HashSet<Uuid>>,
    released: Notify,
}

struct Shared {
    signatures: Arc<SignatureStore>,
    pdf_signatures: Arc<PdfSignatureStore>,
    endpoint: Arc<dyn RemoteEndpoint>,
    connectivity: Connectivity,
    in_flight: Arc<InFlight>,
}

/// Releases a record's in-flight mark when the push finishes or its task is dropped.
struct InFlightGuard {
    in_flight: Arc<InFlight>,
    id: Uuid,
}

impl InFlightGuard {
    fn claim(in_flight: &Arc<InFlight>, id: Uuid) -> Option<Self> {
        let mut set = in_flight.ids.lock().ok()?;
        if !set.insert(id) {
            return None;
        }
        Some(Self {
            in_flight: in_flight.clone(),
            id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.in_flight.ids.lock() {
            set.remove(&self.id);
        }
        self.in_flight.released.notify_waiters();
    }
}

/// Pushes unsynced records to the remote endpoint after saves and whenever the
/// device comes back online.
///
/// Owned by the application; [`install`](Self::install) subscribes to connectivity
/// changes and [`shutdown`](Self::shutdown) (or dropping) ends the subscription.
pub struct SyncCoordinator {
    shared: Arc<Shared>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SyncCoordinator {
    pub fn new(
        signatures: Arc<SignatureStore>,
        pdf_signatures: Arc<PdfSignatureStore>,
        endpoint: Arc<dyn RemoteEndpoint>,
        connectivity: Connectivity,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                signatures,
                pdf_signatures,
                endpoint,
                connectivity,
                in_flight: Arc::new(InFlight::default()),
            }),
            listener: Mutex::new(None),
        }
    }

    /// Starts listening for offline to online transitions. Must run inside a tokio
    /// runtime. Returns false when already installed.
    pub fn install(&self) -> bool {
        let Ok(mut slot) = self.listener.lock() else {
            return false;
        };
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        let shared = self.shared.clone();
        let mut rx = shared.connectivity.subscribe();
        // Read before spawning so a transition racing the task start is still seen.
        let mut seen = rx.borrow_and_update().restorations;
        *slot = Some(tokio::spawn(async move {
            // Restores that happen while an attempt runs bump the counter and are
            // picked up by the next iteration.
            while rx.changed().await.is_ok() {
                let restorations = rx.borrow_and_update().restorations;
                if restorations == seen {
                    continue;
                }
                seen = restorations;
                let plain = sync_after_restore(&shared, &shared.signatures).await;
                let pdf = sync_after_restore(&shared, &shared.pdf_signatures).await;
                log::info!("sync after reconnect: signatures {plain:?}, pdf signatures {pdf:?}");
            }
        }));
        log::debug!("sync coordinator installed");
        true
    }

    pub fn is_installed(&self) -> bool {
        self.listener
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }

    /// Stops reacting to connectivity changes. Pushes already under way keep running.
    pub fn shutdown(&self) {
        if let Ok(mut slot) = self.listener.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
                log::debug!("sync coordinator shut down");
            }
        }
    }

    pub async fn attempt_sync(&self) -> SyncReport {
        sync_store(&self.shared, &self.shared.signatures).await
    }

    pub async fn attempt_pdf_sync(&self) -> SyncReport {
        sync_store(&self.shared, &self.shared.pdf_signatures).await
    }

    /// Fire-and-forget [`attempt_sync`](Self::attempt_sync).
    pub fn trigger(&self) -> JoinHandle<SyncReport> {
        let shared = self.shared.clone();
        tokio::spawn(async move { sync_store(&shared, &shared.signatures).await })
    }

    /// Fire-and-forget [`attempt_pdf_sync`](Self::attempt_pdf_sync).
    pub fn trigger_pdf(&self) -> JoinHandle<SyncReport> {
        let shared = self.shared.clone();
        tokio::spawn(async move { sync_store(&shared, &shared.pdf_signatures).await })
    }

    pub fn sync_state<R: StoredRecord>(&self, record: &R) -> SyncState {
        if record.is_synced() {
            SyncState::Synced
        } else if self.is_in_flight(record.id()) {
            SyncState::InFlight
        } else {
            SyncState::Pending
        }
    }

    pub fn is_in_flight(&self, id: Uuid) -> bool {
        self.shared
            .in_flight
            .ids
            .lock()
            .map(|set| set.contains(&id))
            .unwrap_or(false)
    }

    pub fn in_flight_count(&self) -> usize {
        self.shared
            .in_flight
            .ids
            .lock()
            .map(|set| set.len())
            .unwrap_or(0)
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sync attempt answering a connectivity restore. Records held by another attempt
/// may still fail there, so they are waited for and tried again.
async fn sync_after_restore<R: StoredRecord>(
    shared: &Shared,
    store: &Arc<RecordStore<R>>,
) -> SyncReport {
    loop {
        // Registered before the attempt so a release during it is not missed.
        let released = shared.in_flight.released.notified();
        let report = sync_store(shared, store).await;
        if report.busy == 0 {
            return report;
        }
        log::debug!("{:?}: {} records busy, retrying once released", R::KIND, report.busy);
        released.await;
    }
}

async fn sync_store<R: StoredRecord>(shared: &Shared, store: &Arc<RecordStore<R>>) -> SyncReport {
    if !shared.connectivity.is_online() {
        log::debug!("{:?} sync skipped: offline", R::KIND);
        return SyncReport::skipped(SkipReason::Offline);
    }
    let pending = match store.list_unsynced().await {
        Ok(pending) => pending,
        Err(e) => {
            log::warn!("{:?} sync skipped, store unavailable: {}", R::KIND, e);
            return SyncReport::skipped(SkipReason::StoreUnavailable);
        }
    };
    if pending.is_empty() {
        return SyncReport::skipped(SkipReason::NothingPending);
    }

    // Snapshot: records saved from here on wait for the next trigger.
    let pending_count = pending.len();
    let claimed: Vec<(R, InFlightGuard)> = pending
        .into_iter()
        .filter_map(|record| {
            InFlightGuard::claim(&shared.in_flight, record.id()).map(|guard| (record, guard))
        })
        .collect();
    let busy = pending_count - claimed.len();
    if claimed.is_empty() {
        return SyncReport {
            busy,
            ..SyncReport::skipped(SkipReason::AllInFlight)
        };
    }

    let mut report = SyncReport {
        attempted: claimed.len(),
        busy,
        ..SyncReport::default()
    };
    let handles: Vec<JoinHandle<bool>> = claimed
        .into_iter()
        .map(|(record, guard)| {
            let endpoint = shared.endpoint.clone();
            let store = store.clone();
            tokio::spawn(async move {
                let _guard = guard;
                push_one(endpoint.as_ref(), &store, &record).await
            })
        })
        .collect();
    for handle in handles {
        match handle.await {
            Ok(true) => report.acknowledged += 1,
            _ => report.failed += 1,
        }
    }
    log::info!(
        "{:?} sync: {} attempted, {} acknowledged, {} failed",
        R::KIND,
        report.attempted,
        report.acknowledged,
        report.failed
    );
    report
}

async fn push_one<R: StoredRecord>(
    endpoint: &dyn RemoteEndpoint,
    store: &RecordStore<R>,
    record: &R,
) -> bool {
    let id = record.id();
    let envelope = match SyncEnvelope::from_record(record) {
        Ok(envelope) => envelope,
        Err(e) => {
            log::warn!("cannot build sync payload for {id}: {e}");
            return false;
        }
    };
    if let Err(e) = endpoint.push(&envelope).await {
        log::warn!("push of {id} failed, will retry: {e}");
        return false;
    }
    match store.mark_synced(id).await {
        Ok(_) => {
            log::debug!("{id} acknowledged");
            true
        }
        Err(e) => {
            log::warn!("{id} acknowledged but not marked synced: {e}");
            false
        }
    }
}
