//! BLE Scanner Module
//!
//! Time-bounded discovery of named peripherals. Each `start` begins a fresh
//! run: earlier results are cleared, peripherals are deduplicated by address
//! (first sighting wins) and the run ends by itself once its duration elapses.

use crate::domain::models::PeripheralIdentity;
use crate::infrastructure::bluetooth::error::BleError;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Scan length used when the caller does not pick one.
pub const DEFAULT_SCAN_DURATION: Duration = Duration::from_secs(10);

/// Raw output of a scan backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanReport {
    Advertisement {
        name: Option<String>,
        address: String,
    },
    /// Hardware or driver failure; ends the run.
    Failed { code: i32 },
}

/// Radio-side half of a scan.
#[async_trait]
pub trait ScanBackend: Send + Sync + 'static {
    /// Start an active scan and return the advertisement feed.
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<ScanReport>, BleError>;

    async fn stop(&self) -> Result<(), BleError>;
}

/// Peripherals accepted during the current run.
#[derive(Debug, Default)]
pub struct DiscoveredSet {
    seen: HashSet<String>,
    devices: Vec<PeripheralIdentity>,
}

impl DiscoveredSet {
    pub fn clear(&mut self) {
        self.seen.clear();
        self.devices.clear();
    }

    /// Returns the identity if this advertisement introduces a new peripheral.
    pub fn accept(&mut self, name: Option<&str>, address: &str) -> Option<PeripheralIdentity> {
        let name = name.map(str::trim).filter(|n| !n.is_empty())?;
        if !self.seen.insert(address.to_string()) {
            return None;
        }
        let identity = PeripheralIdentity {
            display_name: name.to_string(),
            address: address.to_string(),
        };
        self.devices.push(identity.clone());
        Some(identity)
    }

    pub fn devices(&self) -> &[PeripheralIdentity] {
        &self.devices
    }
}

/// Results of one scan run, in discovery order. Ends when the run stops.
pub struct ScanRun {
    results: mpsc::UnboundedReceiver<Result<PeripheralIdentity, BleError>>,
}

impl ScanRun {
    pub async fn next(&mut self) -> Option<Result<PeripheralIdentity, BleError>> {
        self.results.recv().await
    }

    /// Wait for the run to finish and return everything it found.
    pub async fn collect(mut self) -> Result<Vec<PeripheralIdentity>, BleError> {
        let mut found = Vec::new();
        while let Some(item) = self.next().await {
            found.push(item?);
        }
        Ok(found)
    }
}

struct ActiveScan {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct PeripheralScanner<B: ScanBackend> {
    backend: Arc<B>,
    discovered: Arc<Mutex<DiscoveredSet>>,
    active: Option<ActiveScan>,
}

impl<B: ScanBackend> PeripheralScanner<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
            discovered: Arc::new(Mutex::new(DiscoveredSet::default())),
            active: None,
        }
    }

    /// Start a scan that stops by itself after `duration`.
    pub async fn start(&mut self, duration: Duration) -> Result<ScanRun, BleError> {
        self.stop().await;
        lock(&self.discovered).clear();

        info!("Starting BLE scan for {:?}", duration);
        let reports = self.backend.start().await.map_err(|e| {
            error!("Failed to start scan: {}", e);
            e
        })?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let (results_tx, results) = mpsc::unbounded_channel();
        let task = tokio::spawn(drive_scan(
            self.backend.clone(),
            self.discovered.clone(),
            reports,
            results_tx,
            stop_rx,
            duration,
        ));
        self.active = Some(ActiveScan { stop_tx, task });

        Ok(ScanRun { results })
    }

    /// Stop the current run. Stopping an idle scanner is a no-op.
    pub async fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.stop_tx.send(());
            if let Err(e) = active.task.await {
                warn!("Scan task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.task.is_finished())
    }

    /// Snapshot of the peripherals found by the current (or last) run.
    pub fn discovered(&self) -> Vec<PeripheralIdentity> {
        lock(&self.discovered).devices().to_vec()
    }
}

async fn drive_scan<B: ScanBackend>(
    backend: Arc<B>,
    discovered: Arc<Mutex<DiscoveredSet>>,
    mut reports: mpsc::UnboundedReceiver<ScanReport>,
    results: mpsc::UnboundedSender<Result<PeripheralIdentity, BleError>>,
    mut stop_rx: oneshot::Receiver<()>,
    duration: Duration,
) {
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                info!("Scan Completed");
                break;
            }
            _ = &mut stop_rx => {
                info!("Stopping BLE scan...");
                break;
            }
            report = reports.recv() => match report {
                Some(ScanReport::Advertisement { name, address }) => {
                    let found = lock(&discovered).accept(name.as_deref(), &address);
                    if let Some(identity) = found {
                        debug!("Found device: {}", identity);
                        let _ = results.send(Ok(identity));
                    }
                }
                Some(ScanReport::Failed { code }) => {
                    error!("Scan failed with error code: {}", code);
                    let _ = results.send(Err(BleError::ScanFailed { code }));
                    break;
                }
                None => {
                    debug!("Scan backend closed its feed");
                    break;
                }
            }
        }
    }

    if let Err(e) = backend.stop().await {
        warn!("Failed to stop scan cleanly: {}", e);
    }
}

fn lock(set: &Mutex<DiscoveredSet>) -> std::sync::MutexGuard<'_, DiscoveredSet> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeBackend {
        feed: Mutex<Option<mpsc::UnboundedSender<ScanReport>>>,
        start_error: Mutex<Option<BleError>>,
        stops: AtomicUsize,
    }

    impl FakeBackend {
        fn push(&self, report: ScanReport) {
            if let Some(tx) = self.feed.lock().unwrap().as_ref() {
                let _ = tx.send(report);
            }
        }
    }

    #[async_trait]
    impl ScanBackend for Arc<FakeBackend> {
        async fn start(&self) -> Result<mpsc::UnboundedReceiver<ScanReport>, BleError> {
            if let Some(e) = self.start_error.lock().unwrap().take() {
                return Err(e);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            *self.feed.lock().unwrap() = Some(tx);
            Ok(rx)
        }

        async fn stop(&self) -> Result<(), BleError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn adv(name: Option<&str>, address: &str) -> ScanReport {
        ScanReport::Advertisement {
            name: name.map(str::to_string),
            address: address.to_string(),
        }
    }

    #[test]
    fn test_dedup_by_address_first_seen_wins() {
        let mut set = DiscoveredSet::default();
        assert!(set.accept(Some("Tab-01"), "AA:BB:CC:DD:EE:FF").is_some());
        assert!(set.accept(Some("Renamed"), "AA:BB:CC:DD:EE:FF").is_none());
        assert!(set.accept(Some("Tab-01"), "11:22:33:44:55:66").is_some());

        let names: Vec<_> = set.devices().iter().map(|d| d.display_name.as_str()).collect();
        assert_eq!(names, vec!["Tab-01", "Tab-01"]);
        assert_eq!(set.devices()[0].address, "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_unnamed_devices_discarded() {
        let mut set = DiscoveredSet::default();
        assert!(set.accept(None, "AA:BB:CC:DD:EE:FF").is_none());
        assert!(set.accept(Some("   "), "AA:BB:CC:DD:EE:FF").is_none());
        // Discarding does not mark the address as seen.
        assert!(set.accept(Some("Tab-01"), "AA:BB:CC:DD:EE:FF").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_stops_after_duration() {
        let backend = Arc::new(FakeBackend::default());
        let mut scanner = PeripheralScanner::new(backend.clone());

        let mut run = scanner.start(Duration::from_secs(10)).await.unwrap();
        backend.push(adv(Some("Tab-01"), "AA:BB:CC:DD:EE:FF"));
        backend.push(adv(Some("Tab-01"), "AA:BB:CC:DD:EE:FF"));
        backend.push(adv(None, "11:22:33:44:55:66"));

        let first = run.next().await.unwrap().unwrap();
        assert_eq!(first.display_name, "Tab-01");

        tokio::time::sleep(Duration::from_secs(11)).await;
        backend.push(adv(Some("Late"), "77:88:99:AA:BB:CC"));

        assert!(run.next().await.is_none());
        assert!(!scanner.is_scanning());
        assert_eq!(scanner.discovered(), vec![first]);
        assert_eq!(backend.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_clears_results() {
        let backend = Arc::new(FakeBackend::default());
        let mut scanner = PeripheralScanner::new(backend.clone());

        let mut run = scanner.start(DEFAULT_SCAN_DURATION).await.unwrap();
        backend.push(adv(Some("Tab-01"), "AA:BB:CC:DD:EE:FF"));
        run.next().await.unwrap().unwrap();

        let mut run = scanner.start(DEFAULT_SCAN_DURATION).await.unwrap();
        assert!(scanner.discovered().is_empty());

        backend.push(adv(Some("Tab-01"), "AA:BB:CC:DD:EE:FF"));
        let again = run.next().await.unwrap().unwrap();
        assert_eq!(again.address, "AA:BB:CC:DD:EE:FF");
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_stop_is_idempotent() {
        let backend = Arc::new(FakeBackend::default());
        let mut scanner = PeripheralScanner::new(backend.clone());

        let run = scanner.start(DEFAULT_SCAN_DURATION).await.unwrap();
        scanner.stop().await;
        scanner.stop().await;

        assert_eq!(run.collect().await.unwrap(), vec![]);
        assert_eq!(backend.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_surfaces_and_scanner_stays_usable() {
        let backend = Arc::new(FakeBackend::default());
        let mut scanner = PeripheralScanner::new(backend.clone());

        let run = scanner.start(DEFAULT_SCAN_DURATION).await.unwrap();
        backend.push(ScanReport::Failed { code: 2 });
        assert_eq!(run.collect().await, Err(BleError::ScanFailed { code: 2 }));

        let mut run = scanner.start(DEFAULT_SCAN_DURATION).await.unwrap();
        backend.push(adv(Some("Tab-01"), "AA:BB:CC:DD:EE:FF"));
        assert!(run.next().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_start_errors() {
        let backend = Arc::new(FakeBackend::default());
        *backend.start_error.lock().unwrap() = Some(BleError::PermissionDenied);
        let mut scanner = PeripheralScanner::new(backend.clone());

        assert_eq!(
            scanner.start(DEFAULT_SCAN_DURATION).await.err(),
            Some(BleError::PermissionDenied)
        );
        assert!(!scanner.is_scanning());

        *backend.start_error.lock().unwrap() = Some(BleError::AdapterUnavailable);
        assert_eq!(
            scanner.start(DEFAULT_SCAN_DURATION).await.err(),
            Some(BleError::AdapterUnavailable)
        );
    }
}
