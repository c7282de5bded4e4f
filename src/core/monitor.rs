use crate::core::doctor::Doctor;
use crate::core::ent::*;
use crate::core::error::{ProbeError, StoreError};
use crate::core::prober::Prober;
use crate::core::stats::aggregate_stats;
use crate::core::store::DeviceStore;
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug)]
pub enum TickOutcome {
    Completed(Vec<DeviceUpdate>),
    /// Another tick was still probing.
    Skipped,
    /// The device list could not be fetched; nothing was probed.
    Failed(StoreError),
}

impl TickOutcome {
    pub fn updates(&self) -> Option<&[DeviceUpdate]> {
        match self {
            TickOutcome::Completed(updates) => Some(updates),
            _ => None,
        }
    }
}

/// Probes devices, persists the results and keeps an in-memory view of the
/// device table for readers.
pub struct Monitor {
    prober: Arc<dyn Prober>,
    store: Arc<dyn DeviceStore>,
    doctor: Doctor,
    probe_timeout: Duration,
    view: RwLock<Vec<Device>>,
    tick: Mutex<()>,
    events: Option<mpsc::Sender<Event>>,
}

impl Monitor {
    pub fn new(
        prober: Arc<dyn Prober>,
        store: Arc<dyn DeviceStore>,
        doctor: Doctor,
        probe_timeout: Duration,
    ) -> Monitor {
        Monitor {
            prober,
            store,
            doctor,
            probe_timeout,
            view: RwLock::new(Vec::new()),
            tick: Mutex::new(()),
            events: None,
        }
    }

    /// Reports every check and tick on `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<Event>) -> Monitor {
        self.events = Some(tx);
        self
    }

    pub fn store(&self) -> &Arc<dyn DeviceStore> {
        &self.store
    }

    pub async fn devices(&self) -> Vec<Device> {
        self.view.read().await.clone()
    }

    pub async fn stats(&self) -> NetworkStats {
        aggregate_stats(&self.view.read().await)
    }

    /// Reloads the view from the store without probing.
    pub async fn refresh(&self) -> Result<usize, StoreError> {
        let devices = self.store.list_devices().await?;
        let count = devices.len();
        *self.view.write().await = devices;
        Ok(count)
    }

    pub async fn create_device(&self, device: NewDevice) -> Result<Device, StoreError> {
        let created = self.store.create_device(device).await?;
        info!(device_id = %created.id, address = %created.ip_address, "device registered");
        self.view.write().await.insert(0, created.clone());
        Ok(created)
    }

    pub async fn check_device(&self, device: &Device) -> DeviceUpdate {
        let outcome = self.probe(device).await;
        if let Err(e) = &outcome {
            warn!(device_id = %device.id, address = %device.ip_address, error = %e, "probe failed, marking device offline");
        }
        let update = self.doctor.diagnose(device, &outcome, Utc::now());
        if let Err(e) = self.store.update_device(device.id, &update).await {
            error!(device_id = %device.id, error = %e, "failed to persist device update");
        }
        self.emit(Event::DeviceChecked {
            device: device.clone(),
            update: update.clone(),
        })
        .await;
        update
    }

    async fn probe(&self, device: &Device) -> Result<Duration, ProbeError> {
        let address = device.ip_address.trim();
        if address.is_empty() {
            return Err(ProbeError::EmptyAddress);
        }
        match time::timeout(self.probe_timeout, self.prober.probe(address)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProbeError::Timeout(self.probe_timeout)),
        }
    }

    /// Checks all devices concurrently, one update per device in input order.
    pub async fn monitor_all(&self, devices: &[Device]) -> Vec<DeviceUpdate> {
        let updates = self.check_all(devices).await;
        self.apply(&updates).await;
        updates
    }

    async fn check_all(&self, devices: &[Device]) -> Vec<DeviceUpdate> {
        join_all(devices.iter().map(|device| self.check_device(device))).await
    }

    // single write guard so readers see either none or all of a batch
    async fn apply(&self, updates: &[DeviceUpdate]) {
        let by_id: HashMap<Uuid, &DeviceUpdate> = updates.iter().map(|u| (u.id, u)).collect();
        let mut view = self.view.write().await;
        for device in view.iter_mut() {
            if let Some(update) = by_id.get(&device.id) {
                device.apply(update);
            }
        }
    }

    /// Fetches the device list and checks every device. Never overlaps with
    /// a tick that is still running.
    pub async fn run_tick(&self) -> TickOutcome {
        let Ok(_running) = self.tick.try_lock() else {
            warn!("previous monitoring tick still running, skipping");
            self.emit(Event::TickSkipped).await;
            return TickOutcome::Skipped;
        };

        let devices = match self.store.list_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                error!(error = %e, "failed to fetch device list, skipping tick");
                return TickOutcome::Failed(e);
            }
        };
        debug!(count = devices.len(), "monitoring devices");

        let updates = self.check_all(&devices).await;
        let by_id: HashMap<Uuid, &DeviceUpdate> = updates.iter().map(|u| (u.id, u)).collect();
        let mut next = devices;
        for device in next.iter_mut() {
            if let Some(update) = by_id.get(&device.id) {
                device.apply(update);
            }
        }
        *self.view.write().await = next;

        let summary = TickSummary {
            checked: updates.len(),
            online: updates.iter().filter(|u| u.status == DeviceStatus::Online).count(),
            offline: updates.iter().filter(|u| u.status == DeviceStatus::Offline).count(),
        };
        info!(
            checked = summary.checked,
            online = summary.online,
            offline = summary.offline,
            "monitoring tick finished"
        );
        self.emit(Event::TickFinished(summary)).await;
        TickOutcome::Completed(updates)
    }

    // waits for room so a burst of checks never loses a transition
    async fn emit(&self, event: Event) {
        if let Some(tx) = &self.events {
            if let Err(e) = tx.send(event).await {
                debug!(error = %e, "event logger gone, dropping monitor event");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::logger::Logger;
    use crate::core::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) enum Reply {
        Up(Duration),
        Down,
        Hang,
        Slow(Duration),
    }

    /// Answers from a fixed table keyed by address.
    pub(crate) struct ScriptedProber {
        replies: HashMap<String, Reply>,
        in_flight: AtomicUsize,
        pub(crate) max_in_flight: AtomicUsize,
        pub(crate) calls: AtomicUsize,
    }

    impl ScriptedProber {
        pub(crate) fn new(replies: Vec<(&str, Reply)>) -> ScriptedProber {
            ScriptedProber {
                replies: replies
                    .into_iter()
                    .map(|(addr, reply)| (addr.to_string(), reply))
                    .collect(),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, address: &str) -> Result<Duration, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let result = match self.replies.get(address) {
                Some(Reply::Up(latency)) => Ok(*latency),
                Some(Reply::Slow(delay)) => {
                    time::sleep(*delay).await;
                    Ok(*delay)
                }
                Some(Reply::Hang) => std::future::pending().await,
                Some(Reply::Down) | None => Err(ProbeError::Unreachable(address.to_string())),
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    /// Store whose writes always fail.
    struct ReadOnlyStore(MemoryStore);

    #[async_trait]
    impl DeviceStore for ReadOnlyStore {
        async fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
            self.0.list_devices().await
        }
        async fn update_device(&self, _: Uuid, _: &DeviceUpdate) -> Result<(), StoreError> {
            Err(StoreError::Status {
                status: 503,
                body: "read only".to_string(),
            })
        }
        async fn create_device(&self, device: NewDevice) -> Result<Device, StoreError> {
            self.0.create_device(device).await
        }
        async fn list_units(&self) -> Result<Vec<Unit>, StoreError> {
            self.0.list_units().await
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl DeviceStore for BrokenStore {
        async fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
            Err(StoreError::Status {
                status: 500,
                body: "boom".to_string(),
            })
        }
        async fn update_device(&self, id: Uuid, _: &DeviceUpdate) -> Result<(), StoreError> {
            Err(StoreError::NotFound(id))
        }
        async fn create_device(&self, _: NewDevice) -> Result<Device, StoreError> {
            Err(StoreError::NoUnits)
        }
        async fn list_units(&self) -> Result<Vec<Unit>, StoreError> {
            Ok(Vec::new())
        }
    }

    pub(crate) fn monitor(prober: Arc<dyn Prober>, store: Arc<dyn DeviceStore>) -> Monitor {
        Monitor::new(prober, store, Doctor::default(), Duration::from_millis(1500))
    }

    #[tokio::test(start_paused = true)]
    async fn checks_devices_and_persists_results() {
        let router = Device::new(Uuid::new_v4(), "192.168.1.1").with_uptime(90.0);
        let branch = Device::new(Uuid::new_v4(), "10.0.0.5").with_uptime(50.0);
        let store = Arc::new(MemoryStore::new(vec![router.clone(), branch.clone()], Vec::new()));
        let prober = Arc::new(ScriptedProber::new(vec![
            ("192.168.1.1", Reply::Up(Duration::from_millis(12))),
            ("10.0.0.5", Reply::Hang),
        ]));
        let monitor = monitor(prober, store.clone());

        let updates = monitor.monitor_all(&[router.clone(), branch.clone()]).await;

        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].id, router.id);
        assert_eq!(updates[0].status, DeviceStatus::Online);
        assert!(updates[0].uptime_percentage > 90.0 && updates[0].uptime_percentage <= 92.0);
        assert_eq!(updates[0].last_ping_ms, Some(12));
        assert_eq!(updates[1].id, branch.id);
        assert_eq!(updates[1].status, DeviceStatus::Offline);
        assert_eq!(updates[1].uptime_percentage, 45.0);
        assert_eq!(updates[1].last_ping_ms, None);

        let stored = store.get(branch.id).await.unwrap();
        assert_eq!(stored.status, DeviceStatus::Offline);
        assert_eq!(stored.uptime_percentage, 45.0);
        assert!(stored.last_check.is_some());
    }

    #[tokio::test]
    async fn one_failing_device_does_not_affect_others() {
        let devices: Vec<Device> = (1..=5)
            .map(|i| Device::new(Uuid::new_v4(), format!("10.0.0.{i}")).with_uptime(80.0))
            .collect();
        let prober = Arc::new(ScriptedProber::new(vec![
            ("10.0.0.1", Reply::Up(Duration::from_millis(1))),
            ("10.0.0.2", Reply::Up(Duration::from_millis(2))),
            ("10.0.0.3", Reply::Down),
            ("10.0.0.4", Reply::Up(Duration::from_millis(4))),
            ("10.0.0.5", Reply::Up(Duration::from_millis(5))),
        ]));
        let store = Arc::new(MemoryStore::new(devices.clone(), Vec::new()));
        let monitor = monitor(prober, store);

        let updates = monitor.monitor_all(&devices).await;

        assert_eq!(updates.len(), devices.len());
        for (device, update) in devices.iter().zip(&updates) {
            let expected = if device.ip_address == "10.0.0.3" {
                DeviceStatus::Offline
            } else {
                DeviceStatus::Online
            };
            assert_eq!(update.status, expected, "{}", device.ip_address);
        }
    }

    #[tokio::test]
    async fn probes_run_concurrently() {
        let devices: Vec<Device> = (1..=3)
            .map(|i| Device::new(Uuid::new_v4(), format!("10.1.0.{i}")))
            .collect();
        let prober = Arc::new(ScriptedProber::new(
            devices
                .iter()
                .map(|d| (d.ip_address.as_str(), Reply::Slow(Duration::from_millis(20))))
                .collect(),
        ));
        let store = Arc::new(MemoryStore::new(devices.clone(), Vec::new()));
        let monitor = monitor(prober.clone(), store);

        monitor.monitor_all(&devices).await;

        assert_eq!(prober.max_in_flight.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn blank_address_is_offline_without_probing() {
        let device = Device::new(Uuid::new_v4(), "   ").with_uptime(3.0);
        let prober = Arc::new(ScriptedProber::new(Vec::new()));
        let store = Arc::new(MemoryStore::new(vec![device.clone()], Vec::new()));
        let monitor = monitor(prober.clone(), store);

        let update = monitor.check_device(&device).await;

        assert_eq!(update.status, DeviceStatus::Offline);
        assert_eq!(update.uptime_percentage, 0.0);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn persistence_failure_still_updates_view() {
        let device = Device::new(Uuid::new_v4(), "192.168.1.1").with_uptime(10.0);
        let store = Arc::new(ReadOnlyStore(MemoryStore::new(vec![device.clone()], Vec::new())));
        let prober = Arc::new(ScriptedProber::new(vec![(
            "192.168.1.1",
            Reply::Up(Duration::from_millis(7)),
        )]));
        let monitor = monitor(prober, store);

        let outcome = monitor.run_tick().await;

        assert_eq!(outcome.updates().map(|u| u.len()), Some(1));
        let view = monitor.devices().await;
        assert_eq!(view[0].status, DeviceStatus::Online);
        assert_eq!(view[0].last_ping_ms, Some(7));
    }

    #[tokio::test]
    async fn fetch_failure_skips_tick_and_keeps_view() {
        let prober = Arc::new(ScriptedProber::new(Vec::new()));
        let monitor = monitor(prober.clone(), Arc::new(BrokenStore));

        let outcome = monitor.run_tick().await;

        assert!(matches!(outcome, TickOutcome::Failed(StoreError::Status { status: 500, .. })));
        assert!(monitor.devices().await.is_empty());
        assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_tick_is_skipped() {
        let device = Device::new(Uuid::new_v4(), "10.0.0.9");
        let store = Arc::new(MemoryStore::new(vec![device], Vec::new()));
        let prober = Arc::new(ScriptedProber::new(vec![(
            "10.0.0.9",
            Reply::Slow(Duration::from_millis(500)),
        )]));
        let monitor = monitor(prober.clone(), store);

        let (first, second) = tokio::join!(monitor.run_tick(), monitor.run_tick());

        assert!(matches!(first, TickOutcome::Completed(_)));
        assert!(matches!(second, TickOutcome::Skipped));
        assert_eq!(prober.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(monitor.run_tick().await, TickOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn stats_follow_the_view() {
        let up = Device::new(Uuid::new_v4(), "10.0.0.1").with_uptime(99.0);
        let down = Device::new(Uuid::new_v4(), "10.0.0.2").with_uptime(1.0);
        let store = Arc::new(MemoryStore::new(vec![up, down], Vec::new()));
        let prober = Arc::new(ScriptedProber::new(vec![("10.0.0.1", Reply::Up(Duration::ZERO))]));
        let monitor = monitor(prober, store);

        assert_eq!(monitor.stats().await.total, 0);
        monitor.run_tick().await;

        let stats = monitor.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.online, 1);
        assert_eq!(stats.offline, 1);
        assert_eq!(stats.average_uptime, "50.0");
    }

    #[tokio::test]
    async fn emits_events_for_checks_and_ticks() {
        let device = Device::new(Uuid::new_v4(), "10.0.0.1");
        let store = Arc::new(MemoryStore::new(vec![device.clone()], Vec::new()));
        let prober = Arc::new(ScriptedProber::new(Vec::new()));
        let (tx, mut rx) = mpsc::channel(8);
        let monitor = monitor(prober, store).with_events(tx);

        monitor.run_tick().await;

        match rx.recv().await {
            Some(Event::DeviceChecked { device: d, update }) => {
                assert_eq!(d.id, device.id);
                assert_eq!(update.status, DeviceStatus::Offline);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            rx.recv().await,
            Some(Event::TickFinished(TickSummary { checked: 1, online: 0, offline: 1 }))
        ));
    }

    #[tokio::test]
    async fn mass_outage_alarms_every_device() {
        let devices: Vec<Device> = (0..400)
            .map(|i| {
                let mut device = Device::new(Uuid::new_v4(), format!("10.2.{}.{}", i / 250, i % 250));
                device.status = DeviceStatus::Online;
                device
            })
            .collect();
        let store = Arc::new(MemoryStore::new(devices, Vec::new()));
        let prober = Arc::new(ScriptedProber::new(Vec::new()));
        let (tx, mut rx) = mpsc::channel(256);
        let monitor = monitor(prober, store).with_events(tx);

        let logger = tokio::spawn(async move {
            let mut logger = Logger::new(None);
            let mut alarmed = 0;
            while let Some(event) = rx.recv().await {
                alarmed += logger.log(event).len();
            }
            alarmed
        });
        let outcome = monitor.run_tick().await;
        drop(monitor);

        assert_eq!(outcome.updates().map(|u| u.len()), Some(400));
        assert_eq!(logger.await.unwrap(), 400);
    }

    #[tokio::test(start_paused = true)]
    async fn readers_see_the_previous_view_until_the_tick_ends() {
        let device = Device::new(Uuid::new_v4(), "10.0.0.7").with_uptime(50.0);
        let store = Arc::new(MemoryStore::new(vec![device.clone()], Vec::new()));
        let prober = Arc::new(ScriptedProber::new(vec![(
            "10.0.0.7",
            Reply::Slow(Duration::from_millis(400)),
        )]));
        let monitor = monitor(prober, store);

        let during = async {
            time::sleep(Duration::from_millis(100)).await;
            monitor.devices().await
        };
        let (outcome, during) = tokio::join!(monitor.run_tick(), during);

        assert!(during.is_empty(), "view changed before probing finished");
        assert!(matches!(outcome, TickOutcome::Completed(_)));
        let view = monitor.devices().await;
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].status, DeviceStatus::Online);
        assert_eq!(view[0].uptime_percentage, 51.0);
    }
}
