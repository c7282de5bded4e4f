use crate::core::alarm::*;
use crate::core::ent::*;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use uuid::Uuid;

// 记录设备状态，设备掉线时报警
pub struct Logger {
    statuses: HashMap<Uuid, DeviceStatus>, // last status seen per device
    pending: Vec<StatusChange>,            // offline transitions of the running tick
    seen: HashSet<Uuid>,                   // devices checked in the running tick
    alarm: Option<Alarm>,
}

impl Logger {
    pub fn new(alarm: Option<Alarm>) -> Logger {
        Logger {
            statuses: HashMap::new(),
            pending: Vec::new(),
            seen: HashSet::new(),
            alarm,
        }
    }

    /// Consumes monitor events until every sender is gone.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Event>) {
        tracing::debug!("event logger started");
        while let Some(event) = rx.recv().await {
            let changes = self.log(event);
            if changes.is_empty() {
                continue;
            }
            if let Some(alarm) = &self.alarm {
                alarm.notify(changes).await;
            }
        }
        tracing::debug!("event logger stopped");
    }

    /// Records one event. Returns the offline transitions to alarm on, which
    /// are batched until the tick finishes.
    pub fn log(&mut self, event: Event) -> Vec<StatusChange> {
        match event {
            Event::DeviceChecked { device, update } => {
                self.update_device(device, update);
                Vec::new()
            }
            Event::TickSkipped => {
                tracing::warn!("tick skipped: previous tick still running");
                Vec::new()
            }
            Event::TickFinished(summary) => {
                if summary.offline > 0 {
                    tracing::warn!(
                        checked = summary.checked,
                        offline = summary.offline,
                        "tick finished with offline devices"
                    );
                } else {
                    tracing::info!(checked = summary.checked, "tick finished, all devices online");
                }
                // forget devices that are no longer in the store
                let seen = std::mem::take(&mut self.seen);
                self.statuses.retain(|id, _| seen.contains(id));
                std::mem::take(&mut self.pending)
            }
        }
    }

    fn update_device(&mut self, device: Device, update: DeviceUpdate) {
        self.seen.insert(device.id);
        let previous = self
            .statuses
            .insert(device.id, update.status)
            .unwrap_or(device.status);
        match (previous, update.status) {
            (DeviceStatus::Offline, DeviceStatus::Online) => {
                tracing::info!(device_id = %device.id, address = %device.ip_address, "device back online");
            }
            (from, DeviceStatus::Offline) if from != DeviceStatus::Offline => {
                tracing::warn!(device_id = %device.id, address = %device.ip_address, "device went offline");
                self.pending.push(StatusChange {
                    device_id: device.id,
                    ip_address: device.ip_address,
                    hostname: device.hostname,
                    from,
                    to: update.status,
                    at: update.last_check,
                });
            }
            _ => tracing::debug!(
                device_id = %device.id,
                status = ?update.status,
                uptime = update.uptime_percentage,
                latency_ms = ?update.last_ping_ms,
                "device checked"
            ),
        }
    }
}
