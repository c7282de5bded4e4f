use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Warning,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VpnStatus {
    Connected,
    Disconnected,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Location a device belongs to. Joined for display only.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Unit {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub code: Option<String>,
}

/// A row of the `network_monitoring` table.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Device {
    pub id: Uuid,
    #[serde(default)]
    pub unit_id: Option<Uuid>,
    pub ip_address: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub status: DeviceStatus,
    #[serde(default)]
    pub vpn_status: VpnStatus,
    #[serde(default, deserialize_with = "null_as_default")]
    pub uptime_percentage: f64,
    #[serde(default)]
    pub last_ping_ms: Option<u64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub services: Vec<String>,
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<Unit>,
}

impl Device {
    pub fn new(id: Uuid, ip_address: impl Into<String>) -> Device {
        let now = Utc::now();
        Device {
            id,
            unit_id: None,
            ip_address: ip_address.into(),
            hostname: None,
            status: DeviceStatus::Unknown,
            vpn_status: VpnStatus::Unknown,
            uptime_percentage: 0.0,
            last_ping_ms: None,
            services: Vec::new(),
            last_check: None,
            created_at: now,
            updated_at: now,
            unit: None,
        }
    }

    pub fn with_uptime(mut self, uptime_percentage: f64) -> Device {
        self.uptime_percentage = uptime_percentage;
        self
    }

    pub fn apply(&mut self, update: &DeviceUpdate) {
        self.status = update.status;
        self.uptime_percentage = update.uptime_percentage;
        self.last_ping_ms = update.last_ping_ms;
        self.last_check = Some(update.last_check);
        self.updated_at = update.last_check;
    }
}

/// Result of one check, written back for `id` only.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DeviceUpdate {
    pub id: Uuid,
    pub status: DeviceStatus,
    pub uptime_percentage: f64,
    pub last_ping_ms: Option<u64>,
    pub last_check: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct NewDevice {
    #[serde(default)]
    pub unit_id: Option<Uuid>,
    pub ip_address: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub services: Vec<String>,
}

impl NewDevice {
    /// Trims the form input. `None` when no address was given.
    pub fn normalize(self) -> Option<NewDevice> {
        let ip_address = self.ip_address.trim().to_string();
        if ip_address.is_empty() {
            return None;
        }
        let hostname = self
            .hostname
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty());
        let services = self
            .services
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Some(NewDevice {
            unit_id: self.unit_id,
            ip_address,
            hostname,
            services,
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NetworkStats {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub warning: usize,
    pub average_uptime: String,
    pub availability: String,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct StatusChange {
    pub device_id: Uuid,
    pub ip_address: String,
    pub hostname: Option<String>,
    pub from: DeviceStatus,
    pub to: DeviceStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub checked: usize,
    pub online: usize,
    pub offline: usize,
}

#[derive(Debug, Clone)]
pub enum Event {
    DeviceChecked { device: Device, update: DeviceUpdate },
    TickSkipped,
    TickFinished(TickSummary),
}

// the store sends null for unset numeric and array columns
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
