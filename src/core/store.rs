use crate::config::StoreConfig;
use crate::core::ent::*;
use crate::core::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Persistence for devices and the units they belong to.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// All devices, newest first, with their unit joined in.
    async fn list_devices(&self) -> Result<Vec<Device>, StoreError>;
    /// Writes the monitor-owned columns of one device.
    async fn update_device(&self, id: Uuid, update: &DeviceUpdate) -> Result<(), StoreError>;
    async fn create_device(&self, device: NewDevice) -> Result<Device, StoreError>;
    async fn list_units(&self) -> Result<Vec<Unit>, StoreError>;
}

#[derive(Serialize)]
struct UpdateRow<'a> {
    status: DeviceStatus,
    uptime_percentage: f64,
    last_ping_ms: Option<u64>,
    last_check: &'a DateTime<Utc>,
}

#[derive(Serialize)]
struct InsertRow {
    unit_id: Uuid,
    ip_address: String,
    hostname: Option<String>,
    status: DeviceStatus,
    vpn_status: VpnStatus,
    services: Option<Vec<String>>,
}

/// PostgREST client for the hosted database.
#[derive(Debug, Clone)]
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    table: String,
    units_table: String,
}

impl RestStore {
    pub fn new(config: &StoreConfig) -> Result<RestStore, StoreError> {
        let api_key = HeaderValue::from_str(&config.api_key)
            .map_err(|e| StoreError::InvalidInput(format!("api key: {e}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|e| StoreError::InvalidInput(format!("api key: {e}")))?;
        let mut headers = HeaderMap::new();
        headers.insert("apikey", api_key);
        headers.insert(AUTHORIZATION, bearer);
        headers.insert("X-Client-Info", HeaderValue::from_static("device-monitor"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(RestStore {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            table: config.table.clone(),
            units_table: config.units_table.clone(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.base_url, table)
    }

    fn device_select(&self) -> String {
        format!("*,unit:{}(id,name,code)", self.units_table)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl DeviceStore for RestStore {
    async fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        let response = self
            .client
            .get(self.table_url(&self.table))
            .query(&[
                ("select", self.device_select()),
                ("order", "created_at.desc".to_string()),
            ])
            .send()
            .await?;
        Ok(check_status(response).await?.json::<Vec<Device>>().await?)
    }

    async fn update_device(&self, id: Uuid, update: &DeviceUpdate) -> Result<(), StoreError> {
        let row = UpdateRow {
            status: update.status,
            uptime_percentage: update.uptime_percentage,
            last_ping_ms: update.last_ping_ms,
            last_check: &update.last_check,
        };
        let response = self
            .client
            .patch(self.table_url(&self.table))
            .query(&[("id", format!("eq.{id}"))])
            .json(&row)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn create_device(&self, device: NewDevice) -> Result<Device, StoreError> {
        let device = device
            .normalize()
            .ok_or_else(|| StoreError::InvalidInput("ip_address is required".to_string()))?;
        let unit_id = match device.unit_id {
            Some(unit_id) => unit_id,
            None => self.list_units().await?.first().map(|u| u.id).ok_or(StoreError::NoUnits)?,
        };
        let row = InsertRow {
            unit_id,
            ip_address: device.ip_address,
            hostname: device.hostname,
            status: DeviceStatus::Unknown,
            vpn_status: VpnStatus::Unknown,
            services: Some(device.services).filter(|s| !s.is_empty()),
        };
        let response = self
            .client
            .post(self.table_url(&self.table))
            .query(&[("select", self.device_select())])
            .header("Prefer", "return=representation")
            .json(&[row])
            .send()
            .await?;
        check_status(response)
            .await?
            .json::<Vec<Device>>()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::EmptyResponse(self.table.clone()))
    }

    async fn list_units(&self) -> Result<Vec<Unit>, StoreError> {
        let response = self
            .client
            .get(self.table_url(&self.units_table))
            .query(&[("select", "id,name,code"), ("order", "name.asc")])
            .send()
            .await?;
        Ok(check_status(response).await?.json::<Vec<Unit>>().await?)
    }
}

/// Process-local store, used when no database is configured.
#[derive(Debug, Default)]
pub struct MemoryStore {
    devices: RwLock<Vec<Device>>,
    units: RwLock<Vec<Unit>>,
}

impl MemoryStore {
    pub fn new(devices: Vec<Device>, units: Vec<Unit>) -> MemoryStore {
        MemoryStore {
            devices: RwLock::new(devices),
            units: RwLock::new(units),
        }
    }

    pub async fn get(&self, id: Uuid) -> Option<Device> {
        self.devices.read().await.iter().find(|d| d.id == id).cloned()
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        let mut devices = self.devices.read().await.clone();
        devices.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(devices)
    }

    async fn update_device(&self, id: Uuid, update: &DeviceUpdate) -> Result<(), StoreError> {
        let mut devices = self.devices.write().await;
        let device = devices
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or(StoreError::NotFound(id))?;
        device.apply(update);
        Ok(())
    }

    async fn create_device(&self, device: NewDevice) -> Result<Device, StoreError> {
        let device = device
            .normalize()
            .ok_or_else(|| StoreError::InvalidInput("ip_address is required".to_string()))?;
        let units = self.units.read().await;
        let unit = match device.unit_id {
            Some(unit_id) => units.iter().find(|u| u.id == unit_id).cloned(),
            None => units.first().cloned(),
        };
        let mut created = Device::new(Uuid::new_v4(), device.ip_address);
        created.unit_id = device.unit_id.or(unit.as_ref().map(|u| u.id));
        created.unit = unit;
        created.hostname = device.hostname;
        created.services = device.services;
        self.devices.write().await.push(created.clone());
        Ok(created)
    }

    async fn list_units(&self) -> Result<Vec<Unit>, StoreError> {
        Ok(self.units.read().await.clone())
    }
}
