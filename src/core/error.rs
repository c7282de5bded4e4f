use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("device has no network address")]
    EmptyAddress,
    #[error("failed to resolve {0}")]
    Resolve(String),
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("prober unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Store returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Store returned no rows for {0}")]
    EmptyResponse(String),
    #[error("Device not found: {0}")]
    NotFound(Uuid),
    #[error("No units registered; at least one unit is required")]
    NoUnits,
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum AlarmError {
    #[error("invalid mailbox: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("smtp transport error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("failed to build message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("failed to render alarm body: {0}")]
    Render(#[from] serde_json::Error),
}
