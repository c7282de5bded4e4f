pub mod alarm;
pub mod api;
pub mod collector;
pub mod doctor;
pub mod ent;
pub mod error;
pub mod logger;
pub mod monitor;
pub mod prober;
pub mod scheduler;
pub mod stats;
pub mod store;
pub use alarm::Alarm;
pub use api::AppState;
pub use collector::listen;
pub use doctor::*;
pub use ent::*;
pub use error::*;
pub use logger::*;
pub use monitor::{Monitor, TickOutcome};
pub use prober::{build_prober, IcmpProber, Prober, TcpProber};
pub use scheduler::{schedule_monitoring, MonitorHandle};
pub use stats::aggregate_stats;
pub use store::{DeviceStore, MemoryStore, RestStore};
