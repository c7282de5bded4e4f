use crate::core::ent::*;

/// Counts and averages over the current device set.
pub fn aggregate_stats(devices: &[Device]) -> NetworkStats {
    let total = devices.len();
    let count = |status: DeviceStatus| devices.iter().filter(|d| d.status == status).count();
    let online = count(DeviceStatus::Online);

    let (average_uptime, availability) = if total == 0 {
        ("0.0".to_string(), "0.0".to_string())
    } else {
        let sum: f64 = devices.iter().map(|d| d.uptime_percentage).sum();
        (
            format!("{:.1}", sum / total as f64),
            format!("{:.1}", online as f64 / total as f64 * 100.0),
        )
    };

    NetworkStats {
        total,
        online,
        offline: count(DeviceStatus::Offline),
        warning: count(DeviceStatus::Warning),
        average_uptime,
        availability,
    }
}
