use crate::core::ent::*;
use crate::core::error::ProbeError;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// How far a single check moves the uptime estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UptimePolicy {
    pub success_step: f64,
    /// Upper bound on one upward step, so a device never jumps to 100.
    pub max_success_step: f64,
    pub failure_step: f64,
}

impl Default for UptimePolicy {
    fn default() -> Self {
        UptimePolicy {
            success_step: 1.0,
            max_success_step: 2.0,
            failure_step: 5.0,
        }
    }
}

/// Turns a probe outcome into the new state of a device.
#[derive(Debug, Clone, Default)]
pub struct Doctor {
    policy: UptimePolicy,
}

impl Doctor {
    pub fn new(policy: UptimePolicy) -> Doctor {
        Doctor { policy }
    }

    pub fn policy(&self) -> UptimePolicy {
        self.policy
    }

    pub fn diagnose(
        &self,
        device: &Device,
        outcome: &Result<Duration, ProbeError>,
        now: DateTime<Utc>,
    ) -> DeviceUpdate {
        let uptime = clamp_uptime(device.uptime_percentage);
        let (status, uptime, last_ping_ms) = match outcome {
            Ok(latency) => (
                DeviceStatus::Online,
                self.nudge_up(uptime),
                Some(latency_ms(*latency)),
            ),
            Err(_) => (DeviceStatus::Offline, self.nudge_down(uptime), None),
        };
        DeviceUpdate {
            id: device.id,
            status,
            uptime_percentage: round2(uptime),
            last_ping_ms,
            last_check: now,
        }
    }

    fn nudge_up(&self, uptime: f64) -> f64 {
        let cap = self.policy.max_success_step.max(0.0);
        let step = self.policy.success_step.clamp(0.0, cap);
        clamp_uptime(uptime + step)
    }

    fn nudge_down(&self, uptime: f64) -> f64 {
        clamp_uptime(uptime - self.policy.failure_step.max(0.0))
    }
}

fn clamp_uptime(uptime: f64) -> f64 {
    if uptime.is_nan() {
        0.0
    } else {
        uptime.clamp(0.0, 100.0)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn latency_ms(latency: Duration) -> u64 {
    (latency.as_secs_f64() * 1000.0).round() as u64
}
