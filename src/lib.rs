//! Keeps the `network_monitoring` table of the IT dashboard fresh.
//!
//! A [`core::Monitor`] probes every registered device, classifies it as
//! online or offline, nudges its uptime estimate and writes the result back to
//! the device store. [`core::schedule_monitoring`] drives it on a timer and
//! [`core::collector`] serves the current view over HTTP.

pub mod config;
pub mod core;
