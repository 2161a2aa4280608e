//! Kotogawa dam and river telemetry collector.
//!
//! Periodically requests the prefecture's dam and river gauge pages for the
//! most recent published 10-minute bucket, turns them into a `Snapshot`,
//! and keeps a day-partitioned history plus a `latest.json` pointer that
//! dashboards read while the collector writes.

pub mod alert;
pub mod analysis;
pub mod collector;
pub mod config;
pub mod history;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod record;
pub mod stations;
pub mod timegrid;
pub mod verify;
