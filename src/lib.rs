//! tanto is a runtime security telemetry collector. It attaches to a
//! kernel-event capture engine and turns raw kernel events into structured
//! records describing process, container and network activity, suitable
//! for downstream filtering, aggregation and export.

pub mod config;
pub mod containers;
pub mod download;
pub mod extract;
pub mod source;
pub mod util;
