//! Prometheus exporter for MikroTik RouterOS devices.
//!
//! The exporter keeps one session to a router, acquires the configured
//! attribute groups (continuous streams and periodic one-shot queries), and
//! serves the resulting gauges on an HTTP scrape endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │     Device      │────>│   Controller    │────>│    Registry     │────>│   HTTP Server   │
//! │ (session/menus) │     │ (wire/schedule) │     │  (reporters)    │     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! mikrotik-exporter --config mikrotik-exporter.json5 --simulate
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod config;
pub mod controller;
pub mod convert;
pub mod handlers;
pub mod http;
pub mod labels;
pub mod registry;
pub mod scrape;
pub mod stats;

pub use config::{ConfigError, ExporterConfig};
pub use controller::{ConnectionState, Controller, ControllerError, ControllerSettings};
pub use http::HttpServer;
pub use registry::{ReporterRegistry, SharedRegistry};
pub use scrape::ScrapeBridge;
pub use stats::ExporterStats;
