//! Device session capability.
//!
//! The exporter never speaks the RouterOS wire protocol itself. It talks to a
//! device through these traits: a [`DeviceConnector`] opens a
//! [`DeviceSession`], the session hands out [`Menu`] handles for a path such as
//! `/interface`, and a menu answers one-shot queries or opens a continuous
//! stream of update batches.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// A single response record: field name to raw value.
pub type Record = serde_json::Map<String, Value>;

/// One delivery on a stream: a batch of records, or the error that ended it.
pub type StreamBatch = Result<Vec<Record>, DeviceError>;

/// Receiving side of a continuous subscription.
///
/// The stream ends (`recv` yields `None`) when the owning session goes away.
pub type EventStream = mpsc::Receiver<StreamBatch>;

/// Errors reported by a device session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// The session could not be established.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// A one-shot query was rejected.
    #[error("Query on '{menu}' failed: {message}")]
    Query { menu: String, message: String },

    /// An active subscription delivered an error.
    #[error("Stream '{command}' on '{menu}' failed: {message}")]
    Stream {
        menu: String,
        command: String,
        message: String,
    },

    /// The session was closed or dropped by the device.
    #[error("Session closed: {0}")]
    SessionClosed(String),
}

impl DeviceError {
    /// Create a query error.
    pub fn query(menu: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Query {
            menu: menu.into(),
            message: message.into(),
        }
    }

    /// Create a stream error.
    pub fn stream(
        menu: impl Into<String>,
        command: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Stream {
            menu: menu.into(),
            command: command.into(),
            message: message.into(),
        }
    }
}

/// Server-side query modifiers: an optional `where` filter and verbatim options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    /// Only records whose `field` equals `value`.
    pub filter: Option<(String, String)>,
    /// Options passed through to the device untouched.
    pub options: Vec<String>,
}

impl Query {
    /// An unfiltered query without options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the query to records where `field` equals `value`.
    pub fn with_filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter = Some((field.into(), value.into()));
        self
    }

    /// Attach query options.
    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.extend(options.into_iter().map(Into::into));
        self
    }

    /// Check whether a record passes the filter.
    pub fn matches(&self, record: &Record) -> bool {
        match &self.filter {
            None => true,
            Some((field, expected)) => match record.get(field) {
                Some(Value::String(s)) => s == expected,
                Some(other) => other.to_string() == *expected,
                None => false,
            },
        }
    }
}

/// A handle on one menu path of a live session.
#[async_trait]
pub trait Menu: Send + Sync {
    /// The menu path, e.g. `/system/resource`.
    fn path(&self) -> &str;

    /// List query.
    async fn get(&self, query: &Query) -> Result<Vec<Record>, DeviceError>;

    /// Single-record query.
    async fn get_one(&self, query: &Query) -> Result<Record, DeviceError>;

    /// Subscribe to `command` on this menu.
    async fn stream(&self, command: &str, query: &Query) -> Result<EventStream, DeviceError>;
}

/// A live device session.
#[async_trait]
pub trait DeviceSession: Send + Sync {
    /// Get a handle for a menu path.
    fn menu(&self, path: &str) -> Arc<dyn Menu>;

    /// Resolve with the error once the session fails asynchronously.
    async fn closed(&self) -> DeviceError;

    /// Close the session. Streams opened on it end.
    async fn close(&self);
}

/// Opens device sessions.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    /// Human-readable target, used in logs.
    fn target(&self) -> String;

    /// Establish a new session.
    async fn connect(&self) -> Result<Arc<dyn DeviceSession>, DeviceError>;
}
