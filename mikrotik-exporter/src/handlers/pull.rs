use mikrotik_common::DeviceError;
use tracing::trace;

use super::{AttributeSetup, MetricSource};

/// Which one-shot query a pull handler issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullKind {
    /// List query; supports `count` metrics.
    List,
    /// Single-record query.
    Single,
}

/// A pollable attribute (get and getOne modes).
pub struct PullHandler {
    setup: AttributeSetup,
    kind: PullKind,
}

impl PullHandler {
    pub fn new(setup: AttributeSetup, kind: PullKind) -> Self {
        Self { setup, kind }
    }

    /// The attribute name.
    pub fn name(&self) -> &str {
        &self.setup.name
    }

    pub fn menu(&self) -> &str {
        self.setup.menu.path()
    }

    /// Run the query once and update every metric of the attribute.
    ///
    /// Returns the number of values recorded. A query error leaves all gauges
    /// at their previous values.
    pub async fn poll(&self) -> Result<usize, DeviceError> {
        let setup = &self.setup;

        let records = match self.kind {
            PullKind::List => setup.menu.get(&setup.query).await?,
            PullKind::Single => vec![setup.menu.get_one(&setup.query).await?],
        };

        let mut recorded = setup.record_fields(records.first(), true);

        for metric in &setup.metrics {
            if metric.source == MetricSource::Count && setup.record(metric, records.len() as f64) {
                recorded += 1;
            }
        }

        trace!(
            attribute = %setup.name,
            records = records.len(),
            recorded,
            "Poll complete"
        );

        Ok(recorded)
    }
}
