//! Attribute wiring.
//!
//! Each configured attribute goes through a shared setup phase (menu handle,
//! query, label set, reporters) and then becomes either a [`StreamHandler`]
//! with its own listener task or a [`PullHandler`] polled by the scheduler.

mod pull;
mod stream;

use std::collections::HashMap;
use std::sync::Arc;

use mikrotik_common::{DeviceSession, Menu, Query, Record};
use tracing::{debug, warn};

use crate::config::{AcquisitionMode, AttributeDefinition, MetricKind, MetricSpec};
use crate::convert::{Conversion, observe};
use crate::labels::{LabelData, LabelSchemas};
use crate::registry::SharedRegistry;

pub use pull::{PullHandler, PullKind};
pub use stream::{StreamFault, StreamHandler};

/// Where a metric's value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricSource {
    /// A field of the first response record.
    Field(String),
    /// The number of records returned.
    Count,
}

/// A metric spec whose reporter has been ensured.
#[derive(Debug)]
pub struct ResolvedMetric {
    pub name: String,
    pub source: MetricSource,
    pub conversion: Option<Conversion>,
}

/// Per-attribute state shared by both handler kinds.
pub struct AttributeSetup {
    pub name: String,
    pub menu: Arc<dyn Menu>,
    pub query: Query,
    pub labels: LabelData,
    pub metrics: Vec<ResolvedMetric>,
    registry: SharedRegistry,
}

impl AttributeSetup {
    /// Resolve the menu, query, labels and reporters of an attribute.
    ///
    /// Malformed metric specs are skipped with a warning.
    pub fn prepare(
        attribute: &AttributeDefinition,
        menus: &mut MenuCache<'_>,
        registry: &SharedRegistry,
        schemas: &LabelSchemas,
    ) -> Self {
        let menu = menus.get(&attribute.menu);

        let mut query = Query::new();
        if let Some((field, value)) = &attribute.filter {
            query = query.with_filter(field.as_str(), value.as_str());
        }
        if attribute.mode != AcquisitionMode::Stream {
            query = query.with_options(attribute.options.iter().cloned());
        }

        let labels = LabelData::for_attribute(attribute);

        let metrics = attribute
            .metrics
            .iter()
            .filter_map(|spec| {
                let (name, source) = match resolve_metric(spec, attribute.mode) {
                    Ok(resolved) => resolved,
                    Err(reason) => {
                        warn!(
                            attribute = %attribute.name,
                            metric = spec.name.as_deref().unwrap_or("<unnamed>"),
                            reason = %reason,
                            "Skipping metric"
                        );
                        return None;
                    }
                };

                let label_names = schemas
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| labels.keys().map(String::from).collect());
                let help = join_help(attribute.help.as_deref(), spec.help.as_deref());
                if let Err(e) = registry.ensure(name, &help, &label_names) {
                    warn!(
                        attribute = %attribute.name,
                        metric = %name,
                        error = %e,
                        "Skipping metric"
                    );
                    return None;
                }

                Some(ResolvedMetric {
                    name: name.to_string(),
                    source,
                    conversion: spec.conversion.clone(),
                })
            })
            .collect();

        Self {
            name: attribute.name.clone(),
            menu,
            query,
            labels,
            metrics,
            registry: Arc::clone(registry),
        }
    }

    /// Record the field metrics of `record` on their reporters.
    ///
    /// An absent field reports 0 when `absent_as_zero` is set and is left
    /// untouched otherwise. A present value that cannot be turned into a
    /// number is skipped. Returns the number of values recorded.
    pub fn record_fields(&self, record: Option<&Record>, absent_as_zero: bool) -> usize {
        let mut recorded = 0;

        for metric in &self.metrics {
            let MetricSource::Field(field) = &metric.source else {
                continue;
            };

            let value = match record.and_then(|r| r.get(field)) {
                None if absent_as_zero => Some(0.0),
                None => continue,
                Some(raw) => observe(metric.conversion.as_ref(), raw),
            };

            match value {
                Some(value) => {
                    if self.record(metric, value) {
                        recorded += 1;
                    }
                }
                None => warn!(
                    attribute = %self.name,
                    metric = %metric.name,
                    field = %field,
                    "Value is not numeric, skipping"
                ),
            }
        }

        recorded
    }

    fn record(&self, metric: &ResolvedMetric, value: f64) -> bool {
        self.registry.set(&metric.name, &self.labels, value)
    }
}

/// Check a metric spec against the attribute's mode.
fn resolve_metric(spec: &MetricSpec, mode: AcquisitionMode) -> Result<(&str, MetricSource), String> {
    let name = spec
        .name
        .as_deref()
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| "metric has no name".to_string())?;

    match (spec.attribute.as_deref(), &spec.kind) {
        (Some(_), Some(_)) => Err("both 'attribute' and 'type' are set".to_string()),
        (Some(field), None) => Ok((name, MetricSource::Field(field.to_string()))),
        (None, Some(MetricKind::Count)) if mode == AcquisitionMode::Get => {
            Ok((name, MetricSource::Count))
        }
        (None, Some(MetricKind::Count)) => Err(format!(
            "'count' is only valid in get mode, not {}",
            mode.as_str()
        )),
        (None, Some(MetricKind::Unknown(kind))) => Err(format!("unknown metric type '{}'", kind)),
        (None, None) => Err("neither 'attribute' nor 'type' is set".to_string()),
    }
}

/// Attribute help and metric help joined by a space.
fn join_help(attribute: Option<&str>, metric: Option<&str>) -> String {
    format!("{} {}", attribute.unwrap_or_default(), metric.unwrap_or_default())
        .trim()
        .to_string()
}

/// Menu handles memoized per path for one wiring pass.
pub struct MenuCache<'a> {
    session: &'a dyn DeviceSession,
    menus: HashMap<String, Arc<dyn Menu>>,
}

impl<'a> MenuCache<'a> {
    pub fn new(session: &'a dyn DeviceSession) -> Self {
        Self {
            session,
            menus: HashMap::new(),
        }
    }

    pub fn get(&mut self, path: &str) -> Arc<dyn Menu> {
        let session = self.session;
        Arc::clone(
            self.menus
                .entry(path.to_string())
                .or_insert_with(|| session.menu(path)),
        )
    }

    pub fn len(&self) -> usize {
        self.menus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.menus.is_empty()
    }
}

/// The handlers built for one session.
#[derive(Default)]
pub struct Wiring {
    pub streams: Vec<StreamHandler>,
    pub pollers: Vec<PullHandler>,
}

/// Wire every attribute against a fresh session.
///
/// Reporters are looked up in `registry` by name, so wiring the same
/// configuration again after a reconnect creates no new reporters.
pub fn wire(
    session: &dyn DeviceSession,
    attributes: &[AttributeDefinition],
    registry: &SharedRegistry,
    schemas: &LabelSchemas,
) -> Wiring {
    let mut menus = MenuCache::new(session);
    let mut wiring = Wiring::default();

    for attribute in attributes {
        let setup = AttributeSetup::prepare(attribute, &mut menus, registry, schemas);

        match attribute.mode {
            AcquisitionMode::Stream => {
                let command = attribute.command.clone().unwrap_or_default();
                wiring.streams.push(StreamHandler::new(setup, command));
            }
            AcquisitionMode::Get => wiring.pollers.push(PullHandler::new(setup, PullKind::List)),
            AcquisitionMode::GetOne => {
                wiring.pollers.push(PullHandler::new(setup, PullKind::Single))
            }
        }
    }

    debug!(
        streams = wiring.streams.len(),
        pollers = wiring.pollers.len(),
        menus = menus.len(),
        "Attributes wired"
    );

    wiring
}
