//! Reporter registry: one gauge family per logical metric name.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::labels::{LabelData, build_metric_name};

/// Errors raised when recording an observation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No reporter registered for metric '{0}'")]
    UnknownReporter(String),
    #[error("Metric '{metric}' has no label '{label}'")]
    UnknownLabel { metric: String, label: String },
    #[error("Metric '{metric}' would be exported as '{exported}', already used by '{existing}'")]
    NameCollision {
        metric: String,
        exported: String,
        existing: String,
    },
}

/// A gauge family with a fixed label schema.
#[derive(Debug)]
pub struct Reporter {
    name: String,
    exported_name: String,
    help: RwLock<String>,
    label_names: Vec<String>,
    /// Label values (in `label_names` order) to current value.
    series: RwLock<BTreeMap<Vec<String>, f64>>,
}

impl Reporter {
    fn new(name: &str, exported_name: String, help: &str, label_names: &[String]) -> Self {
        Self {
            name: name.to_string(),
            exported_name,
            help: RwLock::new(help.to_string()),
            label_names: label_names.to_vec(),
            series: RwLock::new(BTreeMap::new()),
        }
    }

    /// The logical metric name from configuration.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The name written to the exposition output.
    pub fn exported_name(&self) -> &str {
        &self.exported_name
    }

    pub fn help(&self) -> String {
        self.help.read().clone()
    }

    pub fn label_names(&self) -> &[String] {
        &self.label_names
    }

    /// Set the value of the series identified by `labels`.
    ///
    /// Keys declared in the schema but absent from `labels` are set to "".
    pub fn set(&self, labels: &LabelData, value: f64) -> Result<(), RegistryError> {
        let values = self.label_values(labels)?;
        trace!(metric = %self.name, value, "Gauge updated");
        self.series.write().insert(values, value);
        Ok(())
    }

    /// Current value of the series identified by `labels`.
    pub fn get(&self, labels: &LabelData) -> Option<f64> {
        let values = self.label_values(labels).ok()?;
        self.series.read().get(&values).copied()
    }

    pub fn series_count(&self) -> usize {
        self.series.read().len()
    }

    fn label_values(&self, labels: &LabelData) -> Result<Vec<String>, RegistryError> {
        if let Some(unknown) = labels
            .keys()
            .find(|key| !self.label_names.iter().any(|n| n == key))
        {
            return Err(RegistryError::UnknownLabel {
                metric: self.name.clone(),
                label: unknown.to_string(),
            });
        }

        Ok(self
            .label_names
            .iter()
            .map(|name| labels.get(name).unwrap_or_default().to_string())
            .collect())
    }

    /// Fill in help text only when none was registered.
    fn backfill_help(&self, help: &str) {
        if help.is_empty() {
            return;
        }
        let mut current = self.help.write();
        if current.is_empty() {
            *current = help.to_string();
        }
    }

    fn render_into(&self, output: &mut String) {
        let help = self.help.read();
        if !help.is_empty() {
            writeln!(output, "# HELP {} {}", self.exported_name, escape_help(&help)).ok();
        }
        writeln!(output, "# TYPE {} gauge", self.exported_name).ok();

        for (values, value) in self.series.read().iter() {
            let labels: Vec<(&str, &str)> = self
                .label_names
                .iter()
                .map(String::as_str)
                .zip(values.iter().map(String::as_str))
                .collect();

            writeln!(
                output,
                "{}{} {}",
                self.exported_name,
                format_labels(&labels),
                format_value(*value)
            )
            .ok();
        }
    }
}

/// Thread-safe registry of reporters, keyed by logical metric name.
///
/// Reporters survive reconnects: re-wiring the same configuration reuses them.
pub struct ReporterRegistry {
    prefix: String,
    reporters: RwLock<HashMap<String, Arc<Reporter>>>,
}

impl ReporterRegistry {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            reporters: RwLock::new(HashMap::new()),
        }
    }

    /// Get the reporter for `name`, creating it on first use.
    ///
    /// An existing reporter keeps its label schema; its help text is only
    /// filled in when it was empty. A new name whose exported form is already
    /// taken by another reporter is refused.
    pub fn ensure(
        &self,
        name: &str,
        help: &str,
        label_names: &[String],
    ) -> Result<Arc<Reporter>, RegistryError> {
        if let Some(reporter) = self.reporters.read().get(name) {
            reporter.backfill_help(help);
            return Ok(Arc::clone(reporter));
        }

        let mut reporters = self.reporters.write();
        if let Some(reporter) = reporters.get(name) {
            reporter.backfill_help(help);
            return Ok(Arc::clone(reporter));
        }

        let exported_name = build_metric_name(&self.prefix, name);
        if let Some(existing) = reporters
            .values()
            .find(|r| r.exported_name == exported_name)
        {
            return Err(RegistryError::NameCollision {
                metric: name.to_string(),
                exported: exported_name,
                existing: existing.name.clone(),
            });
        }

        debug!(
            metric = %name,
            exported = %exported_name,
            labels = ?label_names,
            "Registered reporter"
        );
        let reporter = Arc::new(Reporter::new(name, exported_name, help, label_names));
        reporters.insert(name.to_string(), Arc::clone(&reporter));
        Ok(reporter)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Reporter>> {
        self.reporters.read().get(name).cloned()
    }

    /// Record a value on the reporter for `name`.
    ///
    /// Failures are logged; returns whether the value was stored.
    pub fn set(&self, name: &str, labels: &LabelData, value: f64) -> bool {
        let result = match self.get(name) {
            Some(reporter) => reporter.set(labels, value),
            None => Err(RegistryError::UnknownReporter(name.to_string())),
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(metric = %name, error = %e, "Dropping observation");
                false
            }
        }
    }

    /// Number of reporters.
    pub fn len(&self) -> usize {
        self.reporters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.read().is_empty()
    }

    /// Total number of series across all reporters.
    pub fn series_count(&self) -> usize {
        self.reporters
            .read()
            .values()
            .map(|r| r.series_count())
            .sum()
    }

    /// Render all reporters in Prometheus text exposition format, sorted by
    /// exported name.
    pub fn render(&self) -> String {
        let mut reporters: Vec<Arc<Reporter>> = self.reporters.read().values().cloned().collect();
        reporters.sort_by(|a, b| a.exported_name.cmp(&b.exported_name));

        let mut output = String::with_capacity(reporters.len() * 128);
        for reporter in reporters {
            reporter.render_into(&mut output);
        }
        output
    }
}

/// Create a shareable registry handle.
pub type SharedRegistry = Arc<ReporterRegistry>;

/// Escape special characters in label values.
fn escape_label_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// Escape backslashes and newlines in help text.
fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Format a floating point value for Prometheus.
fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}

fn format_labels(labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return String::new();
    }

    let parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect();

    format!("{{{}}}", parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AcquisitionMode, AttributeDefinition};

    fn labels(name: &str, extra: &[(&str, &str)]) -> LabelData {
        let attribute = AttributeDefinition {
            name: name.to_string(),
            mode: AcquisitionMode::Get,
            menu: "/interface".to_string(),
            command: None,
            filter: None,
            options: Vec::new(),
            labels: extra
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            help: None,
            metrics: Vec::new(),
        };
        LabelData::for_attribute(&attribute)
    }

    fn schema(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let registry = ReporterRegistry::new("mikrotikexporter");

        let first = registry
            .ensure("uptime", "in seconds", &schema(&["name"]))
            .unwrap();
        let second = registry
            .ensure("uptime", "other help", &schema(&["name"]))
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(first.help(), "in seconds");
        assert_eq!(first.exported_name(), "mikrotikexporter_uptime");
    }

    #[test]
    fn test_ensure_backfills_empty_help() {
        let registry = ReporterRegistry::new("p");

        let reporter = registry.ensure("rx", "", &schema(&["name"])).unwrap();
        assert_eq!(reporter.help(), "");

        registry
            .ensure("rx", "received bits", &schema(&["name"]))
            .unwrap();
        assert_eq!(reporter.help(), "received bits");
    }

    #[test]
    fn test_ensure_refuses_exported_name_collision() {
        let registry = ReporterRegistry::new("p");
        let free = registry
            .ensure("Free Memory", "", &schema(&["name"]))
            .unwrap();

        assert_eq!(
            registry
                .ensure("free_memory", "", &schema(&["name"]))
                .unwrap_err(),
            RegistryError::NameCollision {
                metric: "free_memory".to_string(),
                exported: "p_free_memory".to_string(),
                existing: "Free Memory".to_string(),
            }
        );
        assert_eq!(registry.len(), 1);
        assert!(registry.get("free_memory").is_none());

        free.set(&labels("res", &[]), 1.0).unwrap();
        let output = registry.render();
        assert_eq!(output.matches("# TYPE p_free_memory gauge").count(), 1);
    }

    #[test]
    fn test_render_uses_legal_label_names() {
        let registry = ReporterRegistry::new("p");
        let data = labels("res", &[("Site-Name", "HQ"), ("2nd Rack", "B")]);
        let keys: Vec<String> = data.keys().map(String::from).collect();
        let reporter = registry.ensure("free", "", &keys).unwrap();

        reporter.set(&data, 1.0).unwrap();

        assert_eq!(
            registry.render(),
            "# TYPE p_free gauge\np_free{name=\"res\",site_name=\"HQ\",_2nd_rack=\"B\"} 1\n"
        );
    }

    #[test]
    fn test_set_and_get() {
        let registry = ReporterRegistry::new("p");
        let reporter = registry
            .ensure("rx", "", &schema(&["name", "site"]))
            .unwrap();

        let wan = labels("wan", &[("Site", "HQ")]);
        reporter.set(&wan, 1500.0).unwrap();
        assert_eq!(reporter.get(&wan), Some(1500.0));

        reporter.set(&wan, 1600.0).unwrap();
        assert_eq!(reporter.get(&wan), Some(1600.0));
        assert_eq!(reporter.series_count(), 1);
    }

    #[test]
    fn test_missing_schema_key_becomes_empty() {
        let registry = ReporterRegistry::new("p");
        let reporter = registry
            .ensure("rx", "", &schema(&["name", "site"]))
            .unwrap();

        reporter.set(&labels("lan", &[]), 5.0).unwrap();

        let output = registry.render();
        assert!(output.contains("p_rx{name=\"lan\",site=\"\"} 5"));
    }

    #[test]
    fn test_registry_set_by_name() {
        let registry = ReporterRegistry::new("p");
        assert!(!registry.set("missing", &labels("wan", &[]), 1.0));

        let reporter = registry.ensure("rx", "", &schema(&["name"])).unwrap();
        assert!(registry.set("rx", &labels("wan", &[]), 7.0));
        assert_eq!(reporter.get(&labels("wan", &[])), Some(7.0));

        assert!(!registry.set("rx", &labels("wan", &[("site", "HQ")]), 8.0));
        assert_eq!(reporter.series_count(), 1);
    }

    #[test]
    fn test_set_unknown_label() {
        let registry = ReporterRegistry::new("p");
        let reporter = registry.ensure("rx", "", &schema(&["name"])).unwrap();

        assert_eq!(
            reporter.set(&labels("wan", &[("site", "HQ")]), 1.0),
            Err(RegistryError::UnknownLabel {
                metric: "rx".to_string(),
                label: "site".to_string(),
            })
        );
        assert_eq!(reporter.series_count(), 0);
    }

    #[test]
    fn test_render_format() {
        let registry = ReporterRegistry::new("mikrotikexporter");
        let uptime = registry
            .ensure("uptime", "System uptime in seconds", &schema(&["name"]))
            .unwrap();
        let cpu = registry.ensure("cpu_load", "", &schema(&["name"])).unwrap();

        uptime.set(&labels("resources", &[]), 3600.0).unwrap();
        cpu.set(&labels("resources", &[]), 12.5).unwrap();

        let output = registry.render();
        let expected = "\
# TYPE mikrotikexporter_cpu_load gauge
mikrotikexporter_cpu_load{name=\"resources\"} 12.5
# HELP mikrotikexporter_uptime System uptime in seconds
# TYPE mikrotikexporter_uptime gauge
mikrotikexporter_uptime{name=\"resources\"} 3600
";
        assert_eq!(output, expected);
    }

    #[test]
    fn test_render_sorted_series_and_escaping() {
        let registry = ReporterRegistry::new("p");
        let rx = registry
            .ensure("rx", "line one\nline two", &schema(&["name"]))
            .unwrap();

        rx.set(&labels("wlan1", &[]), 2.0).unwrap();
        rx.set(&labels("ether\"1\"", &[]), 1.0).unwrap();

        let output = registry.render();
        assert!(output.contains("# HELP p_rx line one\\nline two\n"));

        let first = output.find("ether\\\"1\\\"").unwrap();
        let second = output.find("wlan1").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_render_empty_reporter() {
        let registry = ReporterRegistry::new("p");
        registry.ensure("idle", "", &schema(&["name"])).unwrap();
        assert_eq!(registry.render(), "# TYPE p_idle gauge\n");
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(42.0), "42");
        assert_eq!(format_value(3.125), "3.125");
        assert_eq!(format_value(f64::NAN), "NaN");
        assert_eq!(format_value(f64::INFINITY), "+Inf");
        assert_eq!(format_value(f64::NEG_INFINITY), "-Inf");
    }

    #[test]
    fn test_concurrent_updates() {
        use std::thread;

        let registry = Arc::new(ReporterRegistry::new("p"));
        let rx = registry.ensure("rx", "", &schema(&["name"])).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let rx = Arc::clone(&rx);
                thread::spawn(move || {
                    let data = labels(&format!("if{}", i), &[]);
                    for v in 0..100 {
                        rx.set(&data, v as f64).unwrap();
                        let _ = registry.render();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.series_count(), 8);
    }
}
