//! Exporter self-metrics.
//!
//! These describe the exporter itself (connection state, poll outcomes) and
//! are appended to every scrape after the device series.

use std::collections::HashSet;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode_registry;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Outcome label for a single attribute poll.
pub const OUTCOME_OK: &str = "ok";
pub const OUTCOME_ERROR: &str = "error";

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PollLabels {
    pub attribute: String,
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StreamLabels {
    pub attribute: String,
}

/// Exporter self-metrics backed by a prometheus-client registry.
#[derive(Debug)]
pub struct ExporterStats {
    registry: Registry,
    connected: Gauge,
    connection_attempts: Counter,
    disconnects: Counter,
    polls: Family<PollLabels, Counter>,
    stream_events: Family<StreamLabels, Counter>,
}

impl ExporterStats {
    /// Create the self-metrics, named `<prefix>_exporter_*`.
    pub fn new(prefix: &str) -> Self {
        let mut registry = Registry::with_prefix(format!("{}_exporter", prefix));

        let connected = Gauge::default();
        registry.register(
            "connected",
            "Whether a device session is currently established",
            connected.clone(),
        );

        let connection_attempts = Counter::default();
        registry.register(
            "connection_attempts",
            "Device connection attempts",
            connection_attempts.clone(),
        );

        let disconnects = Counter::default();
        registry.register(
            "disconnects",
            "Established sessions that were lost",
            disconnects.clone(),
        );

        let polls = Family::<PollLabels, Counter>::default();
        registry.register("polls", "Attribute polls by outcome", polls.clone());

        let stream_events = Family::<StreamLabels, Counter>::default();
        registry.register(
            "stream_events",
            "Stream batches applied per attribute",
            stream_events.clone(),
        );

        Self {
            registry,
            connected,
            connection_attempts,
            disconnects,
            polls,
            stream_events,
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.set(i64::from(connected));
    }

    pub fn is_connected(&self) -> bool {
        self.connected.get() == 1
    }

    pub fn connection_attempt(&self) {
        self.connection_attempts.inc();
    }

    pub fn connection_attempts(&self) -> u64 {
        self.connection_attempts.get()
    }

    pub fn disconnect(&self) {
        self.disconnects.inc();
    }

    pub fn disconnects(&self) -> u64 {
        self.disconnects.get()
    }

    /// Count one poll of `attribute`.
    pub fn poll(&self, attribute: &str, ok: bool) {
        self.polls.get_or_create(&poll_labels(attribute, ok)).inc();
    }

    pub fn polls(&self, attribute: &str, ok: bool) -> u64 {
        self.polls.get_or_create(&poll_labels(attribute, ok)).get()
    }

    /// Count one applied stream batch for `attribute`.
    pub fn stream_event(&self, attribute: &str) {
        self.stream_events
            .get_or_create(&StreamLabels {
                attribute: attribute.to_string(),
            })
            .inc();
    }

    pub fn stream_events(&self, attribute: &str) -> u64 {
        self.stream_events
            .get_or_create(&StreamLabels {
                attribute: attribute.to_string(),
            })
            .get()
    }

    /// Encode in the text exposition format (version 0.0.4), matching the
    /// device series it is served with.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode_registry(&mut buffer, &self.registry) {
            tracing::warn!(error = %e, "Failed to encode exporter metrics");
        }
        openmetrics_to_text(&buffer)
    }
}

/// Rewrite OpenMetrics output as text format 0.0.4.
///
/// Counter families are renamed to their `_total` sample name, and `# UNIT`
/// and `# EOF` lines are dropped.
fn openmetrics_to_text(encoded: &str) -> String {
    let counters: HashSet<&str> = encoded
        .lines()
        .filter_map(|line| line.strip_prefix("# TYPE "))
        .filter_map(|rest| rest.strip_suffix(" counter"))
        .collect();

    let mut output = String::with_capacity(encoded.len());
    for line in encoded.lines() {
        if line == "# EOF" || line.starts_with("# UNIT ") {
            continue;
        }

        let rewritten = ["# HELP ", "# TYPE "].iter().find_map(|marker| {
            let rest = line.strip_prefix(marker)?;
            let (name, tail) = rest.split_once(' ')?;
            counters
                .contains(name)
                .then(|| format!("{}{}_total {}", marker, name, tail))
        });

        output.push_str(rewritten.as_deref().unwrap_or(line));
        output.push('\n');
    }
    output
}

fn poll_labels(attribute: &str, ok: bool) -> PollLabels {
    PollLabels {
        attribute: attribute.to_string(),
        outcome: if ok { OUTCOME_OK } else { OUTCOME_ERROR }.to_string(),
    }
}
