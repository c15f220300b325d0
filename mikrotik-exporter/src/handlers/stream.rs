use std::sync::Arc;

use mikrotik_common::{DeviceError, EventStream, Record};
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use super::AttributeSetup;
use crate::stats::ExporterStats;

/// A delivery error on an active stream, reported to the controller.
#[derive(Debug, Clone)]
pub struct StreamFault {
    pub attribute: String,
    pub error: DeviceError,
}

/// A continuously pushed attribute (stream mode).
pub struct StreamHandler {
    setup: AttributeSetup,
    command: String,
}

impl StreamHandler {
    pub fn new(setup: AttributeSetup, command: String) -> Self {
        Self { setup, command }
    }

    pub fn name(&self) -> &str {
        &self.setup.name
    }

    pub fn menu(&self) -> &str {
        self.setup.menu.path()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Open the subscription on the device.
    pub async fn subscribe(&self) -> Result<EventStream, DeviceError> {
        self.setup
            .menu
            .stream(&self.command, &self.setup.query)
            .await
    }

    /// Apply one delivered batch. Only the first record is consulted, and
    /// only the fields it carries are updated.
    ///
    /// Returns the number of values recorded.
    pub fn apply(&self, batch: &[Record]) -> usize {
        let recorded = self.setup.record_fields(batch.first(), false);
        trace!(
            attribute = %self.setup.name,
            records = batch.len(),
            recorded,
            "Stream batch applied"
        );
        recorded
    }

    /// Consume deliveries until the stream ends or fails.
    ///
    /// A delivery error is forwarded on `faults` and ends the listener.
    pub async fn listen(
        self,
        mut events: EventStream,
        stats: Arc<ExporterStats>,
        faults: mpsc::Sender<StreamFault>,
    ) {
        while let Some(delivery) = events.recv().await {
            match delivery {
                Ok(batch) => {
                    self.apply(&batch);
                    stats.stream_event(&self.setup.name);
                }
                Err(e) => {
                    error!(
                        attribute = %self.setup.name,
                        command = %self.command,
                        error = %e,
                        "Stream delivered an error"
                    );
                    // The controller may already be tearing the session down.
                    let _ = faults
                        .send(StreamFault {
                            attribute: self.setup.name.clone(),
                            error: e,
                        })
                        .await;
                    return;
                }
            }
        }

        debug!(attribute = %self.setup.name, "Stream ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AcquisitionMode, AttributeDefinition, MetricSpec};
    use crate::convert::Conversion;
    use crate::handlers::MenuCache;
    use crate::labels::LabelSchemas;
    use crate::registry::{ReporterRegistry, SharedRegistry};
    use mikrotik_common::simulator::record;
    use mikrotik_common::{DeviceConnector, SimulatedRouter};
    use serde_json::json;

    fn traffic_attribute() -> AttributeDefinition {
        AttributeDefinition {
            name: "Ethernet3".to_string(),
            mode: AcquisitionMode::Stream,
            menu: "/interface".to_string(),
            command: Some("monitor-traffic".to_string()),
            filter: Some(("interface".to_string(), "ether3".to_string())),
            options: Vec::new(),
            labels: vec![("Site Name".to_string(), "HQ".to_string())],
            help: None,
            metrics: vec![
                MetricSpec::field("rx", "rx-bits-per-second"),
                MetricSpec::field("running", "running").with_conversion(Conversion::Boolean),
            ],
        }
    }

    async fn setup(router: &SimulatedRouter, registry: &SharedRegistry) -> StreamHandler {
        let session = router.connect().await.unwrap();
        let mut menus = MenuCache::new(session.as_ref());
        let attr = traffic_attribute();
        let setup = AttributeSetup::prepare(&attr, &mut menus, registry, &LabelSchemas::new());
        StreamHandler::new(setup, "monitor-traffic".to_string())
    }

    #[tokio::test]
    async fn test_apply_uses_first_record() {
        let router = SimulatedRouter::demo("r1");
        let registry = Arc::new(ReporterRegistry::new("p"));
        let handler = setup(&router, &registry).await;

        let batch = vec![
            record(json!({"rx-bits-per-second": "1500", "running": "true"})),
            record(json!({"rx-bits-per-second": "9999"})),
        ];
        assert_eq!(handler.apply(&batch), 2);
        assert_eq!(handler.apply(&[]), 0);
        assert_eq!(
            handler.apply(&[record(json!({"running": "false"}))]),
            1
        );

        let output = registry.render();
        assert!(output.contains("p_rx{name=\"Ethernet3\",site_name=\"HQ\"} 1500"));
        assert!(output.contains("p_running{name=\"Ethernet3\",site_name=\"HQ\"} 0"));
    }

    #[tokio::test]
    async fn test_listen_applies_filtered_events() {
        let router = SimulatedRouter::demo("r1");
        let registry = Arc::new(ReporterRegistry::new("p"));
        let stats = Arc::new(ExporterStats::new("p"));
        let handler = setup(&router, &registry).await;

        let events = handler.subscribe().await.unwrap();
        let (fault_tx, _fault_rx) = mpsc::channel(1);
        let task = tokio::spawn(handler.listen(events, Arc::clone(&stats), fault_tx));

        let other = router.push_event(
            "/interface",
            "monitor-traffic",
            vec![record(json!({"interface": "ether1", "rx-bits-per-second": "1"}))],
        );
        assert_eq!(other, 0);

        let delivered = router.push_event(
            "/interface",
            "monitor-traffic",
            vec![record(json!({
                "interface": "ether3",
                "rx-bits-per-second": "1500",
                "running": "true",
            }))],
        );
        assert_eq!(delivered, 1);

        router.drop_session("test over");
        task.await.unwrap();

        let output = registry.render();
        assert!(output.contains("p_rx{name=\"Ethernet3\",site_name=\"HQ\"} 1500"));
        assert!(output.contains("p_running{name=\"Ethernet3\",site_name=\"HQ\"} 1"));
        assert_eq!(stats.stream_events("Ethernet3"), 1);
    }

    #[tokio::test]
    async fn test_listen_forwards_fault() {
        let router = SimulatedRouter::demo("r1");
        let registry = Arc::new(ReporterRegistry::new("p"));
        let stats = Arc::new(ExporterStats::new("p"));
        let handler = setup(&router, &registry).await;

        let events = handler.subscribe().await.unwrap();
        let (fault_tx, mut fault_rx) = mpsc::channel(1);
        let task = tokio::spawn(handler.listen(events, stats, fault_tx));

        router.push_stream_error("/interface", "monitor-traffic", "interrupted");

        let fault = fault_rx.recv().await.unwrap();
        assert_eq!(fault.attribute, "Ethernet3");
        assert!(matches!(fault.error, DeviceError::Stream { .. }));
        task.await.unwrap();
    }
}
