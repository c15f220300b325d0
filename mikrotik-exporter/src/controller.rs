//! Connection lifecycle controller.
//!
//! Owns the device session: connects, wires every attribute, runs the poll
//! scheduler, and on any session failure tears everything down and
//! reconnects after a fixed delay. Reporters live in the shared registry and
//! are reused across sessions.

use std::sync::Arc;
use std::time::Duration;

use mikrotik_common::{DeviceConnector, DeviceError, DeviceSession};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior, interval, sleep};
use tracing::{debug, error, info, warn};

use crate::config::{AttributeDefinition, ExporterConfig, StreamErrorPolicy};
use crate::handlers::{self, PullHandler, StreamFault};
use crate::labels::{LabelSchemas, plan_label_schemas};
use crate::registry::SharedRegistry;
use crate::stats::ExporterStats;

/// Buffered stream faults per session.
const FAULT_BUFFER: usize = 16;

/// Connection state, published for readiness checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

/// Errors that stop the controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Stream on attribute '{attribute}' failed: {source}")]
    StreamFailed {
        attribute: String,
        #[source]
        source: DeviceError,
    },
}

/// Timing and policy knobs taken from the configuration.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub scrape_interval: Duration,
    pub reconnect_delay: Duration,
    /// Bound on a connect attempt, a subscription request or a single query.
    pub device_timeout: Duration,
    pub stream_error_policy: StreamErrorPolicy,
}

impl From<&ExporterConfig> for ControllerSettings {
    fn from(config: &ExporterConfig) -> Self {
        Self {
            scrape_interval: config.scrape_interval(),
            reconnect_delay: config.reconnect_delay(),
            device_timeout: config.device_timeout(),
            stream_error_policy: config.stream_error_policy,
        }
    }
}

/// How a connected session ended.
enum SessionEnd {
    /// Process shutdown was requested.
    Shutdown,
    /// The session failed; reconnect.
    Lost(DeviceError),
    /// A stream failed under the exit policy.
    Fatal(ControllerError),
}

/// The connection lifecycle controller.
pub struct Controller {
    connector: Arc<dyn DeviceConnector>,
    attributes: Arc<Vec<AttributeDefinition>>,
    schemas: LabelSchemas,
    registry: SharedRegistry,
    stats: Arc<ExporterStats>,
    settings: ControllerSettings,
    state_tx: watch::Sender<ConnectionState>,
}

impl Controller {
    pub fn new(
        connector: Arc<dyn DeviceConnector>,
        attributes: Vec<AttributeDefinition>,
        settings: ControllerSettings,
        registry: SharedRegistry,
        stats: Arc<ExporterStats>,
    ) -> Self {
        let schemas = plan_label_schemas(&attributes);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            connector,
            attributes: Arc::new(attributes),
            schemas,
            registry,
            stats,
            settings,
            state_tx,
        }
    }

    /// Subscribe to connection state changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Run until shutdown is signalled or a stream fails under the exit policy.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ControllerError> {
        let target = self.connector.target();

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            self.stats.connection_attempt();
            info!(device = %target, "Connecting to device");

            let timeout = self.settings.device_timeout;
            let attempt = tokio::select! {
                result = time::timeout(timeout, self.connector.connect()) => {
                    result.unwrap_or_else(|_| {
                        Err(DeviceError::Connection(format!(
                            "no answer within {}s",
                            timeout.as_secs()
                        )))
                    })
                }
                _ = wait_for_shutdown(&mut shutdown) => break,
            };

            match attempt {
                Ok(session) => {
                    info!(device = %target, "Connected to device");
                    let end = self.run_session(Arc::clone(&session), &mut shutdown).await;
                    session.close().await;

                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(e) => {
                            self.stats.disconnect();
                            warn!(
                                device = %target,
                                error = %e,
                                retry_in_secs = self.settings.reconnect_delay.as_secs(),
                                "Device session lost, reconnecting"
                            );
                        }
                        SessionEnd::Fatal(e) => {
                            self.set_state(ConnectionState::Disconnected);
                            error!(device = %target, error = %e, "Stopping exporter");
                            return Err(e);
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        device = %target,
                        error = %e,
                        retry_in_secs = self.settings.reconnect_delay.as_secs(),
                        "Connection failed"
                    );
                }
            }

            self.set_state(ConnectionState::Disconnected);

            tokio::select! {
                _ = sleep(self.settings.reconnect_delay) => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!(device = %target, "Controller stopped");
        Ok(())
    }

    /// Wire attributes on a live session and wait for it to end.
    async fn run_session(
        &self,
        session: Arc<dyn DeviceSession>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let wiring = handlers::wire(
            session.as_ref(),
            &self.attributes,
            &self.registry,
            &self.schemas,
        );

        let (fault_tx, mut fault_rx) = mpsc::channel(FAULT_BUFFER);
        let mut tasks = JoinSet::new();

        let timeout = self.settings.device_timeout;
        for stream in wiring.streams {
            let subscribed = time::timeout(timeout, stream.subscribe())
                .await
                .unwrap_or_else(|_| {
                    Err(DeviceError::stream(
                        stream.menu(),
                        stream.command(),
                        format!("no answer within {}s", timeout.as_secs()),
                    ))
                });

            match subscribed {
                Ok(events) => {
                    debug!(
                        attribute = %stream.name(),
                        command = %stream.command(),
                        "Subscribed"
                    );
                    tasks.spawn(stream.listen(events, Arc::clone(&self.stats), fault_tx.clone()));
                }
                Err(e) => {
                    error!(attribute = %stream.name(), error = %e, "Subscription failed");
                    let _ = fault_tx.try_send(StreamFault {
                        attribute: stream.name().to_string(),
                        error: e,
                    });
                }
            }
        }

        self.set_state(ConnectionState::Connected);

        if !wiring.pollers.is_empty() {
            tasks.spawn(run_scheduler(
                wiring.pollers,
                self.settings.scrape_interval,
                timeout,
                Arc::clone(&self.stats),
            ));
        }

        let end = tokio::select! {
            e = session.closed() => SessionEnd::Lost(e),
            Some(fault) = fault_rx.recv() => self.on_stream_fault(fault),
            _ = wait_for_shutdown(shutdown) => SessionEnd::Shutdown,
        };

        // Stop the scheduler and listeners before the session is closed.
        tasks.shutdown().await;
        drop(fault_tx);

        end
    }

    fn on_stream_fault(&self, fault: StreamFault) -> SessionEnd {
        match self.settings.stream_error_policy {
            StreamErrorPolicy::Reconnect => SessionEnd::Lost(fault.error),
            StreamErrorPolicy::Exit => SessionEnd::Fatal(ControllerError::StreamFailed {
                attribute: fault.attribute,
                source: fault.error,
            }),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.stats.set_connected(state == ConnectionState::Connected);
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = previous.as_str(), to = state.as_str(), "Connection state changed");
        }
    }
}

/// Poll every pull attribute once per tick, the first tick immediately.
async fn run_scheduler(
    pollers: Vec<PullHandler>,
    period: Duration,
    timeout: Duration,
    stats: Arc<ExporterStats>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        poll_cycle(&pollers, timeout, &stats).await;
    }
}

/// Poll attributes in configuration order. A failed or unanswered attribute
/// does not stop the rest of the cycle.
pub async fn poll_cycle(pollers: &[PullHandler], timeout: Duration, stats: &ExporterStats) {
    for poller in pollers {
        let result = time::timeout(timeout, poller.poll())
            .await
            .unwrap_or_else(|_| {
                Err(DeviceError::query(
                    poller.menu(),
                    format!("no answer within {}s", timeout.as_secs()),
                ))
            });

        match result {
            Ok(recorded) => {
                stats.poll(poller.name(), true);
                debug!(attribute = %poller.name(), recorded, "Polled");
            }
            Err(e) => {
                stats.poll(poller.name(), false);
                warn!(
                    attribute = %poller.name(),
                    menu = %poller.menu(),
                    error = %e,
                    "Poll failed"
                );
            }
        }
    }
}

/// Resolve once shutdown is signalled or the signalling side is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AcquisitionMode, MetricSpec};
    use crate::registry::ReporterRegistry;
    use mikrotik_common::SimulatedRouter;

    fn settings(policy: StreamErrorPolicy) -> ControllerSettings {
        ControllerSettings {
            scrape_interval: Duration::from_secs(15),
            reconnect_delay: Duration::from_secs(5),
            device_timeout: Duration::from_secs(30),
            stream_error_policy: policy,
        }
    }

    fn attributes() -> Vec<AttributeDefinition> {
        vec![
            AttributeDefinition {
                name: "interfaces".to_string(),
                mode: AcquisitionMode::Get,
                menu: "/interface".to_string(),
                command: None,
                filter: None,
                options: Vec::new(),
                labels: Vec::new(),
                help: None,
                metrics: vec![MetricSpec::count("interface_count")],
            },
            AttributeDefinition {
                name: "ether1".to_string(),
                mode: AcquisitionMode::Stream,
                menu: "/interface".to_string(),
                command: Some("monitor-traffic".to_string()),
                filter: Some(("name".to_string(), "ether1".to_string())),
                options: Vec::new(),
                labels: Vec::new(),
                help: None,
                metrics: vec![MetricSpec::field("rx_bps", "rx-bits-per-second")],
            },
        ]
    }

    fn controller(
        router: &SimulatedRouter,
        policy: StreamErrorPolicy,
    ) -> (Controller, SharedRegistry, Arc<ExporterStats>) {
        let registry = Arc::new(ReporterRegistry::new("p"));
        let stats = Arc::new(ExporterStats::new("p"));
        let controller = Controller::new(
            Arc::new(router.clone()),
            attributes(),
            settings(policy),
            Arc::clone(&registry),
            Arc::clone(&stats),
        );
        (controller, registry, stats)
    }

    async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, state: ConnectionState) {
        rx.wait_for(|s| *s == state).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_poll_and_shutdown() {
        let router = SimulatedRouter::demo("r1");
        let (controller, registry, stats) = controller(&router, StreamErrorPolicy::Reconnect);
        let mut state = controller.state();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(controller.run(shutdown_rx));
        wait_for_state(&mut state, ConnectionState::Connected).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.render().contains("p_interface_count{name=\"interfaces\"} 4"));
        assert!(stats.is_connected());
        assert_eq!(router.subscription_count(), 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert!(!router.is_connected());
        assert!(!stats.is_connected());
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_refused_connection() {
        let router = SimulatedRouter::demo("r1");
        router.refuse_connections(2);
        let (controller, _registry, stats) = controller(&router, StreamErrorPolicy::Reconnect);
        let mut state = controller.state();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(controller.run(shutdown_rx));
        wait_for_state(&mut state, ConnectionState::Connected).await;

        assert_eq!(router.connect_attempts(), 3);
        assert_eq!(stats.connection_attempts(), 3);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_drop_reuses_reporters() {
        let router = SimulatedRouter::demo("r1");
        let (controller, registry, stats) = controller(&router, StreamErrorPolicy::Reconnect);
        let mut state = controller.state();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(controller.run(shutdown_rx));
        wait_for_state(&mut state, ConnectionState::Connected).await;
        let reporters = registry.len();

        assert!(router.drop_session("link down"));
        wait_for_state(&mut state, ConnectionState::Disconnected).await;
        wait_for_state(&mut state, ConnectionState::Connected).await;

        assert_eq!(router.sessions_opened(), 2);
        assert_eq!(registry.len(), reporters);
        assert_eq!(stats.disconnects(), 1);
        assert_eq!(router.subscription_count(), 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_error_reconnects_by_default() {
        let router = SimulatedRouter::demo("r1");
        let (controller, _registry, _stats) = controller(&router, StreamErrorPolicy::Reconnect);
        let mut state = controller.state();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(controller.run(shutdown_rx));
        wait_for_state(&mut state, ConnectionState::Connected).await;

        router.push_stream_error("/interface", "monitor-traffic", "interrupted");
        wait_for_state(&mut state, ConnectionState::Disconnected).await;
        wait_for_state(&mut state, ConnectionState::Connected).await;
        assert_eq!(router.sessions_opened(), 2);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_error_exit_policy() {
        let router = SimulatedRouter::demo("r1");
        let (controller, _registry, _stats) = controller(&router, StreamErrorPolicy::Exit);
        let mut state = controller.state();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(controller.run(shutdown_rx));
        wait_for_state(&mut state, ConnectionState::Connected).await;

        router.push_stream_error("/interface", "monitor-traffic", "interrupted");
        let result = handle.await.unwrap();

        assert!(matches!(
            result,
            Err(ControllerError::StreamFailed { ref attribute, .. }) if attribute == "ether1"
        ));
        assert!(!router.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_disconnected() {
        let router = SimulatedRouter::demo("r1");
        router.refuse_connections(u32::MAX);
        let (controller, _registry, _stats) = controller(&router, StreamErrorPolicy::Reconnect);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(controller.run(shutdown_rx));
        tokio::time::sleep(Duration::from_secs(12)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        // Immediate attempt, then one every 5s.
        assert_eq!(router.connect_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_connect_times_out_and_retries() {
        let router = SimulatedRouter::demo("r1");
        router.stall_connections(2);
        let (controller, _registry, stats) = controller(&router, StreamErrorPolicy::Reconnect);
        let mut state = controller.state();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(controller.run(shutdown_rx));
        wait_for_state(&mut state, ConnectionState::Connected).await;

        // Two 30s timeouts, each followed by the 5s retry delay.
        assert_eq!(router.connect_attempts(), 3);
        assert_eq!(stats.connection_attempts(), 3);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_query_does_not_stall_siblings() {
        let router = SimulatedRouter::demo("r1");
        let session = router.connect().await.unwrap();
        let registry = Arc::new(ReporterRegistry::new("p"));
        let stats = ExporterStats::new("p");

        let pull = |name: &str, menu: &str, metric: MetricSpec| AttributeDefinition {
            name: name.to_string(),
            mode: AcquisitionMode::Get,
            menu: menu.to_string(),
            command: None,
            filter: None,
            options: Vec::new(),
            labels: Vec::new(),
            help: None,
            metrics: vec![metric],
        };
        let attributes = vec![
            pull("interfaces", "/interface", MetricSpec::count("interface_count")),
            pull("resources", "/system/resource", MetricSpec::field("cpu", "cpu-load")),
        ];
        let schemas = plan_label_schemas(&attributes);
        let wiring = handlers::wire(session.as_ref(), &attributes, &registry, &schemas);

        router.stall_queries("/interface", true);
        let timeout = Duration::from_secs(30);
        let started = tokio::time::Instant::now();
        poll_cycle(&wiring.pollers, timeout, &stats).await;

        assert!(started.elapsed() >= timeout);
        assert!(started.elapsed() < timeout * 2);
        assert_eq!(stats.polls("interfaces", false), 1);
        assert_eq!(stats.polls("resources", true), 1);
        assert!(registry.render().contains("p_cpu{name=\"resources\"} 3"));
    }
}
