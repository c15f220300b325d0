//! Simulated RouterOS device.
//!
//! [`SimulatedRouter`] implements the device capability in-process. Menus hold
//! plain record lists, stream commands deliver batches through channels, and
//! faults can be injected at runtime: refused or stalled connections, dropped
//! sessions, failing or stalled queries and stream errors. It backs the exporter's demo mode and
//! the integration tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::device::{
    DeviceConnector, DeviceError, DeviceSession, EventStream, Menu, Query, Record, StreamBatch,
};

/// Buffered batches per subscription before deliveries are dropped.
const STREAM_BUFFER: usize = 64;

/// Interfaces present on the demo router.
const DEMO_INTERFACES: [&str; 4] = ["ether1", "ether2", "ether3", "wlan1"];

struct Subscription {
    session_id: u64,
    menu: String,
    command: String,
    query: Query,
    tx: mpsc::Sender<StreamBatch>,
}

struct LiveSession {
    id: u64,
    closed_tx: watch::Sender<Option<DeviceError>>,
}

#[derive(Default)]
struct RouterState {
    menus: HashMap<String, Vec<Record>>,
    failing_menus: HashSet<String>,
    stalled_menus: HashSet<String>,
    refuse_connects: u32,
    stall_connects: u32,
    connect_attempts: u64,
    sessions_opened: u64,
    queries: u64,
    live: Option<LiveSession>,
    subscriptions: Vec<Subscription>,
}

impl RouterState {
    fn is_live(&self, session_id: u64) -> bool {
        self.live.as_ref().is_some_and(|l| l.id == session_id)
    }

    fn end_session(&mut self, reason: Option<DeviceError>) {
        if let Some(live) = self.live.take() {
            // Receivers may already be gone; nothing to notify then.
            let _ = live.closed_tx.send(reason);
            self.subscriptions.retain(|s| s.session_id != live.id);
        }
    }
}

/// An in-process RouterOS device.
///
/// Cloning yields another handle on the same device.
#[derive(Clone)]
pub struct SimulatedRouter {
    name: String,
    state: Arc<Mutex<RouterState>>,
}

impl SimulatedRouter {
    /// Create an empty device with no menus.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(RouterState::default())),
        }
    }

    /// Create a device pre-populated with a small router's resources and interfaces.
    pub fn demo(name: impl Into<String>) -> Self {
        let router = Self::new(name);

        router.set_records(
            "/system/resource",
            vec![record(json!({
                "uptime": "1w2d3h4m5s",
                "cpu-load": "3",
                "free-memory": "201326592",
                "total-memory": "268435456",
                "free-hdd-space": "100663296",
                "version": "6.49.10 (long-term)",
                "board-name": "hEX",
            }))],
        );

        let interfaces = DEMO_INTERFACES
            .iter()
            .map(|name| {
                record(json!({
                    "name": name,
                    "type": interface_type(name),
                    "running": "true",
                    "rx-byte": "0",
                    "tx-byte": "0",
                    "rx-packet": "0",
                    "tx-packet": "0",
                }))
            })
            .collect();
        router.set_records("/interface", interfaces);

        router
    }

    /// Device name, as reported by the connector.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the records returned for a menu.
    pub fn set_records(&self, menu: impl Into<String>, records: Vec<Record>) {
        self.state.lock().menus.insert(menu.into(), records);
    }

    /// Current records of a menu.
    pub fn records(&self, menu: &str) -> Vec<Record> {
        self.state.lock().menus.get(menu).cloned().unwrap_or_default()
    }

    /// Make every query on `menu` fail (or succeed again).
    pub fn fail_queries(&self, menu: impl Into<String>, failing: bool) {
        let mut state = self.state.lock();
        let menu = menu.into();
        if failing {
            state.failing_menus.insert(menu);
        } else {
            state.failing_menus.remove(&menu);
        }
    }

    /// Make every query on `menu` hang without an answer (or answer again).
    pub fn stall_queries(&self, menu: impl Into<String>, stalled: bool) {
        let mut state = self.state.lock();
        let menu = menu.into();
        if stalled {
            state.stalled_menus.insert(menu);
        } else {
            state.stalled_menus.remove(&menu);
        }
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_connections(&self, count: u32) {
        self.state.lock().refuse_connects = count;
    }

    /// Leave the next `count` connection attempts unanswered.
    pub fn stall_connections(&self, count: u32) {
        self.state.lock().stall_connects = count;
    }

    /// Drop the live session as if the device went away.
    ///
    /// Returns `false` when no session was open.
    pub fn drop_session(&self, reason: impl Into<String>) -> bool {
        let mut state = self.state.lock();
        if state.live.is_none() {
            return false;
        }
        state.end_session(Some(DeviceError::SessionClosed(reason.into())));
        true
    }

    /// Deliver a batch to every subscriber of `command` on `menu`.
    ///
    /// Each subscriber only receives the records passing its filter; a
    /// subscriber whose filter leaves nothing gets no delivery. Returns the
    /// number of deliveries.
    pub fn push_event(&self, menu: &str, command: &str, records: Vec<Record>) -> usize {
        let mut state = self.state.lock();
        let live_id = state.live.as_ref().map(|l| l.id);
        let mut delivered = 0;

        state.subscriptions.retain(|sub| {
            if Some(sub.session_id) != live_id || sub.menu != menu || sub.command != command {
                return true;
            }
            let batch: Vec<Record> = records
                .iter()
                .filter(|r| sub.query.matches(r))
                .cloned()
                .collect();
            if batch.is_empty() {
                return true;
            }
            match sub.tx.try_send(Ok(batch)) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(menu, command, "Subscriber lagging, batch dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        delivered
    }

    /// Deliver an error to every subscriber of `command` on `menu`.
    pub fn push_stream_error(&self, menu: &str, command: &str, message: &str) -> usize {
        let mut state = self.state.lock();
        let live_id = state.live.as_ref().map(|l| l.id);
        let mut delivered = 0;

        state.subscriptions.retain(|sub| {
            if Some(sub.session_id) != live_id || sub.menu != menu || sub.command != command {
                return true;
            }
            let err = DeviceError::stream(menu, command, message);
            if sub.tx.try_send(Err(err)).is_ok() {
                delivered += 1;
            }
            !sub.tx.is_closed()
        });

        delivered
    }

    /// Number of connection attempts, refused ones included.
    pub fn connect_attempts(&self) -> u64 {
        self.state.lock().connect_attempts
    }

    /// Number of sessions successfully opened.
    pub fn sessions_opened(&self) -> u64 {
        self.state.lock().sessions_opened
    }

    /// Whether a session is currently open.
    pub fn is_connected(&self) -> bool {
        self.state.lock().live.is_some()
    }

    /// Active subscriptions on the live session.
    pub fn subscription_count(&self) -> usize {
        let state = self.state.lock();
        let live_id = state.live.as_ref().map(|l| l.id);
        state
            .subscriptions
            .iter()
            .filter(|s| Some(s.session_id) == live_id && !s.tx.is_closed())
            .count()
    }

    /// Number of one-shot queries served, failed ones included.
    pub fn query_count(&self) -> u64 {
        self.state.lock().queries
    }

    /// Drive the demo menus: advance uptime and counters, vary CPU load, and
    /// push `monitor-traffic` batches for every interface.
    pub fn spawn_demo_traffic(&self, period: Duration) -> JoinHandle<()> {
        let router = self.clone();

        tokio::spawn(async move {
            let mut rng = SmallRng::from_os_rng();
            let mut ticker = tokio::time::interval(period);
            let mut uptime_secs: u64 = 788_645;
            let mut counters: HashMap<&str, (u64, u64)> = HashMap::new();

            loop {
                ticker.tick().await;
                uptime_secs += period.as_secs().max(1);

                router.set_records(
                    "/system/resource",
                    vec![record(json!({
                        "uptime": format_uptime(uptime_secs),
                        "cpu-load": rng.random_range(1..40).to_string(),
                        "free-memory": rng.random_range(180_000_000u64..210_000_000).to_string(),
                        "total-memory": "268435456",
                        "free-hdd-space": "100663296",
                        "version": "6.49.10 (long-term)",
                        "board-name": "hEX",
                    }))],
                );

                let mut interfaces = Vec::with_capacity(DEMO_INTERFACES.len());
                for name in DEMO_INTERFACES {
                    let rx_rate: u64 = rng.random_range(10_000..50_000_000);
                    let tx_rate: u64 = rng.random_range(10_000..20_000_000);
                    let entry = counters.entry(name).or_insert((0, 0));
                    entry.0 += rx_rate / 8 * period.as_secs().max(1);
                    entry.1 += tx_rate / 8 * period.as_secs().max(1);

                    interfaces.push(record(json!({
                        "name": name,
                        "type": interface_type(name),
                        "running": "true",
                        "rx-byte": entry.0.to_string(),
                        "tx-byte": entry.1.to_string(),
                        "rx-packet": (entry.0 / 1200).to_string(),
                        "tx-packet": (entry.1 / 1200).to_string(),
                    })));

                    router.push_event(
                        "/interface",
                        "monitor-traffic",
                        vec![record(json!({
                            "name": name,
                            "rx-bits-per-second": rx_rate.to_string(),
                            "tx-bits-per-second": tx_rate.to_string(),
                        }))],
                    );
                }
                router.set_records("/interface", interfaces);
            }
        })
    }
}

#[async_trait]
impl DeviceConnector for SimulatedRouter {
    fn target(&self) -> String {
        format!("simulated:{}", self.name)
    }

    async fn connect(&self) -> Result<Arc<dyn DeviceSession>, DeviceError> {
        let stalled = {
            let mut state = self.state.lock();
            state.connect_attempts += 1;
            let stalled = state.stall_connects > 0;
            if stalled {
                state.stall_connects -= 1;
            }
            stalled
        };
        if stalled {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock();
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(DeviceError::Connection(format!(
                "{}: connection refused",
                self.name
            )));
        }

        // One session at a time, like a single API login.
        state.end_session(Some(DeviceError::SessionClosed(
            "replaced by a new session".to_string(),
        )));

        state.sessions_opened += 1;
        let id = state.sessions_opened;
        let (closed_tx, closed_rx) = watch::channel(None);
        state.live = Some(LiveSession { id, closed_tx });

        Ok(Arc::new(SimulatedSession {
            router: self.clone(),
            id,
            closed_rx,
        }))
    }
}

struct SimulatedSession {
    router: SimulatedRouter,
    id: u64,
    closed_rx: watch::Receiver<Option<DeviceError>>,
}

#[async_trait]
impl DeviceSession for SimulatedSession {
    fn menu(&self, path: &str) -> Arc<dyn Menu> {
        Arc::new(SimulatedMenu {
            router: self.router.clone(),
            session_id: self.id,
            path: path.to_string(),
        })
    }

    async fn closed(&self) -> DeviceError {
        let mut rx = self.closed_rx.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(err) = current {
                return err;
            }
            if rx.changed().await.is_err() {
                return DeviceError::SessionClosed("session dropped".to_string());
            }
        }
    }

    async fn close(&self) {
        let mut state = self.router.state.lock();
        if state.is_live(self.id) {
            state.end_session(None);
        }
    }
}

struct SimulatedMenu {
    router: SimulatedRouter,
    session_id: u64,
    path: String,
}

impl SimulatedMenu {
    async fn answer(&self, query: &Query) -> Result<Vec<Record>, DeviceError> {
        let stalled = self.router.state.lock().stalled_menus.contains(&self.path);
        if stalled {
            std::future::pending::<()>().await;
        }
        self.query(query)
    }

    fn query(&self, query: &Query) -> Result<Vec<Record>, DeviceError> {
        let mut state = self.router.state.lock();
        if !state.is_live(self.session_id) {
            return Err(DeviceError::SessionClosed(
                "session is no longer active".to_string(),
            ));
        }
        state.queries += 1;

        if state.failing_menus.contains(&self.path) {
            return Err(DeviceError::query(&self.path, "simulated failure"));
        }

        let records = state
            .menus
            .get(&self.path)
            .ok_or_else(|| DeviceError::query(&self.path, "no such command prefix"))?;

        Ok(records
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl Menu for SimulatedMenu {
    fn path(&self) -> &str {
        &self.path
    }

    async fn get(&self, query: &Query) -> Result<Vec<Record>, DeviceError> {
        self.answer(query).await
    }

    async fn get_one(&self, query: &Query) -> Result<Record, DeviceError> {
        self.answer(query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DeviceError::query(&self.path, "no such item"))
    }

    async fn stream(&self, command: &str, query: &Query) -> Result<EventStream, DeviceError> {
        let mut state = self.router.state.lock();
        if !state.is_live(self.session_id) {
            return Err(DeviceError::SessionClosed(
                "session is no longer active".to_string(),
            ));
        }
        if !state.menus.contains_key(&self.path) {
            return Err(DeviceError::stream(
                &self.path,
                command,
                "no such command prefix",
            ));
        }

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        state.subscriptions.push(Subscription {
            session_id: self.session_id,
            menu: self.path.clone(),
            command: command.to_string(),
            query: query.clone(),
            tx,
        });

        Ok(rx)
    }
}

fn interface_type(name: &str) -> &'static str {
    if name.starts_with("wlan") {
        "wlan"
    } else {
        "ether"
    }
}

/// Build a record from a JSON object literal.
///
/// Non-object values yield an empty record.
pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}

/// Format seconds the way RouterOS prints uptime, e.g. `1w2d3h4m5s`.
pub fn format_uptime(total_secs: u64) -> String {
    let units = [(604_800, 'w'), (86_400, 'd'), (3_600, 'h'), (60, 'm')];
    let mut rest = total_secs;
    let mut out = String::new();

    for (size, unit) in units {
        let count = rest / size;
        rest %= size;
        if count > 0 || !out.is_empty() {
            out.push_str(&format!("{}{}", count, unit));
        }
    }
    out.push_str(&format!("{}s", rest));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_query() {
        let router = SimulatedRouter::demo("r1");
        let session = router.connect().await.unwrap();

        let interfaces = session.menu("/interface").get(&Query::new()).await.unwrap();
        assert_eq!(interfaces.len(), DEMO_INTERFACES.len());

        let resource = session
            .menu("/system/resource")
            .get_one(&Query::new())
            .await
            .unwrap();
        assert_eq!(resource.get("board-name"), Some(&json!("hEX")));
        assert_eq!(router.query_count(), 2);
    }

    #[tokio::test]
    async fn test_query_filter() {
        let router = SimulatedRouter::demo("r1");
        let session = router.connect().await.unwrap();

        let query = Query::new().with_filter("name", "ether2");
        let records = session.menu("/interface").get(&query).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("name"), Some(&json!("ether2")));
    }

    #[tokio::test]
    async fn test_unknown_menu_fails() {
        let router = SimulatedRouter::new("r1");
        let session = router.connect().await.unwrap();

        let result = session.menu("/ip/route").get(&Query::new()).await;
        assert!(matches!(result, Err(DeviceError::Query { .. })));
    }

    #[tokio::test]
    async fn test_refused_connections() {
        let router = SimulatedRouter::new("r1");
        router.refuse_connections(2);

        assert!(router.connect().await.is_err());
        assert!(router.connect().await.is_err());
        assert!(router.connect().await.is_ok());
        assert_eq!(router.connect_attempts(), 3);
        assert_eq!(router.sessions_opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_connections_and_queries() {
        let router = SimulatedRouter::demo("r1");
        router.stall_connections(1);

        let wait = Duration::from_secs(60);
        assert!(tokio::time::timeout(wait, router.connect()).await.is_err());
        let session = router.connect().await.unwrap();
        assert_eq!(router.connect_attempts(), 2);

        router.stall_queries("/interface", true);
        let menu = session.menu("/interface");
        assert!(tokio::time::timeout(wait, menu.get(&Query::new())).await.is_err());
        assert!(session.menu("/system/resource").get_one(&Query::new()).await.is_ok());

        router.stall_queries("/interface", false);
        assert!(menu.get(&Query::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_failing_queries() {
        let router = SimulatedRouter::demo("r1");
        let session = router.connect().await.unwrap();
        router.fail_queries("/interface", true);

        let menu = session.menu("/interface");
        assert!(menu.get(&Query::new()).await.is_err());

        router.fail_queries("/interface", false);
        assert!(menu.get(&Query::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_session_resolves_closed() {
        let router = SimulatedRouter::demo("r1");
        let session = router.connect().await.unwrap();

        assert!(router.drop_session("link down"));
        let err = session.closed().await;
        assert_eq!(err, DeviceError::SessionClosed("link down".to_string()));

        let result = session.menu("/interface").get(&Query::new()).await;
        assert!(matches!(result, Err(DeviceError::SessionClosed(_))));
        assert!(!router.drop_session("again"));
    }

    #[tokio::test]
    async fn test_stream_delivery_and_filter() {
        let router = SimulatedRouter::demo("r1");
        let session = router.connect().await.unwrap();

        let query = Query::new().with_filter("name", "ether1");
        let mut stream = session
            .menu("/interface")
            .stream("monitor-traffic", &query)
            .await
            .unwrap();
        assert_eq!(router.subscription_count(), 1);

        let delivered = router.push_event(
            "/interface",
            "monitor-traffic",
            vec![
                record(json!({"name": "ether2", "rx-bits-per-second": "5"})),
                record(json!({"name": "ether1", "rx-bits-per-second": "7"})),
            ],
        );
        assert_eq!(delivered, 1);

        let batch = stream.recv().await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].get("rx-bits-per-second"), Some(&json!("7")));

        // Filter leaves nothing: no delivery
        let delivered = router.push_event(
            "/interface",
            "monitor-traffic",
            vec![record(json!({"name": "ether3"}))],
        );
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_stream_ends_on_drop() {
        let router = SimulatedRouter::demo("r1");
        let session = router.connect().await.unwrap();
        let mut stream = session
            .menu("/interface")
            .stream("monitor-traffic", &Query::new())
            .await
            .unwrap();

        router.drop_session("reboot");
        assert!(stream.recv().await.is_none());
        assert_eq!(router.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_error_delivery() {
        let router = SimulatedRouter::demo("r1");
        let session = router.connect().await.unwrap();
        let mut stream = session
            .menu("/interface")
            .stream("monitor-traffic", &Query::new())
            .await
            .unwrap();

        assert_eq!(
            router.push_stream_error("/interface", "monitor-traffic", "interrupted"),
            1
        );
        let delivered = stream.recv().await.unwrap();
        assert!(matches!(delivered, Err(DeviceError::Stream { .. })));
    }

    #[tokio::test]
    async fn test_new_session_replaces_old() {
        let router = SimulatedRouter::demo("r1");
        let first = router.connect().await.unwrap();
        let _second = router.connect().await.unwrap();

        let err = first.closed().await;
        assert!(matches!(err, DeviceError::SessionClosed(_)));
        assert!(router.is_connected());
    }

    #[tokio::test]
    async fn test_client_close() {
        let router = SimulatedRouter::demo("r1");
        let session = router.connect().await.unwrap();
        session.close().await;
        assert!(!router.is_connected());
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(45), "45s");
        assert_eq!(format_uptime(3600), "1h0m0s");
        assert_eq!(
            format_uptime(2 * 604_800 + 3 * 86_400 + 4 * 3600 + 5 * 60 + 6),
            "2w3d4h5m6s"
        );
    }
}
