//! Connectivity Observer - tracks whether the remote store is reachable
//!
//! Status flows over a `watch` channel:
//! - Subscribers see the current status first, then only distinct changes
//! - The first subscriber starts a polling task over the probe
//! - Dropping the last subscription aborts that task
//! - Platforms with OS callbacks push statuses through [`ConnectivityObserver::report`]

use super::error::SyncError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const PROBE_TIMEOUT_SECS: u64 = 3;

// ============================================================================
// Data Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Available,
    Unavailable,
}

impl ConnectionStatus {
    pub fn is_available(&self) -> bool {
        *self == Self::Available
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    Wifi,
    Cellular,
    Ethernet,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkQuality {
    Excellent,
    Good,
    Poor,
    NoConnection,
}

// ============================================================================
// Probes
// ============================================================================

/// One-shot reachability check
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn check(&self) -> ConnectionStatus;
}

/// Link-level details reported by the platform
///
/// Host-facing: the host decides whether a metered or poor link should hold
/// back large syncs. The observer only tracks reachability.
pub trait NetworkChecker: Send + Sync {
    fn is_connected(&self) -> bool;
    fn network_type(&self) -> NetworkType;
    fn is_metered(&self) -> bool;

    fn should_allow_sync(&self, allow_metered: bool) -> bool {
        self.is_connected() && (allow_metered || !self.is_metered())
    }

    fn quality(&self) -> NetworkQuality {
        if !self.is_connected() {
            return NetworkQuality::NoConnection;
        }

        match self.network_type() {
            NetworkType::Wifi | NetworkType::Ethernet => NetworkQuality::Excellent,
            NetworkType::Cellular if self.is_metered() => NetworkQuality::Good,
            NetworkType::Cellular => NetworkQuality::Excellent,
            NetworkType::None => NetworkQuality::NoConnection,
        }
    }
}

/// Probe that treats any HTTP response from `url` as reachable
pub struct HttpProbe {
    client: reqwest::Client,
    url: url::Url,
}

impl HttpProbe {
    pub fn new(url: &str) -> Result<Self, SyncError> {
        let url = url::Url::parse(url)
            .map_err(|e| SyncError::validation("connectivity_probe_url", e.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
            .build()
            .map_err(|e| SyncError::UnknownError(format!("HTTP client: {}", e)))?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn check(&self) -> ConnectionStatus {
        match self.client.head(self.url.clone()).send().await {
            Ok(_) => ConnectionStatus::Available,
            Err(e) => {
                log::debug!("Connectivity probe failed: {}", e);
                ConnectionStatus::Unavailable
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LinkState {
    connected: bool,
    network_type: NetworkType,
    metered: bool,
}

/// Host-driven network state
///
/// The embedding platform forwards its OS callbacks here.
#[derive(Debug)]
pub struct ManualNetwork {
    state: StdMutex<LinkState>,
}

impl ManualNetwork {
    pub fn new(connected: bool) -> Self {
        Self {
            state: StdMutex::new(LinkState {
                connected,
                network_type: if connected { NetworkType::Wifi } else { NetworkType::None },
                metered: false,
            }),
        }
    }

    fn state(&self) -> LinkState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).connected = connected;
    }

    pub fn set_network_type(&self, network_type: NetworkType) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).network_type = network_type;
    }

    pub fn set_metered(&self, metered: bool) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).metered = metered;
    }
}

impl NetworkChecker for ManualNetwork {
    fn is_connected(&self) -> bool {
        self.state().connected
    }

    fn network_type(&self) -> NetworkType {
        self.state().network_type
    }

    fn is_metered(&self) -> bool {
        self.state().metered
    }
}

#[async_trait]
impl ConnectivityProbe for ManualNetwork {
    async fn check(&self) -> ConnectionStatus {
        if self.is_connected() {
            ConnectionStatus::Available
        } else {
            ConnectionStatus::Unavailable
        }
    }
}

// ============================================================================
// Observer
// ============================================================================

#[derive(Default)]
struct Listener {
    subscribers: usize,
    task: Option<JoinHandle<()>>,
}

struct ObserverInner {
    probe: Arc<dyn ConnectivityProbe>,
    poll_interval: Duration,
    status_tx: watch::Sender<ConnectionStatus>,
    listener: StdMutex<Listener>,
}

impl ObserverInner {
    fn publish(&self, status: ConnectionStatus) -> bool {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });

        if changed {
            log::info!("Connectivity changed: {:?}", status);
        }
        changed
    }
}

/// Shared connectivity state with lazily started polling
#[derive(Clone)]
pub struct ConnectivityObserver {
    inner: Arc<ObserverInner>,
}

impl ConnectivityObserver {
    /// `poll_interval` of zero disables polling (push-only via `report`)
    pub fn new(
        probe: Arc<dyn ConnectivityProbe>,
        poll_interval: Duration,
        initial: ConnectionStatus,
    ) -> Self {
        let (status_tx, _) = watch::channel(initial);

        Self {
            inner: Arc::new(ObserverInner {
                probe,
                poll_interval,
                status_tx,
                listener: StdMutex::new(Listener::default()),
            }),
        }
    }

    /// Last known status
    pub fn current(&self) -> ConnectionStatus {
        *self.inner.status_tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current().is_available()
    }

    /// Push a status from the platform; returns whether it changed
    pub fn report(&self, status: ConnectionStatus) -> bool {
        self.inner.publish(status)
    }

    /// Probe once and publish the result
    pub async fn refresh(&self) -> ConnectionStatus {
        let status = self.inner.probe.check().await;
        self.inner.publish(status);
        status
    }

    /// Whether the polling task is running
    pub fn is_listening(&self) -> bool {
        self.inner
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .task
            .is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subscribers
    }

    /// Subscribe to distinct status changes
    pub fn subscribe(&self) -> ConnectivitySubscription {
        let status_rx = self.inner.status_tx.subscribe();
        let mut listener = self.inner.listener.lock().unwrap_or_else(|e| e.into_inner());
        listener.subscribers += 1;

        if listener.task.is_none() && !self.inner.poll_interval.is_zero() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let weak = Arc::downgrade(&self.inner);
                    listener.task = Some(handle.spawn(poll_loop(weak, self.inner.poll_interval)));
                    log::debug!(
                        "Connectivity listener started (every {:?})",
                        self.inner.poll_interval
                    );
                }
                Err(_) => log::warn!("No tokio runtime, connectivity polling disabled"),
            }
        }
        drop(listener);

        ConnectivitySubscription {
            status_rx,
            last: None,
            inner: self.inner.clone(),
        }
    }
}

async fn poll_loop(observer: Weak<ObserverInner>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let Some(inner) = observer.upgrade() else {
            break;
        };
        let status = inner.probe.check().await;
        inner.publish(status);
    }
}

/// Stream of distinct connectivity statuses
pub struct ConnectivitySubscription {
    status_rx: watch::Receiver<ConnectionStatus>,
    last: Option<ConnectionStatus>,
    inner: Arc<ObserverInner>,
}

impl ConnectivitySubscription {
    /// Current status on the first call, then the next distinct change
    pub async fn next(&mut self) -> Option<ConnectionStatus> {
        loop {
            if self.last.is_some() {
                self.status_rx.changed().await.ok()?;
            }

            let status = *self.status_rx.borrow_and_update();
            if self.last != Some(status) {
                self.last = Some(status);
                return Some(status);
            }
        }
    }
}

impl Drop for ConnectivitySubscription {
    fn drop(&mut self) {
        let mut listener = self.inner.listener.lock().unwrap_or_else(|e| e.into_inner());
        listener.subscribers = listener.subscribers.saturating_sub(1);

        if listener.subscribers == 0 {
            if let Some(task) = listener.task.take() {
                task.abort();
                log::debug!("Connectivity listener stopped");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn push_only(initial: ConnectionStatus) -> ConnectivityObserver {
        ConnectivityObserver::new(Arc::new(ManualNetwork::new(true)), Duration::ZERO, initial)
    }

    #[tokio::test]
    async fn test_first_value_is_current() {
        let observer = push_only(ConnectionStatus::Unavailable);
        let mut sub = observer.subscribe();

        assert_eq!(sub.next().await, Some(ConnectionStatus::Unavailable));
        assert!(!observer.is_online());
    }

    #[tokio::test]
    async fn test_report_deduplicates() {
        let observer = push_only(ConnectionStatus::Available);
        let mut sub = observer.subscribe();
        assert_eq!(sub.next().await, Some(ConnectionStatus::Available));

        assert!(!observer.report(ConnectionStatus::Available));
        assert!(observer.report(ConnectionStatus::Unavailable));
        assert!(!observer.report(ConnectionStatus::Unavailable));

        assert_eq!(sub.next().await, Some(ConnectionStatus::Unavailable));
        assert!(!observer.is_online());
    }

    #[tokio::test]
    async fn test_flapping_collapses_to_distinct_values() {
        let observer = push_only(ConnectionStatus::Available);
        let mut sub = observer.subscribe();
        assert_eq!(sub.next().await, Some(ConnectionStatus::Available));

        // Flap back before the subscriber looks
        observer.report(ConnectionStatus::Unavailable);
        observer.report(ConnectionStatus::Available);
        observer.report(ConnectionStatus::Unavailable);

        assert_eq!(sub.next().await, Some(ConnectionStatus::Unavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_follows_probe() {
        let network = Arc::new(ManualNetwork::new(true));
        let observer = ConnectivityObserver::new(
            network.clone(),
            Duration::from_secs(5),
            ConnectionStatus::Available,
        );

        let mut sub = observer.subscribe();
        assert!(observer.is_listening());
        assert_eq!(sub.next().await, Some(ConnectionStatus::Available));

        network.set_connected(false);
        assert_eq!(sub.next().await, Some(ConnectionStatus::Unavailable));

        network.set_connected(true);
        assert_eq!(sub.next().await, Some(ConnectionStatus::Available));
    }

    #[tokio::test]
    async fn test_last_subscriber_stops_listener() {
        let observer = ConnectivityObserver::new(
            Arc::new(ManualNetwork::new(true)),
            Duration::from_secs(60),
            ConnectionStatus::Available,
        );
        assert!(!observer.is_listening());

        let first = observer.subscribe();
        let second = observer.subscribe();
        assert_eq!(observer.subscriber_count(), 2);
        assert!(observer.is_listening());

        drop(first);
        assert!(observer.is_listening());

        drop(second);
        assert_eq!(observer.subscriber_count(), 0);
        assert!(!observer.is_listening());

        // A new subscriber starts it again
        let _third = observer.subscribe();
        assert!(observer.is_listening());
    }

    #[tokio::test]
    async fn test_refresh_publishes() {
        let network = Arc::new(ManualNetwork::new(false));
        let observer =
            ConnectivityObserver::new(network.clone(), Duration::ZERO, ConnectionStatus::Available);

        assert_eq!(observer.refresh().await, ConnectionStatus::Unavailable);
        assert!(!observer.is_online());

        network.set_connected(true);
        assert_eq!(observer.refresh().await, ConnectionStatus::Available);
    }

    #[test]
    fn test_network_checker() {
        let network = ManualNetwork::new(true);
        assert_eq!(network.quality(), NetworkQuality::Excellent);
        assert!(network.should_allow_sync(false));

        network.set_network_type(NetworkType::Cellular);
        network.set_metered(true);
        assert_eq!(network.quality(), NetworkQuality::Good);
        assert!(!network.should_allow_sync(false));
        assert!(network.should_allow_sync(true));

        network.set_connected(false);
        assert_eq!(network.quality(), NetworkQuality::NoConnection);
        assert!(!network.should_allow_sync(true));
    }

    #[tokio::test]
    async fn test_http_probe() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("HEAD", "/generate_204")
            .with_status(204)
            .create_async()
            .await;

        let probe = HttpProbe::new(&format!("{}/generate_204", server.url())).unwrap();
        assert_eq!(probe.check().await, ConnectionStatus::Available);

        // Nothing listens on the discard port
        let probe = HttpProbe::new("http://127.0.0.1:9/").unwrap();
        assert_eq!(probe.check().await, ConnectionStatus::Unavailable);
    }
}
