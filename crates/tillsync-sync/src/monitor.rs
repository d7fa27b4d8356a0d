//! # Network Monitor
//!
//! Tracks link state and answers whether the sync authority can actually be
//! reached.
//!
//! ## Link vs Reachability
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  LINK (cheap, sampled every link_poll_interval)                        │
//! │  ─────────────────────────────────────────────                         │
//! │  LinkProbe::link_up() → report_link(bool)                              │
//! │       │                                                                 │
//! │       ├── transition → NetworkEvent::LinkChanged { link_up, previous } │
//! │       └── false→true → NetworkEvent::ConnectivityRestored              │
//! │                             │                                           │
//! │                             ▼                                           │
//! │                     SyncOrchestrator trigger                            │
//! │                                                                         │
//! │  REACHABILITY (on demand, bounded by a timeout)                        │
//! │  ──────────────────────────────────────────────                        │
//! │  test_reachability(timeout)                                            │
//! │       link down ──────────────────────────► { reachable: false }       │
//! │       link up   ── probe all endpoints concurrently                    │
//! │                    (authority health path + external endpoints)        │
//! │                    first success ─────────► { reachable, via }         │
//! │                    all fail / timeout ────► { reachable: false }       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! An interface being up says nothing about a route to the authority, so the
//! orchestrator always asks for reachability before a run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::{select_ok, BoxFuture};
use futures_util::FutureExt;
use reqwest::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::SyncResult;

/// Capacity of the network event channel.
const EVENT_CHANNEL_CAPACITY: usize = 32;

// =============================================================================
// State & Events
// =============================================================================

/// Last sampled link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkState {
    pub link_up: bool,
    pub last_checked_at: DateTime<Utc>,
}

/// Emitted on every link transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    LinkChanged { link_up: bool, previous_link_up: bool },
    /// The link went from down to up.
    ConnectivityRestored,
}

/// Result of a reachability test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reachability {
    pub reachable: bool,
    /// The endpoint that answered first.
    pub via_endpoint: Option<String>,
}

impl Reachability {
    pub fn unreachable() -> Self {
        Reachability {
            reachable: false,
            via_endpoint: None,
        }
    }
}

// =============================================================================
// Probes
// =============================================================================

/// Checks a single endpoint.
#[async_trait]
pub trait Prober: Send + Sync {
    /// True if `endpoint` answered at all.
    async fn probe(&self, endpoint: &str) -> bool;
}

/// Samples the local link.
#[async_trait]
pub trait LinkProbe: Send + Sync {
    async fn link_up(&self) -> bool;
}

/// HTTP reachability probe. Any response below 500 counts: a 401 or 404
/// still proves there is a route.
#[derive(Debug, Clone)]
pub struct HttpProber {
    client: Client,
}

impl HttpProber {
    pub fn new() -> Self {
        HttpProber {
            client: Client::new(),
        }
    }
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, endpoint: &str) -> bool {
        match self.client.head(endpoint).send().await {
            Ok(response) => !response.status().is_server_error(),
            Err(e) => {
                debug!(endpoint, error = %e, "Probe failed");
                false
            }
        }
    }
}

/// Link probe that asks the OS for a route: connecting a UDP socket sends
/// nothing but fails when no interface can reach `target`.
#[derive(Debug, Clone)]
pub struct UdpRouteProbe {
    target: SocketAddr,
}

impl UdpRouteProbe {
    pub fn new(target: SocketAddr) -> Self {
        UdpRouteProbe { target }
    }
}

impl Default for UdpRouteProbe {
    fn default() -> Self {
        UdpRouteProbe::new(SocketAddr::from(([1, 1, 1, 1], 53)))
    }
}

#[async_trait]
impl LinkProbe for UdpRouteProbe {
    async fn link_up(&self) -> bool {
        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(_) => return false,
        };
        socket.connect(self.target).await.is_ok()
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// Link state holder, event source and reachability tester.
pub struct NetworkMonitor {
    state: watch::Sender<LinkState>,
    events: broadcast::Sender<NetworkEvent>,
    prober: Arc<dyn Prober>,
    endpoints: Vec<String>,
}

impl NetworkMonitor {
    /// Creates a monitor probing `endpoints` through `prober`.
    ///
    /// ## Arguments
    /// * `endpoints` - Authority health URL first, then external endpoints
    /// * `initial_link_up` - Link state assumed until the first sample
    pub fn new(prober: Arc<dyn Prober>, endpoints: Vec<String>, initial_link_up: bool) -> Self {
        let (state, _) = watch::channel(LinkState {
            link_up: initial_link_up,
            last_checked_at: Utc::now(),
        });
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        NetworkMonitor {
            state,
            events,
            prober,
            endpoints,
        }
    }

    /// Builds an HTTP-probing monitor from the configuration. The link starts
    /// down, so the first successful sample emits `ConnectivityRestored`.
    pub fn from_config(config: &SyncConfig) -> SyncResult<Self> {
        let mut endpoints = vec![config.authority.health_url()?.to_string()];
        endpoints.extend(config.network.probe_endpoints.iter().cloned());

        Ok(Self::new(Arc::new(HttpProber::new()), endpoints, false))
    }

    pub fn current_state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn is_link_up(&self) -> bool {
        self.state.borrow().link_up
    }

    /// Subscribes to link transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    /// Watches the latest link state.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Records a link sample and emits events on a transition.
    pub fn report_link(&self, link_up: bool) {
        let previous = self.state.send_replace(LinkState {
            link_up,
            last_checked_at: Utc::now(),
        });

        if previous.link_up == link_up {
            return;
        }

        info!(link_up, previous_link_up = previous.link_up, "Link state changed");
        let _ = self.events.send(NetworkEvent::LinkChanged {
            link_up,
            previous_link_up: previous.link_up,
        });
        if link_up {
            let _ = self.events.send(NetworkEvent::ConnectivityRestored);
        }
    }

    /// Probes every endpoint concurrently and reports the first that answers.
    ///
    /// Never errors: a timeout or a down link is simply "unreachable".
    pub async fn test_reachability(&self, timeout: Duration) -> Reachability {
        if !self.is_link_up() {
            debug!("Link down, skipping reachability probes");
            return Reachability::unreachable();
        }
        if self.endpoints.is_empty() {
            warn!("No reachability endpoints configured");
            return Reachability::unreachable();
        }

        let probes: Vec<BoxFuture<'static, Result<String, ()>>> = self
            .endpoints
            .iter()
            .map(|endpoint| {
                let prober = Arc::clone(&self.prober);
                let endpoint = endpoint.clone();
                async move {
                    if prober.probe(&endpoint).await {
                        Ok(endpoint)
                    } else {
                        Err(())
                    }
                }
                .boxed()
            })
            .collect();

        match tokio::time::timeout(timeout, select_ok(probes)).await {
            Ok(Ok((endpoint, _))) => {
                debug!(via = %endpoint, "Reachable");
                Reachability {
                    reachable: true,
                    via_endpoint: Some(endpoint),
                }
            }
            Ok(Err(())) => {
                warn!("No reachability endpoint answered");
                Reachability::unreachable()
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "Reachability test timed out");
                Reachability::unreachable()
            }
        }
    }

    /// Samples `probe` every `every` and feeds [`NetworkMonitor::report_link`].
    ///
    /// The first sample is taken immediately. Abort the handle to stop.
    pub fn spawn_link_watcher(
        self: &Arc<Self>,
        probe: Arc<dyn LinkProbe>,
        every: Duration,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let up = probe.link_up().await;
                monitor.report_link(up);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Answers from a fixed table, optionally after a delay.
    struct TableProber {
        answers: HashMap<String, bool>,
        delay: Duration,
    }

    #[async_trait]
    impl Prober for TableProber {
        async fn probe(&self, endpoint: &str) -> bool {
            tokio::time::sleep(self.delay).await;
            self.answers.get(endpoint).copied().unwrap_or(false)
        }
    }

    fn monitor(answers: &[(&str, bool)], delay: Duration, link_up: bool) -> NetworkMonitor {
        let prober = TableProber {
            answers: answers.iter().map(|(e, ok)| (e.to_string(), *ok)).collect(),
            delay,
        };
        let endpoints = answers.iter().map(|(e, _)| e.to_string()).collect();
        NetworkMonitor::new(Arc::new(prober), endpoints, link_up)
    }

    #[tokio::test]
    async fn test_transition_emits_restored() {
        let monitor = monitor(&[], Duration::ZERO, false);
        let mut events = monitor.subscribe();

        monitor.report_link(false);
        monitor.report_link(true);
        monitor.report_link(true);

        assert_eq!(
            events.recv().await.unwrap(),
            NetworkEvent::LinkChanged {
                link_up: true,
                previous_link_up: false
            }
        );
        assert_eq!(events.recv().await.unwrap(), NetworkEvent::ConnectivityRestored);
        assert!(events.try_recv().is_err());
        assert!(monitor.current_state().link_up);
    }

    #[tokio::test]
    async fn test_link_down_means_unreachable() {
        let monitor = monitor(&[("http://authority/health", true)], Duration::ZERO, false);
        let result = monitor.test_reachability(Duration::from_secs(1)).await;
        assert!(!result.reachable);
    }

    #[tokio::test]
    async fn test_any_answering_endpoint_is_enough() {
        let monitor = monitor(
            &[("http://authority/health", false), ("http://probe/204", true)],
            Duration::ZERO,
            true,
        );
        let result = monitor.test_reachability(Duration::from_secs(1)).await;
        assert!(result.reachable);
        assert_eq!(result.via_endpoint.as_deref(), Some("http://probe/204"));
    }

    #[tokio::test]
    async fn test_all_failing_is_unreachable() {
        let monitor = monitor(&[("http://authority/health", false)], Duration::ZERO, true);
        assert!(!monitor.test_reachability(Duration::from_secs(1)).await.reachable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probes_time_out() {
        let monitor = monitor(&[("http://authority/health", true)], Duration::from_secs(30), true);
        let result = monitor.test_reachability(Duration::from_secs(10)).await;
        assert_eq!(result, Reachability::unreachable());
    }

    struct FixedLink(bool);

    #[async_trait]
    impl LinkProbe for FixedLink {
        async fn link_up(&self) -> bool {
            self.0
        }
    }

    #[tokio::test]
    async fn test_watcher_reports_samples() {
        let monitor = Arc::new(monitor(&[], Duration::ZERO, false));
        let mut events = monitor.subscribe();

        let watcher = monitor.spawn_link_watcher(Arc::new(FixedLink(true)), Duration::from_secs(60));
        let first = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        watcher.abort();

        assert!(matches!(first, NetworkEvent::LinkChanged { link_up: true, .. }));
        assert!(monitor.is_link_up());
    }
}
