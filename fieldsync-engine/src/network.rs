//! Network quality monitoring
//!
//! Classifies platform connectivity signals into online / slow / offline and
//! notifies observers only when the classification changes, not on every raw
//! sample. Platform specifics live behind the [`ConnectivityProbe`] trait so
//! the engine runs unchanged on browser, mobile, and desktop hosts; hosts
//! without a connection-quality API simply leave the quality fields unset and
//! the monitor degrades to binary online/offline detection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Connectivity classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    Online,
    Offline,
    Slow,
}

/// Current view of the network, derived purely from the latest probe sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkState {
    pub status: NetworkStatus,
    /// Platform connection classification (e.g. "4g", "slow-2g"), if exposed.
    pub effective_type: Option<String>,
    /// Estimated downlink bandwidth in Mbps, if exposed.
    pub downlink_mbps: Option<f64>,
    /// Estimated round-trip time, if exposed.
    pub rtt: Option<Duration>,
    /// Whether the user has requested reduced data usage.
    pub save_data: bool,
}

impl NetworkState {
    pub fn is_online(&self) -> bool {
        self.status != NetworkStatus::Offline
    }
}

impl Default for NetworkState {
    /// Assume connectivity until the first probe sample says otherwise, the
    /// same stance browsers take before any event has fired.
    fn default() -> Self {
        Self {
            status: NetworkStatus::Online,
            effective_type: None,
            downlink_mbps: None,
            rtt: None,
            save_data: false,
        }
    }
}

/// Raw connectivity signals reported by the host platform.
#[derive(Debug, Clone, Default)]
pub struct ProbeSample {
    pub connected: bool,
    pub effective_type: Option<String>,
    pub downlink_mbps: Option<f64>,
    pub rtt: Option<Duration>,
    pub save_data: bool,
}

impl ProbeSample {
    pub fn offline() -> Self {
        Self::default()
    }

    pub fn online() -> Self {
        Self {
            connected: true,
            ..Self::default()
        }
    }
}

/// Source of connectivity signals.
///
/// Implementations may wrap browser events, OS reachability APIs, or a
/// periodic ping; the monitor accepts either pushed samples or a polling
/// loop over a probe.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn sample(&self) -> ProbeSample;
}

const SLOW_RTT: Duration = Duration::from_millis(500);
const SLOW_DOWNLINK_MBPS: f64 = 0.5;

fn classify(sample: &ProbeSample) -> NetworkStatus {
    if !sample.connected {
        return NetworkStatus::Offline;
    }

    let slow_type = matches!(sample.effective_type.as_deref(), Some("slow-2g") | Some("2g"));
    let slow_rtt = sample.rtt.map(|rtt| rtt > SLOW_RTT).unwrap_or(false);
    let slow_downlink = sample
        .downlink_mbps
        .map(|mbps| mbps < SLOW_DOWNLINK_MBPS)
        .unwrap_or(false);

    if slow_type || slow_rtt || slow_downlink {
        NetworkStatus::Slow
    } else {
        NetworkStatus::Online
    }
}

/// Continuously-updated network state with change notifications.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<NetworkState>>,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkMonitor {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(NetworkState::default());
        Self { tx: Arc::new(tx) }
    }

    /// Feed a raw sample into the monitor (pushed mode).
    ///
    /// Quality fields are always updated, but observers are only woken when
    /// the computed classification actually changes.
    pub fn report_sample(&self, sample: ProbeSample) {
        let status = classify(&sample);
        self.tx.send_if_modified(|state| {
            let changed = state.status != status;
            *state = NetworkState {
                status,
                effective_type: sample.effective_type.clone(),
                downlink_mbps: sample.downlink_mbps,
                rtt: sample.rtt,
                save_data: sample.save_data,
            };
            if changed {
                tracing::info!(status = ?status, "network classification changed");
            }
            changed
        });
    }

    /// Drive the monitor from a probe on a fixed interval (polled mode).
    pub fn spawn_polling(
        &self,
        probe: Arc<dyn ConnectivityProbe>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let sample = probe.sample().await;
                monitor.report_sample(sample);
            }
        })
    }

    /// Latest computed state.
    pub fn current(&self) -> NetworkState {
        self.tx.borrow().clone()
    }

    pub fn is_online(&self) -> bool {
        self.current().is_online()
    }

    /// Watch for classification changes.
    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.tx.subscribe()
    }
}
