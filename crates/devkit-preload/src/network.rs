//! Network quality capability and the prefetch gate

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Effective connection type as reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EffectiveType {
    /// Slow 2G
    #[serde(rename = "slow-2g")]
    Slow2g,
    /// 2G
    #[serde(rename = "2g")]
    TwoG,
    /// 3G
    #[serde(rename = "3g")]
    ThreeG,
    /// 4G or better
    #[serde(rename = "4g")]
    FourG,
}

/// Snapshot of connection quality. `None` fields are unknown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Effective connection type
    pub effective_type: Option<EffectiveType>,
    /// Data-saver mode requested by the user
    #[serde(default)]
    pub save_data: bool,
    /// Estimated round-trip time (ms)
    pub rtt_ms: Option<u32>,
    /// Estimated downlink (Mbps)
    pub downlink_mbps: Option<f64>,
}

impl ConnectionInfo {
    /// Connection with every field unknown
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Set effective type
    pub fn with_effective_type(mut self, effective_type: EffectiveType) -> Self {
        self.effective_type = Some(effective_type);
        self
    }

    /// Set round-trip time
    pub fn with_rtt_ms(mut self, rtt_ms: u32) -> Self {
        self.rtt_ms = Some(rtt_ms);
        self
    }

    /// Set downlink
    pub fn with_downlink_mbps(mut self, downlink_mbps: f64) -> Self {
        self.downlink_mbps = Some(downlink_mbps);
        self
    }

    /// Set data-saver flag
    pub fn with_save_data(mut self, save_data: bool) -> Self {
        self.save_data = save_data;
        self
    }
}

/// Thresholds a connection must meet before background prefetching
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkPolicy {
    /// Round-trip time must be strictly below this (ms)
    #[serde(default = "default_max_rtt_ms")]
    pub max_rtt_ms: u32,
    /// Downlink must be at least this (Mbps)
    #[serde(default = "default_min_downlink_mbps")]
    pub min_downlink_mbps: f64,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self {
            max_rtt_ms: default_max_rtt_ms(),
            min_downlink_mbps: default_min_downlink_mbps(),
        }
    }
}

fn default_max_rtt_ms() -> u32 {
    250
}

fn default_min_downlink_mbps() -> f64 {
    1.5
}

impl NetworkPolicy {
    /// Whether the connection is good enough to prefetch on
    ///
    /// Unknown measurements pass; data-saver always fails.
    pub fn allows(&self, info: &ConnectionInfo) -> bool {
        if info.save_data {
            return false;
        }

        let type_ok = matches!(info.effective_type, None | Some(EffectiveType::FourG));
        let rtt_ok = info.rtt_ms.map_or(true, |rtt| rtt < self.max_rtt_ms);
        let downlink_ok = info
            .downlink_mbps
            .map_or(true, |downlink| downlink >= self.min_downlink_mbps);

        type_ok && rtt_ok && downlink_ok
    }
}

/// Source of connection quality
pub trait NetworkInfo: Send + Sync {
    /// Current connection snapshot
    fn current(&self) -> ConnectionInfo;

    /// Change notifications, if the host provides them
    fn subscribe(&self) -> Option<watch::Receiver<ConnectionInfo>> {
        None
    }
}

/// Host without network information; always passes the gate
#[derive(Debug, Clone, Copy, Default)]
pub struct UnknownNetwork;

impl NetworkInfo for UnknownNetwork {
    fn current(&self) -> ConnectionInfo {
        ConnectionInfo::unknown()
    }
}

/// Host-updated connection info with change notification
#[derive(Debug)]
pub struct WatchedNetwork {
    tx: watch::Sender<ConnectionInfo>,
}

impl WatchedNetwork {
    /// Create with an initial snapshot
    pub fn new(initial: ConnectionInfo) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Publish a new snapshot
    pub fn update(&self, info: ConnectionInfo) {
        self.tx.send_replace(info);
    }
}

impl Default for WatchedNetwork {
    fn default() -> Self {
        Self::new(ConnectionInfo::unknown())
    }
}

impl NetworkInfo for WatchedNetwork {
    fn current(&self) -> ConnectionInfo {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> Option<watch::Receiver<ConnectionInfo>> {
        Some(self.tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_connection_passes() {
        let policy = NetworkPolicy::default();
        assert!(policy.allows(&ConnectionInfo::unknown()));
        assert!(policy.allows(&UnknownNetwork.current()));
    }

    #[test]
    fn test_fast_connection_passes() {
        let policy = NetworkPolicy::default();
        let info = ConnectionInfo::unknown()
            .with_effective_type(EffectiveType::FourG)
            .with_rtt_ms(100)
            .with_downlink_mbps(10.0);
        assert!(policy.allows(&info));
    }

    #[test]
    fn test_gate_failures() {
        let policy = NetworkPolicy::default();

        let slow_type = ConnectionInfo::unknown().with_effective_type(EffectiveType::ThreeG);
        assert!(!policy.allows(&slow_type));

        // The rtt bound is exclusive
        let high_rtt = ConnectionInfo::unknown().with_rtt_ms(250);
        assert!(!policy.allows(&high_rtt));

        let low_downlink = ConnectionInfo::unknown().with_downlink_mbps(1.2);
        assert!(!policy.allows(&low_downlink));

        // The downlink bound is inclusive
        let exact_downlink = ConnectionInfo::unknown().with_downlink_mbps(1.5);
        assert!(policy.allows(&exact_downlink));

        let save_data = ConnectionInfo::unknown().with_save_data(true);
        assert!(!policy.allows(&save_data));
    }

    #[tokio::test]
    async fn test_watched_network_notifies() {
        let network = WatchedNetwork::default();
        let mut rx = network.subscribe().unwrap();

        network.update(ConnectionInfo::unknown().with_save_data(true));

        rx.changed().await.unwrap();
        assert!(rx.borrow().save_data);
        assert!(network.current().save_data);
    }

    #[test]
    fn test_effective_type_serde() {
        let info: ConnectionInfo =
            serde_json::from_str(r#"{"effective_type":"slow-2g","rtt_ms":900,"downlink_mbps":0.1}"#)
                .unwrap();
        assert_eq!(info.effective_type, Some(EffectiveType::Slow2g));
        assert!(!info.save_data);
    }
}
