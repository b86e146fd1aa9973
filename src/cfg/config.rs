// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, net::Ipv4Addr, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::node::stream::StreamTimers;

/// Node configuration, loaded from YAML. Every section and field has a
/// default, so a partial (or missing) file is fine; the timer knobs
/// exist mostly so tests can shorten them.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    /// Identity and UDP binding of this node.
    #[serde(default)]
    pub node: NodeConfig,
    /// Routing table and lookup tuning.
    #[serde(default)]
    pub dht: DhtConfig,
    /// Reliable stream tuning.
    #[serde(default)]
    pub stream: StreamConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NodeConfig {
    #[serde(default = "defaults::bind_address", rename = "BindAddress")]
    /// IPv4 address the UDP socket binds to.
    pub bind_address: Ipv4Addr,

    #[serde(default = "defaults::port", rename = "Port")]
    /// UDP port; 0 picks an ephemeral port.
    pub port: u16,

    #[serde(default, rename = "IdentityFile")]
    /// Path of the PEM identity; created on first start when missing.
    pub identity_file: Option<String>,

    #[serde(default, rename = "Bootstrap")]
    /// `address:port` peers pinged at startup.
    pub bootstrap: Vec<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DhtConfig {
    #[serde(default = "defaults::candidate_limit", rename = "CandidateLimit")]
    /// Bound on the provisional-candidate list; a guard against bucket
    /// poisoning by unverified request senders.
    pub candidate_limit: usize,

    #[serde(default = "defaults::request_timeout", rename = "RequestTimeout",
            with = "serde_millis")]
    /// Deadline after which an unanswered request counts as lost.
    pub request_timeout: Duration,

    #[serde(default = "defaults::request_check_interval",
            rename = "RequestCheckInterval", with = "serde_millis")]
    /// How often the pending-request table is scanned.
    pub request_check_interval: Duration,

    #[serde(default = "defaults::node_refresh_interval",
            rename = "NodeRefreshInterval", with = "serde_millis")]
    /// How often buckets are refreshed.
    pub node_refresh_interval: Duration,

    #[serde(default = "defaults::ping_age", rename = "PingAge", with = "serde_millis")]
    /// Entries not heard from for this long are pinged on refresh.
    pub ping_age: Duration,

    #[serde(default = "defaults::evict_age", rename = "EvictAge", with = "serde_millis")]
    /// Entries not heard from for this long are evicted on refresh.
    pub evict_age: Duration,

    #[serde(default = "defaults::announcement_interval",
            rename = "AnnouncementInterval", with = "serde_millis")]
    /// How often announcement bookkeeping runs.
    pub announcement_interval: Duration,

    #[serde(default = "defaults::announcement_expiry",
            rename = "AnnouncementExpiry", with = "serde_millis")]
    /// Stored foreign announcements older than this are dropped.
    pub announcement_expiry: Duration,

    #[serde(default = "defaults::reannounce_age", rename = "ReannounceAge",
            with = "serde_millis")]
    /// Own data announced longer ago than this is re-announced.
    pub reannounce_age: Duration,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct StreamConfig {
    #[serde(default = "defaults::keepalive", rename = "Keepalive",
            with = "serde_millis")]
    /// Interval of the zero-length keepalive datagram.
    pub keepalive: Duration,

    #[serde(default = "defaults::retransmit_check", rename = "RetransmitCheck",
            with = "serde_millis")]
    /// Interval at which the oldest unacked segment is checked against
    /// the adaptive timeout.
    pub retransmit_check: Duration,

    #[serde(default = "defaults::idle_timeout", rename = "IdleTimeout",
            with = "serde_millis")]
    /// A stream with no inbound datagrams for this long is closed.
    pub idle_timeout: Duration,

    #[serde(default = "defaults::initial_rto", rename = "InitialRto",
            with = "serde_millis")]
    /// Retransmission timeout before any round trips were sampled.
    pub initial_rto: Duration,
}

mod defaults {
    use std::{net::Ipv4Addr, time::Duration};

    pub fn bind_address() -> Ipv4Addr {
        Ipv4Addr::UNSPECIFIED
    }
    pub fn port() -> u16 {
        7741
    }
    pub fn candidate_limit() -> usize {
        10
    }
    pub fn request_timeout() -> Duration {
        Duration::from_secs(2)
    }
    pub fn request_check_interval() -> Duration {
        Duration::from_millis(500)
    }
    pub fn node_refresh_interval() -> Duration {
        Duration::from_secs(60)
    }
    pub fn ping_age() -> Duration {
        Duration::from_secs(15 * 60)
    }
    pub fn evict_age() -> Duration {
        Duration::from_secs(20 * 60)
    }
    pub fn announcement_interval() -> Duration {
        Duration::from_secs(5 * 60)
    }
    pub fn announcement_expiry() -> Duration {
        Duration::from_secs(30 * 60)
    }
    pub fn reannounce_age() -> Duration {
        Duration::from_secs(20 * 60)
    }
    pub fn keepalive() -> Duration {
        Duration::from_secs(1)
    }
    pub fn retransmit_check() -> Duration {
        Duration::from_millis(100)
    }
    pub fn idle_timeout() -> Duration {
        Duration::from_secs(10)
    }
    pub fn initial_rto() -> Duration {
        Duration::from_millis(100)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            bind_address: defaults::bind_address(),
            port: defaults::port(),
            identity_file: None,
            bootstrap: Vec::new(),
        }
    }
}

impl Default for DhtConfig {
    fn default() -> Self {
        DhtConfig {
            candidate_limit: defaults::candidate_limit(),
            request_timeout: defaults::request_timeout(),
            request_check_interval: defaults::request_check_interval(),
            node_refresh_interval: defaults::node_refresh_interval(),
            ping_age: defaults::ping_age(),
            evict_age: defaults::evict_age(),
            announcement_interval: defaults::announcement_interval(),
            announcement_expiry: defaults::announcement_expiry(),
            reannounce_age: defaults::reannounce_age(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            keepalive: defaults::keepalive(),
            retransmit_check: defaults::retransmit_check(),
            idle_timeout: defaults::idle_timeout(),
            initial_rto: defaults::initial_rto(),
        }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants across sections.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.dht.candidate_limit >= 1, "CandidateLimit must be >= 1");
        ensure!(
            self.dht.evict_age > self.dht.ping_age,
            "EvictAge must exceed PingAge, or entries die before a refresh ping"
        );
        ensure!(
            self.dht.request_timeout >= self.dht.request_check_interval,
            "RequestTimeout must not undershoot RequestCheckInterval"
        );
        ensure!(
            self.stream.idle_timeout > self.stream.keepalive,
            "IdleTimeout must exceed Keepalive, or healthy streams die idle"
        );
        ensure!(
            self.dht.announcement_expiry > self.dht.reannounce_age,
            "AnnouncementExpiry must exceed ReannounceAge"
        );
        Ok(())
    }

    pub fn stream_timers(&self) -> StreamTimers {
        StreamTimers {
            keepalive: self.stream.keepalive,
            retransmit_check: self.stream.retransmit_check,
            idle_timeout: self.stream.idle_timeout,
            initial_rto: self.stream.initial_rto,
        }
    }
}

/// Serde helpers representing a `Duration` as integer milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
