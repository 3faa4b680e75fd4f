//! Java Discovery Protocol listener.
//!
//! JVMs started with `-Dcom.sun.management.jmxremote.autodiscovery=true`
//! multicast a small announcement every `BROADCAST_INTERVAL` milliseconds.
//! Packet layout (all integers big-endian):
//!
//! ```text
//! u32 magic (0xC0FFEE42) | u16 version (1) | { u16 len, key, u16 len, value }*
//! ```
//!
//! JVMs live in the JDP realm directly, with no ownership chain. A JVM that
//! is not re-announced within `expiry_factor` broadcast intervals is lost.

use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BackendError, DiscoveryBackend, ReconcileTrigger};
use crate::config::JdpConfig;
use crate::model::{annotation_keys, realms, NodeType, Target};
use crate::topology::{ChainForest, Scope};

pub const MAGIC: u32 = 0xC0FF_EE42;
pub const VERSION: u16 = 1;

pub const SESSION_UUID_KEY: &str = "DISCOVERABLE_SESSION_UUID";
pub const MAIN_CLASS_KEY: &str = "MAIN_CLASS";
pub const JMX_SERVICE_URL_KEY: &str = "JMX_SERVICE_URL";
pub const INSTANCE_NAME_KEY: &str = "INSTANCE_NAME";
pub const PROCESS_ID_KEY: &str = "PROCESS_ID";
pub const BROADCAST_INTERVAL_KEY: &str = "BROADCAST_INTERVAL";
pub const RMI_HOSTNAME_KEY: &str = "RMI_HOSTNAME";

/// Broadcast interval assumed when a packet does not announce one.
pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(5);

/// How often expiry is checked.
const EXPIRY_CHECK_PERIOD: Duration = Duration::from_secs(1);

const MAX_PACKET_SIZE: usize = 65_507;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JdpError {
    #[error("packet too short")]
    Truncated,
    #[error("bad magic {0:#x}")]
    BadMagic(u32),
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("entry is not valid UTF-8")]
    InvalidUtf8,
    #[error("packet has no {0}")]
    MissingKey(&'static str),
    #[error("entry of {0} bytes does not fit a packet")]
    EntryTooLong(usize),
}

/// One decoded announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JdpPacket {
    pub entries: BTreeMap<String, String>,
}

impl JdpPacket {
    pub fn decode(mut buf: &[u8]) -> Result<Self, JdpError> {
        if buf.remaining() < 6 {
            return Err(JdpError::Truncated);
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(JdpError::BadMagic(magic));
        }
        let version = buf.get_u16();
        if version != VERSION {
            return Err(JdpError::UnsupportedVersion(version));
        }

        let mut entries = BTreeMap::new();
        while buf.has_remaining() {
            let key = read_string(&mut buf)?;
            let value = read_string(&mut buf)?;
            entries.insert(key, value);
        }

        let packet = Self { entries };
        if packet.get(JMX_SERVICE_URL_KEY).is_none() {
            return Err(JdpError::MissingKey(JMX_SERVICE_URL_KEY));
        }
        Ok(packet)
    }

    pub fn encode(&self) -> Result<BytesMut, JdpError> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32(MAGIC);
        buf.put_u16(VERSION);
        for (key, value) in &self.entries {
            for s in [key, value] {
                let len = u16::try_from(s.len()).map_err(|_| JdpError::EntryTooLong(s.len()))?;
                buf.put_u16(len);
                buf.put_slice(s.as_bytes());
            }
        }
        Ok(buf)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn service_url(&self) -> Option<&str> {
        self.get(JMX_SERVICE_URL_KEY)
    }

    pub fn broadcast_interval(&self) -> Duration {
        self.get(BROADCAST_INTERVAL_KEY)
            .and_then(|ms| ms.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_BROADCAST_INTERVAL)
    }

    pub fn to_target(&self) -> Option<Target> {
        let url = self.service_url()?;
        let alias = self
            .get(INSTANCE_NAME_KEY)
            .or_else(|| self.get(MAIN_CLASS_KEY))
            .unwrap_or(url);
        let mut target =
            Target::new(url, alias).with_annotation(annotation_keys::REALM, realms::JDP);
        if let Some(main) = self.get(MAIN_CLASS_KEY) {
            target = target.with_annotation(annotation_keys::JAVA_MAIN, main);
        }
        if let Some(pid) = self.get(PROCESS_ID_KEY) {
            target = target.with_annotation(annotation_keys::PID, pid);
        }
        let authority = target.authority().map(str::to_string);
        if let Some((host, port)) = authority.as_deref().and_then(|a| a.rsplit_once(':')) {
            target = target
                .with_annotation(annotation_keys::HOST, host)
                .with_annotation(annotation_keys::PORT, port);
        }
        Some(target)
    }
}

fn read_string(buf: &mut &[u8]) -> Result<String, JdpError> {
    if buf.remaining() < 2 {
        return Err(JdpError::Truncated);
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(JdpError::Truncated);
    }
    let s = std::str::from_utf8(&buf[..len]).map_err(|_| JdpError::InvalidUtf8)?;
    let s = s.to_string();
    buf.advance(len);
    Ok(s)
}

struct Announced {
    packet: JdpPacket,
    last_seen: Instant,
}

/// JVMs heard from recently, keyed by service URL.
#[derive(Default)]
pub struct JdpRegistry {
    jvms: HashMap<String, Announced>,
}

impl JdpRegistry {
    /// Record an announcement. Returns true when the JVM is new or its
    /// announcement changed.
    pub fn record(&mut self, packet: JdpPacket, now: Instant) -> bool {
        let Some(url) = packet.service_url().map(str::to_string) else {
            return false;
        };
        match self.jvms.get_mut(&url) {
            Some(seen) => {
                seen.last_seen = now;
                if seen.packet == packet {
                    return false;
                }
                seen.packet = packet;
                true
            }
            None => {
                self.jvms.insert(
                    url,
                    Announced {
                        packet,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    /// Drop JVMs silent for longer than `factor` of their own broadcast
    /// interval. Returns how many expired.
    pub fn expire(&mut self, now: Instant, factor: u32) -> usize {
        let before = self.jvms.len();
        self.jvms.retain(|_, seen| {
            let ttl = seen.packet.broadcast_interval() * factor.max(1);
            now.saturating_duration_since(seen.last_seen) <= ttl
        });
        before - self.jvms.len()
    }

    pub fn targets(&self) -> Vec<Target> {
        let mut targets: Vec<Target> = self
            .jvms
            .values()
            .filter_map(|seen| seen.packet.to_target())
            .collect();
        targets.sort_by(|a, b| a.connect_url.cmp(&b.connect_url));
        targets
    }
}

pub struct JdpBackend {
    config: JdpConfig,
    registry: Arc<Mutex<JdpRegistry>>,
}

impl JdpBackend {
    pub fn new(config: JdpConfig) -> Self {
        Self {
            config,
            registry: Arc::new(Mutex::new(JdpRegistry::default())),
        }
    }

    pub fn registry(&self) -> Arc<Mutex<JdpRegistry>> {
        Arc::clone(&self.registry)
    }

    async fn bind(&self) -> Result<UdpSocket, BackendError> {
        let group: Ipv4Addr = self
            .config
            .group
            .parse()
            .map_err(|_| BackendError::Unavailable(format!("bad group {}", self.config.group)))?;
        let socket =
            UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.config.port)).await?;
        socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
        info!(group = %group, port = self.config.port, "joined JDP multicast group");
        Ok(socket)
    }
}

#[async_trait]
impl DiscoveryBackend for JdpBackend {
    fn realm(&self) -> &str {
        realms::JDP
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn available(&self) -> bool {
        true
    }

    fn poll_period(&self) -> Option<Duration> {
        Some(EXPIRY_CHECK_PERIOD)
    }

    async fn scopes(&self) -> Vec<Scope> {
        vec![Scope::realm(realms::JDP)]
    }

    async fn observe(&self, _scope: &Scope) -> Result<ChainForest, BackendError> {
        let mut registry = self.registry.lock().await;
        let expired = registry.expire(Instant::now(), self.config.expiry_factor);
        if expired > 0 {
            debug!(expired, "JDP announcements expired");
        }
        let mut forest = ChainForest::new();
        for target in registry.targets() {
            forest.target(None, target, NodeType::Jvm);
        }
        Ok(forest)
    }

    async fn start(
        &self,
        trigger: ReconcileTrigger,
        cancel: CancellationToken,
    ) -> Result<(), BackendError> {
        let socket = self.bind().await?;
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = socket.recv_from(&mut buf) => received,
                };
                let (len, from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "JDP receive failed");
                        continue;
                    }
                };
                let packet = match JdpPacket::decode(&buf[..len]) {
                    Ok(packet) => packet,
                    Err(e) => {
                        debug!(from = %from, error = %e, "ignoring malformed JDP packet");
                        continue;
                    }
                };
                if registry.lock().await.record(packet, Instant::now()) {
                    trigger.request(Scope::realm(realms::JDP));
                }
            }
            debug!("JDP listener stopped");
        });
        Ok(())
    }
}
