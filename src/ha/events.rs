//! DRBD event stream
//!
//! Tails `drbdsetup events2 --statistics --timestamps all` and folds each
//! line into a per-resource status. After every fold the resource's HA
//! state is published so the replica reconciler can refresh the replica.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crd::{HaState, HaStatus};
use crate::exec::{ExecParams, NsExecutor};

// =============================================================================
// Event records
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventChange {
    Exists,
    Create,
    Change,
    Destroy,
    Call,
    Response,
}

impl EventChange {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "exists" => EventChange::Exists,
            "create" => EventChange::Create,
            "change" => EventChange::Change,
            "destroy" => EventChange::Destroy,
            "call" => EventChange::Call,
            "response" => EventChange::Response,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventObject {
    Resource,
    Connection,
    Device,
    PeerDevice,
    Path,
    Helper,
}

impl EventObject {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "resource" => EventObject::Resource,
            "connection" => EventObject::Connection,
            "device" => EventObject::Device,
            "peer-device" => EventObject::PeerDevice,
            "path" => EventObject::Path,
            "helper" => EventObject::Helper,
            _ => return None,
        })
    }
}

/// One parsed events2 line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrbdEvent {
    pub change: EventChange,
    pub object: EventObject,
    pub resource: String,
    pub fields: BTreeMap<String, String>,
}

/// Parse `[<timestamp>] <change> <object> name:<res> key:val ...`
pub fn parse_event(line: &str) -> Option<DrbdEvent> {
    let mut tokens = line.split_whitespace().peekable();
    let first = *tokens.peek()?;
    if EventChange::parse(first).is_none() {
        // leading timestamp
        tokens.next();
    }
    let change = EventChange::parse(tokens.next()?)?;
    let object = EventObject::parse(tokens.next()?)?;
    let fields: BTreeMap<String, String> = tokens
        .filter_map(|t| t.split_once(':'))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let resource = fields.get("name")?.clone();
    Some(DrbdEvent {
        change,
        object,
        resource,
        fields,
    })
}

// =============================================================================
// Resource status fold
// =============================================================================

pub const DISK_UP_TO_DATE: &str = "UpToDate";
pub const CONNECTION_CONNECTED: &str = "Connected";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerStatus {
    pub disk: Option<String>,
    pub replication: Option<String>,
    pub connection: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceStatus {
    pub name: String,
    pub role: Option<String>,
    pub local_disk: Option<String>,
    /// Keyed by connection name (peer hostname)
    pub peers: BTreeMap<String, PeerStatus>,
}

impl ResourceStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Fold one event; returns whether anything was recorded
    pub fn apply(&mut self, event: &DrbdEvent) -> bool {
        let field = |k: &str| event.fields.get(k).cloned();
        match event.object {
            EventObject::Device => {
                if let Some(disk) = field("disk") {
                    self.local_disk = Some(disk);
                    return true;
                }
            }
            EventObject::PeerDevice => {
                if let Some(conn) = field("conn-name") {
                    let peer = self.peers.entry(conn).or_default();
                    if let Some(disk) = field("peer-disk") {
                        peer.disk = Some(disk);
                    }
                    if let Some(replication) = field("replication") {
                        peer.replication = Some(replication);
                    }
                    return true;
                }
            }
            EventObject::Connection => {
                if let Some(conn) = field("conn-name") {
                    let peer = self.peers.entry(conn).or_default();
                    if let Some(state) = field("connection") {
                        peer.connection = Some(state);
                    }
                    return true;
                }
            }
            EventObject::Resource => {
                if let Some(role) = field("role") {
                    self.role = Some(role);
                    return true;
                }
            }
            EventObject::Path | EventObject::Helper => {}
        }
        false
    }

    pub fn ha_status(&self) -> HaStatus {
        let local = self.local_disk.as_deref().unwrap_or("Unknown");
        let peers: Vec<&str> = self
            .peers
            .values()
            .map(|p| p.disk.as_deref().unwrap_or("Unknown"))
            .collect();
        HaStatus {
            state: ha_state(local, &peers),
            reason: format!("local disk {}, peers {:?}", local, peers),
        }
    }
}

/// Map local and peer disk states to the replica HA state
pub fn ha_state(local: &str, peers: &[&str]) -> HaState {
    match local {
        DISK_UP_TO_DATE if peers.iter().all(|p| *p == DISK_UP_TO_DATE) => HaState::Consistent,
        DISK_UP_TO_DATE => HaState::UpToDate,
        "Inconsistent" | "Outdated" | "Consistent" | "Negotiating" => HaState::Inconsistent,
        _ => HaState::Unknown,
    }
}

// =============================================================================
// Event pump
// =============================================================================

/// Tails the DRBD event stream and keeps per-resource status
#[derive(Clone)]
pub struct EventPump {
    statuses: Arc<Mutex<BTreeMap<String, ResourceStatus>>>,
    sender: broadcast::Sender<(String, HaStatus)>,
}

impl Default for EventPump {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPump {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            statuses: Arc::new(Mutex::new(BTreeMap::new())),
            sender,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(String, HaStatus)> {
        self.sender.subscribe()
    }

    pub fn status(&self, resource: &str) -> Option<ResourceStatus> {
        self.statuses.lock().get(resource).cloned()
    }

    /// Fold one line and publish the resource's HA state
    pub fn ingest(&self, line: &str) -> Option<(String, HaStatus)> {
        let event = parse_event(line)?;
        let published = {
            let mut statuses = self.statuses.lock();
            if event.change == EventChange::Destroy && event.object == EventObject::Resource {
                statuses.remove(&event.resource);
                return None;
            }
            let status = statuses
                .entry(event.resource.clone())
                .or_insert_with(|| ResourceStatus::new(&event.resource));
            if !status.apply(&event) {
                return None;
            }
            (event.resource.clone(), status.ha_status())
        };
        let _ = self.sender.send(published.clone());
        Some(published)
    }

    async fn tail(&self, token: &CancellationToken) -> std::io::Result<()> {
        let params = NsExecutor::<crate::exec::BasicExecutor>::wrap(
            ExecParams::new("drbdsetup").args(["events2", "--statistics", "--timestamps", "all"]),
        );
        let mut child = tokio::process::Command::new(&params.cmd)
            .args(&params.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "no stdout"))?;
        let mut lines = BufReader::new(stdout).lines();

        info!("Watching DRBD events");
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                line = lines.next_line() => match line? {
                    Some(line) => {
                        if let Some((resource, status)) = self.ingest(&line) {
                            debug!("DRBD resource {} is {}", resource, status.state);
                        }
                    }
                    None => return Ok(()),
                },
            }
        }
    }

    /// Tail until cancelled, restarting the tail with backoff when it exits
    pub async fn run(&self, token: CancellationToken) {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(30))
            .with_max_elapsed_time(None)
            .build();
        while !token.is_cancelled() {
            match self.tail(&token).await {
                Ok(()) if token.is_cancelled() => break,
                Ok(()) => warn!("DRBD event stream ended, restarting"),
                Err(e) => warn!("DRBD event stream failed: {}", e),
            }
            let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("DRBD event pump stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event() {
        let ev = parse_event(
            "2024-05-01T10:00:00.000000+00:00 change peer-device name:pvc-1 peer-node-id:1 conn-name:node-b volume:0 replication:Established peer-disk:UpToDate",
        )
        .unwrap();
        assert_eq!(ev.change, EventChange::Change);
        assert_eq!(ev.object, EventObject::PeerDevice);
        assert_eq!(ev.resource, "pvc-1");
        assert_eq!(ev.fields["peer-disk"], "UpToDate");

        let ev = parse_event("exists device name:pvc-1 volume:0 minor:1001 disk:UpToDate").unwrap();
        assert_eq!(ev.change, EventChange::Exists);
        assert_eq!(ev.fields["disk"], "UpToDate");

        assert!(parse_event("exists -").is_none());
        assert!(parse_event("").is_none());
    }

    #[test]
    fn test_ha_state_mapping() {
        assert_eq!(ha_state("UpToDate", &["UpToDate", "UpToDate"]), HaState::Consistent);
        assert_eq!(ha_state("UpToDate", &[]), HaState::Consistent);
        assert_eq!(ha_state("UpToDate", &["Inconsistent"]), HaState::UpToDate);
        assert_eq!(ha_state("Outdated", &["UpToDate"]), HaState::Inconsistent);
        assert_eq!(ha_state("Negotiating", &[]), HaState::Inconsistent);
        assert_eq!(ha_state("Diskless", &[]), HaState::Unknown);
    }

    #[tokio::test]
    async fn test_pump_folds_and_publishes() {
        let pump = EventPump::new();
        let mut rx = pump.subscribe();

        pump.ingest("exists device name:pvc-1 volume:0 minor:1001 disk:UpToDate");
        pump.ingest("exists connection name:pvc-1 peer-node-id:1 conn-name:node-b connection:Connected role:Secondary");
        let (res, status) = pump
            .ingest("change peer-device name:pvc-1 peer-node-id:1 conn-name:node-b volume:0 replication:SyncSource peer-disk:Inconsistent")
            .unwrap();
        assert_eq!(res, "pvc-1");
        assert_eq!(status.state, HaState::UpToDate);

        let (_, first) = rx.recv().await.unwrap();
        assert_eq!(first.state, HaState::Consistent);

        let status = pump.status("pvc-1").unwrap();
        assert_eq!(status.peers["node-b"].connection.as_deref(), Some("Connected"));

        pump.ingest("destroy resource name:pvc-1");
        assert!(pump.status("pvc-1").is_none());
    }
}
