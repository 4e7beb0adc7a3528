//! LAN peer discovery over mDNS
//!
//! Each device advertises a `_quillspace-sync._tcp` service carrying its
//! device id, name, and protocol version in TXT records. A background browse
//! task keeps a candidate map current; callers poll [`Discovery::candidates`]
//! for a snapshot. Discovery only finds peers, it grants nothing: every
//! candidate still has to pass the handshake.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::models::{PeerCandidate, PROTOCOL_VERSION};
use crate::{Result, SyncCoreError};

pub const SERVICE_TYPE: &str = "_quillspace-sync._tcp.local.";

/// mDNS advertiser and browser
pub struct Discovery {
    device_id: Uuid,
    daemon: ServiceDaemon,
    candidates: RwLock<HashMap<Uuid, PeerCandidate>>,
    /// Fullname of our registered service while advertising
    registered: Mutex<Option<String>>,
    stale_secs: u64,
    stopped: AtomicBool,
}

impl Discovery {
    pub fn new(device_id: Uuid, stale_secs: u64) -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(|e| SyncCoreError::Discovery(e.to_string()))?;
        Ok(Self {
            device_id,
            daemon,
            candidates: RwLock::new(HashMap::new()),
            registered: Mutex::new(None),
            stale_secs,
            stopped: AtomicBool::new(false),
        })
    }

    /// Advertise this device's sync listener. Safe to call again; an active
    /// registration is left alone.
    pub fn advertise(&self, device_name: &str, port: u16) -> Result<()> {
        let mut registered = self
            .registered
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if registered.is_some() {
            return Ok(());
        }

        let instance = self.device_id.to_string();
        let host = format!("{instance}.local.");
        let mut properties = HashMap::new();
        properties.insert("id".to_string(), instance.clone());
        properties.insert("name".to_string(), device_name.to_string());
        properties.insert("v".to_string(), PROTOCOL_VERSION.to_string());

        let service = ServiceInfo::new(SERVICE_TYPE, &instance, &host, "", port, properties)
            .map_err(|e| SyncCoreError::Discovery(e.to_string()))?
            .enable_addr_auto();
        let fullname = service.get_fullname().to_string();

        self.daemon
            .register(service)
            .map_err(|e| SyncCoreError::Discovery(e.to_string()))?;
        *registered = Some(fullname);
        info!(port, "advertising sync service");
        Ok(())
    }

    pub fn stop_advertising(&self) -> Result<()> {
        let mut registered = self
            .registered
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(fullname) = registered.take() {
            self.daemon
                .unregister(&fullname)
                .map_err(|e| SyncCoreError::Discovery(e.to_string()))?;
        }
        Ok(())
    }

    pub fn is_advertising(&self) -> bool {
        self.registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Run the browse loop until shutdown. Daemon failures are logged once
    /// and retried on exponential backoff.
    pub fn spawn_browse_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut delay = Duration::from_secs(1);
            let mut warned = false;

            while !self.stopped.load(Ordering::SeqCst) {
                let receiver = match self.daemon.browse(SERVICE_TYPE) {
                    Ok(receiver) => receiver,
                    Err(e) => {
                        if !warned {
                            warn!(error = %e, "mdns browse failed, retrying");
                            warned = true;
                        }
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(Duration::from_secs(30));
                        continue;
                    }
                };
                delay = Duration::from_secs(1);
                warned = false;

                let mut sweep =
                    tokio::time::interval(Duration::from_secs(self.stale_secs.max(1)));
                loop {
                    tokio::select! {
                        event = receiver.recv_async() => match event {
                            Ok(event) => self.handle_event(event),
                            Err(_) => break,
                        },
                        _ = sweep.tick() => self.evict_stale(),
                    }
                }
            }
        })
    }

    /// Snapshot of live candidates, ordered by device id
    pub fn candidates(&self) -> Vec<PeerCandidate> {
        self.evict_stale();
        let map = self.candidates.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<PeerCandidate> = map.values().cloned().collect();
        drop(map);
        out.sort_by_key(|c| c.device_id);
        out
    }

    pub fn candidate(&self, device_id: &Uuid) -> Option<PeerCandidate> {
        self.candidates
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(device_id)
            .cloned()
    }

    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.daemon.stop_browse(SERVICE_TYPE);
        let _ = self.daemon.shutdown();
    }

    fn handle_event(&self, event: ServiceEvent) {
        match event {
            ServiceEvent::ServiceResolved(info) => {
                if let Some(candidate) = parse_candidate(&info, &self.device_id) {
                    debug!(
                        peer = %candidate.device_id,
                        name = %candidate.device_name,
                        address = %candidate.address,
                        "peer resolved"
                    );
                    self.candidates_mut()
                        .insert(candidate.device_id, candidate);
                }
            }
            ServiceEvent::ServiceRemoved(_, fullname) => {
                if let Some(device_id) = instance_uuid(&fullname) {
                    if self.candidates_mut().remove(&device_id).is_some() {
                        debug!(peer = %device_id, "peer went away");
                    }
                }
            }
            _ => {}
        }
    }

    fn evict_stale(&self) {
        let cutoff = Utc::now().timestamp_millis() - (self.stale_secs as i64) * 1000;
        self.candidates_mut()
            .retain(|_, candidate| candidate.advertised_at >= cutoff);
    }

    fn candidates_mut(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, PeerCandidate>> {
        self.candidates.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Extract a candidate from a resolved service; our own advertisement and
/// anything without a usable id or address is ignored
fn parse_candidate(info: &ServiceInfo, local_device_id: &Uuid) -> Option<PeerCandidate> {
    let device_id = info
        .get_property_val_str("id")
        .and_then(|s| Uuid::parse_str(s).ok())?;
    if device_id == *local_device_id {
        return None;
    }

    let device_name = info
        .get_property_val_str("name")
        .unwrap_or("unknown")
        .to_string();
    let ip = *info.get_addresses().iter().next()?;

    Some(PeerCandidate {
        device_id,
        device_name,
        address: SocketAddr::from((ip, info.get_port())),
        advertised_at: Utc::now().timestamp_millis(),
    })
}

/// The instance label of a service fullname is the advertising device's id
fn instance_uuid(fullname: &str) -> Option<Uuid> {
    fullname
        .split('.')
        .next()
        .and_then(|s| Uuid::parse_str(s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(device_id: &Uuid, name: &str, ip: &str, port: u16) -> ServiceInfo {
        let mut properties = HashMap::new();
        properties.insert("id".to_string(), device_id.to_string());
        properties.insert("name".to_string(), name.to_string());
        properties.insert("v".to_string(), PROTOCOL_VERSION.to_string());
        ServiceInfo::new(
            SERVICE_TYPE,
            &device_id.to_string(),
            &format!("{device_id}.local."),
            ip,
            port,
            properties,
        )
        .unwrap()
    }

    #[test]
    fn resolved_service_becomes_candidate() {
        let peer = Uuid::new_v4();
        let local = Uuid::new_v4();
        let info = service(&peer, "laptop", "192.168.1.7", 4321);

        let candidate = parse_candidate(&info, &local).unwrap();
        assert_eq!(candidate.device_id, peer);
        assert_eq!(candidate.device_name, "laptop");
        assert_eq!(candidate.address.port(), 4321);
        assert_eq!(candidate.address.ip().to_string(), "192.168.1.7");
    }

    #[test]
    fn own_advertisement_is_ignored() {
        let local = Uuid::new_v4();
        let info = service(&local, "me", "192.168.1.7", 4321);
        assert!(parse_candidate(&info, &local).is_none());
    }

    #[test]
    fn service_without_id_is_ignored() {
        let peer = Uuid::new_v4();
        let properties: HashMap<String, String> = HashMap::new();
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            &peer.to_string(),
            &format!("{peer}.local."),
            "192.168.1.7",
            4321,
            properties,
        )
        .unwrap();
        assert!(parse_candidate(&info, &Uuid::new_v4()).is_none());
    }

    #[test]
    fn instance_label_parses_back_to_device_id() {
        let peer = Uuid::new_v4();
        let fullname = format!("{peer}.{SERVICE_TYPE}");
        assert_eq!(instance_uuid(&fullname), Some(peer));
        assert_eq!(instance_uuid("not-a-uuid._quillspace-sync._tcp.local."), None);
    }
}
