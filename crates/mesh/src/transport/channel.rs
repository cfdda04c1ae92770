//! In-process transport for tests and local multi-node simulation.
//!
//! Every [`ChannelTransport`] attached to the same [`ChannelHub`] can reach
//! every other running one. Delivery enqueues onto the receiver's
//! unbounded channel; a per-transport task drains it into the callback, so
//! a send never re-enters the sender's relay engine.

use super::{Transport, TransportCallback};
use crate::error::{MeshError, MeshResult};
use crate::packet::Packet;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

type Frame = (String, Vec<u8>);

struct HubPeer {
    display_name: String,
    stealth: bool,
    inbox: mpsc::UnboundedSender<Frame>,
    callback: Option<Arc<dyn TransportCallback>>,
}

/// Shared medium connecting channel transports.
#[derive(Default)]
pub struct ChannelHub {
    peers: RwLock<HashMap<String, HubPeer>>,
}

impl ChannelHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn join(&self, endpoint_id: &str, peer: HubPeer) {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint_id.to_string(), peer);
        self.announce();
    }

    fn leave(&self, endpoint_id: &str) {
        let removed = self
            .peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(endpoint_id);
        if removed.is_some() {
            self.announce();
        }
    }

    /// Tell every peer who else is visible.
    fn announce(&self) {
        let views: Vec<(Arc<dyn TransportCallback>, HashMap<String, String>)> = {
            let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
            peers
                .iter()
                .filter_map(|(id, peer)| {
                    let callback = peer.callback.clone()?;
                    let visible = peers
                        .iter()
                        .filter(|(other, p)| *other != id && !p.stealth)
                        .map(|(other, p)| (other.clone(), p.display_name.clone()))
                        .collect();
                    Some((callback, visible))
                })
                .collect()
        };

        for (callback, visible) in views {
            callback.on_connection_set_changed(visible);
        }
    }

    fn deliver(&self, from: &str, to: &str, bytes: &[u8]) -> bool {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        match peers.get(to) {
            Some(peer) => peer.inbox.send((from.to_string(), bytes.to_vec())).is_ok(),
            None => false,
        }
    }

    fn deliver_all(&self, from: &str, skip: Option<&str>, bytes: &[u8]) -> usize {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        peers
            .iter()
            .filter(|(id, _)| id.as_str() != from && Some(id.as_str()) != skip)
            .filter(|(_, peer)| peer.inbox.send((from.to_string(), bytes.to_vec())).is_ok())
            .count()
    }

    /// Endpoints currently attached.
    pub fn endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        endpoints.sort();
        endpoints
    }
}

/// Transport over a [`ChannelHub`].
pub struct ChannelTransport {
    name: String,
    endpoint_id: String,
    hub: Arc<ChannelHub>,
    callback: RwLock<Option<Arc<dyn TransportCallback>>>,
    task: Mutex<Option<CancellationToken>>,
    running: AtomicBool,
    faulty: AtomicBool,
    sent_frames: AtomicU64,
}

impl ChannelTransport {
    /// `name` selects the cost class the relay assigns, e.g. "LAN".
    pub fn new(name: impl Into<String>, endpoint_id: impl Into<String>, hub: Arc<ChannelHub>) -> Self {
        Self {
            name: name.into(),
            endpoint_id: endpoint_id.into(),
            hub,
            callback: RwLock::new(None),
            task: Mutex::new(None),
            running: AtomicBool::new(false),
            faulty: AtomicBool::new(false),
            sent_frames: AtomicU64::new(0),
        }
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    /// Make every send fail, simulating a dead radio.
    pub fn set_faulty(&self, faulty: bool) {
        self.faulty.store(faulty, Ordering::SeqCst);
    }

    /// Frames handed to the hub so far.
    pub fn sent_frames(&self) -> u64 {
        self.sent_frames.load(Ordering::SeqCst)
    }

    fn check_sendable(&self) -> MeshResult<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(MeshError::Transport(format!("{} not started", self.name)));
        }
        if self.faulty.load(Ordering::SeqCst) {
            return Err(MeshError::Transport(format!("{} link down", self.name)));
        }
        Ok(())
    }
}

impl Transport for ChannelTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self, display_name: &str, stealth: bool) -> MeshResult<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| MeshError::InvalidState("channel transport needs a tokio runtime".to_string()))?;

        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return Ok(());
        }

        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let (inbox, mut frames) = mpsc::unbounded_channel::<Frame>();
        let token = CancellationToken::new();

        let worker_token = token.clone();
        let worker_callback = callback.clone();
        let endpoint_id = self.endpoint_id.clone();
        runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = worker_token.cancelled() => break,
                    frame = frames.recv() => match frame {
                        Some((from, bytes)) => {
                            if let Some(callback) = &worker_callback {
                                callback.on_bytes_received(&from, &bytes);
                            }
                        }
                        None => break,
                    },
                }
            }
            trace!(endpoint = %endpoint_id, "Channel reader stopped");
        });

        *task = Some(token);
        self.running.store(true, Ordering::SeqCst);
        self.hub.join(
            &self.endpoint_id,
            HubPeer {
                display_name: display_name.to_string(),
                stealth,
                inbox,
                callback,
            },
        );
        debug!(transport = %self.name, endpoint = %self.endpoint_id, stealth, "Channel transport started");
        Ok(())
    }

    fn stop(&self) {
        let token = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(token) = token {
            token.cancel();
            self.running.store(false, Ordering::SeqCst);
            self.hub.leave(&self.endpoint_id);
            debug!(transport = %self.name, endpoint = %self.endpoint_id, "Channel transport stopped");
        }
    }

    fn send(&self, packet: &Packet, target: Option<&str>) -> MeshResult<()> {
        self.check_sendable()?;
        let bytes = packet.to_bytes()?;

        match target {
            Some(target) => {
                if !self.hub.deliver(&self.endpoint_id, target, &bytes) {
                    return Err(MeshError::Transport(format!("endpoint {} unreachable", target)));
                }
                self.sent_frames.fetch_add(1, Ordering::SeqCst);
            }
            None => {
                let count = self.hub.deliver_all(&self.endpoint_id, None, &bytes);
                self.sent_frames.fetch_add(count as u64, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    fn broadcast_except(&self, packet: &Packet, skip_endpoint: &str) -> MeshResult<()> {
        self.check_sendable()?;
        let bytes = packet.to_bytes()?;
        let count = self.hub.deliver_all(&self.endpoint_id, Some(skip_endpoint), &bytes);
        self.sent_frames.fetch_add(count as u64, Ordering::SeqCst);
        Ok(())
    }

    fn set_callback(&self, callback: Arc<dyn TransportCallback>) {
        *self.callback.write().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        self.stop();
    }
}
