//! The relay: a star-topology fan-out for every node in the testbed.
//!
//! Each accepted connection gets a reader task and a writer task. Writers
//! drain a per-peer channel, so per-peer writes are serialized and a frame's
//! length prefix and body always arrive contiguously. Fan-out walks the
//! peer table, skipping dropped peers and deferring delayed ones onto
//! independent sleep tasks. The relay is also the network's clock: the STEP
//! ticker drives block production on every node.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use stakenet_core::config::Config;
use stakenet_core::net::frame::{encode_frame, FrameDecoder};
use stakenet_core::net::messages::Message;

use crate::detect::alert::AlertManager;
use crate::detect::DoubleSpendDetector;

/// Sender id the relay signs its own messages with.
pub const SERVER_ID: &str = "server";

struct Peer {
    /// Set once the peer's HELLO arrives.
    node_id: Option<String>,
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

pub struct RelayState {
    peers: Mutex<HashMap<u64, Peer>>,
    next_peer_id: AtomicU64,
    drop_set: Mutex<HashSet<String>>,
    /// node_id -> artificial delay in milliseconds.
    delay_map: Mutex<HashMap<String, u64>>,
    detector: Mutex<DoubleSpendDetector>,
    alerts: tokio::sync::Mutex<AlertManager>,
    step_interval: Duration,
    step_task: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
    shutdown_notify: Notify,
}

impl RelayState {
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
            next_peer_id: AtomicU64::new(1),
            drop_set: Mutex::new(HashSet::new()),
            delay_map: Mutex::new(HashMap::new()),
            detector: Mutex::new(DoubleSpendDetector::new(&config.detector)),
            alerts: tokio::sync::Mutex::new(AlertManager::new()),
            step_interval: Duration::from_secs_f64(config.step.interval),
            step_task: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        })
    }

    // ------------------------------------------------------------------
    // Peer table
    // ------------------------------------------------------------------

    fn register_peer(&self, sender: mpsc::UnboundedSender<Vec<u8>>) -> u64 {
        let peer_id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        self.peers
            .lock()
            .unwrap()
            .insert(peer_id, Peer { node_id: None, sender });
        peer_id
    }

    fn set_node_id(&self, peer_id: u64, node_id: String) {
        if let Some(peer) = self.peers.lock().unwrap().get_mut(&peer_id) {
            peer.node_id = Some(node_id);
        }
    }

    /// Remove a peer and announce its departure. A peer that never sent
    /// HELLO leaves silently.
    fn disconnect(&self, peer_id: u64) {
        let node_id = self
            .peers
            .lock()
            .unwrap()
            .remove(&peer_id)
            .and_then(|p| p.node_id);
        if let Some(node_id) = node_id {
            info!("node {} disconnected", node_id);
            self.broadcast_message(&Message::Bye { sender_id: node_id });
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    // ------------------------------------------------------------------
    // Broadcast
    // ------------------------------------------------------------------

    fn broadcast_message(&self, msg: &Message) {
        match msg.encode() {
            Ok(payload) => self.broadcast_frame(encode_frame(&payload), None),
            Err(e) => warn!("cannot encode {}: {}", msg.kind(), e),
        }
    }

    /// Fan a framed message out to every peer except `exclude`, honoring
    /// the drop set and delay table. Undelayed sends go straight onto the
    /// peer's writer channel, preserving inbound FIFO order per
    /// destination; delayed sends run on their own timer tasks.
    fn broadcast_frame(&self, frame: Vec<u8>, exclude: Option<u64>) {
        let peers = self.peers.lock().unwrap();
        let drops = self.drop_set.lock().unwrap();
        let delays = self.delay_map.lock().unwrap();

        for (id, peer) in peers.iter() {
            if Some(*id) == exclude {
                continue;
            }
            let node = peer.node_id.as_deref();
            if let Some(node) = node {
                if drops.contains(node) {
                    debug!("dropping frame for {}", node);
                    continue;
                }
            }
            let delay_ms = node.and_then(|n| delays.get(n).copied()).unwrap_or(0);
            if delay_ms > 0 {
                let sender = peer.sender.clone();
                let frame = frame.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    let _ = sender.send(frame);
                });
            } else {
                let _ = peer.sender.send(frame.clone());
            }
        }
    }

    // ------------------------------------------------------------------
    // STEP ticker
    // ------------------------------------------------------------------

    pub fn broadcast_step(&self) {
        self.broadcast_message(&Message::Step { sender_id: SERVER_ID.to_string() });
        info!("[STEP] broadcast STEP to all nodes");
    }

    pub fn start_step_ticker(self: &Arc<Self>) {
        let mut guard = self.step_task.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let state = self.clone();
        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(state.step_interval).await;
                state.broadcast_step();
            }
        }));
        info!("periodic STEP every {:.1}s", self.step_interval.as_secs_f64());
    }

    pub fn stop_step_ticker(&self) {
        if let Some(handle) = self.step_task.lock().unwrap().take() {
            handle.abort();
            info!("stopped sending STEP messages");
        }
    }

    // ------------------------------------------------------------------
    // Fault injection controls (operator console)
    // ------------------------------------------------------------------

    pub fn drops(&self) -> Vec<String> {
        let mut list: Vec<String> = self.drop_set.lock().unwrap().iter().cloned().collect();
        list.sort();
        list
    }

    /// Returns whether the node is dropped after the update.
    pub fn set_drop(&self, node_id: &str, on: bool) -> bool {
        let mut drops = self.drop_set.lock().unwrap();
        if on {
            drops.insert(node_id.to_string());
        } else {
            drops.remove(node_id);
        }
        on
    }

    pub fn toggle_drop(&self, node_id: &str) -> bool {
        let mut drops = self.drop_set.lock().unwrap();
        if drops.remove(node_id) {
            false
        } else {
            drops.insert(node_id.to_string());
            true
        }
    }

    pub fn delays(&self) -> Vec<(String, u64)> {
        let mut list: Vec<(String, u64)> = self
            .delay_map
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        list.sort();
        list
    }

    pub fn set_delay(&self, node_id: &str, delay_ms: Option<u64>) {
        let mut delays = self.delay_map.lock().unwrap();
        match delay_ms {
            Some(ms) if ms > 0 => {
                delays.insert(node_id.to_string(), ms);
            }
            _ => {
                delays.remove(node_id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Detection
    // ------------------------------------------------------------------

    /// Register a callback for every emitted alert.
    pub async fn add_alert_listener(&self, listener: crate::detect::alert::AlertListener) {
        self.alerts.lock().await.add_listener(listener);
    }

    /// Feed TRANSACTION and BLOCK frames to the detector before fan-out.
    /// Detection runs inline on the receive path; whatever it returns (or
    /// fails to), forwarding proceeds.
    async fn inspect(&self, msg: &Message) {
        let patterns = match msg {
            Message::Transaction { sender_id, tx } => self
                .detector
                .lock()
                .unwrap()
                .observe_transaction(sender_id, tx),
            Message::Block { sender_id, block } => {
                self.detector.lock().unwrap().observe_block(sender_id, block)
            }
            _ => return,
        };
        if !patterns.is_empty() {
            self.alerts.lock().await.send_alerts(&patterns).await;
        }
    }

    pub fn detector_status(&self) -> crate::detect::DetectionStatus {
        self.detector.lock().unwrap().status()
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Graceful shutdown: stop the clock, say goodbye, close every peer,
    /// and stop accepting.
    pub fn shutdown(&self) {
        info!("shutting down relay...");
        self.shutting_down.store(true, Ordering::SeqCst);
        self.stop_step_ticker();
        self.drop_set.lock().unwrap().clear();
        self.delay_map.lock().unwrap().clear();

        self.broadcast_message(&Message::Bye { sender_id: SERVER_ID.to_string() });

        // Dropping the senders lets each writer drain its queue (the BYE
        // included) and then close its socket.
        self.peers.lock().unwrap().clear();

        self.shutdown_notify.notify_waiters();
        info!("relay shutdown complete");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

/// Accept loop. Returns after `shutdown()`.
pub async fn run(state: Arc<RelayState>, listener: TcpListener) -> Result<()> {
    info!("relay listening on {}", listener.local_addr()?);
    loop {
        if state.is_shutting_down() {
            break;
        }
        tokio::select! {
            _ = state.shutdown_notify.notified() => break,
            accepted = listener.accept() => {
                let (socket, addr) = accepted?;
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_peer(state, socket, addr).await {
                        debug!("peer {} closed: {}", addr, e);
                    }
                });
            }
        }
    }
    info!("relay accept loop stopped");
    Ok(())
}

async fn handle_peer(
    state: Arc<RelayState>,
    socket: TcpStream,
    addr: SocketAddr,
) -> Result<()> {
    info!("new connection from {}", addr);
    let (mut reader, mut writer) = socket.into_split();

    let (sender, mut outbound) = mpsc::unbounded_channel::<Vec<u8>>();
    let peer_id = state.register_peer(sender);

    // Writer task: the single writer for this peer.
    tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let result = read_loop(&state, peer_id, &mut reader, addr).await;
    state.disconnect(peer_id);
    result
}

async fn read_loop(
    state: &Arc<RelayState>,
    peer_id: u64,
    reader: &mut OwnedReadHalf,
    addr: SocketAddr,
) -> Result<()> {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        decoder.extend(&buf[..n]);
        while let Some(frame) = decoder.next_frame()? {
            // A peer speaking garbage is disconnected, not ignored.
            let msg = Message::decode(&frame)
                .map_err(|e| anyhow!("undecodable frame from {addr}: {e}"))?;
            debug!("received {} from {} ({})", msg.kind(), msg.sender_id(), addr);

            if let Message::Hello { sender_id } = &msg {
                info!("peer {} registered as {}", addr, sender_id);
                state.set_node_id(peer_id, sender_id.clone());
            }

            state.inspect(&msg).await;
            state.broadcast_frame(encode_frame(&frame), Some(peer_id));
        }
    }
}
