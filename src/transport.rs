//! Outbound delivery channels
//!
//! [`Outbound`] is the seam between the orchestrator and anything that
//! carries encoded bytes away: the UDP socket towards the visual engine, the
//! haptic actuator link owned by the Bluetooth collaborator, or an in-memory
//! recorder in tests.
//!
//! Delivery is best effort. Sends issued while a channel is not ready are
//! dropped, never queued for later: only the latest reading matters.

use crate::error::SyncError;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Default OSC destination host
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Default OSC destination port
pub const DEFAULT_PORT: u16 = 8000;

/// Delay between attempts to recreate a failed socket
pub const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Sends buffered ahead of the socket before further sends are dropped
const SEND_QUEUE_DEPTH: usize = 64;

/// A best-effort, connectionless delivery channel
pub trait Outbound: Send + Sync {
    /// Hand `payload` to the channel without blocking.
    ///
    /// Fails with [`SyncError::TransportUnavailable`] when the channel cannot
    /// take it right now; the payload is then dropped.
    fn send(&self, payload: &[u8]) -> Result<(), SyncError>;

    /// Whether a send issued now would be accepted
    fn is_ready(&self) -> bool;

    /// Short name used in diagnostics
    fn name(&self) -> &str;
}

/// Host and port of the OSC receiver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for Destination {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

enum Command {
    Send(Vec<u8>),
    Reconfigure(Destination),
}

/// UDP channel backed by a single sender task.
///
/// The task owns the socket; callers on any thread push into a bounded queue.
/// When the socket fails, the task recreates it on its own, retrying forever.
pub struct UdpTransport {
    commands: mpsc::Sender<Command>,
    ready: Arc<AtomicBool>,
    destination: Mutex<Destination>,
}

impl UdpTransport {
    /// Start the sender task on the current tokio runtime.
    ///
    /// Must be called from within a runtime context.
    pub fn spawn(destination: Destination) -> Self {
        Self::spawn_on(&tokio::runtime::Handle::current(), destination)
    }

    /// Start the sender task on the given runtime
    pub fn spawn_on(runtime: &tokio::runtime::Handle, destination: Destination) -> Self {
        let (commands, receiver) = mpsc::channel(SEND_QUEUE_DEPTH);
        let ready = Arc::new(AtomicBool::new(false));

        runtime.spawn(run_sender(receiver, Arc::clone(&ready), destination.clone()));

        Self {
            commands,
            ready,
            destination: Mutex::new(destination),
        }
    }

    /// Current destination
    pub fn destination(&self) -> Destination {
        self.destination
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Point the channel at a new destination.
    ///
    /// The socket is torn down and recreated; sends issued until it is ready
    /// again are dropped.
    pub fn reconfigure(&self, host: impl Into<String>, port: u16) -> Result<(), SyncError> {
        let destination = Destination::new(host, port);
        info!("osc: reconfiguring destination to {destination}");

        *self
            .destination
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = destination.clone();
        self.ready.store(false, Ordering::SeqCst);

        // Reconfiguration must not be lost to a full queue
        self.commands
            .try_send(Command::Reconfigure(destination.clone()))
            .or_else(|err| match err {
                mpsc::error::TrySendError::Full(command) => {
                    let commands = self.commands.clone();
                    tokio::runtime::Handle::try_current()
                        .map(|handle| {
                            handle.spawn(async move {
                                let _ = commands.send(command).await;
                            });
                        })
                        .map_err(|_| {
                            SyncError::TransportUnavailable(format!(
                                "queue full, cannot reconfigure to {destination}"
                            ))
                        })
                }
                mpsc::error::TrySendError::Closed(_) => Err(SyncError::TransportUnavailable(
                    "sender task stopped".to_string(),
                )),
            })
    }
}

impl Outbound for UdpTransport {
    fn send(&self, payload: &[u8]) -> Result<(), SyncError> {
        if !self.ready.load(Ordering::SeqCst) {
            debug!("osc: dropping {} bytes, socket not ready", payload.len());
            return Err(SyncError::TransportUnavailable(format!(
                "socket to {} not ready",
                self.destination()
            )));
        }

        self.commands
            .try_send(Command::Send(payload.to_vec()))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => {
                    SyncError::TransportUnavailable("send queue full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    SyncError::TransportUnavailable("sender task stopped".to_string())
                }
            })
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "osc"
    }
}

async fn open_socket(destination: &Destination) -> std::io::Result<UdpSocket> {
    let bind_addr = if destination.host.contains(':') {
        "[::]:0"
    } else {
        "0.0.0.0:0"
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket
        .connect((destination.host.as_str(), destination.port))
        .await?;
    Ok(socket)
}

async fn run_sender(
    mut commands: mpsc::Receiver<Command>,
    ready: Arc<AtomicBool>,
    mut destination: Destination,
) {
    let mut socket: Option<UdpSocket> = None;
    // Set after a failed send so the next open waits out one RECONNECT_DELAY
    let mut hold_off = false;

    loop {
        if socket.is_none() && !std::mem::take(&mut hold_off) {
            match open_socket(&destination).await {
                Ok(opened) => {
                    info!("osc: socket ready for {destination}");
                    socket = Some(opened);
                    ready.store(true, Ordering::SeqCst);
                }
                Err(e) => {
                    warn!("osc: cannot open socket to {destination}: {e}");
                    ready.store(false, Ordering::SeqCst);
                }
            }
        }

        let command = if socket.is_some() {
            commands.recv().await
        } else {
            // Keep draining while unhealthy so reconfiguration still lands
            match tokio::time::timeout(RECONNECT_DELAY, commands.recv()).await {
                Ok(command) => command,
                Err(_) => continue,
            }
        };

        let Some(command) = command else {
            break;
        };

        match command {
            Command::Send(payload) => match socket.as_ref() {
                Some(active) => {
                    if let Err(e) = active.send(&payload).await {
                        warn!("osc: send to {destination} failed, recreating socket: {e}");
                        ready.store(false, Ordering::SeqCst);
                        socket = None;
                        hold_off = true;
                    }
                }
                None => debug!("osc: dropping {} bytes while reconnecting", payload.len()),
            },
            Command::Reconfigure(next) => {
                destination = next;
                ready.store(false, Ordering::SeqCst);
                socket = None;
            }
        }
    }

    ready.store(false, Ordering::SeqCst);
    debug!("osc: sender task stopped");
}

/// Channel that records payloads in memory.
///
/// Stands in for a real link in tests and previews.
pub struct MemoryTransport {
    name: String,
    ready: AtomicBool,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl MemoryTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ready: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Simulate the link going up or down
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Payloads accepted so far
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remove and return the payloads accepted so far
    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Outbound for MemoryTransport {
    fn send(&self, payload: &[u8]) -> Result<(), SyncError> {
        if !self.is_ready() {
            return Err(SyncError::TransportUnavailable(format!(
                "{} link down",
                self.name
            )));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(payload.to_vec());
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{encode_player_bpm, OscMessage};

    async fn wait_ready(transport: &UdpTransport) {
        for _ in 0..200 {
            if transport.is_ready() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("transport never became ready");
    }

    #[test]
    fn test_destination_display() {
        assert_eq!(Destination::default().to_string(), "127.0.0.1:8000");
        assert_eq!(Destination::new("::1", 9000).to_string(), "[::1]:9000");
    }

    #[test]
    fn test_memory_transport_drops_when_down() {
        let transport = MemoryTransport::new("actuator");
        transport.send(b"72").unwrap();
        transport.set_ready(false);
        assert!(matches!(
            transport.send(b"73"),
            Err(SyncError::TransportUnavailable(_))
        ));
        assert_eq!(transport.take(), vec![b"72".to_vec()]);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_udp_transport_delivers() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let transport = UdpTransport::spawn(Destination::new("127.0.0.1", port));
        wait_ready(&transport).await;
        transport.send(&encode_player_bpm(1, 72)).unwrap();

        let mut buf = [0u8; 64];
        let len = tokio::time::timeout(Duration::from_secs(2), receiver.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let message = OscMessage::decode(&buf[..len]).unwrap();
        assert_eq!(message.address, "/player/1/bpm");
        assert_eq!(message.args, vec![72]);
    }

    #[tokio::test]
    async fn test_udp_transport_recovers_after_failed_send() {
        // Reserve a port, then free it so nothing listens there
        let port = {
            let placeholder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            placeholder.local_addr().unwrap().port()
        };

        let transport = UdpTransport::spawn(Destination::new("127.0.0.1", port));
        wait_ready(&transport).await;

        // The ICMP port unreachable for one datagram fails a later send
        for _ in 0..200 {
            if !transport.is_ready() {
                break;
            }
            let _ = transport.send(&encode_player_bpm(1, 70));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!transport.is_ready());

        // The socket is recreated on its own once a listener shows up
        let receiver = UdpSocket::bind(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 64];
        let mut delivered = None;
        for _ in 0..10 {
            wait_ready(&transport).await;
            let _ = transport.send(&encode_player_bpm(1, 71));
            if let Ok(Ok(len)) =
                tokio::time::timeout(Duration::from_millis(300), receiver.recv(&mut buf)).await
            {
                let message = OscMessage::decode(&buf[..len]).unwrap();
                // A reading queued before the failure may still trail in
                if message.args == vec![71] {
                    delivered = Some(message);
                    break;
                }
            }
        }
        assert_eq!(delivered.unwrap().args, vec![71]);
    }

    #[tokio::test]
    async fn test_udp_transport_reconfigure() {
        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let transport =
            UdpTransport::spawn(Destination::new("127.0.0.1", first.local_addr().unwrap().port()));
        wait_ready(&transport).await;

        let second_port = second.local_addr().unwrap().port();
        transport.reconfigure("127.0.0.1", second_port).unwrap();
        assert_eq!(transport.destination().port, second_port);

        // Not ready until the socket has been recreated
        assert!(matches!(
            transport.send(b"/x"),
            Err(SyncError::TransportUnavailable(_))
        ));

        wait_ready(&transport).await;
        transport.send(&encode_player_bpm(2, 64)).unwrap();

        let mut buf = [0u8; 64];
        let len = tokio::time::timeout(Duration::from_secs(2), second.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(OscMessage::decode(&buf[..len]).unwrap().args, vec![64]);
    }
}
