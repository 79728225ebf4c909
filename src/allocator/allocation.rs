//! A single TURN allocation and its relay loop
//!
//! An allocation binds one client 5-tuple to one exclusively-owned relay
//! socket plus the authorization state for that client's peers. A spawned
//! task reads the socket until teardown, forwarding authorized peer
//! datagrams to the registered handler; client-to-peer traffic is written
//! straight to the socket and never passes through the loop.
//!
//! See RFC 5766 Section 2.2

use crate::allocator::channel::ChannelBindings;
use crate::allocator::permission::Permissions;
use crate::allocator::PeerHandler;
use crate::config::AllocatorConfig;
use crate::error::Result;
use crate::types::{Expiration, FiveTuple, RelayAddress};
use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;

// Largest datagram the relay loop will accept
const MAX_DATAGRAM_SIZE: usize = 65535;

/// Lifecycle of an allocation's relay loop
///
/// `Running` while the loop serves traffic, `Draining` once teardown has
/// been requested, `Closed` after the loop has exited. `Closed` is
/// terminal; the allocation is removed from the table and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// The relay loop is serving inbound traffic
    Running,
    /// Teardown requested, waiting for the loop to exit
    Draining,
    /// The loop has exited; terminal
    Closed,
}

/// Represents a single TURN allocation
pub struct Allocation {
    tuple: FiveTuple,
    relay_addr: RelayAddress,
    socket: Arc<UdpSocket>,
    permissions: Permissions,
    channels: ChannelBindings,
    handler: Arc<dyn PeerHandler>,
    config: Arc<AllocatorConfig>,
    expiration: Mutex<Expiration>,
    state: Mutex<RelayState>,
    shutdown: Notify,
    relay_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("tuple", &self.tuple)
            .field("relay_addr", &self.relay_addr)
            .field("state", &*self.state.lock().unwrap())
            .finish_non_exhaustive()
    }
}

impl Allocation {
    pub(crate) fn new(
        tuple: FiveTuple,
        relay_addr: RelayAddress,
        socket: UdpSocket,
        handler: Arc<dyn PeerHandler>,
        config: Arc<AllocatorConfig>,
        lifetime: Duration,
    ) -> Self {
        let channels = ChannelBindings::new(&config);
        Self {
            tuple,
            relay_addr,
            socket: Arc::new(socket),
            permissions: Permissions::new(),
            channels,
            handler,
            config,
            expiration: Mutex::new(Expiration::new(lifetime)),
            state: Mutex::new(RelayState::Running),
            shutdown: Notify::new(),
            relay_task: Mutex::new(None),
        }
    }

    /// Spawns the relay loop task
    pub(crate) fn start(self: &Arc<Self>) {
        let allocation = Arc::clone(self);
        let task = tokio::spawn(allocation.relay_loop());
        *self.relay_task.lock().unwrap() = Some(task);
    }

    /// The client 5-tuple owning this allocation
    pub fn five_tuple(&self) -> FiveTuple {
        self.tuple
    }

    /// The relayed transport address peers send to
    pub fn relay_addr(&self) -> RelayAddress {
        self.relay_addr
    }

    /// The permission set of this allocation
    pub fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    /// The channel binding set of this allocation
    pub fn channels(&self) -> &ChannelBindings {
        &self.channels
    }

    /// Current relay loop state
    pub fn state(&self) -> RelayState {
        *self.state.lock().unwrap()
    }

    /// Checks if the allocation lifetime has elapsed
    pub fn is_expired(&self) -> bool {
        self.expiration.lock().unwrap().is_expired()
    }

    /// Time left until the allocation expires
    pub fn time_to_expiry(&self) -> Duration {
        self.expiration.lock().unwrap().remaining()
    }

    pub(crate) fn is_live(&self) -> bool {
        self.state() == RelayState::Running && !self.is_expired()
    }

    /// Re-arms the allocation deadline, counting from now
    pub(crate) fn refresh(&self, lifetime: Duration) {
        self.expiration.lock().unwrap().refresh(lifetime);
    }

    /// Authorizes a peer IP with the default permission lifetime
    ///
    /// Backs the CreatePermission request (RFC 5766 Section 9).
    pub fn create_permission(&self, peer_ip: IpAddr) {
        self.permissions
            .authorize(peer_ip, self.config.get_permission_lifetime());
    }

    /// Binds a channel number to a peer address
    ///
    /// A successful bind also authorizes the peer's IP, as required by
    /// RFC 5766 Section 11.
    pub fn bind_channel(&self, number: u16, peer: SocketAddr) -> Result<()> {
        self.channels.bind(number, peer)?;
        self.permissions
            .authorize(peer.ip(), self.config.get_channel_lifetime());
        Ok(())
    }

    /// Re-arms an existing channel binding
    pub fn refresh_channel(&self, number: u16) -> Result<()> {
        self.channels.refresh(number)
    }

    /// Sends client data out of the relay socket to a peer
    ///
    /// The caller resolves channel numbers to peer addresses first; this
    /// path does not pass through the relay loop.
    pub async fn send_to(&self, data: &[u8], peer: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(data, peer).await?)
    }

    /// Tears the allocation down
    ///
    /// Signals the relay loop, waits for it to exit (bounded by the read
    /// deadline), and leaves the allocation in the terminal `Closed`
    /// state. Only then may the table entry be removed.
    pub(crate) async fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == RelayState::Running {
                *state = RelayState::Draining;
            }
        }
        self.shutdown.notify_one();

        let task = self.relay_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        *self.state.lock().unwrap() = RelayState::Closed;
    }

    fn is_authorized(&self, peer: &SocketAddr) -> bool {
        self.permissions.is_authorized(peer.ip()) || self.channels.number_for_peer(peer).is_some()
    }

    /// Reads the relay socket until teardown or a terminal error
    async fn relay_loop(self: Arc<Self>) {
        log::debug!("relay loop started for {}", self.tuple);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                received = timeout(self.config.get_read_timeout(), self.socket.recv_from(&mut buf)) => {
                    match received {
                        // Deadline expiry alone is a liveness probe, not a failure.
                        Err(_) => continue,
                        Ok(Ok((len, peer))) => {
                            if !self.is_authorized(&peer) {
                                // Silent drop: unauthorized senders learn nothing.
                                log::trace!(
                                    "dropped datagram from unauthorized peer {} on {}",
                                    peer,
                                    self.tuple
                                );
                                continue;
                            }
                            let payload = Bytes::copy_from_slice(&buf[..len]);
                            self.handler.handle_peer_data(payload, &self.tuple, peer);
                        }
                        Ok(Err(e)) => {
                            log::error!("relay read failed for {}: {}", self.tuple, e);
                            break;
                        }
                    }
                }
            }
        }

        *self.state.lock().unwrap() = RelayState::Closed;
        log::debug!("relay loop closed for {}", self.tuple);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
        last: Mutex<Option<(Vec<u8>, FiveTuple, SocketAddr)>>,
    }

    impl PeerHandler for CountingHandler {
        fn handle_peer_data(&self, data: Bytes, tuple: &FiveTuple, peer: SocketAddr) {
            *self.last.lock().unwrap() = Some((data.to_vec(), *tuple, peer));
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tuple() -> FiveTuple {
        FiveTuple {
            client: "10.0.0.1:40000".parse().unwrap(),
            server: "192.0.2.1:3478".parse().unwrap(),
            protocol: Protocol::Udp,
        }
    }

    async fn spawn_allocation(
        config: Arc<AllocatorConfig>,
        handler: Arc<CountingHandler>,
    ) -> Arc<Allocation> {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = RelayAddress::new(socket.local_addr().unwrap());
        let allocation = Arc::new(Allocation::new(
            tuple(),
            relay_addr,
            socket,
            handler,
            config,
            Duration::from_secs(600),
        ));
        allocation.start();
        allocation
    }

    async fn wait_until(mut probe: impl FnMut() -> bool) {
        for _ in 0..50 {
            if probe() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_unauthorized_datagram_is_dropped() {
        let handler = Arc::new(CountingHandler::default());
        let allocation =
            spawn_allocation(Arc::new(AllocatorConfig::default()), Arc::clone(&handler)).await;

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"nope", allocation.relay_addr().0).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

        allocation.close().await;
    }

    #[tokio::test]
    async fn test_authorized_datagram_reaches_handler() {
        let handler = Arc::new(CountingHandler::default());
        let allocation =
            spawn_allocation(Arc::new(AllocatorConfig::default()), Arc::clone(&handler)).await;

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        allocation.create_permission(peer_addr.ip());

        peer.send_to(b"hello", allocation.relay_addr().0).await.unwrap();
        wait_until(|| handler.calls.load(Ordering::SeqCst) == 1).await;

        let (data, seen_tuple, seen_peer) = handler.last.lock().unwrap().clone().unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(seen_tuple, tuple());
        assert_eq!(seen_peer, peer_addr);

        allocation.close().await;
    }

    #[tokio::test]
    async fn test_expired_permission_stops_relaying() {
        let mut config = AllocatorConfig::default();
        config.timeouts.permission_lifetime = Duration::from_millis(200);
        let handler = Arc::new(CountingHandler::default());
        let allocation = spawn_allocation(Arc::new(config), Arc::clone(&handler)).await;

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        allocation.create_permission(peer.local_addr().unwrap().ip());

        peer.send_to(b"first", allocation.relay_addr().0).await.unwrap();
        wait_until(|| handler.calls.load(Ordering::SeqCst) == 1).await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        peer.send_to(b"second", allocation.relay_addr().0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        allocation.close().await;
    }

    #[tokio::test]
    async fn test_channel_binding_authorizes_peer() {
        let handler = Arc::new(CountingHandler::default());
        let allocation =
            spawn_allocation(Arc::new(AllocatorConfig::default()), Arc::clone(&handler)).await;

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        allocation.bind_channel(0x4001, peer_addr).unwrap();

        peer.send_to(b"via channel", allocation.relay_addr().0).await.unwrap();
        wait_until(|| handler.calls.load(Ordering::SeqCst) == 1).await;

        assert_eq!(allocation.channels().resolve(0x4001), Some(peer_addr));
        assert_eq!(allocation.channels().number_for_peer(&peer_addr), Some(0x4001));

        allocation.close().await;
    }

    #[tokio::test]
    async fn test_outbound_send_reaches_peer() {
        let handler = Arc::new(CountingHandler::default());
        let allocation =
            spawn_allocation(Arc::new(AllocatorConfig::default()), Arc::clone(&handler)).await;

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let sent = allocation.send_to(b"to peer", peer_addr).await.unwrap();
        assert_eq!(sent, 7);

        let mut buf = [0u8; 64];
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"to peer");
        assert_eq!(from, allocation.relay_addr().0);

        allocation.close().await;
    }

    #[tokio::test]
    async fn test_close_reaches_terminal_state() {
        let handler = Arc::new(CountingHandler::default());
        let allocation =
            spawn_allocation(Arc::new(AllocatorConfig::default()), Arc::clone(&handler)).await;

        assert_eq!(allocation.state(), RelayState::Running);
        allocation.close().await;
        assert_eq!(allocation.state(), RelayState::Closed);

        // Idempotent on an already-closed allocation.
        allocation.close().await;
        assert_eq!(allocation.state(), RelayState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_binding_expiry_leaves_permission_intact() {
        let mut config = AllocatorConfig::default();
        config.timeouts.channel_lifetime = Duration::from_secs(60);
        let handler = Arc::new(CountingHandler::default());

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = RelayAddress::new(socket.local_addr().unwrap());
        let allocation = Allocation::new(
            tuple(),
            relay_addr,
            socket,
            handler,
            Arc::new(config),
            Duration::from_secs(600),
        );

        let peer: SocketAddr = "5.6.7.8:1000".parse().unwrap();
        allocation.bind_channel(0x4001, peer).unwrap();
        allocation.create_permission(peer.ip());

        tokio::time::advance(Duration::from_secs(60)).await;
        allocation.channels().remove_expired();

        assert_eq!(allocation.channels().resolve(0x4001), None);
        assert!(allocation.permissions().is_authorized(peer.ip()));
    }
}
