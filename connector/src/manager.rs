//! The connection manager: server accept loop, client connect, and the
//! one-shot establishment helper that drives a queue pair to RTS.

use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rapidhash::RapidHasher;

use devx::types::{ConnectionParams, LinkLayer, ROCE_V2_UDP_DPORT};
use devx::{CqConfig, DevxDevice, Pd, QpConfig};

use crate::config::ConnectorConfig;
use crate::endpoint::{
    recv_exact, send_exact, ConnectionId, Endpoint, EndpointResources, EndpointState,
    RemoteMemory,
};
use crate::error::{net_err, ConnectorError, Result};
use crate::wire;

/// Invoked after an accept or a successful client connect, before any
/// handshake, on the acceptor thread.
pub type ConnectionCallback = Box<dyn Fn(ConnectionId, IpAddr, u16) + Send + Sync>;
/// Invoked after a connection is closed, including during `stop`.
pub type DisconnectionCallback = Box<dyn Fn(ConnectionId) + Send + Sync>;

type EndpointMap = HashMap<ConnectionId, Endpoint, BuildHasherDefault<RapidHasher>>;

/// Size of the memory region each established connection advertises.
const ENDPOINT_MR_LEN: usize = 4096;

/// TCP keepalive: idle seconds before probing.
const KEEPALIVE_IDLE_SECS: libc::c_int = 60;
/// TCP keepalive: seconds between probes.
const KEEPALIVE_INTERVAL_SECS: libc::c_int = 5;
/// TCP keepalive: probes before the connection is declared dead.
const KEEPALIVE_COUNT: libc::c_int = 3;

struct Shared {
    config: ConnectorConfig,
    running: AtomicBool,
    next_id: AtomicU64,
    connections: Mutex<EndpointMap>,
    slot_available: Condvar,
    on_connection: Mutex<Option<ConnectionCallback>>,
    on_disconnection: Mutex<Option<DisconnectionCallback>>,
}

/// Accepts peers, tracks endpoints by connection id, and orchestrates the
/// parameter handshake.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    acceptor: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(config: ConnectorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                running: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                connections: Mutex::new(HashMap::with_hasher(BuildHasherDefault::default())),
                slot_available: Condvar::new(),
                on_connection: Mutex::new(None),
                on_disconnection: Mutex::new(None),
            }),
            acceptor: None,
        }
    }

    /// Register the connection callback. Long work must be off-loaded: the
    /// callback runs on the acceptor thread.
    pub fn on_connection<F>(&self, callback: F)
    where
        F: Fn(ConnectionId, IpAddr, u16) + Send + Sync + 'static,
    {
        *self.shared.on_connection.lock().unwrap() = Some(Box::new(callback));
    }

    pub fn on_disconnection<F>(&self, callback: F)
    where
        F: Fn(ConnectionId) + Send + Sync + 'static,
    {
        *self.shared.on_disconnection.lock().unwrap() = Some(Box::new(callback));
    }

    /// Bind the listen socket and start the background acceptor.
    pub fn start(&mut self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(ConnectorError::AlreadyRunning);
        }

        let config = &self.shared.config;
        let listener = TcpListener::bind((config.address.as_str(), config.port)).map_err(|e| {
            self.shared.running.store(false, Ordering::SeqCst);
            net_err(e, "bind")
        })?;
        // std already applied SO_REUSEADDR; re-listen to apply the
        // configured backlog depth.
        unsafe {
            libc::listen(listener.as_raw_fd(), config.listen_backlog);
        }
        listener
            .set_nonblocking(true)
            .map_err(|e| net_err(e, "listen"))?;

        log::info!(
            "connection manager listening on {}:{}",
            config.address,
            config.port
        );

        let shared = self.shared.clone();
        self.acceptor = Some(std::thread::spawn(move || acceptor_loop(shared, listener)));
        Ok(())
    }

    /// Stop the acceptor and close every endpoint, emitting a
    /// disconnection callback for each. Safe to call from any thread.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.slot_available.notify_all();
        if let Some(handle) = self.acceptor.take() {
            let _ = handle.join();
        }

        let mut drained: Vec<Endpoint> = {
            let mut guard = self.shared.connections.lock().unwrap();
            guard.drain().map(|(_, ep)| ep).collect()
        };
        for ep in &mut drained {
            ep.shutdown();
        }
        let ids: Vec<ConnectionId> = drained.iter().map(|ep| ep.id()).collect();
        drop(drained);
        for id in ids {
            fire_disconnection(&self.shared, id);
        }
        log::info!("connection manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().unwrap().len()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let guard = self.shared.connections.lock().unwrap();
        let mut ids: Vec<ConnectionId> = guard.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Open a client connection. Uses a poll-based non-blocking connect
    /// bounded by `timeout_ms`, then reverts the socket to blocking mode
    /// unless configured otherwise.
    pub fn connect(&self, address: &str, port: u16) -> Result<ConnectionId> {
        {
            let guard = self.shared.connections.lock().unwrap();
            if guard.len() >= self.shared.config.max_connections {
                return Err(ConnectorError::AtCapacity(
                    self.shared.config.max_connections,
                ));
            }
        }

        let addr: SocketAddr = (address, port)
            .to_socket_addrs()
            .map_err(|e| net_err(e, "resolve"))?
            .next()
            .ok_or_else(|| ConnectorError::Network {
                code: 0,
                message: format!("{} did not resolve", address),
            })?;

        let timeout = Duration::from_millis(self.shared.config.timeout_ms);
        let stream =
            TcpStream::connect_timeout(&addr, timeout).map_err(|e| net_err(e, "connect"))?;

        let id = register_endpoint(&self.shared, stream, addr)?;
        log::info!("connected to {} (connection {})", addr, id);
        Ok(id)
    }

    /// Close one connection; returns whether it existed.
    pub fn close_connection(&self, id: ConnectionId) -> bool {
        let ep = self.shared.connections.lock().unwrap().remove(&id);
        match ep {
            Some(mut ep) => {
                ep.shutdown();
                self.shared.slot_available.notify_one();
                fire_disconnection(&self.shared, id);
                log::info!("connection {} closed", id);
                true
            }
            None => false,
        }
    }

    /// Raw side-channel write on a connection.
    pub fn send_data(&self, id: ConnectionId, data: &[u8]) -> Result<()> {
        let stream = self.clone_stream(id)?;
        send_exact(&stream, data)
    }

    /// Raw side-channel read on a connection.
    pub fn recv_data(&self, id: ConnectionId, buf: &mut [u8]) -> Result<()> {
        let stream = self.clone_stream(id)?;
        recv_exact(&stream, buf)
    }

    /// Run `f` against an endpoint under the registry lock. This is also
    /// the mutual exclusion for posting on the endpoint's queue pair; do
    /// not invoke user callbacks or block inside `f`.
    pub fn with_endpoint<R>(
        &self,
        id: ConnectionId,
        f: impl FnOnce(&mut Endpoint) -> R,
    ) -> Result<R> {
        let mut guard = self.shared.connections.lock().unwrap();
        let ep = guard
            .get_mut(&id)
            .ok_or(ConnectorError::ConnectionNotFound(id))?;
        Ok(f(ep))
    }

    /// One-shot establishment: build the resource bundle, exchange the
    /// parameter record and the memory trailer, and drive the queue pair
    /// RESET → INIT → RTR → RTS. On failure the endpoint moves to Error
    /// and the disconnection callback fires.
    pub fn establish(
        &self,
        id: ConnectionId,
        dev: &Arc<dyn DevxDevice>,
        pd: &Pd,
    ) -> Result<()> {
        let result = self.establish_inner(id, dev, pd);
        if let Err(e) = &result {
            log::error!("establish failed on connection {}: {}", id, e);
            let found = {
                let mut guard = self.shared.connections.lock().unwrap();
                match guard.get_mut(&id) {
                    Some(ep) => {
                        ep.set_state(EndpointState::Error);
                        true
                    }
                    None => false,
                }
            };
            if found {
                fire_disconnection(&self.shared, id);
            }
        }
        result
    }

    fn establish_inner(
        &self,
        id: ConnectionId,
        dev: &Arc<dyn DevxDevice>,
        pd: &Pd,
    ) -> Result<()> {
        let stream = {
            let mut guard = self.shared.connections.lock().unwrap();
            let ep = guard
                .get_mut(&id)
                .ok_or(ConnectorError::ConnectionNotFound(id))?;
            ep.set_state(EndpointState::Initializing);
            ep.try_clone_stream()?
        };

        let port = dev.port_info(1)?;
        let mut local = ConnectionParams {
            mtu: port.active_mtu,
            ..Default::default()
        };
        local.ah.port_num = local.port_num;
        local.ah.sl = local.sl;
        if port.link_layer == LinkLayer::Ethernet {
            local.ah.dlid = ROCE_V2_UDP_DPORT;
            local.ah.is_global = true;
            local.ah.grh.dgid = port.gid;
        } else {
            local.ah.dlid = port.lid;
        }

        let mut resources = EndpointResources::create(
            dev,
            pd,
            &QpConfig::default(),
            &CqConfig::default(),
            ENDPOINT_MR_LEN,
        )?;
        local.remote_qpn = resources.qp.qpn();

        send_exact(&stream, &wire::encode_params(&local))?;
        let mut record = [0u8; wire::RECORD_LEN];
        recv_exact(&stream, &mut record)?;
        let remote = wire::decode_params(&record)?;

        resources.qp.reset_to_init(&remote)?;
        resources.qp.init_to_rtr(&remote)?;
        resources.qp.rtr_to_rts(&remote)?;

        send_exact(
            &stream,
            &wire::encode_memory(resources.mr.addr() as u64, resources.mr.rkey()),
        )?;
        let mut trailer = [0u8; wire::MEMORY_LEN];
        recv_exact(&stream, &mut trailer)?;
        let (raddr, rkey) = wire::decode_memory(&trailer)?;
        resources.remote = Some(RemoteMemory { raddr, rkey });
        resources.remote_params = Some(remote);

        {
            let mut guard = self.shared.connections.lock().unwrap();
            let ep = guard
                .get_mut(&id)
                .ok_or(ConnectorError::ConnectionNotFound(id))?;
            ep.install_resources(resources);
            ep.set_state(EndpointState::Connected);
        }
        log::info!(
            "connection {} established: remote qpn {:#x}, raddr {:#x}",
            id,
            remote.remote_qpn,
            raddr
        );
        Ok(())
    }

    fn clone_stream(&self, id: ConnectionId) -> Result<TcpStream> {
        let guard = self.shared.connections.lock().unwrap();
        guard
            .get(&id)
            .ok_or(ConnectorError::ConnectionNotFound(id))?
            .try_clone_stream()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn acceptor_loop(shared: Arc<Shared>, listener: TcpListener) {
    let fd = listener.as_raw_fd();
    while shared.running.load(Ordering::SeqCst) {
        // 1-second poll so shutdown stays responsive.
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, 1000) };
        if ret < 0 {
            let e = std::io::Error::last_os_error();
            if e.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            log::error!("poll on listen socket failed: {}", e);
            break;
        }
        if ret == 0 {
            continue;
        }

        // Capacity gate: give a closing connection up to a second to free
        // a slot, otherwise shed the pending socket.
        {
            let guard = shared.connections.lock().unwrap();
            if guard.len() >= shared.config.max_connections {
                let (guard, _) = shared
                    .slot_available
                    .wait_timeout_while(guard, Duration::from_secs(1), |m| {
                        shared.running.load(Ordering::SeqCst)
                            && m.len() >= shared.config.max_connections
                    })
                    .unwrap();
                if !shared.running.load(Ordering::SeqCst) {
                    break;
                }
                if guard.len() >= shared.config.max_connections {
                    drop(guard);
                    if let Ok((stream, peer)) = listener.accept() {
                        log::warn!(
                            "connection limit reached ({}), dropping {}",
                            shared.config.max_connections,
                            peer
                        );
                        drop(stream);
                    }
                    continue;
                }
            }
        }

        match listener.accept() {
            Ok((stream, peer)) => match register_endpoint(&shared, stream, peer) {
                Ok(id) => log::info!("accepted {} (connection {})", peer, id),
                Err(e) => log::error!("failed to register {}: {}", peer, e),
            },
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
            Err(e) => {
                log::error!("accept failed: {}", e);
                break;
            }
        }
    }
    log::debug!("acceptor thread exiting");
}

/// Configure, id, and track a new socket, then fire the connection
/// callback outside the registry lock.
fn register_endpoint(
    shared: &Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<ConnectionId> {
    configure_socket(shared, &stream)?;
    let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
    let ep = Endpoint::new(id, stream, peer);
    shared.connections.lock().unwrap().insert(id, ep);

    if let Some(cb) = shared.on_connection.lock().unwrap().as_ref() {
        cb(id, peer.ip(), peer.port());
    }
    Ok(id)
}

fn configure_socket(shared: &Arc<Shared>, stream: &TcpStream) -> Result<()> {
    let config = &shared.config;
    stream
        .set_nonblocking(config.nonblocking)
        .map_err(|e| net_err(e, "set_nonblocking"))?;
    if !config.nonblocking {
        let timeout = Some(Duration::from_millis(config.timeout_ms));
        stream
            .set_read_timeout(timeout)
            .map_err(|e| net_err(e, "set_read_timeout"))?;
        stream
            .set_write_timeout(timeout)
            .map_err(|e| net_err(e, "set_write_timeout"))?;
    }
    set_keepalive(stream);
    Ok(())
}

/// Enable TCP keepalive so dead peers are reaped without traffic.
fn set_keepalive(stream: &TcpStream) {
    let fd = stream.as_raw_fd();
    let set = |level: libc::c_int, opt: libc::c_int, value: libc::c_int| unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if set(libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1) != 0 {
        log::warn!(
            "failed to enable keepalive: {}",
            std::io::Error::last_os_error()
        );
        return;
    }
    #[cfg(target_os = "linux")]
    {
        set(libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, KEEPALIVE_IDLE_SECS);
        set(
            libc::IPPROTO_TCP,
            libc::TCP_KEEPINTVL,
            KEEPALIVE_INTERVAL_SECS,
        );
        set(libc::IPPROTO_TCP, libc::TCP_KEEPCNT, KEEPALIVE_COUNT);
    }
}

fn fire_disconnection(shared: &Arc<Shared>, id: ConnectionId) {
    if let Some(cb) = shared.on_disconnection.lock().unwrap().as_ref() {
        cb(id);
    }
}
