//! Per-connection endpoint: the accepted socket, its lifecycle state, and
//! the queue-pair resource bundle once establishment completes.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use devx::cq::CqeOpcode;
use devx::types::ConnectionParams;
use devx::{
    Completion, CompletionQueue, CqConfig, DevxDevice, DevxError, MemoryRegion, Pd, QpConfig,
    QueuePair,
};

use crate::error::{net_err, ConnectorError, Result};

/// Monotonically increasing connection identifier.
pub type ConnectionId = u64;

/// Handshake I/O deadline.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Retries on EAGAIN-class errors before giving up.
const HANDSHAKE_RETRIES: u32 = 3;
/// Pause between retries.
const HANDSHAKE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Endpoint lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Disconnected,
    Initializing,
    Connected,
    Closed,
    Error,
}

/// The peer's advertised memory region.
#[derive(Debug, Clone, Copy)]
pub struct RemoteMemory {
    pub raddr: u64,
    pub rkey: u32,
}

/// Everything one connection owns on the device: queue pair, completion
/// queue, memory region, and protection-domain reference. Lifetimes nest
/// strictly inside the endpoint's.
pub struct EndpointResources {
    pub pd: Pd,
    pub cq: CompletionQueue,
    pub qp: QueuePair,
    pub mr: MemoryRegion,
    /// Set once the peer's `(raddr, rkey)` trailer arrives.
    pub remote: Option<RemoteMemory>,
    /// The peer's parameter record, as received.
    pub remote_params: Option<ConnectionParams>,
}

impl EndpointResources {
    pub fn create(
        dev: &Arc<dyn DevxDevice>,
        pd: &Pd,
        qp_config: &QpConfig,
        cq_config: &CqConfig,
        mr_len: usize,
    ) -> Result<Self> {
        let cq = CompletionQueue::create(dev, cq_config)?;
        let qp = QueuePair::create(dev, pd, &cq, qp_config)?;
        let mr = MemoryRegion::create(dev, pd, mr_len)?;
        Ok(Self {
            pd: pd.clone(),
            cq,
            qp,
            mr,
            remote: None,
            remote_params: None,
        })
    }

    /// Poll the completion queue once and release the send-queue blocks of
    /// whatever completed, success or error.
    pub fn poll_send(&mut self) -> devx::Result<Option<Completion>> {
        match self.cq.poll_once() {
            Ok(Some(c)) => {
                if c.opcode == CqeOpcode::Req {
                    self.qp.complete_send(c.wqe_counter);
                }
                Ok(Some(c))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                if let DevxError::HardwareCompletion { wqe_counter, .. } = e {
                    self.qp.complete_send(wqe_counter);
                }
                Err(e)
            }
        }
    }
}

/// One tracked connection.
pub struct Endpoint {
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    state: EndpointState,
    resources: Option<EndpointResources>,
}

impl Endpoint {
    pub(crate) fn new(id: ConnectionId, stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            id,
            stream,
            peer,
            state: EndpointState::Disconnected,
            resources: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: EndpointState) {
        self.state = state;
    }

    pub fn resources(&self) -> Option<&EndpointResources> {
        self.resources.as_ref()
    }

    pub fn resources_mut(&mut self) -> Option<&mut EndpointResources> {
        self.resources.as_mut()
    }

    pub(crate) fn install_resources(&mut self, resources: EndpointResources) {
        self.resources = Some(resources);
    }

    pub(crate) fn try_clone_stream(&self) -> Result<TcpStream> {
        self.stream.try_clone().map_err(|e| net_err(e, "clone"))
    }

    pub(crate) fn shutdown(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        self.state = EndpointState::Closed;
    }
}

/// Write all of `buf` within the handshake deadline, retrying EAGAIN-class
/// errors a bounded number of times. Hard errors abort immediately.
pub(crate) fn send_exact(stream: &TcpStream, buf: &[u8]) -> Result<()> {
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    let mut retries = 0;
    let mut off = 0;
    while off < buf.len() {
        match (&mut (&*stream)).write(&buf[off..]) {
            Ok(0) => {
                return Err(ConnectorError::Network {
                    code: libc::ECONNRESET,
                    message: "peer closed during handshake send".to_string(),
                })
            }
            Ok(n) => off += n,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::Interrupted
                ) =>
            {
                retries += 1;
                if retries > HANDSHAKE_RETRIES || Instant::now() >= deadline {
                    return Err(ConnectorError::Network {
                        code: libc::ETIMEDOUT,
                        message: "handshake send timed out".to_string(),
                    });
                }
                std::thread::sleep(HANDSHAKE_RETRY_DELAY);
            }
            Err(e) => return Err(net_err(e, "handshake send")),
        }
    }
    Ok(())
}

/// Read exactly `buf.len()` bytes within the handshake deadline.
pub(crate) fn recv_exact(stream: &TcpStream, buf: &mut [u8]) -> Result<()> {
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    let mut retries = 0;
    let mut off = 0;
    while off < buf.len() {
        match (&mut (&*stream)).read(&mut buf[off..]) {
            Ok(0) => {
                return Err(ConnectorError::ProtocolMismatch(
                    "peer closed mid-record".to_string(),
                ))
            }
            Ok(n) => off += n,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::Interrupted
                ) =>
            {
                retries += 1;
                if retries > HANDSHAKE_RETRIES || Instant::now() >= deadline {
                    return Err(ConnectorError::Network {
                        code: libc::ETIMEDOUT,
                        message: "handshake recv timed out".to_string(),
                    });
                }
                std::thread::sleep(HANDSHAKE_RETRY_DELAY);
            }
            Err(e) => return Err(net_err(e, "handshake recv")),
        }
    }
    Ok(())
}
