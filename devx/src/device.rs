//! The device seam.
//!
//! Everything the engine needs from the hardware flows through
//! [`DevxDevice`]: capability and port queries, resource allocation (PD,
//! UAR, umem), and the raw command transport used for object creation and
//! modification. The engine itself never touches a verbs object.

use crate::error::Result;
use crate::types::{Gid, LinkLayer, Mtu};

/// Opaque handle to a device-side object (QP, CQ, MKEY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjId(pub u64);

/// Device-wide limits, read once at open.
#[derive(Debug, Clone, Copy)]
pub struct DeviceCaps {
    /// log2 of the largest message the device accepts.
    pub log_max_msg: u8,
    /// log2 of the deepest work queue.
    pub log_max_qp_sz: u8,
    /// log2 of the deepest completion queue.
    pub log_max_cq_sz: u8,
    /// Maximum outstanding work requests per queue.
    pub max_qp_wr: u32,
    /// Maximum scatter/gather entries per work request.
    pub max_sge: u32,
    /// log2 of the maximum outstanding RDMA-read/atomic as responder.
    pub log_rra_max: u8,
    /// log2 of the host page size used for queue buffers.
    pub log_page_size: u8,
    /// Number of physical ports.
    pub num_ports: u8,
}

/// Per-port attributes.
#[derive(Debug, Clone, Copy)]
pub struct PortInfo {
    pub link_layer: LinkLayer,
    pub active_mtu: Mtu,
    /// Base LID; zero on Ethernet ports.
    pub lid: u16,
    /// First GID table entry.
    pub gid: Gid,
}

/// Raw parts of an allocated UAR page.
///
/// `reg_addr` points at the doorbell/BlueFlame slot used for queue-pair
/// doorbells; the CQ arm register lives at a fixed offset from `base_addr`.
#[derive(Debug, Clone, Copy)]
pub struct UarInfo {
    pub page_id: u32,
    pub base_addr: *mut u8,
    pub reg_addr: *mut u8,
}

/// Raw parts of a registered user-memory region. The device allocates and
/// owns the backing buffer; it stays mapped until `unregister_umem`.
#[derive(Debug, Clone, Copy)]
pub struct UmemInfo {
    pub umem_id: u32,
    pub addr: *mut u8,
    pub len: usize,
}

/// Command transport and resource registry of one RDMA device.
///
/// The trait is object-safe; the engine holds it as `Arc<dyn DevxDevice>`
/// and the device outlives every queue and endpoint built on it.
pub trait DevxDevice: Send + Sync {
    /// Device-wide limits.
    fn caps(&self) -> DeviceCaps;

    /// Attributes of a physical port (ports are numbered from 1).
    fn port_info(&self, port: u8) -> Result<PortInfo>;

    /// Allocate a protection domain; returns its number.
    fn alloc_pd(&self) -> Result<u32>;
    fn dealloc_pd(&self, pdn: u32);

    /// Allocate a doorbell/BlueFlame register page.
    fn alloc_uar(&self) -> Result<UarInfo>;
    fn free_uar(&self, page_id: u32);

    /// Register `len` bytes of device-accessible memory. The buffer is
    /// allocated internally, page-aligned and zeroed.
    fn register_umem(&self, len: usize) -> Result<UmemInfo>;
    fn unregister_umem(&self, umem_id: u32);

    /// Event queue number for a completion vector.
    fn query_eqn(&self, vector: u32) -> Result<u32>;

    /// Issue an object-creation command. On failure the output buffer holds
    /// the status and syndrome.
    fn obj_create(&self, cmd_in: &[u8], cmd_out: &mut [u8]) -> std::result::Result<ObjId, i32>;

    /// Issue a modify command against an existing object. Returns 0 on
    /// success; on failure the output buffer holds the syndrome.
    fn obj_modify(&self, obj: ObjId, cmd_in: &[u8], cmd_out: &mut [u8]) -> i32;

    /// Issue a query command against an existing object.
    fn obj_query(&self, obj: ObjId, cmd_in: &[u8], cmd_out: &mut [u8]) -> i32;

    /// Destroy an object. Infallible from the caller's point of view.
    fn obj_destroy(&self, obj: ObjId);
}
