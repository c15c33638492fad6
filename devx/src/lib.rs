#![allow(unsafe_op_in_unsafe_fn)]

//! Device-direct RDMA engine.
//!
//! Builds reliable-connected queue pairs by constructing raw hardware command
//! payloads (PRM format) and manipulating memory-mapped doorbell registers,
//! without going through the verbs object allocator. The device itself is
//! reached through the [`device::DevxDevice`] seam, which carries capability
//! queries, resource allocation, and the command transport.

#[macro_use]
mod barrier;

pub mod cq;
pub mod device;
pub mod error;
pub mod mmio;
pub mod mr;
pub mod prm;
pub mod qp;
pub mod resource;
pub mod sq;
pub mod test_utils;
pub mod types;
pub mod wqe;

pub use cq::{Completion, CompletionQueue, CqConfig, CqeOpcode};
pub use device::{DeviceCaps, DevxDevice, ObjId, PortInfo};
pub use error::{DevxError, Result};
pub use mr::MemoryRegion;
pub use qp::{QpConfig, QpState, QueuePair};
pub use resource::{Pd, Uar, Umem};
pub use types::{AhAttr, ConnectionParams, Gid, GrhAttr, LinkLayer, Mtu};
pub use wqe::{SendDescriptor, SendFlags, WqeOpcode};
