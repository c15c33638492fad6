//! Error taxonomy for the engine.

use thiserror::Error;

use crate::qp::QpState;

pub type Result<T> = std::result::Result<T, DevxError>;

/// Errors surfaced by the data plane and the command plane.
#[derive(Debug, Error)]
pub enum DevxError {
    /// Caller contract violated. No I/O was performed.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Operation not admissible in the current queue-pair state.
    #[error("{op}: queue pair is {actual:?}, requires {required:?}")]
    InvalidState {
        op: &'static str,
        required: QpState,
        actual: QpState,
    },

    /// Transient: the send queue has no room for the descriptor.
    #[error("send queue full")]
    Backpressure,

    /// A vendor command returned a non-zero syndrome. The queue-pair state
    /// was not advanced.
    #[error("{cmd} failed: status {status:#x}, syndrome {syndrome:#x}")]
    Device {
        cmd: &'static str,
        status: u32,
        syndrome: u32,
    },

    /// Umem, UAR, or memory-key allocation failed.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(&'static str),

    /// A completion entry reported a non-zero syndrome. The CQE slot is
    /// consumed; correlate with the posted work request by `wqe_counter`.
    #[error(
        "completion error: syndrome {syndrome:#x}, vendor syndrome {vendor_syndrome:#x}, \
         wqe counter {wqe_counter}"
    )]
    HardwareCompletion {
        syndrome: u8,
        vendor_syndrome: u8,
        wqe_counter: u16,
    },
}
